//! The result of persisting bytes through a storage backend.

use serde::{Deserialize, Serialize};

/// Bytes persisted under a storage key, identified by the key and verified by
/// the SHA-256 digest of exactly those bytes.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredObject {
    /// Backend-relative key, e.g. `user/<id>/uploads/<millis>-<name>`.
    pub storage_key: String,

    /// Number of bytes written.
    pub size_bytes: u64,

    /// Lowercase hex SHA-256 of the persisted bytes.
    pub checksum: String,
}
