//! File metadata rows and their versions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A logical file as seen by users. The bytes live in the storage backend,
/// referenced through the current [`FileVersion`].
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub id: Uuid,

    /// User who uploaded the file.
    pub owner_id: String,

    /// Opaque folder reference managed by the folder service.
    pub folder_id: Option<String>,

    /// Original (unsanitized) file name, used for download disposition.
    pub name: String,

    pub mime_type: Option<String>,

    pub size_bytes: Option<i64>,

    /// Version served on read. Always set once the file has been created.
    pub current_version_id: Option<Uuid>,

    pub is_deleted: bool,

    pub created_at: DateTime<Utc>,

    pub updated_at: DateTime<Utc>,
}

/// One immutable revision of a file's bytes.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
#[serde(rename_all = "camelCase")]
pub struct FileVersion {
    pub id: Uuid,
    pub file_id: Uuid,
    pub storage_key: String,
    /// Starts at 1, increases by one per new version of the same file.
    pub version_number: i64,
    pub checksum: String,
    pub size_bytes: i64,
    pub created_at: DateTime<Utc>,
}
