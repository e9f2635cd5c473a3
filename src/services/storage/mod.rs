//! Storage backends and the service that fronts them.
//!
//! Two interchangeable backends sit behind [`StorageBackend`]: the local
//! filesystem and an object store (S3 in production, in-memory in tests).
//! The variant is chosen once at startup from configuration. Every write
//! returns a [`StoredObject`] whose checksum was computed from the bytes as
//! they were written.

pub mod local;
pub mod object;

use crate::{
    models::stored_object::StoredObject,
    services::{
        checksum,
        chunk_assembler::{self, Chunk},
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, stream::BoxStream};
use std::io;
use thiserror::Error;
use tracing::{debug, warn};

pub use local::LocalBackend;
pub use object::ObjectStoreBackend;

/// A readable stream of object bytes.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

const MAX_OBJECT_KEY_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid object key")]
    InvalidObjectKey,
    #[error("object `{0}` not found")]
    ObjectNotFound(String),
    #[error("checksum mismatch for `{key}`: expected {expected}, computed {actual}")]
    ChecksumMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("write of `{key}` failed after {attempts} attempt(s): {reason}")]
    BackendWriteFailed {
        key: String,
        attempts: u32,
        reason: String,
    },
    #[error("read of `{key}` failed: {reason}")]
    BackendReadFailed { key: String, reason: String },
    #[error("upload source failed before completion: {0}")]
    SourceInterrupted(#[source] io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// An opened object: its size when the backend knows it, and its bytes.
pub struct ObjectReader {
    pub size_bytes: Option<u64>,
    pub stream: ByteStream,
}

/// Closed set of backends, selected once at startup.
#[derive(Clone)]
pub enum StorageBackend {
    Local(LocalBackend),
    ObjectStore(ObjectStoreBackend),
}

impl StorageBackend {
    pub fn driver(&self) -> &'static str {
        match self {
            Self::Local(_) => "local",
            Self::ObjectStore(_) => "object-store",
        }
    }

    /// Write a fully materialized buffer under `key`.
    ///
    /// A declared `expected_checksum` is checked before the object becomes
    /// visible: the object store compares before sending anything, the local
    /// backend before renaming its temp file into place.
    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        expected_checksum: Option<&str>,
    ) -> StorageResult<StoredObject> {
        ensure_key_safe(key)?;
        match self {
            Self::Local(backend) => backend.put(key, data, expected_checksum).await,
            Self::ObjectStore(backend) => {
                backend
                    .put(key, data, content_type, expected_checksum)
                    .await
            }
        }
    }

    /// Write a byte stream under `key` without holding it all in memory.
    /// On a checksum mismatch the write is abandoned before it replaces
    /// whatever `key` held.
    pub async fn put_stream<S>(
        &self,
        key: &str,
        stream: S,
        content_type: Option<&str>,
        expected_checksum: Option<&str>,
    ) -> StorageResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        ensure_key_safe(key)?;
        match self {
            Self::Local(backend) => backend.put_stream(key, stream, expected_checksum).await,
            Self::ObjectStore(backend) => {
                backend
                    .put_stream(key, stream, content_type, expected_checksum)
                    .await
            }
        }
    }

    /// Open a stream over the bytes stored under `key`.
    pub async fn get(&self, key: &str) -> StorageResult<ObjectReader> {
        ensure_key_safe(key)?;
        match self {
            Self::Local(backend) => backend.get(key).await,
            Self::ObjectStore(backend) => backend.get(key).await,
        }
    }

    /// Remove `key`. Missing keys are not an error.
    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        ensure_key_safe(key)?;
        match self {
            Self::Local(backend) => backend.delete(key).await,
            Self::ObjectStore(backend) => backend.delete(key).await,
        }
    }

    /// Cheap reachability check used by the readiness check.
    pub async fn check_ready(&self) -> Result<(), String> {
        match self {
            Self::Local(backend) => backend.check_ready().await,
            Self::ObjectStore(backend) => backend.check_ready().await,
        }
    }
}

/// Compare a computed digest with the one the caller declared, if any.
pub(crate) fn check_declared(
    key: &str,
    expected_checksum: Option<&str>,
    actual: &str,
) -> StorageResult<()> {
    match expected_checksum {
        Some(expected) if !checksum::matches(expected, actual) => {
            Err(StorageError::ChecksumMismatch {
                key: key.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            })
        }
        _ => Ok(()),
    }
}

/// Reject keys that could escape the storage root or confuse backends.
pub fn ensure_key_safe(key: &str) -> StorageResult<()> {
    if key.is_empty() || key.len() > MAX_OBJECT_KEY_LEN {
        return Err(StorageError::InvalidObjectKey);
    }
    if key.starts_with('/') || key.contains("..") {
        return Err(StorageError::InvalidObjectKey);
    }
    if key
        .bytes()
        .any(|b| b.is_ascii_control() || b == b'\\' || b == b'\0')
    {
        return Err(StorageError::InvalidObjectKey);
    }
    Ok(())
}

/// Build the storage key for a user's upload:
/// `user/<userId>/uploads/<unixMillis>-<sanitizedFileName>`.
pub fn build_storage_key(user_id: &str, file_name: &str) -> String {
    format!(
        "user/{}/uploads/{}-{}",
        sanitize_key_segment(user_id),
        Utc::now().timestamp_millis(),
        sanitize_key_segment(file_name)
    )
}

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_key_segment(value: &str) -> String {
    value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Integrity-checking front door to the configured backend.
///
/// This is what the upload and delivery paths talk to; it never hands out an
/// object whose checksum disagrees with what the caller declared.
#[derive(Clone)]
pub struct StorageService {
    backend: StorageBackend,
}

impl StorageService {
    pub fn new(backend: StorageBackend) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &StorageBackend {
        &self.backend
    }

    /// Store a buffer, enforcing `expected_checksum` when given. A rejected
    /// write leaves any object already at `key` untouched.
    pub async fn store(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        expected_checksum: Option<&str>,
    ) -> StorageResult<StoredObject> {
        let stored = self
            .backend
            .put(key, data, content_type, expected_checksum)
            .await?;
        self.enforce_checksum(stored, expected_checksum).await
    }

    /// Store a byte stream, enforcing `expected_checksum` once the stream ends.
    pub async fn store_stream<S>(
        &self,
        key: &str,
        stream: S,
        content_type: Option<&str>,
        expected_checksum: Option<&str>,
    ) -> StorageResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let stored = self
            .backend
            .put_stream(key, stream, content_type, expected_checksum)
            .await?;
        self.enforce_checksum(stored, expected_checksum).await
    }

    /// Assemble chunks by index and store the result.
    pub async fn store_chunks(
        &self,
        key: &str,
        chunks: Vec<Chunk>,
        content_type: Option<&str>,
        expected_checksum: Option<&str>,
    ) -> StorageResult<StoredObject> {
        let data = chunk_assembler::assemble(chunks);
        self.store(key, data, content_type, expected_checksum).await
    }

    pub async fn retrieve(&self, key: &str) -> StorageResult<ObjectReader> {
        self.backend.get(key).await
    }

    /// Last check on what a backend reports. Backends already refuse a
    /// mismatch before committing, so this only fires if one did not.
    async fn enforce_checksum(
        &self,
        stored: StoredObject,
        expected_checksum: Option<&str>,
    ) -> StorageResult<StoredObject> {
        let Some(expected) = expected_checksum else {
            return Ok(stored);
        };
        if checksum::matches(expected, &stored.checksum) {
            return Ok(stored);
        }

        warn!(
            key = %stored.storage_key,
            driver = self.backend.driver(),
            "checksum mismatch after write, discarding object"
        );
        if let Err(err) = self.backend.delete(&stored.storage_key).await {
            debug!(key = %stored.storage_key, error = %err, "could not discard mismatched object");
        }
        Err(StorageError::ChecksumMismatch {
            key: stored.storage_key,
            expected: expected.to_string(),
            actual: stored.checksum,
        })
    }
}
