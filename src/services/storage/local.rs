//! Local filesystem backend.
//!
//! Objects live at `base_path/<storage key>`. Writes go to a temp file in the
//! destination directory, are fsynced, checked against any declared checksum,
//! then renamed into place. Failures are surfaced immediately; local errors
//! are rarely transient.

use super::{ByteStream, ObjectReader, StorageError, StorageResult, check_declared};
use crate::{models::stored_object::StoredObject, services::checksum::RunningDigest};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut, stream};
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tokio_util::io::ReaderStream;
use tracing::debug;
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct LocalBackend {
    base_path: PathBuf,
}

impl LocalBackend {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
        }
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        expected_checksum: Option<&str>,
    ) -> StorageResult<StoredObject> {
        self.put_stream(key, stream::once(async move { Ok(data) }), expected_checksum)
            .await
    }

    /// Stream bytes into `key`, hashing them as they are written. The
    /// destination is only replaced once the digest is known to match.
    pub async fn put_stream<S>(
        &self,
        key: &str,
        stream: S,
        expected_checksum: Option<&str>,
    ) -> StorageResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let write_failed = |err: io::Error| StorageError::BackendWriteFailed {
            key: key.to_string(),
            attempts: 1,
            reason: err.to_string(),
        };

        let file_path = self.object_path(key);
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or(StorageError::InvalidObjectKey)?;
        fs::create_dir_all(&parent).await.map_err(write_failed)?;
        let tmp_path = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        let mut file = File::create(&tmp_path).await.map_err(write_failed)?;

        let mut digest = RunningDigest::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(StorageError::SourceInterrupted(err));
                }
            };
            digest.update(&chunk);
            if let Err(err) = file.write_all(&chunk).await {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(write_failed(err));
            }
        }
        if let Err(err) = file.flush().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(write_failed(err));
        }
        if let Err(err) = file.sync_all().await {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(write_failed(err));
        }
        drop(file);

        let (checksum, size_bytes) = digest.finish();
        if let Err(err) = check_declared(key, expected_checksum, &checksum) {
            let _ = fs::remove_file(&tmp_path).await;
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &file_path).await {
            if err.kind() == ErrorKind::AlreadyExists {
                fs::remove_file(&file_path).await.map_err(write_failed)?;
                fs::rename(&tmp_path, &file_path)
                    .await
                    .map_err(write_failed)?;
            } else {
                let _ = fs::remove_file(&tmp_path).await;
                return Err(write_failed(err));
            }
        }

        debug!(key, size_bytes, "wrote local object");
        Ok(StoredObject {
            storage_key: key.to_string(),
            size_bytes,
            checksum,
        })
    }

    pub async fn get(&self, key: &str) -> StorageResult<ObjectReader> {
        let file = File::open(self.object_path(key)).await.map_err(|err| {
            if err.kind() == ErrorKind::NotFound {
                StorageError::ObjectNotFound(key.to_string())
            } else {
                StorageError::BackendReadFailed {
                    key: key.to_string(),
                    reason: err.to_string(),
                }
            }
        })?;
        let size_bytes = file.metadata().await.ok().map(|meta| meta.len());
        let stream: ByteStream = ReaderStream::new(file).boxed();
        Ok(ObjectReader { size_bytes, stream })
    }

    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let path = self.object_path(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!("removed local object {}", path.display());
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(StorageError::BackendWriteFailed {
                key: key.to_string(),
                attempts: 1,
                reason: err.to_string(),
            }),
        }
    }

    /// Write, read back, and delete a scratch file under the base path.
    pub async fn check_ready(&self) -> Result<(), String> {
        let tmp_path = self.base_path.join(format!(".readyz-{}", Uuid::new_v4()));
        fs::write(&tmp_path, b"readyz")
            .await
            .map_err(|e| format!("could not write tmp file: {}", e))?;
        let read = fs::read(&tmp_path).await;
        let _ = fs::remove_file(&tmp_path).await;
        match read {
            Ok(bytes) if bytes == b"readyz" => Ok(()),
            Ok(_) => Err("file content mismatch".to_string()),
            Err(e) => Err(format!("could not read tmp file: {}", e)),
        }
    }
}
