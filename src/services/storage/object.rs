//! Object-store backend (S3 in production, `InMemory` in tests).
//!
//! Buffered writes are checksummed before the first byte leaves the process
//! and retried on transient failures. Streamed writes go through a multipart
//! upload with fixed-size parts and a bounded number of parts in flight.

use super::{ByteStream, ObjectReader, StorageError, StorageResult, check_declared};
use crate::{
    models::stored_object::StoredObject,
    services::checksum::{self, RunningDigest},
};
use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use object_store::{
    Attribute, AttributeValue, Attributes, ObjectStore, PutMultipartOpts, PutOptions, PutPayload,
    WriteMultipart, aws::AmazonS3Builder, path::Path as ObjectPath,
};
use std::{fmt::Display, future::Future, io, sync::Arc, time::Duration};
use tracing::{debug, warn};

/// Total attempts for a buffered write, including the first.
pub const MAX_WRITE_ATTEMPTS: u32 = 3;
/// Backoff before retry `n` is `RETRY_BASE_DELAY * n`.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(200);
/// Size of each multipart part.
pub const PART_SIZE: usize = 5 * 1024 * 1024;
/// Maximum multipart parts uploading at once.
pub const MAX_PARTS_IN_FLIGHT: usize = 4;

#[derive(Clone)]
pub struct ObjectStoreBackend {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBackend {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Build an S3 client from the standard `AWS_*` environment plus the
    /// configured bucket and region.
    pub fn s3(bucket: &str, region: &str) -> object_store::Result<Self> {
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(region)
            .build()?;
        Ok(Self::new(Arc::new(store)))
    }

    fn location(key: &str) -> StorageResult<ObjectPath> {
        ObjectPath::parse(key).map_err(|_| StorageError::InvalidObjectKey)
    }

    pub async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: Option<&str>,
        expected_checksum: Option<&str>,
    ) -> StorageResult<StoredObject> {
        let location = Self::location(key)?;
        let actual = checksum::hash(&data);
        check_declared(key, expected_checksum, &actual)?;

        let size_bytes = data.len() as u64;
        let payload = PutPayload::from(data);
        let attributes = content_attributes(content_type);

        with_retries(
            MAX_WRITE_ATTEMPTS,
            RETRY_BASE_DELAY,
            is_transient,
            |attempt| {
                let mut opts = PutOptions::default();
                opts.attributes = attributes.clone();
                let payload = payload.clone();
                let location = location.clone();
                async move {
                    debug!(key, attempt, "putting object");
                    self.store.put_opts(&location, payload, opts).await
                }
            },
        )
        .await
        .map_err(|(attempts, err)| StorageError::BackendWriteFailed {
            key: key.to_string(),
            attempts,
            reason: err.to_string(),
        })?;

        Ok(StoredObject {
            storage_key: key.to_string(),
            size_bytes,
            checksum: actual,
        })
    }

    /// Multipart upload of a byte stream. Memory stays bounded by
    /// `PART_SIZE * MAX_PARTS_IN_FLIGHT` plus the current chunk. The upload
    /// is aborted rather than completed when the digest does not match.
    pub async fn put_stream<S>(
        &self,
        key: &str,
        stream: S,
        content_type: Option<&str>,
        expected_checksum: Option<&str>,
    ) -> StorageResult<StoredObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let location = Self::location(key)?;
        let write_failed = |err: object_store::Error| StorageError::BackendWriteFailed {
            key: key.to_string(),
            attempts: 1,
            reason: err.to_string(),
        };

        let mut opts = PutMultipartOpts::default();
        opts.attributes = content_attributes(content_type);
        let upload = self
            .store
            .put_multipart_opts(&location, opts)
            .await
            .map_err(write_failed)?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, PART_SIZE);

        let mut digest = RunningDigest::new();
        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = match chunk_res {
                Ok(chunk) => chunk,
                Err(err) => {
                    abort(writer, key).await;
                    return Err(StorageError::SourceInterrupted(err));
                }
            };
            if let Err(err) = writer.wait_for_capacity(MAX_PARTS_IN_FLIGHT).await {
                abort(writer, key).await;
                return Err(write_failed(err));
            }
            digest.update(&chunk);
            writer.write(&chunk);
        }
        let (checksum, size_bytes) = digest.finish();
        if let Err(err) = check_declared(key, expected_checksum, &checksum) {
            abort(writer, key).await;
            return Err(err);
        }
        writer.finish().await.map_err(write_failed)?;

        debug!(key, size_bytes, "completed multipart upload");
        Ok(StoredObject {
            storage_key: key.to_string(),
            size_bytes,
            checksum,
        })
    }

    pub async fn get(&self, key: &str) -> StorageResult<ObjectReader> {
        let location = Self::location(key)?;
        let result = self.store.get(&location).await.map_err(|err| match err {
            object_store::Error::NotFound { .. } => StorageError::ObjectNotFound(key.to_string()),
            other => StorageError::BackendReadFailed {
                key: key.to_string(),
                reason: other.to_string(),
            },
        })?;
        let size_bytes = Some(result.meta.size as u64);
        let stream: ByteStream = result
            .into_stream()
            .map(|chunk| chunk.map_err(io::Error::other))
            .boxed();
        Ok(ObjectReader { size_bytes, stream })
    }

    pub async fn delete(&self, key: &str) -> StorageResult<()> {
        let location = Self::location(key)?;
        match self.store.delete(&location).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(StorageError::BackendWriteFailed {
                key: key.to_string(),
                attempts: 1,
                reason: err.to_string(),
            }),
        }
    }

    /// A HEAD on a sentinel key: "not found" still proves the store answers.
    pub async fn check_ready(&self) -> Result<(), String> {
        match self.store.head(&ObjectPath::from(".readyz")).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(err) => Err(err.to_string()),
        }
    }
}

fn content_attributes(content_type: Option<&str>) -> Attributes {
    let mut attributes = Attributes::new();
    if let Some(content_type) = content_type {
        attributes.insert(
            Attribute::ContentType,
            AttributeValue::from(content_type.to_string()),
        );
    }
    attributes
}

async fn abort(writer: WriteMultipart, key: &str) {
    if let Err(err) = writer.abort().await {
        warn!(key, error = %err, "failed to abort multipart upload");
    }
}

/// Errors that will not go away by asking again.
fn is_transient(err: &object_store::Error) -> bool {
    !matches!(
        err,
        object_store::Error::InvalidPath { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented
    )
}

/// Run `op` up to `max_attempts` times, sleeping `base_delay * attempt`
/// between attempts. Returns the attempt count alongside the last error.
pub async fn with_retries<T, E, F, Fut>(
    max_attempts: u32,
    base_delay: Duration,
    retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, (u32, E)>
where
    E: Display,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= max_attempts || !retryable(&err) => return Err((attempt, err)),
            Err(err) => {
                warn!(attempt, error = %err, "backend write failed, retrying");
                tokio::time::sleep(base_delay * attempt).await;
                attempt += 1;
            }
        }
    }
}
