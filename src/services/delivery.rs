//! Streaming downloads of a file's current version.
//!
//! The first chunk is read before any response framing is committed, so a
//! backend that fails to open or to produce data yields an ordinary error
//! response. After that the body is a live stream: bytes are counted as they
//! go out and a backend error ends the transfer with an error, which tears
//! the connection down instead of sending a silently truncated file.

use crate::{
    models::requester::Requester,
    services::{
        metadata::{MetadataError, MetadataStore},
        storage::{ByteStream, StorageError, StorageService},
    },
};
use axum::{
    body::Body,
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use futures::{StreamExt, stream};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};
use std::io;
use thiserror::Error;
#[cfg(test)]
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Characters left alone when encoding a download file name.
const FILENAME_SAFE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("transfer aborted after {bytes_sent} bytes: {reason}")]
    StreamAborted { bytes_sent: u64, reason: String },
}

/// Response framing decided before the first byte is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Framing {
    pub content_type: String,
    pub content_disposition: String,
    pub content_length: Option<u64>,
}

impl Framing {
    pub fn new(file_name: &str, mime_type: Option<&str>, content_length: Option<u64>) -> Self {
        Self {
            content_type: mime_type
                .filter(|m| !m.trim().is_empty())
                .unwrap_or(DEFAULT_CONTENT_TYPE)
                .to_string(),
            content_disposition: format!(
                "attachment; filename=\"{}\"",
                utf8_percent_encode(file_name, FILENAME_SAFE)
            ),
            content_length,
        }
    }
}

/// A primed download. Dropping it drops the backend stream.
pub struct Delivery {
    pub framing: Framing,
    body: ByteStream,
}

impl Delivery {
    fn new(framing: Framing, body: ByteStream) -> Self {
        Self { framing, body }
    }

    /// Copy the body into `writer`, returning the number of bytes written.
    #[cfg(test)]
    pub async fn pipe_to<W>(self, writer: &mut W) -> Result<u64, DeliveryError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut body = self.body;
        let mut bytes_sent = 0u64;

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| DeliveryError::StreamAborted {
                bytes_sent,
                reason: e.to_string(),
            })?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DeliveryError::StreamAborted {
                    bytes_sent,
                    reason: e.to_string(),
                })?;
            bytes_sent += chunk.len() as u64;
        }

        writer
            .flush()
            .await
            .map_err(|e| DeliveryError::StreamAborted {
                bytes_sent,
                reason: e.to_string(),
            })?;
        Ok(bytes_sent)
    }
}

impl IntoResponse for Delivery {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from_stream(self.body));

        let headers = response.headers_mut();
        if let Ok(value) = HeaderValue::from_str(&self.framing.content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        } else {
            headers.insert(
                header::CONTENT_TYPE,
                HeaderValue::from_static(DEFAULT_CONTENT_TYPE),
            );
        }
        if let Ok(value) = HeaderValue::from_str(&self.framing.content_disposition) {
            headers.insert(header::CONTENT_DISPOSITION, value);
        }
        if let Some(len) = self.framing.content_length {
            headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        }
        response
    }
}

#[derive(Clone)]
pub struct StreamingDelivery {
    metadata: MetadataStore,
    storage: StorageService,
}

impl StreamingDelivery {
    pub fn new(metadata: MetadataStore, storage: StorageService) -> Self {
        Self { metadata, storage }
    }

    /// Open the current version of `file_id` for `requester`.
    pub async fn stream(
        &self,
        file_id: Uuid,
        requester: &Requester,
    ) -> Result<Delivery, DeliveryError> {
        let (file, version) = self
            .metadata
            .resolve_current_version(file_id, requester)
            .await?;

        let reader = self.storage.retrieve(&version.storage_key).await?;
        let body = prime(reader.stream)
            .await
            .map_err(|e| StorageError::BackendReadFailed {
                key: version.storage_key.clone(),
                reason: e.to_string(),
            })?;

        info!(
            file_id = %file.id,
            version = version.version_number,
            user_id = %requester.user_id,
            "Starting download"
        );

        let framing = Framing::new(&file.name, file.mime_type.as_deref(), reader.size_bytes);
        Ok(Delivery::new(framing, counted(body, file.id)))
    }
}

/// Pull the first chunk so open-time failures surface before framing.
async fn prime(mut stream: ByteStream) -> io::Result<ByteStream> {
    match stream.next().await {
        Some(Ok(first)) => Ok(stream::once(async move { Ok(first) }).chain(stream).boxed()),
        Some(Err(e)) => Err(e),
        None => Ok(stream::empty().boxed()),
    }
}

struct Transfer {
    inner: ByteStream,
    file_id: Uuid,
    bytes_sent: u64,
    finished: bool,
}

/// Count bytes through `body`, logging completion or the abort point. A
/// backend error is passed on as [`DeliveryError::StreamAborted`] and ends
/// the stream.
fn counted(body: ByteStream, file_id: Uuid) -> ByteStream {
    let transfer = Transfer {
        inner: body,
        file_id,
        bytes_sent: 0,
        finished: false,
    };

    stream::unfold(transfer, |mut t| async move {
        if t.finished {
            return None;
        }
        match t.inner.next().await {
            Some(Ok(chunk)) => {
                t.bytes_sent += chunk.len() as u64;
                Some((Ok(chunk), t))
            }
            Some(Err(e)) => {
                warn!(
                    file_id = %t.file_id,
                    bytes_sent = t.bytes_sent,
                    error = %e,
                    "download aborted mid-stream"
                );
                t.finished = true;
                let aborted = DeliveryError::StreamAborted {
                    bytes_sent: t.bytes_sent,
                    reason: e.to_string(),
                };
                Some((Err(io::Error::other(aborted)), t))
            }
            None => {
                info!(file_id = %t.file_id, bytes_sent = t.bytes_sent, "Download complete");
                None
            }
        }
    })
    .boxed()
}
