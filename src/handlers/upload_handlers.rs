//! Upload endpoints: single multipart, chunked multipart, raw stream, and
//! new versions of an existing file.

use crate::{
    errors::AppError,
    models::{
        file::{FileRecord, FileVersion},
        node::WriteDecision,
        requester::Requester,
    },
    services::{
        chunk_assembler::Chunk,
        upload::{UploadBody, UploadInput, UploadOutcome},
    },
    state::AppState,
};
use axum::{
    Json,
    body::Body,
    extract::{Multipart, Path, Query, State, multipart::MultipartError},
    http::{HeaderMap, StatusCode, header},
};
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::io;
use uuid::Uuid;

const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadResponse {
    pub file: FileRecord,
    pub version: FileVersion,
    pub placement: WriteDecision,
}

impl From<UploadOutcome> for UploadResponse {
    fn from(outcome: UploadOutcome) -> Self {
        // Replication signals keep running after the response is sent.
        outcome
            .replication
            .log_when_settled(outcome.version.storage_key.clone());
        Self {
            file: outcome.file,
            version: outcome.version,
            placement: outcome.decision,
        }
    }
}

impl From<MultipartError> for AppError {
    fn from(err: MultipartError) -> Self {
        AppError::invalid_request(format!("invalid multipart body: {}", err.body_text()))
    }
}

/// `POST /api/v1/upload`
pub async fn upload_single(
    State(state): State<AppState>,
    requester: Requester,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let input = read_single_file(multipart).await?;
    let outcome = state.uploads.upload(&requester, input).await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

/// `POST /api/v1/files/{id}/versions`
pub async fn upload_version(
    State(state): State<AppState>,
    requester: Requester,
    Path(file_id): Path<Uuid>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let input = read_single_file(multipart).await?;
    let outcome = state
        .uploads
        .upload_version(file_id, &requester, input)
        .await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

/// `POST /api/v1/upload/chunked`
///
/// Chunks arrive as `chunk.<index>` fields; plain `chunk` fields take their
/// arrival position as index.
pub async fn upload_chunked(
    State(state): State<AppState>,
    requester: Requester,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mut chunks = Vec::new();
    let mut file_name = None;
    let mut folder_id = None;
    let mut checksum = None;
    let mut mime_type = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "fileName" => file_name = Some(field.text().await?),
            "folderId" => folder_id = non_empty(field.text().await?),
            "checksum" => checksum = non_empty(field.text().await?),
            _ => {
                let Some(index) = chunk_index(&name, chunks.len()) else {
                    continue;
                };
                if mime_type.is_none() {
                    mime_type = field.content_type().map(String::from);
                }
                chunks.push(Chunk::new(index, field.bytes().await?));
            }
        }
    }

    if chunks.is_empty() {
        return Err(AppError::invalid_request("no chunks provided"));
    }
    let file_name = file_name
        .and_then(non_empty)
        .ok_or_else(|| AppError::invalid_request("fileName is required for chunked uploads"))?;

    let input = UploadInput {
        file_name,
        mime_type: mime_type.unwrap_or_else(|| FALLBACK_MIME.into()),
        folder_id,
        expected_checksum: checksum,
        body: UploadBody::Chunked(chunks),
    };
    let outcome = state.uploads.upload(&requester, input).await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamUploadQuery {
    pub file_name: String,
    pub folder_id: Option<String>,
    pub checksum: Option<String>,
}

/// `PUT /api/v1/upload/stream?fileName=&folderId=`
///
/// The request body is piped straight into storage.
pub async fn upload_stream(
    State(state): State<AppState>,
    requester: Requester,
    Query(query): Query<StreamUploadQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<(StatusCode, Json<UploadResponse>), AppError> {
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
        .unwrap_or_else(|| FALLBACK_MIME.into());

    let stream = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(io::Error::other))
        .boxed();

    let input = UploadInput {
        file_name: query.file_name,
        mime_type,
        folder_id: query.folder_id.and_then(non_empty),
        expected_checksum: query.checksum.and_then(non_empty),
        body: UploadBody::Streamed(stream),
    };
    let outcome = state.uploads.upload(&requester, input).await?;
    Ok((StatusCode::CREATED, Json(outcome.into())))
}

/// Read the `file`, `folderId` and `checksum` fields of a single upload.
async fn read_single_file(mut multipart: Multipart) -> Result<UploadInput, AppError> {
    let mut file: Option<(String, String, Bytes)> = None;
    let mut folder_id = None;
    let mut checksum = None;

    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().unwrap_or_default().to_string();
                let mime_type = field.content_type().unwrap_or(FALLBACK_MIME).to_string();
                let data = field.bytes().await?;
                file = Some((file_name, mime_type, data));
            }
            "folderId" => folder_id = non_empty(field.text().await?),
            "checksum" => checksum = non_empty(field.text().await?),
            _ => {}
        }
    }

    let (file_name, mime_type, data) =
        file.ok_or_else(|| AppError::invalid_request("no file provided"))?;
    Ok(UploadInput {
        file_name,
        mime_type,
        folder_id,
        expected_checksum: checksum,
        body: UploadBody::Buffered(data),
    })
}

fn chunk_index(field_name: &str, arrival: usize) -> Option<u32> {
    if field_name == "chunk" {
        return u32::try_from(arrival).ok();
    }
    field_name.strip_prefix("chunk.")?.parse().ok()
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}
