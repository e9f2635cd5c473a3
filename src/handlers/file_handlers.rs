//! Download endpoints, signed links, and placement lookup.

use crate::{
    errors::AppError,
    models::{node::Placement, requester::Requester},
    services::{access_token::signed_stream_url, delivery::Delivery},
    state::AppState,
};
use axum::{
    Json,
    extract::{Path, Query, State},
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// `GET /api/v1/files/{id}/stream`
pub async fn stream_file(
    State(state): State<AppState>,
    requester: Requester,
    Path(file_id): Path<Uuid>,
) -> Result<Delivery, AppError> {
    Ok(state.delivery.stream(file_id, &requester).await?)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlQuery {
    pub expires_in: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignedUrlResponse {
    pub url: String,
    pub token: String,
    pub expires_at: i64,
}

/// `GET /api/v1/files/{id}/url`
///
/// Only callers who can read the file get a link for it.
pub async fn issue_signed_url(
    State(state): State<AppState>,
    requester: Requester,
    Path(file_id): Path<Uuid>,
    Query(query): Query<SignedUrlQuery>,
) -> Result<Json<SignedUrlResponse>, AppError> {
    state
        .metadata
        .resolve_current_version(file_id, &requester)
        .await?;

    let ttl = query.expires_in.unwrap_or(state.signer.default_ttl_secs());
    let file_id = file_id.to_string();
    let issued = state.signer.issue(&file_id, &requester.user_id, ttl)?;

    info!(file_id = %file_id, user_id = %requester.user_id, ttl, "Issued signed link");

    Ok(Json(SignedUrlResponse {
        url: signed_stream_url(&state.public_base_url, &file_id, &issued.token),
        token: issued.token,
        expires_at: issued.expires_at,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SignedStreamQuery {
    pub token: Option<String>,
}

/// `GET /api/v1/files/{id}/stream-signed?token=`
///
/// The token stands in for a session: the download runs as the user who
/// issued it, so revoking their access revokes the link too.
pub async fn stream_signed(
    State(state): State<AppState>,
    Path(file_id): Path<Uuid>,
    Query(query): Query<SignedStreamQuery>,
) -> Result<Delivery, AppError> {
    let token = query
        .token
        .ok_or_else(|| AppError::invalid_request("token query parameter is required"))?;
    let claims = state.signer.verify(&token)?;

    if claims.file_id != file_id.to_string() {
        warn!(file_id = %file_id, token_file_id = %claims.file_id, "signed link used for another file");
        return Err(AppError::access_denied());
    }

    let requester = Requester::user(claims.user_id);
    Ok(state.delivery.stream(file_id, &requester).await?)
}

#[derive(Debug, Deserialize)]
pub struct PlacementQuery {
    pub key: String,
}

/// `GET /api/v1/placement?key=`
pub async fn placement_for(
    State(state): State<AppState>,
    _requester: Requester,
    Query(query): Query<PlacementQuery>,
) -> Result<Json<Placement>, AppError> {
    Ok(Json(state.placement.choose_nodes(&query.key).await?))
}
