//! Node-to-node endpoints.

use crate::{
    errors::AppError, models::node::ClusterNode, services::cluster::ReplicationContext,
    state::AppState,
};
use axum::{Json, extract::State, http::StatusCode};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

/// `POST /internal/replicate`
///
/// Acknowledge a replication signal. Bytes are not copied; the intent is
/// recorded in the log.
pub async fn receive_replication(
    State(state): State<AppState>,
    Json(signal): Json<ReplicationContext>,
) -> (StatusCode, Json<Value>) {
    info!(
        node_id = %state.registry.local_node_id(),
        storage_key = %signal.storage_key,
        mime_type = signal.mime_type.as_deref().unwrap_or("-"),
        size_bytes = signal.size_bytes,
        "Replication signal received"
    );
    (StatusCode::ACCEPTED, Json(json!({ "status": "accepted" })))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    pub node_id: String,
    pub clustering_enabled: bool,
    pub leader: Option<String>,
    pub nodes: Vec<ClusterNode>,
}

/// `GET /internal/cluster`
pub async fn cluster_status(State(state): State<AppState>) -> Result<Json<ClusterStatus>, AppError> {
    let registry = &state.registry;
    Ok(Json(ClusterStatus {
        node_id: registry.local_node_id().to_string(),
        clustering_enabled: registry.clustering_enabled(),
        leader: registry.current_leader().await?,
        nodes: registry.list_nodes().await,
    }))
}
