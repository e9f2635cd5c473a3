//! Cluster membership and placement types.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A node as this process sees it. Health is advisory: it only narrows the
/// placement candidates.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub id: String,
    /// Empty for the local node.
    pub base_url: String,
    pub healthy: bool,
    pub last_seen_at: Option<DateTime<Utc>>,
}

impl ClusterNode {
    pub fn is_local(&self) -> bool {
        self.base_url.is_empty()
    }
}

/// Where an object's bytes should live. Recomputed on demand, never stored.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct Placement {
    pub primary: ClusterNode,
    pub replicas: Vec<ClusterNode>,
}

/// Outcome of placement from the writing node's point of view.
#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WriteDecision {
    pub handled_locally: bool,
    pub primary_id: String,
    pub replica_ids: Vec<String>,
}
