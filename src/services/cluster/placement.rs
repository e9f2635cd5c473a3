//! Deterministic key-to-node placement.
//!
//! Every node computes the same answer for the same key and the same set of
//! eligible nodes, so placement is never stored.

use super::node_registry::NodeRegistry;
use crate::models::node::{ClusterNode, Placement};
use sha1::{Digest, Sha1};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlacementError {
    #[error("no cluster nodes configured")]
    NoNodesConfigured,
}

#[derive(Clone)]
pub struct PlacementService {
    registry: Arc<NodeRegistry>,
    replication_factor: usize,
}

impl PlacementService {
    pub fn new(registry: Arc<NodeRegistry>, replication_factor: usize) -> Self {
        Self {
            registry,
            replication_factor,
        }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub async fn choose_nodes(&self, key: &str) -> Result<Placement, PlacementError> {
        let nodes = self.registry.list_nodes().await;
        place(key, &nodes, self.replication_factor)
    }
}

/// Pick a primary and `replication_factor - 1` replicas for `key`.
///
/// Unhealthy nodes are skipped unless that would leave nothing, in which case
/// every node is a candidate again.
pub fn place(
    key: &str,
    nodes: &[ClusterNode],
    replication_factor: usize,
) -> Result<Placement, PlacementError> {
    if nodes.is_empty() {
        return Err(PlacementError::NoNodesConfigured);
    }

    let mut candidates: Vec<&ClusterNode> = nodes.iter().filter(|n| n.healthy).collect();
    if candidates.is_empty() {
        candidates = nodes.iter().collect();
    }
    candidates.sort_by(|a, b| a.id.as_bytes().cmp(b.id.as_bytes()));

    let n = candidates.len();
    let copies = replication_factor.clamp(1, n);
    let start = (key_hash(key) as usize) % n;

    let primary = candidates[start].clone();
    let replicas = (1..copies)
        .map(|offset| candidates[(start + offset) % n].clone())
        .collect();

    Ok(Placement { primary, replicas })
}

/// First 32 bits of SHA-1(key), big-endian.
fn key_hash(key: &str) -> u32 {
    let digest = Sha1::digest(key.as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]])
}
