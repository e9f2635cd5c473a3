//! This node's view of the cluster: membership, advisory health, and the
//! leader lease.
//!
//! The registry is built once at startup from configuration and shared by
//! reference; membership does not change at runtime. The shared lease store,
//! not this struct, is the source of truth for leadership.

use super::lease::{LeaseStore, LeaseResult};
use crate::models::node::ClusterNode;
use chrono::Utc;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{info, warn};

pub const LEADER_KEY: &str = "cluster:leader";
pub const LEADER_TTL: Duration = Duration::from_secs(15);
/// Must stay well under `LEADER_TTL` so a live leader never lapses.
pub const LEADER_RENEW_INTERVAL: Duration = Duration::from_secs(5);

pub struct NodeRegistry {
    local_id: String,
    nodes: RwLock<HashMap<String, ClusterNode>>,
    lease: Option<Arc<dyn LeaseStore>>,
}

impl NodeRegistry {
    /// Seed the registry with this node and its peers.
    ///
    /// `peers` entries are `id@baseUrl`; malformed ones are skipped with a
    /// warning. `lease` is `None` when clustering is disabled, which turns
    /// every leader operation into a no-op.
    pub fn new(
        local_id: impl Into<String>,
        peers: &[String],
        lease: Option<Arc<dyn LeaseStore>>,
    ) -> Self {
        let local_id = local_id.into();
        let mut nodes = HashMap::new();
        nodes.insert(
            local_id.clone(),
            ClusterNode {
                id: local_id.clone(),
                base_url: String::new(),
                healthy: true,
                last_seen_at: Some(Utc::now()),
            },
        );

        for peer in peers {
            match parse_peer(peer) {
                Some((id, url)) if id != local_id => {
                    nodes.insert(
                        id.to_string(),
                        ClusterNode {
                            id: id.to_string(),
                            base_url: url.trim_end_matches('/').to_string(),
                            healthy: true,
                            last_seen_at: None,
                        },
                    );
                }
                Some(_) => warn!(peer = %peer, "ignoring peer entry that names the local node"),
                None => warn!(peer = %peer, "invalid peer entry, expected id@url"),
            }
        }

        Self {
            local_id,
            nodes: RwLock::new(nodes),
            lease,
        }
    }

    pub fn local_node_id(&self) -> &str {
        &self.local_id
    }

    pub fn clustering_enabled(&self) -> bool {
        self.lease.is_some()
    }

    pub async fn list_nodes(&self) -> Vec<ClusterNode> {
        let nodes = self.nodes.read().await;
        let mut list: Vec<ClusterNode> = nodes.values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Every node except this one.
    pub async fn peers(&self) -> Vec<ClusterNode> {
        self.list_nodes()
            .await
            .into_iter()
            .filter(|node| node.id != self.local_id)
            .collect()
    }

    /// Record a health check result. Unknown ids are ignored.
    pub async fn mark_health(&self, node_id: &str, healthy: bool) {
        let mut nodes = self.nodes.write().await;
        if let Some(node) = nodes.get_mut(node_id) {
            node.healthy = healthy;
            node.last_seen_at = Some(Utc::now());
        }
    }

    pub async fn try_acquire_leadership(&self) -> LeaseResult<bool> {
        let Some(lease) = &self.lease else {
            return Ok(false);
        };
        let acquired = lease.acquire(LEADER_KEY, &self.local_id, LEADER_TTL).await?;
        if acquired {
            info!(node_id = %self.local_id, "This node became leader");
        }
        Ok(acquired)
    }

    /// Extend the lease if this node still holds it. `false` means another
    /// node is (or may become) leader and this one must stop acting as such.
    pub async fn renew_leadership(&self) -> LeaseResult<bool> {
        let Some(lease) = &self.lease else {
            return Ok(false);
        };
        lease.renew(LEADER_KEY, &self.local_id, LEADER_TTL).await
    }

    pub async fn current_leader(&self) -> LeaseResult<Option<String>> {
        let Some(lease) = &self.lease else {
            return Ok(None);
        };
        lease.holder(LEADER_KEY).await
    }

    /// Give the lease up early, e.g. on shutdown.
    pub async fn release_leadership(&self) -> LeaseResult<bool> {
        let Some(lease) = &self.lease else {
            return Ok(false);
        };
        lease.release(LEADER_KEY, &self.local_id).await
    }
}

fn parse_peer(entry: &str) -> Option<(&str, &str)> {
    let (id, url) = entry.trim().split_once('@')?;
    let (id, url) = (id.trim(), url.trim());
    if id.is_empty() || url.is_empty() {
        return None;
    }
    Some((id, url))
}
