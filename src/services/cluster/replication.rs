//! Write placement decisions and best-effort replication signals.
//!
//! Signals are at-most-once: each replica gets a single POST with a short
//! timeout, and a failure is logged and forgotten. No bytes are copied here;
//! the receiving node only learns that an object exists.

use super::placement::{PlacementError, PlacementService};
use crate::models::node::WriteDecision;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub const REPLICATION_TIMEOUT: Duration = Duration::from_secs(3);

/// What a replica is told about a freshly written object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationContext {
    pub storage_key: String,
    pub mime_type: Option<String>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaOutcome {
    pub node_id: String,
    pub delivered: bool,
}

/// Handle over the in-flight signals. Dropping it leaves them running.
#[derive(Debug, Default)]
pub struct ReplicationFanout {
    tasks: Vec<JoinHandle<ReplicaOutcome>>,
}

impl ReplicationFanout {
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every signal to settle.
    pub async fn join(self) -> Vec<ReplicaOutcome> {
        join_all(self.tasks)
            .await
            .into_iter()
            .filter_map(Result::ok)
            .collect()
    }

    /// Log a delivery summary once every signal has settled, without making
    /// the caller wait for it.
    pub fn log_when_settled(self, storage_key: String) {
        if self.is_empty() {
            return;
        }
        let total = self.len();
        tokio::spawn(async move {
            let outcomes = self.join().await;
            let delivered = outcomes.iter().filter(|o| o.delivered).count();
            if delivered == total {
                info!(storage_key = %storage_key, delivered, total, "Replication signals delivered");
            } else {
                warn!(storage_key = %storage_key, delivered, total, "Some replication signals were not delivered");
            }
        });
    }
}

#[derive(Clone)]
pub struct ReplicationPlanner {
    placement: PlacementService,
    http: reqwest::Client,
}

impl ReplicationPlanner {
    pub fn new(placement: PlacementService, http: reqwest::Client) -> Self {
        Self { placement, http }
    }

    pub async fn decide_write_placement(&self, key: &str) -> Result<WriteDecision, PlacementError> {
        let registry = self.placement.registry();
        let local_id = registry.local_node_id().to_string();

        if !registry.clustering_enabled() {
            return Ok(WriteDecision {
                handled_locally: true,
                primary_id: local_id,
                replica_ids: Vec::new(),
            });
        }

        let placement = self.placement.choose_nodes(key).await?;
        Ok(WriteDecision {
            handled_locally: placement.primary.id == local_id,
            primary_id: placement.primary.id,
            replica_ids: placement.replicas.into_iter().map(|n| n.id).collect(),
        })
    }

    /// Signal each replica in its own task. Replicas without a known base URL
    /// (including this node) are skipped.
    pub async fn trigger_replication(
        &self,
        decision: &WriteDecision,
        context: ReplicationContext,
    ) -> ReplicationFanout {
        if decision.replica_ids.is_empty() {
            return ReplicationFanout::default();
        }

        let nodes = self.placement.registry().list_nodes().await;
        let mut tasks = Vec::with_capacity(decision.replica_ids.len());

        for replica_id in &decision.replica_ids {
            let Some(node) = nodes.iter().find(|n| &n.id == replica_id) else {
                warn!(node_id = %replica_id, "replica not in registry, skipping signal");
                continue;
            };
            if node.is_local() {
                continue;
            }

            info!(
                node_id = %node.id,
                storage_key = %context.storage_key,
                "Signalling replica"
            );

            let url = format!("{}/internal/replicate", node.base_url);
            let http = self.http.clone();
            let context = context.clone();
            let node_id = node.id.clone();

            tasks.push(tokio::spawn(async move {
                let delivered = send_signal(&http, &url, &context).await;
                if let Err(reason) = &delivered {
                    warn!(
                        node_id = %node_id,
                        storage_key = %context.storage_key,
                        error = %reason,
                        "replication signal failed"
                    );
                }
                ReplicaOutcome {
                    node_id,
                    delivered: delivered.is_ok(),
                }
            }));
        }

        ReplicationFanout { tasks }
    }
}

async fn send_signal(
    http: &reqwest::Client,
    url: &str,
    context: &ReplicationContext,
) -> Result<(), String> {
    let response = http
        .post(url)
        .timeout(REPLICATION_TIMEOUT)
        .json(context)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    if response.status().is_success() {
        Ok(())
    } else {
        Err(format!("replica responded with {}", response.status()))
    }
}
