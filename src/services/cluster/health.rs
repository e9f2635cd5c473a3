//! Peer health probing and the background loops that keep cluster state
//! fresh.

use super::node_registry::{LEADER_RENEW_INTERVAL, NodeRegistry};
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(2);

/// Check every peer once, concurrently, and record the results.
pub async fn check_peers_once(registry: &NodeRegistry, http: &reqwest::Client) {
    let peers = registry.peers().await;
    let checks = peers.iter().map(|peer| async move {
        let url = format!("{}/healthz", peer.base_url);
        let healthy = match http.get(&url).timeout(HEALTH_CHECK_TIMEOUT).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(node_id = %peer.id, error = %e, "peer health check failed");
                false
            }
        };
        (peer.id.as_str(), healthy, peer.healthy)
    });

    for (node_id, healthy, was_healthy) in join_all(checks).await {
        if healthy != was_healthy {
            if healthy {
                info!(node_id = %node_id, "Peer is healthy again");
            } else {
                warn!(node_id = %node_id, "peer marked unhealthy");
            }
        }
        registry.mark_health(node_id, healthy).await;
    }
}

/// Check peers on a fixed interval until `shutdown` flips.
pub async fn run_health_loop(
    registry: Arc<NodeRegistry>,
    http: reqwest::Client,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => check_peers_once(&registry, &http).await,
            _ = shutdown.changed() => break,
        }
    }
}

/// Contend for the leader lease and keep it renewed while held.
///
/// A failed renewal drops this node back to contending. Lease store errors
/// are logged and retried on the next tick.
pub async fn run_leader_loop(registry: Arc<NodeRegistry>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(LEADER_RENEW_INTERVAL);
    let mut leading = false;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let result = if leading {
                    registry.renew_leadership().await
                } else {
                    registry.try_acquire_leadership().await
                };
                match result {
                    Ok(held) => {
                        if leading && !held {
                            warn!(node_id = %registry.local_node_id(), "leader lease lost");
                        }
                        leading = held;
                    }
                    Err(e) => {
                        warn!(error = %e, "leader lease maintenance failed");
                        leading = false;
                    }
                }
            }
            _ = shutdown.changed() => break,
        }
    }

    if leading {
        if let Err(e) = registry.release_leadership().await {
            warn!(error = %e, "failed to release leader lease");
        }
    }
}
