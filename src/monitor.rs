//! Periodic health sampling of the local and peer database instances.
//! Detects primary failure and emits events for the failover engine to act
//! on; never mutates failover state itself.

use crate::cluster::{Cluster, HEALTH_THRESHOLD, NodeRole};
use crate::config::Config;
use crate::consensus::ConsensusFacade;
use crate::db::{ConnectionCache, SharedDbDriver};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tracing::{info, warn};

/// Consecutive failed primary probes before a failure is raised. Mirrors
/// the "several misses before declaring down" pattern used for peer
/// liveness elsewhere in this codebase's ancestry.
pub const FAILOVER_THRESHOLD: u32 = 3;

/// Parses a `LSN` string of the form `"<hex>/<hex>"` into a single
/// monotonically comparable integer: the high segment in the upper 32 bits,
/// the low segment in the lower 32. Returns 0 for anything that does not
/// parse, which simply sorts that node last.
fn parse_lsn(lsn: &str) -> u64 {
    let Some((high, low)) = lsn.split_once('/') else {
        return 0;
    };
    let high = u64::from_str_radix(high, 16).unwrap_or(0);
    let low = u64::from_str_radix(low, 16).unwrap_or(0);
    (high << 32) | low
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    PrimaryFailure { node_id: i32 },
    NodeRecovered { node_id: i32 },
    NodeDown { node_id: i32 },
    LeadershipChanged { leader_id: i32 },
}

pub struct HealthMonitor {
    cluster: Arc<Mutex<Cluster>>,
    config: Arc<Mutex<Config>>,
    db: SharedDbDriver,
    cache: Arc<ConnectionCache>,
    consensus: Arc<ConsensusFacade>,
    events_tx: mpsc::UnboundedSender<MonitorEvent>,
    consecutive_primary_failures: AtomicU32,
    last_leader_seen: AtomicI32,
}

impl HealthMonitor {
    pub fn new(
        cluster: Arc<Mutex<Cluster>>,
        config: Arc<Mutex<Config>>,
        db: SharedDbDriver,
        cache: Arc<ConnectionCache>,
        consensus: Arc<ConsensusFacade>,
        events_tx: mpsc::UnboundedSender<MonitorEvent>,
    ) -> Self {
        Self {
            cluster,
            config,
            db,
            cache,
            consensus,
            events_tx,
            consecutive_primary_failures: AtomicU32::new(0),
            last_leader_seen: AtomicI32::new(-1),
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            let interval_ms = self.config.lock().monitor_interval_ms;
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {
                    self.run_cycle().await;
                }
                _ = shutdown.recv() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    async fn run_cycle(&self) {
        self.check_local().await;
        self.check_remotes().await;
        self.check_leadership().await;

        let changed = self.cluster.lock().detect_topology_change();
        if changed {
            warn!("topology change detected: one or more nodes timed out");
        }
    }

    /// Persists an observed role onto the cluster's record of `node_id` when
    /// it differs from what is stored — e.g. a standby that began accepting
    /// writes, or a primary a probe now finds in recovery. Skipped while the
    /// node is not actually up, since an unreachable node's "role" is not an
    /// observation at all.
    fn apply_role_observation(&self, cluster: &mut Cluster, node_id: i32, observed_role: NodeRole, up: bool) {
        if !up {
            return;
        }
        let current_role = cluster.find(node_id).map(|n| n.role);
        if let Some(current) = current_role {
            if current != observed_role {
                info!("node {node_id} role observed as {observed_role:?} (was {current:?})");
                let _ = cluster.update_role(node_id, observed_role);
            }
        }
    }

    fn check_timeout(&self) -> Duration {
        Duration::from_millis(self.config.lock().health_check_timeout_ms)
    }

    async fn probe(&self, node_id: i32) -> Option<(bool, bool, bool, u64)> {
        let (host, port, db_name, db_user, was_primary) = {
            let cluster = self.cluster.lock();
            let node = cluster.find(node_id)?;
            (
                node.hostname.clone(),
                node.db_port,
                "postgres".to_string(),
                "postgres".to_string(),
                node.role == NodeRole::Primary,
            )
        };
        let data_dir = self.config.lock().db_data_dir.clone();
        let params = self.cache.get(node_id, &host, port, &db_name, &db_user, &data_dir);
        let db = self.db.clone();
        let status = timeout(self.check_timeout(), db.status(&params)).await;
        match status {
            Ok(Ok(status)) => Some((
                status.is_running,
                status.is_in_recovery,
                status.accepts_connections,
                parse_lsn(&status.current_wal_lsn),
            )),
            _ => {
                self.cache.mark_broken(node_id);
                let _ = was_primary;
                None
            }
        }
    }

    /// Base 50 for accepting connections, +30 primary / +20 standby, +15 if
    /// WAL advanced since the prior observation, +5 slack for the rest.
    fn score(
        &self,
        accepts: bool,
        role: NodeRole,
        wal_advanced: bool,
    ) -> u8 {
        if !accepts {
            return 0;
        }
        let mut score: u16 = 50;
        score += match role {
            NodeRole::Primary => 30,
            NodeRole::Standby => 20,
            NodeRole::Unknown => 0,
        };
        if wal_advanced {
            score += 15;
        }
        score += 5;
        score.min(100) as u8
    }

    async fn check_local(&self) {
        let local_id = self.cluster.lock().local_node_id;
        match self.probe(local_id).await {
            Some((running, in_recovery, accepts, wal_len)) => {
                let role = if in_recovery {
                    NodeRole::Standby
                } else {
                    NodeRole::Primary
                };
                let prior_wal = self
                    .cluster
                    .lock()
                    .find(local_id)
                    .map(|n| n.wal_position)
                    .unwrap_or(0);
                let score = self.score(running && accepts, role, wal_len as u64 > prior_wal);
                let mut cluster = self.cluster.lock();
                if let Some(node) = cluster.find_mut(local_id) {
                    node.wal_position = wal_len as u64;
                }
                let _ = cluster.update_health(local_id, score);
                self.apply_role_observation(&mut cluster, local_id, role, running && accepts);
                drop(cluster);
                self.track_primary_failure(local_id, running && accepts).await;
            }
            None => {
                let _ = self.cluster.lock().update_health(local_id, 0);
                self.track_primary_failure(local_id, false).await;
            }
        }
    }

    async fn check_remotes(&self) {
        let peer_ids: Vec<i32> = {
            let cluster = self.cluster.lock();
            let local = cluster.local_node_id;
            cluster.nodes().map(|n| n.node_id).filter(|id| *id != local).collect()
        };

        for node_id in peer_ids {
            let was_healthy = self
                .cluster
                .lock()
                .find(node_id)
                .map(|n| n.healthy)
                .unwrap_or(false);

            match self.probe(node_id).await {
                Some((running, in_recovery, accepts, wal_len)) => {
                    let role = if in_recovery {
                        NodeRole::Standby
                    } else {
                        NodeRole::Primary
                    };
                    let prior_wal = self
                        .cluster
                        .lock()
                        .find(node_id)
                        .map(|n| n.wal_position)
                        .unwrap_or(0);
                    let score = self.score(running && accepts, role, wal_len as u64 > prior_wal);
                    let mut cluster = self.cluster.lock();
                    if let Some(node) = cluster.find_mut(node_id) {
                        node.wal_position = wal_len as u64;
                    }
                    let _ = cluster.update_health(node_id, score);
                    self.apply_role_observation(&mut cluster, node_id, role, running && accepts);
                    drop(cluster);

                    let is_healthy = self
                        .cluster
                        .lock()
                        .find(node_id)
                        .map(|n| n.healthy)
                        .unwrap_or(false);
                    if is_healthy && !was_healthy {
                        let _ = self.events_tx.send(MonitorEvent::NodeRecovered { node_id });
                    }
                }
                None => {
                    let _ = self.cluster.lock().update_health(node_id, 0);
                    if was_healthy {
                        let _ = self.events_tx.send(MonitorEvent::NodeDown { node_id });
                    }
                }
            }
        }
    }

    async fn track_primary_failure(&self, node_id: i32, node_is_up_and_primary: bool) {
        let is_primary = self.cluster.lock().primary_node_id == node_id;
        if !is_primary {
            return;
        }
        if node_is_up_and_primary {
            self.consecutive_primary_failures.store(0, Ordering::SeqCst);
            return;
        }
        let failures = self.consecutive_primary_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= FAILOVER_THRESHOLD {
            warn!(
                "primary node {node_id} failed {failures} consecutive probes, raising PrimaryFailure"
            );
            let _ = self.events_tx.send(MonitorEvent::PrimaryFailure { node_id });
        }
    }

    async fn check_leadership(&self) {
        if let Ok(leader_id) = self.consensus.leader_id().await {
            let prior = self.last_leader_seen.swap(leader_id, Ordering::SeqCst);
            if prior != leader_id {
                self.cluster.lock().leader_node_id = leader_id;
                let _ = self
                    .events_tx
                    .send(MonitorEvent::LeadershipChanged { leader_id });
            }
        }
    }
}
