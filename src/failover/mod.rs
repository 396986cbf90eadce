//! The failover state machine: detect a dead primary, select and promote a
//! standby, reconfigure the survivors, and record the outcome.

use crate::cluster::{Cluster, NodeRole, NodeState};
use crate::config::Config;
use crate::consensus::ConsensusFacade;
use crate::db::{ConnectionCache, SharedDbDriver};
use crate::errors::RamdError;
use crate::maintenance::MaintenanceManager;
use crate::monitor::MonitorEvent;
use crate::sync_replication::SyncReplicationManager;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

const PROMOTION_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How often the post-failover reconfiguration sweep retries unreachable
/// standbys before giving up and logging them.
const RECONFIG_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverState {
    Normal,
    Detecting,
    Promoting,
    Recovering,
    Completed,
    Failed,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct FailoverContext {
    pub state: FailoverState,
    pub failed_node_id: Option<i32>,
    pub new_primary_node_id: Option<i32>,
    pub started_at_ms: Option<u64>,
    pub completed_at_ms: Option<u64>,
    pub reason: Option<String>,
    pub auto_triggered: bool,
    pub retry_count: u32,
}

impl Default for FailoverContext {
    fn default() -> Self {
        Self {
            state: FailoverState::Normal,
            failed_node_id: None,
            new_primary_node_id: None,
            started_at_ms: None,
            completed_at_ms: None,
            reason: None,
            auto_triggered: false,
            retry_count: 0,
        }
    }
}

impl FailoverContext {
    fn reset(&mut self) {
        *self = FailoverContext::default();
    }
}

/// One pinned read of the consensus layer, taken at the start of a
/// transition and reused for every decision made during it. The engine
/// never re-queries the oracle mid-transition even if the monitor observes
/// a different answer later.
struct OracleSnapshot {
    leader_id: i32,
    has_quorum: bool,
}

pub struct FailoverEngine {
    cluster: Arc<SyncMutex<Cluster>>,
    config: Arc<SyncMutex<Config>>,
    context: Arc<SyncMutex<FailoverContext>>,
    db: SharedDbDriver,
    cache: Arc<ConnectionCache>,
    consensus: Arc<ConsensusFacade>,
    sync_replication: Arc<SyncReplicationManager>,
    maintenance: Arc<MaintenanceManager>,
    /// Serializes transitions: only one failover runs at a time.
    transition_lock: Mutex<()>,
}

impl FailoverEngine {
    pub fn new(
        cluster: Arc<SyncMutex<Cluster>>,
        config: Arc<SyncMutex<Config>>,
        db: SharedDbDriver,
        cache: Arc<ConnectionCache>,
        consensus: Arc<ConsensusFacade>,
        sync_replication: Arc<SyncReplicationManager>,
        maintenance: Arc<MaintenanceManager>,
    ) -> Self {
        Self {
            cluster,
            config,
            context: Arc::new(SyncMutex::new(FailoverContext::default())),
            db,
            cache,
            consensus,
            sync_replication,
            maintenance,
            transition_lock: Mutex::new(()),
        }
    }

    pub fn context(&self) -> FailoverContext {
        self.context.lock().clone()
    }

    /// Drives the engine from monitor events until told to shut down.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<MonitorEvent>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    if let MonitorEvent::PrimaryFailure { node_id } = event {
                        if self.should_trigger(node_id).await {
                            self.run_failover(node_id, true).await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("failover engine shutting down");
                    break;
                }
            }
        }
    }

    async fn snapshot_oracle(&self) -> OracleSnapshot {
        let leader_id = self.consensus.leader_id().await.unwrap_or(-1);
        let has_quorum = self.cluster.lock().has_quorum(&self.consensus).await;
        OracleSnapshot { leader_id, has_quorum }
    }

    /// True iff auto-failover is enabled, no failover is already running,
    /// the cluster has quorum, and `node_id` is not under maintenance
    /// inhibition. Gates only the automatic monitor-driven path — manual
    /// triggers go through `trigger_manual` directly.
    pub async fn should_trigger(&self, node_id: i32) -> bool {
        let auto_enabled = self.config.lock().auto_failover_enabled;
        if !auto_enabled {
            return false;
        }
        if self.context.lock().state != FailoverState::Normal {
            return false;
        }
        if self.maintenance.is_under_maintenance(node_id) {
            return false;
        }
        self.cluster.lock().has_quorum(&self.consensus).await
    }

    /// Operator-triggered entry point (the control API's `/failover` route).
    pub async fn trigger_manual(&self, failed_node_id: i32) -> Result<(), RamdError> {
        if self.context.lock().state != FailoverState::Normal {
            return Err(RamdError::Conflict("a failover is already in progress".into()));
        }
        self.run_failover(failed_node_id, false).await;
        let final_state = self.context.lock().state;
        if final_state == FailoverState::Failed {
            let reason = self.context.lock().reason.clone().unwrap_or_default();
            return Err(RamdError::Internal(reason));
        }
        Ok(())
    }

    async fn run_failover(self: &Arc<Self>, failed_node_id: i32, auto_triggered: bool) {
        let _guard = self.transition_lock.lock().await;
        if self.context.lock().state != FailoverState::Normal {
            return;
        }

        {
            let mut ctx = self.context.lock();
            ctx.reset();
            ctx.state = FailoverState::Detecting;
            ctx.failed_node_id = Some(failed_node_id);
            ctx.auto_triggered = auto_triggered;
            ctx.started_at_ms = Some(crate::cluster::now_ms());
        }
        self.cluster.lock().in_failover = true;

        let snapshot = self.snapshot_oracle().await;
        if !snapshot.has_quorum {
            self.fail_with(RamdError::NoQuorum.to_string());
            return;
        }

        self.context.lock().state = FailoverState::Promoting;

        let max_retries = self.config.lock().failover_retry_max;
        let mut selected: Option<i32> = None;
        for attempt in 0..=max_retries {
            match self.select_new_primary() {
                Ok(candidate) => match self.promote(candidate).await {
                    Ok(()) => {
                        selected = Some(candidate);
                        break;
                    }
                    Err(e) => {
                        warn!("promotion attempt {attempt} of node {candidate} failed: {e}");
                        self.context.lock().retry_count = attempt + 1;
                    }
                },
                Err(e) => {
                    self.fail_with(e.to_string());
                    return;
                }
            }
        }

        let Some(new_primary) = selected else {
            self.fail_with("promotion retries exhausted".into());
            return;
        };

        self.context.lock().state = FailoverState::Recovering;
        self.context.lock().new_primary_node_id = Some(new_primary);

        self.demote_failed_primary(failed_node_id).await;
        let reconfig_result = self.update_standby_nodes(new_primary).await;

        match reconfig_result {
            Ok(()) => {
                let mut ctx = self.context.lock();
                ctx.state = FailoverState::Completed;
                ctx.completed_at_ms = Some(crate::cluster::now_ms());
            }
            Err(e) => {
                self.fail_with(format!("standby reconfiguration failed: {e}"));
                return;
            }
        }

        self.cluster.lock().in_failover = false;
        self.spawn_post_failover_sweep(new_primary);
    }

    fn fail_with(&self, reason: String) {
        error!("failover failed: {reason}");
        let mut ctx = self.context.lock();
        ctx.state = FailoverState::Failed;
        ctx.reason = Some(reason);
        ctx.completed_at_ms = Some(crate::cluster::now_ms());
        drop(ctx);
        self.cluster.lock().in_failover = false;
    }

    /// Resets the context back to `Normal` after a terminal state. Exposed
    /// for the control API and for manual retry after a failed attempt.
    pub fn reset(&self) {
        self.context.lock().reset();
    }

    /// Highest observed WAL position wins; ties broken by the smaller
    /// `node_id` for determinism.
    pub fn select_new_primary(&self) -> Result<i32, RamdError> {
        let cluster = self.cluster.lock();
        cluster
            .nodes()
            .filter(|n| n.healthy && n.role == NodeRole::Standby)
            .max_by(|a, b| {
                a.wal_position
                    .cmp(&b.wal_position)
                    .then(b.node_id.cmp(&a.node_id))
            })
            .map(|n| n.node_id)
            .ok_or(RamdError::NoEligibleStandby)
    }

    pub async fn promote(&self, node_id: i32) -> Result<(), RamdError> {
        let (host, port) = {
            let cluster = self.cluster.lock();
            let node = cluster
                .find(node_id)
                .ok_or_else(|| RamdError::NotFound(format!("node {node_id}")))?;
            (node.hostname.clone(), node.db_port)
        };
        let data_dir = self.config.lock().db_data_dir.clone();
        let params = self.cache.get(node_id, &host, port, "postgres", "postgres", &data_dir);

        self.db
            .promote(&params)
            .await
            .map_err(|e| RamdError::PromotionFailed(node_id, e.to_string()))?;

        let failover_timeout = Duration::from_millis(self.config.lock().failover_timeout_ms);
        let wait = timeout(failover_timeout, async {
            loop {
                if let Ok(status) = self.db.status(&params).await {
                    if !status.is_in_recovery && status.accepts_connections {
                        return;
                    }
                }
                sleep(PROMOTION_POLL_INTERVAL).await;
            }
        })
        .await;

        if wait.is_err() {
            return Err(RamdError::PromotionTimeout(node_id));
        }

        let mut cluster = self.cluster.lock();
        cluster.update_role(node_id, NodeRole::Primary)?;
        cluster.update_state(node_id, NodeState::Primary)?;
        Ok(())
    }

    pub async fn demote_failed_primary(&self, node_id: i32) {
        let (host, port) = {
            let cluster = self.cluster.lock();
            match cluster.find(node_id) {
                Some(n) => (n.hostname.clone(), n.db_port),
                None => return,
            }
        };
        let data_dir = self.config.lock().db_data_dir.clone();
        let params = self.cache.get(node_id, &host, port, "postgres", "postgres", &data_dir);
        if let Err(e) = self.db.stop_replication(&params).await {
            warn!("best-effort demotion of failed primary {node_id} failed: {e}");
        }
        let mut cluster = self.cluster.lock();
        let _ = cluster.update_state(node_id, NodeState::Failed);
        let _ = cluster.update_health(node_id, 0);
    }

    /// Rewrites recovery configuration on every remaining healthy standby
    /// and recomputes the synchronous-standby policy for the new topology.
    pub async fn update_standby_nodes(&self, new_primary_id: i32) -> Result<(), RamdError> {
        let (new_host, new_port, standby_ids): (String, u16, Vec<i32>) = {
            let cluster = self.cluster.lock();
            let primary = cluster
                .find(new_primary_id)
                .ok_or_else(|| RamdError::NotFound(format!("node {new_primary_id}")))?;
            let ids = cluster
                .nodes()
                .filter(|n| n.node_id != new_primary_id && n.role == NodeRole::Standby && n.healthy)
                .map(|n| n.node_id)
                .collect();
            (primary.hostname.clone(), primary.db_port, ids)
        };

        let mut first_error = None;
        for standby_id in &standby_ids {
            if let Err(e) = self.reconfigure_one_standby(*standby_id, &new_host, new_port).await {
                warn!("failed to reconfigure standby {standby_id}: {e}");
                first_error.get_or_insert(e);
            }
        }

        self.sync_replication.recompute(new_primary_id).await;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn reconfigure_one_standby(
        &self,
        standby_id: i32,
        new_primary_host: &str,
        new_primary_port: u16,
    ) -> Result<(), RamdError> {
        let (host, port) = {
            let cluster = self.cluster.lock();
            let node = cluster
                .find(standby_id)
                .ok_or_else(|| RamdError::NotFound(format!("node {standby_id}")))?;
            (node.hostname.clone(), node.db_port)
        };
        let data_dir = self.config.lock().db_data_dir.clone();
        let params = self.cache.get(standby_id, &host, port, "postgres", "postgres", &data_dir);
        self.db
            .set_recovery_target(&params, new_primary_host, new_primary_port)
            .await
            .map_err(|e| RamdError::StandbyReconfigFailed(standby_id, e.to_string()))
    }

    /// Best-effort follow-up: failed standbys are rebuilt from the new
    /// primary via base backup. Failures here are logged, not fatal — a
    /// partially recovered cluster still beats a dead one.
    fn spawn_post_failover_sweep(self: &Arc<Self>, new_primary_id: i32) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let deadline = tokio::time::Instant::now() + Duration::from_secs(300);
            loop {
                if tokio::time::Instant::now() >= deadline {
                    let remaining: Vec<i32> = engine
                        .cluster
                        .lock()
                        .nodes()
                        .filter(|n| n.state == NodeState::Failed)
                        .map(|n| n.node_id)
                        .collect();
                    if !remaining.is_empty() {
                        warn!("post-failover sweep timed out with unreconfigured nodes: {remaining:?}");
                    }
                    return;
                }
                let failed: Vec<i32> = engine
                    .cluster
                    .lock()
                    .nodes()
                    .filter(|n| n.state == NodeState::Failed && n.node_id != new_primary_id)
                    .map(|n| n.node_id)
                    .collect();
                if failed.is_empty() {
                    return;
                }
                for node_id in failed {
                    if let Err(e) = engine.rebuild_failed_replica(node_id, new_primary_id).await {
                        warn!("rebuild of node {node_id} failed: {e}");
                    }
                }
                sleep(RECONFIG_SWEEP_INTERVAL).await;
            }
        });
    }

    async fn rebuild_failed_replica(&self, node_id: i32, new_primary_id: i32) -> Result<(), RamdError> {
        if self.maintenance.is_under_maintenance(node_id) {
            return Ok(());
        }
        let (src_host, src_port) = {
            let cluster = self.cluster.lock();
            let primary = cluster
                .find(new_primary_id)
                .ok_or_else(|| RamdError::NotFound(format!("node {new_primary_id}")))?;
            (primary.hostname.clone(), primary.db_port)
        };
        let (host, port) = {
            let cluster = self.cluster.lock();
            let node = cluster
                .find(node_id)
                .ok_or_else(|| RamdError::NotFound(format!("node {node_id}")))?;
            (node.hostname.clone(), node.db_port)
        };
        let data_dir = self.config.lock().db_data_dir.clone();
        let params = self.cache.get(node_id, &host, port, "postgres", "postgres", &data_dir);
        self.db.base_backup_from(&params, &src_host, src_port).await?;
        let mut cluster = self.cluster.lock();
        cluster.update_role(node_id, NodeRole::Standby)?;
        cluster.update_state(node_id, NodeState::Standby)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;
    use crate::consensus::InMemoryOracle;
    use crate::db::{DbStatus, MockDbDriver};

    fn setup() -> (
        Arc<FailoverEngine>,
        Arc<SyncMutex<Cluster>>,
        Arc<MockDbDriver>,
    ) {
        let mut cluster = Cluster::new(1);
        cluster.add(Node::new(1, "n1".into(), 5432, 7000, 7100)).unwrap();
        cluster.add(Node::new(2, "n2".into(), 5432, 7000, 7100)).unwrap();
        cluster.add(Node::new(3, "n3".into(), 5432, 7000, 7100)).unwrap();
        cluster.update_role(1, NodeRole::Primary).unwrap();
        cluster.update_role(2, NodeRole::Standby).unwrap();
        cluster.update_role(3, NodeRole::Standby).unwrap();
        cluster.update_health(1, 100).unwrap();
        cluster.update_health(2, 100).unwrap();
        cluster.update_health(3, 100).unwrap();
        cluster.find_mut(2).unwrap().wal_position = 100;
        cluster.find_mut(3).unwrap().wal_position = 200;
        let cluster = Arc::new(SyncMutex::new(cluster));

        let config = Arc::new(SyncMutex::new(Config::default()));
        let db = Arc::new(MockDbDriver::new());
        db.set_status(
            "n2",
            5432,
            DbStatus { is_running: true, is_in_recovery: true, accepts_connections: true, ..Default::default() },
        );
        db.set_status(
            "n3",
            5432,
            DbStatus { is_running: true, is_in_recovery: false, accepts_connections: true, ..Default::default() },
        );
        let cache = Arc::new(ConnectionCache::new());
        let oracle = Arc::new(InMemoryOracle::new());
        oracle.set_leader(1);
        let consensus = Arc::new(ConsensusFacade::new(oracle));
        let sync_repl = Arc::new(SyncReplicationManager::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
        ));
        let maintenance = Arc::new(MaintenanceManager::new(cluster.clone(), config.clone(), db.clone(), cache.clone()));
        let engine = Arc::new(FailoverEngine::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
            consensus,
            sync_repl,
            maintenance,
        ));
        (engine, cluster, db)
    }

    #[test]
    fn picks_highest_wal_standby_breaking_ties_by_lowest_id() {
        let (engine, _cluster, _db) = setup();
        assert_eq!(engine.select_new_primary().unwrap(), 3);
    }

    #[tokio::test]
    async fn manual_failover_promotes_and_completes() {
        let (engine, cluster, _db) = setup();
        engine.trigger_manual(1).await.unwrap();
        assert_eq!(engine.context().state, FailoverState::Completed);
        assert_eq!(cluster.lock().primary_node_id, 3);
    }

    #[tokio::test]
    async fn no_eligible_standby_fails_cleanly() {
        let (engine, cluster, _db) = setup();
        cluster.lock().update_health(2, 0).unwrap();
        cluster.lock().update_health(3, 0).unwrap();
        let err = engine.trigger_manual(1).await;
        assert!(err.is_err());
        assert_eq!(engine.context().state, FailoverState::Failed);
    }
}
