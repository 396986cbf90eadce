//! Planned maintenance: drain a node's sessions, suppress auto-failover, and
//! optionally take a backup, all reversible on exit.

use crate::cluster::{Cluster, NodeRole, now_ms};
use crate::config::Config;
use crate::db::{ConnectionCache, SharedDbDriver};
use crate::errors::RamdError;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceState {
    Inactive,
    Pending,
    Active,
    Draining,
    Completing,
    Failed,
}

/// What kind of maintenance a window covers. Informational only today — it
/// does not change `enter`'s behavior, only what gets recorded and reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceType {
    Node,
    Cluster,
    PlannedFailover,
    Backup,
    Upgrade,
    Network,
}

impl Default for MaintenanceType {
    fn default() -> Self {
        MaintenanceType::Node
    }
}

#[derive(Debug, Clone, Default)]
pub struct MaintenanceOptions {
    pub maintenance_type: MaintenanceType,
    pub disable_auto_failover: bool,
    pub create_backup: bool,
    pub drain: bool,
    pub reason: Option<String>,
    pub contact: Option<String>,
    pub scheduled_end_ms: Option<u64>,
}

struct NodeMaintenance {
    state: MaintenanceState,
    maintenance_type: MaintenanceType,
    target_node_id: i32,
    start_time_ms: u64,
    end_time_ms: Option<u64>,
    scheduled_end_ms: Option<u64>,
    reason: Option<String>,
    contact: Option<String>,
    /// Whether entering maintenance is the thing that flipped
    /// `auto_failover_enabled` to false, so `exit` knows to restore it.
    toggled_auto_failover: bool,
    connections_drained: u32,
    active_connections: u32,
    backup_id: Option<String>,
    status_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ScheduledWindow {
    pub node_id: i32,
    pub start_at_ms: u64,
    pub options: MaintenanceOptions,
}

pub struct MaintenanceManager {
    cluster: Arc<Mutex<Cluster>>,
    config: Arc<Mutex<Config>>,
    db: SharedDbDriver,
    cache: Arc<ConnectionCache>,
    states: DashMap<i32, NodeMaintenance>,
    scheduled: Mutex<Vec<ScheduledWindow>>,
}

impl MaintenanceManager {
    pub fn new(
        cluster: Arc<Mutex<Cluster>>,
        config: Arc<Mutex<Config>>,
        db: SharedDbDriver,
        cache: Arc<ConnectionCache>,
    ) -> Self {
        Self {
            cluster,
            config,
            db,
            cache,
            states: DashMap::new(),
            scheduled: Mutex::new(Vec::new()),
        }
    }

    /// True only while the node is fully `Active` under maintenance; a node
    /// still `Pending`, mid-`Draining`/`Completing`, or that ended `Failed`
    /// does not suppress failover decisions.
    pub fn is_under_maintenance(&self, node_id: i32) -> bool {
        self.states
            .get(&node_id)
            .map(|s| s.state == MaintenanceState::Active)
            .unwrap_or(false)
    }

    pub fn state_of(&self, node_id: i32) -> MaintenanceState {
        self.states
            .get(&node_id)
            .map(|s| s.state)
            .unwrap_or(MaintenanceState::Inactive)
    }

    fn connection_params(&self, node_id: i32) -> Result<crate::db::ConnParams, RamdError> {
        let (host, port) = {
            let cluster = self.cluster.lock();
            let node = cluster
                .find(node_id)
                .ok_or_else(|| RamdError::NotFound(format!("node {node_id}")))?;
            (node.hostname.clone(), node.db_port)
        };
        let data_dir = self.config.lock().db_data_dir.clone();
        Ok(self.cache.get(node_id, &host, port, "postgres", "postgres", &data_dir))
    }

    /// Pre-checks: the cluster must have a healthy majority; the target, if
    /// it is the current primary, must have a healthy standby to fail over
    /// to; every node must answer a reachability probe through the driver;
    /// the target's replication must not already be lagging beyond the
    /// drain window; the target must have no active sessions unless a drain
    /// was requested; and, when a backup was requested, a backup tool must
    /// actually be configured.
    async fn pre_check(&self, node_id: i32, options: &MaintenanceOptions) -> Result<(), RamdError> {
        let (node_count, healthy_count, role) = {
            let cluster = self.cluster.lock();
            let node = cluster
                .find(node_id)
                .ok_or_else(|| RamdError::NotFound(format!("node {node_id}")))?;
            (cluster.node_count(), cluster.count_healthy(), node.role)
        };

        if node_count > 0 && healthy_count * 2 <= node_count {
            return Err(RamdError::MaintenanceUnsafe(
                "cluster does not have a healthy majority".into(),
            ));
        }

        if role == NodeRole::Primary {
            let other_healthy_standbys = {
                let cluster = self.cluster.lock();
                cluster
                    .nodes()
                    .filter(|n| n.node_id != node_id && n.role == NodeRole::Standby && n.healthy)
                    .count()
            };
            if other_healthy_standbys == 0 {
                return Err(RamdError::MaintenanceUnsafe(
                    "primary has no healthy standby to fail over to during maintenance".into(),
                ));
            }
        }

        let probe_timeout = Duration::from_millis(self.config.lock().health_check_timeout_ms);
        let node_ids: Vec<i32> = self.cluster.lock().nodes().map(|n| n.node_id).collect();
        for id in node_ids {
            let params = self.connection_params(id)?;
            let reachable = tokio::time::timeout(probe_timeout, self.db.accepts_connections(&params))
                .await
                .map(|r| r.unwrap_or(false))
                .unwrap_or(false);
            if !reachable {
                return Err(RamdError::MaintenanceUnsafe(format!(
                    "node {id} did not respond to a reachability probe"
                )));
            }
        }

        let params = self.connection_params(node_id)?;
        let status = self
            .db
            .status(&params)
            .await
            .map_err(|e| RamdError::MaintenanceUnsafe(format!("replication status unavailable: {e}")))?;
        let drain_timeout_s = self.config.lock().drain_timeout_ms as f64 / 1000.0;
        if status.is_in_recovery && status.replication_lag_seconds > drain_timeout_s {
            return Err(RamdError::MaintenanceUnsafe(
                "replication lag exceeds the drain window".into(),
            ));
        }

        if !options.drain {
            let active = self.db.active_sessions_count(&params).await.unwrap_or(0);
            if active > 1 {
                return Err(RamdError::MaintenanceUnsafe(
                    "active user sessions present and drain was not requested".into(),
                ));
            }
        }

        if options.create_backup && self.config.lock().db_bin_dir.trim().is_empty() {
            return Err(RamdError::MaintenanceUnsafe("no backup tool configured".into()));
        }

        Ok(())
    }

    /// Runs pre-checks, then applies the requested options and marks the
    /// node Active. On failure the window is recorded as `Failed` (not
    /// deleted) and any toggles it made are rolled back.
    pub async fn enter(&self, node_id: i32, options: MaintenanceOptions) -> Result<(), RamdError> {
        if self.is_under_maintenance(node_id) {
            return Err(RamdError::Conflict(format!(
                "node {node_id} is already under maintenance"
            )));
        }
        self.pre_check(node_id, &options).await?;

        self.states.insert(
            node_id,
            NodeMaintenance {
                state: MaintenanceState::Pending,
                maintenance_type: options.maintenance_type,
                target_node_id: node_id,
                start_time_ms: now_ms(),
                end_time_ms: None,
                scheduled_end_ms: options.scheduled_end_ms,
                reason: options.reason.clone(),
                contact: options.contact.clone(),
                toggled_auto_failover: false,
                connections_drained: 0,
                active_connections: 0,
                backup_id: None,
                status_message: None,
            },
        );

        let mut toggled_auto_failover = false;
        if options.disable_auto_failover {
            let mut config = self.config.lock();
            if config.auto_failover_enabled {
                config.auto_failover_enabled = false;
                toggled_auto_failover = true;
            }
        }
        if let Some(mut entry) = self.states.get_mut(&node_id) {
            entry.toggled_auto_failover = toggled_auto_failover;
        }

        let mut backup_id = None;
        if options.create_backup {
            match self.take_backup(node_id).await {
                Ok(id) => backup_id = Some(id),
                Err(e) => warn!("pre-maintenance backup for node {node_id} failed: {e}"),
            }
        }
        if let Some(mut entry) = self.states.get_mut(&node_id) {
            entry.backup_id = backup_id;
        }

        if options.drain {
            if let Some(mut entry) = self.states.get_mut(&node_id) {
                entry.state = MaintenanceState::Draining;
            }
            if let Err(e) = self.drain_sessions(node_id).await {
                if let Some(mut entry) = self.states.get_mut(&node_id) {
                    entry.state = MaintenanceState::Failed;
                    entry.status_message = Some(e.to_string());
                }
                if toggled_auto_failover {
                    self.config.lock().auto_failover_enabled = true;
                }
                return Err(e);
            }
            if let Some(mut entry) = self.states.get_mut(&node_id) {
                entry.state = MaintenanceState::Completing;
                entry.connections_drained = entry.active_connections;
            }
        }

        if let Some(mut entry) = self.states.get_mut(&node_id) {
            entry.state = MaintenanceState::Active;
        }
        info!("node {node_id} entered maintenance");
        Ok(())
    }

    /// Takes a base backup of the node's own data directory, using itself as
    /// the source. Returns an id the operator can later reference.
    async fn take_backup(&self, node_id: i32) -> Result<String, RamdError> {
        let (host, port) = {
            let cluster = self.cluster.lock();
            let node = cluster
                .find(node_id)
                .ok_or_else(|| RamdError::NotFound(format!("node {node_id}")))?;
            (node.hostname.clone(), node.db_port)
        };
        let params = self.connection_params(node_id)?;
        self.db.base_backup_from(&params, &host, port).await?;
        Ok(format!("backup-{node_id}-{}", now_ms()))
    }

    /// Disallows new sessions and waits up to `drain_timeout_ms` for the
    /// active session count to fall to 1 (the operator's own connection).
    async fn drain_sessions(&self, node_id: i32) -> Result<(), RamdError> {
        let drain_timeout_ms = self.config.lock().drain_timeout_ms;
        let params = self.connection_params(node_id)?;

        let deadline = tokio::time::Instant::now() + Duration::from_millis(drain_timeout_ms);
        loop {
            if let Ok(count) = self.db.active_sessions_count(&params).await {
                if let Some(mut entry) = self.states.get_mut(&node_id) {
                    entry.active_connections = count;
                }
                if count <= 1 {
                    return Ok(());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(RamdError::DrainTimeout);
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    /// Restores connection policy and the auto-failover flag (only if this
    /// manager is the one that disabled it) and clears maintenance state.
    /// Calling `exit` on a node that is not under maintenance is a no-op.
    pub fn exit(&self, node_id: i32) -> Result<(), RamdError> {
        if let Some((_, removed)) = self.states.remove(&node_id) {
            if removed.toggled_auto_failover {
                self.config.lock().auto_failover_enabled = true;
            }
            info!("node {node_id} exited maintenance");
        }
        Ok(())
    }

    /// Records a one-shot future maintenance window. Activation of a
    /// scheduled window is driven by the caller polling `due_windows`.
    pub fn schedule(&self, node_id: i32, start_at_ms: u64, options: MaintenanceOptions) {
        self.scheduled.lock().push(ScheduledWindow {
            node_id,
            start_at_ms,
            options,
        });
    }

    /// Pops and returns every scheduled window whose start time has passed.
    pub fn due_windows(&self, now_ms: u64) -> Vec<ScheduledWindow> {
        let mut scheduled = self.scheduled.lock();
        let (due, remaining): (Vec<_>, Vec<_>) =
            scheduled.drain(..).partition(|w| w.start_at_ms <= now_ms);
        *scheduled = remaining;
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;
    use crate::db::{DbStatus, MockDbDriver};

    fn setup() -> (
        Arc<MaintenanceManager>,
        Arc<Mutex<Cluster>>,
        Arc<Mutex<Config>>,
        Arc<MockDbDriver>,
    ) {
        let mut cluster = Cluster::new(1);
        cluster.add(Node::new(1, "n1".into(), 5432, 7000, 7100)).unwrap();
        cluster.add(Node::new(2, "n2".into(), 5432, 7000, 7100)).unwrap();
        cluster.update_role(1, NodeRole::Primary).unwrap();
        cluster.update_role(2, NodeRole::Standby).unwrap();
        cluster.update_health(1, 100).unwrap();
        cluster.update_health(2, 100).unwrap();
        let cluster = Arc::new(Mutex::new(cluster));
        let config = Arc::new(Mutex::new(Config::default()));
        let db = Arc::new(MockDbDriver::new());
        db.set_status(
            "n1",
            5432,
            DbStatus { is_running: true, accepts_connections: true, ..Default::default() },
        );
        db.set_status(
            "n2",
            5432,
            DbStatus { is_running: true, accepts_connections: true, ..Default::default() },
        );
        let cache = Arc::new(ConnectionCache::new());
        let mgr = Arc::new(MaintenanceManager::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache,
        ));
        (mgr, cluster, config, db)
    }

    #[tokio::test]
    async fn enter_and_exit_round_trip() {
        let (mgr, _cluster, _config, _db) = setup();
        mgr.enter(2, MaintenanceOptions::default()).await.unwrap();
        assert!(mgr.is_under_maintenance(2));
        mgr.exit(2).unwrap();
        assert!(!mgr.is_under_maintenance(2));
    }

    #[tokio::test]
    async fn double_exit_is_a_harmless_no_op() {
        let (mgr, _cluster, _config, _db) = setup();
        mgr.enter(2, MaintenanceOptions::default()).await.unwrap();
        mgr.exit(2).unwrap();
        assert!(mgr.exit(2).is_ok());
    }

    #[tokio::test]
    async fn primary_maintenance_rejected_without_a_healthy_standby() {
        let (mgr, cluster, _config, _db) = setup();
        cluster.lock().update_health(2, 0).unwrap();
        let err = mgr.enter(1, MaintenanceOptions::default()).await;
        assert!(matches!(err, Err(RamdError::MaintenanceUnsafe(_))));
    }

    #[tokio::test]
    async fn maintenance_rejected_when_a_peer_is_unreachable() {
        let (mgr, _cluster, _config, db) = setup();
        db.statuses.remove("n2:5432");
        let err = mgr.enter(1, MaintenanceOptions::default()).await;
        assert!(matches!(err, Err(RamdError::MaintenanceUnsafe(_))));
    }

    #[tokio::test]
    async fn disable_auto_failover_option_is_restored_on_exit() {
        let (mgr, _cluster, config, _db) = setup();
        let options = MaintenanceOptions {
            disable_auto_failover: true,
            ..Default::default()
        };
        mgr.enter(2, options).await.unwrap();
        assert!(!config.lock().auto_failover_enabled);
        mgr.exit(2).unwrap();
        assert!(config.lock().auto_failover_enabled);
    }

    #[tokio::test]
    async fn drain_timeout_leaves_a_failed_record_and_restores_auto_failover() {
        let (mgr, _cluster, config, db) = setup();
        config.lock().drain_timeout_ms = 50;
        db.set_session_count("n2", 5432, 5);
        let options = MaintenanceOptions {
            disable_auto_failover: true,
            drain: true,
            ..Default::default()
        };
        let err = mgr.enter(2, options).await;
        assert!(matches!(err, Err(RamdError::DrainTimeout)));
        assert_eq!(mgr.state_of(2), MaintenanceState::Failed);
        assert!(config.lock().auto_failover_enabled);
    }

    #[tokio::test]
    async fn successful_drain_transitions_through_to_active() {
        let (mgr, _cluster, _config, _db) = setup();
        let options = MaintenanceOptions {
            drain: true,
            ..Default::default()
        };
        mgr.enter(2, options).await.unwrap();
        assert_eq!(mgr.state_of(2), MaintenanceState::Active);
    }
}
