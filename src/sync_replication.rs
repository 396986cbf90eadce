//! Computes and applies the synchronous-standby policy: which standbys must
//! confirm a transaction before the primary reports it committed.

use crate::cluster::{Cluster, NodeRole};
use crate::config::Config;
use crate::db::{ConnectionCache, SharedDbDriver};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::warn;

/// Upper bound on the ANY-N synchronous set, mirroring `MAX_NODES` since a
/// standby cannot be synchronous without also being a cluster member.
pub const MAX_SYNC: usize = crate::cluster::MAX_NODES;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Off,
    /// The first `n` enabled standbys, by listed order, are synchronous.
    FixedN,
    /// `ANY min_sync (name1, name2, ...)`.
    AnyN,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitLevel {
    Off,
    Local,
    RemoteWrite,
    RemoteApply,
}

impl CommitLevel {
    fn as_guc_value(self) -> &'static str {
        match self {
            CommitLevel::Off => "off",
            CommitLevel::Local => "local",
            CommitLevel::RemoteWrite => "remote_write",
            CommitLevel::RemoteApply => "remote_apply",
        }
    }
}

/// One standby's listing in the policy: its name plus relative priority.
#[derive(Debug, Clone)]
pub struct StandbyEntry {
    pub name: String,
    pub priority: u32,
    pub enabled: bool,
    pub observed_is_sync: bool,
    pub observed_lag_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SyncPolicy {
    pub mode: SyncMode,
    pub commit_level: CommitLevel,
    pub num_sync_standbys: usize,
    pub min_sync: usize,
    pub max_sync: usize,
    pub standbys: Vec<StandbyEntry>,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            mode: SyncMode::Off,
            commit_level: CommitLevel::Off,
            num_sync_standbys: 0,
            min_sync: 0,
            max_sync: 0,
            standbys: Vec::new(),
        }
    }
}

impl SyncPolicy {
    /// Renders the policy into the `synchronous_standby_names` value the
    /// database engine expects. An empty string disables synchronous
    /// replication entirely.
    pub fn to_names_string(&self) -> String {
        if self.mode == SyncMode::Off || self.standbys.iter().all(|s| !s.enabled) {
            return String::new();
        }
        let mut ordered: Vec<&StandbyEntry> = self.standbys.iter().filter(|s| s.enabled).collect();
        ordered.sort_by_key(|s| s.priority);
        let names: Vec<&str> = ordered.iter().map(|s| s.name.as_str()).collect();

        match self.mode {
            SyncMode::FixedN => {
                let n = self.num_sync_standbys.min(names.len());
                names[..n].join(",")
            }
            SyncMode::AnyN => {
                let min = self.min_sync.min(self.max_sync.max(self.min_sync)).max(1);
                format!("ANY {} ({})", min, names.join(","))
            }
            SyncMode::Off => String::new(),
        }
    }
}

/// Recomputes and pushes the synchronous-standby policy into the live
/// database whenever cluster topology changes.
pub struct SyncReplicationManager {
    cluster: Arc<Mutex<Cluster>>,
    config: Arc<Mutex<Config>>,
    db: SharedDbDriver,
    cache: Arc<ConnectionCache>,
    policy: Mutex<SyncPolicy>,
}

impl SyncReplicationManager {
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
            policy: Mutex::new(SyncPolicy::default()),
        }
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy.lock().clone()
    }

    /// Adds a standby to the live policy, e.g. when a node joins the
    /// cluster between `recompute` calls. A no-op if the name is already
    /// present.
    pub fn add(&self, entry: StandbyEntry) {
        let mut policy = self.policy.lock();
        if !policy.standbys.iter().any(|s| s.name == entry.name) {
            policy.standbys.push(entry);
        }
    }

    /// Removes a standby by name. A no-op if the name is not present.
    /// `add` followed by `remove` of the same name restores the prior
    /// `to_names_string()` output.
    pub fn remove(&self, name: &str) {
        self.policy.lock().standbys.retain(|s| s.name != name);
    }

    fn policy_from_config(&self, standby_names: &[String]) -> SyncPolicy {
        let config = self.config.lock();
        if !config.synchronous_replication || standby_names.is_empty() {
            return SyncPolicy::default();
        }
        let standbys = standby_names
            .iter()
            .enumerate()
            .map(|(i, name)| StandbyEntry {
                name: name.clone(),
                priority: i as u32,
                enabled: true,
                observed_is_sync: false,
                observed_lag_ms: 0,
            })
            .collect();
        let mode = if config.sync_standby_max > 0 {
            SyncMode::AnyN
        } else {
            SyncMode::FixedN
        };
        SyncPolicy {
            mode,
            commit_level: CommitLevel::RemoteWrite,
            num_sync_standbys: config.sync_standby_min.max(1).min(standby_names.len()),
            min_sync: config.sync_standby_min,
            max_sync: config.sync_standby_max,
            standbys,
        }
    }

    /// Recomputes the synchronous set against the given primary's current
    /// standbys and pushes it through the driver. Called after a failover
    /// completes and whenever configuration reload touches the
    /// synchronous-replication group.
    pub async fn recompute(&self, primary_node_id: i32) {
        let standby_names: Vec<String> = {
            let cluster = self.cluster.lock();
            cluster
                .nodes()
                .filter(|n| n.node_id != primary_node_id && n.role == NodeRole::Standby && n.healthy)
                .map(|n| n.hostname.clone())
                .collect()
        };

        let new_policy = self.policy_from_config(&standby_names);
        *self.policy.lock() = new_policy.clone();

        let (host, port) = {
            let cluster = self.cluster.lock();
            match cluster.find(primary_node_id) {
                Some(n) => (n.hostname.clone(), n.db_port),
                None => return,
            }
        };
        let data_dir = self.config.lock().db_data_dir.clone();
        let params = self.cache.get(primary_node_id, &host, port, "postgres", "postgres", &data_dir);
        let names_string = new_policy.to_names_string();

        if let Err(e) = self.db.set_synchronous_standby_names(&params, &names_string).await {
            warn!("failed to push synchronous_standby_names to node {primary_node_id}: {e}");
            return;
        }
        let commit_value = new_policy.commit_level.as_guc_value();
        if let Err(e) = self.db.set_synchronous_commit(&params, commit_value).await {
            warn!("failed to push synchronous_commit to node {primary_node_id}: {e}");
            return;
        }
        if let Err(e) = self.db.reload_config(&params).await {
            warn!("failed to reload config on node {primary_node_id} after sync policy push: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;
    use crate::consensus::InMemoryOracle;
    use crate::db::MockDbDriver;

    fn entry(name: &str, priority: u32) -> StandbyEntry {
        StandbyEntry {
            name: name.to_string(),
            priority,
            enabled: true,
            observed_is_sync: false,
            observed_lag_ms: 0,
        }
    }

    #[test]
    fn fixed_n_takes_the_first_n_by_priority() {
        let policy = SyncPolicy {
            mode: SyncMode::FixedN,
            commit_level: CommitLevel::RemoteWrite,
            num_sync_standbys: 2,
            min_sync: 0,
            max_sync: 0,
            standbys: vec![entry("n3", 2), entry("n2", 1), entry("n4", 3)],
        };
        assert_eq!(policy.to_names_string(), "n2,n3");
    }

    #[test]
    fn any_n_renders_the_any_clause() {
        let policy = SyncPolicy {
            mode: SyncMode::AnyN,
            commit_level: CommitLevel::RemoteWrite,
            num_sync_standbys: 0,
            min_sync: 2,
            max_sync: 3,
            standbys: vec![entry("n2", 0), entry("n3", 1), entry("n4", 2)],
        };
        assert_eq!(policy.to_names_string(), "ANY 2 (n2,n3,n4)");
    }

    #[test]
    fn off_mode_renders_empty() {
        let policy = SyncPolicy::default();
        assert_eq!(policy.to_names_string(), "");
    }

    #[tokio::test]
    async fn add_then_remove_restores_the_prior_names_string() {
        let cluster = Arc::new(Mutex::new(Cluster::new(1)));
        let mut config = Config::default();
        config.synchronous_replication = true;
        let cache = Arc::new(ConnectionCache::new());
        let mgr = SyncReplicationManager::new(
            cluster,
            Arc::new(Mutex::new(config)),
            Arc::new(MockDbDriver::new()),
            cache,
        );
        *mgr.policy.lock() = SyncPolicy {
            mode: SyncMode::FixedN,
            commit_level: CommitLevel::RemoteWrite,
            num_sync_standbys: 1,
            min_sync: 0,
            max_sync: 0,
            standbys: vec![entry("s2", 0)],
        };
        let before = mgr.policy().to_names_string();

        mgr.add(entry("s3", 1));
        assert_ne!(mgr.policy().to_names_string(), before);

        mgr.remove("s3");
        assert_eq!(mgr.policy().to_names_string(), before);

        // Removing a name that was never present is a harmless no-op.
        mgr.remove("s3");
        assert_eq!(mgr.policy().to_names_string(), before);

        // Adding the same name twice doesn't duplicate the entry.
        mgr.add(entry("s3", 1));
        mgr.add(entry("s3", 1));
        assert_eq!(mgr.policy().standbys.len(), 2);
    }

    #[tokio::test]
    async fn recompute_excludes_the_primary_and_unhealthy_standbys() {
        let mut cluster = Cluster::new(1);
        cluster.add(Node::new(1, "primary".into(), 5432, 7000, 7100)).unwrap();
        cluster.add(Node::new(2, "s2".into(), 5432, 7000, 7100)).unwrap();
        cluster.add(Node::new(3, "s3".into(), 5432, 7000, 7100)).unwrap();
        cluster.update_role(1, NodeRole::Primary).unwrap();
        cluster.update_role(2, NodeRole::Standby).unwrap();
        cluster.update_role(3, NodeRole::Standby).unwrap();
        cluster.update_health(1, 100).unwrap();
        cluster.update_health(2, 100).unwrap();
        cluster.update_health(3, 0).unwrap();
        let cluster = Arc::new(Mutex::new(cluster));

        let mut config = Config::default();
        config.synchronous_replication = true;
        config.sync_standby_min = 1;
        let config = Arc::new(Mutex::new(config));

        let db = Arc::new(MockDbDriver::new());
        db.set_status("primary", 5432, Default::default());
        let cache = Arc::new(ConnectionCache::new());
        let _oracle = InMemoryOracle::new();

        let mgr = SyncReplicationManager::new(cluster, config, db, cache);
        mgr.recompute(1).await;
        assert_eq!(mgr.policy().standbys.len(), 1);
        assert_eq!(mgr.policy().standbys[0].name, "s2");
    }
}
