//! Property-based tests for invariants that must hold for any input, not
//! just the handful of cases exercised by unit tests.

use proptest::prelude::*;
use ramd::cluster::{Cluster, Node, NodeRole};
use ramd::config::Config;
use ramd::sync_replication::{CommitLevel, SyncMode, SyncPolicy, StandbyEntry};

fn arb_wal_positions() -> impl Strategy<Value = Vec<u64>> {
    prop::collection::vec(0u64..10_000, 2..8)
}

proptest! {
    /// Selecting the new primary from any set of healthy standbys is
    /// deterministic: running it twice against the same cluster state always
    /// names the same node.
    #[test]
    fn standby_selection_is_deterministic(wal_positions in arb_wal_positions()) {
        let mut cluster = Cluster::new(1);
        cluster.add(Node::new(1, "primary".into(), 5432, 7000, 7100)).unwrap();
        cluster.update_role(1, NodeRole::Primary).unwrap();
        cluster.update_health(1, 100).unwrap();

        for (i, wal) in wal_positions.iter().enumerate() {
            let id = (i as i32) + 2;
            cluster.add(Node::new(id, format!("n{id}"), 5432, 7000, 7100)).unwrap();
            cluster.update_role(id, NodeRole::Standby).unwrap();
            cluster.update_health(id, 100).unwrap();
            cluster.find_mut(id).unwrap().wal_position = *wal;
        }

        let pick = |c: &Cluster| {
            c.nodes()
                .filter(|n| n.healthy && n.role == NodeRole::Standby)
                .max_by(|a, b| a.wal_position.cmp(&b.wal_position).then(b.node_id.cmp(&a.node_id)))
                .map(|n| n.node_id)
        };

        let first = pick(&cluster);
        let second = pick(&cluster);
        prop_assert_eq!(first, second);
        prop_assert!(first.is_some());
    }

    /// At most one node can hold the `Primary` role at any time: assigning a
    /// new primary always demotes whatever the cluster previously recorded
    /// as primary, regardless of how many reassignments happen.
    #[test]
    fn at_most_one_primary_holds_after_any_sequence_of_reassignments(
        assignments in prop::collection::vec(1i32..=5, 1..20)
    ) {
        let mut cluster = Cluster::new(1);
        for id in 1..=5 {
            cluster.add(Node::new(id, format!("n{id}"), 5432, 7000, 7100)).unwrap();
        }
        for id in assignments {
            cluster.update_role(id, NodeRole::Primary).unwrap();
            let primaries = cluster.nodes().filter(|n| n.role == NodeRole::Primary).count();
            prop_assert_eq!(primaries, 1);
        }
    }

    /// `to_names_string` never panics and, whenever the mode is not `Off`
    /// and at least one standby is enabled, produces a non-empty value
    /// containing every enabled standby's name.
    #[test]
    fn sync_policy_rendering_is_total(
        names in prop::collection::vec("[a-z][a-z0-9]{0,6}", 1..6),
        min_sync in 0usize..6,
        use_any in any::<bool>(),
    ) {
        let standbys: Vec<StandbyEntry> = names
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
        let policy = SyncPolicy {
            mode: if use_any { SyncMode::AnyN } else { SyncMode::FixedN },
            commit_level: CommitLevel::RemoteWrite,
            num_sync_standbys: min_sync.min(standbys.len()).max(1),
            min_sync,
            max_sync: standbys.len(),
            standbys,
        };
        let rendered = policy.to_names_string();
        prop_assert!(!rendered.is_empty());
        if use_any {
            prop_assert!(rendered.starts_with("ANY"));
        }
    }

    /// Serializing a `Config` to key=value text and parsing it back always
    /// reproduces an equal config, for any combination of the fields a
    /// reload is allowed to change.
    #[test]
    fn config_round_trips_through_kv_text(
        monitor_interval_ms in 1u64..60_000,
        failover_retry_max in 0u32..10,
        auto_failover_enabled in any::<bool>(),
        sync_standby_names in prop::collection::vec("[a-z][a-z0-9]{0,5}", 0..4),
    ) {
        let mut cfg = Config::default();
        cfg.monitor_interval_ms = monitor_interval_ms;
        cfg.failover_retry_max = failover_retry_max;
        cfg.auto_failover_enabled = auto_failover_enabled;
        cfg.sync_standby_names = sync_standby_names;

        let text = cfg.to_kv_string();
        let reparsed = Config::from_kv_str(&text).unwrap();
        prop_assert_eq!(cfg, reparsed);
    }
}
