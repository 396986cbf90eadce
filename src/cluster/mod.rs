//! The in-memory cluster topology: the set of known nodes, their roles and
//! health, and the quorum view derived from them.

use crate::consensus::ConsensusFacade;
use crate::errors::RamdError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Upper bound on cluster membership. A fixed-capacity array keeps node
/// lookups lock-free-adjacent and avoids a heap allocation per node.
pub const MAX_NODES: usize = 16;

/// Below this score a node is considered unhealthy regardless of role.
pub const HEALTH_THRESHOLD: u8 = 50;

/// A node is dropped from the healthy set once this many milliseconds pass
/// without an update from the health monitor.
pub const NODE_TIMEOUT_MS: u64 = 300_000;

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Unknown,
    Primary,
    Standby,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Unknown,
    Primary,
    Standby,
    Failed,
    Recovering,
    Leader,
    Follower,
}

/// A single cluster member, identified by a stable small integer id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub node_id: i32,
    pub hostname: String,
    pub db_port: u16,
    pub consensus_port: u16,
    pub kv_port: u16,
    pub role: NodeRole,
    pub state: NodeState,
    pub healthy: bool,
    pub health_score: u8,
    pub last_seen_ms: u64,
    pub state_changed_at_ms: u64,
    pub replication_lag_ms: u64,
    pub wal_position: u64,
}

impl Node {
    pub fn new(node_id: i32, hostname: String, db_port: u16, consensus_port: u16, kv_port: u16) -> Self {
        let now = now_ms();
        Self {
            node_id,
            hostname,
            db_port,
            consensus_port,
            kv_port,
            role: NodeRole::Unknown,
            state: NodeState::Unknown,
            healthy: false,
            health_score: 0,
            last_seen_ms: now,
            state_changed_at_ms: now,
            replication_lag_ms: 0,
            wal_position: 0,
        }
    }

    pub fn set_state(&mut self, state: NodeState) {
        if self.state != state {
            self.state = state;
            self.state_changed_at_ms = now_ms();
        }
    }

    pub fn set_health(&mut self, score: u8) {
        self.health_score = score;
        self.healthy = score >= HEALTH_THRESHOLD;
        self.last_seen_ms = now_ms();
    }
}

/// The in-memory cluster: a fixed-capacity slot array plus a small amount of
/// derived bookkeeping. Exclusively owns its `Node`s; every other component
/// references them by `node_id`.
pub struct Cluster {
    slots: [Option<Node>; MAX_NODES],
    node_count: usize,
    pub local_node_id: i32,
    pub primary_node_id: i32,
    pub leader_node_id: i32,
    pub in_failover: bool,
    pub last_topology_change_ms: u64,
    /// Monotonic epoch bumped on every confirmed topology change; used to
    /// order promotions and reject stale reconfiguration attempts.
    current_epoch: AtomicU64,
}

impl Cluster {
    pub fn new(local_node_id: i32) -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            node_count: 0,
            local_node_id,
            primary_node_id: -1,
            leader_node_id: -1,
            in_failover: false,
            last_topology_change_ms: now_ms(),
            current_epoch: AtomicU64::new(0),
        }
    }

    pub fn node_count(&self) -> usize {
        self.node_count
    }

    pub fn next_epoch(&self) -> u64 {
        self.current_epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn add(&mut self, node: Node) -> Result<(), RamdError> {
        if self.find(node.node_id).is_some() {
            return Err(RamdError::Conflict(format!(
                "node {} already present",
                node.node_id
            )));
        }
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or_else(|| RamdError::Conflict("cluster is at capacity".into()))?;
        *slot = Some(node);
        self.update_topology();
        Ok(())
    }

    pub fn remove(&mut self, node_id: i32) -> Option<Node> {
        let removed = self
            .slots
            .iter_mut()
            .find(|s| s.as_ref().map(|n| n.node_id) == Some(node_id))
            .and_then(|s| s.take());
        if removed.is_some() {
            self.update_topology();
        }
        removed
    }

    pub fn find(&self, node_id: i32) -> Option<&Node> {
        self.slots
            .iter()
            .flatten()
            .find(|n| n.node_id == node_id)
    }

    pub fn find_mut(&mut self, node_id: i32) -> Option<&mut Node> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|n| n.node_id == node_id)
    }

    pub fn local(&self) -> Option<&Node> {
        self.find(self.local_node_id)
    }

    pub fn primary(&self) -> Option<&Node> {
        if self.primary_node_id < 0 {
            return None;
        }
        self.find(self.primary_node_id)
    }

    pub fn leader(&self) -> Option<&Node> {
        if self.leader_node_id < 0 {
            return None;
        }
        self.find(self.leader_node_id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.slots.iter().flatten()
    }

    pub fn count_healthy(&self) -> usize {
        self.nodes().filter(|n| n.healthy).count()
    }

    pub fn count_standbys(&self) -> usize {
        self.nodes().filter(|n| n.role == NodeRole::Standby).count()
    }

    pub fn has_primary(&self) -> bool {
        self.primary_node_id >= 0
    }

    pub fn has_leader(&self) -> bool {
        self.leader_node_id >= 0
    }

    pub fn update_role(&mut self, node_id: i32, role: NodeRole) -> Result<(), RamdError> {
        if self.find(node_id).is_none() {
            return Err(RamdError::NotFound(format!("node {node_id}")));
        }
        if role == NodeRole::Primary {
            let previous_primary = self.primary_node_id;
            self.primary_node_id = node_id;
            if previous_primary >= 0 && previous_primary != node_id {
                if let Some(old) = self.find_mut(previous_primary) {
                    old.role = NodeRole::Standby;
                }
            }
        } else if self.primary_node_id == node_id {
            self.primary_node_id = -1;
        }
        self.find_mut(node_id).unwrap().role = role;
        Ok(())
    }

    pub fn update_state(&mut self, node_id: i32, state: NodeState) -> Result<(), RamdError> {
        let node = self
            .find_mut(node_id)
            .ok_or_else(|| RamdError::NotFound(format!("node {node_id}")))?;
        node.set_state(state);
        Ok(())
    }

    pub fn update_health(&mut self, node_id: i32, score: u8) -> Result<(), RamdError> {
        let node = self
            .find_mut(node_id)
            .ok_or_else(|| RamdError::NotFound(format!("node {node_id}")))?;
        node.set_health(score);
        Ok(())
    }

    /// Recomputes the live node count and stamps the topology-change time.
    pub fn update_topology(&mut self) {
        self.node_count = self.slots.iter().flatten().count();
        self.last_topology_change_ms = now_ms();
    }

    /// Marks nodes unseen for longer than `NODE_TIMEOUT_MS` as unhealthy.
    /// Returns true if any node's health flag flipped.
    pub fn detect_topology_change(&mut self) -> bool {
        let now = now_ms();
        let mut changed = false;
        for node in self.slots.iter_mut().flatten() {
            if node.healthy && now.saturating_sub(node.last_seen_ms) > NODE_TIMEOUT_MS {
                node.healthy = false;
                changed = true;
            }
        }
        if changed {
            self.last_topology_change_ms = now;
        }
        changed
    }

    /// Installs the local node as the sole primary. Valid only on an empty
    /// cluster; calling it twice is rejected so operators cannot silently
    /// re-bootstrap a running cluster.
    pub fn bootstrap_primary(&mut self, node: Node) -> Result<(), RamdError> {
        if self.node_count != 0 {
            return Err(RamdError::AlreadyBootstrapped);
        }
        let node_id = node.node_id;
        self.add(node)?;
        self.update_role(node_id, NodeRole::Primary)?;
        self.update_state(node_id, NodeState::Primary)?;
        self.update_health(node_id, 100)?;
        self.leader_node_id = node_id;
        Ok(())
    }

    /// Quorum holds if the consensus oracle names a leader or reports the
    /// cluster healthy; only when the oracle itself is unavailable do we fall
    /// back to a strict majority of locally observed healthy nodes. This
    /// ordering is load-bearing: do not reverse it.
    pub async fn has_quorum(&self, consensus: &ConsensusFacade) -> bool {
        match consensus.leader_id().await {
            Ok(id) if id > 0 => return true,
            _ => {}
        }
        match consensus.cluster_healthy().await {
            Ok(true) => return true,
            Ok(false) => {}
            Err(_) => {}
        }
        self.node_count > 0 && self.count_healthy() * 2 > self.node_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i32) -> Node {
        Node::new(id, format!("n{id}"), 5432, 7000, 7100)
    }

    #[test]
    fn bootstrap_then_rebootstrap_fails() {
        let mut c = Cluster::new(1);
        c.bootstrap_primary(node(1)).unwrap();
        assert_eq!(c.node_count(), 1);
        assert_eq!(c.primary_node_id, 1);
        assert!(matches!(
            c.bootstrap_primary(node(1)),
            Err(RamdError::AlreadyBootstrapped)
        ));
    }

    #[test]
    fn add_beyond_capacity_is_rejected() {
        let mut c = Cluster::new(1);
        for i in 1..=MAX_NODES as i32 {
            c.add(node(i)).unwrap();
        }
        assert!(c.add(node(MAX_NODES as i32 + 1)).is_err());
    }

    #[test]
    fn remove_compacts_and_updates_topology() {
        let mut c = Cluster::new(1);
        c.add(node(1)).unwrap();
        c.add(node(2)).unwrap();
        assert_eq!(c.node_count(), 2);
        c.remove(1);
        assert_eq!(c.node_count(), 1);
        assert!(c.find(1).is_none());
        assert!(c.find(2).is_some());
    }

    #[test]
    fn at_most_one_primary() {
        let mut c = Cluster::new(1);
        c.add(node(1)).unwrap();
        c.add(node(2)).unwrap();
        c.update_role(1, NodeRole::Primary).unwrap();
        assert_eq!(c.primary_node_id, 1);
        c.update_role(2, NodeRole::Primary).unwrap();
        assert_eq!(c.primary_node_id, 2);
        assert_eq!(c.nodes().filter(|n| n.role == NodeRole::Primary).count(), 1);
    }

    #[test]
    fn health_threshold_matches_flag() {
        let mut c = Cluster::new(1);
        c.add(node(1)).unwrap();
        c.update_health(1, HEALTH_THRESHOLD).unwrap();
        assert!(c.find(1).unwrap().healthy);
        c.update_health(1, HEALTH_THRESHOLD - 1).unwrap();
        assert!(!c.find(1).unwrap().healthy);
    }
}
