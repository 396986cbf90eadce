//! Query interface to the external consensus layer that names the cluster
//! leader. This daemon never implements consensus itself; it only asks.

use crate::errors::RamdError;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct OracleMember {
    pub node_id: i32,
    pub host: String,
}

/// The narrow set of queries this daemon needs from a consensus backend.
#[async_trait]
pub trait ConsensusOracle: Send + Sync {
    async fn leader_id(&self) -> Result<i32, RamdError>;
    async fn term(&self) -> Result<u64, RamdError>;
    async fn is_leader(&self, node_id: i32) -> Result<bool, RamdError>;
    async fn cluster_healthy(&self) -> Result<bool, RamdError>;
    async fn members(&self) -> Result<Vec<OracleMember>, RamdError>;
    async fn add_node(&self, node_id: i32, host: &str) -> Result<(), RamdError>;
    async fn remove_node(&self, node_id: i32) -> Result<(), RamdError>;
    async fn append_log(&self, entry: &str) -> Result<(), RamdError>;
}

/// Speaks the documented small JSON REST contract against an HTTP-based
/// consensus backend, via the same HTTP client crate the rest of the pack
/// already depends on for outbound calls.
pub struct HttpConsensusOracle {
    client: reqwest::Client,
    base_url: String,
}

impl HttpConsensusOracle {
    pub fn new(base_url: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("reqwest client must build with static config");
        Self { client, base_url }
    }
}

#[async_trait]
impl ConsensusOracle for HttpConsensusOracle {
    async fn leader_id(&self) -> Result<i32, RamdError> {
        #[derive(Deserialize)]
        struct Resp {
            leader_id: i32,
        }
        let resp: Resp = self
            .client
            .get(format!("{}/leader", self.base_url))
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.leader_id)
    }

    async fn term(&self) -> Result<u64, RamdError> {
        #[derive(Deserialize)]
        struct Resp {
            term: u64,
        }
        let resp: Resp = self
            .client
            .get(format!("{}/term", self.base_url))
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.term)
    }

    async fn is_leader(&self, node_id: i32) -> Result<bool, RamdError> {
        Ok(self.leader_id().await? == node_id)
    }

    async fn cluster_healthy(&self) -> Result<bool, RamdError> {
        #[derive(Deserialize)]
        struct Resp {
            healthy: bool,
        }
        let resp: Resp = self
            .client
            .get(format!("{}/healthy", self.base_url))
            .send()
            .await?
            .json()
            .await?;
        Ok(resp.healthy)
    }

    async fn members(&self) -> Result<Vec<OracleMember>, RamdError> {
        let resp: Vec<OracleMember> = self
            .client
            .get(format!("{}/nodes", self.base_url))
            .send()
            .await?
            .json()
            .await?;
        Ok(resp)
    }

    async fn add_node(&self, node_id: i32, host: &str) -> Result<(), RamdError> {
        self.client
            .post(format!("{}/nodes", self.base_url))
            .json(&serde_json::json!({ "node_id": node_id, "host": host }))
            .send()
            .await?;
        Ok(())
    }

    async fn remove_node(&self, node_id: i32) -> Result<(), RamdError> {
        self.client
            .delete(format!("{}/nodes/{}", self.base_url, node_id))
            .send()
            .await?;
        Ok(())
    }

    async fn append_log(&self, entry: &str) -> Result<(), RamdError> {
        self.client
            .post(format!("{}/log", self.base_url))
            .json(&serde_json::json!({ "entry": entry }))
            .send()
            .await?;
        Ok(())
    }
}

/// In-memory oracle double used by tests, and as the fallback
/// implementation when no consensus endpoint is configured.
#[derive(Default)]
pub struct InMemoryOracle {
    inner: Mutex<InMemoryOracleState>,
}

#[derive(Default)]
struct InMemoryOracleState {
    leader_id: i32,
    term: u64,
    healthy: bool,
    members: Vec<OracleMember>,
    available: bool,
}

impl InMemoryOracle {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(InMemoryOracleState {
                leader_id: -1,
                term: 0,
                healthy: true,
                members: Vec::new(),
                available: true,
            }),
        }
    }

    pub fn set_leader(&self, node_id: i32) {
        let mut inner = self.inner.lock();
        inner.leader_id = node_id;
        inner.term += 1;
    }

    pub fn set_available(&self, available: bool) {
        self.inner.lock().available = available;
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.inner.lock().healthy = healthy;
    }
}

#[async_trait]
impl ConsensusOracle for InMemoryOracle {
    async fn leader_id(&self) -> Result<i32, RamdError> {
        let inner = self.inner.lock();
        if !inner.available {
            return Err(RamdError::ConsensusUnavailable("oracle offline".into()));
        }
        Ok(inner.leader_id)
    }

    async fn term(&self) -> Result<u64, RamdError> {
        let inner = self.inner.lock();
        if !inner.available {
            return Err(RamdError::ConsensusUnavailable("oracle offline".into()));
        }
        Ok(inner.term)
    }

    async fn is_leader(&self, node_id: i32) -> Result<bool, RamdError> {
        Ok(self.leader_id().await? == node_id)
    }

    async fn cluster_healthy(&self) -> Result<bool, RamdError> {
        let inner = self.inner.lock();
        if !inner.available {
            return Err(RamdError::ConsensusUnavailable("oracle offline".into()));
        }
        Ok(inner.healthy)
    }

    async fn members(&self) -> Result<Vec<OracleMember>, RamdError> {
        Ok(self.inner.lock().members.clone())
    }

    async fn add_node(&self, node_id: i32, host: &str) -> Result<(), RamdError> {
        self.inner.lock().members.push(OracleMember {
            node_id,
            host: host.to_string(),
        });
        Ok(())
    }

    async fn remove_node(&self, node_id: i32) -> Result<(), RamdError> {
        self.inner.lock().members.retain(|m| m.node_id != node_id);
        Ok(())
    }

    async fn append_log(&self, _entry: &str) -> Result<(), RamdError> {
        Ok(())
    }
}

pub type SharedOracle = Arc<dyn ConsensusOracle>;

/// Thin wrapper giving the rest of the daemon a stable call surface even
/// when the oracle is temporarily unreachable.
pub struct ConsensusFacade {
    oracle: SharedOracle,
}

impl ConsensusFacade {
    pub fn new(oracle: SharedOracle) -> Self {
        Self { oracle }
    }

    pub async fn leader_id(&self) -> Result<i32, RamdError> {
        self.oracle.leader_id().await
    }

    pub async fn term(&self) -> Result<u64, RamdError> {
        self.oracle.term().await
    }

    pub async fn is_leader(&self, node_id: i32) -> Result<bool, RamdError> {
        self.oracle.is_leader(node_id).await
    }

    pub async fn cluster_healthy(&self) -> Result<bool, RamdError> {
        self.oracle.cluster_healthy().await
    }

    pub async fn members(&self) -> Result<Vec<OracleMember>, RamdError> {
        self.oracle.members().await
    }

    pub async fn add_node(&self, node_id: i32, host: &str) -> Result<(), RamdError> {
        self.oracle.add_node(node_id, host).await
    }

    pub async fn remove_node(&self, node_id: i32) -> Result<(), RamdError> {
        self.oracle.remove_node(node_id).await
    }

    pub async fn append_log(&self, entry: &str) -> Result<(), RamdError> {
        self.oracle.append_log(entry).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unavailable_oracle_reports_distinct_error() {
        let oracle = InMemoryOracle::new();
        oracle.set_available(false);
        let facade = ConsensusFacade::new(Arc::new(oracle));
        assert!(matches!(
            facade.leader_id().await,
            Err(RamdError::ConsensusUnavailable(_))
        ));
    }
}
