//! The seam between this daemon and the database engine it supervises.
//! Every component talks to the database exclusively through `DbDriver`;
//! the default implementation drives the engine with spawned subprocesses
//! and short-timeout queries, never a shell string.

use crate::errors::RamdError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const QUERY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Default)]
pub struct DbStatus {
    pub is_running: bool,
    pub is_in_recovery: bool,
    pub accepts_connections: bool,
    pub current_wal_lsn: String,
    pub replication_lag_seconds: f64,
}

/// Connection parameters for one database instance. Cheap to clone so the
/// facade can pass it by value instead of holding a live borrow.
#[derive(Debug, Clone)]
pub struct ConnParams {
    pub host: String,
    pub port: u16,
    pub db_name: String,
    pub db_user: String,
    /// Filesystem path to the instance's data directory (`PGDATA`), the `-D`
    /// argument `pg_ctl`/`pg_basebackup` require. Distinct from `db_name`,
    /// the logical database `psql` connects to.
    pub data_dir: String,
}

/// The narrow interface every component uses to talk to a database engine.
/// A deterministic in-memory implementation exists purely for tests.
#[async_trait]
pub trait DbDriver: Send + Sync {
    async fn status(&self, params: &ConnParams) -> Result<DbStatus, RamdError>;
    async fn accepts_connections(&self, params: &ConnParams) -> Result<bool, RamdError>;
    async fn active_sessions_count(&self, params: &ConnParams) -> Result<u32, RamdError>;
    async fn promote(&self, params: &ConnParams) -> Result<(), RamdError>;
    async fn reload_config(&self, params: &ConnParams) -> Result<(), RamdError>;
    async fn set_recovery_target(
        &self,
        params: &ConnParams,
        primary_host: &str,
        primary_port: u16,
    ) -> Result<(), RamdError>;
    async fn set_synchronous_standby_names(
        &self,
        params: &ConnParams,
        value: &str,
    ) -> Result<(), RamdError>;
    async fn set_synchronous_commit(&self, params: &ConnParams, value: &str) -> Result<(), RamdError>;
    async fn stop_replication(&self, params: &ConnParams) -> Result<(), RamdError>;
    async fn base_backup_from(
        &self,
        params: &ConnParams,
        source_host: &str,
        source_port: u16,
    ) -> Result<(), RamdError>;
}

/// A connection handle kept in the cache. Connection state is re-probed
/// (via `status`) rather than held live, so "broken" simply means the last
/// probe failed.
#[derive(Debug, Clone)]
struct CachedHandle {
    params: ConnParams,
    last_known_good: bool,
}

/// Caches connection parameters per node so callers do not need to
/// reconstruct them on every cycle. Never returns a handle whose last probe
/// reported it broken; such entries are evicted on `mark_broken`.
pub struct ConnectionCache {
    entries: DashMap<i32, CachedHandle>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    pub fn get(
        &self,
        node_id: i32,
        host: &str,
        port: u16,
        db_name: &str,
        db_user: &str,
        data_dir: &str,
    ) -> ConnParams {
        let params = ConnParams {
            host: host.to_string(),
            port,
            db_name: db_name.to_string(),
            db_user: db_user.to_string(),
            data_dir: data_dir.to_string(),
        };
        self.entries.insert(
            node_id,
            CachedHandle {
                params: params.clone(),
                last_known_good: true,
            },
        );
        params
    }

    pub fn mark_broken(&self, node_id: i32) {
        if let Some(mut entry) = self.entries.get_mut(&node_id) {
            entry.last_known_good = false;
        }
    }

    pub fn is_known_good(&self, node_id: i32) -> bool {
        self.entries
            .get(&node_id)
            .map(|e| e.last_known_good)
            .unwrap_or(false)
    }
}

impl Default for ConnectionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Drives a PostgreSQL-compatible engine through `psql`, `pg_ctl`, and
/// `pg_basebackup`, invoked with explicit argument vectors and bounded
/// waits. No query or parameter is ever interpolated into a shell string.
pub struct ProcessDbDriver {
    pub psql_path: String,
    pub pg_ctl_path: String,
    pub pg_basebackup_path: String,
}

impl ProcessDbDriver {
    pub fn new(bin_dir: &str) -> Self {
        Self {
            psql_path: format!("{bin_dir}/psql"),
            pg_ctl_path: format!("{bin_dir}/pg_ctl"),
            pg_basebackup_path: format!("{bin_dir}/pg_basebackup"),
        }
    }

    async fn psql_query(&self, params: &ConnParams, sql: &str) -> Result<String, RamdError> {
        let fut = Command::new(&self.psql_path)
            .args([
                "-h",
                &params.host,
                "-p",
                &params.port.to_string(),
                "-U",
                &params.db_user,
                "-d",
                &params.db_name,
                "-tAc",
                sql,
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = timeout(QUERY_TIMEOUT, fut)
            .await
            .map_err(|_| RamdError::DbTimeout(QUERY_TIMEOUT))?
            .map_err(|e| RamdError::DbConnect(e.to_string()))?;

        if !output.status.success() {
            return Err(RamdError::DbQuery(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn pg_ctl(&self, data_dir: &str, args: &[&str]) -> Result<(), RamdError> {
        let mut full_args: Vec<&str> = vec!["-D", data_dir];
        full_args.extend_from_slice(args);
        let fut = Command::new(&self.pg_ctl_path)
            .args(&full_args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = timeout(CONNECT_TIMEOUT * 5, fut)
            .await
            .map_err(|_| RamdError::DbTimeout(CONNECT_TIMEOUT * 5))?
            .map_err(|e| RamdError::DbConnect(e.to_string()))?;

        if !output.status.success() {
            return Err(RamdError::DbQuery(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl DbDriver for ProcessDbDriver {
    async fn status(&self, params: &ConnParams) -> Result<DbStatus, RamdError> {
        let recovery = self.psql_query(params, "SELECT pg_is_in_recovery()").await?;
        let is_in_recovery = recovery == "t";
        let lsn_query = if is_in_recovery {
            "SELECT pg_last_wal_replay_lsn()"
        } else {
            "SELECT pg_current_wal_lsn()"
        };
        let lsn = self.psql_query(params, lsn_query).await.unwrap_or_default();
        let lag = if is_in_recovery {
            self.psql_query(
                params,
                "SELECT COALESCE(EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp())), 0)",
            )
            .await
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0)
        } else {
            0.0
        };
        Ok(DbStatus {
            is_running: true,
            is_in_recovery,
            accepts_connections: true,
            current_wal_lsn: lsn,
            replication_lag_seconds: lag,
        })
    }

    async fn accepts_connections(&self, params: &ConnParams) -> Result<bool, RamdError> {
        Ok(self.psql_query(params, "SELECT 1").await.is_ok())
    }

    async fn active_sessions_count(&self, params: &ConnParams) -> Result<u32, RamdError> {
        let raw = self
            .psql_query(
                params,
                "SELECT count(*) FROM pg_stat_activity WHERE pid <> pg_backend_pid()",
            )
            .await?;
        raw.parse()
            .map_err(|_| RamdError::DbQuery("unexpected session count output".into()))
    }

    async fn promote(&self, params: &ConnParams) -> Result<(), RamdError> {
        self.pg_ctl(&params.data_dir, &["promote"]).await
    }

    async fn reload_config(&self, params: &ConnParams) -> Result<(), RamdError> {
        self.psql_query(params, "SELECT pg_reload_conf()").await?;
        Ok(())
    }

    async fn set_recovery_target(
        &self,
        params: &ConnParams,
        primary_host: &str,
        primary_port: u16,
    ) -> Result<(), RamdError> {
        let sql = format!(
            "ALTER SYSTEM SET primary_conninfo = 'host={primary_host} port={primary_port}'"
        );
        self.psql_query(params, &sql).await?;
        self.reload_config(params).await
    }

    async fn set_synchronous_standby_names(
        &self,
        params: &ConnParams,
        value: &str,
    ) -> Result<(), RamdError> {
        let sql = format!("ALTER SYSTEM SET synchronous_standby_names = '{value}'");
        self.psql_query(params, &sql).await?;
        self.reload_config(params).await
    }

    async fn set_synchronous_commit(&self, params: &ConnParams, value: &str) -> Result<(), RamdError> {
        let sql = format!("ALTER SYSTEM SET synchronous_commit = '{value}'");
        self.psql_query(params, &sql).await?;
        self.reload_config(params).await
    }

    async fn stop_replication(&self, params: &ConnParams) -> Result<(), RamdError> {
        self.psql_query(params, "SELECT pg_wal_replay_pause()").await?;
        Ok(())
    }

    async fn base_backup_from(
        &self,
        params: &ConnParams,
        source_host: &str,
        source_port: u16,
    ) -> Result<(), RamdError> {
        let fut = Command::new(&self.pg_basebackup_path)
            .args([
                "-h",
                source_host,
                "-p",
                &source_port.to_string(),
                "-D",
                &params.data_dir,
                "-U",
                &params.db_user,
                "-R",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = timeout(Duration::from_secs(300), fut)
            .await
            .map_err(|_| RamdError::DbTimeout(Duration::from_secs(300)))?
            .map_err(|e| RamdError::DbConnect(e.to_string()))?;

        if !output.status.success() {
            return Err(RamdError::DbQuery(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

/// Deterministic in-memory stand-in used by tests.
pub struct MockDbDriver {
    pub statuses: DashMap<String, DbStatus>,
    pub fail_promote_for: DashMap<String, ()>,
    pub session_counts: DashMap<String, u32>,
}

impl MockDbDriver {
    pub fn new() -> Self {
        Self {
            statuses: DashMap::new(),
            fail_promote_for: DashMap::new(),
            session_counts: DashMap::new(),
        }
    }

    fn key(params: &ConnParams) -> String {
        format!("{}:{}", params.host, params.port)
    }

    pub fn set_status(&self, host: &str, port: u16, status: DbStatus) {
        self.statuses.insert(format!("{host}:{port}"), status);
    }

    /// Overrides the active-session count reported for `host:port`. Absent
    /// an override, `active_sessions_count` reports 1 (just the caller).
    pub fn set_session_count(&self, host: &str, port: u16, count: u32) {
        self.session_counts.insert(format!("{host}:{port}"), count);
    }
}

impl Default for MockDbDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DbDriver for MockDbDriver {
    async fn status(&self, params: &ConnParams) -> Result<DbStatus, RamdError> {
        self.statuses
            .get(&Self::key(params))
            .map(|s| s.clone())
            .ok_or_else(|| RamdError::DbConnect(format!("no mock status for {}", Self::key(params))))
    }

    async fn accepts_connections(&self, params: &ConnParams) -> Result<bool, RamdError> {
        Ok(self.status(params).await?.accepts_connections)
    }

    async fn active_sessions_count(&self, params: &ConnParams) -> Result<u32, RamdError> {
        Ok(self
            .session_counts
            .get(&Self::key(params))
            .map(|c| *c)
            .unwrap_or(1))
    }

    async fn promote(&self, params: &ConnParams) -> Result<(), RamdError> {
        if self.fail_promote_for.contains_key(&Self::key(params)) {
            return Err(RamdError::PromotionFailed(0, "mock failure".into()));
        }
        if let Some(mut entry) = self.statuses.get_mut(&Self::key(params)) {
            entry.is_in_recovery = false;
        }
        Ok(())
    }

    async fn reload_config(&self, _params: &ConnParams) -> Result<(), RamdError> {
        Ok(())
    }

    async fn set_recovery_target(
        &self,
        _params: &ConnParams,
        _primary_host: &str,
        _primary_port: u16,
    ) -> Result<(), RamdError> {
        Ok(())
    }

    async fn set_synchronous_standby_names(
        &self,
        _params: &ConnParams,
        _value: &str,
    ) -> Result<(), RamdError> {
        Ok(())
    }

    async fn set_synchronous_commit(&self, _params: &ConnParams, _value: &str) -> Result<(), RamdError> {
        Ok(())
    }

    async fn stop_replication(&self, _params: &ConnParams) -> Result<(), RamdError> {
        Ok(())
    }

    async fn base_backup_from(
        &self,
        _params: &ConnParams,
        _source_host: &str,
        _source_port: u16,
    ) -> Result<(), RamdError> {
        Ok(())
    }
}

pub type SharedDbDriver = Arc<dyn DbDriver>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_cache_never_reports_a_broken_handle_as_good() {
        let cache = ConnectionCache::new();
        cache.get(1, "n1", 5432, "postgres", "postgres", "/var/lib/postgresql/data");
        assert!(cache.is_known_good(1));
        cache.mark_broken(1);
        assert!(!cache.is_known_good(1));
    }
}
