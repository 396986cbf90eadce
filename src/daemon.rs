//! The top-level owning struct: wires every component together once at
//! startup and spawns their long-running loops into a single `JoinSet`,
//! the same cooperative-shutdown shape the teacher uses for its own
//! warden and connection-accept loops.

use crate::api::{self, AppState};
use crate::cluster::{Cluster, Node};
use crate::config::{Config, ReloadHandlers};
use crate::consensus::{ConsensusFacade, HttpConsensusOracle};
use crate::db::{ConnectionCache, ProcessDbDriver, SharedDbDriver};
use crate::failover::FailoverEngine;
use crate::maintenance::MaintenanceManager;
use crate::monitor::HealthMonitor;
use crate::sync_replication::SyncReplicationManager;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub struct Daemon {
    config_path: String,
    cluster: Arc<Mutex<Cluster>>,
    config: Arc<Mutex<Config>>,
    db: SharedDbDriver,
    cache: Arc<ConnectionCache>,
    consensus: Arc<ConsensusFacade>,
    monitor: Arc<HealthMonitor>,
    failover: Arc<FailoverEngine>,
    sync_replication: Arc<SyncReplicationManager>,
    maintenance: Arc<MaintenanceManager>,
    reload_handlers: Arc<ReloadHandlers>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Daemon {
    /// Loads and validates configuration, constructs the Cluster (bootstrapped
    /// with just the local node; topology grows as peers are added or
    /// discovered via the consensus layer), constructs the `DbDriver`/
    /// `ConsensusOracle` implementations, and assembles the Failover Engine,
    /// Sync-Replication Manager, and Maintenance Manager around shared `Arc`
    /// handles.
    pub fn init(config_path: &str, log_reload: Arc<crate::LogReloadHandle>) -> Result<Arc<Self>> {
        let config = Config::from_file(config_path).context("loading configuration")?;

        let mut cluster = Cluster::new(config.node_id);
        let local = Node::new(
            config.node_id,
            config.hostname.clone(),
            config.db_port,
            config.consensus_port,
            config.kv_port,
        );
        cluster
            .add(local)
            .context("registering local node in cluster model")?;

        let db: SharedDbDriver = Arc::new(ProcessDbDriver::new(&config.db_bin_dir));
        let cache = Arc::new(ConnectionCache::new());
        let oracle = Arc::new(HttpConsensusOracle::new(config.consensus_endpoint.clone()));
        let consensus = Arc::new(ConsensusFacade::new(oracle));

        let cluster = Arc::new(Mutex::new(cluster));
        let config = Arc::new(Mutex::new(config));

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(HealthMonitor::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
            consensus.clone(),
            events_tx,
        ));

        let sync_replication = Arc::new(SyncReplicationManager::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
        ));
        let maintenance = Arc::new(MaintenanceManager::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
        ));
        let failover = Arc::new(FailoverEngine::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
            consensus.clone(),
            sync_replication.clone(),
            maintenance.clone(),
        ));

        let (shutdown_tx, _) = broadcast::channel(4);
        let reload_handlers = Arc::new(ReloadHandlers { log_reload });

        let daemon = Arc::new(Self {
            config_path: config_path.to_string(),
            cluster,
            config,
            db,
            cache,
            consensus,
            monitor,
            failover,
            sync_replication,
            maintenance,
            reload_handlers,
            shutdown_tx,
        });

        // The event channel is consumed by the failover engine's own run
        // loop, spawned from `run` alongside everything else.
        daemon.spawn_event_bridge(events_rx);

        Ok(daemon)
    }

    fn spawn_event_bridge(&self, events_rx: mpsc::UnboundedReceiver<crate::monitor::MonitorEvent>) {
        let failover = self.failover.clone();
        let shutdown = self.shutdown_tx.subscribe();
        tokio::spawn(failover.run(events_rx, shutdown));
    }

    /// Spawns the health-monitor loop, the control-API listener, a
    /// reload-signal handler (`SIGHUP`), and a termination handler
    /// (`SIGTERM`/`SIGINT`) into one `JoinSet`. If any task exits before
    /// shutdown was requested, that is logged as a critical failure — the
    /// same "a background task exiting is itself the error" convention the
    /// teacher's own long-running loops follow.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut tasks: JoinSet<(&'static str, Option<std::io::Error>)> = JoinSet::new();

        {
            let monitor = self.monitor.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.spawn(async move {
                monitor.run(shutdown).await;
                ("health monitor", None)
            });
        }

        {
            let bind: SocketAddr = {
                let config = self.config.lock();
                format!("{}:{}", config.http_bind, config.http_port)
                    .parse()
                    .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8008)))
            };
            let state = AppState {
                cluster: self.cluster.clone(),
                config: self.config.clone(),
                db: self.db.clone(),
                cache: self.cache.clone(),
                consensus: self.consensus.clone(),
                failover: self.failover.clone(),
                sync_replication: self.sync_replication.clone(),
                maintenance: self.maintenance.clone(),
                reload_handlers: self.reload_handlers.clone(),
                config_path: self.config_path.clone(),
            };
            let shutdown = self.shutdown_tx.subscribe();
            tasks.spawn(async move {
                match api::serve(state, bind, shutdown).await {
                    Ok(()) => ("control API listener", None),
                    Err(e) => {
                        error!("control API listener exited with error: {e}");
                        ("control API listener", Some(e))
                    }
                }
            });
        }

        {
            let daemon = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            tasks.spawn(async move {
                let mut sighup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(s) => s,
                    Err(e) => {
                        error!("failed to install SIGHUP handler: {e}");
                        return ("reload-signal handler", None);
                    }
                };
                loop {
                    tokio::select! {
                        _ = sighup.recv() => {
                            if let Err(e) = daemon.reload_config().await {
                                warn!("config reload via SIGHUP failed: {e}");
                            }
                        }
                        _ = shutdown.recv() => break,
                    }
                }
                ("reload-signal handler", None)
            });
        }

        {
            let shutdown_tx = self.shutdown_tx.clone();
            tasks.spawn(async move {
                await_termination_signal().await;
                info!("termination signal received, shutting down");
                let _ = shutdown_tx.send(());
                ("termination handler", None)
            });
        }

        let mut bind_failure = None;
        match tasks.join_next().await {
            Some(Ok((name, Some(io_err)))) => {
                error!("task '{name}' exited with a bind error, initiating shutdown");
                bind_failure = Some(io_err);
            }
            Some(Ok((name, None))) => {
                info!("task '{name}' exited, initiating shutdown");
            }
            Some(Err(e)) => {
                error!("a daemon task panicked: {e}");
            }
            None => {}
        }
        let _ = self.shutdown_tx.send(());

        while tasks.join_next().await.is_some() {}

        if let Some(io_err) = bind_failure {
            return Err(io_err).context("control API failed to bind");
        }
        Ok(())
    }

    /// Assembles a `Daemon` from already-constructed components instead of
    /// loading configuration from disk and dialing real database/consensus
    /// endpoints. For integration tests driving the daemon through its HTTP
    /// control surface with a `MockDbDriver` and `InMemoryOracle`.
    pub fn from_parts(
        config_path: String,
        cluster: Arc<Mutex<Cluster>>,
        config: Arc<Mutex<Config>>,
        db: SharedDbDriver,
        cache: Arc<ConnectionCache>,
        consensus: Arc<ConsensusFacade>,
        reload_handlers: Arc<ReloadHandlers>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let monitor = Arc::new(HealthMonitor::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
            consensus.clone(),
            events_tx,
        ));
        let sync_replication = Arc::new(SyncReplicationManager::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
        ));
        let maintenance = Arc::new(MaintenanceManager::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
        ));
        let failover = Arc::new(FailoverEngine::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
            consensus.clone(),
            sync_replication.clone(),
            maintenance.clone(),
        ));
        let (shutdown_tx, _) = broadcast::channel(4);

        let daemon = Arc::new(Self {
            config_path,
            cluster,
            config,
            db,
            cache,
            consensus,
            monitor,
            failover,
            sync_replication,
            maintenance,
            reload_handlers,
            shutdown_tx,
        });
        daemon.spawn_event_bridge(events_rx);
        daemon
    }

    /// The `AppState` this daemon's control API serves. Lets tests mount
    /// `api::router` directly and drive it with `tower::ServiceExt::oneshot`
    /// instead of binding a real TCP listener.
    pub fn app_state(&self) -> AppState {
        AppState {
            cluster: self.cluster.clone(),
            config: self.config.clone(),
            db: self.db.clone(),
            cache: self.cache.clone(),
            consensus: self.consensus.clone(),
            failover: self.failover.clone(),
            sync_replication: self.sync_replication.clone(),
            maintenance: self.maintenance.clone(),
            reload_handlers: self.reload_handlers.clone(),
            config_path: self.config_path.clone(),
        }
    }

    pub async fn reload_config(&self) -> Result<(), crate::errors::RamdError> {
        let old = self.config.lock().clone();
        let new = Config::from_file(&self.config_path)?;
        new.validate_reload(&old)?;
        let result = crate::config::apply_reload(&old, &new, &self.reload_handlers);
        info!(
            "config reload: status={:?} detected={:?} applied={:?}",
            result.status, result.detected, result.applied
        );
        *self.config.lock() = new;
        Ok(())
    }
}

#[cfg(unix)]
async fn await_termination_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}

#[cfg(not(unix))]
async fn await_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
