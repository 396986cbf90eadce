//! The authenticated HTTP control surface: cluster status, node detail,
//! promotion/demotion/failover triggers, maintenance and sync-policy
//! toggles, config reload, and the Prometheus `/metrics` exposition.

use crate::cluster::{Cluster, Node, NodeRole, NodeState};
use crate::config::{Config, ReloadHandlers};
use crate::consensus::ConsensusFacade;
use crate::db::{ConnectionCache, SharedDbDriver};
use crate::errors::RamdError;
use crate::failover::FailoverEngine;
use crate::maintenance::{MaintenanceManager, MaintenanceOptions};
use crate::sync_replication::SyncReplicationManager;
use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{HeaderValue, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Request bodies are capped at 8 KiB; anything larger is rejected with 413
/// before it reaches a handler.
const MAX_BODY_BYTES: usize = 8 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<Mutex<Cluster>>,
    pub config: Arc<Mutex<Config>>,
    pub db: SharedDbDriver,
    pub cache: Arc<ConnectionCache>,
    pub consensus: Arc<ConsensusFacade>,
    pub failover: Arc<FailoverEngine>,
    pub sync_replication: Arc<SyncReplicationManager>,
    pub maintenance: Arc<MaintenanceManager>,
    pub reload_handlers: Arc<ReloadHandlers>,
    pub config_path: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/cluster/status", get(cluster_status))
        .route("/api/v1/nodes", get(list_nodes))
        .route("/api/v1/nodes/{id}", get(node_detail))
        .route("/api/v1/promote/{id}", post(promote))
        .route("/api/v1/demote/{id}", post(demote))
        .route("/api/v1/failover", post(trigger_failover))
        .route("/api/v1/maintenance/{node_id}", get(maintenance_status).post(maintenance_toggle))
        .route("/api/v1/config/reload", post(config_reload))
        .route("/api/v1/replication/sync", get(sync_status).post(sync_update))
        .route("/api/v1/bootstrap/primary", post(bootstrap_primary))
        .route("/api/v1/replica/add", post(replica_add))
        .route("/metrics", get(metrics))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn_with_state(state.clone(), auth_and_close))
        .with_state(state)
}

pub async fn serve(
    state: AppState,
    bind: SocketAddr,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> std::io::Result<()> {
    let app = router(state);
    info!("control API listening on http://{bind}");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_rx.recv().await.ok();
            info!("control API shutting down");
        })
        .await
}

/// Enforces the bearer-token check when auth is enabled, then stamps
/// `Connection: close` on every response so clients never pipeline past a
/// reload.
async fn auth_and_close(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let (auth_enabled, token) = {
        let config = state.config.lock();
        (config.http_auth_enabled, config.http_auth_token.clone())
    };

    if auth_enabled {
        let provided = req
            .headers()
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if provided != token.as_deref() {
            return RamdError::Unauthorized.into_response();
        }
    }

    let mut response = next.run(req).await;
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

#[derive(Serialize)]
struct NodeView {
    node_id: i32,
    hostname: String,
    db_port: u16,
    role: NodeRole,
    state: NodeState,
    healthy: bool,
    health_score: u8,
    replication_lag_ms: u64,
    wal_position: u64,
}

impl From<&Node> for NodeView {
    fn from(n: &Node) -> Self {
        Self {
            node_id: n.node_id,
            hostname: n.hostname.clone(),
            db_port: n.db_port,
            role: n.role,
            state: n.state,
            healthy: n.healthy,
            health_score: n.health_score,
            replication_lag_ms: n.replication_lag_ms,
            wal_position: n.wal_position,
        }
    }
}

#[derive(Serialize)]
struct ClusterStatusView {
    node_count: usize,
    primary_node_id: i32,
    leader_node_id: i32,
    in_failover: bool,
    has_quorum: bool,
    failover_state: crate::failover::FailoverState,
    nodes: Vec<NodeView>,
}

async fn cluster_status(State(state): State<AppState>) -> impl IntoResponse {
    let has_quorum = state.cluster.lock().has_quorum(&state.consensus).await;
    let cluster = state.cluster.lock();
    let view = ClusterStatusView {
        node_count: cluster.node_count(),
        primary_node_id: cluster.primary_node_id,
        leader_node_id: cluster.leader_node_id,
        in_failover: cluster.in_failover,
        has_quorum,
        failover_state: state.failover.context().state,
        nodes: cluster.nodes().map(NodeView::from).collect(),
    };
    Json(view)
}

async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let cluster = state.cluster.lock();
    let nodes: Vec<NodeView> = cluster.nodes().map(NodeView::from).collect();
    Json(nodes)
}

async fn node_detail(State(state): State<AppState>, Path(id): Path<i32>) -> Result<impl IntoResponse, RamdError> {
    let cluster = state.cluster.lock();
    let node = cluster
        .find(id)
        .ok_or_else(|| RamdError::NotFound(format!("node {id}")))?;
    Ok(Json(NodeView::from(node)))
}

async fn promote(State(state): State<AppState>, Path(id): Path<i32>) -> Result<impl IntoResponse, RamdError> {
    state.failover.promote(id).await?;
    Ok(StatusCode::OK)
}

async fn demote(State(state): State<AppState>, Path(id): Path<i32>) -> Result<impl IntoResponse, RamdError> {
    {
        let cluster = state.cluster.lock();
        cluster.find(id).ok_or_else(|| RamdError::NotFound(format!("node {id}")))?;
    }
    state.failover.demote_failed_primary(id).await;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct FailoverRequest {
    node_id: i32,
}

/// Operators can force a failover regardless of `auto_failover_enabled` —
/// that flag only gates the automatic monitor-driven path. `trigger_manual`
/// itself rejects a request while another transition is in progress or the
/// cluster lacks quorum, so no separate gate is needed here.
async fn trigger_failover(
    State(state): State<AppState>,
    Json(body): Json<FailoverRequest>,
) -> Result<impl IntoResponse, RamdError> {
    state.failover.trigger_manual(body.node_id).await?;
    Ok(StatusCode::OK)
}

#[derive(Serialize)]
struct MaintenanceView {
    node_id: i32,
    state: &'static str,
}

async fn maintenance_status(State(state): State<AppState>, Path(node_id): Path<i32>) -> impl IntoResponse {
    let status = match state.maintenance.state_of(node_id) {
        crate::maintenance::MaintenanceState::Inactive => "inactive",
        crate::maintenance::MaintenanceState::Pending => "pending",
        crate::maintenance::MaintenanceState::Active => "active",
        crate::maintenance::MaintenanceState::Draining => "draining",
        crate::maintenance::MaintenanceState::Completing => "completing",
        crate::maintenance::MaintenanceState::Failed => "failed",
    };
    Json(MaintenanceView { node_id, state: status })
}

#[derive(Deserialize)]
struct MaintenanceToggleRequest {
    #[serde(default)]
    exit: bool,
    #[serde(default)]
    disable_auto_failover: bool,
    #[serde(default)]
    create_backup: bool,
    #[serde(default)]
    drain: bool,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    contact: Option<String>,
}

async fn maintenance_toggle(
    State(state): State<AppState>,
    Path(node_id): Path<i32>,
    Json(body): Json<MaintenanceToggleRequest>,
) -> Result<impl IntoResponse, RamdError> {
    if body.exit {
        state.maintenance.exit(node_id)?;
        return Ok(StatusCode::OK);
    }
    state
        .maintenance
        .enter(
            node_id,
            MaintenanceOptions {
                disable_auto_failover: body.disable_auto_failover,
                create_backup: body.create_backup,
                drain: body.drain,
                reason: body.reason,
                contact: body.contact,
                ..Default::default()
            },
        )
        .await?;
    Ok(StatusCode::OK)
}

async fn config_reload(State(state): State<AppState>) -> Result<impl IntoResponse, RamdError> {
    let old = state.config.lock().clone();
    let new = Config::from_file(&state.config_path)?;
    new.validate_reload(&old)?;
    let result = crate::config::apply_reload(&old, &new, &state.reload_handlers);
    *state.config.lock() = new;
    Ok(Json(serde_json::json!({
        "status": format!("{:?}", result.status),
        "detected": result.detected.bits(),
        "applied": result.applied.bits(),
        "error": result.error,
    })))
}

async fn sync_status(State(state): State<AppState>) -> impl IntoResponse {
    let policy = state.sync_replication.policy();
    Json(serde_json::json!({
        "mode": format!("{:?}", policy.mode),
        "commit_level": format!("{:?}", policy.commit_level),
        "names": policy.to_names_string(),
    }))
}

#[derive(Deserialize)]
struct SyncUpdateRequest {
    primary_node_id: i32,
}

async fn sync_update(
    State(state): State<AppState>,
    Json(body): Json<SyncUpdateRequest>,
) -> impl IntoResponse {
    state.sync_replication.recompute(body.primary_node_id).await;
    StatusCode::OK
}

#[derive(Deserialize)]
struct BootstrapRequest {
    node_id: i32,
    hostname: String,
    db_port: u16,
    consensus_port: u16,
    kv_port: u16,
}

async fn bootstrap_primary(
    State(state): State<AppState>,
    Json(body): Json<BootstrapRequest>,
) -> Result<impl IntoResponse, RamdError> {
    let node = Node::new(body.node_id, body.hostname, body.db_port, body.consensus_port, body.kv_port);
    state.cluster.lock().bootstrap_primary(node)?;
    Ok(StatusCode::OK)
}

#[derive(Deserialize)]
struct ReplicaAddRequest {
    node_id: i32,
    hostname: String,
    db_port: u16,
    consensus_port: u16,
    kv_port: u16,
}

async fn replica_add(
    State(state): State<AppState>,
    Json(body): Json<ReplicaAddRequest>,
) -> Result<impl IntoResponse, RamdError> {
    let node = Node::new(body.node_id, body.hostname, body.db_port, body.consensus_port, body.kv_port);
    let node_id = node.node_id;
    state.cluster.lock().add(node)?;
    state.cluster.lock().update_role(node_id, NodeRole::Standby)?;
    Ok(StatusCode::OK)
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let cluster = state.cluster.lock();
    crate::metrics::HEALTHY_NODE_COUNT.set(cluster.count_healthy() as i64);
    crate::metrics::CURRENT_PRIMARY_ID.set(cluster.primary_node_id as i64);
    drop(cluster);
    crate::metrics::FAILOVER_STATE.set(crate::metrics::failover_state_code(state.failover.context().state));
    crate::metrics::SYNC_STANDBY_COUNT.set(state.sync_replication.policy().standbys.len() as i64);

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        crate::metrics::gather(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Node;
    use crate::consensus::InMemoryOracle;
    use crate::db::MockDbDriver;
    use tower::ServiceExt;

    async fn test_state() -> AppState {
        let mut cluster = Cluster::new(1);
        cluster.add(Node::new(1, "n1".into(), 5432, 7000, 7100)).unwrap();
        cluster.update_role(1, NodeRole::Primary).unwrap();
        cluster.update_health(1, 100).unwrap();
        let cluster = Arc::new(Mutex::new(cluster));
        let config = Arc::new(Mutex::new(Config::default()));
        let db: SharedDbDriver = Arc::new(MockDbDriver::new());
        let cache = Arc::new(ConnectionCache::new());
        let consensus = Arc::new(ConsensusFacade::new(Arc::new(InMemoryOracle::new())));
        let sync_replication = Arc::new(SyncReplicationManager::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
        ));
        let maintenance = Arc::new(MaintenanceManager::new(cluster.clone(), config.clone(), db.clone(), cache.clone()));
        let failover = Arc::new(FailoverEngine::new(
            cluster.clone(),
            config.clone(),
            db.clone(),
            cache.clone(),
            consensus.clone(),
            sync_replication.clone(),
            maintenance.clone(),
        ));
        let (filter, reload_handle) = tracing_subscriber::reload::Layer::new(tracing_subscriber::EnvFilter::new("info"));
        let _ = filter;
        let reload_handlers = Arc::new(ReloadHandlers {
            log_reload: Arc::new(reload_handle),
        });
        AppState {
            cluster,
            config,
            db,
            cache,
            consensus,
            failover,
            sync_replication,
            maintenance,
            reload_handlers,
            config_path: "/dev/null".to_string(),
        }
    }

    #[tokio::test]
    async fn cluster_status_returns_ok() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/cluster/status")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_node_returns_404() {
        let app = router(test_state().await);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/nodes/99")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn auth_required_rejects_missing_bearer_token() {
        let mut state = test_state().await;
        state.config.lock().http_auth_enabled = true;
        state.config.lock().http_auth_token = Some("secret".into());
        let app = router(state);
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/v1/cluster/status")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }
}
