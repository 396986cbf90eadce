//! Defines the primary error type for the entire daemon.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the daemon.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug, Clone)]
pub enum RamdError {
    #[error("failed to parse configuration: {0}")]
    ConfigParse(String),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("configuration field '{0}' cannot change on reload")]
    ConfigImmutableField(String),

    #[error("database connection error: {0}")]
    DbConnect(String),

    #[error("database query error: {0}")]
    DbQuery(String),

    #[error("database operation timed out after {0:?}")]
    DbTimeout(std::time::Duration),

    #[error("consensus layer unavailable: {0}")]
    ConsensusUnavailable(String),

    #[error("no eligible standby available for promotion")]
    NoEligibleStandby,

    #[error("promotion of node {0} failed: {1}")]
    PromotionFailed(i32, String),

    #[error("promotion of node {0} timed out")]
    PromotionTimeout(i32),

    #[error("failed to reconfigure standby node {0}: {1}")]
    StandbyReconfigFailed(i32, String),

    #[error("cluster does not have quorum")]
    NoQuorum,

    #[error("cluster has already been bootstrapped")]
    AlreadyBootstrapped,

    #[error("operation unsafe during maintenance: {0}")]
    MaintenanceUnsafe(String),

    #[error("drain timed out waiting for sessions to end")]
    DrainTimeout,

    #[error("unauthorized")]
    Unauthorized,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for RamdError {
    fn from(e: std::io::Error) -> Self {
        RamdError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for RamdError {
    fn from(e: reqwest::Error) -> Self {
        RamdError::ConsensusUnavailable(e.to_string())
    }
}

impl From<serde_json::Error> for RamdError {
    fn from(e: serde_json::Error) -> Self {
        RamdError::Internal(format!("json error: {e}"))
    }
}

impl RamdError {
    /// Maps an error kind to the documented HTTP status code for the control API.
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            RamdError::Unauthorized => StatusCode::UNAUTHORIZED,
            RamdError::BadRequest(_)
            | RamdError::ConfigParse(_)
            | RamdError::ConfigInvalid(_)
            | RamdError::ConfigImmutableField(_) => StatusCode::BAD_REQUEST,
            RamdError::NotFound(_) => StatusCode::NOT_FOUND,
            RamdError::Conflict(_)
            | RamdError::AlreadyBootstrapped
            | RamdError::MaintenanceUnsafe(_) => StatusCode::CONFLICT,
            RamdError::NoQuorum
            | RamdError::NoEligibleStandby
            | RamdError::PromotionFailed(_, _)
            | RamdError::PromotionTimeout(_)
            | RamdError::StandbyReconfigFailed(_, _)
            | RamdError::DrainTimeout
            | RamdError::ConsensusUnavailable(_)
            | RamdError::DbConnect(_)
            | RamdError::DbQuery(_)
            | RamdError::DbTimeout(_) => StatusCode::SERVICE_UNAVAILABLE,
            RamdError::Internal(_) | RamdError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for RamdError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}
