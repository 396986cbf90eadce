// src/lib.rs

pub mod api;
pub mod cluster;
pub mod config;
pub mod consensus;
pub mod daemon;
pub mod db;
pub mod errors;
pub mod failover;
pub mod maintenance;
pub mod metrics;
pub mod monitor;
pub mod sync_replication;

/// The handle used to change the log filter live, shared by `main` (which
/// installs the subscriber) and `daemon` (which reloads it on SIGHUP or an
/// API request).
pub type LogReloadHandle = tracing_subscriber::reload::Handle<tracing_subscriber::EnvFilter, tracing_subscriber::Registry>;
