// src/main.rs

//! The entry point: parses the minimal CLI surface, bootstraps reloadable
//! logging, and hands off to the daemon's run loop.

use ramd::daemon::Daemon;
use std::env;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::{filter::EnvFilter, prelude::*, reload};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const USAGE: &str = "Usage: ramd --config PATH [--foreground]\n\n\
Options:\n  \
--config PATH   path to the configuration file (required)\n  \
--foreground    do not detach; log to stdout\n  \
--help          print this message\n  \
--version       print the version number";

#[tokio::main]
async fn main() {
    std::process::exit(run_app().await);
}

async fn run_app() -> i32 {
    let args: Vec<String> = env::args().collect();

    if args.iter().any(|a| a == "--help") {
        println!("{USAGE}");
        return 0;
    }
    if args.iter().any(|a| a == "--version") {
        println!("ramd version {VERSION}");
        return 0;
    }

    let Some(config_path) = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .cloned()
    else {
        eprintln!("missing required --config PATH\n\n{USAGE}");
        return 1;
    };
    let foreground = args.iter().any(|a| a == "--foreground");

    let initial_log_level = env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let (filter, reload_handle) = reload::Layer::new(EnvFilter::new(initial_log_level));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .compact()
        .with_ansi(foreground);
    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    let reload_handle = Arc::new(reload_handle);

    let daemon = match Daemon::init(&config_path, reload_handle) {
        Ok(daemon) => daemon,
        Err(e) => {
            error!("failed to initialize daemon: {e:#}");
            return exit_code_for(&e);
        }
    };

    if let Err(e) = daemon.run().await {
        error!("daemon run loop exited with error: {e:#}");
        return exit_code_for(&e);
    }
    0
}

/// Maps an init-time failure to the documented exit code: 2 for a bad
/// configuration, 3 for a listener bind failure, 1 for anything else.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<ramd::errors::RamdError>() {
            if matches!(
                e,
                ramd::errors::RamdError::ConfigParse(_)
                    | ramd::errors::RamdError::ConfigInvalid(_)
                    | ramd::errors::RamdError::ConfigImmutableField(_)
            ) {
                return 2;
            }
        }
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::AddrInUse {
                return 3;
            }
        }
    }
    1
}
