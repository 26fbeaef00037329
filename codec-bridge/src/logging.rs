//! Tracing setup for hosts and workers.
//!
//! `RUST_LOG` wins when set. Otherwise `CODEC_BRIDGE_LOG` picks the level for
//! the crate's own targets (default info). `LOG_FORMAT=json` switches to JSON
//! lines. Output always goes to stderr.

use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::worker::WorkerConfig;
use crate::worker_tracing_layer::WorkerTracingLayer;

pub const LOG_LEVEL_ENV: &str = "CODEC_BRIDGE_LOG";

const WORKER_LOG_BUFFER: usize = 1024;

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directives(level: &str) -> String {
    format!("codec_bridge={level},codec_bridge::ipc=warn")
}

fn env_filter() -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(std::env::var(LOG_LEVEL_ENV).ok().as_deref());
        EnvFilter::new(filter_directives(level))
    }
}

fn use_json() -> bool {
    std::env::var("LOG_FORMAT").as_deref() == Ok("json")
}

/// Install the global subscriber for a bridge host. A no-op if one is
/// already installed.
pub fn init_tracing() {
    let filter = env_filter();
    if use_json() {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

/// Install the global subscriber for a worker process.
///
/// Events are shipped to the bridge as `log` messages and also written to
/// stderr. Pass the returned config to `run_worker`.
pub fn init_worker_tracing() -> WorkerConfig {
    let (tx, rx) = mpsc::channel(WORKER_LOG_BUFFER);
    let subscriber = tracing_subscriber::registry()
        .with(env_filter())
        .with(WorkerTracingLayer::new(tx))
        .with(fmt::layer().with_writer(std::io::stderr));
    if subscriber.try_init().is_err() {
        return WorkerConfig::default();
    }
    WorkerConfig {
        log_stream: Some(rx),
    }
}
