use std::path::PathBuf;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Registry, fmt};

pub const LOG_FILE: &str = "grow.log";
pub const EVENT_FILE: &str = "grow-events.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogConfig {
    pub log_level: String,
    pub log_dir: Option<PathBuf>,
}

impl LogConfig {
    pub fn new(log_level: impl Into<String>, log_dir: Option<PathBuf>) -> Self {
        Self {
            log_level: log_level.into(),
            log_dir,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self::new("info", None)
    }
}

static INSTALLED: OnceLock<bool> = OnceLock::new();

/// Installs the global subscriber once per process.
///
/// Console output always goes through the fmt layer. With a `log_dir`, two
/// daily-rotated files are added: a plain text log and a JSON file that only
/// receives events emitted with `target: "request"`. Later calls are no-ops
/// and report whether this process ended up owning the subscriber.
pub fn init_tracing(config: &LogConfig) -> anyhow::Result<bool> {
    if let Some(installed) = INSTALLED.get() {
        return Ok(*installed);
    }

    let console = fmt::layer()
        .with_thread_names(true)
        .with_target(true)
        .with_filter(EnvFilter::new(&config.log_level));

    let files = match &config.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)?;
            let txt_layer = fmt::layer()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, LOG_FILE))
                .with_ansi(false)
                .with_filter(EnvFilter::new(&config.log_level));
            let json_layer = fmt::layer()
                .json()
                .with_writer(RollingFileAppender::new(Rotation::DAILY, dir, EVENT_FILE))
                .with_target(true)
                .with_filter(EnvFilter::new("request=info"));
            Some(txt_layer.and_then(json_layer))
        }
        None => None,
    };

    let installed = Registry::default()
        .with(console)
        .with(files)
        .try_init()
        .is_ok();
    Ok(*INSTALLED.get_or_init(|| installed))
}

/// Emits one JSON line for the event log.
pub fn request_event(receiver: &str, method: &str, latency_ms: f64, ok: bool) {
    tracing::event!(
        target: "request",
        tracing::Level::INFO,
        receiver,
        method,
        latency_ms,
        status = if ok { "ok" } else { "error" },
    );
}
