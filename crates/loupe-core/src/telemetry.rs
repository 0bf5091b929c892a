//! Logging setup.
//!
//! Bridges `tracing` to a console layer (plain or JSON) and, optionally, a
//! daily JSONL file under a log directory so a long-running server leaves a
//! record of every dispatch, crash and recovery.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Whether to output JSON-structured logs to console.
    pub json_logs: bool,
    /// Filter used when `RUST_LOG` is unset (e.g. "loupe=info").
    pub log_filter: String,
    /// Directory for JSONL log files. None = console only.
    pub log_dir: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            json_logs: false,
            log_filter: "loupe=info,loupe_core=info,loupe_db=info,loupe_runner=info,loupe_api=info"
                .into(),
            log_dir: None,
        }
    }
}

/// Install the global subscriber. Call once, early in `main`.
pub fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));

    // Boxed to erase the json vs plain type difference
    let console_layer = if config.json_logs {
        tracing_subscriber::fmt::layer()
            .json()
            .with_span_events(FmtSpan::NONE)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_span_events(FmtSpan::NONE)
            .with_writer(std::io::stderr)
            .boxed()
    };

    // Option<Layer> is itself a Layer (no-op when None)
    let file_layer = match config.log_dir {
        Some(ref log_dir) => {
            std::fs::create_dir_all(log_dir)
                .context(format!("failed to create log dir: {}", log_dir.display()))?;

            let today = chrono::Utc::now().format("%Y-%m-%d");
            let path = log_dir.join(format!("loupe-{today}.jsonl"));
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .context(format!("failed to open log file: {}", path.display()))?;

            Some(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("failed to install tracing subscriber")?;

    Ok(())
}
