//! Tracing bootstrap
//!
//! Console output goes to stderr so command output on stdout stays
//! machine-readable. An optional JSON log file rotates daily.

use crate::config::LoggingConfig;
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Keeps the file writer alive; logs are flushed when dropped
pub struct LoggingGuard {
    _file_guard: Option<WorkerGuard>,
    log_dir: Option<PathBuf>,
}

impl LoggingGuard {
    /// Directory receiving the log file, if file logging is on
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }
}

/// `RUST_LOG` wins over the configured level
fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber
pub fn init_logging(config: &LoggingConfig) -> Result<LoggingGuard> {
    let mut layers = Vec::new();

    let console = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false);
    if config.json {
        layers.push(console.json().with_filter(filter(&config.level)).boxed());
    } else {
        layers.push(console.with_filter(filter(&config.level)).boxed());
    }

    let mut file_guard = None;
    if let Some(dir) = &config.directory {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create log directory: {}", dir.display()))?;
        let (writer, guard) = tracing_appender::non_blocking(rolling::daily(dir, "botlink.log"));
        file_guard = Some(guard);
        layers.push(
            tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .json()
                .with_filter(filter(&config.level))
                .boxed(),
        );
    }

    Registry::default()
        .with(layers)
        .try_init()
        .context("Logging already initialized")?;

    Ok(LoggingGuard {
        _file_guard: file_guard,
        log_dir: config.directory.clone(),
    })
}
