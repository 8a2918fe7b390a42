//! Tracing subscriber setup for processes that host a network or agents.

use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Default filter when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,mesh_network=debug";

/// File name prefix of the rolling log files.
pub const LOG_FILE_PREFIX: &str = "mesh";

fn filter_or(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Log to the console only. `RUST_LOG` wins over `filter`.
pub fn init_logging(filter: &str) -> Result<()> {
    install(filter, None)
}

/// Log to the console and to a daily-rolling file under `logs_dir`.
/// Dropping the returned guard flushes and stops the file writer.
pub fn init_logging_to_dir(logs_dir: &Path, filter: &str) -> Result<WorkerGuard> {
    std::fs::create_dir_all(logs_dir)
        .with_context(|| format!("Cannot create log directory {}", logs_dir.display()))?;

    let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    install(filter, Some(writer))?;
    Ok(guard)
}

fn install(filter: &str, file: Option<NonBlocking>) -> Result<()> {
    let file_layer = file.map(|writer| {
        fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer)
    });

    tracing_subscriber::registry()
        .with(filter_or(filter))
        .with(file_layer)
        .with(fmt::layer().with_target(false).compact())
        .try_init()
        .context("Failed to install logging subscriber")
}
