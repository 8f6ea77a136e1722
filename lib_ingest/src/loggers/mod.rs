//! # Logging Setup
//!
//! Console plus rolling JSON file logging for the ingest binaries.

use std::io;
use std::path::Path;

use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// # Setup Logging
///
/// Installs the global `tracing` subscriber:
/// - the filter comes from `RUST_LOG`, falling back to `log_level`;
/// - the console layer is human-readable with ANSI colors;
/// - the file layer writes JSON to `{log_dir}/{file_name}.YYYY-MM-DD`, rotated daily.
///
/// The returned guard flushes the file writer on drop; keep it alive for the
/// whole process.
pub fn setup_logging(log_dir: &Path, file_name: &str, log_level: &str) -> io::Result<WorkerGuard> {
    std::fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, file_name);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);

    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| io::Error::other(e.to_string()))?;

    info!(log_level, log_dir = %log_dir.display(), "logging initialized");
    Ok(guard)
}
