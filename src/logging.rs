use crate::common::error::{ImporterError, Result};
use std::fs;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const DEFAULT_FILTER: &str = "cinephile_importer=info,info";
const LOG_FILE_PREFIX: &str = "importer.log";

/// Installs the global subscriber: a console layer on stderr plus daily-rolled
/// JSON files in `log_dir`. `RUST_LOG` overrides the default filter.
///
/// File output goes through a background writer; hold the returned guard
/// until the process is done logging, dropping it flushes buffered lines.
pub fn init_logging(log_dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(log_dir)?;

    let file_appender = tracing_appender::rolling::daily(log_dir, LOG_FILE_PREFIX);
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = fmt::layer().json().with_writer(non_blocking_writer);

    // stdout is reserved for command output
    let console_layer = fmt::layer().with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .map_err(|e| ImporterError::Config(format!("logging already initialized: {e}")))?;

    Ok(guard)
}
