//! Tracing setup for the binary.
//!
//! Logs go to a daily-rotated file so they never interleave with command
//! output. `RUST_LOG` overrides the configured filter.

use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "neoforge.log";

/// Directory logs are written to when none is configured.
pub fn default_log_dir() -> Option<PathBuf> {
  dirs::data_dir().map(|d| d.join("neoforge").join("logs"))
}

/// Install the global subscriber. Keep the guard alive until exit so buffered
/// lines get flushed.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let directory = config
    .directory
    .clone()
    .or_else(default_log_dir)
    .ok_or_else(|| eyre!("Could not determine log directory"))?;

  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {:?}: {}", directory, e))?;

  let appender = tracing_appender::rolling::daily(&directory, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.filter))
    .unwrap_or_else(|_| EnvFilter::new("info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_ansi(false)
    .with_writer(writer)
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
