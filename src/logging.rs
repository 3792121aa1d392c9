use color_eyre::{eyre::eyre, Result};
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;
use crate::db;

const LOG_FILE: &str = "offline-relay.log";

/// Log to stdout and to a daily-rolling file. The returned guard flushes
/// the file writer on drop and must live as long as the process.
pub fn init(config: &LoggingConfig) -> Result<WorkerGuard> {
  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(config.filter.as_deref().unwrap_or("info")))
    .map_err(|e| eyre!("Invalid log filter: {}", e))?;

  let directory = log_dir(config)?;
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let (file_writer, guard) = tracing_appender::non_blocking(rolling::daily(&directory, LOG_FILE));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stdout))
    .with(
      fmt::layer()
        .with_writer(file_writer)
        .with_ansi(false)
        .with_target(false),
    )
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn log_dir(config: &LoggingConfig) -> Result<PathBuf> {
  match &config.directory {
    Some(dir) => Ok(dir.clone()),
    None => Ok(db::default_dir()?.join("logs")),
  }
}
