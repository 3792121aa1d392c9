mod cache;
mod classify;
mod config;
mod db;
mod error;
mod event;
mod exchange;
mod intercept;
mod lifecycle;
mod logging;
mod network;
mod queue;
mod server;
mod sync;
#[cfg(test)]
mod testing;
mod worker;

use clap::Parser;
use color_eyre::Result;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use url::Url;

#[derive(Parser, Debug)]
#[command(name = "offline-relay")]
#[command(about = "A local proxy that keeps an app usable offline: cached reads, queued writes")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./offline-relay.yaml, then $XDG_CONFIG_HOME/offline-relay/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Address to listen on
  #[arg(short, long)]
  listen: Option<SocketAddr>,

  /// Origin of the application to front
  #[arg(short, long)]
  upstream: Option<Url>,
}

/// Slack on top of the upstream timeout before a proxied request is abandoned.
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let mut config = config::Config::load(args.config.as_deref())?;
  if let Some(listen) = args.listen {
    config.listen = listen;
  }
  if let Some(upstream) = args.upstream {
    config.upstream = upstream;
  }
  config.validate()?;

  let _log_guard = logging::init(&config.logging)?;
  info!(upstream = %config.upstream, version = %config.version, "Starting offline-relay");

  let worker = Arc::new(worker::Worker::open(&config)?);
  worker.start().await?;
  worker.spawn_background();

  let timeout = Duration::from_secs(config.network.timeout_secs) + REQUEST_TIMEOUT_SLACK;
  server::serve(worker, config.listen, timeout).await
}
