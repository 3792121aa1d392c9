//! The intercepting worker: routes every request and owns the background tasks.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheNames, CacheStorage, NoopStorage, SqliteStorage};
use crate::classify::{Classifier, RequestClass};
use crate::config::{Config, SyncConfig};
use crate::db::Location;
use crate::event::{ClientMessage, Clients};
use crate::exchange::{CapturedResponse, ProxyRequest};
use crate::intercept::WriteInterceptor;
use crate::lifecycle::{Lifecycle, Phase};
use crate::network::{HttpNetwork, Network};
use crate::queue::{QueueStore, SqliteQueue};
use crate::sync::{SyncDispatcher, SyncOrchestrator, SyncRegistry, SyncState};

/// Buffered messages per client before a slow one starts missing them.
const CLIENT_BUFFER: usize = 32;

/// Snapshot served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
  pub version: String,
  pub phase: Phase,
  pub controlling: bool,
  pub sync_state: SyncState,
  pub sync_pending: bool,
  pub online: bool,
  pub queued: usize,
}

pub struct Worker {
  version: String,
  upstream: Url,
  skip_waiting: bool,
  sync: SyncConfig,
  classifier: Classifier,
  cache: CacheLayer,
  writes: Arc<WriteInterceptor>,
  lifecycle: Lifecycle,
  orchestrator: Arc<SyncOrchestrator>,
  registry: SyncRegistry,
  network: Arc<dyn Network>,
  queue: Arc<dyn QueueStore>,
  clients: Clients,
}

impl Worker {
  /// Open the on-disk stores and the HTTP client named by `config`.
  pub fn open(config: &Config) -> Result<Self> {
    let network = Arc::new(HttpNetwork::new(&config.network)?);
    let queue = Arc::new(SqliteQueue::open(&Location::from_config(
      config.queue.database.as_deref(),
      "queue.db",
    ))?);

    let storage: Arc<dyn CacheStorage> = if config.cache.enabled {
      Arc::new(SqliteStorage::open(&Location::from_config(
        config.cache.database.as_deref(),
        "cache.db",
      ))?)
    } else {
      info!("Response cache disabled");
      Arc::new(NoopStorage)
    };

    Self::new(config, network, queue, storage)
  }

  pub fn new(
    config: &Config,
    network: Arc<dyn Network>,
    queue: Arc<dyn QueueStore>,
    storage: Arc<dyn CacheStorage>,
  ) -> Result<Self> {
    let upstream = config.upstream.clone();
    let names = CacheNames::new(&config.cache.prefix, &config.version);

    let offline_fallback = match &config.cache.offline_fallback {
      Some(path) => Some(
        upstream
          .join(path)
          .map_err(|e| eyre!("Invalid offline fallback {}: {}", path, e))?,
      ),
      None => None,
    };

    let clients = Clients::new(CLIENT_BUFFER);
    let registry = SyncRegistry::new();

    let cache = CacheLayer::new(
      storage.clone(),
      network.clone(),
      names.clone(),
      &upstream,
      config.cache.strategy,
    )
    .with_offline_fallback(offline_fallback);

    let writes = Arc::new(WriteInterceptor::new(
      network.clone(),
      queue.clone(),
      registry.clone(),
      config.queue.field.clone(),
      config.sync.tag.clone(),
    ));

    let orchestrator = Arc::new(SyncOrchestrator::new(
      queue.clone(),
      network.clone(),
      clients.clone(),
      config.queue.policy,
      config.sync.tag.clone(),
    ));

    let lifecycle = Lifecycle::new(
      storage,
      network.clone(),
      names,
      upstream.clone(),
      config.cache.precache.clone(),
    );

    Ok(Self {
      version: config.version.clone(),
      upstream,
      skip_waiting: config.lifecycle.skip_waiting,
      sync: config.sync.clone(),
      classifier: Classifier::new(&config.upstream, &config.routing),
      cache,
      writes,
      lifecycle,
      orchestrator,
      registry,
      network,
      queue,
      clients,
    })
  }

  pub fn clients(&self) -> &Clients {
    &self.clients
  }

  /// Install and, unless told to wait, activate. Queued writes left over from
  /// a previous run get a sync registration so they are not stranded.
  pub async fn start(&self) -> Result<()> {
    self.lifecycle.start(self.skip_waiting).await?;

    let queued = self.queue.len()?;
    if queued > 0 {
      info!(queued, "Found queued writes from a previous run");
      self.registry.register(&self.sync.tag);
    }

    Ok(())
  }

  /// Spawn the drain loop and the sync dispatcher.
  pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
    let dispatcher = SyncDispatcher::new(
      self.registry.clone(),
      self.orchestrator.clone(),
      self.network.clone(),
      self.upstream.clone(),
    )
    .with_interval(Duration::from_secs(self.sync.check_interval_secs.max(1)))
    .with_max_attempts(self.sync.max_attempts);

    vec![
      tokio::spawn(self.orchestrator.clone().run()),
      tokio::spawn(dispatcher.run()),
    ]
  }

  /// Absolute-form targets are used as-is; everything else is resolved
  /// against the upstream.
  pub fn resolve_target(&self, target: &str) -> Result<Url> {
    if target.starts_with("http://") || target.starts_with("https://") {
      return Url::parse(target).map_err(|e| eyre!("Invalid request target {}: {}", target, e));
    }

    self
      .upstream
      .join(target)
      .map_err(|e| eyre!("Invalid request target {}: {}", target, e))
  }

  /// Handle one intercepted request. Always produces a response.
  pub async fn handle_fetch(&self, request: ProxyRequest) -> CapturedResponse {
    if !self.lifecycle.controls_clients() {
      return self.passthrough(&request).await;
    }

    let class = self.classifier.classify(&request.method, &request.url);
    debug!(method = %request.method, url = %request.url, ?class, "Fetch");

    match class {
      RequestClass::MutatingWrite => self.capture_write(request).await,
      RequestClass::CacheableRead => {
        let served = self.cache.serve(&request).await;
        debug!(url = %request.url, source = ?served.source, "Read served");
        served.response
      }
      RequestClass::Passthrough => self.passthrough(&request).await,
    }
  }

  /// Runs on its own task so a write is delivered or queued even when the
  /// client hangs up before the response is ready.
  async fn capture_write(&self, request: ProxyRequest) -> CapturedResponse {
    let writes = self.writes.clone();
    match tokio::spawn(async move { writes.intercept(&request).await }).await {
      Ok(response) => response,
      Err(e) => {
        error!(error = %e, "Write capture task failed");
        CapturedResponse::text(500, "Failed to capture write")
      }
    }
  }

  async fn passthrough(&self, request: &ProxyRequest) -> CapturedResponse {
    match self.network.fetch(request).await {
      Ok(response) => response,
      Err(e) => {
        warn!(method = %request.method, url = %request.url, error = %e, "Passthrough failed");
        CapturedResponse::text(502, format!("Bad gateway: {}", e))
      }
    }
  }

  pub fn handle_message(&self, message: ClientMessage) -> Result<()> {
    match message {
      ClientMessage::SkipWaiting => {
        self.lifecycle.skip_waiting()?;
      }
      ClientMessage::SyncNow => {
        info!("Sync requested by client");
        self.orchestrator.trigger();
      }
    }
    Ok(())
  }

  /// Connectivity reported by a page. Coming online re-registers the sync
  /// tag; the dispatcher checks reachability and drains once.
  pub fn connectivity_changed(&self, online: bool) {
    self.registry.set_online(online);
    if online {
      self.registry.register(&self.sync.tag);
    }
  }

  pub fn status(&self) -> Result<WorkerStatus> {
    Ok(WorkerStatus {
      version: self.version.clone(),
      phase: self.lifecycle.phase(),
      controlling: self.lifecycle.controls_clients(),
      sync_state: self.orchestrator.state(),
      sync_pending: self.registry.is_pending(&self.sync.tag),
      online: self.registry.is_online(),
      queued: self.queue.len()?,
    })
  }
}
