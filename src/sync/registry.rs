use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use url::Url;

use super::orchestrator::SyncOrchestrator;
use crate::network::Network;

/// Pending deferred-sync registrations, keyed by tag.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct SyncRegistry {
  inner: Arc<Inner>,
}

struct Inner {
  /// Tag -> failed attempts so far
  pending: Mutex<HashMap<String, u32>>,
  wake: Notify,
  online: AtomicBool,
}

impl SyncRegistry {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        pending: Mutex::new(HashMap::new()),
        wake: Notify::new(),
        // Assume connectivity until a check or a page says otherwise.
        online: AtomicBool::new(true),
      }),
    }
  }

  fn pending_map(&self) -> MutexGuard<'_, HashMap<String, u32>> {
    self
      .inner
      .pending
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Ask for a sync opportunity under `tag`. Advisory: a fresh
  /// registration resets the attempt budget and wakes the dispatcher.
  pub fn register(&self, tag: &str) {
    self.pending_map().insert(tag.to_string(), 0);
    self.inner.wake.notify_one();
    debug!(tag, "Background sync registered");
  }

  pub fn pending(&self) -> Vec<String> {
    let mut tags: Vec<String> = self.pending_map().keys().cloned().collect();
    tags.sort();
    tags
  }

  pub fn is_pending(&self, tag: &str) -> bool {
    self.pending_map().contains_key(tag)
  }

  /// Last observed connectivity to the upstream.
  pub fn is_online(&self) -> bool {
    self.inner.online.load(Ordering::SeqCst)
  }

  pub fn set_online(&self, online: bool) {
    let was = self.inner.online.swap(online, Ordering::SeqCst);
    if was != online {
      info!(online, "Connectivity changed");
    }
  }

  fn complete(&self, tag: &str) {
    self.pending_map().remove(tag);
  }

  /// Count a failed attempt; drop the registration once the budget is spent.
  fn retry_later(&self, tag: &str, max_attempts: u32) {
    let mut pending = self.pending_map();
    let Some(attempts) = pending.get_mut(tag) else {
      return;
    };

    *attempts += 1;
    if *attempts >= max_attempts {
      pending.remove(tag);
      warn!(tag, max_attempts, "Giving up on background sync; writes stay queued");
    } else {
      debug!(tag, attempts = *attempts, "Background sync will be retried");
    }
  }

  async fn woken(&self) {
    self.inner.wake.notified().await;
  }
}

/// Fires pending registrations once the upstream is reachable.
pub struct SyncDispatcher {
  registry: SyncRegistry,
  orchestrator: Arc<SyncOrchestrator>,
  network: Arc<dyn Network>,
  check_url: Url,
  interval: Duration,
  max_attempts: u32,
}

impl SyncDispatcher {
  pub fn new(
    registry: SyncRegistry,
    orchestrator: Arc<SyncOrchestrator>,
    network: Arc<dyn Network>,
    check_url: Url,
  ) -> Self {
    Self {
      registry,
      orchestrator,
      network,
      check_url,
      interval: Duration::from_secs(30),
      max_attempts: 3,
    }
  }

  pub fn with_interval(mut self, interval: Duration) -> Self {
    self.interval = interval;
    self
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts.max(1);
    self
  }

  /// Dispatch on every registration and on every check interval.
  pub async fn run(self) {
    let mut ticker = tokio::time::interval(self.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      tokio::select! {
        _ = self.registry.woken() => {}
        _ = ticker.tick() => {}
      }
      self.dispatch().await;
    }
  }

  /// Check the upstream and, if it answers, fire every pending tag.
  pub async fn dispatch(&self) {
    let tags = self.registry.pending();
    if tags.is_empty() {
      return;
    }

    let online = self.network.reachable(&self.check_url).await;
    self.registry.set_online(online);
    if !online {
      debug!(pending = tags.len(), "Upstream unreachable; sync stays pending");
      return;
    }

    for tag in tags {
      if tag != self.orchestrator.tag() {
        warn!(tag = %tag, "No handler for sync tag");
        self.registry.complete(&tag);
        continue;
      }

      info!(tag = %tag, "Background sync triggered");
      match self.orchestrator.drain().await {
        Ok(report) if report.remaining == 0 => self.registry.complete(&tag),
        Ok(report) => {
          warn!(tag = %tag, remaining = report.remaining, "Sync left writes behind");
          self.registry.retry_later(&tag, self.max_attempts);
        }
        Err(e) => {
          error!(tag = %tag, error = %e, "Sync failed");
          self.registry.retry_later(&tag, self.max_attempts);
        }
      }
    }
  }
}
