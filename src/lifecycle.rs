//! Install and activation of a worker version.

use color_eyre::{eyre::eyre, Result};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheNames, CacheStorage, RequestKey};
use crate::exchange::ProxyRequest;
use crate::network::Network;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
  /// Nothing has run yet
  Parsed,
  Installing,
  /// Installed, waiting to activate
  Installed,
  Activating,
  Activated,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
  pub cached: usize,
  pub failed: Vec<String>,
}

pub struct Lifecycle {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  names: CacheNames,
  upstream: Url,
  precache: Vec<String>,
  phase: Mutex<Phase>,
  /// Whether requests are intercepted. False until activation claims clients.
  controlling: AtomicBool,
}

impl Lifecycle {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    names: CacheNames,
    upstream: Url,
    precache: Vec<String>,
  ) -> Self {
    Self {
      storage,
      network,
      names,
      upstream,
      precache,
      phase: Mutex::new(Phase::Parsed),
      controlling: AtomicBool::new(false),
    }
  }

  pub fn phase(&self) -> Phase {
    *self.phase.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_phase(&self, phase: Phase) {
    *self.phase.lock().unwrap_or_else(PoisonError::into_inner) = phase;
    debug!(?phase, "Lifecycle phase changed");
  }

  pub fn controls_clients(&self) -> bool {
    self.controlling.load(Ordering::SeqCst)
  }

  /// Install, then activate straight away when `skip_waiting` is set.
  pub async fn start(&self, skip_waiting: bool) -> Result<InstallReport> {
    let report = self.install().await?;
    if skip_waiting {
      self.activate()?;
    } else {
      info!(precache = %self.names.precache, "Installed; waiting for SKIP_WAITING");
    }
    Ok(report)
  }

  /// Populate the precache namespace. Individual asset failures are
  /// reported, never fatal.
  pub async fn install(&self) -> Result<InstallReport> {
    self.set_phase(Phase::Installing);
    info!(namespace = %self.names.precache, assets = self.precache.len(), "Installing");

    self.storage.open(&self.names.precache)?;
    self.storage.open(&self.names.runtime)?;

    let mut report = InstallReport::default();
    for asset in &self.precache {
      match self.precache_one(asset).await {
        Ok(()) => report.cached += 1,
        Err(e) => {
          warn!(asset = %asset, error = %e, "Precache failed");
          report.failed.push(asset.clone());
        }
      }
    }

    self.set_phase(Phase::Installed);
    info!(cached = report.cached, failed = report.failed.len(), "Installed");
    Ok(report)
  }

  async fn precache_one(&self, asset: &str) -> Result<()> {
    let url = self
      .upstream
      .join(asset)
      .map_err(|e| eyre!("Invalid asset path: {}", e))?;
    if url.origin() != self.upstream.origin() {
      return Err(eyre!("Not on the upstream origin: {}", url));
    }

    let response = self
      .network
      .fetch(&ProxyRequest::get(url.clone()))
      .await
      .map_err(|e| eyre!("Failed to fetch {}: {}", url, e))?;
    if response.status != 200 {
      return Err(eyre!("Unexpected status {} for {}", response.status, url));
    }

    self
      .storage
      .put(&self.names.precache, &RequestKey::get(&url), &response)
  }

  /// Delete every namespace the current version does not own, then claim clients.
  pub fn activate(&self) -> Result<()> {
    self.set_phase(Phase::Activating);

    for name in self.storage.namespaces()? {
      if !self.names.is_current(&name) {
        self.storage.delete(&name)?;
        info!(namespace = %name, "Deleted old cache");
      }
    }

    self.controlling.store(true, Ordering::SeqCst);
    self.set_phase(Phase::Activated);
    info!(precache = %self.names.precache, runtime = %self.names.runtime, "Activated; controlling clients");
    Ok(())
  }

  /// Activate a waiting version now. No-op in any other phase.
  pub fn skip_waiting(&self) -> Result<bool> {
    if self.phase() != Phase::Installed {
      debug!(phase = ?self.phase(), "Nothing waiting to activate");
      return Ok(false);
    }
    self.activate()?;
    Ok(true)
  }
}
