use color_eyre::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::DrainPolicy;
use crate::error::WorkerError;
use crate::event::{Clients, WorkerMessage};
use crate::exchange::ProxyRequest;
use crate::network::Network;
use crate::queue::{QueueStore, QueuedWriteRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
  Idle,
  Draining,
}

/// Outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
  /// Records the upstream acknowledged with a 2xx
  pub succeeded: usize,
  /// Records in the pass snapshot
  pub attempted: usize,
  /// Records of the snapshot still queued after the pass
  pub remaining: usize,
}

/// Drains the write queue, one pass at a time.
pub struct SyncOrchestrator {
  queue: Arc<dyn QueueStore>,
  network: Arc<dyn Network>,
  clients: Clients,
  policy: DrainPolicy,
  tag: String,
  /// Held for the whole pass; passes never overlap
  pass: Mutex<()>,
  draining: AtomicBool,
  wake: Notify,
}

impl SyncOrchestrator {
  pub fn new(
    queue: Arc<dyn QueueStore>,
    network: Arc<dyn Network>,
    clients: Clients,
    policy: DrainPolicy,
    tag: impl Into<String>,
  ) -> Self {
    Self {
      queue,
      network,
      clients,
      policy,
      tag: tag.into(),
      pass: Mutex::new(()),
      draining: AtomicBool::new(false),
      wake: Notify::new(),
    }
  }

  /// Tag of the deferred-sync registration this orchestrator answers.
  pub fn tag(&self) -> &str {
    &self.tag
  }

  pub fn state(&self) -> SyncState {
    if self.draining.load(Ordering::SeqCst) {
      SyncState::Draining
    } else {
      SyncState::Idle
    }
  }

  /// Ask the run loop for a drain. Triggers that arrive while a pass is
  /// running collapse into a single follow-up pass.
  pub fn trigger(&self) {
    self.wake.notify_one();
  }

  /// Serve [`trigger`](Self::trigger) calls until the task is dropped.
  pub async fn run(self: Arc<Self>) {
    loop {
      self.wake.notified().await;
      if let Err(e) = self.drain().await {
        error!(error = %e, "Sync failed");
      }
    }
  }

  /// Run one drain pass now, waiting for any pass already in flight.
  pub async fn drain(&self) -> Result<DrainReport> {
    let _pass = self.pass.lock().await;
    let _draining = DrainingGuard::enter(&self.draining);
    self.drain_pass().await
  }

  async fn drain_pass(&self) -> Result<DrainReport> {
    let records = self.queue.snapshot()?;

    if records.is_empty() {
      debug!("No queued writes to sync");
      return Ok(DrainReport::default());
    }

    let total = records.len();
    info!(total, "Syncing queued writes");

    let mut succeeded = 0;
    let mut removed = 0;

    // Sequential on purpose: capture order is delivery order.
    for record in &records {
      match self.replay(record).await {
        Ok(()) => {
          succeeded += 1;
          debug!(key = record.key, synced = succeeded, total, "Synced queued write");

          if self.policy == DrainPolicy::RetainFailed {
            match self.queue.remove(record.key) {
              Ok(_) => removed += 1,
              Err(e) => error!(
                key = record.key,
                error = %e,
                "Delivered write could not be removed and will be replayed again"
              ),
            }
          }
        }
        Err(e) => warn!(key = record.key, url = %record.target_url, error = %e, "Failed to sync queued write"),
      }
    }

    if self.policy == DrainPolicy::DropFailed {
      let keys: Vec<i64> = records.iter().map(|r| r.key).collect();
      removed = self.queue.remove_all(&keys)?;
      if succeeded < total {
        warn!(dropped = total - succeeded, "Dropped queued writes that failed to sync");
      }
    }

    let report = DrainReport {
      succeeded,
      attempted: total,
      remaining: total.saturating_sub(removed),
    };
    info!(
      synced = report.succeeded,
      total = report.attempted,
      remaining = report.remaining,
      "Sync complete"
    );

    let notified = self.clients.broadcast(WorkerMessage::SyncComplete {
      count: succeeded,
      total,
    });
    debug!(clients = notified, "Sync completion broadcast");

    Ok(report)
  }

  async fn replay(&self, record: &QueuedWriteRecord) -> Result<(), WorkerError> {
    let request = ProxyRequest::form_post(record.target_url.clone(), &record.payload)
      .map_err(|e| WorkerError::MalformedSubmission(e.to_string()))?;

    let response = self.network.fetch(&request).await?;
    if !response.is_success() {
      return Err(WorkerError::UpstreamRejected(response.status));
    }

    Ok(())
  }
}

/// Marks the orchestrator as draining for as long as it lives.
struct DrainingGuard<'a>(&'a AtomicBool);

impl<'a> DrainingGuard<'a> {
  fn enter(flag: &'a AtomicBool) -> Self {
    flag.store(true, Ordering::SeqCst);
    Self(flag)
  }
}

impl Drop for DrainingGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::SeqCst);
  }
}
