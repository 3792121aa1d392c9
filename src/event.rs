use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

/// Messages the worker sends to every connected client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerMessage {
  /// A drain pass finished: `count` of `total` queued writes were delivered
  SyncComplete { count: usize, total: usize },
}

/// Messages a client may send to the worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientMessage {
  /// Activate a waiting version now
  SkipWaiting,
  /// Drain the write queue now
  SyncNow,
}

/// Fan-out to connected clients. Each subscriber is one client.
#[derive(Clone)]
pub struct Clients {
  tx: broadcast::Sender<WorkerMessage>,
  closing: Arc<watch::Sender<bool>>,
}

impl Clients {
  pub fn new(capacity: usize) -> Self {
    let (tx, _rx) = broadcast::channel(capacity);
    let (closing, _rx) = watch::channel(false);
    Self {
      tx,
      closing: Arc::new(closing),
    }
  }

  pub fn subscribe(&self) -> broadcast::Receiver<WorkerMessage> {
    self.tx.subscribe()
  }

  /// Send to every client connected right now. Returns how many received it.
  pub fn broadcast(&self, message: WorkerMessage) -> usize {
    // No subscribers is not an error; the message simply has no audience.
    self.tx.send(message).unwrap_or(0)
  }

  pub fn connected(&self) -> usize {
    self.tx.receiver_count()
  }

  /// Flips to `true` once [`Clients::disconnect_all`] has been called.
  pub fn closing(&self) -> watch::Receiver<bool> {
    self.closing.subscribe()
  }

  /// Tell every open client stream to finish. Used on shutdown.
  pub fn disconnect_all(&self) {
    self.closing.send_replace(true);
  }
}
