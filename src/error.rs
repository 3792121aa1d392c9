//! Failure kinds of the request path, and how each one reaches the caller.

use color_eyre::Report;
use thiserror::Error;

use crate::network::NetworkError;

#[derive(Debug, Error)]
pub enum WorkerError {
  /// No response at all. On a write this is recovered by queuing.
  #[error("network unreachable: {0}")]
  NetworkUnreachable(#[from] NetworkError),

  /// The upstream answered, but not with a 2xx.
  #[error("upstream rejected the request with status {0}")]
  UpstreamRejected(u16),

  /// The durable queue could not record the write. Surfaced to the caller.
  #[error("durable store unavailable: {0}")]
  StoreUnavailable(Report),

  /// The failed write carried nothing we can replay. Surfaced to the caller.
  #[error("malformed submission: {0}")]
  MalformedSubmission(String),

  /// Best effort only; the response is still returned.
  #[error("cache write failed: {0}")]
  CacheWrite(Report),
}
