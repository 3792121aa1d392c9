//! Core types for the response cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::exchange::CapturedResponse;

/// Identity of a cacheable request. Only GET requests are ever cached, so the
/// identity is the method plus the URL without its fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestKey {
  url: Url,
}

impl RequestKey {
  pub fn get(url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self { url }
  }

  pub fn url(&self) -> &Url {
    &self.url
  }

  /// SHA256 hash for stable, fixed-length keys
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"GET ");
    hasher.update(self.url.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response found in the cache.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: CapturedResponse,
  /// Namespace the entry came from
  pub namespace: String,
  pub cached_at: DateTime<Utc>,
}

/// Where a served read came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from the network
  Network,
  /// Cached entry for this exact request
  Cache,
  /// Network failed; the designated placeholder document was served
  OfflineFallback,
  /// Network failed and nothing was cached; synthesized offline page
  OfflinePage,
}

/// Result of a read, including where the response came from.
#[derive(Debug, Clone)]
pub struct Served {
  pub response: CapturedResponse,
  pub source: CacheSource,
}

impl Served {
  pub fn new(response: CapturedResponse, source: CacheSource) -> Self {
    Self { response, source }
  }
}
