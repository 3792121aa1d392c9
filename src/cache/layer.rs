//! Cache layer that applies a read discipline over the cache and the network.

use std::sync::Arc;
use tracing::{debug, warn};
use url::{Origin, Url};

use super::names::CacheNames;
use super::storage::CacheStorage;
use super::types::{CacheSource, CachedResponse, RequestKey, Served};
use crate::config::ReadDiscipline;
use crate::error::WorkerError;
use crate::exchange::{CapturedResponse, ProxyRequest};
use crate::network::Network;

/// Cache layer that serves GET requests.
///
/// This layer sits between the proxy and the network client,
/// providing transparent caching with offline support.
#[derive(Clone)]
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  network: Arc<dyn Network>,
  names: CacheNames,
  /// Responses from any other origin are opaque and never cached
  origin: Origin,
  discipline: ReadDiscipline,
  /// Document served when a stale-while-revalidate miss also fails on the network
  offline_fallback: Option<Url>,
}

impl CacheLayer {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    network: Arc<dyn Network>,
    names: CacheNames,
    upstream: &Url,
    discipline: ReadDiscipline,
  ) -> Self {
    Self {
      storage,
      network,
      names,
      origin: upstream.origin(),
      discipline,
      offline_fallback: None,
    }
  }

  pub fn with_offline_fallback(mut self, fallback: Option<Url>) -> Self {
    self.offline_fallback = fallback;
    self
  }

  /// Serve a cacheable read according to the configured discipline.
  pub async fn serve(&self, request: &ProxyRequest) -> Served {
    match self.discipline {
      ReadDiscipline::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
      ReadDiscipline::NetworkFirst => self.network_first(request).await,
    }
  }

  /// 1. Cache hit - return it, refresh the entry in the background
  /// 2. Miss - fetch, store a copy if cacheable, return
  /// 3. Miss and network failure - placeholder document, else offline page
  async fn stale_while_revalidate(&self, request: &ProxyRequest) -> Served {
    let key = RequestKey::get(&request.url);

    if let Some(cached) = self.lookup(&key) {
      self.revalidate(request.clone());
      return Served::new(cached.response, CacheSource::Cache);
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(request, &response);
        Served::new(response, CacheSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Read failed on a cache miss");
        self.offline_fallback()
      }
    }
  }

  /// 1. Fetch - store a copy if cacheable, return the live response
  /// 2. Network failure - cached entry for this request, else offline page
  async fn network_first(&self, request: &ProxyRequest) -> Served {
    match self.network.fetch(request).await {
      Ok(response) => {
        self.store(request, &response);
        Served::new(response, CacheSource::Network)
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "Read failed, trying cache");
        match self.lookup(&RequestKey::get(&request.url)) {
          Some(cached) => Served::new(cached.response, CacheSource::Cache),
          None => Served::new(CapturedResponse::offline_page(), CacheSource::OfflinePage),
        }
      }
    }
  }

  /// Refresh the entry without holding up the response. Safe to drop.
  fn revalidate(&self, request: ProxyRequest) {
    let layer = self.clone();
    tokio::spawn(async move {
      match layer.network.fetch(&request).await {
        Ok(response) => layer.store(&request, &response),
        Err(e) => debug!(url = %request.url, error = %e, "Background revalidation failed"),
      }
    });
  }

  fn offline_fallback(&self) -> Served {
    let cached = self
      .offline_fallback
      .as_ref()
      .and_then(|url| self.lookup(&RequestKey::get(url)));

    match cached {
      Some(cached) => Served::new(cached.response, CacheSource::OfflineFallback),
      None => Served::new(CapturedResponse::offline_page(), CacheSource::OfflinePage),
    }
  }

  /// Only shareable 200 responses from the upstream origin are cached.
  fn is_cacheable(&self, request: &ProxyRequest, response: &CapturedResponse) -> bool {
    response.status == 200 && request.url.origin() == self.origin && !is_per_user(response)
  }

  /// Best effort: a failed write is logged and otherwise ignored.
  fn store(&self, request: &ProxyRequest, response: &CapturedResponse) {
    if !self.is_cacheable(request, response) {
      return;
    }

    let key = RequestKey::get(&request.url);
    let shared = without_cookies(response);
    if let Err(e) = self.storage.put(&self.names.runtime, &key, &shared) {
      let err = WorkerError::CacheWrite(e);
      warn!(url = %request.url, error = %err, "Response not cached");
    }
  }

  /// Lookup failures are treated as misses.
  fn lookup(&self, key: &RequestKey) -> Option<CachedResponse> {
    match self.storage.lookup(&self.names.lookup_order(), key) {
      Ok(Some(hit)) => {
        debug!(url = %key.url(), namespace = %hit.namespace, cached_at = %hit.cached_at, "Cache hit");
        Some(hit)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(url = %key.url(), error = %e, "Cache lookup failed");
        None
      }
    }
  }
}

/// `Cache-Control: no-store` or `private` marks a response as not for other readers.
fn is_per_user(response: &CapturedResponse) -> bool {
  response
    .headers
    .iter()
    .filter(|(name, _)| name.eq_ignore_ascii_case("cache-control"))
    .flat_map(|(_, value)| value.split(','))
    .map(|directive| directive.trim().to_ascii_lowercase())
    .any(|directive| directive == "no-store" || directive == "private")
}

/// Cookies are addressed to one client and never replayed from the cache.
fn without_cookies(response: &CapturedResponse) -> CapturedResponse {
  let mut shared = response.clone();
  shared
    .headers
    .retain(|(name, _)| !name.eq_ignore_ascii_case("set-cookie") && !name.eq_ignore_ascii_case("set-cookie2"));
  shared
}
