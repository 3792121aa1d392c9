//! Routing decision for every intercepted request.

use reqwest::Method;
use url::{Origin, Url};

use crate::config::RoutingConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
  /// Form submission to a declared write endpoint: deliver or queue
  MutatingWrite,
  /// GET: served through the read cache
  CacheableRead,
  /// Forwarded untouched
  Passthrough,
}

/// Classifies requests against the declared write endpoints and fresh-data prefixes.
#[derive(Debug, Clone)]
pub struct Classifier {
  origin: Origin,
  write_endpoints: Vec<String>,
  fresh_data_prefixes: Vec<String>,
}

impl Classifier {
  pub fn new(upstream: &Url, routing: &RoutingConfig) -> Self {
    Self {
      origin: upstream.origin(),
      write_endpoints: routing.write_endpoints.clone(),
      fresh_data_prefixes: routing.fresh_data_prefixes.clone(),
    }
  }

  /// Rules, first match wins:
  /// 1. non-http(s) scheme -> passthrough
  /// 2. mutating method to a write endpoint -> write (even under a fresh-data prefix)
  /// 3. fresh-data prefix -> passthrough
  /// 4. GET -> read
  /// 5. anything else -> passthrough
  pub fn classify(&self, method: &Method, url: &Url) -> RequestClass {
    if !matches!(url.scheme(), "http" | "https") {
      return RequestClass::Passthrough;
    }

    if is_mutating(method) && self.is_write_endpoint(url) {
      return RequestClass::MutatingWrite;
    }

    if self.is_fresh_data(url) {
      return RequestClass::Passthrough;
    }

    if *method == Method::GET {
      return RequestClass::CacheableRead;
    }

    RequestClass::Passthrough
  }

  fn is_write_endpoint(&self, url: &Url) -> bool {
    url.origin() == self.origin && self.write_endpoints.iter().any(|p| p == url.path())
  }

  fn is_fresh_data(&self, url: &Url) -> bool {
    url.origin() == self.origin
      && self
        .fresh_data_prefixes
        .iter()
        .any(|prefix| url.path().starts_with(prefix.as_str()))
  }
}

fn is_mutating(method: &Method) -> bool {
  matches!(
    *method,
    Method::POST | Method::PUT | Method::PATCH | Method::DELETE
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  fn classifier() -> Classifier {
    let routing = RoutingConfig {
      fresh_data_prefixes: vec!["/api/".to_string()],
      write_endpoints: vec!["/".to_string(), "/api/logs".to_string()],
    };
    Classifier::new(&Url::parse("http://app.test/").unwrap(), &routing)
  }

  fn classify(method: Method, url: &str) -> RequestClass {
    classifier().classify(&method, &Url::parse(url).unwrap())
  }

  #[test]
  fn test_non_http_scheme_passes_through() {
    assert_eq!(classify(Method::GET, "ws://app.test/"), RequestClass::Passthrough);
    assert_eq!(classify(Method::POST, "data:text/plain,hi"), RequestClass::Passthrough);
  }

  #[test]
  fn test_post_to_write_endpoint_is_write() {
    assert_eq!(classify(Method::POST, "http://app.test/?index"), RequestClass::MutatingWrite);
    assert_eq!(classify(Method::PUT, "http://app.test/"), RequestClass::MutatingWrite);
  }

  #[test]
  fn test_write_detection_beats_fresh_data_bypass() {
    assert_eq!(classify(Method::POST, "http://app.test/api/logs"), RequestClass::MutatingWrite);
    assert_eq!(classify(Method::POST, "http://app.test/api/other"), RequestClass::Passthrough);
  }

  #[test]
  fn test_fresh_data_get_passes_through() {
    assert_eq!(classify(Method::GET, "http://app.test/api/logs"), RequestClass::Passthrough);
  }

  #[test]
  fn test_get_is_cacheable_read() {
    assert_eq!(classify(Method::GET, "http://app.test/logs"), RequestClass::CacheableRead);
    assert_eq!(classify(Method::GET, "http://cdn.test/app.css"), RequestClass::CacheableRead);
  }

  #[test]
  fn test_post_elsewhere_passes_through() {
    assert_eq!(classify(Method::POST, "http://app.test/logs"), RequestClass::Passthrough);
    assert_eq!(classify(Method::POST, "http://other.test/"), RequestClass::Passthrough);
    assert_eq!(classify(Method::HEAD, "http://app.test/"), RequestClass::Passthrough);
  }

  #[test]
  fn test_default_routing_captures_data_requests() {
    let classifier = Classifier::new(&Url::parse("http://app.test/").unwrap(), &RoutingConfig::default());
    let post = |url: &str| classifier.classify(&Method::POST, &Url::parse(url).unwrap());

    assert_eq!(post("http://app.test/_root.data"), RequestClass::MutatingWrite);
    assert_eq!(post("http://app.test/_root.data?index"), RequestClass::MutatingWrite);
    assert_eq!(post("http://app.test/?index"), RequestClass::MutatingWrite);
  }
}
