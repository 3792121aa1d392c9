//! Request and response values passed between the proxy, the network and the stores.

use bytes::Bytes;
use reqwest::Method;
use serde_json::Value;
use url::Url;

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Headers that describe a single connection and must not be forwarded or stored.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "content-length",
  "host",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// An intercepted request. The body is fully buffered, so cloning the
/// request is cheap and the body can be read any number of times.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl ProxyRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: Bytes::new(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  pub fn head(url: Url) -> Self {
    Self::new(Method::HEAD, url)
  }

  /// Build a form-encoded POST carrying the given fields in order.
  pub fn form_post(url: Url, fields: &[(String, String)]) -> Result<Self, serde_urlencoded::ser::Error> {
    let body = serde_urlencoded::to_string(fields)?;
    Ok(
      Self::new(Method::POST, url)
        .with_header("content-type", FORM_CONTENT_TYPE)
        .with_body(body),
    )
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  /// Case-insensitive header lookup (first match wins).
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

/// A complete HTTP response snapshot: status, headers and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Bytes,
}

impl CapturedResponse {
  pub fn new(status: u16) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: Bytes::new(),
    }
  }

  pub fn json(status: u16, value: &Value) -> Self {
    Self::new(status)
      .with_header("content-type", "application/json")
      .with_body(value.to_string())
  }

  pub fn html(status: u16, body: impl Into<Bytes>) -> Self {
    Self::new(status)
      .with_header("content-type", "text/html; charset=utf-8")
      .with_body(body)
  }

  pub fn text(status: u16, body: impl Into<Bytes>) -> Self {
    Self::new(status)
      .with_header("content-type", "text/plain; charset=utf-8")
      .with_body(body)
  }

  /// The page served when neither the network nor the cache can answer a read.
  pub fn offline_page() -> Self {
    Self::html(503, OFFLINE_PAGE)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
    self.body = body.into();
    self
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(n, _)| n.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}

const OFFLINE_PAGE: &str = r#"<!DOCTYPE html>
<html>
  <head>
    <meta charset="utf-8">
    <title>Offline</title>
  </head>
  <body>
    <h1>You're offline</h1>
    <p>This page isn't available offline yet. Reconnect and try again.
       Changes you submit while offline are kept and will sync when you're back online.</p>
  </body>
</html>
"#;
