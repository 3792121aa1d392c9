//! Outbound HTTP. Everything the worker sends upstream goes through [`Network`].

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::config::NetworkConfig;
use crate::exchange::{is_hop_by_hop, CapturedResponse, ProxyRequest};

/// A request that never produced a response.
#[derive(Debug, Error)]
pub enum NetworkError {
  #[error("request timed out")]
  Timeout,
  #[error("upstream unreachable: {0}")]
  Unreachable(String),
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

impl From<reqwest::Error> for NetworkError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_timeout() {
      NetworkError::Timeout
    } else if e.is_builder() {
      NetworkError::InvalidRequest(e.to_string())
    } else {
      NetworkError::Unreachable(e.to_string())
    }
  }
}

#[async_trait]
pub trait Network: Send + Sync {
  /// Send the request. Any HTTP response, including 4xx/5xx, is `Ok`.
  async fn fetch(&self, request: &ProxyRequest) -> Result<CapturedResponse, NetworkError>;

  /// Whether anything answers at `url`.
  async fn reachable(&self, url: &Url) -> bool {
    self.fetch(&ProxyRequest::head(url.clone())).await.is_ok()
  }
}

/// [`Network`] backed by a shared reqwest client.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
}

impl HttpNetwork {
  pub fn new(config: &NetworkConfig) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
      // Redirects belong to the caller, not the proxy.
      .redirect(reqwest::redirect::Policy::none())
      // The upstream is always addressed directly, never through HTTP_PROXY.
      .no_proxy()
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &ProxyRequest) -> Result<CapturedResponse, NetworkError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }

    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .map(|(name, value)| {
        (
          name.as_str().to_string(),
          String::from_utf8_lossy(value.as_bytes()).into_owned(),
        )
      })
      .collect();
    let body = response.bytes().await?;

    Ok(CapturedResponse {
      status,
      headers,
      body,
    })
  }
}
