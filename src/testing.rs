//! Test doubles shared by the unit tests.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::exchange::{CapturedResponse, ProxyRequest};
use crate::network::{Network, NetworkError};

/// In-memory [`Network`] that can be switched offline and records every
/// request that reached it.
pub struct ScriptedNetwork {
  online: AtomicBool,
  routes: Mutex<HashMap<String, CapturedResponse>>,
  rejected_bodies: Mutex<Vec<String>>,
  delivered: Mutex<Vec<ProxyRequest>>,
  latency: Mutex<Duration>,
}

impl ScriptedNetwork {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      rejected_bodies: Mutex::new(Vec::new()),
      delivered: Mutex::new(Vec::new()),
      latency: Mutex::new(Duration::ZERO),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Delay every round trip by `latency` before it succeeds or fails.
  pub fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  /// Answer requests for `path` with `response`.
  pub fn respond(&self, path: &str, response: CapturedResponse) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path.to_string(), response);
  }

  /// Answer 500 to any request whose body contains `needle`.
  pub fn reject_body_containing(&self, needle: &str) {
    self.rejected_bodies.lock().unwrap().push(needle.to_string());
  }

  pub fn delivered(&self) -> Vec<ProxyRequest> {
    self.delivered.lock().unwrap().clone()
  }

  /// Bodies of delivered requests with the given method, in arrival order.
  pub fn delivered_bodies(&self, method: &str) -> Vec<String> {
    self
      .delivered()
      .iter()
      .filter(|r| r.method.as_str() == method)
      .map(|r| String::from_utf8_lossy(&r.body).into_owned())
      .collect()
  }
}

#[async_trait]
impl Network for ScriptedNetwork {
  async fn fetch(&self, request: &ProxyRequest) -> Result<CapturedResponse, NetworkError> {
    // Give concurrent tasks a chance to interleave, like a real round trip.
    tokio::task::yield_now().await;
    let latency = *self.latency.lock().unwrap();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(NetworkError::Unreachable("offline".to_string()));
    }

    self.delivered.lock().unwrap().push(request.clone());

    let body = String::from_utf8_lossy(&request.body);
    if self
      .rejected_bodies
      .lock()
      .unwrap()
      .iter()
      .any(|needle| body.contains(needle.as_str()))
    {
      return Ok(CapturedResponse::json(500, &json!({ "success": false })));
    }

    let routed = self.routes.lock().unwrap().get(request.url.path()).cloned();
    Ok(routed.unwrap_or_else(|| CapturedResponse::json(200, &json!({ "success": true }))))
  }
}
