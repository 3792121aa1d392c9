//! Delivery of form submissions, with the durable queue as the fallback.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::exchange::{CapturedResponse, ProxyRequest, FORM_CONTENT_TYPE};
use crate::network::Network;
use crate::queue::{field_value, FormPayload, QueueStore, QueuedWriteRecord};
use crate::sync::SyncRegistry;

/// Header set on acknowledgments the worker made up after queuing a write.
pub const OFFLINE_MARKER_HEADER: &str = "x-offline-queued";

pub struct WriteInterceptor {
  network: Arc<dyn Network>,
  queue: Arc<dyn QueueStore>,
  registry: SyncRegistry,
  /// Field that must carry a value for the write to be worth queuing
  field: String,
  sync_tag: String,
}

impl WriteInterceptor {
  pub fn new(
    network: Arc<dyn Network>,
    queue: Arc<dyn QueueStore>,
    registry: SyncRegistry,
    field: impl Into<String>,
    sync_tag: impl Into<String>,
  ) -> Self {
    Self {
      network,
      queue,
      registry,
      field: field.into(),
      sync_tag: sync_tag.into(),
    }
  }

  /// Deliver the write, or queue it and acknowledge optimistically.
  ///
  /// Always produces a response. Any upstream response (even 4xx/5xx) is
  /// returned unmodified; only a missing response leads to queuing.
  pub async fn intercept(&self, request: &ProxyRequest) -> CapturedResponse {
    let err = match self.network.fetch(request).await {
      Ok(response) => {
        debug!(url = %request.url, status = response.status, "Write delivered");
        return response;
      }
      Err(e) => WorkerError::from(e),
    };

    warn!(url = %request.url, error = %err, "Write failed, saving offline");

    match self.capture(request) {
      Ok(record) => {
        info!(key = record.key, url = %record.target_url, "Write queued for sync");
        self.registry.register(&self.sync_tag);
        offline_ack()
      }
      Err(e) => {
        error!(url = %request.url, error = %e, "Failed to save write offline");
        capture_failed(&e)
      }
    }
  }

  fn capture(&self, request: &ProxyRequest) -> Result<QueuedWriteRecord, WorkerError> {
    if let Some(content_type) = request.header("content-type") {
      if !content_type
        .to_ascii_lowercase()
        .starts_with(FORM_CONTENT_TYPE)
      {
        return Err(WorkerError::MalformedSubmission(format!(
          "unsupported content type {}",
          content_type
        )));
      }
    }

    let payload: FormPayload = serde_urlencoded::from_bytes(&request.body)
      .map_err(|e| WorkerError::MalformedSubmission(e.to_string()))?;

    match field_value(&payload, &self.field) {
      Some(value) if !value.is_empty() => {}
      _ => {
        return Err(WorkerError::MalformedSubmission(format!(
          "no {} field found",
          self.field
        )))
      }
    }

    self
      .queue
      .append(&payload, &request.url, Utc::now())
      .map_err(WorkerError::StoreUnavailable)
  }
}

/// Stand-in success for a queued write. `offline: true` tells it apart from
/// a real acknowledgment.
fn offline_ack() -> CapturedResponse {
  CapturedResponse::json(
    200,
    &json!({
      "success": true,
      "message": "Saved offline. Will sync when online.",
      "offline": true,
    }),
  )
  .with_header(OFFLINE_MARKER_HEADER, "true")
}

fn capture_failed(err: &WorkerError) -> CapturedResponse {
  CapturedResponse::json(
    500,
    &json!({
      "success": false,
      "message": format!("Failed to save offline: {}", err),
    }),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::db::Location;
  use crate::queue::SqliteQueue;
  use crate::testing::ScriptedNetwork;
  use color_eyre::eyre::eyre;
  use serde_json::Value;
  use url::Url;

  struct Fixture {
    queue: Arc<SqliteQueue>,
    network: Arc<ScriptedNetwork>,
    registry: SyncRegistry,
    interceptor: WriteInterceptor,
  }

  fn fixture() -> Fixture {
    let queue = Arc::new(SqliteQueue::open(&Location::Memory).unwrap());
    let network = Arc::new(ScriptedNetwork::new());
    let registry = SyncRegistry::new();
    let interceptor = WriteInterceptor::new(
      network.clone(),
      queue.clone(),
      registry.clone(),
      "fieldValue",
      "sync-logs",
    );
    Fixture {
      queue,
      network,
      registry,
      interceptor,
    }
  }

  fn submit(body: &str) -> ProxyRequest {
    ProxyRequest::new(
      reqwest::Method::POST,
      Url::parse("http://app.test/?index").unwrap(),
    )
    .with_header("Content-Type", "application/x-www-form-urlencoded")
    .with_body(body.to_string())
  }

  fn json_body(response: &CapturedResponse) -> Value {
    serde_json::from_slice(&response.body).unwrap()
  }

  #[tokio::test]
  async fn test_online_write_returns_upstream_response() {
    let f = fixture();
    f.network.respond(
      "/",
      CapturedResponse::json(200, &json!({ "success": true, "message": "saved" })),
    );

    let response = f.interceptor.intercept(&submit("fieldValue=x")).await;

    assert_eq!(json_body(&response)["message"], "saved");
    assert!(response.header(OFFLINE_MARKER_HEADER).is_none());
    assert_eq!(f.queue.len().unwrap(), 0);
    assert!(f.registry.pending().is_empty());
  }

  #[tokio::test]
  async fn test_upstream_error_is_not_queued() {
    let f = fixture();
    f.network.respond("/", CapturedResponse::json(500, &json!({ "success": false })));

    let response = f.interceptor.intercept(&submit("fieldValue=x")).await;

    assert_eq!(response.status, 500);
    assert_eq!(f.queue.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_offline_write_is_queued_and_acknowledged() {
    let f = fixture();
    f.network.set_online(false);

    let response = f
      .interceptor
      .intercept(&submit("fieldValue=hello+there&note=n1"))
      .await;

    assert_eq!(response.status, 200);
    assert_eq!(response.header(OFFLINE_MARKER_HEADER), Some("true"));
    let body = json_body(&response);
    assert_eq!(body["success"], true);
    assert_eq!(body["offline"], true);

    let records = f.queue.snapshot().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(
      records[0].payload,
      vec![
        ("fieldValue".to_string(), "hello there".to_string()),
        ("note".to_string(), "n1".to_string()),
      ]
    );
    assert_eq!(records[0].target_url.as_str(), "http://app.test/?index");
    assert!(f.registry.is_pending("sync-logs"));
  }

  #[tokio::test]
  async fn test_missing_field_is_an_explicit_failure() {
    let f = fixture();
    f.network.set_online(false);

    let response = f.interceptor.intercept(&submit("other=1")).await;

    assert_eq!(response.status, 500);
    let body = json_body(&response);
    assert_eq!(body["success"], false);
    assert!(body["message"].as_str().unwrap().contains("fieldValue"));
    assert_eq!(f.queue.len().unwrap(), 0);
    assert!(f.registry.pending().is_empty());
  }

  #[tokio::test]
  async fn test_empty_field_is_an_explicit_failure() {
    let f = fixture();
    f.network.set_online(false);

    let response = f.interceptor.intercept(&submit("fieldValue=")).await;

    assert_eq!(response.status, 500);
    assert_eq!(f.queue.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_non_form_body_is_an_explicit_failure() {
    let f = fixture();
    f.network.set_online(false);
    let request = ProxyRequest::new(
      reqwest::Method::POST,
      Url::parse("http://app.test/").unwrap(),
    )
    .with_header("content-type", "application/json")
    .with_body(r#"{"fieldValue":"x"}"#);

    let response = f.interceptor.intercept(&request).await;

    assert_eq!(response.status, 500);
    assert_eq!(f.queue.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_store_failure_is_not_acknowledged() {
    struct BrokenQueue;
    impl QueueStore for BrokenQueue {
      fn append(
        &self,
        _: &[(String, String)],
        _: &Url,
        _: chrono::DateTime<Utc>,
      ) -> color_eyre::Result<QueuedWriteRecord> {
        Err(eyre!("database is locked"))
      }
      fn snapshot(&self) -> color_eyre::Result<Vec<QueuedWriteRecord>> {
        Ok(Vec::new())
      }
      fn remove(&self, _: i64) -> color_eyre::Result<bool> {
        Ok(false)
      }
      fn remove_all(&self, _: &[i64]) -> color_eyre::Result<usize> {
        Ok(0)
      }
      fn len(&self) -> color_eyre::Result<usize> {
        Ok(0)
      }
    }

    let network = Arc::new(ScriptedNetwork::new());
    network.set_online(false);
    let registry = SyncRegistry::new();
    let interceptor = WriteInterceptor::new(
      network,
      Arc::new(BrokenQueue),
      registry.clone(),
      "fieldValue",
      "sync-logs",
    );

    let response = interceptor.intercept(&submit("fieldValue=x")).await;

    assert_eq!(response.status, 500);
    assert_eq!(json_body(&response)["success"], false);
    assert!(registry.pending().is_empty());
  }
}
