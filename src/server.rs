//! HTTP front end: the proxy fallback plus the `/__worker/` control API.

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use color_eyre::{eyre::eyre, Result};
use futures::stream::{self, Stream};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

use crate::event::ClientMessage;
use crate::exchange::{is_hop_by_hop, CapturedResponse, ProxyRequest};
use crate::worker::Worker;

/// Largest request body the proxy will buffer.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

pub fn router(worker: Arc<Worker>, timeout: Duration) -> Router {
  Router::new()
    .route("/__worker/events", get(events))
    .route("/__worker/message", post(message))
    .route("/__worker/online", post(online))
    .route("/__worker/offline", post(offline))
    .route("/__worker/status", get(status))
    .route("/__worker/{*rest}", any(reserved))
    .fallback(proxy)
    .layer(TimeoutLayer::with_status_code(StatusCode::GATEWAY_TIMEOUT, timeout))
    .with_state(worker)
}

pub async fn serve(worker: Arc<Worker>, addr: SocketAddr, timeout: Duration) -> Result<()> {
  let listener = TcpListener::bind(addr)
    .await
    .map_err(|e| eyre!("Failed to bind {}: {}", addr, e))?;
  info!(%addr, "Listening");

  run(listener, worker, timeout, shutdown_signal()).await
}

/// Serve until `signal` resolves, then drain in-flight requests and exit.
async fn run<F>(listener: TcpListener, worker: Arc<Worker>, timeout: Duration, signal: F) -> Result<()>
where
  F: Future<Output = ()> + Send + 'static,
{
  let clients = worker.clients().clone();
  axum::serve(listener, router(worker, timeout))
    .with_graceful_shutdown(async move {
      signal.await;
      // Event streams never finish on their own.
      clients.disconnect_all();
    })
    .await
    .map_err(|e| eyre!("Server failed: {}", e))
}

async fn shutdown_signal() {
  match tokio::signal::ctrl_c().await {
    Ok(()) => info!("Shutting down"),
    Err(e) => {
      error!(error = %e, "Failed to listen for ctrl-c");
      std::future::pending::<()>().await;
    }
  }
}

async fn proxy(State(worker): State<Arc<Worker>>, request: Request) -> Response {
  let (parts, body) = request.into_parts();

  let body = match to_bytes(body, MAX_BODY_BYTES).await {
    Ok(body) => body,
    Err(e) => {
      warn!(uri = %parts.uri, error = %e, "Failed to read request body");
      return (StatusCode::PAYLOAD_TOO_LARGE, e.to_string()).into_response();
    }
  };

  let url = match worker.resolve_target(&parts.uri.to_string()) {
    Ok(url) => url,
    Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
  };

  let mut forwarded = ProxyRequest::new(parts.method, url).with_body(body);
  for (name, value) in &parts.headers {
    if is_hop_by_hop(name.as_str()) {
      continue;
    }
    match value.to_str() {
      Ok(value) => forwarded = forwarded.with_header(name.as_str(), value),
      Err(_) => debug!(header = %name, "Dropping non-text request header"),
    }
  }

  to_response(worker.handle_fetch(forwarded).await)
}

fn to_response(captured: CapturedResponse) -> Response {
  let status = StatusCode::from_u16(captured.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut response = Response::new(Body::from(captured.body));
  *response.status_mut() = status;

  for (name, value) in &captured.headers {
    if is_hop_by_hop(name) {
      continue;
    }
    match (
      HeaderName::from_bytes(name.as_bytes()),
      HeaderValue::from_str(value),
    ) {
      (Ok(name), Ok(value)) => {
        response.headers_mut().append(name, value);
      }
      _ => debug!(header = %name, "Dropping invalid response header"),
    }
  }

  response
}

/// Each open stream is one client; it receives every [`WorkerMessage`](crate::event::WorkerMessage).
async fn events(
  State(worker): State<Arc<Worker>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
  let rx = worker.clients().subscribe();
  let closing = worker.clients().closing();
  debug!(clients = worker.clients().connected(), "Client connected");

  let stream = stream::unfold((rx, closing), |(mut rx, mut closing)| async move {
    loop {
      let closed = *closing.borrow();
      if closed {
        debug!("Closing client stream");
        return None;
      }
      tokio::select! {
        changed = closing.changed() => {
          if changed.is_err() {
            return None;
          }
        }
        received = rx.recv() => match received {
          Ok(message) => match Event::default().json_data(&message) {
            Ok(event) => return Some((Ok(event), (rx, closing))),
            Err(e) => warn!(error = %e, "Failed to encode client message"),
          },
          Err(RecvError::Lagged(missed)) => warn!(missed, "Client fell behind; messages dropped"),
          Err(RecvError::Closed) => return None,
        },
      }
    }
  });

  Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn message(
  State(worker): State<Arc<Worker>>,
  Json(message): Json<ClientMessage>,
) -> Response {
  debug!(?message, "Client message");
  match worker.handle_message(message) {
    Ok(()) => StatusCode::ACCEPTED.into_response(),
    Err(e) => {
      error!(error = %e, "Failed to handle client message");
      (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
    }
  }
}

async fn online(State(worker): State<Arc<Worker>>) -> StatusCode {
  worker.connectivity_changed(true);
  StatusCode::NO_CONTENT
}

async fn offline(State(worker): State<Arc<Worker>>) -> StatusCode {
  worker.connectivity_changed(false);
  StatusCode::NO_CONTENT
}

async fn status(State(worker): State<Arc<Worker>>) -> Response {
  match worker.status() {
    Ok(status) => Json(status).into_response(),
    Err(e) => {
      error!(error = %e, "Failed to read worker status");
      (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
    }
  }
}

async fn reserved() -> StatusCode {
  StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::config::Config;
  use crate::db::Location;
  use crate::intercept::OFFLINE_MARKER_HEADER;
  use crate::queue::{QueueStore, SqliteQueue};
  use crate::testing::ScriptedNetwork;
  use serde_json::{json, Value};
  use url::Url;

  struct Harness {
    base: String,
    client: reqwest::Client,
    network: Arc<ScriptedNetwork>,
    queue: Arc<SqliteQueue>,
  }

  async fn worker() -> (Arc<Worker>, Arc<ScriptedNetwork>, Arc<SqliteQueue>) {
    let config = Config {
      upstream: Url::parse("http://app.test/").unwrap(),
      ..Config::default()
    };
    let network = Arc::new(ScriptedNetwork::new());
    let queue = Arc::new(SqliteQueue::open(&Location::Memory).unwrap());
    let storage = Arc::new(SqliteStorage::open(&Location::Memory).unwrap());
    let worker = Arc::new(Worker::new(&config, network.clone(), queue.clone(), storage).unwrap());
    worker.start().await.unwrap();
    worker.spawn_background();
    (worker, network, queue)
  }

  async fn harness() -> Harness {
    let (worker, network, queue) = worker().await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(run(listener, worker, Duration::from_secs(10), std::future::pending()));

    Harness {
      base: format!("http://{}", addr),
      client: reqwest::Client::builder().no_proxy().build().unwrap(),
      network,
      queue,
    }
  }

  impl Harness {
    async fn submit(&self, value: &str) -> reqwest::Response {
      self
        .client
        .post(format!("{}/", self.base))
        .form(&[("fieldValue", value)])
        .send()
        .await
        .unwrap()
    }
  }

  #[tokio::test]
  async fn test_proxies_reads_to_upstream() {
    let h = harness().await;
    h.network.respond(
      "/logs",
      CapturedResponse::html(200, "log list").with_header("x-upstream", "yes"),
    );

    let response = h.client.get(format!("{}/logs", h.base)).send().await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()["x-upstream"], "yes");
    assert_eq!(response.text().await.unwrap(), "log list");
    let delivered = h.network.delivered();
    let last = delivered.last().unwrap();
    assert_eq!(last.url.as_str(), "http://app.test/logs");
  }

  #[tokio::test]
  async fn test_offline_write_is_acknowledged_over_http() {
    let h = harness().await;
    h.network.set_online(false);

    let response = h.submit("hello").await;

    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[OFFLINE_MARKER_HEADER], "true");
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["offline"], true);
    assert_eq!(h.queue.len().unwrap(), 1);
  }

  #[tokio::test]
  async fn test_status_endpoint() {
    let h = harness().await;

    let status: Value = h
      .client
      .get(format!("{}/__worker/status", h.base))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();

    assert_eq!(status["phase"], "activated");
    assert_eq!(status["queued"], 0);
  }

  #[tokio::test]
  async fn test_control_paths_are_never_proxied() {
    let h = harness().await;

    let response = h
      .client
      .get(format!("{}/__worker/nothing-here", h.base))
      .send()
      .await
      .unwrap();

    assert_eq!(response.status(), 404);
    assert!(h.network.delivered().iter().all(|r| !r.url.path().starts_with("/__worker")));
  }

  #[tokio::test]
  async fn test_unknown_client_message_is_rejected() {
    let h = harness().await;
    let url = format!("{}/__worker/message", h.base);

    let accepted = h
      .client
      .post(&url)
      .json(&json!({ "type": "SYNC_NOW" }))
      .send()
      .await
      .unwrap();
    let rejected = h
      .client
      .post(&url)
      .json(&json!({ "type": "RELOAD" }))
      .send()
      .await
      .unwrap();

    assert_eq!(accepted.status(), 202);
    assert!(rejected.status().is_client_error());
  }

  #[tokio::test]
  async fn test_clients_are_told_when_sync_completes() {
    let h = harness().await;
    let mut events = h
      .client
      .get(format!("{}/__worker/events", h.base))
      .send()
      .await
      .unwrap();

    h.network.set_online(false);
    h.submit("a").await;
    h.network.set_online(true);
    h.client
      .post(format!("{}/__worker/online", h.base))
      .send()
      .await
      .unwrap();

    let received = tokio::time::timeout(Duration::from_secs(5), async {
      let mut buffer = String::new();
      while let Some(chunk) = events.chunk().await.unwrap() {
        buffer.push_str(&String::from_utf8_lossy(&chunk));
        if buffer.contains("SYNC_COMPLETE") {
          break;
        }
      }
      buffer
    })
    .await
    .unwrap();

    assert!(received.contains(r#""count":1"#));
    assert!(received.contains(r#""total":1"#));
    assert_eq!(h.queue.len().unwrap(), 0);
  }

  #[tokio::test]
  async fn test_shutdown_completes_with_an_event_stream_open() {
    let (worker, _network, _queue) = worker().await;
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(run(listener, worker, Duration::from_secs(10), async move {
      let _ = stopped.await;
    }));

    let client = reqwest::Client::builder().no_proxy().build().unwrap();
    let mut events = client
      .get(format!("http://{}/__worker/events", addr))
      .send()
      .await
      .unwrap();
    assert_eq!(events.status(), 200);

    stop.send(()).unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(3), server).await;
    assert!(finished.is_ok(), "server kept running with an open event stream");
    assert!(finished.unwrap().unwrap().is_ok());
    let tail = tokio::time::timeout(Duration::from_secs(1), events.chunk()).await.unwrap();
    assert!(tail.unwrap_or(None).is_none());
  }
}
