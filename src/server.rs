//! HTTP listener: control routes plus the catch-all proxy that feeds
//! intercepted requests into the event loop.

use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use color_eyre::eyre::eyre;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::app::Gateway;
use crate::cache::LifecycleState;
use crate::error::GatewayError;
use crate::event::{GatewayEvent, SYNC_TAG};
use crate::net::{is_hop_by_hop, GatewayRequest, GatewayResponse};

#[derive(Clone)]
pub struct ServerState {
  pub events: mpsc::UnboundedSender<GatewayEvent>,
  pub gateway: Arc<Gateway>,
}

pub fn routes(state: ServerState) -> axum::Router {
  axum::Router::new()
    .route("/__gateway/sync", post(trigger_sync))
    .route("/__gateway/status", get(status))
    .route("/__gateway/events", post(dispatch_event))
    .fallback(proxy)
    .layer(DefaultBodyLimit::disable())
    .with_state(state)
}

/// Body of `POST /__gateway/events`
#[derive(Debug, Deserialize)]
struct EventRequest {
  kind: String,
  #[serde(default)]
  version: Option<String>,
  #[serde(default)]
  tag: Option<String>,
}

impl EventRequest {
  fn into_event(self) -> GatewayEvent {
    match self.kind.as_str() {
      "install" => GatewayEvent::Install {
        version: self.version,
      },
      "activate" => GatewayEvent::Activate,
      "sync" => GatewayEvent::Sync {
        tag: self.tag.unwrap_or_else(|| SYNC_TAG.to_string()),
      },
      _ => GatewayEvent::Other { kind: self.kind },
    }
  }
}

async fn dispatch_event(
  State(state): State<ServerState>,
  Json(request): Json<EventRequest>,
) -> Response {
  let kind = request.kind.clone();
  match state.events.send(request.into_event()) {
    Ok(()) => (
      StatusCode::ACCEPTED,
      Json(json!({"status": "scheduled", "kind": kind})),
    )
      .into_response(),
    Err(_) => shutting_down(),
  }
}

/// Hand events to a gateway already listening on `listen`, in order.
///
/// Returns `Ok(false)` when nothing listens there, so the caller can do the
/// work itself.
pub async fn forward_events(listen: &str, events: &[serde_json::Value]) -> color_eyre::Result<bool> {
  let client = reqwest::Client::new();
  let url = format!("http://{}/__gateway/events", listen);

  for event in events {
    let response = match client
      .post(&url)
      .header(header::CONTENT_TYPE, "application/json")
      .body(event.to_string())
      .send()
      .await
    {
      Ok(response) => response,
      Err(e) if e.is_connect() => return Ok(false),
      Err(e) => return Err(eyre!("Failed to reach gateway at {}: {}", listen, e)),
    };

    if !response.status().is_success() {
      return Err(eyre!(
        "Gateway at {} refused event {}: {}",
        listen,
        event,
        response.status()
      ));
    }
  }
  Ok(true)
}

async fn trigger_sync(State(state): State<ServerState>) -> Response {
  match state.events.send(GatewayEvent::sync()) {
    Ok(()) => (StatusCode::ACCEPTED, Json(json!({"status": "scheduled"}))).into_response(),
    Err(_) => shutting_down(),
  }
}

async fn status(State(state): State<ServerState>) -> Response {
  let gateway = &state.gateway;
  let queued = match gateway.queue.len() {
    Ok(n) => json!(n),
    Err(e) => {
      error!(error = %e, "failed to count queued submissions");
      serde_json::Value::Null
    }
  };

  let state = gateway.lifecycle.state();
  Json(json!({
    "state": state,
    "offline_ready": state == Some(LifecycleState::Active),
    "active_version": gateway.cache.active_version(),
    "generations": gateway.lifecycle.generations(),
    "queued": queued,
    "upstream_reachable": gateway.connectivity.is_reachable(),
  }))
  .into_response()
}

async fn proxy(
  State(state): State<ServerState>,
  method: Method,
  uri: Uri,
  headers: HeaderMap,
  body: Bytes,
) -> Response {
  let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
  let mut request = GatewayRequest::new(method, path_and_query).with_body(body.to_vec());
  for (name, value) in headers.iter() {
    if is_hop_by_hop(name.as_str()) {
      continue;
    }
    if let Ok(value) = value.to_str() {
      request = request.with_header(name.as_str(), value);
    }
  }

  let (reply, rx) = oneshot::channel();
  if state
    .events
    .send(GatewayEvent::Fetch { request, reply })
    .is_err()
  {
    return shutting_down();
  }

  match rx.await {
    Ok(Ok(response)) => into_response(response),
    Ok(Err(e)) => error_response(&e),
    Err(_) => shutting_down(),
  }
}

fn into_response(response: GatewayResponse) -> Response {
  let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
  let mut builder = Response::builder().status(status);
  for (name, value) in &response.headers {
    if !is_hop_by_hop(name) {
      builder = builder.header(name.as_str(), value.as_str());
    }
  }

  match builder.body(Body::from(response.body)) {
    Ok(response) => response,
    Err(e) => {
      debug!(error = %e, "upstream response not representable");
      error_response(&GatewayError::NetworkUnreachable(e.to_string()))
    }
  }
}

fn error_response(err: &GatewayError) -> Response {
  let status = match err {
    GatewayError::NetworkUnreachable(_) => StatusCode::BAD_GATEWAY,
    GatewayError::MalformedPayload(_) => StatusCode::BAD_REQUEST,
    GatewayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
    GatewayError::ServerRejected { status } => {
      StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
    }
  };

  (
    status,
    Json(json!({
      "status": "error",
      "error": err.code(),
      "message": err.to_string(),
    })),
  )
    .into_response()
}

fn shutting_down() -> Response {
  (
    StatusCode::SERVICE_UNAVAILABLE,
    [(header::RETRY_AFTER, "1")],
    "gateway is shutting down",
  )
    .into_response()
}
