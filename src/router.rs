//! Request classification and the four interception strategies.

use std::sync::Arc;

use reqwest::Method;
use serde_json::json;
use tracing::{debug, error, warn};

use crate::cache::{CacheLayer, CacheSource, RequestKey};
use crate::config::RoutesConfig;
use crate::connectivity::Connectivity;
use crate::error::GatewayError;
use crate::net::{GatewayRequest, GatewayResponse, Upstream};
use crate::queue::{InFlight, QueuedSubmission, SubmissionQueue};

const SAVED_MESSAGE: &str = "Form data saved locally, will retry later";

/// How a request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Forward untouched, no caching or queuing
  PassThrough,
  /// Submission: network, queue on failure
  QueueFallback,
  /// Downloadable artifact: network, cache on success, cached copy on failure
  NetworkFirst,
  /// Static asset: cached copy, network on a miss
  CacheFirst,
}

/// Routes every intercepted request through exactly one strategy.
pub struct Router {
  routes: RoutesConfig,
  cache: Arc<CacheLayer>,
  queue: SubmissionQueue,
  upstream: Arc<dyn Upstream>,
  connectivity: Arc<Connectivity>,
  inflight: Arc<InFlight>,
}

impl Router {
  pub fn new(
    routes: RoutesConfig,
    cache: Arc<CacheLayer>,
    queue: SubmissionQueue,
    upstream: Arc<dyn Upstream>,
    connectivity: Arc<Connectivity>,
    inflight: Arc<InFlight>,
  ) -> Self {
    Self {
      routes,
      cache,
      queue,
      upstream,
      connectivity,
      inflight,
    }
  }

  /// Pick the strategy for a request. Rules apply in order, first match wins.
  pub fn classify(&self, request: &GatewayRequest) -> Strategy {
    let path = request.path.as_str();

    if self.routes.is_passthrough(request.method.as_str(), path) {
      return Strategy::PassThrough;
    }

    if request.method == Method::POST {
      if self.routes.submit_paths.iter().any(|p| p == path) {
        return Strategy::QueueFallback;
      }
    } else if request.method == Method::GET {
      let artifact = self
        .routes
        .artifact_prefixes
        .iter()
        .any(|prefix| path.starts_with(prefix.as_str()));
      return if artifact {
        Strategy::NetworkFirst
      } else {
        Strategy::CacheFirst
      };
    }

    Strategy::PassThrough
  }

  /// Handle one intercepted request.
  ///
  /// Any cache or queue write the strategy performs has finished before
  /// this returns.
  pub async fn handle(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
    let strategy = self.classify(&request);
    debug!(method = %request.method, path = %request.path, ?strategy, "routing request");

    match strategy {
      Strategy::PassThrough => self.forward(&request).await,
      Strategy::QueueFallback => self.submit_with_fallback(&request).await,
      Strategy::NetworkFirst => {
        let key = RequestKey::for_request(&request);
        let result = self
          .cache
          .fetch_network_first(&key, || self.forward(&request))
          .await?;
        if result.source == CacheSource::Offline {
          debug!(path = %request.path, cached_at = ?result.cached_at, "served artifact from cache");
        }
        Ok(result.data)
      }
      Strategy::CacheFirst => {
        let key = RequestKey::for_request(&request);
        let result = self
          .cache
          .fetch_cache_first(&key, || self.forward(&request))
          .await?;
        Ok(result.data)
      }
    }
  }

  /// Send a request upstream, feeding the outcome to reachability tracking.
  async fn forward(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
    match self.upstream.send(request).await {
      Ok(response) => {
        self.connectivity.mark_reachable();
        Ok(response)
      }
      Err(e) => {
        if matches!(e, GatewayError::NetworkUnreachable(_)) {
          self.connectivity.mark_unreachable();
        }
        Err(e)
      }
    }
  }

  /// Deliver a submission, queuing it when the upstream cannot take it.
  ///
  /// A queued submission is answered with a synthesized success carrying
  /// the record's id. When queuing itself is impossible the caller sees the
  /// original outcome instead: the upstream's response if there was one,
  /// otherwise the queuing error.
  async fn submit_with_fallback(
    &self,
    request: &GatewayRequest,
  ) -> Result<GatewayResponse, GatewayError> {
    let _live = QueuedSubmission::peek_id(&request.body).map(|id| self.inflight.claim(&id));

    let (failure, rejected) = match self.forward(request).await {
      Ok(response) if response.is_success() => return Ok(response),
      Ok(response) => (
        GatewayError::ServerRejected {
          status: response.status,
        },
        Some(response),
      ),
      Err(e) => (e, None),
    };
    warn!(path = %request.path, error = %failure, "submission failed, saving locally");

    let record = match QueuedSubmission::from_request(request) {
      Ok(record) => record,
      Err(e) => {
        warn!(path = %request.path, error = %e, "cannot queue submission");
        return rejected.ok_or(e);
      }
    };

    if let Err(e) = self.queue.enqueue(&record) {
      error!(id = %record.id, error = %e, "failed to queue submission");
      return rejected.ok_or(e);
    }
    debug!(id = %record.id, target = %record.target_url, "submission queued");

    self.connectivity.register_sync();

    let status = if rejected.is_some() { "saved" } else { "offline" };
    Ok(GatewayResponse::json(
      200,
      &json!({
        "status": status,
        "id": record.id,
        "message": SAVED_MESSAGE,
      }),
    ))
  }
}
