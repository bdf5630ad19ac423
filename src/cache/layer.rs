//! Cache layer that orchestrates caching logic with network fetching.

use std::future::Future;
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::net::GatewayResponse;

use super::traits::{CacheResult, CacheStorage, CachedResponse, RequestKey};

/// Cache layer that manages caching logic and network fetching.
///
/// Reads and opportunistic writes always target the active generation; until
/// a generation has been activated every lookup misses. Storage failures never
/// fail a request here: a broken store behaves like an empty one.
pub struct CacheLayer {
  storage: Arc<dyn CacheStorage>,
  /// Version token of the generation serving reads
  active: RwLock<Option<String>>,
}

impl CacheLayer {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: Arc<dyn CacheStorage>) -> Self {
    Self {
      storage,
      active: RwLock::new(None),
    }
  }

  pub fn storage(&self) -> &Arc<dyn CacheStorage> {
    &self.storage
  }

  /// The generation currently serving reads, if any.
  pub fn active_version(&self) -> Option<String> {
    self.active.read().ok().and_then(|v| v.clone())
  }

  /// Switch reads and writes over to `version`.
  pub fn set_active(&self, version: &str) {
    match self.active.write() {
      Ok(mut active) => *active = Some(version.to_string()),
      Err(poisoned) => *poisoned.into_inner() = Some(version.to_string()),
    }
  }

  /// Look up a key in the active generation.
  pub fn lookup(&self, key: &RequestKey) -> Result<Option<CachedResponse>, GatewayError> {
    let Some(version) = self.active_version() else {
      return Ok(None);
    };
    self.storage.get(&version, key).map_err(GatewayError::store)
  }

  /// Store a response in the active generation. Returns whether it was stored.
  pub fn store(&self, key: &RequestKey, response: &GatewayResponse) -> Result<bool, GatewayError> {
    let Some(version) = self.active_version() else {
      return Ok(false);
    };
    self
      .storage
      .put(&version, key, response)
      .map_err(GatewayError::store)?;
    Ok(true)
  }

  /// Lookup that treats an unusable store as a miss.
  fn lookup_or_miss(&self, key: &RequestKey) -> Option<CachedResponse> {
    match self.lookup(key) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url = key.url(), error = %e, "cache lookup failed, going to network");
        None
      }
    }
  }

  /// Serve from cache, falling back to the network on a miss.
  ///
  /// The network response is not written back; only install-time
  /// pre-caching populates these entries. A network failure on a miss
  /// propagates unchanged.
  pub async fn fetch_cache_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<GatewayResponse>, GatewayError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<GatewayResponse, GatewayError>>,
  {
    if let Some(cached) = self.lookup_or_miss(key) {
      return Ok(CacheResult::from_cache(cached.response, cached.cached_at));
    }

    let data = fetcher().await?;
    Ok(CacheResult::from_network(data))
  }

  /// Fetch from the network, keeping a copy of every successful response.
  ///
  /// 1. Fetch from network
  /// 2. On success, overwrite the cached copy before returning
  /// 3. On failure or a non-success status, serve the cached copy (offline mode)
  /// 4. With nothing cached, return the upstream response or error as-is
  pub async fn fetch_network_first<F, Fut>(
    &self,
    key: &RequestKey,
    fetcher: F,
  ) -> Result<CacheResult<GatewayResponse>, GatewayError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<GatewayResponse, GatewayError>>,
  {
    match fetcher().await {
      Ok(data) if data.is_success() => {
        // The write completes (or fails) before the caller sees the response.
        match self.store(key, &data) {
          Ok(true) => debug!(url = key.url(), "cached network response"),
          Ok(false) => debug!(url = key.url(), "no active cache generation, not caching"),
          Err(e) => warn!(url = key.url(), error = %e, "failed to cache network response"),
        }
        Ok(CacheResult::from_network(data))
      }
      Ok(data) => match self.lookup_or_miss(key) {
        Some(cached) => {
          warn!(url = key.url(), status = data.status, "upstream rejected, serving cached copy");
          Ok(CacheResult::offline(cached.response, cached.cached_at))
        }
        None => Ok(CacheResult::from_network(data)),
      },
      Err(e) => match self.lookup_or_miss(key) {
        Some(cached) => {
          warn!(url = key.url(), error = %e, "network failed, serving cached copy");
          Ok(CacheResult::offline(cached.response, cached.cached_at))
        }
        None => Err(e),
      },
    }
  }
}
