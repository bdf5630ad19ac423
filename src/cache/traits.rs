//! Core traits and types for the asset cache.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use sha2::{Digest, Sha256};
use url::Url;

use crate::net::{GatewayRequest, GatewayResponse};

/// Normalized identity of a cacheable (GET) request.
///
/// Only the path and query matter: the gateway fronts a single origin, and
/// fragments never reach the network.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RequestKey {
  url: String,
}

impl RequestKey {
  pub fn for_request(request: &GatewayRequest) -> Self {
    Self::from_path(&request.path_and_query())
  }

  /// Normalize a `path?query` (dot segments, percent-encoding, fragment).
  ///
  /// The input is always taken as a path, so `//host/x` never collapses
  /// into `/x`.
  pub fn from_path(path_and_query: &str) -> Self {
    let without_fragment = path_and_query
      .split('#')
      .next()
      .unwrap_or(path_and_query);
    let (path, query) = match without_fragment.split_once('?') {
      Some((p, q)) => (p, Some(q)),
      None => (without_fragment, None),
    };

    let url = match Url::parse("http://gateway.invalid") {
      Ok(mut u) => {
        u.set_path(path);
        u.set_query(query);
        match u.query() {
          Some(q) => format!("{}?{}", u.path(), q),
          None => u.path().to_string(),
        }
      }
      Err(_) => without_fragment.to_string(),
    };

    Self { url }
  }

  /// The normalized `path?query`.
  pub fn url(&self) -> &str {
    &self.url
  }

  /// SHA256 of the identity, used as the storage key.
  pub fn cache_hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"GET ");
    hasher.update(self.url.as_bytes());
    hex::encode(hasher.finalize())
  }
}

/// A response stored in a cache generation.
#[derive(Debug, Clone)]
pub struct CachedResponse {
  pub response: GatewayResponse,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
}

/// Trait for cache storage backends.
///
/// A backend holds any number of named generations; the gateway decides
/// which one is active. Writes to a generation that was never opened fail.
pub trait CacheStorage: Send + Sync {
  /// Create the generation if it does not exist yet.
  fn open_generation(&self, version: &str) -> Result<()>;

  /// Version tokens of every stored generation.
  fn generations(&self) -> Result<Vec<String>>;

  /// Delete a generation and all of its entries. Returns whether it existed.
  fn delete_generation(&self, version: &str) -> Result<bool>;

  /// Store a response, replacing any previous entry for the key.
  fn put(&self, version: &str, key: &RequestKey, response: &GatewayResponse) -> Result<()>;

  /// Look up an entry in one generation.
  fn get(&self, version: &str, key: &RequestKey) -> Result<Option<CachedResponse>>;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a cache hit.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live response from upstream
  Network,
  /// Served from cache without touching the network
  Cache,
  /// Network failed, serving the last cached copy
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_keeps_query() {
    let key = RequestKey::from_path("/download_qr?id=x");
    assert_eq!(key.url(), "/download_qr?id=x");
    assert_ne!(
      key.cache_hash(),
      RequestKey::from_path("/download_qr?id=y").cache_hash()
    );
  }

  #[test]
  fn test_key_normalizes_path() {
    let a = RequestKey::from_path("/static/../form#section");
    let b = RequestKey::from_path("/form");
    assert_eq!(a, b);
    assert_eq!(a.cache_hash(), b.cache_hash());
  }

  #[test]
  fn test_key_keeps_leading_double_slash() {
    let key = RequestKey::from_path("//evil.example/steal");
    assert_eq!(key.url(), "//evil.example/steal");
    assert_ne!(key, RequestKey::from_path("/steal"));
  }

  #[test]
  fn test_key_for_request_matches_path() {
    let req = GatewayRequest::get("/static/style.css");
    assert_eq!(
      RequestKey::for_request(&req),
      RequestKey::from_path("/static/style.css")
    );
  }

  #[test]
  fn test_hash_is_hex_sha256() {
    let hash = RequestKey::from_path("/").cache_hash();
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
  }
}
