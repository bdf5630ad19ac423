//! Scripted upstream for tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::GatewayError;

use super::client::Upstream;
use super::types::{GatewayRequest, GatewayResponse};

/// Upstream whose responses are configured per `path?query`.
///
/// Unknown paths answer 404. While offline, or for paths marked as failing,
/// every request fails with `NetworkUnreachable`. Every request is recorded,
/// including the ones that fail.
pub struct FakeUpstream {
  online: AtomicBool,
  routes: Mutex<HashMap<String, GatewayResponse>>,
  failing: Mutex<HashSet<String>>,
  calls: Mutex<Vec<GatewayRequest>>,
}

impl Default for FakeUpstream {
  fn default() -> Self {
    Self {
      online: AtomicBool::new(true),
      routes: Mutex::new(HashMap::new()),
      failing: Mutex::new(HashSet::new()),
      calls: Mutex::new(Vec::new()),
    }
  }
}

impl FakeUpstream {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  pub fn route(&self, path_and_query: &str, response: GatewayResponse) {
    self
      .routes
      .lock()
      .unwrap()
      .insert(path_and_query.to_string(), response);
  }

  pub fn fail_path(&self, path_and_query: &str) {
    self
      .failing
      .lock()
      .unwrap()
      .insert(path_and_query.to_string());
  }

  pub fn calls(&self) -> Vec<GatewayRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn reset_calls(&self) {
    self.calls.lock().unwrap().clear();
  }
}

#[async_trait]
impl Upstream for FakeUpstream {
  async fn send(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
    self.calls.lock().unwrap().push(request.clone());

    let key = request.path_and_query();
    if !self.online.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&key) {
      return Err(GatewayError::NetworkUnreachable("connection refused".into()));
    }

    Ok(
      self
        .routes
        .lock()
        .unwrap()
        .get(&key)
        .cloned()
        .unwrap_or_else(|| GatewayResponse::new(404, "not found")),
    )
  }
}
