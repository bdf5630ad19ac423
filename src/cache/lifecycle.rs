//! Cache generation lifecycle: install, activate, supersede.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::GatewayError;
use crate::net::{GatewayRequest, Upstream};

use super::layer::CacheLayer;
use super::traits::RequestKey;

/// Lifecycle state of one cache generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
  Installing,
  /// Pre-cached and waiting for activation
  Installed,
  Activating,
  Active,
  /// Replaced by a newer generation; its entries are gone
  Superseded,
}

impl fmt::Display for LifecycleState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Self::Installing => "installing",
      Self::Installed => "installed",
      Self::Activating => "activating",
      Self::Active => "active",
      Self::Superseded => "superseded",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct Generation {
  pub version: String,
  pub state: LifecycleState,
}

/// Outcome of pre-caching the manifest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InstallReport {
  pub version: String,
  pub cached: Vec<String>,
  /// Paths that could not be cached, with the reason
  pub failed: Vec<(String, String)>,
}

/// Outcome of activating a generation.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ActivateReport {
  pub version: String,
  /// Generations deleted during activation
  pub purged: Vec<String>,
}

#[derive(Default)]
struct Generations {
  /// The generation being installed or serving reads
  current: Option<Generation>,
  /// The generation still serving while its successor installs
  previous: Option<Generation>,
}

/// Owns cache versioning.
///
/// Installing pre-fetches the manifest into a new generation while the
/// previous one keeps serving; activating switches reads over and deletes
/// every other generation unconditionally.
pub struct Lifecycle {
  cache: Arc<CacheLayer>,
  upstream: Arc<dyn Upstream>,
  manifest: Vec<String>,
  generations: Mutex<Generations>,
}

impl Lifecycle {
  pub fn new(cache: Arc<CacheLayer>, upstream: Arc<dyn Upstream>, manifest: Vec<String>) -> Self {
    Self {
      cache,
      upstream,
      manifest,
      generations: Mutex::new(Generations::default()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, Generations> {
    self
      .generations
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }

  /// State of the generation being installed or serving, if any.
  pub fn state(&self) -> Option<LifecycleState> {
    self.lock().current.as_ref().map(|g| g.state)
  }

  /// Every generation this gateway knows about, newest first.
  pub fn generations(&self) -> Vec<Generation> {
    let generations = self.lock();
    generations
      .current
      .iter()
      .chain(generations.previous.iter())
      .cloned()
      .collect()
  }

  fn set_state(&self, state: LifecycleState) {
    if let Some(current) = self.lock().current.as_mut() {
      current.state = state;
    }
  }

  /// Open the generation for `version` and pre-cache the manifest.
  ///
  /// Manifest entries are fetched concurrently and each may fail on its own;
  /// installation only fails when the generation cannot be opened at all.
  pub async fn install(&self, version: &str) -> Result<InstallReport, GatewayError> {
    {
      let mut generations = self.lock();
      let replacing = generations
        .current
        .as_ref()
        .is_some_and(|g| g.version != version && g.state == LifecycleState::Active);
      if replacing {
        generations.previous = generations.current.take();
      }
      generations.current = Some(Generation {
        version: version.to_string(),
        state: LifecycleState::Installing,
      });
    }
    info!(version, "installing cache generation");

    self
      .cache
      .storage()
      .open_generation(version)
      .map_err(GatewayError::store)?;

    let outcomes = join_all(
      self
        .manifest
        .iter()
        .map(|path| async move { (path.clone(), self.precache(version, path).await) }),
    )
    .await;

    let mut report = InstallReport {
      version: version.to_string(),
      ..InstallReport::default()
    };
    for (path, outcome) in outcomes {
      match outcome {
        Ok(()) => report.cached.push(path),
        Err(reason) => {
          warn!(version, path = %path, reason = %reason, "failed to pre-cache");
          report.failed.push((path, reason));
        }
      }
    }

    self.set_state(LifecycleState::Installed);
    info!(
      version,
      cached = report.cached.len(),
      failed = report.failed.len(),
      "cache generation installed"
    );
    Ok(report)
  }

  /// Fetch one manifest path and store it; only 2xx responses count.
  async fn precache(&self, version: &str, path: &str) -> Result<(), String> {
    let request = GatewayRequest::get(path);
    let response = self
      .upstream
      .send(&request)
      .await
      .map_err(|e| e.to_string())?;

    if !response.is_success() {
      return Err(format!("status {}", response.status));
    }

    self
      .cache
      .storage()
      .put(version, &RequestKey::for_request(&request), &response)
      .map_err(|e| e.to_string())
  }

  /// Make the installed generation active and delete every other one.
  ///
  /// Takes over immediately: pages already open may mix assets from two
  /// generations until they reload.
  pub async fn activate(&self) -> Result<ActivateReport, GatewayError> {
    let version = {
      let generations = self.lock();
      match &generations.current {
        Some(g) => g.version.clone(),
        None => {
          return Err(GatewayError::StoreUnavailable(
            "no cache generation installed".to_string(),
          ))
        }
      }
    };

    self.set_state(LifecycleState::Activating);
    info!(version = %version, "activating cache generation");

    let storage = self.cache.storage();
    let mut purged = Vec::new();
    for old in storage.generations().map_err(GatewayError::store)? {
      if old != version {
        info!(version = %old, "removing old cache generation");
        storage
          .delete_generation(&old)
          .map_err(GatewayError::store)?;
        purged.push(old);
      }
    }

    self.cache.set_active(&version);
    {
      let mut generations = self.lock();
      if let Some(current) = generations.current.as_mut() {
        current.state = LifecycleState::Active;
      }
      if let Some(previous) = generations.previous.as_mut() {
        previous.state = LifecycleState::Superseded;
      }
    }

    Ok(ActivateReport { version, purged })
  }

  /// Install followed by immediate activation.
  pub async fn install_and_activate(
    &self,
    version: &str,
  ) -> Result<(InstallReport, ActivateReport), GatewayError> {
    let installed = self.install(version).await?;
    let activated = self.activate().await?;
    Ok((installed, activated))
  }
}
