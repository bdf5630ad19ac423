use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use url::Url;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Origin server the gateway forwards to
  pub upstream: String,
  /// Address the gateway listens on
  pub listen: String,
  /// Upstream request timeout; an expired request counts as unreachable
  pub request_timeout_secs: u64,
  /// Where the gateway database and logs live (defaults to the XDG data dir)
  pub data_dir: Option<PathBuf>,
  pub cache: CacheConfig,
  pub routes: RoutesConfig,
  pub retry: RetryConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      upstream: "http://127.0.0.1:5000".to_string(),
      listen: "127.0.0.1:8080".to_string(),
      request_timeout_secs: 30,
      data_dir: None,
      cache: CacheConfig::default(),
      routes: RoutesConfig::default(),
      retry: RetryConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Version token of the cache generation this gateway installs
  pub version: String,
  /// Paths pre-cached at install time
  pub manifest: Vec<String>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      version: "app-cache-v1".to_string(),
      manifest: vec![
        "/".to_string(),
        "/form".to_string(),
        "/static/style.css".to_string(),
        "/favicon.ico".to_string(),
      ],
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RoutesConfig {
  /// The form entry point; must be part of the manifest
  pub form_path: String,
  /// POST paths whose failures are queued for later delivery
  pub submit_paths: Vec<String>,
  /// GET path prefixes served network-first and cached on success
  pub artifact_prefixes: Vec<String>,
  /// Requests the gateway never intercepts, as `METHOD /path` or a bare
  /// `/path` for every method
  pub passthrough_paths: Vec<String>,
}

impl Default for RoutesConfig {
  fn default() -> Self {
    Self {
      form_path: "/form".to_string(),
      submit_paths: vec!["/submit".to_string()],
      artifact_prefixes: vec!["/download_qr".to_string()],
      passthrough_paths: vec!["POST /upload_qr".to_string()],
    }
  }
}

impl RoutesConfig {
  /// Whether a request matches a pass-through entry.
  pub fn is_passthrough(&self, method: &str, path: &str) -> bool {
    self
      .passthrough_paths
      .iter()
      .any(|entry| match entry.trim().split_once(' ') {
        Some((m, p)) => m.eq_ignore_ascii_case(method) && p.trim() == path,
        None => entry.trim() == path,
      })
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
  /// Maximum concurrent resubmissions during a drain
  pub concurrency: usize,
}

impl Default for RetryConfig {
  fn default() -> Self {
    Self { concurrency: 4 }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./formgate.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/formgate/config.yaml
  ///
  /// Without any file the built-in defaults are used. Environment overrides
  /// are applied on top, then the result is validated.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Self::default(),
    };

    config.apply_env_overrides();
    config.validate()?;

    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("formgate.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("formgate").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn from_yaml(contents: &str) -> Result<Self> {
    Ok(serde_yaml::from_str(contents)?)
  }

  /// Apply FORMGATE_UPSTREAM and FORMGATE_LISTEN if set.
  fn apply_env_overrides(&mut self) {
    if let Ok(upstream) = std::env::var("FORMGATE_UPSTREAM") {
      self.upstream = upstream;
    }
    if let Ok(listen) = std::env::var("FORMGATE_LISTEN") {
      self.listen = listen;
    }
  }

  /// Check the invariants the gateway relies on.
  ///
  /// The app shell only works offline if the root document and the form
  /// entry point are pre-cached.
  pub fn validate(&self) -> Result<()> {
    Url::parse(&self.upstream)
      .map_err(|e| eyre!("Invalid upstream URL {}: {}", self.upstream, e))?;

    if self.cache.version.trim().is_empty() {
      return Err(eyre!("cache.version must not be empty"));
    }

    for required in ["/", self.routes.form_path.as_str()] {
      if !self.cache.manifest.iter().any(|p| p == required) {
        return Err(eyre!("cache.manifest must include {}", required));
      }
    }

    for entry in &self.routes.passthrough_paths {
      let path = entry.trim().rsplit(' ').next().unwrap_or_default();
      if !path.starts_with('/') {
        return Err(eyre!("routes.passthrough_paths entry '{}' needs a /path", entry));
      }
    }

    if self.routes.submit_paths.is_empty() {
      return Err(eyre!("routes.submit_paths must name at least one endpoint"));
    }

    if self.retry.concurrency == 0 {
      return Err(eyre!("retry.concurrency must be at least 1"));
    }

    Ok(())
  }

  /// Directory holding the gateway database and log files.
  pub fn data_dir(&self) -> Result<PathBuf> {
    if let Some(dir) = &self.data_dir {
      return Ok(dir.clone());
    }

    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("formgate"))
  }

  /// The first configured submission endpoint, used as the default replay target.
  pub fn default_submit_path(&self) -> &str {
    self
      .routes
      .submit_paths
      .first()
      .map(String::as_str)
      .unwrap_or("/submit")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults_are_valid() {
    let config = Config::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.default_submit_path(), "/submit");
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "upstream: http://origin.local:9000\ncache:\n  version: app-cache-v2\n  manifest: ['/', '/form']\n",
    )
    .unwrap();
    assert_eq!(config.upstream, "http://origin.local:9000");
    assert_eq!(config.cache.version, "app-cache-v2");
    assert_eq!(config.cache.manifest, vec!["/", "/form"]);
    assert_eq!(config.routes.submit_paths, vec!["/submit"]);
    assert_eq!(config.retry.concurrency, 4);
  }

  #[test]
  fn test_manifest_must_include_app_shell() {
    let mut config = Config::default();
    config.cache.manifest = vec!["/".to_string(), "/static/style.css".to_string()];
    let err = config.validate().unwrap_err();
    assert!(err.to_string().contains("/form"));

    config.cache.manifest = vec!["/form".to_string()];
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_passthrough_entries_are_method_aware() {
    let mut routes = RoutesConfig::default();
    assert!(routes.is_passthrough("POST", "/upload_qr"));
    assert!(routes.is_passthrough("post", "/upload_qr"));
    assert!(!routes.is_passthrough("GET", "/upload_qr"));

    routes.passthrough_paths.push("/health".to_string());
    assert!(routes.is_passthrough("GET", "/health"));
    assert!(routes.is_passthrough("DELETE", "/health"));
  }

  #[test]
  fn test_rejects_passthrough_without_path() {
    let mut config = Config::default();
    config.routes.passthrough_paths = vec!["POST upload".to_string()];
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_rejects_bad_upstream() {
    let config = Config {
      upstream: "::nope".to_string(),
      ..Config::default()
    };
    assert!(config.validate().is_err());
  }

  #[test]
  fn test_explicit_missing_path_errors() {
    let err = Config::load(Some(Path::new("/definitely/not/here.yaml"))).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));
  }

  #[test]
  fn test_explicit_data_dir_wins() {
    let config = Config {
      data_dir: Some(PathBuf::from("/tmp/fg")),
      ..Config::default()
    };
    assert_eq!(config.data_dir().unwrap(), PathBuf::from("/tmp/fg"));
  }
}
