use std::time::Duration;

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use url::Url;

use crate::config::Config;
use crate::error::GatewayError;

use super::types::{is_hop_by_hop, GatewayRequest, GatewayResponse};

/// The network side of the gateway.
///
/// Implementations return `Ok` for every response the origin produced,
/// whatever its status, and `Err(NetworkUnreachable)` only when no response
/// was obtained at all.
#[async_trait]
pub trait Upstream: Send + Sync {
  async fn send(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError>;
}

/// HTTP client for the origin server behind the gateway
#[derive(Clone)]
pub struct HttpUpstream {
  client: reqwest::Client,
  base: Url,
}

impl HttpUpstream {
  pub fn new(config: &Config) -> Result<Self> {
    let base = Url::parse(&config.upstream)
      .map_err(|e| eyre!("Invalid upstream URL {}: {}", config.upstream, e))?;

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.request_timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self { client, base })
  }

  /// Target URL on the upstream origin.
  ///
  /// Only the path and query come from the request; scheme, host and port
  /// always stay those of the configured origin.
  fn resolve(&self, request: &GatewayRequest) -> Url {
    let mut url = self.base.clone();
    url.set_path(&request.path);
    url.set_query(request.query.as_deref());
    url.set_fragment(None);
    url
  }
}

#[async_trait]
impl Upstream for HttpUpstream {
  async fn send(&self, request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
    let url = self.resolve(request);

    let mut builder = self.client.request(request.method.clone(), url);
    for (name, value) in &request.headers {
      if !is_hop_by_hop(name) {
        builder = builder.header(name.as_str(), value.as_str());
      }
    }
    if !request.body.is_empty() {
      builder = builder.body(request.body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| GatewayError::NetworkUnreachable(e.to_string()))?;

    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter(|(name, _)| !is_hop_by_hop(name.as_str()))
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    // A body cut off mid-stream is as good as no response.
    let body = response
      .bytes()
      .await
      .map_err(|e| GatewayError::NetworkUnreachable(e.to_string()))?
      .to_vec();

    Ok(GatewayResponse {
      status,
      headers,
      body,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn upstream(base: &str) -> HttpUpstream {
    let config = Config {
      upstream: base.to_string(),
      ..Config::default()
    };
    HttpUpstream::new(&config).unwrap()
  }

  #[test]
  fn test_resolves_against_base() {
    let up = upstream("http://127.0.0.1:5000");
    let url = up.resolve(&GatewayRequest::get("/download_qr?id=x"));
    assert_eq!(url.as_str(), "http://127.0.0.1:5000/download_qr?id=x");
  }

  #[test]
  fn test_scheme_relative_target_stays_on_upstream() {
    let up = upstream("http://127.0.0.1:5000");
    let url = up.resolve(&GatewayRequest::get("//evil.example/steal?x=1"));
    assert_eq!(url.host_str(), Some("127.0.0.1"));
    assert_eq!(url.port(), Some(5000));
    assert_eq!(url.path(), "//evil.example/steal");
    assert_eq!(url.query(), Some("x=1"));
  }

  #[test]
  fn test_rejects_invalid_base() {
    let config = Config {
      upstream: "not a url".to_string(),
      ..Config::default()
    };
    assert!(HttpUpstream::new(&config).is_err());
  }

  #[tokio::test]
  async fn test_refused_connection_is_unreachable() {
    // Port 9 (discard) is closed on any sane test host.
    let up = upstream("http://127.0.0.1:9");
    let err = up.send(&GatewayRequest::get("/")).await.unwrap_err();
    assert!(matches!(err, GatewayError::NetworkUnreachable(_)));
  }
}
