//! Request and response values passed between the listener, the router and
//! the upstream client.

use reqwest::Method;
use serde::{Deserialize, Serialize};

/// Headers that describe a single connection and must not be forwarded.
const HOP_BY_HOP: &[&str] = &[
  "connection",
  "content-length",
  "host",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// Whether a header is connection-scoped and should be dropped when proxying.
pub fn is_hop_by_hop(name: &str) -> bool {
  HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// A request intercepted from the page.
#[derive(Debug, Clone)]
pub struct GatewayRequest {
  pub method: Method,
  /// URL path, always starting with `/`
  pub path: String,
  /// Raw query string without the leading `?`
  pub query: Option<String>,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl GatewayRequest {
  /// Build a request from a method and a `path?query` string.
  ///
  /// Any `#fragment` is dropped; a missing leading slash is added.
  pub fn new(method: Method, path_and_query: &str) -> Self {
    let without_fragment = path_and_query
      .split_once('#')
      .map(|(head, _)| head)
      .unwrap_or(path_and_query);

    let (path, query) = match without_fragment.split_once('?') {
      Some((p, q)) => (p, (!q.is_empty()).then(|| q.to_string())),
      None => (without_fragment, None),
    };

    let path = if path.starts_with('/') {
      path.to_string()
    } else {
      format!("/{}", path)
    };

    Self {
      method,
      path,
      query,
      headers: Vec::new(),
      body: Vec::new(),
    }
  }

  pub fn get(path_and_query: &str) -> Self {
    Self::new(Method::GET, path_and_query)
  }

  /// A JSON `POST`, the shape every submission and resubmission takes.
  pub fn post_json(path_and_query: &str, body: Vec<u8>) -> Self {
    Self::new(Method::POST, path_and_query)
      .with_header("content-type", "application/json")
      .with_body(body)
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: Vec<u8>) -> Self {
    self.body = body;
    self
  }

  /// Path plus query, as sent upstream and used for cache identity.
  pub fn path_and_query(&self) -> String {
    match &self.query {
      Some(q) => format!("{}?{}", self.path, q),
      None => self.path.clone(),
    }
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }

  pub fn content_type(&self) -> Option<&str> {
    self.header("content-type")
  }
}

/// A response returned to the page, either live from upstream, replayed from
/// the cache, or synthesized by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

impl GatewayResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  /// A JSON response with the given status.
  pub fn json(status: u16, value: &serde_json::Value) -> Self {
    Self {
      status,
      headers: vec![("content-type".to_string(), "application/json".to_string())],
      body: value.to_string().into_bytes(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  /// 2xx, the only outcome the gateway treats as delivery.
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    find_header(&self.headers, name)
  }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
  headers
    .iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(name))
    .map(|(_, v)| v.as_str())
}
