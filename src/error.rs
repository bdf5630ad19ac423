//! Failure taxonomy for the gateway's request handling.

use thiserror::Error;

/// Errors produced while routing a request through the gateway.
///
/// The router branches on these: transport failures and server rejections
/// are recovered locally where a fallback exists, malformed payloads are
/// never queued, and store failures degrade to plain network access.
#[derive(Debug, Error)]
pub enum GatewayError {
  /// Transport-level failure (connection refused, DNS, timeout).
  #[error("upstream unreachable: {0}")]
  NetworkUnreachable(String),

  /// The upstream answered with a non-success status.
  #[error("upstream rejected the request with status {status}")]
  ServerRejected { status: u16 },

  /// A write request whose body cannot be interpreted as a submission.
  #[error("malformed payload: {0}")]
  MalformedPayload(String),

  /// The cache or queue store could not be used.
  #[error("store unavailable: {0}")]
  StoreUnavailable(String),
}

impl GatewayError {
  /// Wrap a storage backend failure.
  pub fn store(err: impl std::fmt::Display) -> Self {
    Self::StoreUnavailable(err.to_string())
  }

  /// Stable machine-readable code used in synthesized error bodies.
  pub fn code(&self) -> &'static str {
    match self {
      Self::NetworkUnreachable(_) => "network_unreachable",
      Self::ServerRejected { .. } => "server_rejected",
      Self::MalformedPayload(_) => "malformed_payload",
      Self::StoreUnavailable(_) => "store_unavailable",
    }
  }
}
