//! Upstream access: request/response values and the HTTP client.

mod client;
#[cfg(test)]
pub mod fake;
mod types;

pub use client::{HttpUpstream, Upstream};
pub use types::{is_hop_by_hop, GatewayRequest, GatewayResponse};
