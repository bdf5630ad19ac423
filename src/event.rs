use tokio::sync::{mpsc, oneshot};
use tracing::info;

use crate::error::GatewayError;
use crate::net::{GatewayRequest, GatewayResponse};

/// Sync tag that asks for a submission queue drain.
pub const SYNC_TAG: &str = "retryFormData";

/// Reply channel for an intercepted request
pub type FetchReply = oneshot::Sender<Result<GatewayResponse, GatewayError>>;

/// Gateway events
#[derive(Debug)]
pub enum GatewayEvent {
  /// Install a cache generation (the configured version when `None`)
  Install { version: Option<String> },
  /// Activate the most recently installed generation
  Activate,
  /// A request intercepted from the page
  Fetch {
    request: GatewayRequest,
    reply: FetchReply,
  },
  /// Connectivity signal; only `SYNC_TAG` triggers a drain
  Sync { tag: String },
  /// An event kind this gateway has no handler for
  Other { kind: String },
  /// Stop the event loop
  Shutdown,
}

impl GatewayEvent {
  /// The connectivity signal that drains the submission queue.
  pub fn sync() -> Self {
    Self::Sync {
      tag: SYNC_TAG.to_string(),
    }
  }
}

/// Event handler that collects events from the listener, the router and
/// the process signal handler
pub struct EventHandler {
  tx: mpsc::UnboundedSender<GatewayEvent>,
  rx: mpsc::UnboundedReceiver<GatewayEvent>,
}

impl EventHandler {
  /// Create a new event handler that also turns Ctrl-C into `Shutdown`
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    let shutdown_tx = tx.clone();
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        info!("interrupt received, shutting down");
        let _ = shutdown_tx.send(GatewayEvent::Shutdown);
      }
    });

    Self { tx, rx }
  }

  /// Sender half for producers
  pub fn sender(&self) -> mpsc::UnboundedSender<GatewayEvent> {
    self.tx.clone()
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<GatewayEvent> {
    self.rx.recv().await
  }
}
