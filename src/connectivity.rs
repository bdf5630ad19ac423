//! Upstream reachability tracking and the connectivity signal.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::event::GatewayEvent;

/// Tracks whether the upstream is reachable and emits the connectivity
/// signal.
///
/// The signal is edge-triggered: it fires when a request succeeds after one
/// failed at the transport level, never on a timer.
pub struct Connectivity {
  offline: AtomicBool,
  signals: Option<mpsc::UnboundedSender<GatewayEvent>>,
}

impl Connectivity {
  pub fn new(signals: Option<mpsc::UnboundedSender<GatewayEvent>>) -> Self {
    Self {
      offline: AtomicBool::new(false),
      signals,
    }
  }

  pub fn is_reachable(&self) -> bool {
    !self.offline.load(Ordering::SeqCst)
  }

  pub fn mark_unreachable(&self) {
    if !self.offline.swap(true, Ordering::SeqCst) {
      info!("upstream became unreachable");
    }
  }

  /// Record a transport-level success. Returns whether this was the
  /// offline-to-online edge (in which case a sync was signalled).
  pub fn mark_reachable(&self) -> bool {
    if self.offline.swap(false, Ordering::SeqCst) {
      info!("upstream reachable again, scheduling queue drain");
      self.signal();
      true
    } else {
      false
    }
  }

  /// Ask for a drain as soon as the upstream is reachable.
  ///
  /// Fires right away when it already is; otherwise the next reachability
  /// edge takes care of it.
  pub fn register_sync(&self) {
    if self.is_reachable() {
      self.signal();
    } else {
      debug!("sync deferred until upstream is reachable");
    }
  }

  fn signal(&self) {
    if let Some(tx) = &self.signals {
      let _ = tx.send(GatewayEvent::sync());
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn drain_syncs(rx: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = rx.try_recv() {
      if matches!(event, GatewayEvent::Sync { .. }) {
        count += 1;
      }
    }
    count
  }

  #[test]
  fn test_signal_only_on_edge() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connectivity = Connectivity::new(Some(tx));

    assert!(!connectivity.mark_reachable());
    assert_eq!(drain_syncs(&mut rx), 0);

    connectivity.mark_unreachable();
    connectivity.mark_unreachable();
    assert!(!connectivity.is_reachable());

    assert!(connectivity.mark_reachable());
    assert!(!connectivity.mark_reachable());
    assert_eq!(drain_syncs(&mut rx), 1);
  }

  #[test]
  fn test_register_sync_defers_while_offline() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let connectivity = Connectivity::new(Some(tx));

    connectivity.register_sync();
    assert_eq!(drain_syncs(&mut rx), 1);

    connectivity.mark_unreachable();
    connectivity.register_sync();
    assert_eq!(drain_syncs(&mut rx), 0);

    connectivity.mark_reachable();
    assert_eq!(drain_syncs(&mut rx), 1);
  }

  #[test]
  fn test_without_channel_is_silent() {
    let connectivity = Connectivity::new(None);
    connectivity.mark_unreachable();
    assert!(connectivity.mark_reachable());
  }
}
