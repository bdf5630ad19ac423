//! Replays queued submissions once the upstream is reachable again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::{stream, StreamExt};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::connectivity::Connectivity;
use crate::error::GatewayError;
use crate::net::{GatewayRequest, Upstream};

use super::inflight::InFlight;
use super::record::QueuedSubmission;
use super::SubmissionQueue;

/// Summary of one or more drains.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
  /// Records resubmitted
  pub attempted: usize,
  /// Records acknowledged and removed
  pub delivered: usize,
  /// Records left queued after a failed resubmission
  pub failed: usize,
  /// Records left alone because a live request held their id
  pub skipped: usize,
  /// The signal was folded into a drain already running
  pub coalesced: bool,
}

impl DrainReport {
  fn merge(&mut self, other: DrainReport) {
    self.attempted += other.attempted;
    self.delivered += other.delivered;
    self.failed += other.failed;
    self.skipped += other.skipped;
  }
}

enum Outcome {
  Delivered,
  Failed,
  Skipped,
}

/// Drains the submission queue.
///
/// No backoff and no attempt limit: a record stays queued until the
/// upstream acknowledges it, and the upstream deduplicates on `id`.
pub struct RetryCoordinator {
  queue: SubmissionQueue,
  upstream: Arc<dyn Upstream>,
  inflight: Arc<InFlight>,
  connectivity: Arc<Connectivity>,
  /// Target for records queued without one
  default_target: String,
  concurrency: usize,
  draining: AtomicBool,
  rerun: AtomicBool,
}

impl RetryCoordinator {
  pub fn new(
    queue: SubmissionQueue,
    upstream: Arc<dyn Upstream>,
    inflight: Arc<InFlight>,
    connectivity: Arc<Connectivity>,
    default_target: &str,
    concurrency: usize,
  ) -> Self {
    Self {
      queue,
      upstream,
      inflight,
      connectivity,
      default_target: default_target.to_string(),
      concurrency: concurrency.max(1),
      draining: AtomicBool::new(false),
      rerun: AtomicBool::new(false),
    }
  }

  /// Drain the queue.
  ///
  /// Drains never overlap. A signal arriving mid-drain is folded into one
  /// follow-up pass run by the drain already in progress.
  pub async fn drain(&self) -> DrainReport {
    if self.draining.swap(true, Ordering::SeqCst) {
      self.rerun.store(true, Ordering::SeqCst);
      debug!("drain already running, scheduling another pass");
      return DrainReport {
        coalesced: true,
        ..DrainReport::default()
      };
    }

    let mut report = DrainReport::default();
    loop {
      report.merge(self.drain_once().await);
      if self.rerun.swap(false, Ordering::SeqCst) {
        continue;
      }

      self.draining.store(false, Ordering::SeqCst);
      // A signal may have landed between the check above and the release.
      if self.rerun.swap(false, Ordering::SeqCst) && !self.draining.swap(true, Ordering::SeqCst) {
        continue;
      }
      break;
    }

    info!(
      attempted = report.attempted,
      delivered = report.delivered,
      failed = report.failed,
      skipped = report.skipped,
      "queue drain finished"
    );
    report
  }

  async fn drain_once(&self) -> DrainReport {
    let mut snapshot = Vec::new();
    for record in self.queue.list_all() {
      match record {
        Ok(record) => snapshot.push(record),
        Err(e) => {
          error!(error = %e, "failed to read submission queue");
          break;
        }
      }
    }

    let mut report = DrainReport::default();
    if snapshot.is_empty() {
      return report;
    }
    debug!(queued = snapshot.len(), "draining submission queue");

    let outcomes: Vec<Outcome> = stream::iter(snapshot)
      .map(|record| self.resubmit(record))
      .buffer_unordered(self.concurrency)
      .collect()
      .await;

    for outcome in outcomes {
      match outcome {
        Outcome::Delivered => {
          report.attempted += 1;
          report.delivered += 1;
        }
        Outcome::Failed => {
          report.attempted += 1;
          report.failed += 1;
        }
        Outcome::Skipped => report.skipped += 1,
      }
    }
    report
  }

  async fn resubmit(&self, record: QueuedSubmission) -> Outcome {
    if self.inflight.is_live(&record.id) {
      debug!(id = %record.id, "live request holds this id, skipping");
      return Outcome::Skipped;
    }

    let target = if record.target_url.is_empty() {
      self.default_target.as_str()
    } else {
      record.target_url.as_str()
    };
    let request = GatewayRequest::post_json(target, record.payload.clone());

    match self.upstream.send(&request).await {
      Ok(response) if response.is_success() => match self.queue.remove_delivered(&record) {
        Ok(true) => {
          info!(id = %record.id, target, "resubmitted and removed");
          Outcome::Delivered
        }
        Ok(false) => {
          info!(id = %record.id, target, "resubmitted, newer copy queued meanwhile is kept");
          Outcome::Delivered
        }
        Err(e) => {
          // Delivered but still queued; the next drain resends it.
          error!(id = %record.id, error = %e, "failed to remove delivered submission");
          Outcome::Failed
        }
      },
      Ok(response) => {
        warn!(
          id = %record.id,
          status = response.status,
          "resubmission rejected, keeping record"
        );
        Outcome::Failed
      }
      Err(e) => {
        if matches!(e, GatewayError::NetworkUnreachable(_)) {
          self.connectivity.mark_unreachable();
        }
        warn!(id = %record.id, error = %e, "resubmission failed, keeping record");
        Outcome::Failed
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::net::fake::FakeUpstream;
  use crate::net::GatewayResponse;
  use crate::queue::MemoryQueueStorage;

  struct Harness {
    queue: SubmissionQueue,
    upstream: Arc<FakeUpstream>,
    inflight: Arc<InFlight>,
    connectivity: Arc<Connectivity>,
    retry: RetryCoordinator,
  }

  fn harness() -> Harness {
    let queue = SubmissionQueue::new(Arc::new(MemoryQueueStorage::new()));
    let upstream = Arc::new(FakeUpstream::new());
    let inflight = Arc::new(InFlight::new());
    let connectivity = Arc::new(Connectivity::new(None));
    let retry = RetryCoordinator::new(
      queue.clone(),
      upstream.clone(),
      inflight.clone(),
      connectivity.clone(),
      "/submit",
      4,
    );
    Harness {
      queue,
      upstream,
      inflight,
      connectivity,
      retry,
    }
  }

  fn queue_body(queue: &SubmissionQueue, body: &str) -> QueuedSubmission {
    let request = GatewayRequest::post_json("/submit", body.as_bytes().to_vec());
    let record = QueuedSubmission::from_request(&request).unwrap();
    queue.enqueue(&record).unwrap();
    record
  }

  #[tokio::test]
  async fn test_delivered_records_are_removed() {
    let h = harness();
    h.upstream.route("/submit", GatewayResponse::new(200, r#"{"status":"received"}"#));
    queue_body(&h.queue, r#"{"id":"a1","name":"Alice"}"#);

    let report = h.retry.drain().await;
    assert_eq!(report.delivered, 1);
    assert!(h.queue.is_empty().unwrap());

    // The replay carried the original body and id.
    let calls = h.upstream.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].path, "/submit");
    assert_eq!(calls[0].body, br#"{"id":"a1","name":"Alice"}"#);
    assert_eq!(calls[0].content_type(), Some("application/json"));

    let again = h.retry.drain().await;
    assert_eq!(again.attempted, 0);
  }

  #[tokio::test]
  async fn test_failures_stay_queued_without_blocking_others() {
    let h = harness();
    h.upstream.route("/submit", GatewayResponse::new(200, "ok"));
    h.upstream.route("/submit?kiosk=1", GatewayResponse::new(503, "busy"));
    queue_body(&h.queue, r#"{"id":"a1"}"#);
    let rejected = QueuedSubmission::from_request(&GatewayRequest::post_json(
      "/submit?kiosk=1",
      br#"{"id":"b2"}"#.to_vec(),
    ))
    .unwrap();
    h.queue.enqueue(&rejected).unwrap();

    let report = h.retry.drain().await;
    assert_eq!(report.attempted, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.failed, 1);

    let remaining: Vec<_> = h.queue.list_all().map(|r| r.unwrap().id).collect();
    assert_eq!(remaining, vec!["b2"]);
  }

  #[tokio::test]
  async fn test_network_failure_keeps_record_and_marks_offline() {
    let h = harness();
    h.upstream.set_online(false);
    queue_body(&h.queue, r#"{"id":"a1"}"#);

    let report = h.retry.drain().await;
    assert_eq!(report.failed, 1);
    assert_eq!(h.queue.len().unwrap(), 1);
    assert!(!h.connectivity.is_reachable());

    // Retried again on the next trigger, no attempt cap.
    h.upstream.set_online(true);
    h.upstream.route("/submit", GatewayResponse::new(201, "created"));
    let report = h.retry.drain().await;
    assert_eq!(report.delivered, 1);
    assert!(h.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_skips_ids_held_by_live_requests() {
    let h = harness();
    h.upstream.route("/submit", GatewayResponse::new(200, "ok"));
    queue_body(&h.queue, r#"{"id":"a1"}"#);
    queue_body(&h.queue, r#"{"id":"b2"}"#);

    let guard = h.inflight.claim("a1");
    let report = h.retry.drain().await;
    assert_eq!(report.skipped, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(h.upstream.call_count(), 1);
    drop(guard);

    let report = h.retry.drain().await;
    assert_eq!(report.delivered, 1);
    assert!(h.queue.is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_empty_target_uses_default() {
    let h = harness();
    h.upstream.route("/submit", GatewayResponse::new(200, "ok"));
    let mut record = queue_body(&h.queue, r#"{"id":"a1"}"#);
    record.target_url.clear();
    h.queue.enqueue(&record).unwrap();

    let report = h.retry.drain().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(h.upstream.calls()[0].path, "/submit");
  }

  /// Accepts every request, but a newer submission for the same id is
  /// queued while the request is on the wire.
  struct OverwrittenDuringSend {
    queue: SubmissionQueue,
    newer: QueuedSubmission,
  }

  #[async_trait::async_trait]
  impl Upstream for OverwrittenDuringSend {
    async fn send(&self, _request: &GatewayRequest) -> Result<GatewayResponse, GatewayError> {
      self.queue.enqueue(&self.newer).unwrap();
      Ok(GatewayResponse::new(200, "ok"))
    }
  }

  #[tokio::test]
  async fn test_newer_submission_queued_during_replay_survives() {
    let queue = SubmissionQueue::new(Arc::new(MemoryQueueStorage::new()));
    queue_body(&queue, r#"{"id":"a1","v":"old"}"#);
    let newer = QueuedSubmission::from_request(&GatewayRequest::post_json(
      "/submit",
      br#"{"id":"a1","v":"new"}"#.to_vec(),
    ))
    .unwrap();

    let upstream = Arc::new(OverwrittenDuringSend {
      queue: queue.clone(),
      newer: newer.clone(),
    });
    let retry = RetryCoordinator::new(
      queue.clone(),
      upstream,
      Arc::new(InFlight::new()),
      Arc::new(Connectivity::new(None)),
      "/submit",
      4,
    );

    let report = retry.drain().await;
    assert_eq!(report.delivered, 1);

    let remaining: Vec<_> = queue.list_all().map(|r| r.unwrap()).collect();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].payload, newer.payload);
  }

  #[tokio::test]
  async fn test_overlapping_signal_is_coalesced() {
    let h = harness();
    h.retry.draining.store(true, Ordering::SeqCst);
    let report = h.retry.drain().await;
    assert!(report.coalesced);
    assert!(h.retry.rerun.load(Ordering::SeqCst));
  }
}
