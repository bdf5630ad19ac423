//! Durable queue of submissions that could not be delivered.
//!
//! Records are keyed by their client-supplied id, written atomically, and
//! survive restarts when backed by SQLite. The retry coordinator replays
//! them once connectivity returns.

mod inflight;
mod record;
mod retry;
mod storage;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::error::GatewayError;

pub use inflight::InFlight;
pub use record::QueuedSubmission;
pub use retry::RetryCoordinator;
pub use storage::{MemoryQueueStorage, QueueStorage, SqliteQueueStorage};

/// Records fetched per storage round trip while enumerating.
const PAGE_SIZE: usize = 64;

/// The submission queue service.
#[derive(Clone)]
pub struct SubmissionQueue {
  storage: Arc<dyn QueueStorage>,
}

impl SubmissionQueue {
  pub fn new(storage: Arc<dyn QueueStorage>) -> Self {
    Self { storage }
  }

  /// Insert or overwrite the record with this id. Durable once it returns.
  pub fn enqueue(&self, record: &QueuedSubmission) -> Result<(), GatewayError> {
    self.storage.put(record).map_err(GatewayError::store)
  }

  /// Lazily enumerate every queued record, each exactly once.
  pub fn list_all(&self) -> QueueIter {
    QueueIter {
      storage: Arc::clone(&self.storage),
      cursor: None,
      buffer: VecDeque::new(),
      done: false,
    }
  }

  /// Delete a record; no-op if absent. Returns whether it existed.
  pub fn remove(&self, id: &str) -> Result<bool, GatewayError> {
    self.storage.delete(id).map_err(GatewayError::store)
  }

  /// Delete a record that was delivered, unless it has been replaced by a
  /// newer submission with the same id in the meantime.
  pub fn remove_delivered(&self, record: &QueuedSubmission) -> Result<bool, GatewayError> {
    self
      .storage
      .delete_unchanged(record)
      .map_err(GatewayError::store)
  }

  pub fn len(&self) -> Result<usize, GatewayError> {
    self.storage.count().map_err(GatewayError::store)
  }

  pub fn is_empty(&self) -> Result<bool, GatewayError> {
    Ok(self.len()? == 0)
  }
}

/// Keyset-paginated iterator over the queue.
///
/// Pages are fetched on demand, so records enqueued behind the cursor during
/// iteration are picked up and removed ones are not revisited.
pub struct QueueIter {
  storage: Arc<dyn QueueStorage>,
  cursor: Option<String>,
  buffer: VecDeque<QueuedSubmission>,
  done: bool,
}

impl Iterator for QueueIter {
  type Item = Result<QueuedSubmission, GatewayError>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.buffer.is_empty() && !self.done {
      match self.storage.page_after(self.cursor.as_deref(), PAGE_SIZE) {
        Ok(page) => {
          self.done = page.len() < PAGE_SIZE;
          if let Some(last) = page.last() {
            self.cursor = Some(last.id.clone());
          }
          self.buffer.extend(page);
        }
        Err(e) => {
          self.done = true;
          return Some(Err(GatewayError::store(e)));
        }
      }
    }
    self.buffer.pop_front().map(Ok)
  }
}
