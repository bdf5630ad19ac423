//! Queue storage trait and its SQLite and in-memory implementations.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db::{Database, Unavailable};

use super::record::QueuedSubmission;

/// Trait for submission queue backends.
///
/// Every method is atomic per record: a reader never observes a partially
/// written submission.
pub trait QueueStorage: Send + Sync {
  /// Insert a record, replacing any record with the same id.
  fn put(&self, record: &QueuedSubmission) -> Result<()>;

  /// Up to `limit` records with ids strictly greater than `after`, in id order.
  fn page_after(&self, after: Option<&str>, limit: usize) -> Result<Vec<QueuedSubmission>>;

  /// Delete a record. Returns whether it existed.
  fn delete(&self, id: &str) -> Result<bool>;

  /// Delete `record` only if the stored copy still has the same target and
  /// payload. Returns whether it was deleted.
  fn delete_unchanged(&self, record: &QueuedSubmission) -> Result<bool>;

  /// Number of queued records.
  fn count(&self) -> Result<usize>;
}

/// SQLite-based queue storage implementation.
pub struct SqliteQueueStorage {
  db: Arc<Database>,
}

impl SqliteQueueStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl QueueStorage for SqliteQueueStorage {
  fn put(&self, record: &QueuedSubmission) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO queued_submissions (id, target_url, payload, created_at)
         VALUES (?, ?, ?, ?)",
        params![
          record.id,
          record.target_url,
          record.payload,
          record.created_at.to_rfc3339()
        ],
      )
      .map_err(|e| eyre!("Failed to queue submission {}: {}", record.id, e))?;
    Ok(())
  }

  fn page_after(&self, after: Option<&str>, limit: usize) -> Result<Vec<QueuedSubmission>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT id, target_url, payload, created_at FROM queued_submissions
         WHERE ?1 IS NULL OR id > ?1
         ORDER BY id
         LIMIT ?2",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map(params![after, limit as i64], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, Vec<u8>>(2)?,
          row.get::<_, String>(3)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list queued submissions: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read queued submission: {}", e))?;

    rows
      .into_iter()
      .map(|(id, target_url, payload, created_at)| {
        Ok(QueuedSubmission {
          created_at: parse_timestamp(&created_at)?,
          id,
          target_url,
          payload,
        })
      })
      .collect()
  }

  fn delete(&self, id: &str) -> Result<bool> {
    let deleted = self
      .db
      .conn()?
      .execute("DELETE FROM queued_submissions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete queued submission {}: {}", id, e))?;
    Ok(deleted > 0)
  }

  fn delete_unchanged(&self, record: &QueuedSubmission) -> Result<bool> {
    let deleted = self
      .db
      .conn()?
      .execute(
        "DELETE FROM queued_submissions WHERE id = ? AND target_url = ? AND payload = ?",
        params![record.id, record.target_url, record.payload],
      )
      .map_err(|e| eyre!("Failed to delete queued submission {}: {}", record.id, e))?;
    Ok(deleted > 0)
  }

  fn count(&self) -> Result<usize> {
    let count: i64 = self
      .db
      .conn()?
      .query_row("SELECT COUNT(*) FROM queued_submissions", [], |row| {
        row.get(0)
      })
      .map_err(|e| eyre!("Failed to count queued submissions: {}", e))?;
    Ok(count as usize)
  }
}

/// In-memory queue storage, used for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryQueueStorage {
  records: Mutex<BTreeMap<String, QueuedSubmission>>,
}

impl MemoryQueueStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, BTreeMap<String, QueuedSubmission>>> {
    self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl QueueStorage for MemoryQueueStorage {
  fn put(&self, record: &QueuedSubmission) -> Result<()> {
    self.lock()?.insert(record.id.clone(), record.clone());
    Ok(())
  }

  fn page_after(&self, after: Option<&str>, limit: usize) -> Result<Vec<QueuedSubmission>> {
    let records = self.lock()?;
    let lower = match after {
      Some(id) => Bound::Excluded(id.to_string()),
      None => Bound::Unbounded,
    };
    Ok(
      records
        .range((lower, Bound::Unbounded))
        .take(limit)
        .map(|(_, record)| record.clone())
        .collect(),
    )
  }

  fn delete(&self, id: &str) -> Result<bool> {
    Ok(self.lock()?.remove(id).is_some())
  }

  fn delete_unchanged(&self, record: &QueuedSubmission) -> Result<bool> {
    let mut records = self.lock()?;
    let unchanged = records.get(&record.id).is_some_and(|stored| {
      stored.target_url == record.target_url && stored.payload == record.payload
    });
    if unchanged {
      records.remove(&record.id);
    }
    Ok(unchanged)
  }

  fn count(&self) -> Result<usize> {
    Ok(self.lock()?.len())
  }
}

impl QueueStorage for Unavailable {
  fn put(&self, _record: &QueuedSubmission) -> Result<()> {
    Err(self.error())
  }

  fn page_after(&self, _after: Option<&str>, _limit: usize) -> Result<Vec<QueuedSubmission>> {
    Err(self.error())
  }

  fn delete(&self, _id: &str) -> Result<bool> {
    Err(self.error())
  }

  fn delete_unchanged(&self, _record: &QueuedSubmission) -> Result<bool> {
    Err(self.error())
  }

  fn count(&self) -> Result<usize> {
    Err(self.error())
  }
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse timestamp '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(id: &str) -> QueuedSubmission {
    QueuedSubmission {
      id: id.to_string(),
      target_url: "/submit".to_string(),
      payload: format!(r#"{{"id":"{}"}}"#, id).into_bytes(),
      created_at: Utc::now(),
    }
  }

  fn backends() -> Vec<(&'static str, Box<dyn QueueStorage>)> {
    vec![
      (
        "sqlite",
        Box::new(SqliteQueueStorage::new(Arc::new(
          Database::open_in_memory().unwrap(),
        ))) as Box<dyn QueueStorage>,
      ),
      ("memory", Box::new(MemoryQueueStorage::new()) as Box<dyn QueueStorage>),
    ]
  }

  #[test]
  fn test_put_overwrites_by_id() {
    for (name, storage) in backends() {
      storage.put(&record("a1")).unwrap();
      let mut updated = record("a1");
      updated.payload = br#"{"id":"a1","name":"Alice"}"#.to_vec();
      storage.put(&updated).unwrap();

      assert_eq!(storage.count().unwrap(), 1, "{}", name);
      let page = storage.page_after(None, 10).unwrap();
      assert_eq!(page[0].payload, updated.payload, "{}", name);
    }
  }

  #[test]
  fn test_pages_in_id_order() {
    for (name, storage) in backends() {
      for id in ["c", "a", "b", "d"] {
        storage.put(&record(id)).unwrap();
      }
      let first: Vec<_> = storage
        .page_after(None, 2)
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
      assert_eq!(first, vec!["a", "b"], "{}", name);

      let rest: Vec<_> = storage
        .page_after(Some("b"), 2)
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
      assert_eq!(rest, vec!["c", "d"], "{}", name);
      assert!(storage.page_after(Some("d"), 2).unwrap().is_empty(), "{}", name);
    }
  }

  #[test]
  fn test_delete() {
    for (name, storage) in backends() {
      storage.put(&record("a1")).unwrap();
      assert!(storage.delete("a1").unwrap(), "{}", name);
      assert!(!storage.delete("a1").unwrap(), "{}", name);
      assert_eq!(storage.count().unwrap(), 0, "{}", name);
    }
  }

  #[test]
  fn test_delete_unchanged_keeps_overwritten_record() {
    for (name, storage) in backends() {
      let replayed = record("a1");
      storage.put(&replayed).unwrap();

      let mut newer = record("a1");
      newer.payload = br#"{"id":"a1","name":"newer"}"#.to_vec();
      storage.put(&newer).unwrap();

      assert!(!storage.delete_unchanged(&replayed).unwrap(), "{}", name);
      assert_eq!(storage.count().unwrap(), 1, "{}", name);
      assert!(storage.delete_unchanged(&newer).unwrap(), "{}", name);
      assert_eq!(storage.count().unwrap(), 0, "{}", name);
      assert!(!storage.delete_unchanged(&newer).unwrap(), "{}", name);
    }
  }

  #[test]
  fn test_sqlite_record_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let original = record("a1");
    {
      let storage = SqliteQueueStorage::new(Arc::new(Database::open(dir.path()).unwrap()));
      storage.put(&original).unwrap();
    }
    let storage = SqliteQueueStorage::new(Arc::new(Database::open(dir.path()).unwrap()));
    let page = storage.page_after(None, 10).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, "a1");
    assert_eq!(page[0].payload, original.payload);
    assert_eq!(page[0].created_at.timestamp(), original.created_at.timestamp());
  }
}
