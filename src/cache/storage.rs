//! Cache storage backends: SQLite, in-memory, and unavailable.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::db::{Database, Unavailable};
use crate::net::GatewayResponse;

use super::traits::{CacheStorage, CachedResponse, RequestKey};

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  db: Arc<Database>,
}

impl SqliteStorage {
  pub fn new(db: Arc<Database>) -> Self {
    Self { db }
  }
}

impl CacheStorage for SqliteStorage {
  fn open_generation(&self, version: &str) -> Result<()> {
    self
      .db
      .conn()?
      .execute(
        "INSERT OR IGNORE INTO cache_generations (version) VALUES (?)",
        params![version],
      )
      .map_err(|e| eyre!("Failed to open cache generation {}: {}", version, e))?;
    Ok(())
  }

  fn generations(&self) -> Result<Vec<String>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare("SELECT version FROM cache_generations ORDER BY created_at, version")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let versions = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache generations: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache generation: {}", e))?;

    Ok(versions)
  }

  fn delete_generation(&self, version: &str) -> Result<bool> {
    // Entries go with it through ON DELETE CASCADE.
    let deleted = self
      .db
      .conn()?
      .execute(
        "DELETE FROM cache_generations WHERE version = ?",
        params![version],
      )
      .map_err(|e| eyre!("Failed to delete cache generation {}: {}", version, e))?;
    Ok(deleted > 0)
  }

  fn put(&self, version: &str, key: &RequestKey, response: &GatewayResponse) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    self
      .db
      .conn()?
      .execute(
        "INSERT OR REPLACE INTO cache_entries (version, request_key, url, status, headers, body, cached_at)
         VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
        params![
          version,
          key.cache_hash(),
          key.url(),
          response.status,
          headers,
          response.body
        ],
      )
      .map_err(|e| eyre!("Failed to store {} in {}: {}", key.url(), version, e))?;

    Ok(())
  }

  fn get(&self, version: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.db.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE version = ? AND request_key = ?",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let row: Option<(u16, String, Vec<u8>, String)> = stmt
      .query_row(params![version, key.cache_hash()], |row| {
        Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
      })
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry {}: {}", key.url(), e))?;

    match row {
      Some((status, headers, body, cached_at_str)) => {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(CachedResponse {
          response: GatewayResponse {
            status,
            headers,
            body,
          },
          cached_at: parse_datetime(&cached_at_str)?,
        }))
      }
      None => Ok(None),
    }
  }
}

/// Entries by storage key, per generation
type Generations = HashMap<String, HashMap<String, CachedResponse>>;

/// In-memory cache storage, used for ephemeral runs and tests.
#[derive(Default)]
pub struct MemoryStorage {
  generations: Mutex<Generations>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> Result<MutexGuard<'_, Generations>> {
    self
      .generations
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl CacheStorage for MemoryStorage {
  fn open_generation(&self, version: &str) -> Result<()> {
    self.lock()?.entry(version.to_string()).or_default();
    Ok(())
  }

  fn generations(&self) -> Result<Vec<String>> {
    let mut versions: Vec<String> = self.lock()?.keys().cloned().collect();
    versions.sort();
    Ok(versions)
  }

  fn delete_generation(&self, version: &str) -> Result<bool> {
    Ok(self.lock()?.remove(version).is_some())
  }

  fn put(&self, version: &str, key: &RequestKey, response: &GatewayResponse) -> Result<()> {
    let mut generations = self.lock()?;
    let entries = generations
      .get_mut(version)
      .ok_or_else(|| eyre!("Unknown cache generation {}", version))?;
    entries.insert(
      key.cache_hash(),
      CachedResponse {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn get(&self, version: &str, key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(
      self
        .lock()?
        .get(version)
        .and_then(|entries| entries.get(&key.cache_hash()))
        .cloned(),
    )
  }
}

impl CacheStorage for Unavailable {
  fn open_generation(&self, _version: &str) -> Result<()> {
    Err(self.error())
  }

  fn generations(&self) -> Result<Vec<String>> {
    Err(self.error())
  }

  fn delete_generation(&self, _version: &str) -> Result<bool> {
    Err(self.error())
  }

  fn put(&self, _version: &str, _key: &RequestKey, _response: &GatewayResponse) -> Result<()> {
    Err(self.error())
  }

  fn get(&self, _version: &str, _key: &RequestKey) -> Result<Option<CachedResponse>> {
    Err(self.error())
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn sqlite() -> SqliteStorage {
    SqliteStorage::new(Arc::new(Database::open_in_memory().unwrap()))
  }

  fn backends() -> Vec<(&'static str, Box<dyn CacheStorage>)> {
    vec![
      ("sqlite", Box::new(sqlite()) as Box<dyn CacheStorage>),
      ("memory", Box::new(MemoryStorage::new()) as Box<dyn CacheStorage>),
    ]
  }

  fn png(bytes: &[u8]) -> GatewayResponse {
    GatewayResponse::new(200, bytes.to_vec()).with_header("content-type", "image/png")
  }

  #[test]
  fn test_put_then_get() {
    for (name, storage) in backends() {
      let key = RequestKey::from_path("/download_qr?id=x");
      storage.open_generation("v1").unwrap();
      storage.put("v1", &key, &png(b"qr")).unwrap();

      let cached = storage.get("v1", &key).unwrap().expect(name);
      assert_eq!(cached.response.body, b"qr", "{}", name);
      assert_eq!(cached.response.header("content-type"), Some("image/png"), "{}", name);
      assert!(storage.get("v2", &key).unwrap().is_none(), "{}", name);
    }
  }

  #[test]
  fn test_put_overwrites() {
    for (name, storage) in backends() {
      let key = RequestKey::from_path("/download_qr?id=x");
      storage.open_generation("v1").unwrap();
      storage.put("v1", &key, &png(b"old")).unwrap();
      storage.put("v1", &key, &png(b"new")).unwrap();
      let cached = storage.get("v1", &key).unwrap().unwrap();
      assert_eq!(cached.response.body, b"new", "{}", name);
    }
  }

  #[test]
  fn test_put_requires_open_generation() {
    for (name, storage) in backends() {
      let key = RequestKey::from_path("/");
      assert!(storage.put("missing", &key, &png(b"x")).is_err(), "{}", name);
    }
  }

  #[test]
  fn test_delete_generation_drops_entries() {
    for (name, storage) in backends() {
      let key = RequestKey::from_path("/form");
      storage.open_generation("v1").unwrap();
      storage.open_generation("v2").unwrap();
      storage.put("v1", &key, &png(b"x")).unwrap();

      assert!(storage.delete_generation("v1").unwrap(), "{}", name);
      assert!(!storage.delete_generation("v1").unwrap(), "{}", name);
      assert_eq!(storage.generations().unwrap(), vec!["v2".to_string()], "{}", name);

      // Re-creating the generation must not resurrect old entries.
      storage.open_generation("v1").unwrap();
      assert!(storage.get("v1", &key).unwrap().is_none(), "{}", name);
    }
  }

  #[test]
  fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let key = RequestKey::from_path("/");
    {
      let storage = SqliteStorage::new(Arc::new(Database::open(dir.path()).unwrap()));
      storage.open_generation("v1").unwrap();
      storage.put("v1", &key, &png(b"shell")).unwrap();
    }
    let storage = SqliteStorage::new(Arc::new(Database::open(dir.path()).unwrap()));
    let cached = storage.get("v1", &key).unwrap().unwrap();
    assert_eq!(cached.response.body, b"shell");
  }

  #[test]
  fn test_unavailable_fails_everything() {
    let storage = Unavailable::new("disk gone");
    let key = RequestKey::from_path("/");
    assert!(storage.open_generation("v1").is_err());
    assert!(storage.get("v1", &key).is_err());
    assert!(storage.put("v1", &key, &png(b"x")).is_err());
    assert!(storage.generations().is_err());
  }
}
