//! Bucket storage trait with SQLite and in-memory implementations.

use chrono::{DateTime, TimeZone, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::db::Database;
use crate::net::Response;

/// A response as persisted in a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredResponse {
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

/// Trait for persistent bucket backends.
///
/// Buckets come into existence on their first `put` and only disappear via
/// `delete_bucket`.
pub trait BucketStorage: Send + Sync {
  /// Names of every bucket that has been written to.
  fn bucket_names(&self) -> Result<Vec<String>>;

  /// Drop a bucket and all its entries. Returns whether it existed.
  fn delete_bucket(&self, bucket: &str) -> Result<bool>;

  fn get(&self, bucket: &str, key: &str) -> Result<Option<StoredResponse>>;

  /// Insert or replace an entry. A replaced entry counts as newest.
  fn put(&self, bucket: &str, key: &str, entry: &StoredResponse) -> Result<()>;

  fn delete(&self, bucket: &str, key: &str) -> Result<bool>;

  fn len(&self, bucket: &str) -> Result<usize>;

  /// Remove the oldest entries (by `stored_at`, then insertion order) until
  /// at most `max_entries` remain. Returns the number removed.
  fn evict_oldest(&self, bucket: &str, max_entries: usize) -> Result<usize>;

  /// Remove entries stored strictly before `cutoff`.
  fn purge_older_than(&self, bucket: &str, cutoff: DateTime<Utc>) -> Result<usize>;

  fn get_meta(&self, key: &str) -> Result<Option<String>>;

  fn set_meta(&self, key: &str, value: &str) -> Result<()>;
}

// ============================================================================
// SQLite
// ============================================================================

/// SQLite-based bucket storage; survives process restarts.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  pub fn new(db: Database) -> Self {
    Self {
      conn: Mutex::new(db.into_connection()),
    }
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| eyre!("Invalid stored timestamp: {}", ms))
}

impl BucketStorage for SqliteStorage {
  fn bucket_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM buckets ORDER BY name")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list buckets: {}", e))?
      .collect::<std::result::Result<Vec<String>, _>>()
      .map_err(|e| eyre!("Failed to read bucket name: {}", e))?;

    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    let conn = self.conn()?;
    conn
      .execute(
        "DELETE FROM bucket_entries WHERE bucket = ?",
        params![bucket],
      )
      .map_err(|e| eyre!("Failed to delete entries of {}: {}", bucket, e))?;
    let removed = conn
      .execute("DELETE FROM buckets WHERE name = ?", params![bucket])
      .map_err(|e| eyre!("Failed to delete bucket {}: {}", bucket, e))?;
    Ok(removed > 0)
  }

  fn get(&self, bucket: &str, key: &str) -> Result<Option<StoredResponse>> {
    let conn = self.conn()?;
    let row: Option<(String, u16, String, Vec<u8>, i64)> = conn
      .query_row(
        "SELECT url, status, headers, body, stored_at FROM bucket_entries
         WHERE bucket = ? AND request_key = ?",
        params![bucket, key],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read entry: {}", e))?;

    match row {
      Some((url, status, headers, body, stored_at)) => {
        let headers: BTreeMap<String, String> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;
        Ok(Some(StoredResponse {
          response: Response {
            url,
            status,
            headers,
            body,
          },
          stored_at: millis_to_datetime(stored_at)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, bucket: &str, key: &str, entry: &StoredResponse) -> Result<()> {
    let conn = self.conn()?;
    let headers = serde_json::to_string(&entry.response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    conn
      .execute(
        "INSERT OR IGNORE INTO buckets (name, created_at) VALUES (?, ?)",
        params![bucket, entry.stored_at.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to create bucket {}: {}", bucket, e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO bucket_entries
           (bucket, request_key, url, status, headers, body, stored_at, seq)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7,
           (SELECT COALESCE(MAX(seq), 0) + 1 FROM bucket_entries WHERE bucket = ?1))",
        params![
          bucket,
          key,
          entry.response.url,
          entry.response.status,
          headers,
          entry.response.body,
          entry.stored_at.timestamp_millis(),
        ],
      )
      .map_err(|e| eyre!("Failed to store entry: {}", e))?;

    Ok(())
  }

  fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
    let conn = self.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM bucket_entries WHERE bucket = ? AND request_key = ?",
        params![bucket, key],
      )
      .map_err(|e| eyre!("Failed to delete entry: {}", e))?;
    Ok(removed > 0)
  }

  fn len(&self, bucket: &str) -> Result<usize> {
    let conn = self.conn()?;
    let count: i64 = conn
      .query_row(
        "SELECT COUNT(*) FROM bucket_entries WHERE bucket = ?",
        params![bucket],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to count entries: {}", e))?;
    Ok(count as usize)
  }

  fn evict_oldest(&self, bucket: &str, max_entries: usize) -> Result<usize> {
    let len = self.len(bucket)?;
    if len <= max_entries {
      return Ok(0);
    }
    let excess = (len - max_entries) as i64;

    let conn = self.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM bucket_entries WHERE bucket = ?1 AND request_key IN (
           SELECT request_key FROM bucket_entries WHERE bucket = ?1
           ORDER BY stored_at ASC, seq ASC LIMIT ?2)",
        params![bucket, excess],
      )
      .map_err(|e| eyre!("Failed to evict entries: {}", e))?;
    Ok(removed)
  }

  fn purge_older_than(&self, bucket: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    let conn = self.conn()?;
    let removed = conn
      .execute(
        "DELETE FROM bucket_entries WHERE bucket = ? AND stored_at < ?",
        params![bucket, cutoff.timestamp_millis()],
      )
      .map_err(|e| eyre!("Failed to purge expired entries: {}", e))?;
    Ok(removed)
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    let conn = self.conn()?;
    conn
      .query_row(
        "SELECT value FROM registry_meta WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read meta {}: {}", key, e))
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO registry_meta (key, value) VALUES (?, ?)",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write meta {}: {}", key, e))?;
    Ok(())
  }
}

// ============================================================================
// In-memory
// ============================================================================

#[derive(Debug, Clone)]
struct MemoryEntry {
  stored: StoredResponse,
  seq: u64,
}

#[derive(Default)]
struct MemoryState {
  buckets: HashMap<String, HashMap<String, MemoryEntry>>,
  meta: HashMap<String, String>,
  next_seq: u64,
}

/// Storage that lives only as long as the process. Used for tests and for
/// running without a database.
#[derive(Default)]
pub struct MemoryStorage {
  state: Mutex<MemoryState>,
}

impl MemoryStorage {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>> {
    self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }
}

impl BucketStorage for MemoryStorage {
  fn bucket_names(&self) -> Result<Vec<String>> {
    let mut names: Vec<String> = self.state()?.buckets.keys().cloned().collect();
    names.sort();
    Ok(names)
  }

  fn delete_bucket(&self, bucket: &str) -> Result<bool> {
    Ok(self.state()?.buckets.remove(bucket).is_some())
  }

  fn get(&self, bucket: &str, key: &str) -> Result<Option<StoredResponse>> {
    Ok(
      self
        .state()?
        .buckets
        .get(bucket)
        .and_then(|entries| entries.get(key))
        .map(|e| e.stored.clone()),
    )
  }

  fn put(&self, bucket: &str, key: &str, entry: &StoredResponse) -> Result<()> {
    let mut state = self.state()?;
    state.next_seq += 1;
    let seq = state.next_seq;
    state.buckets.entry(bucket.to_string()).or_default().insert(
      key.to_string(),
      MemoryEntry {
        stored: entry.clone(),
        seq,
      },
    );
    Ok(())
  }

  fn delete(&self, bucket: &str, key: &str) -> Result<bool> {
    Ok(
      self
        .state()?
        .buckets
        .get_mut(bucket)
        .map(|entries| entries.remove(key).is_some())
        .unwrap_or(false),
    )
  }

  fn len(&self, bucket: &str) -> Result<usize> {
    Ok(self.state()?.buckets.get(bucket).map_or(0, |e| e.len()))
  }

  fn evict_oldest(&self, bucket: &str, max_entries: usize) -> Result<usize> {
    let mut state = self.state()?;
    let Some(entries) = state.buckets.get_mut(bucket) else {
      return Ok(0);
    };
    if entries.len() <= max_entries {
      return Ok(0);
    }

    let mut by_age: Vec<(DateTime<Utc>, u64, String)> = entries
      .iter()
      .map(|(k, e)| (e.stored.stored_at, e.seq, k.clone()))
      .collect();
    by_age.sort();

    let excess = entries.len() - max_entries;
    for (_, _, key) in by_age.into_iter().take(excess) {
      entries.remove(&key);
    }
    Ok(excess)
  }

  fn purge_older_than(&self, bucket: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    let mut state = self.state()?;
    let Some(entries) = state.buckets.get_mut(bucket) else {
      return Ok(0);
    };
    let before = entries.len();
    entries.retain(|_, e| e.stored.stored_at >= cutoff);
    Ok(before - entries.len())
  }

  fn get_meta(&self, key: &str) -> Result<Option<String>> {
    Ok(self.state()?.meta.get(key).cloned())
  }

  fn set_meta(&self, key: &str, value: &str) -> Result<()> {
    self
      .state()?
      .meta
      .insert(key.to_string(), value.to_string());
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  fn stored(url: &str, at_ms: i64) -> StoredResponse {
    StoredResponse {
      response: Response::new(url, 200, url.as_bytes().to_vec()).with_header("x-test", "1"),
      stored_at: Utc.timestamp_millis_opt(at_ms).unwrap(),
    }
  }

  fn backends() -> Vec<(&'static str, Box<dyn BucketStorage>)> {
    vec![
      ("memory", Box::new(MemoryStorage::new())),
      (
        "sqlite",
        Box::new(SqliteStorage::new(Database::open_in_memory().unwrap())),
      ),
    ]
  }

  #[test]
  fn test_bucket_created_on_first_write() {
    for (name, storage) in backends() {
      assert!(storage.bucket_names().unwrap().is_empty(), "{}", name);
      assert!(storage.get("assets-v1", "k").unwrap().is_none(), "{}", name);
      assert!(storage.bucket_names().unwrap().is_empty(), "{}", name);

      storage.put("assets-v1", "k", &stored("/a.js", 0)).unwrap();
      assert_eq!(storage.bucket_names().unwrap(), vec!["assets-v1"], "{}", name);
      assert_eq!(
        storage.get("assets-v1", "k").unwrap(),
        Some(stored("/a.js", 0)),
        "{}",
        name
      );
    }
  }

  #[test]
  fn test_evict_oldest_by_stored_at() {
    for (name, storage) in backends() {
      storage.put("b", "new", &stored("/new", 300)).unwrap();
      storage.put("b", "old", &stored("/old", 100)).unwrap();
      storage.put("b", "mid", &stored("/mid", 200)).unwrap();

      assert_eq!(storage.evict_oldest("b", 2).unwrap(), 1, "{}", name);
      assert!(storage.get("b", "old").unwrap().is_none(), "{}", name);
      assert_eq!(storage.len("b").unwrap(), 2, "{}", name);
      assert_eq!(storage.evict_oldest("b", 2).unwrap(), 0, "{}", name);
    }
  }

  #[test]
  fn test_evict_ties_fall_back_to_insertion_order() {
    for (name, storage) in backends() {
      storage.put("b", "first", &stored("/1", 0)).unwrap();
      storage.put("b", "second", &stored("/2", 0)).unwrap();
      storage.put("b", "third", &stored("/3", 0)).unwrap();

      storage.evict_oldest("b", 2).unwrap();
      assert!(storage.get("b", "first").unwrap().is_none(), "{}", name);
      assert!(storage.get("b", "third").unwrap().is_some(), "{}", name);
    }
  }

  #[test]
  fn test_purge_and_delete_bucket() {
    for (name, storage) in backends() {
      let base = Utc.timestamp_millis_opt(10_000).unwrap();
      storage.put("b", "old", &stored("/old", 1_000)).unwrap();
      storage.put("b", "fresh", &stored("/fresh", 9_000)).unwrap();

      let purged = storage
        .purge_older_than("b", base - Duration::milliseconds(5_000))
        .unwrap();
      assert_eq!(purged, 1, "{}", name);
      assert!(storage.get("b", "fresh").unwrap().is_some(), "{}", name);

      assert!(storage.delete_bucket("b").unwrap(), "{}", name);
      assert!(!storage.delete_bucket("b").unwrap(), "{}", name);
      assert!(storage.bucket_names().unwrap().is_empty(), "{}", name);
    }
  }

  #[test]
  fn test_meta_roundtrip() {
    for (name, storage) in backends() {
      assert_eq!(storage.get_meta("active_version").unwrap(), None, "{}", name);
      storage.set_meta("active_version", "v2").unwrap();
      assert_eq!(
        storage.get_meta("active_version").unwrap().as_deref(),
        Some("v2"),
        "{}",
        name
      );
    }
  }

  #[test]
  fn test_sqlite_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");

    {
      let storage = SqliteStorage::new(Database::open(Some(&path)).unwrap());
      storage.put("pages-v1", "root", &stored("/", 42)).unwrap();
    }

    let storage = SqliteStorage::new(Database::open(Some(&path)).unwrap());
    let entry = storage.get("pages-v1", "root").unwrap().unwrap();
    assert_eq!(entry.response.headers.get("x-test").map(String::as_str), Some("1"));
    assert_eq!(entry.stored_at.timestamp_millis(), 42);
  }
}
