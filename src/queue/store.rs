//! Queue storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::sync::{Mutex, MutexGuard};
use url::Url;

use super::record::{FormPayload, QueuedWriteRecord};
use crate::db::{self, Location};

/// Trait for durable queue backends.
///
/// Every method is one transaction: it either fully applies or not at all.
pub trait QueueStore: Send + Sync {
  /// Append a record. The key is derived from `captured_at`, bumped past
  /// the current maximum when needed so keys stay unique and increasing.
  fn append(
    &self,
    payload: &[(String, String)],
    target_url: &Url,
    captured_at: DateTime<Utc>,
  ) -> Result<QueuedWriteRecord>;

  /// All records, oldest first.
  fn snapshot(&self) -> Result<Vec<QueuedWriteRecord>>;

  /// Delete one record. Returns false if it was already gone.
  fn remove(&self, key: i64) -> Result<bool>;

  /// Delete the given records, returning how many existed.
  fn remove_all(&self, keys: &[i64]) -> Result<usize>;

  /// Number of queued records.
  fn len(&self) -> Result<usize>;
}

/// SQLite-based queue implementation.
pub struct SqliteQueue {
  conn: Mutex<Connection>,
}

/// Schema for the queue table.
const QUEUE_SCHEMA: &str = r#"
-- Writes waiting for replay; key is capture time in ms (bumped for uniqueness)
CREATE TABLE IF NOT EXISTS queued_writes (
    key INTEGER PRIMARY KEY,
    payload TEXT NOT NULL,
    target_url TEXT NOT NULL,
    captured_at TEXT NOT NULL
);
"#;

impl SqliteQueue {
  pub fn open(location: &Location) -> Result<Self> {
    let conn = db::connect(location)?;
    let queue = Self {
      conn: Mutex::new(conn),
    };
    queue.run_migrations()?;

    Ok(queue)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(QUEUE_SCHEMA)
      .map_err(|e| eyre!("Failed to run queue migrations: {}", e))?;

    Ok(())
  }
}

impl QueueStore for SqliteQueue {
  fn append(
    &self,
    payload: &[(String, String)],
    target_url: &Url,
    captured_at: DateTime<Utc>,
  ) -> Result<QueuedWriteRecord> {
    let data =
      serde_json::to_string(payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let last: Option<i64> = tx
      .query_row("SELECT MAX(key) FROM queued_writes", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read last queue key: {}", e))?;

    let millis = captured_at.timestamp_millis();
    let key = match last {
      Some(last) if last >= millis => last + 1,
      _ => millis,
    };

    tx.execute(
      "INSERT INTO queued_writes (key, payload, target_url, captured_at) VALUES (?, ?, ?, ?)",
      params![key, data, target_url.as_str(), captured_at.to_rfc3339()],
    )
    .map_err(|e| eyre!("Failed to queue write: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(QueuedWriteRecord {
      key,
      payload: payload.to_vec(),
      target_url: target_url.clone(),
      captured_at,
    })
  }

  fn snapshot(&self) -> Result<Vec<QueuedWriteRecord>> {
    let conn = self.lock()?;

    let mut stmt = conn
      .prepare("SELECT key, payload, target_url, captured_at FROM queued_writes ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare queue query: {}", e))?;

    let rows: Vec<(i64, String, String, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
      .map_err(|e| eyre!("Failed to query queue: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read queue row: {}", e))?;

    let mut records = Vec::with_capacity(rows.len());
    for (key, payload, target_url, captured_at) in rows {
      match decode_row(key, &payload, &target_url, &captured_at) {
        Ok(record) => records.push(record),
        // Leave the row in place; it may be readable by a later version.
        Err(e) => tracing::warn!(key, error = %e, "Skipping unreadable queued write"),
      }
    }

    Ok(records)
  }

  fn remove(&self, key: i64) -> Result<bool> {
    let conn = self.lock()?;
    let deleted = conn
      .execute("DELETE FROM queued_writes WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete queued write {}: {}", key, e))?;

    Ok(deleted > 0)
  }

  fn remove_all(&self, keys: &[i64]) -> Result<usize> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let mut deleted = 0;
    {
      let mut stmt = tx
        .prepare("DELETE FROM queued_writes WHERE key = ?")
        .map_err(|e| eyre!("Failed to prepare delete: {}", e))?;
      for key in keys {
        deleted += stmt
          .execute(params![key])
          .map_err(|e| eyre!("Failed to delete queued write {}: {}", key, e))?;
      }
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted)
  }

  fn len(&self) -> Result<usize> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM queued_writes", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count queued writes: {}", e))?;

    Ok(count as usize)
  }
}

fn decode_row(
  key: i64,
  payload: &str,
  target_url: &str,
  captured_at: &str,
) -> Result<QueuedWriteRecord> {
  let payload: FormPayload =
    serde_json::from_str(payload).map_err(|e| eyre!("Failed to parse payload: {}", e))?;
  let target_url =
    Url::parse(target_url).map_err(|e| eyre!("Failed to parse target URL '{}': {}", target_url, e))?;
  let captured_at = DateTime::parse_from_rfc3339(captured_at)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse capture time '{}': {}", captured_at, e))?;

  Ok(QueuedWriteRecord {
    key,
    payload,
    target_url,
    captured_at,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;
  use crate::queue::field_value;

  fn queue() -> SqliteQueue {
    SqliteQueue::open(&Location::Memory).unwrap()
  }

  fn at(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).unwrap()
  }

  fn payload(value: &str) -> FormPayload {
    vec![("fieldValue".to_string(), value.to_string())]
  }

  fn target() -> Url {
    Url::parse("http://app.test/?index").unwrap()
  }

  #[test]
  fn test_append_then_snapshot_preserves_record() {
    let queue = queue();
    let record = queue.append(&payload("x"), &target(), at(100)).unwrap();

    assert_eq!(record.key, 100);
    assert_eq!(queue.snapshot().unwrap(), vec![record]);
    assert_eq!(queue.len().unwrap(), 1);
  }

  #[test]
  fn test_snapshot_is_in_capture_order() {
    let queue = queue();
    queue.append(&payload("c"), &target(), at(300)).unwrap();
    queue.append(&payload("a"), &target(), at(100)).unwrap();
    queue.append(&payload("b"), &target(), at(200)).unwrap();

    let values: Vec<_> = queue
      .snapshot()
      .unwrap()
      .iter()
      .map(|r| field_value(&r.payload, "fieldValue").unwrap().to_string())
      .collect();
    assert_eq!(values, vec!["a", "b", "c"]);
  }

  #[test]
  fn test_same_millisecond_captures_get_distinct_keys() {
    let queue = queue();
    let first = queue.append(&payload("a"), &target(), at(500)).unwrap();
    let second = queue.append(&payload("b"), &target(), at(500)).unwrap();
    let third = queue.append(&payload("c"), &target(), at(499)).unwrap();

    assert_eq!(first.key, 500);
    assert_eq!(second.key, 501);
    assert_eq!(third.key, 502);
    assert_eq!(queue.len().unwrap(), 3);
  }

  #[test]
  fn test_remove_deletes_only_that_record() {
    let queue = queue();
    let a = queue.append(&payload("a"), &target(), at(100)).unwrap();
    let b = queue.append(&payload("b"), &target(), at(200)).unwrap();

    assert!(queue.remove(a.key).unwrap());
    assert!(!queue.remove(a.key).unwrap());
    assert_eq!(queue.snapshot().unwrap(), vec![b]);
  }

  #[test]
  fn test_remove_all_ignores_missing_keys() {
    let queue = queue();
    let a = queue.append(&payload("a"), &target(), at(100)).unwrap();
    let b = queue.append(&payload("b"), &target(), at(200)).unwrap();
    let c = queue.append(&payload("c"), &target(), at(300)).unwrap();

    assert_eq!(queue.remove_all(&[a.key, b.key, 42]).unwrap(), 2);
    assert_eq!(queue.snapshot().unwrap(), vec![c]);
  }

  #[test]
  fn test_records_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let location = Location::File(dir.path().join("queue.db"));

    {
      let queue = SqliteQueue::open(&location).unwrap();
      queue.append(&payload("persisted"), &target(), at(100)).unwrap();
    }

    let reopened = SqliteQueue::open(&location).unwrap();
    let records = reopened.snapshot().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(field_value(&records[0].payload, "fieldValue"), Some("persisted"));
    assert_eq!(records[0].target_url, target());
  }
}
