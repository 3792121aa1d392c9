//! Cache storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::{Mutex, MutexGuard};

use super::types::{CachedResponse, RequestKey};
use crate::db::{self, Location};
use crate::exchange::CapturedResponse;

/// Trait for cache storage backends.
///
/// Namespaces are created on first use and only ever deleted as a whole.
pub trait CacheStorage: Send + Sync {
  /// Create the namespace if it does not exist.
  fn open(&self, namespace: &str) -> Result<()>;

  /// Names of all existing namespaces.
  fn namespaces(&self) -> Result<Vec<String>>;

  /// Delete a namespace and every entry in it. Returns false if it did not exist.
  fn delete(&self, namespace: &str) -> Result<bool>;

  /// Store a response, replacing any entry for the same request.
  fn put(&self, namespace: &str, key: &RequestKey, response: &CapturedResponse) -> Result<()>;

  /// First entry for `key`, searching `namespaces` in order.
  fn lookup(&self, namespaces: &[&str], key: &RequestKey) -> Result<Option<CachedResponse>>;
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn open(&self, _namespace: &str) -> Result<()> {
    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }

  fn delete(&self, _namespace: &str) -> Result<bool> {
    Ok(false)
  }

  fn put(&self, _namespace: &str, _key: &RequestKey, _response: &CapturedResponse) -> Result<()> {
    Ok(()) // Discard
  }

  fn lookup(&self, _namespaces: &[&str], _key: &RequestKey) -> Result<Option<CachedResponse>> {
    Ok(None) // Always miss
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_namespaces (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Full response snapshots; headers are a JSON array of [name, value]
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    request_hash TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, request_hash),
    FOREIGN KEY (namespace) REFERENCES cache_namespaces(name) ON DELETE CASCADE
);
"#;

impl SqliteStorage {
  pub fn open(location: &Location) -> Result<Self> {
    let conn = db::connect(location)?;
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

impl CacheStorage for SqliteStorage {
  fn open(&self, namespace: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to open cache namespace {}: {}", namespace, e))?;

    Ok(())
  }

  fn namespaces(&self) -> Result<Vec<String>> {
    let conn = self.lock()?;
    let mut stmt = conn
      .prepare("SELECT name FROM cache_namespaces ORDER BY created_at, name")
      .map_err(|e| eyre!("Failed to prepare namespace query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache namespaces: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache namespace: {}", e))?;

    Ok(names)
  }

  fn delete(&self, namespace: &str) -> Result<bool> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM cache_entries WHERE namespace = ?",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to delete entries of {}: {}", namespace, e))?;

    let deleted = tx
      .execute(
        "DELETE FROM cache_namespaces WHERE name = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to delete cache namespace {}: {}", namespace, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(deleted > 0)
  }

  fn put(&self, namespace: &str, key: &RequestKey, response: &CapturedResponse) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR IGNORE INTO cache_namespaces (name) VALUES (?)",
      params![namespace],
    )
    .map_err(|e| eyre!("Failed to open cache namespace {}: {}", namespace, e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache_entries (namespace, request_hash, url, status, headers, body, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        namespace,
        key.cache_hash(),
        key.url().as_str(),
        response.status,
        headers,
        &response.body[..],
      ],
    )
    .map_err(|e| eyre!("Failed to store response for {}: {}", key.url(), e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn lookup(&self, namespaces: &[&str], key: &RequestKey) -> Result<Option<CachedResponse>> {
    let conn = self.lock()?;
    let hash = key.cache_hash();

    let mut stmt = conn
      .prepare(
        "SELECT status, headers, body, cached_at FROM cache_entries
         WHERE namespace = ? AND request_hash = ?",
      )
      .map_err(|e| eyre!("Failed to prepare cache query: {}", e))?;

    for namespace in namespaces {
      let row: Option<(u16, String, Vec<u8>, String)> = stmt
        .query_row(params![namespace, hash], |row| {
          Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })
        .optional()
        .map_err(|e| eyre!("Failed to query cache: {}", e))?;

      if let Some((status, headers, body, cached_at)) = row {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize headers: {}", e))?;

        return Ok(Some(CachedResponse {
          response: CapturedResponse {
            status,
            headers,
            body: body.into(),
          },
          namespace: namespace.to_string(),
          cached_at: parse_datetime(&cached_at)?,
        }));
      }
    }

    Ok(None)
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
