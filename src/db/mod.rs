use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a store keeps its SQLite database.
#[derive(Debug, Clone)]
pub enum Location {
  /// `<data dir>/offline-relay/<file>`
  Default(&'static str),
  File(PathBuf),
  /// Private, process-lifetime database (tests, cache disabled setups)
  #[allow(dead_code)]
  Memory,
}

impl Location {
  pub fn from_config(path: Option<&Path>, default_file: &'static str) -> Self {
    match path {
      Some(p) => Location::File(p.to_path_buf()),
      None => Location::Default(default_file),
    }
  }
}

/// Open or create the database and apply the connection settings every store relies on.
pub fn connect(location: &Location) -> Result<Connection> {
  let conn = match location {
    Location::Memory => {
      Connection::open_in_memory().map_err(|e| eyre!("Failed to open in-memory database: {}", e))?
    }
    Location::Default(file) => open_file(&default_dir()?.join(file))?,
    Location::File(path) => open_file(path)?,
  };

  conn
    .busy_timeout(Duration::from_secs(5))
    .map_err(|e| eyre!("Failed to set busy timeout: {}", e))?;
  conn
    .execute_batch("PRAGMA foreign_keys = ON;")
    .map_err(|e| eyre!("Failed to enable foreign keys: {}", e))?;

  Ok(conn)
}

fn open_file(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
  }

  let conn = Connection::open(path)
    .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

  // The queue and the cache may share one file through separate connections.
  conn
    .pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
    .map_err(|e| eyre!("Failed to enable WAL at {}: {}", path.display(), e))?;

  Ok(conn)
}

/// Get the default data directory
pub fn default_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("offline-relay"))
}
