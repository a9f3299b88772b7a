pub mod schema;

use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::error::{Result, SyncError};

/// Open (or create) the database at `path` and run migrations.
pub fn open(path: &Path) -> Result<Connection> {
  // Ensure parent directory exists
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent)
      .map_err(|e| SyncError::Io(format!("Failed to create database directory: {}", e)))?;
  }

  let conn = Connection::open(path).map_err(|e| {
    SyncError::Io(format!(
      "Failed to open database at {}: {}",
      path.display(),
      e
    ))
  })?;

  migrate(&conn)?;
  Ok(conn)
}

/// Open a private in-memory database with the schema applied.
pub fn open_in_memory() -> Result<Connection> {
  let conn = Connection::open_in_memory()?;
  migrate(&conn)?;
  Ok(conn)
}

/// Get the default database path
pub fn default_path() -> Result<PathBuf> {
  Ok(data_dir()?.join("cache.db"))
}

/// Directory holding the database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| SyncError::Config("Could not determine data directory".to_string()))?;

  Ok(data_dir.join("tether"))
}

/// Run database migrations
fn migrate(conn: &Connection) -> Result<()> {
  conn
    .execute_batch(schema::SCHEMA)
    .map_err(|e| SyncError::Io(format!("Failed to run migrations: {}", e)))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_open_creates_parent_dirs() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");

    let conn = open(&path).unwrap();
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))
      .unwrap();

    assert_eq!(count, 0);
    assert!(path.exists());
  }

  #[test]
  fn test_migrations_are_idempotent() {
    let conn = open_in_memory().unwrap();
    migrate(&conn).unwrap();
  }
}
