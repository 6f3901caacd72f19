//! Durable string key/value storage.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Trait for key/value storage backends.
pub trait KeyValueStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  /// Insert or overwrite `key`.
  fn set(&self, key: &str, value: &str) -> Result<()>;

  /// Delete `key`. Missing keys are not an error.
  fn remove(&self, key: &str) -> Result<()>;
}

/// SQLite-backed store, one row per key.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open or create the store at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open storage at {}: {}", path.display(), e))?;
    Self::with_connection(conn)
  }

  /// Store that lives as long as the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory storage: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("taskq").join("session.db"))
  }

  fn conn(&self) -> MutexGuard<'_, Connection> {
    self.conn.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()
      .execute_batch(SCHEMA)
      .map_err(|e| eyre!("Failed to run storage migrations: {}", e))?;
    Ok(())
  }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    self
      .conn()
      .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
        row.get(0)
      })
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self
      .conn()
      .execute(
        "INSERT INTO kv (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self
      .conn()
      .execute("DELETE FROM kv WHERE key = ?1", params![key])
      .map_err(|e| eyre!("Failed to delete {}: {}", key, e))?;
    Ok(())
  }
}

/// Store that keeps everything in memory. Nothing survives the process.
#[derive(Default)]
pub struct MemoryStore {
  values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn values(&self) -> MutexGuard<'_, HashMap<String, String>> {
    self.values.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

impl KeyValueStore for MemoryStore {
  fn get(&self, key: &str) -> Result<Option<String>> {
    Ok(self.values().get(key).cloned())
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    self.values().insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    self.values().remove(key);
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn exercise(store: &dyn KeyValueStore) {
    assert_eq!(store.get("userId").unwrap(), None);

    store.set("userId", "u1").unwrap();
    assert_eq!(store.get("userId").unwrap().as_deref(), Some("u1"));

    store.set("userId", "u2").unwrap();
    assert_eq!(store.get("userId").unwrap().as_deref(), Some("u2"));

    store.remove("userId").unwrap();
    store.remove("userId").unwrap();
    assert_eq!(store.get("userId").unwrap(), None);
  }

  #[test]
  fn test_memory_store() {
    exercise(&MemoryStore::new());
  }

  #[test]
  fn test_sqlite_store() {
    exercise(&SqliteStore::open_in_memory().unwrap());
  }

  #[test]
  fn test_sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("session.db");

    SqliteStore::open(&path).unwrap().set("userId", "u1").unwrap();
    let reopened = SqliteStore::open(&path).unwrap();

    assert_eq!(reopened.get("userId").unwrap().as_deref(), Some("u1"));
  }
}
