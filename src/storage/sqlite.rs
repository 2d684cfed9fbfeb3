//! SQLite-backed storage.

use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::{check_quota, entry_size, KvStorage, StorageUsage};
use crate::error::{Result, SyncError};

/// Schema for the key-value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-based storage. Each `set` is its own committed statement and each
/// `update` its own immediate transaction, so a value is on disk by the time
/// the call returns and several processes can share the file.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
  quota_bytes: Option<usize>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path, quota_bytes: Option<usize>) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| SyncError::Storage(format!("Failed to create storage directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::Storage(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;
    // Other processes may hold the write lock briefly
    conn.busy_timeout(Duration::from_secs(5))?;

    let storage = Self {
      conn: Mutex::new(conn),
      quota_bytes,
    };
    storage.run_migrations()?;

    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| SyncError::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("offsync").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute_batch(KV_SCHEMA)
      .map_err(|e| SyncError::Storage(format!("Failed to run migrations: {}", e)))?;
    Ok(())
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| SyncError::Storage(format!("Lock poisoned: {}", e)))
  }

  fn used_bytes(conn: &Connection) -> Result<usize> {
    let used: i64 = conn.query_row(
      "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0) FROM kv",
      [],
      |row| row.get(0),
    )?;
    Ok(used.max(0) as usize)
  }

  fn read(conn: &Connection, key: &str) -> Result<Option<String>> {
    let value = conn
      .query_row("SELECT value FROM kv WHERE key = ?", params![key], |row| {
        row.get(0)
      })
      .optional()?;
    Ok(value)
  }

  fn write(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
      "INSERT OR REPLACE INTO kv (key, value, updated_at) VALUES (?, ?, datetime('now'))",
      params![key, value],
    )?;
    Ok(())
  }

  fn ensure_fits(&self, conn: &Connection, key: &str, value: &str) -> Result<()> {
    if self.quota_bytes.is_none() {
      return Ok(());
    }
    let used = Self::used_bytes(conn)?;
    let replaced = Self::read(conn, key)?
      .map(|v| entry_size(key, &v))
      .unwrap_or(0);
    check_quota(self.quota_bytes, used, replaced, key, value)
  }
}

impl KvStorage for SqliteStorage {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    Self::read(&conn, key)
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self.lock()?;
    self.ensure_fits(&conn, key, value)?;
    Self::write(&conn, key, value)
  }

  fn update(
    &self,
    key: &str,
    apply: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
  ) -> Result<()> {
    let mut conn = self.lock()?;
    // Take the write lock up front so another process cannot interleave
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    match apply(Self::read(&tx, key)?)? {
      Some(value) => {
        self.ensure_fits(&tx, key, &value)?;
        Self::write(&tx, key, &value)?;
      }
      None => {
        tx.execute("DELETE FROM kv WHERE key = ?", params![key])?;
      }
    }
    tx.commit()?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute("DELETE FROM kv WHERE key = ?", params![key])?;
    Ok(())
  }

  fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key",
    )?;
    let rows = stmt
      .query_map(params![prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<std::result::Result<Vec<(String, String)>, _>>()?;
    Ok(rows)
  }

  fn remove_prefix(&self, prefix: &str) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn.execute(
      "DELETE FROM kv WHERE substr(key, 1, length(?1)) = ?1",
      params![prefix],
    )?;
    Ok(removed)
  }

  fn usage(&self) -> Result<StorageUsage> {
    let conn = self.lock()?;
    Ok(StorageUsage {
      used_bytes: Self::used_bytes(&conn)?,
      quota_bytes: self.quota_bytes,
    })
  }
}
