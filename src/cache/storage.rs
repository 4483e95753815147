//! Snapshot storage backends for warm starts.
//!
//! Only authoritative data is written here: loader results and direct
//! writes. Optimistic values never reach the store.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::key::CacheKey;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
  #[error("sqlite error: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("failed to (de)serialize snapshot: {0}")]
  Serde(#[from] serde_json::Error),
  #[error("failed to parse timestamp: {0}")]
  Timestamp(#[from] chrono::ParseError),
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  #[error("could not determine data directory")]
  NoDataDir,
  #[error("lock poisoned")]
  LockPoisoned,
}

/// Last authoritative value seen for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
  pub data: Value,
  pub fetched_at: DateTime<Utc>,
}

/// Trait for snapshot storage backends.
pub trait SnapshotStore: Send + Sync {
  /// Get the snapshot for a key.
  fn load(&self, key: &CacheKey) -> Result<Option<Snapshot>, StoreError>;

  /// Store (or replace) the snapshot for a key.
  fn save(&self, key: &CacheKey, snapshot: &Snapshot) -> Result<(), StoreError>;

  /// Forget a key.
  fn remove(&self, key: &CacheKey) -> Result<(), StoreError>;
}

/// Storage implementation that doesn't persist anything.
pub struct NoopStore;

impl SnapshotStore for NoopStore {
  fn load(&self, _key: &CacheKey) -> Result<Option<Snapshot>, StoreError> {
    Ok(None) // Always miss
  }

  fn save(&self, _key: &CacheKey, _snapshot: &Snapshot) -> Result<(), StoreError> {
    Ok(()) // Discard
  }

  fn remove(&self, _key: &CacheKey) -> Result<(), StoreError> {
    Ok(())
  }
}

/// SQLite-based snapshot storage.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self, StoreError> {
    Self::open_at(&Self::default_path()?)
  }

  /// Open (or create) the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self, StoreError> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)?;
    }
    Self::from_connection(Connection::open(path)?)
  }

  /// A throwaway store, handy for tests.
  pub fn in_memory() -> Result<Self, StoreError> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self, StoreError> {
    conn.execute_batch(SNAPSHOT_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or(StoreError::NoDataDir)?;

    Ok(data_dir.join("casesync").join("snapshots.db"))
  }

  fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
    self.conn.lock().map_err(|_| StoreError::LockPoisoned)
  }
}

const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshot_cache (
    fingerprint TEXT PRIMARY KEY,
    domain TEXT,
    description TEXT NOT NULL,
    data BLOB NOT NULL,
    fetched_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshot_cache_domain ON snapshot_cache(domain);
"#;

impl SnapshotStore for SqliteStore {
  fn load(&self, key: &CacheKey) -> Result<Option<Snapshot>, StoreError> {
    let conn = self.conn()?;
    let row: Option<(Vec<u8>, String)> = conn
      .query_row(
        "SELECT data, fetched_at FROM snapshot_cache WHERE fingerprint = ?",
        params![key.fingerprint()],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()?;

    match row {
      Some((data, fetched_at)) => Ok(Some(Snapshot {
        data: serde_json::from_slice(&data)?,
        fetched_at: DateTime::parse_from_rfc3339(&fetched_at)?.with_timezone(&Utc),
      })),
      None => Ok(None),
    }
  }

  fn save(&self, key: &CacheKey, snapshot: &Snapshot) -> Result<(), StoreError> {
    let data = serde_json::to_vec(&snapshot.data)?;
    let conn = self.conn()?;
    conn.execute(
      "INSERT OR REPLACE INTO snapshot_cache (fingerprint, domain, description, data, fetched_at)
       VALUES (?, ?, ?, ?, ?)",
      params![
        key.fingerprint(),
        key.domain(),
        key.to_string(),
        data,
        snapshot.fetched_at.to_rfc3339()
      ],
    )?;
    Ok(())
  }

  fn remove(&self, key: &CacheKey) -> Result<(), StoreError> {
    let conn = self.conn()?;
    conn.execute(
      "DELETE FROM snapshot_cache WHERE fingerprint = ?",
      params![key.fingerprint()],
    )?;
    Ok(())
  }
}
