//! Snapshot storage trait and SQLite implementation.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

use super::record::{FieldEntry, FieldKey, RecordKey};
use crate::config::PersistenceConfig;

/// One base-store record as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
  pub key: RecordKey,
  pub type_name: Option<String>,
  pub fields: BTreeMap<FieldKey, FieldEntry>,
}

/// Serializable copy of the base store. Layers and subscriptions are never
/// part of a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheSnapshot {
  pub records: Vec<SnapshotRecord>,
}

/// A snapshot read back from storage.
#[derive(Debug, Clone)]
pub struct StoredSnapshot {
  pub snapshot: CacheSnapshot,
  /// When the snapshot was saved
  pub saved_at: DateTime<Utc>,
}

/// Trait for snapshot storage backends.
pub trait SnapshotStorage: Send + Sync {
  /// Replace the stored snapshot.
  fn save(&self, snapshot: &CacheSnapshot) -> Result<()>;

  /// Load the stored snapshot, if one was ever saved.
  fn load(&self) -> Result<Option<StoredSnapshot>>;
}

/// Storage implementation that doesn't persist anything.
pub struct NoopStorage;

impl SnapshotStorage for NoopStorage {
  fn save(&self, _snapshot: &CacheSnapshot) -> Result<()> {
    Ok(()) // Discard
  }

  fn load(&self) -> Result<Option<StoredSnapshot>> {
    Ok(None) // Always miss
  }
}

/// SQLite-based snapshot storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the snapshot database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open the database configured under `persistence`, falling back to the
  /// platform data directory.
  pub fn from_config(config: &PersistenceConfig) -> Result<Self> {
    Self::open(&config.resolved_path()?)
  }

  /// In-memory database, gone when the storage is dropped.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Run database migrations for snapshot tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for snapshot tables.
const SNAPSHOT_SCHEMA: &str = r#"
-- One row per base-store record (fields serialized as JSON)
CREATE TABLE IF NOT EXISTS records (
    record_key TEXT PRIMARY KEY,
    type_name TEXT,
    fields BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_records_type ON records(type_name);

-- Snapshot metadata (single row)
CREATE TABLE IF NOT EXISTS snapshot_meta (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    record_count INTEGER NOT NULL,
    saved_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl SnapshotStorage for SqliteStorage {
  fn save(&self, snapshot: &CacheSnapshot) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM records", [])
      .map_err(|e| eyre!("Failed to clear old snapshot: {}", e))?;

    for record in &snapshot.records {
      let fields = serde_json::to_vec(&record.fields)
        .map_err(|e| eyre!("Failed to serialize record {}: {}", record.key, e))?;
      tx.execute(
        "INSERT INTO records (record_key, type_name, fields) VALUES (?, ?, ?)",
        params![record.key.as_str(), record.type_name, fields],
      )
      .map_err(|e| eyre!("Failed to store record {}: {}", record.key, e))?;
    }

    tx.execute(
      "INSERT OR REPLACE INTO snapshot_meta (id, record_count, saved_at)
       VALUES (1, ?, datetime('now'))",
      params![snapshot.records.len()],
    )
    .map_err(|e| eyre!("Failed to update snapshot metadata: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn load(&self) -> Result<Option<StoredSnapshot>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let saved_at: Option<String> = conn
      .query_row("SELECT saved_at FROM snapshot_meta WHERE id = 1", [], |row| {
        row.get(0)
      })
      .ok();

    let Some(saved_at) = saved_at else {
      return Ok(None);
    };
    let saved_at = parse_datetime(&saved_at)?;

    let mut stmt = conn
      .prepare("SELECT record_key, type_name, fields FROM records ORDER BY record_key")
      .map_err(|e| eyre!("Failed to prepare record query: {}", e))?;

    let rows: Vec<(String, Option<String>, Vec<u8>)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
      .map_err(|e| eyre!("Failed to query records: {}", e))?
      .collect::<std::result::Result<_, _>>()
      .map_err(|e| eyre!("Failed to read record row: {}", e))?;

    let records = rows
      .into_iter()
      .map(|(key, type_name, fields)| {
        let fields = serde_json::from_slice(&fields)
          .map_err(|e| eyre!("Failed to deserialize record {}: {}", key, e))?;
        Ok(SnapshotRecord {
          key: RecordKey::new(key),
          type_name,
          fields,
        })
      })
      .collect::<Result<Vec<_>>>()?;

    Ok(Some(StoredSnapshot {
      snapshot: CacheSnapshot { records },
      saved_at,
    }))
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
  use crate::cache::record::FieldValue;
  use serde_json::json;

  fn snapshot() -> CacheSnapshot {
    let mut fields = BTreeMap::new();
    fields.insert(
      "name".to_string(),
      FieldEntry {
        value: FieldValue::Scalar(json!("Ada")),
        written_at: Utc::now(),
        stale: true,
      },
    );
    CacheSnapshot {
      records: vec![SnapshotRecord {
        key: RecordKey::new("User:1"),
        type_name: Some("User".to_string()),
        fields,
      }],
    }
  }

  #[test]
  fn test_empty_storage_loads_nothing() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert!(storage.load().unwrap().is_none());
    assert!(NoopStorage.load().unwrap().is_none());
  }

  #[test]
  fn test_save_replaces_previous_snapshot() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let first = snapshot();
    storage.save(&first).unwrap();

    let loaded = storage.load().unwrap().unwrap();
    assert_eq!(loaded.snapshot, first);

    storage.save(&CacheSnapshot::default()).unwrap();
    assert!(storage.load().unwrap().unwrap().snapshot.records.is_empty());
  }

  #[test]
  fn test_file_database_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("cache.db");
    SqliteStorage::open(&path).unwrap().save(&snapshot()).unwrap();

    let reopened = SqliteStorage::open(&path).unwrap();
    assert_eq!(reopened.load().unwrap().unwrap().snapshot.records.len(), 1);
  }

  #[test]
  fn test_configured_path_is_used() {
    let dir = tempfile::tempdir().unwrap();
    let config = PersistenceConfig {
      path: Some(dir.path().join("snapshots").join("cache.db")),
    };
    SqliteStorage::from_config(&config).unwrap().save(&snapshot()).unwrap();

    assert!(dir.path().join("snapshots").join("cache.db").exists());
    let reopened = SqliteStorage::from_config(&config).unwrap();
    assert_eq!(reopened.load().unwrap().unwrap().snapshot.records.len(), 1);
  }
}
