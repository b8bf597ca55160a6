//! Snapshot storage trait and SQLite implementation.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::entity::Entity;

/// The single durable slot holding the last good listing.
const SLOT: &str = "listing";

/// A restored listing.
#[derive(Debug, Clone)]
pub struct Snapshot {
  /// The entities in listing order
  pub entities: Vec<Entity>,
  /// When the listing was persisted
  pub persisted_at: DateTime<Utc>,
}

/// Trait for snapshot storage backends.
pub trait SnapshotStore: Send + Sync {
  /// Replace the stored listing.
  fn persist(&self, entities: &[Entity]) -> Result<()>;

  /// Load the stored listing, if any.
  fn restore(&self) -> Result<Option<Snapshot>>;
}

/// Storage that doesn't keep anything.
/// Used when snapshots are disabled - all operations are no-ops.
pub struct NoopSnapshot;

impl SnapshotStore for NoopSnapshot {
  fn persist(&self, _entities: &[Entity]) -> Result<()> {
    Ok(()) // Discard
  }

  fn restore(&self) -> Result<Option<Snapshot>> {
    Ok(None)
  }
}

/// SQLite-based snapshot storage.
pub struct SqliteSnapshot {
  conn: Mutex<Connection>,
}

impl SqliteSnapshot {
  /// Open or create the snapshot database at `path`, or at the default
  /// location when `path` is `None`.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create snapshot directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open snapshot database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// In-memory database, gone when dropped.
  pub fn in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory snapshot database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shelf").join("snapshot.db"))
  }

  /// Run database migrations for snapshot tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(SNAPSHOT_SCHEMA)
      .map_err(|e| eyre!("Failed to run snapshot migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for snapshot tables.
const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshot_meta (
    slot TEXT PRIMARY KEY,
    persisted_at TEXT NOT NULL DEFAULT (datetime('now')),
    entity_count INTEGER NOT NULL
);

-- Entities in listing order
CREATE TABLE IF NOT EXISTS snapshot_entities (
    slot TEXT NOT NULL,
    position INTEGER NOT NULL,
    entity_id TEXT NOT NULL,
    data BLOB NOT NULL,
    PRIMARY KEY (slot, position),
    FOREIGN KEY (slot) REFERENCES snapshot_meta(slot) ON DELETE CASCADE
);
"#;

impl SnapshotStore for SqliteSnapshot {
  fn persist(&self, entities: &[Entity]) -> Result<()> {
    let mut conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "DELETE FROM snapshot_entities WHERE slot = ?",
      params![SLOT],
    )
    .map_err(|e| eyre!("Failed to clear previous snapshot: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO snapshot_meta (slot, persisted_at, entity_count)
       VALUES (?, datetime('now'), ?)",
      params![SLOT, entities.len()],
    )
    .map_err(|e| eyre!("Failed to update snapshot metadata: {}", e))?;

    for (position, entity) in entities.iter().enumerate() {
      let data = serde_json::to_vec(&entity.record)
        .map_err(|e| eyre!("Failed to serialize entity {}: {}", entity.id, e))?;

      tx.execute(
        "INSERT INTO snapshot_entities (slot, position, entity_id, data) VALUES (?, ?, ?, ?)",
        params![SLOT, position, entity.id, data],
      )
      .map_err(|e| eyre!("Failed to store entity {}: {}", entity.id, e))?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit snapshot: {}", e))?;

    Ok(())
  }

  fn restore(&self) -> Result<Option<Snapshot>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let persisted_at: Option<String> = conn
      .query_row(
        "SELECT persisted_at FROM snapshot_meta WHERE slot = ?",
        params![SLOT],
        |row| row.get(0),
      )
      .ok();

    let persisted_at = match persisted_at {
      Some(s) => parse_datetime(&s)?,
      None => return Ok(None),
    };

    let mut stmt = conn
      .prepare(
        "SELECT entity_id, data FROM snapshot_entities
         WHERE slot = ?
         ORDER BY position",
      )
      .map_err(|e| eyre!("Failed to prepare snapshot query: {}", e))?;

    // Rows that no longer parse are skipped rather than failing the warm start
    let entities: Vec<Entity> = stmt
      .query_map(params![SLOT], |row| {
        let id: String = row.get(0)?;
        let data: Vec<u8> = row.get(1)?;
        Ok((id, data))
      })
      .map_err(|e| eyre!("Failed to query snapshot entities: {}", e))?
      .filter_map(|r| r.ok())
      .filter_map(|(id, data)| {
        serde_json::from_slice(&data)
          .ok()
          .map(|record| Entity::new(id, record))
      })
      .collect();

    Ok(Some(Snapshot {
      entities,
      persisted_at,
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
