//! SQLite implementation of the storage port.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::traits::{Index, IndexValue, StoragePort, StoredRow};
use crate::error::StoreError;

/// Schema version written to `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Schema for the record tables. Every statement is idempotent.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    synced INTEGER NOT NULL DEFAULT 0,
    data BLOB NOT NULL,
    PRIMARY KEY (collection, id)
);

CREATE INDEX IF NOT EXISTS idx_records_created
    ON records(collection, created_at);

CREATE INDEX IF NOT EXISTS idx_records_synced
    ON records(collection, synced, created_at);
"#;

fn unavailable(context: &str, e: impl std::fmt::Display) -> StoreError {
  StoreError::StorageUnavailable(format!("{}: {}", context, e))
}

/// SQLite-backed store.
///
/// The connection is opened lazily by [`StoragePort::init`] (or the first
/// operation) and shared by every subsequent caller.
pub struct SqliteStore {
  path: PathBuf,
  conn: OnceCell<Arc<Mutex<Connection>>>,
}

impl SqliteStore {
  pub fn new(path: impl Into<PathBuf>) -> Self {
    Self {
      path: path.into(),
      conn: OnceCell::new(),
    }
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf, StoreError> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| StoreError::StorageUnavailable("Could not determine data directory".into()))?;

    Ok(data_dir.join("retina-offline").join("offline.db"))
  }

  pub fn path(&self) -> &Path {
    &self.path
  }

  async fn connection(&self) -> Result<Arc<Mutex<Connection>>, StoreError> {
    let conn = self
      .conn
      .get_or_try_init(|| {
        let path = self.path.clone();
        async move {
          let conn = tokio::task::spawn_blocking(move || open_connection(&path)).await??;
          Ok::<_, StoreError>(Arc::new(Mutex::new(conn)))
        }
      })
      .await?;
    Ok(Arc::clone(conn))
  }

  /// Run `f` against the connection on the blocking pool.
  async fn with_conn<F, R>(&self, f: F) -> Result<R, StoreError>
  where
    F: FnOnce(&mut Connection) -> Result<R, StoreError> + Send + 'static,
    R: Send + 'static,
  {
    let conn = self.connection().await?;
    tokio::task::spawn_blocking(move || {
      let mut guard = conn
        .lock()
        .map_err(|e| unavailable("Lock poisoned", e))?;
      f(&mut guard)
    })
    .await?
  }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
  if let Some(parent) = path.parent() {
    if !parent.as_os_str().is_empty() {
      std::fs::create_dir_all(parent)
        .map_err(|e| unavailable("Failed to create store directory", e))?;
    }
  }

  let conn = Connection::open(path)
    .map_err(|e| unavailable(&format!("Failed to open store at {}", path.display()), e))?;

  let version: i64 = conn
    .pragma_query_value(None, "user_version", |row| row.get(0))
    .map_err(|e| unavailable("Failed to read schema version", e))?;
  if version > SCHEMA_VERSION {
    return Err(StoreError::StorageUnavailable(format!(
      "Store at {} has schema version {}, newer than supported {}",
      path.display(),
      version,
      SCHEMA_VERSION
    )));
  }

  conn
    .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))
    .map_err(|e| unavailable("Failed to enable WAL", e))?;
  conn
    .pragma_update(None, "synchronous", "FULL")
    .map_err(|e| unavailable("Failed to set synchronous mode", e))?;

  conn
    .execute_batch(SCHEMA)
    .map_err(|e| unavailable("Failed to run store migrations", e))?;
  conn
    .pragma_update(None, "user_version", SCHEMA_VERSION)
    .map_err(|e| unavailable("Failed to write schema version", e))?;

  info!(path = %path.display(), version = SCHEMA_VERSION, "Opened offline store");
  Ok(conn)
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredRow> {
  Ok(StoredRow {
    id: row.get(0)?,
    created_at: row.get(1)?,
    synced: row.get(2)?,
    data: row.get(3)?,
  })
}

/// Select ids matching `filter`, then delete them one by one in a single
/// transaction.
fn sweep(
  conn: &mut Connection,
  collection: &str,
  filter: &str,
  cutoff: i64,
) -> Result<u64, StoreError> {
  let tx = conn
    .transaction()
    .map_err(|e| unavailable("Failed to begin transaction", e))?;

  let ids: Vec<String> = {
    let sql = format!(
      "SELECT id FROM records WHERE collection = ? AND created_at < ? {} ORDER BY created_at",
      filter
    );
    let mut stmt = tx
      .prepare(&sql)
      .map_err(|e| unavailable("Failed to prepare sweep", e))?;
    let ids = stmt
      .query_map(params![collection, cutoff], |row| row.get(0))
      .map_err(|e| unavailable("Failed to scan rows", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| unavailable("Failed to read row id", e))?;
    ids
  };

  let mut deleted = 0u64;
  for id in &ids {
    deleted += tx
      .execute(
        "DELETE FROM records WHERE collection = ? AND id = ?",
        params![collection, id],
      )
      .map_err(|e| unavailable("Failed to delete row", e))? as u64;
  }

  tx.commit()
    .map_err(|e| unavailable("Failed to commit transaction", e))?;
  Ok(deleted)
}

#[async_trait]
impl StoragePort for SqliteStore {
  async fn init(&self) -> Result<(), StoreError> {
    self.connection().await.map(|_| ())
  }

  async fn put(&self, collection: &str, row: StoredRow) -> Result<(), StoreError> {
    let collection = collection.to_string();
    self
      .with_conn(move |conn| {
        conn
          .execute(
            "INSERT OR REPLACE INTO records (collection, id, created_at, synced, data)
             VALUES (?, ?, ?, ?, ?)",
            params![collection, row.id, row.created_at, row.synced, row.data],
          )
          .map_err(|e| unavailable("Failed to store row", e))?;
        Ok(())
      })
      .await
  }

  async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredRow>, StoreError> {
    let collection = collection.to_string();
    let id = id.to_string();
    self
      .with_conn(move |conn| {
        conn
          .query_row(
            "SELECT id, created_at, synced, data FROM records WHERE collection = ? AND id = ?",
            params![collection, id],
            read_row,
          )
          .optional()
          .map_err(|e| unavailable("Failed to read row", e))
      })
      .await
  }

  async fn scan(&self, collection: &str) -> Result<Vec<StoredRow>, StoreError> {
    let collection = collection.to_string();
    self
      .with_conn(move |conn| {
        let mut stmt = conn
          .prepare(
            "SELECT id, created_at, synced, data FROM records
             WHERE collection = ?
             ORDER BY created_at, id",
          )
          .map_err(|e| unavailable("Failed to prepare scan", e))?;
        let rows = stmt
          .query_map(params![collection], read_row)
          .map_err(|e| unavailable("Failed to scan collection", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| unavailable("Failed to read row", e))?;
        Ok(rows)
      })
      .await
  }

  async fn query_by_index(
    &self,
    collection: &str,
    index: Index,
    value: IndexValue,
  ) -> Result<Vec<StoredRow>, StoreError> {
    index.check(&value)?;
    let collection = collection.to_string();
    self
      .with_conn(move |conn| {
        let (sql, key): (&str, i64) = match value {
          IndexValue::Timestamp(t) => (
            "SELECT id, created_at, synced, data FROM records
             WHERE collection = ? AND created_at = ?
             ORDER BY created_at, id",
            t,
          ),
          IndexValue::Flag(f) => (
            "SELECT id, created_at, synced, data FROM records
             WHERE collection = ? AND synced = ?
             ORDER BY synced, created_at, id",
            i64::from(f),
          ),
        };
        let mut stmt = conn
          .prepare(sql)
          .map_err(|e| unavailable("Failed to prepare index query", e))?;
        let rows = stmt
          .query_map(params![collection, key], read_row)
          .map_err(|e| unavailable("Failed to query index", e))?
          .collect::<rusqlite::Result<Vec<_>>>()
          .map_err(|e| unavailable("Failed to read row", e))?;
        Ok(rows)
      })
      .await
  }

  async fn delete_older_than(
    &self,
    collection: &str,
    index: Index,
    cutoff: i64,
  ) -> Result<u64, StoreError> {
    if index != Index::CreatedAt {
      return Err(StoreError::InvalidIndex {
        index: index.name(),
        operation: "age-based deletion",
      });
    }
    let collection = collection.to_string();
    let deleted = self
      .with_conn(move |conn| sweep(conn, &collection, "", cutoff))
      .await?;
    debug!(deleted, cutoff, "Swept rows older than cutoff");
    Ok(deleted)
  }

  async fn delete_synced_older_than(
    &self,
    collection: &str,
    cutoff: i64,
  ) -> Result<u64, StoreError> {
    let collection = collection.to_string();
    self
      .with_conn(move |conn| sweep(conn, &collection, "AND synced = 1", cutoff))
      .await
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
    let collection = collection.to_string();
    let id = id.to_string();
    self
      .with_conn(move |conn| {
        let n = conn
          .execute(
            "DELETE FROM records WHERE collection = ? AND id = ?",
            params![collection, id],
          )
          .map_err(|e| unavailable("Failed to delete row", e))?;
        Ok(n > 0)
      })
      .await
  }

  async fn clear(&self, collection: &str) -> Result<u64, StoreError> {
    let collection = collection.to_string();
    self
      .with_conn(move |conn| {
        let n = conn
          .execute("DELETE FROM records WHERE collection = ?", params![collection])
          .map_err(|e| unavailable("Failed to clear collection", e))?;
        Ok(n as u64)
      })
      .await
  }

  async fn count(&self, collection: &str) -> Result<u64, StoreError> {
    let collection = collection.to_string();
    self
      .with_conn(move |conn| {
        let n: i64 = conn
          .query_row(
            "SELECT COUNT(*) FROM records WHERE collection = ?",
            params![collection],
            |row| row.get(0),
          )
          .map_err(|e| unavailable("Failed to count rows", e))?;
        Ok(n as u64)
      })
      .await
  }

  async fn collections(&self) -> Result<Vec<String>, StoreError> {
    self
      .with_conn(|conn| {
        let mut stmt = conn
          .prepare("SELECT DISTINCT collection FROM records ORDER BY collection")
          .map_err(|e| unavailable("Failed to prepare query", e))?;
        let names = stmt
          .query_map([], |row| row.get(0))
          .map_err(|e| unavailable("Failed to list collections", e))?
          .collect::<rusqlite::Result<Vec<String>>>()
          .map_err(|e| unavailable("Failed to read collection name", e))?;
        Ok(names)
      })
      .await
  }

  fn is_persistent(&self) -> bool {
    true
  }
}
