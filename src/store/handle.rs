//! Shared store handle with typed record helpers.

use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;

use tracing::warn;

use super::memory::MemoryStore;
use super::sqlite::SqliteStore;
use super::traits::{Index, IndexValue, Record, StoragePort};
use crate::error::StoreError;

/// Cloneable handle to a storage backend.
///
/// Derefs to [`StoragePort`] for raw row access.
#[derive(Clone)]
pub struct Store {
  port: Arc<dyn StoragePort>,
}

impl Store {
  pub fn new(port: impl StoragePort + 'static) -> Self {
    Self {
      port: Arc::new(port),
    }
  }

  pub fn memory() -> Self {
    Self::new(MemoryStore::new())
  }

  /// Open the SQLite store at `path`, or fall back to an in-memory store
  /// when the medium cannot be opened.
  pub async fn open_or_degrade(path: &Path) -> Self {
    let sqlite = SqliteStore::new(path);
    match sqlite.init().await {
      Ok(()) => Self::new(sqlite),
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Offline store unavailable, running without persistence");
        Self::memory()
      }
    }
  }

  pub async fn put_record<T: Record>(&self, record: &T) -> Result<(), StoreError> {
    self.port.put(T::collection(), record.to_row()?).await
  }

  pub async fn get_record<T: Record>(&self, id: &str) -> Result<Option<T>, StoreError> {
    match self.port.get(T::collection(), id).await? {
      Some(row) => Ok(Some(T::from_row(&row)?)),
      None => Ok(None),
    }
  }

  pub async fn query_records<T: Record>(
    &self,
    index: Index,
    value: IndexValue,
  ) -> Result<Vec<T>, StoreError> {
    self
      .port
      .query_by_index(T::collection(), index, value)
      .await?
      .iter()
      .map(T::from_row)
      .collect()
  }
}

impl Deref for Store {
  type Target = dyn StoragePort;

  fn deref(&self) -> &Self::Target {
    self.port.as_ref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_open_or_degrade_falls_back_to_memory() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("file");
    std::fs::write(&blocker, b"x").unwrap();

    let store = Store::open_or_degrade(&blocker.join("offline.db")).await;
    assert!(!store.is_persistent());
    // Still usable, just not durable
    assert_eq!(store.count("detections").await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_open_or_degrade_uses_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::open_or_degrade(&dir.path().join("offline.db")).await;
    assert!(store.is_persistent());
  }
}
