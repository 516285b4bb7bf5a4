//! In-memory storage port used for tests and as the degraded fallback.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;

use super::traits::{Index, IndexValue, StoragePort, StoredRow};
use crate::error::StoreError;

type Collections = BTreeMap<String, BTreeMap<String, StoredRow>>;

fn sort_rows(rows: &mut [StoredRow]) {
  rows.sort_by(|a, b| {
    a.created_at
      .cmp(&b.created_at)
      .then_with(|| a.id.cmp(&b.id))
  });
}

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
  collections: RwLock<Collections>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn read<R>(&self, f: impl FnOnce(&Collections) -> R) -> Result<R, StoreError> {
    let guard = self
      .collections
      .read()
      .map_err(|e| StoreError::StorageUnavailable(format!("Lock poisoned: {}", e)))?;
    Ok(f(&guard))
  }

  fn write<R>(&self, f: impl FnOnce(&mut Collections) -> R) -> Result<R, StoreError> {
    let mut guard = self
      .collections
      .write()
      .map_err(|e| StoreError::StorageUnavailable(format!("Lock poisoned: {}", e)))?;
    Ok(f(&mut guard))
  }

  fn sweep(
    &self,
    collection: &str,
    cutoff: i64,
    keep: impl Fn(&StoredRow) -> bool,
  ) -> Result<u64, StoreError> {
    self.write(|cols| {
      let Some(rows) = cols.get_mut(collection) else {
        return 0;
      };
      let before = rows.len();
      rows.retain(|_, row| row.created_at >= cutoff || keep(row));
      let removed = (before - rows.len()) as u64;
      if rows.is_empty() {
        cols.remove(collection);
      }
      removed
    })
  }
}

#[async_trait]
impl StoragePort for MemoryStore {
  async fn init(&self) -> Result<(), StoreError> {
    Ok(())
  }

  async fn put(&self, collection: &str, row: StoredRow) -> Result<(), StoreError> {
    self.write(|cols| {
      cols
        .entry(collection.to_string())
        .or_default()
        .insert(row.id.clone(), row);
    })
  }

  async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredRow>, StoreError> {
    self.read(|cols| cols.get(collection).and_then(|rows| rows.get(id)).cloned())
  }

  async fn scan(&self, collection: &str) -> Result<Vec<StoredRow>, StoreError> {
    self.read(|cols| {
      let mut rows: Vec<StoredRow> = cols
        .get(collection)
        .map(|rows| rows.values().cloned().collect())
        .unwrap_or_default();
      sort_rows(&mut rows);
      rows
    })
  }

  async fn query_by_index(
    &self,
    collection: &str,
    index: Index,
    value: IndexValue,
  ) -> Result<Vec<StoredRow>, StoreError> {
    index.check(&value)?;
    self.read(|cols| {
      let mut rows: Vec<StoredRow> = cols
        .get(collection)
        .map(|rows| {
          rows
            .values()
            .filter(|row| index.matches(row, &value))
            .cloned()
            .collect()
        })
        .unwrap_or_default();
      sort_rows(&mut rows);
      rows
    })
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
    self.sweep(collection, cutoff, |_| false)
  }

  async fn delete_synced_older_than(
    &self,
    collection: &str,
    cutoff: i64,
  ) -> Result<u64, StoreError> {
    self.sweep(collection, cutoff, |row| !row.synced)
  }

  async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
    self.write(|cols| {
      let Some(rows) = cols.get_mut(collection) else {
        return false;
      };
      let removed = rows.remove(id).is_some();
      if rows.is_empty() {
        cols.remove(collection);
      }
      removed
    })
  }

  async fn clear(&self, collection: &str) -> Result<u64, StoreError> {
    self.write(|cols| cols.remove(collection).map_or(0, |rows| rows.len() as u64))
  }

  async fn count(&self, collection: &str) -> Result<u64, StoreError> {
    self.read(|cols| cols.get(collection).map_or(0, |rows| rows.len() as u64))
  }

  async fn collections(&self) -> Result<Vec<String>, StoreError> {
    self.read(|cols| cols.keys().cloned().collect())
  }

  fn is_persistent(&self) -> bool {
    false
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn row(id: &str, created_at: i64, synced: bool) -> StoredRow {
    StoredRow {
      id: id.to_string(),
      created_at,
      synced,
      data: Vec::new(),
    }
  }

  #[tokio::test]
  async fn test_delete_older_than_boundary() {
    let store = MemoryStore::new();
    store.put("c", row("before", 9, false)).await.unwrap();
    store.put("c", row("at", 10, false)).await.unwrap();

    assert_eq!(store.delete_older_than("c", Index::CreatedAt, 10).await.unwrap(), 1);
    assert!(store.get("c", "at").await.unwrap().is_some());
    assert_eq!(store.delete_older_than("c", Index::CreatedAt, 10).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_age_deletion_requires_timestamp_index() {
    let store = MemoryStore::new();
    let err = store
      .delete_older_than("c", Index::Synced, 10)
      .await
      .unwrap_err();
    assert!(matches!(err, StoreError::InvalidIndex { .. }));
  }

  #[tokio::test]
  async fn test_empty_collections_are_dropped() {
    let store = MemoryStore::new();
    store.put("c", row("a", 1, false)).await.unwrap();
    assert!(store.delete("c", "a").await.unwrap());
    assert!(!store.delete("c", "a").await.unwrap());
    assert!(store.collections().await.unwrap().is_empty());
  }
}
