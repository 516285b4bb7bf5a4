//! Storage port and the row/record types it moves around.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::StoreError;

/// A single persisted row inside a named collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
  pub id: String,
  /// Creation time in milliseconds since the Unix epoch
  pub created_at: i64,
  pub synced: bool,
  /// Serialized record body
  pub data: Vec<u8>,
}

/// Secondary indices available on every collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
  CreatedAt,
  Synced,
}

impl Index {
  pub fn name(self) -> &'static str {
    match self {
      Index::CreatedAt => "created_at",
      Index::Synced => "synced",
    }
  }

  /// Reject values whose type does not match the index.
  pub(crate) fn check(self, value: &IndexValue) -> Result<(), StoreError> {
    match (self, value) {
      (Index::CreatedAt, IndexValue::Timestamp(_)) | (Index::Synced, IndexValue::Flag(_)) => Ok(()),
      _ => Err(StoreError::InvalidIndex {
        index: self.name(),
        operation: "lookup with a mismatched value type",
      }),
    }
  }

  pub(crate) fn matches(self, row: &StoredRow, value: &IndexValue) -> bool {
    match (self, value) {
      (Index::CreatedAt, IndexValue::Timestamp(t)) => row.created_at == *t,
      (Index::Synced, IndexValue::Flag(f)) => row.synced == *f,
      _ => false,
    }
  }
}

/// Key looked up through an [`Index`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexValue {
  Timestamp(i64),
  Flag(bool),
}

/// Backend-agnostic storage port.
///
/// Implementations must make every write durable before the returned future
/// resolves. Query results are ordered ascending by the index key, then by
/// `created_at`, then by id.
#[async_trait]
pub trait StoragePort: Send + Sync {
  /// Open or create the underlying medium. Safe to call repeatedly and
  /// concurrently; later calls reuse the first connection.
  async fn init(&self) -> Result<(), StoreError>;

  /// Upsert a row by id.
  async fn put(&self, collection: &str, row: StoredRow) -> Result<(), StoreError>;

  async fn get(&self, collection: &str, id: &str) -> Result<Option<StoredRow>, StoreError>;

  /// Every row in a collection, oldest first.
  async fn scan(&self, collection: &str) -> Result<Vec<StoredRow>, StoreError>;

  async fn query_by_index(
    &self,
    collection: &str,
    index: Index,
    value: IndexValue,
  ) -> Result<Vec<StoredRow>, StoreError>;

  /// Delete every row whose timestamp index is strictly below `cutoff`.
  /// Returns the number of rows removed.
  async fn delete_older_than(
    &self,
    collection: &str,
    index: Index,
    cutoff: i64,
  ) -> Result<u64, StoreError>;

  /// Like [`StoragePort::delete_older_than`] on `created_at`, restricted to rows
  /// already acknowledged by the remote.
  async fn delete_synced_older_than(&self, collection: &str, cutoff: i64)
    -> Result<u64, StoreError>;

  /// Delete a row. Returns whether it existed.
  async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError>;

  /// Delete every row in a collection.
  async fn clear(&self, collection: &str) -> Result<u64, StoreError>;

  async fn count(&self, collection: &str) -> Result<u64, StoreError>;

  /// Names of all collections holding at least one row.
  async fn collections(&self) -> Result<Vec<String>, StoreError>;

  /// Item count per non-empty collection.
  async fn usage(&self) -> Result<BTreeMap<String, u64>, StoreError> {
    let mut usage = BTreeMap::new();
    for name in self.collections().await? {
      let count = self.count(&name).await?;
      usage.insert(name, count);
    }
    Ok(usage)
  }

  /// Whether data written here survives a restart.
  fn is_persistent(&self) -> bool;
}

/// A typed entity stored in a fixed collection.
pub trait Record: Serialize + DeserializeOwned + Send + Sync {
  /// Collection the record lives in (e.g. "detections")
  fn collection() -> &'static str;

  fn id(&self) -> String;

  fn created_at(&self) -> DateTime<Utc>;

  fn synced(&self) -> bool {
    false
  }

  fn to_row(&self) -> Result<StoredRow, StoreError> {
    let data = serde_json::to_vec(self).map_err(|e| StoreError::Corrupt {
      collection: Self::collection().to_string(),
      id: self.id(),
      reason: e.to_string(),
    })?;
    Ok(StoredRow {
      id: self.id(),
      created_at: to_millis(self.created_at()),
      synced: self.synced(),
      data,
    })
  }

  fn from_row(row: &StoredRow) -> Result<Self, StoreError> {
    serde_json::from_slice(&row.data).map_err(|e| StoreError::Corrupt {
      collection: Self::collection().to_string(),
      id: row.id.clone(),
      reason: e.to_string(),
    })
  }
}

pub fn to_millis(at: DateTime<Utc>) -> i64 {
  at.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
