//! Versioned response cache namespaces persisted in the offline store.

use std::collections::BTreeMap;

use chrono::Utc;
use tracing::warn;

use super::types::FetchResponse;
use crate::error::StoreError;
use crate::store::{to_millis, Store, StoredRow};

/// Collection prefix for cached responses.
const COLLECTION_PREFIX: &str = "http:";

/// Logical cache namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
  Static,
  Data,
  Models,
  CrossOrigin,
}

impl Namespace {
  pub const ALL: [Namespace; 4] = [
    Namespace::Static,
    Namespace::Data,
    Namespace::Models,
    Namespace::CrossOrigin,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      Namespace::Static => "static",
      Namespace::Data => "data",
      Namespace::Models => "models",
      Namespace::CrossOrigin => "cross-origin",
    }
  }
}

/// Maps namespaces to versioned cache names, e.g. `retina-static-v1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheNames {
  prefix: String,
  version: u32,
}

impl CacheNames {
  pub fn new(prefix: impl Into<String>, version: u32) -> Self {
    Self {
      prefix: prefix.into(),
      version,
    }
  }

  pub fn name(&self, namespace: Namespace) -> String {
    format!("{}-{}-v{}", self.prefix, namespace.as_str(), self.version)
  }

  /// Every cache name the current version expects to exist.
  pub fn expected(&self) -> Vec<String> {
    Namespace::ALL.iter().map(|ns| self.name(*ns)).collect()
  }
}

impl Default for CacheNames {
  fn default() -> Self {
    Self::new("retina", 1)
  }
}

/// Response cache keyed by cache name and URL.
#[derive(Clone)]
pub struct ResponseCache {
  store: Store,
}

impl ResponseCache {
  pub fn new(store: Store) -> Self {
    Self { store }
  }

  fn collection(cache_name: &str) -> String {
    format!("{}{}", COLLECTION_PREFIX, cache_name)
  }

  /// Look up a cached response. Undecodable entries are dropped and
  /// reported as a miss.
  pub async fn get(&self, cache_name: &str, url: &str) -> Result<Option<FetchResponse>, StoreError> {
    let collection = Self::collection(cache_name);
    let Some(row) = self.store.get(&collection, url).await? else {
      return Ok(None);
    };
    match FetchResponse::decode(&row.data) {
      Some(response) => Ok(Some(response)),
      None => {
        warn!(cache = cache_name, url, "Dropping undecodable cached response");
        self.store.delete(&collection, url).await?;
        Ok(None)
      }
    }
  }

  pub async fn put(
    &self,
    cache_name: &str,
    url: &str,
    response: &FetchResponse,
  ) -> Result<(), StoreError> {
    let data = response.encode().map_err(|e| StoreError::Corrupt {
      collection: Self::collection(cache_name),
      id: url.to_string(),
      reason: e.to_string(),
    })?;
    self
      .store
      .put(
        &Self::collection(cache_name),
        StoredRow {
          id: url.to_string(),
          created_at: to_millis(Utc::now()),
          synced: false,
          data,
        },
      )
      .await
  }

  /// Drop a whole namespace. Returns the number of entries removed.
  pub async fn delete_cache(&self, cache_name: &str) -> Result<u64, StoreError> {
    self.store.clear(&Self::collection(cache_name)).await
  }

  /// Names of every non-empty cache.
  pub async fn cache_names(&self) -> Result<Vec<String>, StoreError> {
    Ok(
      self
        .store
        .collections()
        .await?
        .into_iter()
        .filter_map(|c| c.strip_prefix(COLLECTION_PREFIX).map(String::from))
        .collect(),
    )
  }

  /// Item count per cache name.
  pub async fn status(&self) -> Result<BTreeMap<String, u64>, StoreError> {
    let mut status = BTreeMap::new();
    for name in self.cache_names().await? {
      let count = self.store.count(&Self::collection(&name)).await?;
      status.insert(name, count);
    }
    Ok(status)
  }
}
