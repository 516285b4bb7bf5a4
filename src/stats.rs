//! Read-only aggregation over the store and artifact cache for display.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::artifacts::{ArtifactCache, CacheStats};
use crate::error::StoreError;
use crate::records::SYNCABLE_COLLECTIONS;
use crate::store::{Index, IndexValue, Store};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStats {
  /// False when running on the memory-only fallback
  pub persistent: bool,
  /// Item count per collection
  pub usage: BTreeMap<String, u64>,
  /// Unsynced record count per syncable collection
  pub pending: BTreeMap<String, u64>,
  pub total_pending: u64,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub artifacts: Option<CacheStats>,
}

pub async fn collect(store: &Store, artifacts: Option<&ArtifactCache>) -> Result<OfflineStats, StoreError> {
  let usage = store.usage().await?;

  let mut pending = BTreeMap::new();
  for collection in SYNCABLE_COLLECTIONS {
    let rows = store
      .query_by_index(collection, Index::Synced, IndexValue::Flag(false))
      .await?;
    pending.insert(collection.to_string(), rows.len() as u64);
  }
  let total_pending = pending.values().sum();

  let artifacts = match artifacts {
    Some(cache) => Some(cache.get_cache_stats().await),
    None => None,
  };

  Ok(OfflineStats {
    persistent: store.is_persistent(),
    usage,
    pending,
    total_pending,
    artifacts,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::artifacts::{ArtifactCacheConfig, ArtifactMetadata};
  use crate::records::{CapturedImage, Outbox, IMAGES};

  #[tokio::test]
  async fn test_collect_counts_pending_and_artifacts() {
    let store = Store::memory();
    let images = Outbox::<CapturedImage>::new(store.clone());
    let first = images
      .append(CapturedImage {
        filename: "a.png".into(),
        mime_type: "image/png".into(),
        data: "aGVsbG8=".into(),
        width: Some(224),
        height: Some(224),
      })
      .await
      .unwrap();
    images
      .append(CapturedImage {
        filename: "b.png".into(),
        mime_type: "image/png".into(),
        data: "d29ybGQ=".into(),
        width: None,
        height: None,
      })
      .await
      .unwrap();
    images.mark_synced(&first.id).await.unwrap();

    let cache = ArtifactCache::open(store.clone(), ArtifactCacheConfig::default())
      .await
      .unwrap();
    cache
      .add_to_cache("resnet", vec![0u8; 64], ArtifactMetadata::default())
      .await
      .unwrap();

    let stats = collect(&store, Some(&cache)).await.unwrap();
    assert!(!stats.persistent);
    assert_eq!(stats.usage.get(IMAGES), Some(&2));
    assert_eq!(stats.pending.get(IMAGES), Some(&1));
    assert_eq!(stats.total_pending, 1);
    assert_eq!(stats.artifacts.map(|a| a.total_count), Some(1));
  }

  #[tokio::test]
  async fn test_empty_store() {
    let stats = collect(&Store::memory(), None).await.unwrap();
    assert!(stats.usage.is_empty());
    assert_eq!(stats.total_pending, 0);
    assert_eq!(stats.pending.len(), 3);
    assert_eq!(stats.artifacts, None);
  }
}
