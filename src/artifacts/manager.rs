//! ArtifactCache implementation with LRU eviction over persisted payloads.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::config::ArtifactCacheConfig;
use super::types::{
  checksum, ArtifactMetadata, CacheStats, CachedArtifact, ValidationReport, METADATA_COLLECTION,
  PAYLOAD_COLLECTION,
};
use crate::clock::{Clock, SystemClock};
use crate::error::{ArtifactError, StoreError};
use crate::store::{to_millis, Record, Store, StoredRow};

/// In-memory mirror of the persisted artifact metadata.
#[derive(Debug, Default)]
struct ArtifactIndex {
  entries: HashMap<String, CachedArtifact>,
  next_seq: u64,
}

impl ArtifactIndex {
  fn total_size(&self) -> u64 {
    self.entries.values().map(|a| a.size).sum()
  }

  fn total_count(&self) -> u64 {
    self.entries.len() as u64
  }

  fn lru_name(&self, keep: Option<&str>) -> Option<String> {
    self
      .entries
      .values()
      .filter(|a| Some(a.name.as_str()) != keep)
      .min_by_key(|a| a.eviction_key())
      .map(|a| a.name.clone())
  }
}

/// Bounded cache of model payloads.
///
/// Metadata and payloads are persisted in the store; the index is owned by
/// this object and rebuilt from the store on [`ArtifactCache::open`].
pub struct ArtifactCache {
  store: Store,
  config: ArtifactCacheConfig,
  clock: Arc<dyn Clock>,
  index: Mutex<ArtifactIndex>,
}

impl ArtifactCache {
  pub async fn open(store: Store, config: ArtifactCacheConfig) -> Result<Self, ArtifactError> {
    Self::open_with_clock(store, config, Arc::new(SystemClock)).await
  }

  pub async fn open_with_clock(
    store: Store,
    config: ArtifactCacheConfig,
    clock: Arc<dyn Clock>,
  ) -> Result<Self, ArtifactError> {
    config.validate()?;

    let mut index = ArtifactIndex::default();
    for row in store.scan(METADATA_COLLECTION).await? {
      match CachedArtifact::from_row(&row) {
        Ok(artifact) => {
          index.next_seq = index.next_seq.max(artifact.seq + 1);
          index.entries.insert(artifact.name.clone(), artifact);
        }
        Err(e) => {
          warn!(name = %row.id, error = %e, "Dropping unreadable artifact metadata");
          store.delete(METADATA_COLLECTION, &row.id).await?;
          store.delete(PAYLOAD_COLLECTION, &row.id).await?;
        }
      }
    }

    debug!(count = index.entries.len(), "Loaded artifact index");
    Ok(Self {
      store,
      config,
      clock,
      index: Mutex::new(index),
    })
  }

  pub fn config(&self) -> &ArtifactCacheConfig {
    &self.config
  }

  /// Store a payload under `name`, replacing any previous entry with the same
  /// name, then run cleanup if auto-cleanup is enabled.
  ///
  /// Payloads larger than the cleanup size limit are rejected with
  /// [`ArtifactError::TooLarge`]. Cleanup never evicts the entry just added.
  pub async fn add_to_cache(
    &self,
    name: &str,
    payload: Vec<u8>,
    metadata: ArtifactMetadata,
  ) -> Result<CachedArtifact, ArtifactError> {
    let size = payload.len() as u64;
    let limit = self.config.max_payload();
    if size > limit {
      return Err(ArtifactError::TooLarge {
        name: name.to_string(),
        size,
        limit,
      });
    }

    let mut index = self.index.lock().await;
    let now = self.clock.now();

    let created_at = index
      .entries
      .get(name)
      .map(|existing| existing.created_at)
      .unwrap_or(now);
    let artifact = CachedArtifact {
      id: uuid::Uuid::new_v4().to_string(),
      name: name.to_string(),
      category: metadata.category,
      size,
      created_at,
      last_used_at: now,
      pretrained: metadata.pretrained,
      accuracy: metadata.accuracy,
      description: metadata.description,
      seq: index.next_seq,
      checksum: checksum(&payload),
    };

    self
      .store
      .put(
        PAYLOAD_COLLECTION,
        StoredRow {
          id: name.to_string(),
          created_at: to_millis(created_at),
          synced: false,
          data: payload,
        },
      )
      .await?;
    self.store.put_record(&artifact).await?;

    index.next_seq += 1;
    index.entries.insert(name.to_string(), artifact.clone());
    info!(name, size = artifact.size, "Artifact cached");

    if self.config.auto_cleanup {
      self.cleanup_locked(&mut index, Some(name)).await?;
    }

    Ok(artifact)
  }

  /// Fetch a payload and mark it as recently used.
  ///
  /// An entry whose payload is missing or fails verification is purged and
  /// reported as a miss.
  pub async fn get_from_cache(&self, name: &str) -> Result<Option<Vec<u8>>, ArtifactError> {
    let mut index = self.index.lock().await;
    let Some(entry) = index.entries.get(name).cloned() else {
      debug!(name, "Artifact cache miss");
      return Ok(None);
    };

    let payload = match self.load_payload(&entry).await? {
      Some(payload) => payload,
      None => {
        warn!(name, "Cached artifact failed to load, purging");
        self.purge_locked(&mut index, name).await?;
        return Ok(None);
      }
    };

    let mut touched = entry;
    touched.last_used_at = self.clock.now().max(touched.last_used_at);
    self.store.put_record(&touched).await?;
    index.entries.insert(name.to_string(), touched);

    debug!(name, "Artifact cache hit");
    Ok(Some(payload))
  }

  /// Delete an artifact. Returns false when it was not cached.
  pub async fn remove_from_cache(&self, name: &str) -> Result<bool, ArtifactError> {
    let mut index = self.index.lock().await;
    let removed = self.purge_locked(&mut index, name).await?;
    if removed {
      info!(name, "Removed artifact from cache");
    }
    Ok(removed)
  }

  /// Evict least-recently-used entries until both bounds sit at or below
  /// `threshold * limit`. Returns the evicted names in eviction order.
  pub async fn cleanup(&self) -> Result<Vec<String>, ArtifactError> {
    let mut index = self.index.lock().await;
    self.cleanup_locked(&mut index, None).await
  }

  /// Evict down to the limits, sparing `keep`.
  async fn cleanup_locked(
    &self,
    index: &mut ArtifactIndex,
    keep: Option<&str>,
  ) -> Result<Vec<String>, ArtifactError> {
    let size_limit = self.config.size_limit();
    let count_limit = self.config.count_limit();
    let mut evicted = Vec::new();

    while index.total_size() as f64 > size_limit || index.total_count() as f64 > count_limit {
      let Some(victim) = index.lru_name(keep) else {
        break;
      };
      self.purge_locked(index, &victim).await?;
      info!(name = %victim, "Evicted LRU artifact from cache");
      evicted.push(victim);
    }

    Ok(evicted)
  }

  pub async fn get_cache_stats(&self) -> CacheStats {
    let index = self.index.lock().await;
    let total_size = index.total_size();
    CacheStats {
      total_size,
      total_count: index.total_count(),
      max_size: self.config.max_size,
      max_models: self.config.max_models,
      usage_percentage: total_size as f64 / self.config.max_size as f64 * 100.0,
    }
  }

  /// Try to load every indexed payload, purging those that fail.
  pub async fn validate_cached_models(&self) -> Result<ValidationReport, ArtifactError> {
    let mut index = self.index.lock().await;
    let entries: Vec<CachedArtifact> = index.entries.values().cloned().collect();
    let mut report = ValidationReport::default();

    for entry in entries {
      if self.load_payload(&entry).await?.is_some() {
        report.valid += 1;
      } else {
        warn!(name = %entry.name, "Invalid cached artifact, purging");
        self.purge_locked(&mut index, &entry.name).await?;
        report.invalid += 1;
      }
    }

    info!(valid = report.valid, invalid = report.invalid, "Validated cached artifacts");
    Ok(report)
  }

  /// Cached artifacts, most recently used first.
  pub async fn list(&self) -> Vec<CachedArtifact> {
    let index = self.index.lock().await;
    let mut entries: Vec<CachedArtifact> = index.entries.values().cloned().collect();
    entries.sort_by_key(|a| std::cmp::Reverse(a.eviction_key()));
    entries
  }

  pub async fn contains(&self, name: &str) -> bool {
    self.index.lock().await.entries.contains_key(name)
  }

  /// Remove every artifact. Returns how many were removed.
  pub async fn clear(&self) -> Result<u64, ArtifactError> {
    let mut index = self.index.lock().await;
    let cleared = index.total_count();
    self.store.clear(METADATA_COLLECTION).await?;
    self.store.clear(PAYLOAD_COLLECTION).await?;
    index.entries.clear();
    info!(cleared, "Cleared artifact cache");
    Ok(cleared)
  }

  /// Load and verify a payload. `None` means the entry is unusable.
  async fn load_payload(&self, entry: &CachedArtifact) -> Result<Option<Vec<u8>>, StoreError> {
    let Some(row) = self.store.get(PAYLOAD_COLLECTION, &entry.name).await? else {
      return Ok(None);
    };
    if row.data.len() as u64 != entry.size || checksum(&row.data) != entry.checksum {
      return Ok(None);
    }
    Ok(Some(row.data))
  }

  async fn purge_locked(&self, index: &mut ArtifactIndex, name: &str) -> Result<bool, StoreError> {
    let had_meta = self.store.delete(METADATA_COLLECTION, name).await?;
    let had_payload = self.store.delete(PAYLOAD_COLLECTION, name).await?;
    let had_entry = index.entries.remove(name).is_some();
    Ok(had_meta || had_payload || had_entry)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  fn config(max_size: u64, max_models: u64, threshold: f64) -> ArtifactCacheConfig {
    ArtifactCacheConfig {
      max_size,
      max_models,
      cleanup_threshold: threshold,
      auto_cleanup: true,
    }
  }

  fn meta() -> ArtifactMetadata {
    ArtifactMetadata {
      category: "retina".into(),
      ..Default::default()
    }
  }

  async fn cache_with(config: ArtifactCacheConfig) -> (ArtifactCache, ManualClock, Store) {
    let clock = ManualClock::new(0);
    let store = Store::memory();
    let cache = ArtifactCache::open_with_clock(store.clone(), config, Arc::new(clock.clone()))
      .await
      .unwrap();
    (cache, clock, store)
  }

  async fn names(cache: &ArtifactCache) -> Vec<String> {
    let mut names: Vec<String> = cache.list().await.into_iter().map(|a| a.name).collect();
    names.sort();
    names
  }

  #[tokio::test]
  async fn test_count_bound_evicts_oldest() {
    let (cache, clock, _) = cache_with(config(1_000, 2, 1.0)).await;

    for (t, name) in [(1, "A"), (2, "B"), (3, "C")] {
      clock.set(t);
      cache.add_to_cache(name, vec![0u8; 10], meta()).await.unwrap();
    }

    assert_eq!(names(&cache).await, vec!["B", "C"]);
    assert_eq!(cache.get_cache_stats().await.total_count, 2);
  }

  #[tokio::test]
  async fn test_get_bumps_recency_and_protects_entry() {
    let (cache, clock, _) = cache_with(config(1_000, 2, 1.0)).await;

    clock.set(1);
    cache.add_to_cache("A", vec![1; 10], meta()).await.unwrap();
    clock.set(2);
    cache.add_to_cache("B", vec![2; 10], meta()).await.unwrap();
    clock.set(3);
    assert_eq!(cache.get_from_cache("A").await.unwrap(), Some(vec![1; 10]));
    clock.set(4);
    cache.add_to_cache("C", vec![3; 10], meta()).await.unwrap();

    assert_eq!(names(&cache).await, vec!["A", "C"]);
  }

  #[tokio::test]
  async fn test_ties_break_by_insertion_order() {
    let (cache, _clock, _) = cache_with(config(1_000, 2, 1.0)).await;

    // Clock never moves, so every entry has the same last_used_at
    for name in ["first", "second", "third"] {
      cache.add_to_cache(name, vec![0; 5], meta()).await.unwrap();
    }

    assert_eq!(names(&cache).await, vec!["second", "third"]);
  }

  #[tokio::test]
  async fn test_size_bound_cleans_below_threshold() {
    let (cache, clock, _) = cache_with(ArtifactCacheConfig {
      auto_cleanup: false,
      ..config(100, 100, 0.8)
    })
    .await;

    for (t, name) in [(1, "a"), (2, "b"), (3, "c"), (4, "d")] {
      clock.set(t);
      cache.add_to_cache(name, vec![0; 30], meta()).await.unwrap();
    }
    assert_eq!(cache.get_cache_stats().await.total_size, 120);

    let evicted = cache.cleanup().await.unwrap();
    assert_eq!(evicted, vec!["a", "b"]);

    let stats = cache.get_cache_stats().await;
    assert!(stats.total_size as f64 <= 80.0);
    assert!((stats.usage_percentage - 60.0).abs() < 1e-9);
  }

  #[tokio::test]
  async fn test_payload_over_cleanup_limit_is_rejected() {
    let (cache, _, store) = cache_with(config(100, 10, 0.8)).await;
    cache.add_to_cache("small", vec![0; 10], meta()).await.unwrap();

    let err = cache
      .add_to_cache("huge", vec![0; 90], meta())
      .await
      .unwrap_err();
    assert!(matches!(
      err,
      ArtifactError::TooLarge {
        size: 90,
        limit: 80,
        ..
      }
    ));
    assert!(!cache.contains("huge").await);
    assert!(store.get(PAYLOAD_COLLECTION, "huge").await.unwrap().is_none());
    assert!(cache.contains("small").await);
  }

  #[tokio::test]
  async fn test_added_entry_survives_its_own_cleanup() {
    let (cache, clock, _) = cache_with(config(100, 1, 0.8)).await;
    clock.set(1);
    cache.add_to_cache("old", vec![0; 60], meta()).await.unwrap();
    clock.set(2);
    let added = cache.add_to_cache("new", vec![0; 60], meta()).await.unwrap();

    assert_eq!(added.name, "new");
    assert!(cache.contains("new").await);
    assert!(!cache.contains("old").await);
    assert_eq!(cache.get_from_cache("new").await.unwrap(), Some(vec![0; 60]));
  }

  #[tokio::test]
  async fn test_get_after_add_roundtrips_payload() {
    let (cache, clock, _) = cache_with(config(1_000, 10, 0.8)).await;
    clock.set(10);
    let added = cache.add_to_cache("m", b"weights".to_vec(), meta()).await.unwrap();
    clock.set(20);

    assert_eq!(cache.get_from_cache("m").await.unwrap(), Some(b"weights".to_vec()));
    let listed = cache.list().await;
    assert!(listed[0].last_used_at >= added.last_used_at);
    assert_eq!(listed[0].size, 7);
  }

  #[tokio::test]
  async fn test_last_used_never_moves_backwards() {
    let (cache, clock, _) = cache_with(config(1_000, 10, 0.8)).await;
    clock.set(100);
    cache.add_to_cache("m", vec![1], meta()).await.unwrap();
    clock.set(50);
    cache.get_from_cache("m").await.unwrap();

    assert_eq!(cache.list().await[0].last_used_at.timestamp_millis(), 100);
  }

  #[tokio::test]
  async fn test_remove_then_get_is_miss() {
    let (cache, _, store) = cache_with(config(1_000, 10, 0.8)).await;
    cache.add_to_cache("m", vec![1, 2, 3], meta()).await.unwrap();

    assert!(cache.remove_from_cache("m").await.unwrap());
    assert!(!cache.remove_from_cache("m").await.unwrap());
    assert_eq!(cache.get_from_cache("m").await.unwrap(), None);
    assert_eq!(store.count(PAYLOAD_COLLECTION).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_corrupt_payload_is_purged_on_get() {
    let (cache, _, store) = cache_with(config(1_000, 10, 0.8)).await;
    cache.add_to_cache("m", vec![1, 2, 3], meta()).await.unwrap();

    let mut row = store.get(PAYLOAD_COLLECTION, "m").await.unwrap().unwrap();
    row.data = vec![9, 9, 9];
    store.put(PAYLOAD_COLLECTION, row).await.unwrap();

    assert_eq!(cache.get_from_cache("m").await.unwrap(), None);
    assert!(!cache.contains("m").await);
    assert_eq!(store.count(METADATA_COLLECTION).await.unwrap(), 0);
  }

  #[tokio::test]
  async fn test_validate_purges_missing_payloads() {
    let (cache, _, store) = cache_with(config(1_000, 10, 0.8)).await;
    cache.add_to_cache("good", vec![1], meta()).await.unwrap();
    cache.add_to_cache("bad", vec![2], meta()).await.unwrap();
    store.delete(PAYLOAD_COLLECTION, "bad").await.unwrap();

    let report = cache.validate_cached_models().await.unwrap();
    assert_eq!(report, ValidationReport { valid: 1, invalid: 1 });
    assert_eq!(names(&cache).await, vec!["good"]);
  }

  #[tokio::test]
  async fn test_index_is_rebuilt_from_store() {
    let (cache, clock, store) = cache_with(config(1_000, 10, 0.8)).await;
    clock.set(5);
    cache.add_to_cache("kept", vec![7; 4], meta()).await.unwrap();
    drop(cache);

    let reopened = ArtifactCache::open_with_clock(
      store,
      config(1_000, 10, 0.8),
      Arc::new(clock.clone()),
    )
    .await
    .unwrap();
    assert!(reopened.contains("kept").await);

    // New insertions continue the sequence
    let next = reopened.add_to_cache("next", vec![1], meta()).await.unwrap();
    assert_eq!(next.seq, 1);
  }

  #[tokio::test]
  async fn test_clear_empties_cache() {
    let (cache, _, _) = cache_with(config(1_000, 10, 0.8)).await;
    cache.add_to_cache("a", vec![1], meta()).await.unwrap();
    cache.add_to_cache("b", vec![1], meta()).await.unwrap();

    assert_eq!(cache.clear().await.unwrap(), 2);
    assert_eq!(cache.get_cache_stats().await.total_count, 0);
  }
}
