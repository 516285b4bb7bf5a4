//! Drains unsynced records to the remote endpoint.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::remote::RemoteSink;
use crate::error::SyncError;
use crate::records::{mark_row_synced, DETECTIONS, IMAGES, SYNCABLE_COLLECTIONS, TRAINING_SESSIONS};
use crate::store::{Index, IndexValue, Store, StoredRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
  Idle,
  Syncing,
  /// Last drain pushed every pending record
  Completed,
  /// Last drain left some records pending
  PartialFailure,
}

/// Background sync tags, one per syncable domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTag {
  DetectionData,
  ModelData,
}

impl SyncTag {
  pub fn as_str(self) -> &'static str {
    match self {
      SyncTag::DetectionData => "detection-data",
      SyncTag::ModelData => "model-data",
    }
  }

  pub fn collections(self) -> &'static [&'static str] {
    match self {
      SyncTag::DetectionData => &[DETECTIONS, TRAINING_SESSIONS, IMAGES],
      SyncTag::ModelData => &[TRAINING_SESSIONS],
    }
  }
}

impl fmt::Display for SyncTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncTag {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "detection-data" => Ok(SyncTag::DetectionData),
      "model-data" => Ok(SyncTag::ModelData),
      other => Err(format!("Unknown sync tag: {}", other)),
    }
  }
}

/// One record that could not be pushed. It stays pending for the next drain.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncItemFailed {
  pub collection: String,
  pub id: Option<String>,
  pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
  pub synced_count: usize,
  pub errors: Vec<SyncItemFailed>,
}

impl SyncReport {
  fn fail(&mut self, collection: &str, id: Option<&str>, error: impl fmt::Display) {
    self.errors.push(SyncItemFailed {
      collection: collection.to_string(),
      id: id.map(String::from),
      error: error.to_string(),
    });
  }

  fn merge(&mut self, other: SyncReport) {
    self.synced_count += other.synced_count;
    self.errors.extend(other.errors);
  }
}

type ClaimKey = (String, String);

/// Ids currently being pushed by some drain.
#[derive(Default)]
struct InFlight {
  claims: Mutex<HashSet<ClaimKey>>,
}

impl InFlight {
  fn claim(&self, collection: &str, id: &str) -> Option<Claim<'_>> {
    let key = (collection.to_string(), id.to_string());
    let mut claims = self.claims.lock().unwrap_or_else(PoisonError::into_inner);
    if !claims.insert(key.clone()) {
      return None;
    }
    Some(Claim { owner: self, key })
  }
}

/// Releases the claim on drop, including when a drain future is dropped.
struct Claim<'a> {
  owner: &'a InFlight,
  key: ClaimKey,
}

impl Drop for Claim<'_> {
  fn drop(&mut self) {
    let mut claims = self.owner.claims.lock().unwrap_or_else(PoisonError::into_inner);
    claims.remove(&self.key);
  }
}

pub struct SyncCoordinator {
  store: Store,
  remote: Arc<dyn RemoteSink>,
  collections: Vec<String>,
  in_flight: InFlight,
  running: AtomicUsize,
  /// Set by any overlapping drain that left records pending
  failed: AtomicBool,
  state: watch::Sender<SyncState>,
}

impl SyncCoordinator {
  pub fn new(store: Store, remote: Arc<dyn RemoteSink>) -> Self {
    Self::with_collections(store, remote, SYNCABLE_COLLECTIONS.iter().copied())
  }

  pub fn with_collections<I, S>(store: Store, remote: Arc<dyn RemoteSink>, collections: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    let (state, _) = watch::channel(SyncState::Idle);
    Self {
      store,
      remote,
      collections: collections.into_iter().map(Into::into).collect(),
      in_flight: InFlight::default(),
      running: AtomicUsize::new(0),
      failed: AtomicBool::new(false),
      state,
    }
  }

  pub fn state(&self) -> SyncState {
    *self.state.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<SyncState> {
    self.state.subscribe()
  }

  /// Drain every registered collection.
  pub async fn drain(&self) -> SyncReport {
    let collections = self.collections.clone();
    self.run(&collections).await
  }

  /// Drain the collections behind a background sync tag.
  pub async fn drain_tag(&self, tag: SyncTag) -> SyncReport {
    let collections: Vec<String> = tag
      .collections()
      .iter()
      .filter(|c| self.collections.iter().any(|r| r == *c))
      .map(|c| c.to_string())
      .collect();
    debug!(tag = %tag, ?collections, "Draining tag");
    self.run(&collections).await
  }

  async fn run(&self, collections: &[String]) -> SyncReport {
    self.running.fetch_add(1, Ordering::SeqCst);
    self.state.send_replace(SyncState::Syncing);

    let mut report = SyncReport::default();
    for collection in collections {
      report.merge(self.drain_collection(collection).await);
    }

    if !report.errors.is_empty() {
      self.failed.store(true, Ordering::SeqCst);
    }
    // Only the last overlapping drain publishes the outcome, covering every
    // drain in the overlap.
    if self.running.fetch_sub(1, Ordering::SeqCst) == 1 {
      let outcome = if !self.failed.swap(false, Ordering::SeqCst) {
        SyncState::Completed
      } else {
        SyncState::PartialFailure
      };
      self.state.send_replace(outcome);
    }

    if report.synced_count > 0 || !report.errors.is_empty() {
      info!(
        synced = report.synced_count,
        failed = report.errors.len(),
        "Sync drain finished"
      );
    }
    report
  }

  async fn drain_collection(&self, collection: &str) -> SyncReport {
    let mut report = SyncReport::default();

    let pending = match self
      .store
      .query_by_index(collection, Index::Synced, IndexValue::Flag(false))
      .await
    {
      Ok(rows) => rows,
      Err(e) => {
        warn!(collection, error = %e, "Failed to list pending records");
        report.fail(collection, None, e);
        return report;
      }
    };

    for row in pending {
      let Some(_claim) = self.in_flight.claim(collection, &row.id) else {
        debug!(collection, id = %row.id, "Record already in flight");
        continue;
      };

      match self.push_one(collection, &row).await {
        Ok(true) => report.synced_count += 1,
        Ok(false) => {}
        Err(e) => {
          warn!(collection, id = %row.id, error = %e, "Sync item failed");
          report.fail(collection, Some(&row.id), e);
        }
      }
    }

    report
  }

  /// Push one record if it is still unsynced. Returns whether this call
  /// synced it.
  async fn push_one(&self, collection: &str, row: &StoredRow) -> Result<bool, SyncError> {
    let current = match self.store.get(collection, &row.id).await? {
      Some(current) if !current.synced => current,
      _ => return Ok(false),
    };

    self
      .remote
      .push(collection, &current.id, &current.data)
      .await?;
    Ok(mark_row_synced(&self.store, collection, &current.id).await?)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::records::{ClassConfidence, DetectionResult, Outbox, TrainingSession, TrainingStatus};
  use async_trait::async_trait;
  use std::collections::HashMap;
  use std::time::Duration;

  /// Remote that counts pushes per id and rejects ids listed in `reject`.
  #[derive(Default)]
  struct CountingRemote {
    pushes: Mutex<HashMap<String, usize>>,
    order: Mutex<Vec<String>>,
    reject: HashSet<String>,
    delay: Option<Duration>,
    /// Per-id delay, overrides `delay`
    slow: HashMap<String, Duration>,
  }

  impl CountingRemote {
    fn pushes(&self, id: &str) -> usize {
      self.pushes.lock().unwrap().get(id).copied().unwrap_or(0)
    }
  }

  #[async_trait]
  impl RemoteSink for CountingRemote {
    async fn push(&self, _collection: &str, id: &str, body: &[u8]) -> Result<(), SyncError> {
      let value: serde_json::Value = serde_json::from_slice(body).unwrap();
      assert_eq!(value["id"], id);
      assert_eq!(value["synced"], false);

      if let Some(delay) = self.slow.get(id).copied().or(self.delay) {
        tokio::time::sleep(delay).await;
      }
      if self.reject.contains(id) {
        return Err(SyncError::Remote { status: 500 });
      }
      *self.pushes.lock().unwrap().entry(id.to_string()).or_insert(0) += 1;
      self.order.lock().unwrap().push(id.to_string());
      Ok(())
    }
  }

  fn detection(name: &str) -> DetectionResult {
    DetectionResult::from_predictions(
      name,
      vec![ClassConfidence {
        class: "cataract".into(),
        confidence: 0.8,
      }],
    )
  }

  async fn seed(store: &Store, n: usize) -> Vec<String> {
    let outbox = Outbox::<DetectionResult>::new(store.clone());
    let mut ids = Vec::new();
    for i in 0..n {
      ids.push(outbox.append(detection(&format!("eye-{}.png", i))).await.unwrap().id);
      tokio::time::sleep(Duration::from_millis(2)).await;
    }
    ids
  }

  #[tokio::test]
  async fn test_drain_pushes_oldest_first_and_marks_synced() {
    let store = Store::memory();
    let ids = seed(&store, 3).await;
    let remote = Arc::new(CountingRemote::default());
    let coordinator = SyncCoordinator::new(store.clone(), remote.clone());

    let report = coordinator.drain().await;
    assert_eq!(report.synced_count, 3);
    assert!(report.errors.is_empty());
    assert_eq!(*remote.order.lock().unwrap(), ids);
    assert_eq!(coordinator.state(), SyncState::Completed);

    let outbox = Outbox::<DetectionResult>::new(store);
    assert!(outbox.pending().await.unwrap().is_empty());
    assert!(outbox.get(&ids[0]).await.unwrap().unwrap().synced);

    let again = coordinator.drain().await;
    assert_eq!(again.synced_count, 0);
    assert_eq!(remote.pushes(&ids[0]), 1);
  }

  #[tokio::test]
  async fn test_failed_item_does_not_abort_batch() {
    let store = Store::memory();
    let ids = seed(&store, 3).await;
    let remote = Arc::new(CountingRemote {
      reject: HashSet::from([ids[1].clone()]),
      ..Default::default()
    });
    let coordinator = SyncCoordinator::new(store.clone(), remote.clone());

    let report = coordinator.drain().await;
    assert_eq!(report.synced_count, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].id.as_deref(), Some(ids[1].as_str()));
    assert_eq!(coordinator.state(), SyncState::PartialFailure);

    let pending = Outbox::<DetectionResult>::new(store).pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, ids[1]);
  }

  #[tokio::test]
  async fn test_concurrent_drains_push_each_record_once() {
    let store = Store::memory();
    let ids = seed(&store, 4).await;
    let remote = Arc::new(CountingRemote {
      delay: Some(Duration::from_millis(5)),
      ..Default::default()
    });
    let coordinator = SyncCoordinator::new(store, remote.clone());

    let (a, b) = tokio::join!(coordinator.drain(), coordinator.drain());
    assert_eq!(a.synced_count + b.synced_count, 4);
    for id in &ids {
      assert_eq!(remote.pushes(id), 1, "record {} pushed more than once", id);
    }
    assert_eq!(coordinator.state(), SyncState::Completed);
  }

  #[tokio::test]
  async fn test_overlapping_drains_report_failure_from_earlier_finisher() {
    let store = Store::memory();
    let ids = seed(&store, 2).await;
    // The drain that fails finishes first; the one that succeeds finishes last.
    let remote = Arc::new(CountingRemote {
      reject: HashSet::from([ids[0].clone()]),
      slow: HashMap::from([
        (ids[0].clone(), Duration::from_millis(10)),
        (ids[1].clone(), Duration::from_millis(40)),
      ]),
      ..Default::default()
    });
    let coordinator = SyncCoordinator::new(store.clone(), remote.clone());

    let (a, b) = tokio::join!(coordinator.drain(), coordinator.drain());
    assert_eq!(a.synced_count + b.synced_count, 1);
    assert_eq!(a.errors.len() + b.errors.len(), 1);
    assert_eq!(coordinator.state(), SyncState::PartialFailure);

    let pending = Outbox::<DetectionResult>::new(store).pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, ids[0]);
  }

  #[test]
  fn test_claims_survive_a_poisoned_lock() {
    let in_flight = InFlight::default();
    let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
      let _guard = in_flight.claims.lock().unwrap();
      panic!("poison the claim set");
    }));
    assert!(in_flight.claims.is_poisoned());

    let claim = in_flight.claim(DETECTIONS, "a");
    assert!(claim.is_some());
    assert!(in_flight.claim(DETECTIONS, "a").is_none());

    drop(claim);
    assert!(in_flight.claim(DETECTIONS, "a").is_some());
  }

  #[tokio::test]
  async fn test_model_data_tag_only_drains_training_sessions() {
    let store = Store::memory();
    seed(&store, 2).await;
    let sessions = Outbox::<TrainingSession>::new(store.clone());
    sessions
      .append(TrainingSession {
        model_name: "retina-v2".into(),
        epochs: 10,
        final_accuracy: Some(0.91),
        final_loss: Some(0.2),
        class_names: vec!["normal".into(), "glaucoma".into()],
        status: TrainingStatus::Completed,
      })
      .await
      .unwrap();

    let coordinator = SyncCoordinator::new(store.clone(), Arc::new(CountingRemote::default()));
    let report = coordinator.drain_tag(SyncTag::ModelData).await;
    assert_eq!(report.synced_count, 1);

    let detections = Outbox::<DetectionResult>::new(store);
    assert_eq!(detections.pending().await.unwrap().len(), 2);

    let report = coordinator.drain_tag(SyncTag::DetectionData).await;
    assert_eq!(report.synced_count, 2);
  }

  #[test]
  fn test_tag_names() {
    assert_eq!("detection-data".parse::<SyncTag>(), Ok(SyncTag::DetectionData));
    assert_eq!(SyncTag::ModelData.to_string(), "model-data");
    assert!("photos".parse::<SyncTag>().is_err());
  }
}
