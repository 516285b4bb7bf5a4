//! Locally created records awaiting remote acknowledgement.
//!
//! Records are appended with `synced = false`, flipped to `synced = true`
//! exactly once when the remote acknowledges them, and removed only by the
//! retention sweep.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::store::{to_millis, Index, IndexValue, Record, Store};

pub const DETECTIONS: &str = "detections";
pub const TRAINING_SESSIONS: &str = "training_sessions";
pub const IMAGES: &str = "images";

/// Collections drained by the sync coordinator.
pub const SYNCABLE_COLLECTIONS: [&str; 3] = [DETECTIONS, TRAINING_SESSIONS, IMAGES];

/// Predictions below this confidence are reported as "uncertain".
pub const CONFIDENCE_THRESHOLD: f64 = 0.65;

/// Payload kinds that live in a syncable collection.
pub trait Syncable: Clone + Send + Sync + Serialize + DeserializeOwned {
  const COLLECTION: &'static str;
}

/// A locally created record plus its sync bookkeeping.
///
/// Serializes flat, so the payload fields sit next to `id`, `createdAt` and
/// `synced` in the body sent to the remote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRecord<T> {
  pub id: String,
  pub created_at: DateTime<Utc>,
  pub synced: bool,
  #[serde(flatten)]
  pub payload: T,
}

impl<T: Syncable> Record for SyncRecord<T> {
  fn collection() -> &'static str {
    T::COLLECTION
  }

  fn id(&self) -> String {
    self.id.clone()
  }

  fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }

  fn synced(&self) -> bool {
    self.synced
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassConfidence {
  pub class: String,
  pub confidence: f64,
}

/// Outcome of running the detection model over one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
  pub filename: String,
  pub prediction: String,
  pub confidence: f64,
  pub top_predictions: Vec<ClassConfidence>,
  pub message: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub model_name: Option<String>,
}

impl DetectionResult {
  /// Build a result from ranked class probabilities, applying the
  /// uncertainty threshold to the top prediction.
  pub fn from_predictions(filename: impl Into<String>, mut ranked: Vec<ClassConfidence>) -> Self {
    ranked.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    ranked.truncate(3);

    let (label, confidence) = ranked
      .first()
      .map(|top| (top.class.clone(), top.confidence))
      .unwrap_or_else(|| ("uncertain".to_string(), 0.0));

    let (prediction, message) = if confidence < CONFIDENCE_THRESHOLD {
      (
        "uncertain".to_string(),
        "Image does not appear to contain a recognizable retina pattern.".to_string(),
      )
    } else {
      let message = format!("Detected {} with {:.2}% confidence.", label, confidence * 100.0);
      (label, message)
    };

    Self {
      filename: filename.into(),
      prediction,
      confidence: (confidence * 10_000.0).round() / 10_000.0,
      top_predictions: ranked,
      message,
      model_name: None,
    }
  }
}

impl Syncable for DetectionResult {
  const COLLECTION: &'static str = DETECTIONS;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainingStatus {
  Running,
  Completed,
  Failed,
  Cancelled,
}

/// Summary of one training run performed on the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSession {
  pub model_name: String,
  pub epochs: u32,
  #[serde(default)]
  pub final_accuracy: Option<f64>,
  #[serde(default)]
  pub final_loss: Option<f64>,
  pub class_names: Vec<String>,
  pub status: TrainingStatus,
}

impl Syncable for TrainingSession {
  const COLLECTION: &'static str = TRAINING_SESSIONS;
}

/// An image captured or uploaded by the user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturedImage {
  pub filename: String,
  pub mime_type: String,
  /// Base64 body or data URL
  pub data: String,
  #[serde(default)]
  pub width: Option<u32>,
  #[serde(default)]
  pub height: Option<u32>,
}

impl Syncable for CapturedImage {
  const COLLECTION: &'static str = IMAGES;
}

/// Flip the synced flag on a raw row, both in the index column and in the
/// stored JSON body. Returns false when the row is gone or already synced.
pub async fn mark_row_synced(store: &Store, collection: &str, id: &str) -> Result<bool, StoreError> {
  let Some(mut row) = store.get(collection, id).await? else {
    return Ok(false);
  };
  if row.synced {
    return Ok(false);
  }

  let mut body: Value = serde_json::from_slice(&row.data).map_err(|e| StoreError::Corrupt {
    collection: collection.to_string(),
    id: id.to_string(),
    reason: e.to_string(),
  })?;
  if let Some(obj) = body.as_object_mut() {
    obj.insert("synced".to_string(), Value::Bool(true));
  }
  row.data = serde_json::to_vec(&body).map_err(|e| StoreError::Corrupt {
    collection: collection.to_string(),
    id: id.to_string(),
    reason: e.to_string(),
  })?;
  row.synced = true;

  store.put(collection, row).await?;
  debug!(collection, id, "Marked record synced");
  Ok(true)
}

/// Append-only queue of records of one kind.
pub struct Outbox<T> {
  store: Store,
  clock: Arc<dyn Clock>,
  _kind: PhantomData<fn() -> T>,
}

impl<T> Clone for Outbox<T> {
  fn clone(&self) -> Self {
    Self {
      store: self.store.clone(),
      clock: Arc::clone(&self.clock),
      _kind: PhantomData,
    }
  }
}

impl<T: Syncable> Outbox<T> {
  pub fn new(store: Store) -> Self {
    Self::with_clock(store, Arc::new(SystemClock))
  }

  pub fn with_clock(store: Store, clock: Arc<dyn Clock>) -> Self {
    Self {
      store,
      clock,
      _kind: PhantomData,
    }
  }

  /// Persist a new unsynced record.
  pub async fn append(&self, payload: T) -> Result<SyncRecord<T>, StoreError> {
    let record = SyncRecord {
      id: uuid::Uuid::new_v4().to_string(),
      created_at: self.clock.now(),
      synced: false,
      payload,
    };
    self.store.put_record(&record).await?;
    debug!(collection = T::COLLECTION, id = %record.id, "Appended record");
    Ok(record)
  }

  pub async fn get(&self, id: &str) -> Result<Option<SyncRecord<T>>, StoreError> {
    self.store.get_record(id).await
  }

  /// Unsynced records, oldest first.
  pub async fn pending(&self) -> Result<Vec<SyncRecord<T>>, StoreError> {
    self
      .store
      .query_records(Index::Synced, IndexValue::Flag(false))
      .await
  }

  pub async fn mark_synced(&self, id: &str) -> Result<bool, StoreError> {
    mark_row_synced(&self.store, T::COLLECTION, id).await
  }

  pub async fn count(&self) -> Result<u64, StoreError> {
    self.store.count(T::COLLECTION).await
  }

  /// Remove synced records older than `max_age`. Unsynced records are kept
  /// regardless of age.
  pub async fn sweep_retention(&self, max_age: Duration) -> Result<u64, StoreError> {
    let cutoff = to_millis(self.clock.now() - max_age);
    let removed = self
      .store
      .delete_synced_older_than(T::COLLECTION, cutoff)
      .await?;
    if removed > 0 {
      info!(collection = T::COLLECTION, removed, "Retention sweep removed records");
    }
    Ok(removed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;

  fn detection(name: &str) -> DetectionResult {
    DetectionResult::from_predictions(
      name,
      vec![
        ClassConfidence {
          class: "glaucoma".into(),
          confidence: 0.9,
        },
        ClassConfidence {
          class: "normal".into(),
          confidence: 0.1,
        },
      ],
    )
  }

  #[test]
  fn test_low_confidence_is_uncertain() {
    let result = DetectionResult::from_predictions(
      "eye.png",
      vec![ClassConfidence {
        class: "cataract".into(),
        confidence: 0.4,
      }],
    );
    assert_eq!(result.prediction, "uncertain");
    assert_eq!(result.top_predictions.len(), 1);
  }

  #[test]
  fn test_top_predictions_are_ranked() {
    let result = detection("eye.png");
    assert_eq!(result.prediction, "glaucoma");
    assert_eq!(result.top_predictions[0].class, "glaucoma");
    assert!(result.message.contains("90.00%"));
  }

  #[test]
  fn test_record_serializes_flat() {
    let record = SyncRecord {
      id: "r1".to_string(),
      created_at: Utc::now(),
      synced: false,
      payload: detection("eye.png"),
    };
    let value = serde_json::to_value(&record).unwrap();
    assert_eq!(value["id"], "r1");
    assert_eq!(value["synced"], false);
    assert_eq!(value["prediction"], "glaucoma");
    assert!(value.get("createdAt").is_some());
  }

  #[tokio::test]
  async fn test_append_then_mark_synced_once() {
    let outbox = Outbox::<DetectionResult>::new(Store::memory());
    let record = outbox.append(detection("a.png")).await.unwrap();

    assert_eq!(outbox.pending().await.unwrap().len(), 1);
    assert!(outbox.mark_synced(&record.id).await.unwrap());
    assert!(!outbox.mark_synced(&record.id).await.unwrap());

    let stored = outbox.get(&record.id).await.unwrap().unwrap();
    assert!(stored.synced);
    assert_eq!(stored.payload, record.payload);
    assert!(outbox.pending().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_pending_is_oldest_first() {
    let clock = ManualClock::new(1_000);
    let outbox = Outbox::<DetectionResult>::with_clock(Store::memory(), Arc::new(clock.clone()));

    let first = outbox.append(detection("1.png")).await.unwrap();
    clock.advance(10);
    let second = outbox.append(detection("2.png")).await.unwrap();

    let ids: Vec<_> = outbox
      .pending()
      .await
      .unwrap()
      .into_iter()
      .map(|r| r.id)
      .collect();
    assert_eq!(ids, vec![first.id, second.id]);
  }

  #[tokio::test]
  async fn test_retention_keeps_unsynced_and_recent() {
    let clock = ManualClock::new(0);
    let outbox = Outbox::<TrainingSession>::with_clock(Store::memory(), Arc::new(clock.clone()));
    let session = TrainingSession {
      model_name: "retina-cnn".into(),
      epochs: 5,
      final_accuracy: Some(0.91),
      final_loss: Some(0.2),
      class_names: vec!["normal".into()],
      status: TrainingStatus::Completed,
    };

    let old_synced = outbox.append(session.clone()).await.unwrap();
    outbox.mark_synced(&old_synced.id).await.unwrap();
    let old_pending = outbox.append(session.clone()).await.unwrap();

    clock.set(Duration::days(40).num_milliseconds());
    let recent = outbox.append(session).await.unwrap();
    outbox.mark_synced(&recent.id).await.unwrap();

    assert_eq!(outbox.sweep_retention(Duration::days(30)).await.unwrap(), 1);
    assert!(outbox.get(&old_synced.id).await.unwrap().is_none());
    assert!(outbox.get(&old_pending.id).await.unwrap().is_some());
    assert!(outbox.get(&recent.id).await.unwrap().is_some());
  }
}
