use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::Record;

pub const METADATA_COLLECTION: &str = "model_meta";
pub const PAYLOAD_COLLECTION: &str = "model_payloads";

/// Metadata of one cached model payload. Rows are keyed by `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedArtifact {
  pub id: String,
  pub name: String,
  pub category: String,
  /// Measured payload size in bytes
  pub size: u64,
  pub created_at: DateTime<Utc>,
  pub last_used_at: DateTime<Utc>,
  pub pretrained: bool,
  #[serde(default)]
  pub accuracy: Option<f64>,
  #[serde(default)]
  pub description: Option<String>,
  /// Insertion order, breaks `last_used_at` ties
  pub seq: u64,
  /// Hex SHA-256 of the payload
  pub checksum: String,
}

impl CachedArtifact {
  /// Eviction order: least recently used first, then earliest inserted.
  pub fn eviction_key(&self) -> (DateTime<Utc>, u64) {
    (self.last_used_at, self.seq)
  }
}

impl Record for CachedArtifact {
  fn collection() -> &'static str {
    METADATA_COLLECTION
  }

  fn id(&self) -> String {
    self.name.clone()
  }

  fn created_at(&self) -> DateTime<Utc> {
    self.created_at
  }
}

/// Caller-supplied descriptive fields for [`super::ArtifactCache::add_to_cache`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
  pub category: String,
  pub pretrained: bool,
  pub accuracy: Option<f64>,
  pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
  pub total_size: u64,
  pub total_count: u64,
  pub max_size: u64,
  pub max_models: u64,
  /// `total_size / max_size` as a percentage
  pub usage_percentage: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
  pub valid: usize,
  pub invalid: usize,
}

pub fn checksum(payload: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(payload);
  hex::encode(hasher.finalize())
}
