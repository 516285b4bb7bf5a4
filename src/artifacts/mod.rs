//! Bounded local cache for trained model payloads.
//!
//! Artifacts are persisted in the offline store and evicted least recently
//! used first once the cache grows past a fraction of its size or count
//! limit.

mod config;
mod download;
mod manager;
mod types;

pub use config::ArtifactCacheConfig;
pub use download::{DownloadProgress, ModelDownloader};
pub use manager::ArtifactCache;
pub use types::{
  ArtifactMetadata, CacheStats, CachedArtifact, ValidationReport, METADATA_COLLECTION,
  PAYLOAD_COLLECTION,
};
