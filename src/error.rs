//! Error types shared across the store, artifact cache, interceptor and sync engine.

use thiserror::Error;

/// Errors raised by a storage backend.
#[derive(Debug, Error)]
pub enum StoreError {
  /// The store could not be opened or written. Callers degrade to running
  /// without offline persistence.
  #[error("Storage unavailable: {0}")]
  StorageUnavailable(String),

  /// A persisted row could not be decoded.
  #[error("Corrupt record {collection}/{id}: {reason}")]
  Corrupt {
    collection: String,
    id: String,
    reason: String,
  },

  /// The index does not support the requested operation.
  #[error("Index {index} does not support {operation}")]
  InvalidIndex {
    index: &'static str,
    operation: &'static str,
  },
}

impl From<rusqlite::Error> for StoreError {
  fn from(e: rusqlite::Error) -> Self {
    StoreError::StorageUnavailable(e.to_string())
  }
}

impl From<tokio::task::JoinError> for StoreError {
  fn from(e: tokio::task::JoinError) -> Self {
    StoreError::StorageUnavailable(format!("Storage task failed: {}", e))
  }
}

/// Errors raised by the network transport.
#[derive(Debug, Error)]
pub enum FetchError {
  #[error("Network unavailable: {0}")]
  NetworkUnavailable(String),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

impl From<reqwest::Error> for FetchError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_builder() {
      FetchError::InvalidRequest(e.to_string())
    } else {
      FetchError::NetworkUnavailable(e.to_string())
    }
  }
}

/// Failure to push a single record to the remote endpoint.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error("Remote rejected record with status {status}")]
  Remote { status: u16 },

  #[error("Network error: {0}")]
  Network(String),

  #[error(transparent)]
  Store(#[from] StoreError),
}

impl From<reqwest::Error> for SyncError {
  fn from(e: reqwest::Error) -> Self {
    SyncError::Network(e.to_string())
  }
}

/// Errors raised by the artifact cache and model downloader.
#[derive(Debug, Error)]
pub enum ArtifactError {
  #[error(transparent)]
  Store(#[from] StoreError),

  #[error("Download failed: {0}")]
  Download(String),

  #[error("Invalid artifact cache config: {0}")]
  InvalidConfig(String),

  /// The payload alone exceeds what cleanup would keep.
  #[error("Artifact {name} is {size} bytes, cache keeps at most {limit}")]
  TooLarge { name: String, size: u64, limit: u64 },
}

impl From<reqwest::Error> for ArtifactError {
  fn from(e: reqwest::Error) -> Self {
    ArtifactError::Download(e.to_string())
  }
}
