//! Streaming model download with progress reporting.

use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use super::manager::ArtifactCache;
use super::types::{ArtifactMetadata, CachedArtifact};
use crate::error::ArtifactError;

/// Progress snapshot handed to download callbacks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
  /// Percentage complete, 0-100. Zero while the size is unknown.
  pub progress: f64,
  pub downloaded: u64,
  pub total: Option<u64>,
  /// Bytes per second since the download started
  pub speed: f64,
  /// Seconds remaining, when the total size is known
  pub eta: Option<f64>,
}

impl DownloadProgress {
  /// Map a raw `fraction_complete` reading into a full progress snapshot.
  pub fn from_fraction(
    fraction_complete: f64,
    downloaded: u64,
    total: Option<u64>,
    elapsed: Duration,
  ) -> Self {
    let secs = elapsed.as_secs_f64();
    let speed = if secs > 0.0 {
      downloaded as f64 / secs
    } else {
      0.0
    };
    let eta = match total {
      Some(total) if speed > 0.0 => Some(total.saturating_sub(downloaded) as f64 / speed),
      _ => None,
    };

    Self {
      progress: fraction_complete.clamp(0.0, 1.0) * 100.0,
      downloaded,
      total,
      speed,
      eta,
    }
  }
}

/// Upper bound on the up-front buffer reservation, whatever the server
/// declares.
const MAX_PREALLOC: u64 = 8 * 1024 * 1024;

/// Fetches model payloads over HTTP(S).
#[derive(Clone)]
pub struct ModelDownloader {
  client: reqwest::Client,
  max_bytes: Option<u64>,
}

impl ModelDownloader {
  pub fn new(client: reqwest::Client) -> Self {
    Self {
      client,
      max_bytes: None,
    }
  }

  /// Refuse bodies larger than `max_bytes`.
  pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
    self.max_bytes = Some(max_bytes);
    self
  }

  /// Download `url`, reporting progress after every received chunk.
  pub async fn download<F>(&self, url: &Url, on_progress: F) -> Result<Vec<u8>, ArtifactError>
  where
    F: FnMut(DownloadProgress),
  {
    self.fetch(url, self.max_bytes, on_progress).await
  }

  async fn fetch<F>(
    &self,
    url: &Url,
    limit: Option<u64>,
    mut on_progress: F,
  ) -> Result<Vec<u8>, ArtifactError>
  where
    F: FnMut(DownloadProgress),
  {
    let started = Instant::now();
    let response = self
      .client
      .get(url.clone())
      .send()
      .await?
      .error_for_status()?;

    let total = response.content_length();
    if let (Some(total), Some(limit)) = (total, limit) {
      if total > limit {
        return Err(ArtifactError::Download(format!(
          "{} declares {} bytes, limit is {}",
          url, total, limit
        )));
      }
    }

    let reserve = total
      .unwrap_or(0)
      .min(limit.unwrap_or(u64::MAX))
      .min(MAX_PREALLOC);
    let mut body = Vec::with_capacity(reserve as usize);
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
      let chunk = chunk?;
      let downloaded = (body.len() + chunk.len()) as u64;
      if let Some(limit) = limit {
        if downloaded > limit {
          return Err(ArtifactError::Download(format!(
            "{} exceeded the {} byte limit",
            url, limit
          )));
        }
      }
      body.extend_from_slice(&chunk);

      let fraction = match total {
        Some(t) if t > 0 => downloaded as f64 / t as f64,
        _ => 0.0,
      };
      on_progress(DownloadProgress::from_fraction(
        fraction,
        downloaded,
        total,
        started.elapsed(),
      ));
    }

    let downloaded = body.len() as u64;
    on_progress(DownloadProgress::from_fraction(
      1.0,
      downloaded,
      Some(total.unwrap_or(downloaded)),
      started.elapsed(),
    ));
    debug!(url = %url, bytes = downloaded, "Download finished");

    Ok(body)
  }

  /// Download `url` and store it in the artifact cache under `name`.
  ///
  /// Bodies larger than the cache would keep are refused before they are
  /// buffered.
  pub async fn download_into<F>(
    &self,
    cache: &ArtifactCache,
    name: &str,
    url: &Url,
    metadata: ArtifactMetadata,
    on_progress: F,
  ) -> Result<CachedArtifact, ArtifactError>
  where
    F: FnMut(DownloadProgress),
  {
    let cache_limit = cache.config().max_payload();
    let limit = self.max_bytes.map_or(cache_limit, |m| m.min(cache_limit));
    let payload = self.fetch(url, Some(limit), on_progress).await?;
    let artifact = cache.add_to_cache(name, payload, metadata).await?;
    info!(name, url = %url, size = artifact.size, "Model downloaded into cache");
    Ok(artifact)
  }
}
