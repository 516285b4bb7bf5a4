/// Subcommand implementations for the CLI
use std::io::{self, Write};
use std::sync::Arc;

use color_eyre::{eyre::eyre, Result};
use retina_offline::artifacts::{ArtifactCache, ArtifactMetadata, DownloadProgress, ModelDownloader};
use retina_offline::intercept::{CacheNames, Interceptor, ReqwestTransport, ResponseCache, Router};
use retina_offline::records::{CapturedImage, DetectionResult, Outbox, TrainingSession};
use retina_offline::stats;
use retina_offline::sync::{
  Connectivity, ConnectivityWatcher, HealthProbe, HttpRemote, SyncCoordinator, SyncReport, SyncTag,
  SyncWorker,
};
use retina_offline::{Store, StoreError};
use tracing::info;
use url::Url;

use crate::config::Config;

/// Handles shared by every subcommand.
pub struct Context {
  config: Config,
  store: Store,
  client: reqwest::Client,
}

impl Context {
  pub async fn open(config: Config) -> Result<Self> {
    let path = config.database_path()?;
    let store = Store::open_or_degrade(&path).await;
    if store.is_persistent() {
      info!(path = %path.display(), "Opened offline store");
    }

    let client = reqwest::Client::builder()
      .timeout(config.sync.timeout())
      .build()
      .map_err(|e| eyre!("Failed to build HTTP client: {}", e))?;

    Ok(Self {
      config,
      store,
      client,
    })
  }

  async fn artifacts(&self) -> Result<ArtifactCache> {
    ArtifactCache::open(self.store.clone(), self.config.artifacts.clone())
      .await
      .map_err(|e| eyre!("Failed to open artifact cache: {}", e))
  }

  fn coordinator(&self) -> SyncCoordinator {
    let remote = HttpRemote::new(self.client.clone(), self.config.sync.api_url.as_str());
    SyncCoordinator::new(self.store.clone(), Arc::new(remote))
  }
}

/// Create the store and install the request caches.
pub async fn init(ctx: &Context) -> Result<()> {
  let intercept = &ctx.config.intercept;
  let origin = Url::parse(&intercept.origin)
    .map_err(|e| eyre!("Invalid intercept.origin {}: {}", intercept.origin, e))?;
  let precache = intercept
    .precache
    .iter()
    .map(|u| origin.join(u).map_err(|e| eyre!("Invalid precache URL {}: {}", u, e)))
    .collect::<Result<Vec<_>>>()?;

  let interceptor = Interceptor::new(
    Arc::new(ReqwestTransport::new(ctx.client.clone())),
    ResponseCache::new(ctx.store.clone()),
    Router::for_origin(&origin),
    CacheNames::new(intercept.cache_prefix.as_str(), intercept.cache_version),
  );

  let report = interceptor.install(&precache).await;
  let deleted = interceptor
    .activate()
    .await
    .map_err(|e| eyre!("Failed to activate caches: {}", e))?;

  if !ctx.store.is_persistent() {
    println!("Warning: offline store unavailable, data will not persist");
  }
  println!(
    "Pre-cached {} of {} assets, removed {} stale caches",
    report.cached,
    precache.len(),
    deleted.len()
  );
  for url in &report.failed {
    println!("  failed: {}", url);
  }
  Ok(())
}

pub async fn show_stats(ctx: &Context, json: bool) -> Result<()> {
  let artifacts = ctx.artifacts().await?;
  let stats = stats::collect(&ctx.store, Some(&artifacts))
    .await
    .map_err(|e| eyre!("Failed to read store: {}", e))?;

  if json {
    println!("{}", serde_json::to_string_pretty(&stats)?);
    return Ok(());
  }

  println!("Persistent: {}", if stats.persistent { "yes" } else { "no" });
  println!("Collections:");
  for (collection, count) in &stats.usage {
    println!("  {:<32} {}", collection, count);
  }
  println!("Pending sync: {}", stats.total_pending);
  for (collection, count) in stats.pending.iter().filter(|(_, c)| **c > 0) {
    println!("  {:<32} {}", collection, count);
  }
  if let Some(a) = stats.artifacts {
    println!(
      "Artifacts: {} of {} models, {} of {} bytes ({:.1}%)",
      a.total_count, a.max_models, a.total_size, a.max_size, a.usage_percentage
    );
  }
  Ok(())
}

pub async fn sync(ctx: &Context, tag: Option<SyncTag>) -> Result<()> {
  let coordinator = ctx.coordinator();
  let report = match tag {
    Some(tag) => coordinator.drain_tag(tag).await,
    None => coordinator.drain().await,
  };
  print_report(&report);
  Ok(())
}

fn print_report(report: &SyncReport) {
  println!("Synced {} records, {} failed", report.synced_count, report.errors.len());
  for failure in &report.errors {
    println!(
      "  {}/{}: {}",
      failure.collection,
      failure.id.as_deref().unwrap_or("*"),
      failure.error
    );
  }
}

/// Remove synced records older than `days` (or the configured retention).
pub async fn sweep(ctx: &Context, days: Option<u32>) -> Result<()> {
  let days = days.unwrap_or(ctx.config.store.retention_days);
  let max_age = chrono::Duration::days(i64::from(days));
  let to_eyre = |e: StoreError| eyre!("Retention sweep failed: {}", e);

  let removed = Outbox::<DetectionResult>::new(ctx.store.clone())
    .sweep_retention(max_age)
    .await
    .map_err(to_eyre)?
    + Outbox::<TrainingSession>::new(ctx.store.clone())
      .sweep_retention(max_age)
      .await
      .map_err(to_eyre)?
    + Outbox::<CapturedImage>::new(ctx.store.clone())
      .sweep_retention(max_age)
      .await
      .map_err(to_eyre)?;

  println!("Removed {} synced records older than {} days", removed, days);
  Ok(())
}

pub async fn cleanup(ctx: &Context) -> Result<()> {
  let artifacts = ctx.artifacts().await?;
  let evicted = artifacts
    .cleanup()
    .await
    .map_err(|e| eyre!("Cleanup failed: {}", e))?;
  println!("Evicted {} artifacts", evicted.len());
  for name in evicted {
    println!("  {}", name);
  }
  Ok(())
}

pub async fn validate(ctx: &Context) -> Result<()> {
  let artifacts = ctx.artifacts().await?;
  let report = artifacts
    .validate_cached_models()
    .await
    .map_err(|e| eyre!("Validation failed: {}", e))?;
  println!("{} valid, {} invalid removed", report.valid, report.invalid);
  Ok(())
}

pub async fn download(ctx: &Context, url: &Url, name: &str, metadata: ArtifactMetadata) -> Result<()> {
  let artifacts = ctx.artifacts().await?;
  let downloader = ModelDownloader::new(ctx.client.clone());

  let mut stderr = io::stderr();
  let artifact = downloader
    .download_into(&artifacts, name, url, metadata, |p: DownloadProgress| {
      let _ = write!(stderr, "\r{}", progress_line(&p));
      let _ = stderr.flush();
    })
    .await
    .map_err(|e| eyre!("Failed to download {}: {}", url, e))?;
  eprintln!();

  println!("Cached {} ({} bytes, sha256 {})", artifact.name, artifact.size, artifact.checksum);
  Ok(())
}

/// Run the sync worker until Ctrl-C.
/// `progress` is already a percentage.
fn progress_line(p: &DownloadProgress) -> String {
  format!("{:>5.1}%  {} bytes  {:.0} B/s", p.progress, p.downloaded, p.speed)
}

pub async fn worker(ctx: &Context) -> Result<()> {
  let coordinator = Arc::new(ctx.coordinator());
  let probe = Arc::new(HealthProbe::new(ctx.client.clone(), &ctx.config.sync.api_url));
  let watcher = Arc::new(ConnectivityWatcher::new(Connectivity::Offline));
  watcher.poll(probe.as_ref()).await;

  let (worker, handle) = SyncWorker::new(coordinator, watcher.clone(), ctx.config.sync.interval());
  let worker = worker.with_probe(probe);

  if watcher.current() == Connectivity::Online {
    handle.sync_now().await;
  }

  tokio::select! {
    _ = worker.run() => {}
    result = tokio::signal::ctrl_c() => {
      result.map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
      info!("Interrupted, stopping sync worker");
    }
  }
  drop(handle);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_progress_line_prints_percentage_as_is() {
    let p = DownloadProgress {
      progress: 42.5,
      downloaded: 425,
      total: Some(1000),
      speed: 1024.0,
      eta: Some(0.6),
    };
    assert_eq!(progress_line(&p), " 42.5%  425 bytes  1024 B/s");
  }
}
