//! Fetch middleware that arbitrates between the cache and the network.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use url::Url;

use super::cache::{CacheNames, Namespace, ResponseCache};
use super::routes::Router;
use super::transport::Transport;
use super::types::{FetchRequest, FetchResponse, InterceptedResponse, Resolution, RouteClass};
use crate::error::{FetchError, StoreError};

/// Status of synthesized offline responses.
pub const OFFLINE_STATUS: u16 = 503;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
  Installing,
  /// Installed, older caches still in place
  Waiting,
  Active,
}

/// Outcome of pre-caching a list of URLs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrecacheReport {
  pub cached: usize,
  pub failed: Vec<String>,
}

/// Intercepts outbound requests and resolves GETs through per-route
/// cache strategies.
pub struct Interceptor {
  transport: Arc<dyn Transport>,
  cache: ResponseCache,
  router: Router,
  names: CacheNames,
  lifecycle: Mutex<Lifecycle>,
}

impl Interceptor {
  pub fn new(
    transport: Arc<dyn Transport>,
    cache: ResponseCache,
    router: Router,
    names: CacheNames,
  ) -> Self {
    Self {
      transport,
      cache,
      router,
      names,
      lifecycle: Mutex::new(Lifecycle::Installing),
    }
  }

  pub fn lifecycle(&self) -> Lifecycle {
    *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn set_lifecycle(&self, next: Lifecycle) {
    *self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner) = next;
  }

  pub fn cache_names(&self) -> &CacheNames {
    &self.names
  }

  /// Resolve a request.
  ///
  /// GET requests always resolve to some response. Other methods go straight
  /// to the network and transport errors are returned to the caller.
  pub async fn handle(&self, request: FetchRequest) -> Result<InterceptedResponse, FetchError> {
    if !request.is_idempotent_read() {
      let response = self.transport.fetch(&request).await?;
      return Ok(InterceptedResponse {
        response,
        resolution: Resolution::PassThrough,
        class: None,
      });
    }

    let class = self.router.classify(&request);
    let (response, resolution) = match class {
      RouteClass::StaticAsset => self.cache_first(Namespace::Static, &request).await,
      RouteClass::CrossOrigin => self.cache_first(Namespace::CrossOrigin, &request).await,
      RouteClass::ApiCall => self.network_first(&request).await,
    };
    debug!(url = %request.url, ?class, ?resolution, status = response.status, "Resolved request");

    Ok(InterceptedResponse {
      response,
      resolution,
      class: Some(class),
    })
  }

  /// 1. Cache hit - return immediately
  /// 2. Miss - fetch, storing a copy of successful responses
  /// 3. Network failure - synthesize an offline response
  async fn cache_first(
    &self,
    namespace: Namespace,
    request: &FetchRequest,
  ) -> (FetchResponse, Resolution) {
    let cache_name = self.names.name(namespace);
    let key = request.url.as_str();

    if let Some(cached) = self.cached(&cache_name, key).await {
      return (cached, Resolution::FromCache);
    }

    match self.transport.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&cache_name, key, &response).await;
        }
        (response, Resolution::FromNetwork)
      }
      Err(e) => {
        warn!(url = key, error = %e, "Asset unavailable offline");
        (offline_asset_response(), Resolution::Synthetic)
      }
    }
  }

  /// 1. Fetch - on success store a copy in the data cache
  /// 2. Network failure - serve the cached copy
  /// 3. Nothing cached - synthesize the offline JSON contract
  async fn network_first(&self, request: &FetchRequest) -> (FetchResponse, Resolution) {
    let cache_name = self.names.name(Namespace::Data);
    let key = request.url.as_str();

    match self.transport.fetch(request).await {
      Ok(response) => {
        if response.is_success() {
          self.store(&cache_name, key, &response).await;
        }
        (response, Resolution::FromNetwork)
      }
      Err(e) => {
        if let Some(cached) = self.cached(&cache_name, key).await {
          debug!(url = key, error = %e, "Serving cached API response");
          return (cached, Resolution::FromCache);
        }
        warn!(url = key, error = %e, "API unavailable offline and not cached");
        (offline_api_response(), Resolution::Synthetic)
      }
    }
  }

  /// Cache read that treats storage failures as a miss.
  async fn cached(&self, cache_name: &str, key: &str) -> Option<FetchResponse> {
    match self.cache.get(cache_name, key).await {
      Ok(hit) => hit,
      Err(e) => {
        warn!(cache = cache_name, url = key, error = %e, "Cache read failed");
        None
      }
    }
  }

  /// Cache write that never fails the request.
  async fn store(&self, cache_name: &str, key: &str, response: &FetchResponse) {
    if let Err(e) = self.cache.put(cache_name, key, response).await {
      warn!(cache = cache_name, url = key, error = %e, "Cache write failed");
    }
  }

  /// Pre-cache static assets and move to the waiting state.
  pub async fn install(&self, urls: &[Url]) -> PrecacheReport {
    self.set_lifecycle(Lifecycle::Installing);
    let report = self.precache(Namespace::Static, urls).await;
    self.set_lifecycle(Lifecycle::Waiting);
    info!(cached = report.cached, failed = report.failed.len(), "Installed static cache");
    report
  }

  /// Delete every cache outside the current expected set and start serving.
  /// Returns the deleted cache names.
  pub async fn activate(&self) -> Result<Vec<String>, StoreError> {
    let expected = self.names.expected();
    let mut deleted = Vec::new();

    for name in self.cache.cache_names().await? {
      if !expected.contains(&name) {
        self.cache.delete_cache(&name).await?;
        info!(cache = %name, "Deleted stale cache");
        deleted.push(name);
      }
    }

    self.set_lifecycle(Lifecycle::Active);
    Ok(deleted)
  }

  /// Activate without waiting for older clients to go away.
  pub async fn skip_waiting(&self) -> Result<Vec<String>, StoreError> {
    self.activate().await
  }

  /// Fetch and store model files in the models cache.
  pub async fn cache_models(&self, urls: &[Url]) -> PrecacheReport {
    self.precache(Namespace::Models, urls).await
  }

  async fn precache(&self, namespace: Namespace, urls: &[Url]) -> PrecacheReport {
    let cache_name = self.names.name(namespace);
    let mut report = PrecacheReport::default();

    for url in urls {
      let request = FetchRequest::get(url.clone());
      match self.transport.fetch(&request).await {
        Ok(response) if response.is_success() => {
          match self.cache.put(&cache_name, url.as_str(), &response).await {
            Ok(()) => report.cached += 1,
            Err(e) => {
              warn!(url = %url, error = %e, "Failed to store pre-cached response");
              report.failed.push(url.to_string());
            }
          }
        }
        Ok(response) => {
          warn!(url = %url, status = response.status, "Pre-cache fetch rejected");
          report.failed.push(url.to_string());
        }
        Err(e) => {
          warn!(url = %url, error = %e, "Pre-cache fetch failed");
          report.failed.push(url.to_string());
        }
      }
    }

    report
  }

  /// Clear one cache by name, or every cache when `cache_name` is `None`.
  /// Returns the number of entries removed.
  pub async fn clear_cache(&self, cache_name: Option<&str>) -> Result<u64, StoreError> {
    match cache_name {
      Some(name) => self.cache.delete_cache(name).await,
      None => {
        let mut removed = 0;
        for name in self.cache.cache_names().await? {
          removed += self.cache.delete_cache(&name).await?;
        }
        Ok(removed)
      }
    }
  }

  /// Item count per cache name.
  pub async fn cache_status(&self) -> Result<BTreeMap<String, u64>, StoreError> {
    self.cache.status().await
  }
}

fn offline_asset_response() -> FetchResponse {
  FetchResponse::new(OFFLINE_STATUS, "Resource not available offline")
    .with_header("Content-Type", "text/plain")
}

fn offline_api_response() -> FetchResponse {
  let body = json!({
    "error": "Network unavailable and no cached data",
    "offline": true,
    "timestamp": Utc::now().to_rfc3339(),
  });
  FetchResponse::new(OFFLINE_STATUS, body.to_string()).with_header("Content-Type", "application/json")
}
