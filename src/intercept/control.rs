//! Control channel messages accepted by the interceptor.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize, Serializer};
use tracing::{info, warn};
use url::Url;

use super::interceptor::Interceptor;
use crate::error::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
  SkipWaiting,
  CacheModels {
    #[serde(default)]
    models: Vec<String>,
  },
  ClearCache {
    #[serde(rename = "cacheName", default)]
    cache_name: Option<String>,
  },
  GetCacheStatus,
}

/// Reply to a [`ControlMessage`].
///
/// `CacheStatus` goes on the wire as the bare `{cacheName: itemCount}` map;
/// every other reply is tagged by `type`.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlReply {
  Activated {
    deleted: Vec<String>,
  },
  ModelsCached {
    cached: usize,
    failed: Vec<String>,
  },
  CacheCleared {
    removed: u64,
  },
  CacheStatus {
    caches: BTreeMap<String, u64>,
  },
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
enum TaggedReply<'a> {
  Activated { deleted: &'a [String] },
  ModelsCached { cached: usize, failed: &'a [String] },
  CacheCleared { removed: u64 },
}

impl Serialize for ControlReply {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      ControlReply::Activated { deleted } => TaggedReply::Activated { deleted }.serialize(serializer),
      ControlReply::ModelsCached { cached, failed } => TaggedReply::ModelsCached {
        cached: *cached,
        failed,
      }
      .serialize(serializer),
      ControlReply::CacheCleared { removed } => {
        TaggedReply::CacheCleared { removed: *removed }.serialize(serializer)
      }
      ControlReply::CacheStatus { caches } => caches.serialize(serializer),
    }
  }
}

impl Interceptor {
  /// Apply a control message. Model URLs that fail to parse are reported
  /// as failed rather than rejecting the message.
  pub async fn handle_control(&self, message: ControlMessage) -> Result<ControlReply, StoreError> {
    match message {
      ControlMessage::SkipWaiting => {
        let deleted = self.skip_waiting().await?;
        Ok(ControlReply::Activated { deleted })
      }
      ControlMessage::CacheModels { models } => {
        let mut urls = Vec::with_capacity(models.len());
        let mut failed = Vec::new();
        for model in models {
          match Url::parse(&model) {
            Ok(url) => urls.push(url),
            Err(e) => {
              warn!(model = %model, error = %e, "Ignoring invalid model URL");
              failed.push(model);
            }
          }
        }
        let report = self.cache_models(&urls).await;
        failed.extend(report.failed);
        info!(cached = report.cached, failed = failed.len(), "Cached models");
        Ok(ControlReply::ModelsCached {
          cached: report.cached,
          failed,
        })
      }
      ControlMessage::ClearCache { cache_name } => {
        let removed = self.clear_cache(cache_name.as_deref()).await?;
        Ok(ControlReply::CacheCleared { removed })
      }
      ControlMessage::GetCacheStatus => Ok(ControlReply::CacheStatus {
        caches: self.cache_status().await?,
      }),
    }
  }
}
