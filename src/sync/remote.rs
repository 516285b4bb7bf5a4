use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use tracing::debug;

use crate::error::SyncError;

/// Header carrying the record id so the remote can drop duplicate writes.
pub const IDEMPOTENCY_KEY: &str = "Idempotency-Key";

/// Remote endpoint that acknowledges pushed records.
#[async_trait]
pub trait RemoteSink: Send + Sync {
  /// Push one record body. `Ok` means the remote acknowledged it.
  async fn push(&self, collection: &str, id: &str, body: &[u8]) -> Result<(), SyncError>;
}

/// Posts records to `{base}/api/<collection>/sync`.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: String,
}

impl HttpRemote {
  pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
    let base_url = base_url.into().trim_end_matches('/').to_string();
    Self { client, base_url }
  }

  pub fn endpoint(&self, collection: &str) -> String {
    format!("{}/api/{}/sync", self.base_url, collection)
  }
}

#[async_trait]
impl RemoteSink for HttpRemote {
  async fn push(&self, collection: &str, id: &str, body: &[u8]) -> Result<(), SyncError> {
    let url = self.endpoint(collection);
    let response = self
      .client
      .post(&url)
      .header(CONTENT_TYPE, "application/json")
      .header(IDEMPOTENCY_KEY, id)
      .body(body.to_vec())
      .send()
      .await?;

    let status = response.status();
    debug!(url = %url, id, status = status.as_u16(), "Pushed record");
    if status.is_success() {
      Ok(())
    } else {
      Err(SyncError::Remote {
        status: status.as_u16(),
      })
    }
  }
}
