//! Request/response values passed through the interception pipeline.

use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// An outbound request.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
}

impl FetchRequest {
  pub fn get(url: Url) -> Self {
    Self {
      method: Method::GET,
      url,
      headers: Vec::new(),
      body: None,
    }
  }

  pub fn post(url: Url, body: Vec<u8>) -> Self {
    Self {
      method: Method::POST,
      url,
      headers: Vec::new(),
      body: Some(body),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  /// Only GET requests are eligible for caching or synthesized fallbacks.
  pub fn is_idempotent_read(&self) -> bool {
    self.method == Method::GET
  }
}

/// A fully buffered response.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResponse {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
}

/// Status line and headers of a cached entry.
#[derive(Serialize, Deserialize)]
struct EntryHead {
  status: u16,
  headers: Vec<(String, String)>,
}

impl FetchResponse {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.push((name.into(), value.into()));
    self
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
    serde_json::from_slice(&self.body)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Encode as `[u32 header length][JSON status+headers][raw body]`.
  pub(crate) fn encode(&self) -> serde_json::Result<Vec<u8>> {
    let head = serde_json::to_vec(&EntryHead {
      status: self.status,
      headers: self.headers.clone(),
    })?;
    let mut out = Vec::with_capacity(4 + head.len() + self.body.len());
    out.extend_from_slice(&(head.len() as u32).to_be_bytes());
    out.extend_from_slice(&head);
    out.extend_from_slice(&self.body);
    Ok(out)
  }

  pub(crate) fn decode(data: &[u8]) -> Option<Self> {
    let len_bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    let head_len = u32::from_be_bytes(len_bytes) as usize;
    let head = data.get(4..4 + head_len)?;
    let head: EntryHead = serde_json::from_slice(head).ok()?;
    Some(Self {
      status: head.status,
      headers: head.headers,
      body: data[4 + head_len..].to_vec(),
    })
  }
}

/// How a GET request is resolved. Non-idempotent requests bypass routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RouteClass {
  /// Same-origin asset, cache-first
  StaticAsset,
  /// Same-origin API, network-first
  ApiCall,
  /// Asset from another origin, cache-first in its own namespace
  CrossOrigin,
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
  FromCache,
  FromNetwork,
  /// Offline fallback built locally
  Synthetic,
  /// Non-GET request forwarded untouched
  PassThrough,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterceptedResponse {
  pub response: FetchResponse,
  pub resolution: Resolution,
  pub class: Option<RouteClass>,
}
