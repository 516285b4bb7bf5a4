use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
  Online,
  Offline,
}

/// Publishes the current connectivity state to subscribers.
pub struct ConnectivityWatcher {
  state: watch::Sender<Connectivity>,
}

impl ConnectivityWatcher {
  pub fn new(initial: Connectivity) -> Self {
    let (state, _) = watch::channel(initial);
    Self { state }
  }

  pub fn current(&self) -> Connectivity {
    *self.state.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
    self.state.subscribe()
  }

  /// Record a new state. Returns true when it differs from the previous one.
  pub fn set(&self, next: Connectivity) -> bool {
    let previous = self.state.send_replace(next);
    if previous != next {
      info!(from = ?previous, to = ?next, "Connectivity changed");
    }
    previous != next
  }

  /// Run a probe and publish its result.
  pub async fn poll(&self, probe: &dyn Probe) -> bool {
    let state = probe.check().await;
    self.set(state)
  }
}

/// Reachability check feeding the watcher.
#[async_trait]
pub trait Probe: Send + Sync {
  async fn check(&self) -> Connectivity;
}

/// Probes the backend's `GET /health` endpoint.
#[derive(Clone)]
pub struct HealthProbe {
  client: reqwest::Client,
  url: String,
}

impl HealthProbe {
  pub fn new(client: reqwest::Client, base_url: &str) -> Self {
    Self {
      client,
      url: format!("{}/health", base_url.trim_end_matches('/')),
    }
  }
}

#[async_trait]
impl Probe for HealthProbe {
  async fn check(&self) -> Connectivity {
    match self.client.get(&self.url).send().await {
      Ok(response) if response.status().is_success() => Connectivity::Online,
      Ok(response) => {
        debug!(url = %self.url, status = response.status().as_u16(), "Health check rejected");
        Connectivity::Offline
      }
      Err(e) => {
        debug!(url = %self.url, error = %e, "Health check failed");
        Connectivity::Offline
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_reports_transitions_only() {
    let watcher = ConnectivityWatcher::new(Connectivity::Offline);
    assert!(!watcher.set(Connectivity::Offline));
    assert!(watcher.set(Connectivity::Online));
    assert_eq!(watcher.current(), Connectivity::Online);
  }

  #[tokio::test]
  async fn test_health_probe() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
      .mock("GET", "/health")
      .with_status(200)
      .with_body(r#"{"status":"healthy"}"#)
      .create_async()
      .await;

    let probe = HealthProbe::new(reqwest::Client::new(), &server.url());
    assert_eq!(probe.check().await, Connectivity::Online);
    mock.assert_async().await;

    let down = HealthProbe::new(reqwest::Client::new(), "http://127.0.0.1:1/");
    assert_eq!(down.check().await, Connectivity::Offline);
  }

  #[tokio::test]
  async fn test_unhealthy_status_is_offline() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server.mock("GET", "/health").with_status(503).create_async().await;

    let watcher = ConnectivityWatcher::new(Connectivity::Online);
    let probe = HealthProbe::new(reqwest::Client::new(), &server.url());
    assert!(watcher.poll(&probe).await);
    assert_eq!(watcher.current(), Connectivity::Offline);
  }
}
