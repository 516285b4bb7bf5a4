//! Long-running task that drains on connectivity changes, on a schedule, and
//! on explicit triggers.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::connectivity::{Connectivity, ConnectivityWatcher, Probe};
use super::coordinator::{SyncCoordinator, SyncTag};

const TRIGGER_BUFFER: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTrigger {
  /// Drain every collection
  Now,
  Tag(SyncTag),
}

/// Sends triggers to a running worker. The worker stops once every handle
/// is dropped.
#[derive(Clone)]
pub struct SyncHandle {
  tx: mpsc::Sender<SyncTrigger>,
}

impl SyncHandle {
  /// Returns false when the worker has stopped.
  pub async fn sync_now(&self) -> bool {
    self.tx.send(SyncTrigger::Now).await.is_ok()
  }

  pub async fn fire_tag(&self, tag: SyncTag) -> bool {
    self.tx.send(SyncTrigger::Tag(tag)).await.is_ok()
  }
}

pub struct SyncWorker {
  coordinator: Arc<SyncCoordinator>,
  watcher: Arc<ConnectivityWatcher>,
  probe: Option<Arc<dyn Probe>>,
  interval: Duration,
  triggers: mpsc::Receiver<SyncTrigger>,
}

impl SyncWorker {
  pub fn new(
    coordinator: Arc<SyncCoordinator>,
    watcher: Arc<ConnectivityWatcher>,
    interval: Duration,
  ) -> (Self, SyncHandle) {
    let (tx, triggers) = mpsc::channel(TRIGGER_BUFFER);
    let worker = Self {
      coordinator,
      watcher,
      probe: None,
      interval,
      triggers,
    };
    (worker, SyncHandle { tx })
  }

  /// Poll `probe` on every tick to keep the watcher current.
  pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
    self.probe = Some(probe);
    self
  }

  pub async fn run(self) {
    let SyncWorker {
      coordinator,
      watcher,
      probe,
      interval,
      mut triggers,
    } = self;

    let mut connectivity = watcher.subscribe();
    let mut last = *connectivity.borrow_and_update();
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let online = last == Connectivity::Online;
    info!(interval_secs = interval.as_secs(), online, "Sync worker started");

    loop {
      tokio::select! {
        changed = connectivity.changed() => {
          if changed.is_err() {
            break;
          }
          let now = *connectivity.borrow_and_update();
          if last == Connectivity::Offline && now == Connectivity::Online {
            debug!("Back online, draining");
            coordinator.drain().await;
          }
          last = now;
        }
        _ = ticker.tick() => {
          if let Some(probe) = &probe {
            // A transition is picked up by the connectivity branch.
            if watcher.poll(probe.as_ref()).await {
              continue;
            }
          }
          if watcher.current() == Connectivity::Online {
            coordinator.drain().await;
          }
        }
        trigger = triggers.recv() => match trigger {
          Some(SyncTrigger::Now) => {
            coordinator.drain().await;
          }
          Some(SyncTrigger::Tag(tag)) => {
            coordinator.drain_tag(tag).await;
          }
          None => break,
        },
      }
    }

    info!("Sync worker stopped");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::error::SyncError;
  use crate::records::{ClassConfidence, DetectionResult, Outbox};
  use crate::store::Store;
  use crate::sync::RemoteSink;
  use async_trait::async_trait;

  struct AcceptAll;

  #[async_trait]
  impl RemoteSink for AcceptAll {
    async fn push(&self, _collection: &str, _id: &str, _body: &[u8]) -> Result<(), SyncError> {
      Ok(())
    }
  }

  struct AlwaysOnline;

  #[async_trait]
  impl Probe for AlwaysOnline {
    async fn check(&self) -> Connectivity {
      Connectivity::Online
    }
  }

  async fn outbox_with_pending(n: usize) -> (Store, Outbox<DetectionResult>) {
    let store = Store::memory();
    let outbox = Outbox::<DetectionResult>::new(store.clone());
    for i in 0..n {
      outbox
        .append(DetectionResult::from_predictions(
          format!("eye-{}.png", i),
          vec![ClassConfidence {
            class: "normal".into(),
            confidence: 0.99,
          }],
        ))
        .await
        .unwrap();
    }
    (store, outbox)
  }

  async fn wait_until_drained(outbox: &Outbox<DetectionResult>) {
    tokio::time::timeout(Duration::from_secs(5), async {
      while !outbox.pending().await.unwrap().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("records were not drained");
  }

  #[tokio::test]
  async fn test_drains_when_connectivity_returns() {
    let (store, outbox) = outbox_with_pending(2).await;
    let coordinator = Arc::new(SyncCoordinator::new(store, Arc::new(AcceptAll)));
    let watcher = Arc::new(ConnectivityWatcher::new(Connectivity::Offline));
    let (worker, handle) = SyncWorker::new(coordinator, watcher.clone(), Duration::from_secs(3600));
    let task = tokio::spawn(worker.run());

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(outbox.pending().await.unwrap().len(), 2);

    watcher.set(Connectivity::Online);
    wait_until_drained(&outbox).await;

    drop(handle);
    tokio::time::timeout(Duration::from_secs(5), task)
      .await
      .unwrap()
      .unwrap();
  }

  #[tokio::test]
  async fn test_manual_trigger_drains_even_offline() {
    let (store, outbox) = outbox_with_pending(1).await;
    let coordinator = Arc::new(SyncCoordinator::new(store, Arc::new(AcceptAll)));
    let watcher = Arc::new(ConnectivityWatcher::new(Connectivity::Offline));
    let (worker, handle) = SyncWorker::new(coordinator, watcher, Duration::from_secs(3600));
    tokio::spawn(worker.run());

    assert!(handle.fire_tag(SyncTag::DetectionData).await);
    wait_until_drained(&outbox).await;
  }

  #[tokio::test]
  async fn test_probe_bringing_watcher_online_triggers_drain() {
    let (store, outbox) = outbox_with_pending(1).await;
    let coordinator = Arc::new(SyncCoordinator::new(store, Arc::new(AcceptAll)));
    let watcher = Arc::new(ConnectivityWatcher::new(Connectivity::Offline));
    let (worker, _handle) = SyncWorker::new(coordinator, watcher.clone(), Duration::from_millis(10));
    tokio::spawn(worker.with_probe(Arc::new(AlwaysOnline)).run());

    wait_until_drained(&outbox).await;
    assert_eq!(watcher.current(), Connectivity::Online);
  }
}
