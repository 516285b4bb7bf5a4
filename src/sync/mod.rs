//! Sync engine: push locally created records to the backend once it is
//! reachable.

mod connectivity;
mod coordinator;
mod remote;
mod worker;

pub use connectivity::{Connectivity, ConnectivityWatcher, HealthProbe, Probe};
pub use coordinator::{SyncCoordinator, SyncItemFailed, SyncReport, SyncState, SyncTag};
pub use remote::{HttpRemote, RemoteSink, IDEMPOTENCY_KEY};
pub use worker::{SyncHandle, SyncTrigger, SyncWorker};
