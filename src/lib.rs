//! Offline-first persistence and sync for the retina detection app.
//!
//! - [`store`]: durable indexed storage with a memory-only fallback
//! - [`artifacts`]: size and count bounded LRU cache for model payloads
//! - [`intercept`]: cache-first and network-first request resolution
//! - [`sync`]: drains locally created records once the backend is reachable
//! - [`stats`]: read-only usage summary

pub mod artifacts;
pub mod clock;
pub mod error;
pub mod intercept;
pub mod records;
pub mod stats;
pub mod store;
pub mod sync;

pub use error::{ArtifactError, FetchError, StoreError, SyncError};
pub use store::Store;
