//! Durable, indexed local storage for offline data.
//!
//! This module provides a backend-agnostic storage port that:
//! - Holds rows in named collections, upserted by id
//! - Indexes every row by creation time and synced flag
//! - Supports age-based sweeps for retention
//! - Falls back to memory-only storage when the medium is unavailable

mod handle;
mod memory;
mod sqlite;
mod traits;

pub use handle::Store;
pub use memory::MemoryStore;
pub use sqlite::{SqliteStore, SCHEMA_VERSION};
pub use traits::{from_millis, to_millis, Index, IndexValue, Record, StoragePort, StoredRow};
