//! Persistent offline cache and action queue.
//!
//! This module provides the durable half of offline support:
//! - A transactional key-value cache with per-entry ttl
//! - A FIFO queue of mutating requests recorded while offline
//! - Graceful degradation to an always-miss cache when SQLite is unavailable

mod layer;
mod storage;
mod traits;

pub use layer::OfflineCache;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage, DATABASE_NAME, SCHEMA_VERSION};
pub use traits::{
  BackgroundSync, CacheEntry, CacheSource, CacheStats, NewQueuedAction, QueuedAction,
};
