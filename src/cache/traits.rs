//! Core records and seams for the offline cache and action queue.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A row of the `cache` table.
///
/// `data` holds the serialized JSON text, so every stored value is a structural
/// clone of what the caller passed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: String,
  pub data: String,
  /// Unix milliseconds at write time
  pub timestamp: i64,
  /// Time to live in milliseconds; `None` never expires
  pub ttl: Option<i64>,
}

impl CacheEntry {
  /// Whether the entry's ttl has elapsed at `now_ms`.
  pub fn is_expired(&self, now_ms: i64) -> bool {
    match self.ttl {
      Some(ttl) => now_ms - self.timestamp > ttl,
      None => false,
    }
  }
}

/// A mutating request recorded while offline, waiting for replay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedAction {
  pub id: String,
  pub url: String,
  pub method: String,
  /// Request headers as sent, minus `authorization`. Carries the idempotency key.
  pub headers: BTreeMap<String, String>,
  pub body: Option<Value>,
  /// Unix milliseconds at enqueue time
  pub timestamp: i64,
}

/// Input for [`crate::cache::OfflineCache::queue_action`].
#[derive(Debug, Clone, Default)]
pub struct NewQueuedAction {
  pub url: String,
  pub method: String,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Value>,
}

/// Snapshot of cache and queue sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
  pub cached_items: u64,
  pub pending_actions: u64,
  pub is_online: bool,
}

/// Indicates where response data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache while still within its ttl
  Cache,
  /// Network unavailable, serving the last cached response
  Offline,
}

/// Optional out-of-band channel that also learns about queued actions,
/// e.g. a service worker or a separate replay daemon.
pub trait BackgroundSync: Send + Sync {
  fn register(&self, action: &QueuedAction) -> Result<()>;
}
