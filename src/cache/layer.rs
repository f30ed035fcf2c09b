//! Offline cache facade over a storage backend.
//!
//! Storage errors never escape this layer: reads degrade to a miss and writes
//! to a logged no-op. The one exception is `queue_action`, which reports whether
//! the action was actually persisted so the caller can surface the failure.

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::ErrorKind;

use super::storage::{CacheStorage, NoopStorage, SqliteStorage};
use super::traits::{BackgroundSync, CacheEntry, CacheStats, NewQueuedAction, QueuedAction};

const OFFLINE_DATA_PREFIX: &str = "offline_data:";

/// Current wall-clock time in unix milliseconds.
pub(crate) fn now_ms() -> i64 {
  Utc::now().timestamp_millis()
}

/// Transactional TTL key-value cache plus the offline action queue.
#[derive(Clone)]
pub struct OfflineCache {
  storage: Arc<dyn CacheStorage>,
  background: Option<Arc<dyn BackgroundSync>>,
  available: bool,
}

impl OfflineCache {
  /// Open the cache described by `config`.
  ///
  /// If the backend can't be opened the cache degrades to an always-miss no-op.
  pub fn open(config: &CacheConfig) -> Self {
    if !config.enabled {
      debug!("Offline cache disabled by configuration");
      return Self::disabled();
    }

    match SqliteStorage::open(config.path.as_deref()) {
      Ok(storage) => {
        let cache = Self::with_storage(Arc::new(storage));
        cache.purge_expired();
        cache
      }
      Err(e) => {
        warn!(kind = ?ErrorKind::CacheUnavailable, error = %e, "Offline cache unavailable, continuing without it");
        Self::disabled()
      }
    }
  }

  /// A cache backed by a private in-memory database.
  pub fn in_memory() -> Self {
    match SqliteStorage::open_in_memory() {
      Ok(storage) => Self::with_storage(Arc::new(storage)),
      Err(e) => {
        warn!(kind = ?ErrorKind::CacheUnavailable, error = %e, "In-memory cache unavailable");
        Self::disabled()
      }
    }
  }

  /// A cache that stores nothing.
  pub fn disabled() -> Self {
    Self {
      storage: Arc::new(NoopStorage),
      background: None,
      available: false,
    }
  }

  /// Wrap an arbitrary storage backend.
  pub fn with_storage(storage: Arc<dyn CacheStorage>) -> Self {
    Self {
      storage,
      background: None,
      available: true,
    }
  }

  /// Mirror every queued action to a background channel.
  pub fn with_background_sync(mut self, background: Arc<dyn BackgroundSync>) -> Self {
    self.background = Some(background);
    self
  }

  /// Whether a real persistence backend is in use.
  pub fn is_available(&self) -> bool {
    self.available
  }

  /// Store a structural clone of `value` under `key`, optionally expiring after `ttl`.
  pub fn set_item<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Option<Duration>) {
    let data = match serde_json::to_string(value) {
      Ok(data) => data,
      Err(e) => {
        warn!(key, error = %e, "Failed to serialize cache value");
        return;
      }
    };

    let entry = CacheEntry {
      key: key.to_string(),
      data,
      timestamp: now_ms(),
      ttl: ttl.map(|t| i64::try_from(t.as_millis()).unwrap_or(i64::MAX)),
    };

    if let Err(e) = self.storage.put_entry(&entry) {
      warn!(kind = ?ErrorKind::CacheUnavailable, key, error = %e, "Cache write failed");
    }
  }

  /// Get a live value, or `None` if absent, expired, or unreadable.
  pub fn get_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let entry = match self.storage.get_entry(key, now_ms()) {
      Ok(entry) => entry?,
      Err(e) => {
        warn!(kind = ?ErrorKind::CacheUnavailable, key, error = %e, "Cache read failed");
        return None;
      }
    };

    match serde_json::from_str(&entry.data) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(key, error = %e, "Cached value has unexpected shape, treating as miss");
        None
      }
    }
  }

  pub fn remove_item(&self, key: &str) {
    if let Err(e) = self.storage.delete_entry(key) {
      warn!(kind = ?ErrorKind::CacheUnavailable, key, error = %e, "Cache delete failed");
    }
  }

  /// Drop every cached entry. Queued actions are kept.
  pub fn clear_cache(&self) {
    if let Err(e) = self.storage.clear_entries() {
      warn!(kind = ?ErrorKind::CacheUnavailable, error = %e, "Cache clear failed");
    }
  }

  /// Sweep entries whose ttl has elapsed.
  pub fn purge_expired(&self) -> usize {
    match self.storage.purge_expired(now_ms()) {
      Ok(removed) => {
        if removed > 0 {
          debug!(removed, "Purged expired cache entries");
        }
        removed
      }
      Err(e) => {
        warn!(kind = ?ErrorKind::CacheUnavailable, error = %e, "Cache purge failed");
        0
      }
    }
  }

  /// Store application data for offline use. Never expires.
  pub fn store_offline_data<T: Serialize + ?Sized>(&self, key: &str, value: &T) {
    self.set_item(&format!("{}{}", OFFLINE_DATA_PREFIX, key), value, None);
  }

  pub fn get_offline_data<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    self.get_item(&format!("{}{}", OFFLINE_DATA_PREFIX, key))
  }

  /// Persist a mutating request for later replay.
  ///
  /// Returns the new action id, or `None` if the action could not be persisted.
  pub fn queue_action(&self, request: NewQueuedAction) -> Option<String> {
    let timestamp = now_ms();
    let id = format!("{}-{}", timestamp, &Uuid::new_v4().simple().to_string()[..9]);

    let action = QueuedAction {
      id: id.clone(),
      url: request.url,
      method: request.method,
      headers: request.headers,
      body: request.body,
      timestamp,
    };

    if let Err(e) = self.storage.insert_action(&action) {
      warn!(kind = ?ErrorKind::CacheUnavailable, url = %action.url, error = %e, "Failed to queue offline action");
      return None;
    }

    debug!(id = %action.id, method = %action.method, url = %action.url, "Queued offline action");

    if let Some(background) = &self.background {
      if let Err(e) = background.register(&action) {
        debug!(id = %action.id, error = %e, "Background sync registration failed");
      }
    }

    Some(id)
  }

  /// Queued actions, oldest first.
  pub fn get_pending_actions(&self) -> Vec<QueuedAction> {
    self.storage.pending_actions().unwrap_or_else(|e| {
      warn!(kind = ?ErrorKind::CacheUnavailable, error = %e, "Failed to read offline actions");
      Vec::new()
    })
  }

  pub fn remove_completed_action(&self, id: &str) {
    if let Err(e) = self.storage.delete_action(id) {
      warn!(kind = ?ErrorKind::CacheUnavailable, id, error = %e, "Failed to remove offline action");
    }
  }

  pub fn get_cache_stats(&self, is_online: bool) -> CacheStats {
    let cached_items = self.storage.count_entries().unwrap_or_else(|e| {
      warn!(kind = ?ErrorKind::CacheUnavailable, error = %e, "Failed to count cache entries");
      0
    });
    let pending_actions = self.storage.count_actions().unwrap_or_else(|e| {
      warn!(kind = ?ErrorKind::CacheUnavailable, error = %e, "Failed to count offline actions");
      0
    });

    CacheStats {
      cached_items,
      pending_actions,
      is_online,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use color_eyre::eyre::eyre;
  use serde_json::{json, Value};
  use std::collections::BTreeMap;
  use std::sync::Mutex;

  fn new_action(path: &str) -> NewQueuedAction {
    NewQueuedAction {
      url: format!("http://localhost/api/v1{}", path),
      method: "POST".to_string(),
      headers: BTreeMap::new(),
      body: Some(json!({ "path": path })),
    }
  }

  #[tokio::test]
  async fn test_ttl_elapsed_returns_none_and_removes_row() {
    let cache = OfflineCache::in_memory();
    cache.set_item("k", &json!({ "v": 1 }), Some(Duration::from_millis(10)));

    tokio::time::sleep(Duration::from_millis(11)).await;

    assert_eq!(cache.get_item::<Value>("k"), None);
    assert_eq!(cache.get_cache_stats(true).cached_items, 0);
  }

  #[test]
  fn test_huge_ttl_saturates_instead_of_expiring() {
    let cache = OfflineCache::in_memory();
    cache.set_item("k", &1, Some(Duration::MAX));

    assert_eq!(cache.get_item::<i32>("k"), Some(1));
    assert_eq!(cache.purge_expired(), 0);
  }

  #[test]
  fn test_set_item_stores_a_structural_clone() {
    let cache = OfflineCache::in_memory();
    let mut value = json!({ "list": [1, 2] });
    cache.set_item("k", &value, None);

    value["list"] = json!([]);

    assert_eq!(cache.get_item::<Value>("k"), Some(json!({ "list": [1, 2] })));
  }

  #[test]
  fn test_remove_and_clear() {
    let cache = OfflineCache::in_memory();
    cache.set_item("a", &1, None);
    cache.set_item("b", &2, None);

    cache.remove_item("a");
    assert_eq!(cache.get_item::<i32>("a"), None);
    assert_eq!(cache.get_item::<i32>("b"), Some(2));

    cache.clear_cache();
    assert_eq!(cache.get_item::<i32>("b"), None);
  }

  #[test]
  fn test_offline_data_is_namespaced() {
    let cache = OfflineCache::in_memory();
    cache.store_offline_data("profile", &json!({ "name": "x" }));

    assert_eq!(
      cache.get_offline_data::<Value>("profile"),
      Some(json!({ "name": "x" }))
    );
    assert_eq!(cache.get_item::<Value>("profile"), None);
  }

  #[test]
  fn test_disabled_cache_always_misses() {
    let cache = OfflineCache::disabled();
    cache.set_item("k", &1, None);

    assert!(!cache.is_available());
    assert_eq!(cache.get_item::<i32>("k"), None);
    assert_eq!(cache.queue_action(new_action("/projects")), None);
    assert_eq!(
      cache.get_cache_stats(false),
      CacheStats {
        cached_items: 0,
        pending_actions: 0,
        is_online: false
      }
    );
  }

  #[test]
  fn test_queue_is_fifo_and_removal_idempotent() {
    let cache = OfflineCache::in_memory();
    let a = cache.queue_action(new_action("/a")).unwrap();
    let b = cache.queue_action(new_action("/b")).unwrap();
    let c = cache.queue_action(new_action("/c")).unwrap();

    let ids: Vec<String> = cache.get_pending_actions().into_iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![a, b.clone(), c]);

    cache.remove_completed_action(&b);
    cache.remove_completed_action(&b);
    assert_eq!(cache.get_cache_stats(true).pending_actions, 2);
  }

  struct RecordingSync {
    seen: Mutex<Vec<String>>,
    fail: bool,
  }

  impl BackgroundSync for RecordingSync {
    fn register(&self, action: &QueuedAction) -> color_eyre::Result<()> {
      self.seen.lock().unwrap().push(action.id.clone());
      if self.fail {
        Err(eyre!("channel closed"))
      } else {
        Ok(())
      }
    }
  }

  #[test]
  fn test_queue_mirrors_to_background_sync() {
    let sync = Arc::new(RecordingSync {
      seen: Mutex::new(Vec::new()),
      fail: false,
    });
    let cache = OfflineCache::in_memory().with_background_sync(sync.clone());

    let id = cache.queue_action(new_action("/projects")).unwrap();
    assert_eq!(*sync.seen.lock().unwrap(), vec![id]);
  }

  #[test]
  fn test_background_sync_failure_keeps_action_queued() {
    let sync = Arc::new(RecordingSync {
      seen: Mutex::new(Vec::new()),
      fail: true,
    });
    let cache = OfflineCache::in_memory().with_background_sync(sync);

    assert!(cache.queue_action(new_action("/projects")).is_some());
    assert_eq!(cache.get_pending_actions().len(), 1);
  }
}
