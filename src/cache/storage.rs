//! Cache storage trait and SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CacheEntry, QueuedAction};

/// Application-scoped database name.
pub const DATABASE_NAME: &str = "neoforge-offline";

/// Schema version stored in `PRAGMA user_version`.
pub const SCHEMA_VERSION: i64 = 1;

/// Trait for cache storage backends.
///
/// Every method is one storage transaction. Callers get either the full effect
/// or an error, never a half-written row.
pub trait CacheStorage: Send + Sync {
  /// Upsert a cache entry.
  fn put_entry(&self, entry: &CacheEntry) -> Result<()>;

  /// Get a live entry by key. An expired entry is deleted and reported as absent.
  fn get_entry(&self, key: &str, now_ms: i64) -> Result<Option<CacheEntry>>;

  /// Delete a cache entry. Deleting a missing key is not an error.
  fn delete_entry(&self, key: &str) -> Result<()>;

  /// Delete every cache entry. The action queue is left untouched.
  fn clear_entries(&self) -> Result<()>;

  /// Delete every entry whose ttl elapsed before `now_ms`, returning how many went.
  fn purge_expired(&self, now_ms: i64) -> Result<usize>;

  /// Number of rows in the cache table.
  fn count_entries(&self) -> Result<u64>;

  /// Persist a queued action.
  fn insert_action(&self, action: &QueuedAction) -> Result<()>;

  /// All queued actions, oldest first.
  fn pending_actions(&self) -> Result<Vec<QueuedAction>>;

  /// Delete a queued action. Deleting a missing id is not an error.
  fn delete_action(&self, id: &str) -> Result<()>;

  /// Number of queued actions.
  fn count_actions(&self) -> Result<u64>;
}

/// Storage implementation that doesn't cache anything.
/// Used when the backend can't be opened or caching is disabled.
pub struct NoopStorage;

impl CacheStorage for NoopStorage {
  fn put_entry(&self, _entry: &CacheEntry) -> Result<()> {
    Ok(()) // Discard
  }

  fn get_entry(&self, _key: &str, _now_ms: i64) -> Result<Option<CacheEntry>> {
    Ok(None) // Always miss
  }

  fn delete_entry(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn clear_entries(&self) -> Result<()> {
    Ok(())
  }

  fn purge_expired(&self, _now_ms: i64) -> Result<usize> {
    Ok(0)
  }

  fn count_entries(&self) -> Result<u64> {
    Ok(0)
  }

  fn insert_action(&self, _action: &QueuedAction) -> Result<()> {
    // A queued write must not vanish silently
    Err(eyre!("Cache backend unavailable, action not queued"))
  }

  fn pending_actions(&self) -> Result<Vec<QueuedAction>> {
    Ok(Vec::new())
  }

  fn delete_action(&self, _id: &str) -> Result<()> {
    Ok(())
  }

  fn count_actions(&self) -> Result<u64> {
    Ok(0)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the database at `path`, defaulting to the data directory.
  pub fn open(path: Option<&Path>) -> Result<Self> {
    let path = match path {
      Some(p) => p.to_path_buf(),
      None => Self::default_path()?,
    };

    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(&path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(
      data_dir
        .join("neoforge")
        .join(format!("{}.db", DATABASE_NAME)),
    )
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    let conn = self.lock()?;

    let version: i64 = conn
      .query_row("PRAGMA user_version", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read schema version: {}", e))?;

    if version > SCHEMA_VERSION {
      return Err(eyre!(
        "Cache database schema version {} is newer than supported version {}",
        version,
        SCHEMA_VERSION
      ));
    }

    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    conn
      .pragma_update(None, "user_version", SCHEMA_VERSION)
      .map_err(|e| eyre!("Failed to set schema version: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- Key/value cache with optional per-entry ttl (milliseconds)
CREATE TABLE IF NOT EXISTS cache (
    key TEXT PRIMARY KEY,
    data TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    ttl INTEGER
);

CREATE INDEX IF NOT EXISTS idx_cache_timestamp ON cache(timestamp);

-- Mutating requests recorded while offline
CREATE TABLE IF NOT EXISTS offline_actions (
    id TEXT PRIMARY KEY,
    url TEXT NOT NULL,
    method TEXT NOT NULL,
    headers TEXT NOT NULL,
    body TEXT,
    timestamp INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offline_actions_timestamp ON offline_actions(timestamp);
"#;

impl CacheStorage for SqliteStorage {
  fn put_entry(&self, entry: &CacheEntry) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT OR REPLACE INTO cache (key, data, timestamp, ttl) VALUES (?, ?, ?, ?)",
      params![entry.key, entry.data, entry.timestamp, entry.ttl],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn get_entry(&self, key: &str, now_ms: i64) -> Result<Option<CacheEntry>> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let entry = tx
      .query_row(
        "SELECT key, data, timestamp, ttl FROM cache WHERE key = ?",
        params![key],
        |row| {
          Ok(CacheEntry {
            key: row.get(0)?,
            data: row.get(1)?,
            timestamp: row.get(2)?,
            ttl: row.get(3)?,
          })
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    let entry = match entry {
      Some(entry) if entry.is_expired(now_ms) => {
        tx.execute("DELETE FROM cache WHERE key = ?", params![key])
          .map_err(|e| eyre!("Failed to delete expired entry: {}", e))?;
        None
      }
      other => other,
    };

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(entry)
  }

  fn delete_entry(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM cache WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(())
  }

  fn clear_entries(&self) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM cache", [])
      .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
    Ok(())
  }

  fn purge_expired(&self, now_ms: i64) -> Result<usize> {
    let conn = self.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache WHERE ttl IS NOT NULL AND ? - timestamp > ttl",
        params![now_ms],
      )
      .map_err(|e| eyre!("Failed to purge expired entries: {}", e))?;
    Ok(removed)
  }

  fn count_entries(&self) -> Result<u64> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count cache entries: {}", e))?;
    Ok(count as u64)
  }

  fn insert_action(&self, action: &QueuedAction) -> Result<()> {
    let headers = serde_json::to_string(&action.headers)
      .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;
    let body = action
      .body
      .as_ref()
      .map(serde_json::to_string)
      .transpose()
      .map_err(|e| eyre!("Failed to serialize body: {}", e))?;

    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute(
      "INSERT INTO offline_actions (id, url, method, headers, body, timestamp)
       VALUES (?, ?, ?, ?, ?, ?)",
      params![
        action.id,
        action.url,
        action.method,
        headers,
        body,
        action.timestamp
      ],
    )
    .map_err(|e| eyre!("Failed to queue action: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn pending_actions(&self) -> Result<Vec<QueuedAction>> {
    let conn = self.lock()?;

    // rowid breaks ties between actions queued within the same millisecond
    let mut stmt = conn
      .prepare(
        "SELECT id, url, method, headers, body, timestamp FROM offline_actions
         ORDER BY timestamp, rowid",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows: Vec<(String, String, String, String, Option<String>, i64)> = stmt
      .query_map([], |row| {
        Ok((
          row.get(0)?,
          row.get(1)?,
          row.get(2)?,
          row.get(3)?,
          row.get(4)?,
          row.get(5)?,
        ))
      })
      .map_err(|e| eyre!("Failed to query offline actions: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read offline action: {}", e))?;

    rows
      .into_iter()
      .map(|(id, url, method, headers, body, timestamp)| {
        let headers = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Corrupt headers for action {}: {}", id, e))?;
        let body = body
          .as_deref()
          .map(serde_json::from_str)
          .transpose()
          .map_err(|e| eyre!("Corrupt body for action {}: {}", id, e))?;
        Ok(QueuedAction {
          id,
          url,
          method,
          headers,
          body,
          timestamp,
        })
      })
      .collect()
  }

  fn delete_action(&self, id: &str) -> Result<()> {
    let conn = self.lock()?;
    conn
      .execute("DELETE FROM offline_actions WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to delete offline action: {}", e))?;
    Ok(())
  }

  fn count_actions(&self) -> Result<u64> {
    let conn = self.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM offline_actions", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count offline actions: {}", e))?;
    Ok(count as u64)
  }
}
