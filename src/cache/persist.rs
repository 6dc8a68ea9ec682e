//! Persistent snapshot tier.
//!
//! Best-effort, size-bounded key-value store that lets cached data survive a
//! process restart. Snapshots are never more authoritative than an in-memory
//! entry: the layer only consults this tier when memory is empty and the
//! network has already failed.

use std::path::PathBuf;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Default byte quota per namespace, mirroring typical session-store limits.
pub const DEFAULT_QUOTA_BYTES: u64 = 4 * 1024 * 1024;

/// A snapshot as stored: serialized payload plus its original fetch time.
#[derive(Debug, Clone)]
pub struct PersistedSnapshot {
  pub payload: String,
  pub cached_at: DateTime<Utc>,
}

/// Storage backend for persisted snapshots.
///
/// Writes may fail with [`Error::QuotaExceeded`]; callers treat persistence
/// as best-effort and must never let a storage failure reach the consumer.
pub trait SnapshotStore: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<PersistedSnapshot>>;

  /// Store a snapshot, replacing any previous one under `key`. Fails with
  /// [`Error::QuotaExceeded`] if the namespace would exceed its quota.
  fn put(&self, key: &str, payload: &str, cached_at: DateTime<Utc>) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;

  /// Remove every snapshot whose key contains `fragment`, except `keep`.
  fn remove_matching(&self, fragment: &str, keep: Option<&str>) -> Result<usize>;

  /// Evict least-recently-cached snapshots in `family` (key prefix),
  /// keeping `keep`, until at least `bytes_needed` have been freed or the
  /// family is exhausted. Returns the number of bytes freed.
  fn evict_lru(&self, family: &str, keep: &str, bytes_needed: u64) -> Result<u64>;

  fn clear(&self) -> Result<()>;

  /// Current total payload bytes in this namespace.
  fn usage(&self) -> Result<u64>;
}

/// Store that persists nothing. Used when caching to disk is disabled.
pub struct NoopStore;

impl SnapshotStore for NoopStore {
  fn get(&self, _key: &str) -> Result<Option<PersistedSnapshot>> {
    Ok(None)
  }

  fn put(&self, _key: &str, _payload: &str, _cached_at: DateTime<Utc>) -> Result<()> {
    Ok(())
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn remove_matching(&self, _fragment: &str, _keep: Option<&str>) -> Result<usize> {
    Ok(0)
  }

  fn evict_lru(&self, _family: &str, _keep: &str, _bytes_needed: u64) -> Result<u64> {
    Ok(0)
  }

  fn clear(&self) -> Result<()> {
    Ok(())
  }

  fn usage(&self) -> Result<u64> {
    Ok(0)
  }
}

/// Namespace for a (base URL, account) pair so two accounts never read each
/// other's snapshots.
pub fn namespace_for(base_url: &str, account: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(base_url.trim_end_matches('/').as_bytes());
  hasher.update(b"\x00");
  hasher.update(account.as_bytes());
  hex::encode(&hasher.finalize()[..16])
}

/// SQLite-backed snapshot store.
pub struct SqliteStore {
  conn: Mutex<Connection>,
  namespace: String,
  quota_bytes: u64,
}

const SNAPSHOT_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshots (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    payload TEXT NOT NULL,
    cached_at TEXT NOT NULL,
    PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_snapshots_cached_at
    ON snapshots(namespace, cached_at);
"#;

impl SqliteStore {
  /// Open the store at the default location for this platform.
  pub fn open(namespace: &str, quota_bytes: u64) -> Result<Self> {
    let path = Self::default_path()?;
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Config(format!("failed to create cache directory: {e}")))?;
    }
    Self::open_at(&path, namespace, quota_bytes)
  }

  /// Open the store at an explicit path.
  pub fn open_at(path: &std::path::Path, namespace: &str, quota_bytes: u64) -> Result<Self> {
    let conn = Connection::open(path)?;
    Self::with_connection(conn, namespace, quota_bytes)
  }

  /// In-memory store, mostly for tests.
  pub fn open_in_memory(namespace: &str, quota_bytes: u64) -> Result<Self> {
    let conn = Connection::open_in_memory()?;
    Self::with_connection(conn, namespace, quota_bytes)
  }

  fn with_connection(conn: Connection, namespace: &str, quota_bytes: u64) -> Result<Self> {
    conn.execute_batch(SNAPSHOT_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
      namespace: namespace.to_string(),
      quota_bytes,
    })
  }

  fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Config("could not determine data directory".into()))?;
    Ok(data_dir.join("prepline").join("cache.db"))
  }

  fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|_| Error::LockPoisoned)
  }

  fn usage_locked(conn: &Connection, namespace: &str) -> Result<u64> {
    let total: i64 = conn.query_row(
      "SELECT COALESCE(SUM(LENGTH(payload)), 0) FROM snapshots WHERE namespace = ?",
      params![namespace],
      |row| row.get(0),
    )?;
    Ok(total as u64)
  }
}

impl SnapshotStore for SqliteStore {
  fn get(&self, key: &str) -> Result<Option<PersistedSnapshot>> {
    let conn = self.lock()?;
    let mut stmt = conn.prepare(
      "SELECT payload, cached_at FROM snapshots WHERE namespace = ? AND key = ?",
    )?;

    // Only the no-rows case is a miss; any other failure is a real
    // storage error and must not masquerade as one.
    let row: Option<(String, String)> = stmt
      .query_row(params![self.namespace, key], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })
      .optional()?;

    match row {
      Some((payload, cached_at)) => {
        let cached_at = DateTime::parse_from_rfc3339(&cached_at)
          .map_err(|e| Error::Config(format!("bad cached_at in snapshot store: {e}")))?
          .with_timezone(&Utc);
        Ok(Some(PersistedSnapshot { payload, cached_at }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, key: &str, payload: &str, cached_at: DateTime<Utc>) -> Result<()> {
    let conn = self.lock()?;

    // Usage excluding whatever this key currently holds, since the write
    // replaces it.
    let existing: i64 = conn
      .query_row(
        "SELECT LENGTH(payload) FROM snapshots WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
        |row| row.get(0),
      )
      .optional()?
      .unwrap_or(0);
    let others = Self::usage_locked(&conn, &self.namespace)?.saturating_sub(existing as u64);
    let needed = others + payload.len() as u64;

    if needed > self.quota_bytes {
      return Err(Error::QuotaExceeded {
        needed,
        quota: self.quota_bytes,
      });
    }

    conn.execute(
      "INSERT OR REPLACE INTO snapshots (namespace, key, payload, cached_at)
       VALUES (?, ?, ?, ?)",
      params![self.namespace, key, payload, cached_at.to_rfc3339()],
    )?;
    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM snapshots WHERE namespace = ? AND key = ?",
      params![self.namespace, key],
    )?;
    Ok(())
  }

  fn remove_matching(&self, fragment: &str, keep: Option<&str>) -> Result<usize> {
    let conn = self.lock()?;
    let pattern = format!("%{}%", escape_like(fragment));
    let removed = match keep {
      Some(keep) => conn.execute(
        "DELETE FROM snapshots
         WHERE namespace = ? AND key LIKE ? ESCAPE '\\' AND key != ?",
        params![self.namespace, pattern, keep],
      )?,
      None => conn.execute(
        "DELETE FROM snapshots WHERE namespace = ? AND key LIKE ? ESCAPE '\\'",
        params![self.namespace, pattern],
      )?,
    };
    Ok(removed)
  }

  fn evict_lru(&self, family: &str, keep: &str, bytes_needed: u64) -> Result<u64> {
    let conn = self.lock()?;
    let pattern = format!("{}%", escape_like(family));

    let candidates: Vec<(String, i64)> = {
      let mut stmt = conn.prepare(
        "SELECT key, LENGTH(payload) FROM snapshots
         WHERE namespace = ? AND key LIKE ? ESCAPE '\\' AND key != ?
         ORDER BY cached_at ASC",
      )?;
      let rows = stmt.query_map(params![self.namespace, pattern, keep], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })?;
      rows.collect::<std::result::Result<_, _>>()?
    };

    let mut freed = 0u64;
    for (key, size) in candidates {
      if freed >= bytes_needed {
        break;
      }
      conn.execute(
        "DELETE FROM snapshots WHERE namespace = ? AND key = ?",
        params![self.namespace, key],
      )?;
      freed += size as u64;
    }
    Ok(freed)
  }

  fn clear(&self) -> Result<()> {
    let conn = self.lock()?;
    conn.execute(
      "DELETE FROM snapshots WHERE namespace = ?",
      params![self.namespace],
    )?;
    Ok(())
  }

  fn usage(&self) -> Result<u64> {
    let conn = self.lock()?;
    Self::usage_locked(&conn, &self.namespace)
  }
}

fn escape_like(s: &str) -> String {
  s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}
