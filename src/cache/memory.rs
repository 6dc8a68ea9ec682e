//! In-memory cache tier.
//!
//! A process-wide map from cache key to the last successfully fetched
//! payload. Entries are replaced wholesale on refresh and never expire by
//! time alone: staleness is judged by the layer against a per-resource TTL,
//! and a stale entry is still worth returning when the network is down.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde_json::Value;

/// A cached payload and the moment it was fetched.
#[derive(Debug, Clone)]
pub struct CacheEntry {
  pub value: Value,
  pub cached_at: DateTime<Utc>,
}

impl CacheEntry {
  pub fn new(value: Value) -> Self {
    Self {
      value,
      cached_at: Utc::now(),
    }
  }

  pub fn at(value: Value, cached_at: DateTime<Utc>) -> Self {
    Self { value, cached_at }
  }

  /// Age-based staleness check against the caller's TTL.
  pub fn is_fresh(&self, ttl: chrono::Duration) -> bool {
    Utc::now() - self.cached_at <= ttl
  }
}

/// The in-memory tier. Unbounded by count; lives as long as the process.
///
/// The mutex is only ever held across synchronous map operations, never
/// across an await point.
#[derive(Debug, Default)]
pub struct MemoryCache {
  entries: Mutex<HashMap<String, CacheEntry>>,
}

impl MemoryCache {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn get(&self, key: &str) -> Option<CacheEntry> {
    self.entries.lock().ok()?.get(key).cloned()
  }

  pub fn set(&self, key: &str, entry: CacheEntry) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.insert(key.to_string(), entry);
    }
  }

  pub fn remove(&self, key: &str) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.remove(key);
    }
  }

  /// Drop every entry whose key contains `fragment`. O(n) over current
  /// keys, which stay in the tens-to-hundreds for this client.
  pub fn remove_matching(&self, fragment: &str) -> usize {
    let Ok(mut entries) = self.entries.lock() else {
      return 0;
    };
    let before = entries.len();
    entries.retain(|key, _| !key.contains(fragment));
    before - entries.len()
  }

  pub fn clear(&self) {
    if let Ok(mut entries) = self.entries.lock() {
      entries.clear();
    }
  }

  pub fn len(&self) -> usize {
    self.entries.lock().map(|e| e.len()).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
