//! Cache layer that composes the retry executor with both cache tiers.
//!
//! Read precedence: fresh in-memory entry, then network, then stale
//! in-memory entry, then persisted snapshot (only when memory has nothing),
//! then the error itself. Degraded reads never refresh `cached_at`, so the
//! next call still attempts a real fetch.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::retry::{retry, CancelToken, RetryPolicy};

use super::key::QueryKey;
use super::memory::{CacheEntry, MemoryCache};
use super::persist::SnapshotStore;

/// Result of a cached fetch, including where the data came from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// When the data was originally fetched, if it came from a cache tier.
  pub cached_at: Option<DateTime<Utc>>,
}

/// Where a cached fetch got its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh from the network.
  Network,
  /// From cache, within its TTL.
  CacheFresh,
  /// From cache past its TTL, served because the network failed.
  Stale,
}

/// Orchestrates cached reads against a network fetcher.
///
/// One layer is constructed at startup and handed to consumers by
/// reference; all state is explicit, nothing is ambient.
pub struct CacheLayer {
  memory: MemoryCache,
  persist: Arc<dyn SnapshotStore>,
  /// Per-key locks so concurrent fetches for one key coalesce into a
  /// single network call.
  inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
  retry_policy: RetryPolicy,
  /// Payloads above this many bytes are truncated before persisting.
  persist_payload_limit: usize,
  /// Item cap applied when a list payload has to be truncated.
  persist_max_items: usize,
}

impl CacheLayer {
  pub fn new(persist: Arc<dyn SnapshotStore>) -> Self {
    Self {
      memory: MemoryCache::new(),
      persist,
      inflight: Mutex::new(HashMap::new()),
      retry_policy: RetryPolicy::default(),
      persist_payload_limit: 1024 * 1024,
      persist_max_items: 50,
    }
  }

  pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
    self.retry_policy = policy;
    self
  }

  pub fn with_persist_payload_limit(mut self, bytes: usize) -> Self {
    self.persist_payload_limit = bytes;
    self
  }

  pub fn with_persist_max_items(mut self, items: usize) -> Self {
    self.persist_max_items = items.max(1);
    self
  }

  /// Fetch through the cache. See [`Self::fetch_cancellable`].
  pub async fn fetch<K, T, F, Fut>(
    &self,
    key: &K,
    ttl: Duration,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    K: QueryKey,
    T: Serialize + DeserializeOwned,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    self
      .fetch_cancellable(key, ttl, &CancelToken::new(), fetcher)
      .await
  }

  /// Fetch through the cache with cancellation support.
  ///
  /// 1. A fresh in-memory entry is returned without touching the network.
  /// 2. Otherwise `fetcher` runs under the retry policy; concurrent calls
  ///    for the same key wait for the first one instead of fetching twice.
  /// 3. Success writes through both tiers.
  /// 4. Transient failure after exhausted retries degrades to a stale
  ///    in-memory entry, then to a persisted snapshot, then propagates.
  ///    Client errors (4xx other than 429) propagate without degrading.
  /// 5. An authentication failure clears every cached byte before
  ///    propagating, forcing a clean slate after re-login.
  pub async fn fetch_cancellable<K, T, F, Fut>(
    &self,
    key: &K,
    ttl: Duration,
    token: &CancelToken,
    fetcher: F,
  ) -> Result<CacheResult<T>>
  where
    K: QueryKey,
    T: Serialize + DeserializeOwned,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
  {
    let cache_key = key.cache_key();

    // Fast path: fresh entry, no lock contention.
    if let Some(entry) = self.memory.get(&cache_key) {
      if entry.is_fresh(ttl) {
        return typed(entry.value, CacheSource::CacheFresh, Some(entry.cached_at));
      }
    }

    let lock = self.inflight_lock(&cache_key);
    let _guard = lock.lock().await;

    // Re-check: another caller may have refreshed this key while we
    // waited on the lock.
    if let Some(entry) = self.memory.get(&cache_key) {
      if entry.is_fresh(ttl) {
        return typed(entry.value, CacheSource::CacheFresh, Some(entry.cached_at));
      }
    }

    match retry(&self.retry_policy, token, fetcher).await {
      Ok(data) => {
        let value = serde_json::to_value(&data)?;
        let cached_at = Utc::now();
        self
          .memory
          .set(&cache_key, CacheEntry::at(value.clone(), cached_at));
        self.persist_snapshot(key, &cache_key, &value, cached_at);
        Ok(CacheResult {
          data,
          source: CacheSource::Network,
          cached_at: None,
        })
      }
      Err(err) if err.is_auth() => {
        tracing::warn!(key = %key.description(), "authentication failed, clearing cache");
        self.clear();
        Err(err)
      }
      Err(err) if err.is_retryable() => {
        tracing::warn!(key = %key.description(), error = %err, "fetch failed, degrading to cache");
        if let Some(entry) = self.memory.get(&cache_key) {
          return typed(entry.value, CacheSource::Stale, Some(entry.cached_at));
        }
        if let Ok(Some(snapshot)) = self.persist.get(&cache_key) {
          if let Ok(value) = serde_json::from_str::<Value>(&snapshot.payload) {
            // Warm memory with the original timestamp so the next call
            // still tries the network.
            self
              .memory
              .set(&cache_key, CacheEntry::at(value.clone(), snapshot.cached_at));
            return typed(value, CacheSource::Stale, Some(snapshot.cached_at));
          }
        }
        Err(err)
      }
      Err(err) => Err(err),
    }
  }

  /// Drop the cached entry for one key, in both tiers.
  pub fn invalidate<K: QueryKey>(&self, key: &K) {
    let cache_key = key.cache_key();
    self.memory.remove(&cache_key);
    if let Err(err) = self.persist.remove(&cache_key) {
      tracing::warn!(key = %cache_key, error = %err, "failed to remove persisted snapshot");
    }
  }

  /// Drop every entry whose key contains `fragment`, in both tiers. Used
  /// to invalidate all cached queries touching e.g. a service date.
  pub fn invalidate_matching(&self, fragment: &str) {
    let dropped = self.memory.remove_matching(fragment);
    tracing::debug!(fragment, dropped, "invalidated cache entries");
    if let Err(err) = self.persist.remove_matching(fragment, None) {
      tracing::warn!(fragment, error = %err, "failed to remove persisted snapshots");
    }
  }

  /// Drop every entry for a resource family. Mutations call this rather
  /// than attempting precise partial invalidation.
  pub fn invalidate_family(&self, family: &str) {
    self.invalidate_matching(&format!("{family}:"));
  }

  /// Drop everything, both tiers. Used on logout and auth failure.
  pub fn clear(&self) {
    self.memory.clear();
    if let Err(err) = self.persist.clear() {
      tracing::warn!(error = %err, "failed to clear persisted snapshots");
    }
  }

  fn inflight_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
    let mut map = self.inflight.lock().unwrap_or_else(|e| e.into_inner());
    // A strong count of 1 means no fetch holds the lock anymore; sweep
    // those so the map tracks live keys instead of growing forever.
    map.retain(|_, lock| Arc::strong_count(lock) > 1);
    map.entry(key.to_string()).or_default().clone()
  }

  /// Best-effort write to the persistent tier. Oversized list payloads are
  /// truncated; quota exhaustion evicts the least-recently-cached
  /// snapshots of the same family and retries once with a harder cap.
  /// Failures are logged and never surface to the consumer.
  fn persist_snapshot<K: QueryKey>(
    &self,
    key: &K,
    cache_key: &str,
    value: &Value,
    cached_at: DateTime<Utc>,
  ) {
    let payload = render_payload(value, self.persist_payload_limit, self.persist_max_items);

    match self.persist.put(cache_key, &payload, cached_at) {
      Ok(()) => {}
      Err(Error::QuotaExceeded { needed, quota }) => {
        let shortfall = needed.saturating_sub(quota).max(1);
        let family = format!("{}:", key.family());
        match self.persist.evict_lru(&family, cache_key, shortfall) {
          Ok(freed) => {
            tracing::debug!(family, freed, "evicted snapshots to make room");
          }
          Err(err) => tracing::warn!(family, error = %err, "snapshot eviction failed"),
        }

        let capped = truncate_items(value, (self.persist_max_items / 2).max(1));
        if let Err(err) = self.persist.put(cache_key, &capped.to_string(), cached_at) {
          tracing::warn!(key = %key.description(), error = %err, "giving up on persisting snapshot");
        }
      }
      Err(err) => {
        tracing::warn!(key = %key.description(), error = %err, "snapshot write failed");
      }
    }
  }
}

/// Serialize a payload for the persistent tier, truncating list payloads
/// that exceed the byte limit.
fn render_payload(value: &Value, payload_limit: usize, max_items: usize) -> String {
  let payload = value.to_string();
  if payload.len() <= payload_limit {
    return payload;
  }
  truncate_items(value, max_items).to_string()
}

/// Cap a list payload to its first `max_items` entries (the API returns
/// lists most-recent-first). Non-list payloads are left as-is.
fn truncate_items(value: &Value, max_items: usize) -> Value {
  match value {
    Value::Array(items) if items.len() > max_items => {
      Value::Array(items.iter().take(max_items).cloned().collect())
    }
    other => other.clone(),
  }
}

fn typed<T: DeserializeOwned>(
  value: Value,
  source: CacheSource,
  cached_at: Option<DateTime<Utc>>,
) -> Result<CacheResult<T>> {
  let data = serde_json::from_value(value)?;
  Ok(CacheResult {
    data,
    source,
    cached_at,
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::persist::{NoopStore, SqliteStore};
  use std::sync::atomic::{AtomicU32, Ordering};

  struct TestKey(&'static str);

  impl QueryKey for TestKey {
    fn family(&self) -> &'static str {
      "lists"
    }

    fn params(&self) -> String {
      self.0.to_string()
    }
  }

  fn layer() -> CacheLayer {
    CacheLayer::new(Arc::new(NoopStore)).with_retry_policy(RetryPolicy {
      max_attempts: 3,
      base_delay: std::time::Duration::from_millis(1),
    })
  }

  fn status(code: u16) -> Error {
    Error::Status {
      code,
      message: String::new(),
    }
  }

  /// Route warn/debug lines from the layer into test output.
  fn init_tracing() {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::new("prepline=debug"))
      .with_test_writer()
      .try_init();
  }

  #[tokio::test]
  async fn test_fresh_entry_skips_network() {
    let layer = layer();
    let calls = AtomicU32::new(0);
    let key = TestKey("foh");

    for _ in 0..2 {
      let result = layer
        .fetch(&key, Duration::minutes(5), || {
          calls.fetch_add(1, Ordering::SeqCst);
          async { Ok(vec![1u32, 2, 3]) }
        })
        .await
        .unwrap();
      assert_eq!(result.data, vec![1, 2, 3]);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_expired_ttl_refetches() {
    let layer = layer();
    let calls = AtomicU32::new(0);
    let key = TestKey("foh");

    for _ in 0..2 {
      let result: CacheResult<Vec<u32>> = layer
        .fetch(&key, Duration::zero(), || {
          calls.fetch_add(1, Ordering::SeqCst);
          async { Ok(vec![1u32]) }
        })
        .await
        .unwrap();
      assert_eq!(result.source, CacheSource::Network);
    }

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_stale_entry_served_when_network_fails() {
    init_tracing();
    let layer = layer();
    let key = TestKey("foh");

    let _: CacheResult<Vec<u32>> = layer
      .fetch(&key, Duration::zero(), || async { Ok(vec![7u32]) })
      .await
      .unwrap();

    let seeded_at = layer.memory.get(&key.cache_key()).unwrap().cached_at;

    let calls = AtomicU32::new(0);
    let result: CacheResult<Vec<u32>> = layer
      .fetch(&key, Duration::zero(), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(status(500)) }
      })
      .await
      .unwrap();

    assert_eq!(result.data, vec![7]);
    assert_eq!(result.source, CacheSource::Stale);
    assert_eq!(result.cached_at, Some(seeded_at));
    // All attempts were spent before degrading.
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    // The degraded read did not refresh the timestamp, so the next call
    // still judges the entry stale and goes to the network.
    let after = layer.memory.get(&key.cache_key()).unwrap().cached_at;
    assert_eq!(after, seeded_at);
  }

  #[tokio::test]
  async fn test_error_propagates_when_nothing_cached() {
    let layer = layer();
    let result: Result<CacheResult<Vec<u32>>> = layer
      .fetch(&TestKey("empty"), Duration::minutes(5), || async {
        Err(status(500))
      })
      .await;

    assert!(matches!(result, Err(Error::Status { code: 500, .. })));
  }

  #[tokio::test]
  async fn test_client_error_propagates_without_degrade() {
    let layer = layer();
    let key = TestKey("gone");

    let _: CacheResult<u32> = layer
      .fetch(&key, Duration::zero(), || async { Ok(1u32) })
      .await
      .unwrap();

    let calls = AtomicU32::new(0);
    let result: Result<CacheResult<u32>> = layer
      .fetch(&key, Duration::zero(), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Err(status(404)) }
      })
      .await;

    assert!(matches!(result, Err(Error::Status { code: 404, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_invalidation_forces_refetch_within_ttl() {
    let layer = layer();
    let calls = AtomicU32::new(0);
    let key = TestKey("foh");

    let _: CacheResult<Vec<u32>> = layer
      .fetch(&key, Duration::minutes(5), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(vec![1u32]) }
      })
      .await
      .unwrap();

    layer.invalidate(&key);

    let _: CacheResult<Vec<u32>> = layer
      .fetch(&key, Duration::minutes(5), || {
        calls.fetch_add(1, Ordering::SeqCst);
        async { Ok(vec![1u32]) }
      })
      .await
      .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_concurrent_fetches_coalesce() {
    let layer = layer();
    let calls = Arc::new(AtomicU32::new(0));
    let key = TestKey("foh");

    let fetcher = || {
      let calls = Arc::clone(&calls);
      async move {
        calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        Ok(vec![1u32])
      }
    };

    let (a, b) = tokio::join!(
      layer.fetch(&key, Duration::minutes(5), fetcher),
      layer.fetch(&key, Duration::minutes(5), fetcher),
    );

    assert_eq!(a.unwrap().data, vec![1]);
    assert_eq!(b.unwrap().data, vec![1]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_persisted_snapshot_survives_restart() {
    let store: Arc<dyn SnapshotStore> =
      Arc::new(SqliteStore::open_in_memory("test", 1024 * 1024).unwrap());

    let first = CacheLayer::new(Arc::clone(&store));
    let _: CacheResult<Vec<u32>> = first
      .fetch(&TestKey("foh"), Duration::minutes(5), || async {
        Ok(vec![4u32, 5])
      })
      .await
      .unwrap();

    // A new layer (fresh memory tier, same store) with a dead network
    // falls back to the snapshot.
    let second = CacheLayer::new(Arc::clone(&store)).with_retry_policy(RetryPolicy {
      max_attempts: 1,
      base_delay: std::time::Duration::from_millis(1),
    });
    let result: CacheResult<Vec<u32>> = second
      .fetch(&TestKey("foh"), Duration::minutes(5), || async {
        Err(status(503))
      })
      .await
      .unwrap();

    assert_eq!(result.data, vec![4, 5]);
    assert_eq!(result.source, CacheSource::Stale);
  }

  #[tokio::test]
  async fn test_auth_failure_clears_everything() {
    let store: Arc<dyn SnapshotStore> =
      Arc::new(SqliteStore::open_in_memory("test", 1024 * 1024).unwrap());
    let layer = CacheLayer::new(Arc::clone(&store));
    let key = TestKey("foh");

    let _: CacheResult<Vec<u32>> = layer
      .fetch(&key, Duration::minutes(5), || async { Ok(vec![1u32]) })
      .await
      .unwrap();
    assert!(store.usage().unwrap() > 0);

    let result: Result<CacheResult<Vec<u32>>> = layer
      .fetch(&key, Duration::zero(), || async {
        Err(Error::Unauthenticated)
      })
      .await;

    assert!(matches!(result, Err(Error::Unauthenticated)));
    assert_eq!(store.usage().unwrap(), 0);

    // Nothing left to degrade to.
    let result: Result<CacheResult<Vec<u32>>> = layer
      .fetch(&key, Duration::minutes(5), || async { Err(status(500)) })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_oversized_payload_truncated_for_persistence_only() {
    let store: Arc<dyn SnapshotStore> =
      Arc::new(SqliteStore::open_in_memory("test", 1024 * 1024).unwrap());
    let layer = CacheLayer::new(Arc::clone(&store))
      .with_persist_payload_limit(64)
      .with_persist_max_items(4);
    let key = TestKey("big");

    let items: Vec<u32> = (0..100).collect();
    let result = layer
      .fetch(&key, Duration::minutes(5), || {
        let items = items.clone();
        async move { Ok(items) }
      })
      .await
      .unwrap();

    // Memory keeps the full value.
    assert_eq!(result.data.len(), 100);
    let cached: CacheResult<Vec<u32>> = layer
      .fetch(&key, Duration::minutes(5), || async { Err(status(500)) })
      .await
      .unwrap();
    assert_eq!(cached.data.len(), 100);
    assert_eq!(cached.source, CacheSource::CacheFresh);

    // The persisted snapshot is capped.
    let snapshot = store.get(&key.cache_key()).unwrap().unwrap();
    let persisted: Vec<u32> = serde_json::from_str(&snapshot.payload).unwrap();
    assert_eq!(persisted.len(), 4);
  }

  #[tokio::test]
  async fn test_quota_exhaustion_evicts_and_retries() {
    init_tracing();
    // Quota fits one small snapshot; the second write must evict the
    // first and land truncated rather than fail the fetch.
    let store: Arc<dyn SnapshotStore> = Arc::new(SqliteStore::open_in_memory("test", 120).unwrap());
    let layer = CacheLayer::new(Arc::clone(&store)).with_persist_max_items(8);

    let _: CacheResult<Vec<u32>> = layer
      .fetch(&TestKey("old"), Duration::minutes(5), || async {
        Ok((0..20).collect::<Vec<u32>>())
      })
      .await
      .unwrap();

    let result: CacheResult<Vec<u32>> = layer
      .fetch(&TestKey("new"), Duration::minutes(5), || async {
        Ok((100..140).collect::<Vec<u32>>())
      })
      .await
      .unwrap();
    assert_eq!(result.data.len(), 40);

    // The newer key won; persistence never failed the fetch.
    assert!(store.get(&TestKey("new").cache_key()).unwrap().is_some());
    assert!(store.get(&TestKey("old").cache_key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_completed_fetches_release_their_inflight_locks() {
    let layer = layer();

    struct NumKey(u32);
    impl QueryKey for NumKey {
      fn family(&self) -> &'static str {
        "lists"
      }
      fn params(&self) -> String {
        self.0.to_string()
      }
    }

    for i in 0..10 {
      let _: CacheResult<u32> = layer
        .fetch(&NumKey(i), Duration::minutes(5), || async { Ok(1u32) })
        .await
        .unwrap();
    }

    // The next acquisition sweeps every lock no fetch is holding, so the
    // map tracks live keys instead of one entry per key ever fetched.
    let _: CacheResult<u32> = layer
      .fetch(&NumKey(99), Duration::minutes(5), || async { Ok(1u32) })
      .await
      .unwrap();

    let map = layer.inflight.lock().unwrap();
    assert_eq!(map.len(), 1);
    assert!(map.contains_key(&NumKey(99).cache_key()));
  }

  #[tokio::test]
  async fn test_invalidate_matching_by_date_fragment() {
    let layer = layer();
    let calls = AtomicU32::new(0);

    struct DateKey(&'static str);
    impl QueryKey for DateKey {
      fn family(&self) -> &'static str {
        "instances"
      }
      fn params(&self) -> String {
        self.0.to_string()
      }
    }

    for key in [DateKey("2026-08-01:foh"), DateKey("2026-08-02:foh")] {
      let _: CacheResult<u32> = layer
        .fetch(&key, Duration::minutes(5), || {
          calls.fetch_add(1, Ordering::SeqCst);
          async { Ok(1u32) }
        })
        .await
        .unwrap();
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    layer.invalidate_matching("2026-08-01");

    for key in [DateKey("2026-08-01:foh"), DateKey("2026-08-02:foh")] {
      let _: CacheResult<u32> = layer
        .fetch(&key, Duration::minutes(5), || {
          calls.fetch_add(1, Ordering::SeqCst);
          async { Ok(1u32) }
        })
        .await
        .unwrap();
    }
    // Only the invalidated date refetched.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
  }
}
