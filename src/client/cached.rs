//! Cached operations client.
//!
//! Wraps [`ApiClient`] with the cache layer: reads go through
//! `fetch`-with-cache under per-resource TTLs, writes invalidate the whole
//! resource family on success so the next read is forced fresh. A failed
//! mutation leaves the cache untouched. Mutations are not retried: creates
//! and updates are not idempotent, so a duplicate submission is worse than
//! surfacing the failure.

use std::sync::Arc;

use chrono::NaiveDate;

use crate::cache::{namespace_for, CacheLayer, NoopStore, SnapshotStore, SqliteStore};
use crate::config::Config;
use crate::error::Result;
use crate::retry::CancelToken;

use super::http::ApiClient;
use super::keys::OpsQueryKey;
use super::types::{
  InstanceUpdate, NewTaskInstance, NewWasteEntry, TaskInstance, TaskList, WasteEntry,
};

/// Per-resource staleness windows. List metadata changes rarely; instance
/// and waste data move with the shift.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
  pub lists: chrono::Duration,
  pub instances: chrono::Duration,
  pub waste: chrono::Duration,
}

impl Default for TtlPolicy {
  fn default() -> Self {
    Self {
      lists: chrono::Duration::minutes(5),
      instances: chrono::Duration::minutes(2),
      waste: chrono::Duration::minutes(2),
    }
  }
}

/// Operations-API client with transparent caching and offline fallback.
///
/// Consumers call the same methods whether data ends up coming from the
/// network or a cache tier.
pub struct CachedOpsClient {
  api: ApiClient,
  cache: CacheLayer,
  ttl: TtlPolicy,
}

impl CachedOpsClient {
  /// Build a client from configuration: API credentials, snapshot store
  /// namespaced to this (URL, account) pair, retry policy and TTLs.
  pub fn new(config: &Config) -> Result<Self> {
    let token = config.api.token()?;
    let api = ApiClient::new(&config.api.url, &token)?;

    let store: Arc<dyn SnapshotStore> = if config.cache.persist {
      let namespace = namespace_for(&config.api.url, &config.api.account);
      Arc::new(SqliteStore::open(&namespace, config.cache.quota_bytes)?)
    } else {
      Arc::new(NoopStore)
    };

    let cache = CacheLayer::new(store).with_retry_policy(config.cache.retry_policy());
    let ttl = TtlPolicy {
      lists: config.cache.list_ttl(),
      instances: config.cache.instance_ttl(),
      waste: config.cache.instance_ttl(),
    };

    Ok(Self { api, cache, ttl })
  }

  /// Build from already-constructed parts. Useful for tests and for
  /// callers that manage their own store.
  pub fn from_parts(api: ApiClient, cache: CacheLayer, ttl: TtlPolicy) -> Self {
    Self { api, cache, ttl }
  }

  /// Direct access to the cache layer, for manual invalidation.
  pub fn cache(&self) -> &CacheLayer {
    &self.cache
  }

  /// Task lists, optionally scoped to an area.
  pub async fn task_lists(&self, area: Option<&str>) -> Result<Vec<TaskList>> {
    let key = OpsQueryKey::TaskLists {
      area: area.map(String::from),
    };
    let mut query = Vec::new();
    if let Some(area) = area {
      query.push(("area", area.to_string()));
    }

    let result = self
      .cache
      .fetch(&key, self.ttl.lists, || {
        let api = self.api.clone();
        let query = query.clone();
        async move { api.get_json("task-lists", &query).await }
      })
      .await?;
    Ok(result.data)
  }

  /// Task instances in a date range, optionally scoped to an area.
  pub async fn task_instances(
    &self,
    from: NaiveDate,
    to: NaiveDate,
    area: Option<&str>,
  ) -> Result<Vec<TaskInstance>> {
    self
      .task_instances_cancellable(from, to, area, &CancelToken::new())
      .await
  }

  /// Like [`Self::task_instances`], but abandonable: a consumer tearing
  /// down mid-request cancels the token and in-flight retries stop.
  pub async fn task_instances_cancellable(
    &self,
    from: NaiveDate,
    to: NaiveDate,
    area: Option<&str>,
    token: &CancelToken,
  ) -> Result<Vec<TaskInstance>> {
    let key = OpsQueryKey::TaskInstances {
      from,
      to,
      area: area.map(String::from),
    };
    let mut query = vec![("from", from.to_string()), ("to", to.to_string())];
    if let Some(area) = area {
      query.push(("area", area.to_string()));
    }

    let result = self
      .cache
      .fetch_cancellable(&key, self.ttl.instances, token, || {
        let api = self.api.clone();
        let query = query.clone();
        async move { api.get_json("task-instances", &query).await }
      })
      .await?;
    Ok(result.data)
  }

  /// One task instance by id.
  pub async fn task_instance(&self, id: u64) -> Result<TaskInstance> {
    let key = OpsQueryKey::InstanceDetail { id };
    let result = self
      .cache
      .fetch(&key, self.ttl.instances, || {
        let api = self.api.clone();
        async move { api.get_json(&format!("task-instances/{id}"), &[]).await }
      })
      .await?;
    Ok(result.data)
  }

  /// Waste entries for a service date.
  pub async fn waste_entries(&self, date: NaiveDate) -> Result<Vec<WasteEntry>> {
    let key = OpsQueryKey::WasteEntries { date };
    let result = self
      .cache
      .fetch(&key, self.ttl.waste, || {
        let api = self.api.clone();
        let query = vec![("date", date.to_string())];
        async move { api.get_json("waste-entries", &query).await }
      })
      .await?;
    Ok(result.data)
  }

  /// Create a task instance. On success every cached instance query is
  /// invalidated; re-deriving which ranges contain the new instance is not
  /// worth the extra round trip it saves.
  pub async fn create_instance(&self, new: &NewTaskInstance) -> Result<TaskInstance> {
    let created = self.api.post_json("task-instances", new).await?;
    self.cache.invalidate_family("instances");
    Ok(created)
  }

  /// Apply a partial update to a task instance.
  pub async fn update_instance(&self, id: u64, update: &InstanceUpdate) -> Result<TaskInstance> {
    let updated = self
      .api
      .patch_json(&format!("task-instances/{id}"), update)
      .await?;
    self.cache.invalidate_family("instances");
    Ok(updated)
  }

  /// Delete a task instance.
  pub async fn delete_instance(&self, id: u64) -> Result<()> {
    self.api.delete(&format!("task-instances/{id}")).await?;
    self.cache.invalidate_family("instances");
    Ok(())
  }

  /// Record a waste event.
  pub async fn record_waste(&self, new: &NewWasteEntry) -> Result<WasteEntry> {
    let recorded: WasteEntry = self.api.post_json("waste-entries", new).await?;
    self.cache.invalidate_family("waste");
    Ok(recorded)
  }

  /// Drop all cached state, both tiers. Call on logout.
  pub fn clear_cache(&self) {
    self.cache.clear();
  }
}
