//! Operations-API client: HTTP transport, domain types, cache keys, and
//! the cached wrapper consumers actually use.

pub mod cached;
pub mod http;
pub mod keys;
pub mod types;

pub use cached::{CachedOpsClient, TtlPolicy};
pub use http::ApiClient;
pub use keys::OpsQueryKey;
pub use types::{
  InstanceUpdate, ListRef, NewTaskInstance, NewWasteEntry, TaskInstance, TaskList, TaskStatus,
  WasteEntry,
};
