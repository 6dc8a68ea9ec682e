//! Dual-tier caching for API reads.
//!
//! An in-memory map holds the authoritative working set; a quota-bounded
//! SQLite store keeps best-effort snapshots across restarts. The
//! [`CacheLayer`] composes both tiers with the retry executor:
//! - fresh cache hits skip the network entirely
//! - transient network failure degrades to stale data instead of an error
//! - mutations invalidate whole resource families
//! - nothing here is ambient state; the layer is built once and passed to
//!   consumers

pub mod key;
pub mod layer;
pub mod memory;
pub mod persist;

pub use key::QueryKey;
pub use layer::{CacheLayer, CacheResult, CacheSource};
pub use memory::{CacheEntry, MemoryCache};
pub use persist::{namespace_for, NoopStore, PersistedSnapshot, SnapshotStore, SqliteStore};
