//! Resilient client for the Prepline restaurant-operations API.
//!
//! Kitchens have flaky back-office wifi, and the shift does not stop for a
//! 503. This crate wraps the operations API (task checklists, task
//! instances, waste tracking) with the resilience a front-line client
//! needs:
//!
//! - reads are cached in memory with per-resource TTLs, so repeated
//!   renders of the same data make zero network calls
//! - network calls retry with bounded exponential backoff; deterministic
//!   client errors short-circuit instead of retrying
//! - when retries run out, stale cached data is served rather than an
//!   error, and a quota-bounded SQLite snapshot store keeps that fallback
//!   available across restarts
//! - mutations invalidate the affected resource family so the next read is
//!   forced fresh
//! - an authentication failure clears every cached byte and surfaces a
//!   distinct error so the consumer can redirect to login
//!
//! The entry point is [`CachedOpsClient`]; the generic machinery lives in
//! [`cache`] and [`retry`] and works for any JSON-over-HTTP resource.

pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod retry;

pub use cache::{CacheLayer, CacheResult, CacheSource, NoopStore, SnapshotStore, SqliteStore};
pub use client::{ApiClient, CachedOpsClient, TtlPolicy};
pub use config::Config;
pub use error::{Error, Result};
pub use retry::{CancelToken, RetryPolicy};
