//! Error taxonomy for the client and its caching layer.
//!
//! Classification drives the retry executor: client errors (4xx other than
//! 429) abort immediately, everything transient is retried with backoff.

use thiserror::Error;

/// Errors surfaced by the Prepline client.
#[derive(Debug, Error)]
pub enum Error {
  /// HTTP error status returned by the API.
  #[error("api returned status {code}: {message}")]
  Status { code: u16, message: String },

  /// Transport-level failure (connection refused, DNS, timeout, ...).
  #[error("network error: {0}")]
  Network(#[from] reqwest::Error),

  /// The API rejected our credentials. Cached state must be cleared and the
  /// caller has to re-authenticate before anything else will succeed.
  #[error("authentication required")]
  Unauthenticated,

  /// Payload could not be serialized or deserialized.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// Persistent snapshot store failure.
  #[error("snapshot store error: {0}")]
  Storage(#[from] rusqlite::Error),

  /// Writing a snapshot would push the store over its byte quota.
  #[error("snapshot quota exceeded: need {needed} bytes, quota is {quota}")]
  QuotaExceeded { needed: u64, quota: u64 },

  /// A cache lock was poisoned by a panicking thread.
  #[error("cache lock poisoned")]
  LockPoisoned,

  /// The operation was abandoned via its cancellation token.
  #[error("operation cancelled")]
  Cancelled,

  /// Configuration could not be loaded or is invalid.
  #[error("config error: {0}")]
  Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
  /// Whether the retry executor should attempt this operation again.
  ///
  /// Client errors are deterministic: retrying a 404 or a 400 yields the
  /// same answer, so they short-circuit. 429 and 5xx are server-side or
  /// transient, as are all transport failures.
  pub fn is_retryable(&self) -> bool {
    match self {
      Error::Status { code, .. } => *code == 429 || (500..=599).contains(code),
      Error::Network(_) => true,
      Error::Unauthenticated => false,
      Error::Serialization(_)
      | Error::Storage(_)
      | Error::QuotaExceeded { .. }
      | Error::LockPoisoned
      | Error::Cancelled
      | Error::Config(_) => false,
    }
  }

  /// Whether this failure means cached state must be discarded and the
  /// consumer redirected to login.
  pub fn is_auth(&self) -> bool {
    matches!(self, Error::Unauthenticated)
  }
}
