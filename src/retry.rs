//! Bounded exponential-backoff retry executor.
//!
//! Pure control flow around a single async operation: no shared state, no
//! side effects beyond invoking the operation. Failure classification lives
//! on [`Error::is_retryable`]; anything deterministic (4xx other than 429)
//! aborts on the first attempt.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::future::Future;

use crate::error::{Error, Result};

/// Retry configuration for network operations.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
  /// Total attempts, including the first one.
  pub max_attempts: u32,
  /// Delay before the second attempt; doubles for each attempt after that.
  pub base_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 3,
      base_delay: Duration::from_millis(500),
    }
  }
}

impl RetryPolicy {
  /// Backoff to wait before `attempt` (1-based). The first attempt runs
  /// immediately; attempt n waits `base_delay * 2^(n-2)`.
  pub fn delay_before(&self, attempt: u32) -> Option<Duration> {
    if attempt <= 1 {
      None
    } else {
      Some(self.base_delay * 2u32.saturating_pow(attempt - 2))
    }
  }
}

/// Cooperative cancellation flag threaded through fetches so a torn-down
/// consumer can abandon in-flight retries. Cloning shares the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  cancelled: Arc<AtomicBool>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// Signal abandonment. In-flight retries abort before their next attempt.
  pub fn cancel(&self) {
    self.cancelled.store(true, Ordering::SeqCst);
  }

  pub fn is_cancelled(&self) -> bool {
    self.cancelled.load(Ordering::SeqCst)
  }
}

/// Run `operation` up to `policy.max_attempts` times with exponential
/// backoff between attempts.
///
/// Non-retryable failures surface immediately; on exhaustion the last error
/// is re-raised so the caller can decide whether to degrade to cached data.
/// The token is checked before every attempt, including the first.
pub async fn retry<T, F, Fut>(
  policy: &RetryPolicy,
  token: &CancelToken,
  mut operation: F,
) -> Result<T>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<T>>,
{
  let attempts = policy.max_attempts.max(1);
  let mut last_err = None;

  for attempt in 1..=attempts {
    if let Some(delay) = policy.delay_before(attempt) {
      tokio::time::sleep(delay).await;
    }
    if token.is_cancelled() {
      return Err(Error::Cancelled);
    }

    match operation().await {
      Ok(value) => return Ok(value),
      Err(err) if err.is_retryable() && attempt < attempts => {
        tracing::debug!(attempt, error = %err, "retryable failure, backing off");
        last_err = Some(err);
      }
      Err(err) => return Err(err),
    }
  }

  // Unreachable unless max_attempts is 0; the loop always returns the
  // final attempt's error above.
  Err(last_err.unwrap_or(Error::Cancelled))
}
