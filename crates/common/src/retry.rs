//! # Bounded Retry Combinator
//!
//! A single higher-order helper used for every retried call in the node:
//! chain queries, transaction submission, and confirmation polling all go
//! through [`retry`] with their own [`RetryPolicy`].
//!
//! ## Semantics
//!
//! ```text
//! attempt 1 ──Err──▶ sleep(delay) ──▶ attempt 2 ──Err──▶ ... ──▶ attempt N ──Err──▶ return last error
//!     │                                   │                          │
//!     └──Ok──▶ return                     └──Ok──▶ return            └──Ok──▶ return
//! ```
//!
//! - The delay is fixed (no exponential growth).
//! - No sleep happens after the final attempt.
//! - `max_attempts == 0` is treated as one attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::debug;

// ════════════════════════════════════════════════════════════════════════════
// POLICY
// ════════════════════════════════════════════════════════════════════════════

/// Attempt budget and fixed backoff for [`retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_attempts: u32,
    /// Sleep between two consecutive attempts.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with the given attempt count and delay.
    #[must_use]
    pub const fn new(max_attempts: u32, delay: Duration) -> Self {
        Self { max_attempts, delay }
    }

    /// Creates a policy with the delay expressed in milliseconds.
    #[must_use]
    pub const fn from_millis(max_attempts: u32, delay_ms: u64) -> Self {
        Self::new(max_attempts, Duration::from_millis(delay_ms))
    }

    /// Number of attempts actually performed (never zero).
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// COMBINATOR
// ════════════════════════════════════════════════════════════════════════════

/// Runs `op` until it succeeds or the policy's attempt budget is spent.
///
/// Returns the first `Ok` value, or the error of the last attempt.
pub async fn retry<T, E, F, Fut>(policy: RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let attempts = policy.attempts();
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= attempts => return Err(e),
            Err(e) => {
                debug!(attempt, attempts, error = %e, "attempt failed, retrying");
                attempt += 1;
                tokio::time::sleep(policy.delay).await;
            }
        }
    }
}

// ════════════════════════════════════════════════════════════════════════════
// TESTS
// ════════════════════════════════════════════════════════════════════════════
