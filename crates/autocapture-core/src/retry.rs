//! Retry with exponential backoff.
//!
//! Every component in this crate is blocking, so retries sleep the calling
//! thread. Callers decide which errors are worth another attempt through the
//! `should_retry` predicate; anything else returns immediately.
//!
//! ```rust,ignore
//! use autocapture_core::retry::{RetryPolicy, with_retry};
//!
//! let value = with_retry(&RetryPolicy::snapshot_read(), |e: &MyError| e.is_transient(), || {
//!     open_something()
//! })?;
//! ```

use std::fmt::Display;
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::{debug, warn};

/// Configuration for retry behavior with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial delay before first retry (default: 100ms).
    pub initial_delay: Duration,
    /// Maximum delay between retries (default: 5s).
    pub max_delay: Duration,
    /// Multiplier applied to delay after each retry (default: 2.0).
    pub backoff_factor: f64,
    /// Random jitter range as a fraction (default: 0.1 = ±10%).
    pub jitter_percent: f64,
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    #[must_use]
    pub fn new(
        initial_delay: Duration,
        max_delay: Duration,
        backoff_factor: f64,
        jitter_percent: f64,
        max_attempts: u32,
    ) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor: backoff_factor.max(1.0),
            jitter_percent: jitter_percent.clamp(0.0, 1.0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Opening a live database for reading: 4 attempts, 200ms initial.
    #[must_use]
    pub fn snapshot_read() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(3),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: 4,
        }
    }

    /// Acquiring the instance lock for handoff ingest: 5 attempts, 500ms initial.
    #[must_use]
    pub fn instance_lock() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            backoff_factor: 2.0,
            jitter_percent: 0.1,
            max_attempts: 5,
        }
    }

    /// No waiting between attempts. Used in tests.
    #[must_use]
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
            jitter_percent: 0.0,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    #[allow(clippy::cast_possible_wrap)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let initial_ms = u64::try_from(self.initial_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);

        // Cap exponent to prevent overflow in powi
        let exp = attempt.min(31) as i32;
        let base_ms = (initial_ms as f64) * self.backoff_factor.powi(exp);
        let base_ms = base_ms.min(max_ms as f64);

        let jitter = if self.jitter_percent > 0.0 && base_ms > 0.0 {
            let mut rng = rand::rng();
            let jitter_range = base_ms * self.jitter_percent;
            rng.random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        let delay_ms = (base_ms + jitter).max(0.0);
        Duration::from_millis(delay_ms as u64)
    }
}

/// Outcome of a retry operation.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
    pub elapsed: Duration,
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// the policy's attempts are exhausted.
pub fn with_retry<T, E, P, F>(policy: &RetryPolicy, should_retry: P, operation: F) -> Result<T, E>
where
    E: Display,
    P: Fn(&E) -> bool,
    F: FnMut() -> Result<T, E>,
{
    with_retry_outcome(policy, should_retry, operation).result
}

/// Like [`with_retry`], also reporting attempts and elapsed time.
pub fn with_retry_outcome<T, E, P, F>(
    policy: &RetryPolicy,
    should_retry: P,
    mut operation: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    P: Fn(&E) -> bool,
    F: FnMut() -> Result<T, E>,
{
    let start = Instant::now();
    let mut attempt = 0u32;

    loop {
        match operation() {
            Ok(value) => {
                if attempt > 0 {
                    debug!(total_attempts = attempt + 1, "Operation succeeded after retries");
                }
                return RetryOutcome {
                    result: Ok(value),
                    attempts: attempt + 1,
                    elapsed: start.elapsed(),
                };
            }
            Err(e) => {
                attempt += 1;
                if !should_retry(&e) {
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }
                if attempt >= policy.max_attempts {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "Operation failed after all retry attempts"
                    );
                    return RetryOutcome {
                        result: Err(e),
                        attempts: attempt,
                        elapsed: start.elapsed(),
                    };
                }

                let delay = policy.delay_for_attempt(attempt - 1);
                debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying operation after failure"
                );
                std::thread::sleep(delay);
            }
        }
    }
}
