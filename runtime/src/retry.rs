//! Retry with exponential backoff for transient handler failures.
//!
//! Backoff sleeps watch the shutdown signal, so a worker told to stop does not sit out a
//! thirty second delay before exiting.
//!
//! # Example
//!
//! ```rust
//! use sparkle_cqrs_runtime::retry::{RetryPolicy, retry_with_backoff};
//! use sparkle_cqrs_runtime::shutdown;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let (_tx, mut rx) = shutdown::channel();
//! let policy = RetryPolicy::builder()
//!     .max_retries(5)
//!     .initial_delay(Duration::from_millis(100))
//!     .build();
//!
//! let value = retry_with_backoff(&policy, &mut rx, |_attempt| async { Ok::<_, String>(42) })
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use crate::shutdown::sleep_or_cancel;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_retries`: 3 (four calls in total)
/// - `initial_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `multiplier`: 2.0
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first call.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Cap on any single delay.
    pub max_delay: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_retries: None,
            initial_delay: None,
            max_delay: None,
            multiplier: None,
        }
    }

    /// Delay before retry number `retry` (1-based).
    ///
    /// `initial_delay * multiplier^(retry - 1)`, capped at `max_delay`.
    #[must_use]
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_retries: Option<u32>,
    initial_delay: Option<Duration>,
    max_delay: Option<Duration>,
    multiplier: Option<f64>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of retries.
    #[must_use]
    pub const fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set initial delay before first retry.
    #[must_use]
    pub const fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = Some(multiplier);
        self
    }

    /// Build the [`RetryPolicy`], filling unset values from the defaults.
    #[must_use]
    pub fn build(self) -> RetryPolicy {
        let defaults = RetryPolicy::default();
        RetryPolicy {
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            initial_delay: self.initial_delay.unwrap_or(defaults.initial_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            multiplier: self.multiplier.unwrap_or(defaults.multiplier),
        }
    }
}

/// Why a retried operation gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError<E> {
    /// Every attempt failed.
    Exhausted {
        /// Calls made.
        attempts: u32,
        /// Error from the final call.
        last: E,
    },
    /// The error was not retryable.
    Aborted(E),
    /// Shutdown arrived during a backoff sleep.
    Cancelled {
        /// Calls made before cancellation.
        attempts: u32,
    },
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted { attempts, last } => {
                write!(f, "max retries exceeded after {attempts} attempts: {last}")
            }
            Self::Aborted(e) => write!(f, "non-retryable error: {e}"),
            Self::Cancelled { attempts } => write!(f, "cancelled after {attempts} attempts"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Retry `operation` until it succeeds, the policy is exhausted or shutdown arrives.
///
/// `operation` receives the zero-based attempt number.
///
/// # Errors
///
/// Returns [`RetryError::Exhausted`] after `max_retries + 1` failed calls, or
/// [`RetryError::Cancelled`] if shutdown interrupts a backoff.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    retry_with_predicate(policy, shutdown, operation, |_| true).await
}

/// Like [`retry_with_backoff`], but stops at the first error `is_retryable` rejects.
///
/// # Errors
///
/// Also returns [`RetryError::Aborted`] for non-retryable errors.
pub async fn retry_with_predicate<F, Fut, T, E, P>(
    policy: &RetryPolicy,
    shutdown: &mut watch::Receiver<bool>,
    mut operation: F,
    is_retryable: P,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            Ok(value) => {
                if attempt > 0 {
                    tracing::debug!(attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !is_retryable(&err) => {
                tracing::warn!(error = %err, "Error is not retryable, failing immediately");
                return Err(RetryError::Aborted(err));
            }
            Err(err) => {
                if attempt >= policy.max_retries {
                    return Err(RetryError::Exhausted {
                        attempts: attempt + 1,
                        last: err,
                    });
                }

                attempt += 1;
                let delay = policy.delay_for_retry(attempt);
                tracing::debug!(
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %err,
                    "Operation failed, backing off"
                );

                if !sleep_or_cancel(delay, shutdown).await {
                    return Err(RetryError::Cancelled { attempts: attempt });
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::shutdown;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_delays_double_from_initial() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_is_capped() {
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(1))
            .multiplier(10.0)
            .max_delay(Duration::from_secs(2))
            .build();

        assert_eq!(policy.delay_for_retry(5), Duration::from_secs(2));
        assert_eq!(policy.delay_for_retry(u32::MAX), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_transient_failures() {
        let (_tx, mut rx) = shutdown::channel();
        let calls = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff(&RetryPolicy::default(), &mut rx, |attempt| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 2 { Err("transient") } else { Ok(attempt) }
            }
        })
        .await;

        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_makes_one_plus_max_retries_calls() {
        let (_tx, mut rx) = shutdown::channel();
        let calls = Arc::new(AtomicU32::new(0));

        let result = retry_with_backoff(&RetryPolicy::default(), &mut rx, |_| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>("always")
            }
        })
        .await;

        assert_eq!(
            result,
            Err(RetryError::Exhausted {
                attempts: 4,
                last: "always"
            })
        );
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_error_stops_immediately() {
        let (_tx, mut rx) = shutdown::channel();

        let result = retry_with_predicate(
            &RetryPolicy::default(),
            &mut rx,
            |_| async { Err::<(), _>("permanent") },
            |e: &&str| e.contains("transient"),
        )
        .await;

        assert_eq!(result, Err(RetryError::Aborted("permanent")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_backoff() {
        let (tx, mut rx) = shutdown::channel();
        let policy = RetryPolicy::builder()
            .initial_delay(Duration::from_secs(30))
            .build();

        let task = tokio::spawn(async move {
            retry_with_backoff(&policy, &mut rx, |_| async { Err::<(), _>("down") }).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        assert_eq!(task.await.unwrap(), Err(RetryError::Cancelled { attempts: 1 }));
    }
}
