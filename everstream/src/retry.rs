//! Retry strategy applied around event delivery and position persistence.
//!
//! A [`RetryStrategy`] either rethrows immediately ([`RetryStrategy::none`])
//! or retries with a [`Backoff`] schedule, optionally bounded by a maximum
//! attempt count, widened by random jitter, and gated by an error predicate.
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

/// Delay schedule between retry attempts.
#[derive(Debug, Clone, PartialEq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Wait a fixed duration between attempts.
    Fixed(Duration),
    /// Multiply the delay by `multiplier` after each attempt, capped at `max`.
    Exponential {
        initial: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(duration) => *duration,
            Backoff::Exponential {
                initial,
                max,
                multiplier,
            } => {
                let scaled = initial.as_secs_f64() * multiplier.powi(attempt as i32);
                Duration::from_secs_f64(scaled.min(max.as_secs_f64()))
            }
        }
    }
}

type Predicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// How failures of an action are retried.
#[derive(Clone)]
pub enum RetryStrategy {
    DontRetry,
    Retry(Retry),
}

/// Retry settings; build through the [`RetryStrategy`] constructors.
#[derive(Clone)]
pub struct Retry {
    backoff: Backoff,
    max_attempts: Option<u32>,
    jitter: Option<Duration>,
    predicate: Option<Predicate>,
}

impl RetryStrategy {
    /// Don't retry; the first error is returned as-is.
    pub fn none() -> Self {
        RetryStrategy::DontRetry
    }

    /// Retry with a fixed delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self::backoff(Backoff::Fixed(delay))
    }

    /// Retry with exponential backoff from `initial` up to `max`.
    pub fn exponential(initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self::backoff(Backoff::Exponential {
            initial,
            max,
            multiplier,
        })
    }

    pub fn backoff(backoff: Backoff) -> Self {
        RetryStrategy::Retry(Retry {
            backoff,
            max_attempts: None,
            jitter: None,
            predicate: None,
        })
    }

    /// Caps the total number of attempts, the initial one included.
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        match self {
            RetryStrategy::DontRetry => RetryStrategy::DontRetry,
            RetryStrategy::Retry(retry) => RetryStrategy::Retry(Retry {
                max_attempts: Some(max_attempts),
                ..retry
            }),
        }
    }

    /// Adds a uniformly random extra delay in `[0, jitter]` to each backoff.
    pub fn with_jitter(self, jitter: Duration) -> Self {
        match self {
            RetryStrategy::DontRetry => RetryStrategy::DontRetry,
            RetryStrategy::Retry(retry) => RetryStrategy::Retry(Retry {
                jitter: Some(jitter),
                ..retry
            }),
        }
    }

    /// Only retries errors for which `predicate` returns true.
    pub fn retry_if(
        self,
        predicate: impl Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    ) -> Self {
        match self {
            RetryStrategy::DontRetry => RetryStrategy::DontRetry,
            RetryStrategy::Retry(retry) => RetryStrategy::Retry(Retry {
                predicate: Some(Arc::new(predicate)),
                ..retry
            }),
        }
    }

    /// Runs `op`, retrying failures according to the strategy.
    ///
    /// `keep_retrying` is consulted before every retry; returning false stops
    /// retrying so that a shutdown in progress is observed promptly. The
    /// terminal error is returned unchanged.
    pub async fn execute<T, E, F, Fut>(
        &self,
        keep_retrying: impl Fn() -> bool,
        mut op: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: StdError + Send + Sync + 'static,
    {
        let retry = match self {
            RetryStrategy::DontRetry => return op().await,
            RetryStrategy::Retry(retry) => retry,
        };
        let mut failures: u32 = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    failures += 1;
                    let exhausted = retry
                        .max_attempts
                        .is_some_and(|max_attempts| failures >= max_attempts);
                    let retryable = retry
                        .predicate
                        .as_ref()
                        .map_or(true, |predicate| predicate(&error));
                    if exhausted || !retryable || !keep_retrying() {
                        return Err(error);
                    }
                    let mut delay = retry.backoff.delay(failures - 1);
                    if let Some(jitter) = retry.jitter {
                        delay += jitter.mul_f64(rand::thread_rng().gen::<f64>());
                    }
                    tracing::debug!(
                        attempt = failures,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying failed action"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

impl fmt::Debug for RetryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryStrategy::DontRetry => f.write_str("DontRetry"),
            RetryStrategy::Retry(retry) => f
                .debug_struct("Retry")
                .field("backoff", &retry.backoff)
                .field("max_attempts", &retry.max_attempts)
                .field("jitter", &retry.jitter)
                .field("predicate", &retry.predicate.as_ref().map(|_| ".."))
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, thiserror::Error)]
    #[error("boom {0}")]
    struct Boom(u32);

    #[test]
    fn exponential_backoff_caps_at_max() {
        let backoff = Backoff::Exponential {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(2),
            multiplier: 2.0,
        };
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(10), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn it_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, Boom> = RetryStrategy::fixed(Duration::from_millis(10))
            .execute(
                || true,
                || {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if attempt < 2 {
                            Err(Boom(attempt))
                        } else {
                            Ok(attempt)
                        }
                    }
                },
            )
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn it_stops_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Boom> = RetryStrategy::fixed(Duration::from_millis(10))
            .with_max_attempts(3)
            .execute(
                || true,
                || {
                    let attempt = calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(Boom(attempt)) }
                },
            )
            .await;
        assert_eq!(result.unwrap_err().0, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn dont_retry_returns_the_first_error() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Boom> = RetryStrategy::none()
            .execute(
                || true,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(Boom(0)) }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn predicate_rejection_stops_retrying() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Boom> = RetryStrategy::fixed(Duration::from_millis(1))
            .retry_if(|_| false)
            .execute(
                || true,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(Boom(0)) }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_observed_between_attempts_stops_retrying() {
        let calls = AtomicU32::new(0);
        let result: Result<(), Boom> = RetryStrategy::fixed(Duration::from_millis(1))
            .execute(
                || false,
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(Boom(0)) }
                },
            )
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
