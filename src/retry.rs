// Bounded retry with exponential backoff.
//
// Enrichment and delivery both retry transient failures a fixed number of
// times and then settle into a terminal failure state. The loop below is the
// only place that sleeps between attempts; callers get a `RetryOutcome` back
// instead of an error so the terminal state is always explicit.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles for each further failure.
    pub base_delay: Duration,
    /// Upper bound for any single delay, including server hints.
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Retries without sleeping. Used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Delay before attempt `failed + 1`, given `failed` failures so far.
    /// A server hint wins over the computed backoff when it is longer.
    pub fn delay_for(&self, failed: u32, hint: Option<Duration>) -> Duration {
        let exponent = failed.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        // +/- 25% so concurrent workers don't retry in lockstep
        let jitter: f64 = rand::rng().random_range(0.75..1.25);
        let jittered = Duration::from_secs_f64(backoff.as_secs_f64() * jitter).min(self.max_delay);

        match hint {
            Some(hint) if hint > jittered => hint.min(self.max_delay),
            _ => jittered,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(2), Duration::from_secs(60))
    }
}

/// How a retried operation ended.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Succeeded { value: T, attempts: u32 },
    Exhausted { error: PipelineError, attempts: u32 },
}

impl<T> RetryOutcome<T> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. } | RetryOutcome::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn into_result(self) -> PipelineResult<T> {
        match self {
            RetryOutcome::Succeeded { value, .. } => Ok(value),
            RetryOutcome::Exhausted { error, .. } => Err(error),
        }
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` is reached. The operation receives the 1-based
/// attempt number so it can record per-attempt state.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    mut operation: F,
) -> RetryOutcome<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = PipelineResult<T>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match operation(attempt).await {
            Ok(value) => {
                return RetryOutcome::Succeeded {
                    value,
                    attempts: attempt,
                }
            }
            Err(error) => {
                if !error.is_retryable() || attempt >= max_attempts {
                    return RetryOutcome::Exhausted {
                        error,
                        attempts: attempt,
                    };
                }

                let delay = policy.delay_for(attempt, error.retry_after());
                warn!(
                    operation = label,
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let outcome = retry_with_backoff(&RetryPolicy::immediate(3), "t", |_| async {
            Ok::<_, PipelineError>(7)
        })
        .await;
        assert_eq!(outcome.attempts(), 1);
        assert_eq!(outcome.into_result().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let outcome = retry_with_backoff(&RetryPolicy::immediate(5), "t", |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PipelineError::transient("503"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(outcome.attempts(), 3);
        assert!(matches!(outcome, RetryOutcome::Succeeded { .. }));
    }

    #[tokio::test]
    async fn test_exhausts_after_max_attempts() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = retry_with_backoff(&RetryPolicy::immediate(4), "t", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::transient("timeout")) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(outcome.attempts(), 4);
        assert!(matches!(outcome, RetryOutcome::Exhausted { .. }));
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = retry_with_backoff(&RetryPolicy::immediate(4), "t", |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PipelineError::PermanentItem("bad".into())) }
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.attempts(), 1);
    }

    #[tokio::test]
    async fn test_attempt_numbers_are_passed_through() {
        let seen = std::sync::Mutex::new(Vec::new());
        let _: RetryOutcome<()> = retry_with_backoff(&RetryPolicy::immediate(3), "t", |attempt| {
            seen.lock().unwrap().push(attempt);
            async { Err(PipelineError::transient("x")) }
        })
        .await;
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_millis(1000));
        let first = policy.delay_for(1, None);
        assert!(first >= Duration::from_millis(75) && first <= Duration::from_millis(125));
        let fourth = policy.delay_for(4, None);
        assert!(fourth >= Duration::from_millis(600));
        assert!(policy.delay_for(12, None) <= Duration::from_millis(1000));
    }

    #[test]
    fn test_server_hint_is_respected_but_capped() {
        let policy = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(5));
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(2))),
            Duration::from_secs(2)
        );
        assert_eq!(
            policy.delay_for(1, Some(Duration::from_secs(60))),
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_zero_attempts_still_runs_once() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let outcome: RetryOutcome<()> = rt.block_on(retry_with_backoff(
            &RetryPolicy::immediate(0),
            "t",
            |_| async { Err(PipelineError::transient("x")) },
        ));
        assert_eq!(outcome.attempts(), 1);
    }
}
