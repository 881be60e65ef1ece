//! Generic bounded retry with full-jitter exponential backoff.
//!
//! The executor is generic over the operation's error type: the caller
//! supplies a predicate that decides which error values are transient.
//! Everything else propagates immediately. A wall-clock deadline bounds
//! the total time spent; each planned sleep is clamped to the remaining
//! budget so the last attempt happens just before the deadline rather
//! than after it.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

/// Bounds for one retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts including the first; `None` means unbounded.
    pub max_attempts: Option<u32>,
    /// Wall-clock budget for all attempts; `None` means unbounded.
    pub deadline: Option<Duration>,
    /// Backoff base: the jitter cap before the first retry.
    pub base_delay: Duration,
    /// Upper bound on any single sleep.
    pub max_delay_per_attempt: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: Some(5),
            deadline: Some(Duration::from_secs(30)),
            base_delay: Duration::from_millis(250),
            max_delay_per_attempt: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Check the policy bounds. Called before the first attempt so a
    /// misconfigured policy never issues a request.
    pub fn validate(&self) -> Result<(), String> {
        if let Some(max) = self.max_attempts {
            if max == 0 {
                return Err("max_attempts must be greater than 0".to_string());
            }
        }
        if self.base_delay.is_zero() {
            return Err("base_delay must be greater than 0".to_string());
        }
        if self.max_delay_per_attempt.is_zero() {
            return Err("max_delay_per_attempt must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Why a retried operation ultimately failed.
#[derive(Debug, thiserror::Error)]
pub enum RetryError<E> {
    /// The policy itself was invalid; no attempt was made.
    #[error("invalid retry policy: {0}")]
    InvalidPolicy(String),

    /// Attempts or deadline were exhausted (or the error was not
    /// transient); carries the last operation error.
    #[error(transparent)]
    Operation(E),
}

/// Full-jitter backoff delay for a 1-based attempt number.
///
/// `min(base * 2^(attempt-1), cap) * ratio` with `ratio` clamped to
/// `[0, 1]`.
pub fn backoff_delay(attempt: u32, base: Duration, cap: Duration, ratio: f64) -> Duration {
    let exponential = base.as_secs_f64() * 2f64.powi(attempt.saturating_sub(1).min(63) as i32);
    let capped = exponential.min(cap.as_secs_f64());
    Duration::from_secs_f64(capped * ratio.clamp(0.0, 1.0))
}

/// Retry `operation` under `policy`, treating errors for which
/// `is_transient` returns `true` as retryable.
pub async fn retry<T, E, Op, Fut>(
    policy: &RetryPolicy,
    is_transient: impl Fn(&E) -> bool,
    operation: Op,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_with_jitter(policy, is_transient, operation, || rand::random::<f64>()).await
}

/// [`retry`] with an injectable jitter source, for deterministic tests.
pub async fn retry_with_jitter<T, E, Op, Fut, J>(
    policy: &RetryPolicy,
    is_transient: impl Fn(&E) -> bool,
    mut operation: Op,
    mut jitter: J,
) -> Result<T, RetryError<E>>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    J: FnMut() -> f64,
{
    policy.validate().map_err(RetryError::InvalidPolicy)?;

    let deadline = policy.deadline.map(|budget| Instant::now() + budget);
    let mut attempts: u32 = 0;

    loop {
        attempts += 1;
        let error = match operation().await {
            Ok(value) => return Ok(value),
            Err(error) if is_transient(&error) => error,
            Err(error) => return Err(RetryError::Operation(error)),
        };

        if let Some(max) = policy.max_attempts {
            if attempts >= max {
                return Err(RetryError::Operation(error));
            }
        }

        let remaining = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(RetryError::Operation(error));
                }
                Some(deadline - now)
            }
            None => None,
        };

        let mut wait = backoff_delay(
            attempts,
            policy.base_delay,
            policy.max_delay_per_attempt,
            jitter(),
        );
        if let Some(remaining) = remaining {
            wait = wait.min(remaining);
        }

        tracing::debug!(
            attempts,
            wait_ms = wait.as_millis() as u64,
            "Transient failure, backing off before retry",
        );
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Debug, PartialEq)]
    enum TestError {
        Transient(u32),
        Fatal,
    }

    fn transient(error: &TestError) -> bool {
        matches!(error, TestError::Transient(_))
    }

    fn policy(
        max_attempts: Option<u32>,
        deadline_ms: Option<u64>,
        base_ms: u64,
        cap_ms: u64,
    ) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            deadline: deadline_ms.map(Duration::from_millis),
            base_delay: Duration::from_millis(base_ms),
            max_delay_per_attempt: Duration::from_millis(cap_ms),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(4);
        assert_eq!(backoff_delay(1, base, cap, 1.0), Duration::from_secs(1));
        assert_eq!(backoff_delay(2, base, cap, 1.0), Duration::from_secs(2));
        assert_eq!(backoff_delay(3, base, cap, 1.0), Duration::from_secs(4));
        assert_eq!(backoff_delay(4, base, cap, 1.0), Duration::from_secs(4));
    }

    #[test]
    fn backoff_scales_by_jitter_ratio() {
        let base = Duration::from_secs(2);
        let cap = Duration::from_secs(8);
        assert_eq!(backoff_delay(1, base, cap, 0.5), Duration::from_secs(1));
        assert_eq!(backoff_delay(1, base, cap, 0.0), Duration::ZERO);
        // Out-of-range ratios are clamped.
        assert_eq!(backoff_delay(1, base, cap, 2.0), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failures() {
        let calls = Cell::new(0u32);
        let result = retry_with_jitter(
            &policy(Some(4), None, 1000, 4000),
            transient,
            || {
                let attempt = calls.get() + 1;
                calls.set(attempt);
                async move {
                    if attempt < 4 {
                        Err(TestError::Transient(attempt))
                    } else {
                        Ok("ok")
                    }
                }
            },
            || 1.0,
        )
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(calls.get(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_at_max_attempts_counting_the_first() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = retry_with_jitter(
            &policy(Some(3), None, 200, 2000),
            transient,
            || {
                calls.set(calls.get() + 1);
                let attempt = calls.get();
                async move { Err(TestError::Transient(attempt)) }
            },
            || 1.0,
        )
        .await;

        assert_eq!(calls.get(), 3);
        match result {
            Err(RetryError::Operation(TestError::Transient(3))) => {}
            other => panic!("expected last transient error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_clamps_the_last_sleep_and_stops() {
        // base 200 ms against a 250 ms budget: sleep 200 ms, then a
        // 50 ms remaining-budget clamp, then the third failure is final.
        let calls = Cell::new(0u32);
        let started = Instant::now();
        let result: Result<(), _> = retry_with_jitter(
            &policy(None, Some(250), 200, 5000),
            transient,
            || {
                calls.set(calls.get() + 1);
                let attempt = calls.get();
                async move { Err(TestError::Transient(attempt)) }
            },
            || 1.0,
        )
        .await;

        assert_eq!(calls.get(), 3);
        assert!(started.elapsed() >= Duration::from_millis(250));
        match result {
            Err(RetryError::Operation(TestError::Transient(3))) => {}
            other => panic!("expected last transient error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_errors_propagate_without_retry() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = retry_with_jitter(
            &policy(Some(5), None, 100, 1000),
            transient,
            || {
                calls.set(calls.get() + 1);
                async { Err(TestError::Fatal) }
            },
            || 1.0,
        )
        .await;

        assert_eq!(calls.get(), 1);
        assert!(matches!(result, Err(RetryError::Operation(TestError::Fatal))));
    }

    #[tokio::test]
    async fn invalid_policy_fails_before_any_attempt() {
        let calls = Cell::new(0u32);
        let result: Result<(), _> = retry_with_jitter(
            &policy(Some(0), None, 100, 1000),
            transient,
            || {
                calls.set(calls.get() + 1);
                async { Err(TestError::Fatal) }
            },
            || 1.0,
        )
        .await;

        assert_eq!(calls.get(), 0);
        assert!(matches!(result, Err(RetryError::InvalidPolicy(_))));
    }

    #[tokio::test]
    async fn zero_base_delay_is_rejected() {
        let result: Result<(), _> = retry_with_jitter(
            &policy(Some(3), None, 0, 1000),
            transient,
            || async { Ok(()) },
            || 1.0,
        )
        .await;
        assert!(matches!(result, Err(RetryError::InvalidPolicy(_))));
    }
}
