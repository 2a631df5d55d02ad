//! Resilience patterns for send operations.
//!
//! Retry with exponential backoff and jitter, and token-bucket rate limiting.

mod rate_limiter;

pub use rate_limiter::RateLimiter;

use std::future::Future;
use std::time::Duration;
use rand::Rng;

use crate::config::RetryPolicy;
use crate::context::SendContext;
use crate::errors::{MailError, MailResult};

/// Fraction of the base delay added or removed at random.
pub const JITTER_FRACTION: f64 = 0.25;

/// Retry executor with exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryManager {
    policy: RetryPolicy,
}

impl RetryManager {
    /// Creates a new retry manager. `max_attempts` of zero is treated as one.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: RetryPolicy {
                max_attempts: policy.max_attempts.max(1),
                ..policy
            },
        }
    }

    /// The active policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts.
    ///
    /// Non-retryable errors are returned as-is. Exhaustion returns a
    /// `RETRY_EXHAUSTED` error wrapping the last failure. Cancellation during
    /// backoff returns immediately.
    pub async fn execute_with_retry<F, Fut, T>(
        &self,
        ctx: &SendContext,
        mut operation: F,
        request_id: &str,
    ) -> MailResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = MailResult<T>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 1;

        loop {
            let err = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::info!(request_id, attempt, "Operation succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) => e,
            };

            if !err.is_retryable() {
                tracing::debug!(
                    request_id,
                    attempt,
                    error = %err,
                    "Non-retryable failure"
                );
                return Err(err);
            }

            if attempt >= max_attempts {
                return Err(MailError::retries_exhausted(attempt, err));
            }

            let backoff = self.compute_backoff(attempt);
            tracing::warn!(
                request_id,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying operation after failure"
            );

            ctx.sleep(backoff)
                .await
                .map_err(|interrupted| MailError::from(interrupted).with_request_id(request_id))?;
            attempt += 1;
        }
    }

    /// Delay before attempt `attempt + 1`, without jitter.
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base = self.policy.initial_backoff.as_nanos() as f64 * self.policy.multiplier.powi(exponent);
        let capped = base.min(self.policy.max_backoff.as_nanos() as f64);
        if capped.is_finite() && capped > 0.0 {
            Duration::from_nanos(capped.round() as u64)
        } else {
            Duration::ZERO
        }
    }

    /// Delay before attempt `attempt + 1`: the base backoff plus uniform
    /// jitter within ±25 %.
    pub fn compute_backoff(&self, attempt: u32) -> Duration {
        let base = self.base_backoff(attempt).as_nanos() as f64;
        let jitter = base * JITTER_FRACTION * rand::thread_rng().gen_range(-1.0..=1.0);
        Duration::from_nanos((base + jitter).max(0.0).round() as u64)
    }
}

impl Default for RetryManager {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{codes, ErrorKind};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let retry = RetryManager::new(fast_policy(3));
        let calls = AtomicU32::new(0);

        let out = retry
            .execute_with_retry(
                &SendContext::background(),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, MailError>(5)
                },
                "req",
            )
            .await
            .unwrap();

        assert_eq!(out, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let retry = RetryManager::new(fast_policy(3));
        let calls = AtomicU32::new(0);

        let out = retry
            .execute_with_retry(
                &SendContext::background(),
                || async {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(MailError::timeout(codes::DEADLINE_EXCEEDED, "slow"))
                    } else {
                        Ok("sent")
                    }
                },
                "req",
            )
            .await
            .unwrap();

        assert_eq!(out, "sent");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_single_attempt_still_summarized() {
        let retry = RetryManager::new(fast_policy(1));
        let err = retry
            .execute_with_retry(
                &SendContext::background(),
                || async { Err::<(), _>(MailError::connection(codes::DIAL_FAILED, "down")) },
                "req",
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), codes::RETRY_EXHAUSTED);
        assert_eq!(err.attempts(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            ..fast_policy(5)
        };
        let retry = RetryManager::new(policy);
        let ctx = SendContext::background();
        let calls = AtomicU32::new(0);

        let cancel = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            cancel.cancel();
        });

        let err = retry
            .execute_with_retry(
                &ctx,
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(MailError::connection(codes::DIAL_FAILED, "down"))
                },
                "req",
            )
            .await
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.code(), codes::CONTEXT_CANCELLED);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_base_backoff_growth_and_cap() {
        let retry = RetryManager::new(RetryPolicy {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(350),
            multiplier: 2.0,
        });
        assert_eq!(retry.base_backoff(1), Duration::from_millis(100));
        assert_eq!(retry.base_backoff(2), Duration::from_millis(200));
        assert_eq!(retry.base_backoff(3), Duration::from_millis(350));
        assert_eq!(retry.base_backoff(40), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_within_a_quarter() {
        let retry = RetryManager::new(RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(400),
            max_backoff: Duration::from_secs(10),
            multiplier: 3.0,
        });
        for attempt in 1..=4 {
            let base = retry.base_backoff(attempt).as_secs_f64();
            for _ in 0..200 {
                let delay = retry.compute_backoff(attempt).as_secs_f64();
                assert!(delay >= base * 0.75 - 1e-9 && delay <= base * 1.25 + 1e-9);
            }
        }
    }

    #[tokio::test]
    async fn test_validation_error_runs_once() {
        let retry = RetryManager::new(fast_policy(5));
        let calls = AtomicU32::new(0);

        let err = retry
            .execute_with_retry(
                &SendContext::background(),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(MailError::validation(codes::MISSING_SUBJECT, "no subject"))
                },
                "req",
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.code(), codes::MISSING_SUBJECT);
    }

    #[tokio::test]
    async fn test_connection_error_uses_every_attempt() {
        let retry = RetryManager::new(fast_policy(3));
        let calls = AtomicU32::new(0);

        let err = retry
            .execute_with_retry(
                &SendContext::background(),
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(MailError::connection(codes::DIAL_FAILED, "refused"))
                },
                "req",
            )
            .await
            .unwrap_err();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(err.code(), codes::RETRY_EXHAUSTED);
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.message().contains("3 attempts"));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        let retry = RetryManager::new(RetryPolicy { max_attempts: 0, ..Default::default() });
        assert_eq!(retry.policy().max_attempts, 1);
    }
}
