//! Retry with exponential backoff and jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::core::task::TaskError;
use crate::resilience::breaker::CircuitBreaker;

/// Default number of attempts, counting the first.
const DEFAULT_ATTEMPT_LIMIT: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(200);

const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(10);

/// Upper bound accepted for `max_delay`.
const MAX_DELAY_CEILING: Duration = Duration::from_secs(24 * 60 * 60);

/// Default jitter ratio (0.1 = up to 10% extra delay)
const DEFAULT_JITTER_RATIO: f64 = 0.1;

/// Backoff and attempt-limit policy wrapping one task's execution.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first. Zero is treated as one.
    pub attempt_limit: u32,
    /// Delay before the second attempt; doubles for each attempt after.
    pub base_delay: Duration,
    /// Cap on the exponential part of the delay.
    pub max_delay: Duration,
    /// Random extra delay as a fraction of the capped delay, in `[0, 1]`.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempt_limit: DEFAULT_ATTEMPT_LIMIT,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            jitter_ratio: DEFAULT_JITTER_RATIO,
        }
    }
}

/// Details of a retry about to be scheduled.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryNotice {
    /// The attempt that just failed (1-based).
    pub attempt: u32,
    pub delay: Duration,
    pub error: TaskError,
}

/// Final result of a retried operation plus the attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub result: Result<T, TaskError>,
    pub attempts: u32,
}

impl RetryPolicy {
    pub fn new(attempt_limit: u32, base_delay: Duration) -> Self {
        Self {
            attempt_limit,
            base_delay,
            ..Default::default()
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Cap the exponential delay; values above one day are clamped to one day.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay.min(MAX_DELAY_CEILING);
        self
    }

    pub fn with_jitter(mut self, jitter_ratio: f64) -> Self {
        self.jitter_ratio = jitter_ratio;
        self
    }

    /// Backoff before retrying after `attempt` failed, without jitter:
    /// `base_delay * 2^(attempt - 1)`, capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Backoff for `attempt` plus random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let ratio = if self.jitter_ratio.is_finite() {
            self.jitter_ratio.clamp(0.0, 1.0)
        } else {
            0.0
        };
        if ratio == 0.0 || backoff.is_zero() {
            return backoff;
        }
        let factor = rand::thread_rng().gen_range(0.0..=ratio);
        let jitter = Duration::try_from_secs_f64(backoff.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX);
        backoff.saturating_add(jitter)
    }

    /// Run `attempt_fn` until it succeeds, fails for good, or attempts run out.
    ///
    /// Each attempt goes through `breaker` when one is given. Transient
    /// errors are retried after [`delay_for`](Self::delay_for); the last one
    /// is surfaced as `RetryExhausted`. Permanent, timeout and circuit-open
    /// errors end the run immediately. Cancelling `cancel` during a backoff
    /// stops retrying and returns the last error.
    pub async fn run<T, F, Fut, R>(
        &self,
        breaker: Option<&CircuitBreaker>,
        cancel: &CancellationToken,
        mut attempt_fn: F,
        mut on_retry: R,
    ) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TaskError>>,
        R: FnMut(&RetryNotice),
    {
        let limit = self.attempt_limit.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match breaker {
                Some(breaker) => breaker.execute(|| attempt_fn(attempt)).await,
                None => attempt_fn(attempt).await,
            };

            let error = match result {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "attempt succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(error) if error.is_retryable() => error,
                Err(error) => {
                    return RetryOutcome {
                        result: Err(error),
                        attempts: attempt,
                    };
                }
            };

            if attempt >= limit {
                tracing::debug!(attempt, %error, "retry attempts exhausted");
                return RetryOutcome {
                    result: Err(TaskError::RetryExhausted {
                        attempts: attempt,
                        last: error.to_string(),
                    }),
                    attempts: attempt,
                };
            }

            let notice = RetryNotice {
                attempt,
                delay: self.delay_for(attempt),
                error,
            };
            tracing::debug!(
                attempt,
                limit,
                delay_ms = notice.delay.as_millis() as u64,
                error = %notice.error,
                "transient failure, retrying"
            );
            on_retry(&notice);

            tokio::select! {
                _ = cancel.cancelled() => {
                    return RetryOutcome {
                        result: Err(notice.error),
                        attempts: attempt,
                    };
                }
                _ = tokio::time::sleep(notice.delay) => {}
            }
        }
    }
}
