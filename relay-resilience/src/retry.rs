//! Retry with exponential backoff and jitter.
//!
//! The delay before retry `k` (counting from 1) is
//! `min(max_delay, base_delay * multiplier^(k-1))`, perturbed uniformly by up
//! to `jitter_factor` of itself in either direction. Whether an outcome is
//! worth retrying is decided by the executor's [`OutcomeClassifier`], not by
//! the policy.
//!
//! # Example
//!
//! ```no_run
//! use relay_resilience::classify::RetryOnError;
//! use relay_resilience::context::CallContext;
//! use relay_resilience::retry::{RetryExecutor, RetryPolicy};
//!
//! # async fn example() {
//! let executor = RetryExecutor::new(RetryPolicy::default(), RetryOnError);
//! let result = executor
//!     .execute(&CallContext::background(), || async { Ok::<_, std::io::Error>(42) })
//!     .await;
//! # }
//! ```

use relay_core::RetrySettings;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::classify::OutcomeClassifier;
use crate::context::{CallContext, CancelReason};
use crate::error::ResilienceError;

pub const DEFAULT_MAX_RETRIES: i32 = 3;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;
pub const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Backoff parameters. Immutable once handed to an executor.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt; negative means none.
    pub max_retries: i32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
    /// Fraction of the delay used as the jitter range, in `[0, 1]`.
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

impl RetryPolicy {
    /// Policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Default::default()
        }
    }

    /// Clamp every field into its valid range.
    pub fn normalized(self) -> Self {
        let base_delay = if self.base_delay.is_zero() {
            DEFAULT_BASE_DELAY
        } else {
            self.base_delay
        };
        let max_delay = if self.max_delay.is_zero() {
            DEFAULT_MAX_DELAY
        } else {
            self.max_delay
        };

        Self {
            max_retries: self.max_retries.max(0),
            base_delay,
            max_delay: max_delay.max(base_delay),
            multiplier: if self.multiplier.is_finite() && self.multiplier >= 1.0 {
                self.multiplier
            } else {
                DEFAULT_MULTIPLIER
            },
            jitter_factor: if self.jitter_factor.is_nan() {
                DEFAULT_JITTER_FACTOR
            } else {
                self.jitter_factor.clamp(0.0, 1.0)
            },
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(0) as u32 + 1
    }

    /// Delay before retry `retry` (1-based) without jitter.
    pub fn base_backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()).max(0.0))
    }

    /// Delay before retry `retry` (1-based) with jitter applied.
    pub fn backoff(&self, retry: u32) -> Duration {
        let delay = self.base_backoff(retry).as_secs_f64();
        if self.jitter_factor <= 0.0 {
            return Duration::from_secs_f64(delay);
        }

        let spread = delay * self.jitter_factor;
        let offset = (rand::random::<f64>() * 2.0 - 1.0) * spread;
        Duration::from_secs_f64((delay + offset).max(0.0))
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_retries: settings.max_retries,
            base_delay: settings.base_delay(),
            max_delay: settings.max_delay(),
            multiplier: settings.multiplier,
            jitter_factor: settings.jitter_factor,
        }
        .normalized()
    }
}

/// How a retry loop ended.
#[derive(Debug)]
pub enum Completion<T, E> {
    /// The last attempt's outcome. `retryable` is the predicate's verdict on
    /// it, so `true` means the retry budget ran out.
    Finished {
        outcome: Result<T, E>,
        attempts: u32,
        retryable: bool,
    },
    Cancelled(CancelReason),
}

impl<T, E> Completion<T, E> {
    pub fn into_result(self) -> Result<T, ResilienceError<E>> {
        match self {
            Completion::Finished {
                outcome: Ok(value),
                ..
            } => Ok(value),
            Completion::Finished {
                outcome: Err(source),
                attempts,
                retryable: true,
            } => Err(ResilienceError::Exhausted { attempts, source }),
            Completion::Finished {
                outcome: Err(source),
                attempts,
                retryable: false,
            } => Err(ResilienceError::NonRetryable { attempts, source }),
            Completion::Cancelled(reason) => Err(ResilienceError::Cancelled(reason)),
        }
    }
}

/// Runs an operation under a [`RetryPolicy`], asking `predicate` after every
/// attempt whether to try again.
#[derive(Debug, Clone)]
pub struct RetryExecutor<P> {
    policy: RetryPolicy,
    predicate: P,
}

impl<P> RetryExecutor<P> {
    pub fn new(policy: RetryPolicy, predicate: P) -> Self {
        Self {
            policy: policy.normalized(),
            predicate,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until the predicate declines, the budget runs out or `ctx` is
    /// cancelled. Cancellation drops the in-flight attempt.
    pub async fn run<T, E, F, Fut>(&self, ctx: &CallContext, mut op: F) -> Completion<T, E>
    where
        P: OutcomeClassifier<T, E>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.policy.max_attempts();
        let mut attempt = 0;

        loop {
            if let Err(reason) = ctx.check() {
                return Completion::Cancelled(reason);
            }

            attempt += 1;
            let outcome = tokio::select! {
                biased;
                reason = ctx.cancelled() => return Completion::Cancelled(reason),
                outcome = op() => outcome,
            };

            let retryable = self.predicate.classify(&outcome);
            if !retryable || attempt >= max_attempts {
                if retryable && max_attempts > 1 {
                    warn!(attempts = attempt, "Retry budget exhausted");
                } else if attempt > 1 {
                    debug!(attempts = attempt, "Operation settled after retries");
                }
                return Completion::Finished {
                    outcome,
                    attempts: attempt,
                    retryable,
                };
            }
            drop(outcome);

            let delay = self.policy.backoff(attempt);
            debug!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Retrying after backoff"
            );

            tokio::select! {
                biased;
                reason = ctx.cancelled() => return Completion::Cancelled(reason),
                _ = sleep(delay) => {}
            }
        }
    }

    pub async fn execute<T, E, F, Fut>(
        &self,
        ctx: &CallContext,
        op: F,
    ) -> Result<T, ResilienceError<E>>
    where
        P: OutcomeClassifier<T, E>,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run(ctx, op).await.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::RetryOnError;
    use proptest::prelude::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn fast(max_retries: i32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            jitter_factor: 0.0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let executor = RetryExecutor::new(fast(3), RetryOnError);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let completion = executor
            .run(&CallContext::background(), || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 3 {
                        Err("transient")
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert!(matches!(
            completion,
            Completion::Finished {
                outcome: Ok(3),
                attempts: 3,
                retryable: false
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_negative_retries_make_one_attempt() {
        let executor = RetryExecutor::new(fast(-3), RetryOnError);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = executor
            .execute(&CallContext::background(), || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("down") }
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Exhausted {
                attempts: 1,
                source: "down"
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let predicate = |outcome: &Result<(), &str>| matches!(outcome, Err("transient"));
        let executor = RetryExecutor::new(fast(5), predicate);
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result = executor
            .execute(&CallContext::background(), || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("invalid") }
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::NonRetryable { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausted_returns_last_ok_outcome() {
        let predicate = |outcome: &Result<u16, ()>| matches!(outcome, Ok(503));
        let executor = RetryExecutor::new(fast(2), predicate);

        let completion = executor
            .run(&CallContext::background(), || async { Ok::<u16, ()>(503) })
            .await;

        assert!(matches!(
            completion,
            Completion::Finished {
                outcome: Ok(503),
                attempts: 3,
                retryable: true
            }
        ));
    }

    #[tokio::test]
    async fn test_cancel_during_backoff() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(10),
            ..Default::default()
        };
        let executor = RetryExecutor::new(policy, RetryOnError);
        let ctx = CallContext::background();
        let calls = Arc::new(AtomicU32::new(0));

        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let counter = calls.clone();
        let result = executor
            .execute(&ctx, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("down") }
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Cancelled(CancelReason::Cancelled))
        ));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_deadline_interrupts_attempt() {
        let executor = RetryExecutor::new(fast(3), RetryOnError);
        let ctx = CallContext::background().with_timeout(Duration::from_millis(30));

        let result = executor
            .execute(&ctx, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Ok::<_, ()>(())
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Cancelled(CancelReason::DeadlineExceeded))
        ));
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let executor = RetryExecutor::new(fast(3), RetryOnError);
        let ctx = CallContext::background();
        ctx.cancel();

        let calls = AtomicU32::new(0);
        let completion = executor
            .run(&ctx, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ()>(()) }
            })
            .await;

        assert!(matches!(
            completion,
            Completion::Cancelled(CancelReason::Cancelled)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_base_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            jitter_factor: 0.0,
            ..Default::default()
        };

        assert_eq!(policy.base_backoff(1), Duration::from_millis(100));
        assert_eq!(policy.base_backoff(2), Duration::from_millis(200));
        assert_eq!(policy.base_backoff(3), Duration::from_millis(400));
        assert_eq!(policy.base_backoff(7), Duration::from_secs(5));
        assert_eq!(policy.base_backoff(u32::MAX), Duration::from_secs(5));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
    }

    #[test]
    fn test_backoff_on_unnormalized_policy_never_negative() {
        let policy = RetryPolicy {
            multiplier: -2.0,
            ..Default::default()
        };
        assert_eq!(policy.base_backoff(2), Duration::ZERO);
        assert_eq!(policy.backoff(2), Duration::ZERO);

        let policy = RetryPolicy {
            multiplier: f64::NAN,
            jitter_factor: f64::NAN,
            ..Default::default()
        };
        assert!(policy.backoff(3) <= policy.max_delay);
    }

    #[test]
    fn test_normalization() {
        let policy = RetryPolicy {
            max_retries: -1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            multiplier: f64::NAN,
            jitter_factor: 4.0,
        }
        .normalized();

        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.base_delay, DEFAULT_BASE_DELAY);
        assert_eq!(policy.max_delay, DEFAULT_MAX_DELAY);
        assert_eq!(policy.multiplier, DEFAULT_MULTIPLIER);
        assert_eq!(policy.jitter_factor, 1.0);
    }

    #[test]
    fn test_max_delay_raised_to_base() {
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        }
        .normalized();

        assert_eq!(policy.max_delay, Duration::from_secs(2));
    }

    #[test]
    fn test_from_settings() {
        let settings = RetrySettings {
            max_retries: 5,
            base_delay_ms: 20,
            max_delay_ms: 400,
            multiplier: 3.0,
            jitter_factor: 0.0,
        };
        let policy = RetryPolicy::from(&settings);

        assert_eq!(policy.max_attempts(), 6);
        assert_eq!(policy.base_backoff(2), Duration::from_millis(60));
    }

    proptest! {
        #[test]
        fn prop_backoff_within_jitter_bounds(
            retry in 1u32..40,
            base_ms in 1u64..1_000,
            extra_ms in 0u64..10_000,
            jitter in 0.0f64..=1.0,
        ) {
            let policy = RetryPolicy {
                max_retries: 10,
                base_delay: Duration::from_millis(base_ms),
                max_delay: Duration::from_millis(base_ms + extra_ms),
                multiplier: 2.0,
                jitter_factor: jitter,
            };

            let nominal = policy.base_backoff(retry).as_secs_f64();
            let actual = policy.backoff(retry).as_secs_f64();

            prop_assert!(nominal <= policy.max_delay.as_secs_f64() + 1e-9);
            prop_assert!(actual >= nominal * (1.0 - jitter) - 1e-6);
            prop_assert!(actual <= nominal * (1.0 + jitter) + 1e-6);
        }
    }
}
