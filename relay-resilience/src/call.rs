//! Breaker plus retry around one logical call.
//!
//! The breaker is consulted once per logical call, not per attempt: retries
//! happen inside a single permit, and the aggregate outcome is classified and
//! recorded exactly once. A cancelled call (or a dropped future) releases its
//! permit without recording anything.

use std::future::Future;

use crate::breaker::CircuitBreaker;
use crate::classify::OutcomeClassifier;
use crate::context::CallContext;
use crate::error::ResilienceError;
use crate::retry::{Completion, RetryExecutor};

#[derive(Debug, Clone)]
pub struct ResilientCall<R, F> {
    breaker: Option<CircuitBreaker>,
    retry: RetryExecutor<R>,
    failure: F,
}

impl<R, F> ResilientCall<R, F> {
    /// `failure` decides which aggregate outcomes count against the breaker.
    pub fn new(breaker: Option<CircuitBreaker>, retry: RetryExecutor<R>, failure: F) -> Self {
        Self {
            breaker,
            retry,
            failure,
        }
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.breaker.as_ref()
    }

    pub fn retry(&self) -> &RetryExecutor<R> {
        &self.retry
    }

    pub async fn execute<T, E, Op, Fut>(
        &self,
        ctx: &CallContext,
        op: Op,
    ) -> Result<T, ResilienceError<E>>
    where
        R: OutcomeClassifier<T, E>,
        F: OutcomeClassifier<T, E>,
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let permit = match &self.breaker {
            Some(breaker) => Some(breaker.try_acquire()?),
            None => None,
        };

        match self.retry.run(ctx, op).await {
            Completion::Cancelled(reason) => {
                drop(permit);
                Err(ResilienceError::Cancelled(reason))
            }
            Completion::Finished {
                outcome,
                attempts,
                retryable,
            } => {
                if let Some(permit) = permit {
                    let failed = self.failure.classify(&outcome);
                    permit.record(!failed);
                }
                Completion::Finished {
                    outcome,
                    attempts,
                    retryable,
                }
                .into_result()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreakerConfig, CircuitState, TripPolicy};
    use crate::classify::{FailOnError, Never, RetryOnError};
    use crate::retry::RetryPolicy;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn breaker(failure_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                trip: TripPolicy::Consecutive { failure_threshold },
                timeout: Duration::from_secs(30),
                ..Default::default()
            },
        )
    }

    fn fast_retry(max_retries: i32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            ..Default::default()
        }
    }

    fn is_server_error(outcome: &Result<u16, ()>) -> bool {
        matches!(outcome, Ok(status) if *status >= 500) || outcome.is_err()
    }

    fn is_retryable_status(outcome: &Result<u16, ()>) -> bool {
        matches!(outcome, Ok(429 | 500 | 502 | 503 | 504)) || outcome.is_err()
    }

    #[tokio::test]
    async fn test_open_breaker_skips_operation() {
        let breaker = breaker(1);
        breaker.record_failure();
        let call = ResilientCall::new(
            Some(breaker),
            RetryExecutor::new(fast_retry(3), RetryOnError),
            FailOnError,
        );
        let calls = AtomicU32::new(0);

        let result = call
            .execute(&CallContext::background(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, ()>(()) }
            })
            .await;

        assert!(result.unwrap_err().is_breaker_open());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_client_errors_never_open_breaker() {
        let call = ResilientCall::new(
            Some(breaker(3)),
            RetryExecutor::new(fast_retry(2), is_retryable_status),
            is_server_error,
        );

        for _ in 0..20 {
            let result = call
                .execute(&CallContext::background(), || async { Ok::<u16, ()>(400) })
                .await;
            assert_eq!(result.unwrap(), 400);
        }

        let breaker = call.breaker().unwrap();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.stats().successes, 20);
    }

    #[tokio::test]
    async fn test_one_breaker_outcome_per_logical_call() {
        let call = ResilientCall::new(
            Some(breaker(2)),
            RetryExecutor::new(fast_retry(3), is_retryable_status),
            is_server_error,
        );
        let calls = AtomicU32::new(0);

        let result = call
            .execute(&CallContext::background(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<u16, ()>(503) }
            })
            .await;

        // The final 503 is handed back verbatim.
        assert_eq!(result.unwrap(), 503);
        assert_eq!(calls.load(Ordering::SeqCst), 4);

        let breaker = call.breaker().unwrap();
        assert_eq!(breaker.stats().failures, 1);
        assert_eq!(breaker.state(), CircuitState::Closed);

        let _ = call
            .execute(&CallContext::background(), || async { Ok::<u16, ()>(503) })
            .await;
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_unretried_call_still_counts_against_breaker() {
        let call = ResilientCall::new(
            Some(breaker(1)),
            RetryExecutor::new(fast_retry(5), Never),
            FailOnError,
        );
        let calls = AtomicU32::new(0);

        let err = call
            .execute(&CallContext::background(), || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>("connection reset") }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ResilienceError::NonRetryable { attempts: 1, .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(call.breaker().unwrap().state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_cancellation_records_nothing() {
        let call = ResilientCall::new(
            Some(breaker(1)),
            RetryExecutor::new(fast_retry(0), RetryOnError),
            FailOnError,
        );
        let ctx = CallContext::background().with_timeout(Duration::from_millis(20));

        let result = call
            .execute(&ctx, || async {
                tokio::time::sleep(Duration::from_secs(10)).await;
                Err::<(), _>("never")
            })
            .await;

        assert!(result.unwrap_err().is_cancelled());
        let breaker = call.breaker().unwrap();
        assert_eq!(breaker.stats().failures, 0);
        assert_eq!(breaker.stats().successes, 0);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_without_breaker() {
        let call = ResilientCall::new(
            None,
            RetryExecutor::new(fast_retry(1), RetryOnError),
            FailOnError,
        );

        let result = call
            .execute(&CallContext::background(), || async { Err::<(), _>("down") })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::Exhausted { attempts: 2, .. })
        ));
    }
}
