//! Resilient outbound gRPC calls on top of tonic.
//!
//! Unary calls are retried on transient status codes with the request
//! metadata and message replayed on every attempt. Streaming calls go through
//! the breaker once, at establishment, and are never retried.

use relay_core::DependencyPolicy;
use std::future::Future;
use tokio::time::Instant;
use tonic::metadata::MetadataValue;
use tonic::{Request, Response, Status};

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::call::ResilientCall;
use crate::classify::{GrpcFailureClassifier, GrpcRetryClassifier, OutcomeClassifier};
use crate::context::{CallContext, CancelReason};
use crate::error::ResilienceError;
use crate::retry::{RetryExecutor, RetryPolicy};

/// Metadata key set on statuses produced by an open breaker.
pub const CIRCUIT_BREAKER_METADATA: &str = "x-circuit-breaker";

/// Metadata key carrying the remaining cool-down in milliseconds.
pub const RETRY_AFTER_MS_METADATA: &str = "x-retry-after-ms";

#[derive(Debug, Clone)]
pub struct GrpcResilience {
    call: ResilientCall<GrpcRetryClassifier, GrpcFailureClassifier>,
}

impl GrpcResilience {
    pub fn new(retry_policy: RetryPolicy, breaker: Option<CircuitBreaker>) -> Self {
        Self {
            call: ResilientCall::new(
                breaker,
                RetryExecutor::new(retry_policy, GrpcRetryClassifier),
                GrpcFailureClassifier,
            ),
        }
    }

    pub fn from_policy(dependency: &str, policy: &DependencyPolicy) -> Self {
        let breaker = policy.breaker.enabled.then(|| {
            CircuitBreaker::new(dependency, CircuitBreakerConfig::from(&policy.breaker))
        });
        Self::new(RetryPolicy::from(&policy.retry), breaker)
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.call.breaker()
    }

    /// Run a unary call. `invoke` receives a fresh request per attempt carrying
    /// the original metadata and a clone of the message. The request's
    /// extensions are not cloneable in general, so only the first attempt
    /// carries them. When `ctx` has a deadline, each attempt advertises the
    /// remaining time as `grpc-timeout`.
    pub async fn unary<Req, Resp, I, Fut>(
        &self,
        ctx: &CallContext,
        request: Request<Req>,
        mut invoke: I,
    ) -> Result<Response<Resp>, ResilienceError<Status>>
    where
        Req: Clone,
        I: FnMut(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<Resp>, Status>>,
    {
        let (metadata, extensions, message) = request.into_parts();
        let mut extensions = Some(extensions);
        let deadline = ctx.deadline();

        self.call
            .execute(ctx, || {
                let mut attempt = Request::from_parts(
                    metadata.clone(),
                    extensions.take().unwrap_or_default(),
                    message.clone(),
                );
                if let Some(deadline) = deadline {
                    attempt.set_timeout(deadline.saturating_duration_since(Instant::now()));
                }
                invoke(attempt)
            })
            .await
    }

    /// Open a streaming call.
    ///
    /// The breaker is checked once and only the establishment outcome is
    /// recorded. Errors that arrive on the stream after it is established are
    /// not seen by the breaker, so a dependency that accepts streams and then
    /// fails them mid-flight never trips it. Streams are not retried.
    pub async fn open_stream<Req, S, I, Fut>(
        &self,
        ctx: &CallContext,
        request: Request<Req>,
        establish: I,
    ) -> Result<Response<S>, ResilienceError<Status>>
    where
        I: FnOnce(Request<Req>) -> Fut,
        Fut: Future<Output = Result<Response<S>, Status>>,
    {
        let permit = match self.call.breaker() {
            Some(breaker) => Some(breaker.try_acquire()?),
            None => None,
        };
        ctx.check()?;

        let outcome = tokio::select! {
            biased;
            reason = ctx.cancelled() => return Err(ResilienceError::Cancelled(reason)),
            outcome = establish(request) => outcome,
        };

        if let Some(permit) = permit {
            permit.record(!GrpcFailureClassifier.classify(&outcome));
        }

        outcome.map_err(|source| ResilienceError::NonRetryable {
            attempts: 1,
            source,
        })
    }
}

impl From<ResilienceError<Status>> for Status {
    fn from(err: ResilienceError<Status>) -> Self {
        match err {
            ResilienceError::BreakerOpen { name, retry_after } => {
                let mut status =
                    Status::unavailable(format!("circuit breaker open for {}", name));
                let metadata = status.metadata_mut();
                metadata.insert(CIRCUIT_BREAKER_METADATA, MetadataValue::from_static("open"));
                if let Some(retry_after) = retry_after {
                    let millis = retry_after.as_millis() as u64;
                    metadata.insert(RETRY_AFTER_MS_METADATA, MetadataValue::from(millis));
                }
                status
            }
            ResilienceError::Exhausted { source, .. }
            | ResilienceError::NonRetryable { source, .. } => source,
            ResilienceError::Cancelled(CancelReason::Cancelled) => {
                Status::cancelled("call cancelled")
            }
            ResilienceError::Cancelled(CancelReason::DeadlineExceeded) => {
                Status::deadline_exceeded("deadline exceeded")
            }
        }
    }
}
