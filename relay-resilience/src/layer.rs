//! Tower middleware applying breaker and retry to any cloneable service.
//!
//! Each attempt clones the request and drives a fresh clone of the inner
//! service to readiness, so the wrapped service must be `Clone` and the
//! request type must be `Clone`.
//!
//! # Example
//!
//! ```no_run
//! use relay_resilience::layer::ResilienceLayer;
//! use relay_resilience::retry::RetryPolicy;
//! use std::time::Duration;
//! use tower::{Layer, ServiceExt};
//!
//! # async fn example() {
//! let layer = ResilienceLayer::on_errors(RetryPolicy::default(), None)
//!     .with_call_timeout(Duration::from_secs(5));
//! let service = layer.layer(tower::service_fn(|n: u32| async move {
//!     Ok::<_, std::io::Error>(n * 2)
//! }));
//! let doubled = service.oneshot(21).await;
//! # }
//! ```

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower::{Layer, Service, ServiceExt};

use crate::breaker::CircuitBreaker;
use crate::call::ResilientCall;
use crate::classify::{FailOnError, OutcomeClassifier, RetryOnError};
use crate::context::CallContext;
use crate::error::ResilienceError;
use crate::retry::{RetryExecutor, RetryPolicy};

/// Layer that applies a [`ResilientCall`] to every request.
pub struct ResilienceLayer<R, F> {
    call: Arc<ResilientCall<R, F>>,
    call_timeout: Option<Duration>,
}

impl<R, F> ResilienceLayer<R, F> {
    pub fn new(call: ResilientCall<R, F>) -> Self {
        Self {
            call: Arc::new(call),
            call_timeout: None,
        }
    }

    /// Bound each logical call, retries included.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

impl ResilienceLayer<RetryOnError, FailOnError> {
    /// Retry on, and count against the breaker, every service error.
    pub fn on_errors(retry_policy: RetryPolicy, breaker: Option<CircuitBreaker>) -> Self {
        Self::new(ResilientCall::new(
            breaker,
            RetryExecutor::new(retry_policy, RetryOnError),
            FailOnError,
        ))
    }
}

impl<R, F> Clone for ResilienceLayer<R, F> {
    fn clone(&self) -> Self {
        Self {
            call: self.call.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<R, F> fmt::Debug for ResilienceLayer<R, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceLayer")
            .field("breaker", &self.call.breaker().map(|b| b.name()))
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl<S, R, F> Layer<S> for ResilienceLayer<R, F> {
    type Service = ResilienceService<S, R, F>;

    fn layer(&self, inner: S) -> Self::Service {
        ResilienceService {
            inner,
            call: self.call.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

/// Tower service produced by [`ResilienceLayer`]
pub struct ResilienceService<S, R, F> {
    inner: S,
    call: Arc<ResilientCall<R, F>>,
    call_timeout: Option<Duration>,
}

impl<S: Clone, R, F> Clone for ResilienceService<S, R, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            call: self.call.clone(),
            call_timeout: self.call_timeout,
        }
    }
}

impl<S: fmt::Debug, R, F> fmt::Debug for ResilienceService<S, R, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceService")
            .field("inner", &self.inner)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl<S, R, F, Request> Service<Request> for ResilienceService<S, R, F>
where
    S: Service<Request> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Response: Send + 'static,
    S::Error: Send + 'static,
    Request: Clone + Send + 'static,
    R: OutcomeClassifier<S::Response, S::Error> + 'static,
    F: OutcomeClassifier<S::Response, S::Error> + 'static,
{
    type Response = S::Response;
    type Error = ResilienceError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Readiness is awaited per attempt on a clone of the inner service.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let inner = self.inner.clone();
        let call = self.call.clone();
        let call_timeout = self.call_timeout;

        Box::pin(async move {
            let ctx = match call_timeout {
                Some(timeout) => CallContext::background().with_timeout(timeout),
                None => CallContext::background(),
            };
            call.execute(&ctx, move || inner.clone().oneshot(request.clone()))
                .await
        })
    }
}
