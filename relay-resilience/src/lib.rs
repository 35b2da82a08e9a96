//! Resilience layer for outbound inter-service calls.
//!
//! Every outbound HTTP or gRPC call from a control-plane service goes through
//! a per-dependency [`CircuitBreaker`] and a [`RetryExecutor`]:
//!
//! - **Classification**: retry and breaker verdicts are two independent
//!   predicates ([`classify`])
//! - **Circuit breaker**: Closed/Open/HalfOpen with bounded half-open probes
//!   and stale-result protection ([`breaker`])
//! - **Retry**: exponential backoff with jitter, cancellable through a
//!   [`CallContext`] ([`retry`], [`context`])
//! - **Adapters**: reqwest ([`http`]), tonic ([`grpc`]) and tower ([`layer`])
//! - **Observability**: state-change observers and metrics ([`observer`]),
//!   a breaker pool for health snapshots ([`registry`]), subscriber setup
//!   ([`telemetry`])
//!
//! # Example
//!
//! ```no_run
//! use relay_core::ResilienceConfig;
//! use relay_resilience::{BreakerRegistry, CallContext, MetricsObserver};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = BreakerRegistry::new(ResilienceConfig::load(None)?)
//!     .with_observer(MetricsObserver);
//! let billing = registry.http_client(reqwest::Client::new(), "billing");
//!
//! let ctx = CallContext::background().with_timeout(Duration::from_secs(10));
//! let response = billing
//!     .send(&ctx, billing.client().get("http://billing.internal/v1/health"))
//!     .await?;
//! println!("billing answered {}", response.status());
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod call;
pub mod classify;
pub mod context;
pub mod error;
pub mod grpc;
pub mod http;
pub mod layer;
pub mod observer;
pub mod registry;
pub mod retry;
pub mod telemetry;

// Re-export commonly used types
pub use breaker::{
    BreakerOpen, BreakerSnapshot, CallPermit, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerStats, CircuitState, TripPolicy,
};
pub use call::ResilientCall;
pub use classify::{
    grpc_code_is_failure, grpc_code_is_retryable, http_status_is_failure,
    http_status_is_retryable, FailOnError, GrpcFailureClassifier, GrpcRetryClassifier,
    HttpFailureClassifier, HttpRetryClassifier, Never, OutcomeClassifier, RetryOnError,
};
pub use context::{CallContext, CancelReason};
pub use error::ResilienceError;
pub use grpc::GrpcResilience;
pub use http::{CapturedRequest, ResilientHttpClient};
pub use layer::{ResilienceLayer, ResilienceService};
pub use observer::{MetricsObserver, StateChangeObserver};
pub use registry::BreakerRegistry;
pub use retry::{Completion, RetryExecutor, RetryPolicy};
pub use telemetry::init_tracing;
