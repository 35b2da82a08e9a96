//! Failure classification.
//!
//! Two independent predicate families are used for every protocol:
//!
//! - **Retry** predicates are narrow: only outcomes that a repeat attempt can
//!   plausibly fix (transport errors, 429, 500/502/503/504, transient RPC codes).
//! - **Breaker** predicates are broad: anything that says the dependency itself
//!   is unhealthy (transport errors, any 5xx, server-side RPC codes).
//!
//! Client-side faults (4xx, including 429, and client-side RPC codes) never
//! count against the breaker.

use tonic::{Code, Status};

/// Maps the outcome of an attempt to a yes/no verdict.
///
/// Implemented for any `Fn(&Result<T, E>) -> bool`, so ad hoc predicates can
/// be passed as closures.
pub trait OutcomeClassifier<T, E>: Send + Sync {
    fn classify(&self, outcome: &Result<T, E>) -> bool;
}

impl<T, E, F> OutcomeClassifier<T, E> for F
where
    F: Fn(&Result<T, E>) -> bool + Send + Sync,
{
    fn classify(&self, outcome: &Result<T, E>) -> bool {
        self(outcome)
    }
}

/// Yes for every `Err`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryOnError;

impl<T, E> OutcomeClassifier<T, E> for RetryOnError {
    fn classify(&self, outcome: &Result<T, E>) -> bool {
        outcome.is_err()
    }
}

/// Yes for every `Err`.
#[derive(Debug, Clone, Copy, Default)]
pub struct FailOnError;

impl<T, E> OutcomeClassifier<T, E> for FailOnError {
    fn classify(&self, outcome: &Result<T, E>) -> bool {
        outcome.is_err()
    }
}

/// Always no.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl<T, E> OutcomeClassifier<T, E> for Never {
    fn classify(&self, _outcome: &Result<T, E>) -> bool {
        false
    }
}

// ===== Raw predicates =====

pub fn http_status_is_retryable(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

pub fn http_status_is_failure(status: u16) -> bool {
    (500..=599).contains(&status)
}

pub fn grpc_code_is_retryable(code: Code) -> bool {
    matches!(
        code,
        Code::Unavailable | Code::DeadlineExceeded | Code::ResourceExhausted | Code::Aborted
    )
}

pub fn grpc_code_is_failure(code: Code) -> bool {
    matches!(
        code,
        Code::Internal
            | Code::Unknown
            | Code::Unavailable
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Aborted
    )
}

// ===== HTTP =====

/// Retry predicate for reqwest outcomes.
///
/// Errors raised while building the request never reached the dependency and
/// are not retried.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpRetryClassifier;

impl OutcomeClassifier<reqwest::Response, reqwest::Error> for HttpRetryClassifier {
    fn classify(&self, outcome: &Result<reqwest::Response, reqwest::Error>) -> bool {
        match outcome {
            Ok(response) => http_status_is_retryable(response.status().as_u16()),
            Err(err) => !err.is_builder(),
        }
    }
}

/// Breaker predicate for reqwest outcomes.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpFailureClassifier;

impl OutcomeClassifier<reqwest::Response, reqwest::Error> for HttpFailureClassifier {
    fn classify(&self, outcome: &Result<reqwest::Response, reqwest::Error>) -> bool {
        match outcome {
            Ok(response) => http_status_is_failure(response.status().as_u16()),
            Err(err) => !err.is_builder(),
        }
    }
}

// ===== gRPC =====

#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcRetryClassifier;

impl<T> OutcomeClassifier<T, Status> for GrpcRetryClassifier {
    fn classify(&self, outcome: &Result<T, Status>) -> bool {
        match outcome {
            Ok(_) => false,
            Err(status) => grpc_code_is_retryable(status.code()),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GrpcFailureClassifier;

impl<T> OutcomeClassifier<T, Status> for GrpcFailureClassifier {
    fn classify(&self, outcome: &Result<T, Status>) -> bool {
        match outcome {
            Ok(_) => false,
            Err(status) => grpc_code_is_failure(status.code()),
        }
    }
}
