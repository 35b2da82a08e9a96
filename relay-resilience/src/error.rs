use std::time::Duration;
use thiserror::Error;

use crate::breaker::BreakerOpen;
use crate::context::CancelReason;

/// Errors surfaced by a resilient call.
///
/// The wrapped error `E` is always the last error produced by the operation,
/// never a synthetic one.
#[derive(Debug, Error)]
pub enum ResilienceError<E> {
    /// The breaker rejected the call; no attempt was made.
    #[error("circuit breaker open for {name}")]
    BreakerOpen {
        name: String,
        retry_after: Option<Duration>,
    },

    /// Every attempt failed with a retryable outcome.
    #[error("retries exhausted after {attempts} attempts: {source}")]
    Exhausted { attempts: u32, source: E },

    /// The retry predicate declined the outcome.
    #[error("non-retryable failure after {attempts} attempts: {source}")]
    NonRetryable { attempts: u32, source: E },

    /// The caller cancelled or the deadline passed.
    #[error("{0}")]
    Cancelled(CancelReason),
}

impl<E> ResilienceError<E> {
    pub fn is_breaker_open(&self) -> bool {
        matches!(self, Self::BreakerOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Attempts made before the error surfaced. `None` for cancellations,
    /// which can interrupt any attempt.
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::BreakerOpen { .. } => Some(0),
            Self::Exhausted { attempts, .. } | Self::NonRetryable { attempts, .. } => {
                Some(*attempts)
            }
            Self::Cancelled(_) => None,
        }
    }

    /// Borrow the operation's error, if one was produced.
    pub fn last_error(&self) -> Option<&E> {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Take the operation's error, if one was produced.
    pub fn into_source(self) -> Option<E> {
        match self {
            Self::Exhausted { source, .. } | Self::NonRetryable { source, .. } => Some(source),
            _ => None,
        }
    }

    pub fn map_source<F, M>(self, f: M) -> ResilienceError<F>
    where
        M: FnOnce(E) -> F,
    {
        match self {
            Self::BreakerOpen { name, retry_after } => {
                ResilienceError::BreakerOpen { name, retry_after }
            }
            Self::Exhausted { attempts, source } => ResilienceError::Exhausted {
                attempts,
                source: f(source),
            },
            Self::NonRetryable { attempts, source } => ResilienceError::NonRetryable {
                attempts,
                source: f(source),
            },
            Self::Cancelled(reason) => ResilienceError::Cancelled(reason),
        }
    }
}

impl<E> From<BreakerOpen> for ResilienceError<E> {
    fn from(open: BreakerOpen) -> Self {
        Self::BreakerOpen {
            name: open.name,
            retry_after: open.retry_after,
        }
    }
}

impl<E> From<CancelReason> for ResilienceError<E> {
    fn from(reason: CancelReason) -> Self {
        Self::Cancelled(reason)
    }
}
