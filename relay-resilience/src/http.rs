//! Resilient outbound HTTP on top of reqwest.
//!
//! A request is captured once: method, URL, headers, version, timeout and
//! the full body. Every attempt is built fresh from the capture, so headers
//! such as `authorization` and `traceparent` and the body are identical on
//! each retry. Streaming bodies are drained into memory during capture.

use bytes::Bytes;
use http_body_util::BodyExt;
use relay_core::DependencyPolicy;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_LENGTH};
use reqwest::{Method, Url, Version};
use std::time::Duration;

use crate::breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::call::ResilientCall;
use crate::classify::{HttpFailureClassifier, HttpRetryClassifier};
use crate::context::CallContext;
use crate::error::ResilienceError;
use crate::retry::{RetryExecutor, RetryPolicy};

pub type HttpResult = Result<reqwest::Response, ResilienceError<reqwest::Error>>;

/// A request frozen so it can be replayed any number of times.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    method: Method,
    url: Url,
    headers: HeaderMap,
    version: Version,
    timeout: Option<Duration>,
    body: Option<Bytes>,
}

impl CapturedRequest {
    pub async fn capture(mut request: reqwest::Request) -> Result<Self, reqwest::Error> {
        let body = match request.body_mut().take() {
            Some(body) => {
                let buffered = body.as_bytes().map(Bytes::copy_from_slice);
                match buffered {
                    Some(bytes) => Some(bytes),
                    None => Some(body.collect().await?.to_bytes()),
                }
            }
            None => None,
        };

        Ok(Self {
            method: request.method().clone(),
            url: request.url().clone(),
            headers: request.headers().clone(),
            version: request.version(),
            timeout: request.timeout().copied(),
            body,
        })
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }

    /// Build a fresh request for one attempt.
    pub fn to_request(&self) -> reqwest::Request {
        let mut request = reqwest::Request::new(self.method.clone(), self.url.clone());
        let mut headers = self.headers.clone();

        if let Some(body) = &self.body {
            headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
            *request.body_mut() = Some(reqwest::Body::from(body.clone()));
        }

        *request.headers_mut() = headers;
        *request.version_mut() = self.version;
        *request.timeout_mut() = self.timeout;
        request
    }
}

/// reqwest client wrapped with retry and an optional circuit breaker.
///
/// Transport errors, 429 and 500/502/503/504 are retried. Transport errors
/// and any 5xx count against the breaker; 4xx never do. When the retry
/// budget runs out on a retryable status, the last response is returned as
/// `Ok` so callers can inspect it.
#[derive(Debug, Clone)]
pub struct ResilientHttpClient {
    client: reqwest::Client,
    call: ResilientCall<HttpRetryClassifier, HttpFailureClassifier>,
}

impl ResilientHttpClient {
    pub fn new(
        client: reqwest::Client,
        retry_policy: RetryPolicy,
        breaker: Option<CircuitBreaker>,
    ) -> Self {
        Self {
            client,
            call: ResilientCall::new(
                breaker,
                RetryExecutor::new(retry_policy, HttpRetryClassifier),
                HttpFailureClassifier,
            ),
        }
    }

    /// Build a client for `dependency` from its configured policy. A breaker
    /// is created only when the policy enables one.
    pub fn from_policy(
        client: reqwest::Client,
        dependency: &str,
        policy: &DependencyPolicy,
    ) -> Self {
        let breaker = policy.breaker.enabled.then(|| {
            CircuitBreaker::new(dependency, CircuitBreakerConfig::from(&policy.breaker))
        });
        Self::new(client, RetryPolicy::from(&policy.retry), breaker)
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn breaker(&self) -> Option<&CircuitBreaker> {
        self.call.breaker()
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.call.retry().policy()
    }

    /// Build `builder` and execute it.
    pub async fn send(&self, ctx: &CallContext, builder: reqwest::RequestBuilder) -> HttpResult {
        let request = builder
            .build()
            .map_err(|source| ResilienceError::NonRetryable {
                attempts: 0,
                source,
            })?;
        self.execute(ctx, request).await
    }

    /// Capture `request` and execute it with retries. A body that cannot be
    /// read is reported as a non-retryable error with zero attempts.
    pub async fn execute(&self, ctx: &CallContext, request: reqwest::Request) -> HttpResult {
        let captured = CapturedRequest::capture(request).await.map_err(|source| {
            ResilienceError::NonRetryable {
                attempts: 0,
                source,
            }
        })?;
        self.execute_captured(ctx, &captured).await
    }

    pub async fn execute_captured(
        &self,
        ctx: &CallContext,
        captured: &CapturedRequest,
    ) -> HttpResult {
        let client = &self.client;
        self.call
            .execute(ctx, || client.execute(captured.to_request()))
            .await
    }
}
