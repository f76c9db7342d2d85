//! HTTP client for talking to a local engine.
//!
//! Wraps a pooled hyper client with a per-attempt timeout and bounded retry.
//! Only connection failures and timeouts are retried, and only for idempotent
//! calls; those are the failures seen while an engine is still binding its
//! port. Any HTTP status, 4xx included, is handed back untouched for the
//! protocol layer to interpret.

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::CONTENT_TYPE;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::error::Error as StdError;
use std::time::Duration;
use tracing::{debug, warn};

use crate::protocol::error::{Result, VibrioError};
use crate::protocol::{EngineCall, RawResponse};

/// Retry policy with exponential backoff.
///
/// Total attempts = `max_retries + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (excluding the initial attempt)
    pub max_retries: u32,
    /// Wait before the first retry, in milliseconds
    pub initial_backoff_ms: u64,
    /// Cap on any single wait, in milliseconds
    pub max_backoff_ms: u64,
    /// Each wait is the previous one times this factor
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_ms: 50,
            max_backoff_ms: 5000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Wait before retry number `retry` (0-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        Duration::from_millis((ms as u64).min(self.max_backoff_ms))
    }
}

/// Transport settings.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// Bound on one attempt, covering the request and the full body read
    pub request_timeout: Duration,
    pub retry: RetryConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }
}

/// Outcome of one failed attempt.
enum AttemptError {
    /// Connection refused or timed out; the engine may still be coming up.
    Retryable(String),
    Fatal(String),
}

/// Cloneable HTTP transport. Clones share one connection pool.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client<HttpConnector, Full<Bytes>>,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build_http();
        Self { client, config }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Sends `call` to the engine at `base_url`, retrying transient failures.
    ///
    /// # Errors
    ///
    /// `VibrioError::Transport` once retries are exhausted (or immediately for
    /// a non-retryable failure), carrying the attempt count and last cause.
    pub async fn send(&self, base_url: &str, call: &EngineCall) -> Result<RawResponse> {
        let retry = &self.config.retry;
        let max_attempts = if call.idempotent { retry.max_retries.saturating_add(1) } else { 1 };
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.attempt(base_url, call, self.config.request_timeout).await {
                Ok(response) => {
                    debug!(
                        method = %call.method,
                        path = %call.path,
                        status = response.status.as_u16(),
                        attempts,
                        "engine call completed"
                    );
                    return Ok(response);
                }
                Err(AttemptError::Retryable(cause)) if attempts < max_attempts => {
                    let wait = retry.backoff(attempts - 1);
                    warn!(
                        "{} {} failed (attempt {}/{}): {}, retrying in {}ms",
                        call.method,
                        call.path,
                        attempts,
                        max_attempts,
                        cause,
                        wait.as_millis()
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(AttemptError::Retryable(cause)) | Err(AttemptError::Fatal(cause)) => {
                    return Err(VibrioError::Transport { attempts, cause });
                }
            }
        }
    }

    /// Single health request with its own timeout and no retries.
    pub async fn probe(&self, base_url: &str, timeout: Duration) -> Result<RawResponse> {
        self.attempt(base_url, &EngineCall::status(), timeout)
            .await
            .map_err(|e| match e {
                AttemptError::Retryable(cause) | AttemptError::Fatal(cause) => {
                    VibrioError::Transport { attempts: 1, cause }
                }
            })
    }

    async fn attempt(
        &self,
        base_url: &str,
        call: &EngineCall,
        timeout: Duration,
    ) -> std::result::Result<RawResponse, AttemptError> {
        let uri = format!("{}{}", base_url.trim_end_matches('/'), call.path_and_query());
        let mut builder = Request::builder().method(call.method.clone()).uri(&uri);
        let body = match &call.body {
            Some(body) => {
                builder = builder.header(CONTENT_TYPE, body.content_type.as_str());
                Full::new(body.bytes.clone())
            }
            None => Full::new(Bytes::new()),
        };
        let request = builder
            .body(body)
            .map_err(|e| AttemptError::Fatal(format!("failed to build request for {}: {}", uri, e)))?;

        let exchange = async {
            let response = self.client.request(request).await.map_err(|e| {
                let cause = error_chain(&e);
                if e.is_connect() {
                    AttemptError::Retryable(cause)
                } else {
                    AttemptError::Fatal(cause)
                }
            })?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| AttemptError::Fatal(format!("failed to read response body: {}", e)))?
                .to_bytes();
            Ok(RawResponse { status, body })
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(AttemptError::Retryable(format!(
                "request timed out after {}ms",
                timeout.as_millis()
            ))),
        }
    }
}

/// `outer: inner: root` rendering of an error and its sources.
fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}
