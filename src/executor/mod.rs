//! Timed request execution
//!
//! Every outbound call goes through [`TimedExecutor`], which races the
//! transport against a deadline and an explicit cancel signal:
//!
//! ```text
//! dispatch() ──▶ (PendingRequest, CancelHandle)
//!                     │
//!        ┌────────────┼─────────────┐
//!        ▼            ▼             ▼
//!    transport     deadline      cancel()
//!    response      elapsed
//!        │            │             │
//!        ▼            ▼             ▼
//!   RawResponse  Aborted(Timeout) Aborted(Cancelled)
//! ```
//!
//! HTTP error statuses are not execution failures: they resolve as a
//! [`RawResponse`] and the caller inspects the status.

mod http;

#[cfg(test)]
pub(crate) mod testing;

pub use http::HttpTransport;

use async_trait::async_trait;
use serde::Serialize;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Errors raised by a [`Transport`] implementation
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Connection failed: {0}")]
    Connection(String),
}

/// Why a pending request was abandoned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The deadline elapsed before a response arrived
    Timeout,
    /// The caller cancelled the request
    Cancelled,
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AbortReason::Timeout => write!(f, "timed out"),
            AbortReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Errors from a timed request
#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Request aborted: {0}")]
    Aborted(AbortReason),

    #[error("Network failure: {0}")]
    NetworkFailure(String),
}

impl From<TransportError> for ExecutorError {
    fn from(err: TransportError) -> Self {
        ExecutorError::NetworkFailure(err.to_string())
    }
}

/// HTTP method of an outbound call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
}

/// Whether cookies travel with the request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CredentialsPolicy {
    /// Never send or store cookies
    Omit,
    /// Send cookies for the backend's own origin
    #[default]
    SameOrigin,
    /// Always send cookies
    Include,
}

/// Options for a single outbound call
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
    pub credentials: CredentialsPolicy,
}

impl RequestOptions {
    /// A bodiless GET
    pub fn get() -> Self {
        Self {
            method: Method::Get,
            headers: vec![("Accept".to_string(), "application/json".to_string())],
            body: None,
            credentials: CredentialsPolicy::default(),
        }
    }

    /// A POST carrying `body` serialized as JSON
    pub fn post_json<T: Serialize>(body: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            method: Method::Post,
            headers: vec![
                ("Accept".to_string(), "application/json".to_string()),
                ("Content-Type".to_string(), "application/json".to_string()),
            ],
            body: Some(serde_json::to_string(body)?),
            credentials: CredentialsPolicy::default(),
        })
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_credentials(mut self, credentials: CredentialsPolicy) -> Self {
        self.credentials = credentials;
        self
    }
}

/// A fully read response
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub elapsed: Duration,
}

impl RawResponse {
    /// True for 2xx statuses
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> &str {
        &self.body
    }
}

/// Moves bytes between the client and the backend
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one request and read the whole response body
    async fn send(&self, url: &str, options: &RequestOptions)
        -> Result<RawResponse, TransportError>;
}

/// Cancels one pending request. Cloning shares the same signal.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    /// Idempotent; a no-op once the request has resolved
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

type SendFuture = Pin<Box<dyn Future<Output = Result<RawResponse, TransportError>> + Send>>;

/// A deadline timer that counts itself live until dropped
struct Deadline {
    sleep: Pin<Box<Sleep>>,
    live: Arc<AtomicUsize>,
}

impl Deadline {
    fn start(timeout: Duration, live: Arc<AtomicUsize>) -> Self {
        live.fetch_add(1, Ordering::SeqCst);
        Self {
            sleep: Box::pin(tokio::time::sleep(timeout)),
            live,
        }
    }
}

impl Drop for Deadline {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// An in-flight request. Dropping it unawaited releases its deadline and
/// any transport resources.
pub struct PendingRequest {
    url: String,
    send: SendFuture,
    deadline: Deadline,
    token: CancellationToken,
}

impl PendingRequest {
    /// Resolve the request: first of response, deadline, or cancel wins
    pub async fn wait(self) -> Result<RawResponse, ExecutorError> {
        let PendingRequest {
            url,
            send,
            mut deadline,
            token,
        } = self;

        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => Err(ExecutorError::Aborted(AbortReason::Cancelled)),
            _ = deadline.sleep.as_mut() => Err(ExecutorError::Aborted(AbortReason::Timeout)),
            result = send => result.map_err(ExecutorError::from),
        };

        match &outcome {
            Ok(response) => debug!(url = %url, status = response.status, "Request resolved"),
            Err(e) => debug!(url = %url, error = %e, "Request failed"),
        }

        outcome
    }
}

/// Issues outbound calls with an upper bound on wait time
pub struct TimedExecutor {
    transport: Arc<dyn Transport>,
    live_deadlines: Arc<AtomicUsize>,
}

impl TimedExecutor {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            live_deadlines: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Start a request. The deadline starts counting now, not when the
    /// pending request is first awaited.
    pub fn dispatch(
        &self,
        url: impl Into<String>,
        options: RequestOptions,
        timeout: Duration,
    ) -> (PendingRequest, CancelHandle) {
        let url = url.into();
        let token = CancellationToken::new();
        let deadline = Deadline::start(timeout, Arc::clone(&self.live_deadlines));

        let transport = Arc::clone(&self.transport);
        let target = url.clone();
        let send: SendFuture = Box::pin(async move { transport.send(&target, &options).await });

        debug!(url = %url, timeout_ms = timeout.as_millis() as u64, "Dispatching request");

        let pending = PendingRequest {
            url,
            send,
            deadline,
            token: token.clone(),
        };
        (pending, CancelHandle { token })
    }

    /// Dispatch and wait in one step
    pub async fn execute(
        &self,
        url: impl Into<String>,
        options: RequestOptions,
        timeout: Duration,
    ) -> Result<RawResponse, ExecutorError> {
        let (pending, _handle) = self.dispatch(url, options, timeout);
        pending.wait().await
    }

    /// Number of deadline timers not yet released
    pub fn active_deadlines(&self) -> usize {
        self.live_deadlines.load(Ordering::SeqCst)
    }
}
