//! Provider Clients
//!
//! One [`ServiceClient`] implementation per provider family. Each client owns
//! its wire format; the orchestration layer only sees
//! `call(action, input) -> Result<Value, ServiceError>` (or the
//! [`OperationResult`] wrapper from [`ServiceClient::execute`]).
//!
//! Built-in families:
//!
//! | Kind        | Client            | Typical use                          |
//! |-------------|-------------------|--------------------------------------|
//! | `openai`    | [`OpenAiClient`]  | OpenAI-compatible AI model APIs      |
//! | `ollama`    | [`OllamaClient`]  | Local model servers                  |
//! | `http_json` | [`HttpJsonClient`]| OCR, search, storage, chat webhooks  |
//!
//! New families are added through [`ClientRegistry::register`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

use crate::error::ErrorKind;
use crate::resilience::pool::PoolResource;
use crate::resilience::retry::{is_retryable_message, Retryable};

pub mod http;
pub mod http_json;
pub mod ollama;
pub mod openai;
pub mod registry;

#[cfg(test)]
pub(crate) mod test_utils;

pub use http_json::HttpJsonClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;
pub use registry::{ClientFactory, ClientRegistry};

// ============================================================================
// Errors
// ============================================================================

/// Failure reported by a provider client
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The provider refused the connection
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// The connection dropped mid-request
    #[error("connection reset: {0}")]
    ConnectionReset(String),

    /// The provider host could not be resolved
    #[error("DNS resolution failed: {0}")]
    Dns(String),

    /// No response in time
    #[error("request timed out: {0}")]
    Timeout(String),

    /// HTTP 429 from the provider
    #[error("rate limited by provider{}", retry_after_suffix(.retry_after))]
    RateLimited {
        /// Provider-suggested wait
        retry_after: Option<Duration>,
    },

    /// Non-success HTTP status
    #[error("HTTP {status}: {message}")]
    Http {
        /// Status code
        status: u16,
        /// Response body or reason
        message: String,
    },

    /// Credentials rejected (401/403)
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Missing or invalid client configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The client does not implement this action
    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),

    /// `call` before `connect`
    #[error("client is not connected")]
    NotConnected,

    /// The response could not be understood
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Anything else
    #[error("{0}")]
    Other(String),
}

fn retry_after_suffix(retry_after: &Option<Duration>) -> String {
    retry_after.map_or_else(String::new, |d| format!(", retry after {}ms", d.as_millis()))
}

impl Retryable for ServiceError {
    fn is_retryable(&self) -> bool {
        is_retryable_error(self)
    }
}

/// Default retryability: refused or reset connections, timeouts, DNS
/// failures, HTTP 5xx and HTTP 429
#[must_use]
pub fn is_retryable_error(error: &ServiceError) -> bool {
    match error {
        ServiceError::ConnectionRefused(_)
        | ServiceError::ConnectionReset(_)
        | ServiceError::Dns(_)
        | ServiceError::Timeout(_)
        | ServiceError::RateLimited { .. } => true,
        ServiceError::Http { status, .. } => *status == 429 || (500..600).contains(status),
        ServiceError::Other(message) => is_retryable_message(message),
        ServiceError::Authentication(_)
        | ServiceError::Configuration(_)
        | ServiceError::UnsupportedAction(_)
        | ServiceError::NotConnected
        | ServiceError::InvalidResponse(_) => false,
    }
}

impl ServiceError {
    /// Error category for callers
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) | Self::Authentication(_) => ErrorKind::Configuration,
            e if e.is_retryable() => ErrorKind::Transient,
            _ => ErrorKind::Provider,
        }
    }
}

// ============================================================================
// Operation Result
// ============================================================================

/// Lifecycle status of an operation
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Not started
    #[default]
    Pending,
    /// In flight
    Processing,
    /// Finished with a payload
    Success,
    /// Finished with an error
    Failed,
    /// Gave up waiting
    Timeout,
    /// Abandoned by the caller
    Cancelled,
}

/// Outcome of a provider operation
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OperationResult {
    /// Whether a payload was produced
    pub success: bool,
    /// Lifecycle status
    pub status: OperationStatus,
    /// Payload on success
    pub data: Option<Value>,
    /// Error message on failure
    pub error: Option<String>,
    /// Error category on failure
    pub error_kind: Option<ErrorKind>,
    /// Provider that produced the outcome
    pub provider: Option<String>,
    /// Attempts made across all providers
    pub attempts: u32,
    /// Served from the result cache
    pub cached: bool,
    /// Wall time spent (milliseconds)
    pub execution_time_ms: u64,
    /// When the outcome was produced
    pub timestamp: DateTime<Utc>,
}

impl OperationResult {
    /// Successful outcome
    #[must_use]
    pub fn success(data: Value, elapsed: Duration) -> Self {
        Self {
            success: true,
            status: OperationStatus::Success,
            data: Some(data),
            error: None,
            error_kind: None,
            provider: None,
            attempts: 1,
            cached: false,
            execution_time_ms: elapsed_ms(elapsed),
            timestamp: Utc::now(),
        }
    }

    /// Failed outcome
    #[must_use]
    pub fn failure(error: impl ToString, kind: ErrorKind, elapsed: Duration) -> Self {
        let status = if kind == ErrorKind::Timeout {
            OperationStatus::Timeout
        } else {
            OperationStatus::Failed
        };
        Self {
            success: false,
            status,
            data: None,
            error: Some(error.to_string()),
            error_kind: Some(kind),
            provider: None,
            attempts: 1,
            cached: false,
            execution_time_ms: elapsed_ms(elapsed),
            timestamp: Utc::now(),
        }
    }

    /// Outcome of a provider call
    #[must_use]
    pub fn from_service(result: Result<Value, ServiceError>, elapsed: Duration) -> Self {
        match result {
            Ok(data) => Self::success(data, elapsed),
            Err(ServiceError::Timeout(message)) => {
                Self::failure(ServiceError::Timeout(message), ErrorKind::Timeout, elapsed)
            }
            Err(e) => {
                let kind = e.kind();
                Self::failure(e, kind, elapsed)
            }
        }
    }

    /// Set the serving provider
    #[must_use]
    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    /// Set the attempt count
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Mark as served from cache
    #[must_use]
    pub fn from_cache(mut self) -> Self {
        self.cached = true;
        self.attempts = 0;
        self
    }
}

fn elapsed_ms(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

// ============================================================================
// Client Trait
// ============================================================================

/// A connection to one external provider
#[async_trait]
pub trait ServiceClient: Send + Sync {
    /// Provider id from configuration
    fn provider_id(&self) -> &str;

    /// Provider family (`openai`, `ollama`, ...)
    fn kind(&self) -> &str;

    /// Whether `connect` has succeeded and `disconnect` has not run since
    fn is_connected(&self) -> bool;

    /// Prepare the client for calls
    async fn connect(&self) -> Result<(), ServiceError>;

    /// Release client resources
    async fn disconnect(&self);

    /// Cheap round trip proving the provider is reachable and accepts our
    /// credentials
    async fn test(&self) -> Result<(), ServiceError>;

    /// Perform `action` with `input`
    async fn call(&self, action: &str, input: &Value) -> Result<Value, ServiceError>;

    /// [`call`](Self::call) wrapped into an [`OperationResult`]
    async fn execute(&self, action: &str, input: &Value) -> OperationResult {
        let started = Instant::now();
        let result = self.call(action, input).await;
        OperationResult::from_service(result, started.elapsed()).with_provider(self.provider_id())
    }
}

/// A client held by the connection pool
#[derive(Clone)]
pub struct PooledClient {
    client: Arc<dyn ServiceClient>,
}

impl PooledClient {
    /// Wrap a connected client
    #[must_use]
    pub fn new(client: Arc<dyn ServiceClient>) -> Self {
        Self { client }
    }

    /// The wrapped client
    #[must_use]
    pub fn client(&self) -> &Arc<dyn ServiceClient> {
        &self.client
    }
}

impl std::ops::Deref for PooledClient {
    type Target = dyn ServiceClient;

    fn deref(&self) -> &Self::Target {
        self.client.as_ref()
    }
}

impl std::fmt::Debug for PooledClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledClient")
            .field("provider", &self.client.provider_id())
            .field("kind", &self.client.kind())
            .finish()
    }
}

#[async_trait]
impl PoolResource for PooledClient {
    async fn close(&self) {
        self.client.disconnect().await;
    }
}
