//! Shared HTTP plumbing for the built-in clients
//!
//! [`HttpChannel`] owns the base URL, resolved credentials and the
//! `reqwest::Client` created on `connect`. It maps transport failures and
//! HTTP statuses onto [`ServiceError`]:
//!
//! | Response               | Error                              |
//! |------------------------|------------------------------------|
//! | 429                    | `RateLimited` (with `Retry-After`) |
//! | 401 / 403              | `Authentication`                   |
//! | other 4xx / 5xx        | `Http { status }`                  |
//! | connect failure        | `ConnectionRefused` / `Dns`        |
//! | timeout                | `Timeout`                          |

use std::time::Duration;

use parking_lot::RwLock;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde_json::Value;

use super::ServiceError;
use crate::provider::ServiceConfig;

/// Longest error body kept in an error message
const MAX_ERROR_BODY: usize = 512;

/// Credentials with secrets already resolved
#[derive(Clone, Default)]
pub enum ResolvedAuth {
    /// No credentials
    #[default]
    None,
    /// `Authorization: Bearer <token>`
    Bearer(String),
    /// Custom header
    Header {
        /// Header name
        name: String,
        /// Header value
        value: String,
    },
    /// Query string parameter
    Query {
        /// Parameter name
        name: String,
        /// Parameter value
        value: String,
    },
    /// HTTP basic auth
    Basic {
        /// User name
        username: String,
        /// Optional password
        password: Option<String>,
    },
}

impl std::fmt::Debug for ResolvedAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Bearer(_) => f.write_str("Bearer(***)"),
            Self::Header { name, .. } => write!(f, "Header({name}: ***)"),
            Self::Query { name, .. } => write!(f, "Query({name}=***)"),
            Self::Basic { username, .. } => write!(f, "Basic({username}:***)"),
        }
    }
}

impl ResolvedAuth {
    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::None => request,
            Self::Bearer(token) => request.bearer_auth(token),
            Self::Header { name, value } => request.header(name.as_str(), value.as_str()),
            Self::Query { name, value } => request.query(&[(name.as_str(), value.as_str())]),
            Self::Basic { username, password } => request.basic_auth(username, password.as_ref()),
        }
    }
}

/// Base URL, credentials and a lazily built `reqwest::Client`
#[derive(Debug)]
pub struct HttpChannel {
    provider_id: String,
    base_url: String,
    auth: ResolvedAuth,
    timeout: Duration,
    client: RwLock<Option<reqwest::Client>>,
}

impl HttpChannel {
    /// Build a channel for `config`, falling back to `default_base` when the
    /// provider has no endpoint
    ///
    /// Secrets are resolved here, so missing credentials surface before any
    /// network traffic.
    pub fn new(config: &ServiceConfig, default_base: Option<&str>) -> Result<Self, ServiceError> {
        let base_url = config
            .endpoint
            .as_deref()
            .or(default_base)
            .ok_or_else(|| {
                ServiceError::Configuration(format!("provider '{}' has no endpoint", config.id))
            })?;
        let parsed = reqwest::Url::parse(base_url).map_err(|e| {
            ServiceError::Configuration(format!("provider '{}' endpoint '{base_url}': {e}", config.id))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ServiceError::Configuration(format!(
                "provider '{}' endpoint must be http(s), got '{}'",
                config.id,
                parsed.scheme()
            )));
        }

        Ok(Self {
            provider_id: config.id.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: config.auth.resolve()?,
            timeout: config.timeout(),
            client: RwLock::new(None),
        })
    }

    /// Base URL without a trailing slash
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL for `path`
    #[must_use]
    pub fn url(&self, path: &str) -> String {
        if path.is_empty() {
            return self.base_url.clone();
        }
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// Build the HTTP client
    pub fn connect(&self) -> Result<(), ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout.min(Duration::from_secs(10)))
            .build()
            .map_err(|e| ServiceError::Configuration(format!("failed to build HTTP client: {e}")))?;
        *self.client.write() = Some(client);
        tracing::debug!(provider = %self.provider_id, base_url = %self.base_url, "HTTP client ready");
        Ok(())
    }

    /// Drop the HTTP client
    pub fn disconnect(&self) {
        self.client.write().take();
    }

    /// Whether a client is built
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.client.read().is_some()
    }

    fn client(&self) -> Result<reqwest::Client, ServiceError> {
        self.client.read().clone().ok_or(ServiceError::NotConnected)
    }

    /// GET `path` and parse JSON
    pub async fn get_json(&self, path: &str) -> Result<Value, ServiceError> {
        self.request(Method::GET, path, None).await
    }

    /// POST `body` to `path` and parse JSON
    pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value, ServiceError> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// Send a request and parse the JSON response
    ///
    /// For GET and DELETE a JSON object body is sent as query parameters.
    pub async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ServiceError> {
        let client = self.client()?;
        let mut request = client.request(method.clone(), self.url(path));
        request = self.auth.apply(request);

        if let Some(body) = body {
            if method == Method::GET || method == Method::DELETE {
                request = request.query(&query_pairs(body));
            } else {
                request = request.json(body);
            }
        }

        let response = request.send().await.map_err(ServiceError::from)?;
        let status = response.status();
        if !status.is_success() {
            let headers = response.headers().clone();
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, &headers, &text));
        }

        let bytes = response.bytes().await.map_err(ServiceError::from)?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|e| ServiceError::InvalidResponse(e.to_string()))
    }
}

/// Flatten a JSON object into query parameters
fn query_pairs(body: &Value) -> Vec<(String, String)> {
    let Value::Object(map) = body else {
        return Vec::new();
    };
    map.iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| {
            let value = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (k.clone(), value)
        })
        .collect()
}

/// Map a non-success status to an error
#[must_use]
pub fn status_error(status: StatusCode, headers: &HeaderMap, body: &str) -> ServiceError {
    let message = truncate(body.trim(), MAX_ERROR_BODY);
    let message = if message.is_empty() {
        status.canonical_reason().unwrap_or("no body").to_string()
    } else {
        message
    };

    match status {
        StatusCode::TOO_MANY_REQUESTS => ServiceError::RateLimited {
            retry_after: parse_retry_after(headers),
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ServiceError::Authentication(message),
        _ => ServiceError::Http {
            status: status.as_u16(),
            message,
        },
    }
}

/// `Retry-After` in delta-seconds form
fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &text[..end])
}

/// Lowercased error text including every source in the chain
fn error_chain_text(error: &dyn std::error::Error) -> String {
    let mut text = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text.to_ascii_lowercase()
}

impl From<reqwest::Error> for ServiceError {
    fn from(error: reqwest::Error) -> Self {
        let text = error_chain_text(&error);

        if error.is_timeout() {
            return Self::Timeout(text);
        }
        if let Some(status) = error.status() {
            return Self::Http {
                status: status.as_u16(),
                message: text,
            };
        }
        if error.is_connect() {
            if text.contains("dns") || text.contains("resolve") || text.contains("lookup") {
                return Self::Dns(text);
            }
            if text.contains("reset") {
                return Self::ConnectionReset(text);
            }
            return Self::ConnectionRefused(text);
        }
        if error.is_decode() {
            return Self::InvalidResponse(text);
        }
        if error.is_builder() {
            return Self::Configuration(text);
        }
        if text.contains("reset") || text.contains("broken pipe") || text.contains("connection closed") {
            return Self::ConnectionReset(text);
        }
        Self::Other(text)
    }
}
