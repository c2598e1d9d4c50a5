//! Provider Configuration and Catalog
//!
//! [`ServiceConfig`] is one provider record: identity, the capability it
//! serves, its client kind, priority, endpoint, credentials, limits and
//! provider-specific options. [`ProviderCatalog`] is the in-memory,
//! read-mostly set of records that failover reads on every request and that
//! admin calls mutate.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::client::http::ResolvedAuth;
use crate::client::ServiceError;
use crate::error::BrokerError;

// ============================================================================
// Secrets and Auth
// ============================================================================

/// A credential given literally or by environment variable name
///
/// In TOML: `token = "sk-..."` or `token = { env = "OPENAI_API_KEY" }`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Secret {
    /// Read from the named environment variable at registration
    Env {
        /// Variable name
        env: String,
    },
    /// Literal value
    Value(String),
}

impl Secret {
    /// Resolve to the secret value
    pub fn resolve(&self) -> Result<String, ServiceError> {
        match self {
            Self::Value(v) if v.is_empty() => {
                Err(ServiceError::Configuration("credential is empty".to_string()))
            }
            Self::Value(v) => Ok(v.clone()),
            Self::Env { env } => match std::env::var(env) {
                Ok(v) if !v.is_empty() => Ok(v),
                _ => Err(ServiceError::Configuration(format!(
                    "environment variable '{env}' is not set"
                ))),
            },
        }
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Env { env } => write!(f, "Secret(env:{env})"),
            Self::Value(_) => f.write_str("Secret(***)"),
        }
    }
}

/// How a client authenticates
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    /// No credentials
    #[default]
    None,
    /// Bearer token
    Bearer {
        /// Token
        token: Secret,
    },
    /// Custom header
    Header {
        /// Header name
        name: String,
        /// Header value
        value: Secret,
    },
    /// Query parameter
    Query {
        /// Parameter name
        name: String,
        /// Parameter value
        value: Secret,
    },
    /// HTTP basic auth
    Basic {
        /// User name
        username: String,
        /// Password
        #[serde(default)]
        password: Option<Secret>,
    },
}

impl AuthConfig {
    /// Resolve every secret
    pub fn resolve(&self) -> Result<ResolvedAuth, ServiceError> {
        Ok(match self {
            Self::None => ResolvedAuth::None,
            Self::Bearer { token } => ResolvedAuth::Bearer(token.resolve()?),
            Self::Header { name, value } => ResolvedAuth::Header {
                name: name.clone(),
                value: value.resolve()?,
            },
            Self::Query { name, value } => ResolvedAuth::Query {
                name: name.clone(),
                value: value.resolve()?,
            },
            Self::Basic { username, password } => ResolvedAuth::Basic {
                username: username.clone(),
                password: password.as_ref().map(Secret::resolve).transpose()?,
            },
        })
    }

    /// Whether no credentials are configured
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

// ============================================================================
// Service Config
// ============================================================================

/// Per-provider rate limit overrides
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderRateLimit {
    /// Requests per minute (deployment default when unset)
    pub per_minute: Option<u32>,
    /// Requests per hour (no hourly limit when unset)
    pub per_hour: Option<u32>,
}

/// Result of the last `test` against a provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestOutcome {
    /// Whether the provider answered
    pub success: bool,
    /// Error message when it did not
    pub message: Option<String>,
    /// When the test ran
    pub tested_at: DateTime<Utc>,
    /// Round trip (milliseconds)
    pub response_time_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// One provider record
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Unique provider id
    pub id: String,

    /// Display name
    #[serde(default)]
    pub name: String,

    /// Capability served (`ocr`, `ai`, `search`, ...)
    pub capability: String,

    /// Client family used to talk to the provider
    pub kind: String,

    /// Disabled providers are never attempted
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Lower is tried first
    #[serde(default)]
    pub priority: i32,

    /// Base URL
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Credentials
    #[serde(default)]
    pub auth: AuthConfig,

    /// Rate limit overrides
    #[serde(default)]
    pub rate_limit: ProviderRateLimit,

    /// Per-call timeout (milliseconds)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Named retry preset; keyword rules pick one when unset
    #[serde(default)]
    pub retry_policy: Option<String>,

    /// Default provider for its capability
    #[serde(default)]
    pub is_default: bool,

    /// The deployment cannot run without this provider
    #[serde(default)]
    pub is_required: bool,

    /// Free-form description
    #[serde(default)]
    pub description: Option<String>,

    /// Provider-specific options, decoded by the client
    #[serde(default)]
    pub extra: Value,

    /// Last health check outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_test: Option<TestOutcome>,
}

impl ServiceConfig {
    /// Minimal enabled record
    #[must_use]
    pub fn new(id: impl Into<String>, capability: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            capability: capability.into(),
            kind: kind.into(),
            enabled: true,
            priority: 0,
            endpoint: None,
            auth: AuthConfig::None,
            rate_limit: ProviderRateLimit::default(),
            timeout_ms: default_timeout_ms(),
            retry_policy: None,
            is_default: false,
            is_required: false,
            description: None,
            extra: Value::Null,
            last_test: None,
        }
    }

    /// Set the priority
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Enable or disable
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set the endpoint
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set credentials
    #[must_use]
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = auth;
        self
    }

    /// Override the per-minute limit
    #[must_use]
    pub fn with_rate_limit_per_minute(mut self, rpm: u32) -> Self {
        self.rate_limit.per_minute = Some(rpm);
        self
    }

    /// Set the per-call timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Select a retry preset
    #[must_use]
    pub fn with_retry_policy(mut self, policy: impl Into<String>) -> Self {
        self.retry_policy = Some(policy.into());
        self
    }

    /// Set provider-specific options
    #[must_use]
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }

    /// Name for display, falling back to the id
    #[must_use]
    pub fn display_name(&self) -> &str {
        if self.name.is_empty() {
            &self.id
        } else {
            &self.name
        }
    }

    /// Per-call timeout as a `Duration`
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Decode `extra` into a typed options struct
    pub fn extra_as<T: DeserializeOwned + Default>(&self) -> Result<T, ServiceError> {
        if self.extra.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.extra.clone()).map_err(|e| {
            ServiceError::Configuration(format!("provider '{}' has invalid options: {e}", self.id))
        })
    }

    /// Check required fields
    pub fn validate(&self) -> Result<(), String> {
        if self.id.trim().is_empty() {
            return Err("provider id must not be empty".to_string());
        }
        if self.capability.trim().is_empty() {
            return Err(format!("provider '{}' has no capability", self.id));
        }
        if self.kind.trim().is_empty() {
            return Err(format!("provider '{}' has no kind", self.id));
        }
        if self.timeout_ms == 0 {
            return Err(format!("provider '{}' timeout_ms must be positive", self.id));
        }
        Ok(())
    }
}

// ============================================================================
// Catalog
// ============================================================================

/// In-memory provider records
#[derive(Debug, Default)]
pub struct ProviderCatalog {
    providers: RwLock<HashMap<String, ServiceConfig>>,
}

impl ProviderCatalog {
    /// Build from records, rejecting invalid or duplicate ids
    pub fn new(configs: Vec<ServiceConfig>) -> Result<Self, BrokerError> {
        let mut providers = HashMap::with_capacity(configs.len());
        for config in configs {
            config.validate().map_err(BrokerError::Configuration)?;
            if providers.contains_key(&config.id) {
                return Err(BrokerError::Configuration(format!(
                    "duplicate provider id '{}'",
                    config.id
                )));
            }
            providers.insert(config.id.clone(), config);
        }
        Ok(Self {
            providers: RwLock::new(providers),
        })
    }

    /// Record by id
    #[must_use]
    pub fn get(&self, id: &str) -> Option<ServiceConfig> {
        self.providers.read().get(id).cloned()
    }

    /// Whether `id` exists
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.providers.read().contains_key(id)
    }

    /// Enabled providers for `capability`, ascending priority (ties by id)
    #[must_use]
    pub fn ordered_for(&self, capability: &str) -> Vec<ServiceConfig> {
        let mut list: Vec<_> = self
            .providers
            .read()
            .values()
            .filter(|p| p.enabled && p.capability == capability)
            .cloned()
            .collect();
        list.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        list
    }

    /// Every record, sorted by capability, priority, id
    #[must_use]
    pub fn all(&self) -> Vec<ServiceConfig> {
        let mut list: Vec<_> = self.providers.read().values().cloned().collect();
        list.sort_by(|a, b| {
            a.capability
                .cmp(&b.capability)
                .then_with(|| a.priority.cmp(&b.priority))
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    /// Distinct capabilities
    #[must_use]
    pub fn capabilities(&self) -> Vec<String> {
        self.providers
            .read()
            .values()
            .map(|p| p.capability.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Insert or replace a record; returns the previous one
    pub fn upsert(&self, config: ServiceConfig) -> Result<Option<ServiceConfig>, BrokerError> {
        config.validate().map_err(BrokerError::Configuration)?;
        Ok(self.providers.write().insert(config.id.clone(), config))
    }

    /// Remove a record
    pub fn remove(&self, id: &str) -> Option<ServiceConfig> {
        self.providers.write().remove(id)
    }

    fn update<T>(&self, id: &str, f: impl FnOnce(&mut ServiceConfig) -> T) -> Result<T, BrokerError> {
        let mut providers = self.providers.write();
        let config = providers
            .get_mut(id)
            .ok_or_else(|| BrokerError::UnknownProvider(id.to_string()))?;
        Ok(f(config))
    }

    /// Enable or disable a provider
    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), BrokerError> {
        self.update(id, |c| c.enabled = enabled)
    }

    /// Change a provider's priority
    pub fn set_priority(&self, id: &str, priority: i32) -> Result<(), BrokerError> {
        self.update(id, |c| c.priority = priority)
    }

    /// Replace a provider's credentials
    pub fn rotate_credentials(&self, id: &str, auth: AuthConfig) -> Result<(), BrokerError> {
        self.update(id, |c| c.auth = auth)
    }

    /// Store the outcome of a health check
    pub fn record_test(&self, id: &str, outcome: TestOutcome) -> Result<(), BrokerError> {
        self.update(id, |c| c.last_test = Some(outcome))
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.read().len()
    }

    /// Whether the catalog is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.read().is_empty()
    }
}
