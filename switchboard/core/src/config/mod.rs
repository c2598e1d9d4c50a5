//! TOML Configuration File Support
//!
//! One file configures the whole broker, by default
//! `$XDG_CONFIG_HOME/switchboard/switchboard.toml`.
//!
//! # Configuration Priority
//!
//! Highest first:
//! 1. CLI arguments ([`ConfigOverrides`])
//! 2. Environment variables (`SWITCHBOARD_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [rate_limit]
//! algorithm = "token_bucket"
//! requests_per_minute = 60
//! max_wait_ms = 5000
//!
//! [pool]
//! max_connections = 4
//! acquire_timeout_ms = 30000
//!
//! [session]
//! timeout_minutes = 30
//! max_sessions_per_service = 100
//!
//! [failover]
//! default_timeout_ms = 60000
//!
//! [retry.presets.slow]
//! backoff = "fibonacci"
//! max_retries = 6
//! initial_delay_ms = 2000
//! max_delay_ms = 60000
//!
//! [[retry.rules]]
//! keywords = ["upload"]
//! policy = "slow"
//!
//! [[providers]]
//! id = "gpt"
//! capability = "ai"
//! kind = "openai"
//! priority = 1
//! auth = { type = "bearer", token = { env = "OPENAI_API_KEY" } }
//! rate_limit = { per_minute = 500 }
//! extra = { default_model = "gpt-4o-mini" }
//! ```
//!
//! Presets named in the file are added to the built-in ones (`default`,
//! `moderate`, `patient`, `gentle`, `none`), replacing any of the same name.
//! A `[[retry.rules]]` list replaces the built-in keyword rules entirely.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::CacheConfig;
use crate::failover::FailoverConfig;
use crate::provider::ServiceConfig;
use crate::resilience::pool::PoolConfig;
use crate::resilience::rate_limit::{RateLimitAlgorithm, RateLimitConfig};
use crate::resilience::retry::RetryPolicyTable;
use crate::session::SessionConfig;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where the configuration came from
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    #[default]
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Configuration
// =============================================================================

/// Complete broker configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SwitchboardConfig {
    /// Rate limiting
    pub rate_limit: RateLimitConfig,
    /// Connection pool
    pub pool: PoolConfig,
    /// Sessions
    pub session: SessionConfig,
    /// Failover timings
    pub failover: FailoverConfig,
    /// Result cache
    pub cache: CacheConfig,
    /// Retry presets and keyword rules
    pub retry: RetryPolicyTable,
    /// Provider records
    pub providers: Vec<ServiceConfig>,

    /// Path to the config file that was loaded (if any)
    #[serde(skip)]
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    #[serde(skip)]
    source: ConfigSource,
}

impl SwitchboardConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a provider
    #[must_use]
    pub fn with_provider(mut self, provider: ServiceConfig) -> Self {
        self.providers.push(provider);
        self
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Parse a TOML document on top of the defaults
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ParseError`] for malformed TOML.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let mut config: Self = toml::from_str(content)?;
        config.merge_builtin_presets();
        config.source = ConfigSource::File;
        Ok(config)
    }

    fn merge_builtin_presets(&mut self) {
        for (name, policy) in RetryPolicyTable::default().presets {
            self.retry.presets.entry(name).or_insert(policy);
        }
    }

    /// Check every section
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] naming the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = ConfigError::ValidationError;

        if self.rate_limit.enabled && self.rate_limit.requests_per_minute == 0 {
            return Err(invalid(
                "rate_limit.requests_per_minute must be positive".to_string(),
            ));
        }
        self.pool.validate().map_err(invalid)?;
        if self.session.max_sessions_per_service == 0 {
            return Err(invalid(
                "session.max_sessions_per_service must be at least 1".to_string(),
            ));
        }
        self.failover.validate().map_err(invalid)?;
        self.retry.validate().map_err(invalid)?;

        let mut seen = HashSet::new();
        for provider in &self.providers {
            provider.validate().map_err(invalid)?;
            if !seen.insert(provider.id.as_str()) {
                return Err(invalid(format!("duplicate provider id '{}'", provider.id)));
            }
            if let Some(policy) = &provider.retry_policy {
                if self.retry.get(policy).is_none() {
                    return Err(invalid(format!(
                        "provider '{}' refers to unknown retry policy '{policy}'",
                        provider.id
                    )));
                }
            }
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/switchboard/switchboard.toml` or
/// `~/.config/switchboard/switchboard.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("switchboard").join("switchboard.toml"))
}

/// Load configuration from the default path and the environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<SwitchboardConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the environment
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<SwitchboardConfig, ConfigError> {
    let mut config = SwitchboardConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;
            config = SwitchboardConfig::from_toml_str(&content)?;
            config.config_file_path = Some(config_path.clone());

            tracing::info!(
                path = %config_path.display(),
                providers = config.providers.len(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    Ok(config)
}

/// Apply `SWITCHBOARD_*` environment variables
pub fn apply_env_config(config: &mut SwitchboardConfig) {
    apply_env_overrides_from(config, |name| std::env::var(name).ok());
}

fn parse_bool(value: &str) -> bool {
    value != "0" && !value.eq_ignore_ascii_case("false") && !value.eq_ignore_ascii_case("off")
}

/// Apply environment overrides read through `lookup`
///
/// Unparseable values are logged and ignored.
pub fn apply_env_overrides_from<F>(config: &mut SwitchboardConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut applied = false;

    macro_rules! parsed {
        ($name:literal, $target:expr) => {
            if let Some(raw) = lookup($name) {
                match raw.trim().parse() {
                    Ok(value) => {
                        $target = value;
                        applied = true;
                    }
                    Err(_) => tracing::warn!(var = $name, value = %raw, "Ignoring unparseable value"),
                }
            }
        };
    }

    parsed!("SWITCHBOARD_RATE_LIMIT_RPM", config.rate_limit.requests_per_minute);
    parsed!("SWITCHBOARD_RATE_LIMIT_MAX_WAIT_MS", config.rate_limit.max_wait_ms);
    parsed!("SWITCHBOARD_POOL_MAX_CONNECTIONS", config.pool.max_connections);
    parsed!("SWITCHBOARD_POOL_ACQUIRE_TIMEOUT_MS", config.pool.acquire_timeout_ms);
    parsed!("SWITCHBOARD_SESSION_TIMEOUT_MINUTES", config.session.timeout_minutes);
    parsed!("SWITCHBOARD_SESSION_MAX_PER_SERVICE", config.session.max_sessions_per_service);
    parsed!("SWITCHBOARD_DEFAULT_TIMEOUT_MS", config.failover.default_timeout_ms);
    parsed!("SWITCHBOARD_CACHE_TTL_SECS", config.cache.ttl_secs);

    if let Some(raw) = lookup("SWITCHBOARD_RATE_LIMIT_RPH") {
        match raw.trim().parse::<u32>() {
            Ok(rph) => {
                config.rate_limit.requests_per_hour = Some(rph);
                applied = true;
            }
            Err(_) => tracing::warn!(var = "SWITCHBOARD_RATE_LIMIT_RPH", value = %raw, "Ignoring unparseable value"),
        }
    }
    if let Some(raw) = lookup("SWITCHBOARD_RATE_LIMIT_ALGORITHM") {
        match raw.parse::<RateLimitAlgorithm>() {
            Ok(algorithm) => {
                config.rate_limit.algorithm = algorithm;
                applied = true;
            }
            Err(e) => tracing::warn!(var = "SWITCHBOARD_RATE_LIMIT_ALGORITHM", error = %e, "Ignoring value"),
        }
    }
    if let Some(raw) = lookup("SWITCHBOARD_RATE_LIMIT_ENABLED") {
        config.rate_limit.enabled = parse_bool(raw.trim());
        applied = true;
    }
    if let Some(raw) = lookup("SWITCHBOARD_CACHE_ENABLED") {
        config.cache.enabled = parse_bool(raw.trim());
        applied = true;
    }

    if applied {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Command-line overrides, applied last
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Default requests per minute
    pub requests_per_minute: Option<u32>,
    /// Turn rate limiting off
    pub disable_rate_limit: bool,
    /// Pool size per provider
    pub max_connections: Option<usize>,
    /// Default overall deadline (ms)
    pub default_timeout_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default requests per minute
    #[must_use]
    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = Some(rpm);
        self
    }

    /// Turn rate limiting off
    #[must_use]
    pub fn without_rate_limit(mut self) -> Self {
        self.disable_rate_limit = true;
        self
    }

    /// Set the pool size per provider
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Set the default overall deadline
    #[must_use]
    pub fn with_default_timeout_ms(mut self, ms: u64) -> Self {
        self.default_timeout_ms = Some(ms);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut SwitchboardConfig) {
        if self.requests_per_minute.is_some()
            || self.disable_rate_limit
            || self.max_connections.is_some()
            || self.default_timeout_ms.is_some()
        {
            config.source = ConfigSource::Cli;
        }
        if let Some(rpm) = self.requests_per_minute {
            config.rate_limit.requests_per_minute = rpm;
        }
        if self.disable_rate_limit {
            config.rate_limit.enabled = false;
        }
        if let Some(max) = self.max_connections {
            config.pool.max_connections = max;
        }
        if let Some(ms) = self.default_timeout_ms {
            config.failover.default_timeout_ms = ms;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
