//! Broker Errors
//!
//! Callers see one error type, [`BrokerError`], whatever went wrong. The
//! [`ErrorKind`] classifier separates the failure families a caller reacts
//! to differently:
//!
//! | Kind                    | Meaning                                          |
//! |-------------------------|--------------------------------------------------|
//! | `Transient`             | Worth retrying; handled inside the retry loop    |
//! | `Provider`              | One provider failed for good; failover moved on  |
//! | `AllProvidersExhausted` | Every enabled provider failed                    |
//! | `Configuration`         | Bad credentials, unknown kind, nothing enabled   |
//! | `ResourceExhausted`     | Pool or rate-limit wait ran out                  |
//! | `Timeout`               | The caller's overall deadline passed             |

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;

/// Failure family
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable provider failure
    Transient,
    /// Permanent failure of one provider
    Provider,
    /// No provider could serve the request
    AllProvidersExhausted,
    /// Invalid configuration or credentials
    Configuration,
    /// Pool or rate-limit capacity unavailable in time
    ResourceExhausted,
    /// Overall deadline exceeded
    Timeout,
}

/// Errors returned by the broker
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Every enabled provider for the capability failed
    #[error(
        "all {providers} provider(s) for '{capability}' failed after {attempts} attempt(s); \
         last error from '{last_provider}': {last_error}"
    )]
    AllProvidersExhausted {
        /// Capability requested
        capability: String,
        /// Attempts made across all providers
        attempts: u32,
        /// Providers tried
        providers: usize,
        /// Provider whose error is reported
        last_provider: String,
        /// Message of the final error
        last_error: String,
    },

    /// The capability has no enabled provider
    #[error("no enabled providers for '{0}'")]
    NoEnabledProviders(String),

    /// Provider id not in the catalog
    #[error("unknown provider '{0}'")]
    UnknownProvider(String),

    /// Invalid configuration or credentials
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Every attempt was refused for lack of pool or rate-limit capacity
    #[error("resources exhausted for '{capability}': {message}")]
    ResourceExhausted {
        /// Capability requested
        capability: String,
        /// What ran out
        message: String,
    },

    /// The overall deadline passed
    #[error("'{capability}' timed out after {elapsed:?}")]
    Timeout {
        /// Capability requested
        capability: String,
        /// Time spent before giving up
        elapsed: Duration,
    },

    /// The broker has been shut down
    #[error("broker is shut down")]
    ShutDown,

    /// Loading configuration failed
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BrokerError {
    /// Failure family of this error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AllProvidersExhausted { .. } => ErrorKind::AllProvidersExhausted,
            Self::NoEnabledProviders(_)
            | Self::UnknownProvider(_)
            | Self::Configuration(_)
            | Self::Config(_) => ErrorKind::Configuration,
            Self::ResourceExhausted { .. } | Self::ShutDown => ErrorKind::ResourceExhausted,
            Self::Timeout { .. } => ErrorKind::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_message_names_last_provider() {
        let err = BrokerError::AllProvidersExhausted {
            capability: "ocr".into(),
            attempts: 4,
            providers: 2,
            last_provider: "b".into(),
            last_error: "HTTP 503: down".into(),
        };
        let message = err.to_string();
        assert!(message.contains("'b'"));
        assert!(message.contains("HTTP 503: down"));
        assert_eq!(err.kind(), ErrorKind::AllProvidersExhausted);
    }

    #[test]
    fn test_kinds() {
        assert_eq!(BrokerError::NoEnabledProviders("ai".into()).kind(), ErrorKind::Configuration);
        assert_eq!(
            BrokerError::ResourceExhausted { capability: "ai".into(), message: String::new() }.kind(),
            ErrorKind::ResourceExhausted
        );
        assert_eq!(
            BrokerError::Timeout { capability: "ai".into(), elapsed: Duration::ZERO }.kind(),
            ErrorKind::Timeout
        );
        assert_eq!(BrokerError::ShutDown.kind(), ErrorKind::ResourceExhausted);
        assert_eq!(BrokerError::UnknownProvider("p".into()).kind(), ErrorKind::Configuration);
    }
}
