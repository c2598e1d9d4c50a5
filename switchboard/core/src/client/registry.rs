//! Client factory registry
//!
//! Maps a provider kind string to a factory turning a [`ServiceConfig`] into
//! a [`ServiceClient`]. Factories validate configuration and resolve secrets
//! without touching the network.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use super::{HttpJsonClient, OllamaClient, OpenAiClient, ServiceClient, ServiceError};
use crate::provider::ServiceConfig;

/// Builds a client for one provider
pub type ClientFactory =
    Arc<dyn Fn(&ServiceConfig) -> Result<Arc<dyn ServiceClient>, ServiceError> + Send + Sync>;

/// Factories keyed by provider kind
pub struct ClientRegistry {
    factories: RwLock<HashMap<String, ClientFactory>>,
}

impl std::fmt::Debug for ClientRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

impl Default for ClientRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl ClientRegistry {
    /// Registry with no factories
    #[must_use]
    pub fn empty() -> Self {
        Self {
            factories: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the `openai`, `ollama` and `http_json` clients
    #[must_use]
    pub fn with_builtin() -> Self {
        let registry = Self::empty();
        registry.register("openai", |config| {
            Ok(Arc::new(OpenAiClient::from_config(config)?) as Arc<dyn ServiceClient>)
        });
        registry.register("ollama", |config| {
            Ok(Arc::new(OllamaClient::from_config(config)?) as Arc<dyn ServiceClient>)
        });
        registry.register("http_json", |config| {
            Ok(Arc::new(HttpJsonClient::from_config(config)?) as Arc<dyn ServiceClient>)
        });
        registry
    }

    /// Add or replace the factory for `kind`
    pub fn register<F>(&self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&ServiceConfig) -> Result<Arc<dyn ServiceClient>, ServiceError> + Send + Sync + 'static,
    {
        let kind = kind.into();
        tracing::debug!(kind = %kind, "Registered client factory");
        self.factories.write().insert(kind, Arc::new(factory));
    }

    /// Whether `kind` has a factory
    #[must_use]
    pub fn supports(&self, kind: &str) -> bool {
        self.factories.read().contains_key(kind)
    }

    /// Registered kinds, sorted
    #[must_use]
    pub fn kinds(&self) -> Vec<String> {
        let mut kinds: Vec<_> = self.factories.read().keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Build an unconnected client for `config`
    pub fn create(&self, config: &ServiceConfig) -> Result<Arc<dyn ServiceClient>, ServiceError> {
        let factory = self.factories.read().get(&config.kind).cloned();
        match factory {
            Some(factory) => factory(config),
            None => Err(ServiceError::Configuration(format!(
                "no client registered for provider kind '{}'",
                config.kind
            ))),
        }
    }
}
