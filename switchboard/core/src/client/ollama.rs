//! Ollama client
//!
//! Local model server API:
//! - `/api/generate` - single-prompt completion (`generate`)
//! - `/api/chat` - chat with message history (`chat`)
//! - `/api/embed` - embeddings (`embed`)
//! - `/api/tags` - installed models (`models`, also the health check)
//!
//! Responses are requested unstreamed.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::http::HttpChannel;
use super::{ServiceClient, ServiceError};
use crate::provider::ServiceConfig;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Options read from the provider's `extra` table
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct OllamaOptions {
    /// Model used when the input does not name one
    pub default_model: Option<String>,
    /// How long the server keeps the model loaded (e.g. `"5m"`)
    pub keep_alive: Option<String>,
}

/// Client for Ollama servers
#[derive(Debug)]
pub struct OllamaClient {
    provider_id: String,
    channel: HttpChannel,
    options: OllamaOptions,
}

impl OllamaClient {
    /// Build from configuration
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        Ok(Self {
            provider_id: config.id.clone(),
            channel: HttpChannel::new(config, Some(DEFAULT_BASE_URL))?,
            options: config.extra_as()?,
        })
    }

    fn request_body(&self, input: &Value) -> Result<Value, ServiceError> {
        let mut map = match input {
            Value::Object(map) => map.clone(),
            Value::Null => serde_json::Map::new(),
            _ => {
                return Err(ServiceError::Configuration(
                    "request body must be a JSON object".to_string(),
                ))
            }
        };
        map.insert("stream".to_string(), Value::Bool(false));
        if let Some(model) = &self.options.default_model {
            map.entry("model")
                .or_insert_with(|| Value::String(model.clone()));
        }
        if let Some(keep_alive) = &self.options.keep_alive {
            map.entry("keep_alive")
                .or_insert_with(|| Value::String(keep_alive.clone()));
        }
        if !map.contains_key("model") {
            return Err(ServiceError::Configuration(format!(
                "provider '{}' request names no model and no default_model is configured",
                self.provider_id
            )));
        }
        Ok(Value::Object(map))
    }
}

#[async_trait]
impl ServiceClient for OllamaClient {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn kind(&self) -> &str {
        "ollama"
    }

    fn is_connected(&self) -> bool {
        self.channel.is_connected()
    }

    async fn connect(&self) -> Result<(), ServiceError> {
        self.channel.connect()
    }

    async fn disconnect(&self) {
        self.channel.disconnect();
    }

    async fn test(&self) -> Result<(), ServiceError> {
        self.channel.get_json("/api/tags").await.map(|_| ())
    }

    async fn call(&self, action: &str, input: &Value) -> Result<Value, ServiceError> {
        let path = match action {
            "generate" => "/api/generate",
            "chat" => "/api/chat",
            "embed" => "/api/embed",
            "models" => return self.channel.get_json("/api/tags").await,
            other => return Err(ServiceError::UnsupportedAction(other.to_string())),
        };
        let body = self.request_body(input)?;
        self.channel.post_json(path, &body).await
    }
}
