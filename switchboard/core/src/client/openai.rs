//! OpenAI-compatible client
//!
//! Speaks the `/v1/chat/completions`, `/v1/embeddings` and `/v1/models`
//! endpoints shared by OpenAI and the many services that copy its API.
//!
//! Actions:
//! - `chat` / `complete`: POST the input to the chat completions endpoint
//! - `embed`: POST the input to the embeddings endpoint
//! - `models`: list available models
//!
//! The input is forwarded as the request body. When it has no `model` field
//! the configured `default_model` is filled in.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use super::http::HttpChannel;
use super::{ServiceClient, ServiceError};
use crate::provider::ServiceConfig;

const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Options read from the provider's `extra` table
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OpenAiOptions {
    /// Model used when the input does not name one
    pub default_model: Option<String>,
    /// Chat completions path
    pub chat_path: String,
    /// Embeddings path
    pub embeddings_path: String,
    /// Model listing path (also the health check)
    pub models_path: String,
}

impl Default for OpenAiOptions {
    fn default() -> Self {
        Self {
            default_model: None,
            chat_path: "/v1/chat/completions".to_string(),
            embeddings_path: "/v1/embeddings".to_string(),
            models_path: "/v1/models".to_string(),
        }
    }
}

/// Client for OpenAI-compatible APIs
#[derive(Debug)]
pub struct OpenAiClient {
    provider_id: String,
    channel: HttpChannel,
    options: OpenAiOptions,
}

impl OpenAiClient {
    /// Build from configuration; fails on missing credentials or bad options
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        if config.auth.is_none() && config.endpoint.is_none() {
            return Err(ServiceError::Configuration(format!(
                "provider '{}' needs credentials for the hosted API",
                config.id
            )));
        }
        Ok(Self {
            provider_id: config.id.clone(),
            channel: HttpChannel::new(config, Some(DEFAULT_BASE_URL))?,
            options: config.extra_as()?,
        })
    }

    fn with_default_model(&self, input: &Value) -> Result<Value, ServiceError> {
        let mut body = match input {
            Value::Object(_) => input.clone(),
            Value::Null => Value::Object(serde_json::Map::new()),
            _ => {
                return Err(ServiceError::Configuration(
                    "request body must be a JSON object".to_string(),
                ))
            }
        };
        if let (Value::Object(map), Some(model)) = (&mut body, &self.options.default_model) {
            map.entry("model")
                .or_insert_with(|| Value::String(model.clone()));
        }
        Ok(body)
    }
}

#[async_trait]
impl ServiceClient for OpenAiClient {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn kind(&self) -> &str {
        "openai"
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
        self.channel.get_json(&self.options.models_path).await.map(|_| ())
    }

    async fn call(&self, action: &str, input: &Value) -> Result<Value, ServiceError> {
        match action {
            "chat" | "complete" => {
                let body = self.with_default_model(input)?;
                self.channel.post_json(&self.options.chat_path, &body).await
            }
            "embed" => {
                let body = self.with_default_model(input)?;
                self.channel.post_json(&self.options.embeddings_path, &body).await
            }
            "models" => self.channel.get_json(&self.options.models_path).await,
            other => Err(ServiceError::UnsupportedAction(other.to_string())),
        }
    }
}
