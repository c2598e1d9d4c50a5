//! Generic HTTP+JSON integration client
//!
//! Covers providers that expose a plain JSON API (OCR engines, search,
//! storage, chat webhooks). Routes are declared in the provider's `extra`
//! table:
//!
//! ```toml
//! [[providers]]
//! id = "ocr-space"
//! capability = "ocr"
//! kind = "http_json"
//! endpoint = "https://api.ocr.example"
//!
//! [providers.extra]
//! health_path = "/status"
//!
//! [providers.extra.actions.extract]
//! method = "POST"
//! path = "/parse/image"
//! ```
//!
//! Undeclared actions map to `POST /<action>` unless `strict_actions` is set.

use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::Value;

use super::http::HttpChannel;
use super::{ServiceClient, ServiceError};
use crate::provider::ServiceConfig;

/// One declared action
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
pub struct ActionRoute {
    /// HTTP method (default `POST`)
    #[serde(default = "default_method")]
    pub method: String,
    /// Path below the endpoint
    pub path: String,
}

fn default_method() -> String {
    "POST".to_string()
}

/// Options read from the provider's `extra` table
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct HttpJsonOptions {
    /// Path probed by `test`
    pub health_path: String,
    /// Declared actions
    pub actions: HashMap<String, ActionRoute>,
    /// Reject actions that are not declared
    pub strict_actions: bool,
}

impl Default for HttpJsonOptions {
    fn default() -> Self {
        Self {
            health_path: "/".to_string(),
            actions: HashMap::new(),
            strict_actions: false,
        }
    }
}

/// Client for plain JSON APIs
#[derive(Debug)]
pub struct HttpJsonClient {
    provider_id: String,
    channel: HttpChannel,
    options: HttpJsonOptions,
}

impl HttpJsonClient {
    /// Build from configuration; the provider must have an endpoint
    pub fn from_config(config: &ServiceConfig) -> Result<Self, ServiceError> {
        let options: HttpJsonOptions = config.extra_as()?;
        for (name, route) in &options.actions {
            parse_method(&route.method).map_err(|e| {
                ServiceError::Configuration(format!("provider '{}' action '{name}': {e}", config.id))
            })?;
        }
        Ok(Self {
            provider_id: config.id.clone(),
            channel: HttpChannel::new(config, None)?,
            options,
        })
    }

    fn route(&self, action: &str) -> Result<(Method, String), ServiceError> {
        match self.options.actions.get(action) {
            Some(route) => {
                let method = parse_method(&route.method).map_err(ServiceError::Configuration)?;
                Ok((method, route.path.clone()))
            }
            None if self.options.strict_actions => {
                Err(ServiceError::UnsupportedAction(action.to_string()))
            }
            None => Ok((Method::POST, format!("/{}", action.trim_start_matches('/')))),
        }
    }
}

fn parse_method(method: &str) -> Result<Method, String> {
    match method.to_ascii_uppercase().as_str() {
        "GET" => Ok(Method::GET),
        "POST" => Ok(Method::POST),
        "PUT" => Ok(Method::PUT),
        "PATCH" => Ok(Method::PATCH),
        "DELETE" => Ok(Method::DELETE),
        other => Err(format!("unsupported HTTP method '{other}'")),
    }
}

#[async_trait]
impl ServiceClient for HttpJsonClient {
    fn provider_id(&self) -> &str {
        &self.provider_id
    }

    fn kind(&self) -> &str {
        "http_json"
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
        self.channel
            .get_json(&self.options.health_path)
            .await
            .map(|_| ())
    }

    async fn call(&self, action: &str, input: &Value) -> Result<Value, ServiceError> {
        let (method, path) = self.route(action)?;
        let body = (!input.is_null()).then_some(input);
        self.channel.request(method, &path, body).await
    }
}
