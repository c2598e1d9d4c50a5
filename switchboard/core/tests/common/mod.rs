//! Shared fixtures for the integration tests
//!
//! [`FakeProvider`] plays the role of an external service: each provider id
//! gets a queue of canned answers (falling back to a fixed answer once the
//! queue runs dry) and counters the tests assert on.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use switchboard_core::{
    Broker, ClientRegistry, ServiceClient, ServiceConfig, ServiceError, SwitchboardConfig,
};

/// Provider kind served by [`FakeFleet`]
pub const FAKE_KIND: &str = "fake";

/// Behaviour and counters for one fake provider
#[derive(Debug)]
pub struct FakeProvider {
    answers: Mutex<VecDeque<Result<Value, ServiceError>>>,
    fallback: Result<Value, ServiceError>,
    latency: Duration,
    pub calls: AtomicUsize,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
}

impl FakeProvider {
    /// Answers `{"provider": id}` forever
    pub fn healthy(id: &str) -> Self {
        Self::new(Ok(json!({ "provider": id })))
    }

    /// Fails with `error` forever
    pub fn broken(error: ServiceError) -> Self {
        Self::new(Err(error))
    }

    fn new(fallback: Result<Value, ServiceError>) -> Self {
        Self {
            answers: Mutex::new(VecDeque::new()),
            fallback,
            latency: Duration::ZERO,
            calls: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    /// Queue `answer` ahead of the fallback
    pub fn then(self, answer: Result<Value, ServiceError>) -> Self {
        self.answers.lock().push_back(answer);
        self
    }

    /// Take `latency` to answer
    pub fn slow(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn answer(&self) -> Result<Value, ServiceError> {
        self.answers
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

/// Set of fake providers keyed by id
#[derive(Clone, Debug, Default)]
pub struct FakeFleet {
    providers: Arc<Mutex<HashMap<String, Arc<FakeProvider>>>>,
}

impl FakeFleet {
    pub fn add(&self, id: &str, provider: FakeProvider) -> Arc<FakeProvider> {
        let provider = Arc::new(provider);
        self.providers.lock().insert(id.to_string(), provider.clone());
        provider
    }

    /// Registry with a `fake` factory backed by this fleet
    pub fn registry(&self) -> ClientRegistry {
        let registry = ClientRegistry::empty();
        let providers = self.providers.clone();
        registry.register(FAKE_KIND, move |config: &ServiceConfig| {
            let Some(provider) = providers.lock().get(&config.id).cloned() else {
                return Err(ServiceError::Configuration(format!(
                    "fleet has no provider '{}'",
                    config.id
                )));
            };
            Ok(Arc::new(FakeClient {
                id: config.id.clone(),
                provider,
            }) as Arc<dyn ServiceClient>)
        });
        registry
    }

    /// Broker over this fleet
    pub fn broker(&self, config: SwitchboardConfig) -> Broker {
        match Broker::builder(config).with_registry(self.registry()).build() {
            Ok(broker) => broker,
            Err(e) => panic!("failed to build broker: {e}"),
        }
    }
}

struct FakeClient {
    id: String,
    provider: Arc<FakeProvider>,
}

#[async_trait]
impl ServiceClient for FakeClient {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        FAKE_KIND
    }

    fn is_connected(&self) -> bool {
        true
    }

    async fn connect(&self) -> Result<(), ServiceError> {
        self.provider.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.provider.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    async fn test(&self) -> Result<(), ServiceError> {
        self.provider.answer().map(|_| ())
    }

    async fn call(&self, _action: &str, _input: &Value) -> Result<Value, ServiceError> {
        self.provider.calls.fetch_add(1, Ordering::SeqCst);
        if !self.provider.latency.is_zero() {
            tokio::time::sleep(self.provider.latency).await;
        }
        self.provider.answer()
    }
}

/// Provider record served by the fleet, never retried on the same provider
pub fn fake(id: &str, capability: &str, priority: i32) -> ServiceConfig {
    ServiceConfig::new(id, capability, FAKE_KIND)
        .with_priority(priority)
        .with_retry_policy("none")
}

/// An HTTP 503 from the provider
pub fn unavailable() -> ServiceError {
    ServiceError::Http {
        status: 503,
        message: "service unavailable".to_string(),
    }
}
