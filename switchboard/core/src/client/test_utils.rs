//! Scripted provider clients for unit tests
//!
//! A [`Script`] is shared by every [`StubClient`] the pool opens for one
//! provider, so call counts and queued responses survive reconnects.
//!
//! ```ignore
//! let book = ScriptBook::default();
//! book.set("a", Script::failing(ServiceError::Http { status: 503, message: "down".into() }));
//! book.set("b", Script::ok());
//! let registry = book.registry();
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};

use super::{ClientRegistry, ServiceClient, ServiceError};

/// Kind string the stub factory is registered under
pub(crate) const STUB_KIND: &str = "stub";

#[derive(Debug)]
struct ScriptState {
    queued: Mutex<VecDeque<Result<Value, ServiceError>>>,
    fallback: Mutex<Result<Value, ServiceError>>,
    connect_error: Mutex<Option<ServiceError>>,
    latency: Mutex<Duration>,
    calls: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    tests: AtomicUsize,
}

/// Shared behaviour for one provider's stub clients
#[derive(Clone, Debug)]
pub(crate) struct Script {
    state: Arc<ScriptState>,
}

impl Script {
    fn with_fallback(fallback: Result<Value, ServiceError>) -> Self {
        Self {
            state: Arc::new(ScriptState {
                queued: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(fallback),
                connect_error: Mutex::new(None),
                latency: Mutex::new(Duration::ZERO),
                calls: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
                tests: AtomicUsize::new(0),
            }),
        }
    }

    /// Always answers `{"ok": true}`
    pub(crate) fn ok() -> Self {
        Self::with_fallback(Ok(json!({"ok": true})))
    }

    /// Always fails with `error`
    pub(crate) fn failing(error: ServiceError) -> Self {
        Self::with_fallback(Err(error))
    }

    /// Queue a one-off response ahead of the fallback
    pub(crate) fn then(self, result: Result<Value, ServiceError>) -> Self {
        self.state.queued.lock().push_back(result);
        self
    }

    /// Make `connect` fail
    pub(crate) fn with_connect_error(self, error: ServiceError) -> Self {
        *self.state.connect_error.lock() = Some(error);
        self
    }

    /// Delay every call and test
    pub(crate) fn with_latency(self, latency: Duration) -> Self {
        *self.state.latency.lock() = latency;
        self
    }

    /// Calls made so far
    pub(crate) fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Successful and failed connects
    pub(crate) fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Disconnects
    pub(crate) fn disconnects(&self) -> usize {
        self.state.disconnects.load(Ordering::SeqCst)
    }

    /// Health checks
    pub(crate) fn tests(&self) -> usize {
        self.state.tests.load(Ordering::SeqCst)
    }

    fn next(&self) -> Result<Value, ServiceError> {
        self.state
            .queued
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.state.fallback.lock().clone())
    }

    async fn pause(&self) {
        let latency = *self.state.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

/// Client whose behaviour comes from a [`Script`]
#[derive(Debug)]
pub(crate) struct StubClient {
    id: String,
    script: Script,
    connected: AtomicBool,
}

impl StubClient {
    pub(crate) fn new(id: &str, script: Script) -> Self {
        Self {
            id: id.to_string(),
            script,
            connected: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ServiceClient for StubClient {
    fn provider_id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        STUB_KIND
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), ServiceError> {
        self.script.state.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.script.state.connect_error.lock().clone() {
            return Err(error);
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.script.state.disconnects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn test(&self) -> Result<(), ServiceError> {
        self.script.state.tests.fetch_add(1, Ordering::SeqCst);
        self.script.pause().await;
        self.script.next().map(|_| ())
    }

    async fn call(&self, _action: &str, _input: &Value) -> Result<Value, ServiceError> {
        if !self.is_connected() {
            return Err(ServiceError::NotConnected);
        }
        self.script.state.calls.fetch_add(1, Ordering::SeqCst);
        self.script.pause().await;
        self.script.next()
    }
}

/// Scripts keyed by provider id
#[derive(Clone, Debug, Default)]
pub(crate) struct ScriptBook {
    scripts: Arc<Mutex<HashMap<String, Script>>>,
}

impl ScriptBook {
    /// Assign a script to a provider
    pub(crate) fn set(&self, provider: &str, script: Script) -> Script {
        self.scripts
            .lock()
            .insert(provider.to_string(), script.clone());
        script
    }

    /// Registry whose `stub` factory serves these scripts
    pub(crate) fn registry(&self) -> ClientRegistry {
        let registry = ClientRegistry::empty();
        let scripts = self.scripts.clone();
        registry.register(STUB_KIND, move |config| {
            let script = scripts
                .lock()
                .get(&config.id)
                .cloned()
                .ok_or_else(|| ServiceError::Configuration(format!("no script for '{}'", config.id)))?;
            Ok(Arc::new(StubClient::new(&config.id, script)) as Arc<dyn ServiceClient>)
        });
        registry
    }
}
