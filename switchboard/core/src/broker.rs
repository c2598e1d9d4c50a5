//! Broker
//!
//! The entry point application code talks to. A [`Broker`] owns the provider
//! catalog, the failover orchestrator with its rate limiters, pool and retry
//! table, the session manager, the result cache and the background
//! maintenance tasks.
//!
//! ```text
//!   execute(capability, action, input)
//!        │
//!        ├── ResultCache ── hit ──► OperationResult (cached)
//!        │
//!        └── FailoverOrchestrator
//!               ├── CompositeRateLimiter   (per provider)
//!               ├── ConnectionPool         (per provider)
//!               ├── RetryExecutor          (per provider run)
//!               └── StatsRecorder ──► StatsSink
//! ```
//!
//! Lifecycle: [`BrokerBuilder::build`] validates configuration and creates
//! no tasks; [`Broker::start`] spawns the pool, session and cache sweeps;
//! [`Broker::shutdown`] stops them and drains the pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use crate::cache::ResultCache;
use crate::client::{ClientRegistry, OperationResult, PooledClient, ServiceClient, ServiceError};
use crate::config::SwitchboardConfig;
use crate::error::BrokerError;
use crate::failover::{ExecuteOptions, FailoverOrchestrator};
use crate::provider::{AuthConfig, ProviderCatalog, ServiceConfig};
use crate::resilience::pool::{ConnectionPool, PoolStatus};
use crate::resilience::rate_limit::CompositeRateLimiter;
use crate::session::SessionManager;
use crate::stats::{LogStatsSink, ProviderStats, StatsRecorder, StatsSink};
use crate::tasks::PeriodicTask;

// ============================================================================
// Builder
// ============================================================================

/// Assembles a [`Broker`]
pub struct BrokerBuilder {
    config: SwitchboardConfig,
    registry: ClientRegistry,
    sink: Arc<dyn StatsSink>,
}

impl BrokerBuilder {
    /// Builder with the built-in client kinds and a logging stats sink
    #[must_use]
    pub fn new(config: SwitchboardConfig) -> Self {
        Self {
            config,
            registry: ClientRegistry::with_builtin(),
            sink: Arc::new(LogStatsSink),
        }
    }

    /// Replace the client registry
    #[must_use]
    pub fn with_registry(mut self, registry: ClientRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Add a client factory for `kind`
    #[must_use]
    pub fn with_client_factory<F>(self, kind: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&ServiceConfig) -> Result<Arc<dyn ServiceClient>, ServiceError> + Send + Sync + 'static,
    {
        self.registry.register(kind, factory);
        self
    }

    /// Send stats updates to `sink`
    #[must_use]
    pub fn with_stats_sink(mut self, sink: Arc<dyn StatsSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Validate configuration and assemble the broker
    ///
    /// # Errors
    ///
    /// Configuration errors: invalid sections, duplicate ids, or a provider
    /// kind with no registered client factory.
    pub fn build(self) -> Result<Broker, BrokerError> {
        let Self { config, registry, sink } = self;
        config.validate()?;

        for provider in &config.providers {
            if !registry.supports(&provider.kind) {
                return Err(BrokerError::Configuration(format!(
                    "provider '{}' has kind '{}' but no client is registered for it (known: {})",
                    provider.id,
                    provider.kind,
                    registry.kinds().join(", ")
                )));
            }
        }

        let catalog = Arc::new(ProviderCatalog::new(config.providers.clone())?);
        let stats = Arc::new(StatsRecorder::new(sink, config.failover.stats_ema_alpha));
        let limiter = Arc::new(CompositeRateLimiter::from_config(&config.rate_limit));
        let pool = Arc::new(ConnectionPool::<PooledClient>::new(config.pool.clone()));

        let orchestrator = FailoverOrchestrator::new(catalog.clone(), Arc::new(registry), stats)
            .with_limiter(limiter, config.rate_limit.max_wait())
            .with_pool(pool)
            .with_retry_table(config.retry.clone())
            .with_config(config.failover.clone());
        for provider in catalog.all() {
            orchestrator.apply_rate_limits(&provider);
        }

        tracing::info!(
            providers = catalog.len(),
            capabilities = ?catalog.capabilities(),
            "Broker configured"
        );

        Ok(Broker {
            sessions: Arc::new(SessionManager::new(config.session.clone())),
            cache: Arc::new(ResultCache::new(config.cache.clone())),
            config,
            orchestrator,
            tasks: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        })
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Resilient multi-provider broker
pub struct Broker {
    config: SwitchboardConfig,
    orchestrator: FailoverOrchestrator,
    sessions: Arc<SessionManager>,
    cache: Arc<ResultCache>,
    tasks: Mutex<Vec<PeriodicTask>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("orchestrator", &self.orchestrator)
            .field("sessions", &self.sessions.len())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

impl Broker {
    /// Builder for `config`
    #[must_use]
    pub fn builder(config: SwitchboardConfig) -> BrokerBuilder {
        BrokerBuilder::new(config)
    }

    /// Configuration the broker was built from
    #[must_use]
    pub fn config(&self) -> &SwitchboardConfig {
        &self.config
    }

    /// Whether `shutdown` has run
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn ensure_running(&self) -> Result<(), BrokerError> {
        if self.is_shut_down() {
            Err(BrokerError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Spawn the background sweeps; calling it again does nothing
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() || self.is_shut_down() {
            return;
        }

        tasks.push(self.orchestrator.pool().spawn_sweeper());
        self.sessions.start_sweeper();

        if self.cache.is_enabled() {
            let cache = Arc::downgrade(&self.cache);
            tasks.push(PeriodicTask::spawn("cache-purge", self.config.cache.ttl(), move || {
                let cache = cache.clone();
                async move {
                    match cache.upgrade() {
                        Some(cache) => {
                            cache.purge_expired();
                            true
                        }
                        None => false,
                    }
                }
            }));
        }
        tracing::info!("Broker started");
    }

    /// Stop background work, close every pooled client and refuse further
    /// requests
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            task.shutdown().await;
        }
        self.sessions.shutdown().await;
        let closed = self.orchestrator.pool().drain().await;
        self.cache.clear();
        tracing::info!(closed, "Broker shut down");
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Run `action` against the first healthy provider of `capability`
    ///
    /// # Errors
    ///
    /// See [`BrokerError`]; `kind()` tells configuration problems, resource
    /// shortfalls, timeouts and provider exhaustion apart.
    pub async fn execute(
        &self,
        capability: &str,
        action: &str,
        input: &Value,
        options: ExecuteOptions,
    ) -> Result<OperationResult, BrokerError> {
        self.ensure_running()?;

        let cache_key = (!options.skip_cache && self.cache.is_enabled())
            .then(|| ResultCache::key(capability, action, input));
        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key) {
                tracing::debug!(capability = %capability, action = %action, "Cache hit");
                return Ok(OperationResult::success(hit.data, std::time::Duration::ZERO)
                    .with_provider(hit.provider)
                    .from_cache());
            }
        }

        let success = self
            .orchestrator
            .execute(capability, action, input, &options)
            .await?;

        if let Some(key) = cache_key {
            self.cache.insert(key, &success.provider, success.data.clone());
        }
        Ok(OperationResult::success(success.data, success.elapsed)
            .with_provider(success.provider)
            .with_attempts(success.attempts))
    }

    /// [`execute`](Self::execute) with every error folded into a failed
    /// [`OperationResult`]
    pub async fn execute_result(
        &self,
        capability: &str,
        action: &str,
        input: &Value,
        options: ExecuteOptions,
    ) -> OperationResult {
        let started = tokio::time::Instant::now();
        match self.execute(capability, action, input, options).await {
            Ok(result) => result,
            Err(e) => {
                let kind = e.kind();
                OperationResult::failure(e, kind, started.elapsed()).with_attempts(0)
            }
        }
    }

    /// Open a pooled client for a provider
    ///
    /// # Errors
    ///
    /// Unknown provider or shut-down broker.
    pub async fn connect(&self, provider_id: &str) -> Result<OperationResult, BrokerError> {
        self.ensure_running()?;
        self.orchestrator.connect_provider(provider_id).await
    }

    /// Close a provider's pooled clients
    ///
    /// # Errors
    ///
    /// Unknown provider or shut-down broker.
    pub async fn disconnect(&self, provider_id: &str) -> Result<OperationResult, BrokerError> {
        self.ensure_running()?;
        self.orchestrator.disconnect_provider(provider_id).await
    }

    /// Health-check one provider
    ///
    /// # Errors
    ///
    /// Unknown provider or shut-down broker.
    pub async fn test(&self, provider_id: &str) -> Result<OperationResult, BrokerError> {
        self.ensure_running()?;
        self.orchestrator.health_check(provider_id).await
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Pool snapshot per provider
    #[must_use]
    pub fn pool_status(&self) -> HashMap<String, PoolStatus> {
        self.orchestrator.pool().status()
    }

    /// Live sessions per service type
    #[must_use]
    pub fn session_stats(&self) -> HashMap<String, usize> {
        self.sessions.session_stats()
    }

    /// Session manager
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Statistics for every provider attempted so far
    #[must_use]
    pub fn provider_stats(&self) -> Vec<ProviderStats> {
        self.orchestrator.stats().snapshot()
    }

    /// Every provider record
    #[must_use]
    pub fn providers(&self) -> Vec<ServiceConfig> {
        self.orchestrator.catalog().all()
    }

    // ========================================================================
    // Administration
    // ========================================================================

    /// Enable or disable a provider; disabling closes its idle clients
    ///
    /// # Errors
    ///
    /// Unknown provider.
    pub async fn set_provider_enabled(&self, provider_id: &str, enabled: bool) -> Result<(), BrokerError> {
        self.orchestrator.catalog().set_enabled(provider_id, enabled)?;
        if !enabled {
            self.orchestrator.pool().evict_key(provider_id).await;
        }
        tracing::info!(provider = %provider_id, enabled, "Provider availability changed");
        Ok(())
    }

    /// Change a provider's priority
    ///
    /// # Errors
    ///
    /// Unknown provider.
    pub fn set_provider_priority(&self, provider_id: &str, priority: i32) -> Result<(), BrokerError> {
        self.orchestrator.catalog().set_priority(provider_id, priority)?;
        tracing::info!(provider = %provider_id, priority, "Provider reprioritized");
        Ok(())
    }

    /// Replace a provider's credentials; pooled clients built with the old
    /// ones are closed
    ///
    /// # Errors
    ///
    /// Unknown provider, or a credential that does not resolve.
    pub async fn rotate_credentials(&self, provider_id: &str, auth: AuthConfig) -> Result<(), BrokerError> {
        auth.resolve()
            .map_err(|e| BrokerError::Configuration(format!("provider '{provider_id}': {e}")))?;
        self.orchestrator.catalog().rotate_credentials(provider_id, auth)?;
        self.orchestrator.pool().evict_key(provider_id).await;
        tracing::info!(provider = %provider_id, "Provider credentials rotated");
        Ok(())
    }

    /// Add or replace a provider record
    ///
    /// # Errors
    ///
    /// Invalid record or unsupported kind.
    pub async fn upsert_provider(&self, provider: ServiceConfig) -> Result<(), BrokerError> {
        if !self.orchestrator.registry().supports(&provider.kind) {
            return Err(BrokerError::Configuration(format!(
                "no client is registered for provider kind '{}'",
                provider.kind
            )));
        }
        if let Some(policy) = &provider.retry_policy {
            if self.config.retry.get(policy).is_none() {
                return Err(BrokerError::Configuration(format!("unknown retry policy '{policy}'")));
            }
        }

        let id = provider.id.clone();
        let previous = self.orchestrator.catalog().upsert(provider.clone())?;
        if previous.is_some() {
            self.orchestrator.pool().evict_key(&id).await;
        }
        self.orchestrator.apply_rate_limits(&provider);
        tracing::info!(provider = %id, replaced = previous.is_some(), "Provider upserted");
        Ok(())
    }

    /// Remove a provider and everything held for it
    ///
    /// # Errors
    ///
    /// Unknown provider.
    pub async fn remove_provider(&self, provider_id: &str) -> Result<ServiceConfig, BrokerError> {
        let removed = self
            .orchestrator
            .catalog()
            .remove(provider_id)
            .ok_or_else(|| BrokerError::UnknownProvider(provider_id.to_string()))?;
        self.orchestrator.forget_provider(provider_id).await;
        self.orchestrator.stats().reset(Some(provider_id));
        tracing::info!(provider = %provider_id, "Provider removed");
        Ok(removed)
    }

    /// Clear statistics for one provider, or all with `None`
    pub fn reset_stats(&self, provider_id: Option<&str>) {
        self.orchestrator.stats().reset(provider_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_utils::{Script, ScriptBook, STUB_KIND};
    use crate::error::ErrorKind;
    use crate::provider::Secret;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    fn config() -> SwitchboardConfig {
        let mut config = SwitchboardConfig::new()
            .with_provider(ServiceConfig::new("a", "ocr", STUB_KIND).with_priority(1).with_retry_policy("none"))
            .with_provider(ServiceConfig::new("b", "ocr", STUB_KIND).with_priority(2).with_retry_policy("none"));
        config.cache.enabled = true;
        config
    }

    fn broker(config: SwitchboardConfig, book: &ScriptBook) -> Broker {
        match Broker::builder(config).with_registry(book.registry()).build() {
            Ok(broker) => broker,
            Err(e) => panic!("broker: {e}"),
        }
    }

    #[test]
    fn test_unknown_kind_fails_at_build() {
        let config = SwitchboardConfig::new().with_provider(ServiceConfig::new("x", "ocr", "carrier-pigeon"));
        let err = Broker::builder(config).build().err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_execute_uses_cache() {
        let book = ScriptBook::default();
        let a = book.set("a", Script::ok());
        book.set("b", Script::ok());
        let broker = broker(config(), &book);

        let input = json!({"image": "page-1"});
        let Ok(first) = broker.execute("ocr", "extract", &input, ExecuteOptions::new()).await else {
            panic!("first call should succeed");
        };
        assert!(!first.cached);
        assert_eq!(first.provider.as_deref(), Some("a"));
        assert_eq!(first.attempts, 1);

        let Ok(second) = broker.execute("ocr", "extract", &input, ExecuteOptions::new()).await else {
            panic!("second call should succeed");
        };
        assert!(second.cached);
        assert_eq!(second.attempts, 0);
        assert_eq!(a.calls(), 1);

        let third = broker
            .execute("ocr", "extract", &input, ExecuteOptions::new().skip_cache())
            .await;
        assert_eq!(third.ok().map(|r| r.cached), Some(false));
        assert_eq!(a.calls(), 2);
    }

    #[tokio::test]
    async fn test_execute_result_folds_errors() {
        let book = ScriptBook::default();
        book.set("a", Script::ok());
        book.set("b", Script::ok());
        let broker = broker(config(), &book);

        let result = broker
            .execute_result("translate", "run", &Value::Null, ExecuteOptions::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ErrorKind::Configuration));
        assert_eq!(result.error.as_deref(), Some("no enabled providers for 'translate'"));
    }

    #[tokio::test]
    async fn test_admin_changes_routing() {
        let book = ScriptBook::default();
        book.set("a", Script::ok());
        book.set("b", Script::ok());
        let broker = broker(config(), &book);
        let input = Value::Null;
        let run = || broker.execute("ocr", "extract", &input, ExecuteOptions::new().skip_cache());

        assert_ok!(broker.set_provider_priority("b", 0));
        assert_eq!(run().await.ok().and_then(|r| r.provider), Some("b".to_string()));

        assert_ok!(broker.set_provider_enabled("b", false).await);
        assert_eq!(run().await.ok().and_then(|r| r.provider), Some("a".to_string()));

        assert_ok!(broker.remove_provider("a").await);
        assert_eq!(run().await.err().map(|e| e.kind()), Some(ErrorKind::Configuration));
        assert!(broker.provider_stats().iter().all(|s| s.provider_id != "a"));

        book.set("c", Script::ok());
        assert_ok!(broker.upsert_provider(ServiceConfig::new("c", "ocr", STUB_KIND)).await);
        assert_eq!(run().await.ok().and_then(|r| r.provider), Some("c".to_string()));

        assert_err!(
            broker
                .upsert_provider(ServiceConfig::new("d", "ocr", "carrier-pigeon"))
                .await
        );
    }

    #[tokio::test]
    async fn test_rotate_credentials_reopens_clients() {
        let book = ScriptBook::default();
        let a = book.set("a", Script::ok());
        book.set("b", Script::ok());
        let broker = broker(config(), &book);

        assert!(broker.connect("a").await.is_ok());
        assert_eq!(a.connects(), 1);

        let auth = AuthConfig::Bearer { token: Secret::Value("new-key".into()) };
        assert!(broker.rotate_credentials("a", auth).await.is_ok());
        assert_eq!(a.disconnects(), 1);
        assert_eq!(broker.orchestrator.pool().key_status("a").total, 0);

        let empty = AuthConfig::Bearer { token: Secret::Value(String::new()) };
        assert!(matches!(
            broker.rotate_credentials("a", empty).await,
            Err(BrokerError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_refuses_work() {
        let book = ScriptBook::default();
        let a = book.set("a", Script::ok());
        book.set("b", Script::ok());
        let broker = broker(config(), &book);
        broker.start();

        assert!(broker.connect("a").await.is_ok());
        broker.sessions().create_session("ocr", None);
        assert_eq!(broker.session_stats().get("ocr"), Some(&1));

        broker.shutdown().await;
        assert!(broker.is_shut_down());
        assert_eq!(a.disconnects(), 1);
        assert!(matches!(
            broker.execute("ocr", "extract", &Value::Null, ExecuteOptions::new()).await,
            Err(BrokerError::ShutDown)
        ));
        assert!(matches!(broker.test("a").await, Err(BrokerError::ShutDown)));
    }
}
