//! Failover Orchestrator
//!
//! Runs one logical operation against the providers of a capability until
//! one succeeds:
//!
//! ```text
//!   SELECT_PROVIDER ──► RATE_LIMIT_CHECK ──► ACQUIRE_CONNECTION ──► EXECUTE
//!         ▲                                                            │
//!         │                 (retry: new token + connection)            │
//!         │                ◄───────────────────────────────────────────┤
//!         │                                                            ▼
//!    NEXT_PROVIDER ◄──────────── failure ─────────────────────── RECORD_STATS
//!         │                                                            │
//!         ▼                                                         success
//!   ALL_PROVIDERS_EXHAUSTED                                            ▼
//!                                                                  SUCCEEDED
//! ```
//!
//! Candidates are the enabled providers of the capability in ascending
//! priority. A preferred provider, when named and eligible, is moved to the
//! front; it draws on the same rate-limit budget as any other attempt
//! against that provider.
//!
//! Every attempt takes its own rate-limit token and pooled connection and
//! hands the connection back before the retry executor sleeps. Attempts
//! refused locally (no token or connection in time) count as throttled;
//! attempts that reach the provider count as successes or failures.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::time::Instant;

use crate::client::{ClientRegistry, OperationResult, PooledClient, ServiceError};
use crate::error::{BrokerError, ErrorKind};
use crate::provider::{ProviderCatalog, ServiceConfig, TestOutcome};
use crate::resilience::pool::{AcquireError, ConnectionPool, Lease, PoolConfig, PoolError};
use crate::resilience::rate_limit::{CompositeRateLimiter, RateLimitError, PER_HOUR, PER_MINUTE};
use crate::resilience::retry::{RetryError, RetryExecutor, RetryPolicy, RetryPolicyTable, Retryable};
use crate::stats::{StatsRecorder, DEFAULT_EMA_ALPHA};

// ============================================================================
// Configuration
// ============================================================================

/// Orchestrator timings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    /// Overall deadline for one `execute` when the caller gives none (ms)
    pub default_timeout_ms: u64,
    /// Deadline for a health check (ms)
    pub health_check_timeout_ms: u64,
    /// Weight of the newest sample in the response-time average
    pub stats_ema_alpha: f64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 60_000,
            health_check_timeout_ms: 5_000,
            stats_ema_alpha: DEFAULT_EMA_ALPHA,
        }
    }
}

impl FailoverConfig {
    /// Default overall deadline
    #[must_use]
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Health check deadline
    #[must_use]
    pub fn health_check_timeout(&self) -> Duration {
        Duration::from_millis(self.health_check_timeout_ms)
    }

    /// Check ranges
    pub fn validate(&self) -> Result<(), String> {
        if self.default_timeout_ms == 0 {
            return Err("failover.default_timeout_ms must be positive".to_string());
        }
        if self.health_check_timeout_ms == 0 {
            return Err("failover.health_check_timeout_ms must be positive".to_string());
        }
        if !(self.stats_ema_alpha > 0.0 && self.stats_ema_alpha <= 1.0) {
            return Err("failover.stats_ema_alpha must be in (0, 1]".to_string());
        }
        Ok(())
    }
}

/// Per-request options
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    /// Ignore (and do not fill) the result cache
    pub skip_cache: bool,
    /// Overall deadline override
    pub timeout: Option<Duration>,
    /// Provider to try before the priority order
    pub prefer_provider: Option<String>,
}

impl ExecuteOptions {
    /// Default options
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bypass the result cache
    #[must_use]
    pub fn skip_cache(mut self) -> Self {
        self.skip_cache = true;
        self
    }

    /// Override the overall deadline
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Try `provider` first
    #[must_use]
    pub fn prefer(mut self, provider: impl Into<String>) -> Self {
        self.prefer_provider = Some(provider.into());
        self
    }
}

/// A successful orchestrated operation
#[derive(Clone, Debug, PartialEq)]
pub struct FailoverSuccess {
    /// Provider that produced the result
    pub provider: String,
    /// Result payload
    pub data: Value,
    /// Attempts made across all providers, the successful one included
    pub attempts: u32,
    /// Wall time from start to success
    pub elapsed: Duration,
}

// ============================================================================
// Attempt Errors
// ============================================================================

/// Why one attempt against one provider failed
#[derive(Debug, Error)]
enum AttemptError {
    #[error(transparent)]
    Provider(ServiceError),

    #[error(transparent)]
    RateLimited(RateLimitError),

    #[error(transparent)]
    PoolTimeout(PoolError),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("overall deadline reached")]
    Deadline,
}

impl AttemptError {
    /// Only provider-reported transient failures are retried on the same
    /// provider; local capacity shortfalls move on to the next one.
    fn is_retryable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retryable(),
            Self::RateLimited(_) | Self::PoolTimeout(_) | Self::PoolClosed | Self::Deadline => false,
        }
    }

    fn is_resource_shortfall(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::PoolTimeout(_))
    }

    fn is_configuration(&self) -> bool {
        matches!(self, Self::Provider(e) if e.kind() == ErrorKind::Configuration)
    }
}

enum Operation<'a> {
    Call { action: &'a str, input: &'a Value },
    Probe,
}

/// Returns the lease to the pool when the attempt ends, however it ends
struct LeaseGuard<'a> {
    pool: &'a ConnectionPool<PooledClient>,
    lease: Option<Lease<PooledClient>>,
}

impl LeaseGuard<'_> {
    fn client(&self) -> Option<PooledClient> {
        self.lease.as_ref().map(|l| (**l.handle()).clone())
    }
}

impl Drop for LeaseGuard<'_> {
    fn drop(&mut self) {
        if let Some(lease) = self.lease.take() {
            self.pool.release(lease);
        }
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

/// Priority-ordered failover across the providers of a capability
pub struct FailoverOrchestrator {
    catalog: Arc<ProviderCatalog>,
    registry: Arc<ClientRegistry>,
    limiter: Arc<CompositeRateLimiter>,
    rate_limit_wait: Duration,
    pool: Arc<ConnectionPool<PooledClient>>,
    retry: RetryPolicyTable,
    stats: Arc<StatsRecorder>,
    config: FailoverConfig,
}

impl std::fmt::Debug for FailoverOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FailoverOrchestrator")
            .field("providers", &self.catalog.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl FailoverOrchestrator {
    /// Orchestrator with no rate limits, a default pool and the default
    /// retry table
    #[must_use]
    pub fn new(
        catalog: Arc<ProviderCatalog>,
        registry: Arc<ClientRegistry>,
        stats: Arc<StatsRecorder>,
    ) -> Self {
        Self {
            catalog,
            registry,
            limiter: Arc::new(CompositeRateLimiter::new()),
            rate_limit_wait: Duration::ZERO,
            pool: Arc::new(ConnectionPool::new(PoolConfig::default())),
            retry: RetryPolicyTable::default(),
            stats,
            config: FailoverConfig::default(),
        }
    }

    /// Use `limiter`, waiting up to `max_wait` for a token per attempt
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<CompositeRateLimiter>, max_wait: Duration) -> Self {
        self.limiter = limiter;
        self.rate_limit_wait = max_wait;
        self
    }

    /// Use `pool` for provider clients
    #[must_use]
    pub fn with_pool(mut self, pool: Arc<ConnectionPool<PooledClient>>) -> Self {
        self.pool = pool;
        self
    }

    /// Use `table` to pick retry policies
    #[must_use]
    pub fn with_retry_table(mut self, table: RetryPolicyTable) -> Self {
        self.retry = table;
        self
    }

    /// Replace the timings
    #[must_use]
    pub fn with_config(mut self, config: FailoverConfig) -> Self {
        self.config = config;
        self
    }

    /// Provider records
    #[must_use]
    pub fn catalog(&self) -> &Arc<ProviderCatalog> {
        &self.catalog
    }

    /// Client factories
    #[must_use]
    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    /// Connection pool
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool<PooledClient>> {
        &self.pool
    }

    /// Rate limiters
    #[must_use]
    pub fn limiter(&self) -> &Arc<CompositeRateLimiter> {
        &self.limiter
    }

    /// Statistics
    #[must_use]
    pub fn stats(&self) -> &Arc<StatsRecorder> {
        &self.stats
    }

    /// Push a provider's rate-limit overrides into the limiters
    pub fn apply_rate_limits(&self, provider: &ServiceConfig) {
        self.limiter
            .set_capacity(PER_MINUTE, &provider.id, provider.rate_limit.per_minute);
        self.limiter
            .set_capacity(PER_HOUR, &provider.id, provider.rate_limit.per_hour);
    }

    /// Forget everything held for a provider: pooled clients, limiter state
    /// and overrides
    pub async fn forget_provider(&self, provider_id: &str) {
        self.pool.evict_key(provider_id).await;
        self.limiter.remove(provider_id);
        self.limiter.set_capacity(PER_MINUTE, provider_id, None);
        self.limiter.set_capacity(PER_HOUR, provider_id, None);
    }

    fn candidates(&self, capability: &str, prefer: Option<&str>) -> Vec<ServiceConfig> {
        let mut ordered = self.catalog.ordered_for(capability);
        if let Some(preferred) = prefer {
            match ordered.iter().position(|p| p.id == preferred) {
                Some(idx) => {
                    let provider = ordered.remove(idx);
                    ordered.insert(0, provider);
                }
                None => tracing::debug!(
                    capability = %capability,
                    provider = %preferred,
                    "Preferred provider is not an enabled candidate, using priority order"
                ),
            }
        }
        ordered
    }

    /// Run `action` on the first provider of `capability` that succeeds
    pub async fn execute(
        &self,
        capability: &str,
        action: &str,
        input: &Value,
        options: &ExecuteOptions,
    ) -> Result<FailoverSuccess, BrokerError> {
        let started = Instant::now();
        let deadline = started + options.timeout.unwrap_or_else(|| self.config.default_timeout());

        let candidates = self.candidates(capability, options.prefer_provider.as_deref());
        if candidates.is_empty() {
            return Err(BrokerError::NoEnabledProviders(capability.to_string()));
        }

        let operation = Operation::Call { action, input };
        let mut total_attempts = 0u32;
        let mut failures: Vec<(String, AttemptError)> = Vec::with_capacity(candidates.len());

        for provider in &candidates {
            let policy = self.retry.resolve(provider.retry_policy.as_deref(), action);
            tracing::debug!(
                capability = %capability,
                provider = %provider.id,
                action = %action,
                max_retries = policy.max_retries,
                "Trying provider"
            );

            let mut made = 0u32;
            let result = self
                .run_with_retry(provider, &operation, policy, deadline, &mut made)
                .await;
            total_attempts += made;

            match result {
                Ok(data) => {
                    tracing::info!(
                        capability = %capability,
                        provider = %provider.id,
                        attempts = total_attempts,
                        "Operation succeeded"
                    );
                    return Ok(FailoverSuccess {
                        provider: provider.id.clone(),
                        data,
                        attempts: total_attempts,
                        elapsed: started.elapsed(),
                    });
                }
                Err(RetryError::Aborted { error: AttemptError::Deadline, .. }) => {
                    tracing::warn!(capability = %capability, provider = %provider.id, "Deadline reached during failover");
                    return Err(BrokerError::Timeout {
                        capability: capability.to_string(),
                        elapsed: started.elapsed(),
                    });
                }
                Err(RetryError::Aborted { error: AttemptError::PoolClosed, .. }) => {
                    return Err(BrokerError::ShutDown);
                }
                Err(e) => {
                    // A backoff that would outlast the deadline only ends this
                    // provider's turn; the rest still get the remaining budget
                    let error = e.into_inner();
                    tracing::warn!(
                        capability = %capability,
                        provider = %provider.id,
                        error = %error,
                        "Provider failed, moving to next"
                    );
                    failures.push((provider.id.clone(), error));
                    if Instant::now() >= deadline {
                        tracing::warn!(capability = %capability, "Deadline reached during failover");
                        return Err(BrokerError::Timeout {
                            capability: capability.to_string(),
                            elapsed: started.elapsed(),
                        });
                    }
                }
            }
        }

        Err(aggregate(capability, total_attempts, failures))
    }

    async fn run_with_retry(
        &self,
        provider: &ServiceConfig,
        operation: &Operation<'_>,
        policy: RetryPolicy,
        deadline: Instant,
        made: &mut u32,
    ) -> Result<Value, RetryError<AttemptError>> {
        let this = self;
        RetryExecutor::new(policy)
            .with_deadline(deadline)
            .execute_with(
                move |attempt| {
                    *made = attempt;
                    this.attempt(provider, operation, deadline)
                },
                AttemptError::is_retryable,
            )
            .await
    }

    /// One attempt: token, connection, call, stats
    async fn attempt(
        &self,
        provider: &ServiceConfig,
        operation: &Operation<'_>,
        deadline: Instant,
    ) -> Result<Value, AttemptError> {
        let id = provider.id.as_str();
        if Instant::now() >= deadline {
            return Err(AttemptError::Deadline);
        }

        let limit_deadline = (Instant::now() + self.rate_limit_wait).min(deadline);
        if let Err(e) = self.limiter.acquire_until(id, limit_deadline).await {
            self.stats.record_throttled(id).await;
            return Err(if Instant::now() >= deadline {
                AttemptError::Deadline
            } else {
                AttemptError::RateLimited(e)
            });
        }

        let pool_deadline = (Instant::now() + self.pool.config().acquire_timeout()).min(deadline);
        let lease = match self
            .pool
            .acquire_until(id, pool_deadline, || self.open_client(provider))
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                // Nothing was sent, so the token goes back
                self.limiter.refund(id);
                return Err(match e {
                    AcquireError::Create(e) => {
                        self.stats.record_failure(id, &e.to_string()).await;
                        AttemptError::Provider(e)
                    }
                    AcquireError::Pool(PoolError::Closed) => AttemptError::PoolClosed,
                    AcquireError::Pool(e @ PoolError::Timeout { .. }) => {
                        self.stats.record_throttled(id).await;
                        if Instant::now() >= deadline {
                            AttemptError::Deadline
                        } else {
                            AttemptError::PoolTimeout(e)
                        }
                    }
                });
            }
        };

        let guard = LeaseGuard {
            pool: &self.pool,
            lease: Some(lease),
        };
        let Some(client) = guard.client() else {
            return Err(AttemptError::PoolClosed);
        };

        let started = Instant::now();
        let call_deadline = (started + provider.timeout()).min(deadline);
        let outcome = tokio::time::timeout_at(call_deadline, async {
            match operation {
                Operation::Call { action, input } => client.call(action, input).await,
                Operation::Probe => client.test().await.map(|()| Value::Null),
            }
        })
        .await;
        drop(guard);

        match outcome {
            Ok(Ok(data)) => {
                self.stats.record_success(id, started.elapsed()).await;
                Ok(data)
            }
            Ok(Err(e)) => {
                self.stats.record_failure(id, &e.to_string()).await;
                Err(AttemptError::Provider(e))
            }
            Err(_) => {
                let e = ServiceError::Timeout(format!(
                    "no response within {}ms",
                    call_deadline.saturating_duration_since(started).as_millis()
                ));
                self.stats.record_failure(id, &e.to_string()).await;
                if call_deadline >= deadline {
                    Err(AttemptError::Deadline)
                } else {
                    Err(AttemptError::Provider(e))
                }
            }
        }
    }

    async fn open_client(&self, provider: &ServiceConfig) -> Result<PooledClient, ServiceError> {
        let client = self.registry.create(provider)?;
        client.connect().await?;
        tracing::debug!(provider = %provider.id, kind = %provider.kind, "Opened provider client");
        Ok(PooledClient::new(client))
    }

    fn provider(&self, provider_id: &str) -> Result<ServiceConfig, BrokerError> {
        self.catalog
            .get(provider_id)
            .ok_or_else(|| BrokerError::UnknownProvider(provider_id.to_string()))
    }

    // ========================================================================
    // Direct Provider Control
    // ========================================================================

    /// Probe one provider through the normal attempt path with a short
    /// deadline and no retries. Disabled providers can be checked too.
    pub async fn health_check(&self, provider_id: &str) -> Result<OperationResult, BrokerError> {
        let provider = self.provider(provider_id)?;
        let started = Instant::now();
        let deadline = started + self.config.health_check_timeout();

        let result = self.attempt(&provider, &Operation::Probe, deadline).await;
        let elapsed = started.elapsed();

        let outcome = TestOutcome {
            success: result.is_ok(),
            message: result.as_ref().err().map(ToString::to_string),
            tested_at: chrono::Utc::now(),
            response_time_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        };
        // The provider may have been removed while the probe ran
        if let Err(e) = self.catalog.record_test(provider_id, outcome) {
            tracing::debug!(provider = %provider_id, error = %e, "Could not store health check");
        }

        let result = match result {
            Ok(_) => {
                tracing::info!(provider = %provider_id, elapsed_ms = elapsed.as_millis() as u64, "Health check passed");
                OperationResult::success(json!({"healthy": true}), elapsed)
            }
            Err(e) => {
                tracing::warn!(provider = %provider_id, error = %e, "Health check failed");
                let kind = match &e {
                    AttemptError::Provider(inner) => inner.kind(),
                    AttemptError::Deadline => ErrorKind::Timeout,
                    AttemptError::RateLimited(_) | AttemptError::PoolTimeout(_) | AttemptError::PoolClosed => {
                        ErrorKind::ResourceExhausted
                    }
                };
                OperationResult::failure(e, kind, elapsed)
            }
        };
        Ok(result.with_provider(provider_id))
    }

    /// Open (or reuse) a pooled client for a provider without calling it
    pub async fn connect_provider(&self, provider_id: &str) -> Result<OperationResult, BrokerError> {
        let provider = self.provider(provider_id)?;
        let started = Instant::now();
        let acquired = self
            .pool
            .acquire(provider_id, || self.open_client(&provider))
            .await;

        let result = match acquired {
            Ok(lease) => {
                let id = lease.id();
                self.pool.release(lease);
                tracing::info!(provider = %provider_id, connection = %id, "Provider connected");
                OperationResult::success(json!({"connected": true}), started.elapsed())
            }
            Err(AcquireError::Create(e)) => {
                let kind = e.kind();
                OperationResult::failure(e, kind, started.elapsed())
            }
            Err(AcquireError::Pool(PoolError::Closed)) => return Err(BrokerError::ShutDown),
            Err(AcquireError::Pool(e)) => {
                OperationResult::failure(e, ErrorKind::ResourceExhausted, started.elapsed())
            }
        };
        Ok(result.with_provider(provider_id))
    }

    /// Close a provider's pooled clients; in-use clients close on release
    pub async fn disconnect_provider(&self, provider_id: &str) -> Result<OperationResult, BrokerError> {
        self.provider(provider_id)?;
        let started = Instant::now();
        let closed = self.pool.evict_key(provider_id).await;
        tracing::info!(provider = %provider_id, closed, "Provider disconnected");
        Ok(OperationResult::success(json!({"closed": closed}), started.elapsed()).with_provider(provider_id))
    }
}

/// Fold per-provider failures into the error the caller sees
fn aggregate(capability: &str, attempts: u32, failures: Vec<(String, AttemptError)>) -> BrokerError {
    let providers = failures.len();
    let all_configuration = failures.iter().all(|(_, e)| e.is_configuration());
    let all_resource = failures.iter().all(|(_, e)| e.is_resource_shortfall());

    let Some((last_provider, last_error)) = failures.into_iter().last() else {
        return BrokerError::NoEnabledProviders(capability.to_string());
    };

    if all_configuration {
        return BrokerError::Configuration(format!("{last_provider}: {last_error}"));
    }
    if all_resource {
        return BrokerError::ResourceExhausted {
            capability: capability.to_string(),
            message: format!("{last_provider}: {last_error}"),
        };
    }
    BrokerError::AllProvidersExhausted {
        capability: capability.to_string(),
        attempts,
        providers,
        last_provider,
        last_error: last_error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::test_utils::{Script, ScriptBook, STUB_KIND};
    use crate::resilience::rate_limit::{RateLimitAlgorithm, RateLimiter};
    use crate::stats::{MemoryStatsSink, ProviderStatus};
    use pretty_assertions::assert_eq;

    fn http(status: u16) -> ServiceError {
        ServiceError::Http {
            status,
            message: format!("status {status}"),
        }
    }

    fn stub(id: &str, priority: i32) -> ServiceConfig {
        ServiceConfig::new(id, "ocr", STUB_KIND)
            .with_priority(priority)
            .with_retry_policy("none")
    }

    struct Harness {
        orchestrator: FailoverOrchestrator,
        book: ScriptBook,
        sink: Arc<MemoryStatsSink>,
    }

    fn harness(providers: Vec<ServiceConfig>) -> Harness {
        let book = ScriptBook::default();
        let sink = Arc::new(MemoryStatsSink::new());
        let catalog = match ProviderCatalog::new(providers) {
            Ok(catalog) => Arc::new(catalog),
            Err(e) => panic!("catalog: {e}"),
        };
        let orchestrator = FailoverOrchestrator::new(
            catalog,
            Arc::new(book.registry()),
            Arc::new(StatsRecorder::new(sink.clone(), 0.5)),
        );
        Harness { orchestrator, book, sink }
    }

    async fn run(h: &Harness, options: &ExecuteOptions) -> Result<FailoverSuccess, BrokerError> {
        h.orchestrator
            .execute("ocr", "extract", &json!({"image": "x"}), options)
            .await
    }

    #[tokio::test]
    async fn test_priority_order_skips_disabled() {
        let h = harness(vec![
            stub("a", 1),
            stub("b", 2),
            stub("c", 0).with_enabled(false),
        ]);
        let a = h.book.set("a", Script::failing(http(400)));
        let b = h.book.set("b", Script::ok());
        let c = h.book.set("c", Script::ok());

        let Ok(success) = run(&h, &ExecuteOptions::new()).await else {
            panic!("b should serve the request");
        };
        assert_eq!(success.provider, "b");
        assert_eq!(success.attempts, 2);
        assert_eq!((a.calls(), b.calls(), c.calls()), (1, 1, 0));

        let stats = h.orchestrator.stats();
        assert_eq!(stats.get("a").map(|s| s.status), Some(ProviderStatus::Error));
        assert_eq!(stats.get("b").map(|s| s.status), Some(ProviderStatus::Active));
        assert!(stats.get("c").is_none());
    }

    #[tokio::test]
    async fn test_first_success_stops_failover() {
        let h = harness(vec![stub("a", 1), stub("b", 2)]);
        h.book.set("a", Script::ok());
        let b = h.book.set("b", Script::ok());

        let result = run(&h, &ExecuteOptions::new()).await;
        assert_eq!(result.ok().map(|s| s.provider), Some("a".to_string()));
        assert_eq!(b.calls(), 0);
    }

    #[tokio::test]
    async fn test_all_failed_reports_last_provider() {
        let h = harness(vec![stub("a", 1), stub("b", 2), stub("c", 0).with_enabled(false)]);
        h.book.set("a", Script::failing(http(400)));
        h.book.set("b", Script::failing(ServiceError::InvalidResponse("garbled".into())));
        h.book.set("c", Script::ok());

        let err = run(&h, &ExecuteOptions::new()).await.err();
        let Some(BrokerError::AllProvidersExhausted { last_provider, last_error, providers, attempts, .. }) = err else {
            panic!("expected aggregate error");
        };
        assert_eq!(last_provider, "b");
        assert_eq!(last_error, "invalid response: garbled");
        assert_eq!((providers, attempts), (2, 2));
        assert_eq!(h.sink.history().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_retried_on_same_provider() {
        let h = harness(vec![stub("a", 1).with_retry_policy("moderate"), stub("b", 2)]);
        let a = h.book.set(
            "a",
            Script::ok()
                .then(Err(http(503)))
                .then(Err(ServiceError::ConnectionReset("peer".into()))),
        );
        let b = h.book.set("b", Script::ok());

        let result = run(&h, &ExecuteOptions::new()).await;
        assert_eq!(result.ok().map(|s| (s.provider, s.attempts)), Some(("a".to_string(), 3)));
        assert_eq!(a.calls(), 3);
        assert_eq!(b.calls(), 0);
        assert_eq!(h.orchestrator.stats().get("a").map(|s| (s.failures, s.successes)), Some((2, 1)));
        // Released before every backoff sleep
        assert_eq!(h.orchestrator.pool().key_status("a").active, 0);
    }

    #[tokio::test]
    async fn test_preferred_provider_tried_first() {
        let h = harness(vec![stub("a", 1), stub("b", 2)]);
        let a = h.book.set("a", Script::ok());
        h.book.set("b", Script::ok());

        let result = run(&h, &ExecuteOptions::new().prefer("b")).await;
        assert_eq!(result.ok().map(|s| s.provider), Some("b".to_string()));
        assert_eq!(a.calls(), 0);

        // Unknown preference falls back to priority order
        let result = run(&h, &ExecuteOptions::new().prefer("zzz")).await;
        assert_eq!(result.ok().map(|s| s.provider), Some("a".to_string()));
    }

    #[tokio::test]
    async fn test_preferred_provider_shares_rate_limit_budget() {
        let h = harness(vec![stub("a", 1), stub("b", 2)]);
        h.book.set("a", Script::ok());
        let b = h.book.set("b", Script::ok());
        let limiter = CompositeRateLimiter::new()
            .with_limiter(RateLimiter::per_minute(RateLimitAlgorithm::TokenBucket, 1));
        let h = Harness {
            orchestrator: h.orchestrator.with_limiter(Arc::new(limiter), Duration::ZERO),
            ..h
        };

        let first = run(&h, &ExecuteOptions::new().prefer("b")).await;
        assert_eq!(first.ok().map(|s| s.provider), Some("b".to_string()));

        // b's only token is spent, so the preferred attempt is throttled
        let second = run(&h, &ExecuteOptions::new().prefer("b")).await;
        assert_eq!(second.ok().map(|s| s.provider), Some("a".to_string()));
        assert_eq!(b.calls(), 1);
        assert_eq!(h.orchestrator.stats().get("b").map(|s| s.throttled), Some(1));
    }

    #[tokio::test]
    async fn test_no_enabled_providers() {
        let h = harness(vec![stub("a", 1).with_enabled(false)]);
        h.book.set("a", Script::ok());
        let err = run(&h, &ExecuteOptions::new()).await.err();
        assert!(matches!(err, Some(BrokerError::NoEnabledProviders(ref c)) if c == "ocr"));
    }

    #[tokio::test]
    async fn test_configuration_errors_fail_without_calls() {
        let h = harness(vec![stub("a", 1), stub("b", 2)]);
        let a = h.book.set(
            "a",
            Script::ok().with_connect_error(ServiceError::Configuration("missing api key".into())),
        );
        let b = h.book.set("b", Script::failing(ServiceError::Authentication("revoked".into())));

        let err = run(&h, &ExecuteOptions::new()).await.err();
        assert!(matches!(err, Some(BrokerError::Configuration(ref m)) if m.contains("revoked")));
        assert_eq!(a.calls(), 0);
        assert_eq!(b.calls(), 1);
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Configuration));
    }

    #[tokio::test]
    async fn test_rate_limited_everywhere_is_resource_exhaustion() {
        let h = harness(vec![stub("a", 1), stub("b", 2)]);
        h.book.set("a", Script::ok());
        h.book.set("b", Script::ok());
        let limiter = CompositeRateLimiter::new()
            .with_limiter(RateLimiter::per_minute(RateLimitAlgorithm::SlidingWindow, 0));
        let h = Harness {
            orchestrator: h.orchestrator.with_limiter(Arc::new(limiter), Duration::ZERO),
            ..h
        };

        let err = run(&h, &ExecuteOptions::new()).await.err();
        assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::ResourceExhausted));
        assert_eq!(h.orchestrator.stats().get("a").map(|s| s.requests), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overall_deadline_is_timeout() {
        let h = harness(vec![stub("a", 1), stub("b", 2)]);
        h.book.set("a", Script::ok().with_latency(Duration::from_secs(10)));
        let b = h.book.set("b", Script::ok());

        let options = ExecuteOptions::new().with_timeout(Duration::from_secs(2));
        let err = run(&h, &options).await.err();
        assert!(matches!(err, Some(BrokerError::Timeout { .. })));
        assert_eq!(b.calls(), 0);
        // No connection left checked out and no token held
        assert_eq!(h.orchestrator.pool().key_status("a").active, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_long_backoff_moves_on_within_deadline() {
        let h = harness(vec![stub("a", 1).with_retry_policy("patient"), stub("b", 2)]);
        let a = h.book.set("a", Script::failing(http(503)));
        let b = h.book.set("b", Script::ok());

        let started = Instant::now();
        let options = ExecuteOptions::new().with_timeout(Duration::from_secs(5));
        let result = run(&h, &options).await;

        assert_eq!(result.ok().map(|s| s.provider), Some("b".to_string()));
        assert!(a.calls() >= 1);
        assert_eq!(b.calls(), 1);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_provider_times_out_and_fails_over() {
        let h = harness(vec![
            stub("a", 1).with_timeout(Duration::from_millis(500)),
            stub("b", 2),
        ]);
        h.book.set("a", Script::ok().with_latency(Duration::from_secs(10)));
        h.book.set("b", Script::ok());

        let result = run(&h, &ExecuteOptions::new()).await;
        assert_eq!(result.ok().map(|s| s.provider), Some("b".to_string()));
        let last_error = h.orchestrator.stats().get("a").and_then(|s| s.last_error);
        assert_eq!(last_error.as_deref(), Some("request timed out: no response within 500ms"));
    }

    #[tokio::test]
    async fn test_health_check_records_outcome() {
        let h = harness(vec![stub("a", 1).with_enabled(false)]);
        let a = h.book.set("a", Script::ok());

        let Ok(result) = h.orchestrator.health_check("a").await else {
            panic!("known provider");
        };
        assert!(result.success);
        assert_eq!(result.provider.as_deref(), Some("a"));
        assert_eq!(a.tests(), 1);
        assert_eq!(a.calls(), 0);
        let last_test = h.orchestrator.catalog().get("a").and_then(|p| p.last_test);
        assert_eq!(last_test.map(|t| t.success), Some(true));

        assert!(matches!(
            h.orchestrator.health_check("nope").await,
            Err(BrokerError::UnknownProvider(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_and_disconnect_provider() {
        let h = harness(vec![stub("a", 1)]);
        let a = h.book.set("a", Script::ok());

        let connected = h.orchestrator.connect_provider("a").await.ok().map(|r| r.success);
        assert_eq!(connected, Some(true));
        assert_eq!(a.connects(), 1);
        assert_eq!(h.orchestrator.pool().key_status("a").idle, 1);

        let closed = h.orchestrator.disconnect_provider("a").await.ok().and_then(|r| r.data);
        assert_eq!(closed, Some(json!({"closed": 1})));
        assert_eq!(a.disconnects(), 1);
        assert_eq!(h.orchestrator.pool().key_status("a").total, 0);
    }
}
