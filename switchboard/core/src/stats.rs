//! Provider Statistics
//!
//! Every provider attempt updates a [`ProviderStats`] record:
//! - success: blend the response time into a moving average, clear the
//!   error fields, status `active`
//! - failure: status `error`, record the message and timestamp
//! - throttled: the attempt never reached the provider (no rate-limit
//!   token or pooled connection in time), status `throttled`
//!
//! After each update the record is pushed to a [`StatsSink`]. Sinks are the
//! persistence seam: a failing sink is logged and never fails the request.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Default weight of the newest sample in the response-time average
pub const DEFAULT_EMA_ALPHA: f64 = 0.5;

// ============================================================================
// Stats Record
// ============================================================================

/// Provider health as last observed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    /// Never attempted
    #[default]
    Unknown,
    /// Last attempt succeeded
    Active,
    /// Last attempt failed
    Error,
    /// Last attempt was refused locally for lack of capacity
    Throttled,
}

/// Rolling statistics for one provider
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProviderStats {
    /// Provider id
    pub provider_id: String,
    /// Last observed status
    pub status: ProviderStatus,
    /// Attempts that reached the provider
    pub requests: u64,
    /// Successful attempts
    pub successes: u64,
    /// Failed attempts
    pub failures: u64,
    /// Attempts refused locally
    pub throttled: u64,
    /// Moving average of successful response times (milliseconds)
    pub avg_response_time_ms: f64,
    /// `successes / requests`, 0 before the first request
    pub success_rate: f64,
    /// Message of the most recent failure, cleared by a success
    pub last_error: Option<String>,
    /// When the most recent failure happened
    pub last_error_at: Option<DateTime<Utc>>,
    /// Last attempt of any outcome
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ProviderStats {
    /// Empty record
    #[must_use]
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            status: ProviderStatus::Unknown,
            requests: 0,
            successes: 0,
            failures: 0,
            throttled: 0,
            avg_response_time_ms: 0.0,
            success_rate: 0.0,
            last_error: None,
            last_error_at: None,
            last_used_at: None,
        }
    }

    fn record_success(&mut self, elapsed: Duration, alpha: f64) {
        #[allow(clippy::cast_precision_loss)]
        let sample = elapsed.as_secs_f64() * 1000.0;
        self.avg_response_time_ms = if self.successes == 0 {
            sample
        } else {
            alpha * sample + (1.0 - alpha) * self.avg_response_time_ms
        };
        self.requests += 1;
        self.successes += 1;
        self.status = ProviderStatus::Active;
        self.last_error = None;
        self.last_error_at = None;
        self.touch();
    }

    fn record_failure(&mut self, error: &str) {
        self.requests += 1;
        self.failures += 1;
        self.status = ProviderStatus::Error;
        self.last_error = Some(error.to_string());
        self.last_error_at = Some(Utc::now());
        self.touch();
    }

    fn record_throttled(&mut self) {
        self.throttled += 1;
        self.status = ProviderStatus::Throttled;
        self.last_used_at = Some(Utc::now());
    }

    #[allow(clippy::cast_precision_loss)]
    fn touch(&mut self) {
        self.success_rate = self.successes as f64 / self.requests as f64;
        self.last_used_at = Some(Utc::now());
    }
}

// ============================================================================
// Sinks
// ============================================================================

/// Receives every stats update
#[async_trait]
pub trait StatsSink: Send + Sync {
    /// Persist or forward `stats`
    async fn record(&self, stats: &ProviderStats) -> anyhow::Result<()>;
}

/// Discards updates
#[derive(Debug, Default)]
pub struct NoopStatsSink;

#[async_trait]
impl StatsSink for NoopStatsSink {
    async fn record(&self, _stats: &ProviderStats) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Writes updates to the log at debug level
#[derive(Debug, Default)]
pub struct LogStatsSink;

#[async_trait]
impl StatsSink for LogStatsSink {
    async fn record(&self, stats: &ProviderStats) -> anyhow::Result<()> {
        tracing::debug!(
            provider = %stats.provider_id,
            status = ?stats.status,
            requests = stats.requests,
            success_rate = stats.success_rate,
            avg_ms = stats.avg_response_time_ms,
            "Provider stats"
        );
        Ok(())
    }
}

/// Keeps every update in memory
#[derive(Debug, Default)]
pub struct MemoryStatsSink {
    history: Mutex<Vec<ProviderStats>>,
}

impl MemoryStatsSink {
    /// Create an empty sink
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every update received, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<ProviderStats> {
        self.history.lock().clone()
    }

    /// Most recent update for `provider_id`
    #[must_use]
    pub fn latest(&self, provider_id: &str) -> Option<ProviderStats> {
        self.history
            .lock()
            .iter()
            .rev()
            .find(|s| s.provider_id == provider_id)
            .cloned()
    }
}

#[async_trait]
impl StatsSink for MemoryStatsSink {
    async fn record(&self, stats: &ProviderStats) -> anyhow::Result<()> {
        self.history.lock().push(stats.clone());
        Ok(())
    }
}

// ============================================================================
// Recorder
// ============================================================================

/// Per-provider stats with a sink
pub struct StatsRecorder {
    stats: DashMap<String, Arc<Mutex<ProviderStats>>>,
    sink: Arc<dyn StatsSink>,
    alpha: f64,
}

impl std::fmt::Debug for StatsRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatsRecorder")
            .field("providers", &self.stats.len())
            .field("alpha", &self.alpha)
            .finish()
    }
}

impl StatsRecorder {
    /// Create a recorder; `alpha` is clamped to `(0, 1]`
    #[must_use]
    pub fn new(sink: Arc<dyn StatsSink>, alpha: f64) -> Self {
        let alpha = if alpha.is_finite() && alpha > 0.0 {
            alpha.min(1.0)
        } else {
            DEFAULT_EMA_ALPHA
        };
        Self {
            stats: DashMap::new(),
            sink,
            alpha,
        }
    }

    fn update(&self, provider_id: &str, f: impl FnOnce(&mut ProviderStats)) -> ProviderStats {
        let entry = self
            .stats
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ProviderStats::new(provider_id))))
            .clone();
        let mut stats = entry.lock();
        f(&mut stats);
        stats.clone()
    }

    async fn push(&self, snapshot: ProviderStats) {
        if let Err(e) = self.sink.record(&snapshot).await {
            tracing::warn!(provider = %snapshot.provider_id, error = %e, "Stats sink failed");
        }
    }

    /// Record a successful attempt
    pub async fn record_success(&self, provider_id: &str, elapsed: Duration) {
        let alpha = self.alpha;
        let snapshot = self.update(provider_id, |s| s.record_success(elapsed, alpha));
        self.push(snapshot).await;
    }

    /// Record a failed attempt
    pub async fn record_failure(&self, provider_id: &str, error: &str) {
        let snapshot = self.update(provider_id, |s| s.record_failure(error));
        self.push(snapshot).await;
    }

    /// Record an attempt refused for lack of local capacity
    pub async fn record_throttled(&self, provider_id: &str) {
        let snapshot = self.update(provider_id, ProviderStats::record_throttled);
        self.push(snapshot).await;
    }

    /// Current record for one provider
    #[must_use]
    pub fn get(&self, provider_id: &str) -> Option<ProviderStats> {
        self.stats.get(provider_id).map(|s| s.lock().clone())
    }

    /// Every record, sorted by provider id
    #[must_use]
    pub fn snapshot(&self) -> Vec<ProviderStats> {
        let mut all: Vec<_> = self.stats.iter().map(|s| s.lock().clone()).collect();
        all.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
        all
    }

    /// Clear one provider's record, or every record with `None`
    pub fn reset(&self, provider_id: Option<&str>) {
        match provider_id {
            Some(id) => {
                self.stats.remove(id);
            }
            None => self.stats.clear(),
        }
        tracing::info!(provider = provider_id.unwrap_or("*"), "Provider stats reset");
    }
}
