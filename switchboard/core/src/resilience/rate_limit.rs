//! Per-Provider Rate Limiting
//!
//! Admission control keyed by provider id. Two algorithms are available and
//! selected per deployment:
//!
//! - **Token bucket**: `capacity` tokens per window, refilled lazily on each
//!   check at `capacity / window_secs` tokens per second. A request consumes
//!   one whole token. Buckets start full.
//! - **Sliding window**: timestamps of admitted requests in the trailing
//!   window. A request is admitted while the trimmed count is below capacity.
//!
//! ```text
//!   check_all_limits("openai")
//!        │
//!        ├─► per_minute.try_acquire ──► admitted ─┐
//!        │                                        │
//!        └─► per_hour.try_acquire ──► rejected ───┴─► refund per_minute
//!                                                     Err(LimitExceeded)
//! ```
//!
//! A [`CompositeRateLimiter`] ANDs several named limiters. It stops at the
//! first limiter that rejects and hands back the tokens already taken from
//! the limiters before it.
//!
//! State lives in memory. Each key has its own mutex inside a `DashMap`, so
//! unrelated providers never contend.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Name of the per-minute limiter built by [`CompositeRateLimiter::from_config`]
pub const PER_MINUTE: &str = "per_minute";

/// Name of the per-hour limiter built by [`CompositeRateLimiter::from_config`]
pub const PER_HOUR: &str = "per_hour";

// ============================================================================
// Configuration
// ============================================================================

/// Rate limiting algorithm
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Lazily refilled token bucket
    #[default]
    TokenBucket,
    /// Trailing window of request timestamps
    SlidingWindow,
}

impl std::str::FromStr for RateLimitAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "token_bucket" => Ok(Self::TokenBucket),
            "sliding_window" => Ok(Self::SlidingWindow),
            other => Err(format!("unknown rate limit algorithm '{other}'")),
        }
    }
}

/// Deployment-wide rate limit settings
///
/// Providers may override the per-minute and per-hour capacities in their
/// own configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Algorithm used by every limiter
    pub algorithm: RateLimitAlgorithm,

    /// Default requests per minute for providers without an override
    pub requests_per_minute: u32,

    /// Default requests per hour; `None` leaves the hourly limit off
    pub requests_per_hour: Option<u32>,

    /// Longest a single attempt waits for a token (milliseconds)
    pub max_wait_ms: u64,

    /// Whether to enable rate limiting (can be disabled for testing)
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::TokenBucket,
            requests_per_minute: 60,
            requests_per_hour: None,
            max_wait_ms: 5_000,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the algorithm
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the default per-minute capacity
    #[must_use]
    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    /// Set the default per-hour capacity
    #[must_use]
    pub fn with_requests_per_hour(mut self, rph: u32) -> Self {
        self.requests_per_hour = Some(rph);
        self
    }

    /// Set the longest wait for a token
    #[must_use]
    pub fn with_max_wait_ms(mut self, ms: u64) -> Self {
        self.max_wait_ms = ms;
        self
    }

    /// Create a disabled configuration (for testing)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Longest wait for a token as a `Duration`
    #[must_use]
    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Errors related to rate limiting
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// A limiter had no capacity left for this key
    #[error("rate limit '{limiter}' exceeded for '{key}'")]
    LimitExceeded {
        /// Name of the limiter that rejected
        limiter: String,
        /// Key that was rejected
        key: String,
    },

    /// Waited until the deadline without getting capacity
    #[error("timed out after {waited:?} waiting for rate limit capacity for '{key}'")]
    Timeout {
        /// Key that was waiting
        key: String,
        /// How long the caller waited
        waited: Duration,
    },
}

// ============================================================================
// Per-Key State
// ============================================================================

/// Token bucket for one key
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: u32, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            tokens: capacity,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, window: Duration) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        let rate = self.capacity / window.as_secs_f64();
        self.tokens = (self.tokens + rate * elapsed.as_secs_f64()).clamp(0.0, self.capacity);
        self.last_refill = now;
    }

    fn try_take(&mut self, now: Instant, window: Duration) -> bool {
        self.refill(now, window);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn wait_time(&mut self, now: Instant, window: Duration) -> Duration {
        self.refill(now, window);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.capacity <= 0.0 {
            return window;
        }
        let rate = self.capacity / window.as_secs_f64();
        Duration::from_secs_f64((1.0 - self.tokens) / rate)
    }

    fn refund(&mut self) {
        self.tokens = (self.tokens + 1.0).min(self.capacity);
    }

    fn set_capacity(&mut self, capacity: u32) {
        self.capacity = f64::from(capacity);
        self.tokens = self.tokens.min(self.capacity);
    }
}

/// Sliding window for one key
#[derive(Debug)]
struct SlidingWindow {
    capacity: usize,
    admitted: VecDeque<Instant>,
}

impl SlidingWindow {
    fn new(capacity: u32) -> Self {
        Self {
            capacity: capacity as usize,
            admitted: VecDeque::new(),
        }
    }

    fn trim(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.admitted.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.admitted.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_take(&mut self, now: Instant, window: Duration) -> bool {
        self.trim(now, window);
        if self.admitted.len() < self.capacity {
            self.admitted.push_back(now);
            true
        } else {
            false
        }
    }

    fn wait_time(&mut self, now: Instant, window: Duration) -> Duration {
        self.trim(now, window);
        if self.admitted.len() < self.capacity {
            return Duration::ZERO;
        }
        match self.admitted.front() {
            Some(&oldest) => (oldest + window).saturating_duration_since(now),
            None => window,
        }
    }

    fn refund(&mut self) {
        self.admitted.pop_back();
    }

    fn set_capacity(&mut self, capacity: u32) {
        self.capacity = capacity as usize;
    }
}

#[derive(Debug)]
enum KeyState {
    Bucket(TokenBucket),
    Window(SlidingWindow),
}

impl KeyState {
    fn new(algorithm: RateLimitAlgorithm, capacity: u32, now: Instant) -> Self {
        match algorithm {
            RateLimitAlgorithm::TokenBucket => Self::Bucket(TokenBucket::new(capacity, now)),
            RateLimitAlgorithm::SlidingWindow => Self::Window(SlidingWindow::new(capacity)),
        }
    }

    fn try_take(&mut self, now: Instant, window: Duration) -> bool {
        match self {
            Self::Bucket(b) => b.try_take(now, window),
            Self::Window(w) => w.try_take(now, window),
        }
    }

    fn wait_time(&mut self, now: Instant, window: Duration) -> Duration {
        match self {
            Self::Bucket(b) => b.wait_time(now, window),
            Self::Window(w) => w.wait_time(now, window),
        }
    }

    fn refund(&mut self) {
        match self {
            Self::Bucket(b) => b.refund(),
            Self::Window(w) => w.refund(),
        }
    }

    fn set_capacity(&mut self, capacity: u32) {
        match self {
            Self::Bucket(b) => b.set_capacity(capacity),
            Self::Window(w) => w.set_capacity(capacity),
        }
    }
}

// ============================================================================
// Rate Limiter
// ============================================================================

/// Counters for one limiter
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RateLimiterStats {
    /// Requests admitted
    pub admitted: u64,
    /// Requests rejected
    pub rejected: u64,
}

/// Named per-key limiter over a fixed window
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    algorithm: RateLimitAlgorithm,
    window: Duration,
    enabled: bool,
    /// Capacity for keys without an override; `None` means unlimited
    default_capacity: Option<u32>,
    overrides: DashMap<String, u32>,
    states: DashMap<String, Arc<Mutex<KeyState>>>,
    admitted: AtomicU64,
    rejected: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter admitting `default_capacity` requests per `window`
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        algorithm: RateLimitAlgorithm,
        window: Duration,
        default_capacity: Option<u32>,
    ) -> Self {
        Self {
            name: name.into(),
            algorithm,
            window: window.max(Duration::from_millis(1)),
            enabled: true,
            default_capacity,
            overrides: DashMap::new(),
            states: DashMap::new(),
            admitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Per-minute limiter with the given default capacity
    #[must_use]
    pub fn per_minute(algorithm: RateLimitAlgorithm, capacity: u32) -> Self {
        Self::new(PER_MINUTE, algorithm, Duration::from_secs(60), Some(capacity))
    }

    /// Enable or disable the limiter
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Limiter name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Window length
    #[must_use]
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Capacity applied to `key`, `None` when unlimited
    #[must_use]
    pub fn capacity_for(&self, key: &str) -> Option<u32> {
        self.overrides
            .get(key)
            .map(|c| *c)
            .or(self.default_capacity)
    }

    /// Override the capacity for one key
    pub fn set_capacity(&self, key: &str, capacity: u32) {
        self.overrides.insert(key.to_string(), capacity);
        if let Some(state) = self.states.get(key).map(|s| s.clone()) {
            state.lock().set_capacity(capacity);
        }
    }

    /// Drop a per-key override so the default capacity applies again
    pub fn clear_capacity(&self, key: &str) {
        self.overrides.remove(key);
        // Rebuilt on the next check with the default capacity
        self.states.remove(key);
    }

    /// Forget all state for `key`
    pub fn remove(&self, key: &str) {
        self.overrides.remove(key);
        self.states.remove(key);
    }

    fn state_for(&self, key: &str) -> Option<Arc<Mutex<KeyState>>> {
        let capacity = self.capacity_for(key)?;
        if let Some(state) = self.states.get(key) {
            return Some(state.clone());
        }
        let state = self
            .states
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(Mutex::new(KeyState::new(
                    self.algorithm,
                    capacity,
                    Instant::now(),
                )))
            })
            .clone();
        Some(state)
    }

    /// Take one unit of capacity for `key` without waiting
    pub fn try_acquire(&self, key: &str) -> bool {
        if !self.enabled {
            return true;
        }
        let Some(state) = self.state_for(key) else {
            return true;
        };

        let admitted = state.lock().try_take(Instant::now(), self.window);
        if admitted {
            self.admitted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!(limiter = %self.name, key = %key, "Rate limit reached");
        }
        admitted
    }

    /// Wait up to `timeout` for capacity
    pub async fn acquire(&self, key: &str, timeout: Duration) -> bool {
        self.acquire_until(key, Instant::now() + timeout).await
    }

    /// Wait until `deadline` for capacity
    pub async fn acquire_until(&self, key: &str, deadline: Instant) -> bool {
        loop {
            if self.try_acquire(key) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let wait = self
                .time_until_available(key)
                .max(Duration::from_millis(1));
            tokio::time::sleep_until((now + wait).min(deadline)).await;
        }
    }

    /// How long until `key` would be admitted (zero when it would be now)
    #[must_use]
    pub fn time_until_available(&self, key: &str) -> Duration {
        if !self.enabled {
            return Duration::ZERO;
        }
        match self.state_for(key) {
            Some(state) => state.lock().wait_time(Instant::now(), self.window),
            None => Duration::ZERO,
        }
    }

    /// Return one unit of capacity taken by a request that never went out
    pub fn refund(&self, key: &str) {
        if !self.enabled {
            return;
        }
        if let Some(state) = self.states.get(key).map(|s| s.clone()) {
            state.lock().refund();
            let _ = self
                .admitted
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        }
    }

    /// Current token count for a token-bucket key (refilled to now)
    #[must_use]
    pub fn tokens(&self, key: &str) -> Option<f64> {
        let state = self.state_for(key)?;
        let mut state = state.lock();
        match &mut *state {
            KeyState::Bucket(bucket) => {
                bucket.refill(Instant::now(), self.window);
                Some(bucket.tokens)
            }
            KeyState::Window(_) => None,
        }
    }

    /// Admission counters
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            admitted: self.admitted.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Composite Limiter
// ============================================================================

/// Several named limiters that must all admit a request
#[derive(Debug, Default)]
pub struct CompositeRateLimiter {
    limiters: Vec<RateLimiter>,
}

impl CompositeRateLimiter {
    /// Create an empty composite (admits everything)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-minute limiter plus a per-hour limiter for keys that configure one
    #[must_use]
    pub fn from_config(config: &RateLimitConfig) -> Self {
        let minute = RateLimiter::per_minute(config.algorithm, config.requests_per_minute)
            .with_enabled(config.enabled);
        let hour = RateLimiter::new(
            PER_HOUR,
            config.algorithm,
            Duration::from_secs(3600),
            config.requests_per_hour,
        )
        .with_enabled(config.enabled);
        Self::new().with_limiter(minute).with_limiter(hour)
    }

    /// Add a limiter; limiters are checked in insertion order
    #[must_use]
    pub fn with_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiters.push(limiter);
        self
    }

    /// Look up a limiter by name
    #[must_use]
    pub fn limiter(&self, name: &str) -> Option<&RateLimiter> {
        self.limiters.iter().find(|l| l.name() == name)
    }

    /// Apply (or clear, with `None`) a capacity override on a named limiter
    pub fn set_capacity(&self, limiter: &str, key: &str, capacity: Option<u32>) {
        if let Some(l) = self.limiter(limiter) {
            match capacity {
                Some(c) => l.set_capacity(key, c),
                None => l.clear_capacity(key),
            }
        }
    }

    /// Take capacity from every limiter or from none of them
    pub fn check_all_limits(&self, key: &str) -> Result<(), RateLimitError> {
        for (idx, limiter) in self.limiters.iter().enumerate() {
            if !limiter.try_acquire(key) {
                for earlier in &self.limiters[..idx] {
                    earlier.refund(key);
                }
                return Err(RateLimitError::LimitExceeded {
                    limiter: limiter.name().to_string(),
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Longest wait across all limiters
    #[must_use]
    pub fn time_until_available(&self, key: &str) -> Duration {
        self.limiters
            .iter()
            .map(|l| l.time_until_available(key))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Wait until `deadline` for every limiter to admit `key`
    pub async fn acquire_until(&self, key: &str, deadline: Instant) -> Result<(), RateLimitError> {
        let started = Instant::now();
        loop {
            if self.check_all_limits(key).is_ok() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(RateLimitError::Timeout {
                    key: key.to_string(),
                    waited: now.saturating_duration_since(started),
                });
            }
            let wait = self
                .time_until_available(key)
                .max(Duration::from_millis(1));
            tokio::time::sleep_until((now + wait).min(deadline)).await;
        }
    }

    /// Refund `key` on every limiter
    pub fn refund(&self, key: &str) {
        for limiter in &self.limiters {
            limiter.refund(key);
        }
    }

    /// Forget `key` on every limiter
    pub fn remove(&self, key: &str) {
        for limiter in &self.limiters {
            limiter.remove(key);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
