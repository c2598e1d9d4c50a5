//! Retry Policies and Execution
//!
//! A [`RetryPolicy`] is an immutable description of how long to wait between
//! attempts. A [`RetryExecutor`] runs an async operation under a policy:
//!
//! ```text
//!   attempt 1 ──► Ok ──────────────────────────────► return value
//!      │
//!      └─► Err ─► retryable? ─ no ─────────────────► RetryError::Aborted
//!                    │
//!                   yes ─► attempts > max_retries? ─► RetryError::Exhausted
//!                               │
//!                              no ─► sleep crosses deadline? ─► DeadlineExceeded
//!                                        │
//!                                       no ─► sleep(delay(n)) ─► attempt n+1
//! ```
//!
//! Delays for attempt `n` (1-indexed), clamped to `[initial, max]`:
//!
//! | Backoff     | Delay                         |
//! |-------------|-------------------------------|
//! | exponential | `initial * multiplier^(n-1)`  |
//! | linear      | `initial * n`                 |
//! | fibonacci   | `initial * fib(n)`, fib(1)=fib(2)=1 |
//!
//! [`RetryPolicyTable`] maps operation names to named presets through
//! configurable keyword rules.

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

/// Upper bound on the jitter added to a delay (fraction of the delay)
const JITTER_FRACTION: f64 = 0.25;

// ============================================================================
// Retryability
// ============================================================================

/// Errors that know whether a repeat attempt could succeed
pub trait Retryable {
    /// Whether the failed operation is worth repeating
    fn is_retryable(&self) -> bool;
}

/// Classify an error message from a foreign source as transient
///
/// Recognises refused or reset connections, timeouts, DNS failures, HTTP
/// 5xx statuses and HTTP 429.
#[must_use]
pub fn is_retryable_message(message: &str) -> bool {
    const TRANSIENT: &[&str] = &[
        "connection refused",
        "econnrefused",
        "connection reset",
        "econnreset",
        "broken pipe",
        "timed out",
        "timeout",
        "etimedout",
        "dns",
        "enotfound",
        "name resolution",
        "failed to lookup address",
        "too many requests",
        "service unavailable",
        "bad gateway",
        "gateway timeout",
        "internal server error",
    ];

    let lower = message.to_ascii_lowercase();
    if TRANSIENT.iter().any(|needle| lower.contains(needle)) {
        return true;
    }

    // Bare status codes such as "HTTP 503" or "status: 429"
    lower
        .split(|c: char| !c.is_ascii_digit())
        .filter(|token| token.len() == 3)
        .filter_map(|token| token.parse::<u16>().ok())
        .any(|code| code == 429 || (500..600).contains(&code))
}

// ============================================================================
// Policy
// ============================================================================

/// Backoff curve
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// `initial * multiplier^(n-1)`
    #[default]
    Exponential,
    /// `initial * n`
    Linear,
    /// `initial * fib(n)`
    Fibonacci,
}

/// Immutable retry policy
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Backoff curve
    pub backoff: BackoffKind,

    /// Retries after the first attempt (total attempts = `max_retries + 1`)
    pub max_retries: u32,

    /// Delay before the first retry (milliseconds)
    pub initial_delay_ms: u64,

    /// Ceiling for any delay (milliseconds)
    pub max_delay_ms: u64,

    /// Growth factor for exponential backoff
    pub multiplier: f64,

    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            backoff: BackoffKind::Exponential,
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy
    #[must_use]
    pub fn exponential(max_retries: u32, initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            backoff: BackoffKind::Exponential,
            max_retries,
            initial_delay_ms: duration_ms(initial),
            max_delay_ms: duration_ms(max),
            multiplier,
            jitter: false,
        }
    }

    /// Linear policy
    #[must_use]
    pub fn linear(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            backoff: BackoffKind::Linear,
            max_retries,
            initial_delay_ms: duration_ms(initial),
            max_delay_ms: duration_ms(max),
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Fibonacci policy
    #[must_use]
    pub fn fibonacci(max_retries: u32, initial: Duration, max: Duration) -> Self {
        Self {
            backoff: BackoffKind::Fibonacci,
            max_retries,
            initial_delay_ms: duration_ms(initial),
            max_delay_ms: duration_ms(max),
            multiplier: 1.0,
            jitter: false,
        }
    }

    /// Single attempt, never retried
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Preset for search and query style operations
    #[must_use]
    pub fn moderate() -> Self {
        Self::exponential(3, Duration::from_millis(500), Duration::from_secs(5), 2.0)
    }

    /// Preset for sync and batch processing operations
    #[must_use]
    pub fn patient() -> Self {
        Self::fibonacci(5, Duration::from_secs(1), Duration::from_secs(30))
    }

    /// Preset for notifications and deletes
    #[must_use]
    pub fn gentle() -> Self {
        Self::linear(2, Duration::from_secs(1), Duration::from_secs(5))
    }

    /// Enable or disable jitter
    #[must_use]
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Total attempts this policy allows
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay to wait after failed attempt `attempt` (1-indexed)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let attempt = attempt.max(1);
        #[allow(clippy::cast_precision_loss)]
        let initial = self.initial_delay_ms as f64;
        #[allow(clippy::cast_precision_loss)]
        let ceiling = (self.max_delay_ms as f64).max(initial);

        let raw = match self.backoff {
            BackoffKind::Exponential => {
                let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                initial * self.multiplier.powi(exponent)
            }
            BackoffKind::Linear => initial * f64::from(attempt),
            #[allow(clippy::cast_precision_loss)]
            BackoffKind::Fibonacci => initial * fibonacci(attempt) as f64,
        };

        let mut delay = if raw.is_nan() {
            initial
        } else {
            raw.clamp(initial, ceiling)
        };
        if self.jitter {
            delay = (delay * (1.0 + rand::random::<f64>() * JITTER_FRACTION)).min(ceiling);
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        Duration::from_millis(delay.round() as u64)
    }

    /// Check the policy for nonsensical values
    pub fn validate(&self) -> Result<(), String> {
        if self.max_delay_ms < self.initial_delay_ms {
            return Err(format!(
                "max_delay_ms ({}) is below initial_delay_ms ({})",
                self.max_delay_ms, self.initial_delay_ms
            ));
        }
        if self.backoff == BackoffKind::Exponential && !(self.multiplier >= 1.0) {
            return Err(format!("multiplier must be >= 1.0, got {}", self.multiplier));
        }
        Ok(())
    }
}

fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// fib(1) = fib(2) = 1, saturating
fn fibonacci(n: u32) -> u64 {
    let (mut prev, mut curr) = (0u64, 1u64);
    for _ in 1..n {
        let next = prev.saturating_add(curr);
        prev = curr;
        curr = next;
    }
    curr
}

// ============================================================================
// Policy Table
// ============================================================================

/// Keyword rule mapping operation names to a preset
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CategoryRule {
    /// Case-insensitive substrings matched against the operation name
    pub keywords: Vec<String>,
    /// Preset to use when any keyword matches
    pub policy: String,
}

impl CategoryRule {
    fn new(keywords: &[&str], policy: &str) -> Self {
        Self {
            keywords: keywords.iter().map(|k| (*k).to_string()).collect(),
            policy: policy.to_string(),
        }
    }

    fn matches(&self, operation: &str) -> bool {
        self.keywords
            .iter()
            .any(|k| !k.is_empty() && operation.contains(&k.to_ascii_lowercase()))
    }
}

/// Named presets plus ordered keyword rules
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyTable {
    /// Preset used when no rule matches
    pub default_policy: String,

    /// Presets by name
    pub presets: HashMap<String, RetryPolicy>,

    /// Rules checked in order; the first match wins
    pub rules: Vec<CategoryRule>,
}

impl Default for RetryPolicyTable {
    fn default() -> Self {
        let presets = HashMap::from([
            ("default".to_string(), RetryPolicy::default()),
            ("moderate".to_string(), RetryPolicy::moderate()),
            ("patient".to_string(), RetryPolicy::patient()),
            ("gentle".to_string(), RetryPolicy::gentle()),
            ("none".to_string(), RetryPolicy::none()),
        ]);
        Self {
            default_policy: "default".to_string(),
            presets,
            rules: vec![
                CategoryRule::new(&["search", "query"], "moderate"),
                CategoryRule::new(&["sync", "process"], "patient"),
                CategoryRule::new(&["notify", "delete"], "gentle"),
            ],
        }
    }
}

impl RetryPolicyTable {
    /// Preset by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&RetryPolicy> {
        self.presets.get(name)
    }

    /// Add or replace a preset
    #[must_use]
    pub fn with_preset(mut self, name: impl Into<String>, policy: RetryPolicy) -> Self {
        self.presets.insert(name.into(), policy);
        self
    }

    fn default_preset(&self) -> RetryPolicy {
        self.presets
            .get(&self.default_policy)
            .cloned()
            .unwrap_or_default()
    }

    /// Policy for an operation name, chosen by keyword rules
    #[must_use]
    pub fn optimal_policy(&self, operation: &str) -> RetryPolicy {
        let operation = operation.to_ascii_lowercase();
        self.rules
            .iter()
            .find(|rule| rule.matches(&operation))
            .and_then(|rule| self.presets.get(&rule.policy))
            .cloned()
            .unwrap_or_else(|| self.default_preset())
    }

    /// An explicit preset if it exists, otherwise the keyword choice
    #[must_use]
    pub fn resolve(&self, selector: Option<&str>, operation: &str) -> RetryPolicy {
        if let Some(name) = selector {
            if let Some(policy) = self.presets.get(name) {
                return policy.clone();
            }
            tracing::warn!(policy = %name, "Unknown retry policy selector, using keyword rules");
        }
        self.optimal_policy(operation)
    }

    /// Check that every rule and the default point at a real preset
    pub fn validate(&self) -> Result<(), String> {
        if !self.presets.contains_key(&self.default_policy) {
            return Err(format!("default retry policy '{}' is not defined", self.default_policy));
        }
        for rule in &self.rules {
            if !self.presets.contains_key(&rule.policy) {
                return Err(format!(
                    "retry rule {:?} refers to unknown policy '{}'",
                    rule.keywords, rule.policy
                ));
            }
        }
        for (name, policy) in &self.presets {
            policy
                .validate()
                .map_err(|e| format!("retry policy '{name}': {e}"))?;
        }
        Ok(())
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Why a retried operation gave up
#[derive(Debug, Error)]
pub enum RetryError<E> {
    /// Every allowed attempt failed with a retryable error
    #[error("gave up after {attempts} attempt(s): {last_error}")]
    Exhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: E,
    },

    /// An attempt failed with an error that is not worth repeating
    #[error("attempt {attempt} failed permanently: {error}")]
    Aborted {
        /// Attempt that failed
        attempt: u32,
        /// The permanent error
        error: E,
    },

    /// The next backoff sleep would run past the deadline
    #[error("deadline reached after {attempts} attempt(s): {last_error}")]
    DeadlineExceeded {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: E,
    },
}

impl<E> RetryError<E> {
    /// Attempts made before giving up
    #[must_use]
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Exhausted { attempts, .. } | Self::DeadlineExceeded { attempts, .. } => *attempts,
            Self::Aborted { attempt, .. } => *attempt,
        }
    }

    /// The last underlying error
    #[must_use]
    pub fn last_error(&self) -> &E {
        match self {
            Self::Exhausted { last_error, .. } | Self::DeadlineExceeded { last_error, .. } => last_error,
            Self::Aborted { error, .. } => error,
        }
    }

    /// Consume into the last underlying error
    pub fn into_inner(self) -> E {
        match self {
            Self::Exhausted { last_error, .. } | Self::DeadlineExceeded { last_error, .. } => last_error,
            Self::Aborted { error, .. } => error,
        }
    }
}

/// Runs operations under a [`RetryPolicy`]
#[derive(Clone, Debug)]
pub struct RetryExecutor {
    policy: RetryPolicy,
    deadline: Option<Instant>,
}

impl RetryExecutor {
    /// Create an executor without a deadline
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            deadline: None,
        }
    }

    /// Refuse to sleep past `deadline`
    #[must_use]
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The policy in use
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op`, retrying errors that report themselves as retryable
    pub async fn execute<T, E, F, Fut>(&self, op: F) -> Result<T, RetryError<E>>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.execute_with(op, E::is_retryable).await
    }

    /// Run `op`, retrying errors accepted by `is_retryable`
    ///
    /// `op` receives the 1-indexed attempt number.
    pub async fn execute_with<T, E, F, Fut, P>(&self, mut op: F, is_retryable: P) -> Result<T, RetryError<E>>
    where
        E: Display,
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let error = match op(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "Operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !is_retryable(&error) {
                tracing::debug!(attempt, error = %error, "Permanent failure, not retrying");
                return Err(RetryError::Aborted { attempt, error });
            }

            if attempt > self.policy.max_retries {
                tracing::debug!(attempts = attempt, error = %error, "Retries exhausted");
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last_error: error,
                });
            }

            let delay = self.policy.delay_for_attempt(attempt);
            if let Some(deadline) = self.deadline {
                if Instant::now() + delay >= deadline {
                    return Err(RetryError::DeadlineExceeded {
                        attempts: attempt,
                        last_error: error,
                    });
                }
            }

            tracing::debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Transient failure, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{self:?}")
        }
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, Self::Transient)
        }
    }

    fn ms(values: &[u64]) -> Vec<Duration> {
        values.iter().copied().map(Duration::from_millis).collect()
    }

    #[test]
    fn test_exponential_delays_are_clamped() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(1_000), 2.0);
        let delays: Vec<_> = (1..=5).map(|n| policy.delay_for_attempt(n)).collect();
        assert_eq!(delays, ms(&[100, 200, 400, 800, 1_000]));
    }

    #[test]
    fn test_linear_delays() {
        let policy = RetryPolicy::linear(5, Duration::from_millis(250), Duration::from_millis(900));
        let delays: Vec<_> = (1..=4).map(|n| policy.delay_for_attempt(n)).collect();
        assert_eq!(delays, ms(&[250, 500, 750, 900]));
    }

    #[test]
    fn test_fibonacci_delays() {
        let policy = RetryPolicy::fibonacci(8, Duration::from_millis(100), Duration::from_secs(60));
        let delays: Vec<_> = (1..=7).map(|n| policy.delay_for_attempt(n)).collect();
        assert_eq!(delays, ms(&[100, 100, 200, 300, 500, 800, 1_300]));
    }

    #[test]
    fn test_delay_never_below_initial() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(500), Duration::from_millis(100), 0.5);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(1_000), 2.0)
            .with_jitter(true);
        for _ in 0..100 {
            let d = policy.delay_for_attempt(2);
            assert!(d >= Duration::from_millis(200) && d <= Duration::from_millis(250), "{d:?}");
            assert!(policy.delay_for_attempt(10) <= Duration::from_millis(1_000));
        }
    }

    #[test]
    fn test_huge_attempt_numbers_saturate() {
        let policy = RetryPolicy::fibonacci(3, Duration::from_millis(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(500), Duration::from_secs(10));
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_sleeps_between_attempts() {
        let policy = RetryPolicy::exponential(4, Duration::from_millis(100), Duration::from_millis(1_000), 2.0);
        let calls = RefCell::new(Vec::new());

        let result: Result<(), _> = RetryExecutor::new(policy)
            .execute(|_| {
                calls.borrow_mut().push(Instant::now());
                async { Err(TestError::Transient) }
            })
            .await;

        let err = result.err();
        assert!(matches!(err, Some(RetryError::Exhausted { attempts: 5, .. })));

        let calls = calls.into_inner();
        let gaps: Vec<_> = calls.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps, ms(&[100, 200, 400, 800]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_stops_on_permanent_error() {
        let attempts = RefCell::new(0u32);
        let result: Result<(), _> = RetryExecutor::new(RetryPolicy::default())
            .execute(|_| {
                *attempts.borrow_mut() += 1;
                async { Err(TestError::Permanent) }
            })
            .await;

        assert_eq!(*attempts.borrow(), 1);
        assert!(matches!(result, Err(RetryError::Aborted { attempt: 1, error: TestError::Permanent })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_executor_recovers() {
        let result = RetryExecutor::new(RetryPolicy::moderate())
            .execute(|attempt| async move {
                if attempt < 3 {
                    Err(TestError::Transient)
                } else {
                    Ok(attempt)
                }
            })
            .await;
        assert_eq!(result.ok(), Some(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_predicate_overrides_trait() {
        let result: Result<(), _> = RetryExecutor::new(RetryPolicy::default())
            .execute_with(|_| async { Err(TestError::Transient) }, |_| false)
            .await;
        assert_eq!(result.map_err(|e| e.attempts()).err(), Some(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_cuts_backoff_short() {
        let started = Instant::now();
        let policy = RetryPolicy::exponential(10, Duration::from_secs(1), Duration::from_secs(60), 2.0);
        let result: Result<(), _> = RetryExecutor::new(policy)
            .with_deadline(started + Duration::from_secs(5))
            .execute(|_| async { Err(TestError::Transient) })
            .await;

        // Sleeps of 1s and 2s fit; the 4s sleep would end at 7s
        assert!(matches!(result, Err(RetryError::DeadlineExceeded { attempts: 3, .. })));
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[test]
    fn test_retryable_messages() {
        assert!(is_retryable_message("Connection refused (os error 111)"));
        assert!(is_retryable_message("ECONNRESET"));
        assert!(is_retryable_message("request timed out"));
        assert!(is_retryable_message("dns error: failed to lookup address information"));
        assert!(is_retryable_message("HTTP 503"));
        assert!(is_retryable_message("status: 429"));
        assert!(!is_retryable_message("HTTP 404 not found"));
        assert!(!is_retryable_message("invalid api key"));
    }

    #[test]
    fn test_optimal_policy_by_keyword() {
        let table = RetryPolicyTable::default();
        assert_eq!(table.optimal_policy("searchDocuments"), RetryPolicy::moderate());
        assert_eq!(table.optimal_policy("run_query"), RetryPolicy::moderate());
        assert_eq!(table.optimal_policy("SyncCalendar"), RetryPolicy::patient());
        assert_eq!(table.optimal_policy("process_batch"), RetryPolicy::patient());
        assert_eq!(table.optimal_policy("notify_user"), RetryPolicy::gentle());
        assert_eq!(table.optimal_policy("delete"), RetryPolicy::gentle());
        assert_eq!(table.optimal_policy("chat"), RetryPolicy::default());
    }

    #[test]
    fn test_resolve_prefers_explicit_selector() {
        let table = RetryPolicyTable::default();
        assert_eq!(table.resolve(Some("none"), "search"), RetryPolicy::none());
        assert_eq!(table.resolve(Some("missing"), "search"), RetryPolicy::moderate());
        assert_eq!(table.resolve(None, "ocr"), RetryPolicy::default());
    }

    #[test]
    fn test_table_validation() {
        assert!(RetryPolicyTable::default().validate().is_ok());

        let mut table = RetryPolicyTable::default();
        table.rules.push(CategoryRule::new(&["upload"], "aggressive"));
        assert!(table.validate().is_err());

        let table = RetryPolicyTable::default().with_preset(
            "broken",
            RetryPolicy::exponential(1, Duration::from_secs(5), Duration::from_secs(1), 2.0),
        );
        assert!(table.validate().is_err());
    }
}
