//! Resilience primitives
//!
//! The building blocks the failover orchestrator composes for every provider
//! attempt:
//!
//! - [`rate_limit`]: per-key token bucket / sliding window admission
//! - [`pool`]: keyed connection pool with FIFO waiters
//! - [`retry`]: backoff policies and the retry executor

pub mod pool;
pub mod rate_limit;
pub mod retry;

pub use pool::{
    AcquireError, ConnectionId, ConnectionPool, Lease, PoolConfig, PoolError, PoolResource,
    PoolStats, PoolStatus,
};
pub use rate_limit::{
    CompositeRateLimiter, RateLimitAlgorithm, RateLimitConfig, RateLimitError, RateLimiter,
    RateLimiterStats,
};
pub use retry::{
    is_retryable_message, BackoffKind, CategoryRule, RetryError, RetryExecutor, RetryPolicy,
    RetryPolicyTable, Retryable,
};
