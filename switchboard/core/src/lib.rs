//! Switchboard Core - Resilient Multi-Provider Orchestration
//!
//! This crate routes capability requests ("ocr", "chat", "embeddings", ...)
//! to one of several interchangeable external providers, keeping each
//! provider within its rate limits, reusing connections, retrying transient
//! faults and failing over by priority when a provider cannot serve.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Broker                                │
//! │  ┌──────────────┐  ┌──────────────┐  ┌────────────────────────┐  │
//! │  │   Session    │  │    Result    │  │      Provider          │  │
//! │  │   Manager    │  │    Cache     │  │      Catalog           │  │
//! │  └──────────────┘  └──────────────┘  └────────────────────────┘  │
//! │  ┌────────────────────────────────────────────────────────────┐  │
//! │  │                 FailoverOrchestrator                       │  │
//! │  │  ┌────────────┐  ┌────────────┐  ┌───────────┐  ┌───────┐  │  │
//! │  │  │ Composite  │  │ Connection │  │   Retry   │  │ Stats │  │  │
//! │  │  │RateLimiter │  │    Pool    │  │ Executor  │  │       │  │  │
//! │  │  └────────────┘  └────────────┘  └───────────┘  └───────┘  │  │
//! │  └────────────────────────────┬───────────────────────────────┘  │
//! └───────────────────────────────┼──────────────────────────────────┘
//!                                 │ ServiceClient
//!            ┌────────────────────┼────────────────────┐
//!            ▼                    ▼                    ▼
//!        OpenAiClient        OllamaClient        HttpJsonClient
//! ```
//!
//! # Key Types
//!
//! - [`Broker`]: facade owning every component and the background sweeps
//! - [`FailoverOrchestrator`]: priority-ordered execution with retries
//! - [`CompositeRateLimiter`]: per-minute and per-hour budgets per provider
//! - [`ConnectionPool`]: bounded, keyed pool of provider clients
//! - [`RetryExecutor`]: backoff and deadline-aware retry loop
//! - [`SessionManager`]: expiring sessions with a per-service cap
//! - [`ServiceClient`]: the trait every provider integration implements
//!
//! # Module Overview
//!
//! - [`broker`]: the [`Broker`] facade and its builder
//! - [`cache`]: optional TTL cache of successful results
//! - [`client`]: provider client trait, built-in clients and the registry
//! - [`config`]: TOML configuration with environment and CLI overrides
//! - [`error`]: the broker error taxonomy
//! - [`failover`]: provider selection, retry and failover
//! - [`provider`]: provider records and the catalog
//! - [`resilience`]: rate limiting, pooling and retry primitives
//! - [`session`]: session lifecycle
//! - [`stats`]: per-provider statistics and sinks
//! - [`tasks`]: periodic background tasks

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod broker;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod failover;
pub mod provider;
pub mod resilience;
pub mod session;
pub mod stats;
pub mod tasks;

// Re-exports for convenience
pub use broker::{Broker, BrokerBuilder};
pub use cache::{CacheConfig, CacheHit, ResultCache};
pub use client::{
    is_retryable_error, ClientRegistry, OperationResult, OperationStatus, PooledClient,
    ServiceClient, ServiceError,
};
pub use config::{
    load_config, load_config_from_path, ConfigError, ConfigOverrides, ConfigSource,
    SwitchboardConfig,
};
pub use error::{BrokerError, ErrorKind};
pub use failover::{ExecuteOptions, FailoverConfig, FailoverOrchestrator, FailoverSuccess};
pub use provider::{AuthConfig, ProviderCatalog, Secret, ServiceConfig, TestOutcome};
pub use resilience::{
    CompositeRateLimiter, ConnectionPool, PoolConfig, PoolStatus, RateLimitAlgorithm,
    RateLimitConfig, RateLimiter, RetryExecutor, RetryPolicy, RetryPolicyTable,
};
pub use session::{Session, SessionConfig, SessionId, SessionManager};
pub use stats::{
    LogStatsSink, MemoryStatsSink, NoopStatsSink, ProviderStats, ProviderStatus, StatsRecorder,
    StatsSink,
};
pub use tasks::PeriodicTask;
