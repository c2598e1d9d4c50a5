//! Connection Pool Management
//!
//! Reusable connection handles per service key with:
//! - Lazy creation up to `max_connections` per key
//! - FIFO wait queue when a key is at capacity
//! - Direct handoff of a released connection to the oldest live waiter
//! - Idle eviction that never drops a key below `min_connections`
//! - A one-way `drain` for shutdown
//!
//! # Design
//!
//! ```text
//!   acquire(key) ──► idle slot? ── yes ──► Lease
//!                       │
//!                       no ─► total < max? ── yes ──► create_fn() ──► Lease
//!                                  │
//!                                  no ─► enqueue waiter ─┬─► Handoff::Lease
//!                                                        ├─► Handoff::Vacancy ──► create_fn()
//!                                                        └─► timeout / Closed
//! ```
//!
//! Each key has its own `parking_lot::Mutex` inside a `DashMap`; the lock is
//! never held across an await. Handoffs are sent while the key lock is held,
//! so a waiter that times out can tell whether it was already served. A
//! vacancy is counted as in-flight creation before it is sent, so a caller
//! arriving between the wake-up and the waiter's turn cannot take the slot.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::tasks::PeriodicTask;

// ============================================================================
// Configuration
// ============================================================================

/// Pool limits and timings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections kept per key even when idle
    pub min_connections: usize,

    /// Upper bound on connections per key
    pub max_connections: usize,

    /// How long `acquire` waits for a connection (milliseconds)
    pub acquire_timeout_ms: u64,

    /// Idle time after which a free connection is closed (milliseconds)
    pub max_idle_time_ms: u64,

    /// Cadence of the idle sweep (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_connections: 0,
            max_connections: 4,
            acquire_timeout_ms: 30_000,
            max_idle_time_ms: 300_000,
            sweep_interval_secs: 60,
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-key maximum
    #[must_use]
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the per-key minimum kept through idle sweeps
    #[must_use]
    pub fn with_min_connections(mut self, min: usize) -> Self {
        self.min_connections = min;
        self
    }

    /// Set the acquire timeout
    #[must_use]
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the idle eviction threshold
    #[must_use]
    pub fn with_max_idle_time(mut self, idle: Duration) -> Self {
        self.max_idle_time_ms = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Acquire timeout as a `Duration`
    #[must_use]
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    /// Idle eviction threshold as a `Duration`
    #[must_use]
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    /// Sweep cadence as a `Duration`
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Check limits for consistency
    pub fn validate(&self) -> Result<(), String> {
        if self.max_connections == 0 {
            return Err("pool.max_connections must be at least 1".to_string());
        }
        if self.min_connections > self.max_connections {
            return Err(format!(
                "pool.min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Error Types
// ============================================================================

/// Pool-level failures
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    /// No connection became available before the deadline
    #[error("timed out waiting for a connection to '{key}'")]
    Timeout {
        /// Key that was waiting
        key: String,
    },

    /// The pool has been drained
    #[error("connection pool is closed")]
    Closed,
}

/// Failure of [`ConnectionPool::acquire`]
#[derive(Debug, Error)]
pub enum AcquireError<E> {
    /// Pool-level failure
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// The create function failed
    #[error("failed to open connection: {0}")]
    Create(E),
}

// ============================================================================
// Connection Types
// ============================================================================

/// A resource that can live in the pool
#[async_trait]
pub trait PoolResource: Send + Sync + 'static {
    /// Release any underlying resources; called exactly once by the pool
    async fn close(&self);
}

/// Pool-unique connection identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Raw value
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug)]
struct PooledConnection<C> {
    id: ConnectionId,
    handle: Arc<C>,
    created_at: Instant,
    last_used_at: Instant,
    in_use: bool,
    retired: bool,
}

/// A connection checked out of the pool
///
/// Hand it back with [`ConnectionPool::release`].
pub struct Lease<C> {
    key: String,
    id: ConnectionId,
    handle: Arc<C>,
}

impl<C> Lease<C> {
    /// Key the connection belongs to
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Connection id
    #[must_use]
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Shared handle to the connection
    #[must_use]
    pub fn handle(&self) -> &Arc<C> {
        &self.handle
    }
}

impl<C> Deref for Lease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.handle
    }
}

impl<C> std::fmt::Debug for Lease<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("key", &self.key)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

enum Handoff<C> {
    /// A released connection, already marked in use for the waiter
    Lease(Lease<C>),
    /// Capacity freed up without a reusable connection; the slot is already
    /// reserved for the waiter
    Vacancy(CreationSlot<C>),
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Handoff<C>>,
}

struct KeyPool<C> {
    connections: Vec<PooledConnection<C>>,
    waiters: VecDeque<Waiter<C>>,
    creating: usize,
}

impl<C> Default for KeyPool<C> {
    fn default() -> Self {
        Self {
            connections: Vec::new(),
            waiters: VecDeque::new(),
            creating: 0,
        }
    }
}

impl<C> KeyPool<C> {
    fn claim_idle(&mut self, key: &str) -> Option<Lease<C>> {
        let conn = self
            .connections
            .iter_mut()
            .find(|c| !c.in_use && !c.retired)?;
        conn.in_use = true;
        conn.last_used_at = Instant::now();
        Some(Lease {
            key: key.to_string(),
            id: conn.id,
            handle: conn.handle.clone(),
        })
    }

    /// Give `lease` to the oldest waiter still listening
    fn hand_off(&mut self, mut lease: Lease<C>) -> Option<Lease<C>> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(Handoff::Lease(lease)) {
                Ok(()) => return None,
                Err(Handoff::Lease(returned)) => lease = returned,
                Err(Handoff::Vacancy(mut slot)) => {
                    slot.armed = false;
                    return None;
                }
            }
        }
        Some(lease)
    }

    /// Reserve a creation slot for the oldest live waiter
    ///
    /// `this` is the mutex guarding `self`. Returns false when nobody was
    /// waiting, in which case nothing is reserved.
    fn wake_for_vacancy(&mut self, this: &Arc<Mutex<KeyPool<C>>>) -> bool {
        while let Some(waiter) = self.waiters.pop_front() {
            self.creating += 1;
            let reservation = CreationSlot {
                pool: this.clone(),
                armed: true,
            };
            match waiter.tx.send(Handoff::Vacancy(reservation)) {
                Ok(()) => return true,
                Err(mut returned) => {
                    // The lock is held here, so undo by hand rather than on drop
                    if let Handoff::Vacancy(slot) = &mut returned {
                        slot.armed = false;
                    }
                    self.creating = self.creating.saturating_sub(1);
                }
            }
        }
        false
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.tx.is_closed()).count()
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Snapshot of one key's pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Open connections
    pub total: usize,
    /// Connections checked out
    pub active: usize,
    /// Connections ready for reuse
    pub idle: usize,
    /// Callers queued for a connection
    pub waiting: usize,
}

/// Lifetime counters for the whole pool
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Connections created
    pub connections_created: u64,
    /// Connections closed
    pub connections_closed: u64,
    /// Failed create calls
    pub creation_errors: u64,
    /// Acquires that timed out
    pub acquire_timeouts: u64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    created: AtomicU64,
    closed: AtomicU64,
    creation_errors: AtomicU64,
    timeouts: AtomicU64,
}

// ============================================================================
// Connection Pool
// ============================================================================

/// Keyed pool of reusable connections
pub struct ConnectionPool<C> {
    config: PoolConfig,
    pools: DashMap<String, Arc<Mutex<KeyPool<C>>>>,
    next_connection: AtomicU64,
    next_waiter: AtomicU64,
    closed: AtomicBool,
    counters: PoolCounters,
}

impl<C> std::fmt::Debug for ConnectionPool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("keys", &self.pools.len())
            .field("closed", &self.closed.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

/// A reserved creation slot
///
/// Dropping it while armed releases the slot to the next waiter. That covers
/// a failed create, a cancelled acquire and a vacancy nobody received.
struct CreationSlot<C> {
    pool: Arc<Mutex<KeyPool<C>>>,
    armed: bool,
}

impl<C> Drop for CreationSlot<C> {
    fn drop(&mut self) {
        if self.armed {
            let mut pool = self.pool.lock();
            pool.creating = pool.creating.saturating_sub(1);
            pool.wake_for_vacancy(&self.pool);
        }
    }
}

impl<C: PoolResource> ConnectionPool<C> {
    /// Create an empty pool
    #[must_use]
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            pools: DashMap::new(),
            next_connection: AtomicU64::new(1),
            next_waiter: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            counters: PoolCounters::default(),
        }
    }

    /// Pool configuration
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Whether `drain` has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn key_pool(&self, key: &str) -> Arc<Mutex<KeyPool<C>>> {
        if let Some(pool) = self.pools.get(key) {
            return pool.clone();
        }
        self.pools
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(KeyPool::default())))
            .clone()
    }

    /// Check out a connection, waiting up to the configured acquire timeout
    pub async fn acquire<F, Fut, E>(&self, key: &str, create: F) -> Result<Lease<C>, AcquireError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let deadline = Instant::now() + self.config.acquire_timeout();
        self.acquire_until(key, deadline, create).await
    }

    /// Check out a connection, waiting until `deadline`
    ///
    /// `create` runs at most once, and only when the key is below
    /// `max_connections` with no idle connection to reuse.
    pub async fn acquire_until<F, Fut, E>(
        &self,
        key: &str,
        deadline: Instant,
        create: F,
    ) -> Result<Lease<C>, AcquireError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        if self.is_closed() {
            return Err(PoolError::Closed.into());
        }
        let started = Instant::now();

        let slot = self.key_pool(key);
        let queued = {
            let mut pool = slot.lock();
            // drain() flips the flag before visiting each key
            if self.is_closed() {
                return Err(PoolError::Closed.into());
            }
            if let Some(lease) = pool.claim_idle(key) {
                return Ok(lease);
            }
            if pool.connections.len() + pool.creating < self.config.max_connections {
                pool.creating += 1;
                None
            } else {
                let (tx, rx) = oneshot::channel();
                let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
                pool.waiters.push_back(Waiter { id: waiter_id, tx });
                Some((waiter_id, rx))
            }
        };

        let Some((waiter_id, mut rx)) = queued else {
            let reservation = CreationSlot {
                pool: slot.clone(),
                armed: true,
            };
            return self.open(key, &slot, reservation, deadline, create).await;
        };

        match tokio::time::timeout_at(deadline, &mut rx).await {
            Ok(Ok(Handoff::Lease(lease))) => Ok(lease),
            Ok(Ok(Handoff::Vacancy(reservation))) => {
                if self.is_closed() {
                    return Err(PoolError::Closed.into());
                }
                self.open(key, &slot, reservation, deadline, create).await
            }
            Ok(Err(_)) => Err(PoolError::Closed.into()),
            Err(_) => {
                let mut pool = slot.lock();
                if let Some(pos) = pool.waiters.iter().position(|w| w.id == waiter_id) {
                    pool.waiters.remove(pos);
                    drop(pool);
                    return Err(self.timed_out(key, started));
                }
                // Served while the deadline fired; the handoff is already queued
                match rx.try_recv() {
                    Ok(Handoff::Lease(lease)) => Ok(lease),
                    Ok(Handoff::Vacancy(mut reservation)) => {
                        // Pass the slot on while still holding the lock
                        reservation.armed = false;
                        pool.creating = pool.creating.saturating_sub(1);
                        pool.wake_for_vacancy(&slot);
                        drop(pool);
                        Err(self.timed_out(key, started))
                    }
                    Err(_) => {
                        drop(pool);
                        Err(if self.is_closed() {
                            AcquireError::Pool(PoolError::Closed)
                        } else {
                            self.timed_out(key, started)
                        })
                    }
                }
            }
        }
    }

    fn timed_out<E>(&self, key: &str, started: Instant) -> AcquireError<E> {
        self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            key = %key,
            waited_ms = started.elapsed().as_millis() as u64,
            "Timed out waiting for pooled connection"
        );
        AcquireError::Pool(PoolError::Timeout { key: key.to_string() })
    }

    async fn open<F, Fut, E>(
        &self,
        key: &str,
        slot: &Arc<Mutex<KeyPool<C>>>,
        mut reservation: CreationSlot<C>,
        deadline: Instant,
        create: F,
    ) -> Result<Lease<C>, AcquireError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<C, E>>,
    {
        let conn = match tokio::time::timeout_at(deadline, create()).await {
            Ok(Ok(conn)) => conn,
            Ok(Err(e)) => {
                self.counters.creation_errors.fetch_add(1, Ordering::Relaxed);
                return Err(AcquireError::Create(e));
            }
            Err(_) => {
                self.counters.timeouts.fetch_add(1, Ordering::Relaxed);
                return Err(PoolError::Timeout { key: key.to_string() }.into());
            }
        };

        let handle = Arc::new(conn);
        {
            let mut pool = slot.lock();
            reservation.armed = false;
            pool.creating = pool.creating.saturating_sub(1);

            if !self.is_closed() {
                let id = ConnectionId(self.next_connection.fetch_add(1, Ordering::Relaxed));
                let now = Instant::now();
                pool.connections.push(PooledConnection {
                    id,
                    handle: handle.clone(),
                    created_at: now,
                    last_used_at: now,
                    in_use: true,
                    retired: false,
                });
                self.counters.created.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(key = %key, connection = %id, "Opened pooled connection");
                return Ok(Lease {
                    key: key.to_string(),
                    id,
                    handle,
                });
            }
        }

        // Drained while the connection was being opened
        handle.close().await;
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        Err(PoolError::Closed.into())
    }

    /// Return a connection to the pool
    ///
    /// The connection goes straight to the oldest waiter for its key if there
    /// is one. Leases this pool does not recognise, or connections that are
    /// already free, are ignored. Returns whether the lease was accepted.
    pub fn release(&self, lease: Lease<C>) -> bool {
        let Some(slot) = self.pools.get(lease.key()).map(|p| p.clone()) else {
            tracing::debug!(key = %lease.key(), "Release for unknown pool key ignored");
            return false;
        };

        let retired = {
            let mut pool = slot.lock();
            let Some(idx) = pool
                .connections
                .iter()
                .position(|c| c.id == lease.id && Arc::ptr_eq(&c.handle, &lease.handle))
            else {
                tracing::debug!(connection = %lease.id, "Release of unknown connection ignored");
                return false;
            };
            if !pool.connections[idx].in_use {
                tracing::debug!(connection = %lease.id, "Release of idle connection ignored");
                return false;
            }

            if pool.connections[idx].retired {
                let conn = pool.connections.swap_remove(idx);
                pool.wake_for_vacancy(&slot);
                Some(conn.handle)
            } else {
                pool.connections[idx].last_used_at = Instant::now();
                if pool.hand_off(lease).is_some() {
                    pool.connections[idx].in_use = false;
                }
                None
            }
        };

        if let Some(handle) = retired {
            self.close_detached(handle);
        }
        true
    }

    fn close_detached(&self, handle: Arc<C>) {
        self.counters.closed.fetch_add(1, Ordering::Relaxed);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { handle.close().await });
            }
            Err(_) => tracing::warn!("No runtime to close retired connection on"),
        }
    }

    /// Close free connections idle longer than `max_idle_time`
    ///
    /// Keys keep at least `min_connections`. Returns the number closed.
    pub async fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let max_idle = self.config.max_idle_time();
        let mut victims = Vec::new();

        for entry in &self.pools {
            let mut pool = entry.value().lock();
            let before = victims.len();
            let mut idx = 0;
            while idx < pool.connections.len() {
                let conn = &pool.connections[idx];
                let expired = !conn.in_use
                    && now.saturating_duration_since(conn.last_used_at) >= max_idle;
                if expired && pool.connections.len() > self.config.min_connections {
                    let conn = pool.connections.swap_remove(idx);
                    tracing::debug!(
                        key = %entry.key(),
                        connection = %conn.id,
                        age_secs = now.saturating_duration_since(conn.created_at).as_secs(),
                        "Evicting idle connection"
                    );
                    victims.push(conn.handle);
                } else {
                    idx += 1;
                }
            }
            for _ in before..victims.len() {
                if !pool.wake_for_vacancy(entry.value()) {
                    break;
                }
            }
        }

        let count = victims.len();
        for handle in victims {
            handle.close().await;
        }
        self.counters.closed.fetch_add(count as u64, Ordering::Relaxed);
        count
    }

    /// Close idle connections for `key` and retire in-use ones
    ///
    /// Retired connections are closed when released. Returns the number
    /// closed immediately.
    pub async fn evict_key(&self, key: &str) -> usize {
        let Some(slot) = self.pools.get(key).map(|p| p.clone()) else {
            return 0;
        };

        let victims: Vec<Arc<C>> = {
            let mut pool = slot.lock();
            let (idle, busy): (Vec<_>, Vec<_>) = pool.connections.drain(..).partition(|c| !c.in_use);
            pool.connections = busy;
            for conn in &mut pool.connections {
                conn.retired = true;
            }
            for _ in 0..idle.len() {
                if !pool.wake_for_vacancy(&slot) {
                    break;
                }
            }
            idle.into_iter().map(|c| c.handle).collect()
        };

        let count = victims.len();
        for handle in victims {
            handle.close().await;
        }
        self.counters.closed.fetch_add(count as u64, Ordering::Relaxed);
        tracing::debug!(key = %key, closed = count, "Evicted connections for key");
        count
    }

    /// Close every connection and refuse further acquires
    ///
    /// Waiters are woken with [`PoolError::Closed`]. Returns the number of
    /// connections closed.
    pub async fn drain(&self) -> usize {
        self.closed.store(true, Ordering::Release);

        let mut victims = Vec::new();
        for entry in &self.pools {
            let mut pool = entry.value().lock();
            victims.extend(pool.connections.drain(..).map(|c| c.handle));
            pool.waiters.clear();
        }
        self.pools.clear();

        let count = victims.len();
        for handle in victims {
            handle.close().await;
        }
        self.counters.closed.fetch_add(count as u64, Ordering::Relaxed);
        tracing::info!(closed = count, "Connection pool drained");
        count
    }

    /// Per-key snapshot
    #[must_use]
    pub fn status(&self) -> HashMap<String, PoolStatus> {
        self.pools
            .iter()
            .map(|entry| {
                let pool = entry.value().lock();
                let active = pool.connections.iter().filter(|c| c.in_use).count();
                let status = PoolStatus {
                    total: pool.connections.len(),
                    active,
                    idle: pool.connections.len() - active,
                    waiting: pool.live_waiters(),
                };
                (entry.key().clone(), status)
            })
            .collect()
    }

    /// Snapshot for one key
    #[must_use]
    pub fn key_status(&self, key: &str) -> PoolStatus {
        self.status().remove(key).unwrap_or_default()
    }

    /// Lifetime counters
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            connections_created: self.counters.created.load(Ordering::Relaxed),
            connections_closed: self.counters.closed.load(Ordering::Relaxed),
            creation_errors: self.counters.creation_errors.load(Ordering::Relaxed),
            acquire_timeouts: self.counters.timeouts.load(Ordering::Relaxed),
        }
    }

    /// Run `evict_idle` on the configured cadence while the pool is alive
    pub fn spawn_sweeper(self: &Arc<Self>) -> PeriodicTask {
        let pool: Weak<Self> = Arc::downgrade(self);
        PeriodicTask::spawn("pool-idle-sweep", self.config.sweep_interval(), move || {
            let pool = pool.clone();
            async move {
                let Some(pool) = pool.upgrade() else {
                    return false;
                };
                if pool.is_closed() {
                    return false;
                }
                let evicted = pool.evict_idle().await;
                if evicted > 0 {
                    tracing::debug!(evicted, "Idle sweep closed connections");
                }
                true
            }
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Default)]
    struct TestConn {
        closes: AtomicUsize,
    }

    #[async_trait]
    impl PoolResource for TestConn {
        async fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(max: usize) -> ConnectionPool<TestConn> {
        ConnectionPool::new(
            PoolConfig::new()
                .with_max_connections(max)
                .with_acquire_timeout(Duration::from_secs(5))
                .with_max_idle_time(Duration::from_secs(60)),
        )
    }

    async fn open(pool: &ConnectionPool<TestConn>, key: &str) -> Lease<TestConn> {
        match pool
            .acquire(key, || async { Ok::<_, String>(TestConn::default()) })
            .await
        {
            Ok(lease) => lease,
            Err(e) => panic!("acquire failed: {e}"),
        }
    }

    async fn wait_for_waiters(pool: &ConnectionPool<TestConn>, key: &str, n: usize) {
        while pool.key_status(key).waiting < n {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reuses_idle_connection() {
        let pool = pool(2);
        let first = open(&pool, "svc").await;
        let id = first.id();
        assert!(pool.release(first));

        let second = open(&pool, "svc").await;
        assert_eq!(second.id(), id);
        assert_eq!(pool.stats().connections_created, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_hands_exact_connection_to_waiter() {
        let pool = Arc::new(pool(2));
        let a = open(&pool, "svc").await;
        let _b = open(&pool, "svc").await;
        let a_id = a.id();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { open(&waiter_pool, "svc").await.id() });
        wait_for_waiters(&pool, "svc", 1).await;

        assert!(pool.release(a));
        let served = waiter.await.unwrap_or_else(|e| panic!("waiter panicked: {e}"));
        assert_eq!(served, a_id);
        assert_eq!(pool.stats().connections_created, 2);

        let status = pool.key_status("svc");
        assert_eq!(status, PoolStatus { total: 2, active: 2, idle: 0, waiting: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_fifo_order() {
        let pool = Arc::new(pool(1));
        let held = open(&pool, "svc").await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..3 {
            let p = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let lease = open(&p, "svc").await;
                order.lock().push(n);
                p.release(lease);
            }));
            wait_for_waiters(&pool, "svc", n + 1).await;
        }

        pool.release(held);
        for handle in handles {
            let _ = handle.await;
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_vacancy_is_reserved_for_oldest_waiter() {
        let pool = Arc::new(pool(1));
        let busy = open(&pool, "svc").await;
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for n in 0..2 {
            let p = pool.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let lease = open(&p, "svc").await;
                order.lock().push(n);
                p.release(lease);
            }));
            wait_for_waiters(&pool, "svc", n + 1).await;
        }

        // Releasing a retired connection frees a slot instead of handing it over
        pool.evict_key("svc").await;
        assert!(pool.release(busy));

        // A newcomer arriving before the woken waiter runs queues behind both
        let lease = open(&pool, "svc").await;
        order.lock().push(2);
        pool.release(lease);
        for handle in handles {
            let _ = handle.await;
        }

        assert_eq!(*order.lock(), vec![0, 1, 2]);
        assert_eq!(pool.stats().connections_created, 2);
        assert_eq!(pool.key_status("svc"), PoolStatus { total: 1, active: 0, idle: 1, waiting: 0 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_vacancy_passes_slot_on() {
        let pool = Arc::new(pool(1));
        let busy = open(&pool, "svc").await;
        let busy_id = busy.id();

        let p = pool.clone();
        let first = tokio::spawn(async move { open(&p, "svc").await.id() });
        wait_for_waiters(&pool, "svc", 1).await;
        let p = pool.clone();
        let second = tokio::spawn(async move { open(&p, "svc").await.id() });
        wait_for_waiters(&pool, "svc", 2).await;

        pool.evict_key("svc").await;
        assert!(pool.release(busy));
        // The woken waiter goes away before it can use its slot
        first.abort();
        let _ = first.await;

        let served = second.await.unwrap_or_else(|e| panic!("waiter panicked: {e}"));
        assert_ne!(served, busy_id);
        assert_eq!(pool.key_status("svc"), PoolStatus { total: 1, active: 1, idle: 0, waiting: 0 });
        assert_eq!(pool.stats().connections_created, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_of_foreign_lease_is_noop() {
        let pool = pool(2);
        let other = pool_with_conn().await;
        let held = open(&pool, "svc").await;

        let before = pool.key_status("svc");
        assert!(!pool.release(other));
        assert_eq!(pool.key_status("svc"), before);
        assert!(pool.release(held));
    }

    async fn pool_with_conn() -> Lease<TestConn> {
        let other = pool(1);
        open(&other, "svc").await
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_release_is_noop() {
        let pool = Arc::new(pool(1));
        let lease = open(&pool, "svc").await;
        let copy = Lease {
            key: lease.key.clone(),
            id: lease.id,
            handle: lease.handle.clone(),
        };
        assert!(pool.release(lease));
        assert!(!pool.release(copy));
        assert_eq!(pool.key_status("svc").idle, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_when_exhausted() {
        let pool = pool(1);
        let _held = open(&pool, "svc").await;

        let started = Instant::now();
        let result = pool
            .acquire("svc", || async { Ok::<_, String>(TestConn::default()) })
            .await;
        assert!(matches!(result, Err(AcquireError::Pool(PoolError::Timeout { .. }))));
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(pool.key_status("svc").waiting, 0);
        assert_eq!(pool.stats().acquire_timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_failure_frees_capacity() {
        let pool = pool(1);
        let failed = pool
            .acquire("svc", || async { Err::<TestConn, _>("refused".to_string()) })
            .await;
        assert!(matches!(failed, Err(AcquireError::Create(ref e)) if e == "refused"));

        let lease = open(&pool, "svc").await;
        assert_eq!(pool.key_status("svc").active, 1);
        assert!(pool.release(lease));
        assert_eq!(pool.stats().creation_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_closes_once_and_keeps_busy() {
        let pool = pool(3);
        let idle = open(&pool, "svc").await;
        let busy = open(&pool, "svc").await;
        let idle_handle = idle.handle().clone();
        pool.release(idle);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(pool.evict_idle().await, 1);
        assert_eq!(pool.evict_idle().await, 0);
        assert_eq!(idle_handle.closes.load(Ordering::SeqCst), 1);
        assert_eq!(busy.closes.load(Ordering::SeqCst), 0);

        let status = pool.key_status("svc");
        assert_eq!((status.total, status.active), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_idle_respects_min_connections() {
        let pool = ConnectionPool::new(
            PoolConfig::new()
                .with_max_connections(3)
                .with_min_connections(1)
                .with_max_idle_time(Duration::from_secs(10)),
        );
        let a = open(&pool, "svc").await;
        let b = open(&pool, "svc").await;
        pool.release(a);
        pool.release(b);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(pool.evict_idle().await, 1);
        assert_eq!(pool.key_status("svc").total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_used_connection_survives_sweep() {
        let pool = pool(1);
        let lease = open(&pool, "svc").await;
        pool.release(lease);

        tokio::time::advance(Duration::from_secs(50)).await;
        let lease = open(&pool, "svc").await;
        pool.release(lease);
        tokio::time::advance(Duration::from_secs(50)).await;

        assert_eq!(pool.evict_idle().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_closes_everything_once() {
        let pool = Arc::new(pool(1));
        let held = open(&pool, "svc").await;
        let handle = held.handle().clone();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move {
            waiter_pool
                .acquire("svc", || async { Ok::<_, String>(TestConn::default()) })
                .await
                .map(|l| l.id())
        });
        wait_for_waiters(&pool, "svc", 1).await;

        assert_eq!(pool.drain().await, 1);
        let waited = waiter.await.unwrap_or_else(|e| panic!("waiter panicked: {e}"));
        assert!(matches!(waited, Err(AcquireError::Pool(PoolError::Closed))));

        assert!(!pool.release(held));
        assert_eq!(pool.drain().await, 0);
        assert_eq!(handle.closes.load(Ordering::SeqCst), 1);

        let after = pool
            .acquire("svc", || async { Ok::<_, String>(TestConn::default()) })
            .await;
        assert!(matches!(after, Err(AcquireError::Pool(PoolError::Closed))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_key_retires_busy_connections() {
        let pool = pool(2);
        let busy = open(&pool, "svc").await;
        let idle = open(&pool, "svc").await;
        let busy_handle = busy.handle().clone();
        let idle_handle = idle.handle().clone();
        pool.release(idle);

        assert_eq!(pool.evict_key("svc").await, 1);
        assert_eq!(idle_handle.closes.load(Ordering::SeqCst), 1);

        // A fresh acquire must not receive the retired connection
        let fresh = open(&pool, "svc").await;
        assert!(!Arc::ptr_eq(fresh.handle(), &busy_handle));

        assert!(pool.release(busy));
        tokio::task::yield_now().await;
        assert_eq!(busy_handle.closes.load(Ordering::SeqCst), 1);
        assert_eq!(pool.key_status("svc").total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retired_release_wakes_waiter_to_create() {
        let pool = Arc::new(pool(1));
        let busy = open(&pool, "svc").await;
        let busy_id = busy.id();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { open(&waiter_pool, "svc").await.id() });
        wait_for_waiters(&pool, "svc", 1).await;

        pool.evict_key("svc").await;
        pool.release(busy);

        let served = waiter.await.unwrap_or_else(|e| panic!("waiter panicked: {e}"));
        assert_ne!(served, busy_id);
        assert_eq!(pool.stats().connections_created, 2);
    }
}
