//! Session Management
//!
//! Opaque session handles scoped to a service type (e.g. `"ocr"`,
//! `"chat"`). Sessions carry free-form metadata and an absolute expiry.
//!
//! # Design
//!
//! - Expiry is enforced on read: a session is never returned once
//!   `now >= expires_at`, and the read removes it.
//! - Each service type holds at most `max_sessions_per_service` sessions.
//!   Creating one more evicts the oldest session of that type.
//! - The background sweep only reclaims memory; correctness never depends
//!   on it having run.
//!
//! Sessions are grouped per service type behind their own mutex, with a
//! `DashMap` index from id to type for lookups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::time::Instant;

use crate::tasks::PeriodicTask;

/// Session settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Lifetime of a new session (minutes)
    pub timeout_minutes: u64,

    /// Cap on live sessions per service type
    pub max_sessions_per_service: usize,

    /// Cadence of the expiry sweep (seconds)
    pub sweep_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            max_sessions_per_service: 100,
            sweep_interval_secs: 300,
        }
    }
}

impl SessionConfig {
    /// Session lifetime as a `Duration`
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_minutes.saturating_mul(60))
    }

    /// Sweep cadence as a `Duration`
    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// Unique session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a new random session ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("sess_{}", uuid::Uuid::new_v4().simple()))
    }

    /// The id as a string slice
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A tracked session
#[derive(Clone, Debug)]
pub struct Session {
    /// Session id
    pub id: SessionId,
    /// Service type the session belongs to
    pub service_type: String,
    /// Creation time
    pub created_at: Instant,
    /// Last successful read or update
    pub last_accessed_at: Instant,
    /// Absolute expiry
    pub expires_at: Instant,
    /// Caller-supplied metadata
    pub metadata: Map<String, Value>,
    /// Creation order, breaks `created_at` ties
    sequence: u64,
}

impl Session {
    /// Whether the session is expired at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry
    #[must_use]
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}

type ServiceSessions = Arc<Mutex<HashMap<SessionId, Session>>>;

/// Issues, tracks and expires sessions
#[derive(Debug)]
pub struct SessionManager {
    config: SessionConfig,
    services: DashMap<String, ServiceSessions>,
    index: DashMap<SessionId, String>,
    sequence: AtomicU64,
    sweeper: Mutex<Option<PeriodicTask>>,
}

impl SessionManager {
    /// Create an empty manager
    #[must_use]
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            services: DashMap::new(),
            index: DashMap::new(),
            sequence: AtomicU64::new(0),
            sweeper: Mutex::new(None),
        }
    }

    /// Manager configuration
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn service_slot(&self, service_type: &str) -> ServiceSessions {
        if let Some(slot) = self.services.get(service_type) {
            return slot.clone();
        }
        self.services
            .entry(service_type.to_string())
            .or_default()
            .clone()
    }

    fn slot_for(&self, id: &SessionId) -> Option<ServiceSessions> {
        let service_type = self.index.get(id)?.value().clone();
        self.services.get(&service_type).map(|s| s.clone())
    }

    /// Create a session with the configured lifetime
    pub fn create_session(&self, service_type: &str, metadata: Option<Map<String, Value>>) -> SessionId {
        self.create_session_with_timeout(service_type, metadata, self.config.timeout())
    }

    /// Create a session that expires after `timeout`
    pub fn create_session_with_timeout(
        &self,
        service_type: &str,
        metadata: Option<Map<String, Value>>,
        timeout: Duration,
    ) -> SessionId {
        let now = Instant::now();
        let session = Session {
            id: SessionId::new(),
            service_type: service_type.to_string(),
            created_at: now,
            last_accessed_at: now,
            expires_at: now + timeout,
            metadata: metadata.unwrap_or_default(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed),
        };
        let id = session.id.clone();

        let slot = self.service_slot(service_type);
        {
            let mut sessions = slot.lock();
            let mut removed = Vec::new();

            if sessions.len() >= self.config.max_sessions_per_service {
                sessions.retain(|sid, s| {
                    let keep = !s.is_expired_at(now);
                    if !keep {
                        removed.push(sid.clone());
                    }
                    keep
                });
            }
            if sessions.len() >= self.config.max_sessions_per_service {
                let oldest = sessions
                    .values()
                    .min_by_key(|s| (s.created_at, s.sequence))
                    .map(|s| s.id.clone());
                if let Some(oldest) = oldest {
                    sessions.remove(&oldest);
                    tracing::debug!(
                        service_type = %service_type,
                        session = %oldest,
                        "Session cap reached, evicting oldest session"
                    );
                    removed.push(oldest);
                }
            }

            sessions.insert(id.clone(), session);
            // Index updates happen under the slot lock so a concurrent
            // destroy_service_sessions sees the session and its index entry together
            for old in &removed {
                self.index.remove(old);
            }
            self.index.insert(id.clone(), service_type.to_string());
        }
        id
    }

    /// Look up a live session, refreshing its access time
    ///
    /// An expired session is destroyed and `None` returned.
    pub fn get_session(&self, id: &SessionId) -> Option<Session> {
        self.with_live_session(id, |session| session.clone())
    }

    /// Merge keys into a live session's metadata
    pub fn update_session_metadata(&self, id: &SessionId, patch: Map<String, Value>) -> bool {
        self.with_live_session(id, |session| session.metadata.extend(patch))
            .is_some()
    }

    /// Push a live session's expiry back by `additional`
    ///
    /// Fails (returns `false`) for unknown or already expired sessions.
    pub fn extend_session(&self, id: &SessionId, additional: Duration) -> bool {
        self.with_live_session(id, |session| session.expires_at += additional)
            .is_some()
    }

    /// Run `f` on a live session, removing it instead if it has expired
    fn with_live_session<T>(&self, id: &SessionId, f: impl FnOnce(&mut Session) -> T) -> Option<T> {
        let slot = self.slot_for(id)?;
        let now = Instant::now();

        {
            let mut sessions = slot.lock();
            let session = sessions.get_mut(id)?;
            if !session.is_expired_at(now) {
                session.last_accessed_at = now;
                return Some(f(session));
            }
            sessions.remove(id);
        }

        self.index.remove(id);
        tracing::debug!(session = %id, "Session expired");
        None
    }

    /// Destroy one session
    pub fn destroy_session(&self, id: &SessionId) -> bool {
        let Some((_, service_type)) = self.index.remove(id) else {
            return false;
        };
        self.services
            .get(&service_type)
            .map(|slot| slot.clone())
            .is_some_and(|slot| slot.lock().remove(id).is_some())
    }

    /// Destroy every session of a service type
    ///
    /// The service's slot is emptied in place, never removed, so a session
    /// created concurrently always lands in the map readers look at.
    pub fn destroy_service_sessions(&self, service_type: &str) -> usize {
        let Some(slot) = self.services.get(service_type).map(|s| s.clone()) else {
            return 0;
        };
        let destroyed = {
            let mut sessions = slot.lock();
            for id in sessions.keys() {
                self.index.remove(id);
            }
            let count = sessions.len();
            sessions.clear();
            count
        };
        tracing::debug!(service_type = %service_type, destroyed, "Destroyed service sessions");
        destroyed
    }

    /// Live session count per service type
    #[must_use]
    pub fn session_stats(&self) -> HashMap<String, usize> {
        let now = Instant::now();
        self.services
            .iter()
            .filter_map(|entry| {
                let live = entry
                    .value()
                    .lock()
                    .values()
                    .filter(|s| !s.is_expired_at(now))
                    .count();
                (live > 0).then(|| (entry.key().clone(), live))
            })
            .collect()
    }

    /// Total sessions held, including expired ones not yet reclaimed
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    /// Whether no sessions are held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Remove every expired session; returns how many were removed
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut expired = Vec::new();
        for entry in &self.services {
            entry.value().lock().retain(|id, s| {
                let keep = !s.is_expired_at(now);
                if !keep {
                    expired.push(id.clone());
                }
                keep
            });
        }
        for id in &expired {
            self.index.remove(id);
        }
        if !expired.is_empty() {
            tracing::debug!(removed = expired.len(), "Swept expired sessions");
        }
        expired.len()
    }

    /// Start the periodic expiry sweep (no-op if already running)
    pub fn start_sweeper(self: &Arc<Self>) {
        let mut sweeper = self.sweeper.lock();
        if sweeper.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let manager: Weak<Self> = Arc::downgrade(self);
        *sweeper = Some(PeriodicTask::spawn(
            "session-sweep",
            self.config.sweep_interval(),
            move || {
                let manager = manager.clone();
                async move {
                    match manager.upgrade() {
                        Some(manager) => {
                            manager.sweep_expired();
                            true
                        }
                        None => false,
                    }
                }
            },
        ));
    }

    /// Stop the sweep task
    pub async fn shutdown(&self) {
        let task = self.sweeper.lock().take();
        if let Some(task) = task {
            task.shutdown().await;
        }
    }
}
