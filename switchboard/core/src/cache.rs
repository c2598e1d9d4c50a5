//! Result Cache
//!
//! Optional TTL cache of successful results keyed by
//! `capability/action/input`. Off by default; callers bypass it per request
//! with `skip_cache`. Only successes are stored.

use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;

/// Cache settings
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Whether results are cached at all
    pub enabled: bool,
    /// Entry lifetime (seconds)
    pub ttl_secs: u64,
    /// Entries kept before the oldest are dropped
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: 300,
            max_entries: 1024,
        }
    }
}

impl CacheConfig {
    /// Entry lifetime as a `Duration`
    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

#[derive(Clone, Debug)]
struct CachedResult {
    provider: String,
    data: Value,
    stored_at: Instant,
}

/// A cache hit
#[derive(Clone, Debug, PartialEq)]
pub struct CacheHit {
    /// Provider that produced the result
    pub provider: String,
    /// The cached payload
    pub data: Value,
}

/// TTL cache of successful results
#[derive(Debug)]
pub struct ResultCache {
    config: CacheConfig,
    entries: DashMap<String, CachedResult>,
}

impl ResultCache {
    /// Create a cache
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: DashMap::new(),
        }
    }

    /// Whether caching is on
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.config.max_entries > 0
    }

    /// Cache key for a request
    #[must_use]
    pub fn key(capability: &str, action: &str, input: &Value) -> String {
        format!("{capability}/{action}/{input}")
    }

    /// Fresh entry for `key`; expired entries are dropped on read
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CacheHit> {
        if !self.is_enabled() {
            return None;
        }
        let ttl = self.config.ttl();
        let fresh = self
            .entries
            .get(key)
            .map(|e| (e.stored_at.elapsed() < ttl).then(|| CacheHit {
                provider: e.provider.clone(),
                data: e.data.clone(),
            }));
        match fresh {
            Some(Some(hit)) => Some(hit),
            Some(None) => {
                self.entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a successful result
    pub fn insert(&self, key: String, provider: &str, data: Value) {
        if !self.is_enabled() {
            return;
        }
        if self.entries.len() >= self.config.max_entries && !self.entries.contains_key(&key) {
            self.purge_expired();
            if self.entries.len() >= self.config.max_entries {
                self.evict_oldest();
            }
        }
        self.entries.insert(
            key,
            CachedResult {
                provider: provider.to_string(),
                data,
                stored_at: Instant::now(),
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.stored_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let ttl = self.config.ttl();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        before - self.entries.len()
    }

    /// Drop every entry
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Entries held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
