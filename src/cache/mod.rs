//! Cache-aside identity lookups.
//!
//! A resolved identity is cached; the unresolved sentinel and DAO failures
//! never are, so an identity that appears later in storage is picked up on
//! the next lookup.

use std::fmt;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use prometheus::Counter;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::storage::IdentityResolverDao;

/// A resolved identity with a distinguished "not found" value.
pub trait Identity: Clone + Send + Sync + 'static {
    fn unresolved() -> Self;

    fn is_unresolved(&self) -> bool;
}

impl Identity for i32 {
    fn unresolved() -> Self {
        0
    }

    fn is_unresolved(&self) -> bool {
        *self == 0
    }
}

impl Identity for String {
    fn unresolved() -> Self {
        String::new()
    }

    fn is_unresolved(&self) -> bool {
        self.is_empty()
    }
}

/// Cache sizing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    pub max_capacity: u64,
    pub time_to_live: Option<Duration>,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_capacity: 100_000,
            time_to_live: None,
        }
    }
}

/// Point-in-time lookup counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub failures: u64,
}

struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    failures: AtomicU64,
    hit_metric: Counter,
    miss_metric: Counter,
    failure_metric: Counter,
}

/// Bounded identity cache in front of an [`IdentityResolverDao`].
pub struct IdentityCache<K, V> {
    name: &'static str,
    entries: Cache<K, V>,
    dao: Arc<dyn IdentityResolverDao<K, V>>,
    counters: CacheCounters,
    closed: AtomicBool,
}

impl<K, V> IdentityCache<K, V>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
    V: Identity,
{
    pub fn new(
        name: &'static str,
        dao: Arc<dyn IdentityResolverDao<K, V>>,
        settings: CacheSettings,
        health: &HealthMetrics,
    ) -> Self {
        let mut builder = Cache::builder().max_capacity(settings.max_capacity);
        if let Some(ttl) = settings.time_to_live {
            builder = builder.time_to_live(ttl);
        }

        let requests = &health.identity_cache_requests;
        Self {
            name,
            entries: builder.build(),
            dao,
            counters: CacheCounters {
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                failures: AtomicU64::new(0),
                hit_metric: requests.with_label_values(&[name, "hit"]),
                miss_metric: requests.with_label_values(&[name, "miss"]),
                failure_metric: requests.with_label_values(&[name, "failure"]),
            },
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns the identity for `key`, consulting the DAO on a miss.
    ///
    /// Never fails: a DAO error is logged and yields the unresolved
    /// sentinel.
    pub fn resolve(&self, key: &K) -> V {
        if let Some(value) = self.entries.get(key) {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            self.counters.hit_metric.inc();
            return value;
        }

        match self.dao.resolve(key) {
            Ok(value) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                self.counters.miss_metric.inc();
                if !value.is_unresolved() && !self.closed.load(Ordering::Acquire) {
                    self.entries.insert(key.clone(), value.clone());
                }
                value
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.counters.failure_metric.inc();
                warn!(
                    cache = self.name,
                    key = ?key,
                    error = %e,
                    "identity lookup failed, treating as unresolved",
                );
                V::unresolved()
            }
        }
    }

    /// Pre-populates known identities. Sentinel values are skipped.
    pub fn warm<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (K, V)>,
    {
        let mut loaded = 0;
        for (key, value) in entries {
            if value.is_unresolved() {
                continue;
            }
            self.entries.insert(key, value);
            loaded += 1;
        }
        debug!(cache = self.name, loaded, "identity cache warmed");
        loaded
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.invalidate(key);
    }

    pub fn invalidate_all(&self) {
        self.entries.invalidate_all();
    }

    /// Whether `key` currently has a cached identity.
    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            failures: self.counters.failures.load(Ordering::Relaxed),
        }
    }

    /// Drops every entry and stops caching. Lookups keep working against
    /// the DAO.
    pub fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);
        self.entries.invalidate_all();
        let stats = self.stats();
        info!(
            cache = self.name,
            hits = stats.hits,
            misses = stats.misses,
            failures = stats.failures,
            "identity cache shut down",
        );
    }
}
