//! TTL cache for decoded API responses.
//!
//! Uses `DashMap` so reads on different keys never contend; one instance
//! is created per value type, which keeps every lookup statically typed.

use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// A cached value with the time it was stored and how long it stays valid.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

/// Thread-safe string-keyed cache with lazy expiry.
#[derive(Debug)]
pub struct TtlCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Return the value for `key` if it is still fresh.
    ///
    /// A stale entry is evicted on the way out, so it can never be served again.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();

        let stale = match self.entries.get(key) {
            Some(entry) if entry.is_fresh(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };

        if stale {
            // Re-check under the write lock: a concurrent put may have replaced it.
            if self
                .entries
                .remove_if(key, |_, entry| !entry.is_fresh(now))
                .is_some()
            {
                debug!("Evicted stale cache entry: {}", key);
            }
        }
        None
    }

    /// Store `value`, replacing whatever was there.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value,
                inserted_at: Instant::now(),
                ttl,
            },
        );
    }

    pub fn clear(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear_all(&self) {
        self.entries.clear();
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
