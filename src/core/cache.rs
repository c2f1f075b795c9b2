// src/core/cache.rs

use log::trace;
use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// An expiring key/value store shared across threads.
///
/// Expiration is checked lazily: an entry is evicted the next time it is read
/// after its deadline, or by [`TtlCache::purge_expired`]. There is no
/// background eviction thread.
///
/// A poisoned lock is treated as an empty cache: reads miss and writes are
/// dropped, so callers simply redo the expensive check.
pub struct TtlCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
}

impl<V: Clone> TtlCache<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached value, or `None` if it is absent or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().ok()?;
        let now = Instant::now();
        match entries.get(key) {
            Some(entry) if entry.is_expired(now) => {
                trace!("Cache entry '{}' expired, evicting.", key);
                entries.remove(key);
                None
            }
            Some(entry) => Some(entry.value.clone()),
            None => None,
        }
    }

    /// Stores `value` under `key` for `ttl`.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        let expires_at = Instant::now()
            .checked_add(ttl)
            .unwrap_or_else(|| Instant::now() + Duration::from_secs(u32::MAX.into()));
        entries.insert(key.into(), CacheEntry { value, expires_at });
    }

    /// Returns the cached value or computes, stores and returns it.
    pub fn get_or_insert_with(&self, key: &str, ttl: Duration, compute: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = compute();
        self.set(key, value.clone(), ttl);
        value
    }

    /// Removes one key. Returns true if an entry (expired or not) was removed.
    pub fn clear(&self, key: &str) -> bool {
        self.entries
            .lock()
            .map(|mut entries| entries.remove(key).is_some())
            .unwrap_or(false)
    }

    /// Removes every entry.
    pub fn clear_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    /// Evicts all expired entries and returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let Ok(mut entries) = self.entries.lock() else {
            return 0;
        };
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(now));
        before - entries.len()
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone> Default for TtlCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> std::fmt::Debug for TtlCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let len = self.entries.lock().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("TtlCache").field("entries", &len).finish()
    }
}
