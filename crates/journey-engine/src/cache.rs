//! A small TTL cache with least-recently-used eviction.
//!
//! Expiry is measured with the injected [`Clock`], so tests can drive it with a
//! `ManualClock`. Expired entries are dropped lazily on access and in bulk by
//! [`TtlCache::purge_expired`].

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use journey_types::Clock;

struct Entry<V> {
    value: V,
    expires_at: DateTime<Utc>,
    last_used: u64,
}

pub struct TtlCache<K, V> {
    clock: Arc<dyn Clock>,
    ttl: chrono::Duration,
    max_entries: usize,
    entries: HashMap<K, Entry<V>>,
    tick: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    /// `max_entries` of zero is treated as one.
    pub fn new(clock: Arc<dyn Clock>, ttl: std::time::Duration, max_entries: usize) -> Self {
        Self {
            clock,
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            max_entries: max_entries.max(1),
            entries: HashMap::new(),
            tick: 0,
        }
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub fn insert(&mut self, key: K, value: V) {
        let now = self.clock.now();
        let last_used = self.next_tick();
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.purge_expired();
            if self.entries.len() >= self.max_entries {
                self.evict_lru();
            }
        }
        self.entries.insert(
            key,
            Entry {
                value,
                expires_at: now.checked_add_signed(self.ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
                last_used,
            },
        );
    }

    /// Fetch a live entry, refreshing its recency. Expired entries are removed.
    pub fn get(&mut self, key: &K) -> Option<V> {
        let now = self.clock.now();
        let expired = self.entries.get(key).is_some_and(|e| e.expires_at <= now);
        if expired {
            self.entries.remove(key);
            return None;
        }
        let tick = self.next_tick();
        self.entries.get_mut(key).map(|e| {
            e.last_used = tick;
            e.value.clone()
        })
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|e| e.value)
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&mut self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        before - self.entries.len()
    }

    fn evict_lru(&mut self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Number of stored entries, including any not yet purged.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
