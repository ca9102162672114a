use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};
use serde::{Deserialize, Serialize};

use crate::downloader::ResourceIdentity;
use crate::errors::AppError;

/// Cache entry for resolved metadata
#[derive(Debug)]
pub struct CacheEntry<T> {
    pub key: ResourceIdentity,
    pub value: T,
    pub created_at: Instant,
    last_accessed: AtomicU64,
}

impl<T> CacheEntry<T> {
    fn new(key: ResourceIdentity, value: T, tick: u64) -> Self {
        Self {
            key,
            value,
            created_at: Instant::now(),
            last_accessed: AtomicU64::new(tick),
        }
    }

    pub fn is_expired(&self, ttl: Duration) -> bool {
        self.created_at.elapsed() >= ttl
    }

    fn touch(&self, tick: u64) {
        self.last_accessed.fetch_max(tick, Ordering::Relaxed);
    }

    fn last_accessed(&self) -> u64 {
        self.last_accessed.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CacheStats {
    pub entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

/// Bounded LRU store with a per-entry TTL, keyed by resource identity.
///
/// Lookups take the read lock only; recency is an atomic tick on the entry.
/// Structural changes (insert, evict, expire, invalidate) take the write lock.
pub struct MetadataCache<V> {
    name: &'static str,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    capacity: usize,
    ttl: Duration,
    clock: AtomicU64,
    counters: Counters,
}

impl<V: Clone> MetadataCache<V> {
    pub fn new(name: &'static str, capacity: usize, ttl: Duration) -> Self {
        Self {
            name,
            entries: RwLock::new(HashMap::with_capacity(capacity + 1)),
            capacity: capacity.max(1),
            ttl,
            clock: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    fn next_tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn get(&self, key: &ResourceIdentity) -> Option<V> {
        let map_key = key.cache_key();

        let stale = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            match entries.get(&map_key) {
                None => {
                    self.counters.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if entry.key.cache_key() != map_key => Staleness::Inconsistent,
                Some(entry) if entry.is_expired(self.ttl) => Staleness::Expired,
                Some(entry) => {
                    entry.touch(self.next_tick());
                    self.counters.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.value.clone());
                }
            }
        };

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        match stale {
            Staleness::Expired => {
                // A writer may have refreshed the entry between the two locks.
                if let Some(entry) = entries.get(&map_key) {
                    if !entry.is_expired(self.ttl) {
                        entry.touch(self.next_tick());
                        self.counters.hits.fetch_add(1, Ordering::Relaxed);
                        return Some(entry.value.clone());
                    }
                }
                entries.remove(&map_key);
                self.counters.expirations.fetch_add(1, Ordering::Relaxed);
                log::debug!("⌛ [CACHE:{}] Entry expired: {}", self.name, map_key);
            }
            Staleness::Inconsistent => {
                entries.remove(&map_key);
                let err = AppError::CacheInconsistent(format!(
                    "entry stored under {} carries a different key",
                    map_key
                ));
                log::warn!("⚠️ [CACHE:{}] {}; dropping entry", self.name, err);
            }
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Inserts or replaces `key`. The last writer for a key wins.
    pub fn put(&self, key: ResourceIdentity, value: V) {
        let map_key = key.cache_key();
        let tick = self.next_tick();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);

        entries.insert(map_key.clone(), CacheEntry::new(key, value, tick));

        while entries.len() > self.capacity {
            let victim = entries
                .iter()
                .filter(|(k, _)| **k != map_key)
                .min_by_key(|(_, entry)| entry.last_accessed())
                .map(|(k, _)| k.clone());

            match victim {
                Some(victim) => {
                    entries.remove(&victim);
                    self.counters.evictions.fetch_add(1, Ordering::Relaxed);
                    log::debug!("🗑️ [CACHE:{}] Evicted least recently used: {}", self.name, victim);
                }
                None => break,
            }
        }
    }

    pub fn invalidate(&self, key: &ResourceIdentity) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.remove(&key.cache_key()).is_some()
    }

    pub fn purge_expired(&self) -> usize {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, entry| !entry.is_expired(self.ttl));
        let removed = before - entries.len();
        self.counters.expirations.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn contains(&self, key: &ResourceIdentity) -> bool {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&key.cache_key())
            .map_or(false, |entry| !entry.is_expired(self.ttl))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            capacity: self.capacity,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            expirations: self.counters.expirations.load(Ordering::Relaxed),
        }
    }
}

enum Staleness {
    Expired,
    Inconsistent,
}
