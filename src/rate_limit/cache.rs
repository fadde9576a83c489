//! Bounded TTL cache for rate-limit decisions.
//!
//! # Design Decisions
//! - Eviction at capacity removes the least-accessed entry, oldest access first on ties
//! - Expired entries are dropped on read and by the periodic cleanup worker
//! - The cache has its own lock, separate from the limiter state

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::observability::metrics;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub value: V,
    pub expires_at: Instant,
    pub access_count: u64,
    pub last_access: Instant,
}

impl<V> CacheEntry<V> {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug)]
pub struct DecisionCache<V> {
    entries: Mutex<HashMap<String, CacheEntry<V>>>,
    max_size: usize,
}

impl<V: Clone> DecisionCache<V> {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            max_size: max_size.max(1),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("decision cache poisoned");
        let expired = match entries.get_mut(key) {
            None => return None,
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                entry.access_count += 1;
                entry.last_access = now;
                return Some(entry.value.clone());
            }
        };
        if expired {
            entries.remove(key);
        }
        None
    }

    /// Insert or replace `key`. Returns the key evicted to make room, if any.
    pub fn insert(&self, key: impl Into<String>, value: V, ttl: Duration) -> Option<String> {
        let key = key.into();
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("decision cache poisoned");

        let mut evicted = None;
        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            let victim = entries
                .iter()
                .min_by(|(_, a), (_, b)| {
                    a.access_count
                        .cmp(&b.access_count)
                        .then(a.last_access.cmp(&b.last_access))
                })
                .map(|(k, _)| k.clone());
            if let Some(victim) = victim {
                entries.remove(&victim);
                metrics::record_cache_eviction();
                evicted = Some(victim);
            }
        }

        entries.insert(
            key,
            CacheEntry {
                value,
                expires_at: now + ttl,
                access_count: 0,
                last_access: now,
            },
        );
        evicted
    }

    pub fn remove(&self, key: &str) -> Option<V> {
        let mut entries = self.entries.lock().expect("decision cache poisoned");
        entries.remove(key).map(|e| e.value)
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("decision cache poisoned");
        let before = entries.len();
        entries.retain(|_, e| !e.is_expired(now));
        before - entries.len()
    }

    pub fn clear(&self) {
        self.entries.lock().expect("decision cache poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("decision cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.lock().expect("decision cache poisoned").contains_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test(start_paused = true)]
    async fn test_evicts_least_accessed() {
        let cache = DecisionCache::new(3);
        cache.insert("a", 1, TTL);
        cache.insert("b", 2, TTL);
        cache.insert("c", 3, TTL);

        cache.get("a");
        cache.get("a");
        cache.get("c");

        assert_eq!(cache.insert("d", 4, TTL).as_deref(), Some("b"));
        assert!(cache.contains("a"));
        assert!(cache.contains("c"));
        assert!(cache.contains("d"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ties_evict_oldest_access() {
        let cache = DecisionCache::new(2);
        cache.insert("a", 1, TTL);
        tokio::time::advance(Duration::from_millis(5)).await;
        cache.insert("b", 2, TTL);
        tokio::time::advance(Duration::from_millis(5)).await;

        // Same access count, b touched more recently.
        cache.get("a");
        tokio::time::advance(Duration::from_millis(5)).await;
        cache.get("b");

        assert_eq!(cache.insert("c", 3, TTL).as_deref(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_replace_does_not_evict() {
        let cache = DecisionCache::new(1);
        cache.insert("a", 1, TTL);
        assert!(cache.insert("a", 2, TTL).is_none());
        assert_eq!(cache.get("a"), Some(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let cache = DecisionCache::new(4);
        cache.insert("short", 1, Duration::from_millis(100));
        cache.insert("long", 2, TTL);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.len(), 1);

        cache.insert("short", 1, Duration::from_millis(100));
        tokio::time::advance(Duration::from_millis(150)).await;
        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get("long"), Some(2));
    }
}
