//! Short-TTL cache of assembled recall results.
//!
//! Thread-safe via `DashMap`. Expired entries are evicted lazily on `get()`
//! and in bulk by [`QueryCache::evict_expired`]. A `Duration::ZERO` TTL
//! disables caching. Concurrent misses on the same key are coalesced: one
//! caller computes, the others wait for its result.

use dashmap::DashMap;
use mnemos_types::error::MnemosResult;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;
use tracing::debug;

/// A cached value with its insertion timestamp.
struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
}

/// Thread-safe TTL cache with a bounded entry count and single-flight fills.
pub struct QueryCache<V> {
    entries: DashMap<String, CacheEntry<V>>,
    inflight: DashMap<String, Arc<OnceCell<V>>>,
    ttl: Duration,
    max_entries: usize,
}

/// Cache key for a request: SHA-256 over its normalized parts.
pub fn query_key(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

impl<V: Clone + Send + Sync> QueryCache<V> {
    /// Create a new cache. A TTL of `Duration::ZERO` disables caching.
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: DashMap::new(),
            inflight: DashMap::new(),
            ttl,
            max_entries: max_entries.max(1),
        }
    }

    /// Get a cached value by key. Returns `None` if missing or expired.
    pub fn get(&self, key: &str) -> Option<V> {
        if self.ttl.is_zero() {
            return None;
        }
        let entry = self.entries.get(key)?;
        if entry.inserted_at.elapsed() > self.ttl {
            drop(entry); // release read lock before removing
            self.entries.remove(key);
            None
        } else {
            Some(entry.value.clone())
        }
    }

    /// Store a value, evicting the oldest entry when full. No-op if TTL is zero.
    pub fn put(&self, key: String, value: V) {
        if self.ttl.is_zero() {
            return;
        }
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict_expired();
            if self.entries.len() >= self.max_entries {
                self.evict_oldest();
            }
        }
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().inserted_at)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.entries.remove(&key);
        }
    }

    /// Return the cached value for `key`, or compute it once for all
    /// concurrent callers. `compute` yields the value and whether it may be
    /// cached. The flag is `true` when the value did not come from this
    /// caller's own computation.
    pub async fn get_or_compute<F, Fut>(&self, key: &str, compute: F) -> MnemosResult<(V, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = MnemosResult<(V, bool)>>,
    {
        if let Some(v) = self.get(key) {
            return Ok((v, true));
        }

        let cell = self
            .inflight
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let mut computed = false;
        let flag = &mut computed;
        let result = cell
            .get_or_try_init(move || async move {
                if let Some(v) = self.get(key) {
                    return Ok(v);
                }
                *flag = true;
                let (value, cacheable) = compute().await?;
                if cacheable {
                    self.put(key.to_string(), value.clone());
                }
                Ok(value)
            })
            .await
            .cloned();

        self.inflight.remove_if(key, |_, c| Arc::ptr_eq(c, &cell));
        if !computed && result.is_ok() {
            debug!("Coalesced concurrent recall");
        }
        result.map(|v| (v, !computed))
    }

    /// Remove all expired entries.
    pub fn evict_expired(&self) {
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() <= self.ttl);
    }

    /// Drop every cached entry, e.g. after the index was rebuilt.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of entries currently in the cache (including possibly expired).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
