//! Two-tier embedding cache.
//!
//! Lookups go memory LRU -> SQLite disk tier -> miss. Disk hits are promoted
//! into the LRU. Access bookkeeping (hit counts, last-access time) is queued
//! in memory and written to disk by [`EmbeddingCache::flush_access`], off the
//! lookup path.
//!
//! If the disk tier cannot be opened or fails at runtime the cache keeps
//! serving from memory; disk errors are logged, never surfaced to callers.

use chrono::Utc;
use dashmap::DashMap;
use lru::LruCache;
use mnemos_types::error::{MnemosError, MnemosResult};
use mnemos_types::vector::{embedding_from_bytes, embedding_to_bytes};
use rusqlite::{Connection, OptionalExtension};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Characters of preview text kept next to each disk entry.
const PREVIEW_CHARS: usize = 100;

/// Hex characters of the SHA-256 digest used as the cache key.
const KEY_HEX_CHARS: usize = 32;

/// Lowercase `text` and collapse every whitespace run to a single space.
pub fn normalize_text(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Cache key for `text`: normalized, truncated to `max_chars` characters,
/// then hashed.
pub fn cache_key(text: &str, max_chars: usize) -> String {
    let normalized: String = normalize_text(text).chars().take(max_chars).collect();
    let digest = Sha256::digest(normalized.as_bytes());
    let mut key = hex::encode(digest);
    key.truncate(KEY_HEX_CHARS);
    key
}

/// A persisted cache entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntry {
    pub text_hash: String,
    pub vector: Vec<f32>,
    pub text_preview: String,
    pub created_at_ms: i64,
    pub last_accessed_ms: i64,
    pub hit_count: u64,
}

/// Disk tier statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiskCacheStats {
    pub entries: u64,
    pub total_hits: u64,
    pub oldest_ms: Option<i64>,
    pub newest_ms: Option<i64>,
    pub size_bytes: u64,
}

/// Statistics for both tiers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmbeddingCacheStats {
    pub memory_entries: usize,
    pub memory_capacity: usize,
    pub memory_hits: u64,
    pub disk_hits: u64,
    pub misses: u64,
    pub pending_access: usize,
    pub disk: Option<DiskCacheStats>,
}

impl EmbeddingCacheStats {
    /// Fraction of lookups served by either tier.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.memory_hits + self.disk_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Persistent SQLite tier.
pub struct DiskCache {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

fn unavailable(e: impl std::fmt::Display) -> MnemosError {
    MnemosError::CacheUnavailable(e.to_string())
}

impl DiskCache {
    /// Open (or create) the cache database at `path`.
    pub fn open(path: &Path) -> MnemosResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(unavailable)?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(unavailable)?;
        Self::init(conn, Some(path.to_path_buf()))
    }

    /// In-memory disk tier, for tests.
    pub fn open_in_memory() -> MnemosResult<Self> {
        let conn = Connection::open_in_memory().map_err(unavailable)?;
        Self::init(conn, None)
    }

    fn init(conn: Connection, path: Option<PathBuf>) -> MnemosResult<Self> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS embedding_cache (
                text_hash TEXT PRIMARY KEY,
                embedding BLOB NOT NULL,
                text_preview TEXT NOT NULL DEFAULT '',
                created_at INTEGER NOT NULL,
                last_accessed INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_cache_last_accessed ON embedding_cache(last_accessed);
            ",
        )
        .map_err(unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    fn lock(&self) -> MnemosResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(unavailable)
    }

    /// Look up one entry. Does not touch access bookkeeping.
    pub fn get(&self, key: &str) -> MnemosResult<Option<CacheEntry>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT text_hash, embedding, text_preview, created_at, last_accessed, hit_count
             FROM embedding_cache WHERE text_hash = ?1",
            [key],
            |row| {
                let blob: Vec<u8> = row.get(1)?;
                Ok(CacheEntry {
                    text_hash: row.get(0)?,
                    vector: embedding_from_bytes(&blob),
                    text_preview: row.get(2)?,
                    created_at_ms: row.get(3)?,
                    last_accessed_ms: row.get(4)?,
                    hit_count: row.get::<_, i64>(5)?.max(0) as u64,
                })
            },
        )
        .optional()
        .map_err(unavailable)
    }

    /// Look up many keys at once. Missing keys are absent from the result.
    pub fn get_batch(&self, keys: &[String]) -> MnemosResult<HashMap<String, Vec<f32>>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT embedding FROM embedding_cache WHERE text_hash = ?1")
            .map_err(unavailable)?;
        let mut found = HashMap::new();
        for key in keys {
            let blob: Option<Vec<u8>> = stmt
                .query_row([key], |row| row.get(0))
                .optional()
                .map_err(unavailable)?;
            if let Some(blob) = blob {
                found.insert(key.clone(), embedding_from_bytes(&blob));
            }
        }
        Ok(found)
    }

    /// Insert or replace entries; `(key, preview text, vector)`.
    pub fn set_batch(&self, entries: &[(String, String, Vec<f32>)]) -> MnemosResult<()> {
        let mut conn = self.lock()?;
        let now = Utc::now().timestamp_millis();
        let tx = conn.transaction().map_err(unavailable)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT INTO embedding_cache (text_hash, embedding, text_preview, created_at, last_accessed, hit_count)
                     VALUES (?1, ?2, ?3, ?4, ?4, 0)
                     ON CONFLICT(text_hash) DO UPDATE SET
                        embedding = excluded.embedding,
                        last_accessed = excluded.last_accessed",
                )
                .map_err(unavailable)?;
            for (key, text, vector) in entries {
                let preview: String = text.chars().take(PREVIEW_CHARS).collect();
                stmt.execute(rusqlite::params![key, embedding_to_bytes(vector), preview, now])
                    .map_err(unavailable)?;
            }
        }
        tx.commit().map_err(unavailable)
    }

    /// Apply queued access bookkeeping: `(key, hits, last access ms)`.
    pub fn record_access(&self, updates: &[(String, u64, i64)]) -> MnemosResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(unavailable)?;
        let mut applied = 0;
        {
            let mut stmt = tx
                .prepare_cached(
                    "UPDATE embedding_cache
                     SET hit_count = hit_count + ?2, last_accessed = MAX(last_accessed, ?3)
                     WHERE text_hash = ?1",
                )
                .map_err(unavailable)?;
            for (key, hits, last_ms) in updates {
                applied += stmt
                    .execute(rusqlite::params![key, *hits as i64, last_ms])
                    .map_err(unavailable)?;
            }
        }
        tx.commit().map_err(unavailable)?;
        Ok(applied)
    }

    /// Delete entries not accessed within `max_age`. Returns the count removed.
    pub fn cleanup(&self, max_age: Duration) -> MnemosResult<usize> {
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM embedding_cache WHERE last_accessed < ?1",
            [cutoff],
        )
        .map_err(unavailable)
    }

    pub fn stats(&self) -> MnemosResult<DiskCacheStats> {
        let conn = self.lock()?;
        let (entries, total_hits, oldest_ms, newest_ms) = conn
            .query_row(
                "SELECT COUNT(*), COALESCE(SUM(hit_count), 0), MIN(created_at), MAX(created_at)
                 FROM embedding_cache",
                [],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<i64>>(3)?,
                    ))
                },
            )
            .map_err(unavailable)?;
        let size_bytes = self
            .path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);
        Ok(DiskCacheStats {
            entries: entries.max(0) as u64,
            total_hits: total_hits.max(0) as u64,
            oldest_ms,
            newest_ms,
            size_bytes,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingAccess {
    hits: u64,
    last_ms: i64,
}

/// Memory LRU in front of an optional disk tier.
pub struct EmbeddingCache {
    memory: Mutex<LruCache<String, Arc<Vec<f32>>>>,
    capacity: usize,
    disk: Option<DiskCache>,
    pending: DashMap<String, PendingAccess>,
    max_chars: usize,
    memory_hits: AtomicU64,
    disk_hits: AtomicU64,
    misses: AtomicU64,
}

impl EmbeddingCache {
    /// Create a cache holding up to `capacity` vectors in memory.
    pub fn new(capacity: usize, disk: Option<DiskCache>, max_chars: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            memory: Mutex::new(LruCache::new(cap)),
            capacity: cap.get(),
            disk,
            pending: DashMap::new(),
            max_chars,
            memory_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Memory-only cache.
    pub fn memory_only(capacity: usize, max_chars: usize) -> Self {
        Self::new(capacity, None, max_chars)
    }

    pub fn has_disk_tier(&self) -> bool {
        self.disk.is_some()
    }

    pub fn key(&self, text: &str) -> String {
        cache_key(text, self.max_chars)
    }

    fn memory(&self) -> std::sync::MutexGuard<'_, LruCache<String, Arc<Vec<f32>>>> {
        self.memory.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn note_access(&self, key: &str) {
        if self.disk.is_none() {
            return;
        }
        let now = Utc::now().timestamp_millis();
        self.pending
            .entry(key.to_string())
            .and_modify(|p| {
                p.hits += 1;
                p.last_ms = now;
            })
            .or_insert(PendingAccess {
                hits: 1,
                last_ms: now,
            });
    }

    /// Look up the vector for `text`.
    pub fn get(&self, text: &str) -> Option<Arc<Vec<f32>>> {
        let key = self.key(text);
        let cached = self.memory().get(&key).cloned();
        if let Some(v) = cached {
            self.memory_hits.fetch_add(1, Ordering::Relaxed);
            self.note_access(&key);
            return Some(v);
        }
        if let Some(disk) = &self.disk {
            match disk.get(&key) {
                Ok(Some(entry)) => {
                    self.disk_hits.fetch_add(1, Ordering::Relaxed);
                    let v = Arc::new(entry.vector);
                    self.memory().put(key.clone(), Arc::clone(&v));
                    self.note_access(&key);
                    return Some(v);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "Embedding disk cache read failed"),
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Look up many texts. The result is keyed by input text; misses are absent.
    pub fn get_batch(&self, texts: &[String]) -> HashMap<String, Arc<Vec<f32>>> {
        let mut found = HashMap::with_capacity(texts.len());
        let mut disk_wanted: Vec<(String, &String)> = Vec::new();
        {
            let mut memory = self.memory();
            for text in texts {
                let key = self.key(text);
                if let Some(v) = memory.get(&key) {
                    found.insert(text.clone(), Arc::clone(v));
                    self.memory_hits.fetch_add(1, Ordering::Relaxed);
                    self.note_access(&key);
                } else {
                    disk_wanted.push((key, text));
                }
            }
        }

        if let (Some(disk), false) = (&self.disk, disk_wanted.is_empty()) {
            let keys: Vec<String> = disk_wanted.iter().map(|(k, _)| k.clone()).collect();
            match disk.get_batch(&keys) {
                Ok(mut rows) => {
                    let mut memory = self.memory();
                    disk_wanted.retain(|(key, text)| match rows.remove(key) {
                        Some(vector) => {
                            let v = Arc::new(vector);
                            memory.put(key.clone(), Arc::clone(&v));
                            found.insert((*text).clone(), v);
                            self.disk_hits.fetch_add(1, Ordering::Relaxed);
                            self.note_access(key);
                            false
                        }
                        None => true,
                    });
                }
                Err(e) => warn!(error = %e, "Embedding disk cache batch read failed"),
            }
        }
        self.misses
            .fetch_add(disk_wanted.len() as u64, Ordering::Relaxed);
        found
    }

    /// Store the vector for `text` in both tiers.
    pub fn set(&self, text: &str, vector: Vec<f32>) {
        self.set_batch(vec![(text.to_string(), vector)]);
    }

    /// Store many vectors in both tiers.
    pub fn set_batch(&self, entries: Vec<(String, Vec<f32>)>) {
        if entries.is_empty() {
            return;
        }
        let mut rows = Vec::with_capacity(entries.len());
        {
            let mut memory = self.memory();
            for (text, vector) in entries {
                let key = self.key(&text);
                memory.put(key.clone(), Arc::new(vector.clone()));
                rows.push((key, text, vector));
            }
        }
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.set_batch(&rows) {
                warn!(error = %e, entries = rows.len(), "Embedding disk cache write failed");
            }
        }
    }

    /// Number of keys with queued access bookkeeping.
    pub fn pending_access(&self) -> usize {
        self.pending.len()
    }

    /// Write queued access bookkeeping to the disk tier.
    pub fn flush_access(&self) -> usize {
        let Some(disk) = &self.disk else {
            return 0;
        };
        let keys: Vec<String> = self.pending.iter().map(|e| e.key().clone()).collect();
        let updates: Vec<(String, u64, i64)> = keys
            .into_iter()
            .filter_map(|k| self.pending.remove(&k))
            .map(|(k, p)| (k, p.hits, p.last_ms))
            .collect();
        if updates.is_empty() {
            return 0;
        }
        match disk.record_access(&updates) {
            Ok(applied) => {
                debug!(applied, "Flushed embedding cache access bookkeeping");
                applied
            }
            Err(e) => {
                warn!(error = %e, "Embedding cache access flush failed");
                0
            }
        }
    }

    /// Drop disk entries not accessed within `max_age`.
    pub fn cleanup(&self, max_age: Duration) -> MnemosResult<usize> {
        let disk = self
            .disk
            .as_ref()
            .ok_or_else(|| MnemosError::CacheUnavailable("no disk tier".into()))?;
        self.flush_access();
        disk.cleanup(max_age)
    }

    pub fn stats(&self) -> EmbeddingCacheStats {
        let disk = self.disk.as_ref().and_then(|d| match d.stats() {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(error = %e, "Embedding disk cache stats failed");
                None
            }
        });
        EmbeddingCacheStats {
            memory_entries: self.memory().len(),
            memory_capacity: self.capacity,
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            pending_access: self.pending.len(),
            disk,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_tier(capacity: usize) -> EmbeddingCache {
        EmbeddingCache::new(capacity, Some(DiskCache::open_in_memory().unwrap()), 2000)
    }

    #[test]
    fn test_key_normalization() {
        assert_eq!(cache_key("  Hello World ", 2000), cache_key("hello world", 2000));
        assert_eq!(cache_key("rose  garden", 2000), cache_key("rose garden", 2000));
        assert_eq!(cache_key("rose\t\ngarden", 2000), cache_key("Rose Garden", 2000));
        assert_ne!(cache_key("hello", 2000), cache_key("world", 2000));
        assert_eq!(cache_key("hello", 2000).len(), 32);
        // Only the first max_chars characters participate.
        assert_eq!(cache_key("abcdef", 3), cache_key("abcxyz", 3));
    }

    #[test]
    fn test_memory_hit() {
        let cache = two_tier(10);
        cache.set("rose garden", vec![1.0, 0.0]);
        assert_eq!(*cache.get("Rose Garden").unwrap(), vec![1.0, 0.0]);
        let stats = cache.stats();
        assert_eq!(stats.memory_hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.disk.unwrap().entries, 1);
    }

    #[test]
    fn test_disk_hit_promotes_to_memory() {
        let cache = two_tier(1);
        cache.set("first", vec![1.0]);
        cache.set("second", vec![2.0]);
        // "first" was evicted from the one-slot LRU but lives on disk.
        assert_eq!(*cache.get("first").unwrap(), vec![1.0]);
        assert_eq!(cache.stats().disk_hits, 1);
        assert_eq!(*cache.get("first").unwrap(), vec![1.0]);
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[test]
    fn test_memory_only_miss() {
        let cache = EmbeddingCache::memory_only(4, 2000);
        assert!(cache.get("nothing").is_none());
        assert_eq!(cache.stats().misses, 1);
        assert!(cache.stats().disk.is_none());
        assert!(cache.cleanup(Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_batch_partitions_hits_and_misses() {
        let cache = two_tier(1);
        cache.set_batch(vec![("a".into(), vec![1.0]), ("b".into(), vec![2.0])]);
        let texts: Vec<String> = vec!["a".into(), "b".into(), "c".into()];
        let found = cache.get_batch(&texts);
        assert_eq!(found.len(), 2);
        assert_eq!(*found["a"], vec![1.0]);
        assert_eq!(*found["b"], vec![2.0]);
        let stats = cache.stats();
        assert_eq!(stats.memory_hits + stats.disk_hits, 2);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_access_bookkeeping_is_deferred() {
        let cache = two_tier(10);
        cache.set("tea", vec![0.5]);
        cache.get("tea");
        cache.get("tea");
        assert_eq!(cache.pending_access(), 1);
        let key = cache.key("tea");
        assert_eq!(cache.disk.as_ref().unwrap().get(&key).unwrap().unwrap().hit_count, 0);

        assert_eq!(cache.flush_access(), 1);
        assert_eq!(cache.pending_access(), 0);
        assert_eq!(cache.disk.as_ref().unwrap().get(&key).unwrap().unwrap().hit_count, 2);
    }

    #[test]
    fn test_cleanup_removes_stale_entries() {
        let cache = two_tier(10);
        cache.set("old", vec![1.0]);
        {
            let disk = cache.disk.as_ref().unwrap();
            let conn = disk.lock().unwrap();
            conn.execute("UPDATE embedding_cache SET last_accessed = 0", [])
                .unwrap();
        }
        cache.set("new", vec![2.0]);
        let removed = cache.cleanup(Duration::from_secs(90 * 86_400)).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(cache.stats().disk.unwrap().entries, 1);
    }

    #[test]
    fn test_disk_file_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embedding_cache.db");
        {
            let cache = EmbeddingCache::new(4, Some(DiskCache::open(&path).unwrap()), 2000);
            cache.set("persist me", vec![0.25, 0.75]);
        }
        let cache = EmbeddingCache::new(4, Some(DiskCache::open(&path).unwrap()), 2000);
        assert_eq!(*cache.get("persist me").unwrap(), vec![0.25, 0.75]);
        assert_eq!(cache.stats().disk_hits, 1);
    }
}
