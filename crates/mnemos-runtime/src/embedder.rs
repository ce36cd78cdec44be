//! Cached, rate-limited embedding client.
//!
//! Every request is partitioned into cache hits and misses. Misses are sent
//! to the provider in batches of at most `max_batch`, each batch behind one
//! rate-limiter token and one provider timeout. Successful vectors are
//! normalized and written back to both cache tiers.

use crate::embedding::EmbeddingDriver;
use crate::rate_limiter::ProviderRateLimiter;
use mnemos_memory::embedding_cache::{EmbeddingCache, EmbeddingCacheStats};
use mnemos_types::config::EmbeddingProviderConfig;
use mnemos_types::error::{MnemosError, MnemosResult};
use mnemos_types::vector::normalized;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Texts shorter than this (after trimming) are never embedded.
pub const MIN_EMBED_CHARS: usize = 3;

/// Queued access bookkeeping is flushed to disk once it grows past this.
const ACCESS_FLUSH_THRESHOLD: usize = 64;

/// Tunables for [`CachedEmbedder`].
#[derive(Debug, Clone)]
pub struct EmbedderSettings {
    pub max_batch: usize,
    pub max_text_chars: usize,
    pub provider_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl From<&EmbeddingProviderConfig> for EmbedderSettings {
    fn from(cfg: &EmbeddingProviderConfig) -> Self {
        Self {
            max_batch: cfg.max_batch.max(1),
            max_text_chars: cfg.max_text_chars,
            provider_timeout: Duration::from_secs(cfg.timeout_secs),
            acquire_timeout: Duration::from_millis(cfg.acquire_timeout_ms),
        }
    }
}

/// Client-side counters plus the cache's own statistics.
#[derive(Debug, Clone, Serialize)]
pub struct EmbedderStats {
    pub provider_calls: u64,
    pub provider_errors: u64,
    pub texts_embedded: u64,
    pub hit_rate: f64,
    pub cache: EmbeddingCacheStats,
}

/// Embedding provider wrapped in the two-tier cache and the rate limiter.
pub struct CachedEmbedder {
    driver: Arc<dyn EmbeddingDriver>,
    cache: Arc<EmbeddingCache>,
    limiter: Arc<ProviderRateLimiter>,
    settings: EmbedderSettings,
    provider_calls: AtomicU64,
    provider_errors: AtomicU64,
    texts_embedded: AtomicU64,
}

impl CachedEmbedder {
    pub fn new(
        driver: Arc<dyn EmbeddingDriver>,
        cache: Arc<EmbeddingCache>,
        limiter: Arc<ProviderRateLimiter>,
        settings: EmbedderSettings,
    ) -> Self {
        Self {
            driver,
            cache,
            limiter,
            settings,
            provider_calls: AtomicU64::new(0),
            provider_errors: AtomicU64::new(0),
            texts_embedded: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<EmbeddingCache> {
        &self.cache
    }

    pub fn dimensions(&self) -> usize {
        self.driver.dimensions()
    }

    /// Trim and truncate `text`, or `None` when it is too short to embed.
    fn prepare(&self, text: &str) -> Option<String> {
        let trimmed = text.trim();
        if trimmed.chars().filter(|c| !c.is_whitespace()).count() < MIN_EMBED_CHARS {
            return None;
        }
        Some(trimmed.chars().take(self.settings.max_text_chars).collect())
    }

    /// Embed one text.
    pub async fn embed_one(&self, text: &str) -> MnemosResult<Arc<Vec<f32>>> {
        let mut out = self.embed_batch(&[text.to_string()]).await?;
        out.pop()
            .flatten()
            .ok_or_else(|| MnemosError::InvalidInput("text too short to embed".into()))
    }

    /// Embed many texts. The result is in input order; texts too short to
    /// embed yield `None`. Any provider failure fails the whole call.
    pub async fn embed_batch(&self, texts: &[String]) -> MnemosResult<Vec<Option<Arc<Vec<f32>>>>> {
        let prepared: Vec<Option<String>> = texts.iter().map(|t| self.prepare(t)).collect();
        let mut unique: Vec<String> = prepared.iter().flatten().cloned().collect();
        unique.sort();
        unique.dedup();
        if unique.is_empty() {
            return Ok(vec![None; texts.len()]);
        }

        let mut resolved = self.cache_lookup(unique.clone()).await;
        let misses: Vec<String> = unique
            .into_iter()
            .filter(|t| !resolved.contains_key(t))
            .collect();
        debug!(
            hits = resolved.len(),
            misses = misses.len(),
            "Embedding cache partition"
        );

        for chunk in misses.chunks(self.settings.max_batch) {
            let vectors = self.call_provider(chunk).await?;
            let entries: Vec<(String, Vec<f32>)> =
                chunk.iter().cloned().zip(vectors.into_iter()).collect();
            for (text, vector) in &entries {
                resolved.insert(text.clone(), Arc::new(vector.clone()));
            }
            self.cache_store(entries).await;
        }

        self.maybe_flush_access();
        Ok(prepared
            .into_iter()
            .map(|p| p.and_then(|t| resolved.get(&t).cloned()))
            .collect())
    }

    /// Pre-populate the cache with embeddings for `texts`. Returns how many
    /// texts now have a cached vector.
    pub async fn warm(&self, texts: &[String]) -> MnemosResult<usize> {
        let vectors = self.embed_batch(texts).await?;
        Ok(vectors.iter().filter(|v| v.is_some()).count())
    }

    async fn call_provider(&self, chunk: &[String]) -> MnemosResult<Vec<Vec<f32>>> {
        self.limiter.acquire(self.settings.acquire_timeout).await?;
        self.provider_calls.fetch_add(1, Ordering::Relaxed);

        let refs: Vec<&str> = chunk.iter().map(String::as_str).collect();
        let outcome = tokio::time::timeout(self.settings.provider_timeout, self.driver.embed(&refs)).await;
        let vectors = match outcome {
            Ok(Ok(vectors)) if vectors.len() == chunk.len() => vectors,
            Ok(Ok(vectors)) => {
                self.provider_errors.fetch_add(1, Ordering::Relaxed);
                return Err(MnemosError::ProviderUnavailable(format!(
                    "provider returned {} vectors for {} texts",
                    vectors.len(),
                    chunk.len()
                )));
            }
            Ok(Err(e)) => {
                self.provider_errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, batch = chunk.len(), "Embedding provider call failed");
                return Err(e.into());
            }
            Err(_) => {
                self.provider_errors.fetch_add(1, Ordering::Relaxed);
                warn!(
                    timeout_ms = self.settings.provider_timeout.as_millis() as u64,
                    batch = chunk.len(),
                    "Embedding provider call timed out"
                );
                return Err(MnemosError::ProviderUnavailable("provider timed out".into()));
            }
        };
        self.texts_embedded
            .fetch_add(chunk.len() as u64, Ordering::Relaxed);
        Ok(vectors.into_iter().map(normalized).collect())
    }

    async fn cache_lookup(&self, texts: Vec<String>) -> HashMap<String, Arc<Vec<f32>>> {
        if !self.cache.has_disk_tier() {
            return self.cache.get_batch(&texts);
        }
        let cache = Arc::clone(&self.cache);
        match tokio::task::spawn_blocking(move || cache.get_batch(&texts)).await {
            Ok(found) => found,
            Err(e) => {
                warn!(error = %e, "Embedding cache lookup task failed");
                HashMap::new()
            }
        }
    }

    async fn cache_store(&self, entries: Vec<(String, Vec<f32>)>) {
        if !self.cache.has_disk_tier() {
            self.cache.set_batch(entries);
            return;
        }
        let cache = Arc::clone(&self.cache);
        if let Err(e) = tokio::task::spawn_blocking(move || cache.set_batch(entries)).await {
            warn!(error = %e, "Embedding cache write task failed");
        }
    }

    fn maybe_flush_access(&self) {
        if self.cache.pending_access() < ACCESS_FLUSH_THRESHOLD {
            return;
        }
        let cache = Arc::clone(&self.cache);
        tokio::task::spawn_blocking(move || cache.flush_access());
    }

    pub fn stats(&self) -> EmbedderStats {
        let cache = self.cache.stats();
        EmbedderStats {
            provider_calls: self.provider_calls.load(Ordering::Relaxed),
            provider_errors: self.provider_errors.load(Ordering::Relaxed),
            texts_embedded: self.texts_embedded.load(Ordering::Relaxed),
            hit_rate: cache.hit_rate(),
            cache,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    /// Provider that embeds text as [len, 1.0] and records batch sizes.
    struct LengthDriver {
        batches: Mutex<Vec<usize>>,
        fail: bool,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl LengthDriver {
        fn new() -> Self {
            Self {
                batches: Mutex::new(Vec::new()),
                fail: false,
                delay: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EmbeddingDriver for LengthDriver {
        async fn embed(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.batches.lock().unwrap().push(texts.len());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(EmbeddingError::Api {
                    status: 503,
                    message: "overloaded".into(),
                });
            }
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    fn settings() -> EmbedderSettings {
        EmbedderSettings {
            max_batch: 2,
            max_text_chars: 2000,
            provider_timeout: Duration::from_millis(200),
            acquire_timeout: Duration::from_secs(1),
        }
    }

    fn embedder(driver: Arc<LengthDriver>) -> CachedEmbedder {
        CachedEmbedder::new(
            driver,
            Arc::new(EmbeddingCache::memory_only(100, 2000)),
            Arc::new(ProviderRateLimiter::per_second(100)),
            settings(),
        )
    }

    #[tokio::test]
    async fn test_second_call_is_served_from_cache() {
        let driver = Arc::new(LengthDriver::new());
        let embedder = embedder(Arc::clone(&driver));

        let first = embedder.embed_one("gardening tips").await.unwrap();
        let second = embedder.embed_one("Gardening Tips ").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
        assert_eq!(embedder.stats().provider_calls, 1);
    }

    #[tokio::test]
    async fn test_batches_are_bounded_and_ordered() {
        let driver = Arc::new(LengthDriver::new());
        let embedder = embedder(Arc::clone(&driver));
        let texts: Vec<String> = vec!["aaaa".into(), "bbbbbbbb".into(), "cccccc".into(), "x".into()];

        let out = embedder.embed_batch(&texts).await.unwrap();
        assert_eq!(out.len(), 4);
        assert!(out[3].is_none());
        // [len, 1] normalized: first component grows with length.
        let a = out[0].as_ref().unwrap();
        let b = out[1].as_ref().unwrap();
        assert!(b[0] > a[0]);
        assert!((a[0] * a[0] + a[1] * a[1] - 1.0).abs() < 1e-5);
        assert_eq!(*driver.batches.lock().unwrap(), vec![2, 1]);
    }

    #[tokio::test]
    async fn test_short_text_is_rejected() {
        let driver = Arc::new(LengthDriver::new());
        let embedder = embedder(Arc::clone(&driver));
        assert!(matches!(
            embedder.embed_one(" a ").await,
            Err(MnemosError::InvalidInput(_))
        ));
        assert_eq!(driver.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_provider_error_is_unavailable() {
        let mut driver = LengthDriver::new();
        driver.fail = true;
        let embedder = embedder(Arc::new(driver));
        let err = embedder.embed_one("anything at all").await.unwrap_err();
        assert!(matches!(err, MnemosError::ProviderUnavailable(_)));
        assert_eq!(embedder.stats().provider_errors, 1);
    }

    #[tokio::test]
    async fn test_provider_timeout_is_unavailable() {
        let mut driver = LengthDriver::new();
        driver.delay = Duration::from_secs(2);
        let embedder = embedder(Arc::new(driver));
        let err = embedder.embed_one("slow provider text").await.unwrap_err();
        assert!(matches!(err, MnemosError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn test_warm_populates_cache() {
        let driver = Arc::new(LengthDriver::new());
        let embedder = embedder(Arc::clone(&driver));
        let common: Vec<String> = vec!["how are you".into(), "what did we discuss".into()];
        assert_eq!(embedder.warm(&common).await.unwrap(), 2);
        embedder.embed_batch(&common).await.unwrap();
        assert_eq!(driver.calls.load(Ordering::SeqCst), 1);
        assert!(embedder.stats().hit_rate > 0.0);
    }
}
