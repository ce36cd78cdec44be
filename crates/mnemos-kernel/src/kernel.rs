//! Assembly and ownership of the recall services.
//!
//! Boot order: store pool → embedding cache → provider driver → embedder →
//! vector index → query cache → scorer → engine. Every optional piece
//! degrades instead of failing the boot: a broken disk cache becomes
//! memory-only, a missing provider key runs lexical-only, a missing or
//! corrupt index is rebuilt from stored vectors (or left empty).

use crate::background;
use crate::error::KernelResult;
use mnemos_memory::embedding_cache::EmbeddingCacheStats;
use mnemos_memory::{ConnectionPool, DiskCache, EmbeddingCache, SqliteMemoryStore};
use mnemos_runtime::affect::DimensionalAffect;
use mnemos_runtime::embedder::{CachedEmbedder, EmbedderSettings, EmbedderStats};
use mnemos_runtime::embedding::{create_embedding_driver, EmbeddingDriver};
use mnemos_runtime::index::{
    build_index, persist, IndexStats, SharedIndex, VectorIndex, DEFAULT_TRAIN_SEED,
};
use mnemos_runtime::query_cache::QueryCache;
use mnemos_runtime::rate_limiter::ProviderRateLimiter;
use mnemos_runtime::scoring::strategy_from_config;
use mnemos_runtime::{RecallEngine, RecallOutcome, RecallRequest};
use mnemos_types::config::{IndexKind, RecallConfig};
use mnemos_types::error::{MnemosError, MnemosResult};
use mnemos_types::memory::{MemoryStore, RecallResult, StoredVector, TimeWindow};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Nodes embedded per provider round-trip during backfill.
const BACKFILL_CHUNK: usize = 64;

/// Statistics printed by `mnemos cache stats`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheReport {
    /// Provider counters, when a provider is configured.
    pub embedder: Option<EmbedderStats>,
    pub embedding_cache: EmbeddingCacheStats,
    pub query_cache_entries: usize,
}

/// Outcome of [`RecallKernel::backfill`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    /// Nodes that were missing an embedding.
    pub pending: usize,
    pub embedded: usize,
    pub indexed: usize,
}

/// The assembled recall service.
pub struct RecallKernel {
    config: RecallConfig,
    store: Arc<SqliteMemoryStore>,
    cache: Arc<EmbeddingCache>,
    embedder: Option<Arc<CachedEmbedder>>,
    index: Arc<SharedIndex>,
    query_cache: Arc<QueryCache<Arc<RecallResult>>>,
    engine: RecallEngine,
    /// Incremental additions since the index was last written to disk.
    unsaved_additions: AtomicUsize,
    shutdown_tx: watch::Sender<bool>,
}

impl RecallKernel {
    /// Boot with the provider named in `[embedding]`.
    pub async fn boot(config: RecallConfig) -> KernelResult<Self> {
        let driver: Option<Arc<dyn EmbeddingDriver>> =
            match create_embedding_driver(&config.embedding) {
                Ok(driver) => Some(Arc::from(driver)),
                Err(e) => {
                    warn!(
                        error = %e,
                        provider = %config.embedding.provider,
                        "Embedding provider unavailable, running lexical-only"
                    );
                    None
                }
            };
        Self::boot_with_driver(config, driver).await
    }

    /// Boot with an explicit provider driver (or none for lexical-only).
    pub async fn boot_with_driver(
        config: RecallConfig,
        driver: Option<Arc<dyn EmbeddingDriver>>,
    ) -> KernelResult<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.home_dir).map_err(MnemosError::from)?;

        let store_path = config.resolve(&config.store.path);
        let pool = ConnectionPool::open(
            store_path.clone(),
            config.store.pool_size,
            Duration::from_millis(config.store.checkout_timeout_ms),
            Duration::from_millis(config.store.busy_timeout_ms),
        )?;
        let store = Arc::new(SqliteMemoryStore::new(pool));
        info!(
            path = %store_path.display(),
            pool_size = config.store.pool_size,
            "Memory store opened"
        );

        let cache = Arc::new(open_embedding_cache(&config));

        let embedder = driver.map(|driver| {
            if driver.dimensions() != config.embedding.dimension {
                warn!(
                    driver = driver.dimensions(),
                    configured = config.embedding.dimension,
                    "Embedding dimension differs from config"
                );
            }
            let limiter = Arc::new(ProviderRateLimiter::per_second(
                config.embedding.rate_limit_per_sec,
            ));
            Arc::new(CachedEmbedder::new(
                driver,
                Arc::clone(&cache),
                limiter,
                EmbedderSettings::from(&config.embedding),
            ))
        });

        let index = Arc::new(SharedIndex::new(
            load_or_rebuild_index(&config, store.as_ref()).await,
        ));
        if let (Some(stats), Some(embedder)) = (index.stats(), embedder.as_ref()) {
            if stats.dimension != embedder.dimensions() {
                warn!(
                    index = stats.dimension,
                    provider = embedder.dimensions(),
                    "Index dimension does not match provider, vector stage will be skipped"
                );
            }
        }

        let query_cache = Arc::new(QueryCache::new(
            Duration::from_secs(config.cache.query_ttl_secs),
            config.cache.query_max_entries,
        ));
        let engine = RecallEngine::new(
            store.clone(),
            embedder.clone(),
            Arc::clone(&index),
            Arc::clone(&query_cache),
            strategy_from_config(&config.recall),
            Arc::new(DimensionalAffect::new(config.affect.neutral_resonance)),
            config.recall.clone(),
            config.affect.clone(),
        );

        let (shutdown_tx, _) = watch::channel(false);
        info!(
            vector_stage = embedder.is_some(),
            indexed = index.stats().map(|s| s.count).unwrap_or(0),
            strategy = ?config.recall.strategy,
            "Recall kernel booted"
        );
        Ok(Self {
            config,
            store,
            cache,
            embedder,
            index,
            query_cache,
            engine,
            unsaved_additions: AtomicUsize::new(0),
            shutdown_tx,
        })
    }

    pub fn config(&self) -> &RecallConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<SqliteMemoryStore> {
        &self.store
    }

    pub fn embedder(&self) -> Option<&Arc<CachedEmbedder>> {
        self.embedder.as_ref()
    }

    pub fn query_cache(&self) -> &Arc<QueryCache<Arc<RecallResult>>> {
        &self.query_cache
    }

    /// Run one recall.
    pub async fn recall(&self, req: RecallRequest) -> MnemosResult<RecallOutcome> {
        self.engine.recall(req).await
    }

    fn index_paths(&self) -> (PathBuf, PathBuf) {
        (
            self.config.resolve(&self.config.index.index_path),
            self.config.resolve(&self.config.index.meta_path),
        )
    }

    /// Build a fresh index over the last `days` days of stored vectors,
    /// persist it and publish it. Returns `None` when nothing is embedded.
    pub async fn rebuild_index(
        &self,
        kind: IndexKind,
        days: u32,
    ) -> MnemosResult<Option<IndexStats>> {
        let vectors = self.store.fetch_vectors(TimeWindow::last_days(days)).await?;
        info!(kind = %kind, days, vectors = vectors.len(), "Rebuilding vector index");

        let index_config = self.config.index.clone();
        let (index_path, meta_path) = self.index_paths();
        let built = tokio::task::spawn_blocking(move || {
            let index = build_index(kind, &index_config, vectors, DEFAULT_TRAIN_SEED)?;
            if let Some(index) = &index {
                persist::save(index.as_ref(), &index_path, &meta_path)?;
            }
            Ok::<_, MnemosError>(index)
        })
        .await
        .map_err(|e| MnemosError::Internal(e.to_string()))??;

        let stats = built.as_ref().map(|idx| idx.stats());
        self.index.publish(built);
        self.unsaved_additions.store(0, Ordering::Relaxed);
        self.query_cache.clear();
        Ok(stats)
    }

    pub fn index_stats(&self) -> Option<IndexStats> {
        self.index.stats()
    }

    /// Add vectors to the live index, persisting every
    /// `index.persist_every` additions.
    pub async fn add_vectors(&self, vectors: Vec<StoredVector>) -> MnemosResult<usize> {
        let added = self.index.add(vectors)?;
        if added == 0 {
            return Ok(0);
        }
        let unsaved = self.unsaved_additions.fetch_add(added, Ordering::Relaxed) + added;
        if unsaved >= self.config.index.persist_every.max(1) {
            self.persist_index().await?;
        }
        Ok(added)
    }

    /// Write the current index to disk.
    pub async fn persist_index(&self) -> MnemosResult<()> {
        let Some(index) = self.index.load() else {
            return Ok(());
        };
        let (index_path, meta_path) = self.index_paths();
        tokio::task::spawn_blocking(move || persist::save(index.as_ref(), &index_path, &meta_path))
            .await
            .map_err(|e| MnemosError::Internal(e.to_string()))??;
        self.unsaved_additions.store(0, Ordering::Relaxed);
        debug!("Persisted vector index");
        Ok(())
    }

    /// Embed up to `limit` stored nodes that have no embedding yet and add
    /// them to the live index.
    pub async fn backfill(&self, limit: usize) -> MnemosResult<BackfillReport> {
        let embedder = self.require_embedder()?;
        let pending = self.store.nodes_missing_embeddings(limit).await?;
        let mut report = BackfillReport {
            pending: pending.len(),
            ..Default::default()
        };
        if pending.is_empty() {
            return Ok(report);
        }

        for chunk in pending.chunks(BACKFILL_CHUNK) {
            let texts: Vec<String> = chunk.iter().map(|(_, text)| text.clone()).collect();
            let vectors = embedder.embed_batch(&texts).await?;
            for ((node_id, _), vector) in chunk.iter().zip(vectors) {
                if let Some(vector) = vector {
                    self.store.set_embedding(*node_id, vector.to_vec()).await?;
                    report.embedded += 1;
                }
            }
        }

        let window = TimeWindow::last_days(self.config.index.build_window_days);
        let stored = self.store.fetch_vectors(window).await?;
        report.indexed = self.add_vectors(stored).await?;
        info!(
            pending = report.pending,
            embedded = report.embedded,
            indexed = report.indexed,
            "Backfill complete"
        );
        Ok(report)
    }

    /// Embed common queries ahead of time.
    pub async fn warm(&self, texts: &[String]) -> MnemosResult<usize> {
        self.require_embedder()?.warm(texts).await
    }

    /// Drop disk-cache entries not accessed within `max_age`.
    pub async fn cache_cleanup(&self, max_age: Duration) -> MnemosResult<usize> {
        let cache = Arc::clone(&self.cache);
        tokio::task::spawn_blocking(move || cache.cleanup(max_age))
            .await
            .map_err(|e| MnemosError::Internal(e.to_string()))?
    }

    pub fn cache_stats(&self) -> CacheReport {
        CacheReport {
            embedder: self.embedder.as_ref().map(|e| e.stats()),
            embedding_cache: self.cache.stats(),
            query_cache_entries: self.query_cache.len(),
        }
    }

    fn require_embedder(&self) -> MnemosResult<&Arc<CachedEmbedder>> {
        self.embedder
            .as_ref()
            .ok_or_else(|| {
                MnemosError::ProviderUnavailable("no embedding provider configured".into())
            })
    }

    /// Start the maintenance loops configured in `[maintenance]`.
    pub fn start_background(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if !self.config.maintenance.enabled {
            return Vec::new();
        }
        background::spawn_maintenance(Arc::clone(self), self.shutdown_tx.subscribe())
    }

    /// Stop background loops and flush pending state to disk.
    pub async fn shutdown(&self) {
        info!("Recall kernel shutting down");
        let _ = self.shutdown_tx.send(true);
        self.engine.drain().await;
        let flushed = self.cache.flush_access();
        if flushed > 0 {
            debug!(flushed, "Flushed cache access bookkeeping");
        }
        if self.unsaved_additions.load(Ordering::Relaxed) > 0 {
            if let Err(e) = self.persist_index().await {
                warn!(error = %e, "Failed to persist index on shutdown");
            }
        }
    }
}

fn open_embedding_cache(config: &RecallConfig) -> EmbeddingCache {
    let capacity = config.cache.lru_capacity;
    let max_chars = config.embedding.max_text_chars;
    if !config.cache.disk_enabled {
        return EmbeddingCache::memory_only(capacity, max_chars);
    }
    let path = config.resolve(&config.cache.disk_path);
    match DiskCache::open(&path) {
        Ok(disk) => EmbeddingCache::new(capacity, Some(disk), max_chars),
        Err(e) => {
            warn!(
                error = %e,
                path = %path.display(),
                "Disk embedding cache unavailable, using memory tier only"
            );
            EmbeddingCache::memory_only(capacity, max_chars)
        }
    }
}

/// Load the persisted index, or rebuild an exact one from stored vectors.
async fn load_or_rebuild_index(
    config: &RecallConfig,
    store: &dyn MemoryStore,
) -> Option<Box<dyn VectorIndex>> {
    let index_path = config.resolve(&config.index.index_path);
    let meta_path = config.resolve(&config.index.meta_path);

    if index_path.exists() {
        match persist::load(&index_path, &meta_path, Some(&config.index)) {
            Ok(index) => {
                info!(
                    path = %index_path.display(),
                    count = index.len(),
                    index_type = %index.index_type(),
                    "Loaded vector index"
                );
                return Some(index);
            }
            Err(e) => warn!(error = %e, "Persisted index unusable, rebuilding from store"),
        }
    } else {
        info!(path = %index_path.display(), "No persisted index, building from store");
    }

    let window = TimeWindow::last_days(config.index.build_window_days);
    let vectors = match store.fetch_vectors(window).await {
        Ok(vectors) => vectors,
        Err(e) => {
            warn!(error = %e, "Could not read stored vectors, vector stage disabled");
            return None;
        }
    };
    match build_index(IndexKind::Exact, &config.index, vectors, DEFAULT_TRAIN_SEED) {
        Ok(index) => index,
        Err(e) => {
            warn!(error = %e, "Index rebuild failed, vector stage disabled");
            None
        }
    }
}
