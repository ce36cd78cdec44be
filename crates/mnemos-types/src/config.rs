//! Engine configuration, deserialized from `~/.mnemos/config.toml`.
//!
//! Every section carries `#[serde(default)]` so a partial file (or none at
//! all) yields a working configuration.

use crate::error::{MnemosError, MnemosResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default data directory (`~/.mnemos`).
pub fn default_home_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".mnemos"))
        .unwrap_or_else(|| PathBuf::from(".mnemos"))
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallConfig {
    /// Base directory for the store, caches and index files.
    pub home_dir: PathBuf,
    pub store: StoreConfig,
    pub embedding: EmbeddingProviderConfig,
    pub cache: CacheConfig,
    pub index: IndexConfig,
    pub recall: RecallSettings,
    pub affect: AffectConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for RecallConfig {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            store: StoreConfig::default(),
            embedding: EmbeddingProviderConfig::default(),
            cache: CacheConfig::default(),
            index: IndexConfig::default(),
            recall: RecallSettings::default(),
            affect: AffectConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// Memory store connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// SQLite database path. Relative paths resolve against `home_dir`.
    pub path: PathBuf,
    /// Maximum number of pooled connections.
    pub pool_size: usize,
    /// How long a checkout may wait for a free connection.
    pub checkout_timeout_ms: u64,
    /// SQLite busy timeout for locked databases.
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("graph.sqlite"),
            pool_size: 5,
            checkout_timeout_ms: 10_000,
            busy_timeout_ms: 10_000,
        }
    }
}

/// Embedding provider and rate-limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingProviderConfig {
    /// Provider name (voyage, openai, ollama, ...).
    pub provider: String,
    /// Model name.
    pub model: String,
    /// Environment variable holding the API key.
    pub api_key_env: String,
    /// Overrides the provider's default base URL.
    pub base_url: Option<String>,
    /// Vector dimension produced by the model.
    pub dimension: usize,
    /// Per-request provider timeout.
    pub timeout_secs: u64,
    /// Provider maximum texts per request.
    pub max_batch: usize,
    /// Texts are truncated to this many characters before embedding.
    pub max_text_chars: usize,
    /// Token-bucket rate (requests per second; also the burst capacity).
    pub rate_limit_per_sec: u32,
    /// Maximum wait for a rate-limiter token.
    pub acquire_timeout_ms: u64,
}

impl Default for EmbeddingProviderConfig {
    fn default() -> Self {
        Self {
            provider: "voyage".to_string(),
            model: "voyage-3-lite".to_string(),
            api_key_env: "VOYAGE_API_KEY".to_string(),
            base_url: None,
            dimension: 512,
            timeout_secs: 20,
            max_batch: 64,
            max_text_chars: 2000,
            rate_limit_per_sec: 10,
            acquire_timeout_ms: 30_000,
        }
    }
}

/// Embedding cache and query-result cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// In-memory LRU capacity (entries).
    pub lru_capacity: usize,
    /// Whether the persistent tier is used at all.
    pub disk_enabled: bool,
    /// Persistent tier path. Relative paths resolve against `home_dir`.
    pub disk_path: PathBuf,
    /// Entries not accessed within this many days are removed by cleanup.
    pub disk_max_age_days: u32,
    /// Query-result cache TTL. Zero disables the cache.
    pub query_ttl_secs: u64,
    /// Query-result cache capacity.
    pub query_max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            lru_capacity: 1000,
            disk_enabled: true,
            disk_path: PathBuf::from("embedding_cache.db"),
            disk_max_age_days: 90,
            query_ttl_secs: 300,
            query_max_entries: 100,
        }
    }
}

/// Which vector index backend to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexKind {
    /// Exact below `exact_threshold`, approximate above it.
    Auto,
    /// Brute-force inner-product scan.
    Exact,
    /// Clustered (IVF) search.
    Approximate,
}

impl std::fmt::Display for IndexKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            IndexKind::Auto => "auto",
            IndexKind::Exact => "exact",
            IndexKind::Approximate => "approximate",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for IndexKind {
    type Err = MnemosError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(IndexKind::Auto),
            "exact" | "flat" => Ok(IndexKind::Exact),
            "approximate" | "ivf" => Ok(IndexKind::Approximate),
            other => Err(MnemosError::Config(format!("unknown index kind '{other}'"))),
        }
    }
}

/// Vector index settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub kind: IndexKind,
    /// Size at which `Auto` switches from exact to approximate.
    pub exact_threshold: usize,
    /// Upper bound on the number of clusters (`nlist ≈ sqrt(N)`).
    pub max_nlist: usize,
    /// Minimum clusters searched per query.
    pub nprobe: usize,
    /// Share of clusters searched per query. The effective count is the
    /// larger of `nprobe` and `ceil(nlist * cluster_fraction)`.
    pub cluster_fraction: f32,
    /// Lloyd iterations when training the quantizer.
    pub train_iterations: usize,
    /// Index binary path. Relative paths resolve against `home_dir`.
    pub index_path: PathBuf,
    /// JSON sidecar path. Relative paths resolve against `home_dir`.
    pub meta_path: PathBuf,
    /// Time window (days) of embeddings included in a build.
    pub build_window_days: u32,
    /// Persist the index after this many incremental additions.
    pub persist_every: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            kind: IndexKind::Auto,
            exact_threshold: 10_000,
            max_nlist: 1024,
            nprobe: 10,
            cluster_fraction: 0.9,
            train_iterations: 10,
            index_path: PathBuf::from("vector.index"),
            meta_path: PathBuf::from("vector_meta.json"),
            build_window_days: 180,
            persist_every: 100,
        }
    }
}

impl IndexConfig {
    /// Clusters to search for an index with `nlist` clusters.
    pub fn nprobe_for(&self, nlist: usize) -> usize {
        let by_fraction = (nlist as f64 * f64::from(self.cluster_fraction)).ceil() as usize;
        self.nprobe.max(by_fraction).clamp(1, nlist.max(1))
    }
}

/// Three-term blend weights.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlendWeights {
    pub lexical: f32,
    pub vector: f32,
    pub affect: f32,
}

impl Default for BlendWeights {
    fn default() -> Self {
        Self {
            lexical: 0.35,
            vector: 0.50,
            affect: 0.15,
        }
    }
}

/// Weights and constants of the ecological scoring strategy.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EcologyWeights {
    pub similarity: f32,
    pub strength: f32,
    pub recency: f32,
    pub novelty: f32,
    /// Recency decay per day of age.
    pub recency_decay_per_day: f32,
    /// Decayed strength below which a memory renders as faded.
    pub ghost_threshold: f32,
}

impl Default for EcologyWeights {
    fn default() -> Self {
        Self {
            similarity: 0.5,
            strength: 0.2,
            recency: 0.2,
            novelty: 0.1,
            recency_decay_per_day: 0.01,
            ghost_threshold: 0.1,
        }
    }
}

/// Which scoring strategy ranks candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringStrategyKind {
    #[default]
    Blend,
    Ecological,
}

/// Recall pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecallSettings {
    pub max_results: usize,
    pub time_window_days: u32,
    /// Minimum lexical candidates before the embedding stage may be skipped.
    pub min_lexical_results: usize,
    /// Best lexical score at or above which the embedding stage is skipped.
    pub lexical_confidence_threshold: f32,
    /// Lexical scores are normalized as `min(score / divisor, 1)`.
    pub lexical_norm_divisor: f32,
    /// Vector hits below this cosine similarity are dropped.
    pub similarity_floor: f32,
    /// Queries shorter than this skip the vector stage unless forced.
    pub skip_embedding_min_len: usize,
    /// Query text is truncated to this many characters before embedding.
    pub max_query_chars: usize,
    pub weights: BlendWeights,
    pub strategy: ScoringStrategyKind,
    pub ecology: EcologyWeights,
    /// Default caller deadline for one recall.
    pub deadline_ms: u64,
    /// Time held back from the vector stage for enrichment.
    pub enrichment_reserve_ms: u64,
}

impl Default for RecallSettings {
    fn default() -> Self {
        Self {
            max_results: 7,
            time_window_days: 90,
            min_lexical_results: 3,
            lexical_confidence_threshold: 15.0,
            lexical_norm_divisor: 50.0,
            similarity_floor: 0.35,
            skip_embedding_min_len: 10,
            max_query_chars: 500,
            weights: BlendWeights::default(),
            strategy: ScoringStrategyKind::Blend,
            ecology: EcologyWeights::default(),
            deadline_ms: 2_000,
            enrichment_reserve_ms: 100,
        }
    }
}

/// Affect folding settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AffectConfig {
    /// Per-memory weight of its affect in the aggregated bleed.
    pub bleed_factor: f32,
    /// Resonance assumed before the stored affect has been fetched.
    pub neutral_resonance: f32,
}

impl Default for AffectConfig {
    fn default() -> Self {
        Self {
            bleed_factor: 0.08,
            neutral_resonance: 0.5,
        }
    }
}

/// Background maintenance loops.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    pub index_rebuild_interval_secs: u64,
    pub cache_cleanup_interval_secs: u64,
    pub query_cache_sweep_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            index_rebuild_interval_secs: 86_400,
            cache_cleanup_interval_secs: 86_400,
            query_cache_sweep_secs: 60,
        }
    }
}

impl RecallConfig {
    /// Resolve a configured path against `home_dir` unless it is absolute.
    pub fn resolve(&self, path: &std::path::Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.home_dir.join(path)
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> MnemosResult<()> {
        if self.store.pool_size == 0 {
            return Err(MnemosError::Config("store.pool_size must be > 0".into()));
        }
        if self.embedding.dimension == 0 {
            return Err(MnemosError::Config("embedding.dimension must be > 0".into()));
        }
        if self.embedding.max_batch == 0 {
            return Err(MnemosError::Config("embedding.max_batch must be > 0".into()));
        }
        if self.embedding.rate_limit_per_sec == 0 {
            return Err(MnemosError::Config(
                "embedding.rate_limit_per_sec must be > 0".into(),
            ));
        }
        if self.cache.lru_capacity == 0 {
            return Err(MnemosError::Config("cache.lru_capacity must be > 0".into()));
        }
        if self.index.nprobe == 0 {
            return Err(MnemosError::Config("index.nprobe must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.index.cluster_fraction) {
            return Err(MnemosError::Config(
                "index.cluster_fraction must be within [0, 1]".into(),
            ));
        }
        let w = self.recall.weights;
        if w.lexical < 0.0 || w.vector < 0.0 || w.affect < 0.0 {
            return Err(MnemosError::Config("recall.weights must be >= 0".into()));
        }
        if w.lexical + w.vector + w.affect <= 0.0 {
            return Err(MnemosError::Config(
                "recall.weights must not all be zero".into(),
            ));
        }
        if self.recall.lexical_norm_divisor <= 0.0 {
            return Err(MnemosError::Config(
                "recall.lexical_norm_divisor must be > 0".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(RecallConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let cfg: RecallConfig = toml::from_str(
            r#"
            [recall]
            max_results = 3
            strategy = "ecological"

            [recall.weights]
            vector = 0.7
            "#,
        )
        .unwrap();
        assert_eq!(cfg.recall.max_results, 3);
        assert_eq!(cfg.recall.strategy, ScoringStrategyKind::Ecological);
        assert_eq!(cfg.recall.weights.vector, 0.7);
        assert_eq!(cfg.recall.weights.lexical, 0.35);
        assert_eq!(cfg.embedding.dimension, 512);
        assert_eq!(cfg.index.kind, IndexKind::Auto);
    }

    #[test]
    fn test_validate_rejects_zero_weights() {
        let mut cfg = RecallConfig::default();
        cfg.recall.weights = BlendWeights {
            lexical: 0.0,
            vector: 0.0,
            affect: 0.0,
        };
        assert!(matches!(cfg.validate(), Err(MnemosError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_pool() {
        let mut cfg = RecallConfig::default();
        cfg.store.pool_size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_nprobe_scales_with_nlist() {
        let cfg = IndexConfig::default();
        assert_eq!(cfg.nprobe_for(71), 64);
        assert_eq!(cfg.nprobe_for(4), 4);
        assert_eq!(cfg.nprobe_for(0), 1);

        let floor_only = IndexConfig {
            cluster_fraction: 0.0,
            ..IndexConfig::default()
        };
        assert_eq!(floor_only.nprobe_for(71), 10);
        assert_eq!(floor_only.nprobe_for(6), 6);
    }

    #[test]
    fn test_validate_rejects_cluster_fraction_above_one() {
        let mut cfg = RecallConfig::default();
        cfg.index.cluster_fraction = 1.5;
        assert!(matches!(cfg.validate(), Err(MnemosError::Config(_))));
    }

    #[test]
    fn test_index_kind_parse() {
        assert_eq!("ivf".parse::<IndexKind>().unwrap(), IndexKind::Approximate);
        assert_eq!("Exact".parse::<IndexKind>().unwrap(), IndexKind::Exact);
        assert!("hnsw".parse::<IndexKind>().is_err());
    }

    #[test]
    fn test_resolve_relative_paths() {
        let mut cfg = RecallConfig::default();
        cfg.home_dir = PathBuf::from("/data/mnemos");
        assert_eq!(
            cfg.resolve(&cfg.store.path),
            PathBuf::from("/data/mnemos/graph.sqlite")
        );
        assert_eq!(
            cfg.resolve(std::path::Path::new("/abs/x.db")),
            PathBuf::from("/abs/x.db")
        );
    }
}
