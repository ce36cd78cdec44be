//! Nearest-neighbor search over memory embeddings.
//!
//! Two backends implement [`VectorIndex`]: [`ExactIndex`] (full inner-product
//! scan) and [`IvfIndex`] (inverted lists over a spherical k-means quantizer).
//! The backend is chosen once at build time by [`build_index`].
//!
//! [`SharedIndex`] is the handle the recall path reads through. Writers clone
//! the current index, mutate the clone and publish it; readers keep searching
//! the snapshot they already hold.

pub mod exact;
pub mod ivf;
pub mod persist;

pub use exact::ExactIndex;
pub use ivf::{IvfIndex, IvfParams};

use mnemos_types::config::{IndexConfig, IndexKind};
use mnemos_types::error::{MnemosError, MnemosResult};
use mnemos_types::memory::{StoredVector, TimeWindow, TurnId};
use mnemos_types::vector::normalized;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Seed for k-means initialization so rebuilds are reproducible.
pub const DEFAULT_TRAIN_SEED: u64 = 0x6d6e_656d_6f73;

/// Metadata stored per indexed vector, mirrored in the JSON sidecar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub external_id: String,
    pub turn_id: TurnId,
    pub timestamp: i64,
    #[serde(default)]
    pub who: Option<String>,
    #[serde(default)]
    pub layer: Option<String>,
}

impl From<&StoredVector> for IndexEntry {
    fn from(v: &StoredVector) -> Self {
        Self {
            external_id: v.node_id.clone(),
            turn_id: v.turn_id.clone(),
            timestamp: v.timestamp_ms,
            who: v.speaker.clone(),
            layer: v.layer.clone(),
        }
    }
}

/// One search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    /// Row inside this index instance; not stable across builds.
    pub row: usize,
    /// Inner product with the (normalized) query.
    pub score: f32,
    pub entry: IndexEntry,
}

/// Which backend an index is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexType {
    Exact,
    Ivf,
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexType::Exact => write!(f, "exact"),
            IndexType::Ivf => write!(f, "ivf"),
        }
    }
}

/// Summary shown by `mnemos index stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexStats {
    pub index_type: IndexType,
    pub count: usize,
    pub dimension: usize,
    pub trained: bool,
    pub nlist: Option<usize>,
    pub nprobe: Option<usize>,
}

/// A nearest-neighbor index over L2-normalized vectors.
pub trait VectorIndex: Send + Sync {
    fn index_type(&self) -> IndexType;

    fn dimension(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append vectors with their metadata. Vectors are normalized on the way in.
    fn add(&mut self, entries: Vec<IndexEntry>, vectors: Vec<Vec<f32>>) -> MnemosResult<()>;

    /// Top-`k` entries by inner product with `query`, best first.
    fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit>;

    /// Metadata for every row, in row order.
    fn entries(&self) -> &[IndexEntry];

    fn stats(&self) -> IndexStats;

    /// Clone behind the trait object, for copy-on-write updates.
    fn boxed_clone(&self) -> Box<dyn VectorIndex>;

    /// Serializable form of the index structure (without metadata).
    fn snapshot(&self) -> persist::IndexSnapshot;
}

/// Check that `entries` and `vectors` line up and have the right dimension.
pub(crate) fn check_batch(
    dimension: usize,
    entries: &[IndexEntry],
    vectors: &[Vec<f32>],
) -> MnemosResult<()> {
    if entries.len() != vectors.len() {
        return Err(MnemosError::InvalidInput(format!(
            "{} entries for {} vectors",
            entries.len(),
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimension) {
        return Err(MnemosError::InvalidInput(format!(
            "vector dimension {} does not match index dimension {dimension}",
            bad.len()
        )));
    }
    Ok(())
}

/// Keep the best `k` of `(row, score)` pairs, best first.
pub(crate) fn top_k(mut scored: Vec<(usize, f32)>, k: usize) -> Vec<(usize, f32)> {
    if k == 0 || scored.is_empty() {
        return Vec::new();
    }
    let by_score = |a: &(usize, f32), b: &(usize, f32)| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
    };
    if scored.len() > k {
        scored.select_nth_unstable_by(k - 1, by_score);
        scored.truncate(k);
    }
    scored.sort_by(by_score);
    scored
}

/// Build an index over `vectors` according to `kind`.
///
/// Returns `None` when there is nothing to index. Vectors whose dimension
/// differs from the first one are skipped.
pub fn build_index(
    kind: IndexKind,
    config: &IndexConfig,
    vectors: Vec<StoredVector>,
    seed: u64,
) -> MnemosResult<Option<Box<dyn VectorIndex>>> {
    let Some(dimension) = vectors.first().map(|v| v.vector.len()) else {
        return Ok(None);
    };
    if dimension == 0 {
        return Err(MnemosError::IndexUnavailable("zero-dimension vectors".into()));
    }

    let total = vectors.len();
    let mut entries = Vec::with_capacity(total);
    let mut data = Vec::with_capacity(total);
    for v in vectors {
        if v.vector.len() != dimension {
            continue;
        }
        entries.push(IndexEntry::from(&v));
        data.push(normalized(v.vector));
    }
    if entries.len() < total {
        warn!(
            skipped = total - entries.len(),
            dimension, "Skipped vectors with mismatched dimension"
        );
    }

    let use_ivf = match kind {
        IndexKind::Exact => false,
        IndexKind::Approximate => true,
        IndexKind::Auto => entries.len() >= config.exact_threshold,
    };

    let index: Box<dyn VectorIndex> = if use_ivf {
        let nlist = ivf::nlist_for(entries.len(), config.max_nlist);
        let params = IvfParams {
            nlist,
            nprobe: config.nprobe_for(nlist),
            iterations: config.train_iterations,
            seed,
        };
        Box::new(IvfIndex::train(dimension, params, entries, data)?)
    } else {
        let mut exact = ExactIndex::new(dimension);
        exact.add(entries, data)?;
        Box::new(exact)
    };
    info!(
        index_type = %index.index_type(),
        count = index.len(),
        dimension,
        "Built vector index"
    );
    Ok(Some(index))
}

/// Copy-on-write handle shared by readers and the single writer.
#[derive(Default)]
pub struct SharedIndex {
    current: RwLock<Option<Arc<dyn VectorIndex>>>,
    writer: Mutex<()>,
}

impl SharedIndex {
    pub fn new(index: Option<Box<dyn VectorIndex>>) -> Self {
        Self {
            current: RwLock::new(index.map(Arc::from)),
            writer: Mutex::new(()),
        }
    }

    /// The index readers should search right now.
    pub fn load(&self) -> Option<Arc<dyn VectorIndex>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the whole index (after a rebuild).
    pub fn publish(&self, index: Option<Box<dyn VectorIndex>>) {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = index.map(Arc::from);
    }

    /// Append vectors, skipping external IDs already indexed. An empty handle
    /// becomes an exact index. Returns how many vectors were added.
    pub fn add(&self, vectors: Vec<StoredVector>) -> MnemosResult<usize> {
        let _writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        let current = self.load();

        let known: HashSet<&str> = current
            .as_ref()
            .map(|idx| idx.entries().iter().map(|e| e.external_id.as_str()).collect())
            .unwrap_or_default();
        let fresh: Vec<&StoredVector> = vectors
            .iter()
            .filter(|v| !known.contains(v.node_id.as_str()))
            .collect();
        if fresh.is_empty() {
            return Ok(0);
        }

        let mut next = match &current {
            Some(idx) => idx.boxed_clone(),
            None => {
                let dimension = fresh[0].vector.len();
                Box::new(ExactIndex::new(dimension)) as Box<dyn VectorIndex>
            }
        };
        let dimension = next.dimension();
        let (entries, data): (Vec<IndexEntry>, Vec<Vec<f32>>) = fresh
            .into_iter()
            .filter(|v| v.vector.len() == dimension)
            .map(|v| (IndexEntry::from(v), v.vector.clone()))
            .unzip();
        let added = entries.len();
        drop(known);
        next.add(entries, data)?;

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::from(next));
        debug!(added, "Published updated vector index");
        Ok(added)
    }

    /// Search the current snapshot, keeping hits inside `window` scoring at
    /// least `floor`. Starts from `2k` candidates and widens while the window
    /// filters too many out.
    pub fn search_filtered(
        &self,
        query: &[f32],
        k: usize,
        floor: f32,
        window: TimeWindow,
    ) -> Vec<SearchHit> {
        let Some(index) = self.load() else {
            return Vec::new();
        };
        if query.len() != index.dimension() {
            warn!(
                query_dim = query.len(),
                index_dim = index.dimension(),
                "Query dimension does not match index"
            );
            return Vec::new();
        }
        if k == 0 {
            return Vec::new();
        }

        // Widen the candidate set until `k` hits survive the filter, the
        // index runs out, or the best remaining score falls under the floor.
        let total = index.len();
        let mut fetch = k.saturating_mul(2).min(total);
        loop {
            let hits = index.search(query, fetch);
            let exhausted = fetch >= total
                || hits.len() < fetch
                || hits.last().map_or(true, |hit| hit.score < floor);
            let kept: Vec<SearchHit> = hits
                .into_iter()
                .filter(|hit| hit.score >= floor && window.contains(hit.entry.timestamp))
                .take(k)
                .collect();
            if kept.len() == k || exhausted {
                return kept;
            }
            fetch = fetch.saturating_mul(4).min(total);
        }
    }

    pub fn stats(&self) -> Option<IndexStats> {
        self.load().map(|idx| idx.stats())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    pub fn random_unit(rng: &mut StdRng, dim: usize) -> Vec<f32> {
        normalized((0..dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect())
    }

    pub fn stored(id: usize, vector: Vec<f32>, timestamp_ms: i64) -> StoredVector {
        StoredVector {
            node_id: id.to_string(),
            turn_id: format!("turn-{id}"),
            vector,
            timestamp_ms,
            speaker: Some("user".into()),
            layer: Some("input".into()),
        }
    }

    pub fn seeded(seed: u64) -> StdRng {
        StdRng::seed_from_u64(seed)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn config() -> IndexConfig {
        IndexConfig {
            exact_threshold: 100,
            ..Default::default()
        }
    }

    #[test]
    fn test_build_empty_is_none() {
        assert!(build_index(IndexKind::Auto, &config(), vec![], 1).unwrap().is_none());
    }

    #[test]
    fn test_auto_policy_switches_on_threshold() {
        let mut rng = seeded(3);
        let small: Vec<_> = (0..50).map(|i| stored(i, random_unit(&mut rng, 8), 0)).collect();
        let large: Vec<_> = (0..150).map(|i| stored(i, random_unit(&mut rng, 8), 0)).collect();

        let idx = build_index(IndexKind::Auto, &config(), small, 1).unwrap().unwrap();
        assert_eq!(idx.index_type(), IndexType::Exact);
        let idx = build_index(IndexKind::Auto, &config(), large, 1).unwrap().unwrap();
        assert_eq!(idx.index_type(), IndexType::Ivf);
        assert_eq!(idx.len(), 150);
    }

    #[test]
    fn test_mismatched_dimensions_are_skipped() {
        let vectors = vec![
            stored(1, vec![1.0, 0.0], 0),
            stored(2, vec![1.0, 0.0, 0.0], 0),
            stored(3, vec![0.0, 1.0], 0),
        ];
        let idx = build_index(IndexKind::Exact, &config(), vectors, 1).unwrap().unwrap();
        assert_eq!(idx.len(), 2);
    }

    #[test]
    fn test_shared_add_is_copy_on_write() {
        let shared = SharedIndex::new(None);
        shared.add(vec![stored(1, vec![1.0, 0.0], 0)]).unwrap();
        let before = shared.load().unwrap();

        assert_eq!(shared.add(vec![stored(2, vec![0.0, 1.0], 0)]).unwrap(), 1);
        // Readers holding the old snapshot still see the old contents.
        assert_eq!(before.len(), 1);
        assert_eq!(shared.load().unwrap().len(), 2);
        // Already-indexed IDs are not added twice.
        assert_eq!(shared.add(vec![stored(2, vec![0.0, 1.0], 0)]).unwrap(), 0);
    }

    #[test]
    fn test_search_filtered_applies_floor_and_window() {
        let shared = SharedIndex::new(None);
        shared
            .add(vec![
                stored(1, vec![1.0, 0.0], 2_000),
                stored(2, normalized(vec![1.0, 0.2]), 500),
                stored(3, vec![0.0, 1.0], 2_000),
            ])
            .unwrap();

        let hits = shared.search_filtered(&[1.0, 0.0], 5, 0.35, TimeWindow { since_ms: 1_000 });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.turn_id, "turn-1");

        assert!(shared.search_filtered(&[1.0, 0.0, 0.0], 5, 0.0, TimeWindow::unbounded()).is_empty());
    }

    #[test]
    fn test_search_filtered_reaches_past_out_of_window_neighbours() {
        let mut rng = seeded(11);
        let shared = SharedIndex::new(None);
        // The 40 nearest neighbours are all too old for the window.
        let mut vectors: Vec<_> = (0..40)
            .map(|i| stored(i, normalized(vec![1.0, 0.01 * i as f32, 0.0]), 100))
            .collect();
        vectors.extend((40..60).map(|i| stored(i, normalized(vec![0.2, 1.0, 0.0]), 5_000)));
        vectors.extend((60..80).map(|i| stored(i, random_unit(&mut rng, 3), 100)));
        shared.add(vectors).unwrap();

        let hits = shared.search_filtered(&[1.0, 0.0, 0.0], 5, -1.0, TimeWindow { since_ms: 1_000 });
        assert_eq!(hits.len(), 5);
        assert!(hits.iter().all(|hit| hit.entry.timestamp >= 1_000));
    }

    #[test]
    fn test_top_k_orders_best_first() {
        let picked = top_k(vec![(0, 0.1), (1, 0.9), (2, 0.5), (3, 0.7)], 2);
        assert_eq!(picked, vec![(1, 0.9), (3, 0.7)]);
        assert!(top_k(vec![(0, 1.0)], 0).is_empty());
    }
}
