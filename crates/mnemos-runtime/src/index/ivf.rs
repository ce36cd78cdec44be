//! Inverted-file index over a spherical k-means quantizer.
//!
//! Training partitions the initial vectors into `nlist` clusters. Each query
//! scores the centroids, then scans only the members of the `nprobe` closest
//! clusters. Vectors added after training go to their nearest centroid; the
//! centroids themselves are never retrained in place.

use super::persist::IndexSnapshot;
use super::{check_batch, top_k, IndexEntry, IndexStats, IndexType, SearchHit, VectorIndex};
use mnemos_types::error::{MnemosError, MnemosResult};
use mnemos_types::vector::{dot, normalize, normalized};
use rand::rngs::StdRng;
use rand::seq::index::sample;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// `nlist ≈ sqrt(N)`, clamped to `[1, max_nlist]`.
pub fn nlist_for(count: usize, max_nlist: usize) -> usize {
    ((count as f64).sqrt().round() as usize).clamp(1, max_nlist.max(1))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvfParams {
    pub nlist: usize,
    pub nprobe: usize,
    pub iterations: usize,
    pub seed: u64,
}

#[derive(Debug, Clone)]
pub struct IvfIndex {
    dimension: usize,
    nprobe: usize,
    centroids: Vec<Vec<f32>>,
    /// Rows assigned to each centroid.
    lists: Vec<Vec<u32>>,
    data: Vec<f32>,
    entries: Vec<IndexEntry>,
}

impl IvfIndex {
    /// Train the quantizer on `vectors` and index them.
    pub fn train(
        dimension: usize,
        params: IvfParams,
        entries: Vec<IndexEntry>,
        vectors: Vec<Vec<f32>>,
    ) -> MnemosResult<Self> {
        check_batch(dimension, &entries, &vectors)?;
        if vectors.is_empty() {
            return Err(MnemosError::IndexUnavailable(
                "cannot train an approximate index on zero vectors".into(),
            ));
        }
        let vectors: Vec<Vec<f32>> = vectors.into_iter().map(normalized).collect();
        let nlist = params.nlist.clamp(1, vectors.len());
        let centroids = spherical_kmeans(&vectors, nlist, params.iterations.max(1), params.seed);

        let mut index = Self {
            dimension,
            nprobe: params.nprobe.max(1),
            lists: vec![Vec::new(); centroids.len()],
            centroids,
            data: Vec::with_capacity(vectors.len() * dimension),
            entries: Vec::with_capacity(entries.len()),
        };
        index.append(entries, vectors);
        debug!(
            nlist = index.centroids.len(),
            count = index.entries.len(),
            "Trained approximate index"
        );
        Ok(index)
    }

    /// Rebuild from persisted parts.
    pub(crate) fn from_parts(
        dimension: usize,
        nprobe: usize,
        centroids: Vec<Vec<f32>>,
        lists: Vec<Vec<u32>>,
        data: Vec<f32>,
        entries: Vec<IndexEntry>,
    ) -> Self {
        Self {
            dimension,
            nprobe: nprobe.max(1),
            centroids,
            lists,
            data,
            entries,
        }
    }

    pub fn nlist(&self) -> usize {
        self.centroids.len()
    }

    pub fn set_nprobe(&mut self, nprobe: usize) {
        self.nprobe = nprobe.max(1);
    }

    fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dimension..(row + 1) * self.dimension]
    }

    fn append(&mut self, entries: Vec<IndexEntry>, vectors: Vec<Vec<f32>>) {
        for (entry, v) in entries.into_iter().zip(vectors) {
            let row = self.entries.len() as u32;
            let cluster = nearest(&self.centroids, &v);
            self.lists[cluster].push(row);
            self.data.extend_from_slice(&v);
            self.entries.push(entry);
        }
    }
}

fn nearest(centroids: &[Vec<f32>], v: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, c) in centroids.iter().enumerate() {
        let s = dot(c, v);
        if s > best_score {
            best = i;
            best_score = s;
        }
    }
    best
}

/// k-means on the unit sphere: assignment by inner product, centroids
/// renormalized after every update. Empty clusters are reseeded from a
/// random member vector.
fn spherical_kmeans(vectors: &[Vec<f32>], k: usize, iterations: usize, seed: u64) -> Vec<Vec<f32>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let dim = vectors[0].len();
    let mut centroids: Vec<Vec<f32>> = sample(&mut rng, vectors.len(), k)
        .into_iter()
        .map(|i| vectors[i].clone())
        .collect();
    let mut assignment = vec![usize::MAX; vectors.len()];

    for iteration in 0..iterations {
        let mut changed = 0usize;
        for (i, v) in vectors.iter().enumerate() {
            let c = nearest(&centroids, v);
            if assignment[i] != c {
                assignment[i] = c;
                changed += 1;
            }
        }
        if changed == 0 {
            debug!(iteration, "k-means converged");
            break;
        }

        let mut sums = vec![vec![0.0f32; dim]; k];
        let mut counts = vec![0usize; k];
        for (v, &c) in vectors.iter().zip(&assignment) {
            counts[c] += 1;
            for (s, x) in sums[c].iter_mut().zip(v) {
                *s += x;
            }
        }
        for (c, mut sum) in sums.into_iter().enumerate() {
            if counts[c] == 0 {
                centroids[c] = vectors[rng.gen_range(0..vectors.len())].clone();
            } else {
                normalize(&mut sum);
                centroids[c] = sum;
            }
        }
    }
    centroids
}

impl VectorIndex for IvfIndex {
    fn index_type(&self) -> IndexType {
        IndexType::Ivf
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn add(&mut self, entries: Vec<IndexEntry>, vectors: Vec<Vec<f32>>) -> MnemosResult<()> {
        check_batch(self.dimension, &entries, &vectors)?;
        let vectors = vectors.into_iter().map(normalized).collect();
        self.append(entries, vectors);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if query.len() != self.dimension || self.entries.is_empty() {
            return Vec::new();
        }
        let query = normalized(query.to_vec());
        let centroid_scores: Vec<(usize, f32)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(i, c)| (i, dot(&query, c)))
            .collect();
        let nearest_clusters = top_k(centroid_scores, self.nprobe);

        let scored: Vec<(usize, f32)> = nearest_clusters
            .iter()
            .flat_map(|&(cluster, _)| self.lists[cluster].iter())
            .map(|&row| {
                let row = row as usize;
                (row, dot(&query, self.row(row)))
            })
            .collect();
        top_k(scored, k)
            .into_iter()
            .map(|(row, score)| SearchHit {
                row,
                score,
                entry: self.entries[row].clone(),
            })
            .collect()
    }

    fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    fn stats(&self) -> IndexStats {
        IndexStats {
            index_type: IndexType::Ivf,
            count: self.entries.len(),
            dimension: self.dimension,
            trained: !self.centroids.is_empty(),
            nlist: Some(self.centroids.len()),
            nprobe: Some(self.nprobe),
        }
    }

    fn boxed_clone(&self) -> Box<dyn VectorIndex> {
        Box::new(self.clone())
    }

    fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot::Ivf {
            dimension: self.dimension,
            nprobe: self.nprobe,
            centroids: self.centroids.clone(),
            lists: self.lists.clone(),
            data: self.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::ExactIndex;
    use super::*;
    use mnemos_types::config::{IndexConfig, IndexKind};
    use std::collections::HashSet;

    fn entries(n: usize) -> Vec<IndexEntry> {
        (0..n).map(|i| IndexEntry::from(&stored(i, vec![], 0))).collect()
    }

    /// Unit vectors scattered around `centers` random directions.
    fn clustered(rng: &mut StdRng, n: usize, dim: usize, centers: &[Vec<f32>]) -> Vec<Vec<f32>> {
        (0..n)
            .map(|i| {
                let center = &centers[i % centers.len()];
                let noise = random_unit(rng, dim);
                normalized(center.iter().zip(&noise).map(|(c, e)| c + 0.35 * e).collect())
            })
            .collect()
    }

    #[test]
    fn test_nlist_for() {
        assert_eq!(nlist_for(0, 1024), 1);
        assert_eq!(nlist_for(5_000, 1024), 71);
        assert_eq!(nlist_for(10_000_000, 1024), 1024);
    }

    #[test]
    fn test_self_is_top_hit() {
        let mut rng = seeded(5);
        let vectors: Vec<Vec<f32>> = (0..500).map(|_| random_unit(&mut rng, 32)).collect();
        let params = IvfParams {
            nlist: nlist_for(500, 1024),
            nprobe: 4,
            iterations: 10,
            seed: 9,
        };
        let index = IvfIndex::train(32, params, entries(500), vectors.clone()).unwrap();
        for row in [0usize, 123, 499] {
            let hits = index.search(&vectors[row], 1);
            assert_eq!(hits[0].row, row);
            assert!((hits[0].score - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_add_after_training_is_searchable() {
        let mut rng = seeded(6);
        let vectors: Vec<Vec<f32>> = (0..100).map(|_| random_unit(&mut rng, 16)).collect();
        let params = IvfParams {
            nlist: 10,
            nprobe: 2,
            iterations: 5,
            seed: 1,
        };
        let mut index = IvfIndex::train(16, params, entries(100), vectors).unwrap();
        let extra = random_unit(&mut rng, 16);
        index
            .add(vec![IndexEntry::from(&stored(1000, vec![], 0))], vec![extra.clone()])
            .unwrap();
        let hits = index.search(&extra, 1);
        assert_eq!(hits[0].entry.external_id, "1000");
        assert_eq!(index.nlist(), 10);
    }

    #[test]
    fn test_agrees_with_exact_on_clustered_data() {
        let dim = 512;
        let n = 5_000;
        let mut rng = seeded(42);
        let centers: Vec<Vec<f32>> = (0..50).map(|_| random_unit(&mut rng, dim)).collect();
        let vectors = clustered(&mut rng, n, dim, &centers);

        let mut exact = ExactIndex::new(dim);
        exact.add(entries(n), vectors.clone()).unwrap();
        let params = IvfParams {
            nlist: nlist_for(n, 1024),
            nprobe: 10,
            iterations: 5,
            seed: 7,
        };
        let ivf = IvfIndex::train(dim, params, entries(n), vectors).unwrap();

        let queries = clustered(&mut rng, 20, dim, &centers);
        let mut overlap = 0usize;
        for q in &queries {
            let truth: HashSet<usize> = exact.search(q, 10).into_iter().map(|h| h.row).collect();
            overlap += ivf
                .search(q, 10)
                .into_iter()
                .filter(|h| truth.contains(&h.row))
                .count();
        }
        let recall = overlap as f64 / (queries.len() * 10) as f64;
        assert!(recall >= 0.9, "recall@10 was {recall}");
    }

    #[test]
    fn test_default_config_agrees_with_exact_on_random_vectors() {
        let dim = 512;
        let n = 5_000;
        let mut rng = seeded(2024);
        let stored_vectors: Vec<_> = (0..n)
            .map(|i| stored(i, random_unit(&mut rng, dim), 0))
            .collect();

        let mut exact = ExactIndex::new(dim);
        exact
            .add(
                entries(n),
                stored_vectors.iter().map(|v| v.vector.clone()).collect(),
            )
            .unwrap();
        let ivf = super::super::build_index(
            IndexKind::Approximate,
            &IndexConfig::default(),
            stored_vectors,
            super::super::DEFAULT_TRAIN_SEED,
        )
        .unwrap()
        .unwrap();
        let stats = ivf.stats();
        assert_eq!(stats.nlist, Some(71));
        assert_eq!(stats.nprobe, Some(64));

        let mut overlap = 0usize;
        for _ in 0..20 {
            let q = random_unit(&mut rng, dim);
            let truth: HashSet<String> = exact
                .search(&q, 10)
                .into_iter()
                .map(|h| h.entry.external_id)
                .collect();
            overlap += ivf
                .search(&q, 10)
                .into_iter()
                .filter(|h| truth.contains(&h.entry.external_id))
                .count();
        }
        let recall = overlap as f64 / 200.0;
        assert!(recall >= 0.9, "recall@10 was {recall}");
    }

    #[test]
    fn test_train_rejects_empty() {
        let params = IvfParams {
            nlist: 4,
            nprobe: 1,
            iterations: 1,
            seed: 0,
        };
        assert!(IvfIndex::train(4, params, vec![], vec![]).is_err());
    }
}
