//! Brute-force inner-product index. Correct, O(N) per query.

use super::persist::IndexSnapshot;
use super::{check_batch, top_k, IndexEntry, IndexStats, IndexType, SearchHit, VectorIndex};
use mnemos_types::error::MnemosResult;
use mnemos_types::vector::{dot, normalize, normalized};

#[derive(Debug, Clone)]
pub struct ExactIndex {
    dimension: usize,
    /// Row-major, `dimension` floats per row.
    data: Vec<f32>,
    entries: Vec<IndexEntry>,
}

impl ExactIndex {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension,
            data: Vec::new(),
            entries: Vec::new(),
        }
    }

    /// Rebuild from persisted parts. `data` must hold `entries.len()` rows.
    pub(crate) fn from_parts(dimension: usize, data: Vec<f32>, entries: Vec<IndexEntry>) -> Self {
        Self {
            dimension,
            data,
            entries,
        }
    }

    pub(crate) fn row(&self, row: usize) -> &[f32] {
        &self.data[row * self.dimension..(row + 1) * self.dimension]
    }
}

impl VectorIndex for ExactIndex {
    fn index_type(&self) -> IndexType {
        IndexType::Exact
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn add(&mut self, entries: Vec<IndexEntry>, vectors: Vec<Vec<f32>>) -> MnemosResult<()> {
        check_batch(self.dimension, &entries, &vectors)?;
        self.data.reserve(vectors.len() * self.dimension);
        for mut v in vectors {
            normalize(&mut v);
            self.data.extend_from_slice(&v);
        }
        self.entries.extend(entries);
        Ok(())
    }

    fn search(&self, query: &[f32], k: usize) -> Vec<SearchHit> {
        if query.len() != self.dimension || self.entries.is_empty() {
            return Vec::new();
        }
        let query = normalized(query.to_vec());
        let scored: Vec<(usize, f32)> = (0..self.entries.len())
            .map(|row| (row, dot(&query, self.row(row))))
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
            index_type: IndexType::Exact,
            count: self.entries.len(),
            dimension: self.dimension,
            trained: true,
            nlist: None,
            nprobe: None,
        }
    }

    fn boxed_clone(&self) -> Box<dyn VectorIndex> {
        Box::new(self.clone())
    }

    fn snapshot(&self) -> IndexSnapshot {
        IndexSnapshot::Exact {
            dimension: self.dimension,
            data: self.data.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;

    #[test]
    fn test_self_is_top_hit() {
        let mut rng = seeded(11);
        let vectors: Vec<Vec<f32>> = (0..200).map(|_| random_unit(&mut rng, 64)).collect();
        let entries: Vec<IndexEntry> = (0..200)
            .map(|i| IndexEntry::from(&stored(i, vec![], 0)))
            .collect();
        let mut index = ExactIndex::new(64);
        index.add(entries, vectors.clone()).unwrap();

        for row in [0usize, 57, 199] {
            let hits = index.search(&vectors[row], 1);
            assert_eq!(hits[0].row, row);
            assert!((hits[0].score - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_add_normalizes() {
        let mut index = ExactIndex::new(2);
        index
            .add(vec![IndexEntry::from(&stored(1, vec![], 0))], vec![vec![3.0, 4.0]])
            .unwrap();
        let hits = index.search(&[3.0, 4.0], 1);
        assert!((hits[0].score - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_add_rejects_bad_batches() {
        let mut index = ExactIndex::new(2);
        assert!(index.add(vec![], vec![vec![1.0, 0.0]]).is_err());
        assert!(index
            .add(vec![IndexEntry::from(&stored(1, vec![], 0))], vec![vec![1.0]])
            .is_err());
        assert!(index.is_empty());
    }

    #[test]
    fn test_k_larger_than_len() {
        let mut index = ExactIndex::new(2);
        index
            .add(
                vec![
                    IndexEntry::from(&stored(1, vec![], 0)),
                    IndexEntry::from(&stored(2, vec![], 0)),
                ],
                vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            )
            .unwrap();
        let hits = index.search(&[1.0, 0.0], 10);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].entry.external_id, "1");
    }
}
