//! Exact brute-force index.
//!
//! Vectors live in one contiguous `n * d` arena in insertion order. Search
//! scans every vector; collections at or above [`FLAT_PARALLEL_THRESHOLD`]
//! are split into per-worker chunks, each chunk keeps its own bounded heap,
//! and the chunk heaps are merged in chunk order.

use crate::config::{FLAT_PARALLEL_THRESHOLD, MAX_DIMENSION};
use crate::distance::DistanceMetric;
use crate::error::{Result, VdbError};
use crate::pool::TaskPool;
use crate::search::{sort_results, DenseIndex, SearchResult};
use crate::storage::{load_snapshot, save_snapshot};
use crate::VectorId;
use ordered_float::OrderedFloat;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap};
use std::path::Path;
use std::sync::Arc;

const SNAPSHOT_KIND: &str = "flat-index";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FlatData {
    dimension: usize,
    metric: DistanceMetric,
    ids: Vec<VectorId>,
    vectors: Vec<f32>,
    #[serde(skip)]
    positions: HashMap<VectorId, usize>,
}

impl FlatData {
    fn vector(&self, pos: usize) -> &[f32] {
        &self.vectors[pos * self.dimension..(pos + 1) * self.dimension]
    }

    fn rebuild_positions(&mut self) {
        self.positions = self.ids.iter().enumerate().map(|(i, &id)| (id, i)).collect();
    }

    fn validate(&self) -> Result<()> {
        if self.vectors.len() != self.ids.len() * self.dimension {
            return Err(VdbError::Corrupted(format!(
                "flat arena holds {} floats for {} ids of dimension {}",
                self.vectors.len(),
                self.ids.len(),
                self.dimension
            )));
        }
        if self.positions.len() != self.ids.len() {
            return Err(VdbError::Corrupted("duplicate ids in flat snapshot".to_string()));
        }
        Ok(())
    }

    /// Best `k` of positions `[start, end)` as `(distance, id)`, unordered.
    fn top_k_range(
        &self,
        query: &[f32],
        k: usize,
        start: usize,
        end: usize,
    ) -> Vec<(OrderedFloat<f32>, VectorId)> {
        let kernel = self.metric.kernel();
        let mut heap: BinaryHeap<(OrderedFloat<f32>, VectorId)> = BinaryHeap::with_capacity(k + 1);
        for pos in start..end {
            let entry = (OrderedFloat(kernel(query, self.vector(pos))), self.ids[pos]);
            if heap.len() < k {
                heap.push(entry);
            } else if let Some(worst) = heap.peek() {
                if entry < *worst {
                    heap.pop();
                    heap.push(entry);
                }
            }
        }
        heap.into_vec()
    }
}

/// Exact k-NN index over a contiguous vector arena.
pub struct FlatIndex {
    data: RwLock<FlatData>,
    pool: Arc<TaskPool>,
}

impl std::fmt::Debug for FlatIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let data = self.data.read();
        f.debug_struct("FlatIndex")
            .field("dimension", &data.dimension)
            .field("metric", &data.metric)
            .field("len", &data.ids.len())
            .finish()
    }
}

impl FlatIndex {
    /// Create an empty index for `dimension`-sized vectors.
    pub fn new(dimension: usize, metric: DistanceMetric, pool: Arc<TaskPool>) -> Result<Self> {
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(VdbError::InvalidConfig(format!(
                "dimension must be in 1..={MAX_DIMENSION}, got {dimension}"
            )));
        }
        Ok(Self {
            data: RwLock::new(FlatData {
                dimension,
                metric,
                ids: Vec::new(),
                vectors: Vec::new(),
                positions: HashMap::new(),
            }),
            pool,
        })
    }

    /// Append a vector. Rejects wrong dimensions and ids already present.
    pub fn add(&self, id: VectorId, vector: &[f32]) -> Result<()> {
        let mut data = self.data.write();
        VdbError::check_dimension(data.dimension, vector.len())?;
        if data.positions.contains_key(&id) {
            return Err(VdbError::DuplicateId(id));
        }
        let pos = data.ids.len();
        data.ids.push(id);
        data.vectors.extend_from_slice(vector);
        data.positions.insert(id, pos);
        Ok(())
    }

    /// Exact k nearest neighbors, best first, ties broken by ascending id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        let data = self.data.read();
        VdbError::check_dimension(data.dimension, query.len())?;
        let n = data.ids.len();
        if k == 0 || n == 0 {
            return Ok(Vec::new());
        }

        let candidates = if n >= FLAT_PARALLEL_THRESHOLD && self.pool.threads() > 1 {
            let data_ref = &*data;
            self.pool
                .map_chunks(n, |start, end| Ok(data_ref.top_k_range(query, k, start, end)))?
                .into_iter()
                .flatten()
                .collect()
        } else {
            data.top_k_range(query, k, 0, n)
        };

        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .map(|(d, id)| SearchResult::new(id, d.0, data.metric))
            .collect();
        sort_results(&mut results);
        results.truncate(k);
        Ok(results)
    }

    /// Remove `id`, preserving the order of the remaining vectors.
    /// Returns false when the id is not present.
    pub fn remove(&self, id: VectorId) -> bool {
        let mut data = self.data.write();
        let Some(pos) = data.positions.remove(&id) else {
            return false;
        };
        let dim = data.dimension;
        data.ids.remove(pos);
        data.vectors.drain(pos * dim..(pos + 1) * dim);
        for p in pos..data.ids.len() {
            let moved = data.ids[p];
            data.positions.insert(moved, p);
        }
        true
    }

    /// Returns true if `id` is stored.
    pub fn contains(&self, id: VectorId) -> bool {
        self.data.read().positions.contains_key(&id)
    }

    /// Copy of the stored vector for `id`.
    pub fn get_vector(&self, id: VectorId) -> Option<Vec<f32>> {
        let data = self.data.read();
        data.positions.get(&id).map(|&pos| data.vector(pos).to_vec())
    }

    /// Stored ids in insertion order.
    pub fn ids(&self) -> Vec<VectorId> {
        self.data.read().ids.clone()
    }

    pub fn len(&self) -> usize {
        self.data.read().ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.data.read().dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.data.read().metric
    }

    /// Write a checksummed snapshot to `path`.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let data = self.data.read();
        save_snapshot(path, SNAPSHOT_KIND, &*data)
    }

    /// Load a snapshot written by [`FlatIndex::save`].
    pub fn load(path: impl AsRef<Path>, pool: Arc<TaskPool>) -> Result<Self> {
        let mut data: FlatData = load_snapshot(path, SNAPSHOT_KIND)?;
        data.rebuild_positions();
        data.validate()?;
        Ok(Self {
            data: RwLock::new(data),
            pool,
        })
    }
}

impl DenseIndex for FlatIndex {
    fn dimension(&self) -> usize {
        FlatIndex::dimension(self)
    }

    fn metric(&self) -> DistanceMetric {
        FlatIndex::metric(self)
    }

    fn search_dense(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        self.search(query, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn pool() -> Arc<TaskPool> {
        TaskPool::shared(4).unwrap()
    }

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.random::<f32>() * 2.0 - 1.0).collect())
            .collect()
    }

    fn naive(vectors: &[Vec<f32>], query: &[f32], k: usize, metric: DistanceMetric) -> Vec<VectorId> {
        let mut all: Vec<(f32, VectorId)> = vectors
            .iter()
            .enumerate()
            .map(|(i, v)| (metric.distance(query, v), i as VectorId))
            .collect();
        all.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        all.into_iter().take(k).map(|(_, id)| id).collect()
    }

    #[test]
    fn test_cosine_scenario() {
        let index = FlatIndex::new(4, DistanceMetric::Cosine, pool()).unwrap();
        index.add(1, &[1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add(2, &[0.0, 1.0, 0.0, 0.0]).unwrap();
        index.add(3, &[0.9, 0.1, 0.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0, 0.0, 0.0], 2).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, 1);
        assert!(results[0].distance.abs() < 1e-6);
        assert_eq!(results[1].id, 3);
        let expected = 1.0 - 0.9 / (0.82f32).sqrt();
        assert!((results[1].distance - expected).abs() < 1e-4);
    }

    #[test]
    fn test_add_rejects_bad_dimension_and_duplicates() {
        let index = FlatIndex::new(3, DistanceMetric::Euclidean, pool()).unwrap();
        assert!(matches!(
            index.add(1, &[1.0, 2.0]),
            Err(VdbError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        index.add(1, &[1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(index.add(1, &[0.0; 3]), Err(VdbError::DuplicateId(1))));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_search_edge_cases() {
        let index = FlatIndex::new(2, DistanceMetric::Euclidean, pool()).unwrap();
        assert!(index.search(&[0.0, 0.0], 5).unwrap().is_empty());
        index.add(7, &[1.0, 1.0]).unwrap();
        assert!(index.search(&[0.0, 0.0], 0).unwrap().is_empty());
        assert_eq!(index.search(&[0.0, 0.0], 5).unwrap().len(), 1);
        assert!(matches!(
            index.search(&[0.0], 1),
            Err(VdbError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_matches_naive_scan() {
        let vectors = random_vectors(300, 16, 11);
        let index = FlatIndex::new(16, DistanceMetric::SquaredEuclidean, pool()).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            index.add(i as VectorId, v).unwrap();
        }
        let query = &random_vectors(1, 16, 99)[0];
        let results = index.search(query, 10).unwrap();
        let ids: Vec<VectorId> = results.iter().map(|r| r.id).collect();
        assert_eq!(ids, naive(&vectors, query, 10, DistanceMetric::SquaredEuclidean));
        assert!(results.windows(2).all(|w| w[0].distance <= w[1].distance));
    }

    #[test]
    fn test_parallel_scan_matches_naive() {
        let n = FLAT_PARALLEL_THRESHOLD + 500;
        let vectors = random_vectors(n, 8, 5);
        let index = FlatIndex::new(8, DistanceMetric::DotProduct, pool()).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            index.add(i as VectorId, v).unwrap();
        }
        let query = &random_vectors(1, 8, 6)[0];
        let ids: Vec<VectorId> = index.search(query, 20).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, naive(&vectors, query, 20, DistanceMetric::DotProduct));
    }

    #[test]
    fn test_ties_broken_by_id() {
        let index = FlatIndex::new(2, DistanceMetric::Euclidean, pool()).unwrap();
        for id in [9, 4, 6] {
            index.add(id, &[1.0, 0.0]).unwrap();
        }
        let ids: Vec<VectorId> = index.search(&[0.0, 0.0], 2).unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 6]);
    }

    #[test]
    fn test_remove_preserves_order() {
        let index = FlatIndex::new(1, DistanceMetric::Euclidean, pool()).unwrap();
        for id in 0..5u64 {
            index.add(id, &[id as f32]).unwrap();
        }
        assert!(index.remove(2));
        assert!(!index.remove(2));
        assert_eq!(index.ids(), vec![0, 1, 3, 4]);
        assert_eq!(index.get_vector(3), Some(vec![3.0]));
        assert!(!index.contains(2));
        let ids: Vec<VectorId> = index.search(&[2.0], 4).unwrap().iter().map(|r| r.id).collect();
        assert!(!ids.contains(&2));
        // The id can be reused after removal.
        index.add(2, &[2.0]).unwrap();
        assert_eq!(index.search(&[2.0], 1).unwrap()[0].id, 2);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("flat.vdb");
        let vectors = random_vectors(50, 4, 3);
        let index = FlatIndex::new(4, DistanceMetric::Cosine, pool()).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            index.add(i as VectorId * 10, v).unwrap();
        }
        index.save(&path).unwrap();

        let loaded = FlatIndex::load(&path, pool()).unwrap();
        assert_eq!(loaded.len(), 50);
        assert_eq!(loaded.metric(), DistanceMetric::Cosine);
        assert!(loaded.contains(490));
        let q = [0.3, -0.2, 0.9, 0.1];
        assert_eq!(index.search(&q, 5).unwrap(), loaded.search(&q, 5).unwrap());
    }
}
