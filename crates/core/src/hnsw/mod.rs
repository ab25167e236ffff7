//! Hierarchical Navigable Small World (HNSW) approximate nearest neighbor index.
//!
//! The graph uses a Struct-of-Arrays (SoA) layout for cache-friendly access:
//! all raw vectors are stored contiguously in an arena, with separate arrays
//! for neighbor lists, layer assignments and tombstones. An optional
//! [`QuantizationCodec`] can be attached; its codes are then kept in a second
//! arena and scored during layer-0 traversal, with exact reranking of the
//! final candidates.
//!
//! Removal tombstones a node: it stays in the graph for navigation but is
//! never returned, and its id cannot be reused until [`GraphIndex::rebuild`]
//! compacts the arena.

/// HNSW graph structure, configuration, and data storage.
pub mod graph;
/// HNSW insertion algorithm with bidirectional connections and heuristic pruning.
pub mod insert;
/// HNSW search: single-layer search, multi-layer KNN, and filtered search.
pub mod search;
/// Generation-based visited set for efficient graph traversal.
pub mod visited;

pub use graph::{GraphStats, HnswConfig, HnswGraph};

use crate::config::MAX_DIMENSION;
use crate::distance::DistanceMetric;
use crate::error::{Result, VdbError};
use crate::pool::TaskPool;
use crate::quantization::{QuantizationCodec, Quantizer};
use crate::search::{DenseIndex, SearchResult};
use crate::storage::{load_snapshot, save_snapshot};
use crate::VectorId;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const SNAPSHOT_KIND: &str = "graph-index";

struct GraphState {
    graph: HnswGraph,
    codec: Option<Arc<QuantizationCodec>>,
}

#[derive(Serialize)]
struct SnapshotRef<'a> {
    graph: &'a HnswGraph,
    codec: Option<&'a QuantizationCodec>,
}

#[derive(Deserialize)]
struct Snapshot {
    graph: HnswGraph,
    codec: Option<QuantizationCodec>,
}

/// Thread-safe approximate k-NN index.
///
/// Searches share a read lock; `add`, `remove`, `rebuild` and codec changes
/// take the write lock.
pub struct GraphIndex {
    state: RwLock<GraphState>,
    pool: Arc<TaskPool>,
}

impl std::fmt::Debug for GraphIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("GraphIndex")
            .field("dimension", &state.graph.dimension)
            .field("metric", &state.graph.config.distance_metric)
            .field("len", &state.graph.live_count)
            .field("codec", &state.codec.as_ref().map(|c| c.kind()))
            .finish()
    }
}

impl GraphIndex {
    /// Create an empty index for `dimension`-sized vectors.
    pub fn new(dimension: usize, config: HnswConfig, pool: Arc<TaskPool>) -> Result<Self> {
        if dimension == 0 || dimension > MAX_DIMENSION {
            return Err(VdbError::InvalidConfig(format!(
                "dimension must be in 1..={MAX_DIMENSION}, got {dimension}"
            )));
        }
        config.validate()?;
        Ok(Self {
            state: RwLock::new(GraphState {
                graph: HnswGraph::new(dimension, config),
                codec: None,
            }),
            pool,
        })
    }

    /// Insert a vector. Rejects wrong dimensions and ids already present,
    /// tombstoned ids included.
    pub fn add(&self, id: VectorId, vector: &[f32]) -> Result<()> {
        let mut state = self.state.write();
        VdbError::check_dimension(state.graph.dimension, vector.len())?;
        if state.graph.id_map.contains_key(&id) {
            return Err(VdbError::DuplicateId(id));
        }
        let codes = match &state.codec {
            Some(codec) => Some(codec.encode(vector)?),
            None => None,
        };
        state.graph.insert_node(id, vector, codes.as_deref());
        Ok(())
    }

    /// k nearest live vectors using the configured `ef_search`.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        let ef = self.state.read().graph.config.ef_search;
        self.search_with_ef(query, k, ef)
    }

    /// k nearest live vectors with an explicit candidate list size.
    pub fn search_with_ef(&self, query: &[f32], k: usize, ef: usize) -> Result<Vec<SearchResult>> {
        self.search_filtered(query, k, ef, |_| true)
    }

    /// k nearest live vectors whose id passes `filter`. Rejected nodes are
    /// still traversed.
    pub fn search_filtered<F>(&self, query: &[f32], k: usize, ef: usize, filter: F) -> Result<Vec<SearchResult>>
    where
        F: Fn(VectorId) -> bool,
    {
        let state = self.state.read();
        Self::search_state(&state, query, k, ef, &filter)
    }

    /// Run one search per query across the pool, results in query order.
    pub fn search_batch(&self, queries: &[Vec<f32>], k: usize) -> Result<Vec<Vec<SearchResult>>> {
        let state = self.state.read();
        let ef = state.graph.config.ef_search;
        let state_ref = &*state;
        self.pool.parallel_map(queries.len(), |i| {
            Self::search_state(state_ref, &queries[i], k, ef, &|_| true)
        })
    }

    fn search_state<F>(state: &GraphState, query: &[f32], k: usize, ef: usize, filter: &F) -> Result<Vec<SearchResult>>
    where
        F: Fn(VectorId) -> bool,
    {
        let graph = &state.graph;
        VdbError::check_dimension(graph.dimension, query.len())?;
        if k == 0 || graph.live_count == 0 {
            return Ok(Vec::new());
        }
        let metric = graph.config.distance_metric;
        let scorer = match &state.codec {
            Some(codec) => Some(codec.scorer(query, metric)?),
            None => None,
        };
        let accept = |node: u32| filter(graph.ids[node as usize]);
        Ok(graph
            .knn_search(query, k, ef, scorer.as_ref(), &accept)
            .into_iter()
            .map(|(distance, node)| SearchResult::new(graph.ids[node as usize], distance, metric))
            .collect())
    }

    /// Tombstone `id`. Returns false when the id is absent or already removed.
    pub fn remove(&self, id: VectorId) -> bool {
        self.state.write().graph.mark_deleted(id)
    }

    /// Rebuild the graph from its live nodes, dropping tombstones and freeing
    /// their ids for reuse.
    pub fn rebuild(&self) {
        let mut state = self.state.write();
        let before = state.graph.node_count();
        state.graph = state.graph.rebuilt();
        info!(
            dropped = before - state.graph.node_count(),
            nodes = state.graph.node_count(),
            "Rebuilt graph index"
        );
    }

    /// Attach a trained codec and encode every stored vector with it.
    /// Layer-0 traversal then scores codes instead of raw vectors.
    pub fn attach_codec(&self, codec: Arc<QuantizationCodec>) -> Result<()> {
        if !codec.is_trained() {
            return Err(VdbError::NotTrained);
        }
        let mut state = self.state.write();
        VdbError::check_dimension(state.graph.dimension, codec.dimension())?;

        let graph = &state.graph;
        let encoded = self
            .pool
            .parallel_map(graph.node_count(), |i| codec.encode(graph.vector(i as u32)))?;
        let code_size = codec.code_size();
        let mut codes = Vec::with_capacity(code_size * encoded.len());
        for code in &encoded {
            if code.len() != code_size {
                return Err(VdbError::InvalidCode {
                    expected: code_size,
                    actual: code.len(),
                });
            }
            codes.extend_from_slice(code);
        }

        info!(
            codec = codec.kind(),
            nodes = encoded.len(),
            code_size,
            "Attached codec to graph index"
        );
        state.graph.codes = codes;
        state.graph.code_size = code_size;
        state.codec = Some(codec);
        Ok(())
    }

    /// Drop the attached codec and its codes; search returns to raw vectors.
    pub fn detach_codec(&self) -> Option<Arc<QuantizationCodec>> {
        let mut state = self.state.write();
        state.graph.codes = Vec::new();
        state.graph.code_size = 0;
        state.codec.take()
    }

    pub fn codec(&self) -> Option<Arc<QuantizationCodec>> {
        self.state.read().codec.clone()
    }

    /// Returns true if `id` is stored and not tombstoned.
    pub fn contains(&self, id: VectorId) -> bool {
        self.state.read().graph.live_node(id).is_some()
    }

    /// Copy of the stored vector for a live `id`.
    pub fn get_vector(&self, id: VectorId) -> Option<Vec<f32>> {
        let state = self.state.read();
        state
            .graph
            .live_node(id)
            .map(|node| state.graph.vector(node).to_vec())
    }

    /// Number of live vectors.
    pub fn len(&self) -> usize {
        self.state.read().graph.live_count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dimension(&self) -> usize {
        self.state.read().graph.dimension
    }

    pub fn metric(&self) -> DistanceMetric {
        self.state.read().graph.config.distance_metric
    }

    pub fn config(&self) -> HnswConfig {
        self.state.read().graph.config.clone()
    }

    pub fn stats(&self) -> GraphStats {
        self.state.read().graph.stats()
    }

    /// Write a checksummed snapshot of the graph and any attached codec.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let state = self.state.read();
        let snapshot = SnapshotRef {
            graph: &state.graph,
            codec: state.codec.as_deref(),
        };
        save_snapshot(path, SNAPSHOT_KIND, &snapshot)
    }

    /// Load a snapshot written by [`GraphIndex::save`].
    pub fn load(path: impl AsRef<Path>, pool: Arc<TaskPool>) -> Result<Self> {
        let Snapshot { mut graph, codec } = load_snapshot(path, SNAPSHOT_KIND)?;
        graph.config.validate()?;
        graph.rebuild_id_map();
        graph.validate()?;
        if let Some(codec) = &codec {
            if codec.code_size() != graph.code_size {
                return Err(VdbError::Corrupted(format!(
                    "codec code size {} does not match stored codes of {} bytes",
                    codec.code_size(),
                    graph.code_size
                )));
            }
        } else if graph.code_size != 0 {
            return Err(VdbError::Corrupted("graph codes stored without a codec".to_string()));
        }
        Ok(Self {
            state: RwLock::new(GraphState {
                graph,
                codec: codec.map(|c| Arc::new(c.with_pool(Arc::clone(&pool)))),
            }),
            pool,
        })
    }
}

impl DenseIndex for GraphIndex {
    fn dimension(&self) -> usize {
        GraphIndex::dimension(self)
    }

    fn metric(&self) -> DistanceMetric {
        GraphIndex::metric(self)
    }

    fn search_dense(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>> {
        self.search(query, k)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flat::FlatIndex;
    use crate::quantization::{PqConfig, ProductQuantizer};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn pool() -> Arc<TaskPool> {
        TaskPool::shared(4).unwrap()
    }

    fn random_vectors(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| (0..dim).map(|_| rng.random::<f32>() - 0.5).collect())
            .collect()
    }

    fn build(n: usize, dim: usize, metric: DistanceMetric) -> (GraphIndex, Vec<Vec<f32>>) {
        let index = GraphIndex::new(dim, HnswConfig::with_metric(metric), pool()).unwrap();
        let vectors = random_vectors(n, dim, 11);
        for (i, v) in vectors.iter().enumerate() {
            index.add(i as u64, v).unwrap();
        }
        (index, vectors)
    }

    #[test]
    fn test_validation() {
        assert!(matches!(
            GraphIndex::new(0, HnswConfig::default(), pool()),
            Err(VdbError::InvalidConfig(_))
        ));
        let index = GraphIndex::new(3, HnswConfig::default(), pool()).unwrap();
        assert!(matches!(
            index.add(1, &[1.0, 2.0]),
            Err(VdbError::DimensionMismatch { expected: 3, actual: 2 })
        ));
        index.add(1, &[1.0, 2.0, 3.0]).unwrap();
        assert!(matches!(index.add(1, &[0.0; 3]), Err(VdbError::DuplicateId(1))));
        assert!(index.search(&[1.0], 1).is_err());
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_empty_and_zero_k() {
        let index = GraphIndex::new(2, HnswConfig::default(), pool()).unwrap();
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());
        index.add(7, &[1.0, 0.0]).unwrap();
        assert!(index.search(&[1.0, 0.0], 0).unwrap().is_empty());
        let one = index.search(&[1.0, 0.0], 5).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].id, 7);
    }

    #[test]
    fn test_recall_against_flat() {
        let (index, vectors) = build(2_000, 16, DistanceMetric::Euclidean);
        let flat = FlatIndex::new(16, DistanceMetric::Euclidean, pool()).unwrap();
        for (i, v) in vectors.iter().enumerate() {
            flat.add(i as u64, v).unwrap();
        }
        let queries = random_vectors(50, 16, 99);
        let mut hits = 0;
        for q in &queries {
            let truth: Vec<u64> = flat.search(q, 10).unwrap().iter().map(|r| r.id).collect();
            let got = index.search(q, 10).unwrap();
            assert!(got.windows(2).all(|w| w[0].distance <= w[1].distance));
            hits += got.iter().filter(|r| truth.contains(&r.id)).count();
        }
        let recall = hits as f32 / (queries.len() * 10) as f32;
        assert!(recall > 0.95, "recall {recall}");
    }

    #[test]
    fn test_remove_and_rebuild() {
        let (index, vectors) = build(300, 8, DistanceMetric::SquaredEuclidean);
        assert!(index.remove(5));
        assert!(!index.remove(5));
        assert!(!index.contains(5));
        assert_eq!(index.len(), 299);
        let results = index.search(&vectors[5], 10).unwrap();
        assert!(results.iter().all(|r| r.id != 5));
        assert!(matches!(index.add(5, &vectors[5]), Err(VdbError::DuplicateId(5))));

        let stats = index.stats();
        assert_eq!(stats.tombstones, 1);
        index.rebuild();
        assert_eq!(index.stats().tombstones, 0);
        assert_eq!(index.len(), 299);
        index.add(5, &vectors[5]).unwrap();
        assert_eq!(index.search(&vectors[5], 1).unwrap()[0].id, 5);
    }

    #[test]
    fn test_filtered_search() {
        let (index, vectors) = build(500, 8, DistanceMetric::Cosine);
        let results = index
            .search_filtered(&vectors[0], 5, 64, |id| id % 3 == 0)
            .unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.id % 3 == 0));
        assert_eq!(results[0].id, 0);
    }

    #[test]
    fn test_filter_may_search_the_same_index() {
        let (index, vectors) = build(200, 8, DistanceMetric::Euclidean);
        let results = index
            .search_filtered(&vectors[0], 5, 32, |id| {
                id % 2 == 0 && !index.search(&vectors[id as usize], 1).unwrap().is_empty()
            })
            .unwrap();
        assert_eq!(results.len(), 5);
        assert!(results.iter().all(|r| r.id % 2 == 0));
        assert_eq!(results[0].id, 0);
    }

    #[test]
    fn test_batch_matches_single() {
        let (index, vectors) = build(400, 8, DistanceMetric::DotProduct);
        let queries: Vec<Vec<f32>> = vectors.iter().take(20).cloned().collect();
        let batch = index.search_batch(&queries, 5).unwrap();
        for (q, got) in queries.iter().zip(&batch) {
            assert_eq!(&index.search(q, 5).unwrap(), got);
        }
    }

    #[test]
    fn test_attached_codec_reranks_exactly() {
        let (index, vectors) = build(1_000, 16, DistanceMetric::SquaredEuclidean);
        let mut pq = ProductQuantizer::new(PqConfig {
            num_centroids: 32,
            metric: DistanceMetric::SquaredEuclidean,
            ..PqConfig::new(16, 4)
        })
        .unwrap();
        pq.train(&vectors).unwrap();
        index.attach_codec(Arc::new(pq.into())).unwrap();
        assert_eq!(index.stats().code_size, 4);

        let q = &vectors[42];
        let results = index.search(q, 5).unwrap();
        assert_eq!(results[0].id, 42);
        for r in &results {
            let exact = DistanceMetric::SquaredEuclidean.distance(q, &vectors[r.id as usize]);
            assert!((r.distance - exact).abs() < 1e-5);
        }

        // Inserts after attaching get encoded too.
        index.add(5_000, &vectors[0]).unwrap();
        assert!(index.detach_codec().is_some());
        assert_eq!(index.stats().code_size, 0);
    }

    #[test]
    fn test_attach_untrained_codec() {
        let (index, _) = build(10, 8, DistanceMetric::Euclidean);
        let pq = ProductQuantizer::new(PqConfig::new(8, 2)).unwrap();
        assert!(matches!(
            index.attach_codec(Arc::new(pq.into())),
            Err(VdbError::NotTrained)
        ));
    }

    #[test]
    fn test_save_load_identical_results() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.vdb");
        let (index, vectors) = build(500, 8, DistanceMetric::Cosine);
        index.remove(3);
        index.save(&path).unwrap();

        let loaded = GraphIndex::load(&path, pool()).unwrap();
        assert_eq!(loaded.len(), index.len());
        assert!(!loaded.contains(3));
        for q in vectors.iter().take(20) {
            assert_eq!(index.search(q, 10).unwrap(), loaded.search(q, 10).unwrap());
        }
        // Level draws continue where the saved index stopped.
        index.add(10_000, &vectors[1]).unwrap();
        loaded.add(10_000, &vectors[1]).unwrap();
        assert_eq!(index.stats(), loaded.stats());
    }
}
