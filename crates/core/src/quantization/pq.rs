//! Product Quantization (PQ) for fast approximate distance computation.
//!
//! Splits vectors into M subspaces and learns up to 256 centroids per subspace
//! via k-means. Each vector is encoded as M bytes (one centroid ID per subspace).
//! Distance computation uses a precomputed lookup table: M table lookups + M additions
//! instead of D multiply-adds.

use crate::config;
use crate::distance::scalar::finish_cosine;
use crate::distance::{dot_product, squared_euclidean, DistanceMetric};
use crate::error::{Result, VdbError};
use crate::pool::TaskPool;
use crate::quantization::kmeans::{flatten_checked, kmeans, nearest_centroid, KMeansParams};
use crate::quantization::Quantizer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration of a [`ProductQuantizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PqConfig {
    pub dimension: usize,
    /// Number of subspaces M; must divide `dimension`.
    pub num_subspaces: usize,
    /// Centroids per subspace, at most 256.
    pub num_centroids: usize,
    pub metric: DistanceMetric,
    pub num_iterations: usize,
    pub seed: u64,
}

impl PqConfig {
    /// Default PQ layout for `dimension` with `num_subspaces` subspaces.
    pub fn new(dimension: usize, num_subspaces: usize) -> Self {
        Self {
            dimension,
            num_subspaces,
            num_centroids: config::PQ_NUM_CENTROIDS,
            metric: DistanceMetric::SquaredEuclidean,
            num_iterations: config::KMEANS_DEFAULT_ITERATIONS,
            seed: config::QUANT_DEFAULT_SEED,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 || self.num_subspaces == 0 {
            return Err(VdbError::InvalidConfig(
                "PQ dimension and subspace count must be positive".to_string(),
            ));
        }
        if self.dimension % self.num_subspaces != 0 {
            return Err(VdbError::InvalidConfig(format!(
                "dimension {} is not divisible by {} subspaces",
                self.dimension, self.num_subspaces
            )));
        }
        if self.num_centroids == 0 || self.num_centroids > 256 {
            return Err(VdbError::InvalidConfig(format!(
                "PQ needs 1..=256 centroids per subspace for u8 codes, got {}",
                self.num_centroids
            )));
        }
        Ok(())
    }
}

/// PQ codebook: M subspaces × K centroids × sub_dim floats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PqCodebook {
    pub num_subspaces: usize,
    pub num_centroids: usize,
    pub sub_dim: usize,
    /// Flat centroid array: centroids[m * K * sub_dim + k * sub_dim .. + sub_dim]
    pub centroids: Vec<f32>,
}

/// Precomputed distance table for a single query.
///
/// For the Euclidean metrics `table[m * K + k]` holds the squared partial
/// distance; for dot product and cosine it holds the partial dot product, and
/// cosine additionally reads per-centroid squared norms.
#[derive(Debug, Clone)]
pub struct PqDistanceTable {
    metric: DistanceMetric,
    num_subspaces: usize,
    num_centroids: usize,
    table: Vec<f32>,
    centroid_norms: Vec<f32>,
    query_norm_sq: f32,
}

impl PqCodebook {
    /// Train a PQ codebook on a contiguous arena of `n * dim` floats.
    pub fn train(vectors: &[f32], dim: usize, cfg: &PqConfig, pool: Option<&TaskPool>) -> Result<Self> {
        cfg.validate()?;
        let m = cfg.num_subspaces;
        let k = cfg.num_centroids;
        let sub_dim = dim / m;
        let n = vectors.len() / dim;
        if n == 0 {
            return Err(VdbError::EmptyInput("no PQ training vectors".to_string()));
        }

        let mut centroids = Vec::with_capacity(m * k * sub_dim);
        let mut sub_vectors = vec![0.0f32; n * sub_dim];
        for sub in 0..m {
            // Extract sub-vectors for this subspace
            for i in 0..n {
                let src_start = i * dim + sub * sub_dim;
                sub_vectors[i * sub_dim..(i + 1) * sub_dim]
                    .copy_from_slice(&vectors[src_start..src_start + sub_dim]);
            }
            let params = KMeansParams {
                k,
                max_iterations: cfg.num_iterations,
                convergence_threshold: config::KMEANS_DEFAULT_CONVERGENCE,
                seed: cfg.seed.wrapping_add(sub as u64),
            };
            centroids.extend(kmeans(&sub_vectors, sub_dim, &params, pool)?.centroids);
        }

        Ok(Self {
            num_subspaces: m,
            num_centroids: k,
            sub_dim,
            centroids,
        })
    }

    #[inline]
    fn centroid(&self, sub: usize, ci: usize) -> &[f32] {
        let start = (sub * self.num_centroids + ci) * self.sub_dim;
        &self.centroids[start..start + self.sub_dim]
    }

    /// Encode a single vector into M PQ codes.
    pub fn encode(&self, vector: &[f32]) -> Vec<u8> {
        let k = self.num_centroids;
        (0..self.num_subspaces)
            .map(|sub| {
                let sub_vec = &vector[sub * self.sub_dim..(sub + 1) * self.sub_dim];
                let base = sub * k * self.sub_dim;
                let sub_centroids = &self.centroids[base..base + k * self.sub_dim];
                nearest_centroid(sub_vec, sub_centroids, self.sub_dim).0 as u8
            })
            .collect()
    }

    /// Reconstruct a vector from M codes.
    pub fn decode(&self, codes: &[u8]) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.num_subspaces * self.sub_dim);
        for (sub, &c) in codes.iter().enumerate().take(self.num_subspaces) {
            out.extend_from_slice(self.centroid(sub, (c as usize).min(self.num_centroids - 1)));
        }
        out
    }

    /// Build the distance lookup table for a query vector and distance metric.
    pub fn build_distance_table(&self, query: &[f32], metric: DistanceMetric) -> PqDistanceTable {
        let k = self.num_centroids;
        let mut table = vec![0.0f32; self.num_subspaces * k];
        let mut centroid_norms = Vec::new();
        if metric == DistanceMetric::Cosine {
            centroid_norms = vec![0.0f32; self.num_subspaces * k];
        }

        for sub in 0..self.num_subspaces {
            let q_sub = &query[sub * self.sub_dim..(sub + 1) * self.sub_dim];
            for ci in 0..k {
                let centroid = self.centroid(sub, ci);
                let idx = sub * k + ci;
                table[idx] = match metric {
                    DistanceMetric::Euclidean | DistanceMetric::SquaredEuclidean => {
                        squared_euclidean(q_sub, centroid)
                    }
                    DistanceMetric::DotProduct | DistanceMetric::Cosine => dot_product(q_sub, centroid),
                };
                if metric == DistanceMetric::Cosine {
                    centroid_norms[idx] = dot_product(centroid, centroid);
                }
            }
        }

        PqDistanceTable {
            metric,
            num_subspaces: self.num_subspaces,
            num_centroids: k,
            table,
            centroid_norms,
            query_norm_sq: dot_product(query, query),
        }
    }
}

impl PqDistanceTable {
    /// Approximate distance for a PQ-encoded vector (`codes` is M bytes).
    /// Codes of the wrong length or naming a missing centroid return infinity.
    #[inline]
    pub fn distance(&self, codes: &[u8]) -> f32 {
        let k = self.num_centroids;
        if codes.len() != self.num_subspaces {
            return f32::INFINITY;
        }
        let mut acc = 0.0f32;
        let mut norm_sq = 0.0f32;
        for (m, &c) in codes.iter().enumerate() {
            let c = c as usize;
            if c >= k {
                return f32::INFINITY;
            }
            let idx = m * k + c;
            acc += self.table[idx];
            if self.metric == DistanceMetric::Cosine {
                norm_sq += self.centroid_norms[idx];
            }
        }
        match self.metric {
            DistanceMetric::SquaredEuclidean => acc,
            DistanceMetric::Euclidean => acc.sqrt(),
            DistanceMetric::DotProduct => -acc,
            DistanceMetric::Cosine => 1.0 - finish_cosine(acc, self.query_norm_sq, norm_sq),
        }
    }
}

/// Product quantizer with its training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProductQuantizer {
    config: PqConfig,
    codebook: Option<PqCodebook>,
    #[serde(skip)]
    pool: Option<Arc<TaskPool>>,
}

impl ProductQuantizer {
    pub fn new(config: PqConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            codebook: None,
            pool: None,
        })
    }

    /// Run k-means assignment on `pool` during training.
    pub fn with_pool(mut self, pool: Arc<TaskPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &PqConfig {
        &self.config
    }

    /// Train from a contiguous arena of `n * dimension` floats.
    pub fn train_arena(&mut self, arena: &[f32]) -> Result<()> {
        if arena.is_empty() {
            return Err(VdbError::EmptyInput("no training vectors".to_string()));
        }
        let codebook = PqCodebook::train(arena, self.config.dimension, &self.config, self.pool.as_deref())?;
        self.codebook = Some(codebook);
        Ok(())
    }

    fn codebook(&self) -> Result<&PqCodebook> {
        self.codebook.as_ref().ok_or(VdbError::NotTrained)
    }

    fn check_code(&self, codes: &[u8]) -> Result<()> {
        if codes.len() != self.config.num_subspaces {
            return Err(VdbError::InvalidCode {
                expected: self.config.num_subspaces,
                actual: codes.len(),
            });
        }
        Ok(())
    }

    /// Distance table for `query` under the configured metric.
    pub fn distance_table(&self, query: &[f32]) -> Result<PqDistanceTable> {
        self.distance_table_for(query, self.config.metric)
    }

    /// Distance table for `query` under an arbitrary metric.
    pub fn distance_table_for(&self, query: &[f32], metric: DistanceMetric) -> Result<PqDistanceTable> {
        let codebook = self.codebook()?;
        VdbError::check_dimension(self.config.dimension, query.len())?;
        Ok(codebook.build_distance_table(query, metric))
    }
}

impl Quantizer for ProductQuantizer {
    fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        let arena = flatten_checked(vectors, self.config.dimension)?;
        self.train_arena(&arena)
    }

    fn is_trained(&self) -> bool {
        self.codebook.is_some()
    }

    fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        let codebook = self.codebook()?;
        VdbError::check_dimension(self.config.dimension, vector.len())?;
        Ok(codebook.encode(vector))
    }

    fn decode(&self, codes: &[u8]) -> Result<Vec<f32>> {
        let codebook = self.codebook()?;
        self.check_code(codes)?;
        Ok(codebook.decode(codes))
    }

    fn compute_distance(&self, query: &[f32], codes: &[u8]) -> Result<f32> {
        let decoded = self.decode(codes)?;
        VdbError::check_dimension(self.config.dimension, query.len())?;
        Ok(self.config.metric.distance(query, &decoded))
    }

    fn code_size(&self) -> usize {
        self.config.num_subspaces
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn data(n: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(1);
        (0..n).map(|_| (0..dim).map(|_| rng.random::<f32>()).collect()).collect()
    }

    fn small_config(metric: DistanceMetric) -> PqConfig {
        PqConfig {
            num_centroids: 16,
            metric,
            num_iterations: 10,
            ..PqConfig::new(8, 4)
        }
    }

    #[test]
    fn test_untrained_errors() {
        let pq = ProductQuantizer::new(small_config(DistanceMetric::Euclidean)).unwrap();
        assert!(!pq.is_trained());
        assert!(matches!(pq.encode(&[0.0; 8]), Err(VdbError::NotTrained)));
        assert!(matches!(pq.decode(&[0; 4]), Err(VdbError::NotTrained)));
    }

    #[test]
    fn test_invalid_configs() {
        assert!(ProductQuantizer::new(PqConfig::new(10, 3)).is_err());
        let cfg = PqConfig {
            num_centroids: 300,
            ..PqConfig::new(8, 4)
        };
        assert!(matches!(ProductQuantizer::new(cfg), Err(VdbError::InvalidConfig(_))));
    }

    #[test]
    fn test_encode_decode_shape() {
        let mut pq = ProductQuantizer::new(small_config(DistanceMetric::Euclidean)).unwrap();
        let vectors = data(200, 8);
        pq.train(&vectors).unwrap();
        let codes = pq.encode(&vectors[0]).unwrap();
        assert_eq!(codes.len(), 4);
        assert_eq!(pq.decode(&codes).unwrap().len(), 8);
        assert!(matches!(
            pq.decode(&[0, 1]),
            Err(VdbError::InvalidCode { expected: 4, actual: 2 })
        ));
        assert!((pq.compression_ratio() - 8.0).abs() < 1e-6);
    }

    #[test]
    fn test_distance_table_matches_decoded_distance() {
        let vectors = data(300, 8);
        for metric in [
            DistanceMetric::SquaredEuclidean,
            DistanceMetric::Euclidean,
            DistanceMetric::DotProduct,
            DistanceMetric::Cosine,
        ] {
            let mut pq = ProductQuantizer::new(small_config(metric)).unwrap();
            pq.train(&vectors).unwrap();
            let query = &vectors[7];
            let table = pq.distance_table(query).unwrap();
            for v in vectors.iter().take(20) {
                let codes = pq.encode(v).unwrap();
                let via_table = table.distance(&codes);
                let exact = pq.compute_distance(query, &codes).unwrap();
                assert!(
                    (via_table - exact).abs() < 1e-4,
                    "{}: table {via_table} vs decoded {exact}",
                    metric.name()
                );
            }
        }
    }

    #[test]
    fn test_distance_table_malformed_codes_are_infinite() {
        let vectors = data(200, 8);
        let mut pq = ProductQuantizer::new(small_config(DistanceMetric::Cosine)).unwrap();
        pq.train(&vectors).unwrap();
        let table = pq.distance_table(&vectors[0]).unwrap();
        let codes = pq.encode(&vectors[1]).unwrap();
        assert!(table.distance(&codes).is_finite());
        assert_eq!(table.distance(&codes[..2]), f32::INFINITY);
        assert_eq!(table.distance(&[]), f32::INFINITY);
        // 16 centroids per subspace: byte 16 names no centroid.
        let mut bad = codes.clone();
        bad[3] = 16;
        assert_eq!(table.distance(&bad), f32::INFINITY);
        bad[3] = 255;
        assert_eq!(table.distance(&bad), f32::INFINITY);
    }
}
