//! Structured vector quantization: whole-vector codebooks learned by k-means.
//!
//! Three layouts share one code format, a sequence of little-endian centroid
//! indices (1 byte per stage for codebooks of at most 256 entries, 2 bytes for
//! at most 65 536):
//!
//! - flat: one codebook, code = nearest centroid.
//! - hierarchical: a coarse codebook plus one fine codebook per coarse
//!   centroid, trained on the residuals of the points that fall into it.
//! - residual: a chain of codebooks, each trained on what the previous stages
//!   left over; decoding sums one centroid per stage.

use crate::config;
use crate::distance::{dot_product, DistanceMetric};
use crate::error::{Result, VdbError};
use crate::pool::TaskPool;
use crate::quantization::kmeans::{flatten_checked, kmeans, nearest_centroid, KMeansParams};
use crate::quantization::Quantizer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration of a [`StructuredQuantizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredQuantizerConfig {
    pub dimension: usize,
    /// Centroids in the flat codebook and in each residual stage.
    pub codebook_size: usize,
    pub num_iterations: usize,
    pub use_hierarchical: bool,
    pub coarse_codebook_size: usize,
    pub fine_codebook_size: usize,
    pub use_residual: bool,
    pub num_residual_stages: usize,
    pub metric: DistanceMetric,
    pub seed: u64,
    pub convergence_threshold: f32,
}

impl Default for StructuredQuantizerConfig {
    fn default() -> Self {
        Self {
            dimension: 128,
            codebook_size: config::QUANT_DEFAULT_CODEBOOK_SIZE,
            num_iterations: config::KMEANS_DEFAULT_ITERATIONS,
            use_hierarchical: false,
            coarse_codebook_size: 256,
            fine_codebook_size: 256,
            use_residual: false,
            num_residual_stages: 2,
            metric: DistanceMetric::SquaredEuclidean,
            seed: config::QUANT_DEFAULT_SEED,
            convergence_threshold: config::KMEANS_DEFAULT_CONVERGENCE,
        }
    }
}

fn check_codebook_size(name: &str, size: usize) -> Result<()> {
    if size == 0 || size > config::QUANT_MAX_CODEBOOK_SIZE {
        return Err(VdbError::InvalidConfig(format!(
            "{name} must be in 1..={}, got {size}",
            config::QUANT_MAX_CODEBOOK_SIZE
        )));
    }
    Ok(())
}

impl StructuredQuantizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 || self.dimension > config::MAX_DIMENSION {
            return Err(VdbError::InvalidConfig(format!(
                "dimension must be in 1..={}, got {}",
                config::MAX_DIMENSION,
                self.dimension
            )));
        }
        if self.use_hierarchical && self.use_residual {
            return Err(VdbError::InvalidConfig(
                "hierarchical and residual layouts are mutually exclusive".to_string(),
            ));
        }
        if self.use_hierarchical {
            check_codebook_size("coarse_codebook_size", self.coarse_codebook_size)?;
            check_codebook_size("fine_codebook_size", self.fine_codebook_size)?;
        } else {
            check_codebook_size("codebook_size", self.codebook_size)?;
        }
        if self.use_residual && self.num_residual_stages == 0 {
            return Err(VdbError::InvalidConfig(
                "residual quantization needs at least one stage".to_string(),
            ));
        }
        Ok(())
    }

    /// Centroid count of each code stage, in code order.
    fn stage_sizes(&self) -> Vec<usize> {
        if self.use_hierarchical {
            vec![self.coarse_codebook_size, self.fine_codebook_size]
        } else if self.use_residual {
            vec![self.codebook_size; self.num_residual_stages]
        } else {
            vec![self.codebook_size]
        }
    }

    fn kmeans_params(&self, k: usize, seed_offset: u64) -> KMeansParams {
        KMeansParams {
            k,
            max_iterations: self.num_iterations,
            convergence_threshold: self.convergence_threshold,
            seed: self.seed.wrapping_add(seed_offset),
        }
    }
}

/// Bytes needed to store an index into a codebook of `size` entries.
#[inline]
fn index_width(size: usize) -> usize {
    if size <= 256 {
        1
    } else {
        2
    }
}

#[inline]
fn write_index(out: &mut Vec<u8>, index: usize, width: usize) {
    if width == 1 {
        out.push(index as u8);
    } else {
        out.extend_from_slice(&(index as u16).to_le_bytes());
    }
}

/// Reads an index from a code already accepted by `check_code`.
#[inline]
fn read_index(codes: &[u8], offset: usize, width: usize) -> usize {
    if width == 1 {
        codes[offset] as usize
    } else {
        u16::from_le_bytes([codes[offset], codes[offset + 1]]) as usize
    }
}

#[inline]
fn get_index(codes: &[u8], offset: usize, width: usize) -> Option<usize> {
    match codes.get(offset..offset + width)? {
        [b] => Some(*b as usize),
        [lo, hi] => Some(u16::from_le_bytes([*lo, *hi]) as usize),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Codebooks {
    Flat { centroids: Vec<f32> },
    Hierarchical { coarse: Vec<f32>, fine: Vec<Vec<f32>> },
    Residual { stages: Vec<Vec<f32>> },
}

/// Per-query lookup table: distances become table reads instead of kernels.
#[derive(Debug, Clone)]
pub struct DistanceTable {
    width: usize,
    kind: TableKind,
}

#[derive(Debug, Clone)]
enum TableKind {
    /// Full query-to-centroid distance for each flat centroid.
    Flat(Vec<f32>),
    /// Query-to-centroid dot products for each residual stage.
    ResidualDot(Vec<Vec<f32>>),
}

impl DistanceTable {
    /// Distance from the table's query to the vector encoded by `codes`.
    /// A code of the wrong length or with an out-of-range index is infinitely far.
    #[inline]
    pub fn distance(&self, codes: &[u8]) -> f32 {
        match &self.kind {
            TableKind::Flat(distances) => {
                if codes.len() != self.width {
                    return f32::INFINITY;
                }
                get_index(codes, 0, self.width)
                    .and_then(|idx| distances.get(idx))
                    .copied()
                    .unwrap_or(f32::INFINITY)
            }
            TableKind::ResidualDot(stages) => {
                if codes.len() != stages.len() * self.width {
                    return f32::INFINITY;
                }
                let mut dot = 0.0f32;
                for (s, table) in stages.iter().enumerate() {
                    match get_index(codes, s * self.width, self.width).and_then(|idx| table.get(idx)) {
                        Some(d) => dot += d,
                        None => return f32::INFINITY,
                    }
                }
                -dot
            }
        }
    }
}

/// Whole-vector codebook quantizer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredQuantizer {
    config: StructuredQuantizerConfig,
    codebooks: Option<Codebooks>,
    #[serde(skip)]
    pool: Option<Arc<TaskPool>>,
}

impl StructuredQuantizer {
    pub fn new(config: StructuredQuantizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            codebooks: None,
            pool: None,
        })
    }

    /// Run k-means on `pool` during training.
    pub fn with_pool(mut self, pool: Arc<TaskPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &StructuredQuantizerConfig {
        &self.config
    }

    fn codebooks(&self) -> Result<&Codebooks> {
        self.codebooks.as_ref().ok_or(VdbError::NotTrained)
    }

    fn check_code(&self, codes: &[u8]) -> Result<()> {
        let expected = self.code_size();
        if codes.len() != expected {
            return Err(VdbError::InvalidCode {
                expected,
                actual: codes.len(),
            });
        }
        let mut offset = 0;
        for size in self.config.stage_sizes() {
            let width = index_width(size);
            let idx = read_index(codes, offset, width);
            if idx >= size {
                return Err(VdbError::Corrupted(format!(
                    "code index {idx} out of range for a codebook of {size}"
                )));
            }
            offset += width;
        }
        Ok(())
    }

    fn train_flat(&self, arena: &[f32]) -> Result<Codebooks> {
        let cfg = &self.config;
        let params = cfg.kmeans_params(cfg.codebook_size, 0);
        let result = kmeans(arena, cfg.dimension, &params, self.pool.as_deref())?;
        Ok(Codebooks::Flat {
            centroids: result.centroids,
        })
    }

    fn train_hierarchical(&self, arena: &[f32]) -> Result<Codebooks> {
        let cfg = &self.config;
        let dim = cfg.dimension;
        let pool = self.pool.as_deref();
        let coarse_params = cfg.kmeans_params(cfg.coarse_codebook_size, 0);
        let coarse = kmeans(arena, dim, &coarse_params, pool)?;

        let mut members: Vec<Vec<usize>> = vec![Vec::new(); cfg.coarse_codebook_size];
        for (i, &c) in coarse.assignments.iter().enumerate() {
            members[c as usize].push(i);
        }

        let train_fine = |c: usize| -> Result<Vec<f32>> {
            if members[c].is_empty() {
                // Unused coarse cell: fine codes decode to the coarse centroid itself.
                return Ok(vec![0.0; cfg.fine_codebook_size * dim]);
            }
            let centroid = &coarse.centroids[c * dim..(c + 1) * dim];
            let mut residuals = Vec::with_capacity(members[c].len() * dim);
            for &i in &members[c] {
                let point = &arena[i * dim..(i + 1) * dim];
                residuals.extend(point.iter().zip(centroid).map(|(p, q)| p - q));
            }
            let params = cfg.kmeans_params(cfg.fine_codebook_size, 1 + c as u64);
            Ok(kmeans(&residuals, dim, &params, pool)?.centroids)
        };

        let fine = match pool {
            Some(pool) => pool.parallel_map(cfg.coarse_codebook_size, train_fine)?,
            None => (0..cfg.coarse_codebook_size)
                .map(train_fine)
                .collect::<Result<Vec<_>>>()?,
        };

        Ok(Codebooks::Hierarchical {
            coarse: coarse.centroids,
            fine,
        })
    }

    fn train_residual(&self, arena: &[f32]) -> Result<Codebooks> {
        let cfg = &self.config;
        let dim = cfg.dimension;
        let mut residual = arena.to_vec();
        let mut stages = Vec::with_capacity(cfg.num_residual_stages);
        for s in 0..cfg.num_residual_stages {
            let params = cfg.kmeans_params(cfg.codebook_size, s as u64);
            let result = kmeans(&residual, dim, &params, self.pool.as_deref())?;
            for (i, &c) in result.assignments.iter().enumerate() {
                let centroid = &result.centroids[c as usize * dim..(c as usize + 1) * dim];
                for (r, q) in residual[i * dim..(i + 1) * dim].iter_mut().zip(centroid) {
                    *r -= q;
                }
            }
            stages.push(result.centroids);
        }
        Ok(Codebooks::Residual { stages })
    }

    /// Precompute per-centroid distances for `query`.
    ///
    /// Available for flat codebooks under every metric and for residual
    /// codebooks under the dot-product metric; other layouts report
    /// [`VdbError::UnsupportedOperation`] and callers fall back to
    /// [`Quantizer::compute_distance`].
    pub fn distance_table(&self, query: &[f32]) -> Result<DistanceTable> {
        self.distance_table_for(query, self.config.metric)
    }

    /// [`StructuredQuantizer::distance_table`] under an explicit metric.
    pub fn distance_table_for(&self, query: &[f32], metric: DistanceMetric) -> Result<DistanceTable> {
        let codebooks = self.codebooks()?;
        let dim = self.config.dimension;
        VdbError::check_dimension(dim, query.len())?;
        match codebooks {
            Codebooks::Flat { centroids } => Ok(DistanceTable {
                width: index_width(self.config.codebook_size),
                kind: TableKind::Flat(metric.batch_distance(query, centroids, dim)),
            }),
            Codebooks::Residual { stages } if metric == DistanceMetric::DotProduct => {
                let tables = stages
                    .iter()
                    .map(|centroids| centroids.chunks_exact(dim).map(|c| dot_product(query, c)).collect())
                    .collect();
                Ok(DistanceTable {
                    width: index_width(self.config.codebook_size),
                    kind: TableKind::ResidualDot(tables),
                })
            }
            _ => Err(VdbError::UnsupportedOperation(format!(
                "no distance table for this codebook layout under {}",
                metric.name()
            ))),
        }
    }

    /// Returns true if [`StructuredQuantizer::distance_table_for`] supports `metric`.
    pub fn supports_distance_table(&self, metric: DistanceMetric) -> bool {
        match self.codebooks {
            Some(Codebooks::Flat { .. }) => true,
            Some(Codebooks::Residual { .. }) => metric == DistanceMetric::DotProduct,
            _ => false,
        }
    }
}

impl Quantizer for StructuredQuantizer {
    fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        let arena = flatten_checked(vectors, self.config.dimension)?;
        let codebooks = if self.config.use_hierarchical {
            self.train_hierarchical(&arena)?
        } else if self.config.use_residual {
            self.train_residual(&arena)?
        } else {
            self.train_flat(&arena)?
        };
        self.codebooks = Some(codebooks);
        tracing::info!(
            "Trained structured quantizer on {} vectors (code size {} bytes)",
            vectors.len(),
            self.code_size()
        );
        Ok(())
    }

    fn is_trained(&self) -> bool {
        self.codebooks.is_some()
    }

    fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        let codebooks = self.codebooks()?;
        let dim = self.config.dimension;
        VdbError::check_dimension(dim, vector.len())?;
        let mut codes = Vec::with_capacity(self.code_size());
        match codebooks {
            Codebooks::Flat { centroids } => {
                let (idx, _) = nearest_centroid(vector, centroids, dim);
                write_index(&mut codes, idx, index_width(self.config.codebook_size));
            }
            Codebooks::Hierarchical { coarse, fine } => {
                let (c, _) = nearest_centroid(vector, coarse, dim);
                let centroid = &coarse[c * dim..(c + 1) * dim];
                let residual: Vec<f32> = vector.iter().zip(centroid).map(|(v, q)| v - q).collect();
                let (f, _) = nearest_centroid(&residual, &fine[c], dim);
                write_index(&mut codes, c, index_width(self.config.coarse_codebook_size));
                write_index(&mut codes, f, index_width(self.config.fine_codebook_size));
            }
            Codebooks::Residual { stages } => {
                let width = index_width(self.config.codebook_size);
                let mut residual = vector.to_vec();
                for centroids in stages {
                    let (idx, _) = nearest_centroid(&residual, centroids, dim);
                    for (r, q) in residual.iter_mut().zip(&centroids[idx * dim..(idx + 1) * dim]) {
                        *r -= q;
                    }
                    write_index(&mut codes, idx, width);
                }
            }
        }
        Ok(codes)
    }

    fn decode(&self, codes: &[u8]) -> Result<Vec<f32>> {
        let codebooks = self.codebooks()?;
        self.check_code(codes)?;
        let dim = self.config.dimension;
        let out = match codebooks {
            Codebooks::Flat { centroids } => {
                let idx = read_index(codes, 0, index_width(self.config.codebook_size));
                centroids[idx * dim..(idx + 1) * dim].to_vec()
            }
            Codebooks::Hierarchical { coarse, fine } => {
                let cw = index_width(self.config.coarse_codebook_size);
                let c = read_index(codes, 0, cw);
                let f = read_index(codes, cw, index_width(self.config.fine_codebook_size));
                coarse[c * dim..(c + 1) * dim]
                    .iter()
                    .zip(&fine[c][f * dim..(f + 1) * dim])
                    .map(|(a, b)| a + b)
                    .collect()
            }
            Codebooks::Residual { stages } => {
                let width = index_width(self.config.codebook_size);
                let mut out = vec![0.0f32; dim];
                for (s, centroids) in stages.iter().enumerate() {
                    let idx = read_index(codes, s * width, width);
                    for (o, q) in out.iter_mut().zip(&centroids[idx * dim..(idx + 1) * dim]) {
                        *o += q;
                    }
                }
                out
            }
        };
        Ok(out)
    }

    fn compute_distance(&self, query: &[f32], codes: &[u8]) -> Result<f32> {
        VdbError::check_dimension(self.config.dimension, query.len())?;
        if let Some(Codebooks::Flat { centroids }) = &self.codebooks {
            self.check_code(codes)?;
            let dim = self.config.dimension;
            let idx = read_index(codes, 0, index_width(self.config.codebook_size));
            return Ok(self.config.metric.distance(query, &centroids[idx * dim..(idx + 1) * dim]));
        }
        let decoded = self.decode(codes)?;
        Ok(self.config.metric.distance(query, &decoded))
    }

    fn code_size(&self) -> usize {
        self.config.stage_sizes().into_iter().map(index_width).sum()
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

    fn data(n: usize, dim: usize, seed: u64) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n).map(|_| (0..dim).map(|_| rng.random::<f32>()).collect()).collect()
    }

    fn flat(codebook_size: usize) -> StructuredQuantizerConfig {
        StructuredQuantizerConfig {
            dimension: 8,
            codebook_size,
            num_iterations: 15,
            ..Default::default()
        }
    }

    #[test]
    fn test_untrained_and_empty() {
        let mut q = StructuredQuantizer::new(flat(16)).unwrap();
        assert!(matches!(q.encode(&[0.0; 8]), Err(VdbError::NotTrained)));
        assert!(matches!(q.train(&[]), Err(VdbError::EmptyInput(_))));
        assert!(matches!(
            q.train(&[vec![0.0; 4]]),
            Err(VdbError::DimensionMismatch { expected: 8, actual: 4 })
        ));
        assert!(!q.is_trained());
    }

    #[test]
    fn test_config_validation() {
        assert!(StructuredQuantizer::new(flat(70_000)).is_err());
        let both = StructuredQuantizerConfig {
            use_hierarchical: true,
            use_residual: true,
            ..flat(16)
        };
        assert!(matches!(StructuredQuantizer::new(both), Err(VdbError::InvalidConfig(_))));
    }

    #[test]
    fn test_code_widths() {
        assert_eq!(StructuredQuantizer::new(flat(256)).unwrap().code_size(), 1);
        assert_eq!(StructuredQuantizer::new(flat(257)).unwrap().code_size(), 2);
        let residual = StructuredQuantizerConfig {
            use_residual: true,
            num_residual_stages: 3,
            ..flat(1024)
        };
        assert_eq!(StructuredQuantizer::new(residual).unwrap().code_size(), 6);
        let hier = StructuredQuantizerConfig {
            use_hierarchical: true,
            coarse_codebook_size: 16,
            fine_codebook_size: 300,
            ..flat(16)
        };
        assert_eq!(StructuredQuantizer::new(hier).unwrap().code_size(), 3);
    }

    #[test]
    fn test_two_byte_codes_round_trip_indices() {
        let vectors = data(300, 8, 3);
        let mut q = StructuredQuantizer::new(flat(300)).unwrap();
        q.train(&vectors).unwrap();
        // With n == k every training point is its own centroid.
        for v in vectors.iter().take(10) {
            let codes = q.encode(v).unwrap();
            assert_eq!(codes.len(), 2);
            let decoded = q.decode(&codes).unwrap();
            assert_eq!(&decoded, v);
        }
    }

    #[test]
    fn test_error_non_increasing_with_codebook_size() {
        let vectors = data(400, 8, 5);
        let mut last = f32::MAX;
        for size in [4, 16, 64, 400] {
            let mut q = StructuredQuantizer::new(flat(size)).unwrap();
            q.train(&vectors).unwrap();
            let err = q.reconstruction_error(&vectors).unwrap();
            assert!(err <= last + 1e-6, "size {size}: {err} > {last}");
            last = err;
        }
        assert!(last < 1e-9);
    }

    #[test]
    fn test_residual_refines_flat() {
        let vectors = data(400, 8, 9);
        let mut one = StructuredQuantizer::new(flat(16)).unwrap();
        one.train(&vectors).unwrap();
        let mut two = StructuredQuantizer::new(StructuredQuantizerConfig {
            use_residual: true,
            num_residual_stages: 2,
            ..flat(16)
        })
        .unwrap();
        two.train(&vectors).unwrap();
        assert!(two.reconstruction_error(&vectors).unwrap() < one.reconstruction_error(&vectors).unwrap());
    }

    #[test]
    fn test_hierarchical_with_pool() {
        let pool = TaskPool::shared(2).unwrap();
        let vectors = data(300, 8, 13);
        let mut q = StructuredQuantizer::new(StructuredQuantizerConfig {
            use_hierarchical: true,
            coarse_codebook_size: 8,
            fine_codebook_size: 8,
            ..flat(16)
        })
        .unwrap()
        .with_pool(pool);
        q.train(&vectors).unwrap();
        let codes = q.encode(&vectors[0]).unwrap();
        assert_eq!(codes.len(), 2);
        let decoded = q.decode(&codes).unwrap();
        assert_eq!(decoded.len(), 8);
        assert!(matches!(q.decode(&[0]), Err(VdbError::InvalidCode { expected: 2, actual: 1 })));
    }

    #[test]
    fn test_distance_tables() {
        let vectors = data(200, 8, 17);
        let mut q = StructuredQuantizer::new(flat(32)).unwrap();
        q.train(&vectors).unwrap();
        let table = q.distance_table(&vectors[1]).unwrap();
        for v in vectors.iter().take(10) {
            let codes = q.encode(v).unwrap();
            let exact = q.compute_distance(&vectors[1], &codes).unwrap();
            assert!((table.distance(&codes) - exact).abs() < 1e-5);
        }

        let mut r = StructuredQuantizer::new(StructuredQuantizerConfig {
            use_residual: true,
            metric: DistanceMetric::DotProduct,
            ..flat(16)
        })
        .unwrap();
        r.train(&vectors).unwrap();
        assert!(r.supports_distance_table(DistanceMetric::DotProduct));
        assert!(!r.supports_distance_table(DistanceMetric::Euclidean));
        let table = r.distance_table(&vectors[2]).unwrap();
        let codes = r.encode(&vectors[3]).unwrap();
        let exact = r.compute_distance(&vectors[2], &codes).unwrap();
        assert!((table.distance(&codes) - exact).abs() < 1e-4);
        assert!(matches!(
            r.distance_table_for(&vectors[2], DistanceMetric::Euclidean),
            Err(VdbError::UnsupportedOperation(_))
        ));
    }

    #[test]
    fn test_distance_table_rejects_malformed_codes() {
        let vectors = data(200, 8, 23);
        let mut q = StructuredQuantizer::new(flat(32)).unwrap();
        q.train(&vectors).unwrap();
        let table = q.distance_table(&vectors[0]).unwrap();
        assert_eq!(table.distance(&[]), f32::INFINITY);
        assert_eq!(table.distance(&[200]), f32::INFINITY);
        assert_eq!(table.distance(&[0, 0]), f32::INFINITY);
        assert!(table.distance(&[31]).is_finite());

        let mut r = StructuredQuantizer::new(StructuredQuantizerConfig {
            use_residual: true,
            metric: DistanceMetric::DotProduct,
            ..flat(16)
        })
        .unwrap();
        r.train(&vectors).unwrap();
        let table = r.distance_table(&vectors[0]).unwrap();
        let codes = r.encode(&vectors[1]).unwrap();
        assert!(table.distance(&codes).is_finite());
        assert_eq!(table.distance(&codes[..codes.len() - 1]), f32::INFINITY);
        let mut bad = codes.clone();
        *bad.last_mut().unwrap() = 16;
        assert_eq!(table.distance(&bad), f32::INFINITY);
    }
}
