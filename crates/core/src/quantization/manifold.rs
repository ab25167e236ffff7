//! Manifold-aware quantization: PCA projection with variance-driven bit
//! allocation.
//!
//! Training learns the data mean and the leading principal directions by
//! power iteration with deflation. Components are kept until they explain
//! `variance_threshold` of the total variance. Each kept component gets a bit
//! width proportional to its variance, clamped to
//! `[min_bits_per_dim, max_bits_per_dim]` and fitted under `total_bits`.
//! Projections are quantized uniformly between their training min and max and
//! bit-packed LSB first.

use crate::config;
use crate::distance::{dot_product, normalize, squared_euclidean};
use crate::error::{Result, VdbError};
use crate::pool::TaskPool;
use crate::quantization::kmeans::flatten_checked;
use crate::quantization::Quantizer;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Configuration of a [`ManifoldQuantizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifoldQuantizerConfig {
    pub dimension: usize,
    /// Fraction of total variance the kept components must explain, in (0, 1].
    pub variance_threshold: f32,
    pub min_bits_per_dim: u32,
    pub max_bits_per_dim: u32,
    /// Bit budget for one code.
    pub total_bits: u32,
    pub seed: u64,
    pub power_iterations: usize,
}

impl Default for ManifoldQuantizerConfig {
    fn default() -> Self {
        Self {
            dimension: 128,
            variance_threshold: 0.95,
            min_bits_per_dim: 4,
            max_bits_per_dim: 12,
            total_bits: 1024,
            seed: config::QUANT_DEFAULT_SEED,
            power_iterations: config::MANIFOLD_POWER_ITERATIONS,
        }
    }
}

impl ManifoldQuantizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 || self.dimension > config::MAX_DIMENSION {
            return Err(VdbError::InvalidConfig(format!(
                "dimension must be in 1..={}, got {}",
                config::MAX_DIMENSION,
                self.dimension
            )));
        }
        if !(self.variance_threshold > 0.0 && self.variance_threshold <= 1.0) {
            return Err(VdbError::InvalidConfig(format!(
                "variance_threshold must be in (0, 1], got {}",
                self.variance_threshold
            )));
        }
        if self.min_bits_per_dim == 0
            || self.min_bits_per_dim > self.max_bits_per_dim
            || self.max_bits_per_dim > 16
        {
            return Err(VdbError::InvalidConfig(format!(
                "bits per component must satisfy 1 <= min ({}) <= max ({}) <= 16",
                self.min_bits_per_dim, self.max_bits_per_dim
            )));
        }
        if self.total_bits < self.min_bits_per_dim {
            return Err(VdbError::InvalidConfig(format!(
                "total_bits {} cannot hold a single component",
                self.total_bits
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ManifoldModel {
    mean: Vec<f32>,
    /// Unit principal directions, `components.len() == bits.len()`.
    components: Vec<Vec<f32>>,
    eigenvalues: Vec<f32>,
    total_variance: f32,
    bits: Vec<u32>,
    offsets: Vec<f32>,
    scales: Vec<f32>,
}

impl ManifoldModel {
    fn code_bits(&self) -> u32 {
        self.bits.iter().sum()
    }

    fn code_size(&self) -> usize {
        self.code_bits().div_ceil(8) as usize
    }
}

/// PCA-projection quantizer with adaptive per-component precision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifoldQuantizer {
    config: ManifoldQuantizerConfig,
    model: Option<ManifoldModel>,
    #[serde(skip)]
    pool: Option<Arc<TaskPool>>,
}

/// Append `bits` low bits of `value` to a little-endian bit stream.
fn push_bits(out: &mut Vec<u8>, bit_pos: &mut usize, value: u32, bits: u32) {
    for b in 0..bits {
        if *bit_pos % 8 == 0 {
            out.push(0);
        }
        if (value >> b) & 1 == 1 {
            let last = out.len() - 1;
            out[last] |= 1 << (*bit_pos % 8);
        }
        *bit_pos += 1;
    }
}

fn read_bits(codes: &[u8], bit_pos: &mut usize, bits: u32) -> u32 {
    let mut value = 0u32;
    for b in 0..bits {
        let byte = codes[*bit_pos / 8];
        if (byte >> (*bit_pos % 8)) & 1 == 1 {
            value |= 1 << b;
        }
        *bit_pos += 1;
    }
    value
}

/// Variance-proportional bit widths within `[min, max]` summing to at most `total`.
fn allocate_bits(eigenvalues: &[f32], min: u32, max: u32, total: u32) -> Vec<u32> {
    let sum: f32 = eigenvalues.iter().sum();
    let mut bits: Vec<u32> = eigenvalues
        .iter()
        .map(|&l| {
            let share = if sum > 0.0 { total as f32 * l / sum } else { 0.0 };
            (share.floor() as u32).clamp(min, max)
        })
        .collect();

    // Over budget: shave the lowest-variance components first.
    let mut used: u32 = bits.iter().sum();
    for i in (0..bits.len()).rev() {
        if used <= total {
            break;
        }
        let cut = (bits[i] - min).min(used - total);
        bits[i] -= cut;
        used -= cut;
    }
    // Leftover budget: hand out single bits to the highest-variance components.
    let mut progressed = true;
    while used < total && progressed {
        progressed = false;
        for b in bits.iter_mut() {
            if used >= total {
                break;
            }
            if *b < max {
                *b += 1;
                used += 1;
                progressed = true;
            }
        }
    }
    bits
}

impl ManifoldQuantizer {
    pub fn new(config: ManifoldQuantizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            model: None,
            pool: None,
        })
    }

    pub fn with_pool(mut self, pool: Arc<TaskPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &ManifoldQuantizerConfig {
        &self.config
    }

    /// Bit width of each kept component (empty until trained).
    pub fn bit_allocation(&self) -> &[u32] {
        self.model.as_ref().map_or(&[], |m| &m.bits)
    }

    /// Number of principal components kept.
    pub fn components(&self) -> usize {
        self.model.as_ref().map_or(0, |m| m.components.len())
    }

    /// Fraction of training variance explained by the kept components.
    pub fn explained_variance(&self) -> f32 {
        self.model.as_ref().map_or(0.0, |m| {
            if m.total_variance > 0.0 {
                m.eigenvalues.iter().sum::<f32>() / m.total_variance
            } else {
                1.0
            }
        })
    }

    fn model(&self) -> Result<&ManifoldModel> {
        self.model.as_ref().ok_or(VdbError::NotTrained)
    }

    /// `C v` for the sample covariance `C` of `centered` (n rows of `dim`).
    fn covariance_times(&self, centered: &[f32], dim: usize, v: &[f32]) -> Result<Vec<f32>> {
        let n = centered.len() / dim;
        let partial = |start: usize, end: usize| -> Result<Vec<f32>> {
            let mut acc = vec![0.0f32; dim];
            for row in centered[start * dim..end * dim].chunks_exact(dim) {
                let p = dot_product(row, v);
                for (a, &x) in acc.iter_mut().zip(row) {
                    *a += p * x;
                }
            }
            Ok(acc)
        };
        let parts = match &self.pool {
            Some(pool) => pool.map_chunks(n, partial)?,
            None => vec![partial(0, n)?],
        };
        let mut out = vec![0.0f32; dim];
        for part in parts {
            for (o, p) in out.iter_mut().zip(part) {
                *o += p;
            }
        }
        let inv_n = 1.0 / n as f32;
        out.iter_mut().for_each(|o| *o *= inv_n);
        Ok(out)
    }

    fn project(model: &ManifoldModel, vector: &[f32]) -> Vec<f32> {
        let centered: Vec<f32> = vector.iter().zip(&model.mean).map(|(x, m)| x - m).collect();
        model.components.iter().map(|c| dot_product(&centered, c)).collect()
    }
}

fn orthogonalize(v: &mut [f32], basis: &[Vec<f32>]) {
    for b in basis {
        let p = dot_product(v, b);
        for (x, y) in v.iter_mut().zip(b) {
            *x -= p * y;
        }
    }
}

impl Quantizer for ManifoldQuantizer {
    fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        let cfg = &self.config;
        let dim = cfg.dimension;
        let arena = flatten_checked(vectors, dim)?;
        let n = vectors.len();

        let mut mean = vec![0.0f32; dim];
        for row in arena.chunks_exact(dim) {
            for (m, &x) in mean.iter_mut().zip(row) {
                *m += x;
            }
        }
        mean.iter_mut().for_each(|m| *m /= n as f32);
        let centered: Vec<f32> = arena
            .chunks_exact(dim)
            .flat_map(|row| row.iter().zip(&mean).map(|(x, m)| x - m))
            .collect();
        let total_variance: f32 =
            centered.chunks_exact(dim).map(|r| dot_product(r, r)).sum::<f32>() / n as f32;

        let max_components = dim
            .min(n)
            .min((cfg.total_bits / cfg.min_bits_per_dim) as usize)
            .max(1);
        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut components: Vec<Vec<f32>> = Vec::new();
        let mut eigenvalues: Vec<f32> = Vec::new();
        let mut explained = 0.0f32;

        while components.len() < max_components {
            let mut v: Vec<f32> = (0..dim).map(|_| rng.random::<f32>() - 0.5).collect();
            orthogonalize(&mut v, &components);
            normalize(&mut v);
            for _ in 0..cfg.power_iterations {
                let mut next = self.covariance_times(&centered, dim, &v)?;
                // Deflation: stay orthogonal to the directions already found.
                orthogonalize(&mut next, &components);
                normalize(&mut next);
                v = next;
            }
            let lambda = dot_product(&v, &self.covariance_times(&centered, dim, &v)?);
            if lambda <= f32::EPSILON * total_variance.max(f32::MIN_POSITIVE) && !components.is_empty() {
                break;
            }
            explained += lambda.max(0.0);
            components.push(v);
            eigenvalues.push(lambda.max(0.0));
            if total_variance <= 0.0 || explained >= cfg.variance_threshold * total_variance {
                break;
            }
        }

        let bits = allocate_bits(
            &eigenvalues,
            cfg.min_bits_per_dim,
            cfg.max_bits_per_dim,
            cfg.total_bits,
        );

        let mut model = ManifoldModel {
            mean,
            components,
            eigenvalues,
            total_variance,
            bits,
            offsets: Vec::new(),
            scales: Vec::new(),
        };

        let k = model.components.len();
        let mut lo = vec![f32::MAX; k];
        let mut hi = vec![f32::MIN; k];
        for row in arena.chunks_exact(dim) {
            for (i, p) in Self::project(&model, row).into_iter().enumerate() {
                lo[i] = lo[i].min(p);
                hi[i] = hi[i].max(p);
            }
        }
        model.scales = (0..k)
            .map(|i| {
                let levels = ((1u32 << model.bits[i]) - 1) as f32;
                let range = hi[i] - lo[i];
                if range > 0.0 {
                    range / levels
                } else {
                    0.0
                }
            })
            .collect();
        model.offsets = lo;

        tracing::info!(
            "Trained manifold quantizer: {} components, {} bits per code",
            k,
            model.code_bits()
        );
        self.model = Some(model);
        Ok(())
    }

    fn is_trained(&self) -> bool {
        self.model.is_some()
    }

    fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        let model = self.model()?;
        VdbError::check_dimension(self.config.dimension, vector.len())?;
        let projections = Self::project(model, vector);
        let mut codes = Vec::with_capacity(model.code_size());
        let mut bit_pos = 0usize;
        for (i, p) in projections.into_iter().enumerate() {
            let max_level = (1u32 << model.bits[i]) - 1;
            let q = if model.scales[i] > 0.0 {
                ((p - model.offsets[i]) / model.scales[i]).round().clamp(0.0, max_level as f32) as u32
            } else {
                0
            };
            push_bits(&mut codes, &mut bit_pos, q, model.bits[i]);
        }
        Ok(codes)
    }

    fn decode(&self, codes: &[u8]) -> Result<Vec<f32>> {
        let model = self.model()?;
        if codes.len() != model.code_size() {
            return Err(VdbError::InvalidCode {
                expected: model.code_size(),
                actual: codes.len(),
            });
        }
        let mut out = model.mean.clone();
        let mut bit_pos = 0usize;
        for (i, component) in model.components.iter().enumerate() {
            let q = read_bits(codes, &mut bit_pos, model.bits[i]);
            let p = model.offsets[i] + q as f32 * model.scales[i];
            for (o, &c) in out.iter_mut().zip(component) {
                *o += p * c;
            }
        }
        Ok(out)
    }

    /// Squared Euclidean distance to the reconstruction.
    fn compute_distance(&self, query: &[f32], codes: &[u8]) -> Result<f32> {
        VdbError::check_dimension(self.config.dimension, query.len())?;
        let decoded = self.decode(codes)?;
        Ok(squared_euclidean(query, &decoded))
    }

    fn code_size(&self) -> usize {
        match &self.model {
            Some(model) => model.code_size(),
            None => self.config.total_bits.div_ceil(8) as usize,
        }
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Points near a 2-D plane embedded in 6-D space.
    fn planar(n: usize) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(4);
        (0..n)
            .map(|_| {
                let a = rng.random::<f32>() * 4.0 - 2.0;
                let b = rng.random::<f32>() - 0.5;
                let noise = (rng.random::<f32>() - 0.5) * 1e-3;
                vec![a, b, a + b, a - b, 0.5 * a, noise]
            })
            .collect()
    }

    fn config() -> ManifoldQuantizerConfig {
        ManifoldQuantizerConfig {
            dimension: 6,
            variance_threshold: 0.99,
            min_bits_per_dim: 4,
            max_bits_per_dim: 12,
            total_bits: 16,
            ..Default::default()
        }
    }

    #[test]
    fn test_bit_packing_round_trip() {
        let mut out = Vec::new();
        let mut pos = 0;
        push_bits(&mut out, &mut pos, 0b101, 3);
        push_bits(&mut out, &mut pos, 0x3FF, 10);
        push_bits(&mut out, &mut pos, 1, 1);
        assert_eq!(out.len(), 2);
        let mut pos = 0;
        assert_eq!(read_bits(&out, &mut pos, 3), 0b101);
        assert_eq!(read_bits(&out, &mut pos, 10), 0x3FF);
        assert_eq!(read_bits(&out, &mut pos, 1), 1);
    }

    #[test]
    fn test_allocate_bits_respects_budget() {
        let bits = allocate_bits(&[8.0, 4.0, 2.0, 1.0], 2, 8, 16);
        assert_eq!(bits.iter().sum::<u32>(), 16);
        assert!(bits.windows(2).all(|w| w[0] >= w[1]));
        assert!(bits.iter().all(|&b| (2..=8).contains(&b)));
    }

    #[test]
    fn test_finds_planar_structure() {
        let data = planar(500);
        let mut q = ManifoldQuantizer::new(config()).unwrap();
        q.train(&data).unwrap();
        assert_eq!(q.components(), 2);
        assert!(q.explained_variance() > 0.99);
        let bits = q.bit_allocation();
        assert_eq!(bits.iter().sum::<u32>(), 16);
        assert!(bits[0] >= bits[1]);
        assert_eq!(q.code_size(), 2);
    }

    #[test]
    fn test_reconstruction_is_close() {
        let data = planar(500);
        let mut q = ManifoldQuantizer::new(config()).unwrap().with_pool(TaskPool::shared(2).unwrap());
        q.train(&data).unwrap();
        let err = q.reconstruction_error(&data).unwrap();
        assert!(err < 0.01, "mean squared reconstruction error {err}");
        let codes = q.encode(&data[0]).unwrap();
        assert!(matches!(
            q.decode(&codes[..1]),
            Err(VdbError::InvalidCode { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_invalid_configs() {
        let bad = ManifoldQuantizerConfig {
            min_bits_per_dim: 9,
            max_bits_per_dim: 4,
            ..config()
        };
        assert!(ManifoldQuantizer::new(bad).is_err());
        let bad = ManifoldQuantizerConfig {
            variance_threshold: 0.0,
            ..config()
        };
        assert!(ManifoldQuantizer::new(bad).is_err());
    }
}
