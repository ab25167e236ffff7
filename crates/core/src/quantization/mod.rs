//! Vector quantization codecs.
//!
//! Every codec learns its codebooks from training vectors, then maps vectors
//! to compact byte codes and back, and approximates query-to-code distances.
//! Codecs are immutable once trained; retraining replaces every codebook, and
//! a failed training run leaves the previous state untouched.

/// Transfer curves (PQ ST 2084, HLG, gamma) used by the perceptual codec.
pub mod curves;
/// K-means++ clustering shared by the codebook trainers.
pub mod kmeans;
/// PCA projection with variance-driven bit allocation.
pub mod manifold;
/// Color-space aware quantization with separate lightness and chroma codebooks.
pub mod perceptual;
/// Product quantization with asymmetric distance tables.
pub mod pq;
/// Flat, hierarchical and residual whole-vector codebooks.
pub mod structured;

pub use curves::TransferCurve;
pub use manifold::{ManifoldQuantizer, ManifoldQuantizerConfig};
pub use perceptual::{ColorSpace, PerceptualQuantizer, PerceptualQuantizerConfig};
pub use pq::{PqCodebook, PqConfig, PqDistanceTable, ProductQuantizer};
pub use structured::{DistanceTable, StructuredQuantizer, StructuredQuantizerConfig};

use crate::distance::{squared_euclidean, DistanceMetric};
use crate::error::{Result, VdbError};
use crate::pool::TaskPool;
use crate::storage::{load_snapshot, save_snapshot};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

const SNAPSHOT_KIND: &str = "quantization-codec";

/// Common surface of every codec.
pub trait Quantizer: Send + Sync {
    /// Learn codebooks from `vectors`. Fails with `EmptyInput` on no vectors
    /// and `DimensionMismatch` on a vector of the wrong length.
    fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()>;

    fn is_trained(&self) -> bool;

    fn encode(&self, vector: &[f32]) -> Result<Vec<u8>>;

    fn encode_batch(&self, vectors: &[Vec<f32>]) -> Result<Vec<Vec<u8>>> {
        vectors.iter().map(|v| self.encode(v)).collect()
    }

    fn decode(&self, codes: &[u8]) -> Result<Vec<f32>>;

    /// Approximate distance from an uncompressed query to an encoded vector.
    fn compute_distance(&self, query: &[f32], codes: &[u8]) -> Result<f32>;

    /// Bytes per encoded vector.
    fn code_size(&self) -> usize;

    fn dimension(&self) -> usize;

    /// Raw f32 size over code size.
    fn compression_ratio(&self) -> f32 {
        (self.dimension() * std::mem::size_of::<f32>()) as f32 / self.code_size().max(1) as f32
    }

    /// Mean squared L2 error of `decode(encode(v))` over `vectors`.
    fn reconstruction_error(&self, vectors: &[Vec<f32>]) -> Result<f32> {
        if vectors.is_empty() {
            return Err(VdbError::EmptyInput("no vectors to measure".to_string()));
        }
        let mut total = 0.0f64;
        for v in vectors {
            let decoded = self.decode(&self.encode(v)?)?;
            total += squared_euclidean(v, &decoded) as f64;
        }
        Ok((total / vectors.len() as f64) as f32)
    }
}

/// Any of the codec kinds, as stored and shared by the indexes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QuantizationCodec {
    Structured(StructuredQuantizer),
    Product(ProductQuantizer),
    Perceptual(PerceptualQuantizer),
    Manifold(ManifoldQuantizer),
}

impl QuantizationCodec {
    fn inner(&self) -> &dyn Quantizer {
        match self {
            QuantizationCodec::Structured(q) => q,
            QuantizationCodec::Product(q) => q,
            QuantizationCodec::Perceptual(q) => q,
            QuantizationCodec::Manifold(q) => q,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn Quantizer {
        match self {
            QuantizationCodec::Structured(q) => q,
            QuantizationCodec::Product(q) => q,
            QuantizationCodec::Perceptual(q) => q,
            QuantizationCodec::Manifold(q) => q,
        }
    }

    /// Short name of the codec kind.
    pub fn kind(&self) -> &'static str {
        match self {
            QuantizationCodec::Structured(_) => "structured",
            QuantizationCodec::Product(_) => "product",
            QuantizationCodec::Perceptual(_) => "perceptual",
            QuantizationCodec::Manifold(_) => "manifold",
        }
    }

    /// Use `pool` for training fan-out.
    pub fn with_pool(self, pool: Arc<TaskPool>) -> Self {
        match self {
            QuantizationCodec::Structured(q) => QuantizationCodec::Structured(q.with_pool(pool)),
            QuantizationCodec::Product(q) => QuantizationCodec::Product(q.with_pool(pool)),
            QuantizationCodec::Perceptual(q) => QuantizationCodec::Perceptual(q.with_pool(pool)),
            QuantizationCodec::Manifold(q) => QuantizationCodec::Manifold(q.with_pool(pool)),
        }
    }

    /// Prepare per-query state for scoring many codes under `metric`.
    ///
    /// Uses a lookup table when the codec supports one for `metric`, and
    /// otherwise decodes each code and applies the exact kernel.
    pub fn scorer<'a>(&'a self, query: &'a [f32], metric: DistanceMetric) -> Result<CodeScorer<'a>> {
        if !self.is_trained() {
            return Err(VdbError::NotTrained);
        }
        VdbError::check_dimension(self.dimension(), query.len())?;
        let scorer = match self {
            QuantizationCodec::Product(pq) => CodeScorer::Pq(pq.distance_table_for(query, metric)?),
            QuantizationCodec::Structured(sq) if sq.supports_distance_table(metric) => {
                CodeScorer::Table(sq.distance_table_for(query, metric)?)
            }
            _ => CodeScorer::Decode {
                codec: self,
                query,
                metric,
            },
        };
        Ok(scorer)
    }

    /// Write a checksummed snapshot of the codec and its codebooks.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        save_snapshot(path, SNAPSHOT_KIND, self)
    }

    /// Load a codec written by [`QuantizationCodec::save`].
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        load_snapshot(path, SNAPSHOT_KIND)
    }
}

impl Quantizer for QuantizationCodec {
    fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        self.inner_mut().train(vectors)
    }

    fn is_trained(&self) -> bool {
        self.inner().is_trained()
    }

    fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        self.inner().encode(vector)
    }

    fn encode_batch(&self, vectors: &[Vec<f32>]) -> Result<Vec<Vec<u8>>> {
        self.inner().encode_batch(vectors)
    }

    fn decode(&self, codes: &[u8]) -> Result<Vec<f32>> {
        self.inner().decode(codes)
    }

    fn compute_distance(&self, query: &[f32], codes: &[u8]) -> Result<f32> {
        self.inner().compute_distance(query, codes)
    }

    fn code_size(&self) -> usize {
        self.inner().code_size()
    }

    fn dimension(&self) -> usize {
        self.inner().dimension()
    }
}

impl From<StructuredQuantizer> for QuantizationCodec {
    fn from(q: StructuredQuantizer) -> Self {
        QuantizationCodec::Structured(q)
    }
}

impl From<ProductQuantizer> for QuantizationCodec {
    fn from(q: ProductQuantizer) -> Self {
        QuantizationCodec::Product(q)
    }
}

impl From<PerceptualQuantizer> for QuantizationCodec {
    fn from(q: PerceptualQuantizer) -> Self {
        QuantizationCodec::Perceptual(q)
    }
}

impl From<ManifoldQuantizer> for QuantizationCodec {
    fn from(q: ManifoldQuantizer) -> Self {
        QuantizationCodec::Manifold(q)
    }
}

/// Per-query distance evaluator over codes of one codec.
pub enum CodeScorer<'a> {
    Pq(PqDistanceTable),
    Table(DistanceTable),
    Decode {
        codec: &'a QuantizationCodec,
        query: &'a [f32],
        metric: DistanceMetric,
    },
}

impl CodeScorer<'_> {
    /// Distance from the prepared query to `codes`. Codes that fail to
    /// decode score as infinitely far.
    #[inline]
    pub fn distance(&self, codes: &[u8]) -> f32 {
        match self {
            CodeScorer::Pq(table) => table.distance(codes),
            CodeScorer::Table(table) => table.distance(codes),
            CodeScorer::Decode {
                codec,
                query,
                metric,
            } => codec
                .decode(codes)
                .map_or(f32::INFINITY, |v| metric.distance(query, &v)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use tempfile::TempDir;

    fn data(n: usize, dim: usize) -> Vec<Vec<f32>> {
        let mut rng = StdRng::seed_from_u64(8);
        (0..n).map(|_| (0..dim).map(|_| rng.random::<f32>()).collect()).collect()
    }

    fn structured() -> QuantizationCodec {
        StructuredQuantizer::new(StructuredQuantizerConfig {
            dimension: 8,
            codebook_size: 32,
            num_iterations: 10,
            ..Default::default()
        })
        .unwrap()
        .into()
    }

    #[test]
    fn test_failed_training_keeps_previous_codebooks() {
        let mut codec = structured();
        let vectors = data(100, 8);
        codec.train(&vectors).unwrap();
        let before = codec.encode(&vectors[0]).unwrap();
        assert!(codec.train(&[vec![1.0; 3]]).is_err());
        assert!(codec.is_trained());
        assert_eq!(codec.encode(&vectors[0]).unwrap(), before);
    }

    #[test]
    fn test_scorer_matches_compute_distance() {
        let vectors = data(200, 8);
        let codecs: Vec<QuantizationCodec> = vec![
            structured(),
            ProductQuantizer::new(PqConfig {
                num_centroids: 16,
                ..PqConfig::new(8, 4)
            })
            .unwrap()
            .into(),
            ManifoldQuantizer::new(ManifoldQuantizerConfig {
                dimension: 8,
                total_bits: 48,
                ..Default::default()
            })
            .unwrap()
            .into(),
        ];
        for mut codec in codecs {
            codec.train(&vectors).unwrap();
            let scorer = codec.scorer(&vectors[0], DistanceMetric::SquaredEuclidean).unwrap();
            for v in vectors.iter().skip(1).take(10) {
                let codes = codec.encode(v).unwrap();
                let decoded = codec.decode(&codes).unwrap();
                let expected = DistanceMetric::SquaredEuclidean.distance(&vectors[0], &decoded);
                assert!(
                    (scorer.distance(&codes) - expected).abs() < 1e-4,
                    "{} scorer disagrees",
                    codec.kind()
                );
            }
        }
    }

    #[test]
    fn test_untrained_scorer() {
        let codec = structured();
        assert!(matches!(
            codec.scorer(&[0.0; 8], DistanceMetric::Cosine),
            Err(VdbError::NotTrained)
        ));
    }

    #[test]
    fn test_codec_save_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("codec.vdb");
        let vectors = data(100, 8);
        let mut codec = structured();
        codec.train(&vectors).unwrap();
        codec.save(&path).unwrap();

        let loaded = QuantizationCodec::load(&path).unwrap();
        assert_eq!(loaded.kind(), "structured");
        assert!(loaded.is_trained());
        for v in vectors.iter().take(5) {
            assert_eq!(codec.encode(v).unwrap(), loaded.encode(v).unwrap());
        }
    }
}
