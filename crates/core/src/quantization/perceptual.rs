//! Perceptual quantization of color vectors.
//!
//! A vector is read as consecutive RGB triples. Each triple passes through an
//! optional transfer curve and a color transform (RGB, CIE Lab or YCbCr),
//! which yields one lightness channel and two chroma channels. Lightness and
//! chroma are quantized by independent product quantizers so that the bit
//! budget can favor lightness, to which the eye is more sensitive.
//!
//! With `Rgb` the channels are left untouched and red occupies the lightness
//! slot.

use crate::config;
use crate::distance::{squared_euclidean, DistanceMetric};
use crate::error::{Result, VdbError};
use crate::pool::TaskPool;
use crate::quantization::curves::TransferCurve;
use crate::quantization::kmeans::flatten_checked;
use crate::quantization::pq::{PqConfig, ProductQuantizer};
use crate::quantization::Quantizer;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Color space vectors are quantized in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColorSpace {
    Rgb,
    #[default]
    Lab,
    YCbCr,
}

/// PQ codes are single bytes.
const MAX_CODE_BITS: u32 = 8;

/// Configuration of a [`PerceptualQuantizer`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerceptualQuantizerConfig {
    /// Must be a multiple of 3.
    pub dimension: usize,
    pub color_space: ColorSpace,
    pub separate_luma_chroma: bool,
    /// Bits per lightness code, at most 8 (one byte per subspace code).
    pub luma_bits: u32,
    /// Bits per chroma code, at most 8.
    pub chroma_bits: u32,
    pub transfer: TransferCurve,
    pub seed: u64,
    pub num_iterations: usize,
}

impl Default for PerceptualQuantizerConfig {
    fn default() -> Self {
        Self {
            dimension: 96,
            color_space: ColorSpace::Lab,
            separate_luma_chroma: true,
            luma_bits: 8,
            chroma_bits: 6,
            transfer: TransferCurve::Linear,
            seed: config::QUANT_DEFAULT_SEED,
            num_iterations: config::KMEANS_DEFAULT_ITERATIONS,
        }
    }
}

impl PerceptualQuantizerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.dimension == 0 || self.dimension % 3 != 0 || self.dimension > config::MAX_DIMENSION {
            return Err(VdbError::InvalidConfig(format!(
                "perceptual dimension must be a positive multiple of 3, got {}",
                self.dimension
            )));
        }
        if self.luma_bits == 0 || (self.separate_luma_chroma && self.chroma_bits == 0) {
            return Err(VdbError::InvalidConfig(
                "luma and chroma bit budgets must be positive".to_string(),
            ));
        }
        let chroma = if self.separate_luma_chroma { self.chroma_bits } else { 0 };
        if self.luma_bits > MAX_CODE_BITS || chroma > MAX_CODE_BITS {
            return Err(VdbError::InvalidConfig(format!(
                "luma and chroma bit budgets are at most {MAX_CODE_BITS}, got {} and {}",
                self.luma_bits, self.chroma_bits
            )));
        }
        Ok(())
    }

    /// Weight of chroma error relative to lightness error.
    pub fn chroma_weight(&self) -> f32 {
        if self.separate_luma_chroma {
            self.chroma_bits as f32 / self.luma_bits as f32
        } else {
            1.0
        }
    }

    fn pq_config(&self, len: usize, bits: u32, seed_offset: u64) -> PqConfig {
        PqConfig {
            dimension: len,
            num_subspaces: subspaces_for(len, bits),
            num_centroids: 1usize << bits,
            metric: DistanceMetric::SquaredEuclidean,
            num_iterations: self.num_iterations,
            seed: self.seed.wrapping_add(seed_offset),
        }
    }
}

/// Subspace count for a PQ over `len` components with a per-component budget
/// of `bits`: scalar subspaces at 8 bits and above, pairs below.
fn subspaces_for(len: usize, bits: u32) -> usize {
    let target = if bits >= 8 { len } else { (len / 2).max(1) };
    (1..=target).rev().find(|m| len % m == 0).unwrap_or(1)
}

// CIE Lab (D65) constants.
const XN: f32 = 0.950_47;
const YN: f32 = 1.0;
const ZN: f32 = 1.088_83;
const DELTA: f32 = 6.0 / 29.0;
const LAB_SCALE: f32 = 100.0;

fn lab_f(t: f32) -> f32 {
    if t > DELTA * DELTA * DELTA {
        t.cbrt()
    } else {
        t / (3.0 * DELTA * DELTA) + 4.0 / 29.0
    }
}

fn lab_f_inv(u: f32) -> f32 {
    if u > DELTA {
        u * u * u
    } else {
        3.0 * DELTA * DELTA * (u - 4.0 / 29.0)
    }
}

fn rgb_to_lab([r, g, b]: [f32; 3]) -> [f32; 3] {
    let x = 0.412_456_4 * r + 0.357_576_1 * g + 0.180_437_5 * b;
    let y = 0.212_672_9 * r + 0.715_152_2 * g + 0.072_175 * b;
    let z = 0.019_333_9 * r + 0.119_192 * g + 0.950_304_1 * b;
    let (fx, fy, fz) = (lab_f(x / XN), lab_f(y / YN), lab_f(z / ZN));
    [
        (116.0 * fy - 16.0) / LAB_SCALE,
        500.0 * (fx - fy) / LAB_SCALE,
        200.0 * (fy - fz) / LAB_SCALE,
    ]
}

fn lab_to_rgb([l, a, b]: [f32; 3]) -> [f32; 3] {
    let fy = (l * LAB_SCALE + 16.0) / 116.0;
    let fx = fy + a * LAB_SCALE / 500.0;
    let fz = fy - b * LAB_SCALE / 200.0;
    let (x, y, z) = (lab_f_inv(fx) * XN, lab_f_inv(fy) * YN, lab_f_inv(fz) * ZN);
    [
        3.240_454_2 * x - 1.537_138_5 * y - 0.498_531_4 * z,
        -0.969_266 * x + 1.876_010_8 * y + 0.041_556 * z,
        0.055_643_4 * x - 0.204_025_9 * y + 1.057_225_2 * z,
    ]
}

fn rgb_to_ycbcr([r, g, b]: [f32; 3]) -> [f32; 3] {
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    [y, (b - y) / 1.772, (r - y) / 1.402]
}

fn ycbcr_to_rgb([y, cb, cr]: [f32; 3]) -> [f32; 3] {
    let r = y + 1.402 * cr;
    let b = y + 1.772 * cb;
    let g = (y - 0.299 * r - 0.114 * b) / 0.587;
    [r, g, b]
}

impl ColorSpace {
    fn forward(self, rgb: [f32; 3]) -> [f32; 3] {
        match self {
            ColorSpace::Rgb => rgb,
            ColorSpace::Lab => rgb_to_lab(rgb),
            ColorSpace::YCbCr => rgb_to_ycbcr(rgb),
        }
    }

    fn inverse(self, c: [f32; 3]) -> [f32; 3] {
        match self {
            ColorSpace::Rgb => c,
            ColorSpace::Lab => lab_to_rgb(c),
            ColorSpace::YCbCr => ycbcr_to_rgb(c),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum PerceptualCodebooks {
    Split {
        luma: ProductQuantizer,
        chroma: ProductQuantizer,
    },
    Joint(ProductQuantizer),
}

/// Quantizer for RGB-triple vectors in a perceptual color space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerceptualQuantizer {
    config: PerceptualQuantizerConfig,
    codebooks: Option<PerceptualCodebooks>,
    #[serde(skip)]
    pool: Option<Arc<TaskPool>>,
}

impl PerceptualQuantizer {
    pub fn new(config: PerceptualQuantizerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            codebooks: None,
            pool: None,
        })
    }

    pub fn with_pool(mut self, pool: Arc<TaskPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn config(&self) -> &PerceptualQuantizerConfig {
        &self.config
    }

    /// Curve + color transform, channel-interleaved like the input.
    fn to_perceptual(&self, rgb: &[f32]) -> Vec<f32> {
        let mut linear = rgb.to_vec();
        self.config.transfer.encode_slice(&mut linear);
        let mut out = Vec::with_capacity(rgb.len());
        for px in linear.chunks_exact(3) {
            out.extend_from_slice(&self.config.color_space.forward([px[0], px[1], px[2]]));
        }
        out
    }

    fn from_perceptual(&self, perceptual: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(perceptual.len());
        for px in perceptual.chunks_exact(3) {
            out.extend_from_slice(&self.config.color_space.inverse([px[0], px[1], px[2]]));
        }
        self.config.transfer.decode_slice(&mut out);
        out
    }

    /// Split interleaved channels into (lightness, chroma pairs).
    fn split(perceptual: &[f32]) -> (Vec<f32>, Vec<f32>) {
        let pixels = perceptual.len() / 3;
        let mut luma = Vec::with_capacity(pixels);
        let mut chroma = Vec::with_capacity(pixels * 2);
        for px in perceptual.chunks_exact(3) {
            luma.push(px[0]);
            chroma.extend_from_slice(&px[1..3]);
        }
        (luma, chroma)
    }

    fn combine(luma: &[f32], chroma: &[f32]) -> Vec<f32> {
        let mut out = Vec::with_capacity(luma.len() * 3);
        for (l, c) in luma.iter().zip(chroma.chunks_exact(2)) {
            out.extend_from_slice(&[*l, c[0], c[1]]);
        }
        out
    }

    fn codebooks(&self) -> Result<&PerceptualCodebooks> {
        self.codebooks.as_ref().ok_or(VdbError::NotTrained)
    }

    fn make_pq(&self, cfg: PqConfig) -> Result<ProductQuantizer> {
        let pq = ProductQuantizer::new(cfg)?;
        Ok(match &self.pool {
            Some(pool) => pq.with_pool(Arc::clone(pool)),
            None => pq,
        })
    }

    /// Squared distance between two color vectors in the perceptual space,
    /// with chroma error weighted by `chroma_bits / luma_bits`.
    pub fn compute_perceptual_distance(&self, a: &[f32], b: &[f32]) -> Result<f32> {
        VdbError::check_dimension(self.config.dimension, a.len())?;
        VdbError::check_dimension(self.config.dimension, b.len())?;
        let (la, ca) = Self::split(&self.to_perceptual(a));
        let (lb, cb) = Self::split(&self.to_perceptual(b));
        Ok(squared_euclidean(&la, &lb) + self.config.chroma_weight() * squared_euclidean(&ca, &cb))
    }
}

impl Quantizer for PerceptualQuantizer {
    fn train(&mut self, vectors: &[Vec<f32>]) -> Result<()> {
        self.config.validate()?;
        let dim = self.config.dimension;
        let arena = flatten_checked(vectors, dim)?;
        let pixels = dim / 3;

        let codebooks = if self.config.separate_luma_chroma {
            let mut luma_arena = Vec::with_capacity(vectors.len() * pixels);
            let mut chroma_arena = Vec::with_capacity(vectors.len() * pixels * 2);
            for v in arena.chunks_exact(dim) {
                let (l, c) = Self::split(&self.to_perceptual(v));
                luma_arena.extend(l);
                chroma_arena.extend(c);
            }
            let mut luma = self.make_pq(self.config.pq_config(pixels, self.config.luma_bits, 0))?;
            luma.train_arena(&luma_arena)?;
            let mut chroma =
                self.make_pq(self.config.pq_config(pixels * 2, self.config.chroma_bits, 1_000))?;
            chroma.train_arena(&chroma_arena)?;
            PerceptualCodebooks::Split { luma, chroma }
        } else {
            let mut joint_arena = Vec::with_capacity(arena.len());
            for v in arena.chunks_exact(dim) {
                joint_arena.extend(self.to_perceptual(v));
            }
            let mut joint = self.make_pq(self.config.pq_config(dim, self.config.luma_bits, 0))?;
            joint.train_arena(&joint_arena)?;
            PerceptualCodebooks::Joint(joint)
        };

        self.codebooks = Some(codebooks);
        tracing::info!(
            "Trained perceptual quantizer on {} vectors ({:?}, code size {} bytes)",
            vectors.len(),
            self.config.color_space,
            self.code_size()
        );
        Ok(())
    }

    fn is_trained(&self) -> bool {
        self.codebooks.is_some()
    }

    fn encode(&self, vector: &[f32]) -> Result<Vec<u8>> {
        let codebooks = self.codebooks()?;
        VdbError::check_dimension(self.config.dimension, vector.len())?;
        let perceptual = self.to_perceptual(vector);
        match codebooks {
            PerceptualCodebooks::Split { luma, chroma } => {
                let (l, c) = Self::split(&perceptual);
                let mut codes = luma.encode(&l)?;
                codes.extend(chroma.encode(&c)?);
                Ok(codes)
            }
            PerceptualCodebooks::Joint(joint) => joint.encode(&perceptual),
        }
    }

    fn decode(&self, codes: &[u8]) -> Result<Vec<f32>> {
        let codebooks = self.codebooks()?;
        let expected = self.code_size();
        if codes.len() != expected {
            return Err(VdbError::InvalidCode {
                expected,
                actual: codes.len(),
            });
        }
        let perceptual = match codebooks {
            PerceptualCodebooks::Split { luma, chroma } => {
                let (lc, cc) = codes.split_at(luma.code_size());
                Self::combine(&luma.decode(lc)?, &chroma.decode(cc)?)
            }
            PerceptualCodebooks::Joint(joint) => joint.decode(codes)?,
        };
        Ok(self.from_perceptual(&perceptual))
    }

    fn compute_distance(&self, query: &[f32], codes: &[u8]) -> Result<f32> {
        let decoded = self.decode(codes)?;
        self.compute_perceptual_distance(query, &decoded)
    }

    fn code_size(&self) -> usize {
        let pixels = self.config.dimension / 3;
        if self.config.separate_luma_chroma {
            subspaces_for(pixels, self.config.luma_bits)
                + subspaces_for(pixels * 2, self.config.chroma_bits)
        } else {
            subspaces_for(self.config.dimension, self.config.luma_bits)
        }
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }
}
