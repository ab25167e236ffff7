//! Hybrid search fusion strategies.
//!
//! Combines dense (vector) results and lexical (BM25) results into a single
//! ranked list. Both sides are rescaled to `[0, 1]` before combination:
//! BM25 scores by min-max, dense scores by min-max with the lower bound
//! clamped to at most zero. Non-negative dense lists therefore scale by their
//! maximum and keep their distance from zero, while negative cosine or
//! unbounded dot-product scores are pulled into range. A list whose range is
//! degenerate normalizes to 1.0. Strategies:
//! - **Weighted**: `dense_weight * d + lexical_weight * l`, one-sided ids
//!   scaled by `unmatched_penalty`
//! - **RRF** (Reciprocal Rank Fusion): `sum(1 / (k + rank))`
//! - **CombSum** / **CombMNZ**: score sum, MNZ multiplied by the number of
//!   lists holding the id
//! - **Borda**: `len - rank + 1` points per list

use crate::bm25::{LexicalEngine, LexicalHit};
use crate::config;
use crate::error::{Result, VdbError};
use crate::pool::TaskPool;
use crate::search::{DenseIndex, SearchResult};
use crate::VectorId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;

/// How dense and lexical lists are combined.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum FusionMethod {
    #[default]
    Weighted,
    Rrf {
        k: f32,
    },
    CombSum,
    CombMnz,
    Borda,
}

impl FusionMethod {
    /// RRF with the standard `k = 60`.
    pub fn rrf() -> Self {
        FusionMethod::Rrf { k: config::RRF_K }
    }
}

/// Weights and policy for [`fuse`]. Weights and the penalty only apply to
/// [`FusionMethod::Weighted`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub dense_weight: f32,
    pub lexical_weight: f32,
    /// Multiplier for ids found by only one side; 1.0 leaves them unpenalized.
    pub unmatched_penalty: f32,
    pub method: FusionMethod,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            dense_weight: config::FUSION_DENSE_WEIGHT,
            lexical_weight: config::FUSION_LEXICAL_WEIGHT,
            unmatched_penalty: 1.0,
            method: FusionMethod::Weighted,
        }
    }
}

impl FusionConfig {
    pub fn validate(&self) -> Result<()> {
        let weights = [self.dense_weight, self.lexical_weight, self.unmatched_penalty];
        if weights.iter().any(|w| !w.is_finite() || *w < 0.0) {
            return Err(VdbError::InvalidConfig(
                "fusion weights and penalty must be finite and non-negative".to_string(),
            ));
        }
        if let FusionMethod::Rrf { k } = self.method {
            if !(k.is_finite() && k > 0.0) {
                return Err(VdbError::InvalidConfig(format!("rrf k must be positive, got {k}")));
            }
        }
        Ok(())
    }
}

/// One fused hit. Ranks are 1-based positions in the input lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusedResult {
    pub id: VectorId,
    pub score: f32,
    /// Dense score as produced by the index metric.
    pub dense_score: Option<f32>,
    /// Raw BM25 score.
    pub lexical_score: Option<f32>,
    pub dense_rank: Option<usize>,
    pub lexical_rank: Option<usize>,
}

/// `(rank, raw, normalized)` per side.
#[derive(Default)]
struct Sides {
    dense: Option<(usize, f32, f32)>,
    lexical: Option<(usize, f32, f32)>,
}

/// Maps `score` into `[0, 1]` given the list's `(lo, hi)` bounds.
fn rescale(score: f32, lo: f32, hi: f32) -> f32 {
    let range = hi - lo;
    if range.is_nan() || range < f32::EPSILON {
        1.0
    } else {
        ((score - lo) / range).clamp(0.0, 1.0)
    }
}

fn bounds(scores: impl Iterator<Item = f32>) -> (f32, f32) {
    scores.fold((f32::MAX, f32::MIN), |(lo, hi), s| (lo.min(s), hi.max(s)))
}

/// Fuse two best-first lists into at most `k` results.
///
/// Ties on the fused score go to the better dense rank (ids without one come
/// after every dense id), then to the lower id.
pub fn fuse(dense: &[SearchResult], lexical: &[LexicalHit], k: usize, config: &FusionConfig) -> Vec<FusedResult> {
    if k == 0 {
        return Vec::new();
    }
    let mut sides: HashMap<VectorId, Sides> = HashMap::with_capacity(dense.len() + lexical.len());

    let (lo, hi) = bounds(dense.iter().map(|r| r.score));
    let lo = lo.min(0.0);
    for (i, r) in dense.iter().enumerate() {
        let entry = sides.entry(r.id).or_default();
        if entry.dense.is_none() {
            entry.dense = Some((i + 1, r.score, rescale(r.score, lo, hi)));
        }
    }

    let (lo, hi) = bounds(lexical.iter().map(|h| h.score));
    for (i, h) in lexical.iter().enumerate() {
        let norm = rescale(h.score, lo, hi);
        let entry = sides.entry(h.id).or_default();
        if entry.lexical.is_none() {
            entry.lexical = Some((i + 1, h.score, norm));
        }
    }

    let dense_len = dense.len() as f32;
    let lexical_len = lexical.len() as f32;
    let mut results: Vec<FusedResult> = sides
        .into_iter()
        .map(|(id, s)| {
            let d = s.dense.map(|(_, _, norm)| norm);
            let l = s.lexical.map(|(_, _, norm)| norm);
            let score = match config.method {
                FusionMethod::Weighted => match (d, l) {
                    (Some(d), Some(l)) => config.dense_weight * d + config.lexical_weight * l,
                    (Some(d), None) => config.dense_weight * d * config.unmatched_penalty,
                    (None, Some(l)) => config.lexical_weight * l * config.unmatched_penalty,
                    (None, None) => 0.0,
                },
                FusionMethod::Rrf { k } => {
                    let dense_rrf = s.dense.map_or(0.0, |(rank, _, _)| 1.0 / (k + rank as f32));
                    let lexical_rrf = s.lexical.map_or(0.0, |(rank, _, _)| 1.0 / (k + rank as f32));
                    dense_rrf + lexical_rrf
                }
                FusionMethod::CombSum => d.unwrap_or(0.0) + l.unwrap_or(0.0),
                FusionMethod::CombMnz => {
                    let hits = d.is_some() as u8 + l.is_some() as u8;
                    (d.unwrap_or(0.0) + l.unwrap_or(0.0)) * hits as f32
                }
                FusionMethod::Borda => {
                    let dense_points = s.dense.map_or(0.0, |(rank, _, _)| dense_len - rank as f32 + 1.0);
                    let lexical_points = s
                        .lexical
                        .map_or(0.0, |(rank, _, _)| lexical_len - rank as f32 + 1.0);
                    dense_points + lexical_points
                }
            };
            FusedResult {
                id,
                score,
                dense_score: s.dense.map(|(_, raw, _)| raw),
                lexical_score: s.lexical.map(|(_, raw, _)| raw),
                dense_rank: s.dense.map(|(rank, _, _)| rank),
                lexical_rank: s.lexical.map(|(rank, _, _)| rank),
            }
        })
        .collect();

    results.sort_by(compare_fused);
    results.truncate(k);
    results
}

fn compare_fused(a: &FusedResult, b: &FusedResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| match (a.dense_rank, b.dense_rank) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then(a.id.cmp(&b.id))
}

fn empty_query() -> VdbError {
    VdbError::EmptyInput("hybrid query has neither vector nor text".to_string())
}

/// A hybrid query: a dense vector, a text query, or both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HybridQuery {
    pub vector: Option<Vec<f32>>,
    pub text: Option<String>,
}

impl HybridQuery {
    pub fn dense(vector: Vec<f32>) -> Self {
        Self {
            vector: Some(vector),
            text: None,
        }
    }

    pub fn lexical(text: impl Into<String>) -> Self {
        Self {
            vector: None,
            text: Some(text.into()),
        }
    }

    pub fn both(vector: Vec<f32>, text: impl Into<String>) -> Self {
        Self {
            vector: Some(vector),
            text: Some(text.into()),
        }
    }
}

/// Runs dense and lexical retrieval over shared indexes and fuses the lists.
pub struct HybridSearcher {
    dense: Arc<dyn DenseIndex>,
    lexical: Arc<LexicalEngine>,
    pool: Arc<TaskPool>,
    config: FusionConfig,
}

impl std::fmt::Debug for HybridSearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HybridSearcher")
            .field("dimension", &self.dense.dimension())
            .field("documents", &self.lexical.document_count())
            .field("config", &self.config)
            .finish()
    }
}

impl HybridSearcher {
    pub fn new(
        dense: Arc<dyn DenseIndex>,
        lexical: Arc<LexicalEngine>,
        pool: Arc<TaskPool>,
        config: FusionConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            dense,
            lexical,
            pool,
            config,
        })
    }

    pub fn config(&self) -> &FusionConfig {
        &self.config
    }

    /// Fused top `k` for `query`. Each side over-fetches before fusion; when
    /// both sides are present they run as a pool join.
    pub fn search(&self, query: &HybridQuery, k: usize) -> Result<Vec<FusedResult>> {
        if query.vector.is_none() && query.text.is_none() {
            return Err(empty_query());
        }
        if let Some(vector) = &query.vector {
            VdbError::check_dimension(self.dense.dimension(), vector.len())?;
        }
        if k == 0 {
            return Ok(Vec::new());
        }
        let fetch = k.saturating_mul(config::FUSION_OVERFETCH).min(config::MAX_K);

        let (dense, lexical) = match (&query.vector, &query.text) {
            (Some(vector), Some(text)) => {
                let (dense, lexical) = self.pool.join(
                    || self.dense.search_dense(vector, fetch),
                    || self.lexical.search(text, fetch, 0.0),
                );
                (dense?, lexical?)
            }
            (Some(vector), None) => (self.dense.search_dense(vector, fetch)?, Vec::new()),
            (None, Some(text)) => (Vec::new(), self.lexical.search(text, fetch, 0.0)?),
            (None, None) => return Err(empty_query()),
        };

        Ok(fuse(&dense, &lexical, k, &self.config))
    }
}
