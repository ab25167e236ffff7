//! Search primitives: scored results, the dense index seam, and hybrid fusion.

/// Dense/lexical fusion and the hybrid searcher.
pub mod hybrid;
/// Scored result types.
pub mod types;

pub use hybrid::{fuse, FusedResult, FusionConfig, FusionMethod, HybridQuery, HybridSearcher};
pub(crate) use types::sort_results;
pub use types::SearchResult;

use crate::distance::DistanceMetric;
use crate::error::Result;

/// An index that answers k-NN queries over dense vectors.
///
/// Implemented by [`crate::flat::FlatIndex`] and [`crate::hnsw::GraphIndex`]
/// so a [`HybridSearcher`] can run over either.
pub trait DenseIndex: Send + Sync {
    fn dimension(&self) -> usize;

    fn metric(&self) -> DistanceMetric;

    /// Best `k` results, best first.
    fn search_dense(&self, query: &[f32], k: usize) -> Result<Vec<SearchResult>>;
}
