//! # vdb-core
//!
//! Embeddable vector retrieval engine: SIMD distance kernels, an exact flat
//! index and an HNSW graph index, vector quantization codecs, BM25 lexical
//! search, and hybrid fusion of dense and lexical rankings.
//!
//! Every public operation is synchronous. Parallel work (large flat scans,
//! batch graph search, codec training) fans out over an explicitly owned
//! [`TaskPool`] that callers create and share.

/// BM25 full-text search: inverted index, Okapi BM25 scoring, and tokenizer.
pub mod bm25;
/// Global configuration constants: limits, defaults, and tuning parameters.
pub mod config;
/// Distance metrics with scalar and SIMD kernels.
pub mod distance;
/// Error type shared by every component.
pub mod error;
/// Exact brute-force k-NN index.
pub mod flat;
/// HNSW approximate nearest neighbor index: graph structure, search, and insertion.
pub mod hnsw;
/// Fixed-size worker pool with blocking fan-out helpers.
pub mod pool;
/// Vector quantization codecs: structured, product, perceptual, and manifold.
pub mod quantization;
/// Search primitives: scored results, the dense index trait, and hybrid fusion.
pub mod search;
/// Storage layer: checksummed snapshots with atomic writes.
pub mod storage;

/// Caller-owned vector and document identifier.
pub type VectorId = u64;

pub use bm25::{Bm25Config, LexicalEngine, LexicalHit};
pub use distance::DistanceMetric;
pub use error::{ErrorKind, Result, VdbError};
pub use flat::FlatIndex;
pub use hnsw::{GraphIndex, GraphStats, HnswConfig};
pub use pool::{TaskHandle, TaskPool};
pub use quantization::{QuantizationCodec, Quantizer};
pub use search::{
    fuse, DenseIndex, FusedResult, FusionConfig, FusionMethod, HybridQuery, HybridSearcher,
    SearchResult,
};
