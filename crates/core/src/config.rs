//! Global configuration constants for vdb-core.
//!
//! All tuning defaults and input validation limits are defined here. Runtime
//! configuration is carried by the plain value structs of each component
//! (`HnswConfig`, `Bm25Config`, `FusionConfig`, the quantizer configs), whose
//! `Default` impls read from these constants.

/// BM25 Okapi term frequency saturation parameter.
///
/// Controls how quickly term frequency saturates. Higher values allow TF to grow more.
/// Standard value is 1.2 (range: 1.0–2.0).
pub const BM25_K1: f32 = 1.2;

/// BM25 Okapi document length normalization parameter.
///
/// Controls the impact of document length on scoring. 0.0 = no normalization,
/// 1.0 = full normalization. Standard value is 0.75.
pub const BM25_B: f32 = 0.75;

/// Minimum token length (in characters) kept by the BM25 tokenizer.
pub const BM25_MIN_TERM_LENGTH: usize = 2;

/// Default number of bidirectional links per HNSW node.
///
/// Higher values improve recall but increase memory and build time.
/// Typical range: 8–64. Default: 16.
pub const HNSW_DEFAULT_M: usize = 16;

/// Default ef parameter during HNSW index construction.
///
/// Controls the size of the dynamic candidate list during insertion.
/// Higher values produce a better graph but slow down build time.
pub const HNSW_DEFAULT_EF_CONSTRUCTION: usize = 200;

/// Default ef parameter during HNSW search.
///
/// Controls the size of the dynamic candidate list during query.
/// Higher values improve recall at the cost of latency.
pub const HNSW_DEFAULT_EF_SEARCH: usize = 100;

/// Maximum number of layers in the HNSW graph.
pub const HNSW_DEFAULT_MAX_LAYERS: usize = 16;

/// Default seed for HNSW level generation.
pub const HNSW_DEFAULT_SEED: u64 = 42;

/// Reciprocal Rank Fusion (RRF) constant `k`.
///
/// Used in the formula `1 / (k + rank)` to combine ranked lists.
/// Standard value is 60.0 (from the original RRF paper).
pub const RRF_K: f32 = 60.0;

/// Hybrid search fetches `k * FUSION_OVERFETCH` candidates from each side
/// before fusing, so ids ranked just outside one list can still be confirmed
/// by the other.
pub const FUSION_OVERFETCH: usize = 3;

/// Default weight of the dense score in weighted fusion.
pub const FUSION_DENSE_WEIGHT: f32 = 0.5;

/// Default weight of the lexical score in weighted fusion.
pub const FUSION_LEXICAL_WEIGHT: f32 = 0.5;

/// Norm below which cosine similarity is defined as 0.0.
pub const COSINE_EPSILON: f32 = 1e-12;

/// Collections at or above this size are scanned in parallel by `FlatIndex`.
pub const FLAT_PARALLEL_THRESHOLD: usize = 4_096;

/// Maximum allowed embedding dimension.
pub const MAX_DIMENSION: usize = 4096;

/// Maximum number of results (`k`) per search request.
pub const MAX_K: usize = 10_000;

/// Default number of centroids in a structured quantizer codebook.
pub const QUANT_DEFAULT_CODEBOOK_SIZE: usize = 256;

/// Largest codebook a structured quantizer accepts (16-bit codes).
pub const QUANT_MAX_CODEBOOK_SIZE: usize = 65_536;

/// Default number of k-means iterations when training codebooks.
pub const KMEANS_DEFAULT_ITERATIONS: usize = 25;

/// Default convergence threshold on maximum squared centroid movement.
pub const KMEANS_DEFAULT_CONVERGENCE: f32 = 1e-4;

/// Default seed for quantizer training.
pub const QUANT_DEFAULT_SEED: u64 = 42;

/// Number of centroids per PQ subspace (u8 codes).
pub const PQ_NUM_CENTROIDS: usize = 256;

/// Power-iteration rounds per principal component in the manifold quantizer.
pub const MANIFOLD_POWER_ITERATIONS: usize = 64;
