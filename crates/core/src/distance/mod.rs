//! Distance computation layer.
//!
//! Supports four metrics: cosine, Euclidean (L2), squared Euclidean, and dot
//! product. Every metric is expressed as a distance where **lower is better**.
//! The metric is resolved once per call into a plain function pointer, so the
//! inner loops of batch scans never branch on the metric.
//!
//! Kernels never fail. Length validation is the job of the index layer; the
//! kernels only read the common prefix of their two inputs.

/// Scalar reference kernels (correctness oracle and portable fallback).
pub mod scalar;
/// NEON / AVX2+FMA kernels with runtime selection.
pub mod simd;

use crate::search::SearchResult;
use crate::VectorId;
use ordered_float::OrderedFloat;
use serde::{Deserialize, Serialize};
use std::collections::BinaryHeap;

pub use simd::{kernels, Kernels};

/// Distance metric used for vector similarity computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DistanceMetric {
    /// Cosine distance: `1 - cosine_similarity`. Range: \[0, 2\].
    #[default]
    Cosine,
    /// Euclidean (L2) distance. Range: \[0, ∞).
    Euclidean,
    /// Squared Euclidean distance (L2²). Range: \[0, ∞).
    SquaredEuclidean,
    /// Negative dot product: `-dot(a, b)`. Lower = higher similarity.
    DotProduct,
}

/// Dot product of two vectors using the widest available kernel.
#[inline]
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    (kernels().dot_product)(a, b)
}

/// Squared Euclidean distance using the widest available kernel.
#[inline]
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    (kernels().squared_euclidean)(a, b)
}

/// Euclidean distance.
#[inline]
pub fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    squared_euclidean(a, b).sqrt()
}

/// Cosine similarity in \[-1, 1\]. Near-zero norms yield 0.0, never NaN.
#[inline]
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    debug_assert_eq!(a.len(), b.len());
    (kernels().cosine_similarity)(a, b)
}

/// Cosine distance: `1 - cosine_similarity`.
#[inline]
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    1.0 - cosine_similarity(a, b)
}

/// Negative dot product, the "lower is better" form of inner product.
#[inline]
fn neg_dot_product(a: &[f32], b: &[f32]) -> f32 {
    -dot_product(a, b)
}

/// L2 norm (magnitude) of a vector.
pub fn l2_norm(v: &[f32]) -> f32 {
    dot_product(v, v).sqrt()
}

/// Normalize a vector to unit length in place. Near-zero vectors are left untouched.
pub fn normalize(v: &mut [f32]) {
    let norm = l2_norm(v);
    if norm > crate::config::COSINE_EPSILON {
        let inv = 1.0 / norm;
        for x in v.iter_mut() {
            *x *= inv;
        }
    }
}

/// Returns a unit-length copy of `v`.
pub fn normalized(v: &[f32]) -> Vec<f32> {
    let mut out = v.to_vec();
    normalize(&mut out);
    out
}

impl DistanceMetric {
    /// Resolve this metric into a distance kernel. Call once, outside hot loops.
    #[inline]
    pub fn kernel(self) -> fn(&[f32], &[f32]) -> f32 {
        match self {
            DistanceMetric::Cosine => cosine_distance,
            DistanceMetric::Euclidean => euclidean,
            DistanceMetric::SquaredEuclidean => squared_euclidean,
            DistanceMetric::DotProduct => neg_dot_product,
        }
    }

    /// Distance between two vectors under this metric.
    #[inline]
    pub fn distance(self, a: &[f32], b: &[f32]) -> f32 {
        (self.kernel())(a, b)
    }

    /// Distances from `query` to every `dim`-sized vector in a contiguous arena.
    pub fn batch_distance(self, query: &[f32], arena: &[f32], dim: usize) -> Vec<f32> {
        if dim == 0 {
            return Vec::new();
        }
        let kernel = self.kernel();
        arena.chunks_exact(dim).map(|v| kernel(query, v)).collect()
    }

    /// Distances from `query` to each target vector.
    pub fn batch_distance_slices<V: AsRef<[f32]>>(self, query: &[f32], targets: &[V]) -> Vec<f32> {
        let kernel = self.kernel();
        targets.iter().map(|v| kernel(query, v.as_ref())).collect()
    }

    /// Monotone "higher is better" score for a distance under this metric.
    ///
    /// Cosine: `1 - distance` (the similarity). Dot product: `-distance` (the
    /// raw inner product). Euclidean variants: `1 / (1 + distance)`.
    #[inline]
    pub fn score(self, distance: f32) -> f32 {
        match self {
            DistanceMetric::Cosine => 1.0 - distance,
            DistanceMetric::DotProduct => -distance,
            DistanceMetric::Euclidean | DistanceMetric::SquaredEuclidean => {
                1.0 / (1.0 + distance)
            }
        }
    }

    /// Human-readable metric name.
    pub fn name(self) -> &'static str {
        match self {
            DistanceMetric::Cosine => "cosine",
            DistanceMetric::Euclidean => "euclidean",
            DistanceMetric::SquaredEuclidean => "squared_euclidean",
            DistanceMetric::DotProduct => "dot_product",
        }
    }
}

/// Exact k nearest neighbors of `query` among `(id, vector)` pairs.
///
/// Results are ordered best-first; ties are broken by ascending id.
pub fn brute_force_knn<V: AsRef<[f32]>>(
    query: &[f32],
    vectors: &[(VectorId, V)],
    k: usize,
    metric: DistanceMetric,
) -> Vec<SearchResult> {
    if k == 0 {
        return Vec::new();
    }
    let kernel = metric.kernel();
    let mut heap: BinaryHeap<(OrderedFloat<f32>, VectorId)> = BinaryHeap::with_capacity(k + 1);
    for (id, v) in vectors {
        let d = OrderedFloat(kernel(query, v.as_ref()));
        if heap.len() < k {
            heap.push((d, *id));
        } else if let Some(worst) = heap.peek() {
            if (d, *id) < *worst {
                heap.pop();
                heap.push((d, *id));
            }
        }
    }
    heap.into_sorted_vec()
        .into_iter()
        .map(|(d, id)| SearchResult::new(id, d.0, metric))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_cosine_identical_is_zero() {
        let a = [1.0, 2.0, 3.0, 4.0];
        assert!(DistanceMetric::Cosine.distance(&a, &a).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let d = DistanceMetric::Cosine.distance(&[1.0, 0.0, 0.0], &[0.0, 1.0, 0.0]);
        assert!((d - 1.0).abs() < 1e-6, "orthogonal cosine distance = 1.0, got {d}");
    }

    #[test]
    fn test_cosine_zero_norm_is_defined() {
        let d = DistanceMetric::Cosine.distance(&[0.0, 0.0, 0.0], &[1.0, 2.0, 3.0]);
        assert_eq!(d, 1.0);
        assert!(!d.is_nan());
    }

    #[test]
    fn test_euclidean_variants() {
        let a = [0.0, 0.0, 0.0];
        let b = [3.0, 4.0, 0.0];
        assert!((DistanceMetric::SquaredEuclidean.distance(&a, &b) - 25.0).abs() < 1e-5);
        assert!((DistanceMetric::Euclidean.distance(&a, &b) - 5.0).abs() < 1e-5);
    }

    #[test]
    fn test_dot_product_distance() {
        let d = DistanceMetric::DotProduct.distance(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]);
        assert!((d + 32.0).abs() < 1e-5, "negative dot product should be -32, got {d}");
    }

    #[test]
    fn test_scores_are_higher_for_closer() {
        for metric in [
            DistanceMetric::Cosine,
            DistanceMetric::Euclidean,
            DistanceMetric::SquaredEuclidean,
            DistanceMetric::DotProduct,
        ] {
            assert!(metric.score(0.1) > metric.score(0.5), "{}", metric.name());
        }
    }

    #[test]
    fn test_batch_distance_matches_single() {
        let arena = [1.0, 0.0, 0.0, 1.0, 0.5, 0.5];
        let q = [1.0, 0.0];
        let ds = DistanceMetric::SquaredEuclidean.batch_distance(&q, &arena, 2);
        assert_eq!(ds.len(), 3);
        assert!((ds[0] - 0.0).abs() < 1e-6);
        assert!((ds[1] - 2.0).abs() < 1e-6);
        assert!((ds[2] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_normalize() {
        let v = normalized(&[3.0, 4.0]);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
        let mut z = [0.0, 0.0];
        normalize(&mut z);
        assert_eq!(z, [0.0, 0.0]);
    }

    #[test]
    fn test_brute_force_knn_order() {
        let vectors = vec![(1u64, vec![1.0, 0.0]), (2, vec![0.0, 1.0]), (3, vec![0.9, 0.1])];
        let res = brute_force_knn(&[1.0, 0.0], &vectors, 2, DistanceMetric::Cosine);
        assert_eq!(res.iter().map(|r| r.id).collect::<Vec<_>>(), vec![1, 3]);
    }

    fn reference(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
        match metric {
            DistanceMetric::Cosine => 1.0 - scalar::cosine_similarity(a, b),
            DistanceMetric::Euclidean => scalar::squared_euclidean(a, b).sqrt(),
            DistanceMetric::SquaredEuclidean => scalar::squared_euclidean(a, b),
            DistanceMetric::DotProduct => -scalar::dot_product(a, b),
        }
    }

    proptest! {
        #[test]
        fn prop_kernels_match_scalar_reference(
            pairs in (1usize..300).prop_flat_map(|n| (
                prop::collection::vec(-1.0f32..1.0f32, n),
                prop::collection::vec(-1.0f32..1.0f32, n),
            ))
        ) {
            let (a, b) = pairs;
            for metric in [
                DistanceMetric::Cosine,
                DistanceMetric::Euclidean,
                DistanceMetric::SquaredEuclidean,
                DistanceMetric::DotProduct,
            ] {
                let fast = metric.distance(&a, &b);
                let slow = reference(metric, &a, &b);
                let tol = 1e-4 * slow.abs().max(1.0);
                prop_assert!((fast - slow).abs() < tol, "{}: {} vs {}", metric.name(), fast, slow);
                let batch = metric.batch_distance(&a, &b, b.len());
                prop_assert!((batch[0] - slow).abs() < tol);
            }
        }
    }
}
