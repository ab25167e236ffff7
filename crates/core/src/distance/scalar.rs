//! Scalar reference kernels.
//!
//! Plain loops with no vector intrinsics. These are the fallback on platforms
//! without AVX2/NEON and the correctness oracle the SIMD kernels are tested
//! against.

use crate::config::COSINE_EPSILON;

/// Dot product of two f32 slices.
pub fn dot_product(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let mut sum = 0.0f32;
    for i in 0..len {
        sum += a[i] * b[i];
    }
    sum
}

/// Squared Euclidean distance between two f32 slices.
pub fn squared_euclidean(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let mut sum = 0.0f32;
    for i in 0..len {
        let d = a[i] - b[i];
        sum += d * d;
    }
    sum
}

/// Cosine similarity in \[-1, 1\]. Returns 0.0 when either norm is ~0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for i in 0..len {
        dot += a[i] * b[i];
        norm_a += a[i] * a[i];
        norm_b += b[i] * b[i];
    }
    finish_cosine(dot, norm_a, norm_b)
}

/// Combine accumulated dot and squared norms into a cosine similarity.
#[inline]
pub(crate) fn finish_cosine(dot: f32, norm_a_sq: f32, norm_b_sq: f32) -> f32 {
    let norm_a = norm_a_sq.sqrt();
    let norm_b = norm_b_sq.sqrt();
    if norm_a < COSINE_EPSILON || norm_b < COSINE_EPSILON {
        return 0.0;
    }
    (dot / (norm_a * norm_b)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_product() {
        assert_eq!(dot_product(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]), 32.0);
    }

    #[test]
    fn test_squared_euclidean() {
        assert_eq!(squared_euclidean(&[0.0, 0.0], &[3.0, 4.0]), 25.0);
    }

    #[test]
    fn test_cosine_zero_vector() {
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_cosine_parallel() {
        let s = cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]);
        assert!((s - 1.0).abs() < 1e-6);
    }
}
