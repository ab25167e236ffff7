//! SIMD-accelerated f32 kernels.
//!
//! Provides NEON (aarch64) and AVX2+FMA (x86_64) implementations of dot
//! product, squared Euclidean distance and cosine similarity. The widest
//! available implementation is selected once per process and cached in
//! [`kernels`]; platforms without either instruction set use the scalar
//! reference kernels.
//!
//! All kernels read `min(a.len(), b.len())` elements, so mismatched inputs
//! can never read out of bounds.

use super::scalar;
use std::sync::OnceLock;

/// Resolved kernel function pointers for the running CPU.
#[derive(Clone, Copy)]
pub struct Kernels {
    pub dot_product: fn(&[f32], &[f32]) -> f32,
    pub squared_euclidean: fn(&[f32], &[f32]) -> f32,
    pub cosine_similarity: fn(&[f32], &[f32]) -> f32,
    /// Name of the selected instruction set, for diagnostics.
    pub level: &'static str,
}

static KERNELS: OnceLock<Kernels> = OnceLock::new();

/// Returns the kernels for the running CPU, detecting features on first use.
#[inline]
pub fn kernels() -> &'static Kernels {
    KERNELS.get_or_init(detect)
}

/// The scalar kernel set, always available.
pub const SCALAR: Kernels = Kernels {
    dot_product: scalar::dot_product,
    squared_euclidean: scalar::squared_euclidean,
    cosine_similarity: scalar::cosine_similarity,
    level: "scalar",
};

#[allow(unreachable_code)]
fn detect() -> Kernels {
    #[cfg(target_arch = "aarch64")]
    {
        tracing::debug!("distance kernels: neon");
        return Kernels {
            dot_product: neon_dot_entry,
            squared_euclidean: neon_l2_entry,
            cosine_similarity: neon_cosine_entry,
            level: "neon",
        };
    }
    #[cfg(target_arch = "x86_64")]
    {
        if std::arch::is_x86_feature_detected!("avx2") && std::arch::is_x86_feature_detected!("fma")
        {
            tracing::debug!("distance kernels: avx2+fma");
            return Kernels {
                dot_product: avx2_dot_entry,
                squared_euclidean: avx2_l2_entry,
                cosine_similarity: avx2_cosine_entry,
                level: "avx2+fma",
            };
        }
    }
    tracing::debug!("distance kernels: scalar");
    SCALAR
}

// ============================================================================
// NEON implementations (aarch64)
// ============================================================================

#[cfg(target_arch = "aarch64")]
use std::arch::aarch64::*;

// NEON is part of the aarch64 baseline, so these entries are always sound.
#[cfg(target_arch = "aarch64")]
fn neon_dot_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { neon_dot_product_f32(a, b) }
}

#[cfg(target_arch = "aarch64")]
fn neon_l2_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { neon_euclidean_sq_f32(a, b) }
}

#[cfg(target_arch = "aarch64")]
fn neon_cosine_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { neon_cosine_f32(a, b) }
}

#[cfg(target_arch = "aarch64")]
unsafe fn neon_cosine_f32(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    let mut dot0 = vdupq_n_f32(0.0);
    let mut dot1 = vdupq_n_f32(0.0);
    let mut na0 = vdupq_n_f32(0.0);
    let mut na1 = vdupq_n_f32(0.0);
    let mut nb0 = vdupq_n_f32(0.0);
    let mut nb1 = vdupq_n_f32(0.0);

    let chunks = len / 8;
    for i in 0..chunks {
        let base = i * 8;
        let a0 = vld1q_f32(a_ptr.add(base));
        let a1 = vld1q_f32(a_ptr.add(base + 4));
        let b0 = vld1q_f32(b_ptr.add(base));
        let b1 = vld1q_f32(b_ptr.add(base + 4));
        dot0 = vfmaq_f32(dot0, a0, b0);
        dot1 = vfmaq_f32(dot1, a1, b1);
        na0 = vfmaq_f32(na0, a0, a0);
        na1 = vfmaq_f32(na1, a1, a1);
        nb0 = vfmaq_f32(nb0, b0, b0);
        nb1 = vfmaq_f32(nb1, b1, b1);
    }

    let mut dot = vaddvq_f32(vaddq_f32(dot0, dot1));
    let mut norm_a = vaddvq_f32(vaddq_f32(na0, na1));
    let mut norm_b = vaddvq_f32(vaddq_f32(nb0, nb1));

    for i in (chunks * 8)..len {
        let ai = *a_ptr.add(i);
        let bi = *b_ptr.add(i);
        dot += ai * bi;
        norm_a += ai * ai;
        norm_b += bi * bi;
    }

    scalar::finish_cosine(dot, norm_a, norm_b)
}

#[cfg(target_arch = "aarch64")]
unsafe fn neon_euclidean_sq_f32(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    let mut s0 = vdupq_n_f32(0.0);
    let mut s1 = vdupq_n_f32(0.0);
    let mut s2 = vdupq_n_f32(0.0);
    let mut s3 = vdupq_n_f32(0.0);

    let chunks = len / 16;
    for i in 0..chunks {
        let base = i * 16;
        let d0 = vsubq_f32(vld1q_f32(a_ptr.add(base)), vld1q_f32(b_ptr.add(base)));
        let d1 = vsubq_f32(
            vld1q_f32(a_ptr.add(base + 4)),
            vld1q_f32(b_ptr.add(base + 4)),
        );
        let d2 = vsubq_f32(
            vld1q_f32(a_ptr.add(base + 8)),
            vld1q_f32(b_ptr.add(base + 8)),
        );
        let d3 = vsubq_f32(
            vld1q_f32(a_ptr.add(base + 12)),
            vld1q_f32(b_ptr.add(base + 12)),
        );
        s0 = vfmaq_f32(s0, d0, d0);
        s1 = vfmaq_f32(s1, d1, d1);
        s2 = vfmaq_f32(s2, d2, d2);
        s3 = vfmaq_f32(s3, d3, d3);
    }

    let mut sum = vaddvq_f32(vaddq_f32(vaddq_f32(s0, s1), vaddq_f32(s2, s3)));

    for i in (chunks * 16)..len {
        let d = *a_ptr.add(i) - *b_ptr.add(i);
        sum += d * d;
    }
    sum
}

#[cfg(target_arch = "aarch64")]
unsafe fn neon_dot_product_f32(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    let mut s0 = vdupq_n_f32(0.0);
    let mut s1 = vdupq_n_f32(0.0);
    let mut s2 = vdupq_n_f32(0.0);
    let mut s3 = vdupq_n_f32(0.0);

    let chunks = len / 16;
    for i in 0..chunks {
        let base = i * 16;
        s0 = vfmaq_f32(s0, vld1q_f32(a_ptr.add(base)), vld1q_f32(b_ptr.add(base)));
        s1 = vfmaq_f32(
            s1,
            vld1q_f32(a_ptr.add(base + 4)),
            vld1q_f32(b_ptr.add(base + 4)),
        );
        s2 = vfmaq_f32(
            s2,
            vld1q_f32(a_ptr.add(base + 8)),
            vld1q_f32(b_ptr.add(base + 8)),
        );
        s3 = vfmaq_f32(
            s3,
            vld1q_f32(a_ptr.add(base + 12)),
            vld1q_f32(b_ptr.add(base + 12)),
        );
    }

    let mut sum = vaddvq_f32(vaddq_f32(vaddq_f32(s0, s1), vaddq_f32(s2, s3)));

    for i in (chunks * 16)..len {
        sum += *a_ptr.add(i) * *b_ptr.add(i);
    }
    sum
}

// ============================================================================
// AVX2+FMA implementations (x86_64)
// ============================================================================

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::*;

// Only handed out by `detect` after avx2 and fma were both detected.
#[cfg(target_arch = "x86_64")]
fn avx2_dot_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { avx2_dot_product_f32(a, b) }
}

#[cfg(target_arch = "x86_64")]
fn avx2_l2_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { avx2_euclidean_sq_f32(a, b) }
}

#[cfg(target_arch = "x86_64")]
fn avx2_cosine_entry(a: &[f32], b: &[f32]) -> f32 {
    unsafe { avx2_cosine_f32(a, b) }
}

/// Horizontal sum of 8 f32 values in a __m256 register.
#[cfg(target_arch = "x86_64")]
#[inline]
#[target_feature(enable = "avx2")]
unsafe fn hsum_f32x8(v: __m256) -> f32 {
    let hi128 = _mm256_extractf128_ps(v, 1);
    let lo128 = _mm256_castps256_ps128(v);
    let sum128 = _mm_add_ps(lo128, hi128);
    let hi64 = _mm_movehl_ps(sum128, sum128);
    let sum64 = _mm_add_ps(sum128, hi64);
    let hi32 = _mm_shuffle_ps(sum64, sum64, 0x55);
    _mm_cvtss_f32(_mm_add_ss(sum64, hi32))
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn avx2_cosine_f32(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    let mut dot0 = _mm256_setzero_ps();
    let mut dot1 = _mm256_setzero_ps();
    let mut na0 = _mm256_setzero_ps();
    let mut na1 = _mm256_setzero_ps();
    let mut nb0 = _mm256_setzero_ps();
    let mut nb1 = _mm256_setzero_ps();

    let chunks = len / 16;
    for i in 0..chunks {
        let base = i * 16;
        let a0 = _mm256_loadu_ps(a_ptr.add(base));
        let a1 = _mm256_loadu_ps(a_ptr.add(base + 8));
        let b0 = _mm256_loadu_ps(b_ptr.add(base));
        let b1 = _mm256_loadu_ps(b_ptr.add(base + 8));
        dot0 = _mm256_fmadd_ps(a0, b0, dot0);
        dot1 = _mm256_fmadd_ps(a1, b1, dot1);
        na0 = _mm256_fmadd_ps(a0, a0, na0);
        na1 = _mm256_fmadd_ps(a1, a1, na1);
        nb0 = _mm256_fmadd_ps(b0, b0, nb0);
        nb1 = _mm256_fmadd_ps(b1, b1, nb1);
    }

    let mut dot = hsum_f32x8(_mm256_add_ps(dot0, dot1));
    let mut norm_a = hsum_f32x8(_mm256_add_ps(na0, na1));
    let mut norm_b = hsum_f32x8(_mm256_add_ps(nb0, nb1));

    for i in (chunks * 16)..len {
        let ai = *a_ptr.add(i);
        let bi = *b_ptr.add(i);
        dot += ai * bi;
        norm_a += ai * ai;
        norm_b += bi * bi;
    }

    scalar::finish_cosine(dot, norm_a, norm_b)
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn avx2_euclidean_sq_f32(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    let mut s0 = _mm256_setzero_ps();
    let mut s1 = _mm256_setzero_ps();

    let chunks = len / 16;
    for i in 0..chunks {
        let base = i * 16;
        let d0 = _mm256_sub_ps(
            _mm256_loadu_ps(a_ptr.add(base)),
            _mm256_loadu_ps(b_ptr.add(base)),
        );
        let d1 = _mm256_sub_ps(
            _mm256_loadu_ps(a_ptr.add(base + 8)),
            _mm256_loadu_ps(b_ptr.add(base + 8)),
        );
        s0 = _mm256_fmadd_ps(d0, d0, s0);
        s1 = _mm256_fmadd_ps(d1, d1, s1);
    }

    let mut sum = hsum_f32x8(_mm256_add_ps(s0, s1));

    for i in (chunks * 16)..len {
        let d = *a_ptr.add(i) - *b_ptr.add(i);
        sum += d * d;
    }
    sum
}

#[cfg(target_arch = "x86_64")]
#[target_feature(enable = "avx2,fma")]
unsafe fn avx2_dot_product_f32(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    let a_ptr = a.as_ptr();
    let b_ptr = b.as_ptr();

    let mut s0 = _mm256_setzero_ps();
    let mut s1 = _mm256_setzero_ps();

    let chunks = len / 16;
    for i in 0..chunks {
        let base = i * 16;
        s0 = _mm256_fmadd_ps(
            _mm256_loadu_ps(a_ptr.add(base)),
            _mm256_loadu_ps(b_ptr.add(base)),
            s0,
        );
        s1 = _mm256_fmadd_ps(
            _mm256_loadu_ps(a_ptr.add(base + 8)),
            _mm256_loadu_ps(b_ptr.add(base + 8)),
            s1,
        );
    }

    let mut sum = hsum_f32x8(_mm256_add_ps(s0, s1));

    for i in (chunks * 16)..len {
        sum += *a_ptr.add(i) * *b_ptr.add(i);
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random(n: usize, seed: u32) -> Vec<f32> {
        let mut state = seed.wrapping_mul(2_654_435_761).max(1);
        (0..n)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                (state % 2000) as f32 / 1000.0 - 1.0
            })
            .collect()
    }

    #[test]
    fn test_kernels_match_scalar_on_odd_lengths() {
        let k = kernels();
        for len in [1, 3, 7, 8, 15, 16, 17, 31, 33, 100, 128, 257] {
            let a = pseudo_random(len, len as u32);
            let b = pseudo_random(len, len as u32 + 7);
            let d1 = (k.dot_product)(&a, &b);
            let d2 = scalar::dot_product(&a, &b);
            assert!((d1 - d2).abs() < 1e-4, "dot len={len}: {d1} vs {d2}");
            let l1 = (k.squared_euclidean)(&a, &b);
            let l2 = scalar::squared_euclidean(&a, &b);
            assert!((l1 - l2).abs() < 1e-4 * l2.max(1.0), "l2 len={len}: {l1} vs {l2}");
            let c1 = (k.cosine_similarity)(&a, &b);
            let c2 = scalar::cosine_similarity(&a, &b);
            assert!((c1 - c2).abs() < 1e-4, "cos len={len}: {c1} vs {c2}");
        }
    }

    #[test]
    fn test_mismatched_lengths_do_not_overread() {
        let k = kernels();
        let a = vec![1.0f32; 20];
        let b = vec![1.0f32; 17];
        assert_eq!((k.dot_product)(&a, &b), 17.0);
        assert_eq!((k.squared_euclidean)(&a, &b), 0.0);
    }

    #[test]
    fn test_level_reported() {
        assert!(!kernels().level.is_empty());
    }
}
