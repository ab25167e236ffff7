//! K-means clustering with k-means++ initialization.
//!
//! Shared by every codebook trainer. Data is a contiguous arena of `n`
//! points of `dim` floats. Clustering always uses squared L2, whatever metric
//! the resulting codec serves. Seeding comes from a seeded `StdRng`, and the
//! assignment step is fanned out over the task pool in index order, so the
//! result is fully determined by the seed.

use crate::distance::squared_euclidean;
use crate::error::{Result, VdbError};
use crate::pool::TaskPool;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Points per assignment batch below which the pool is not used.
const PARALLEL_ASSIGN_MIN_POINTS: usize = 1_024;

/// Parameters of one clustering run.
#[derive(Debug, Clone, Copy)]
pub struct KMeansParams {
    pub k: usize,
    pub max_iterations: usize,
    /// Stop once the largest squared centroid movement falls below this.
    pub convergence_threshold: f32,
    pub seed: u64,
}

/// Output of [`kmeans`].
#[derive(Debug, Clone)]
pub struct KMeansResult {
    /// `k * dim` centroid floats.
    pub centroids: Vec<f32>,
    /// Cluster index of every input point.
    pub assignments: Vec<u32>,
    /// Lloyd iterations actually run.
    pub iterations: usize,
}

/// Index and squared distance of the centroid nearest to `point`.
#[inline]
pub(crate) fn nearest_centroid(point: &[f32], centroids: &[f32], dim: usize) -> (usize, f32) {
    let mut best = 0usize;
    let mut best_dist = f32::MAX;
    for (ci, centroid) in centroids.chunks_exact(dim).enumerate() {
        let d = squared_euclidean(point, centroid);
        if d < best_dist {
            best_dist = d;
            best = ci;
        }
    }
    (best, best_dist)
}

/// Cluster `data` into `params.k` centroids.
///
/// With `n <= k` every point becomes its own centroid and the remaining slots
/// repeat the last point, so no code ever decodes to an unrelated zero vector.
pub fn kmeans(
    data: &[f32],
    dim: usize,
    params: &KMeansParams,
    pool: Option<&TaskPool>,
) -> Result<KMeansResult> {
    if dim == 0 {
        return Err(VdbError::InvalidConfig("k-means dimension must be positive".to_string()));
    }
    if params.k == 0 {
        return Err(VdbError::InvalidConfig("k-means needs at least one centroid".to_string()));
    }
    let n = data.len() / dim;
    if n == 0 {
        return Err(VdbError::EmptyInput("no training points".to_string()));
    }
    let k = params.k;

    if n <= k {
        if n < k {
            tracing::warn!(
                "k-means with {} points for {} centroids; padding with the last point",
                n,
                k
            );
        }
        let mut centroids = Vec::with_capacity(k * dim);
        centroids.extend_from_slice(&data[..n * dim]);
        let last = &data[(n - 1) * dim..n * dim];
        for _ in n..k {
            centroids.extend_from_slice(last);
        }
        return Ok(KMeansResult {
            centroids,
            assignments: (0..n as u32).collect(),
            iterations: 0,
        });
    }

    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut centroids = init_plus_plus(data, dim, k, &mut rng);
    let mut assignments = vec![0u32; n];
    let mut iterations = 0;

    for _ in 0..params.max_iterations {
        iterations += 1;
        assignments = assign(data, dim, &centroids, pool)?;

        let mut sums = vec![0.0f32; k * dim];
        let mut counts = vec![0u32; k];
        for (i, &ci) in assignments.iter().enumerate() {
            let ci = ci as usize;
            counts[ci] += 1;
            let point = &data[i * dim..(i + 1) * dim];
            for (s, &p) in sums[ci * dim..(ci + 1) * dim].iter_mut().zip(point) {
                *s += p;
            }
        }

        let mut max_shift = 0.0f32;
        for ci in 0..k {
            // Empty clusters keep their previous centroid.
            if counts[ci] == 0 {
                continue;
            }
            let inv = 1.0 / counts[ci] as f32;
            let updated: Vec<f32> = sums[ci * dim..(ci + 1) * dim].iter().map(|s| s * inv).collect();
            let current = &mut centroids[ci * dim..(ci + 1) * dim];
            max_shift = max_shift.max(squared_euclidean(current, &updated));
            current.copy_from_slice(&updated);
        }

        if max_shift < params.convergence_threshold {
            break;
        }
    }

    // Final assignment against the last centroid update.
    if iterations > 0 {
        assignments = assign(data, dim, &centroids, pool)?;
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations,
    })
}

fn init_plus_plus(data: &[f32], dim: usize, k: usize, rng: &mut StdRng) -> Vec<f32> {
    let n = data.len() / dim;
    let mut centroids = vec![0.0f32; k * dim];

    let first = rng.random_range(0..n);
    centroids[..dim].copy_from_slice(&data[first * dim..(first + 1) * dim]);

    // Distance from each point to its nearest chosen centroid
    let mut min_dists = vec![f32::MAX; n];

    for ci in 1..k {
        let last_centroid = &centroids[(ci - 1) * dim..ci * dim];
        let mut total = 0.0f64;
        for i in 0..n {
            let d = squared_euclidean(&data[i * dim..(i + 1) * dim], last_centroid);
            if d < min_dists[i] {
                min_dists[i] = d;
            }
            total += min_dists[i] as f64;
        }

        let chosen = if total < 1e-30 {
            // All points coincide with existing centroids
            rng.random_range(0..n)
        } else {
            let threshold = rng.random::<f64>() * total;
            let mut cumulative = 0.0f64;
            let mut chosen = n - 1;
            for (i, &d) in min_dists.iter().enumerate() {
                cumulative += d as f64;
                if cumulative >= threshold {
                    chosen = i;
                    break;
                }
            }
            chosen
        };
        centroids[ci * dim..(ci + 1) * dim].copy_from_slice(&data[chosen * dim..(chosen + 1) * dim]);
    }

    centroids
}

fn assign(data: &[f32], dim: usize, centroids: &[f32], pool: Option<&TaskPool>) -> Result<Vec<u32>> {
    let n = data.len() / dim;
    let nearest = |i: usize| nearest_centroid(&data[i * dim..(i + 1) * dim], centroids, dim).0 as u32;
    match pool {
        Some(pool) if n >= PARALLEL_ASSIGN_MIN_POINTS && pool.threads() > 1 => {
            pool.parallel_map(n, |i| Ok(nearest(i)))
        }
        _ => Ok((0..n).map(nearest).collect()),
    }
}

/// Flatten training vectors into one arena, checking each one's dimension.
pub(crate) fn flatten_checked(vectors: &[Vec<f32>], dim: usize) -> Result<Vec<f32>> {
    if vectors.is_empty() {
        return Err(VdbError::EmptyInput("no training vectors".to_string()));
    }
    let mut arena = Vec::with_capacity(vectors.len() * dim);
    for v in vectors {
        VdbError::check_dimension(dim, v.len())?;
        arena.extend_from_slice(v);
    }
    Ok(arena)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(k: usize) -> KMeansParams {
        KMeansParams {
            k,
            max_iterations: 20,
            convergence_threshold: 1e-6,
            seed: 7,
        }
    }

    fn two_blobs() -> Vec<f32> {
        let mut data = Vec::new();
        for i in 0..50 {
            let jitter = (i % 5) as f32 * 0.01;
            data.extend_from_slice(&[0.0 + jitter, 0.0 - jitter]);
            data.extend_from_slice(&[10.0 - jitter, 10.0 + jitter]);
        }
        data
    }

    #[test]
    fn test_separates_two_blobs() {
        let data = two_blobs();
        let result = kmeans(&data, 2, &params(2), None).unwrap();
        assert_eq!(result.centroids.len(), 4);
        // Points alternate between blobs, so assignments must alternate too.
        assert_ne!(result.assignments[0], result.assignments[1]);
        for i in (0..result.assignments.len()).step_by(2) {
            assert_eq!(result.assignments[i], result.assignments[0]);
        }
    }

    #[test]
    fn test_deterministic_for_seed() {
        let data = two_blobs();
        let a = kmeans(&data, 2, &params(3), None).unwrap();
        let b = kmeans(&data, 2, &params(3), None).unwrap();
        assert_eq!(a.centroids, b.centroids);
    }

    #[test]
    fn test_parallel_assignment_matches_sequential() {
        let pool = TaskPool::new(4).unwrap();
        let data: Vec<f32> = (0..4_000).map(|i| ((i * 37) % 101) as f32 / 101.0).collect();
        let seq = kmeans(&data, 2, &params(8), None).unwrap();
        let par = kmeans(&data, 2, &params(8), Some(&pool)).unwrap();
        assert_eq!(seq.centroids, par.centroids);
        assert_eq!(seq.assignments, par.assignments);
    }

    #[test]
    fn test_fewer_points_than_centroids() {
        let data = [1.0, 2.0, 3.0, 4.0];
        let result = kmeans(&data, 2, &params(4), None).unwrap();
        assert_eq!(result.centroids, vec![1.0, 2.0, 3.0, 4.0, 3.0, 4.0, 3.0, 4.0]);
        assert_eq!(result.assignments, vec![0, 1]);
    }

    #[test]
    fn test_rejects_empty_input() {
        assert!(matches!(
            kmeans(&[], 2, &params(2), None),
            Err(VdbError::EmptyInput(_))
        ));
        assert!(matches!(
            flatten_checked(&[vec![1.0, 2.0], vec![1.0]], 2),
            Err(VdbError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }
}
