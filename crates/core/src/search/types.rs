//! Scored result types returned by the indexes.

use crate::distance::DistanceMetric;
use crate::VectorId;
use serde::{Deserialize, Serialize};

/// One hit from a dense (flat or graph) search.
///
/// `distance` follows the metric's "lower is better" convention; `score` is
/// the metric's monotone "higher is better" transform of the same value, so
/// ordering by either field gives the same ranking.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    /// Identifier supplied at insertion time.
    pub id: VectorId,
    /// Distance to the query under the index metric.
    pub distance: f32,
    /// Similarity score derived from `distance`.
    pub score: f32,
}

impl SearchResult {
    /// Build a result, deriving the score from the metric.
    #[inline]
    pub fn new(id: VectorId, distance: f32, metric: DistanceMetric) -> Self {
        Self {
            id,
            distance,
            score: metric.score(distance),
        }
    }
}

/// Sort results best-first: ascending distance, then ascending id.
pub(crate) fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| a.distance.total_cmp(&b.distance).then(a.id.cmp(&b.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_score_derived_from_metric() {
        let r = SearchResult::new(3, 0.25, DistanceMetric::Cosine);
        assert_eq!(r.id, 3);
        assert!((r.score - 0.75).abs() < 1e-6);

        let r = SearchResult::new(4, 1.0, DistanceMetric::Euclidean);
        assert!((r.score - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_sort_results_breaks_ties_by_id() {
        let m = DistanceMetric::SquaredEuclidean;
        let mut rs = vec![
            SearchResult::new(9, 1.0, m),
            SearchResult::new(2, 1.0, m),
            SearchResult::new(5, 0.5, m),
        ];
        sort_results(&mut rs);
        assert_eq!(rs.iter().map(|r| r.id).collect::<Vec<_>>(), vec![5, 2, 9]);
    }
}
