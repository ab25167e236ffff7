//! HNSW search algorithms: single-layer search and multi-layer KNN.
//!
//! [`search_layer`] takes the distance function and an acceptance predicate
//! as closures. Nodes that fail the predicate (tombstones, filtered ids) are
//! still expanded for navigation but never enter the result set. Layer-0
//! traversal scores codec codes when a codec is attached and reranks the
//! survivors with exact distances.

use crate::hnsw::graph::HnswGraph;
use crate::hnsw::visited::{with_scratch, VisitedSet};
use crate::quantization::CodeScorer;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::BinaryHeap;

/// Frontier entry; `Reverse` turns the max-heap into a min-heap by (distance, id).
type Candidate = Reverse<(OrderedFloat<f32>, u32)>;

/// Result entry: max-heap by (distance, id) so the worst result is on top.
type ResultEntry = (OrderedFloat<f32>, u32);

/// Best-first search of one layer.
///
/// Returns up to `ef` accepted nodes as `(distance, node)`, ascending by
/// distance then node index. `visited` is cleared at the start of each call.
pub(crate) fn search_layer<D, A>(
    graph: &HnswGraph,
    entry_points: &[u32],
    ef: usize,
    layer: usize,
    visited: &mut VisitedSet,
    distance: &D,
    accept: &A,
) -> Vec<(f32, u32)>
where
    D: Fn(u32) -> f32,
    A: Fn(u32) -> bool,
{
    visited.clear();
    let mut candidates: BinaryHeap<Candidate> = BinaryHeap::with_capacity(ef * 2);
    let mut results: BinaryHeap<ResultEntry> = BinaryHeap::with_capacity(ef + 1);
    // Cached worst accepted distance, MAX until the result set is full.
    let mut worst_dist = f32::MAX;

    for &ep in entry_points {
        if !visited.insert(ep) {
            continue;
        }
        let dist = distance(ep);
        candidates.push(Reverse((OrderedFloat(dist), ep)));
        if accept(ep) {
            results.push((OrderedFloat(dist), ep));
            if results.len() > ef {
                results.pop();
            }
            if results.len() >= ef {
                worst_dist = results.peek().map_or(f32::MAX, |r| r.0 .0);
            }
        }
    }

    while let Some(Reverse((OrderedFloat(c_dist), node))) = candidates.pop() {
        if results.len() >= ef && c_dist > worst_dist {
            break;
        }

        let Some(neighbor_list) = graph.neighbors[node as usize].get(layer) else {
            continue;
        };
        for &neighbor in neighbor_list {
            if !visited.insert(neighbor) {
                continue;
            }
            let dist = distance(neighbor);
            if results.len() < ef || dist < worst_dist {
                candidates.push(Reverse((OrderedFloat(dist), neighbor)));
                if accept(neighbor) {
                    results.push((OrderedFloat(dist), neighbor));
                    if results.len() > ef {
                        results.pop();
                    }
                    if results.len() >= ef {
                        worst_dist = results.peek().map_or(f32::MAX, |r| r.0 .0);
                    }
                }
            }
        }
    }

    results
        .into_sorted_vec()
        .into_iter()
        .map(|(d, node)| (d.0, node))
        .collect()
}

impl HnswGraph {
    /// Exact distance from `query` to the stored vector of `node`.
    #[inline]
    pub(crate) fn exact_distance(&self, query: &[f32], node: u32) -> f32 {
        self.config.distance_metric.distance(query, self.vector(node))
    }

    /// Greedy ef = 1 descent from the entry point through layers above `floor`.
    /// Every node is eligible, tombstones included.
    pub(crate) fn descend(&self, query: &[f32], entry: u32, floor: usize, visited: &mut VisitedSet) -> u32 {
        let mut current = entry;
        let exact = |n: u32| self.exact_distance(query, n);
        let any = |_: u32| true;
        for layer in (floor + 1..=self.max_layer).rev() {
            let nearest = search_layer(self, &[current], 1, layer, visited, &exact, &any);
            if let Some(&(_, node)) = nearest.first() {
                current = node;
            }
        }
        current
    }

    /// Multi-layer k-NN over live nodes accepted by `filter`.
    ///
    /// Layer 0 is searched with `max(ef, k)` candidates, scored through
    /// `scorer` when one is given. If fewer than `k` nodes pass the filter,
    /// ef doubles up to four times its starting value. Candidates are then
    /// reranked by exact distance and truncated to `k`.
    pub fn knn_search<F: Fn(u32) -> bool>(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        scorer: Option<&CodeScorer<'_>>,
        filter: &F,
    ) -> Vec<(f32, u32)> {
        let Some(entry_point) = self.entry_point else {
            return Vec::new();
        };
        if k == 0 || self.live_count == 0 {
            return Vec::new();
        }

        with_scratch(self.node_count(), |visited| {
            let start = self.descend(query, entry_point, 0, visited);

            let accept = |n: u32| !self.is_deleted(n) && filter(n);
            let base_ef = ef.max(k);
            let max_ef = (base_ef * 4).min(self.node_count()).max(base_ef);
            let mut ef = base_ef;
            let mut results = loop {
                let found = match scorer {
                    Some(scorer) if self.has_codes() => {
                        let approx = |n: u32| scorer.distance(self.node_codes(n));
                        search_layer(self, &[start], ef, 0, visited, &approx, &accept)
                    }
                    _ => {
                        let exact = |n: u32| self.exact_distance(query, n);
                        search_layer(self, &[start], ef, 0, visited, &exact, &accept)
                    }
                };
                if found.len() >= k || ef >= max_ef {
                    break found;
                }
                ef = (ef * 2).min(max_ef);
            };

            if scorer.is_some() && self.has_codes() {
                for entry in results.iter_mut() {
                    entry.0 = self.exact_distance(query, entry.1);
                }
                results.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            }
            results.truncate(k);
            results
        })
    }
}
