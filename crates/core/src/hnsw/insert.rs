//! HNSW insertion algorithm.
//!
//! Inserts a vector into the HNSW graph with bidirectional connections and
//! heuristic neighbor pruning (Algorithm 4 from the HNSW paper). Construction
//! always uses exact distances on the raw vector arena.

use crate::hnsw::graph::HnswGraph;
use crate::hnsw::search::search_layer;
use crate::hnsw::visited::with_scratch;
use crate::VectorId;

impl HnswGraph {
    /// Link a new node into the graph.
    ///
    /// The caller has already checked the dimension and that `id` is absent.
    /// `codes` must be `code_size` bytes when the graph carries codes.
    pub(crate) fn insert_node(&mut self, id: VectorId, vector: &[f32], codes: Option<&[u8]>) {
        let level = self.draw_level();
        let node = self.node_count() as u32;

        // Push the node first; it has no edges yet, so searches cannot reach it.
        self.vectors.extend_from_slice(vector);
        if let Some(codes) = codes {
            self.codes.extend_from_slice(codes);
        }
        self.neighbors.push(vec![Vec::new(); level + 1]);
        self.layers.push(level as u8);
        self.deleted.push(false);
        self.ids.push(id);
        self.id_map.insert(id, node);
        self.live_count += 1;

        let Some(entry_point) = self.entry_point else {
            self.entry_point = Some(node);
            self.max_layer = level;
            return;
        };

        let top = level.min(self.max_layer);
        let ef = self.config.ef_construction;

        // Phases 1 and 2 only read the graph; collect every layer's selection first.
        let selections: Vec<Vec<u32>> = with_scratch(self.node_count(), |visited| {
            let start = self.descend(vector, entry_point, top, visited);
            let exact = |n: u32| self.exact_distance(vector, n);
            // Tombstoned nodes stay valid neighbors; the new node itself is not.
            let others = |n: u32| n != node;

            let mut selections = vec![Vec::new(); top + 1];
            let mut layer_eps = vec![start];
            for layer in (0..=top).rev() {
                let candidates = search_layer(self, &layer_eps, ef, layer, visited, &exact, &others);
                let selected = self.select_neighbors(&candidates, self.config.max_neighbors(layer));
                selections[layer] = selected.iter().map(|&(_, n)| n).collect();
                if !candidates.is_empty() {
                    layer_eps = candidates.iter().map(|&(_, n)| n).collect();
                }
            }
            selections
        });

        // Phase 3: bidirectional links, pruning overfull lists.
        for (layer, selected) in selections.into_iter().enumerate() {
            let m_max = self.config.max_neighbors(layer);
            for &neighbor in &selected {
                let nid = neighbor as usize;
                self.neighbors[nid][layer].push(node);
                if self.neighbors[nid][layer].len() > m_max {
                    let base = self.vector(neighbor);
                    let candidates: Vec<(f32, u32)> = self.neighbors[nid][layer]
                        .iter()
                        .map(|&c| (self.exact_distance(base, c), c))
                        .collect();
                    let pruned = self.select_neighbors(&candidates, m_max);
                    self.neighbors[nid][layer] = pruned.into_iter().map(|(_, c)| c).collect();
                }
            }
            self.neighbors[node as usize][layer] = selected;
        }

        if level > self.max_layer {
            self.max_layer = level;
            self.entry_point = Some(node);
        }
    }

    /// Heuristic neighbor selection.
    ///
    /// Walks candidates closest first and keeps one only if it is strictly
    /// closer to the base than to every neighbor kept so far. With
    /// `keep_pruned`, remaining slots take the closest rejected candidates.
    pub(crate) fn select_neighbors(&self, candidates: &[(f32, u32)], m: usize) -> Vec<(f32, u32)> {
        let mut sorted = candidates.to_vec();
        sorted.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut selected: Vec<(f32, u32)> = Vec::with_capacity(m);
        let mut pruned: Vec<(f32, u32)> = Vec::new();
        for &(dist_to_base, cid) in &sorted {
            if selected.len() >= m {
                break;
            }
            let candidate = self.vector(cid);
            let is_diverse = selected
                .iter()
                .all(|&(_, sid)| dist_to_base < self.exact_distance(candidate, sid));
            if is_diverse {
                selected.push((dist_to_base, cid));
            } else {
                pruned.push((dist_to_base, cid));
            }
        }

        if self.config.keep_pruned {
            let room = m.saturating_sub(selected.len());
            selected.extend(pruned.into_iter().take(room));
        }
        selected
    }
}
