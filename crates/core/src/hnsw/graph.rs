//! HNSW graph structure and configuration.
//!
//! [`HnswConfig`] defines tuning parameters (M, ef_construction, ef_search, distance metric).
//! [`HnswGraph`] stores the graph using Struct-of-Arrays layout: raw vectors in
//! one contiguous arena, neighbor lists as internal `u32` indices, and optional
//! codec codes in a second arena. Nodes are never moved or freed; removal
//! tombstones them until [`HnswGraph::rebuilt`] compacts the arena.

use crate::config;
use crate::distance::DistanceMetric;
use crate::error::{Result, VdbError};
use crate::VectorId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Configuration parameters for an HNSW index.
///
/// Controls the trade-off between build speed, search speed, recall, and memory usage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HnswConfig {
    /// Number of bidirectional links per node (except layer 0, which uses `m_max0`).
    pub m: usize,
    /// Maximum links per node at layer 0 (typically `2 * m`).
    pub m_max0: usize,
    /// Candidate list size during index construction.
    pub ef_construction: usize,
    /// Candidate list size during search (higher = better recall, slower).
    pub ef_search: usize,
    /// Maximum number of layers in the graph.
    pub max_layers: usize,
    /// Distance function for similarity computation.
    pub distance_metric: DistanceMetric,
    /// Seed for level assignment.
    pub seed: u64,
    /// Level multiplier `mL`; `None` uses `1 / ln(m)`.
    #[serde(default)]
    pub level_multiplier: Option<f64>,
    /// Backfill neighbor lists with the closest candidates the diversity
    /// heuristic rejected.
    pub keep_pruned: bool,
}

impl Default for HnswConfig {
    fn default() -> Self {
        Self {
            m: config::HNSW_DEFAULT_M,
            m_max0: config::HNSW_DEFAULT_M * 2,
            ef_construction: config::HNSW_DEFAULT_EF_CONSTRUCTION,
            ef_search: config::HNSW_DEFAULT_EF_SEARCH,
            max_layers: config::HNSW_DEFAULT_MAX_LAYERS,
            distance_metric: DistanceMetric::Cosine,
            seed: config::HNSW_DEFAULT_SEED,
            level_multiplier: None,
            keep_pruned: true,
        }
    }
}

impl HnswConfig {
    /// Default configuration for `metric`.
    pub fn with_metric(metric: DistanceMetric) -> Self {
        Self {
            distance_metric: metric,
            ..Self::default()
        }
    }

    pub fn level_multiplier(&self) -> f64 {
        self.level_multiplier
            .unwrap_or_else(|| 1.0 / (self.m as f64).ln())
    }

    /// Maximum neighbor count at `layer`.
    #[inline]
    pub fn max_neighbors(&self, layer: usize) -> usize {
        if layer == 0 {
            self.m_max0
        } else {
            self.m
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.m < 2 {
            return Err(VdbError::InvalidConfig(format!("m must be at least 2, got {}", self.m)));
        }
        if self.m_max0 < self.m {
            return Err(VdbError::InvalidConfig(format!(
                "m_max0 ({}) must be at least m ({})",
                self.m_max0, self.m
            )));
        }
        if self.ef_construction == 0 || self.ef_search == 0 {
            return Err(VdbError::InvalidConfig("ef values must be positive".to_string()));
        }
        if self.max_layers == 0 || self.max_layers > 256 {
            return Err(VdbError::InvalidConfig(format!(
                "max_layers must be in 1..=256, got {}",
                self.max_layers
            )));
        }
        if let Some(ml) = self.level_multiplier {
            if !(ml.is_finite() && ml > 0.0) {
                return Err(VdbError::InvalidConfig(format!(
                    "level_multiplier must be positive and finite, got {ml}"
                )));
            }
        }
        Ok(())
    }
}

/// Graph arena in Struct-of-Arrays layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HnswGraph {
    pub config: HnswConfig,
    pub dimension: usize,
    /// Raw vectors, `dimension` floats per internal node.
    pub vectors: Vec<f32>,
    /// `neighbors[node][layer]` lists internal node indices.
    pub neighbors: Vec<Vec<Vec<u32>>>,
    pub layers: Vec<u8>,
    pub deleted: Vec<bool>,
    /// Internal index to caller id.
    pub ids: Vec<VectorId>,
    /// Caller id to internal index, tombstoned ids included.
    #[serde(skip)]
    pub id_map: HashMap<VectorId, u32>,
    /// Codec codes, `code_size` bytes per node; empty without a codec.
    pub codes: Vec<u8>,
    pub code_size: usize,
    pub entry_point: Option<u32>,
    pub max_layer: usize,
    pub live_count: usize,
    /// Levels drawn so far; each draw is seeded from `seed + level_draws`.
    pub level_draws: u64,
}

/// Summary statistics of a graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphStats {
    pub live_nodes: usize,
    pub tombstones: usize,
    pub max_layer: usize,
    /// Mean neighbor count at layer 0 over all nodes.
    pub average_degree: f32,
    pub dimension: usize,
    pub code_size: usize,
}

impl HnswGraph {
    /// Creates a new empty graph with the given dimension and configuration.
    pub fn new(dimension: usize, config: HnswConfig) -> Self {
        Self {
            config,
            dimension,
            vectors: Vec::new(),
            neighbors: Vec::new(),
            layers: Vec::new(),
            deleted: Vec::new(),
            ids: Vec::new(),
            id_map: HashMap::new(),
            codes: Vec::new(),
            code_size: 0,
            entry_point: None,
            max_layer: 0,
            live_count: 0,
            level_draws: 0,
        }
    }

    /// Total nodes in the arena, tombstones included.
    #[inline]
    pub fn node_count(&self) -> usize {
        self.ids.len()
    }

    #[inline]
    pub fn vector(&self, node: u32) -> &[f32] {
        let start = node as usize * self.dimension;
        &self.vectors[start..start + self.dimension]
    }

    #[inline]
    pub fn node_codes(&self, node: u32) -> &[u8] {
        let start = node as usize * self.code_size;
        &self.codes[start..start + self.code_size]
    }

    #[inline]
    pub fn has_codes(&self) -> bool {
        self.code_size > 0
    }

    #[inline]
    pub fn is_deleted(&self, node: u32) -> bool {
        self.deleted[node as usize]
    }

    /// Internal index of a live node with caller id `id`.
    pub fn live_node(&self, id: VectorId) -> Option<u32> {
        self.id_map
            .get(&id)
            .copied()
            .filter(|&n| !self.is_deleted(n))
    }

    /// Draw the level of the next node: `floor(-ln(U) * mL)` capped at `max_layers - 1`.
    pub fn draw_level(&mut self) -> usize {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(self.config.seed.wrapping_add(self.level_draws));
        self.level_draws += 1;
        // random() is in [0, 1); flip it so ln never sees zero.
        let u = 1.0 - rng.random::<f64>();
        let level = (-u.ln() * self.config.level_multiplier()).floor() as usize;
        level.min(self.config.max_layers - 1)
    }

    /// Tombstone the node holding `id`. Returns false if absent or already removed.
    pub fn mark_deleted(&mut self, id: VectorId) -> bool {
        match self.live_node(id) {
            Some(node) => {
                self.deleted[node as usize] = true;
                self.live_count -= 1;
                true
            }
            None => false,
        }
    }

    pub fn rebuild_id_map(&mut self) {
        self.id_map = self
            .ids
            .iter()
            .enumerate()
            .map(|(i, &id)| (id, i as u32))
            .collect();
    }

    /// Check internal consistency after deserialization.
    pub fn validate(&self) -> Result<()> {
        let n = self.ids.len();
        let corrupted = |what: &str| Err(VdbError::Corrupted(format!("graph snapshot: {what}")));
        if self.vectors.len() != n * self.dimension {
            return corrupted("vector arena length");
        }
        if self.neighbors.len() != n || self.layers.len() != n || self.deleted.len() != n {
            return corrupted("node array lengths differ");
        }
        if self.codes.len() != n * self.code_size {
            return corrupted("code arena length");
        }
        if self.id_map.len() != n {
            return corrupted("duplicate ids");
        }
        if self.live_count != self.deleted.iter().filter(|&&d| !d).count() {
            return corrupted("live count");
        }
        match self.entry_point {
            Some(ep) if ep as usize >= n => return corrupted("entry point out of range"),
            None if n > 0 => return corrupted("missing entry point"),
            _ => {}
        }
        for (node, lists) in self.neighbors.iter().enumerate() {
            if lists.len() != self.layers[node] as usize + 1 {
                return corrupted("layer count");
            }
            if lists.iter().flatten().any(|&nb| nb as usize >= n) {
                return corrupted("neighbor out of range");
            }
        }
        Ok(())
    }

    pub fn stats(&self) -> GraphStats {
        let n = self.node_count();
        let degree_sum: usize = self
            .neighbors
            .iter()
            .map(|lists| lists.first().map_or(0, Vec::len))
            .sum();
        GraphStats {
            live_nodes: self.live_count,
            tombstones: n - self.live_count,
            max_layer: self.max_layer,
            average_degree: if n > 0 {
                degree_sum as f32 / n as f32
            } else {
                0.0
            },
            dimension: self.dimension,
            code_size: self.code_size,
        }
    }

    /// A fresh graph holding only the live nodes, reinserted in arena order.
    pub fn rebuilt(&self) -> Self {
        let mut fresh = HnswGraph::new(self.dimension, self.config.clone());
        fresh.code_size = self.code_size;
        for node in 0..self.node_count() as u32 {
            if self.is_deleted(node) {
                continue;
            }
            let codes = self.has_codes().then(|| self.node_codes(node));
            fresh.insert_node(self.ids[node as usize], self.vector(node), codes);
        }
        fresh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_validation() {
        assert!(HnswConfig::default().validate().is_ok());
        let bad = HnswConfig {
            m: 1,
            ..Default::default()
        };
        assert!(matches!(bad.validate(), Err(VdbError::InvalidConfig(_))));
        let bad = HnswConfig {
            m_max0: 8,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = HnswConfig {
            level_multiplier: Some(-1.0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_config_serde_defaults() {
        let json = serde_json::to_string(&HnswConfig::default()).unwrap();
        let back: HnswConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, HnswConfig::default());
    }

    #[test]
    fn test_levels_are_seeded_and_capped() {
        let config = HnswConfig {
            max_layers: 3,
            level_multiplier: Some(10.0),
            ..Default::default()
        };
        let mut a = HnswGraph::new(4, config.clone());
        let mut b = HnswGraph::new(4, config);
        let la: Vec<usize> = (0..100).map(|_| a.draw_level()).collect();
        let lb: Vec<usize> = (0..100).map(|_| b.draw_level()).collect();
        assert_eq!(la, lb);
        assert!(la.iter().all(|&l| l <= 2));
        assert!(la.iter().any(|&l| l == 2));
    }

    #[test]
    fn test_level_distribution_is_geometric() {
        let mut g = HnswGraph::new(4, HnswConfig::default());
        let levels: Vec<usize> = (0..10_000).map(|_| g.draw_level()).collect();
        let zero = levels.iter().filter(|&&l| l == 0).count();
        // P(level = 0) = 1 - 1/m = 0.9375 for m = 16.
        assert!((9_200..9_550).contains(&zero), "{zero} level-0 draws");
    }
}
