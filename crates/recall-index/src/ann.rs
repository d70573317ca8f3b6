//! Hierarchical navigable small-world graph for approximate search.
//!
//! Multi-layer graph where higher layers hold exponentially fewer nodes;
//! search starts at the top layer and greedily descends, then runs a
//! beam search on layer 0. Insert and search are O(log N) average, which
//! keeps scoped queries sub-linear once a collection outgrows the
//! brute-force threshold.
//!
//! Vectors are expected L2-normalized, so cosine similarity reduces to a
//! dot product and higher is better throughout.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

use ulid::Ulid;

/// Dot product; cosine similarity for unit vectors.
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// A (similarity, id) pair ordered by similarity, ties broken by id so the
/// ordering is total.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Scored {
    sim: f32,
    id: Ulid,
}

impl Eq for Scored {}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sim
            .partial_cmp(&other.sim)
            .unwrap_or(Ordering::Equal)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Node {
    vector: Vec<f32>,
    level: u8,
    /// Neighbor lists, one per layer 0..=level.
    neighbors: Vec<Vec<Ulid>>,
}

/// HNSW graph over document vectors.
pub struct HnswGraph {
    /// Max neighbors per node per layer above 0.
    m: usize,

    /// Max neighbors at layer 0.
    m_max0: usize,

    /// Beam width during construction.
    ef_construction: usize,

    /// Beam width during queries.
    ef_search: usize,

    /// Level generation multiplier, 1/ln(m).
    level_mult: f64,

    nodes: HashMap<Ulid, Node>,
    entry_point: Option<Ulid>,
    max_level: u8,

    /// LCG state for level selection; fixed seed keeps builds
    /// deterministic.
    rng_state: u64,
}

impl HnswGraph {
    /// Create an empty graph.
    pub fn new(m: usize, ef_construction: usize, ef_search: usize) -> Self {
        let m = m.max(2);
        Self {
            m,
            m_max0: m * 2,
            ef_construction: ef_construction.max(m),
            ef_search: ef_search.max(1),
            level_mult: 1.0 / (m as f64).ln(),
            nodes: HashMap::new(),
            entry_point: None,
            max_level: 0,
            rng_state: 0x9E3779B97F4A7C15,
        }
    }

    /// Number of indexed vectors.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the graph holds no vectors.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Whether a document is in the graph.
    pub fn contains(&self, id: Ulid) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Insert or replace a vector.
    pub fn insert(&mut self, id: Ulid, vector: Vec<f32>) {
        if self.nodes.contains_key(&id) {
            self.remove(id);
        }

        let level = self.random_level();
        let neighbors = vec![Vec::new(); level as usize + 1];

        if self.entry_point.is_none() {
            self.nodes.insert(
                id,
                Node {
                    vector,
                    level,
                    neighbors,
                },
            );
            self.entry_point = Some(id);
            self.max_level = level;
            return;
        }

        let mut ep = self.entry_point.unwrap();

        // Greedy descent through layers above the node's level.
        let mut l = self.max_level;
        while l > level {
            ep = self.greedy_closest(&vector, ep, l);
            l -= 1;
        }

        // Beam search each layer from the node's level down, collecting
        // the links to make before mutating the graph.
        let mut links_per_layer: Vec<(u8, Vec<Ulid>)> = Vec::new();
        let top = level.min(self.max_level);
        let mut layer = top as i32;
        while layer >= 0 {
            let candidates = self.search_layer(&vector, ep, self.ef_construction, layer as u8);
            let cap = if layer == 0 { self.m_max0 } else { self.m };

            let selected: Vec<Ulid> = candidates.iter().take(cap).map(|s| s.id).collect();
            if let Some(best) = candidates.first() {
                ep = best.id;
            }
            links_per_layer.push((layer as u8, selected));
            layer -= 1;
        }

        let mut node = Node {
            vector,
            level,
            neighbors,
        };
        for (l, selected) in &links_per_layer {
            node.neighbors[*l as usize] = selected.clone();
        }
        self.nodes.insert(id, node);

        // Back-links, pruned to the per-layer cap.
        for (l, selected) in links_per_layer {
            let cap = if l == 0 { self.m_max0 } else { self.m };
            for neighbor_id in selected {
                if let Some(neighbor) = self.nodes.get_mut(&neighbor_id) {
                    if let Some(list) = neighbor.neighbors.get_mut(l as usize) {
                        if !list.contains(&id) {
                            list.push(id);
                        }
                    }
                }
                self.shrink_links(neighbor_id, l as usize, cap);
            }
        }

        if level > self.max_level {
            self.max_level = level;
            self.entry_point = Some(id);
        }
    }

    /// Remove a vector. Back-links recorded on the node are unlinked;
    /// asymmetric links left elsewhere dangle harmlessly, since traversal
    /// skips ids that are no longer present.
    pub fn remove(&mut self, id: Ulid) {
        let Some(node) = self.nodes.remove(&id) else {
            return;
        };

        for (l, layer_neighbors) in node.neighbors.iter().enumerate() {
            for neighbor_id in layer_neighbors {
                if let Some(neighbor) = self.nodes.get_mut(neighbor_id) {
                    if let Some(list) = neighbor.neighbors.get_mut(l) {
                        list.retain(|n| *n != id);
                    }
                }
            }
        }

        if self.entry_point == Some(id) {
            self.entry_point = self
                .nodes
                .iter()
                .max_by_key(|(_, n)| n.level)
                .map(|(id, _)| *id);
            self.max_level = self
                .entry_point
                .and_then(|e| self.nodes.get(&e))
                .map(|n| n.level)
                .unwrap_or(0);
        }
    }

    /// Top-k approximate nearest neighbors, descending similarity.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(Ulid, f32)> {
        let Some(mut ep) = self.entry_point else {
            return Vec::new();
        };

        let mut l = self.max_level;
        while l > 0 {
            ep = self.greedy_closest(query, ep, l);
            l -= 1;
        }

        let ef = self.ef_search.max(k);
        self.search_layer(query, ep, ef, 0)
            .into_iter()
            .take(k)
            .map(|s| (s.id, s.sim))
            .collect()
    }

    /// One greedy step chain at a single layer.
    fn greedy_closest(&self, query: &[f32], ep: Ulid, level: u8) -> Ulid {
        let mut best = ep;
        let Some(node) = self.nodes.get(&best) else {
            return best;
        };
        let mut best_sim = dot(query, &node.vector);

        loop {
            let mut changed = false;
            let neighbors = self
                .nodes
                .get(&best)
                .and_then(|n| n.neighbors.get(level as usize))
                .cloned()
                .unwrap_or_default();

            for neighbor_id in neighbors {
                if let Some(neighbor) = self.nodes.get(&neighbor_id) {
                    let sim = dot(query, &neighbor.vector);
                    if sim > best_sim {
                        best = neighbor_id;
                        best_sim = sim;
                        changed = true;
                    }
                }
            }

            if !changed {
                return best;
            }
        }
    }

    /// Beam search within one layer; returns up to `ef` results sorted
    /// descending by similarity.
    fn search_layer(&self, query: &[f32], ep: Ulid, ef: usize, level: u8) -> Vec<Scored> {
        let Some(ep_node) = self.nodes.get(&ep) else {
            return Vec::new();
        };

        let mut visited: HashSet<Ulid> = HashSet::new();
        visited.insert(ep);

        let seed = Scored {
            sim: dot(query, &ep_node.vector),
            id: ep,
        };

        // Max-heap of frontier candidates, min-heap of kept results.
        let mut candidates: BinaryHeap<Scored> = BinaryHeap::new();
        let mut results: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        candidates.push(seed);
        results.push(Reverse(seed));

        while let Some(current) = candidates.pop() {
            if results.len() >= ef {
                if let Some(Reverse(worst)) = results.peek() {
                    if current.sim < worst.sim {
                        break;
                    }
                }
            }

            let neighbors = self
                .nodes
                .get(&current.id)
                .and_then(|n| n.neighbors.get(level as usize))
                .cloned()
                .unwrap_or_default();

            for neighbor_id in neighbors {
                if !visited.insert(neighbor_id) {
                    continue;
                }
                let Some(neighbor) = self.nodes.get(&neighbor_id) else {
                    continue;
                };

                let sim = dot(query, &neighbor.vector);
                let worst_sim = results.peek().map(|Reverse(s)| s.sim).unwrap_or(f32::MIN);

                if results.len() < ef || sim > worst_sim {
                    let scored = Scored {
                        sim,
                        id: neighbor_id,
                    };
                    candidates.push(scored);
                    results.push(Reverse(scored));
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_iter().map(|Reverse(s)| s).collect();
        out.sort_by(|a, b| b.cmp(a));
        out
    }

    /// Prune a node's layer links back to the cap, keeping the most
    /// similar neighbors.
    fn shrink_links(&mut self, id: Ulid, level: usize, cap: usize) {
        let Some(node) = self.nodes.get(&id) else {
            return;
        };
        let Some(list) = node.neighbors.get(level) else {
            return;
        };
        if list.len() <= cap {
            return;
        }

        let base = node.vector.clone();
        let mut scored: Vec<Scored> = list
            .iter()
            .filter_map(|n| {
                self.nodes.get(n).map(|nn| Scored {
                    sim: dot(&base, &nn.vector),
                    id: *n,
                })
            })
            .collect();
        scored.sort_by(|a, b| b.cmp(a));
        scored.truncate(cap);

        let keep: Vec<Ulid> = scored.into_iter().map(|s| s.id).collect();
        if let Some(node) = self.nodes.get_mut(&id) {
            node.neighbors[level] = keep;
        }
    }

    /// Exponentially-decaying random level from a deterministic LCG.
    fn random_level(&mut self) -> u8 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        let unit = ((self.rng_state >> 33) as f64 + 1.0) / (u32::MAX as f64 + 2.0);
        let level = (-unit.ln() * self.level_mult) as u64;
        level.min(16) as u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic unit vector, distinct for every seed below dim^2.
    fn unit_vector(seed: u64, dim: usize) -> Vec<f32> {
        let mut v = vec![0.0f32; dim];
        v[seed as usize % dim] += 1.0;
        v[(seed as usize / dim) % dim] += 0.5;
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for x in &mut v {
            *x /= norm;
        }
        v
    }

    #[test]
    fn test_exact_match_is_top_one() {
        let mut graph = HnswGraph::new(16, 100, 64);
        let mut ids = Vec::new();

        for i in 0..200u64 {
            let id = Ulid::new();
            graph.insert(id, unit_vector(i, 32));
            ids.push((id, i));
        }

        let (target_id, seed) = ids[117];
        let results = graph.search(&unit_vector(seed, 32), 5);

        assert!(!results.is_empty());
        assert_eq!(results[0].0, target_id);
        assert!((results[0].1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_results_sorted_descending() {
        let mut graph = HnswGraph::new(8, 50, 32);
        for i in 0..60u64 {
            graph.insert(Ulid::new(), unit_vector(i, 16));
        }

        let results = graph.search(&unit_vector(3, 16), 10);
        for pair in results.windows(2) {
            assert!(pair[0].1 >= pair[1].1);
        }
    }

    #[test]
    fn test_removed_vector_never_returned() {
        let mut graph = HnswGraph::new(8, 50, 32);
        let mut ids = Vec::new();
        for i in 0..50u64 {
            let id = Ulid::new();
            graph.insert(id, unit_vector(i, 16));
            ids.push((id, i));
        }

        let (victim, seed) = ids[20];
        graph.remove(victim);
        assert!(!graph.contains(victim));

        let results = graph.search(&unit_vector(seed, 16), 50);
        assert!(results.iter().all(|(id, _)| *id != victim));
    }

    #[test]
    fn test_reinsert_replaces_vector() {
        let mut graph = HnswGraph::new(8, 50, 32);
        let id = Ulid::new();
        graph.insert(id, unit_vector(1, 16));
        graph.insert(id, unit_vector(2, 16));

        assert_eq!(graph.len(), 1);
        let results = graph.search(&unit_vector(2, 16), 1);
        assert_eq!(results[0].0, id);
        assert!((results[0].1 - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_empty_graph() {
        let graph = HnswGraph::new(8, 50, 32);
        assert!(graph.is_empty());
        assert!(graph.search(&[1.0, 0.0], 5).is_empty());
    }

    #[test]
    fn test_remove_entry_point_keeps_graph_searchable() {
        let mut graph = HnswGraph::new(8, 50, 32);
        let mut ids = Vec::new();
        for i in 0..30u64 {
            let id = Ulid::new();
            graph.insert(id, unit_vector(i, 16));
            ids.push(id);
        }

        // Removing every other node exercises entry-point replacement.
        for id in ids.iter().step_by(2) {
            graph.remove(*id);
        }

        let results = graph.search(&unit_vector(1, 16), 5);
        assert!(!results.is_empty());
    }
}
