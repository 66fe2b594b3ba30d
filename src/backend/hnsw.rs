//! HNSW backend - hierarchical graph construction and beam search
//!
//! Construction follows Malkov & Yashunin: geometric layer draw, greedy
//! descent to the insertion layer, `ef_construction`-wide candidate search
//! per layer, heuristic neighbor selection, and degree-bounded
//! bidirectional linking. Search is the standard two-heap beam, except
//! neighbor embeddings arrive through a [`CandidateExpander`] so the same
//! traversal serves both the mmap-blob and recompute paths.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::distance::Metric;
use crate::error::{EngineError, Result};

use super::graph::{GraphBuild, GraphFile};
use super::traits::{CandidateExpander, VectorBuffer, Xorshift};

/// Default layer-draw seed; fixed so rebuilds are bit-identical
pub const DEFAULT_SEED: u64 = 0x1EA4_4E11;

/// HNSW construction parameters
#[derive(Debug, Clone)]
pub struct HnswParams {
    /// Out-degree bound per layer (`2M` at layer 0)
    pub m: usize,
    /// Candidate pool width during construction
    pub ef_construction: usize,
    /// Layer-draw PRNG seed
    pub seed: u64,
}

impl Default for HnswParams {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 200,
            seed: DEFAULT_SEED,
        }
    }
}

/// A candidate ordered by distance, ties broken by ascending node index
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Scored {
    pub dist: f32,
    pub node: u32,
}

impl Eq for Scored {}

impl PartialOrd for Scored {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Scored {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.dist
            .total_cmp(&other.dist)
            .then_with(|| self.node.cmp(&other.node))
    }
}

/// Build an HNSW graph over `vectors`, which must be in node-index order.
pub fn build(
    vectors: &VectorBuffer,
    metric: Metric,
    params: &HnswParams,
    mut progress: Option<&mut dyn FnMut(u64, u64)>,
) -> Result<GraphBuild> {
    let n = vectors.len();
    if n == 0 {
        return Err(EngineError::InvalidInput(
            "cannot build a graph over an empty corpus".into(),
        ));
    }
    if params.m < 2 {
        return Err(EngineError::InvalidInput(format!(
            "HNSW M must be at least 2, got {}",
            params.m
        )));
    }

    let mut b = Builder {
        vectors,
        metric,
        m: params.m,
        m0: params.m * 2,
        ef_construction: params.ef_construction.max(params.m),
        level_mult: 1.0 / (params.m as f64).ln(),
        rng: Xorshift::new(params.seed),
        levels: Vec::with_capacity(n),
        links: Vec::with_capacity(n),
        entry_point: 0,
        top_level: 0,
    };

    for node in 0..n as u32 {
        b.insert(node);
        if let Some(cb) = progress.as_deref_mut() {
            cb(node as u64 + 1, n as u64);
        }
    }

    let graph = b.finish();
    debug!(
        "built HNSW graph: {} nodes, {} layers, entry point {}",
        n,
        graph.num_layers(),
        graph.entry_point
    );
    Ok(graph)
}

struct Builder<'a> {
    vectors: &'a VectorBuffer,
    metric: Metric,
    m: usize,
    m0: usize,
    ef_construction: usize,
    level_mult: f64,
    rng: Xorshift,
    levels: Vec<u8>,
    links: Vec<Vec<Vec<u32>>>,
    entry_point: u32,
    top_level: u8,
}

impl<'a> Builder<'a> {
    fn dist(&self, a: u32, b: u32) -> f32 {
        self.metric.distance(self.vectors.get(a), self.vectors.get(b))
    }

    fn max_conn(&self, layer: u8) -> usize {
        if layer == 0 {
            self.m0
        } else {
            self.m
        }
    }

    fn draw_level(&mut self) -> u8 {
        let unif = self.rng.next_f64().max(1e-12);
        let level = (-unif.ln() * self.level_mult).floor();
        level.min(15.0) as u8
    }

    fn insert(&mut self, node: u32) {
        let level = self.draw_level();
        self.levels.push(level);
        self.links.push(vec![Vec::new(); level as usize + 1]);

        if node == 0 {
            self.entry_point = 0;
            self.top_level = level;
            return;
        }

        let query = self.vectors.get(node);

        // Greedy 1-best descent from the top layer to level+1
        let mut ep = self.entry_point;
        for layer in ((level + 1)..=self.top_level).rev() {
            ep = self.greedy_step(query, ep, layer);
        }

        // Insert with ef_construction candidates from min(level, top) down
        for layer in (0..=level.min(self.top_level)).rev() {
            let candidates = self.search_layer(query, &[ep], self.ef_construction, layer);
            let selected = self.select_neighbors(&candidates, self.max_conn(layer));

            self.links[node as usize][layer as usize] =
                selected.iter().map(|s| s.node).collect();

            for s in &selected {
                self.link_back(s.node, node, layer);
            }

            if let Some(best) = candidates.first() {
                ep = best.node;
            }
        }

        if level > self.top_level {
            self.top_level = level;
            self.entry_point = node;
        }
    }

    fn greedy_step(&self, query: &[f32], entry: u32, layer: u8) -> u32 {
        let mut best = entry;
        let mut best_dist = self.metric.distance(query, self.vectors.get(entry));
        loop {
            let mut improved = false;
            for &nb in &self.links[best as usize][layer as usize] {
                let d = self.metric.distance(query, self.vectors.get(nb));
                if d < best_dist {
                    best = nb;
                    best_dist = d;
                    improved = true;
                }
            }
            if !improved {
                return best;
            }
        }
    }

    /// Bounded best-first search over one layer; returns candidates sorted
    /// by ascending distance.
    fn search_layer(&self, query: &[f32], entries: &[u32], ef: usize, layer: u8) -> Vec<Scored> {
        let mut visited: FxHashSet<u32> = FxHashSet::default();
        let mut frontier: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
        let mut results: BinaryHeap<Scored> = BinaryHeap::new();

        for &ep in entries {
            if visited.insert(ep) {
                let d = self.metric.distance(query, self.vectors.get(ep));
                let s = Scored { dist: d, node: ep };
                frontier.push(Reverse(s));
                results.push(s);
            }
        }

        while let Some(Reverse(c)) = frontier.pop() {
            let worst = results.peek().map_or(f32::MAX, |r| r.dist);
            if results.len() >= ef && c.dist > worst {
                break;
            }
            for &nb in &self.links[c.node as usize][layer as usize] {
                if !visited.insert(nb) {
                    continue;
                }
                let d = self.metric.distance(query, self.vectors.get(nb));
                let worst = results.peek().map_or(f32::MAX, |r| r.dist);
                if d < worst || results.len() < ef {
                    let s = Scored { dist: d, node: nb };
                    frontier.push(Reverse(s));
                    results.push(s);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }

        let mut out: Vec<Scored> = results.into_vec();
        out.sort();
        out
    }

    /// Heuristic selection: keep a candidate only when it is closer to the
    /// query than to every neighbor already kept, then fill any remaining
    /// quota with the closest skipped candidates.
    fn select_neighbors(&self, candidates: &[Scored], max: usize) -> Vec<Scored> {
        if candidates.len() <= max {
            return candidates.to_vec();
        }

        let mut selected: Vec<Scored> = Vec::with_capacity(max);
        let mut skipped: Vec<Scored> = Vec::new();

        for &c in candidates {
            if selected.len() >= max {
                break;
            }
            let diverse = selected
                .iter()
                .all(|s| c.dist < self.dist(c.node, s.node));
            if diverse {
                selected.push(c);
            } else {
                skipped.push(c);
            }
        }

        for c in skipped {
            if selected.len() >= max {
                break;
            }
            selected.push(c);
        }
        selected.sort();
        selected
    }

    /// Add the reverse edge `from -> new_node`, re-running the heuristic
    /// when the degree bound is exceeded.
    fn link_back(&mut self, from: u32, new_node: u32, layer: u8) {
        let max = self.max_conn(layer);
        let list = &mut self.links[from as usize][layer as usize];
        if list.contains(&new_node) {
            return;
        }
        list.push(new_node);
        if list.len() <= max {
            return;
        }

        let candidates: Vec<Scored> = self.links[from as usize][layer as usize]
            .iter()
            .map(|&nb| Scored {
                dist: self.dist(from, nb),
                node: nb,
            })
            .collect();
        let mut sorted = candidates;
        sorted.sort();
        let selected = self.select_neighbors(&sorted, max);
        self.links[from as usize][layer as usize] = selected.iter().map(|s| s.node).collect();
    }

    /// Normalize adjacency into its persisted form: per-node lists sorted
    /// by ascending distance, deduplicated, no self-loops.
    fn finish(mut self) -> GraphBuild {
        for node in 0..self.links.len() as u32 {
            for layer in 0..self.links[node as usize].len() {
                let mut scored: Vec<Scored> = self.links[node as usize][layer]
                    .iter()
                    .filter(|&&nb| nb != node)
                    .map(|&nb| Scored {
                        dist: self.dist(node, nb),
                        node: nb,
                    })
                    .collect();
                scored.sort();
                scored.dedup_by_key(|s| s.node);
                self.links[node as usize][layer] = scored.into_iter().map(|s| s.node).collect();
            }
        }

        GraphBuild {
            m: self.m as u32,
            entry_point: self.entry_point,
            levels: self.levels,
            links: self.links,
        }
    }
}

/// Beam search outcome; `deadline_hit` marks a beam returned early
#[derive(Debug)]
pub struct BeamResult {
    pub hits: Vec<(u32, f32)>,
    pub deadline_hit: bool,
}

/// Graph-based ANN search driven by a [`CandidateExpander`].
///
/// Upper layers run a greedy 1-best descent; layer 0 runs the two-heap
/// beam bounded by `ef`. Nodes the expander's predicate rejects are never
/// embedded or enqueued, so sparsely-selective filters should take the
/// brute-force path instead of this one.
pub async fn beam_search(
    graph: &GraphFile,
    metric: Metric,
    query: &[f32],
    k: usize,
    ef: usize,
    expander: &mut dyn CandidateExpander,
) -> Result<BeamResult> {
    if graph.num_nodes() == 0 || k == 0 {
        return Ok(BeamResult {
            hits: Vec::new(),
            deadline_hit: false,
        });
    }
    let ef = ef.max(k);

    let entry = graph.entry_point();
    let entry_vec = match expander.expand_unfiltered(entry).await {
        Ok(Some(vec)) => vec,
        // Entry embedding unavailable; nothing anchors the traversal.
        Ok(None) => {
            return Ok(BeamResult {
                hits: Vec::new(),
                deadline_hit: false,
            })
        }
        Err(EngineError::DeadlineExceeded) => {
            return Ok(BeamResult {
                hits: Vec::new(),
                deadline_hit: true,
            })
        }
        Err(e) => return Err(e),
    };

    let mut deadline_hit = false;
    let mut cur = Scored {
        dist: metric.distance(query, &entry_vec),
        node: entry,
    };

    // Greedy descent through the upper layers
    'descent: for layer in (1..graph.num_layers()).rev() {
        loop {
            let neighbors = graph.neighbors(cur.node, layer as u8);
            if neighbors.is_empty() {
                break;
            }
            let expanded = match expander.expand(&neighbors).await {
                Ok(v) => v,
                Err(EngineError::DeadlineExceeded) => {
                    deadline_hit = true;
                    break 'descent;
                }
                Err(e) => return Err(e),
            };
            let mut improved = false;
            for (node, vec) in expanded {
                let d = metric.distance(query, &vec);
                if d < cur.dist || (d == cur.dist && node < cur.node) {
                    cur = Scored { dist: d, node };
                    improved = true;
                }
            }
            if !improved {
                break;
            }
        }
    }

    // Layer-0 beam
    let mut visited: FxHashSet<u32> = FxHashSet::default();
    let mut frontier: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
    let mut results: BinaryHeap<Scored> = BinaryHeap::new();

    visited.insert(cur.node);
    frontier.push(Reverse(cur));
    if expander.allows(cur.node) {
        results.push(cur);
    }

    if !deadline_hit {
        'beam: while let Some(Reverse(c)) = frontier.pop() {
            let worst = results.peek().map_or(f32::MAX, |r| r.dist);
            if results.len() >= ef && c.dist > worst {
                break;
            }

            let unvisited: Vec<u32> = graph
                .neighbors(c.node, 0)
                .into_iter()
                .filter(|nb| visited.insert(*nb))
                .collect();
            if unvisited.is_empty() {
                continue;
            }

            let expanded = match expander.expand(&unvisited).await {
                Ok(v) => v,
                Err(EngineError::DeadlineExceeded) => {
                    deadline_hit = true;
                    break 'beam;
                }
                Err(e) => return Err(e),
            };

            for (node, vec) in expanded {
                let d = metric.distance(query, &vec);
                let worst = results.peek().map_or(f32::MAX, |r| r.dist);
                if d < worst || results.len() < ef {
                    let s = Scored { dist: d, node };
                    frontier.push(Reverse(s));
                    results.push(s);
                    if results.len() > ef {
                        results.pop();
                    }
                }
            }
        }
    }

    let mut hits: Vec<Scored> = results.into_vec();
    hits.sort();
    hits.truncate(k);

    Ok(BeamResult {
        hits: hits.into_iter().map(|s| (s.node, s.dist)).collect(),
        deadline_hit,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_vector(seed: u64, dim: usize) -> Vec<f32> {
        (0..dim)
            .map(|i| (seed as f32 * 0.37 + i as f32 * 0.11).sin())
            .collect()
    }

    fn buffer(n: usize, dim: usize) -> VectorBuffer {
        let mut buf = VectorBuffer::with_capacity(dim, n);
        for i in 0..n {
            buf.push(&make_vector(i as u64, dim));
        }
        buf
    }

    #[test]
    fn test_build_small_graph_invariants() {
        let buf = buffer(64, 8);
        let graph = build(&buf, Metric::Cosine, &HnswParams::default(), None).unwrap();

        assert_eq!(graph.num_nodes(), 64);
        for node in 0..64u32 {
            for (layer, list) in graph.links[node as usize].iter().enumerate() {
                let bound = if layer == 0 { 32 } else { 16 };
                assert!(list.len() <= bound, "degree bound violated");
                assert!(!list.contains(&node), "self-loop");
                let mut dedup = list.clone();
                dedup.sort_unstable();
                dedup.dedup();
                assert_eq!(dedup.len(), list.len(), "duplicate neighbors");
            }
        }
    }

    #[test]
    fn test_adjacency_sorted_by_distance() {
        let buf = buffer(48, 8);
        let graph = build(&buf, Metric::L2, &HnswParams::default(), None).unwrap();
        for node in 0..48u32 {
            for list in &graph.links[node as usize] {
                let dists: Vec<f32> = list
                    .iter()
                    .map(|&nb| Metric::L2.distance(buf.get(node), buf.get(nb)))
                    .collect();
                for w in dists.windows(2) {
                    assert!(w[0] <= w[1], "adjacency not sorted by distance");
                }
            }
        }
    }

    #[test]
    fn test_build_deterministic_with_seed() {
        let buf = buffer(40, 8);
        let a = build(&buf, Metric::Cosine, &HnswParams::default(), None).unwrap();
        let b = build(&buf, Metric::Cosine, &HnswParams::default(), None).unwrap();
        assert_eq!(a.entry_point, b.entry_point);
        assert_eq!(a.levels, b.levels);
        assert_eq!(a.links, b.links);
    }

    #[test]
    fn test_empty_corpus_rejected() {
        let buf = VectorBuffer::new(4);
        assert!(matches!(
            build(&buf, Metric::Cosine, &HnswParams::default(), None).unwrap_err(),
            EngineError::InvalidInput(_)
        ));
    }
}
