//! Vamana backend - single-layer graph construction (DiskANN style)
//!
//! Starts from a seeded random regular graph, then refines it over two
//! passes: greedy search from the medoid collects a visited set, robust
//! pruning with the `alpha` slack keeps a diverse R-bounded out-list, and
//! reverse edges are pruned the same way on overflow. Search reuses the
//! HNSW beam; a Vamana graph is simply a one-layer graph file.

use rustc_hash::FxHashSet;
use tracing::debug;

use crate::distance::Metric;
use crate::error::{EngineError, Result};

use super::graph::GraphBuild;
use super::hnsw::DEFAULT_SEED;
use super::traits::{VectorBuffer, Xorshift};

/// Vamana construction parameters
#[derive(Debug, Clone)]
pub struct VamanaParams {
    /// Out-degree bound
    pub r: usize,
    /// Beam width during construction
    pub l_build: usize,
    /// Pruning slack; 1.0 is the plain occlusion rule
    pub alpha: f32,
    /// PRNG seed for the initial random graph
    pub seed: u64,
}

impl Default for VamanaParams {
    fn default() -> Self {
        Self {
            r: 32,
            l_build: 100,
            alpha: 1.2,
            seed: DEFAULT_SEED,
        }
    }
}

/// Build a Vamana graph over `vectors` in node-index order.
pub fn build(
    vectors: &VectorBuffer,
    metric: Metric,
    params: &VamanaParams,
    mut progress: Option<&mut dyn FnMut(u64, u64)>,
) -> Result<GraphBuild> {
    let n = vectors.len();
    if n == 0 {
        return Err(EngineError::InvalidInput(
            "cannot build a graph over an empty corpus".into(),
        ));
    }
    if params.r < 2 {
        return Err(EngineError::InvalidInput(format!(
            "Vamana R must be at least 2, got {}",
            params.r
        )));
    }

    let r = params.r;
    let l_build = params.l_build.max(r);
    let mut rng = Xorshift::new(params.seed);

    // Random R-regular out-edges to start from
    let mut links: Vec<Vec<u32>> = Vec::with_capacity(n);
    for node in 0..n as u32 {
        let mut set = FxHashSet::default();
        let want = r.min(n - 1);
        while set.len() < want {
            let cand = rng.next_below(n as u64) as u32;
            if cand != node {
                set.insert(cand);
            }
        }
        let mut list: Vec<u32> = set.into_iter().collect();
        list.sort_unstable();
        links.push(list);
    }

    let entry = medoid(vectors, metric);
    let total_work = 2 * n as u64;

    for pass in 0..2u64 {
        for node in 0..n as u32 {
            let query = vectors.get(node);
            let visited = greedy_collect(vectors, metric, &links, entry, query, l_build);

            let mut pool: Vec<u32> = visited;
            pool.extend_from_slice(&links[node as usize]);
            pool.sort_unstable();
            pool.dedup();
            pool.retain(|&c| c != node);

            let pruned = robust_prune(vectors, metric, node, &pool, params.alpha, r);
            links[node as usize] = pruned.clone();

            for nb in pruned {
                let list = &mut links[nb as usize];
                if !list.contains(&node) {
                    list.push(node);
                    if list.len() > r {
                        let pool: Vec<u32> = list.clone();
                        links[nb as usize] =
                            robust_prune(vectors, metric, nb, &pool, params.alpha, r);
                    }
                }
            }

            if let Some(cb) = progress.as_deref_mut() {
                cb(pass * n as u64 + node as u64 + 1, total_work);
            }
        }
    }

    // Persisted form: ascending distance, no self-loops, no duplicates
    for node in 0..n as u32 {
        let list = &mut links[node as usize];
        list.retain(|&nb| nb != node);
        list.sort_by(|&a, &b| {
            metric
                .distance(vectors.get(node), vectors.get(a))
                .total_cmp(&metric.distance(vectors.get(node), vectors.get(b)))
                .then_with(|| a.cmp(&b))
        });
        list.dedup();
    }

    debug!("built Vamana graph: {} nodes, R={}, entry {}", n, r, entry);

    Ok(GraphBuild {
        m: r as u32,
        entry_point: entry,
        levels: vec![0; n],
        links: links.into_iter().map(|l| vec![l]).collect(),
    })
}

/// Node closest to the corpus mean; the designated search entry point
fn medoid(vectors: &VectorBuffer, metric: Metric) -> u32 {
    let n = vectors.len();
    let dim = vectors.dim();
    let mut mean = vec![0.0f32; dim];
    for i in 0..n as u32 {
        for (m, x) in mean.iter_mut().zip(vectors.get(i)) {
            *m += x;
        }
    }
    for m in &mut mean {
        *m /= n as f32;
    }

    let mut best = 0u32;
    let mut best_dist = f32::MAX;
    for i in 0..n as u32 {
        let d = metric.distance(&mean, vectors.get(i));
        if d < best_dist {
            best = i;
            best_dist = d;
        }
    }
    best
}

/// Greedy beam search over the working graph; returns the visited set
fn greedy_collect(
    vectors: &VectorBuffer,
    metric: Metric,
    links: &[Vec<u32>],
    entry: u32,
    query: &[f32],
    l: usize,
) -> Vec<u32> {
    use std::cmp::Reverse;
    use std::collections::BinaryHeap;

    use super::hnsw::Scored;

    let mut visited: FxHashSet<u32> = FxHashSet::default();
    let mut frontier: BinaryHeap<Reverse<Scored>> = BinaryHeap::new();
    let mut beam: BinaryHeap<Scored> = BinaryHeap::new();
    let mut order: Vec<u32> = Vec::new();

    let d0 = metric.distance(query, vectors.get(entry));
    visited.insert(entry);
    order.push(entry);
    frontier.push(Reverse(Scored {
        dist: d0,
        node: entry,
    }));
    beam.push(Scored {
        dist: d0,
        node: entry,
    });

    while let Some(Reverse(c)) = frontier.pop() {
        let worst = beam.peek().map_or(f32::MAX, |b| b.dist);
        if beam.len() >= l && c.dist > worst {
            break;
        }
        for &nb in &links[c.node as usize] {
            if !visited.insert(nb) {
                continue;
            }
            order.push(nb);
            let d = metric.distance(query, vectors.get(nb));
            let worst = beam.peek().map_or(f32::MAX, |b| b.dist);
            if d < worst || beam.len() < l {
                let s = Scored { dist: d, node: nb };
                frontier.push(Reverse(s));
                beam.push(s);
                if beam.len() > l {
                    beam.pop();
                }
            }
        }
    }
    order
}

/// DiskANN robust pruning: repeatedly keep the closest remaining candidate
/// and discard every candidate it occludes under the `alpha` slack.
fn robust_prune(
    vectors: &VectorBuffer,
    metric: Metric,
    node: u32,
    pool: &[u32],
    alpha: f32,
    r: usize,
) -> Vec<u32> {
    let mut candidates: Vec<(u32, f32)> = pool
        .iter()
        .map(|&c| (c, metric.distance(vectors.get(node), vectors.get(c))))
        .collect();
    candidates.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

    let mut kept: Vec<u32> = Vec::with_capacity(r);
    let mut alive = vec![true; candidates.len()];

    for i in 0..candidates.len() {
        if !alive[i] {
            continue;
        }
        let (p_star, _) = candidates[i];
        kept.push(p_star);
        if kept.len() >= r {
            break;
        }
        for j in (i + 1)..candidates.len() {
            if !alive[j] {
                continue;
            }
            let (c, d_node_c) = candidates[j];
            let d_star_c = metric.distance(vectors.get(p_star), vectors.get(c));
            if alpha * d_star_c <= d_node_c {
                alive[j] = false;
            }
        }
    }
    kept
}
