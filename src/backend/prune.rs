//! Edge pruning - drop occluded edges to shrink the graph file
//!
//! A neighbor `c` of `n` is occluded when some kept neighbor `s` is both
//! closer to `n` and closer to `c`; such edges contribute little to beam
//! recall because search reaches `c` through `s` anyway. The threshold
//! tightens (< 1.0) or loosens (> 1.0) the occlusion test.

use tracing::debug;

use crate::backend::graph::GraphBuild;
use crate::backend::traits::VectorBuffer;
use crate::distance::Metric;

/// Prune occluded edges in place on every layer. Adjacency lists must be
/// (and remain) sorted by ascending distance from their node.
pub fn prune_edges(
    graph: &mut GraphBuild,
    vectors: &VectorBuffer,
    metric: Metric,
    threshold: f32,
) {
    let mut removed = 0u64;
    let mut total = 0u64;

    for node in 0..graph.levels.len() as u32 {
        for layer in 0..graph.links[node as usize].len() {
            let list = &graph.links[node as usize][layer];
            total += list.len() as u64;

            let mut kept: Vec<u32> = Vec::with_capacity(list.len());
            for &c in list {
                let d_nc = metric.distance(vectors.get(node), vectors.get(c));
                let occluded = kept.iter().any(|&s| {
                    let d_ns = metric.distance(vectors.get(node), vectors.get(s));
                    let d_sc = metric.distance(vectors.get(s), vectors.get(c));
                    d_ns < d_nc && d_sc < threshold * d_nc
                });
                if !occluded {
                    kept.push(c);
                }
            }
            removed += (list.len() - kept.len()) as u64;
            graph.links[node as usize][layer] = kept;
        }
    }

    debug!("pruned {removed} of {total} edges (threshold {threshold})");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_occluded_edge_removed() {
        // Collinear points 0 -- 1 -- 2: the direct 0->2 edge is occluded by 1
        let mut buf = VectorBuffer::new(1);
        buf.push(&[0.0]);
        buf.push(&[1.0]);
        buf.push(&[2.0]);

        let mut g = GraphBuild {
            m: 4,
            entry_point: 0,
            levels: vec![0, 0, 0],
            links: vec![
                vec![vec![1, 2]],
                vec![vec![0, 2]],
                vec![vec![1, 0]],
            ],
        };
        prune_edges(&mut g, &buf, Metric::L2, 1.0);
        assert_eq!(g.links[0][0], vec![1]);
        // 1 keeps both: neither 0 nor 2 occludes the other from 1
        assert_eq!(g.links[1][0], vec![0, 2]);
    }

    #[test]
    fn test_threshold_zero_keeps_everything() {
        let mut buf = VectorBuffer::new(1);
        buf.push(&[0.0]);
        buf.push(&[1.0]);
        buf.push(&[2.0]);
        let mut g = GraphBuild {
            m: 4,
            entry_point: 0,
            levels: vec![0, 0, 0],
            links: vec![vec![vec![1, 2]], vec![vec![0, 2]], vec![vec![1, 0]]],
        };
        prune_edges(&mut g, &buf, Metric::L2, 0.0);
        assert_eq!(g.links[0][0], vec![1, 2]);
    }
}
