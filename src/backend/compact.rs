//! Compaction - locality-preserving node reordering
//!
//! Renumbers nodes in breadth-first order from the entry point over the
//! layer-0 adjacency, so neighbor sets land in contiguous index ranges and
//! traversal reads the graph file and embedding blob mostly forward.
//! Topology is preserved; only names change.

use std::collections::VecDeque;

use tracing::debug;

use crate::backend::graph::GraphBuild;

/// Permutation mapping old node index -> new node index, BFS order from
/// the entry point. Nodes unreachable on layer 0 keep their relative order
/// and are appended at the end.
pub fn bfs_permutation(graph: &GraphBuild) -> Vec<u32> {
    let n = graph.levels.len();
    let mut perm = vec![u32::MAX; n];
    let mut next = 0u32;

    let mut queue = VecDeque::new();
    queue.push_back(graph.entry_point);
    perm[graph.entry_point as usize] = next;
    next += 1;

    while let Some(node) = queue.pop_front() {
        for &nb in &graph.links[node as usize][0] {
            if perm[nb as usize] == u32::MAX {
                perm[nb as usize] = next;
                next += 1;
                queue.push_back(nb);
            }
        }
    }

    let unreached = n as u32 - next;
    if unreached > 0 {
        debug!("compaction: {unreached} nodes unreachable from entry point");
        for slot in perm.iter_mut() {
            if *slot == u32::MAX {
                *slot = next;
                next += 1;
            }
        }
    }
    perm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> GraphBuild {
        // 3 -> 1 -> 0 -> 2 as a chain anchored at entry 3
        GraphBuild {
            m: 2,
            entry_point: 3,
            levels: vec![0, 0, 0, 0],
            links: vec![
                vec![vec![1, 2]],
                vec![vec![3, 0]],
                vec![vec![0]],
                vec![vec![1]],
            ],
        }
    }

    #[test]
    fn test_bfs_starts_at_entry() {
        let perm = bfs_permutation(&chain());
        assert_eq!(perm[3], 0);
        // 3's neighbor 1 comes next, then 1's neighbors
        assert_eq!(perm[1], 1);
    }

    #[test]
    fn test_permutation_is_bijective() {
        let perm = bfs_permutation(&chain());
        let mut sorted = perm.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_unreachable_nodes_appended() {
        let g = GraphBuild {
            m: 2,
            entry_point: 0,
            levels: vec![0, 0, 0],
            links: vec![vec![vec![1]], vec![vec![0]], vec![vec![]]],
        };
        let perm = bfs_permutation(&g);
        assert_eq!(perm[0], 0);
        assert_eq!(perm[1], 1);
        assert_eq!(perm[2], 2);
    }

    #[test]
    fn test_permuted_graph_topology_preserved() {
        let g = chain();
        let perm = bfs_permutation(&g);
        let p = g.permute(&perm);

        // Edge count per node is preserved under renaming
        let degree_sum: usize = g.links.iter().map(|l| l[0].len()).sum();
        let permuted_sum: usize = p.links.iter().map(|l| l[0].len()).sum();
        assert_eq!(degree_sum, permuted_sum);
        assert_eq!(p.entry_point, 0);
    }
}
