//! Graph file - serialized adjacency with a self-describing header
//!
//! Layout (little-endian throughout):
//!
//! ```text
//! magic(4) = "LHN1" | version(u32) | N(u64) | M(u32) | num_layers(u32)
//! | entry_point(u32) | layer_of_node[N](u8)
//! | offsets[num_layers][N](u64, absolute, 0 = absent)
//! | adjacency lists: degree(u32) | neighbors(u32)[degree]
//! ```
//!
//! Vamana graphs reuse the container with `num_layers = 1` and `M = R`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use memmap2::Mmap;

use crate::error::{EngineError, Result};

const GRAPH_MAGIC: [u8; 4] = *b"LHN1";
const GRAPH_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 8 + 4 + 4 + 4;

/// In-memory graph produced by a builder, consumed by compaction, pruning,
/// and the on-disk writer. `links[node][layer]` is the adjacency of `node`
/// at `layer`, present for `layer <= levels[node]`.
#[derive(Debug, Clone)]
pub struct GraphBuild {
    pub m: u32,
    pub entry_point: u32,
    pub levels: Vec<u8>,
    pub links: Vec<Vec<Vec<u32>>>,
}

impl GraphBuild {
    pub fn num_nodes(&self) -> u64 {
        self.levels.len() as u64
    }

    pub fn num_layers(&self) -> u32 {
        self.levels.iter().copied().max().unwrap_or(0) as u32 + 1
    }

    /// Renumber every node through `perm` (old index -> new index),
    /// preserving topology. Adjacency order is untouched: distances do not
    /// change under renaming, so ascending-distance order survives.
    pub fn permute(&self, perm: &[u32]) -> GraphBuild {
        let n = self.levels.len();
        debug_assert_eq!(perm.len(), n);

        let mut levels = vec![0u8; n];
        let mut links: Vec<Vec<Vec<u32>>> = vec![Vec::new(); n];
        for old in 0..n {
            let new = perm[old] as usize;
            levels[new] = self.levels[old];
            links[new] = self.links[old]
                .iter()
                .map(|layer| layer.iter().map(|&nb| perm[nb as usize]).collect())
                .collect();
        }

        GraphBuild {
            m: self.m,
            entry_point: perm[self.entry_point as usize],
            levels,
            links,
        }
    }
}

/// Serialize a graph atomically (temp + rename)
pub fn write_graph(path: &Path, graph: &GraphBuild) -> Result<()> {
    let n = graph.levels.len();
    let num_layers = graph.num_layers();

    // Lay out adjacency blobs after the fixed-size tables.
    let table_start = HEADER_LEN + n;
    let blobs_start = table_start + num_layers as usize * n * 8;

    let mut offsets = vec![0u64; num_layers as usize * n];
    let mut cursor = blobs_start as u64;
    for layer in 0..num_layers {
        for node in 0..n {
            if layer as u8 <= graph.levels[node] {
                offsets[layer as usize * n + node] = cursor;
                let degree = graph.links[node][layer as usize].len() as u64;
                cursor += 4 + 4 * degree;
            }
        }
    }

    let tmp = path.with_extension("graph.tmp");
    {
        let mut out = BufWriter::new(File::create(&tmp)?);
        out.write_all(&GRAPH_MAGIC)?;
        out.write_all(&GRAPH_VERSION.to_le_bytes())?;
        out.write_all(&(n as u64).to_le_bytes())?;
        out.write_all(&graph.m.to_le_bytes())?;
        out.write_all(&num_layers.to_le_bytes())?;
        out.write_all(&graph.entry_point.to_le_bytes())?;
        out.write_all(&graph.levels)?;
        for off in &offsets {
            out.write_all(&off.to_le_bytes())?;
        }
        for layer in 0..num_layers as usize {
            for node in 0..n {
                if layer as u8 <= graph.levels[node] {
                    let list = &graph.links[node][layer];
                    out.write_all(&(list.len() as u32).to_le_bytes())?;
                    for nb in list {
                        out.write_all(&nb.to_le_bytes())?;
                    }
                }
            }
        }
        out.flush()?;
    }
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Read-only, memory-mapped graph file
#[derive(Debug)]
pub struct GraphFile {
    mmap: Mmap,
    num_nodes: u64,
    m: u32,
    num_layers: u32,
    entry_point: u32,
}

impl GraphFile {
    /// Open the graph and validate its structural invariants: every
    /// adjacency entry names a node in `[0, N)`, no self-loops or
    /// duplicates, layer 0 covers every node, and the entry point exists.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < HEADER_LEN {
            return Err(EngineError::Corrupt(format!(
                "{}: file too small for graph header",
                path.display()
            )));
        }
        if mmap[0..4] != GRAPH_MAGIC {
            return Err(EngineError::Corrupt(format!(
                "{}: bad graph magic",
                path.display()
            )));
        }
        let version = read_u32(&mmap, 4);
        if version != GRAPH_VERSION {
            return Err(EngineError::Corrupt(format!(
                "{}: unsupported graph version {version}",
                path.display()
            )));
        }
        let num_nodes = read_u64(&mmap, 8);
        let m = read_u32(&mmap, 16);
        let num_layers = read_u32(&mmap, 20);
        let entry_point = read_u32(&mmap, 24);

        if num_layers == 0 {
            return Err(EngineError::Corrupt(format!(
                "{}: graph declares zero layers",
                path.display()
            )));
        }
        if num_nodes > 0 && entry_point as u64 >= num_nodes {
            return Err(EngineError::Corrupt(format!(
                "{}: entry point {entry_point} out of range",
                path.display()
            )));
        }
        let table_start = HEADER_LEN as u64 + num_nodes;
        let blobs_start = table_start + num_layers as u64 * num_nodes * 8;
        if (mmap.len() as u64) < blobs_start {
            return Err(EngineError::Corrupt(format!(
                "{}: graph file truncated",
                path.display()
            )));
        }

        let graph = Self {
            mmap,
            num_nodes,
            m,
            num_layers,
            entry_point,
        };
        graph.validate(path)?;
        Ok(graph)
    }

    fn validate(&self, path: &Path) -> Result<()> {
        let mut seen = rustc_hash::FxHashSet::default();
        for node in 0..self.num_nodes as u32 {
            let level = self.level_of(node);
            if level as u32 >= self.num_layers {
                return Err(EngineError::Corrupt(format!(
                    "{}: node {node} claims layer {level} but graph has {} layers",
                    path.display(),
                    self.num_layers
                )));
            }
            for layer in 0..=level {
                let Some(list) = self.try_neighbors(node, layer) else {
                    return Err(EngineError::Corrupt(format!(
                        "{}: node {node} missing adjacency at layer {layer}",
                        path.display()
                    )));
                };
                seen.clear();
                for nb in list {
                    if nb as u64 >= self.num_nodes {
                        return Err(EngineError::Corrupt(format!(
                            "{}: node {node} links to out-of-range node {nb}",
                            path.display()
                        )));
                    }
                    if nb == node {
                        return Err(EngineError::Corrupt(format!(
                            "{}: node {node} has a self-loop",
                            path.display()
                        )));
                    }
                    if !seen.insert(nb) {
                        return Err(EngineError::Corrupt(format!(
                            "{}: node {node} has duplicate neighbor {nb}",
                            path.display()
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn num_nodes(&self) -> u64 {
        self.num_nodes
    }

    pub fn m(&self) -> u32 {
        self.m
    }

    pub fn num_layers(&self) -> u32 {
        self.num_layers
    }

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    /// Highest layer `node` participates in
    pub fn level_of(&self, node: u32) -> u8 {
        self.mmap[HEADER_LEN + node as usize]
    }

    /// Adjacency of `node` at `layer`; empty when the node is absent from
    /// that layer.
    pub fn neighbors(&self, node: u32, layer: u8) -> Vec<u32> {
        self.try_neighbors(node, layer).unwrap_or_default()
    }

    fn try_neighbors(&self, node: u32, layer: u8) -> Option<Vec<u32>> {
        if node as u64 >= self.num_nodes || layer as u32 >= self.num_layers {
            return None;
        }
        let table_start = HEADER_LEN + self.num_nodes as usize;
        let slot = table_start + (layer as usize * self.num_nodes as usize + node as usize) * 8;
        let off = read_u64(&self.mmap, slot) as usize;
        if off == 0 {
            return None;
        }
        let degree = read_u32(&self.mmap, off) as usize;
        let mut out = Vec::with_capacity(degree);
        let base = off + 4;
        for i in 0..degree {
            out.push(read_u32(&self.mmap, base + i * 4));
        }
        Some(out)
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    u64::from_le_bytes(buf[at..at + 8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_layer_graph() -> GraphBuild {
        GraphBuild {
            m: 2,
            entry_point: 0,
            levels: vec![1, 0, 0],
            links: vec![
                vec![vec![1, 2], vec![]],
                vec![vec![0, 2]],
                vec![vec![0, 1]],
            ],
        }
    }

    #[test]
    fn test_write_open_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.graph");
        write_graph(&path, &two_layer_graph()).unwrap();

        let g = GraphFile::open(&path).unwrap();
        assert_eq!(g.num_nodes(), 3);
        assert_eq!(g.num_layers(), 2);
        assert_eq!(g.entry_point(), 0);
        assert_eq!(g.level_of(0), 1);
        assert_eq!(g.neighbors(0, 0), vec![1, 2]);
        assert_eq!(g.neighbors(0, 1), Vec::<u32>::new());
        assert_eq!(g.neighbors(1, 0), vec![0, 2]);
        // Node 1 is absent from layer 1
        assert_eq!(g.neighbors(1, 1), Vec::<u32>::new());
    }

    #[test]
    fn test_self_loop_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.graph");
        let mut g = two_layer_graph();
        g.links[1][0] = vec![1];
        write_graph(&path, &g).unwrap();
        assert!(matches!(
            GraphFile::open(&path).unwrap_err(),
            EngineError::Corrupt(_)
        ));
    }

    #[test]
    fn test_out_of_range_neighbor_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.graph");
        let mut g = two_layer_graph();
        g.links[2][0] = vec![7];
        write_graph(&path, &g).unwrap();
        assert!(matches!(
            GraphFile::open(&path).unwrap_err(),
            EngineError::Corrupt(_)
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.graph");
        write_graph(&path, &two_layer_graph()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] = b'Z';
        std::fs::write(&path, &bytes).unwrap();
        assert!(matches!(
            GraphFile::open(&path).unwrap_err(),
            EngineError::Corrupt(_)
        ));
    }

    #[test]
    fn test_permute_preserves_topology() {
        let g = two_layer_graph();
        // Swap nodes 0 and 2
        let perm = vec![2, 1, 0];
        let p = g.permute(&perm);
        assert_eq!(p.entry_point, 2);
        assert_eq!(p.levels, vec![0, 0, 1]);
        // Old node 1 linked {0, 2}; renamed it links {2, 0}
        assert_eq!(p.links[1][0], vec![2, 0]);
        // Old node 0 (now 2) linked {1, 2} -> {1, 0}
        assert_eq!(p.links[2][0], vec![1, 0]);
    }
}
