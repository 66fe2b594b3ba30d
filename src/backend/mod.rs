//! Backend module - pluggable ANN graph engines (HNSW, Vamana)
//!
//! The backend is chosen at build time and recorded in the manifest; both
//! engines persist into the same self-describing graph container and are
//! searched by the same expander-driven beam.

pub mod compact;
pub mod graph;
pub mod hnsw;
pub mod prune;
mod traits;
pub mod vamana;

pub use graph::{write_graph, GraphBuild, GraphFile};
pub use hnsw::{beam_search, BeamResult, HnswParams, DEFAULT_SEED};
pub use traits::{CandidateExpander, ExpanderStatus, VectorBuffer, Xorshift};
pub use vamana::VamanaParams;

use crate::distance::Metric;
use crate::error::Result;
use crate::index::BackendKind;

/// Construction parameters for whichever backend the build selected
#[derive(Debug, Clone)]
pub enum GraphParams {
    Hnsw(HnswParams),
    Vamana(VamanaParams),
}

impl GraphParams {
    pub fn kind(&self) -> BackendKind {
        match self {
            GraphParams::Hnsw(_) => BackendKind::Hnsw,
            GraphParams::Vamana(_) => BackendKind::Vamana,
        }
    }
}

/// Build a graph over vectors in node-index order with the selected backend
pub fn build_graph(
    vectors: &VectorBuffer,
    metric: Metric,
    params: &GraphParams,
    progress: Option<&mut dyn FnMut(u64, u64)>,
) -> Result<GraphBuild> {
    match params {
        GraphParams::Hnsw(p) => hnsw::build(vectors, metric, p, progress),
        GraphParams::Vamana(p) => vamana::build(vectors, metric, p, progress),
    }
}
