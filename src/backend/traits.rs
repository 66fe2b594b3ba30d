//! Backend traits and shared construction primitives

use async_trait::async_trait;

use crate::error::Result;

/// Response-level bookkeeping accumulated by an expander during one search
#[derive(Debug, Clone, Default)]
pub struct ExpanderStatus {
    /// Some batches were dropped after exhausting retries
    pub partial: bool,
    /// Machine-readable reason for the degradation
    pub reason: Option<&'static str>,
    /// Batches successfully embedded
    pub batches_ok: u64,
    /// Batches dropped
    pub batches_failed: u64,
}

/// Supplies embeddings for graph nodes during search.
///
/// The searcher owns the implementation: in non-recompute mode it reads the
/// memory-mapped blob; in recompute mode it resolves node indices to
/// passage texts and re-embeds them. Either way this is the only suspension
/// point inside a query, and deadline/cancellation checks happen at its
/// batch boundaries.
#[async_trait]
pub trait CandidateExpander: Send {
    /// Metadata/time predicate; nodes failing it are never expanded
    fn allows(&self, node: u32) -> bool;

    /// Embeddings for the allowed subset of `nodes`, in input order.
    /// Nodes whose embedding could not be obtained are omitted and
    /// reflected in [`ExpanderStatus`].
    async fn expand(&mut self, nodes: &[u32]) -> Result<Vec<(u32, Vec<f32>)>>;

    /// Embedding of one node regardless of the predicate; used to anchor
    /// traversal at the entry point.
    async fn expand_unfiltered(&mut self, node: u32) -> Result<Option<Vec<f32>>>;

    fn status(&self) -> &ExpanderStatus;
}

/// Dense `N x D` float buffer with row access; the builder's working set
#[derive(Debug, Clone)]
pub struct VectorBuffer {
    data: Vec<f32>,
    dim: usize,
}

impl VectorBuffer {
    pub fn new(dim: usize) -> Self {
        Self {
            data: Vec::new(),
            dim,
        }
    }

    pub fn with_capacity(dim: usize, rows: usize) -> Self {
        Self {
            data: Vec::with_capacity(dim * rows),
            dim,
        }
    }

    pub fn push(&mut self, row: &[f32]) {
        debug_assert_eq!(row.len(), self.dim);
        self.data.extend_from_slice(row);
    }

    pub fn get(&self, i: u32) -> &[f32] {
        let start = i as usize * self.dim;
        &self.data[start..start + self.dim]
    }

    pub fn len(&self) -> usize {
        if self.dim == 0 {
            0
        } else {
            self.data.len() / self.dim
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Reorder rows through `perm` (old index -> new index)
    pub fn permute(&self, perm: &[u32]) -> VectorBuffer {
        let mut out = vec![0.0f32; self.data.len()];
        for old in 0..self.len() {
            let new = perm[old] as usize;
            out[new * self.dim..(new + 1) * self.dim].copy_from_slice(self.get(old as u32));
        }
        VectorBuffer {
            data: out,
            dim: self.dim,
        }
    }
}

/// xorshift64* PRNG; seeded so graph construction is reproducible
#[derive(Debug, Clone)]
pub struct Xorshift {
    state: u64,
}

impl Xorshift {
    pub fn new(seed: u64) -> Self {
        Self {
            // Zero would lock the generator on zero forever
            state: if seed == 0 { 0x5DEE_CE66_D1A4_B5B5 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform in `[0, 1)`
    pub fn next_f64(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }

    /// Uniform in `[0, bound)`
    pub fn next_below(&mut self, bound: u64) -> u64 {
        self.next_u64() % bound
    }
}
