//! Index module - building, searching, and the on-disk layout

mod bm25;
mod builder;
mod embeddings;
mod filter;
mod lock;
mod locate;
mod meta;
mod passages;
mod recompute;
mod searcher;

pub use bm25::{tokenize, Bm25Sidecar};
pub use builder::{
    BuildParams, BuildPhase, BuildReport, Document, DuplicatePolicy, IndexBuilder, ProgressFn,
};
pub use embeddings::{drop_embeddings, EmbeddingsStore, EmbeddingsWriter};
pub use filter::{FilterPlan, MetadataFilter, TimeRange};
pub use lock::{collect_stale_temps, BuildLock};
pub use locate::{find_index, list_indexes};
pub use meta::{BackendKind, HnswMeta, IndexMeta, MetaFiles, VamanaMeta, TOKENIZER_ID};
pub use passages::{Passage, PassageStore, PassageStoreWriter};
pub use recompute::{
    BlobExpander, CancelToken, QueryLimits, RecomputeExpander, REASON_TRANSIENT_EXHAUSTED,
};
pub use searcher::{
    IndexSearcher, SearchOptions, SearchPath, SearchResponse, SearchResult, SearcherConfig, SortBy,
};

use std::path::{Path, PathBuf};

/// Base path of the index artifacts inside a directory; extensions hang
/// off this (`index.passages.jsonl`, `index.graph`, ...)
pub fn index_base(dir: &Path) -> PathBuf {
    dir.join("index")
}

/// Manifest path inside an index directory
pub fn meta_path(dir: &Path) -> PathBuf {
    dir.join("index.meta.json")
}
