//! Index builder - ingest, embed, assemble, finalize
//!
//! Documents flow through four phases: ingest (id assignment, dedup, and a
//! canonical sort so node numbering is independent of arrival order),
//! embedding (bounded worker pool, completions applied in submission
//! order), graph construction, and an atomic finalize that writes every
//! artifact through temp + rename with the manifest last.

use std::path::Path;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::backend::{self, GraphParams, VectorBuffer};
use crate::distance::Metric;
use crate::embedding::{encode_with_retry, EmbedKind, EmbeddingProvider, RetryPolicy};
use crate::error::{EngineError, Result};

use super::lock::{collect_stale_temps, BuildLock};
use super::meta::{HnswMeta, IndexMeta, MetaFiles, VamanaMeta, META_VERSION, TOKENIZER_ID};
use super::passages::PassageStoreWriter;
use super::{index_base, meta_path};

/// One document handed to the builder. Without an id, a sha256 digest of
/// the text is used, making rebuilds idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub text: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// What to do when two documents resolve to the same passage id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DuplicatePolicy {
    /// Keep the first occurrence, count the rest (idempotent rebuild)
    #[default]
    Skip,
    /// Fail the build
    Fail,
}

/// Build parameters; graph-shape knobs live inside [`GraphParams`]
#[derive(Debug, Clone)]
pub struct BuildParams {
    pub backend: GraphParams,
    pub metric: Metric,
    pub recompute: bool,
    pub compact: bool,
    pub prune_threshold: Option<f32>,
    pub batch_size: usize,
    pub workers: usize,
    pub on_duplicate: DuplicatePolicy,
    pub retry: RetryPolicy,
    pub ef_search_default: u32,
    pub query_prompt_template: Option<String>,
    pub document_prompt_template: Option<String>,
}

impl Default for BuildParams {
    fn default() -> Self {
        Self {
            backend: GraphParams::Hnsw(backend::HnswParams::default()),
            metric: Metric::Cosine,
            recompute: false,
            compact: false,
            prune_threshold: None,
            batch_size: 64,
            workers: 4,
            on_duplicate: DuplicatePolicy::Skip,
            retry: RetryPolicy::default(),
            ef_search_default: 64,
            query_prompt_template: None,
            document_prompt_template: None,
        }
    }
}

/// Build phase reported through the progress callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildPhase {
    Ingest,
    Embed,
    Graph,
    Finalize,
}

pub type ProgressFn<'a> = &'a (dyn Fn(BuildPhase, u64, u64) + Send + Sync);

/// Outcome summary returned alongside the manifest
#[derive(Debug, Clone)]
pub struct BuildReport {
    pub meta: IndexMeta,
    pub duplicates_skipped: u64,
}

/// Builds an index directory from a document sequence
pub struct IndexBuilder {
    params: BuildParams,
}

impl IndexBuilder {
    pub fn new(params: BuildParams) -> Self {
        Self { params }
    }

    pub async fn build(
        &self,
        dir: &Path,
        provider: &dyn EmbeddingProvider,
        documents: impl IntoIterator<Item = Document>,
        progress: Option<ProgressFn<'_>>,
    ) -> Result<BuildReport> {
        let p = &self.params;
        if p.batch_size == 0 || p.workers == 0 {
            return Err(EngineError::InvalidInput(
                "batch_size and workers must be positive".into(),
            ));
        }

        collect_stale_temps(dir)?;
        let _lock = BuildLock::acquire(dir)?;

        // Phase 1: ingest with dedup, then canonical id order
        let mut seen = std::collections::HashSet::new();
        let mut docs: Vec<Ingested> = Vec::new();
        let mut duplicates_skipped = 0u64;
        for (i, doc) in documents.into_iter().enumerate() {
            let id = doc.id.unwrap_or_else(|| derived_id(&doc.text));
            if !seen.insert(id.clone()) {
                match p.on_duplicate {
                    DuplicatePolicy::Skip => {
                        duplicates_skipped += 1;
                        continue;
                    }
                    DuplicatePolicy::Fail => return Err(EngineError::DuplicateId(id)),
                }
            }
            docs.push(Ingested {
                id,
                text: doc.text,
                metadata: doc.metadata,
            });
            if let Some(cb) = progress {
                cb(BuildPhase::Ingest, i as u64 + 1, 0);
            }
        }
        if docs.is_empty() {
            return Err(EngineError::InvalidInput(
                "document source produced no passages".into(),
            ));
        }
        docs.sort_by(|a, b| a.id.cmp(&b.id));
        let n = docs.len();
        info!(
            "ingested {n} passages ({duplicates_skipped} duplicates skipped)"
        );

        // Phase 2: embed in submission order through a bounded worker pool
        let dim = provider.dimension();
        let doc_prompt = p.document_prompt_template.as_deref().unwrap_or("");
        let batches: Vec<Vec<String>> = docs
            .chunks(p.batch_size)
            .map(|chunk| {
                chunk
                    .iter()
                    .map(|d| format!("{doc_prompt}{}", d.text))
                    .collect()
            })
            .collect();
        let total_batches = batches.len() as u64;

        let mut vectors = VectorBuffer::with_capacity(dim, n);
        let mut completed = stream::iter(batches.into_iter())
            .map(|texts| async move {
                let refs: Vec<&str> = texts.iter().map(|s| s.as_str()).collect();
                encode_with_retry(provider, &refs, EmbedKind::Document, &p.retry).await
            })
            .buffered(p.workers);

        let mut done = 0u64;
        while let Some(batch) = completed.next().await {
            for vec in batch? {
                vectors.push(&vec);
            }
            done += 1;
            if let Some(cb) = progress {
                cb(BuildPhase::Embed, done, total_batches);
            }
        }
        drop(completed);
        debug_assert_eq!(vectors.len(), n);

        // Phase 3: graph construction
        let mut graph_cb = |done: u64, total: u64| {
            if let Some(cb) = progress {
                cb(BuildPhase::Graph, done, total);
            }
        };
        let mut graph =
            backend::build_graph(&vectors, p.metric, &p.backend, Some(&mut graph_cb))?;

        // Phase 4: optional edge pruning, then locality compaction
        if let Some(threshold) = p.prune_threshold {
            backend::prune::prune_edges(&mut graph, &vectors, p.metric, threshold);
        }
        if p.compact {
            let perm = backend::compact::bfs_permutation(&graph);
            graph = graph.permute(&perm);
            vectors = vectors.permute(&perm);
            // order[new] = old; every old index appears exactly once
            let mut order: Vec<u32> = (0..n as u32).collect();
            order.sort_by_key(|&old| perm[old as usize]);
            docs = order
                .into_iter()
                .map(|old| std::mem::take(&mut docs[old as usize]))
                .collect();
        }

        // Phase 5: finalize, manifest last
        if let Some(cb) = progress {
            cb(BuildPhase::Finalize, 0, 1);
        }
        let base = index_base(dir);

        let mut writer = PassageStoreWriter::create(&base)?;
        for doc in &docs {
            writer.append(&doc.id, &doc.text, doc.metadata.clone())?;
        }
        writer.finish()?;

        backend::write_graph(&base.with_extension("graph"), &graph)?;

        let embeddings_file = if p.recompute {
            None
        } else {
            let path = base.with_extension("embeddings");
            let mut w = super::embeddings::EmbeddingsWriter::create(&path, dim)?;
            for node in 0..n as u32 {
                w.append(vectors.get(node))?;
            }
            w.finish()?;
            Some("index.embeddings".to_string())
        };

        let fingerprint = fingerprint(provider.model_id(), dim, p, &docs);
        let num_layers = graph.num_layers();
        let entry_point = graph.entry_point;

        let (hnsw_meta, vamana_meta) = match &p.backend {
            GraphParams::Hnsw(h) => (
                Some(HnswMeta {
                    m: h.m as u32,
                    ef_construction: h.ef_construction as u32,
                    ef_search_default: p.ef_search_default,
                    entry_point,
                    num_layers,
                }),
                None,
            ),
            GraphParams::Vamana(v) => (
                None,
                Some(VamanaMeta {
                    r: v.r as u32,
                    l_build: v.l_build as u32,
                    alpha: v.alpha,
                    entry_point,
                }),
            ),
        };

        let meta = IndexMeta {
            version: META_VERSION,
            backend: p.backend.kind(),
            num_passages: n as u64,
            dimension: dim as u32,
            metric: p.metric,
            model_id: provider.model_id().to_string(),
            normalized: provider.normalized(),
            recompute: p.recompute,
            compact: p.compact,
            hnsw: hnsw_meta,
            vamana: vamana_meta,
            files: MetaFiles {
                passages: "index.passages.jsonl".into(),
                offsets: "index.passages.idx".into(),
                graph: "index.graph".into(),
                embeddings: embeddings_file,
                bm25: Some("index.bm25".into()),
            },
            tokenizer: TOKENIZER_ID.into(),
            build_fingerprint: fingerprint,
            query_prompt_template: p.query_prompt_template.clone(),
            document_prompt_template: p.document_prompt_template.clone(),
            extra: serde_json::Map::new(),
        };
        meta.save(&meta_path(dir))?;

        if let Some(cb) = progress {
            cb(BuildPhase::Finalize, 1, 1);
        }
        info!("index built at {} ({n} passages)", dir.display());

        Ok(BuildReport {
            meta,
            duplicates_skipped,
        })
    }
}

/// Document after id assignment and dedup, awaiting node numbering
#[derive(Debug, Clone, Default)]
struct Ingested {
    id: String,
    text: String,
    metadata: serde_json::Value,
}

/// Passage id for documents that did not bring one
fn derived_id(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    format!("{digest:x}")
}

/// sha256 over model id, dimension, count, canonical parameters, and the
/// sorted passage ids
fn fingerprint(model_id: &str, dim: usize, p: &BuildParams, docs: &[Ingested]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model_id.as_bytes());
    hasher.update([0]);
    hasher.update(dim.to_le_bytes());
    hasher.update(docs.len().to_le_bytes());
    hasher.update(canonical_params(p).as_bytes());

    let mut ids: Vec<&str> = docs.iter().map(|d| d.id.as_str()).collect();
    ids.sort_unstable();
    for id in ids {
        hasher.update(id.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

fn canonical_params(p: &BuildParams) -> String {
    let backend = match &p.backend {
        GraphParams::Hnsw(h) => {
            format!("hnsw;m={};efc={};seed={}", h.m, h.ef_construction, h.seed)
        }
        GraphParams::Vamana(v) => format!(
            "vamana;r={};l={};alpha={};seed={}",
            v.r, v.l_build, v.alpha, v.seed
        ),
    };
    format!(
        "{backend};metric={};recompute={};compact={};prune={:?}",
        p.metric, p.recompute, p.compact, p.prune_threshold
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derived_id_is_stable() {
        assert_eq!(derived_id("hello"), derived_id("hello"));
        assert_ne!(derived_id("hello"), derived_id("world"));
    }

    #[test]
    fn test_canonical_params_covers_knobs() {
        let mut p = BuildParams::default();
        let a = canonical_params(&p);
        p.compact = true;
        let b = canonical_params(&p);
        assert_ne!(a, b);
    }
}
