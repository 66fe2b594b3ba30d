//! Index searcher - the per-query pipeline
//!
//! One query flows through: query embedding (a single provider call),
//! filter planning (allowed-node bitset + selectivity), graph beam search
//! or brute force over the allowed set, optional hybrid BM25 rescoring,
//! optional date post-sort, and assembly from the passage store.
//!
//! Date sorting is a post-sort over the retrieved beam, not a
//! temporally-aware search: recall of the genuinely most recent passages
//! is bounded by the beam width.

use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::backend::{beam_search, CandidateExpander, GraphFile};
use crate::embedding::{encode_with_retry, EmbedKind, EmbeddingProvider, RetryPolicy};
use crate::error::{EngineError, Result};

use super::bm25::Bm25Sidecar;
use super::embeddings::EmbeddingsStore;
use super::filter::{parse_timestamp, FilterPlan, MetadataFilter, TimeRange};
use super::lock::collect_stale_temps;
use super::meta::IndexMeta;
use super::passages::PassageStore;
use super::recompute::{BlobExpander, CancelToken, QueryLimits, RecomputeExpander};
use super::{index_base, meta_path};

/// Result ordering after retrieval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    Relevance,
    DateDesc,
    DateAsc,
}

impl std::str::FromStr for SortBy {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "relevance" => Ok(SortBy::Relevance),
            "date_desc" => Ok(SortBy::DateDesc),
            "date_asc" => Ok(SortBy::DateAsc),
            other => Err(EngineError::InvalidInput(format!(
                "unknown sort order '{other}'"
            ))),
        }
    }
}

/// Which retrieval strategy served the query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPath {
    Graph,
    BruteForce,
    Lexical,
}

/// Per-query options
#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Beam width; defaults to the index's recorded default
    pub ef_search: Option<usize>,
    /// Hybrid weight: 0 = pure vector, 1 = pure lexical
    pub alpha: f32,
    pub sort_by: SortBy,
    pub filter: Option<MetadataFilter>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// Candidate pool width for rescoring/post-sort; defaults to `5k`
    pub top_k_rescore: Option<usize>,
    pub timeout_ms: Option<u64>,
    pub cancel: Option<CancelToken>,
}

/// One retrieved passage with its raw distance and final score
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub id: String,
    pub distance: f32,
    pub score: f32,
    pub text: String,
    pub metadata: serde_json::Value,
}

/// Query response; `partial` marks degraded retrieval
#[derive(Debug, Clone)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub partial: bool,
    pub reason: Option<String>,
    pub path: SearchPath,
}

/// Searcher tuning independent of any single query
#[derive(Debug, Clone)]
pub struct SearcherConfig {
    /// Recompute LRU capacity, in vectors
    pub cache_capacity: usize,
    /// Expander batch size for recompute and brute force
    pub batch_size: usize,
    /// Selectivity below which filtered queries go brute force
    pub brute_force_threshold: f64,
    pub retry: RetryPolicy,
}

impl Default for SearcherConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 4096,
            batch_size: 128,
            brute_force_threshold: 0.01,
            retry: RetryPolicy::default(),
        }
    }
}

/// Open index ready to answer queries
pub struct IndexSearcher {
    meta: IndexMeta,
    passages: PassageStore,
    graph: GraphFile,
    blob: Option<EmbeddingsStore>,
    provider: Arc<dyn EmbeddingProvider>,
    config: SearcherConfig,
    bm25: OnceLock<Bm25Sidecar>,
    bm25_path: PathBuf,
}

impl std::fmt::Debug for IndexSearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexSearcher")
            .field("meta", &self.meta)
            .field("provider", &self.provider.model_id())
            .field("config", &self.config)
            .finish()
    }
}

impl IndexSearcher {
    /// Open an index directory, verifying artifact consistency and that
    /// the provider matches the model the index was built with.
    pub fn open(
        dir: &Path,
        provider: Arc<dyn EmbeddingProvider>,
        config: SearcherConfig,
    ) -> Result<Self> {
        collect_stale_temps(dir)?;

        let meta_file = meta_path(dir);
        if !meta_file.exists() {
            return Err(EngineError::Corrupt(format!(
                "{}: no manifest found; the index is absent or a build died mid-way",
                dir.display()
            )));
        }
        let meta = IndexMeta::load(&meta_file)?;
        meta.check_model(provider.model_id())?;
        if meta.dimension as usize != provider.dimension() {
            return Err(EngineError::ModelMismatch {
                index: format!("{} ({}d)", meta.model_id, meta.dimension),
                provider: format!("{} ({}d)", provider.model_id(), provider.dimension()),
            });
        }

        let base = index_base(dir);
        let passages = PassageStore::open(&base)?;
        let graph = GraphFile::open(&dir.join(&meta.files.graph))?;

        if passages.len() as u64 != meta.num_passages || graph.num_nodes() != meta.num_passages {
            return Err(EngineError::Corrupt(format!(
                "artifact disagreement: manifest N={}, passages N={}, graph N={}",
                meta.num_passages,
                passages.len(),
                graph.num_nodes()
            )));
        }

        let blob = match (&meta.recompute, &meta.files.embeddings) {
            (false, Some(name)) => Some(EmbeddingsStore::open(
                &dir.join(name),
                meta.dimension as usize,
                meta.num_passages,
            )?),
            (false, None) => {
                return Err(EngineError::Corrupt(
                    "manifest says recompute=false but names no embedding blob".into(),
                ))
            }
            (true, _) => None,
        };

        let bm25_path = dir.join(meta.files.bm25.as_deref().unwrap_or("index.bm25"));
        info!(
            "opened index at {} ({} passages, {} backend)",
            dir.display(),
            meta.num_passages,
            if meta.recompute { "recompute" } else { "blob" }
        );

        Ok(Self {
            meta,
            passages,
            graph,
            blob,
            provider,
            config,
            bm25: OnceLock::new(),
            bm25_path,
        })
    }

    pub fn meta(&self) -> &IndexMeta {
        &self.meta
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    /// Lexical sidecar, built and persisted on first use
    fn bm25(&self) -> Result<&Bm25Sidecar> {
        if let Some(sidecar) = self.bm25.get() {
            return Ok(sidecar);
        }
        let built =
            Bm25Sidecar::load_or_build(&self.bm25_path, &self.passages, &self.meta.tokenizer)?;
        let _ = self.bm25.set(built);
        self.bm25
            .get()
            .ok_or_else(|| EngineError::InvalidInput("BM25 sidecar initialization raced".into()))
    }

    /// Answer a query. See the module docs for the pipeline shape.
    pub async fn search(
        &self,
        query_text: &str,
        k: usize,
        options: &SearchOptions,
    ) -> Result<SearchResponse> {
        if !(0.0..=1.0).contains(&options.alpha) {
            return Err(EngineError::InvalidInput(format!(
                "alpha must be in [0, 1], got {}",
                options.alpha
            )));
        }
        if k == 0 {
            // Short-circuit: no provider call, no traversal
            return Ok(SearchResponse {
                results: Vec::new(),
                partial: false,
                reason: None,
                path: SearchPath::Graph,
            });
        }

        let time = TimeRange {
            from: options.date_from,
            to: options.date_to,
        };
        if time.is_inverted() {
            return Ok(SearchResponse {
                results: Vec::new(),
                partial: false,
                reason: None,
                path: SearchPath::Graph,
            });
        }

        let limits = QueryLimits {
            deadline: options
                .timeout_ms
                .map(|ms| Instant::now() + Duration::from_millis(ms)),
            cancel: options.cancel.clone(),
        };

        let plan = if options.filter.is_some() || !time.is_empty_filter() {
            Some(FilterPlan::build(
                &self.passages,
                options.filter.as_ref(),
                &time,
            )?)
        } else {
            None
        };

        let hybrid = options.alpha > 0.0;
        let query_empty = query_text.trim().is_empty();
        if query_empty {
            if options.alpha == 1.0 {
                return self.lexical_only(query_text, k, plan.as_ref());
            }
            return Err(EngineError::InvalidInput(
                "query text is empty (allowed only for pure lexical search, alpha = 1)".into(),
            ));
        }

        // Candidate pool: wider than k when anything reorders it afterwards
        let k_fetch = options
            .top_k_rescore
            .unwrap_or(if hybrid || options.sort_by != SortBy::Relevance {
                k * 5
            } else {
                k
            })
            .max(k);

        // One provider call for the query regardless of k
        let query_vec = self.embed_query(query_text).await?;

        // Sparse filters skip the graph entirely
        let brute = plan
            .as_ref()
            .is_some_and(|p| p.selectivity() < self.config.brute_force_threshold);

        let (outcome, path) = if brute {
            let plan = plan.as_ref().ok_or_else(|| {
                EngineError::InvalidInput("brute-force path requires a filter plan".into())
            })?;
            debug!(
                "filter selectivity {:.4} below threshold; brute-force over {} nodes",
                plan.selectivity(),
                plan.allowed_count()
            );
            let outcome = self
                .brute_force(&query_vec, k_fetch, plan, limits.clone())
                .await?;
            (outcome, SearchPath::BruteForce)
        } else {
            let ef = options
                .ef_search
                .unwrap_or_else(|| self.meta.ef_search_default())
                .max(k_fetch);
            let outcome = self
                .graph_search(&query_vec, k_fetch, ef, plan.as_ref(), limits.clone())
                .await?;
            (outcome, SearchPath::Graph)
        };

        // Tolerable expansion failures degrade to partial, but a query
        // where no batch at all succeeded is a failed search.
        if outcome.batches_failed > 0 && outcome.batches_ok == 0 {
            return Err(EngineError::ProviderTransient(
                "no embedding batch succeeded during candidate expansion".into(),
            ));
        }
        let partial = outcome.partial;
        let reason = outcome.reason.clone();

        // Hybrid rescoring and final ordering over the candidate pool
        let mut scored = self.score_candidates(query_text, outcome.hits, options.alpha)?;

        // Date ordering is applied over the pool, then truncated
        match options.sort_by {
            SortBy::Relevance => {}
            SortBy::DateDesc => {
                scored.sort_by(|a, b| match (a.timestamp, b.timestamp) {
                    (Some(x), Some(y)) => y.cmp(&x),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                });
            }
            SortBy::DateAsc => {
                scored.sort_by(|a, b| match (a.timestamp, b.timestamp) {
                    (Some(x), Some(y)) => x.cmp(&y),
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (None, None) => std::cmp::Ordering::Equal,
                });
            }
        }
        scored.truncate(k);

        let results: Vec<SearchResult> = scored
            .into_iter()
            .map(|c| SearchResult {
                id: c.passage.id,
                distance: c.distance,
                score: c.score,
                text: c.passage.text,
                metadata: c.passage.metadata,
            })
            .collect();

        Ok(SearchResponse {
            results,
            partial,
            reason,
            path,
        })
    }

    async fn embed_query(&self, query_text: &str) -> Result<Vec<f32>> {
        let prompt = self.meta.query_prompt_template.as_deref().unwrap_or("");
        let templated = format!("{prompt}{query_text}");
        let vectors = encode_with_retry(
            self.provider.as_ref(),
            &[templated.as_str()],
            EmbedKind::Query,
            &self.config.retry,
        )
        .await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| EngineError::ProviderPermanent("provider returned no query vector".into()))
    }

    fn make_expander<'a>(
        &'a self,
        plan: Option<&'a FilterPlan>,
        limits: QueryLimits,
    ) -> Box<dyn CandidateExpander + 'a> {
        match &self.blob {
            Some(blob) => Box::new(BlobExpander::new(blob, plan, limits)),
            None => Box::new(RecomputeExpander::new(
                &self.passages,
                self.provider.as_ref(),
                self.meta.document_prompt_template.as_deref(),
                plan,
                self.config.cache_capacity,
                self.config.batch_size,
                self.config.retry.clone(),
                limits,
            )),
        }
    }

    async fn graph_search(
        &self,
        query: &[f32],
        k: usize,
        ef: usize,
        plan: Option<&FilterPlan>,
        limits: QueryLimits,
    ) -> Result<RetrievalOutcome> {
        let mut expander = self.make_expander(plan, limits);
        let beam = beam_search(
            &self.graph,
            self.meta.metric,
            query,
            k,
            ef,
            expander.as_mut(),
        )
        .await?;

        Ok(RetrievalOutcome::new(
            beam.hits,
            expander.status(),
            beam.deadline_hit,
        ))
    }

    /// Exhaustive distance over the allowed set; used when the filter is
    /// sparser than the brute-force threshold.
    async fn brute_force(
        &self,
        query: &[f32],
        k: usize,
        plan: &FilterPlan,
        limits: QueryLimits,
    ) -> Result<RetrievalOutcome> {
        let allowed = plan.allowed_nodes();
        let mut expander = self.make_expander(Some(plan), limits);

        let mut hits: Vec<(u32, f32)> = Vec::with_capacity(allowed.len().min(k));
        let mut deadline_hit = false;
        for chunk in allowed.chunks(self.config.batch_size) {
            let expanded = match expander.expand(chunk).await {
                Ok(v) => v,
                Err(EngineError::DeadlineExceeded) => {
                    deadline_hit = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            for (node, vec) in expanded {
                hits.push((node, self.meta.metric.distance(query, &vec)));
            }
        }

        hits.sort_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        hits.truncate(k);

        Ok(RetrievalOutcome::new(hits, expander.status(), deadline_hit))
    }

    /// BM25-only retrieval for `alpha = 1` with an empty query embedding
    /// path (no provider call).
    fn lexical_only(
        &self,
        query_text: &str,
        k: usize,
        plan: Option<&FilterPlan>,
    ) -> Result<SearchResponse> {
        let sidecar = self.bm25()?;
        let pred = plan.map(|p| move |node: u32| p.allows(node));
        let ranked = sidecar.search(
            query_text,
            k,
            pred.as_ref().map(|f| f as &dyn Fn(u32) -> bool),
        );

        let scores: Vec<f32> = ranked.iter().map(|(_, s)| *s).collect();
        let norms = min_max_normalize(&scores);

        let mut results = Vec::with_capacity(ranked.len());
        for ((node, _), norm) in ranked.into_iter().zip(norms) {
            let passage = self.passages.get_by_node(node)?;
            results.push(SearchResult {
                id: passage.id,
                distance: f32::MAX,
                score: norm,
                text: passage.text,
                metadata: passage.metadata,
            });
        }
        Ok(SearchResponse {
            results,
            partial: false,
            reason: None,
            path: SearchPath::Lexical,
        })
    }

    /// Convert `(node, distance)` candidates into scored, assembled
    /// passages. With `alpha > 0` the BM25 sidecar contributes; both
    /// components are min-max normalized over the candidate set, so every
    /// final score lands in `[0, 1]`.
    fn score_candidates(
        &self,
        query_text: &str,
        candidates: Vec<(u32, f32)>,
        alpha: f32,
    ) -> Result<Vec<ScoredCandidate>> {
        let sims: Vec<f32> = candidates.iter().map(|(_, d)| -d).collect();
        let sim_norms = min_max_normalize(&sims);

        let bm25_norms = if alpha > 0.0 {
            let nodes: Vec<u32> = candidates.iter().map(|(n, _)| *n).collect();
            let raw = self.bm25()?.score_candidates(query_text, &nodes);
            min_max_normalize(&raw)
        } else {
            vec![0.0; candidates.len()]
        };

        let mut scored = Vec::with_capacity(candidates.len());
        for (i, (node, distance)) in candidates.into_iter().enumerate() {
            let score = (1.0 - alpha) * sim_norms[i] + alpha * bm25_norms[i];
            let passage = self.passages.get_by_node(node)?;
            let timestamp = parse_timestamp(&passage.metadata);
            scored.push(ScoredCandidate {
                node,
                distance,
                score,
                timestamp,
                passage,
            });
        }

        scored.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.distance.total_cmp(&b.distance))
                .then_with(|| a.node.cmp(&b.node))
        });
        Ok(scored)
    }
}

struct ScoredCandidate {
    node: u32,
    distance: f32,
    score: f32,
    timestamp: Option<DateTime<Utc>>,
    passage: super::passages::Passage,
}

/// Retrieval result plus the expander's degradation bookkeeping
struct RetrievalOutcome {
    hits: Vec<(u32, f32)>,
    partial: bool,
    reason: Option<String>,
    batches_ok: u64,
    batches_failed: u64,
}

impl RetrievalOutcome {
    fn new(
        hits: Vec<(u32, f32)>,
        status: &crate::backend::ExpanderStatus,
        deadline_hit: bool,
    ) -> Self {
        Self {
            hits,
            partial: status.partial || deadline_hit,
            reason: status
                .reason
                .map(str::to_string)
                .or_else(|| deadline_hit.then(|| "deadline_exceeded".to_string())),
            batches_ok: status.batches_ok,
            batches_failed: status.batches_failed,
        }
    }
}

/// Min-max over the candidate set. Degenerate sets (one candidate, or all
/// values equal) collapse to a constant, leaving ordering to the distance
/// tie-break, i.e. the vector ordering.
fn min_max_normalize(values: &[f32]) -> Vec<f32> {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if values.len() <= 1 || (max - min) <= f32::EPSILON {
        return vec![0.5; values.len()];
    }
    values.iter().map(|v| (v - min) / (max - min)).collect()
}
