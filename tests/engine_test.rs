//! End-to-end tests over the engine: build, search, hybrid, filters,
//! failure degradation, and on-disk format invariants.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use leann_engine::backend::{GraphParams, HnswParams, VamanaParams};
use leann_engine::embedding::{EmbedKind, EmbeddingProvider, HashedProvider};
use leann_engine::error::{EngineError, Result};
use leann_engine::index::{
    BuildParams, Document, DuplicatePolicy, IndexBuilder, IndexSearcher, MetadataFilter,
    PassageStore, SearchOptions, SearchPath, SearcherConfig, SortBy,
};
use leann_engine::Metric;

/// Deterministic provider backed by an explicit text -> vector table
struct TableProvider {
    model: String,
    dimension: usize,
    table: HashMap<String, Vec<f32>>,
    calls: AtomicU64,
}

impl TableProvider {
    fn new(dimension: usize, entries: &[(&str, &[f32])]) -> Self {
        Self {
            model: format!("table-{dimension}d"),
            dimension,
            table: entries
                .iter()
                .map(|(t, v)| (t.to_string(), v.to_vec()))
                .collect(),
            calls: AtomicU64::new(0),
        }
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EmbeddingProvider for TableProvider {
    fn model_id(&self) -> &str {
        &self.model
    }
    fn dimension(&self) -> usize {
        self.dimension
    }
    fn normalized(&self) -> bool {
        true
    }
    async fn encode(&self, texts: &[&str], _kind: EmbedKind) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        texts
            .iter()
            .map(|t| {
                self.table
                    .get(*t)
                    .cloned()
                    .ok_or_else(|| EngineError::ProviderPermanent(format!("unknown text: {t}")))
            })
            .collect()
    }
}

fn s1_provider() -> Arc<TableProvider> {
    Arc::new(TableProvider::new(
        3,
        &[
            ("the cat sits on the mat", &[1.0, 0.0, 0.0]),
            ("dogs bark at night", &[0.0, 1.0, 0.0]),
            ("the mat is blue", &[0.0, 0.0, 1.0]),
            ("cat mat", &[0.7, 0.0, 0.3]),
            ("mat", &[0.55, 0.0, 0.45]),
        ],
    ))
}

fn s1_documents() -> Vec<Document> {
    vec![
        Document {
            id: Some("A".into()),
            text: "the cat sits on the mat".into(),
            metadata: json!({}),
        },
        Document {
            id: Some("B".into()),
            text: "dogs bark at night".into(),
            metadata: json!({}),
        },
        Document {
            id: Some("C".into()),
            text: "the mat is blue".into(),
            metadata: json!({}),
        },
    ]
}

fn default_params() -> BuildParams {
    BuildParams {
        backend: GraphParams::Hnsw(HnswParams::default()),
        metric: Metric::Cosine,
        ..BuildParams::default()
    }
}

async fn build_index(
    dir: &Path,
    provider: &dyn EmbeddingProvider,
    params: BuildParams,
    docs: Vec<Document>,
) {
    IndexBuilder::new(params)
        .build(dir, provider, docs, None)
        .await
        .expect("build failed");
}

fn open(dir: &Path, provider: Arc<dyn EmbeddingProvider>) -> IndexSearcher {
    IndexSearcher::open(dir, provider, SearcherConfig::default()).expect("open failed")
}

fn result_ids(response: &leann_engine::index::SearchResponse) -> Vec<String> {
    response.results.iter().map(|r| r.id.clone()).collect()
}

// S1: exact-match retrieval with one-hot document vectors
#[tokio::test]
async fn s1_exact_match_retrieval() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;

    let searcher = open(dir.path(), provider);
    let response = searcher
        .search("cat mat", 2, &SearchOptions::default())
        .await
        .unwrap();

    assert_eq!(result_ids(&response), vec!["A", "C"]);
    assert!(!response.partial);
    assert!(response.results[0].distance <= response.results[1].distance);
}

// S2: recompute and blob modes agree on results and distances
#[tokio::test]
async fn s2_recompute_parity() {
    let provider = s1_provider();

    let blob_dir = tempfile::tempdir().unwrap();
    build_index(blob_dir.path(), provider.as_ref(), default_params(), s1_documents()).await;

    let rc_dir = tempfile::tempdir().unwrap();
    let rc_params = BuildParams {
        recompute: true,
        ..default_params()
    };
    build_index(rc_dir.path(), provider.as_ref(), rc_params, s1_documents()).await;

    let blob = open(blob_dir.path(), provider.clone())
        .search("cat mat", 3, &SearchOptions::default())
        .await
        .unwrap();
    let recomputed = open(rc_dir.path(), provider)
        .search("cat mat", 3, &SearchOptions::default())
        .await
        .unwrap();

    assert_eq!(result_ids(&blob), result_ids(&recomputed));
    for (a, b) in blob.results.iter().zip(&recomputed.results) {
        assert!((a.distance - b.distance).abs() < 1e-6);
    }
}

fn thousand_documents() -> Vec<Document> {
    (0..1000)
        .map(|i| Document {
            id: Some(format!("doc-{i:04}")),
            text: format!("passage number {i} about topic {}", i % 37),
            metadata: if i % 200 == 0 {
                json!({"tag": "pinned"})
            } else {
                json!({"tag": "normal"})
            },
        })
        .collect()
}

// S3: sparse filter routes to brute force over the allowed set
#[tokio::test]
async fn s3_filter_brute_force_fallback() {
    let dir = tempfile::tempdir().unwrap();
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashedProvider::new(16));
    build_index(dir.path(), provider.as_ref(), default_params(), thousand_documents()).await;

    let searcher = open(dir.path(), provider);
    let options = SearchOptions {
        filter: Some(MetadataFilter::parse("tag=pinned").unwrap()),
        ..SearchOptions::default()
    };
    let response = searcher
        .search("passage number 1 about topic 1", 10, &options)
        .await
        .unwrap();

    // Exactly the 5 pinned passages, via the brute-force path
    assert_eq!(response.path, SearchPath::BruteForce);
    assert_eq!(response.results.len(), 5);
    for r in &response.results {
        assert_eq!(r.metadata["tag"], "pinned");
    }
    for w in response.results.windows(2) {
        assert!(w[0].distance <= w[1].distance);
    }
}

/// Wraps a provider; once armed, every multi-text document batch fails
/// transiently until the retry budget is exhausted. Query embeddings and
/// single-text batches keep working, so traversal can anchor itself.
struct FlakyProvider {
    inner: HashedProvider,
    armed: std::sync::atomic::AtomicBool,
}

impl FlakyProvider {
    fn arm(&self) {
        self.armed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingProvider for FlakyProvider {
    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
    fn normalized(&self) -> bool {
        self.inner.normalized()
    }
    async fn encode(&self, texts: &[&str], kind: EmbedKind) -> Result<Vec<Vec<f32>>> {
        if self.armed.load(Ordering::SeqCst) && kind == EmbedKind::Document && texts.len() > 1 {
            return Err(EngineError::ProviderTransient("synthetic overload".into()));
        }
        self.inner.encode(texts, kind).await
    }
}

// S4: transient provider failures degrade to a partial response
#[tokio::test]
async fn s4_partial_result_on_provider_failure() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(FlakyProvider {
        inner: HashedProvider::new(16),
        armed: std::sync::atomic::AtomicBool::new(false),
    });

    let docs: Vec<Document> = (0..100)
        .map(|i| Document {
            id: Some(format!("p{i:03}")),
            text: format!("passage body {i} with words {}", i * 7),
            metadata: json!({}),
        })
        .collect();
    let params = BuildParams {
        recompute: true,
        ..default_params()
    };
    build_index(dir.path(), provider.as_ref(), params, docs).await;
    provider.arm();

    let config = SearcherConfig {
        batch_size: 8,
        retry: leann_engine::embedding::RetryPolicy {
            retry_max: 2,
            base_delay: std::time::Duration::from_millis(1),
        },
        ..SearcherConfig::default()
    };
    let searcher = IndexSearcher::open(dir.path(), provider, config).unwrap();

    let response = searcher
        .search("passage body 3 with words 21", 10, &SearchOptions::default())
        .await
        .unwrap();

    assert!(response.partial);
    assert_eq!(response.reason.as_deref(), Some("provider_transient_exhausted"));
    assert!(!response.results.is_empty());
}

// S5: rebuilds over the same corpus are bit-identical
#[tokio::test]
async fn s5_idempotent_rebuild() {
    let provider = s1_provider();

    let dir_a = tempfile::tempdir().unwrap();
    build_index(dir_a.path(), provider.as_ref(), default_params(), s1_documents()).await;

    // Same corpus, different arrival order
    let mut shuffled = s1_documents();
    shuffled.reverse();
    let dir_b = tempfile::tempdir().unwrap();
    build_index(dir_b.path(), provider.as_ref(), default_params(), shuffled).await;

    let meta_a =
        leann_engine::index::IndexMeta::load(&leann_engine::index::meta_path(dir_a.path()))
            .unwrap();
    let meta_b =
        leann_engine::index::IndexMeta::load(&leann_engine::index::meta_path(dir_b.path()))
            .unwrap();
    assert_eq!(meta_a.build_fingerprint, meta_b.build_fingerprint);

    let graph_a = std::fs::read(dir_a.path().join("index.graph")).unwrap();
    let graph_b = std::fs::read(dir_b.path().join("index.graph")).unwrap();
    assert_eq!(graph_a, graph_b, "graph files must be byte-identical");
}

// S6: hybrid rescoring interpolates between vector and BM25 orderings
#[tokio::test]
async fn s6_hybrid_rescore() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;
    let searcher = open(dir.path(), provider);

    // Pin the candidate pool so all three runs normalize over the same set
    let with_alpha = |alpha: f32| SearchOptions {
        alpha,
        top_k_rescore: Some(3),
        ..SearchOptions::default()
    };

    let vector_only = searcher.search("mat", 2, &with_alpha(0.0)).await.unwrap();
    assert_eq!(result_ids(&vector_only), vec!["A", "C"]);

    // BM25 favors C: equal term frequency, shorter document
    let lexical_only = searcher.search("mat", 2, &with_alpha(1.0)).await.unwrap();
    assert_eq!(result_ids(&lexical_only), vec!["C", "A"]);

    let blended = searcher.search("mat", 2, &with_alpha(0.5)).await.unwrap();
    let score_of = |resp: &leann_engine::index::SearchResponse, id: &str| {
        resp.results
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.score)
            .expect("id missing from results")
    };
    for id in ["A", "C"] {
        let s0 = score_of(&vector_only, id);
        let s1 = score_of(&lexical_only, id);
        let s_half = score_of(&blended, id);
        let (lo, hi) = if s0 <= s1 { (s0, s1) } else { (s1, s0) };
        assert!(
            s_half >= lo - 1e-6 && s_half <= hi + 1e-6,
            "alpha=0.5 score {s_half} for {id} outside [{lo}, {hi}]"
        );
    }
}

#[tokio::test]
async fn empty_corpus_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    let err = IndexBuilder::new(default_params())
        .build(dir.path(), provider.as_ref(), Vec::<Document>::new(), None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));
}

#[tokio::test]
async fn k_larger_than_n_returns_n() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;

    let response = open(dir.path(), provider)
        .search("cat mat", 50, &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(response.results.len(), 3);
}

#[tokio::test]
async fn k_zero_short_circuits_without_provider_call() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;

    let calls_after_build = provider.calls();
    let searcher = open(dir.path(), provider.clone());
    let response = searcher
        .search("cat mat", 0, &SearchOptions::default())
        .await
        .unwrap();

    assert!(response.results.is_empty());
    assert_eq!(provider.calls(), calls_after_build, "k=0 must not call the provider");
}

#[tokio::test]
async fn empty_query_rules() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;
    let searcher = open(dir.path(), provider);

    // Vector search over an empty query is an input error
    let err = searcher
        .search("", 2, &SearchOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput(_)));

    // Pure lexical with no tokens yields empty results, no error
    let options = SearchOptions {
        alpha: 1.0,
        ..SearchOptions::default()
    };
    let response = searcher.search("   ", 2, &options).await.unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.path, SearchPath::Lexical);
}

#[tokio::test]
async fn inverted_date_range_is_empty_not_error() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;

    let options = SearchOptions {
        date_from: Some("2024-06-01T00:00:00Z".parse().unwrap()),
        date_to: Some("2024-01-01T00:00:00Z".parse().unwrap()),
        ..SearchOptions::default()
    };
    let response = open(dir.path(), provider)
        .search("cat mat", 2, &options)
        .await
        .unwrap();
    assert!(response.results.is_empty());
    assert!(!response.partial);
}

// L1: node <-> passage id round-trip on a built index
#[tokio::test]
async fn l1_passage_roundtrip() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;

    let store = PassageStore::open(&leann_engine::index::index_base(dir.path())).unwrap();
    for node in 0..store.len() as u32 {
        let passage = store.get_by_node(node).unwrap();
        assert_eq!(passage.id, store.id_of(node).unwrap());
    }
}

// L3: filtering never grows the result set
#[tokio::test]
async fn l3_filter_monotonicity() {
    let dir = tempfile::tempdir().unwrap();
    let provider: Arc<dyn EmbeddingProvider> = Arc::new(HashedProvider::new(16));
    build_index(dir.path(), provider.as_ref(), default_params(), thousand_documents()).await;
    let searcher = open(dir.path(), provider);

    let unfiltered = searcher
        .search("passage number 5 about topic 5", 10, &SearchOptions::default())
        .await
        .unwrap();

    // tag=normal passes ~99.5% of nodes, keeping the graph path
    let options = SearchOptions {
        filter: Some(MetadataFilter::parse("tag=normal").unwrap()),
        ..SearchOptions::default()
    };
    let filtered = searcher
        .search("passage number 5 about topic 5", 10, &options)
        .await
        .unwrap();

    assert_eq!(filtered.path, SearchPath::Graph);
    assert!(filtered.results.len() <= unfiltered.results.len());
    for r in &filtered.results {
        assert_eq!(r.metadata["tag"], "normal");
    }
}

// L4: hybrid scores stay inside [0, 1] for any alpha
#[tokio::test]
async fn l4_hybrid_score_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;
    let searcher = open(dir.path(), provider);

    for alpha in [0.0, 0.3, 0.7, 1.0] {
        let options = SearchOptions {
            alpha,
            ..SearchOptions::default()
        };
        let response = searcher.search("cat mat", 3, &options).await.unwrap();
        for r in &response.results {
            assert!(
                (0.0..=1.0).contains(&r.score),
                "score {} out of bounds at alpha {alpha}",
                r.score
            );
        }
    }
}

// L5 (scaled down): beam search recall against brute force
#[tokio::test]
async fn recall_floor_against_brute_force() {
    let dir = tempfile::tempdir().unwrap();
    let provider = Arc::new(HashedProvider::new(16));
    let docs: Vec<Document> = (0..500)
        .map(|i| Document {
            id: Some(format!("d{i:03}")),
            text: format!("unique passage {i} talks about subject {} and {}", i % 53, i % 11),
            metadata: json!({}),
        })
        .collect();
    build_index(dir.path(), provider.as_ref(), default_params(), docs.clone()).await;
    let searcher = open(dir.path(), provider.clone());

    // Precompute document vectors once for the exhaustive ground truth
    let texts: Vec<&str> = docs.iter().map(|d| d.text.as_str()).collect();
    let doc_vectors = provider.encode(&texts, EmbedKind::Document).await.unwrap();

    let mut total_recall = 0.0;
    let queries: Vec<String> = (0..10)
        .map(|q| format!("subject {} and {}", q * 5 % 53, q % 11))
        .collect();

    for query in &queries {
        let qv = provider
            .encode(&[query.as_str()], EmbedKind::Query)
            .await
            .unwrap()
            .remove(0);
        let mut truth: Vec<(String, f32)> = docs
            .iter()
            .zip(&doc_vectors)
            .map(|(doc, dv)| {
                (
                    doc.id.clone().unwrap(),
                    Metric::Cosine.distance(&qv, dv),
                )
            })
            .collect();
        truth.sort_by(|a, b| a.1.total_cmp(&b.1));
        let truth_ids: Vec<&String> = truth.iter().take(10).map(|(id, _)| id).collect();

        let options = SearchOptions {
            ef_search: Some(128),
            ..SearchOptions::default()
        };
        let response = searcher.search(query, 10, &options).await.unwrap();
        let got: Vec<String> = result_ids(&response);
        let hits = truth_ids.iter().filter(|id| got.contains(*id)).count();
        total_recall += hits as f64 / 10.0;
    }

    let mean_recall = total_recall / queries.len() as f64;
    assert!(mean_recall >= 0.9, "mean recall@10 was {mean_recall:.3}");
}

// I5: reported distances match brute-force distances from the blob
#[tokio::test]
async fn i5_distance_consistency_with_blob() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;
    let searcher = open(dir.path(), provider.clone());

    let response = searcher
        .search("cat mat", 3, &SearchOptions::default())
        .await
        .unwrap();

    let qv = provider
        .encode(&["cat mat"], EmbedKind::Query)
        .await
        .unwrap()
        .remove(0);
    for r in &response.results {
        let dv = provider
            .encode(&[r.text.as_str()], EmbedKind::Document)
            .await
            .unwrap()
            .remove(0);
        let expected = Metric::Cosine.distance(&qv, &dv);
        assert!((r.distance - expected).abs() < 1e-6);
    }
}

#[tokio::test]
async fn compact_and_prune_preserve_semantics() {
    let provider = s1_provider();

    let dir = tempfile::tempdir().unwrap();
    let params = BuildParams {
        compact: true,
        prune_threshold: Some(1.0),
        ..default_params()
    };
    build_index(dir.path(), provider.as_ref(), params, s1_documents()).await;

    let response = open(dir.path(), provider)
        .search("cat mat", 2, &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(result_ids(&response), vec!["A", "C"]);
}

#[tokio::test]
async fn vamana_backend_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    let params = BuildParams {
        backend: GraphParams::Vamana(VamanaParams {
            r: 4,
            l_build: 16,
            alpha: 1.2,
            seed: 7,
        }),
        ..default_params()
    };
    build_index(dir.path(), provider.as_ref(), params, s1_documents()).await;

    let response = open(dir.path(), provider)
        .search("cat mat", 2, &SearchOptions::default())
        .await
        .unwrap();
    assert_eq!(result_ids(&response), vec!["A", "C"]);
}

#[tokio::test]
async fn model_mismatch_refused_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;

    let other: Arc<dyn EmbeddingProvider> = Arc::new(HashedProvider::new(3));
    let err = IndexSearcher::open(dir.path(), other, SearcherConfig::default()).unwrap_err();
    assert!(matches!(err, EngineError::ModelMismatch { .. }));
    assert_eq!(err.exit_code(), 2);
}

#[tokio::test]
async fn corrupt_graph_refused_on_open() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;

    // Truncate the graph file
    let graph_path = dir.path().join("index.graph");
    let bytes = std::fs::read(&graph_path).unwrap();
    std::fs::write(&graph_path, &bytes[..bytes.len() / 2]).unwrap();

    let err = IndexSearcher::open(dir.path(), provider, SearcherConfig::default()).unwrap_err();
    assert!(matches!(err, EngineError::Corrupt(_)));
    assert_eq!(err.exit_code(), 3);
}

#[tokio::test]
async fn deadline_returns_partial_beam() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;

    let options = SearchOptions {
        timeout_ms: Some(0),
        ..SearchOptions::default()
    };
    let response = open(dir.path(), provider)
        .search("cat mat", 2, &options)
        .await
        .unwrap();
    assert!(response.partial);
    assert_eq!(response.reason.as_deref(), Some("deadline_exceeded"));
}

#[tokio::test]
async fn cancelled_search_returns_cancelled() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    build_index(dir.path(), provider.as_ref(), default_params(), s1_documents()).await;

    let token = leann_engine::index::CancelToken::new();
    token.cancel();
    let options = SearchOptions {
        cancel: Some(token),
        ..SearchOptions::default()
    };
    let err = open(dir.path(), provider)
        .search("cat mat", 2, &options)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(err.exit_code(), 6);
}

#[tokio::test]
async fn date_sort_is_post_sort_over_beam() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    let docs = vec![
        Document {
            id: Some("A".into()),
            text: "the cat sits on the mat".into(),
            metadata: json!({"timestamp": "2024-01-15T00:00:00Z"}),
        },
        Document {
            id: Some("B".into()),
            text: "dogs bark at night".into(),
            metadata: json!({"timestamp": "2024-03-15T00:00:00Z"}),
        },
        Document {
            id: Some("C".into()),
            text: "the mat is blue".into(),
            metadata: json!({"timestamp": "2024-02-15T00:00:00Z"}),
        },
    ];
    build_index(dir.path(), provider.as_ref(), default_params(), docs).await;
    let searcher = open(dir.path(), provider);

    let options = SearchOptions {
        sort_by: SortBy::DateDesc,
        ..SearchOptions::default()
    };
    let response = searcher.search("cat mat", 3, &options).await.unwrap();
    assert_eq!(result_ids(&response), vec!["B", "C", "A"]);

    let options = SearchOptions {
        sort_by: SortBy::DateAsc,
        ..SearchOptions::default()
    };
    let response = searcher.search("cat mat", 3, &options).await.unwrap();
    assert_eq!(result_ids(&response), vec!["A", "C", "B"]);
}

#[tokio::test]
async fn duplicate_policy_skip_and_fail() {
    let provider = s1_provider();
    let mut docs = s1_documents();
    docs.push(Document {
        id: Some("A".into()),
        text: "the cat sits on the mat".into(),
        metadata: json!({}),
    });

    let dir = tempfile::tempdir().unwrap();
    let report = IndexBuilder::new(default_params())
        .build(dir.path(), provider.as_ref(), docs.clone(), None)
        .await
        .unwrap();
    assert_eq!(report.meta.num_passages, 3);
    assert_eq!(report.duplicates_skipped, 1);

    let strict_dir = tempfile::tempdir().unwrap();
    let params = BuildParams {
        on_duplicate: DuplicatePolicy::Fail,
        ..default_params()
    };
    let err = IndexBuilder::new(params)
        .build(strict_dir.path(), provider.as_ref(), docs, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::DuplicateId(_)));
}

#[tokio::test]
async fn date_filter_restricts_results() {
    let dir = tempfile::tempdir().unwrap();
    let provider = s1_provider();
    let docs = vec![
        Document {
            id: Some("A".into()),
            text: "the cat sits on the mat".into(),
            metadata: json!({"timestamp": "2024-01-15T00:00:00Z"}),
        },
        Document {
            id: Some("B".into()),
            text: "dogs bark at night".into(),
            metadata: json!({"timestamp": "2024-03-15T00:00:00Z"}),
        },
        Document {
            id: Some("C".into()),
            text: "the mat is blue".into(),
            metadata: json!({"timestamp": "2024-02-15T00:00:00Z"}),
        },
    ];
    build_index(dir.path(), provider.as_ref(), default_params(), docs).await;

    let options = SearchOptions {
        date_from: Some("2024-02-01T00:00:00Z".parse().unwrap()),
        ..SearchOptions::default()
    };
    let response = open(dir.path(), provider)
        .search("cat mat", 3, &options)
        .await
        .unwrap();
    let ids = result_ids(&response);
    assert!(!ids.contains(&"A".to_string()));
    assert_eq!(ids.len(), 2);
}
