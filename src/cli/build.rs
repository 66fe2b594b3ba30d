//! Build command - index construction from a JSONL document file
//!
//! Each input line is `{"id": "...", "text": "...", "metadata": {...}}`
//! with `id` and `metadata` optional. The CLI wires in the built-in
//! hashing provider; real inference providers implement the
//! `EmbeddingProvider` trait and drive the library API directly.

use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use leann_engine::backend::{GraphParams, HnswParams, VamanaParams, DEFAULT_SEED};
use leann_engine::config::Config;
use leann_engine::embedding::HashedProvider;
use leann_engine::error::{EngineError, Result};
use leann_engine::index::{
    BuildParams, BuildPhase, Document, DuplicatePolicy, IndexBuilder,
};
use leann_engine::Metric;

#[derive(Args)]
pub struct BuildArgs {
    /// Index name
    pub index_name: String,

    /// JSONL document file
    #[arg(long)]
    pub docs: PathBuf,

    /// Backend to use
    #[arg(long, default_value = "hnsw", value_parser = ["hnsw", "vamana"])]
    pub backend: String,

    /// Distance metric
    #[arg(long, default_value = "cosine", value_parser = ["cosine", "l2"])]
    pub metric: String,

    /// Embedding dimension for the built-in hashing provider
    #[arg(long)]
    pub dimension: Option<usize>,

    /// HNSW out-degree bound (M)
    #[arg(long)]
    pub m: Option<usize>,

    /// Construction candidate pool (ef_construction / L_build)
    #[arg(long)]
    pub ef_construction: Option<usize>,

    /// Vamana out-degree bound (R)
    #[arg(long, default_value = "32")]
    pub r: usize,

    /// Vamana pruning slack
    #[arg(long, default_value = "1.2")]
    pub alpha: f32,

    /// Layer-draw / init seed
    #[arg(long, default_value_t = DEFAULT_SEED)]
    pub seed: u64,

    /// Skip the embedding blob; recompute vectors from text at search time
    #[arg(long)]
    pub recompute: bool,

    /// Reorder nodes for locality after the graph is built
    #[arg(long)]
    pub compact: bool,

    /// Occlusion threshold for edge pruning (omit to keep all edges)
    #[arg(long)]
    pub prune_threshold: Option<f32>,

    /// Embedding batch size
    #[arg(long)]
    pub batch_size: Option<usize>,

    /// Embedding worker pool size
    #[arg(long)]
    pub workers: Option<usize>,

    /// Fail on duplicate passage ids instead of skipping them
    #[arg(long)]
    pub strict_duplicates: bool,

    /// Prefix prepended to every query before embedding
    #[arg(long)]
    pub query_prompt_template: Option<String>,

    /// Prefix prepended to every document before embedding
    #[arg(long)]
    pub document_prompt_template: Option<String>,

    /// Rebuild an existing index
    #[arg(short, long)]
    pub force: bool,
}

pub async fn run(args: BuildArgs) -> Result<()> {
    let config = Config::load();

    let index_dir = PathBuf::from(".leann").join("indexes").join(&args.index_name);
    if leann_engine::index::meta_path(&index_dir).exists() && !args.force {
        return Err(EngineError::InvalidInput(format!(
            "index '{}' already exists; use --force to rebuild",
            args.index_name
        )));
    }

    let metric: Metric = args.metric.parse()?;
    let dimension = args.dimension.unwrap_or(config.embedding.dimension);
    let m = args.m.unwrap_or(config.build.m);
    let ef_construction = args.ef_construction.unwrap_or(config.build.ef_construction);

    let backend = match args.backend.as_str() {
        "hnsw" => GraphParams::Hnsw(HnswParams {
            m,
            ef_construction,
            seed: args.seed,
        }),
        "vamana" => GraphParams::Vamana(VamanaParams {
            r: args.r,
            l_build: ef_construction,
            alpha: args.alpha,
            seed: args.seed,
        }),
        other => {
            return Err(EngineError::InvalidInput(format!(
                "unknown backend '{other}'"
            )))
        }
    };

    let params = BuildParams {
        backend,
        metric,
        recompute: args.recompute,
        compact: args.compact,
        prune_threshold: args.prune_threshold,
        batch_size: args.batch_size.unwrap_or(config.embedding.batch_size),
        workers: args.workers.unwrap_or(config.build.workers),
        on_duplicate: if args.strict_duplicates {
            DuplicatePolicy::Fail
        } else {
            DuplicatePolicy::Skip
        },
        ef_search_default: config.search.ef_search as u32,
        query_prompt_template: args.query_prompt_template,
        document_prompt_template: args.document_prompt_template,
        ..BuildParams::default()
    };

    info!(
        "building index '{}' from {:?} ({} backend, {metric})",
        args.index_name, args.docs, args.backend
    );

    let documents = read_documents(&args.docs)?;
    let provider = Arc::new(HashedProvider::new(dimension));

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:30}] {pos}/{len}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    let progress = {
        let bar = bar.clone();
        move |phase: BuildPhase, done: u64, total: u64| {
            let msg = match phase {
                BuildPhase::Ingest => "ingesting",
                BuildPhase::Embed => "embedding",
                BuildPhase::Graph => "building graph",
                BuildPhase::Finalize => "finalizing",
            };
            bar.set_message(msg);
            if total > 0 {
                bar.set_length(total);
                bar.set_position(done);
            }
        }
    };

    let builder = IndexBuilder::new(params);
    let report = builder
        .build(&index_dir, provider.as_ref(), documents, Some(&progress))
        .await?;
    bar.finish_and_clear();

    println!(
        "Built index '{}': {} passages ({} duplicates skipped)",
        args.index_name, report.meta.num_passages, report.duplicates_skipped
    );
    println!("Fingerprint: {}", report.meta.build_fingerprint);
    Ok(())
}

fn read_documents(path: &PathBuf) -> Result<Vec<Document>> {
    let file = std::fs::File::open(path).map_err(|e| {
        EngineError::InvalidInput(format!("cannot read document file {:?}: {e}", path))
    })?;
    let reader = std::io::BufReader::new(file);

    let mut docs = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let doc: Document = serde_json::from_str(&line).map_err(|e| {
            EngineError::InvalidInput(format!("{:?} line {}: {e}", path, line_no + 1))
        })?;
        docs.push(doc);
    }
    Ok(docs)
}
