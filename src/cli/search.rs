//! Search command - query an index

use std::sync::Arc;

use chrono::{DateTime, Utc};
use clap::Args;
use tracing::info;

use leann_engine::config::Config;
use leann_engine::embedding::{EmbeddingProvider, HashedProvider};
use leann_engine::error::{EngineError, Result};
use leann_engine::index::{
    find_index, IndexMeta, IndexSearcher, MetadataFilter, SearchOptions, SearchPath,
    SearcherConfig, SortBy,
};

#[derive(Args)]
pub struct SearchArgs {
    /// Search query
    pub query: String,

    /// Index name to search
    #[arg(short, long)]
    pub index: String,

    /// Number of results to return
    #[arg(long, default_value = "5")]
    pub top_k: usize,

    /// Beam width (higher = more accurate but slower)
    #[arg(long)]
    pub ef_search: Option<usize>,

    /// Hybrid weight: 0 = vector only, 1 = BM25 only
    #[arg(long)]
    pub alpha: Option<f32>,

    /// Filter results by metadata (e.g. "source:*.rs" or "type=code")
    #[arg(long, short = 'f')]
    pub filter: Option<String>,

    /// Only passages with timestamp >= this RFC3339 instant
    #[arg(long)]
    pub date_from: Option<DateTime<Utc>>,

    /// Only passages with timestamp <= this RFC3339 instant
    #[arg(long)]
    pub date_to: Option<DateTime<Utc>>,

    /// Result ordering
    #[arg(long, default_value = "relevance", value_parser = ["relevance", "date_desc", "date_asc"])]
    pub sort_by: String,

    /// Candidate pool width for rescoring
    #[arg(long)]
    pub top_k_rescore: Option<usize>,

    /// Per-query deadline in milliseconds
    #[arg(long)]
    pub timeout_ms: Option<u64>,

    /// Output format (text, json)
    #[arg(long, default_value = "text", value_parser = ["text", "json"])]
    pub format: String,

    /// Show metadata in results
    #[arg(long)]
    pub show_metadata: bool,
}

pub async fn run(args: SearchArgs) -> Result<()> {
    let config = Config::load();

    let index_dir = find_index(&args.index)?;
    let meta = IndexMeta::load(&leann_engine::index::meta_path(&index_dir))?;

    // The CLI only wires in the built-in hashing provider; indexes built
    // against another model need the library API with that provider.
    let provider = Arc::new(HashedProvider::new(meta.dimension as usize));
    if meta.model_id != provider.model_id() {
        return Err(EngineError::ModelMismatch {
            index: meta.model_id.clone(),
            provider: provider.model_id().to_string(),
        });
    }

    info!(
        "searching index '{}' ({} passages{})",
        args.index,
        meta.num_passages,
        if meta.recompute { ", recompute mode" } else { "" }
    );

    let filter = args
        .filter
        .as_deref()
        .map(MetadataFilter::parse)
        .transpose()?;

    let options = SearchOptions {
        ef_search: args.ef_search,
        alpha: args.alpha.unwrap_or(config.search.alpha),
        sort_by: args.sort_by.parse::<SortBy>()?,
        filter,
        date_from: args.date_from,
        date_to: args.date_to,
        top_k_rescore: args.top_k_rescore,
        timeout_ms: args.timeout_ms,
        cancel: None,
    };

    let searcher_config = SearcherConfig {
        cache_capacity: config.search.cache_capacity,
        ..SearcherConfig::default()
    };
    let searcher = IndexSearcher::open(&index_dir, provider, searcher_config)?;
    let response = searcher.search(&args.query, args.top_k, &options).await?;

    if args.format == "json" {
        let json = serde_json::json!({
            "results": response.results.iter().map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "distance": r.distance,
                    "score": r.score,
                    "text": r.text,
                    "metadata": r.metadata,
                })
            }).collect::<Vec<_>>(),
            "partial": response.partial,
            "reason": response.reason,
        });
        println!("{}", serde_json::to_string_pretty(&json)?);
        return Ok(());
    }

    if response.partial {
        println!(
            "warning: partial results ({})",
            response.reason.as_deref().unwrap_or("unknown")
        );
    }
    if response.path == SearchPath::BruteForce {
        info!("sparse filter served by brute-force scan");
    }

    println!(
        "\nSearch results for '{}' (top {}):\n",
        args.query,
        response.results.len()
    );
    for (i, result) in response.results.iter().enumerate() {
        println!(
            "{}. score {:.4}  distance {:.4}",
            i + 1,
            result.score,
            result.distance
        );

        if args.show_metadata {
            if let Some(obj) = result.metadata.as_object() {
                for (key, value) in obj {
                    println!("   {}: {}", key, value);
                }
            }
        }

        // Truncate text for display (respecting UTF-8 boundaries)
        let display_text = if result.text.len() > 200 {
            let mut end = 200;
            while end > 0 && !result.text.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &result.text[..end])
        } else {
            result.text.clone()
        };
        println!("   {}", display_text);
        println!();
    }

    Ok(())
}
