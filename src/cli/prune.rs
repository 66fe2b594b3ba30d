//! Prune command - delete stored embeddings to reclaim space
//!
//! After pruning, searches recompute vectors from passage text on demand.
//! Distinct from build-time edge pruning (`--prune-threshold`), which
//! removes graph edges.

use clap::Args;

use leann_engine::error::Result;
use leann_engine::index::{drop_embeddings, find_index, index_base, meta_path, IndexMeta};

#[derive(Args)]
pub struct PruneArgs {
    /// Index name to prune
    pub index_name: String,

    /// Skip confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,
}

pub async fn run(args: PruneArgs) -> Result<()> {
    let index_dir = find_index(&args.index_name)?;
    let meta_file = meta_path(&index_dir);
    let mut meta = IndexMeta::load(&meta_file)?;

    if meta.recompute {
        println!(
            "Index '{}' is already in recompute mode (no embedding blob).",
            args.index_name
        );
        return Ok(());
    }

    let base = index_base(&index_dir);
    let blob_path = base.with_extension("embeddings");
    let size_mb = std::fs::metadata(&blob_path)
        .map(|m| m.len() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0);

    if !args.yes {
        println!(
            "This will delete the embedding blob of index '{}' ({size_mb:.2} MB).",
            args.index_name
        );
        println!("Embeddings will be recomputed on demand during search.");
        print!("Type '{}' to confirm: ", args.index_name);
        std::io::Write::flush(&mut std::io::stdout())?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim() != args.index_name {
            println!("Confirmation failed. Index not pruned.");
            return Ok(());
        }
    }

    drop_embeddings(&base)?;
    meta.recompute = true;
    meta.files.embeddings = None;
    meta.save(&meta_file)?;

    println!(
        "Index '{}' pruned. Saved {size_mb:.2} MB of storage.",
        args.index_name
    );
    println!("Note: search now recomputes embeddings on demand (slower).");
    Ok(())
}
