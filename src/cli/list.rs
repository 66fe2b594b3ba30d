//! List command - show all indexes

use std::path::Path;

use clap::Args;

use leann_engine::error::Result;
use leann_engine::index::{list_indexes, meta_path, IndexMeta};

#[derive(Args)]
pub struct ListArgs {
    /// Show detailed information
    #[arg(short, long)]
    pub detailed: bool,
}

pub async fn run(args: ListArgs) -> Result<()> {
    let indexes = list_indexes()?;

    if indexes.is_empty() {
        println!("No indexes found.");
        println!("\nGet started:");
        println!("   leann build my-docs --docs ./documents.jsonl");
        return Ok(());
    }

    println!("LEANN Indexes");
    println!("{}", "=".repeat(50));

    for (i, (name, dir)) in indexes.iter().enumerate() {
        let meta_file = meta_path(dir);
        let status = if meta_file.exists() { "OK" } else { "INCOMPLETE" };
        print!("{}. {} {}", i + 1, name, status);

        if args.detailed && meta_file.exists() {
            if let Ok(meta) = IndexMeta::load(&meta_file) {
                print!(
                    " ({} passages, {}d, {:?}{})",
                    meta.num_passages,
                    meta.dimension,
                    meta.backend,
                    if meta.recompute { ", recompute" } else { "" }
                );
            }
        }

        if let Ok(size) = dir_size(dir) {
            print!(" [{:.1} MB]", size as f64 / (1024.0 * 1024.0));
        }
        println!();
    }

    println!("{}", "=".repeat(50));
    println!("Total: {} index(es)", indexes.len());
    Ok(())
}

fn dir_size(path: &Path) -> std::io::Result<u64> {
    let mut size = 0;
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        if metadata.is_file() {
            size += metadata.len();
        } else if metadata.is_dir() {
            size += dir_size(&entry.path())?;
        }
    }
    Ok(size)
}
