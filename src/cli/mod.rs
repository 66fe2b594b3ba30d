//! CLI module - command definitions and handlers

pub mod build;
mod list;
mod prune;
mod remove;
mod search;

use clap::{Parser, Subcommand};

use leann_engine::Result;

pub use build::BuildArgs;
pub use list::ListArgs;
pub use prune::PruneArgs;
pub use remove::RemoveArgs;
pub use search::SearchArgs;

/// LEANN - graph-based vector retrieval engine
#[derive(Parser)]
#[command(name = "leann")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Build an index from a JSONL document file
    Build(BuildArgs),

    /// Search an index
    Search(SearchArgs),

    /// List all indexes
    List(ListArgs),

    /// Remove an index
    Remove(RemoveArgs),

    /// Delete stored embeddings, switching an index to recompute mode
    Prune(PruneArgs),
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Build(args) => build::run(args).await,
            Commands::Search(args) => search::run(args).await,
            Commands::List(args) => list::run(args).await,
            Commands::Remove(args) => remove::run(args).await,
            Commands::Prune(args) => prune::run(args).await,
        }
    }
}
