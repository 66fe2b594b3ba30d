//! LEANN - graph-based vector retrieval with on-demand recomputation
//!
//! CLI over the engine: build, search, and manage indexes.

mod cli;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::Cli;

#[tokio::main]
async fn main() {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "leann_engine=info,leann=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let cli = Cli::parse();
    if let Err(e) = cli.run().await {
        eprintln!("error ({}): {e}", e.kind());
        std::process::exit(e.exit_code());
    }
}
