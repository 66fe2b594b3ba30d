//! Remove command - delete an index

use clap::Args;

use leann_engine::error::Result;
use leann_engine::index::find_index;

#[derive(Args)]
pub struct RemoveArgs {
    /// Index name to remove
    pub index_name: String,

    /// Skip confirmation prompt
    #[arg(long, short = 'y')]
    pub yes: bool,
}

pub async fn run(args: RemoveArgs) -> Result<()> {
    let index_dir = find_index(&args.index_name)?;

    if !args.yes {
        println!(
            "This will permanently delete index '{}' at {}.",
            args.index_name,
            index_dir.display()
        );
        print!("Type '{}' to confirm: ", args.index_name);
        std::io::Write::flush(&mut std::io::stdout())?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;
        if input.trim() != args.index_name {
            println!("Confirmation failed. Index not removed.");
            return Ok(());
        }
    }

    std::fs::remove_dir_all(&index_dir)?;
    println!("Removed index '{}'.", args.index_name);
    Ok(())
}
