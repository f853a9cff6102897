mod run_aggregate;
mod run_ingest;

use crate::run_aggregate::*;
use crate::run_ingest::*;

use clap::{Parser, Subcommand};

///
#[derive(Parser, Debug)]
#[command(version, about, long_about)]
struct Cli {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ingest a directory tree of per-object profiling exports into
    /// one disk-backed `.h5` matrix
    Ingest(IngestArgs),
    /// Summarize single-object profiles per well (and other keys)
    Aggregate(AggregateArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.commands {
        Commands::Ingest(args) => run_ingest(args)?,
        Commands::Aggregate(args) => run_aggregate(args)?,
    }

    Ok(())
}
