//! Loreforge CLI: crawl the Fallout wiki and merge lore into the canonical store.
//!
//! Every pipeline stage is a subcommand with explicit input and output
//! paths; `run` chains them all.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
