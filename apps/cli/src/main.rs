//! Wise CLI: run the durable task scheduler and manage its tasks.
//!
//! `wise serve` runs the scheduler loop; every other command talks to the
//! same database, which doubles as the task queue.

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
