//! Driftwood CLI - Command-line interface
//!
//! Runs the DASH relay and exposes local maintenance commands.

mod commands;
mod control;

use clap::Parser;
use driftwood_core::tracing_setup::{CliLogLevel, init_tracing};

#[derive(Parser)]
#[command(name = "driftwood")]
#[command(about = "A DASH media relay")]
struct Cli {
    /// Console log level
    #[arg(long, default_value = "info")]
    log_level: CliLogLevel,

    #[command(subcommand)]
    command: commands::Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_level.as_tracing_level(), None)
        .map_err(|e| anyhow::anyhow!("tracing setup failed: {e}"))?;

    commands::handle_command(cli.command).await?;
    Ok(())
}
