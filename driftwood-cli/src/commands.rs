//! CLI command implementations

use std::path::PathBuf;

use clap::Subcommand;
use driftwood_core::config::DriftwoodConfig;
use driftwood_core::fetch::HttpSegmentFetcher;
use driftwood_core::media::MediaStore;
use driftwood_core::scheduler::Scheduler;
use driftwood_core::session::{SessionRegistry, register_sweep_job};
use driftwood_core::spawn_relay_engine;

use crate::control::ControlListener;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the relay: control channel, retrieval engine, and sweep job
    Serve {
        /// Control channel listen address (overrides configuration)
        #[arg(long)]
        control_addr: Option<String>,
    },
    /// Segment a local source and register it as a STATIC session
    Segment {
        /// Session name; also the manifest directory name
        name: String,
        /// Path to the source media file
        source: PathBuf,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Serve { control_addr } => serve(control_addr).await,
        Commands::Segment { name, source } => segment(name, source).await,
    }
}

/// Run the relay until interrupted.
async fn serve(control_addr: Option<String>) -> anyhow::Result<()> {
    let mut config = DriftwoodConfig::from_env();
    if let Some(addr) = control_addr {
        config.control.listen_addr = addr;
    }

    let registry = SessionRegistry::new();
    let media = MediaStore::new(config.media.base_path.clone());
    let fetcher = HttpSegmentFetcher::new(&config.fetch)?;
    let engine = spawn_relay_engine(config.clone(), registry.clone(), fetcher, media);

    let scheduler = Scheduler::new();
    register_sweep_job(&scheduler, registry, engine.clone(), &config.session)?;

    let listener = ControlListener::bind(&config.control.listen_addr, engine.clone()).await?;
    println!("driftwood relay listening on {}", listener.local_addr()?);
    let control_task = tokio::spawn(listener.run());

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");

    control_task.abort();
    scheduler.shutdown();
    engine.shutdown().await?;
    Ok(())
}

/// One-shot manifest generation for a local file.
async fn segment(name: String, source: PathBuf) -> anyhow::Result<()> {
    let config = DriftwoodConfig::from_env();
    let registry = SessionRegistry::new();
    let media = MediaStore::new(config.media.base_path.clone());
    let fetcher = HttpSegmentFetcher::new(&config.fetch)?;
    let engine = spawn_relay_engine(config, registry, fetcher, media);

    println!("Segmenting {} as session {name}", source.display());
    let manifest_path = engine.generate_manifest(&name, source).await?;
    println!("Manifest written to {}", manifest_path.display());

    engine.shutdown().await?;
    Ok(())
}
