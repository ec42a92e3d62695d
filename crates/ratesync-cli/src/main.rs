use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ratesync_core::PassOutcome;
use ratesync_pipeline::{run_sync_once, SyncConfig};
use ratesync_storage::StateStore;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ratesync")]
#[command(about = "Incremental rate-report sync")]
struct Cli {
    /// Root directory for staging, raw, processed, archive and state data.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Portal replay manifest to run against.
    #[arg(long)]
    portal_manifest: Option<PathBuf>,

    /// Number of acquisition workers.
    #[arg(long)]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation pass.
    Sync,
    /// Print stored markers and working-area file counts.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = SyncConfig::from_env();
    if let Some(root) = cli.data_dir {
        config = config.with_data_root(root);
    }
    if let Some(manifest) = cli.portal_manifest {
        config.portal_manifest = manifest;
    }
    if let Some(workers) = cli.workers {
        config.workers = workers.max(1);
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = run_sync_once(config).await?;
            let outcome = match summary.outcome {
                PassOutcome::NothingToDo => "nothing-to-do",
                PassOutcome::Completed => "completed",
            };
            println!(
                "sync pass {}: {} evaluated={} fetched={} loaded={} failed={}",
                summary.pass_id,
                outcome,
                summary.evaluated,
                summary.fetched,
                summary.loaded,
                summary.failed
            );
        }
        Commands::Status => {
            print_status(&config).await?;
        }
    }

    Ok(())
}

async fn print_status(config: &SyncConfig) -> Result<()> {
    let state = StateStore::new(config.state_path.clone())
        .load()
        .await
        .context("reading sync state")?;
    println!("markers: {}", state.len());
    for (property_id, version) in &state {
        println!("  {property_id} -> {version}");
    }
    for (label, dir) in [
        ("staging", &config.staging_dir),
        ("raw", &config.raw_intake_dir),
        ("processed", &config.processed_dir),
    ] {
        println!("{label}: {} file(s)", count_files(dir));
    }
    Ok(())
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .map(|entries| entries.count())
        .unwrap_or(0)
}
