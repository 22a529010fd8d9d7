use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flr_sync::SyncConfig;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flr-cli")]
#[command(about = "Farmer land records ingestion and reporting")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Back up and rebuild the datastore from every upstream source.
    Sync,
    /// Serve the JSON reporting API.
    Serve,
    /// Print datastore totals as JSON.
    Stats,
    /// Summarise recent sync runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

/// `Ok(None)` when there is no `.env` file to load.
fn dotenv_outcome(
    result: Result<PathBuf, dotenvy::Error>,
) -> Result<Option<PathBuf>, dotenvy::Error> {
    match result {
        Ok(path) => Ok(Some(path)),
        Err(err) if err.not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Loaded before tracing so RUST_LOG may come from `.env`.
    let dotenv = dotenv_outcome(dotenvy::dotenv());
    init_tracing();
    match dotenv {
        Ok(Some(path)) => debug!(path = %path.display(), "loaded .env"),
        Ok(None) => debug!("no .env file; using process environment"),
        Err(err) => warn!(error = %err, "ignoring unreadable .env file"),
    }
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = flr_sync::run_sync_from_env().await?;
            if summary.interrupted {
                println!(
                    "sync interrupted by user: run_id={} elapsed={}",
                    summary.run_id, summary.elapsed
                );
            } else {
                println!(
                    "sync complete: run_id={} farmers={} lands={} bank_details={} elapsed={}",
                    summary.run_id,
                    summary.farmers.written,
                    summary.lands.written,
                    summary.bank_details.written,
                    summary.elapsed
                );
            }
        }
        Commands::Serve => {
            flr_web::serve_from_env().await?;
        }
        Commands::Stats => {
            let stats = SyncConfig::from_env()
                .datastore()
                .stats()
                .await
                .context("reading datastore stats")?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Commands::Report { runs } => {
            let config = SyncConfig::from_env();
            println!("{}", flr_sync::recent_runs_markdown(&config.reports_dir, runs)?);
        }
    }

    Ok(())
}
