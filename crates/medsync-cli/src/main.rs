use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use medsync_core::CheckpointPosition;
use medsync_sync::{report, SyncConfig};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "medsync")]
#[command(about = "Synchronise patients from the practice portal into the local database")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Walk the portal result list and reconcile every patient.
    Sync {
        /// 1-based result page to start from; overrides START_PAGE_INDEX.
        #[arg(long)]
        page_index: Option<u32>,
        /// 0-based row on the start page; overrides START_PATIENT_INDEX.
        #[arg(long)]
        patient_index: Option<u32>,
        /// Reconcile into memory instead of the database.
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        headless: Option<bool>,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    Migrate,
    /// Import patients from an exported text document.
    Import {
        file: PathBuf,
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the last checkpoint a run recorded.
    LastPosition { run_id: Uuid },
    /// Print a digest of recent run reports.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
    /// Run syncs on the configured cron schedule until interrupted.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync {
        page_index: None,
        patient_index: None,
        dry_run: false,
        headless: None,
        timeout_ms: None,
    }) {
        Commands::Sync {
            page_index,
            patient_index,
            dry_run,
            headless,
            timeout_ms,
        } => {
            if let Some(headless) = headless {
                config.headless = headless;
            }
            if let Some(timeout_ms) = timeout_ms {
                config.step_timeout_ms = timeout_ms;
            }
            let defaults = config.start_position();
            let start = CheckpointPosition::new(
                page_index.unwrap_or(defaults.page_index).max(1),
                patient_index.unwrap_or(defaults.patient_index),
            );

            match medsync_sync::run_sync(&config, start, dry_run).await {
                Ok(summary) => println!(
                    "sync complete: run_id={} patients={} created={} updated={} skipped={} attempts={}",
                    summary.run_id,
                    summary.patients_processed,
                    summary.totals.patients_created,
                    summary.totals.patients_updated,
                    summary.totals.patients_skipped,
                    summary.attempts
                ),
                Err(err) => {
                    if let Some(position) = err.failed_position() {
                        error!(
                            page_index = position.page_index,
                            patient_index = position.patient_index,
                            "sync stopped; rerun with --page-index {} --patient-index {}",
                            position.page_index,
                            position.patient_index
                        );
                    }
                    return Err(err.into());
                }
            }
        }
        Commands::Migrate => {
            medsync_sync::migrate(&config).await?;
            println!("migrations applied");
        }
        Commands::Import { file, dry_run } => {
            let summary = medsync_sync::import_export(&config, &file, dry_run).await?;
            println!(
                "import complete: hash={} found={} created={} updated={} skipped={} incomplete={}",
                summary.content_hash,
                summary.patients_found,
                summary.patients.created,
                summary.patients.updated,
                summary.patients.skipped,
                summary.patients_incomplete
            );
        }
        Commands::LastPosition { run_id } => {
            match medsync_sync::last_position(&config, run_id).await? {
                Some(position) => println!(
                    "page_index={} patient_index={}",
                    position.page_index, position.patient_index
                ),
                None => println!("no activity recorded for run {run_id}"),
            }
        }
        Commands::Report { runs } => {
            print!("{}", report::recent_runs_markdown(&config.reports_dir, runs)?);
        }
        Commands::Schedule => {
            let Some(mut sched) = medsync_sync::maybe_build_scheduler(&config).await? else {
                anyhow::bail!("scheduler disabled; set MEDSYNC_SCHEDULER_ENABLED=true");
            };
            sched.start().await.context("starting scheduler")?;
            info!(cron = %config.sync_cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for ctrl-c")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
    }

    Ok(())
}
