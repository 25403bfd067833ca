//! Resumable portal traversal, reconciliation into storage, and run orchestration.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use medsync_core::{CheckpointPosition, RunContext};
use medsync_portal::{FixtureConnector, LabelledTextExtractor};
use medsync_storage::{DocumentArchive, MemoryRepository, PgRepository, Repository};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};
use uuid::Uuid;

pub mod activity;
pub mod config;
pub mod error;
pub mod import;
pub mod reconcile;
pub mod report;
pub mod session;
pub mod supervisor;
pub mod traversal;

pub use activity::ActivityTracker;
pub use config::SyncConfig;
pub use error::{ReconcileError, StepError, SyncError, TraversalError};
pub use import::ImportSummary;
pub use reconcile::{Reconciler, ScrapedPatient};
pub use report::RunSummary;
pub use session::{SessionController, SessionState};
pub use supervisor::{RetrySupervisor, RetryTracker};
pub use traversal::{RunProgress, TraversalDriver};

pub const CRATE_NAME: &str = "medsync-sync";

async fn open_repository(config: &SyncConfig, dry_run: bool) -> Result<Arc<dyn Repository>> {
    if dry_run {
        info!("dry run, writing to an in-memory repository");
        return Ok(Arc::new(MemoryRepository::new()));
    }
    let repository = PgRepository::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    Ok(Arc::new(repository))
}

/// One supervised run against the configured portal, followed by the run report.
pub async fn run_sync(
    config: &SyncConfig,
    start: CheckpointPosition,
    dry_run: bool,
) -> Result<RunSummary, SyncError> {
    let repository = open_repository(config, dry_run)
        .await
        .map_err(SyncError::Setup)?;
    let connector = FixtureConnector::from_path(&config.portal_fixture_path)
        .map_err(SyncError::Setup)?;
    let session = SessionController::new(
        connector,
        config.portal_url.clone(),
        config.launch_options(),
    );

    let ctx = RunContext::new(Local::now().date_naive());
    let mut supervisor = RetrySupervisor::new(
        session,
        Reconciler::new(repository),
        config.credentials(),
        config.backoff_policy(),
        config.step_timeout(),
    )
    .with_dry_run(dry_run);

    let summary = supervisor.run(&ctx, start).await?;
    let run_dir = report::write_run_report(&config.reports_dir, &summary)
        .await
        .map_err(SyncError::Report)?;
    info!(run_id = %summary.run_id, reports = %run_dir.display(), "run report written");
    Ok(summary)
}

pub async fn run_sync_from_env() -> Result<RunSummary, SyncError> {
    let config = SyncConfig::from_env();
    run_sync(&config, config.start_position(), false).await
}

pub async fn migrate(config: &SyncConfig) -> Result<()> {
    let repository = PgRepository::connect(&config.database_url)
        .await
        .context("connecting to database")?;
    repository.migrate().await.context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

pub async fn import_export(
    config: &SyncConfig,
    path: &Path,
    dry_run: bool,
) -> Result<ImportSummary> {
    let repository = open_repository(config, dry_run).await?;
    let archive = DocumentArchive::new(config.artifacts_dir.clone());
    import::import_document(
        path,
        &archive,
        &LabelledTextExtractor,
        &Reconciler::new(repository),
    )
    .await
}

/// Last checkpoint recorded by a run, used to pick the restart position by hand.
pub async fn last_position(
    config: &SyncConfig,
    run_id: Uuid,
) -> Result<Option<CheckpointPosition>> {
    let repository = open_repository(config, false).await?;
    let position = ActivityTracker::new(repository)
        .last_position(run_id)
        .await
        .with_context(|| format!("reading last position of run {run_id}"))?;
    Ok(position)
}

/// Cron-driven runs; `None` unless the scheduler is enabled.
pub async fn maybe_build_scheduler(config: &SyncConfig) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        return Ok(None);
    }

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_config = Arc::new(config.clone());
    let job = Job::new_async(config.sync_cron.as_str(), move |_uuid, _lock| {
        let config = Arc::clone(&job_config);
        Box::pin(async move {
            match run_sync(&config, config.start_position(), false).await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    patients = summary.patients_processed,
                    "scheduled sync finished"
                ),
                Err(err) => error!(
                    error = %err,
                    failed_position = ?err.failed_position(),
                    "scheduled sync failed"
                ),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {}", config.sync_cron))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
