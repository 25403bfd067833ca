use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use medsync_core::{CheckpointPosition, RunTotals};
use serde::Serialize;
use tokio::fs;
use uuid::Uuid;

pub const SUMMARY_FILE: &str = "run_summary.json";
pub const BRIEF_FILE: &str = "run_brief.md";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub start: CheckpointPosition,
    pub last_position: Option<CheckpointPosition>,
    pub patients_processed: usize,
    pub rows_skipped: usize,
    /// Traversal attempts, the first one included.
    pub attempts: u32,
    pub dry_run: bool,
    pub totals: RunTotals,
}

/// Writes `<reports_dir>/<run_id>/` with the JSON summary and a short markdown brief.
pub async fn write_run_report(reports_dir: &Path, summary: &RunSummary) -> Result<PathBuf> {
    let run_dir = reports_dir.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(run_dir.join(SUMMARY_FILE), json)
        .await
        .with_context(|| format!("writing {SUMMARY_FILE}"))?;

    let last = summary
        .last_position
        .map(|p| p.to_string())
        .unwrap_or_else(|| "none".to_string());
    let brief = format!(
        "# Portal Sync Run\n\n- Run ID: `{}`\n- Started: {}\n- Finished: {}\n- Start position: {}\n- Last processed: {}\n- Attempts: {}\n- Dry run: {}\n\n## Patients\n- created: {}\n- updated: {}\n- skipped: {}\n- non-patient rows: {}\n\n## Appointments\n- created: {}\n- updated: {}\n- skipped: {}\n- tombstoned: {}\n\n## Invoices\n- created: {}\n- updated: {}\n- skipped: {}\n",
        summary.run_id,
        summary.started_at,
        summary.finished_at,
        summary.start,
        last,
        summary.attempts,
        summary.dry_run,
        summary.totals.patients_created,
        summary.totals.patients_updated,
        summary.totals.patients_skipped,
        summary.rows_skipped,
        summary.totals.appointments.created,
        summary.totals.appointments.updated,
        summary.totals.appointments.skipped,
        summary.totals.appointments.deleted,
        summary.totals.invoices.created,
        summary.totals.invoices.updated,
        summary.totals.invoices.skipped,
    );
    fs::write(run_dir.join(BRIEF_FILE), brief)
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    Ok(run_dir)
}

/// Markdown digest of the most recent run reports, newest first.
pub fn recent_runs_markdown(reports_dir: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_dir)
        .with_context(|| format!("reading {}", reports_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter(|entry| entry.path().join(SUMMARY_FILE).exists())
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();

    let mut lines = vec!["# Portal Sync Runs".to_string(), String::new()];
    for dir in dirs.into_iter().take(runs.max(1)) {
        let summary_path = dir.path().join(SUMMARY_FILE);
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;

        let count = |key: &str| {
            summary
                .get("totals")
                .and_then(|t| t.get(key))
                .and_then(|v| v.as_u64())
                .unwrap_or(0)
        };
        let last = summary
            .get("last_position")
            .and_then(|p| {
                Some(format!(
                    "page {}, patient {}",
                    p.get("page_index")?.as_u64()?,
                    p.get("patient_index")?.as_u64()?
                ))
            })
            .unwrap_or_else(|| "none".to_string());

        lines.push(format!("## Run `{}`", dir.file_name().to_string_lossy()));
        lines.push(format!(
            "- patients: {} created, {} updated, {} skipped",
            count("patients_created"),
            count("patients_updated"),
            count("patients_skipped")
        ));
        lines.push(format!("- last processed: {last}"));
        lines.push(format!("- summary: `{}`", summary_path.display()));
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
