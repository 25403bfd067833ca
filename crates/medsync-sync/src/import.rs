//! Patient import from exported documents, outside the portal traversal.

use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use medsync_core::{ReconcileCounts, SyncAction};
use medsync_portal::DocumentExtractor;
use medsync_storage::{ArchivedDocument, DocumentArchive};
use serde::Serialize;
use tracing::{info, warn};

use crate::reconcile::Reconciler;

pub const IMPORT_ORIGIN: &str = "patient-export";

#[derive(Debug, Clone, Serialize)]
pub struct ImportSummary {
    pub content_hash: String,
    pub archived_path: String,
    pub already_archived: bool,
    pub patients_found: usize,
    /// Snapshots without first name, last name and date of birth are not stored.
    pub patients_incomplete: usize,
    pub patients: ReconcileCounts,
}

/// Archives the export, extracts patients and upserts each one.
pub async fn import_document(
    path: &Path,
    archive: &DocumentArchive,
    extractor: &dyn DocumentExtractor,
    reconciler: &Reconciler,
) -> Result<ImportSummary> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "export.bin".to_string());

    let ArchivedDocument {
        content_hash,
        absolute_path,
        already_archived,
        ..
    } = archive
        .archive(Utc::now(), IMPORT_ORIGIN, &file_name, &bytes)
        .await?;
    if already_archived {
        info!(%content_hash, "export was imported before, upserting again");
    }

    let patients = extractor
        .extract(&bytes)
        .with_context(|| format!("extracting patients from {}", path.display()))?;

    let mut counts = ReconcileCounts::default();
    let mut incomplete = 0usize;
    for patient in &patients {
        if patient.first_name.is_none()
            || patient.last_name.is_none()
            || patient.date_of_birth.is_none()
        {
            warn!(patient = %patient.display_name(), "export page lacks identity fields, skipped");
            incomplete += 1;
            continue;
        }
        let upsert = reconciler
            .upsert_patient(patient)
            .await
            .with_context(|| format!("importing patient {}", patient.display_name()))?;
        counts.record(upsert.action);
    }

    info!(
        found = patients.len(),
        created = counts.created,
        updated = counts.updated,
        skipped = counts.skipped,
        incomplete,
        "document import finished"
    );
    Ok(ImportSummary {
        content_hash,
        archived_path: absolute_path.display().to_string(),
        already_archived,
        patients_found: patients.len(),
        patients_incomplete: incomplete,
        patients: counts,
    })
}
