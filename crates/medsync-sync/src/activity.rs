use std::sync::Arc;

use chrono::Utc;
use medsync_core::{
    ActivityRecord, CheckpointPosition, ReconcileCounts, RunContext, SyncAction,
};
use medsync_storage::Repository;
use tracing::debug;
use uuid::Uuid;

use crate::error::{ReconcileContext, ReconcileError};

/// Appends the per-patient audit row that doubles as the durable checkpoint.
#[derive(Clone)]
pub struct ActivityTracker {
    repository: Arc<dyn Repository>,
}

impl ActivityTracker {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self { repository }
    }

    /// A new patient is `created`; otherwise any dependent write makes it `updated`.
    /// Changes to the patient's own fields do not count.
    pub fn classify(
        patient: SyncAction,
        appointments: &ReconcileCounts,
        invoices: &ReconcileCounts,
    ) -> SyncAction {
        if patient == SyncAction::Created {
            SyncAction::Created
        } else if appointments.has_writes() || invoices.has_writes() {
            SyncAction::Updated
        } else {
            SyncAction::Skipped
        }
    }

    pub async fn record(
        &self,
        ctx: &RunContext,
        patient_id: Uuid,
        position: CheckpointPosition,
        action: SyncAction,
    ) -> Result<ActivityRecord, ReconcileError> {
        let record = ActivityRecord {
            run_id: ctx.run_id,
            patient_id,
            position,
            action,
            recorded_at: Utc::now(),
        };
        self.repository
            .insert_activity_record(&record)
            .await
            .reconcile_context(|| format!("recording activity for patient {patient_id}"))?;
        debug!(%patient_id, %position, action = %action, "activity recorded");
        Ok(record)
    }

    /// Last checkpoint written by a run, for operator-driven restarts.
    pub async fn last_position(
        &self,
        run_id: Uuid,
    ) -> Result<Option<CheckpointPosition>, ReconcileError> {
        let record = self
            .repository
            .last_activity_record(run_id)
            .await
            .reconcile_context(|| format!("reading last activity of run {run_id}"))?;
        Ok(record.map(|r| r.position))
    }
}
