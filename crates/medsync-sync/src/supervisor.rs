//! Bounded, position-aware retry around traversal attempts.

use std::time::Duration;

use chrono::Utc;
use medsync_core::{CheckpointPosition, RunContext};
use medsync_portal::{Credentials, PortalConnector, SearchCriteria};
use medsync_storage::BackoffPolicy;
use tracing::{error, info, instrument, warn};

use crate::error::{SyncError, TraversalError};
use crate::reconcile::Reconciler;
use crate::report::RunSummary;
use crate::session::SessionController;
use crate::traversal::{RunProgress, TraversalDriver};

/// Counts consecutive failures at one position. A failure elsewhere starts over at 1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryTracker {
    last_failure: Option<CheckpointPosition>,
    consecutive: u32,
}

impl RetryTracker {
    pub fn record_failure(&mut self, position: CheckpointPosition) -> u32 {
        if self.last_failure == Some(position) {
            self.consecutive += 1;
        } else {
            self.last_failure = Some(position);
            self.consecutive = 1;
        }
        self.consecutive
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn last_failure(&self) -> Option<CheckpointPosition> {
        self.last_failure
    }
}

/// Owns the session for a whole run and recreates it between attempts.
pub struct RetrySupervisor<C: PortalConnector> {
    session: SessionController<C>,
    reconciler: Reconciler,
    credentials: Credentials,
    criteria: SearchCriteria,
    policy: BackoffPolicy,
    step_timeout: Duration,
    dry_run: bool,
}

impl<C: PortalConnector> RetrySupervisor<C> {
    pub fn new(
        session: SessionController<C>,
        reconciler: Reconciler,
        credentials: Credentials,
        policy: BackoffPolicy,
        step_timeout: Duration,
    ) -> Self {
        Self {
            session,
            reconciler,
            credentials,
            criteria: SearchCriteria::default(),
            policy,
            step_timeout,
            dry_run: false,
        }
    }

    pub fn with_criteria(mut self, criteria: SearchCriteria) -> Self {
        self.criteria = criteria;
        self
    }

    /// Only recorded in the summary; the repository decides what a dry run means.
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn session(&self) -> &SessionController<C> {
        &self.session
    }

    #[instrument(name = "sync_run", skip_all, fields(run_id = %ctx.run_id))]
    pub async fn run(
        &mut self,
        ctx: &RunContext,
        start: CheckpointPosition,
    ) -> Result<RunSummary, SyncError> {
        info!(%start, "sync run starting");
        self.session.connect(&self.credentials).await?;

        let mut tracker = RetryTracker::default();
        let mut progress = RunProgress::default();
        let mut position = start;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let outcome = TraversalDriver::new(
                &mut self.session,
                &self.reconciler,
                &self.criteria,
                self.step_timeout,
            )
            .run(ctx, position, &mut progress)
            .await;

            let err = match outcome {
                Ok(()) => break,
                Err(err) => err,
            };

            if !err.is_retryable() {
                error!(
                    position = %err.position,
                    last_processed = ?progress.last_processed,
                    error = %err,
                    "non-retryable failure, aborting run"
                );
                self.release_session().await;
                return Err(SyncError::Traversal(err));
            }

            position = self.reconnect(&mut tracker, err).await?;
        }

        self.release_session().await;
        let summary = RunSummary {
            run_id: ctx.run_id,
            started_at: ctx.started_at,
            finished_at: Utc::now(),
            start,
            last_position: progress.last_processed,
            patients_processed: progress.totals.patients_processed(),
            rows_skipped: progress.totals.rows_skipped,
            attempts,
            dry_run: self.dry_run,
            totals: progress.totals,
        };
        info!(
            patients = summary.patients_processed,
            attempts,
            last_position = ?summary.last_position,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Backs off and reconnects after a retryable failure. A failed reconnect counts as
    /// one more failure at the same position, so only the retry bound ends the run.
    /// Returns the position to resume from.
    async fn reconnect(
        &mut self,
        tracker: &mut RetryTracker,
        mut failure: TraversalError,
    ) -> Result<CheckpointPosition, SyncError> {
        loop {
            let failures = tracker.record_failure(failure.position);
            if self.policy.exhausted(failures) {
                error!(
                    position = %failure.position,
                    failures,
                    error = %failure,
                    "retries exhausted, resume manually from this position"
                );
                self.release_session().await;
                return Err(SyncError::RetriesExhausted {
                    position: failure.position,
                    attempts: failures,
                    source: failure,
                });
            }

            let delay = self.policy.delay_for_attempt(failures);
            warn!(
                position = %failure.position,
                retry = failures,
                max_retries = self.policy.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "traversal failed, reconnecting"
            );
            self.release_session().await;
            tokio::time::sleep(delay).await;

            match self.session.connect(&self.credentials).await {
                Ok(()) => return Ok(failure.position),
                Err(err) => {
                    warn!(position = %failure.position, error = %err, "reconnect failed");
                    failure = TraversalError::new(failure.position, err);
                }
            }
        }
    }

    async fn release_session(&mut self) {
        if !self.session.is_connected() {
            return;
        }
        if let Err(err) = self.session.disconnect().await {
            warn!(error = %err, "disconnecting portal session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_position_accumulates() {
        let mut tracker = RetryTracker::default();
        let position = CheckpointPosition::new(4, 2);
        assert_eq!(tracker.record_failure(position), 1);
        assert_eq!(tracker.record_failure(position), 2);
        assert_eq!(tracker.record_failure(position), 3);
        assert_eq!(tracker.last_failure(), Some(position));
    }

    #[test]
    fn new_position_resets_to_one() {
        let mut tracker = RetryTracker::default();
        tracker.record_failure(CheckpointPosition::new(1, 3));
        tracker.record_failure(CheckpointPosition::new(1, 3));
        assert_eq!(tracker.record_failure(CheckpointPosition::new(1, 4)), 1);
        assert_eq!(tracker.consecutive_failures(), 1);
    }

    #[test]
    fn fourth_failure_at_one_position_exhausts_default_policy() {
        let policy = BackoffPolicy::default();
        let mut tracker = RetryTracker::default();
        let position = CheckpointPosition::new(2, 0);
        let counts = (0..4)
            .map(|_| tracker.record_failure(position))
            .collect::<Vec<_>>();
        assert_eq!(counts, vec![1, 2, 3, 4]);
        assert!(!policy.exhausted(3));
        assert!(policy.exhausted(4));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(6000));
    }
}
