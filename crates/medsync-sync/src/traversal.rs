//! Walks the paginated result list row by row and syncs every patient it opens.

use std::future::Future;
use std::time::Duration;

use medsync_core::{CheckpointPosition, RunContext, RunTotals};
use medsync_portal::{PatientRow, PortalConnector, PortalError, PortalSession, SearchCriteria};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{StepError, TraversalError};
use crate::reconcile::{Reconciler, ScrapedPatient};
use crate::session::SessionController;

/// Progress carried across traversal attempts of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunProgress {
    pub totals: RunTotals,
    pub last_processed: Option<CheckpointPosition>,
}

/// Bounds one portal step by the configured operation timeout.
async fn bounded<T, F>(limit: Duration, step: &'static str, fut: F) -> Result<T, PortalError>
where
    F: Future<Output = Result<T, PortalError>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| PortalError::Timeout { step, after: limit })?
}

pub struct TraversalDriver<'a, C: PortalConnector> {
    session: &'a mut SessionController<C>,
    reconciler: &'a Reconciler,
    criteria: &'a SearchCriteria,
    step_timeout: Duration,
}

impl<'a, C: PortalConnector> TraversalDriver<'a, C> {
    pub fn new(
        session: &'a mut SessionController<C>,
        reconciler: &'a Reconciler,
        criteria: &'a SearchCriteria,
        step_timeout: Duration,
    ) -> Self {
        Self {
            session,
            reconciler,
            criteria,
            step_timeout,
        }
    }

    /// Runs from `start` until the result list is exhausted. Any failure carries the
    /// position it happened at so the caller can resume there.
    pub async fn run(
        &mut self,
        ctx: &RunContext,
        start: CheckpointPosition,
        progress: &mut RunProgress,
    ) -> Result<(), TraversalError> {
        let mut position = start;
        self.apply_filter()
            .await
            .map_err(|err| TraversalError::new(position, err))?;

        loop {
            match self.open_page(position.page_index).await {
                Ok(()) => {}
                Err(PortalError::PageUnavailable { page_index }) => {
                    info!(page_index, "result page unavailable, traversal finished");
                    return Ok(());
                }
                Err(err) => return Err(TraversalError::new(position, err)),
            }

            let row = match self.open_row(position.patient_index).await {
                Ok(row) => row,
                Err(PortalError::NotAPatientRow { last_on_page, .. }) => {
                    debug!(%position, "row is not a patient, skipping");
                    progress.totals.rows_skipped += 1;
                    match self.advance(position, last_on_page).await? {
                        Some(next) => {
                            position = next;
                            continue;
                        }
                        None => return Ok(()),
                    }
                }
                Err(PortalError::RowAbsent { .. }) => {
                    info!(%position, "no more rows, traversal finished");
                    return Ok(());
                }
                Err(err) => return Err(TraversalError::new(position, err)),
            };

            let scraped = self
                .scrape(position)
                .await
                .map_err(|err| TraversalError::new(position, err))?;
            let report = self
                .reconciler
                .sync_patient(ctx, position, &scraped)
                .await
                .map_err(|err| TraversalError::new(position, err))?;
            progress.totals.absorb(&report);
            progress.last_processed = Some(position);

            match self.advance(position, row.last_on_page).await? {
                Some(next) => position = next,
                None => return Ok(()),
            }
        }
    }

    /// Next row, or the first row of the next page once the last row was handled.
    /// `None` when there is no next page.
    async fn advance(
        &mut self,
        position: CheckpointPosition,
        last_on_page: bool,
    ) -> Result<Option<CheckpointPosition>, TraversalError> {
        if !last_on_page {
            return Ok(Some(position.next_row()));
        }
        let next = position.next_page();
        match self.open_page(next.page_index).await {
            Ok(()) => {
                debug!(page_index = next.page_index, "moved to next result page");
                Ok(Some(next))
            }
            Err(PortalError::PageUnavailable { .. }) => {
                info!(%position, "last row of last page processed, traversal finished");
                Ok(None)
            }
            Err(err) => Err(TraversalError::new(next, err)),
        }
    }

    async fn apply_filter(&mut self) -> Result<(), PortalError> {
        let limit = self.step_timeout;
        let criteria = self.criteria;
        let portal = self.session.session_mut()?;
        bounded(limit, "apply_filter", portal.apply_filter(criteria)).await
    }

    async fn open_page(&mut self, page_index: u32) -> Result<(), PortalError> {
        let limit = self.step_timeout;
        let portal = self.session.session_mut()?;
        bounded(limit, "goto_result_page", portal.goto_result_page(page_index)).await
    }

    async fn open_row(&mut self, row_index: u32) -> Result<PatientRow, PortalError> {
        let limit = self.step_timeout;
        let portal = self.session.session_mut()?;
        bounded(limit, "goto_patient_row", portal.goto_patient_row(row_index)).await
    }

    async fn scrape(&mut self, position: CheckpointPosition) -> Result<ScrapedPatient, StepError> {
        let limit = self.step_timeout;
        let portal = self.session.session_mut()?;

        let patient = bounded(limit, "scrape_patient", portal.scrape_patient()).await?;
        let appointments =
            bounded(limit, "scrape_appointments", portal.scrape_appointments()).await?;
        let invoices = bounded(
            limit,
            "scrape_invoices",
            portal.scrape_invoices(patient.insurance_id.as_deref()),
        )
        .await?;
        bounded(limit, "go_back", portal.go_back()).await?;

        debug!(
            %position,
            patient = %patient.display_name(),
            appointments = appointments.len(),
            invoices = invoices.len(),
            "patient scraped"
        );
        Ok(ScrapedPatient {
            patient,
            appointments,
            invoices,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;

    use chrono::NaiveDate;
    use medsync_core::SyncAction;
    use medsync_portal::{Credentials, FixtureConnector, LaunchOptions};
    use medsync_storage::MemoryRepository;

    fn fixture_connector() -> FixtureConnector {
        FixtureConnector::from_path(
            Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/portal/sample.json"),
        )
        .expect("fixture")
    }

    async fn connected() -> SessionController<FixtureConnector> {
        let mut session = SessionController::new(
            fixture_connector(),
            "https://portal.invalid/",
            LaunchOptions::default(),
        );
        session
            .connect(&Credentials::new("demo", "demo"))
            .await
            .expect("connect");
        session
    }

    fn ctx() -> RunContext {
        RunContext::new(NaiveDate::from_ymd_opt(2026, 3, 10).expect("date"))
    }

    #[tokio::test]
    async fn walks_every_page_and_skips_third_party_rows() {
        let repository = Arc::new(MemoryRepository::new());
        let reconciler = Reconciler::new(repository.clone());
        let criteria = SearchCriteria::default();
        let mut session = connected().await;
        let mut progress = RunProgress::default();

        TraversalDriver::new(&mut session, &reconciler, &criteria, Duration::from_secs(5))
            .run(&ctx(), CheckpointPosition::default(), &mut progress)
            .await
            .expect("traversal");

        assert_eq!(progress.totals.patients_created, 4);
        assert_eq!(progress.totals.rows_skipped, 1);
        assert_eq!(progress.last_processed, Some(CheckpointPosition::new(2, 1)));
        assert_eq!(repository.patients().await.len(), 4);

        let positions = repository
            .activity()
            .await
            .into_iter()
            .map(|r| r.position)
            .collect::<Vec<_>>();
        assert_eq!(
            positions,
            vec![
                CheckpointPosition::new(1, 0),
                CheckpointPosition::new(1, 2),
                CheckpointPosition::new(2, 0),
                CheckpointPosition::new(2, 1),
            ]
        );
    }

    #[tokio::test]
    async fn resumes_from_the_given_position() {
        let repository = Arc::new(MemoryRepository::new());
        let reconciler = Reconciler::new(repository.clone());
        let criteria = SearchCriteria::default();
        let mut session = connected().await;
        let mut progress = RunProgress::default();

        TraversalDriver::new(&mut session, &reconciler, &criteria, Duration::from_secs(5))
            .run(&ctx(), CheckpointPosition::new(2, 0), &mut progress)
            .await
            .expect("traversal");

        assert_eq!(progress.totals.patients_processed(), 2);
        assert!(repository
            .activity()
            .await
            .iter()
            .all(|r| r.position.page_index == 2 && r.action == SyncAction::Created));
    }

    #[tokio::test]
    async fn start_past_the_last_page_finishes_without_work() {
        let repository = Arc::new(MemoryRepository::new());
        let reconciler = Reconciler::new(repository.clone());
        let criteria = SearchCriteria::default();
        let mut session = connected().await;
        let mut progress = RunProgress::default();

        TraversalDriver::new(&mut session, &reconciler, &criteria, Duration::from_secs(5))
            .run(&ctx(), CheckpointPosition::new(7, 0), &mut progress)
            .await
            .expect("traversal");

        assert_eq!(progress, RunProgress::default());
    }

    #[tokio::test]
    async fn disconnected_session_fails_at_start_position() {
        let repository = Arc::new(MemoryRepository::new());
        let reconciler = Reconciler::new(repository);
        let criteria = SearchCriteria::default();
        let mut session = SessionController::new(
            fixture_connector(),
            "https://portal.invalid/",
            LaunchOptions::default(),
        );
        let mut progress = RunProgress::default();

        let err = TraversalDriver::new(&mut session, &reconciler, &criteria, Duration::from_secs(5))
            .run(&ctx(), CheckpointPosition::new(1, 2), &mut progress)
            .await
            .expect_err("not connected");

        assert_eq!(err.position, CheckpointPosition::new(1, 2));
        assert!(err.is_retryable());
    }
}
