//! Merges a freshly scraped patient into stored state.
//!
//! Appointments carry no identity upstream, so they are matched in two passes:
//! exact start time first, then index-by-index over whatever is left of the future
//! set. Past appointments only ever match exactly and are never tombstoned.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{NaiveDate, Utc};
use medsync_core::{
    AppointmentSnapshot, CheckpointPosition, InvoiceSnapshot, PatientSnapshot, PatientSyncReport,
    ReconcileCounts, RunContext, StoredAppointment, SyncAction,
};
use medsync_storage::Repository;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::ActivityTracker;
use crate::error::{ReconcileContext, ReconcileError};

/// Everything scraped for one patient row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScrapedPatient {
    pub patient: PatientSnapshot,
    pub appointments: Vec<AppointmentSnapshot>,
    pub invoices: Vec<InvoiceSnapshot>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatientUpsert {
    pub patient_id: Uuid,
    pub action: SyncAction,
}

/// Writes an appointment reconciliation decided, before touching storage.
#[derive(Debug, Default, PartialEq)]
pub struct AppointmentPlan<'a> {
    pub updates: Vec<(Uuid, &'a AppointmentSnapshot)>,
    pub inserts: Vec<&'a AppointmentSnapshot>,
    pub tombstones: Vec<Uuid>,
    pub unchanged: usize,
    /// Later fresh entries sharing a start time with an earlier one.
    pub duplicates: usize,
}

impl<'a> AppointmentPlan<'a> {
    fn pair(&mut self, stored: &StoredAppointment, fresh: &'a AppointmentSnapshot) {
        if stored.appointment == *fresh {
            self.unchanged += 1;
        } else {
            self.updates.push((stored.id, fresh));
        }
    }
}

struct Leftovers<'s, 'f> {
    stored: Vec<&'s StoredAppointment>,
    fresh: Vec<&'f AppointmentSnapshot>,
}

/// Pairs fresh entries with stored entries of the identical start time.
fn match_exact<'s, 'f>(
    stored: Vec<&'s StoredAppointment>,
    fresh: Vec<&'f AppointmentSnapshot>,
    plan: &mut AppointmentPlan<'f>,
) -> Leftovers<'s, 'f> {
    let mut stored: Vec<Option<&StoredAppointment>> = stored.into_iter().map(Some).collect();
    let mut seen = HashSet::new();
    let mut unmatched = Vec::new();

    for appointment in fresh {
        if !seen.insert(appointment.starts_at) {
            plan.duplicates += 1;
            continue;
        }
        let slot = stored.iter_mut().find(|slot| {
            slot.is_some_and(|s| s.appointment.starts_at == appointment.starts_at)
        });
        match slot.and_then(Option::take) {
            Some(existing) => plan.pair(existing, appointment),
            None => unmatched.push(appointment),
        }
    }

    Leftovers {
        stored: stored.into_iter().flatten().collect(),
        fresh: unmatched,
    }
}

pub fn plan_appointments<'f>(
    stored: &[StoredAppointment],
    fresh: &'f [AppointmentSnapshot],
    today: NaiveDate,
) -> AppointmentPlan<'f> {
    let mut plan = AppointmentPlan::default();

    let (stored_past, stored_future): (Vec<_>, Vec<_>) =
        stored.iter().partition(|s| s.appointment.is_past(today));
    let (fresh_past, fresh_future): (Vec<_>, Vec<_>) =
        fresh.iter().partition(|a| a.is_past(today));

    // Unmatched stored past entries stay as they are.
    let past = match_exact(stored_past, fresh_past, &mut plan);
    plan.inserts.extend(past.fresh);

    let future = match_exact(stored_future, fresh_future, &mut plan);
    let mut stored_rest = future.stored;
    let mut fresh_rest = future.fresh;
    stored_rest.sort_by_key(|s| s.appointment.starts_at);
    fresh_rest.sort_by_key(|a| a.starts_at);

    let paired = stored_rest.len().min(fresh_rest.len());
    for (existing, appointment) in stored_rest.iter().zip(fresh_rest.iter().copied()) {
        plan.pair(existing, appointment);
    }
    plan.tombstones.extend(stored_rest[paired..].iter().map(|s| s.id));
    plan.inserts.extend_from_slice(&fresh_rest[paired..]);

    plan
}

#[derive(Clone)]
pub struct Reconciler {
    repository: Arc<dyn Repository>,
    activity: ActivityTracker,
}

impl Reconciler {
    pub fn new(repository: Arc<dyn Repository>) -> Self {
        Self {
            activity: ActivityTracker::new(Arc::clone(&repository)),
            repository,
        }
    }

    pub fn activity(&self) -> &ActivityTracker {
        &self.activity
    }

    /// Looks the patient up by natural key and writes only when something changed.
    pub async fn upsert_patient(
        &self,
        patient: &PatientSnapshot,
    ) -> Result<PatientUpsert, ReconcileError> {
        let key = patient.natural_key();
        let existing = self
            .repository
            .find_patient_by_natural_key(&key)
            .await
            .reconcile_context(|| format!("looking up patient {}", patient.display_name()))?;

        let Some(existing) = existing else {
            let patient_id = self
                .repository
                .insert_patient(patient)
                .await
                .reconcile_context(|| format!("inserting patient {}", patient.display_name()))?;
            return Ok(PatientUpsert {
                patient_id,
                action: SyncAction::Created,
            });
        };

        if existing.patient == *patient {
            return Ok(PatientUpsert {
                patient_id: existing.id,
                action: SyncAction::Skipped,
            });
        }
        self.repository
            .update_patient(existing.id, patient)
            .await
            .reconcile_context(|| format!("updating patient {}", existing.id))?;
        Ok(PatientUpsert {
            patient_id: existing.id,
            action: SyncAction::Updated,
        })
    }

    pub async fn reconcile_appointments(
        &self,
        patient_id: Uuid,
        fresh: &[AppointmentSnapshot],
        today: NaiveDate,
    ) -> Result<ReconcileCounts, ReconcileError> {
        let stored = self
            .repository
            .list_active_appointments(patient_id)
            .await
            .reconcile_context(|| format!("listing appointments of patient {patient_id}"))?;
        let plan = plan_appointments(&stored, fresh, today);

        for (id, appointment) in &plan.updates {
            self.repository
                .update_appointment(*id, appointment)
                .await
                .reconcile_context(|| format!("updating appointment {id}"))?;
        }
        for appointment in &plan.inserts {
            self.repository
                .insert_appointment(patient_id, appointment)
                .await
                .reconcile_context(|| {
                    format!(
                        "inserting appointment at {} for patient {patient_id}",
                        appointment.starts_at
                    )
                })?;
        }
        let deleted_at = Utc::now();
        for id in &plan.tombstones {
            self.repository
                .soft_delete_appointment(*id, deleted_at)
                .await
                .reconcile_context(|| format!("tombstoning appointment {id}"))?;
        }

        let counts = ReconcileCounts {
            created: plan.inserts.len(),
            updated: plan.updates.len(),
            skipped: plan.unchanged + plan.duplicates,
            deleted: plan.tombstones.len(),
        };
        debug!(%patient_id, ?counts, "appointments reconciled");
        Ok(counts)
    }

    /// Invoices without both number and centre cannot be matched and are always inserted.
    pub async fn reconcile_invoices(
        &self,
        patient_id: Uuid,
        fresh: &[InvoiceSnapshot],
    ) -> Result<ReconcileCounts, ReconcileError> {
        let mut counts = ReconcileCounts::default();

        for invoice in fresh {
            let existing = match invoice.natural_key() {
                Some((number, centre)) => self
                    .repository
                    .find_invoice(number, centre)
                    .await
                    .reconcile_context(|| format!("looking up invoice {number} ({centre})"))?,
                None => None,
            };

            let (invoice_id, action) = match existing {
                Some(stored)
                    if stored.patient_id == patient_id && stored.invoice.same_header(invoice) =>
                {
                    counts.record(SyncAction::Skipped);
                    continue;
                }
                Some(stored) => {
                    self.repository
                        .update_invoice(stored.id, patient_id, invoice)
                        .await
                        .reconcile_context(|| format!("updating invoice {}", stored.id))?;
                    (stored.id, SyncAction::Updated)
                }
                None => {
                    let id = self
                        .repository
                        .insert_invoice(patient_id, invoice)
                        .await
                        .reconcile_context(|| {
                            format!("inserting invoice for patient {patient_id}")
                        })?;
                    (id, SyncAction::Created)
                }
            };

            self.repository
                .replace_services(invoice_id, &invoice.services)
                .await
                .reconcile_context(|| format!("replacing services of invoice {invoice_id}"))?;
            counts.record(action);
        }

        debug!(%patient_id, ?counts, "invoices reconciled");
        Ok(counts)
    }

    /// Full per-patient step: upsert, dependents, activity row. A patient created here
    /// is removed again if anything after its insert fails.
    #[instrument(
        name = "patient",
        skip_all,
        fields(
            run_id = %ctx.run_id,
            page_index = position.page_index,
            patient_index = position.patient_index
        )
    )]
    pub async fn sync_patient(
        &self,
        ctx: &RunContext,
        position: CheckpointPosition,
        scraped: &ScrapedPatient,
    ) -> Result<PatientSyncReport, ReconcileError> {
        let upsert = self.upsert_patient(&scraped.patient).await?;

        match self.sync_dependents(ctx, position, upsert, scraped).await {
            Ok(report) => {
                info!(
                    patient_id = %report.patient_id,
                    action = %report.activity,
                    appointments_created = report.appointments.created,
                    appointments_updated = report.appointments.updated,
                    appointments_deleted = report.appointments.deleted,
                    invoices_created = report.invoices.created,
                    invoices_updated = report.invoices.updated,
                    "patient synced"
                );
                Ok(report)
            }
            Err(err) => {
                if upsert.action == SyncAction::Created {
                    warn!(patient_id = %upsert.patient_id, error = %err, "removing partially synced patient");
                    if let Err(cleanup) = self.repository.delete_patient(upsert.patient_id).await {
                        error!(
                            patient_id = %upsert.patient_id,
                            error = %cleanup,
                            "could not remove partially synced patient"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn sync_dependents(
        &self,
        ctx: &RunContext,
        position: CheckpointPosition,
        upsert: PatientUpsert,
        scraped: &ScrapedPatient,
    ) -> Result<PatientSyncReport, ReconcileError> {
        let appointments = self
            .reconcile_appointments(upsert.patient_id, &scraped.appointments, ctx.today)
            .await?;
        let invoices = self
            .reconcile_invoices(upsert.patient_id, &scraped.invoices)
            .await?;
        let activity = ActivityTracker::classify(upsert.action, &appointments, &invoices);
        self.activity
            .record(ctx, upsert.patient_id, position, activity)
            .await?;

        Ok(PatientSyncReport {
            patient_id: upsert.patient_id,
            patient: upsert.action,
            appointments,
            invoices,
            activity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDateTime;
    use medsync_core::ServiceLine;
    use medsync_storage::MemoryRepository;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 10).expect("date")
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .and_then(|d| d.and_hms_opt(hour, 0, 0))
            .expect("datetime")
    }

    fn appointment(starts_at: NaiveDateTime, status: &str) -> AppointmentSnapshot {
        AppointmentSnapshot {
            starts_at,
            status: Some(status.to_string()),
            duration_minutes: Some(30),
            event_name: Some("Physiothérapie".to_string()),
            contact: None,
            centre: Some("Centre Yverdon".to_string()),
            practitioner: Some("M. Girard".to_string()),
        }
    }

    fn stored(appointment: AppointmentSnapshot) -> StoredAppointment {
        StoredAppointment {
            id: Uuid::new_v4(),
            patient_id: Uuid::nil(),
            appointment,
            deleted_at: None,
        }
    }

    fn patient() -> PatientSnapshot {
        PatientSnapshot {
            first_name: Some("Anna".into()),
            last_name: Some("Muller".into()),
            date_of_birth: NaiveDate::from_ymd_opt(1980, 5, 17),
            insurance_id: Some("756.1234.5678.97".into()),
            ..Default::default()
        }
    }

    fn invoice(number: &str, total: f64) -> InvoiceSnapshot {
        InvoiceSnapshot {
            invoice_number: Some(number.to_string()),
            centre: Some("Centre Yverdon".to_string()),
            total_amount: Some(total),
            services: vec![ServiceLine {
                position_code: Some("7301".into()),
                amount: Some(total),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    async fn reconciler_with_patient() -> (Reconciler, Arc<MemoryRepository>, Uuid) {
        let repository = Arc::new(MemoryRepository::new());
        let reconciler = Reconciler::new(repository.clone());
        let upsert = reconciler.upsert_patient(&patient()).await.expect("upsert");
        (reconciler, repository, upsert.patient_id)
    }

    #[test]
    fn past_and_future_never_pair_across_today() {
        let stored_rows = vec![stored(appointment(at(9, 10), "Présent"))];
        let fresh = vec![appointment(at(11, 10), "Planifié")];
        let plan = plan_appointments(&stored_rows, &fresh, today());

        assert!(plan.updates.is_empty());
        assert_eq!(plan.inserts, vec![&fresh[0]]);
        assert!(plan.tombstones.is_empty());
    }

    #[test]
    fn repeated_start_times_keep_only_the_first() {
        let fresh = vec![
            appointment(at(2, 9), "Présent"),
            appointment(at(2, 9), "Excusé"),
        ];
        let plan = plan_appointments(&[], &fresh, today());
        assert_eq!(plan.inserts, vec![&fresh[0]]);
        assert_eq!(plan.duplicates, 1);
    }

    #[test]
    fn positional_pairing_follows_sorted_order() {
        let stored_rows = vec![
            stored(appointment(at(20, 9), "Planifié")),
            stored(appointment(at(12, 9), "Planifié")),
        ];
        let fresh = vec![
            appointment(at(21, 9), "Planifié"),
            appointment(at(13, 9), "Planifié"),
        ];
        let plan = plan_appointments(&stored_rows, &fresh, today());

        assert_eq!(
            plan.updates,
            vec![(stored_rows[1].id, &fresh[1]), (stored_rows[0].id, &fresh[0])]
        );
        assert!(plan.inserts.is_empty());
        assert!(plan.tombstones.is_empty());
    }

    #[tokio::test]
    async fn unchanged_appointments_reconcile_to_no_writes() {
        let (reconciler, _repository, patient_id) = reconciler_with_patient().await;
        let fresh = vec![
            appointment(at(3, 9), "Présent"),
            appointment(at(12, 14), "Planifié"),
            appointment(at(19, 14), "Planifié"),
        ];

        let first = reconciler
            .reconcile_appointments(patient_id, &fresh, today())
            .await
            .expect("first pass");
        assert_eq!(first.created, 3);

        let second = reconciler
            .reconcile_appointments(patient_id, &fresh, today())
            .await
            .expect("second pass");
        assert_eq!(
            second,
            ReconcileCounts {
                created: 0,
                updated: 0,
                skipped: 3,
                deleted: 0
            }
        );
    }

    #[tokio::test]
    async fn past_status_change_updates_in_place() {
        let (reconciler, repository, patient_id) = reconciler_with_patient().await;
        reconciler
            .reconcile_appointments(patient_id, &[appointment(at(4, 9), "Planifié")], today())
            .await
            .expect("seed");

        let counts = reconciler
            .reconcile_appointments(patient_id, &[appointment(at(4, 9), "Présent")], today())
            .await
            .expect("resync");
        assert_eq!((counts.updated, counts.created), (1, 0));

        let rows = repository.all_appointments(patient_id).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].appointment.status.as_deref(), Some("Présent"));
    }

    #[tokio::test]
    async fn stored_past_entries_missing_upstream_are_kept() {
        let (reconciler, repository, patient_id) = reconciler_with_patient().await;
        reconciler
            .reconcile_appointments(patient_id, &[appointment(at(4, 9), "Présent")], today())
            .await
            .expect("seed");

        let counts = reconciler
            .reconcile_appointments(patient_id, &[], today())
            .await
            .expect("resync");
        assert_eq!(counts.deleted, 0);
        assert!(repository.all_appointments(patient_id).await[0].deleted_at.is_none());
    }

    #[tokio::test]
    async fn shifted_future_dates_are_paired_by_position() {
        let (reconciler, repository, patient_id) = reconciler_with_patient().await;
        reconciler
            .reconcile_appointments(
                patient_id,
                &[appointment(at(12, 9), "Planifié"), appointment(at(18, 9), "Planifié")],
                today(),
            )
            .await
            .expect("seed");

        let counts = reconciler
            .reconcile_appointments(
                patient_id,
                &[appointment(at(13, 9), "Confirmé"), appointment(at(19, 9), "Confirmé")],
                today(),
            )
            .await
            .expect("resync");
        assert_eq!((counts.updated, counts.deleted, counts.created), (2, 0, 0));
        assert_eq!(repository.all_appointments(patient_id).await.len(), 2);
    }

    #[tokio::test]
    async fn vanished_future_appointment_is_tombstoned_once() {
        let (reconciler, repository, patient_id) = reconciler_with_patient().await;
        let kept = appointment(at(12, 9), "Planifié");
        reconciler
            .reconcile_appointments(
                patient_id,
                &[kept.clone(), appointment(at(15, 9), "Planifié")],
                today(),
            )
            .await
            .expect("seed");

        let first = reconciler
            .reconcile_appointments(patient_id, &[kept.clone()], today())
            .await
            .expect("resync");
        assert_eq!((first.deleted, first.skipped), (1, 1));

        let second = reconciler
            .reconcile_appointments(patient_id, &[kept], today())
            .await
            .expect("repeat");
        assert_eq!((second.deleted, second.created), (0, 0));

        let rows = repository.all_appointments(patient_id).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows.iter().filter(|r| r.deleted_at.is_some()).count(), 1);
    }

    #[tokio::test]
    async fn patient_upsert_is_keyed_on_natural_key() {
        let repository = Arc::new(MemoryRepository::new());
        let reconciler = Reconciler::new(repository.clone());

        let first = reconciler.upsert_patient(&patient()).await.expect("insert");
        let second = reconciler.upsert_patient(&patient()).await.expect("repeat");
        assert_eq!(first.action, SyncAction::Created);
        assert_eq!(second.action, SyncAction::Skipped);
        assert_eq!(first.patient_id, second.patient_id);

        let mut moved = patient();
        moved.street = Some("Rue du Lac 1".into());
        let third = reconciler.upsert_patient(&moved).await.expect("update");
        assert_eq!(third.action, SyncAction::Updated);
        assert_eq!(repository.patients().await.len(), 1);

        let mut without_id = patient();
        without_id.insurance_id = None;
        let fourth = reconciler.upsert_patient(&without_id).await.expect("insert");
        assert_eq!(fourth.action, SyncAction::Created);
        assert_eq!(repository.patients().await.len(), 2);
    }

    #[tokio::test]
    async fn duplicate_invoice_keys_write_one_row() {
        let (reconciler, repository, patient_id) = reconciler_with_patient().await;
        reconciler
            .reconcile_invoices(patient_id, &[invoice("F-1", 100.0)])
            .await
            .expect("seed");

        let counts = reconciler
            .reconcile_invoices(patient_id, &[invoice("F-1", 120.0), invoice("F-1", 120.0)])
            .await
            .expect("resync");
        assert_eq!((counts.updated, counts.created, counts.skipped), (1, 0, 1));

        let invoices = repository.invoices().await;
        assert_eq!(invoices.len(), 1);
        assert_eq!(invoices[0].invoice.total_amount, Some(120.0));
        let services = repository.services(invoices[0].id).await;
        assert_eq!(services.len(), 1);
        assert_eq!(services[0].amount, Some(120.0));
    }

    #[tokio::test]
    async fn keyless_invoices_are_always_inserted() {
        let (reconciler, repository, patient_id) = reconciler_with_patient().await;
        let mut keyless = invoice("F-9", 80.0);
        keyless.centre = None;

        for _ in 0..2 {
            let counts = reconciler
                .reconcile_invoices(patient_id, &[keyless.clone()])
                .await
                .expect("insert");
            assert_eq!(counts.created, 1);
        }
        assert_eq!(repository.invoices().await.len(), 2);
    }

    #[tokio::test]
    async fn sync_patient_records_one_activity_row() {
        let repository = Arc::new(MemoryRepository::new());
        let reconciler = Reconciler::new(repository.clone());
        let ctx = RunContext::new(today());
        let scraped = ScrapedPatient {
            patient: patient(),
            appointments: vec![appointment(at(12, 9), "Planifié")],
            invoices: vec![invoice("F-1", 100.0)],
        };

        let first = reconciler
            .sync_patient(&ctx, CheckpointPosition::new(1, 0), &scraped)
            .await
            .expect("first");
        assert_eq!(first.activity, SyncAction::Created);

        let second = reconciler
            .sync_patient(&ctx, CheckpointPosition::new(1, 0), &scraped)
            .await
            .expect("second");
        assert_eq!(second.activity, SyncAction::Skipped);

        let activity = repository.activity().await;
        assert_eq!(activity.len(), 2);
        assert!(activity.iter().all(|r| r.run_id == ctx.run_id));
    }
}
