//! Core domain model for portal sync: scraped snapshots, stored records and run bookkeeping.

use std::fmt;
use std::ops::AddAssign;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "medsync-core";

/// Patient detail form as observed on the portal. Every field is optional because
/// the portal leaves blanks freely.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PatientSnapshot {
    pub patient_number: Option<String>,
    pub insurance_id: Option<String>,
    pub title: Option<String>,
    pub courtesy_title: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub maiden_name: Option<String>,
    pub address_complement: Option<String>,
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub locality: Option<String>,
    pub country: Option<String>,
    pub phone_1: Option<String>,
    pub phone_2: Option<String>,
    pub phone_3: Option<String>,
    pub email: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub date_of_death: Option<NaiveDate>,
    pub sex: Option<String>,
    pub gender: Option<String>,
    pub language: Option<String>,
    pub nationality: Option<String>,
    pub marital_status: Option<String>,
    pub profession: Option<String>,
    pub employer: Option<String>,
    pub attending_doctor: Option<String>,
    pub debtor: Option<String>,
    pub contact: Option<String>,
    pub legal_representative: Option<String>,
    pub sms_notification: Option<String>,
    pub comment: Option<String>,
}

impl PatientSnapshot {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            first_name: self.first_name.clone(),
            last_name: self.last_name.clone(),
            date_of_birth: self.date_of_birth,
            insurance_id: self.insurance_id.clone(),
        }
    }

    pub fn display_name(&self) -> String {
        format!(
            "{} {}",
            self.first_name.as_deref().unwrap_or("?"),
            self.last_name.as_deref().unwrap_or("?")
        )
    }
}

/// Patient identity tuple. An absent component only matches a stored NULL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NaturalKey {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub date_of_birth: Option<NaiveDate>,
    pub insurance_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredPatient {
    pub id: Uuid,
    pub patient: PatientSnapshot,
}

/// One line of a patient's appointment list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentSnapshot {
    pub starts_at: NaiveDateTime,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub duration_minutes: Option<i32>,
    #[serde(default)]
    pub event_name: Option<String>,
    #[serde(default)]
    pub contact: Option<String>,
    #[serde(default)]
    pub centre: Option<String>,
    #[serde(default)]
    pub practitioner: Option<String>,
}

impl AppointmentSnapshot {
    /// Past means the calendar day is strictly before `today`.
    pub fn is_past(&self, today: NaiveDate) -> bool {
        self.starts_at.date() < today
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredAppointment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub appointment: AppointmentSnapshot,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Invoice line item. Carries no identity of its own across scrapes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceLine {
    pub date: Option<NaiveDate>,
    pub quantity: Option<f64>,
    pub position_code: Option<String>,
    pub description: Option<String>,
    pub unit_value: Option<f64>,
    pub points: Option<f64>,
    pub point_value: Option<f64>,
    pub amount: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct InvoiceSnapshot {
    pub invoice_number: Option<String>,
    pub centre: Option<String>,
    pub date: Option<NaiveDate>,
    pub patient_insurance_id: Option<String>,
    pub insured_person_number: Option<String>,
    pub insured_card_number: Option<String>,
    pub reimbursement_type: Option<String>,
    pub law: Option<String>,
    pub treatment_type: Option<String>,
    pub treatment_start: Option<NaiveDate>,
    pub treatment_end: Option<NaiveDate>,
    pub service_location: Option<String>,
    pub prescribing_doctor: Option<String>,
    pub prescribing_doctor_address: Option<String>,
    pub case_date: Option<NaiveDate>,
    pub decision_number: Option<String>,
    pub total_amount: Option<f64>,
    pub services: Vec<ServiceLine>,
}

impl InvoiceSnapshot {
    /// `(invoice number, centre)` when both are present; otherwise the invoice is unmatchable.
    pub fn natural_key(&self) -> Option<(&str, &str)> {
        match (self.invoice_number.as_deref(), self.centre.as_deref()) {
            (Some(number), Some(centre)) => Some((number, centre)),
            _ => None,
        }
    }

    /// Compares the invoice row fields, ignoring service lines.
    pub fn same_header(&self, other: &InvoiceSnapshot) -> bool {
        self.invoice_number == other.invoice_number
            && self.centre == other.centre
            && self.date == other.date
            && self.patient_insurance_id == other.patient_insurance_id
            && self.insured_person_number == other.insured_person_number
            && self.insured_card_number == other.insured_card_number
            && self.reimbursement_type == other.reimbursement_type
            && self.law == other.law
            && self.treatment_type == other.treatment_type
            && self.treatment_start == other.treatment_start
            && self.treatment_end == other.treatment_end
            && self.service_location == other.service_location
            && self.prescribing_doctor == other.prescribing_doctor
            && self.prescribing_doctor_address == other.prescribing_doctor_address
            && self.case_date == other.case_date
            && self.decision_number == other.decision_number
            && self.total_amount == other.total_amount
    }
}

/// Stored invoice row. `invoice.services` is left empty on reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredInvoice {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub invoice: InvoiceSnapshot,
}

/// Traversal progress over the paginated result list. Orders by page, then row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CheckpointPosition {
    pub page_index: u32,
    pub patient_index: u32,
}

impl CheckpointPosition {
    pub fn new(page_index: u32, patient_index: u32) -> Self {
        Self {
            page_index,
            patient_index,
        }
    }

    pub fn next_row(self) -> Self {
        Self::new(self.page_index, self.patient_index + 1)
    }

    pub fn next_page(self) -> Self {
        Self::new(self.page_index + 1, 0)
    }
}

impl Default for CheckpointPosition {
    fn default() -> Self {
        Self::new(1, 0)
    }
}

impl fmt::Display for CheckpointPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {}, patient {}", self.page_index, self.patient_index)
    }
}

/// Per-run values threaded through every call instead of process-wide state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    /// Boundary between past and future appointments. Fixed when the run starts: a run
    /// that crosses midnight keeps classifying against its start day, so every patient in
    /// one run is reconciled against the same boundary.
    pub today: NaiveDate,
}

impl RunContext {
    pub fn new(today: NaiveDate) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            today,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncAction {
    Created,
    Updated,
    Skipped,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncAction::Created => "created",
            SyncAction::Updated => "updated",
            SyncAction::Skipped => "skipped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(SyncAction::Created),
            "updated" => Some(SyncAction::Updated),
            "skipped" => Some(SyncAction::Skipped),
            _ => None,
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReconcileCounts {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub deleted: usize,
}

impl ReconcileCounts {
    pub fn record(&mut self, action: SyncAction) {
        match action {
            SyncAction::Created => self.created += 1,
            SyncAction::Updated => self.updated += 1,
            SyncAction::Skipped => self.skipped += 1,
        }
    }

    /// True when anything was written (skips and nothing else do not count).
    pub fn has_writes(&self) -> bool {
        self.created > 0 || self.updated > 0 || self.deleted > 0
    }
}

impl AddAssign for ReconcileCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.created += rhs.created;
        self.updated += rhs.updated;
        self.skipped += rhs.skipped;
        self.deleted += rhs.deleted;
    }
}

/// Append-only audit and checkpoint row, one per processed patient.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityRecord {
    pub run_id: Uuid,
    pub patient_id: Uuid,
    pub position: CheckpointPosition,
    pub action: SyncAction,
    pub recorded_at: DateTime<Utc>,
}

/// What happened to one patient and its dependents during a sync step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatientSyncReport {
    pub patient_id: Uuid,
    pub patient: SyncAction,
    pub appointments: ReconcileCounts,
    pub invoices: ReconcileCounts,
    pub activity: SyncAction,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct RunTotals {
    pub patients_created: usize,
    pub patients_updated: usize,
    pub patients_skipped: usize,
    pub rows_skipped: usize,
    pub appointments: ReconcileCounts,
    pub invoices: ReconcileCounts,
}

impl RunTotals {
    pub fn absorb(&mut self, report: &PatientSyncReport) {
        match report.activity {
            SyncAction::Created => self.patients_created += 1,
            SyncAction::Updated => self.patients_updated += 1,
            SyncAction::Skipped => self.patients_skipped += 1,
        }
        self.appointments += report.appointments;
        self.invoices += report.invoices;
    }

    pub fn patients_processed(&self) -> usize {
        self.patients_created + self.patients_updated + self.patients_skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_positions_order_by_page_then_row() {
        let a = CheckpointPosition::new(1, 9);
        let b = CheckpointPosition::new(2, 0);
        assert!(a < b);
        assert_eq!(a.next_row(), CheckpointPosition::new(1, 10));
        assert_eq!(a.next_page(), b);
        assert_eq!(b.to_string(), "page 2, patient 0");
    }

    #[test]
    fn appointment_partition_uses_calendar_day() {
        let today = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let late_yesterday = AppointmentSnapshot {
            starts_at: NaiveDate::from_ymd_opt(2026, 3, 9)
                .unwrap()
                .and_hms_opt(23, 59, 0)
                .unwrap(),
            status: None,
            duration_minutes: None,
            event_name: None,
            contact: None,
            centre: None,
            practitioner: None,
        };
        let early_today = AppointmentSnapshot {
            starts_at: today.and_hms_opt(0, 1, 0).unwrap(),
            ..late_yesterday.clone()
        };
        assert!(late_yesterday.is_past(today));
        assert!(!early_today.is_past(today));
    }

    #[test]
    fn run_context_keeps_its_start_day_past_midnight() {
        let ctx = RunContext::new(NaiveDate::from_ymd_opt(2026, 3, 10).unwrap());
        let yesterday_evening = AppointmentSnapshot {
            starts_at: NaiveDate::from_ymd_opt(2026, 3, 10)
                .unwrap()
                .and_hms_opt(18, 0, 0)
                .unwrap(),
            status: None,
            duration_minutes: None,
            event_name: None,
            contact: None,
            centre: None,
            practitioner: None,
        };
        // Reached after midnight on the 11th, still judged against the 10th.
        assert_eq!(ctx.today, NaiveDate::from_ymd_opt(2026, 3, 10).unwrap());
        assert!(!yesterday_evening.is_past(ctx.today));
    }

    #[test]
    fn invoice_natural_key_requires_both_parts() {
        let mut invoice = InvoiceSnapshot {
            invoice_number: Some("F-1".into()),
            ..Default::default()
        };
        assert_eq!(invoice.natural_key(), None);
        invoice.centre = Some("Centre A".into());
        assert_eq!(invoice.natural_key(), Some(("F-1", "Centre A")));
    }

    #[test]
    fn header_comparison_ignores_services() {
        let a = InvoiceSnapshot {
            invoice_number: Some("F-1".into()),
            total_amount: Some(120.5),
            ..Default::default()
        };
        let mut b = a.clone();
        b.services.push(ServiceLine::default());
        assert!(a.same_header(&b));
        b.total_amount = None;
        assert!(!a.same_header(&b));
    }

    #[test]
    fn counts_report_writes_only_for_mutations() {
        let mut counts = ReconcileCounts::default();
        counts.record(SyncAction::Skipped);
        assert!(!counts.has_writes());
        counts.deleted += 1;
        assert!(counts.has_writes());
    }

    #[test]
    fn sync_action_round_trips_through_text() {
        for action in [SyncAction::Created, SyncAction::Updated, SyncAction::Skipped] {
            assert_eq!(SyncAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(SyncAction::parse("deleted"), None);
    }
}
