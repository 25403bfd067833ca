//! Storage capability consumed by the reconciliation engine and activity tracker.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medsync_core::{
    ActivityRecord, AppointmentSnapshot, InvoiceSnapshot, NaturalKey, PatientSnapshot,
    ServiceLine, StoredAppointment, StoredInvoice, StoredPatient,
};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },
    #[error("unreadable {table} row: {message}")]
    CorruptRow { table: &'static str, message: String },
    #[error("storage backend error: {0}")]
    Backend(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Operations the sync core needs from the relational store. Implementations must not
/// enforce uniqueness themselves; identity is decided by the caller's lookups.
#[async_trait]
pub trait Repository: Send + Sync {
    /// NULL-aware lookup: an absent key component only matches a stored NULL.
    async fn find_patient_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> StorageResult<Option<StoredPatient>>;
    async fn insert_patient(&self, patient: &PatientSnapshot) -> StorageResult<Uuid>;
    async fn update_patient(&self, id: Uuid, patient: &PatientSnapshot) -> StorageResult<()>;
    /// Removes the patient together with its appointments and invoices.
    async fn delete_patient(&self, id: Uuid) -> StorageResult<()>;

    /// Non-tombstoned appointments in storage order.
    async fn list_active_appointments(
        &self,
        patient_id: Uuid,
    ) -> StorageResult<Vec<StoredAppointment>>;
    async fn insert_appointment(
        &self,
        patient_id: Uuid,
        appointment: &AppointmentSnapshot,
    ) -> StorageResult<Uuid>;
    async fn update_appointment(
        &self,
        id: Uuid,
        appointment: &AppointmentSnapshot,
    ) -> StorageResult<()>;
    async fn soft_delete_appointment(
        &self,
        id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    async fn find_invoice(
        &self,
        invoice_number: &str,
        centre: &str,
    ) -> StorageResult<Option<StoredInvoice>>;
    async fn insert_invoice(
        &self,
        patient_id: Uuid,
        invoice: &InvoiceSnapshot,
    ) -> StorageResult<Uuid>;
    async fn update_invoice(
        &self,
        id: Uuid,
        patient_id: Uuid,
        invoice: &InvoiceSnapshot,
    ) -> StorageResult<()>;
    /// Deletes every service of the invoice, then inserts `services` in order.
    async fn replace_services(
        &self,
        invoice_id: Uuid,
        services: &[ServiceLine],
    ) -> StorageResult<()>;

    async fn insert_activity_record(&self, record: &ActivityRecord) -> StorageResult<()>;
    async fn last_activity_record(&self, run_id: Uuid) -> StorageResult<Option<ActivityRecord>>;
}
