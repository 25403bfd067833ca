//! In-process binding of [`Repository`], used for dry runs and tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medsync_core::{
    ActivityRecord, AppointmentSnapshot, InvoiceSnapshot, NaturalKey, PatientSnapshot,
    ServiceLine, StoredAppointment, StoredInvoice, StoredPatient,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::repository::{Repository, StorageError, StorageResult};

#[derive(Debug, Default)]
struct MemoryState {
    patients: Vec<StoredPatient>,
    appointments: Vec<StoredAppointment>,
    invoices: Vec<StoredInvoice>,
    services: Vec<(Uuid, ServiceLine)>,
    activity: Vec<ActivityRecord>,
}

/// Vector-backed store. Rows keep insertion order, which stands in for `created_at`.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    state: Mutex<MemoryState>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn patients(&self) -> Vec<StoredPatient> {
        self.state.lock().await.patients.clone()
    }

    /// Every appointment of the patient, tombstoned ones included.
    pub async fn all_appointments(&self, patient_id: Uuid) -> Vec<StoredAppointment> {
        self.state
            .lock()
            .await
            .appointments
            .iter()
            .filter(|a| a.patient_id == patient_id)
            .cloned()
            .collect()
    }

    pub async fn invoices(&self) -> Vec<StoredInvoice> {
        self.state.lock().await.invoices.clone()
    }

    pub async fn services(&self, invoice_id: Uuid) -> Vec<ServiceLine> {
        self.state
            .lock()
            .await
            .services
            .iter()
            .filter(|(id, _)| *id == invoice_id)
            .map(|(_, service)| service.clone())
            .collect()
    }

    pub async fn activity(&self) -> Vec<ActivityRecord> {
        self.state.lock().await.activity.clone()
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    async fn find_patient_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> StorageResult<Option<StoredPatient>> {
        let state = self.state.lock().await;
        Ok(state
            .patients
            .iter()
            .find(|p| p.patient.natural_key() == *key)
            .cloned())
    }

    async fn insert_patient(&self, patient: &PatientSnapshot) -> StorageResult<Uuid> {
        let id = Uuid::new_v4();
        self.state.lock().await.patients.push(StoredPatient {
            id,
            patient: patient.clone(),
        });
        Ok(id)
    }

    async fn update_patient(&self, id: Uuid, patient: &PatientSnapshot) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .patients
            .iter_mut()
            .find(|p| p.id == id)
            .ok_or(StorageError::NotFound {
                entity: "patient",
                id,
            })?;
        stored.patient = patient.clone();
        Ok(())
    }

    async fn delete_patient(&self, id: Uuid) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.patients.retain(|p| p.id != id);
        state.appointments.retain(|a| a.patient_id != id);
        let orphaned = state
            .invoices
            .iter()
            .filter(|i| i.patient_id == id)
            .map(|i| i.id)
            .collect::<Vec<_>>();
        state.invoices.retain(|i| i.patient_id != id);
        state
            .services
            .retain(|(invoice_id, _)| !orphaned.contains(invoice_id));
        Ok(())
    }

    async fn list_active_appointments(
        &self,
        patient_id: Uuid,
    ) -> StorageResult<Vec<StoredAppointment>> {
        let state = self.state.lock().await;
        Ok(state
            .appointments
            .iter()
            .filter(|a| a.patient_id == patient_id && a.deleted_at.is_none())
            .cloned()
            .collect())
    }

    async fn insert_appointment(
        &self,
        patient_id: Uuid,
        appointment: &AppointmentSnapshot,
    ) -> StorageResult<Uuid> {
        let mut state = self.state.lock().await;
        if !state.patients.iter().any(|p| p.id == patient_id) {
            return Err(StorageError::NotFound {
                entity: "patient",
                id: patient_id,
            });
        }
        let id = Uuid::new_v4();
        state.appointments.push(StoredAppointment {
            id,
            patient_id,
            appointment: appointment.clone(),
            deleted_at: None,
        });
        Ok(id)
    }

    async fn update_appointment(
        &self,
        id: Uuid,
        appointment: &AppointmentSnapshot,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .appointments
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StorageError::NotFound {
                entity: "appointment",
                id,
            })?;
        stored.appointment = appointment.clone();
        Ok(())
    }

    async fn soft_delete_appointment(
        &self,
        id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        if let Some(stored) = state
            .appointments
            .iter_mut()
            .find(|a| a.id == id && a.deleted_at.is_none())
        {
            stored.deleted_at = Some(deleted_at);
        }
        Ok(())
    }

    async fn find_invoice(
        &self,
        invoice_number: &str,
        centre: &str,
    ) -> StorageResult<Option<StoredInvoice>> {
        let state = self.state.lock().await;
        Ok(state
            .invoices
            .iter()
            .find(|i| i.invoice.natural_key() == Some((invoice_number, centre)))
            .cloned())
    }

    async fn insert_invoice(
        &self,
        patient_id: Uuid,
        invoice: &InvoiceSnapshot,
    ) -> StorageResult<Uuid> {
        let mut state = self.state.lock().await;
        if !state.patients.iter().any(|p| p.id == patient_id) {
            return Err(StorageError::NotFound {
                entity: "patient",
                id: patient_id,
            });
        }
        let id = Uuid::new_v4();
        state.invoices.push(StoredInvoice {
            id,
            patient_id,
            invoice: InvoiceSnapshot {
                services: Vec::new(),
                ..invoice.clone()
            },
        });
        Ok(id)
    }

    async fn update_invoice(
        &self,
        id: Uuid,
        patient_id: Uuid,
        invoice: &InvoiceSnapshot,
    ) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        let stored = state
            .invoices
            .iter_mut()
            .find(|i| i.id == id)
            .ok_or(StorageError::NotFound {
                entity: "invoice",
                id,
            })?;
        stored.patient_id = patient_id;
        stored.invoice = InvoiceSnapshot {
            services: Vec::new(),
            ..invoice.clone()
        };
        Ok(())
    }

    async fn replace_services(
        &self,
        invoice_id: Uuid,
        services: &[ServiceLine],
    ) -> StorageResult<()> {
        let mut state = self.state.lock().await;
        state.services.retain(|(id, _)| *id != invoice_id);
        state
            .services
            .extend(services.iter().cloned().map(|s| (invoice_id, s)));
        Ok(())
    }

    async fn insert_activity_record(&self, record: &ActivityRecord) -> StorageResult<()> {
        self.state.lock().await.activity.push(record.clone());
        Ok(())
    }

    async fn last_activity_record(&self, run_id: Uuid) -> StorageResult<Option<ActivityRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .activity
            .iter()
            .rev()
            .find(|r| r.run_id == run_id)
            .cloned())
    }
}
