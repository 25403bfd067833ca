//! PostgreSQL binding of [`Repository`] over a `sqlx` pool.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use medsync_core::{
    ActivityRecord, AppointmentSnapshot, CheckpointPosition, InvoiceSnapshot, NaturalKey,
    PatientSnapshot, ServiceLine, StoredAppointment, StoredInvoice, StoredPatient, SyncAction,
};
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row};
use tracing::info;
use uuid::Uuid;

use crate::repository::{Repository, StorageError, StorageResult};

const PATIENT_COLUMNS: &[&str] = &[
    "patient_number",
    "insurance_id",
    "title",
    "courtesy_title",
    "first_name",
    "last_name",
    "maiden_name",
    "address_complement",
    "street",
    "postal_code",
    "locality",
    "country",
    "phone_1",
    "phone_2",
    "phone_3",
    "email",
    "date_of_birth",
    "date_of_death",
    "sex",
    "gender",
    "language",
    "nationality",
    "marital_status",
    "profession",
    "employer",
    "attending_doctor",
    "debtor",
    "contact",
    "legal_representative",
    "sms_notification",
    "comment",
];

const APPOINTMENT_COLUMNS: &[&str] = &[
    "starts_at",
    "status",
    "duration_minutes",
    "event_name",
    "contact",
    "centre",
    "practitioner",
];

const INVOICE_COLUMNS: &[&str] = &[
    "invoice_number",
    "centre",
    "invoice_date",
    "patient_insurance_id",
    "insured_person_number",
    "insured_card_number",
    "reimbursement_type",
    "law",
    "treatment_type",
    "treatment_start",
    "treatment_end",
    "service_location",
    "prescribing_doctor",
    "prescribing_doctor_address",
    "case_date",
    "decision_number",
    "total_amount",
];

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

/// `INSERT INTO table (id, <lead>, <columns>) VALUES ($1, ...)`.
fn insert_sql(table: &str, lead: &[&str], columns: &[&str]) -> String {
    let names = std::iter::once("id")
        .chain(lead.iter().copied())
        .chain(columns.iter().copied())
        .collect::<Vec<_>>();
    let params = (1..=names.len())
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>();
    format!(
        "INSERT INTO {table} ({}) VALUES ({})",
        names.join(", "),
        params.join(", ")
    )
}

/// `UPDATE table SET <lead>, <columns>, updated_at = NOW() WHERE id = $1`.
fn update_sql(table: &str, lead: &[&str], columns: &[&str]) -> String {
    let assignments = lead
        .iter()
        .chain(columns.iter())
        .enumerate()
        .map(|(i, name)| format!("{name} = ${}", i + 2))
        .collect::<Vec<_>>();
    format!(
        "UPDATE {table} SET {}, updated_at = NOW() WHERE id = $1",
        assignments.join(", ")
    )
}

fn select_sql(table: &str, lead: &[&str], columns: &[&str]) -> String {
    let names = std::iter::once("id")
        .chain(lead.iter().copied())
        .chain(columns.iter().copied())
        .collect::<Vec<_>>();
    format!("SELECT {} FROM {table}", names.join(", "))
}

fn bind_patient<'q>(query: PgQuery<'q>, p: &'q PatientSnapshot) -> PgQuery<'q> {
    query
        .bind(p.patient_number.as_deref())
        .bind(p.insurance_id.as_deref())
        .bind(p.title.as_deref())
        .bind(p.courtesy_title.as_deref())
        .bind(p.first_name.as_deref())
        .bind(p.last_name.as_deref())
        .bind(p.maiden_name.as_deref())
        .bind(p.address_complement.as_deref())
        .bind(p.street.as_deref())
        .bind(p.postal_code.as_deref())
        .bind(p.locality.as_deref())
        .bind(p.country.as_deref())
        .bind(p.phone_1.as_deref())
        .bind(p.phone_2.as_deref())
        .bind(p.phone_3.as_deref())
        .bind(p.email.as_deref())
        .bind(p.date_of_birth)
        .bind(p.date_of_death)
        .bind(p.sex.as_deref())
        .bind(p.gender.as_deref())
        .bind(p.language.as_deref())
        .bind(p.nationality.as_deref())
        .bind(p.marital_status.as_deref())
        .bind(p.profession.as_deref())
        .bind(p.employer.as_deref())
        .bind(p.attending_doctor.as_deref())
        .bind(p.debtor.as_deref())
        .bind(p.contact.as_deref())
        .bind(p.legal_representative.as_deref())
        .bind(p.sms_notification.as_deref())
        .bind(p.comment.as_deref())
}

fn patient_from_row(row: &PgRow) -> Result<StoredPatient, sqlx::Error> {
    Ok(StoredPatient {
        id: row.try_get("id")?,
        patient: PatientSnapshot {
            patient_number: row.try_get("patient_number")?,
            insurance_id: row.try_get("insurance_id")?,
            title: row.try_get("title")?,
            courtesy_title: row.try_get("courtesy_title")?,
            first_name: row.try_get("first_name")?,
            last_name: row.try_get("last_name")?,
            maiden_name: row.try_get("maiden_name")?,
            address_complement: row.try_get("address_complement")?,
            street: row.try_get("street")?,
            postal_code: row.try_get("postal_code")?,
            locality: row.try_get("locality")?,
            country: row.try_get("country")?,
            phone_1: row.try_get("phone_1")?,
            phone_2: row.try_get("phone_2")?,
            phone_3: row.try_get("phone_3")?,
            email: row.try_get("email")?,
            date_of_birth: row.try_get("date_of_birth")?,
            date_of_death: row.try_get("date_of_death")?,
            sex: row.try_get("sex")?,
            gender: row.try_get("gender")?,
            language: row.try_get("language")?,
            nationality: row.try_get("nationality")?,
            marital_status: row.try_get("marital_status")?,
            profession: row.try_get("profession")?,
            employer: row.try_get("employer")?,
            attending_doctor: row.try_get("attending_doctor")?,
            debtor: row.try_get("debtor")?,
            contact: row.try_get("contact")?,
            legal_representative: row.try_get("legal_representative")?,
            sms_notification: row.try_get("sms_notification")?,
            comment: row.try_get("comment")?,
        },
    })
}

fn bind_appointment<'q>(query: PgQuery<'q>, a: &'q AppointmentSnapshot) -> PgQuery<'q> {
    query
        .bind(a.starts_at)
        .bind(a.status.as_deref())
        .bind(a.duration_minutes)
        .bind(a.event_name.as_deref())
        .bind(a.contact.as_deref())
        .bind(a.centre.as_deref())
        .bind(a.practitioner.as_deref())
}

fn appointment_from_row(row: &PgRow) -> Result<StoredAppointment, sqlx::Error> {
    Ok(StoredAppointment {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        appointment: AppointmentSnapshot {
            starts_at: row.try_get("starts_at")?,
            status: row.try_get("status")?,
            duration_minutes: row.try_get("duration_minutes")?,
            event_name: row.try_get("event_name")?,
            contact: row.try_get("contact")?,
            centre: row.try_get("centre")?,
            practitioner: row.try_get("practitioner")?,
        },
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn bind_invoice<'q>(query: PgQuery<'q>, i: &'q InvoiceSnapshot) -> PgQuery<'q> {
    query
        .bind(i.invoice_number.as_deref())
        .bind(i.centre.as_deref())
        .bind(i.date)
        .bind(i.patient_insurance_id.as_deref())
        .bind(i.insured_person_number.as_deref())
        .bind(i.insured_card_number.as_deref())
        .bind(i.reimbursement_type.as_deref())
        .bind(i.law.as_deref())
        .bind(i.treatment_type.as_deref())
        .bind(i.treatment_start)
        .bind(i.treatment_end)
        .bind(i.service_location.as_deref())
        .bind(i.prescribing_doctor.as_deref())
        .bind(i.prescribing_doctor_address.as_deref())
        .bind(i.case_date)
        .bind(i.decision_number.as_deref())
        .bind(i.total_amount)
}

fn invoice_from_row(row: &PgRow) -> Result<StoredInvoice, sqlx::Error> {
    Ok(StoredInvoice {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        invoice: InvoiceSnapshot {
            invoice_number: row.try_get("invoice_number")?,
            centre: row.try_get("centre")?,
            date: row.try_get("invoice_date")?,
            patient_insurance_id: row.try_get("patient_insurance_id")?,
            insured_person_number: row.try_get("insured_person_number")?,
            insured_card_number: row.try_get("insured_card_number")?,
            reimbursement_type: row.try_get("reimbursement_type")?,
            law: row.try_get("law")?,
            treatment_type: row.try_get("treatment_type")?,
            treatment_start: row.try_get("treatment_start")?,
            treatment_end: row.try_get("treatment_end")?,
            service_location: row.try_get("service_location")?,
            prescribing_doctor: row.try_get("prescribing_doctor")?,
            prescribing_doctor_address: row.try_get("prescribing_doctor_address")?,
            case_date: row.try_get("case_date")?,
            decision_number: row.try_get("decision_number")?,
            total_amount: row.try_get("total_amount")?,
            services: Vec::new(),
        },
    })
}

fn to_db_index(value: u32) -> StorageResult<i32> {
    i32::try_from(value).map_err(|_| StorageError::CorruptRow {
        table: "scraper_activity",
        message: format!("index {value} exceeds INTEGER range"),
    })
}

fn from_db_index(value: i32) -> StorageResult<u32> {
    u32::try_from(value).map_err(|_| StorageError::CorruptRow {
        table: "scraper_activity",
        message: format!("negative index {value}"),
    })
}

#[derive(Debug, Clone)]
pub struct PgRepository {
    pool: PgPool,
}

impl PgRepository {
    pub async fn connect(database_url: &str) -> StorageResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(2)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl Repository for PgRepository {
    async fn find_patient_by_natural_key(
        &self,
        key: &NaturalKey,
    ) -> StorageResult<Option<StoredPatient>> {
        let sql = format!(
            "{} WHERE first_name IS NOT DISTINCT FROM $1 \
               AND last_name IS NOT DISTINCT FROM $2 \
               AND date_of_birth IS NOT DISTINCT FROM $3 \
               AND insurance_id IS NOT DISTINCT FROM $4 \
             ORDER BY created_at ASC LIMIT 1",
            select_sql("patients", &[], PATIENT_COLUMNS)
        );
        let row = sqlx::query(&sql)
            .bind(key.first_name.as_deref())
            .bind(key.last_name.as_deref())
            .bind(key.date_of_birth)
            .bind(key.insurance_id.as_deref())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(patient_from_row).transpose()?)
    }

    async fn insert_patient(&self, patient: &PatientSnapshot) -> StorageResult<Uuid> {
        let id = Uuid::new_v4();
        let sql = insert_sql("patients", &[], PATIENT_COLUMNS);
        bind_patient(sqlx::query(&sql).bind(id), patient)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn update_patient(&self, id: Uuid, patient: &PatientSnapshot) -> StorageResult<()> {
        let sql = update_sql("patients", &[], PATIENT_COLUMNS);
        let result = bind_patient(sqlx::query(&sql).bind(id), patient)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "patient",
                id,
            });
        }
        Ok(())
    }

    async fn delete_patient(&self, id: Uuid) -> StorageResult<()> {
        sqlx::query("DELETE FROM patients WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_active_appointments(
        &self,
        patient_id: Uuid,
    ) -> StorageResult<Vec<StoredAppointment>> {
        let sql = format!(
            "{} WHERE patient_id = $1 AND deleted_at IS NULL ORDER BY created_at ASC, starts_at ASC",
            select_sql("appointments", &["patient_id", "deleted_at"], APPOINTMENT_COLUMNS)
        );
        let rows = sqlx::query(&sql)
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(appointment_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn insert_appointment(
        &self,
        patient_id: Uuid,
        appointment: &AppointmentSnapshot,
    ) -> StorageResult<Uuid> {
        let id = Uuid::new_v4();
        let sql = insert_sql("appointments", &["patient_id"], APPOINTMENT_COLUMNS);
        bind_appointment(sqlx::query(&sql).bind(id).bind(patient_id), appointment)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn update_appointment(
        &self,
        id: Uuid,
        appointment: &AppointmentSnapshot,
    ) -> StorageResult<()> {
        let sql = update_sql("appointments", &[], APPOINTMENT_COLUMNS);
        let result = bind_appointment(sqlx::query(&sql).bind(id), appointment)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "appointment",
                id,
            });
        }
        Ok(())
    }

    async fn soft_delete_appointment(
        &self,
        id: Uuid,
        deleted_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        sqlx::query(
            r#"
            UPDATE appointments
               SET deleted_at = $2,
                   updated_at = NOW()
             WHERE id = $1
               AND deleted_at IS NULL
            "#,
        )
        .bind(id)
        .bind(deleted_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_invoice(
        &self,
        invoice_number: &str,
        centre: &str,
    ) -> StorageResult<Option<StoredInvoice>> {
        let sql = format!(
            "{} WHERE invoice_number = $1 AND centre = $2 ORDER BY created_at ASC LIMIT 1",
            select_sql("invoices", &["patient_id"], INVOICE_COLUMNS)
        );
        let row = sqlx::query(&sql)
            .bind(invoice_number)
            .bind(centre)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(invoice_from_row).transpose()?)
    }

    async fn insert_invoice(
        &self,
        patient_id: Uuid,
        invoice: &InvoiceSnapshot,
    ) -> StorageResult<Uuid> {
        let id = Uuid::new_v4();
        let sql = insert_sql("invoices", &["patient_id"], INVOICE_COLUMNS);
        bind_invoice(sqlx::query(&sql).bind(id).bind(patient_id), invoice)
            .execute(&self.pool)
            .await?;
        Ok(id)
    }

    async fn update_invoice(
        &self,
        id: Uuid,
        patient_id: Uuid,
        invoice: &InvoiceSnapshot,
    ) -> StorageResult<()> {
        let sql = update_sql("invoices", &["patient_id"], INVOICE_COLUMNS);
        let result = bind_invoice(sqlx::query(&sql).bind(id).bind(patient_id), invoice)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound {
                entity: "invoice",
                id,
            });
        }
        Ok(())
    }

    async fn replace_services(
        &self,
        invoice_id: Uuid,
        services: &[ServiceLine],
    ) -> StorageResult<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM services WHERE invoice_id = $1")
            .bind(invoice_id)
            .execute(&mut *tx)
            .await?;
        for (line_no, service) in services.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO services (
                    invoice_id, line_no, service_date, quantity, position_code,
                    description, unit_value, points, point_value, amount
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(invoice_id)
            .bind(line_no as i32)
            .bind(service.date)
            .bind(service.quantity)
            .bind(service.position_code.as_deref())
            .bind(service.description.as_deref())
            .bind(service.unit_value)
            .bind(service.points)
            .bind(service.point_value)
            .bind(service.amount)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn insert_activity_record(&self, record: &ActivityRecord) -> StorageResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scraper_activity (
                run_id, patient_id, page_index, patient_index, action_type, recorded_at
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(record.run_id)
        .bind(record.patient_id)
        .bind(to_db_index(record.position.page_index)?)
        .bind(to_db_index(record.position.patient_index)?)
        .bind(record.action.as_str())
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_activity_record(&self, run_id: Uuid) -> StorageResult<Option<ActivityRecord>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, patient_id, page_index, patient_index, action_type, recorded_at
              FROM scraper_activity
             WHERE run_id = $1
             ORDER BY recorded_at DESC, id DESC
             LIMIT 1
            "#,
        )
        .bind(run_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let action: String = row.try_get("action_type")?;
        let action = SyncAction::parse(&action).ok_or_else(|| StorageError::CorruptRow {
            table: "scraper_activity",
            message: format!("unknown action_type {action:?}"),
        })?;
        Ok(Some(ActivityRecord {
            run_id: row.try_get("run_id")?,
            patient_id: row.try_get("patient_id")?,
            position: CheckpointPosition::new(
                from_db_index(row.try_get("page_index")?)?,
                from_db_index(row.try_get("patient_index")?)?,
            ),
            action,
            recorded_at: row.try_get("recorded_at")?,
        }))
    }
}
