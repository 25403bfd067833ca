//! Fixture-first portal: replays a captured result list so runs work offline.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use medsync_core::{AppointmentSnapshot, InvoiceSnapshot, PatientSnapshot};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::{
    Credentials, LaunchOptions, PatientRow, PortalConnector, PortalError, PortalSession,
    SearchCriteria,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortalFixture {
    pub fixture_id: String,
    pub captured_from_url: String,
    /// When set, `login` only accepts these credentials.
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Time the login form takes to render. Replays a slow portal.
    #[serde(default)]
    pub login_form_delay_ms: Option<u64>,
    pub pages: Vec<FixturePage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub rows: Vec<FixtureRow>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FixtureRow {
    Patient {
        patient: PatientSnapshot,
        #[serde(default)]
        appointments: Vec<AppointmentSnapshot>,
        #[serde(default)]
        invoices: Vec<InvoiceSnapshot>,
    },
    /// Third-party payer line with no editable patient detail.
    ThirdParty { label: String },
}

impl FixtureRow {
    fn matches(&self, criteria: &SearchCriteria) -> bool {
        if criteria.is_empty() {
            return true;
        }
        let FixtureRow::Patient { patient, .. } = self else {
            return false;
        };
        let field_matches = |wanted: &str, actual: Option<&str>| {
            wanted.is_empty()
                || actual.is_some_and(|a| a.to_lowercase().contains(&wanted.to_lowercase()))
        };
        let dob = patient
            .date_of_birth
            .map(|d| d.format("%d.%m.%Y").to_string());
        field_matches(criteria.first_name.as_str(), patient.first_name.as_deref())
            && field_matches(criteria.last_name.as_str(), patient.last_name.as_deref())
            && field_matches(criteria.date_of_birth.as_str(), dob.as_deref())
    }
}

pub fn load_portal_fixture(path: impl AsRef<Path>) -> Result<PortalFixture> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct FixtureConnector {
    fixture: Arc<PortalFixture>,
}

impl FixtureConnector {
    pub fn new(fixture: PortalFixture) -> Self {
        Self {
            fixture: Arc::new(fixture),
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_portal_fixture(path)?))
    }

    pub fn fixture(&self) -> &PortalFixture {
        &self.fixture
    }
}

#[async_trait]
impl PortalConnector for FixtureConnector {
    type Session = FixtureSession;

    async fn launch(&self, options: &LaunchOptions) -> Result<FixtureSession, PortalError> {
        Ok(FixtureSession {
            fixture: Arc::clone(&self.fixture),
            ready_timeout: options.ready_timeout,
            logged_in: false,
            closed: false,
            results: None,
            page: None,
            row: None,
        })
    }
}

#[derive(Debug)]
pub struct FixtureSession {
    fixture: Arc<PortalFixture>,
    ready_timeout: Duration,
    logged_in: bool,
    closed: bool,
    /// Filtered result list, present once a search ran.
    results: Option<Vec<Vec<FixtureRow>>>,
    page: Option<usize>,
    row: Option<usize>,
}

impl FixtureSession {
    /// The form counts as not ready when it renders slower than `ready_timeout`.
    async fn wait_for_login_form(&self) -> Result<(), PortalError> {
        let Some(delay) = self.fixture.login_form_delay_ms.map(Duration::from_millis) else {
            return Ok(());
        };
        if delay > self.ready_timeout {
            tokio::time::sleep(self.ready_timeout).await;
            return Err(PortalError::Navigation(format!(
                "login form not ready within {:?}",
                self.ready_timeout
            )));
        }
        tokio::time::sleep(delay).await;
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), PortalError> {
        if self.closed || !self.logged_in {
            return Err(PortalError::NotConnected);
        }
        Ok(())
    }

    fn current_rows(&self) -> Result<&[FixtureRow], PortalError> {
        self.ensure_open()?;
        let results = self
            .results
            .as_ref()
            .ok_or_else(|| PortalError::Navigation("no search results loaded".into()))?;
        let page = self
            .page
            .ok_or_else(|| PortalError::Navigation("no result page open".into()))?;
        Ok(results[page].as_slice())
    }

    fn open_patient(
        &self,
    ) -> Result<(&PatientSnapshot, &[AppointmentSnapshot], &[InvoiceSnapshot]), PortalError> {
        let rows = self.current_rows()?;
        let row = self
            .row
            .ok_or_else(|| PortalError::Navigation("no patient detail open".into()))?;
        match &rows[row] {
            FixtureRow::Patient {
                patient,
                appointments,
                invoices,
            } => Ok((patient, appointments.as_slice(), invoices.as_slice())),
            FixtureRow::ThirdParty { .. } => Err(PortalError::Navigation(
                "open row has no patient detail".into(),
            )),
        }
    }
}

#[async_trait]
impl PortalSession for FixtureSession {
    async fn login(&mut self, url: &str, credentials: &Credentials) -> Result<(), PortalError> {
        if self.closed {
            return Err(PortalError::NotConnected);
        }
        if url.trim().is_empty() {
            return Err(PortalError::Navigation("portal url is empty".into()));
        }
        self.wait_for_login_form().await?;
        let expected_user = self.fixture.username.as_deref();
        let expected_password = self.fixture.password.as_deref();
        if expected_user.is_some_and(|u| u != credentials.username)
            || expected_password.is_some_and(|p| p != credentials.password)
        {
            return Err(PortalError::Login("invalid username or password".into()));
        }
        self.logged_in = true;
        Ok(())
    }

    async fn apply_filter(&mut self, criteria: &SearchCriteria) -> Result<(), PortalError> {
        self.ensure_open()?;
        let results = self
            .fixture
            .pages
            .iter()
            .map(|page| {
                page.rows
                    .iter()
                    .filter(|row| row.matches(criteria))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .filter(|rows| !rows.is_empty())
            .collect();
        self.results = Some(results);
        self.page = None;
        self.row = None;
        Ok(())
    }

    async fn goto_result_page(&mut self, page_index: u32) -> Result<(), PortalError> {
        self.ensure_open()?;
        let pages = self
            .results
            .as_ref()
            .ok_or_else(|| PortalError::Navigation("no search results loaded".into()))?
            .len();
        if page_index == 0 || page_index as usize > pages {
            return Err(PortalError::PageUnavailable { page_index });
        }
        self.page = Some(page_index as usize - 1);
        self.row = None;
        Ok(())
    }

    async fn goto_patient_row(&mut self, row_index: u32) -> Result<PatientRow, PortalError> {
        let rows = self.current_rows()?;
        let index = row_index as usize;
        let Some(row) = rows.get(index) else {
            return Err(PortalError::RowAbsent { row_index });
        };
        let last_on_page = index + 1 == rows.len();
        if let FixtureRow::ThirdParty { .. } = row {
            return Err(PortalError::NotAPatientRow {
                row_index,
                last_on_page,
            });
        }
        self.row = Some(index);
        Ok(PatientRow {
            row_index,
            last_on_page,
        })
    }

    async fn scrape_patient(&mut self) -> Result<PatientSnapshot, PortalError> {
        let (patient, _, _) = self.open_patient()?;
        Ok(patient.clone())
    }

    async fn scrape_appointments(&mut self) -> Result<Vec<AppointmentSnapshot>, PortalError> {
        let (_, appointments, _) = self.open_patient()?;
        Ok(appointments.to_vec())
    }

    async fn scrape_invoices(
        &mut self,
        insurance_id: Option<&str>,
    ) -> Result<Vec<InvoiceSnapshot>, PortalError> {
        let (_, _, invoices) = self.open_patient()?;
        Ok(invoices
            .iter()
            .filter(|invoice| match (invoice.patient_insurance_id.as_deref(), insurance_id) {
                (Some(on_invoice), Some(wanted)) => on_invoice == wanted,
                _ => true,
            })
            .cloned()
            .collect())
    }

    async fn go_back(&mut self) -> Result<(), PortalError> {
        self.current_rows()?;
        self.row = None;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), PortalError> {
        self.closed = true;
        self.logged_in = false;
        self.results = None;
        self.page = None;
        self.row = None;
        Ok(())
    }
}
