//! Portal automation contracts, the fixture-backed portal and exported-document extraction.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use medsync_core::{AppointmentSnapshot, InvoiceSnapshot, PatientSnapshot};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod documents;
pub mod fixture;

pub use documents::{DocumentExtractor, LabelledTextExtractor};
pub use fixture::{load_portal_fixture, FixtureConnector, FixtureSession, PortalFixture};

pub const CRATE_NAME: &str = "medsync-portal";

#[derive(Debug, Error)]
pub enum PortalError {
    #[error("portal credentials are missing")]
    MissingCredentials,
    #[error("portal login failed: {0}")]
    Login(String),
    #[error("portal session is not connected")]
    NotConnected,
    #[error("row {row_index} is not a patient row")]
    NotAPatientRow { row_index: u32, last_on_page: bool },
    #[error("no row at index {row_index}")]
    RowAbsent { row_index: u32 },
    #[error("result page {page_index} is unavailable")]
    PageUnavailable { page_index: u32 },
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("portal step `{step}` timed out after {after:?}")]
    Timeout { step: &'static str, after: Duration },
    #[error("document extraction failed: {0}")]
    Extraction(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl PortalError {
    /// Session-level errors that keep their meaning when they surface from `connect`.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            PortalError::MissingCredentials | PortalError::Login(_) | PortalError::NotConnected
        )
    }
}

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.username.is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaunchOptions {
    pub headless: bool,
    /// Upper bound for a single automation step.
    pub default_timeout: Duration,
    /// Upper bound for one UI readiness check, such as waiting for the login form to
    /// render. A check that outlasts it fails the step instead of waiting for
    /// `default_timeout`.
    pub ready_timeout: Duration,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            headless: true,
            default_timeout: Duration::from_secs(60),
            ready_timeout: Duration::from_secs(5),
        }
    }
}

/// Patient search filter. All-empty criteria list every patient.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCriteria {
    pub first_name: String,
    pub last_name: String,
    pub date_of_birth: String,
}

impl SearchCriteria {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_empty() && self.last_name.is_empty() && self.date_of_birth.is_empty()
    }
}

/// A patient row that was opened successfully.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatientRow {
    pub row_index: u32,
    pub last_on_page: bool,
}

/// Acquires exclusive automation sessions (one browser context per session).
#[async_trait]
pub trait PortalConnector: Send + Sync {
    type Session: PortalSession;

    async fn launch(&self, options: &LaunchOptions) -> Result<Self::Session, PortalError>;
}

/// One stateful UI context. Calls must be made sequentially.
#[async_trait]
pub trait PortalSession: Send {
    async fn login(&mut self, url: &str, credentials: &Credentials) -> Result<(), PortalError>;

    async fn apply_filter(&mut self, criteria: &SearchCriteria) -> Result<(), PortalError>;

    /// `page_index` is 1-based. Fails with `PageUnavailable` past the last page.
    async fn goto_result_page(&mut self, page_index: u32) -> Result<(), PortalError>;

    /// Opens the patient detail for a row of the current page.
    /// Fails with `NotAPatientRow` or `RowAbsent` as control signals.
    async fn goto_patient_row(&mut self, row_index: u32) -> Result<PatientRow, PortalError>;

    async fn scrape_patient(&mut self) -> Result<PatientSnapshot, PortalError>;

    async fn scrape_appointments(&mut self) -> Result<Vec<AppointmentSnapshot>, PortalError>;

    async fn scrape_invoices(
        &mut self,
        insurance_id: Option<&str>,
    ) -> Result<Vec<InvoiceSnapshot>, PortalError>;

    /// Returns from the patient detail to the result list.
    async fn go_back(&mut self) -> Result<(), PortalError>;

    /// Releases the underlying automation resource.
    async fn close(&mut self) -> Result<(), PortalError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_need_both_fields() {
        assert!(!Credentials::new("", "secret").is_complete());
        assert!(!Credentials::new("clinic", "").is_complete());
        assert!(Credentials::new("clinic", "secret").is_complete());
    }

    #[test]
    fn debug_output_hides_password() {
        let rendered = format!("{:?}", Credentials::new("clinic", "hunter2"));
        assert!(rendered.contains("clinic"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn only_session_errors_are_domain_errors() {
        assert!(PortalError::MissingCredentials.is_domain());
        assert!(PortalError::Login("bad password".into()).is_domain());
        assert!(!PortalError::Navigation("click failed".into()).is_domain());
        assert!(!PortalError::RowAbsent { row_index: 3 }.is_domain());
    }
}
