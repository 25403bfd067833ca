//! Patient extraction from exported portal documents (secondary import path).

use chrono::NaiveDate;
use medsync_core::PatientSnapshot;

use crate::PortalError;

pub trait DocumentExtractor: Send + Sync {
    fn extract(&self, bytes: &[u8]) -> Result<Vec<PatientSnapshot>, PortalError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Title,
    CourtesyTitle,
    AddressComplement,
    Street,
    PostalCode,
    Locality,
    Phone1,
    Phone2,
    Phone3,
    DateOfBirth,
    PatientNumber,
    Employer,
    InsuranceId,
    MaidenName,
    Nationality,
    Profession,
    FullName,
    FirstName,
    LastName,
    Debtor,
    Contact,
    Sex,
    MaritalStatus,
    Language,
    Email,
    Comment,
    /// Recognised label whose value is not kept.
    Ignored,
}

/// Labels as printed by the portal export.
const LABELS: &[(&str, Target)] = &[
    ("Titre", Target::Title),
    ("Titre courrier", Target::CourtesyTitle),
    ("Compl. adresse", Target::AddressComplement),
    ("Rue", Target::Street),
    ("NPA", Target::PostalCode),
    ("Localité", Target::Locality),
    ("Tél. 1", Target::Ignored),
    ("Tél. 2", Target::Ignored),
    ("Tél. 3", Target::Ignored),
    ("No Tél. 1", Target::Phone1),
    ("No Tél. 2", Target::Phone2),
    ("No Tél. 3", Target::Phone3),
    ("Né(e) le", Target::DateOfBirth),
    ("N° Patient", Target::PatientNumber),
    ("N°patient pour tri", Target::Ignored),
    ("Employeur", Target::Employer),
    ("N° AVS", Target::InsuranceId),
    ("Nom jeune fille", Target::MaidenName),
    ("Nationalite", Target::Nationality),
    ("Profession", Target::Profession),
    ("Patient", Target::FullName),
    ("Nom", Target::LastName),
    ("Prénom", Target::FirstName),
    ("Déb.", Target::Debtor),
    ("Ctct", Target::Contact),
    ("H/F", Target::Sex),
    ("Etat civil", Target::MaritalStatus),
    ("Langue", Target::Language),
    ("E-mail", Target::Email),
    ("Info", Target::Comment),
    ("Dernière séance", Target::Ignored),
    ("Envoyé par", Target::Ignored),
];

/// Reads text exports: one patient per form-feed separated page, one `<label> <value>`
/// per line. The longest label matching a line wins, so `Titre courrier` is never read
/// as `Titre`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LabelledTextExtractor;

impl LabelledTextExtractor {
    pub fn parse_page(text: &str) -> Option<PatientSnapshot> {
        let mut patient = PatientSnapshot::default();
        let mut recognised = false;

        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let Some((target, value)) = match_label(line) else {
                continue;
            };
            recognised = true;
            if let Some(value) = value {
                apply(&mut patient, target, value);
            }
        }

        recognised.then_some(patient)
    }
}

impl DocumentExtractor for LabelledTextExtractor {
    fn extract(&self, bytes: &[u8]) -> Result<Vec<PatientSnapshot>, PortalError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|err| PortalError::Extraction(format!("export is not UTF-8: {err}")))?;
        Ok(text.split('\x0c').filter_map(Self::parse_page).collect())
    }
}

fn match_label(line: &str) -> Option<(Target, Option<String>)> {
    LABELS
        .iter()
        .filter(|(label, _)| {
            line.strip_prefix(label).is_some_and(|rest| {
                rest.is_empty() || rest.starts_with(char::is_whitespace) || rest.starts_with(':')
            })
        })
        .max_by_key(|(label, _)| label.len())
        .map(|(label, target)| {
            let value = line[label.len()..]
                .trim_start_matches(':')
                .trim()
                .to_string();
            (*target, (!value.is_empty()).then_some(value))
        })
}

fn parse_export_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value, "%d.%m.%Y")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .ok()
}

fn apply(patient: &mut PatientSnapshot, target: Target, value: String) {
    match target {
        Target::Title => patient.title = Some(value),
        Target::CourtesyTitle => patient.courtesy_title = Some(value),
        Target::AddressComplement => patient.address_complement = Some(value),
        Target::Street => patient.street = Some(value),
        Target::PostalCode => patient.postal_code = Some(value),
        Target::Locality => patient.locality = Some(value),
        Target::Phone1 => patient.phone_1 = Some(value),
        Target::Phone2 => patient.phone_2 = Some(value),
        Target::Phone3 => patient.phone_3 = Some(value),
        Target::DateOfBirth => patient.date_of_birth = parse_export_date(&value),
        Target::PatientNumber => patient.patient_number = Some(value),
        Target::Employer => patient.employer = Some(value),
        Target::InsuranceId => patient.insurance_id = Some(value),
        Target::MaidenName => patient.maiden_name = Some(value),
        Target::Nationality => patient.nationality = Some(value),
        Target::Profession => patient.profession = Some(value),
        Target::FullName => {
            // Export prints "LASTNAME Firstname"; explicit Nom/Prénom lines take precedence.
            let (last, first) = match value.split_once(char::is_whitespace) {
                Some((last, first)) => (last.to_string(), Some(first.trim().to_string())),
                None => (value, None),
            };
            patient.last_name.get_or_insert(last);
            if let Some(first) = first {
                patient.first_name.get_or_insert(first);
            }
        }
        Target::FirstName => patient.first_name = Some(value),
        Target::LastName => patient.last_name = Some(value),
        Target::Debtor => patient.debtor = Some(value),
        Target::Contact => patient.contact = Some(value),
        Target::Sex => patient.sex = Some(value),
        Target::MaritalStatus => patient.marital_status = Some(value),
        Target::Language => patient.language = Some(value),
        Target::Email => patient.email = Some(value),
        Target::Comment => patient.comment = Some(value),
        Target::Ignored => {}
    }
}
