//! Patient record model
//!
//! Standardized records arrive from the source systems already mapped to
//! a common schema. The merged ("golden") record has the same shape with
//! one value per scalar field and deduplicated sub-entity lists.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::fields::{FieldValue, PatientField};

/// Upstream patient-registration systems
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceSystem {
    Vitai,
    Vitacare,
    Smsrio,
}

impl SourceSystem {
    pub const ALL: [SourceSystem; 3] = [SourceSystem::Vitai, SourceSystem::Vitacare, SourceSystem::Smsrio];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceSystem::Vitai => "vitai",
            SourceSystem::Vitacare => "vitacare",
            SourceSystem::Smsrio => "smsrio",
        }
    }
}

impl fmt::Display for SourceSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceSystem {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        SourceSystem::ALL
            .into_iter()
            .find(|source| source.as_str() == normalized)
            .ok_or_else(|| ConfigurationError::UnknownSource(s.trim().to_string()))
    }
}

/// National health card (CNS) entry
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CnsEntry {
    pub value: String,
    #[serde(alias = "is_main", default)]
    pub is_primary: bool,
}

impl CnsEntry {
    pub fn new(value: impl Into<String>, is_primary: bool) -> Self {
        CnsEntry {
            value: value.into(),
            is_primary,
        }
    }

    /// Card number with formatting characters removed
    pub fn card_number(&self) -> String {
        self.value.chars().filter(|c| c.is_ascii_alphanumeric()).collect()
    }
}

/// Postal address. `city` is the IBGE municipality code, whose first two
/// characters are the state code.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    #[serde(rename = "use")]
    pub use_: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub line: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub postal_code: Option<String>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
}

/// Phone or e-mail contact
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Telecom {
    pub system: Option<String>,
    #[serde(rename = "use")]
    pub use_: Option<String>,
    pub value: Option<String>,
    pub rank: Option<u32>,
    pub period_start: Option<NaiveDate>,
    pub period_end: Option<NaiveDate>,
}

/// One standardized record per (source, person, ingestion event)
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StandardizedPatientRecord {
    pub patient_code: String,
    pub source: SourceSystem,
    pub name: Option<String>,
    pub social_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub mother_name: Option<String>,
    pub father_name: Option<String>,
    pub nationality: Option<String>,
    pub naturalization: Option<String>,
    pub race: Option<String>,
    pub gender: Option<String>,
    pub deceased: Option<bool>,
    pub deceased_date: Option<NaiveDate>,
    pub birth_city_cod: Option<String>,
    pub birth_state_cod: Option<String>,
    pub birth_country_cod: Option<String>,
    pub protected_person: Option<bool>,
    #[serde(default)]
    pub cns_list: Vec<CnsEntry>,
    #[serde(default)]
    pub address_list: Vec<Address>,
    #[serde(default)]
    pub telecom_list: Vec<Telecom>,
    #[serde(with = "moment")]
    pub event_moment: DateTime<Utc>,
    #[serde(with = "moment")]
    pub ingestion_moment: DateTime<Utc>,
}

impl StandardizedPatientRecord {
    /// Empty record; ingestion moment defaults to the event moment
    pub fn new(patient_code: impl Into<String>, source: SourceSystem, event_moment: DateTime<Utc>) -> Self {
        StandardizedPatientRecord {
            patient_code: patient_code.into(),
            source,
            name: None,
            social_name: None,
            birth_date: None,
            mother_name: None,
            father_name: None,
            nationality: None,
            naturalization: None,
            race: None,
            gender: None,
            deceased: None,
            deceased_date: None,
            birth_city_cod: None,
            birth_state_cod: None,
            birth_country_cod: None,
            protected_person: None,
            cns_list: Vec::new(),
            address_list: Vec::new(),
            telecom_list: Vec::new(),
            event_moment,
            ingestion_moment: event_moment,
        }
    }

    /// Value of a scalar field. List fields always return `None`.
    pub fn scalar(&self, field: PatientField) -> Option<FieldValue> {
        let text = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| FieldValue::Text(s.to_string()))
        };
        match field {
            PatientField::Name => text(&self.name),
            PatientField::SocialName => text(&self.social_name),
            PatientField::BirthDate => self.birth_date.map(FieldValue::Date),
            PatientField::MotherName => text(&self.mother_name),
            PatientField::FatherName => text(&self.father_name),
            PatientField::Nationality => text(&self.nationality),
            PatientField::Naturalization => text(&self.naturalization),
            PatientField::Race => text(&self.race),
            PatientField::Gender => text(&self.gender),
            PatientField::Deceased => self.deceased.map(FieldValue::Flag),
            PatientField::DeceasedDate => self.deceased_date.map(FieldValue::Date),
            PatientField::BirthCityCode => text(&self.birth_city_cod),
            PatientField::BirthStateCode => text(&self.birth_state_cod),
            PatientField::BirthCountryCode => text(&self.birth_country_cod),
            PatientField::ProtectedPerson => self.protected_person.map(FieldValue::Flag),
            PatientField::Cns | PatientField::Addresses | PatientField::Telecoms => None,
        }
    }
}

/// The golden record: one per person-code, replaced wholesale on every merge
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MergedPatientRecord {
    pub patient_code: String,
    pub name: Option<String>,
    pub social_name: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub mother_name: Option<String>,
    pub father_name: Option<String>,
    pub nationality: Option<String>,
    pub naturalization: Option<String>,
    pub race: Option<String>,
    pub gender: Option<String>,
    pub deceased: Option<bool>,
    pub deceased_date: Option<NaiveDate>,
    pub birth_city_cod: Option<String>,
    pub birth_state_cod: Option<String>,
    pub birth_country_cod: Option<String>,
    pub protected_person: Option<bool>,
    #[serde(default)]
    pub cns: Vec<CnsEntry>,
    #[serde(default)]
    pub addresses: Vec<Address>,
    #[serde(default)]
    pub telecoms: Vec<Telecom>,
    /// Contributing source systems, sorted
    #[serde(default)]
    pub sources: Vec<SourceSystem>,
    #[serde(default)]
    pub ranking_version: String,
    /// Primary flags carried by the source CNS entries that fed `cns`,
    /// counted before card-number deduplication.
    #[serde(skip)]
    pub cns_primary_claims: usize,
}

impl MergedPatientRecord {
    pub fn new(patient_code: impl Into<String>, ranking_version: impl Into<String>) -> Self {
        MergedPatientRecord {
            patient_code: patient_code.into(),
            name: None,
            social_name: None,
            birth_date: None,
            mother_name: None,
            father_name: None,
            nationality: None,
            naturalization: None,
            race: None,
            gender: None,
            deceased: None,
            deceased_date: None,
            birth_city_cod: None,
            birth_state_cod: None,
            birth_country_cod: None,
            protected_person: None,
            cns: Vec::new(),
            addresses: Vec::new(),
            telecoms: Vec::new(),
            sources: Vec::new(),
            ranking_version: ranking_version.into(),
            cns_primary_claims: 0,
        }
    }

    /// Store a resolved scalar value
    pub fn set_scalar(&mut self, field: PatientField, value: FieldValue) -> Result<(), ConfigurationError> {
        let mismatch = |value: &FieldValue| ConfigurationError::FieldType {
            field: field.name().to_string(),
            got: value.kind(),
        };
        match (field, value) {
            (PatientField::Name, FieldValue::Text(v)) => self.name = Some(v),
            (PatientField::SocialName, FieldValue::Text(v)) => self.social_name = Some(v),
            (PatientField::BirthDate, FieldValue::Date(v)) => self.birth_date = Some(v),
            (PatientField::MotherName, FieldValue::Text(v)) => self.mother_name = Some(v),
            (PatientField::FatherName, FieldValue::Text(v)) => self.father_name = Some(v),
            (PatientField::Nationality, FieldValue::Text(v)) => self.nationality = Some(v),
            (PatientField::Naturalization, FieldValue::Text(v)) => self.naturalization = Some(v),
            (PatientField::Race, FieldValue::Text(v)) => self.race = Some(v),
            (PatientField::Gender, FieldValue::Text(v)) => self.gender = Some(v),
            (PatientField::Deceased, FieldValue::Flag(v)) => self.deceased = Some(v),
            (PatientField::DeceasedDate, FieldValue::Date(v)) => self.deceased_date = Some(v),
            (PatientField::BirthCityCode, FieldValue::Text(v)) => self.birth_city_cod = Some(v),
            (PatientField::BirthStateCode, FieldValue::Text(v)) => self.birth_state_cod = Some(v),
            (PatientField::BirthCountryCode, FieldValue::Text(v)) => self.birth_country_cod = Some(v),
            (PatientField::ProtectedPerson, FieldValue::Flag(v)) => self.protected_person = Some(v),
            (_, other) => return Err(mismatch(&other)),
        }
        Ok(())
    }

    pub fn primary_cns(&self) -> impl Iterator<Item = &CnsEntry> {
        self.cns.iter().filter(|entry| entry.is_primary)
    }
}

/// Serde adapter for source moments.
///
/// Sources are inconsistent: RFC 3339, `YYYY-MM-DD HH:MM:SS` and bare
/// dates all occur. Naive values are taken as UTC.
pub mod moment {
    use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(moment) = DateTime::parse_from_rfc3339(raw) {
            return Some(moment.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Some(naive.and_utc());
            }
        }
        NaiveDate::parse_from_str(raw, "%Y-%m-%d")
            .ok()
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(moment: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&moment.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| D::Error::custom(format!("unrecognised moment '{}'", raw)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_system_parsing() {
        assert_eq!("VitaCare".parse::<SourceSystem>().unwrap(), SourceSystem::Vitacare);
        assert_eq!(" smsrio ".parse::<SourceSystem>().unwrap(), SourceSystem::Smsrio);
        assert!(matches!(
            "prontuario".parse::<SourceSystem>(),
            Err(ConfigurationError::UnknownSource(_))
        ));
    }

    #[test]
    fn test_moment_formats() {
        let date_only = moment::parse("2024-01-01").unwrap();
        let spaced = moment::parse("2024-01-01 00:00:00").unwrap();
        let rfc = moment::parse("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(date_only, spaced);
        assert_eq!(spaced, rfc);
        assert!(moment::parse("01/01/2024").is_none());
    }

    #[test]
    fn test_record_deserializes_with_aliases() {
        let json = r#"{
            "patient_code": "P1",
            "source": "vitai",
            "name": "Maria",
            "cns_list": [{"value": "123", "is_main": true}],
            "address_list": [{"use": "home", "city": "3304557", "state": "33"}],
            "event_moment": "2024-01-01",
            "ingestion_moment": "2024-01-02 10:00:00"
        }"#;
        let record: StandardizedPatientRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.source, SourceSystem::Vitai);
        assert!(record.cns_list[0].is_primary);
        assert_eq!(record.address_list[0].use_.as_deref(), Some("home"));
        assert!(record.telecom_list.is_empty());
        assert_eq!(record.birth_date, None);
    }

    #[test]
    fn test_blank_text_is_absent() {
        let mut record = StandardizedPatientRecord::new("P1", SourceSystem::Smsrio, Utc::now());
        record.race = Some("   ".to_string());
        record.name = Some(" Maria ".to_string());
        assert_eq!(record.scalar(PatientField::Race), None);
        assert_eq!(record.scalar(PatientField::Name), Some(FieldValue::Text("Maria".to_string())));
        assert_eq!(record.scalar(PatientField::Cns), None);
    }

    #[test]
    fn test_set_scalar_rejects_mismatched_value() {
        let mut merged = MergedPatientRecord::new("P1", "v1");
        let err = merged
            .set_scalar(PatientField::Deceased, FieldValue::Text("yes".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigurationError::FieldType { got: "text", .. }));
        merged.set_scalar(PatientField::Deceased, FieldValue::Flag(true)).unwrap();
        assert_eq!(merged.deceased, Some(true));
    }

    #[test]
    fn test_card_number_ignores_formatting() {
        assert_eq!(CnsEntry::new("700 0012-3456", false).card_number(), "70000123456");
    }
}
