//! Submission payloads
//!
//! A merged batch is written as four collections, each a flat list of rows
//! keyed by `patient_code`. Every collection is submitted in full; the
//! persistence layer upserts by person-code.

use std::fmt;

use chrono::NaiveDate;
use mrg_core::{Address, MergedPatientRecord, SourceSystem, Telecom};
use serde::Serialize;

use crate::error::Result;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Collection {
    Patient,
    Address,
    Telecom,
    Cns,
}

impl Collection {
    /// Submission order. Patients go first so sub-entities never dangle.
    pub const ALL: [Collection; 4] = [
        Collection::Patient,
        Collection::Address,
        Collection::Telecom,
        Collection::Cns,
    ];

    /// API path relative to the base URL
    pub fn path(&self) -> &'static str {
        match self {
            Collection::Patient => "mrg/patient",
            Collection::Address => "mrg/patientaddress",
            Collection::Telecom => "mrg/patienttelecom",
            Collection::Cns => "mrg/patientcns",
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PatientRow {
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
    pub sources: Vec<SourceSystem>,
    pub ranking_version: String,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AddressRow {
    pub patient_code: String,
    #[serde(flatten)]
    pub address: Address,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TelecomRow {
    pub patient_code: String,
    #[serde(flatten)]
    pub telecom: Telecom,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct CnsRow {
    pub patient_code: String,
    pub value: String,
    pub is_main: bool,
}

/// Everything one batch submits
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SubmissionBatch {
    pub patients: Vec<PatientRow>,
    pub addresses: Vec<AddressRow>,
    pub telecoms: Vec<TelecomRow>,
    pub cns: Vec<CnsRow>,
}

impl SubmissionBatch {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a MergedPatientRecord>,
    {
        let mut batch = SubmissionBatch::default();
        for record in records {
            batch.push(record);
        }
        batch
    }

    pub fn push(&mut self, record: &MergedPatientRecord) {
        let code = &record.patient_code;
        self.patients.push(PatientRow {
            patient_code: code.clone(),
            name: record.name.clone(),
            social_name: record.social_name.clone(),
            birth_date: record.birth_date,
            mother_name: record.mother_name.clone(),
            father_name: record.father_name.clone(),
            nationality: record.nationality.clone(),
            naturalization: record.naturalization.clone(),
            race: record.race.clone(),
            gender: record.gender.clone(),
            deceased: record.deceased,
            deceased_date: record.deceased_date,
            birth_city_cod: record.birth_city_cod.clone(),
            birth_state_cod: record.birth_state_cod.clone(),
            birth_country_cod: record.birth_country_cod.clone(),
            protected_person: record.protected_person,
            sources: record.sources.clone(),
            ranking_version: record.ranking_version.clone(),
        });
        self.addresses.extend(record.addresses.iter().map(|address| AddressRow {
            patient_code: code.clone(),
            address: address.clone(),
        }));
        self.telecoms.extend(record.telecoms.iter().map(|telecom| TelecomRow {
            patient_code: code.clone(),
            telecom: telecom.clone(),
        }));
        self.cns.extend(record.cns.iter().map(|entry| CnsRow {
            patient_code: code.clone(),
            value: entry.value.clone(),
            is_main: entry.is_primary,
        }));
    }

    pub fn len(&self) -> usize {
        self.patients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patients.is_empty()
    }

    /// JSON body for one collection
    pub fn body(&self, collection: Collection) -> Result<serde_json::Value> {
        let value = match collection {
            Collection::Patient => serde_json::to_value(&self.patients),
            Collection::Address => serde_json::to_value(&self.addresses),
            Collection::Telecom => serde_json::to_value(&self.telecoms),
            Collection::Cns => serde_json::to_value(&self.cns),
        };
        Ok(value.map_err(mrg_core::MergeError::from)?)
    }
}
