//! Post-merge sanity validation
//!
//! Corrects invariant violations in a merged record instead of rejecting
//! it. Validation is idempotent and never fails; every correction is
//! logged and counted in a [`SanityReport`].

use log::{debug, warn};

use crate::model::MergedPatientRecord;
use crate::resolver::append_merge;

/// Legacy country code some sources still emit for Brazil
pub const LEGACY_COUNTRY_CODE: &str = "1";
/// Canonical country code for Brazil
pub const CANONICAL_COUNTRY_CODE: &str = "010";

/// Corrections applied by one validation pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SanityReport {
    pub duplicate_cns_dropped: usize,
    pub primaries_demoted: usize,
    pub deceased_corrected: bool,
    pub state_codes_corrected: usize,
    pub country_codes_rewritten: usize,
    /// Birth state and country codes on the record itself
    pub birth_codes_corrected: usize,
}

impl SanityReport {
    pub fn is_clean(&self) -> bool {
        *self == SanityReport::default()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SanityValidator;

impl SanityValidator {
    pub fn new() -> Self {
        SanityValidator
    }

    pub fn validate(&self, record: MergedPatientRecord) -> MergedPatientRecord {
        self.validate_with_report(record).0
    }

    pub fn validate_with_report(&self, mut record: MergedPatientRecord) -> (MergedPatientRecord, SanityReport) {
        let mut report = SanityReport::default();

        self.check_cns(&mut record, &mut report);
        self.check_deceased(&mut record, &mut report);
        for address in record.addresses.iter_mut() {
            let (state, country) = correct_location(address.city.as_deref(), &mut address.state, &mut address.country);
            report.state_codes_corrected += usize::from(state);
            report.country_codes_rewritten += usize::from(country);
        }
        let (state, country) = correct_location(
            record.birth_city_cod.as_deref(),
            &mut record.birth_state_cod,
            &mut record.birth_country_cod,
        );
        report.birth_codes_corrected = usize::from(state) + usize::from(country);

        if !report.is_clean() {
            debug!("Sanity corrections for {}: {:?}", record.patient_code, report);
        }
        (record, report)
    }

    /// Duplicate cards keep their first occurrence. When more than one
    /// primary claim exists the ambiguity is resolved by demoting every
    /// primary entry.
    fn check_cns(&self, record: &mut MergedPatientRecord, report: &mut SanityReport) {
        let claims = record.cns_primary_claims.max(record.primary_cns().count());

        let before = record.cns.len();
        record.cns = append_merge(std::mem::take(&mut record.cns));
        report.duplicate_cns_dropped = before - record.cns.len();

        if claims > 1 {
            for entry in record.cns.iter_mut().filter(|entry| entry.is_primary) {
                entry.is_primary = false;
                report.primaries_demoted += 1;
            }
            warn!(
                "Patient {} had {} primary CNS claims; all demoted",
                record.patient_code, claims
            );
        }
        record.cns_primary_claims = record.primary_cns().count();
    }

    fn check_deceased(&self, record: &mut MergedPatientRecord, report: &mut SanityReport) {
        if record.deceased_date.is_some() && record.deceased != Some(true) {
            record.deceased = Some(true);
            report.deceased_corrected = true;
        }
    }
}

/// The city code is authoritative for the state code, and the legacy
/// country code is rewritten. Returns which of the two changed.
fn correct_location(city: Option<&str>, state: &mut Option<String>, country: &mut Option<String>) -> (bool, bool) {
    let mut state_corrected = false;
    if let Some(state_from_city) = city.and_then(city_state_prefix) {
        if state.as_deref() != Some(state_from_city) {
            *state = Some(state_from_city.to_string());
            state_corrected = true;
        }
    }

    let country_rewritten = country.as_deref() == Some(LEGACY_COUNTRY_CODE);
    if country_rewritten {
        *country = Some(CANONICAL_COUNTRY_CODE.to_string());
    }
    (state_corrected, country_rewritten)
}

fn city_state_prefix(city: &str) -> Option<&str> {
    let city = city.trim();
    if city.chars().count() < 2 {
        return None;
    }
    city.get(..2)
}
