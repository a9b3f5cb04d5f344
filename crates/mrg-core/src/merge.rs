//! Merge engine
//!
//! Turns a [`MergeGroup`] into a golden record. Each field is resolved in
//! a single pass against the strategy table: fields whose sources agree
//! are taken as-is, conflicting fields go through their registered
//! strategy. The draft is then passed through the [`SanityValidator`].
//!
//! The engine is pure: the same group, policy and registry always yield
//! the same record.

use crate::error::Result;
use crate::fields::{FieldRegistry, MergeStrategy, PatientField};
use crate::grouping::MergeGroup;
use crate::model::{CnsEntry, MergedPatientRecord, StandardizedPatientRecord};
use crate::ranking::RankingPolicy;
use crate::resolver::{append_merge, Candidate, FieldResolver, MergeKey, Resolution};
use crate::sanity::{SanityReport, SanityValidator};

/// A merged record plus what it took to produce it
#[derive(Clone, Debug, PartialEq)]
pub struct MergeOutcome {
    pub record: MergedPatientRecord,
    /// Fields whose sources disagreed
    pub conflicting_fields: Vec<PatientField>,
    pub sanity: SanityReport,
}

pub struct MergeEngine<'a> {
    policy: &'a RankingPolicy,
    registry: &'a FieldRegistry,
    validator: SanityValidator,
}

impl<'a> MergeEngine<'a> {
    pub fn new(policy: &'a RankingPolicy, registry: &'a FieldRegistry) -> Self {
        MergeEngine {
            policy,
            registry,
            validator: SanityValidator::new(),
        }
    }

    /// Merge and validate one group
    pub fn merge(&self, group: &MergeGroup) -> Result<MergedPatientRecord> {
        Ok(self.merge_with_report(group)?.record)
    }

    pub fn merge_with_report(&self, group: &MergeGroup) -> Result<MergeOutcome> {
        let (draft, conflicting_fields) = self.draft(group)?;
        let (record, sanity) = self.validator.validate_with_report(draft);
        Ok(MergeOutcome {
            record,
            conflicting_fields,
            sanity,
        })
    }

    /// Merge every group, stopping at the first configuration error
    pub fn merge_all<'g, I>(&self, groups: I) -> Result<Vec<MergeOutcome>>
    where
        I: IntoIterator<Item = &'g MergeGroup>,
    {
        groups.into_iter().map(|group| self.merge_with_report(group)).collect()
    }

    /// Unvalidated draft record and the list of conflicting fields
    pub fn draft(&self, group: &MergeGroup) -> Result<(MergedPatientRecord, Vec<PatientField>)> {
        let resolver = FieldResolver::new(self.policy, self.registry);
        let mut record = MergedPatientRecord::new(group.patient_code(), self.policy.version());
        record.sources = group.sources();
        let mut conflicting = Vec::new();

        for field in PatientField::SCALARS {
            let candidates: Vec<_> = group
                .records()
                .iter()
                .map(|r| Candidate::new(r.scalar(field), r.source, r.event_moment))
                .collect();
            let resolution = resolver.resolve_scalar(field, &candidates)?;
            if resolution.was_conflicting() {
                conflicting.push(field);
            }
            if let Some(value) = resolution.into_value() {
                record.set_scalar(field, value)?;
            }
        }

        let cns = resolve_list(&resolver, group, PatientField::Cns, |r| &r.cns_list, &mut conflicting)?;
        record.cns_primary_claims = match self.registry.strategy(PatientField::Cns) {
            // only the winning list feeds the result
            Some(MergeStrategy::Replace) => primary_claims(&cns),
            _ => group.records().iter().map(|r| primary_claims(&r.cns_list)).sum(),
        };
        record.cns = cns;
        record.addresses =
            resolve_list(&resolver, group, PatientField::Addresses, |r| &r.address_list, &mut conflicting)?;
        record.telecoms =
            resolve_list(&resolver, group, PatientField::Telecoms, |r| &r.telecom_list, &mut conflicting)?;

        if !conflicting.is_empty() {
            log::debug!(
                "Patient {} merged from {} sources with conflicts in {:?}",
                group.patient_code(),
                group.len(),
                conflicting
            );
        }
        Ok((record, conflicting))
    }
}

/// Primary claims one source list makes, counting each card once
fn primary_claims(list: &[CnsEntry]) -> usize {
    append_merge(list.iter().cloned())
        .iter()
        .filter(|entry| entry.is_primary)
        .count()
}

fn resolve_list<T, F>(
    resolver: &FieldResolver<'_>,
    group: &MergeGroup,
    field: PatientField,
    list_of: F,
    conflicting: &mut Vec<PatientField>,
) -> Result<Vec<T>>
where
    T: Clone + PartialEq + MergeKey,
    F: Fn(&StandardizedPatientRecord) -> &Vec<T>,
{
    let candidates: Vec<Candidate<Vec<T>>> = group
        .records()
        .iter()
        .map(|r| Candidate::new(Some(list_of(r).clone()), r.source, r.event_moment))
        .collect();
    let resolution: Resolution<Vec<T>> = resolver.resolve_list(field, &candidates)?;
    if resolution.was_conflicting() {
        conflicting.push(field);
    }
    Ok(resolution.into_value().unwrap_or_default())
}
