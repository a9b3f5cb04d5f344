//! Record grouping
//!
//! Groups standardized records by person-code. Within a group only the
//! newest event per source survives, since a newer event from the same
//! source supersedes the older ones.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use log::{debug, warn};

use crate::model::{SourceSystem, StandardizedPatientRecord};

/// All current records for one person-code, ordered by event moment then source
#[derive(Clone, Debug, PartialEq)]
pub struct MergeGroup {
    patient_code: String,
    records: Vec<StandardizedPatientRecord>,
}

impl MergeGroup {
    /// Build a group, dropping superseded events
    pub fn new(patient_code: impl Into<String>, records: Vec<StandardizedPatientRecord>) -> Self {
        let mut latest: BTreeMap<SourceSystem, StandardizedPatientRecord> = BTreeMap::new();
        for record in records {
            let newer = match latest.get(&record.source) {
                Some(current) => supersedes(&record, current),
                None => true,
            };
            if newer {
                latest.insert(record.source, record);
            }
        }

        let mut records: Vec<StandardizedPatientRecord> = latest.into_values().collect();
        records.sort_by(|a, b| a.event_moment.cmp(&b.event_moment).then(a.source.cmp(&b.source)));

        MergeGroup {
            patient_code: patient_code.into(),
            records,
        }
    }

    pub fn patient_code(&self) -> &str {
        &self.patient_code
    }

    pub fn records(&self) -> &[StandardizedPatientRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Contributing sources, sorted
    pub fn sources(&self) -> Vec<SourceSystem> {
        let mut sources: Vec<SourceSystem> = self.records.iter().map(|r| r.source).collect();
        sources.sort();
        sources.dedup();
        sources
    }
}

/// Whether `candidate` replaces `current` as its source's latest event.
///
/// Later event moments win, then later ingestion moments. Events that tie
/// on both are ordered by their serialized form, so the survivor never
/// depends on the order records arrive in.
fn supersedes(candidate: &StandardizedPatientRecord, current: &StandardizedPatientRecord) -> bool {
    let moments = |r: &StandardizedPatientRecord| (r.event_moment, r.ingestion_moment);
    match moments(candidate).cmp(&moments(current)) {
        Ordering::Greater => true,
        Ordering::Less => false,
        Ordering::Equal => tie_key(candidate) > tie_key(current),
    }
}

fn tie_key(record: &StandardizedPatientRecord) -> String {
    serde_json::to_string(record).unwrap_or_default()
}

/// Counters from one grouping pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GroupingStats {
    pub records: usize,
    pub groups: usize,
    pub superseded: usize,
    pub skipped: usize,
}

pub struct RecordGrouper;

impl RecordGrouper {
    /// Group records by person-code; groups come back in person-code order
    pub fn group<I>(records: I) -> Vec<MergeGroup>
    where
        I: IntoIterator<Item = StandardizedPatientRecord>,
    {
        Self::group_with_stats(records).0
    }

    pub fn group_with_stats<I>(records: I) -> (Vec<MergeGroup>, GroupingStats)
    where
        I: IntoIterator<Item = StandardizedPatientRecord>,
    {
        let mut stats = GroupingStats::default();
        let mut by_code: BTreeMap<String, Vec<StandardizedPatientRecord>> = BTreeMap::new();

        for mut record in records {
            stats.records += 1;
            let code = record.patient_code.trim();
            if code.is_empty() {
                warn!("Skipping {} record without a person-code", record.source);
                stats.skipped += 1;
                continue;
            }
            let code = code.to_string();
            record.patient_code = code.clone();
            by_code.entry(code).or_default().push(record);
        }

        let groups: Vec<MergeGroup> = by_code
            .into_iter()
            .map(|(code, records)| {
                let received = records.len();
                let group = MergeGroup::new(code, records);
                stats.superseded += received - group.len();
                group
            })
            .collect();
        stats.groups = groups.len();

        debug!(
            "Grouped {} records into {} groups ({} superseded, {} skipped)",
            stats.records, stats.groups, stats.superseded, stats.skipped
        );
        (groups, stats)
    }
}
