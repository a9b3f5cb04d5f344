//! Batch runner
//!
//! Drives one backfill or incremental run: plan windows, skip completed
//! ones, fetch, group, merge, submit all four collections, then mark the
//! window complete. Any error aborts the run; the failing window stays
//! unmarked and is redone from scratch next time.

use log::{info, warn};
use mrg_core::{
    BatchCoordinator, BatchSpec, CheckpointStore, FieldRegistry, MergeEngine, MergedPatientRecord,
    RankingPolicy, RecordGrouper,
};
use serde::Serialize;

use crate::client::{RecordSink, RecordSource};
use crate::error::Result;
use crate::payload::{Collection, SubmissionBatch};

/// Merged record count differs from the expected window span
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct ConsistencyMismatch {
    pub offset: usize,
    pub expected: usize,
    pub merged: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub batch: BatchSpec,
    /// Already completed in an earlier run
    pub skipped: bool,
    pub records_fetched: usize,
    pub superseded: usize,
    /// Window span at planning time
    pub patients_expected: usize,
    pub patients_merged: usize,
    pub conflicting_fields: usize,
    pub sanity_corrections: usize,
    pub mismatch: Option<ConsistencyMismatch>,
}

impl BatchReport {
    fn skipped(batch: BatchSpec) -> Self {
        BatchReport {
            batch,
            skipped: true,
            records_fetched: 0,
            superseded: 0,
            patients_expected: 0,
            patients_merged: 0,
            conflicting_fields: 0,
            sanity_corrections: 0,
            mismatch: None,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub environment: String,
    pub ranking_version: String,
    pub total_count: usize,
    pub batches_planned: usize,
    pub batches_processed: usize,
    pub batches_skipped: usize,
    pub records_fetched: usize,
    /// Sum of the planned spans of the processed windows
    pub patients_expected: usize,
    pub patients_merged: usize,
    pub mismatches: Vec<ConsistencyMismatch>,
}

impl RunSummary {
    fn record(&mut self, report: &BatchReport) {
        if report.skipped {
            self.batches_skipped += 1;
            return;
        }
        self.batches_processed += 1;
        self.records_fetched += report.records_fetched;
        self.patients_expected += report.patients_expected;
        self.patients_merged += report.patients_merged;
        if let Some(mismatch) = report.mismatch {
            self.mismatches.push(mismatch);
        }
    }

    /// Patients merged and submitted across the run match the population
    /// counted at planning time. Skipped windows count on neither side.
    pub fn is_consistent(&self) -> bool {
        self.patients_merged == self.patients_expected
    }
}

pub struct BatchRunner<'a, R, W, S> {
    source: R,
    sink: W,
    coordinator: BatchCoordinator<S>,
    engine: MergeEngine<'a>,
    ranking_version: String,
    batch_size: usize,
}

impl<'a, R, W, S> BatchRunner<'a, R, W, S>
where
    R: RecordSource,
    W: RecordSink,
    S: CheckpointStore,
{
    pub fn new(
        source: R,
        sink: W,
        coordinator: BatchCoordinator<S>,
        policy: &'a RankingPolicy,
        registry: &'a FieldRegistry,
        batch_size: usize,
    ) -> Self {
        BatchRunner {
            source,
            sink,
            coordinator,
            engine: MergeEngine::new(policy, registry),
            ranking_version: policy.version().to_string(),
            batch_size,
        }
    }

    pub fn coordinator(&self) -> &BatchCoordinator<S> {
        &self.coordinator
    }

    pub fn into_parts(self) -> (R, W, BatchCoordinator<S>) {
        (self.source, self.sink, self.coordinator)
    }

    /// Current plan for the population the source reports
    pub fn plan(&self) -> Result<(usize, Vec<BatchSpec>)> {
        let total = self.source.count()?;
        let plan = self.coordinator.plan_batches(total, self.batch_size)?;
        Ok((total, plan))
    }

    pub fn run(&mut self) -> Result<RunSummary> {
        self.run_with(|_| {})
    }

    /// Run every pending window, calling `on_batch` after each one
    pub fn run_with<F>(&mut self, mut on_batch: F) -> Result<RunSummary>
    where
        F: FnMut(&BatchReport),
    {
        let (total, plan) = self.plan()?;
        let mut summary = RunSummary {
            environment: self.coordinator.environment().to_string(),
            ranking_version: self.ranking_version.clone(),
            total_count: total,
            batches_planned: plan.len(),
            ..RunSummary::default()
        };
        info!(
            "Planned {} batches of {} over {} patients in {}",
            plan.len(),
            self.batch_size,
            total,
            summary.environment
        );

        for batch in plan {
            let done = self.coordinator.has_completed(
                batch.offset,
                batch.batch_size,
                self.coordinator.environment(),
            )?;
            let report = if done {
                BatchReport::skipped(batch)
            } else {
                self.process(batch, total)?
            };
            summary.record(&report);
            on_batch(&report);
        }

        info!(
            "Run finished: {} processed, {} skipped, {} patients merged",
            summary.batches_processed, summary.batches_skipped, summary.patients_merged
        );
        if !summary.mismatches.is_empty() {
            warn!("{} batches had consistency mismatches", summary.mismatches.len());
        }
        if !summary.is_consistent() {
            warn!(
                "Run merged {} patients, {} expected from the planned count of {}",
                summary.patients_merged, summary.patients_expected, total
            );
        }
        Ok(summary)
    }

    fn process(&mut self, batch: BatchSpec, total: usize) -> Result<BatchReport> {
        let records = self.source.fetch_window(batch.batch_size, batch.offset)?;
        let records_fetched = records.len();
        let (groups, stats) = RecordGrouper::group_with_stats(records);
        let outcomes = self.engine.merge_all(&groups)?;

        let expected = batch.span(total);
        let mismatch = (outcomes.len() != expected).then(|| {
            warn!(
                "Batch at offset {} merged {} patients, expected {}",
                batch.offset,
                outcomes.len(),
                expected
            );
            ConsistencyMismatch {
                offset: batch.offset,
                expected,
                merged: outcomes.len(),
            }
        });

        let payload = SubmissionBatch::from_records(outcomes.iter().map(|o| &o.record));
        for collection in Collection::ALL {
            let body = payload.body(collection)?;
            self.sink.submit(collection, &body)?;
        }
        let environment = self.coordinator.environment().to_string();
        self.coordinator
            .mark_completed(batch.offset, batch.batch_size, &environment)?;

        Ok(BatchReport {
            batch,
            skipped: false,
            records_fetched,
            superseded: stats.superseded,
            patients_expected: expected,
            patients_merged: outcomes.len(),
            conflicting_fields: outcomes.iter().map(|o| o.conflicting_fields.len()).sum(),
            sanity_corrections: outcomes.iter().filter(|o| !o.sanity.is_clean()).count(),
            mismatch,
        })
    }

    /// Merge and submit a single person-code outside the batch plan
    pub fn run_patient(&mut self, patient_code: &str) -> Result<Option<MergedPatientRecord>> {
        let records = self.source.fetch_patient(patient_code)?;
        let Some(group) = RecordGrouper::group(records)
            .into_iter()
            .find(|g| g.patient_code() == patient_code.trim())
        else {
            warn!("No records found for patient {}", patient_code);
            return Ok(None);
        };
        let merged = self.engine.merge(&group)?;
        let payload = SubmissionBatch::from_records([&merged]);
        for collection in Collection::ALL {
            let body = payload.body(collection)?;
            self.sink.submit(collection, &body)?;
        }
        Ok(Some(merged))
    }
}
