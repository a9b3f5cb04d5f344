//! MRG Pipeline - batch orchestration for the golden-record merge
//!
//! Wires the pure merge engine in `mrg-core` to its collaborators: the
//! standardized-record API it reads from, the golden-record API it writes
//! to, and the checkpoint store that makes backfills resumable.

pub mod client;
pub mod config;
pub mod error;
pub mod payload;
pub mod retry;
pub mod runner;

pub use client::{HttpApi, RecordSink, RecordSource};
pub use config::PipelineConfig;
pub use error::{PipelineError, Result};
pub use payload::{Collection, SubmissionBatch};
pub use retry::RetryPolicy;
pub use runner::{BatchReport, BatchRunner, ConsistencyMismatch, RunSummary};
