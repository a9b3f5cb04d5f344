//! MRG Core - Patient Golden-Record Merge Engine
//!
//! Consolidates standardized patient records coming from several clinical
//! source systems into one golden record per person-code.
//!
//! # Features
//!
//! - Versioned per-field source ranking loaded from a CSV artifact
//! - Per-field merge strategies (`replace` by rank, `append` with dedup)
//! - Superseding of older events from the same source
//! - Post-merge sanity correction (CNS primaries, deceased flag, address codes)
//! - Offset batch planning with idempotent checkpoints
//! - Allergy term standardization with keyboard-aware edit distance
//!
//! # Example
//!
//! ```rust
//! use mrg_core::{FieldRegistry, MergeEngine, RankingPolicy, RecordGrouper};
//! use mrg_core::model::{moment, SourceSystem, StandardizedPatientRecord};
//!
//! let csv = "campo,vitai,vitacare,smsrio\nrace,2,1,3\n";
//! let policy = RankingPolicy::from_csv_reader(csv.as_bytes(), Some("v1")).unwrap();
//! let registry = FieldRegistry::standard();
//!
//! let at = moment::parse("2024-01-01").unwrap();
//! let mut a = StandardizedPatientRecord::new("P1", SourceSystem::Vitai, at);
//! a.race = Some("parda".to_string());
//! let mut b = StandardizedPatientRecord::new("P1", SourceSystem::Vitacare, at);
//! b.race = Some("preta".to_string());
//!
//! let groups = RecordGrouper::group(vec![a, b]);
//! let engine = MergeEngine::new(&policy, &registry);
//! let merged = engine.merge(&groups[0]).unwrap();
//! assert_eq!(merged.race.as_deref(), Some("preta"));
//! ```

pub mod allergy;
pub mod batch;
pub mod error;
pub mod fields;
pub mod grouping;
pub mod merge;
pub mod model;
pub mod ranking;
pub mod resolver;
pub mod sanity;

// Re-export commonly used types for convenience
pub use allergy::{AllergyFallback, AllergyMatch, AllergyStandardizer, StandardizationResult, UnmatchedTerm};
pub use batch::{
    plan_batches, BatchCoordinator, BatchSpec, CheckpointKey, CheckpointStore,
    FileCheckpointStore, MemoryCheckpointStore,
};
pub use error::{ConfigurationError, MergeError, Result};
pub use fields::{FieldRegistry, FieldValue, MergeStrategy, PatientField};
pub use grouping::{GroupingStats, MergeGroup, RecordGrouper};
pub use merge::{MergeEngine, MergeOutcome};
pub use model::{
    Address, CnsEntry, MergedPatientRecord, SourceSystem, StandardizedPatientRecord, Telecom,
};
pub use ranking::RankingPolicy;
pub use resolver::{FieldResolver, Resolution};
pub use sanity::{SanityReport, SanityValidator};
