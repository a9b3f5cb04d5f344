//! Error types for the merge engine
//!
//! Only configuration and logic defects are errors here. Data-quality
//! problems in source records are corrected by the sanity validator and
//! never surface as failures.

use thiserror::Error;

/// Deploy-time defects: a batch hitting one of these aborts and is never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("field '{field}' has conflicting values but no merge strategy is registered")]
    UnregisteredStrategy { field: String },

    #[error("unknown merge strategy '{0}'")]
    UnknownStrategy(String),

    #[error("strategy '{strategy}' cannot be applied to scalar field '{field}'")]
    StrategyNotApplicable { field: String, strategy: String },

    #[error("unknown field '{0}'")]
    UnknownField(String),

    #[error("unknown source system '{0}'")]
    UnknownSource(String),

    #[error("ranking table has no '{0}' column")]
    MissingColumn(String),

    #[error("invalid rank '{value}' for field '{field}' and source '{system}'")]
    InvalidRank {
        field: String,
        system: String,
        value: String,
    },

    #[error("batch size must be greater than zero")]
    ZeroBatchSize,

    #[error("a {got} value cannot be stored in field '{field}'")]
    FieldType { field: String, got: &'static str },
}

/// Errors raised by the merge engine and its checkpoint stores
#[derive(Debug, Error)]
pub enum MergeError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("ranking table could not be parsed: {0}")]
    RankingTable(#[from] csv::Error),

    #[error("checkpoint store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("allergy fallback failed: {0}")]
    Fallback(String),
}

impl MergeError {
    /// Configuration errors are fatal and must not be retried by callers.
    pub fn is_configuration(&self) -> bool {
        matches!(self, MergeError::Configuration(_))
    }
}

pub type Result<T> = std::result::Result<T, MergeError>;
