//! Pipeline errors
//!
//! Transient failures (connection errors, timeouts, 5xx and 429 responses)
//! are retried by [`crate::retry::RetryPolicy`]; everything else aborts the
//! run immediately.

use mrg_core::{ConfigurationError, MergeError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Core(#[from] MergeError),

    /// One failed attempt at reaching the API
    #[error("transport error: {0}")]
    Transport(String),

    #[error("HTTP {status} from {url}")]
    Http { status: u16, url: String },

    #[error("{operation} still failing after {attempts} attempts: {message}")]
    TransientIo {
        operation: String,
        attempts: u32,
        message: String,
    },

    #[error("response could not be decoded: {0}")]
    Decode(String),

    #[error("configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Worth another attempt with the same request
    pub fn is_transient(&self) -> bool {
        match self {
            PipelineError::Transport(_) => true,
            PipelineError::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Deploy-time defect; the run must stop without retrying
    pub fn is_configuration(&self) -> bool {
        match self {
            PipelineError::Config(_) => true,
            PipelineError::Core(err) => err.is_configuration(),
            _ => false,
        }
    }
}

impl From<ConfigurationError> for PipelineError {
    fn from(err: ConfigurationError) -> Self {
        PipelineError::Core(MergeError::Configuration(err))
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return PipelineError::Http {
                status: status.as_u16(),
                url: err.url().map(|u| u.to_string()).unwrap_or_default(),
            };
        }
        if err.is_decode() {
            return PipelineError::Decode(err.to_string());
        }
        if err.is_builder() {
            return PipelineError::Config(err.to_string());
        }
        PipelineError::Transport(err.to_string())
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(err: toml::de::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(PipelineError::Transport("reset".into()).is_transient());
        assert!(PipelineError::Http { status: 503, url: String::new() }.is_transient());
        assert!(PipelineError::Http { status: 429, url: String::new() }.is_transient());
        assert!(!PipelineError::Http { status: 404, url: String::new() }.is_transient());
        assert!(!PipelineError::Decode("bad".into()).is_transient());
    }

    #[test]
    fn test_configuration_errors_are_not_transient() {
        let err: PipelineError = ConfigurationError::ZeroBatchSize.into();
        assert!(err.is_configuration());
        assert!(!err.is_transient());
    }
}
