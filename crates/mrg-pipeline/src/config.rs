//! Pipeline configuration
//!
//! Loaded from a TOML file. Every section is optional:
//!
//! ```toml
//! environment = "staging"
//!
//! [api]
//! base_url = "https://api.example.org"
//! timeout_secs = 30
//! token_env = "MRG_API_TOKEN"
//!
//! [retry]
//! attempts = 3
//! delay_ms = 5000
//!
//! [batch]
//! size = 1000
//!
//! [ranking]
//! path = "ranking.csv"
//!
//! [checkpoint]
//! path = "checkpoints.jsonl"
//!
//! [strategies]
//! telecom_list = "replace"
//! ```
//!
//! `MRG_ENVIRONMENT` and `MRG_API_BASE_URL` override the file.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use mrg_core::{allergy, ConfigurationError, FieldRegistry, RankingPolicy};
use serde::Deserialize;

use crate::error::{PipelineError, Result};
use crate::retry::RetryPolicy;

pub const ENV_ENVIRONMENT: &str = "MRG_ENVIRONMENT";
pub const ENV_API_BASE_URL: &str = "MRG_API_BASE_URL";

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Deployment environment; scopes checkpoints and credentials
    pub environment: String,
    pub api: ApiConfig,
    pub retry: RetryConfig,
    pub batch: BatchConfig,
    pub ranking: RankingConfig,
    pub checkpoint: CheckpointConfig,
    pub allergy: AllergyConfig,
    /// `field = "replace" | "append"` overrides of the standard registry
    pub strategies: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Name of the environment variable holding the bearer token
    pub token_env: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub attempts: u32,
    pub delay_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BatchConfig {
    pub size: usize,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RankingConfig {
    pub path: PathBuf,
    /// Explicit policy version; defaults to the artifact fingerprint
    pub version: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CheckpointConfig {
    pub path: PathBuf,
}

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AllergyConfig {
    /// One vocabulary term per line
    pub vocabulary_path: Option<PathBuf>,
    pub threshold: f64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            environment: "dev".to_string(),
            api: ApiConfig::default(),
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
            ranking: RankingConfig::default(),
            checkpoint: CheckpointConfig::default(),
            allergy: AllergyConfig::default(),
            strategies: BTreeMap::new(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            base_url: "http://localhost:8000".to_string(),
            timeout_secs: 30,
            token_env: "MRG_API_TOKEN".to_string(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            attempts: 3,
            delay_ms: 5_000,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig { size: 1_000 }
    }
}

impl Default for RankingConfig {
    fn default() -> Self {
        RankingConfig {
            path: PathBuf::from("ranking.csv"),
            version: None,
        }
    }
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            path: PathBuf::from("checkpoints.jsonl"),
        }
    }
}

impl Default for AllergyConfig {
    fn default() -> Self {
        AllergyConfig {
            vocabulary_path: None,
            threshold: allergy::DEFAULT_THRESHOLD,
        }
    }
}

impl PipelineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!("No config file at {}; using defaults", path.display());
            return Ok(Self::default());
        }
        info!("Loading config from {}", path.display());
        let content = fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Apply `MRG_*` overrides from the process environment
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(env) = lookup(ENV_ENVIRONMENT).filter(|v| !v.trim().is_empty()) {
            self.environment = env.trim().to_string();
        }
        if let Some(url) = lookup(ENV_API_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.api.base_url = url.trim().to_string();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.environment.trim().is_empty() {
            return Err(PipelineError::Config("environment must not be empty".to_string()));
        }
        if self.batch.size == 0 {
            return Err(ConfigurationError::ZeroBatchSize.into());
        }
        check_threshold(self.allergy.threshold)?;
        Ok(())
    }

    /// Standard registry with the configured overrides applied
    pub fn registry(&self) -> Result<FieldRegistry> {
        let mut registry = FieldRegistry::standard();
        registry.apply_overrides(
            self.strategies
                .iter()
                .map(|(field, strategy)| (field.as_str(), strategy.as_str())),
        )?;
        Ok(registry)
    }

    pub fn ranking_policy(&self) -> Result<RankingPolicy> {
        Ok(RankingPolicy::from_csv_path(
            &self.ranking.path,
            self.ranking.version.as_deref(),
        )?)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry.attempts, Duration::from_millis(self.retry.delay_ms))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.api.timeout_secs)
    }
}

/// Allergy similarity thresholds live in [0, 1]
pub fn check_threshold(threshold: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&threshold) {
        return Err(PipelineError::Config(format!(
            "allergy threshold {} is outside [0, 1]",
            threshold
        )));
    }
    Ok(threshold)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mrg_core::{MergeStrategy, PatientField};

    #[test]
    fn test_empty_file_gives_defaults() {
        let config = PipelineConfig::from_toml_str("").unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.batch.size, 1_000);
        assert_eq!(config.retry_policy().attempts(), 3);
    }

    #[test]
    fn test_sections_parse() {
        let config = PipelineConfig::from_toml_str(
            r#"
            environment = "staging"

            [api]
            base_url = "https://api.example.org"
            token_env = "STAGING_TOKEN"

            [batch]
            size = 250

            [retry]
            attempts = 5
            delay_ms = 10

            [strategies]
            telecom_list = "replace"
            "#,
        )
        .unwrap();
        assert_eq!(config.environment, "staging");
        assert_eq!(config.api.timeout_secs, 30);
        assert_eq!(config.api.token_env, "STAGING_TOKEN");
        assert_eq!(config.batch.size, 250);
        assert_eq!(config.retry_policy().delay(), Duration::from_millis(10));
        assert_eq!(
            config.registry().unwrap().strategy(PatientField::Telecoms),
            Some(MergeStrategy::Replace)
        );
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let err = PipelineConfig::from_toml_str("[batch]\nsize = 0\n").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_threshold_range_checked() {
        assert_eq!(check_threshold(0.0).unwrap(), 0.0);
        assert_eq!(check_threshold(1.0).unwrap(), 1.0);
        assert!(check_threshold(1.5).unwrap_err().is_configuration());
        assert!(check_threshold(-0.1).is_err());
        assert!(check_threshold(f64::NAN).is_err());

        let err = PipelineConfig::from_toml_str("[allergy]\nthreshold = 2.0\n").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_unknown_keys_rejected() {
        assert!(PipelineConfig::from_toml_str("[batch]\nsise = 10\n").is_err());
    }

    #[test]
    fn test_bad_strategy_override_rejected() {
        let config = PipelineConfig::from_toml_str("[strategies]\nname = \"append\"\n").unwrap();
        assert!(config.registry().unwrap_err().is_configuration());

        let config = PipelineConfig::from_toml_str("[strategies]\nname = \"latest\"\n").unwrap();
        assert!(config.registry().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = PipelineConfig::default();
        config.apply_overrides_from(|key| match key {
            ENV_ENVIRONMENT => Some("prod".to_string()),
            ENV_API_BASE_URL => Some("  ".to_string()),
            _ => None,
        });
        assert_eq!(config.environment, "prod");
        assert_eq!(config.api.base_url, ApiConfig::default().base_url);
    }
}
