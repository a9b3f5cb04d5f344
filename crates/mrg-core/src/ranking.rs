//! Source ranking policy
//!
//! A versioned table of `(field, source) -> rank`, where rank 1 is the most
//! trusted source for that field. The table is loaded once by the caller
//! from a CSV artifact shaped like:
//!
//! ```text
//! campo,vitai,vitacare,smsrio
//! name,2,1,3
//! race,3,1,2
//! ```
//!
//! Blank cells leave a source unranked for that field.

use std::collections::HashMap;
use std::fs;
use std::io::Read;
use std::path::Path;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::{ConfigurationError, Result};
use crate::fields::PatientField;
use crate::model::SourceSystem;

/// Name of the field column in the ranking artifact
pub const FIELD_COLUMN: &str = "campo";

/// One cell of the ranking table
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RankingEntry {
    pub field: PatientField,
    pub source: SourceSystem,
    pub rank: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RankingPolicy {
    version: String,
    ranks: HashMap<(PatientField, SourceSystem), u32>,
}

impl RankingPolicy {
    /// Empty policy with the given version tag
    pub fn new(version: impl Into<String>) -> Self {
        RankingPolicy {
            version: version.into(),
            ranks: HashMap::new(),
        }
    }

    pub fn with_rank(mut self, field: PatientField, source: SourceSystem, rank: u32) -> Self {
        self.set_rank(field, source, rank);
        self
    }

    pub fn set_rank(&mut self, field: PatientField, source: SourceSystem, rank: u32) {
        self.ranks.insert((field, source), rank);
    }

    pub fn rank(&self, field: PatientField, source: SourceSystem) -> Option<u32> {
        self.ranks.get(&(field, source)).copied()
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.ranks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranks.is_empty()
    }

    /// All entries, ordered by field then rank
    pub fn entries(&self) -> Vec<RankingEntry> {
        let mut entries: Vec<RankingEntry> = self
            .ranks
            .iter()
            .map(|(&(field, source), &rank)| RankingEntry { field, source, rank })
            .collect();
        entries.sort_by(|a, b| {
            a.field
                .cmp(&b.field)
                .then(a.rank.cmp(&b.rank))
                .then(a.source.cmp(&b.source))
        });
        entries
    }

    /// Load from a CSV file. Without an explicit version the artifact's
    /// fingerprint is used.
    pub fn from_csv_path(path: &Path, version: Option<&str>) -> Result<Self> {
        let bytes = fs::read(path)?;
        let policy = Self::from_csv_bytes(&bytes, version)?;
        log::info!(
            "Loaded ranking policy {} from {} ({} entries)",
            policy.version,
            path.display(),
            policy.len()
        );
        Ok(policy)
    }

    pub fn from_csv_reader<R: Read>(mut reader: R, version: Option<&str>) -> Result<Self> {
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        Self::from_csv_bytes(&bytes, version)
    }

    fn from_csv_bytes(bytes: &[u8], version: Option<&str>) -> Result<Self> {
        let version = match version {
            Some(v) => v.to_string(),
            None => fingerprint(bytes),
        };
        let mut policy = RankingPolicy::new(version);

        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(bytes);

        let headers = reader.headers()?.clone();
        let field_column = headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(FIELD_COLUMN))
            .ok_or_else(|| ConfigurationError::MissingColumn(FIELD_COLUMN.to_string()))?;

        let mut source_columns = Vec::new();
        for (idx, header) in headers.iter().enumerate() {
            if idx != field_column && !header.is_empty() {
                source_columns.push((idx, header.parse::<SourceSystem>()?));
            }
        }

        for row in reader.records() {
            let row = row?;
            let campo = row.get(field_column).unwrap_or("");
            if campo.is_empty() {
                continue;
            }
            let field: PatientField = campo.parse()?;

            for &(idx, source) in &source_columns {
                let cell = row.get(idx).unwrap_or("");
                if cell.is_empty() {
                    continue;
                }
                let rank = cell.parse::<u32>().map_err(|_| ConfigurationError::InvalidRank {
                    field: field.name().to_string(),
                    system: source.to_string(),
                    value: cell.to_string(),
                })?;
                policy.set_rank(field, source, rank);
            }
        }

        Ok(policy)
    }
}

/// Short SHA-256 fingerprint used as the default policy version
pub fn fingerprint(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let hex: String = digest.iter().take(8).map(|b| format!("{:02x}", b)).collect();
    format!("sha256:{}", hex)
}
