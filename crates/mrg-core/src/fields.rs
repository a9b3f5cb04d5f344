//! Field registry
//!
//! Every mergeable field is declared here with its wire name (the `campo`
//! column of the ranking table), its shape and the strategy used when
//! sources disagree. A field without a registered strategy is a
//! configuration defect once its sources conflict.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;

/// Mergeable patient fields
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PatientField {
    Name,
    SocialName,
    BirthDate,
    MotherName,
    FatherName,
    Nationality,
    Naturalization,
    Race,
    Gender,
    Deceased,
    DeceasedDate,
    BirthCityCode,
    BirthStateCode,
    BirthCountryCode,
    ProtectedPerson,
    Cns,
    Addresses,
    Telecoms,
}

/// Whether a field holds one value or a list of sub-entities
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldShape {
    Scalar,
    List,
}

impl PatientField {
    pub const SCALARS: [PatientField; 15] = [
        PatientField::Name,
        PatientField::SocialName,
        PatientField::BirthDate,
        PatientField::MotherName,
        PatientField::FatherName,
        PatientField::Nationality,
        PatientField::Naturalization,
        PatientField::Race,
        PatientField::Gender,
        PatientField::Deceased,
        PatientField::DeceasedDate,
        PatientField::BirthCityCode,
        PatientField::BirthStateCode,
        PatientField::BirthCountryCode,
        PatientField::ProtectedPerson,
    ];

    pub const LISTS: [PatientField; 3] = [PatientField::Cns, PatientField::Addresses, PatientField::Telecoms];

    pub fn all() -> impl Iterator<Item = PatientField> {
        Self::SCALARS.into_iter().chain(Self::LISTS)
    }

    /// Wire name, as used by the standardized records and the ranking table
    pub fn name(&self) -> &'static str {
        match self {
            PatientField::Name => "name",
            PatientField::SocialName => "social_name",
            PatientField::BirthDate => "birth_date",
            PatientField::MotherName => "mother_name",
            PatientField::FatherName => "father_name",
            PatientField::Nationality => "nationality",
            PatientField::Naturalization => "naturalization",
            PatientField::Race => "race",
            PatientField::Gender => "gender",
            PatientField::Deceased => "deceased",
            PatientField::DeceasedDate => "deceased_date",
            PatientField::BirthCityCode => "birth_city_cod",
            PatientField::BirthStateCode => "birth_state_cod",
            PatientField::BirthCountryCode => "birth_country_cod",
            PatientField::ProtectedPerson => "protected_person",
            PatientField::Cns => "cns_list",
            PatientField::Addresses => "address_list",
            PatientField::Telecoms => "telecom_list",
        }
    }

    pub fn shape(&self) -> FieldShape {
        match self {
            PatientField::Cns | PatientField::Addresses | PatientField::Telecoms => FieldShape::List,
            _ => FieldShape::Scalar,
        }
    }
}

impl fmt::Display for PatientField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for PatientField {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        PatientField::all()
            .find(|field| field.name() == normalized)
            .ok_or_else(|| ConfigurationError::UnknownField(s.trim().to_string()))
    }
}

impl TryFrom<String> for PatientField {
    type Error = ConfigurationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<PatientField> for String {
    fn from(field: PatientField) -> Self {
        field.name().to_string()
    }
}

/// How conflicting values of one field are combined
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MergeStrategy {
    /// Highest-ranked source wins
    Replace,
    /// Union of distinct values, first-seen order
    Append,
}

impl MergeStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            MergeStrategy::Replace => "replace",
            MergeStrategy::Append => "append",
        }
    }
}

impl fmt::Display for MergeStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MergeStrategy {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "replace" => Ok(MergeStrategy::Replace),
            "append" => Ok(MergeStrategy::Append),
            _ => Err(ConfigurationError::UnknownStrategy(s.trim().to_string())),
        }
    }
}

/// A scalar field value
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(untagged)]
pub enum FieldValue {
    Text(String),
    Date(NaiveDate),
    Flag(bool),
}

impl FieldValue {
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Text(_) => "text",
            FieldValue::Date(_) => "date",
            FieldValue::Flag(_) => "flag",
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Text(v) => f.write_str(v),
            FieldValue::Date(v) => write!(f, "{}", v),
            FieldValue::Flag(v) => write!(f, "{}", v),
        }
    }
}

/// Strategy table consulted by the resolver
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FieldRegistry {
    strategies: BTreeMap<PatientField, MergeStrategy>,
}

impl FieldRegistry {
    /// Registry with no strategies at all
    pub fn empty() -> Self {
        FieldRegistry {
            strategies: BTreeMap::new(),
        }
    }

    /// Scalars replace by rank, sub-entity lists append
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        for field in PatientField::SCALARS {
            registry.strategies.insert(field, MergeStrategy::Replace);
        }
        for field in PatientField::LISTS {
            registry.strategies.insert(field, MergeStrategy::Append);
        }
        registry
    }

    pub fn register(&mut self, field: PatientField, strategy: MergeStrategy) -> Result<(), ConfigurationError> {
        if strategy == MergeStrategy::Append && field.shape() == FieldShape::Scalar {
            return Err(ConfigurationError::StrategyNotApplicable {
                field: field.name().to_string(),
                strategy: strategy.to_string(),
            });
        }
        self.strategies.insert(field, strategy);
        Ok(())
    }

    /// Builder form of [`FieldRegistry::register`]
    pub fn with(mut self, field: PatientField, strategy: MergeStrategy) -> Result<Self, ConfigurationError> {
        self.register(field, strategy)?;
        Ok(self)
    }

    /// Apply `field = strategy` overrides, e.g. from a configuration file
    pub fn apply_overrides<'a, I>(&mut self, overrides: I) -> Result<(), ConfigurationError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (field, strategy) in overrides {
            self.register(field.parse()?, strategy.parse()?)?;
        }
        Ok(())
    }

    pub fn strategy(&self, field: PatientField) -> Option<MergeStrategy> {
        self.strategies.get(&field).copied()
    }

    pub fn len(&self) -> usize {
        self.strategies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_names_round_trip() {
        for field in PatientField::all() {
            assert_eq!(field.name().parse::<PatientField>().unwrap(), field);
        }
        assert!(matches!(
            "blood_type".parse::<PatientField>(),
            Err(ConfigurationError::UnknownField(_))
        ));
    }

    #[test]
    fn test_standard_registry_covers_every_field() {
        let registry = FieldRegistry::standard();
        assert_eq!(registry.len(), 18);
        assert_eq!(registry.strategy(PatientField::Race), Some(MergeStrategy::Replace));
        assert_eq!(registry.strategy(PatientField::Cns), Some(MergeStrategy::Append));
    }

    #[test]
    fn test_append_rejected_for_scalars() {
        let mut registry = FieldRegistry::empty();
        let err = registry.register(PatientField::Name, MergeStrategy::Append).unwrap_err();
        assert!(matches!(err, ConfigurationError::StrategyNotApplicable { .. }));
        registry.register(PatientField::Addresses, MergeStrategy::Replace).unwrap();
        assert_eq!(registry.strategy(PatientField::Addresses), Some(MergeStrategy::Replace));
    }

    #[test]
    fn test_overrides() {
        let mut registry = FieldRegistry::standard();
        registry.apply_overrides([("telecom_list", "replace")]).unwrap();
        assert_eq!(registry.strategy(PatientField::Telecoms), Some(MergeStrategy::Replace));

        let err = registry.apply_overrides([("race", "majority")]).unwrap_err();
        assert_eq!(err, ConfigurationError::UnknownStrategy("majority".to_string()));
    }
}
