//! Field resolution
//!
//! Resolves the candidate values one field receives from the sources of a
//! merge group into a single merged value.

use std::collections::HashSet;
use std::hash::Hash;

use chrono::{DateTime, Utc};
use log::{debug, warn};

use crate::error::ConfigurationError;
use crate::fields::{FieldRegistry, FieldShape, MergeStrategy, PatientField};
use crate::model::{Address, CnsEntry, SourceSystem, Telecom};
use crate::ranking::RankingPolicy;

/// One source's contribution to a field
#[derive(Clone, Debug, PartialEq)]
pub struct Candidate<T> {
    pub value: Option<T>,
    pub source: SourceSystem,
    pub event_moment: DateTime<Utc>,
}

impl<T> Candidate<T> {
    pub fn new(value: Option<T>, source: SourceSystem, event_moment: DateTime<Utc>) -> Self {
        Candidate {
            value,
            source,
            event_moment,
        }
    }
}

/// Outcome of resolving one field
#[derive(Clone, Debug, PartialEq)]
pub enum Resolution<T> {
    /// Every candidate was null
    Empty,
    /// One distinct value; ranking never consulted
    Unanimous(T),
    /// Distinct values combined with the field's strategy
    Resolved { value: T, strategy: MergeStrategy },
}

impl<T> Resolution<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Resolution::Empty => None,
            Resolution::Unanimous(value) | Resolution::Resolved { value, .. } => Some(value),
        }
    }

    pub fn was_conflicting(&self) -> bool {
        matches!(self, Resolution::Resolved { .. })
    }

    pub fn strategy(&self) -> Option<MergeStrategy> {
        match self {
            Resolution::Resolved { strategy, .. } => Some(*strategy),
            _ => None,
        }
    }
}

/// Field-specific equality used when appending sub-entities
pub trait MergeKey {
    type Key: Eq + Hash;

    fn merge_key(&self) -> Self::Key;
}

impl MergeKey for String {
    type Key = String;

    fn merge_key(&self) -> String {
        self.clone()
    }
}

impl<'a> MergeKey for &'a str {
    type Key = &'a str;

    fn merge_key(&self) -> &'a str {
        *self
    }
}

/// CNS entries are the same card when the card numbers match, whatever
/// their primary flag says.
impl MergeKey for CnsEntry {
    type Key = String;

    fn merge_key(&self) -> String {
        self.card_number()
    }
}

impl MergeKey for Telecom {
    type Key = (Option<String>, Option<String>, Option<String>);

    fn merge_key(&self) -> Self::Key {
        let norm = |v: &Option<String>| v.as_deref().map(|s| s.trim().to_lowercase());
        (norm(&self.system), norm(&self.use_), norm(&self.value))
    }
}

impl MergeKey for Address {
    type Key = Address;

    fn merge_key(&self) -> Address {
        self.clone()
    }
}

/// Union of values dropping duplicates by merge key, first occurrence kept
pub fn append_merge<T, I>(values: I) -> Vec<T>
where
    T: MergeKey,
    I: IntoIterator<Item = T>,
{
    let mut seen = HashSet::new();
    values
        .into_iter()
        .filter(|value| seen.insert(value.merge_key()))
        .collect()
}

/// Resolves fields against a ranking policy and a strategy table
#[derive(Clone, Copy, Debug)]
pub struct FieldResolver<'a> {
    policy: &'a RankingPolicy,
    registry: &'a FieldRegistry,
}

impl<'a> FieldResolver<'a> {
    pub fn new(policy: &'a RankingPolicy, registry: &'a FieldRegistry) -> Self {
        FieldResolver { policy, registry }
    }

    /// Resolve a scalar field
    pub fn resolve_scalar<T>(
        &self,
        field: PatientField,
        candidates: &[Candidate<T>],
    ) -> Result<Resolution<T>, ConfigurationError>
    where
        T: Clone + PartialEq,
    {
        let present: Vec<&Candidate<T>> = candidates.iter().filter(|c| c.value.is_some()).collect();
        let distinct = distinct_values(&present);
        match distinct.len() {
            0 => return Ok(Resolution::Empty),
            1 => return Ok(Resolution::Unanimous(distinct[0].clone())),
            _ => {}
        }

        match self.strategy_for(field)? {
            MergeStrategy::Replace => {
                let winner = self.ranked_winner(field, &present);
                debug!(
                    "Field {} had {} distinct values, {} wins by rank",
                    field,
                    distinct.len(),
                    winner.source
                );
                Ok(Resolution::Resolved {
                    value: winner.value.clone().unwrap_or_else(|| distinct[0].clone()),
                    strategy: MergeStrategy::Replace,
                })
            }
            MergeStrategy::Append => Err(ConfigurationError::StrategyNotApplicable {
                field: field.name().to_string(),
                strategy: MergeStrategy::Append.to_string(),
            }),
        }
    }

    /// Resolve a list field. Empty lists count as null. Whatever the
    /// strategy, the resolved list holds each merge key once.
    pub fn resolve_list<T>(
        &self,
        field: PatientField,
        candidates: &[Candidate<Vec<T>>],
    ) -> Result<Resolution<Vec<T>>, ConfigurationError>
    where
        T: Clone + PartialEq + MergeKey,
    {
        let present: Vec<&Candidate<Vec<T>>> = candidates
            .iter()
            .filter(|c| c.value.as_ref().map_or(false, |list| !list.is_empty()))
            .collect();
        let distinct = distinct_values(&present);
        match distinct.len() {
            0 => return Ok(Resolution::Empty),
            1 => return Ok(Resolution::Unanimous(append_merge(distinct[0].iter().cloned()))),
            _ => {}
        }

        let strategy = self.strategy_for(field)?;
        let value = match strategy {
            MergeStrategy::Append => append_merge(
                present
                    .iter()
                    .flat_map(|c| c.value.iter().flatten().cloned()),
            ),
            MergeStrategy::Replace => {
                let winner = self.ranked_winner(field, &present);
                append_merge(winner.value.iter().flatten().cloned())
            }
        };
        debug!(
            "Field {} merged {} distinct lists with {} into {} entries",
            field,
            distinct.len(),
            strategy,
            value.len()
        );
        Ok(Resolution::Resolved { value, strategy })
    }

    fn strategy_for(&self, field: PatientField) -> Result<MergeStrategy, ConfigurationError> {
        let strategy = self
            .registry
            .strategy(field)
            .ok_or_else(|| ConfigurationError::UnregisteredStrategy {
                field: field.name().to_string(),
            })?;
        if strategy == MergeStrategy::Append && field.shape() == FieldShape::Scalar {
            return Err(ConfigurationError::StrategyNotApplicable {
                field: field.name().to_string(),
                strategy: strategy.to_string(),
            });
        }
        Ok(strategy)
    }

    /// Rank ascending, ties by newest event moment. Remaining ties keep
    /// input order. `present` must not be empty.
    fn ranked_winner<'c, T>(&self, field: PatientField, present: &[&'c Candidate<T>]) -> &'c Candidate<T> {
        let mut ranked: Vec<(u32, &'c Candidate<T>)> = present
            .iter()
            .map(|candidate| (self.rank_for(field, candidate.source), *candidate))
            .collect();
        ranked.sort_by(|(rank_a, a), (rank_b, b)| {
            rank_a
                .cmp(rank_b)
                .then_with(|| b.event_moment.cmp(&a.event_moment))
        });
        ranked[0].1
    }

    fn rank_for(&self, field: PatientField, source: SourceSystem) -> u32 {
        match self.policy.rank(field, source) {
            Some(rank) => rank,
            None => {
                warn!(
                    "No rank for field {} from source {} in policy {}; ranking it last",
                    field,
                    source,
                    self.policy.version()
                );
                u32::MAX
            }
        }
    }
}

fn distinct_values<'c, T: PartialEq>(present: &[&'c Candidate<T>]) -> Vec<&'c T> {
    let mut distinct: Vec<&T> = Vec::new();
    for value in present.iter().copied().filter_map(|c| c.value.as_ref()) {
        if !distinct.contains(&value) {
            distinct.push(value);
        }
    }
    distinct
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::FieldValue;
    use crate::model::moment;

    fn at(raw: &str) -> DateTime<Utc> {
        moment::parse(raw).unwrap()
    }

    fn text(v: &str) -> Option<FieldValue> {
        Some(FieldValue::Text(v.to_string()))
    }

    fn race_policy() -> RankingPolicy {
        RankingPolicy::new("test")
            .with_rank(PatientField::Race, SourceSystem::Vitai, 2)
            .with_rank(PatientField::Race, SourceSystem::Vitacare, 1)
    }

    #[test]
    fn test_all_null_is_empty() {
        let policy = race_policy();
        let registry = FieldRegistry::standard();
        let resolver = FieldResolver::new(&policy, &registry);
        let candidates: Vec<Candidate<FieldValue>> = vec![
            Candidate::new(None, SourceSystem::Vitai, at("2024-01-01")),
            Candidate::new(None, SourceSystem::Vitacare, at("2024-01-02")),
        ];
        assert_eq!(resolver.resolve_scalar(PatientField::Race, &candidates).unwrap(), Resolution::Empty);
    }

    #[test]
    fn test_single_value_ignores_ranking() {
        // Empty policy and empty registry: neither may be consulted.
        let policy = RankingPolicy::new("empty");
        let registry = FieldRegistry::empty();
        let resolver = FieldResolver::new(&policy, &registry);
        let candidates = vec![
            Candidate::new(text("Maria"), SourceSystem::Vitai, at("2024-01-01")),
            Candidate::new(None, SourceSystem::Vitacare, at("2024-02-01")),
            Candidate::new(text("Maria"), SourceSystem::Smsrio, at("2024-03-01")),
        ];
        let resolution = resolver.resolve_scalar(PatientField::Name, &candidates).unwrap();
        assert_eq!(resolution, Resolution::Unanimous(FieldValue::Text("Maria".to_string())));
    }

    #[test]
    fn test_lower_rank_wins() {
        let policy = race_policy();
        let registry = FieldRegistry::standard();
        let resolver = FieldResolver::new(&policy, &registry);
        let candidates = vec![
            Candidate::new(text("A"), SourceSystem::Vitai, at("2024-05-01")),
            Candidate::new(text("B"), SourceSystem::Vitacare, at("2024-01-01")),
        ];
        let resolution = resolver.resolve_scalar(PatientField::Race, &candidates).unwrap();
        assert!(resolution.was_conflicting());
        assert_eq!(resolution.into_value(), text("B"));
    }

    #[test]
    fn test_rank_tie_goes_to_latest_moment() {
        let policy = RankingPolicy::new("tie")
            .with_rank(PatientField::Race, SourceSystem::Vitai, 1)
            .with_rank(PatientField::Race, SourceSystem::Vitacare, 1)
            .with_rank(PatientField::Race, SourceSystem::Smsrio, 2);
        let registry = FieldRegistry::standard();
        let resolver = FieldResolver::new(&policy, &registry);
        let candidates = vec![
            Candidate::new(text("A"), SourceSystem::Vitai, at("2024-01-01")),
            Candidate::new(text("B"), SourceSystem::Vitacare, at("2024-02-01")),
            Candidate::new(text("C"), SourceSystem::Smsrio, at("2024-12-01")),
        ];
        let resolution = resolver.resolve_scalar(PatientField::Race, &candidates).unwrap();
        assert_eq!(resolution.into_value(), text("B"));
    }

    #[test]
    fn test_unranked_source_loses() {
        let policy = RankingPolicy::new("partial").with_rank(PatientField::Gender, SourceSystem::Smsrio, 3);
        let registry = FieldRegistry::standard();
        let resolver = FieldResolver::new(&policy, &registry);
        let candidates = vec![
            Candidate::new(text("female"), SourceSystem::Vitai, at("2024-09-01")),
            Candidate::new(text("male"), SourceSystem::Smsrio, at("2024-01-01")),
        ];
        let resolution = resolver.resolve_scalar(PatientField::Gender, &candidates).unwrap();
        assert_eq!(resolution.into_value(), text("male"));
    }

    #[test]
    fn test_conflict_without_strategy_is_fatal() {
        let policy = race_policy();
        let registry = FieldRegistry::empty();
        let resolver = FieldResolver::new(&policy, &registry);
        let candidates = vec![
            Candidate::new(text("A"), SourceSystem::Vitai, at("2024-01-01")),
            Candidate::new(text("B"), SourceSystem::Vitacare, at("2024-01-01")),
        ];
        let err = resolver.resolve_scalar(PatientField::Race, &candidates).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnregisteredStrategy {
                field: "race".to_string()
            }
        );
    }

    #[test]
    fn test_append_merge_preserves_first_seen_order() {
        assert_eq!(append_merge(vec!["x", "y", "x"]), vec!["x", "y"]);
        assert_eq!(
            append_merge(vec!["b".to_string(), "a".to_string(), "b".to_string(), "c".to_string()]),
            vec!["b", "a", "c"]
        );
    }

    #[test]
    fn test_cns_append_compares_card_number_only() {
        let merged = append_merge(vec![
            CnsEntry::new("700000000000001", true),
            CnsEntry::new("700 0000 0000 0001", false),
            CnsEntry::new("700000000000002", false),
        ]);
        assert_eq!(merged.len(), 2);
        assert!(merged[0].is_primary);
    }

    #[test]
    fn test_list_append_unions_sources() {
        let policy = RankingPolicy::new("lists");
        let registry = FieldRegistry::standard();
        let resolver = FieldResolver::new(&policy, &registry);
        let phone = |v: &str| Telecom {
            system: Some("phone".to_string()),
            value: Some(v.to_string()),
            ..Telecom::default()
        };
        let candidates = vec![
            Candidate::new(Some(vec![phone("2199990000"), phone("2133330000")]), SourceSystem::Vitai, at("2024-01-01")),
            Candidate::new(Some(vec![phone("2133330000"), phone("2188880000")]), SourceSystem::Smsrio, at("2024-01-02")),
            Candidate::new(Some(vec![]), SourceSystem::Vitacare, at("2024-01-03")),
        ];
        let resolution = resolver.resolve_list(PatientField::Telecoms, &candidates).unwrap();
        assert_eq!(resolution.strategy(), Some(MergeStrategy::Append));
        let values: Vec<String> = resolution
            .into_value()
            .unwrap()
            .into_iter()
            .filter_map(|t| t.value)
            .collect();
        assert_eq!(values, vec!["2199990000", "2133330000", "2188880000"]);
    }

    #[test]
    fn test_list_replace_override_takes_winning_list() {
        let policy = RankingPolicy::new("lists")
            .with_rank(PatientField::Addresses, SourceSystem::Vitai, 2)
            .with_rank(PatientField::Addresses, SourceSystem::Smsrio, 1);
        let registry = FieldRegistry::standard()
            .with(PatientField::Addresses, MergeStrategy::Replace)
            .unwrap();
        let resolver = FieldResolver::new(&policy, &registry);
        let home = |line: &str| Address {
            line: Some(line.to_string()),
            ..Address::default()
        };
        let candidates = vec![
            Candidate::new(Some(vec![home("Rua A")]), SourceSystem::Vitai, at("2024-01-01")),
            Candidate::new(Some(vec![home("Rua B")]), SourceSystem::Smsrio, at("2023-01-01")),
        ];
        let value = resolver
            .resolve_list(PatientField::Addresses, &candidates)
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, vec![home("Rua B")]);
    }

    #[test]
    fn test_identical_lists_resolve_without_duplicates() {
        let policy = RankingPolicy::new("lists");
        let registry = FieldRegistry::standard();
        let resolver = FieldResolver::new(&policy, &registry);
        let phone = Telecom {
            system: Some("phone".to_string()),
            value: Some("21999".to_string()),
            ..Telecom::default()
        };
        let doubled = vec![phone.clone(), phone.clone()];

        let one = vec![Candidate::new(Some(doubled.clone()), SourceSystem::Vitai, at("2024-01-01"))];
        let resolution = resolver.resolve_list(PatientField::Telecoms, &one).unwrap();
        assert_eq!(resolution, Resolution::Unanimous(vec![phone.clone()]));

        let two = vec![
            Candidate::new(Some(doubled.clone()), SourceSystem::Vitai, at("2024-01-01")),
            Candidate::new(Some(doubled), SourceSystem::Smsrio, at("2024-01-02")),
        ];
        let resolution = resolver.resolve_list(PatientField::Telecoms, &two).unwrap();
        assert_eq!(resolution, Resolution::Unanimous(vec![phone]));
    }

    #[test]
    fn test_replace_winner_list_is_deduplicated() {
        let policy = RankingPolicy::new("lists")
            .with_rank(PatientField::Cns, SourceSystem::Vitai, 1)
            .with_rank(PatientField::Cns, SourceSystem::Smsrio, 2);
        let registry = FieldRegistry::standard()
            .with(PatientField::Cns, MergeStrategy::Replace)
            .unwrap();
        let resolver = FieldResolver::new(&policy, &registry);
        let candidates = vec![
            Candidate::new(
                Some(vec![CnsEntry::new("111", true), CnsEntry::new("111", false)]),
                SourceSystem::Vitai,
                at("2024-01-01"),
            ),
            Candidate::new(Some(vec![CnsEntry::new("222", false)]), SourceSystem::Smsrio, at("2024-01-01")),
        ];
        let value = resolver
            .resolve_list(PatientField::Cns, &candidates)
            .unwrap()
            .into_value()
            .unwrap();
        assert_eq!(value, vec![CnsEntry::new("111", true)]);
    }
}
