//! Per-field merge rules for [`StateRecord`](crate::state::StateRecord).
//!
//! Every state field has exactly one entry in [`REDUCER_TABLE`]. The table is
//! checked for completeness and type compatibility by [`validate_table`],
//! which the graph builder calls before compiling, so an incomplete table is a
//! build-time error rather than a merge-time one.
//!
//! All reducers are total: an empty value on either side is the identity.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

use crate::error::{FingraphError, Result};
use crate::types::TokenUsage;

/// Every field of the state record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    TransactionId,
    SessionId,
    Query,
    CreatedAt,
    Symbols,
    ResearchData,
    AnalystData,
    EdgarData,
    ComparisonData,
    TrendAnalysis,
    Report,
    QueryType,
    IntentFlags,
    Entities,
    Errors,
    Citations,
    TokenUsage,
    UpdatedAt,
}

/// Shape of a field's value, used to check reducer compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Set once; empty string / empty list / unset timestamp means "not yet set".
    Scalar,
    Map,
    Optional,
    Messages,
    Citations,
    Counters,
    Timestamp,
}

impl FieldName {
    pub const ALL: [FieldName; 18] = [
        FieldName::TransactionId,
        FieldName::SessionId,
        FieldName::Query,
        FieldName::CreatedAt,
        FieldName::Symbols,
        FieldName::ResearchData,
        FieldName::AnalystData,
        FieldName::EdgarData,
        FieldName::ComparisonData,
        FieldName::TrendAnalysis,
        FieldName::Report,
        FieldName::QueryType,
        FieldName::IntentFlags,
        FieldName::Entities,
        FieldName::Errors,
        FieldName::Citations,
        FieldName::TokenUsage,
        FieldName::UpdatedAt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransactionId => "transaction_id",
            Self::SessionId => "session_id",
            Self::Query => "query",
            Self::CreatedAt => "created_at",
            Self::Symbols => "symbols",
            Self::ResearchData => "research_data",
            Self::AnalystData => "analyst_data",
            Self::EdgarData => "edgar_data",
            Self::ComparisonData => "comparison_data",
            Self::TrendAnalysis => "trend_analysis",
            Self::Report => "report",
            Self::QueryType => "query_type",
            Self::IntentFlags => "intent_flags",
            Self::Entities => "entities",
            Self::Errors => "errors",
            Self::Citations => "citations",
            Self::TokenUsage => "token_usage",
            Self::UpdatedAt => "updated_at",
        }
    }

    /// Resolve a field by name. Unknown names are a configuration error.
    pub fn parse(name: &str) -> Result<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.as_str() == name)
            .ok_or_else(|| {
                FingraphError::MergeConflict(format!("undeclared state field '{}'", name))
            })
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Self::TransactionId | Self::SessionId | Self::Query | Self::Symbols => {
                ValueKind::Scalar
            }
            Self::CreatedAt | Self::UpdatedAt => ValueKind::Timestamp,
            Self::ResearchData
            | Self::AnalystData
            | Self::EdgarData
            | Self::ComparisonData
            | Self::TrendAnalysis
            | Self::IntentFlags
            | Self::Entities => ValueKind::Map,
            Self::Report | Self::QueryType => ValueKind::Optional,
            Self::Errors => ValueKind::Messages,
            Self::Citations => ValueKind::Citations,
            Self::TokenUsage => ValueKind::Counters,
        }
    }

    /// Fields that must never change once set.
    pub fn is_write_once(&self) -> bool {
        matches!(
            self,
            Self::TransactionId | Self::SessionId | Self::Query | Self::CreatedAt | Self::Symbols
        )
    }
}

impl fmt::Display for FieldName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conflict-resolution rule for one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    /// Keep the left value unless it is empty. Order-sensitive.
    FirstNonEmpty,
    /// Union of keys; right overwrites matching keys.
    DictMerge,
    /// Right wins when set; an unset right never clears the left.
    PreferNonNull,
    /// Order-preserving append, skipping duplicates.
    AppendDedup,
    /// Order-preserving append, deduplicated by an identity key.
    AppendDedupByKey,
    /// Numeric field-by-field sum per key.
    SumPerKey,
    /// Later of the two timestamps.
    Latest,
}

impl Reducer {
    pub fn accepts(&self, kind: ValueKind) -> bool {
        match self {
            Self::FirstNonEmpty => matches!(
                kind,
                ValueKind::Scalar | ValueKind::Optional | ValueKind::Timestamp
            ),
            Self::PreferNonNull => matches!(
                kind,
                ValueKind::Scalar | ValueKind::Optional | ValueKind::Timestamp
            ),
            Self::DictMerge => matches!(kind, ValueKind::Map),
            Self::AppendDedup => matches!(kind, ValueKind::Messages),
            Self::AppendDedupByKey => matches!(kind, ValueKind::Citations),
            Self::SumPerKey => matches!(kind, ValueKind::Counters),
            Self::Latest => matches!(kind, ValueKind::Timestamp),
        }
    }

    /// Whether `merge(a, b)` may differ from `merge(b, a)` for disjoint inputs.
    pub fn is_order_sensitive(&self) -> bool {
        matches!(self, Self::FirstNonEmpty | Self::PreferNonNull)
    }
}

/// The field-to-reducer table used by every state merge.
pub const REDUCER_TABLE: &[(FieldName, Reducer)] = &[
    (FieldName::TransactionId, Reducer::FirstNonEmpty),
    (FieldName::SessionId, Reducer::FirstNonEmpty),
    (FieldName::Query, Reducer::FirstNonEmpty),
    (FieldName::CreatedAt, Reducer::FirstNonEmpty),
    (FieldName::Symbols, Reducer::FirstNonEmpty),
    (FieldName::ResearchData, Reducer::DictMerge),
    (FieldName::AnalystData, Reducer::DictMerge),
    (FieldName::EdgarData, Reducer::DictMerge),
    (FieldName::ComparisonData, Reducer::DictMerge),
    (FieldName::TrendAnalysis, Reducer::DictMerge),
    (FieldName::Report, Reducer::PreferNonNull),
    (FieldName::QueryType, Reducer::PreferNonNull),
    (FieldName::IntentFlags, Reducer::DictMerge),
    (FieldName::Entities, Reducer::DictMerge),
    (FieldName::Errors, Reducer::AppendDedup),
    (FieldName::Citations, Reducer::AppendDedupByKey),
    (FieldName::TokenUsage, Reducer::SumPerKey),
    (FieldName::UpdatedAt, Reducer::Latest),
];

/// Look up the reducer for a field in the built-in table.
pub fn reducer_for(field: FieldName) -> Option<Reducer> {
    REDUCER_TABLE
        .iter()
        .find(|(f, _)| *f == field)
        .map(|(_, r)| *r)
}

/// Check that `table` names every field exactly once with a compatible reducer.
pub fn validate_table(table: &[(FieldName, Reducer)]) -> Result<()> {
    let mut seen = HashSet::new();
    for (field, reducer) in table {
        if !seen.insert(*field) {
            return Err(FingraphError::MergeConflict(format!(
                "field '{}' has more than one reducer",
                field
            )));
        }
        if !reducer.accepts(field.kind()) {
            return Err(FingraphError::MergeConflict(format!(
                "reducer {:?} cannot merge field '{}' ({:?})",
                reducer,
                field,
                field.kind()
            )));
        }
    }

    let missing: Vec<&str> = FieldName::ALL
        .iter()
        .filter(|f| !seen.contains(*f))
        .map(|f| f.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(FingraphError::MergeConflict(format!(
            "no reducer declared for field(s): {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Values that have a distinguished "not yet set" state.
pub trait Emptiness {
    fn is_unset(&self) -> bool;
}

impl Emptiness for String {
    fn is_unset(&self) -> bool {
        self.trim().is_empty()
    }
}

impl<T> Emptiness for Vec<T> {
    fn is_unset(&self) -> bool {
        self.is_empty()
    }
}

impl<T> Emptiness for Option<T> {
    fn is_unset(&self) -> bool {
        self.is_none()
    }
}

/// Outcome of a single-field reduction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduced {
    Kept,
    Updated,
    /// Right tried to replace a set write-once value with a different one.
    Rejected,
}

/// Keep `left` unless it is unset; report an attempted overwrite.
pub fn first_non_empty<T: Emptiness + Clone + PartialEq>(left: &mut T, right: &T) -> Reduced {
    if right.is_unset() {
        return Reduced::Kept;
    }
    if left.is_unset() {
        *left = right.clone();
        return Reduced::Updated;
    }
    if left != right {
        Reduced::Rejected
    } else {
        Reduced::Kept
    }
}

/// Replace `left` with `right` unless `right` is unset.
pub fn prefer_non_null<T: Emptiness + Clone>(left: &mut T, right: &T) -> Reduced {
    if right.is_unset() {
        Reduced::Kept
    } else {
        *left = right.clone();
        Reduced::Updated
    }
}

pub fn dict_merge<V: Clone>(left: &mut BTreeMap<String, V>, right: &BTreeMap<String, V>) -> Reduced {
    if right.is_empty() {
        return Reduced::Kept;
    }
    for (k, v) in right {
        left.insert(k.clone(), v.clone());
    }
    Reduced::Updated
}

pub fn append_dedup(left: &mut Vec<String>, right: &[String]) -> Reduced {
    append_dedup_by(left, right, |s| s.clone())
}

/// Append the items of `right` whose key is not already present, keeping order.
pub fn append_dedup_by<T, K, F>(left: &mut Vec<T>, right: &[T], key: F) -> Reduced
where
    T: Clone,
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen: HashSet<K> = left.iter().map(&key).collect();
    let mut changed = false;
    for item in right {
        if seen.insert(key(item)) {
            left.push(item.clone());
            changed = true;
        }
    }
    if changed {
        Reduced::Updated
    } else {
        Reduced::Kept
    }
}

pub fn sum_per_key(
    left: &mut BTreeMap<String, TokenUsage>,
    right: &BTreeMap<String, TokenUsage>,
) -> Reduced {
    if right.is_empty() {
        return Reduced::Kept;
    }
    for (stage, usage) in right {
        left.entry(stage.clone()).or_default().add(usage);
    }
    Reduced::Updated
}

pub fn latest<T: Ord + Clone>(left: &mut Option<T>, right: &Option<T>) -> Reduced {
    match (left.as_ref(), right.as_ref()) {
        (_, None) => Reduced::Kept,
        (Some(l), Some(r)) if l >= r => Reduced::Kept,
        _ => {
            *left = right.clone();
            Reduced::Updated
        }
    }
}
