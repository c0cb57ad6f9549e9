use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FingraphError, Result};
use crate::reducer::{self, FieldName, Reduced, Reducer, REDUCER_TABLE};
use crate::types::{Citation, IntentFlags, QueryType, Status, TokenUsage, TransactionId};

/// Prefix carried by every fatal error message placed in `errors`.
pub const FATAL_PREFIX: &str = "Fatal:";

/// Symbol-keyed (or result-kind-keyed) data written by a stage.
pub type DataMap = BTreeMap<String, serde_json::Value>;

/// The unit of shared context threaded through every stage.
///
/// Collections are never null: a default record has every collection empty,
/// which makes it the identity element for [`StateRecord::merge`].
/// Unknown keys are rejected when deserializing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateRecord {
    #[serde(default)]
    pub transaction_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub symbols: Vec<String>,

    #[serde(default)]
    pub research_data: DataMap,
    #[serde(default)]
    pub analyst_data: DataMap,
    #[serde(default)]
    pub edgar_data: DataMap,
    #[serde(default)]
    pub comparison_data: DataMap,
    #[serde(default)]
    pub trend_analysis: DataMap,
    #[serde(default)]
    pub report: Option<String>,

    #[serde(default)]
    pub query_type: Option<QueryType>,
    #[serde(default)]
    pub intent_flags: BTreeMap<String, bool>,
    #[serde(default)]
    pub entities: DataMap,

    #[serde(default)]
    pub errors: Vec<String>,
    #[serde(default)]
    pub citations: Vec<Citation>,
    #[serde(default)]
    pub token_usage: BTreeMap<String, TokenUsage>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Fields a merge refused to overwrite.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    pub rejected: Vec<FieldName>,
}

impl MergeReport {
    pub fn is_clean(&self) -> bool {
        self.rejected.is_empty()
    }
}

impl StateRecord {
    /// Create a record for a new request with a fresh transaction id.
    pub fn new(session_id: impl Into<String>, query: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            transaction_id: TransactionId::new().0,
            session_id: session_id.into(),
            query: query.into(),
            created_at: Some(now),
            updated_at: Some(now),
            ..Default::default()
        }
    }

    pub fn with_symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn with_transaction_id(mut self, id: impl Into<String>) -> Self {
        self.transaction_id = id.into();
        self
    }

    /// Pre-classify the record, as an upstream API layer might.
    pub fn with_classification(mut self, query_type: QueryType, flags: IntentFlags) -> Self {
        self.query_type = Some(query_type);
        self.intent_flags = flags.to_map();
        self
    }

    /// Build a record from a JSON object, rejecting unknown keys.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Check the fields every stage depends on.
    pub fn validate_required(&self) -> Result<()> {
        let missing: Vec<&str> = [
            (FieldName::TransactionId, &self.transaction_id),
            (FieldName::SessionId, &self.session_id),
            (FieldName::Query, &self.query),
        ]
        .iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(f, _)| f.as_str())
        .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(FingraphError::Validation(format!(
                "missing required state field(s): {}",
                missing.join(", ")
            )))
        }
    }

    /// Merge `other` into `self` using the reducer table.
    ///
    /// Write-once fields that `other` tries to change are left untouched and
    /// reported in the returned [`MergeReport`].
    pub fn merge(&mut self, other: &StateRecord) -> MergeReport {
        let mut report = MergeReport::default();
        for &(field, rule) in REDUCER_TABLE {
            if self.merge_field(field, rule, other) == Reduced::Rejected {
                report.rejected.push(field);
            }
        }
        report
    }

    fn merge_field(&mut self, field: FieldName, rule: Reducer, other: &StateRecord) -> Reduced {
        use FieldName as F;
        match field {
            F::TransactionId => scalar(rule, &mut self.transaction_id, &other.transaction_id),
            F::SessionId => scalar(rule, &mut self.session_id, &other.session_id),
            F::Query => scalar(rule, &mut self.query, &other.query),
            F::Symbols => scalar(rule, &mut self.symbols, &other.symbols),
            F::CreatedAt => timestamp(rule, &mut self.created_at, &other.created_at),
            F::UpdatedAt => timestamp(rule, &mut self.updated_at, &other.updated_at),
            F::ResearchData => reducer::dict_merge(&mut self.research_data, &other.research_data),
            F::AnalystData => reducer::dict_merge(&mut self.analyst_data, &other.analyst_data),
            F::EdgarData => reducer::dict_merge(&mut self.edgar_data, &other.edgar_data),
            F::ComparisonData => {
                reducer::dict_merge(&mut self.comparison_data, &other.comparison_data)
            }
            F::TrendAnalysis => reducer::dict_merge(&mut self.trend_analysis, &other.trend_analysis),
            F::IntentFlags => reducer::dict_merge(&mut self.intent_flags, &other.intent_flags),
            F::Entities => reducer::dict_merge(&mut self.entities, &other.entities),
            F::Report => scalar(rule, &mut self.report, &other.report),
            F::QueryType => scalar(rule, &mut self.query_type, &other.query_type),
            F::Errors => reducer::append_dedup(&mut self.errors, &other.errors),
            F::Citations => {
                reducer::append_dedup_by(&mut self.citations, &other.citations, citation_key)
            }
            F::TokenUsage => reducer::sum_per_key(&mut self.token_usage, &other.token_usage),
        }
    }

    /// Copy of this record that only carries one symbol, for per-symbol fan-out.
    pub fn scoped_to_symbol(&self, symbol: &str) -> Self {
        let mut scoped = self.clone();
        scoped.symbols = vec![symbol.to_string()];
        scoped
    }

    /// Append an error message unless an identical one is already recorded.
    pub fn push_error(&mut self, message: impl Into<String>) {
        reducer::append_dedup(&mut self.errors, &[message.into()]);
    }

    /// Append a fatal error.
    pub fn push_fatal(&mut self, err: &FingraphError) {
        let message = err.to_string();
        if message.starts_with(FATAL_PREFIX) {
            self.push_error(message);
        } else {
            self.push_error(format!("{} {}", FATAL_PREFIX, message));
        }
    }

    pub fn add_citation(&mut self, citation: Citation) {
        reducer::append_dedup_by(&mut self.citations, &[citation], citation_key);
    }

    /// Add the counts of one model call made by `stage`.
    pub fn record_tokens(&mut self, stage: &str, prompt_tokens: u64, completion_tokens: u64) {
        self.token_usage
            .entry(stage.to_string())
            .or_default()
            .record(prompt_tokens, completion_tokens);
    }

    pub fn total_tokens(&self) -> u64 {
        self.token_usage.values().fold(0u64, |acc, u| acc.saturating_add(u.total_tokens))
    }

    /// Bump `updated_at` to now, never moving it backwards.
    pub fn touch(&mut self) {
        reducer::latest(&mut self.updated_at, &Some(Utc::now()));
    }

    pub fn intent(&self) -> IntentFlags {
        IntentFlags::from_map(&self.intent_flags)
    }

    /// Whether an upstream caller already supplied routing information.
    pub fn is_classified(&self) -> bool {
        self.query_type.is_some() && !self.intent_flags.is_empty()
    }

    pub fn is_aborted(&self) -> bool {
        self.errors.iter().any(|e| e.starts_with(FATAL_PREFIX))
    }

    pub fn status(&self) -> Status {
        if self.is_aborted() {
            Status::Aborted
        } else if self.errors.is_empty() {
            Status::Completed
        } else {
            Status::CompletedWithErrors
        }
    }
}

fn citation_key(c: &Citation) -> (String, String, String) {
    let (source, symbol, kind) = c.key();
    (source.to_string(), symbol.to_string(), kind.to_string())
}

fn scalar<T: reducer::Emptiness + Clone + PartialEq>(
    rule: Reducer,
    left: &mut T,
    right: &T,
) -> Reduced {
    match rule {
        Reducer::PreferNonNull => reducer::prefer_non_null(left, right),
        _ => reducer::first_non_empty(left, right),
    }
}

fn timestamp(
    rule: Reducer,
    left: &mut Option<DateTime<Utc>>,
    right: &Option<DateTime<Utc>>,
) -> Reduced {
    match rule {
        Reducer::Latest => reducer::latest(left, right),
        Reducer::PreferNonNull => reducer::prefer_non_null(left, right),
        _ => reducer::first_non_empty(left, right),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> StateRecord {
        let mut s = StateRecord::new("sess-1", "Analyze AAPL")
            .with_transaction_id("tx-1")
            .with_symbols(vec!["AAPL".into()]);
        s.research_data.insert("AAPL".into(), json!({"price": {"current": 190.1}}));
        s.report = Some("# AAPL".into());
        s.query_type = Some(QueryType::SingleEntity);
        s.intent_flags.insert("is_single_entity".into(), true);
        s.entities.insert("timeframe".into(), json!("last year"));
        s.push_error("AnalystAgent: timeout");
        s.add_citation(Citation::new("Yahoo Finance", "AAPL", "price_data"));
        s.record_tokens("AnalystAgent", 80, 20);
        s
    }

    #[test]
    fn new_record_has_empty_collections() {
        let s = StateRecord::new("sess", "q");
        assert!(!s.transaction_id.is_empty());
        assert!(s.research_data.is_empty());
        assert!(s.errors.is_empty());
        assert!(s.report.is_none());
        assert_eq!(s.created_at, s.updated_at);
        assert_eq!(s.status(), Status::Completed);
    }

    #[test]
    fn merge_with_empty_is_identity() {
        let x = sample();

        let mut left = StateRecord::default();
        assert!(left.merge(&x).is_clean());
        assert_eq!(left, x);

        let mut right = x.clone();
        assert!(right.merge(&StateRecord::default()).is_clean());
        assert_eq!(right, x);
    }

    #[test]
    fn disjoint_symbol_maps_commute() {
        let base = StateRecord::new("s", "q").with_transaction_id("tx");
        let mut a = base.clone();
        a.research_data.insert("AAPL".into(), json!({"price": 1}));
        a.analyst_data.insert("AAPL".into(), json!({"sentiment": "up"}));
        a.trend_analysis.insert("AAPL".into(), json!({"trend": "up"}));
        a.comparison_data.insert("metrics".into(), json!({"pe": 30}));
        let mut b = base.clone();
        b.research_data.insert("MSFT".into(), json!({"price": 2}));
        b.analyst_data.insert("MSFT".into(), json!({"sentiment": "flat"}));
        b.trend_analysis.insert("MSFT".into(), json!({"trend": "flat"}));
        b.comparison_data.insert("insights".into(), json!(["x"]));

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab.research_data, ba.research_data);
        assert_eq!(ab.analyst_data, ba.analyst_data);
        assert_eq!(ab.trend_analysis, ba.trend_analysis);
        assert_eq!(ab.comparison_data, ba.comparison_data);
        assert_eq!(ab.research_data.len(), 2);
    }

    #[test]
    fn duplicate_citation_is_kept_once() {
        let mut a = StateRecord::default();
        a.add_citation(Citation::new("Yahoo Finance", "AAPL", "price_data"));
        let mut b = StateRecord::default();
        b.add_citation(
            Citation::new("Yahoo Finance", "AAPL", "price_data").with_url("https://example.com"),
        );
        a.merge(&b);
        assert_eq!(a.citations.len(), 1);
    }

    #[test]
    fn token_usage_is_summed() {
        let mut a = StateRecord::default();
        a.token_usage.insert(
            "AnalystAgent".into(),
            TokenUsage {
                total_tokens: 100,
                ..Default::default()
            },
        );
        let mut b = StateRecord::default();
        b.token_usage.insert(
            "AnalystAgent".into(),
            TokenUsage {
                total_tokens: 50,
                ..Default::default()
            },
        );
        a.merge(&b);
        assert_eq!(a.token_usage["AnalystAgent"].total_tokens, 150);
        assert_eq!(a.total_tokens(), 150);
    }

    #[test]
    fn write_once_fields_reject_overwrite() {
        let mut a = sample();
        let mut b = a.clone();
        b.query = "something else".into();
        b.symbols = vec!["TSLA".into()];
        let report = a.merge(&b);
        assert_eq!(report.rejected, vec![FieldName::Query, FieldName::Symbols]);
        assert_eq!(a.query, "Analyze AAPL");
        assert_eq!(a.symbols, vec!["AAPL"]);
    }

    #[test]
    fn report_is_not_cleared_by_null() {
        let mut a = sample();
        let mut b = a.clone();
        b.report = None;
        a.merge(&b);
        assert_eq!(a.report.as_deref(), Some("# AAPL"));
    }

    #[test]
    fn updated_at_takes_latest() {
        let mut a = sample();
        let mut b = a.clone();
        let later = a.updated_at.unwrap() + chrono::Duration::seconds(30);
        b.updated_at = Some(later);
        a.merge(&b);
        assert_eq!(a.updated_at, Some(later));

        let mut c = a.clone();
        c.updated_at = Some(later - chrono::Duration::seconds(120));
        a.merge(&c);
        assert_eq!(a.updated_at, Some(later));
    }

    #[test]
    fn validate_required_names_missing_fields() {
        let s = StateRecord::new("sess", "");
        let err = s.validate_required().unwrap_err();
        assert!(err.is_fatal());
        assert!(err.to_string().contains("query"));

        let s = StateRecord::default();
        let msg = s.validate_required().unwrap_err().to_string();
        assert!(msg.contains("transaction_id"));
        assert!(msg.contains("session_id"));
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = StateRecord::from_json(json!({"query": "q", "stock_price": 1}));
        assert!(err.is_err());
        let ok = StateRecord::from_json(json!({"query": "q", "symbols": ["AAPL"]})).unwrap();
        assert_eq!(ok.symbols, vec!["AAPL"]);
        assert!(ok.errors.is_empty());
    }

    #[test]
    fn status_reflects_errors() {
        let mut s = StateRecord::new("s", "q");
        assert_eq!(s.status(), Status::Completed);
        s.push_error("ResearchAgent: boom");
        assert_eq!(s.status(), Status::CompletedWithErrors);
        s.push_fatal(&FingraphError::Validation("missing query".into()));
        assert_eq!(s.status(), Status::Aborted);
        assert!(s.errors.last().unwrap().starts_with(FATAL_PREFIX));
    }

    #[test]
    fn push_error_dedups() {
        let mut s = StateRecord::default();
        s.push_error("x");
        s.push_error("x");
        assert_eq!(s.errors.len(), 1);
    }
}
