use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one pipeline execution.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct TransactionId(pub String);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A source attribution attached by a stage.
///
/// Two citations are the same entry when `(source, symbol, kind)` match,
/// regardless of the remaining fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub source: String,
    #[serde(default)]
    pub symbol: String,
    #[serde(rename = "type", alias = "kind")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl Citation {
    pub fn new(
        source: impl Into<String>,
        symbol: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            symbol: symbol.into(),
            kind: kind.into(),
            url: None,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Deduplication key.
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.source, &self.symbol, &self.kind)
    }
}

/// Token counters for one stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, alias = "prompt")]
    pub prompt_tokens: u64,
    #[serde(default, alias = "completion")]
    pub completion_tokens: u64,
    #[serde(default, alias = "total")]
    pub total_tokens: u64,
}

impl TokenUsage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
        }
    }

    /// Add the counts of one model call.
    pub fn record(&mut self, prompt_tokens: u64, completion_tokens: u64) {
        self.add(&TokenUsage::new(prompt_tokens, completion_tokens));
    }

    /// Field-by-field sum, saturating at `u64::MAX`.
    pub fn add(&mut self, other: &TokenUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self.completion_tokens.saturating_add(other.completion_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
    }
}

/// Primary query category chosen by the intent classifier.
///
/// Derived from the intent flags in fixed priority order:
/// filing > comparison > trend > comprehensive > single entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    SingleEntity,
    Comparison,
    ComprehensiveComparison,
    Trend,
    ComprehensiveTrend,
    ComprehensiveAnalysis,
    FilingAnalysis,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SingleEntity => "single_entity",
            Self::Comparison => "comparison",
            Self::ComprehensiveComparison => "comprehensive_comparison",
            Self::Trend => "trend",
            Self::ComprehensiveTrend => "comprehensive_trend",
            Self::ComprehensiveAnalysis => "comprehensive_analysis",
            Self::FilingAnalysis => "filing_analysis",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "single_entity" => Some(Self::SingleEntity),
            "comparison" => Some(Self::Comparison),
            "comprehensive_comparison" => Some(Self::ComprehensiveComparison),
            "trend" => Some(Self::Trend),
            "comprehensive_trend" => Some(Self::ComprehensiveTrend),
            "comprehensive_analysis" => Some(Self::ComprehensiveAnalysis),
            "filing_analysis" => Some(Self::FilingAnalysis),
            _ => None,
        }
    }
}

impl fmt::Display for QueryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Non-exclusive routing flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentFlags {
    #[serde(default)]
    pub is_comparison: bool,
    #[serde(default)]
    pub is_trend: bool,
    #[serde(default)]
    pub is_edgar: bool,
    #[serde(default)]
    pub is_comprehensive: bool,
    #[serde(default)]
    pub is_metric_query: bool,
    #[serde(default)]
    pub is_single_entity: bool,
    #[serde(default)]
    pub is_multi_entity: bool,
}

impl IntentFlags {
    pub const KEYS: [&'static str; 7] = [
        "is_comparison",
        "is_trend",
        "is_edgar",
        "is_comprehensive",
        "is_metric_query",
        "is_single_entity",
        "is_multi_entity",
    ];

    /// Set the entity-count flags. They are mutually exclusive.
    pub fn with_symbol_count(mut self, count: usize) -> Self {
        self.is_single_entity = count == 1;
        self.is_multi_entity = count > 1;
        self
    }

    pub fn get(&self, key: &str) -> Option<bool> {
        match key {
            "is_comparison" => Some(self.is_comparison),
            "is_trend" => Some(self.is_trend),
            "is_edgar" => Some(self.is_edgar),
            "is_comprehensive" => Some(self.is_comprehensive),
            "is_metric_query" => Some(self.is_metric_query),
            "is_single_entity" => Some(self.is_single_entity),
            "is_multi_entity" => Some(self.is_multi_entity),
            _ => None,
        }
    }

    /// Raise every flag that is true in `other`. Never clears a flag.
    pub fn raise(&mut self, other: &IntentFlags) {
        self.is_comparison |= other.is_comparison;
        self.is_trend |= other.is_trend;
        self.is_edgar |= other.is_edgar;
        self.is_comprehensive |= other.is_comprehensive;
        self.is_metric_query |= other.is_metric_query;
        self.is_single_entity |= other.is_single_entity;
        self.is_multi_entity |= other.is_multi_entity;
    }

    pub fn to_map(&self) -> BTreeMap<String, bool> {
        Self::KEYS
            .iter()
            .filter_map(|k| self.get(k).map(|v| (k.to_string(), v)))
            .collect()
    }

    /// Read known flags from a state map; unknown keys are ignored.
    pub fn from_map(map: &BTreeMap<String, bool>) -> Self {
        let flag = |k: &str| map.get(k).copied().unwrap_or(false);
        Self {
            is_comparison: flag("is_comparison"),
            is_trend: flag("is_trend"),
            is_edgar: flag("is_edgar"),
            is_comprehensive: flag("is_comprehensive"),
            is_metric_query: flag("is_metric_query"),
            is_single_entity: flag("is_single_entity"),
            is_multi_entity: flag("is_multi_entity"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    High,
    #[default]
    Medium,
    Low,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionMethod {
    Model,
    Regex,
    #[default]
    None,
}

/// Fine-grained intent reported by a query parser.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    #[default]
    Analysis,
    Metric,
    Comparison,
    ComprehensiveComparison,
    Trend,
    ComprehensiveTrend,
    ComprehensiveAnalysis,
    FilingAnalysis,
}

/// Result of parsing a free-text query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedQuery {
    pub symbols: Vec<String>,
    pub intent_type: IntentType,
    pub intent_flags: IntentFlags,
    #[serde(default)]
    pub entities: BTreeMap<String, serde_json::Value>,
    pub confidence: Confidence,
    pub needs_clarification: bool,
    #[serde(default)]
    pub clarification_question: Option<String>,
    pub extraction_method: ExtractionMethod,
    #[serde(default)]
    pub reasoning: String,
}

/// Output of the intent classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub query_type: QueryType,
    pub intent_flags: IntentFlags,
    pub symbols: Vec<String>,
}

/// Adjustments proposed by a non-deterministic refinement pass.
///
/// Only flags set to `true` in `raise_flags` are applied; a refinement cannot
/// clear a flag the rule-based pass raised.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Refinement {
    #[serde(default)]
    pub query_type: Option<QueryType>,
    #[serde(default)]
    pub raise_flags: IntentFlags,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// Caller-facing outcome of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Completed,
    CompletedWithErrors,
    Aborted,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Completed => "completed",
            Self::CompletedWithErrors => "completed_with_errors",
            Self::Aborted => "aborted",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_record_accumulates() {
        let mut usage = TokenUsage::default();
        usage.record(100, 20);
        usage.record(10, 5);
        assert_eq!(usage, TokenUsage::new(110, 25));
        assert_eq!(usage.total_tokens, 135);
    }

    #[test]
    fn token_usage_saturates_instead_of_overflowing() {
        let mut usage = TokenUsage::new(u64::MAX - 1, 0);
        usage.record(5, 3);
        assert_eq!(usage.prompt_tokens, u64::MAX);
        assert_eq!(usage.completion_tokens, 3);
        assert_eq!(usage.total_tokens, u64::MAX);

        usage.add(&TokenUsage::new(u64::MAX, u64::MAX));
        assert_eq!(usage, TokenUsage {
            prompt_tokens: u64::MAX,
            completion_tokens: u64::MAX,
            total_tokens: u64::MAX,
        });
    }

    #[test]
    fn token_usage_accepts_short_field_names() {
        let usage: TokenUsage = serde_json::from_str(r#"{"total": 100}"#).unwrap();
        assert_eq!(usage.total_tokens, 100);
        assert_eq!(usage.prompt_tokens, 0);
    }

    #[test]
    fn citation_serializes_kind_as_type() {
        let c = Citation::new("Yahoo Finance", "AAPL", "price_data");
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["type"], "price_data");
        let back: Citation = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn query_type_parse_matches_display() {
        for qt in [
            QueryType::SingleEntity,
            QueryType::Comparison,
            QueryType::ComprehensiveComparison,
            QueryType::Trend,
            QueryType::ComprehensiveTrend,
            QueryType::ComprehensiveAnalysis,
            QueryType::FilingAnalysis,
        ] {
            assert_eq!(QueryType::parse(&qt.to_string()), Some(qt));
        }
        assert_eq!(QueryType::parse("nonsense"), None);
    }

    #[test]
    fn intent_flags_map_conversion() {
        let flags = IntentFlags {
            is_comparison: true,
            is_trend: true,
            ..Default::default()
        }
        .with_symbol_count(2);

        let map = flags.to_map();
        assert_eq!(map.len(), IntentFlags::KEYS.len());
        assert_eq!(map["is_multi_entity"], true);
        assert_eq!(map["is_single_entity"], false);
        assert_eq!(IntentFlags::from_map(&map), flags);
    }

    #[test]
    fn raise_never_clears() {
        let mut flags = IntentFlags {
            is_edgar: true,
            ..Default::default()
        };
        flags.raise(&IntentFlags {
            is_trend: true,
            ..Default::default()
        });
        assert!(flags.is_edgar);
        assert!(flags.is_trend);
    }
}
