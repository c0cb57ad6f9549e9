use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, warn};

use fingraph_core::reducer::{self, FieldName};
use fingraph_core::state::{DataMap, MergeReport, StateRecord};
use fingraph_core::types::{Citation, TokenUsage};

/// Combines the outputs of parallel branches into one state.
///
/// Per-symbol maps keep the more complete entry when two branches wrote the
/// same symbol; everything else follows the state reducer table.
pub struct ContextMerger;

impl ContextMerger {
    /// Fold branch outputs into `base`, in the order given.
    ///
    /// Each branch started from a copy of `base`, so only what it added over
    /// `base` is merged. Per-symbol scoping of `symbols` is undone here.
    pub fn merge_branches(base: &StateRecord, branches: &[StateRecord]) -> StateRecord {
        let mut merged = base.clone();
        for branch in branches {
            let delta = Self::delta(base, branch);
            Self::merge_into(&mut merged, &delta);
        }
        debug!(branches = branches.len(), "Merged branch outputs");
        merged
    }

    /// Fold independent states together, starting from an empty record.
    pub fn merge_all(states: &[StateRecord]) -> StateRecord {
        let mut merged = StateRecord::default();
        for state in states {
            Self::merge_into(&mut merged, state);
        }
        merged
    }

    /// Merge one state into `target`.
    ///
    /// Rejected write-once overwrites are logged and recorded in `errors`.
    pub fn merge_into(target: &mut StateRecord, incoming: &StateRecord) -> MergeReport {
        let mut incoming = incoming.clone();
        for (into, from) in [
            (&mut target.research_data, &mut incoming.research_data),
            (&mut target.analyst_data, &mut incoming.analyst_data),
            (&mut target.edgar_data, &mut incoming.edgar_data),
            (&mut target.trend_analysis, &mut incoming.trend_analysis),
        ] {
            Self::merge_symbol_data(into, from);
            from.clear();
        }

        let report = target.merge(&incoming);
        for field in &report.rejected {
            warn!(field = field.as_str(), "Ignored overwrite of write-once field during merge");
            target.push_error(format!(
                "Merge: ignored attempt to overwrite write-once field '{}'",
                field.as_str()
            ));
        }
        report
    }

    /// Merge symbol-keyed data; on a shared key the more complete value wins,
    /// and a tie goes to `incoming`.
    pub fn merge_symbol_data(target: &mut DataMap, incoming: &DataMap) {
        for (symbol, value) in incoming {
            match target.get(symbol) {
                Some(existing) if completeness(existing) > completeness(value) => {
                    debug!(symbol = %symbol, "Kept more complete existing entry");
                }
                _ => {
                    target.insert(symbol.clone(), value.clone());
                }
            }
        }
    }

    /// Union of citations across states, first occurrence wins.
    pub fn merge_citations(states: &[StateRecord]) -> Vec<Citation> {
        let mut out = Vec::new();
        for state in states {
            reducer::append_dedup_by(&mut out, &state.citations, |c: &Citation| {
                let (source, symbol, kind) = c.key();
                (source.to_string(), symbol.to_string(), kind.to_string())
            });
        }
        out
    }

    /// Errors across states, order preserved, duplicates removed.
    pub fn merge_errors(states: &[StateRecord]) -> Vec<String> {
        let mut out = Vec::new();
        for state in states {
            reducer::append_dedup(&mut out, &state.errors);
        }
        out
    }

    /// Per-stage token usage summed across states.
    pub fn merge_token_usage(states: &[StateRecord]) -> BTreeMap<String, TokenUsage> {
        let mut out = BTreeMap::new();
        for state in states {
            reducer::sum_per_key(&mut out, &state.token_usage);
        }
        out
    }

    /// What `branch` added on top of `base`.
    fn delta(base: &StateRecord, branch: &StateRecord) -> StateRecord {
        let mut delta = branch.clone();
        if !base.symbols.is_empty() {
            delta.symbols = base.symbols.clone();
        }
        for (stage, usage) in delta.token_usage.iter_mut() {
            if let Some(prior) = base.token_usage.get(stage) {
                usage.prompt_tokens = usage.prompt_tokens.saturating_sub(prior.prompt_tokens);
                usage.completion_tokens =
                    usage.completion_tokens.saturating_sub(prior.completion_tokens);
                usage.total_tokens = usage.total_tokens.saturating_sub(prior.total_tokens);
            }
        }
        delta.token_usage.retain(|_, u| *u != TokenUsage::default());
        delta
    }
}

/// Number of non-null leaf values in `value`.
pub fn completeness(value: &Value) -> usize {
    match value {
        Value::Null => 0,
        Value::Object(map) => map.values().map(completeness).sum(),
        Value::Array(items) => items.iter().map(completeness).sum(),
        _ => 1,
    }
}

/// Fields a branch changed relative to `base`.
pub fn changed_fields(base: &StateRecord, branch: &StateRecord) -> Vec<FieldName> {
    use FieldName as F;
    FieldName::ALL
        .into_iter()
        .filter(|field| match field {
            F::TransactionId => base.transaction_id != branch.transaction_id,
            F::SessionId => base.session_id != branch.session_id,
            F::Query => base.query != branch.query,
            F::CreatedAt => base.created_at != branch.created_at,
            F::Symbols => base.symbols != branch.symbols,
            F::ResearchData => base.research_data != branch.research_data,
            F::AnalystData => base.analyst_data != branch.analyst_data,
            F::EdgarData => base.edgar_data != branch.edgar_data,
            F::ComparisonData => base.comparison_data != branch.comparison_data,
            F::TrendAnalysis => base.trend_analysis != branch.trend_analysis,
            F::Report => base.report != branch.report,
            F::QueryType => base.query_type != branch.query_type,
            F::IntentFlags => base.intent_flags != branch.intent_flags,
            F::Entities => base.entities != branch.entities,
            F::Errors => base.errors != branch.errors,
            F::Citations => base.citations != branch.citations,
            F::TokenUsage => base.token_usage != branch.token_usage,
            F::UpdatedAt => base.updated_at != branch.updated_at,
        })
        .collect()
}
