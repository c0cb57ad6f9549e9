use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use fingraph_core::config::ClassifierConfig;
use fingraph_core::state::StateRecord;
use fingraph_core::traits::ClassificationRefiner;
use fingraph_core::types::{Classification, IntentFlags, QueryType};

use crate::parser::FallbackQueryParser;

pub const COMPARISON_KEYWORDS: &[&str] = &[
    "compare", "comparison", "versus", "vs", "vs.", "against", "difference", "differences",
    "better", "best", "worse", "worst", "side by side", "side-by-side", "relative", "relatively",
];

pub const TREND_KEYWORDS: &[&str] = &[
    "trend", "trends", "trending", "pattern", "patterns", "direction", "momentum", "movement",
    "movements", "historical", "history", "over time", "performance", "chart", "charts",
    "technical", "technical analysis",
];

pub const FILING_KEYWORDS: &[&str] = &[
    "10-k", "10-q", "sec filing", "edgar", "filing", "filings", "annual report",
    "quarterly report", "form 10-k", "form 10-q", "sec", "securities and exchange commission",
];

pub const COMPREHENSIVE_KEYWORDS: &[&str] = &[
    "comprehensive", "complete", "full", "detailed", "deep dive", "in-depth", "thorough",
    "extensive", "all", "everything",
];

/// Whether `text` (already lowercased) contains any keyword as a whole word or phrase.
///
/// "sec" matches "the SEC filing" but not "sector".
pub fn contains_any<S: AsRef<str>>(text: &str, keywords: &[S]) -> bool {
    keywords.iter().any(|k| contains_word(text, k.as_ref()))
}

fn contains_word(text: &str, keyword: &str) -> bool {
    if keyword.is_empty() {
        return false;
    }
    let is_word = |c: char| c.is_alphanumeric();
    text.match_indices(keyword).any(|(start, _)| {
        let end = start + keyword.len();
        let before = text[..start].chars().next_back();
        let after = text[end..].chars().next();
        !before.is_some_and(is_word) && !after.is_some_and(is_word)
    })
}

/// One of the optional post-routing stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Branch {
    Filing,
    Comparison,
    Trend,
}

impl Branch {
    pub const ALL: [Branch; 3] = [Branch::Filing, Branch::Comparison, Branch::Trend];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Filing => "filing",
            Self::Comparison => "comparison",
            Self::Trend => "trend",
        }
    }

    /// Whether this branch runs for a classified query.
    pub fn is_active(&self, query_type: QueryType, flags: &IntentFlags) -> bool {
        match self {
            Self::Filing => should_run_filing(query_type, flags),
            Self::Comparison => should_run_comparison(query_type, flags),
            Self::Trend => should_run_trend(query_type, flags),
        }
    }
}

impl fmt::Display for Branch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which optional branches execute after the routing point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// Conditional routing is disabled; every configured branch runs.
    All,
    /// Only the listed branches run. May be empty.
    Only(BTreeSet<Branch>),
}

impl Route {
    pub fn from_classification(query_type: QueryType, flags: &IntentFlags) -> Self {
        Route::Only(
            Branch::ALL
                .into_iter()
                .filter(|b| b.is_active(query_type, flags))
                .collect(),
        )
    }

    /// Route implied by the classification already stored on `state`.
    pub fn from_state(state: &StateRecord) -> Self {
        let flags = state.intent();
        let query_type = state.query_type.unwrap_or_else(|| query_type_for(&flags));
        Self::from_classification(query_type, &flags)
    }

    pub fn allows(&self, branch: Branch) -> bool {
        match self {
            Route::All => true,
            Route::Only(set) => set.contains(&branch),
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::All => f.write_str("all"),
            Route::Only(set) if set.is_empty() => f.write_str("none"),
            Route::Only(set) => {
                let names: Vec<&str> = set.iter().map(Branch::as_str).collect();
                f.write_str(&names.join(","))
            }
        }
    }
}

/// Primary query type, in fixed priority order.
pub fn query_type_for(flags: &IntentFlags) -> QueryType {
    if flags.is_edgar {
        QueryType::FilingAnalysis
    } else if flags.is_comparison {
        if flags.is_comprehensive {
            QueryType::ComprehensiveComparison
        } else {
            QueryType::Comparison
        }
    } else if flags.is_trend {
        if flags.is_comprehensive {
            QueryType::ComprehensiveTrend
        } else {
            QueryType::Trend
        }
    } else if flags.is_comprehensive {
        QueryType::ComprehensiveAnalysis
    } else {
        QueryType::SingleEntity
    }
}

pub fn should_run_comparison(query_type: QueryType, flags: &IntentFlags) -> bool {
    flags.is_comparison
        || flags.is_multi_entity
        || matches!(
            query_type,
            QueryType::Comparison | QueryType::ComprehensiveComparison
        )
}

pub fn should_run_trend(query_type: QueryType, flags: &IntentFlags) -> bool {
    flags.is_trend
        || matches!(
            query_type,
            QueryType::Trend | QueryType::ComprehensiveTrend | QueryType::ComprehensiveAnalysis
        )
}

pub fn should_run_filing(query_type: QueryType, flags: &IntentFlags) -> bool {
    flags.is_edgar
        || matches!(
            query_type,
            QueryType::FilingAnalysis | QueryType::ComprehensiveAnalysis
        )
}

/// Decides which optional analysis branches run for a query.
///
/// The rule pass is deterministic. An optional refiner may raise extra flags
/// or override the query type afterwards; its failures are logged and ignored.
#[derive(Clone)]
pub struct IntentClassifier {
    comparison: Vec<String>,
    trend: Vec<String>,
    filing: Vec<String>,
    comprehensive: Vec<String>,
    refinement_enabled: bool,
    refiner: Option<Arc<dyn ClassificationRefiner>>,
    parser: FallbackQueryParser,
}

impl Default for IntentClassifier {
    fn default() -> Self {
        Self::new(&ClassifierConfig::default())
    }
}

impl IntentClassifier {
    pub fn new(config: &ClassifierConfig) -> Self {
        let keywords = |builtin: &[&str], extra: &[String]| -> Vec<String> {
            builtin
                .iter()
                .map(|k| k.to_string())
                .chain(extra.iter().map(|k| k.to_lowercase()))
                .collect()
        };
        Self {
            comparison: keywords(COMPARISON_KEYWORDS, &config.extra_comparison_keywords),
            trend: keywords(TREND_KEYWORDS, &config.extra_trend_keywords),
            filing: keywords(FILING_KEYWORDS, &config.extra_filing_keywords),
            comprehensive: keywords(COMPREHENSIVE_KEYWORDS, &config.extra_comprehensive_keywords),
            refinement_enabled: config.enable_refinement,
            refiner: None,
            parser: FallbackQueryParser::default(),
        }
    }

    pub fn with_refiner(mut self, refiner: Arc<dyn ClassificationRefiner>) -> Self {
        self.refiner = Some(refiner);
        self
    }

    /// Parser used to extract symbols when the caller supplied none.
    pub fn with_parser(mut self, parser: FallbackQueryParser) -> Self {
        self.parser = parser;
        self
    }

    /// Deterministic keyword classification. Two or more symbols always
    /// make a comparison.
    pub fn classify_rules(&self, query: &str, symbols: &[String]) -> Classification {
        let lower = query.to_lowercase();
        let flags = IntentFlags {
            is_comparison: symbols.len() > 1 || contains_any(&lower, &self.comparison),
            is_trend: contains_any(&lower, &self.trend),
            is_edgar: contains_any(&lower, &self.filing),
            is_comprehensive: contains_any(&lower, &self.comprehensive),
            ..Default::default()
        }
        .with_symbol_count(symbols.len());

        Classification {
            query_type: query_type_for(&flags),
            intent_flags: flags,
            symbols: symbols.to_vec(),
        }
    }

    /// Classify a query, extracting symbols first when none are given.
    pub async fn classify(
        &self,
        query: &str,
        symbols: &[String],
        context: Option<&str>,
    ) -> Classification {
        let symbols = if symbols.is_empty() {
            let parsed = self.parser.parse(query, context).await;
            if !parsed.symbols.is_empty() {
                debug!(symbols = ?parsed.symbols, "Extracted symbols from query");
            }
            parsed.symbols
        } else {
            symbols.to_vec()
        };

        let mut classification = self.classify_rules(query, &symbols);

        if self.refinement_enabled {
            if let Some(refiner) = &self.refiner {
                match refiner
                    .refine(query, &classification.symbols, &classification.intent_flags)
                    .await
                {
                    Ok(refinement) => {
                        let mut raised = refinement.raise_flags;
                        // Entity flags follow the symbol count only.
                        raised.is_single_entity = false;
                        raised.is_multi_entity = false;
                        classification.intent_flags.raise(&raised);
                        classification.query_type = refinement
                            .query_type
                            .unwrap_or_else(|| query_type_for(&classification.intent_flags));
                        debug!(
                            reasoning = refinement.reasoning.as_deref().unwrap_or(""),
                            "Applied classification refinement"
                        );
                    }
                    Err(e) => warn!(error = %e, "Classification refinement failed, using rule result"),
                }
            }
        }

        info!(
            query_type = %classification.query_type,
            symbols = ?classification.symbols,
            "Query classified"
        );
        classification
    }

    /// Classify `state` in place and return the branches to run.
    ///
    /// A state that already carries a query type and flags is passed through
    /// untouched. Flags set upstream without a query type are kept: the
    /// classification can only add to them.
    pub async fn route(&self, state: &mut StateRecord, context: Option<&str>) -> Route {
        if state.is_classified() {
            debug!(query_type = ?state.query_type, "State already classified, passing through");
            return Route::from_state(state);
        }

        let mut classification = self.classify(&state.query, &state.symbols, context).await;

        let mut upstream = state.intent();
        // Entity flags follow the symbol count only.
        upstream.is_single_entity = false;
        upstream.is_multi_entity = false;
        let before = classification.intent_flags;
        classification.intent_flags.raise(&upstream);
        if classification.intent_flags != before {
            classification.query_type = query_type_for(&classification.intent_flags);
            debug!(
                query_type = %classification.query_type,
                "Kept upstream intent flags"
            );
        }

        let update = StateRecord {
            symbols: classification.symbols.clone(),
            query_type: Some(classification.query_type),
            intent_flags: classification.intent_flags.to_map(),
            ..Default::default()
        };
        state.merge(&update);

        Route::from_classification(classification.query_type, &classification.intent_flags)
    }
}
