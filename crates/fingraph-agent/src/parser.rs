use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use regex::Regex;
use serde_json::json;
use tracing::{debug, info, warn};

use fingraph_core::config::ParserConfig;
use fingraph_core::error::Result;
use fingraph_core::traits::QueryParsingCapability;
use fingraph_core::types::{Confidence, ExtractionMethod, IntentFlags, IntentType, ParsedQuery};

use crate::intent::{contains_any, COMPARISON_KEYWORDS, COMPREHENSIVE_KEYWORDS};

const STOP_WORDS: &[&str] = &[
    "A", "I", "K", "Q", "E", "P", "THE", "AND", "FOR", "ARE", "BUT", "NOT", "YOU", "ALL", "CAN",
    "HER", "WAS", "ONE", "OUR", "OUT", "DAY", "GET", "HAS", "HIM", "HIS", "HOW", "ITS", "MAY",
    "NEW", "NOW", "OLD", "SEE", "TWO", "WHO", "WAY", "USE", "SHE", "MAN", "HAD", "THEY", "THEM",
    "THIS", "THAT", "THESE", "THOSE", "SEC", "EDGAR", "CEO", "CFO", "EPS", "USD", "VS", "YOY",
];

const COMPANY_ALIASES: &[(&str, &str)] = &[
    ("apple", "AAPL"),
    ("microsoft", "MSFT"),
    ("tesla", "TSLA"),
    ("google", "GOOGL"),
    ("alphabet", "GOOGL"),
    ("amazon", "AMZN"),
    ("nvidia", "NVDA"),
    ("meta", "META"),
    ("netflix", "NFLX"),
    ("amd", "AMD"),
    ("intel", "INTC"),
    ("rivian", "RIVN"),
    ("lucid", "LCID"),
];

/// Words that make a company name read as a stock rather than, say, a fruit.
const STOCK_CONTEXT_WORDS: &[&str] = &[
    "stock", "stocks", "share", "shares", "company", "inc", "corp", "ticker", "symbol", "analyze",
    "analysis", "compare",
];

const TREND_WORDS: &[&str] = &["trend", "trends", "trending", "pattern", "historical", "over time"];
const FILING_WORDS: &[&str] = &[
    "10-k", "10-q", "filing", "filings", "sec", "edgar", "annual report", "quarterly report",
];
const METRIC_WORDS: &[&str] = &["market cap", "p/e", "pe ratio", "revenue", "price", "ratio"];
const ENTITY_METRIC_WORDS: &[&str] = &[
    "market cap", "p/e", "pe ratio", "revenue", "price", "ratio", "eps", "dividend",
];

fn parenthetical_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\(([A-Za-z]{1,5})\)").unwrap())
}

fn ticker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z]{1,5}\b").unwrap())
}

fn timeframe_res() -> &'static [Regex] {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            r"\d+[\s-]*months?",
            r"last\s+\d+\s+years?",
            r"last\s+year",
            r"since\s+\w+\s+\d{4}",
            r"\b\d{4}\b",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

fn filing_year_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(20\d{2})\b").unwrap())
}

/// Deterministic query parser.
///
/// Extracts tickers, intent, and entities with regexes and keyword lists. It
/// never fails, which makes it the fallback for any model-backed parser.
#[derive(Debug, Clone)]
pub struct RuleBasedQueryParser {
    stop_words: HashSet<String>,
    aliases: BTreeMap<String, String>,
}

impl Default for RuleBasedQueryParser {
    fn default() -> Self {
        Self::new(&ParserConfig::default())
    }
}

impl RuleBasedQueryParser {
    pub fn new(config: &ParserConfig) -> Self {
        let mut stop_words: HashSet<String> = STOP_WORDS.iter().map(|s| s.to_string()).collect();
        stop_words.extend(config.stop_words.iter().map(|s| s.to_uppercase()));

        let mut aliases: BTreeMap<String, String> = COMPANY_ALIASES
            .iter()
            .map(|(name, ticker)| (name.to_string(), ticker.to_string()))
            .collect();
        for (name, ticker) in &config.company_aliases {
            aliases.insert(name.to_lowercase(), ticker.to_uppercase());
        }

        Self { stop_words, aliases }
    }

    pub fn parse(&self, query: &str) -> ParsedQuery {
        let query = query.trim();
        if query.is_empty() {
            warn!("Empty query provided to parser");
            return empty_result("Empty query");
        }

        let symbols = self.extract_symbols(query);
        let lower = query.to_lowercase();

        let flags = IntentFlags {
            is_comparison: symbols.len() > 1 || contains_any(&lower, COMPARISON_KEYWORDS),
            is_trend: contains_any(&lower, TREND_WORDS),
            is_edgar: contains_any(&lower, FILING_WORDS),
            is_comprehensive: contains_any(&lower, COMPREHENSIVE_KEYWORDS),
            is_metric_query: contains_any(&lower, METRIC_WORDS),
            ..Default::default()
        }
        .with_symbol_count(symbols.len());

        let intent_type = intent_type_for(&flags);
        let entities = extract_entities(query, &lower);
        let found = !symbols.is_empty();

        let parsed = ParsedQuery {
            intent_type,
            intent_flags: flags,
            entities,
            confidence: if found { Confidence::High } else { Confidence::Low },
            needs_clarification: !found && !flags.is_edgar,
            clarification_question: (!found)
                .then(|| "Which stock or company would you like me to analyze?".to_string()),
            extraction_method: ExtractionMethod::Regex,
            reasoning: format!("Regex extraction found {} symbol(s)", symbols.len()),
            symbols,
        };
        debug!(symbols = ?parsed.symbols, intent = ?parsed.intent_type, "Rule-based parse");
        parsed
    }

    /// Tickers in order of appearance: parenthetical `(AAPL)` first, then bare
    /// uppercase words, then company names when the query reads as stock talk.
    pub fn extract_symbols(&self, query: &str) -> Vec<String> {
        let mut symbols: Vec<String> = Vec::new();
        let push = |s: String, symbols: &mut Vec<String>| {
            if !symbols.contains(&s) {
                symbols.push(s);
            }
        };

        for cap in parenthetical_re().captures_iter(query) {
            push(cap[1].to_uppercase(), &mut symbols);
        }

        for m in ticker_re().find_iter(query) {
            let word = m.as_str();
            if !self.stop_words.contains(word) {
                push(word.to_string(), &mut symbols);
            }
        }

        let lower = query.to_lowercase();
        if contains_any(&lower, STOCK_CONTEXT_WORDS) {
            for (name, ticker) in &self.aliases {
                if contains_any(&lower, &[name.as_str()]) {
                    push(ticker.clone(), &mut symbols);
                }
            }
        }

        symbols
    }
}

impl QueryParsingCapability for RuleBasedQueryParser {
    fn parse<'a>(
        &'a self,
        query: &'a str,
        _context: Option<&'a str>,
    ) -> BoxFuture<'a, Result<ParsedQuery>> {
        Box::pin(async move { Ok(RuleBasedQueryParser::parse(self, query)) })
    }
}

/// Parser that tries an optional model-backed parser first and falls back to
/// [`RuleBasedQueryParser`] on error or when no symbols were found.
///
/// Always produces a result.
#[derive(Clone, Default)]
pub struct FallbackQueryParser {
    primary: Option<Arc<dyn QueryParsingCapability>>,
    rules: RuleBasedQueryParser,
}

impl FallbackQueryParser {
    pub fn new(rules: RuleBasedQueryParser) -> Self {
        Self {
            primary: None,
            rules,
        }
    }

    pub fn with_primary(mut self, primary: Arc<dyn QueryParsingCapability>) -> Self {
        self.primary = Some(primary);
        self
    }

    pub async fn parse(&self, query: &str, context: Option<&str>) -> ParsedQuery {
        if query.trim().is_empty() {
            return empty_result("Empty query");
        }

        if let Some(primary) = &self.primary {
            match primary.parse(query, context).await {
                Ok(parsed) if !parsed.symbols.is_empty() => {
                    info!(symbols = ?parsed.symbols, intent = ?parsed.intent_type, "Model parse succeeded");
                    return normalize(parsed);
                }
                Ok(_) => warn!("Model parse returned no symbols, falling back to rules"),
                Err(e) => warn!(error = %e, "Model parse failed, falling back to rules"),
            }
        }

        self.rules.parse(query)
    }
}

/// Uppercase and dedup model-produced tickers, and recompute the entity-count flags.
fn normalize(mut parsed: ParsedQuery) -> ParsedQuery {
    let mut seen = HashSet::new();
    parsed.symbols = parsed
        .symbols
        .into_iter()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect();
    parsed.intent_flags = parsed.intent_flags.with_symbol_count(parsed.symbols.len());
    parsed
}

fn intent_type_for(flags: &IntentFlags) -> IntentType {
    if flags.is_edgar {
        IntentType::FilingAnalysis
    } else if flags.is_comparison {
        if flags.is_comprehensive {
            IntentType::ComprehensiveComparison
        } else {
            IntentType::Comparison
        }
    } else if flags.is_trend {
        if flags.is_comprehensive {
            IntentType::ComprehensiveTrend
        } else {
            IntentType::Trend
        }
    } else if flags.is_comprehensive {
        IntentType::ComprehensiveAnalysis
    } else if flags.is_metric_query {
        IntentType::Metric
    } else {
        IntentType::Analysis
    }
}

fn extract_entities(query: &str, lower: &str) -> BTreeMap<String, serde_json::Value> {
    let mut entities = BTreeMap::new();

    if let Some(m) = timeframe_res().iter().find_map(|re| re.find(lower)) {
        entities.insert("timeframe".to_string(), json!(m.as_str()));
    }

    let metrics: Vec<&str> = ENTITY_METRIC_WORDS
        .iter()
        .copied()
        .filter(|k| contains_any(lower, &[k]))
        .collect();
    if !metrics.is_empty() {
        entities.insert("metrics".to_string(), json!(metrics));
    }

    if contains_any(lower, &["10-k", "annual report"]) {
        entities.insert("filing_type".to_string(), json!("10-K"));
    } else if contains_any(lower, &["10-q", "quarterly report"]) {
        entities.insert("filing_type".to_string(), json!("10-Q"));
    }

    if let Some(year) = filing_year_re()
        .captures(query)
        .and_then(|c| c[1].parse::<u32>().ok())
    {
        entities.insert("filing_year".to_string(), json!(year));
    }

    entities
}

fn empty_result(reasoning: &str) -> ParsedQuery {
    ParsedQuery {
        needs_clarification: true,
        confidence: Confidence::Low,
        clarification_question: Some(
            "Please provide a stock symbol or company name to analyze.".to_string(),
        ),
        extraction_method: ExtractionMethod::None,
        reasoning: reasoning.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fingraph_core::error::FingraphError;

    #[test]
    fn extracts_bare_and_parenthetical_tickers() {
        let parser = RuleBasedQueryParser::default();
        assert_eq!(
            parser.extract_symbols("Compare Apple Inc. (AAPL) and MSFT"),
            vec!["AAPL", "MSFT"]
        );
        assert_eq!(parser.extract_symbols("How is THE market"), Vec::<String>::new());
    }

    #[test]
    fn filing_suffix_letters_are_not_tickers() {
        let parser = RuleBasedQueryParser::default();
        let parsed = parser.parse("Summarize the 10-K for NVDA and the SEC 10-Q");
        assert_eq!(parsed.symbols, vec!["NVDA"]);
        assert_eq!(parsed.intent_type, IntentType::FilingAnalysis);
        assert_eq!(parsed.entities["filing_type"], json!("10-K"));
    }

    #[test]
    fn company_names_need_stock_context() {
        let parser = RuleBasedQueryParser::default();
        assert_eq!(parser.extract_symbols("Analyze tesla stock"), vec!["TSLA"]);
        assert!(parser.extract_symbols("I ate an apple").is_empty());
        // "meta" inside "metadata" is not a company mention
        assert!(parser.extract_symbols("analyze the metadata").is_empty());
    }

    #[test]
    fn configured_aliases_extend_builtins() {
        let mut config = ParserConfig::default();
        config.company_aliases.insert("Palantir".into(), "pltr".into());
        config.stop_words.push("ok".into());
        let parser = RuleBasedQueryParser::new(&config);
        assert_eq!(parser.extract_symbols("Analyze palantir stock OK"), vec!["PLTR"]);
    }

    #[test]
    fn parse_sets_flags_and_entities() {
        let parser = RuleBasedQueryParser::default();
        let parsed = parser.parse("Compare AAPL vs MSFT revenue trends over the last 2 years");
        assert_eq!(parsed.symbols, vec!["AAPL", "MSFT"]);
        assert!(parsed.intent_flags.is_comparison);
        assert!(parsed.intent_flags.is_trend);
        assert!(parsed.intent_flags.is_multi_entity);
        assert!(!parsed.intent_flags.is_single_entity);
        assert!(parsed.intent_flags.is_metric_query);
        assert_eq!(parsed.intent_type, IntentType::Comparison);
        assert_eq!(parsed.entities["timeframe"], json!("last 2 years"));
        assert_eq!(parsed.entities["metrics"], json!(["revenue"]));
        assert_eq!(parsed.confidence, Confidence::High);
        assert!(!parsed.needs_clarification);
    }

    #[test]
    fn metric_and_year_entities() {
        let parser = RuleBasedQueryParser::default();
        let parsed = parser.parse("What is the P/E ratio and dividend of KO in 2023");
        assert_eq!(parsed.symbols, vec!["KO"]);
        assert_eq!(parsed.intent_type, IntentType::Metric);
        assert_eq!(parsed.entities["filing_year"], json!(2023));
        assert_eq!(parsed.entities["timeframe"], json!("2023"));
        assert_eq!(parsed.entities["metrics"], json!(["p/e", "ratio", "dividend"]));
    }

    #[test]
    fn no_symbols_needs_clarification() {
        let parser = RuleBasedQueryParser::default();
        let parsed = parser.parse("what is going on in the market today");
        assert!(parsed.symbols.is_empty());
        assert!(parsed.needs_clarification);
        assert_eq!(parsed.confidence, Confidence::Low);
        assert!(parsed.clarification_question.is_some());

        let filing = parser.parse("show me the latest annual report filings");
        assert!(!filing.needs_clarification);
    }

    #[test]
    fn empty_query_returns_empty_result() {
        let parsed = RuleBasedQueryParser::default().parse("   ");
        assert_eq!(parsed.extraction_method, ExtractionMethod::None);
        assert!(parsed.needs_clarification);
    }

    struct BrokenParser;

    impl QueryParsingCapability for BrokenParser {
        fn parse<'a>(
            &'a self,
            _query: &'a str,
            _context: Option<&'a str>,
        ) -> BoxFuture<'a, Result<ParsedQuery>> {
            Box::pin(async { Err(FingraphError::Parse("model unavailable".into())) })
        }
    }

    struct ModelParser;

    impl QueryParsingCapability for ModelParser {
        fn parse<'a>(
            &'a self,
            _query: &'a str,
            _context: Option<&'a str>,
        ) -> BoxFuture<'a, Result<ParsedQuery>> {
            Box::pin(async {
                Ok(ParsedQuery {
                    symbols: vec!["aapl".into(), "AAPL".into(), "msft".into()],
                    extraction_method: ExtractionMethod::Model,
                    ..Default::default()
                })
            })
        }
    }

    #[tokio::test]
    async fn fallback_uses_rules_when_primary_fails() {
        let parser = FallbackQueryParser::default().with_primary(Arc::new(BrokenParser));
        let parsed = parser.parse("Analyze AAPL", None).await;
        assert_eq!(parsed.symbols, vec!["AAPL"]);
        assert_eq!(parsed.extraction_method, ExtractionMethod::Regex);
    }

    #[tokio::test]
    async fn fallback_normalizes_primary_output() {
        let parser = FallbackQueryParser::default().with_primary(Arc::new(ModelParser));
        let parsed = parser.parse("how are apple and microsoft doing", None).await;
        assert_eq!(parsed.symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(parsed.extraction_method, ExtractionMethod::Model);
        assert!(parsed.intent_flags.is_multi_entity);
    }
}
