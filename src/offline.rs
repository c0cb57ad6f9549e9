//! Deterministic stand-in agents for running the pipeline without any
//! market-data provider or model behind it.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use fingraph_agent::StageKind;
use fingraph_core::error::Result;
use fingraph_core::state::StateRecord;
use fingraph_core::traits::AgentCapability;
use fingraph_core::types::Citation;

const SOURCE: &str = "offline";

pub struct OfflineAgent {
    kind: StageKind,
    name: &'static str,
}

impl OfflineAgent {
    pub fn new(kind: StageKind) -> Self {
        let name = match kind {
            StageKind::Research => "ResearchAgent",
            StageKind::Analysis => "AnalystAgent",
            StageKind::Filing => "EdgarAgent",
            StageKind::Comparison => "ComparisonAgent",
            StageKind::Trend => "TrendAgent",
            StageKind::Reporting => "ReportingAgent",
        };
        Self { kind, name }
    }

    pub fn arc(kind: StageKind) -> Arc<dyn AgentCapability> {
        Arc::new(Self::new(kind))
    }

    fn apply(&self, mut state: StateRecord) -> StateRecord {
        let symbols = state.symbols.clone();
        match self.kind {
            StageKind::Research => {
                for symbol in &symbols {
                    state.research_data.insert(
                        symbol.clone(),
                        json!({"symbol": symbol, "price": null, "fundamentals": null, "source": SOURCE}),
                    );
                    state.add_citation(Citation::new(SOURCE, symbol, "price_data"));
                }
            }
            StageKind::Analysis => {
                for symbol in &symbols {
                    state.analyst_data.insert(
                        symbol.clone(),
                        json!({"summary": format!("No live data available for {}", symbol)}),
                    );
                }
            }
            StageKind::Filing => {
                let filing_type = state
                    .entities
                    .get("filing_type")
                    .cloned()
                    .unwrap_or_else(|| json!("10-K"));
                for symbol in &symbols {
                    state.edgar_data.insert(
                        symbol.clone(),
                        json!({"filing_type": filing_type, "sections": {}, "status": "unavailable"}),
                    );
                    state.add_citation(Citation::new("SEC EDGAR", symbol, "filing"));
                }
            }
            StageKind::Comparison => {
                state.comparison_data.insert("symbols".into(), json!(symbols));
                state.comparison_data.insert("metrics".into(), json!({}));
            }
            StageKind::Trend => {
                for symbol in &symbols {
                    state.trend_analysis.insert(
                        symbol.clone(),
                        json!({"direction": null, "indicators": {}}),
                    );
                }
            }
            StageKind::Reporting => {
                state.report = Some(render_report(&state));
            }
        }
        state
    }
}

impl AgentCapability for OfflineAgent {
    fn name(&self) -> &str {
        self.name
    }

    fn execute(&self, state: StateRecord) -> BoxFuture<'_, Result<StateRecord>> {
        Box::pin(async move { Ok(self.apply(state)) })
    }
}

fn render_report(state: &StateRecord) -> String {
    let mut out = format!("# {}\n\n", state.query);
    if let Some(qt) = state.query_type {
        out.push_str(&format!("Query type: {}\n\n", qt));
    }
    let sections: [(&str, &std::collections::BTreeMap<String, Value>); 5] = [
        ("Research", &state.research_data),
        ("Analysis", &state.analyst_data),
        ("Filings", &state.edgar_data),
        ("Comparison", &state.comparison_data),
        ("Trends", &state.trend_analysis),
    ];
    for (title, data) in sections {
        if data.is_empty() {
            continue;
        }
        out.push_str(&format!("## {}\n\n", title));
        for key in data.keys() {
            out.push_str(&format!("- {}\n", key));
        }
        out.push('\n');
    }
    if !state.errors.is_empty() {
        out.push_str("## Issues\n\n");
        for e in &state.errors {
            out.push_str(&format!("- {}\n", e));
        }
    }
    out
}
