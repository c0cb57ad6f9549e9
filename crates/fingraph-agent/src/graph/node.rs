use serde::{Deserialize, Serialize};

use fingraph_core::reducer::FieldName;

use crate::stage::AgentStage;

/// Fields any stage may touch in addition to its declared writes.
pub const AMBIENT_WRITES: [FieldName; 4] = [
    FieldName::Errors,
    FieldName::Citations,
    FieldName::TokenUsage,
    FieldName::UpdatedAt,
];

/// The stages the standard research pipeline knows how to wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Research,
    Analysis,
    Filing,
    Comparison,
    Trend,
    Reporting,
}

impl StageKind {
    /// Node id used in the standard pipeline.
    pub fn id(&self) -> &'static str {
        match self {
            Self::Research => "research",
            Self::Analysis => "analysis",
            Self::Filing => "filing",
            Self::Comparison => "comparison",
            Self::Trend => "trend",
            Self::Reporting => "reporting",
        }
    }

    pub fn default_tasks(&self) -> Vec<String> {
        let tasks: &[&str] = match self {
            Self::Research => &["Gathering market data", "Fetching company information"],
            Self::Analysis => &["Analyzing data", "Generating insights"],
            Self::Filing => &["Fetching SEC filings", "Processing documents"],
            Self::Comparison => &["Comparing entities", "Analyzing differences"],
            Self::Trend => &["Analyzing trends", "Identifying patterns"],
            Self::Reporting => &["Generating report", "Formatting output"],
        };
        tasks.iter().map(|t| t.to_string()).collect()
    }

    pub fn default_writes(&self) -> Vec<String> {
        let field = match self {
            Self::Research => FieldName::ResearchData,
            Self::Analysis => FieldName::AnalystData,
            Self::Filing => FieldName::EdgarData,
            Self::Comparison => FieldName::ComparisonData,
            Self::Trend => FieldName::TrendAnalysis,
            Self::Reporting => FieldName::Report,
        };
        vec![field.as_str().to_string()]
    }
}

#[derive(Debug, Clone)]
pub enum NodeAction {
    /// Run an agent stage.
    Stage(AgentStage),
    /// Classify the query and decide which routed edges are open.
    Route,
}

/// A node in the workflow graph.
///
/// `writes` names the state fields the node is expected to change; names are
/// checked against the state schema when the graph is compiled.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub action: NodeAction,
    pub writes: Vec<String>,
    /// Task template for per-symbol fan-out; `{symbol}` is substituted.
    /// `None` runs the node once over all symbols.
    pub per_symbol: Option<String>,
}

impl Node {
    pub fn stage(id: impl Into<String>, stage: AgentStage) -> Self {
        Self {
            id: id.into(),
            action: NodeAction::Stage(stage),
            writes: vec![],
            per_symbol: None,
        }
    }

    pub fn route(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            action: NodeAction::Route,
            writes: [
                FieldName::Symbols,
                FieldName::QueryType,
                FieldName::IntentFlags,
            ]
            .iter()
            .map(|f| f.as_str().to_string())
            .collect(),
            per_symbol: None,
        }
    }

    pub fn with_writes(mut self, writes: Vec<String>) -> Self {
        self.writes = writes;
        self
    }

    /// Run once per symbol when the state carries more than one.
    pub fn with_per_symbol(mut self, task_template: impl Into<String>) -> Self {
        self.per_symbol = Some(task_template.into());
        self
    }

    /// Name used in progress events and logs.
    pub fn name(&self) -> &str {
        match &self.action {
            NodeAction::Stage(stage) => stage.name(),
            NodeAction::Route => "IntentClassifier",
        }
    }

    pub fn is_route(&self) -> bool {
        matches!(self.action, NodeAction::Route)
    }

    /// Per-symbol task descriptions.
    pub fn symbol_tasks(&self, symbols: &[String]) -> Vec<String> {
        match &self.per_symbol {
            Some(template) => symbols
                .iter()
                .map(|s| template.replace("{symbol}", s))
                .collect(),
            None => vec![],
        }
    }
}
