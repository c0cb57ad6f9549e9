use std::sync::Arc;

use fingraph_core::config::WorkflowConfig;
use fingraph_core::error::{FingraphError, Result};
use fingraph_core::traits::AgentCapability;

use super::edge::{Edge, END};
use super::node::{Node, StageKind};
use super::workflow::{CompiledGraph, WorkflowGraph};
use crate::intent::{Branch, IntentClassifier};
use crate::stage::AgentStage;

const ROUTE_NODE: &str = "route";
const RESEARCH_SYMBOL_TASK: &str = "Gathering data for {symbol}";

/// Builds the standard research pipeline from the capabilities supplied.
///
/// ```text
/// research ─▶ analysis ─▶ route ─┬▶ filing     ─┐
///                                ├▶ comparison ─┼▶ reporting ─▶ end
///                                └▶ trend      ─┘
/// ```
///
/// Only research is required. Optional stages appear only when a capability
/// was supplied; the route node appears only with conditional routing on and
/// at least one routed stage present.
#[derive(Default)]
pub struct PipelineBuilder {
    config: WorkflowConfig,
    classifier: Option<IntentClassifier>,
    research: Option<Arc<dyn AgentCapability>>,
    analysis: Option<Arc<dyn AgentCapability>>,
    filing: Option<Arc<dyn AgentCapability>>,
    comparison: Option<Arc<dyn AgentCapability>>,
    trend: Option<Arc<dyn AgentCapability>>,
    reporting: Option<Arc<dyn AgentCapability>>,
}

impl PipelineBuilder {
    pub fn new(config: WorkflowConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn classifier(mut self, classifier: IntentClassifier) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn research(mut self, capability: Arc<dyn AgentCapability>) -> Self {
        self.research = Some(capability);
        self
    }

    pub fn analysis(mut self, capability: Arc<dyn AgentCapability>) -> Self {
        self.analysis = Some(capability);
        self
    }

    pub fn filing(mut self, capability: Arc<dyn AgentCapability>) -> Self {
        self.filing = Some(capability);
        self
    }

    pub fn comparison(mut self, capability: Arc<dyn AgentCapability>) -> Self {
        self.comparison = Some(capability);
        self
    }

    pub fn trend(mut self, capability: Arc<dyn AgentCapability>) -> Self {
        self.trend = Some(capability);
        self
    }

    pub fn reporting(mut self, capability: Arc<dyn AgentCapability>) -> Self {
        self.reporting = Some(capability);
        self
    }

    /// The uncompiled graph.
    pub fn graph(self) -> Result<WorkflowGraph> {
        let research = self
            .research
            .ok_or_else(|| FingraphError::Graph("a research capability is required".into()))?;

        let mut graph = WorkflowGraph::new()
            .with_config(self.config.clone())
            .with_classifier(self.classifier.unwrap_or_default())
            .entry(StageKind::Research.id());

        let mut research_node = stage_node(StageKind::Research, research);
        if self.config.enable_parallel {
            research_node = research_node.with_per_symbol(RESEARCH_SYMBOL_TASK);
        }
        graph = graph.node(research_node);
        let mut prev = StageKind::Research.id();

        if let Some(cap) = self.analysis {
            graph = graph
                .node(stage_node(StageKind::Analysis, cap))
                .edge(Edge::always(prev, StageKind::Analysis.id()));
            prev = StageKind::Analysis.id();
        }

        let tail = match self.reporting {
            Some(cap) => {
                graph = graph.node(stage_node(StageKind::Reporting, cap));
                StageKind::Reporting.id()
            }
            None => END,
        };

        let routed: Vec<(StageKind, Branch, Arc<dyn AgentCapability>)> = [
            (StageKind::Filing, Branch::Filing, self.filing),
            (StageKind::Comparison, Branch::Comparison, self.comparison),
            (StageKind::Trend, Branch::Trend, self.trend),
        ]
        .into_iter()
        .filter_map(|(kind, branch, cap)| cap.map(|c| (kind, branch, c)))
        .collect();

        if routed.is_empty() {
            if tail != END {
                graph = graph.edge(Edge::always(prev, tail));
            }
            return Ok(graph);
        }

        if self.config.enable_conditional {
            graph = graph
                .node(Node::route(ROUTE_NODE))
                .edge(Edge::always(prev, ROUTE_NODE));
            prev = ROUTE_NODE;
        }

        for (kind, branch, cap) in routed {
            let edge = if self.config.enable_conditional {
                Edge::routed(prev, kind.id(), branch)
            } else {
                Edge::always(prev, kind.id())
            };
            graph = graph
                .node(stage_node(kind, cap))
                .edge(edge)
                .edge(Edge::always(kind.id(), tail));
        }

        Ok(graph)
    }

    pub fn build(self) -> Result<CompiledGraph> {
        self.graph()?.compile()
    }
}

fn stage_node(kind: StageKind, capability: Arc<dyn AgentCapability>) -> Node {
    Node::stage(
        kind.id(),
        AgentStage::new(capability).with_tasks(kind.default_tasks()),
    )
    .with_writes(kind.default_writes())
}
