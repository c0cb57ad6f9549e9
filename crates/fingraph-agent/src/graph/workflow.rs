use std::collections::HashSet;

use tracing::debug;

use fingraph_core::config::WorkflowConfig;
use fingraph_core::error::{FingraphError, Result};
use fingraph_core::reducer::{self, FieldName, REDUCER_TABLE};

use super::edge::{Edge, EdgeCondition, END};
use super::node::{Node, AMBIENT_WRITES};
use crate::intent::{Branch, IntentClassifier};

/// Declarative workflow: nodes, edges, and an entry point.
///
/// Nothing is checked until [`WorkflowGraph::compile`].
#[derive(Clone, Default)]
pub struct WorkflowGraph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    entry: Option<String>,
    classifier: IntentClassifier,
    config: WorkflowConfig,
}

impl WorkflowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn entry(mut self, id: impl Into<String>) -> Self {
        self.entry = Some(id.into());
        self
    }

    pub fn with_classifier(mut self, classifier: IntentClassifier) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_config(mut self, config: WorkflowConfig) -> Self {
        self.config = config;
        self
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    /// Validate the graph and lower it to an execution plan.
    ///
    /// Fails on an invalid reducer table, undeclared write fields, unknown
    /// edge endpoints, cycles, unreachable nodes, and fan-outs whose branches
    /// do not rejoin at a single node.
    pub fn compile(self) -> Result<CompiledGraph> {
        reducer::validate_table(REDUCER_TABLE)?;
        if self.config.max_fanout == 0 {
            return Err(FingraphError::Graph("max_fanout must be at least 1".into()));
        }

        let entry = self
            .entry
            .clone()
            .ok_or_else(|| FingraphError::Graph("no entry node set".into()))?;

        let mut ids = HashSet::new();
        for node in &self.nodes {
            if node.id == END {
                return Err(FingraphError::Graph(format!("'{}' is a reserved node id", END)));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(FingraphError::Graph(format!("duplicate node id '{}'", node.id)));
            }
        }

        let mut compiled = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut writes = node
                .writes
                .iter()
                .map(|w| FieldName::parse(w))
                .collect::<Result<Vec<_>>>()?;
            writes.extend(AMBIENT_WRITES);
            compiled.push(CompiledNode {
                node: node.clone(),
                writes,
            });
        }

        let index = |id: &str| compiled.iter().position(|c| c.node.id == id);
        if index(&entry).is_none() {
            return Err(FingraphError::Graph(format!("entry node '{}' not found", entry)));
        }

        for edge in &self.edges {
            if index(&edge.from).is_none() {
                return Err(FingraphError::Graph(format!(
                    "edge source '{}' not found",
                    edge.from
                )));
            }
            if edge.to != END && index(&edge.to).is_none() {
                return Err(FingraphError::Graph(format!(
                    "edge target '{}' not found",
                    edge.to
                )));
            }
        }

        let route_nodes = compiled.iter().filter(|c| c.node.is_route()).count();
        if route_nodes > 1 {
            return Err(FingraphError::Graph("at most one route node is allowed".into()));
        }
        let routed = self
            .edges
            .iter()
            .any(|e| matches!(e.condition, EdgeCondition::Routed { .. }));
        if routed && route_nodes == 0 {
            return Err(FingraphError::Graph("routed edges require a route node".into()));
        }

        let outgoing = |id: &str| -> Vec<&Edge> {
            self.edges.iter().filter(|e| e.from == id).collect()
        };

        let mut steps = Vec::new();
        let mut visited: HashSet<usize> = HashSet::new();
        let mut current = entry.clone();
        let mut gate: Option<Branch> = None;

        while current != END {
            let idx = index(&current)
                .ok_or_else(|| FingraphError::Graph(format!("node '{}' not found", current)))?;
            if !visited.insert(idx) {
                return Err(FingraphError::Graph(format!("cycle through node '{}'", current)));
            }

            if compiled[idx].node.is_route() {
                steps.push(Step::Route { node: idx });
            } else {
                steps.push(Step::Run { node: idx, gate });
            }

            let out = outgoing(&current);
            match out.len() {
                0 => break,
                1 => {
                    gate = out[0].condition.branch();
                    current = out[0].to.clone();
                }
                _ => {
                    let mut branches = Vec::with_capacity(out.len());
                    let mut join: Option<String> = None;
                    for edge in &out {
                        if edge.to == END {
                            return Err(FingraphError::Graph(format!(
                                "fan-out from '{}' cannot target the end directly",
                                current
                            )));
                        }
                        let b = index(&edge.to).ok_or_else(|| {
                            FingraphError::Graph(format!("node '{}' not found", edge.to))
                        })?;
                        if compiled[b].node.is_route() {
                            return Err(FingraphError::Graph(format!(
                                "route node '{}' cannot be a fan-out branch",
                                edge.to
                            )));
                        }
                        if !visited.insert(b) {
                            return Err(FingraphError::Graph(format!(
                                "cycle through node '{}'",
                                edge.to
                            )));
                        }

                        let branch_out = outgoing(&edge.to);
                        let target = match branch_out.as_slice() {
                            [] => END.to_string(),
                            [next] if next.condition == EdgeCondition::Always => next.to.clone(),
                            _ => {
                                return Err(FingraphError::Graph(format!(
                                    "fan-out branch '{}' must have a single unconditional edge to the join",
                                    edge.to
                                )))
                            }
                        };
                        match &join {
                            None => join = Some(target),
                            Some(j) if *j == target => {}
                            Some(j) => {
                                return Err(FingraphError::Graph(format!(
                                    "fan-out from '{}' joins at both '{}' and '{}'",
                                    current, j, target
                                )))
                            }
                        }
                        branches.push((b, edge.condition.branch()));
                    }
                    steps.push(Step::FanOut { branches });
                    gate = None;
                    current = join.unwrap_or_else(|| END.to_string());
                }
            }
        }

        if let Some(orphan) = compiled
            .iter()
            .enumerate()
            .find(|(i, _)| !visited.contains(i))
        {
            return Err(FingraphError::Graph(format!(
                "node '{}' is unreachable from '{}'",
                orphan.1.node.id, entry
            )));
        }

        debug!(nodes = compiled.len(), steps = steps.len(), "Workflow graph compiled");

        Ok(CompiledGraph {
            nodes: compiled,
            edges: self.edges,
            steps,
            classifier: self.classifier,
            config: self.config,
        })
    }
}

/// A node with its write set resolved against the state schema.
#[derive(Debug, Clone)]
pub struct CompiledNode {
    pub node: Node,
    pub writes: Vec<FieldName>,
}

impl CompiledNode {
    pub fn may_write(&self, field: FieldName) -> bool {
        self.writes.contains(&field)
    }
}

/// One step of the lowered execution plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Run a node, skipped when its gate is closed.
    Run { node: usize, gate: Option<Branch> },
    /// Classify and fix the route for the rest of the run.
    Route { node: usize },
    /// Run branches on copies of the state, then merge them in this order.
    FanOut { branches: Vec<(usize, Option<Branch>)> },
}

/// A validated, immutable workflow ready for execution.
///
/// Shareable across concurrent executions.
pub struct CompiledGraph {
    nodes: Vec<CompiledNode>,
    edges: Vec<Edge>,
    steps: Vec<Step>,
    classifier: IntentClassifier,
    config: WorkflowConfig,
}

impl CompiledGraph {
    pub fn nodes(&self) -> &[CompiledNode] {
        &self.nodes
    }

    pub fn node(&self, idx: usize) -> &CompiledNode {
        &self.nodes[idx]
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn classifier(&self) -> &IntentClassifier {
        &self.classifier
    }

    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.iter().any(|n| n.node.id == id)
    }

    /// Human-readable plan, one line per step.
    pub fn describe(&self) -> Vec<String> {
        let label = |idx: usize, gate: Option<Branch>| {
            let n = &self.nodes[idx].node;
            let mut s = format!("{} [{}]", n.id, n.name());
            if n.per_symbol.is_some() && self.config.enable_parallel {
                s.push_str(" per-symbol");
            }
            if let Some(branch) = gate {
                s.push_str(&format!(" if {}", branch));
            }
            s
        };
        self.steps
            .iter()
            .enumerate()
            .map(|(i, step)| {
                let body = match step {
                    Step::Run { node, gate } => label(*node, *gate),
                    Step::Route { node } => format!("{} [route]", self.nodes[*node].node.id),
                    Step::FanOut { branches } => {
                        let parts: Vec<String> =
                            branches.iter().map(|(n, g)| label(*n, *g)).collect();
                        format!("parallel {{ {} }}", parts.join(" | "))
                    }
                };
                format!("{}. {}", i + 1, body)
            })
            .collect()
    }
}
