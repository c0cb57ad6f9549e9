use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use fingraph_core::state::StateRecord;
use fingraph_core::traits::ProgressObserver;
use fingraph_core::types::Status;

use super::edge::is_open;
use super::node::NodeAction;
use super::workflow::{CompiledGraph, CompiledNode, Step};
use crate::intent::Route;
use crate::merger::{changed_fields, ContextMerger};
use crate::stage::{StageOutcome, StageRun};

/// Result of one node in an execution.
#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub node_id: String,
    pub stage: String,
    pub succeeded: bool,
    /// The node's route gate was closed.
    pub skipped: bool,
    pub elapsed_ms: u64,
}

/// Summary of an execution, alongside the final state.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionTrace {
    /// Per-node results in execution order; fan-out branches in declared order.
    pub stage_results: Vec<StageResult>,
    pub route: Option<Route>,
    pub total_elapsed_ms: u64,
    pub status: Status,
    pub cancelled: bool,
}

/// Executes a compiled workflow.
///
/// Never returns an error: every failure ends up in the returned state's
/// `errors`. One executor may run many executions concurrently.
pub struct GraphExecutor {
    graph: Arc<CompiledGraph>,
    observer: Option<Arc<dyn ProgressObserver>>,
    cancel: CancellationToken,
    context: Option<String>,
}

impl GraphExecutor {
    pub fn new(graph: Arc<CompiledGraph>) -> Self {
        Self {
            graph,
            observer: None,
            cancel: CancellationToken::new(),
            context: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Stop between steps once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Prior conversation passed to the query parser during routing.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    pub async fn execute(&self, initial: StateRecord) -> StateRecord {
        self.execute_traced(initial).await.0
    }

    pub async fn execute_traced(&self, initial: StateRecord) -> (StateRecord, ExecutionTrace) {
        let start = Instant::now();
        let mut state = initial;
        let mut results = Vec::new();
        let mut route: Option<Route> = None;
        let mut cancelled = false;

        info!(
            transaction_id = %state.transaction_id,
            query = %state.query,
            "Workflow started"
        );

        if let Err(e) = state.validate_required() {
            error!(error = %e, "Initial state failed validation, aborting");
            state.push_fatal(&e);
            return self.finish(state, results, route, cancelled, start);
        }

        for step in self.graph.steps() {
            if self.cancel.is_cancelled() {
                warn!(transaction_id = %state.transaction_id, "Workflow cancelled");
                state.push_error("Workflow: cancelled");
                cancelled = true;
                break;
            }

            match step {
                Step::Route { node } => {
                    let id = &self.graph.node(*node).node.id;
                    let decided = self
                        .graph
                        .classifier()
                        .route(&mut state, self.context.as_deref())
                        .await;
                    info!(node_id = %id, route = %decided, "Route decided");
                    route = Some(decided);
                }
                Step::Run { node, gate } => {
                    let cnode = self.graph.node(*node);
                    if !is_open(*gate, route.as_ref()) {
                        debug!(node_id = %cnode.node.id, "Gate closed, skipping node");
                        results.push(skipped(cnode));
                        continue;
                    }

                    let before = state.clone();
                    let run = self.run_node(cnode, state).await;
                    self.check_writes(cnode, &before, &run.state);
                    results.push(result(cnode, &run));
                    let fatal = run.outcome.is_fatal();
                    state = run.state;
                    if fatal {
                        error!(node_id = %cnode.node.id, "Fatal stage failure, aborting workflow");
                        break;
                    }
                }
                Step::FanOut { branches } => {
                    let mut active = Vec::new();
                    for (idx, gate) in branches {
                        let cnode = self.graph.node(*idx);
                        if is_open(*gate, route.as_ref()) {
                            active.push(cnode);
                        } else {
                            debug!(node_id = %cnode.node.id, "Gate closed, skipping branch");
                            results.push(skipped(cnode));
                        }
                    }
                    if active.is_empty() {
                        continue;
                    }

                    info!(
                        branches = ?active.iter().map(|c| c.node.id.as_str()).collect::<Vec<_>>(),
                        "Fanning out"
                    );
                    let base = state.clone();
                    let runs = self
                        .collect(active.iter().map(|c| self.run_node(c, base.clone())))
                        .await;

                    let mut fatal = false;
                    for (cnode, run) in active.iter().zip(&runs) {
                        self.check_writes(cnode, &base, &run.state);
                        results.push(result(cnode, run));
                        fatal |= run.outcome.is_fatal();
                    }
                    let outputs: Vec<StateRecord> = runs.into_iter().map(|r| r.state).collect();
                    state = ContextMerger::merge_branches(&base, &outputs);
                    if fatal {
                        error!("Fatal branch failure, aborting workflow");
                        break;
                    }
                }
            }
        }

        self.finish(state, results, route, cancelled, start)
    }

    fn finish(
        &self,
        state: StateRecord,
        stage_results: Vec<StageResult>,
        route: Option<Route>,
        cancelled: bool,
        start: Instant,
    ) -> (StateRecord, ExecutionTrace) {
        let trace = ExecutionTrace {
            stage_results,
            route,
            total_elapsed_ms: start.elapsed().as_millis() as u64,
            status: state.status(),
            cancelled,
        };
        info!(
            transaction_id = %state.transaction_id,
            status = %trace.status,
            errors = state.errors.len(),
            total_tokens = state.total_tokens(),
            elapsed_ms = trace.total_elapsed_ms,
            "Workflow finished"
        );
        (state, trace)
    }

    async fn run_node(&self, cnode: &CompiledNode, state: StateRecord) -> StageRun {
        let NodeAction::Stage(stage) = &cnode.node.action else {
            // Route nodes are lowered to Step::Route and never run here.
            return StageRun {
                state,
                outcome: StageOutcome::Succeeded,
                elapsed_ms: 0,
            };
        };

        let fan_out = cnode.node.per_symbol.is_some()
            && self.graph.config().enable_parallel
            && state.symbols.len() > 1;
        if !fan_out {
            return stage.run(state, self.observer.as_deref()).await;
        }

        let start = Instant::now();
        let tasks = cnode.node.symbol_tasks(&state.symbols);
        if let Some(observer) = &self.observer {
            observer.on_start(stage.name(), &tasks);
        }
        debug!(stage = %stage.name(), symbols = ?state.symbols, "Per-symbol fan-out");

        let runs = self
            .collect(
                state
                    .symbols
                    .iter()
                    .map(|symbol| stage.run(state.scoped_to_symbol(symbol), None)),
            )
            .await;

        let fatal = runs.iter().find_map(|r| match &r.outcome {
            StageOutcome::Fatal(msg) => Some(msg.clone()),
            _ => None,
        });
        let failures: Vec<String> = runs
            .iter()
            .filter_map(|r| match &r.outcome {
                StageOutcome::Failed(msg) => Some(msg.clone()),
                _ => None,
            })
            .collect();
        let all_failed = failures.len() == runs.len();

        let outputs: Vec<StateRecord> = runs.into_iter().map(|r| r.state).collect();
        let merged = ContextMerger::merge_branches(&state, &outputs);

        let outcome = match fatal {
            Some(msg) => StageOutcome::Fatal(msg),
            None if all_failed => StageOutcome::Failed(failures.join("; ")),
            None => StageOutcome::Succeeded,
        };
        if let Some(observer) = &self.observer {
            match &outcome {
                StageOutcome::Succeeded => observer.on_complete(stage.name()),
                StageOutcome::Failed(msg) | StageOutcome::Fatal(msg) => {
                    observer.on_fail(stage.name(), msg)
                }
            }
        }

        StageRun {
            state: merged,
            outcome,
            elapsed_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// Await `runs` with bounded concurrency, or one by one. Output order
    /// always matches input order.
    async fn collect<F>(&self, runs: impl Iterator<Item = F>) -> Vec<StageRun>
    where
        F: Future<Output = StageRun>,
    {
        let config = self.graph.config();
        if config.concurrent_fanout {
            stream::iter(runs).buffered(config.max_fanout.max(1)).collect().await
        } else {
            let mut out = Vec::new();
            for run in runs {
                out.push(run.await);
            }
            out
        }
    }

    fn check_writes(&self, cnode: &CompiledNode, before: &StateRecord, after: &StateRecord) {
        let undeclared: Vec<&str> = changed_fields(before, after)
            .into_iter()
            .filter(|f| !cnode.may_write(*f))
            .map(|f| f.as_str())
            .collect();
        if !undeclared.is_empty() {
            warn!(
                node_id = %cnode.node.id,
                fields = ?undeclared,
                "Stage wrote fields it did not declare"
            );
        }
    }
}

fn result(cnode: &CompiledNode, run: &StageRun) -> StageResult {
    StageResult {
        node_id: cnode.node.id.clone(),
        stage: cnode.node.name().to_string(),
        succeeded: run.outcome.succeeded(),
        skipped: false,
        elapsed_ms: run.elapsed_ms,
    }
}

fn skipped(cnode: &CompiledNode) -> StageResult {
    StageResult {
        node_id: cnode.node.id.clone(),
        stage: cnode.node.name().to_string(),
        succeeded: true,
        skipped: true,
        elapsed_ms: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    use fingraph_core::config::WorkflowConfig;
    use fingraph_core::state::FATAL_PREFIX;
    use fingraph_core::types::{IntentFlags, QueryType};
    use fingraph_test_utils::{state, MockAgent, Recorded, RecordingObserver};

    use crate::graph::PipelineBuilder;
    use crate::intent::Branch;

    fn pipeline(config: WorkflowConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
            .research(MockAgent::research().into_arc())
            .analysis(MockAgent::analyst().into_arc())
            .filing(MockAgent::edgar().into_arc())
            .comparison(MockAgent::comparison().into_arc())
            .trend(MockAgent::trend().into_arc())
            .reporting(MockAgent::reporting().into_arc())
    }

    fn executor(builder: PipelineBuilder) -> GraphExecutor {
        GraphExecutor::new(Arc::new(builder.build().unwrap()))
    }

    #[tokio::test]
    async fn compare_trends_runs_comparison_and_trend() {
        let observer = RecordingObserver::new();
        let exec = executor(pipeline(WorkflowConfig::default())).with_observer(observer.clone());

        let (out, trace) = exec
            .execute_traced(state("Compare AAPL and MSFT trends", &["AAPL", "MSFT"]))
            .await;

        assert_eq!(out.status(), Status::Completed);
        assert_eq!(out.symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(out.research_data.len(), 2);
        assert_eq!(out.analyst_data.len(), 2);
        assert_eq!(out.comparison_data.len(), 2);
        assert_eq!(out.trend_analysis.len(), 2);
        assert!(out.edgar_data.is_empty());
        assert!(out.report.is_some());
        assert_eq!(out.query_type, Some(QueryType::Comparison));
        assert_eq!(out.citations.len(), 8);
        assert_eq!(out.token_usage["ResearchAgent"].total_tokens, 240);
        assert_eq!(out.total_tokens(), 920);

        let route = trace.route.unwrap();
        assert!(route.allows(Branch::Comparison) && route.allows(Branch::Trend));
        assert!(!route.allows(Branch::Filing));
        let filing = trace.stage_results.iter().find(|r| r.node_id == "filing").unwrap();
        assert!(filing.skipped);
        assert_eq!(trace.status, Status::Completed);

        let started = observer.started();
        assert_eq!(started.first().map(String::as_str), Some("ResearchAgent"));
        assert_eq!(started.last().map(String::as_str), Some("ReportingAgent"));
        assert!(!started.contains(&"EdgarAgent".to_string()));
        assert_eq!(started.iter().filter(|s| *s == "ResearchAgent").count(), 1);
        assert!(observer.events().contains(&Recorded::Start {
            stage: "ResearchAgent".into(),
            tasks: vec!["Gathering data for AAPL".into(), "Gathering data for MSFT".into()],
        }));
    }

    #[tokio::test]
    async fn invalid_initial_state_aborts_before_any_stage() {
        let research = MockAgent::research();
        let calls = research.calls();
        let exec = executor(PipelineBuilder::default().research(research.into_arc()));

        let mut input = state("Analyze AAPL", &["AAPL"]);
        input.query.clear();
        let (out, trace) = exec.execute_traced(input).await;

        assert_eq!(out.status(), Status::Aborted);
        assert!(out.errors[0].starts_with(FATAL_PREFIX));
        assert!(trace.stage_results.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn fatal_stage_short_circuits() {
        let reporting = MockAgent::reporting();
        let calls = reporting.calls();
        let exec = executor(
            PipelineBuilder::default()
                .research(MockAgent::research().into_arc())
                .analysis(MockAgent::analyst().fatal("analyst input corrupt").into_arc())
                .trend(MockAgent::trend().into_arc())
                .reporting(reporting.into_arc()),
        );

        let out = exec.execute(state("AAPL trend", &["AAPL"])).await;
        assert_eq!(out.status(), Status::Aborted);
        assert!(out.report.is_none());
        assert!(out.trend_analysis.is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn recoverable_failure_completes_with_errors() {
        let exec = executor(
            PipelineBuilder::default()
                .research(MockAgent::research().into_arc())
                .comparison(MockAgent::comparison().into_arc())
                .trend(MockAgent::trend().failing("no price history").into_arc())
                .reporting(MockAgent::reporting().into_arc()),
        );

        let (out, trace) = exec
            .execute_traced(state("Compare AAPL and MSFT trends", &["AAPL", "MSFT"]))
            .await;
        assert_eq!(out.status(), Status::CompletedWithErrors);
        assert_eq!(out.errors, vec!["TrendAgent: no price history"]);
        assert_eq!(out.comparison_data.len(), 2);
        assert!(out.report.is_some());
        let trend = trace.stage_results.iter().find(|r| r.node_id == "trend").unwrap();
        assert!(!trend.succeeded);
    }

    #[tokio::test]
    async fn panicking_branch_does_not_lose_sibling_output() {
        let exec = executor(
            PipelineBuilder::default()
                .research(MockAgent::research().into_arc())
                .comparison(MockAgent::comparison().panicking().into_arc())
                .trend(MockAgent::trend().into_arc()),
        );
        let out = exec.execute(state("Compare AAPL and MSFT trends", &["AAPL", "MSFT"])).await;
        assert_eq!(out.trend_analysis.len(), 2);
        assert!(out.errors[0].starts_with("ComparisonAgent: panicked"));
        assert_eq!(out.status(), Status::CompletedWithErrors);
    }

    #[tokio::test]
    async fn concurrent_and_sequential_fanout_agree() {
        let build = |concurrent: bool| {
            let config = WorkflowConfig {
                concurrent_fanout: concurrent,
                ..Default::default()
            };
            executor(
                PipelineBuilder::new(config)
                    .research(
                        MockAgent::research()
                            .with_delay(Duration::from_millis(5))
                            .into_arc(),
                    )
                    .comparison(
                        MockAgent::comparison()
                            .with_delay(Duration::from_millis(30))
                            .into_arc(),
                    )
                    .trend(MockAgent::trend().failing("stale data").into_arc())
                    .reporting(MockAgent::reporting().into_arc()),
            )
        };
        let input = state("Compare AAPL, MSFT and NVDA trends", &["AAPL", "MSFT", "NVDA"]);

        let a = build(true).execute(input.clone()).await;
        let b = build(false).execute(input).await;

        assert_eq!(a.research_data, b.research_data);
        assert_eq!(a.comparison_data, b.comparison_data);
        assert_eq!(a.trend_analysis, b.trend_analysis);
        assert_eq!(a.citations, b.citations);
        assert_eq!(a.errors, b.errors);
        assert_eq!(a.token_usage, b.token_usage);
        assert_eq!(a.report, b.report);
        assert_eq!(a.status(), b.status());
    }

    #[tokio::test]
    async fn preclassified_state_is_not_reclassified() {
        let comparison = MockAgent::comparison();
        let comparison_calls = comparison.calls();
        let exec = executor(
            PipelineBuilder::default()
                .research(MockAgent::research().into_arc())
                .comparison(comparison.into_arc())
                .trend(MockAgent::trend().into_arc()),
        );

        let flags = IntentFlags {
            is_trend: true,
            ..Default::default()
        }
        .with_symbol_count(1);
        let input = state("Compare AAPL vs MSFT", &["AAPL"])
            .with_classification(QueryType::Trend, flags);
        let out = exec.execute(input).await;

        assert_eq!(out.query_type, Some(QueryType::Trend));
        assert_eq!(out.trend_analysis.len(), 1);
        assert_eq!(comparison_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_token_stops_before_next_step() {
        let token = CancellationToken::new();
        token.cancel();
        let research = MockAgent::research();
        let calls = research.calls();
        let exec = executor(PipelineBuilder::default().research(research.into_arc()))
            .with_cancellation(token);

        let (out, trace) = exec.execute_traced(state("Analyze AAPL", &["AAPL"])).await;
        assert!(trace.cancelled);
        assert_eq!(out.errors, vec!["Workflow: cancelled"]);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn single_symbol_runs_research_once_unscoped() {
        let research = MockAgent::research();
        let calls = research.calls();
        let exec = executor(PipelineBuilder::default().research(research.into_arc()));
        let out = exec.execute(state("Analyze AAPL", &["AAPL"])).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(out.token_usage["ResearchAgent"].total_tokens, 120);
    }

    #[tokio::test]
    async fn executor_is_reusable_across_concurrent_runs() {
        let exec = executor(pipeline(WorkflowConfig::default()));
        let (a, b) = tokio::join!(
            exec.execute(state("Compare AAPL and MSFT", &["AAPL", "MSFT"])),
            exec.execute(state("Show the 10-K for NVDA", &["NVDA"])),
        );
        assert_ne!(a.transaction_id, b.transaction_id);
        assert!(a.edgar_data.is_empty());
        assert!(b.edgar_data.contains_key("NVDA"));
        assert_eq!(b.query_type, Some(QueryType::FilingAnalysis));
    }
}
