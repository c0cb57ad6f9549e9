use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use fingraph_agent::{
    Branch, ChannelObserver, GraphExecutor, IntentClassifier, PipelineBuilder, ProgressTracker,
};
use fingraph_core::config::WorkflowConfig;
use fingraph_core::event::StageStatus;
use fingraph_core::types::{IntentFlags, QueryType, Status};
use fingraph_test_utils::{state, MockAgent, StaticRefiner};

fn full_pipeline() -> PipelineBuilder {
    PipelineBuilder::new(WorkflowConfig::default())
        .research(MockAgent::research().into_arc())
        .analysis(MockAgent::analyst().into_arc())
        .filing(MockAgent::edgar().into_arc())
        .comparison(MockAgent::comparison().into_arc())
        .trend(MockAgent::trend().into_arc())
        .reporting(MockAgent::reporting().into_arc())
}

#[tokio::test]
async fn progress_channel_reports_execution_order() {
    let graph = Arc::new(full_pipeline().build().expect("build"));
    let input = state("Compare AAPL and MSFT trends", &["AAPL", "MSFT"]);

    let (observer, rx) = ChannelObserver::channel(input.transaction_id.clone(), 64);
    let tracker = ProgressTracker::spawn(rx, CancellationToken::new());

    let executor = GraphExecutor::new(graph).with_observer(Arc::new(observer));
    let out = executor.execute(input.clone()).await;
    drop(executor);
    let tracker = tracker.await.expect("tracker task");

    assert_eq!(out.status(), Status::Completed);

    let stages: Vec<&str> = tracker
        .execution_order()
        .iter()
        .map(|e| e.stage.as_str())
        .collect();
    assert_eq!(stages.first(), Some(&"ResearchAgent"));
    assert_eq!(stages.get(1), Some(&"AnalystAgent"));
    assert_eq!(stages.last(), Some(&"ReportingAgent"));
    assert!(stages.contains(&"ComparisonAgent"));
    assert!(stages.contains(&"TrendAgent"));
    assert!(!stages.contains(&"EdgarAgent"));
    assert!(tracker
        .execution_order()
        .iter()
        .all(|e| e.status == StageStatus::Completed && e.end_time.is_some()));
    assert!(tracker
        .events()
        .iter()
        .all(|e| e.transaction_id == input.transaction_id));
}

#[tokio::test]
async fn filing_keywords_take_priority_over_comparison() {
    let executor = GraphExecutor::new(Arc::new(full_pipeline().build().expect("build")));
    let (out, trace) = executor
        .execute_traced(state(
            "Compare AAPL vs MSFT in their latest 10-K filings",
            &["AAPL", "MSFT"],
        ))
        .await;

    assert_eq!(out.query_type, Some(QueryType::FilingAnalysis));
    let route = trace.route.expect("route decided");
    assert!(route.allows(Branch::Filing));
    assert!(route.allows(Branch::Comparison));
    assert!(!route.allows(Branch::Trend));
    assert_eq!(out.edgar_data.len(), 2);
    assert!(out.trend_analysis.is_empty());
}

#[tokio::test]
async fn symbols_are_extracted_when_absent() {
    let executor = GraphExecutor::new(Arc::new(
        PipelineBuilder::default()
            .research(MockAgent::research().into_arc())
            .analysis(MockAgent::analyst().into_arc())
            .comparison(MockAgent::comparison().into_arc())
            .build()
            .expect("build"),
    ));
    let out = executor
        .execute(state("Compare AAPL against NVDA", &[]))
        .await;

    // Research ran before routing and saw no symbols.
    assert!(out.research_data.is_empty());
    assert_eq!(out.symbols, vec!["AAPL", "NVDA"]);
    assert_eq!(out.comparison_data.len(), 2);
}

#[tokio::test]
async fn refiner_can_open_extra_branches() {
    let classifier = IntentClassifier::default().with_refiner(StaticRefiner::raising(IntentFlags {
        is_trend: true,
        ..Default::default()
    }));
    let executor = GraphExecutor::new(Arc::new(
        full_pipeline().classifier(classifier).build().expect("build"),
    ));
    let out = executor.execute(state("How is AAPL doing", &["AAPL"])).await;
    assert_eq!(out.query_type, Some(QueryType::Trend));
    assert_eq!(out.trend_analysis.len(), 1);
    assert!(out.comparison_data.is_empty());
}

#[tokio::test]
async fn failing_refiner_falls_back_to_rules() {
    let classifier = IntentClassifier::default().with_refiner(StaticRefiner::failing());
    let executor = GraphExecutor::new(Arc::new(
        full_pipeline().classifier(classifier).build().expect("build"),
    ));
    let out = executor.execute(state("How is AAPL doing", &["AAPL"])).await;
    assert_eq!(out.query_type, Some(QueryType::SingleEntity));
    assert_eq!(out.status(), Status::Completed);
    assert!(out.report.is_some());
}

#[tokio::test]
async fn rerunning_a_finished_state_keeps_routing() {
    let executor = GraphExecutor::new(Arc::new(full_pipeline().build().expect("build")));
    let first = executor
        .execute(state("Compare AAPL and MSFT trends", &["AAPL", "MSFT"]))
        .await;
    let second = executor.execute(first.clone()).await;

    assert_eq!(second.query_type, first.query_type);
    assert_eq!(second.intent_flags, first.intent_flags);
    assert_eq!(second.research_data, first.research_data);
    assert_eq!(second.citations, first.citations);
    assert_eq!(second.status(), Status::Completed);
}
