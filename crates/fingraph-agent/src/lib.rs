pub mod graph;
pub mod intent;
pub mod merger;
pub mod parser;
pub mod progress;
pub mod stage;

pub use graph::{
    CompiledGraph, Edge, EdgeCondition, ExecutionTrace, GraphExecutor, Node, PipelineBuilder,
    StageKind, StageResult, WorkflowGraph,
};
pub use intent::{Branch, IntentClassifier, Route};
pub use merger::ContextMerger;
pub use parser::{FallbackQueryParser, RuleBasedQueryParser};
pub use progress::{ChannelObserver, ProgressTracker};
pub use stage::{AgentStage, StageOutcome, StageRun};
