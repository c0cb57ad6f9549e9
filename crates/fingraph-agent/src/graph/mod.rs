//! Workflow graph: declarative nodes and edges, compiled into a step plan
//! and run by the `GraphExecutor`.
//!
//! A node is either an agent stage or the route point. A node with several
//! outgoing edges fans out; its branches run on copies of the state and are
//! merged back by the `ContextMerger` before the join node runs. Routed edges
//! are only followed when the intent classifier selected their branch.

pub mod edge;
pub mod executor;
pub mod node;
pub mod pipeline;
pub mod workflow;

pub use edge::{Edge, EdgeCondition, END};
pub use executor::{ExecutionTrace, GraphExecutor, StageResult};
pub use node::{Node, NodeAction, StageKind};
pub use pipeline::PipelineBuilder;
pub use workflow::{CompiledGraph, CompiledNode, Step, WorkflowGraph};
