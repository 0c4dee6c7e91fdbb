//! Workflow orchestration (spec §4.E, §4.F): a linear phase-list driver
//! and a graph/DAG driver, both built on top of the Gateway Executor.

pub mod graph;
pub mod linear;

pub use graph::{
    EdgeCondition, GraphExecutionOptions, GraphExecutionResult, GraphBuilder, GraphWorkflowDriver,
    NodeId, NodeKind, ResultsMap, ValidationReport, WorkflowGraph,
};
pub use linear::{
    Branch, BranchExecutionDecision, BranchResult, BranchWorkflowResult, LinearWorkflowDriver,
    Phase, PhaseExecutionDecision, PhaseResult, WorkflowHooks, WorkflowOptions, WorkflowResult,
};
