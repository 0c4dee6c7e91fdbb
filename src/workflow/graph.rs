//! Graph Workflow Driver: a DAG of phase/conditional/parallel-group/
//! merge-point nodes executed by a token-flow scheduler.
//!
//! No `petgraph` dependency — the adjacency map and cycle detection below
//! are hand-rolled over `HashMap<NodeId, Vec<Edge>>`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use serde_json::Value;

use crate::attempt_loop::AttemptConfig;
use crate::buffer::StableBuffer;
use crate::descriptor::Item;
use crate::error::{StableError, StableResult};
use crate::gateway::{ConfigOverride, Gateway, GatewayConfig, GatewayOptions};
use crate::hooks::HookExecutionContext;
use crate::workflow::linear::{Phase, PhaseResult, WorkflowHooks};

pub type NodeId = String;

/// A snapshot of every PHASE result produced so far, keyed by node id
///.
pub type ResultsMap = HashMap<NodeId, PhaseResult>;

pub type ConditionalFn =
    Arc<dyn Fn(ResultsMap, Arc<StableBuffer>) -> BoxFuture<'static, NodeId> + Send + Sync>;
pub type CustomEdgeFn =
    Arc<dyn Fn(ResultsMap, Arc<StableBuffer>) -> BoxFuture<'static, bool> + Send + Sync>;

/// A node in the workflow graph.
pub enum NodeKind {
    Phase(Phase),
    Conditional(ConditionalFn),
    ParallelGroup(Vec<NodeId>),
    MergePoint(Vec<NodeId>),
}

/// Static/dynamic edge-traversal condition.
pub enum EdgeCondition {
    Success,
    Failure,
    Always,
    Custom(CustomEdgeFn),
}

struct Edge {
    to: NodeId,
    condition: EdgeCondition,
}

/// A built, validated (or validate-on-execute) workflow graph.
pub struct WorkflowGraph {
    nodes: HashMap<NodeId, NodeKind>,
    edges: HashMap<NodeId, Vec<Edge>>,
    entry_point: NodeId,
}

/// Result of [`WorkflowGraph::validate`].
#[derive(Debug, Clone)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub unreachable_nodes: Vec<NodeId>,
    pub cycles: Option<Vec<Vec<NodeId>>>,
}

/// Accumulates nodes and edges; validates on [`Self::build`] (spec §4.F
/// "Builder").
pub struct GraphBuilder {
    nodes: HashMap<NodeId, NodeKind>,
    edges: HashMap<NodeId, Vec<Edge>>,
    entry_point: Option<NodeId>,
    enforce_dag: bool,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self { nodes: HashMap::new(), edges: HashMap::new(), entry_point: None, enforce_dag: true }
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enforce_dag(mut self, enforce: bool) -> Self {
        self.enforce_dag = enforce;
        self
    }

    pub fn entry_point(mut self, id: impl Into<String>) -> Self {
        self.entry_point = Some(id.into());
        self
    }

    pub fn node(mut self, id: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.insert(id.into(), kind);
        self
    }

    pub fn edge(mut self, from: impl Into<String>, to: impl Into<String>, condition: EdgeCondition) -> Self {
        self.edges.entry(from.into()).or_default().push(Edge { to: to.into(), condition });
        self
    }

    /// Fails with a message containing `"DAG constraint violated"` and
    /// `"cycle"` when `enforceDag` and the graph contains a cycle
    /// (including self-loops).
    pub fn build(self) -> StableResult<WorkflowGraph> {
        let entry_point = self
            .entry_point
            .ok_or_else(|| StableError::InvalidInput("graph requires an entryPoint".to_string()))?;
        if !self.nodes.contains_key(&entry_point) {
            return Err(StableError::InvalidInput(format!("entryPoint {entry_point} is not a node")));
        }

        let graph = WorkflowGraph { nodes: self.nodes, edges: self.edges, entry_point };

        if graph.enforce_dag_cycles_exist() && self.enforce_dag {
            return Err(StableError::GraphInvalid(
                "DAG constraint violated: graph contains a cycle".to_string(),
            ));
        }

        Ok(graph)
    }
}

impl WorkflowGraph {
    fn neighbors(&self, id: &str) -> Vec<&str> {
        match self.edges.get(id) {
            Some(edges) => edges.iter().map(|e| e.to.as_str()).collect(),
            None => match self.nodes.get(id) {
                Some(NodeKind::ParallelGroup(children)) => children.iter().map(String::as_str).collect(),
                _ => Vec::new(),
            },
        }
    }

    fn enforce_dag_cycles_exist(&self) -> bool {
        !self.find_cycles().is_empty()
    }

    fn find_cycles(&self) -> Vec<Vec<NodeId>> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White,
            Gray,
            Black,
        }
        let mut color: HashMap<&str, Color> =
            self.nodes.keys().map(|k| (k.as_str(), Color::White)).collect();
        let mut stack: Vec<String> = Vec::new();
        let mut cycles = Vec::new();

        fn visit<'a>(
            node: &'a str,
            graph: &'a WorkflowGraph,
            color: &mut HashMap<&'a str, Color>,
            stack: &mut Vec<String>,
            cycles: &mut Vec<Vec<NodeId>>,
        ) where
            Color: 'a,
        {
            color.insert(node, Color::Gray);
            stack.push(node.to_string());
            for next in graph.neighbors(node) {
                match color.get(next).copied().unwrap_or(Color::White) {
                    Color::White => visit(next, graph, color, stack, cycles),
                    Color::Gray => {
                        let start = stack.iter().position(|n| n == next).unwrap_or(0);
                        cycles.push(stack[start..].to_vec());
                    }
                    Color::Black => {}
                }
            }
            stack.pop();
            color.insert(node, Color::Black);
        }

        for id in self.nodes.keys() {
            if color.get(id.as_str()).copied().unwrap_or(Color::White) == Color::White {
                visit(id.as_str(), self, &mut color, &mut stack, &mut cycles);
            }
        }
        cycles
    }

    /// Reports reachability from `entryPoint` and any cycles present
    ///.
    pub fn validate(&self) -> ValidationReport {
        let mut reachable = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(self.entry_point.clone());
        reachable.insert(self.entry_point.clone());
        while let Some(id) = queue.pop_front() {
            for next in self.neighbors(&id) {
                if reachable.insert(next.to_string()) {
                    queue.push_back(next.to_string());
                }
            }
        }

        let unreachable_nodes: Vec<NodeId> =
            self.nodes.keys().filter(|id| !reachable.contains(*id)).cloned().collect();
        let cycles = self.find_cycles();

        let mut errors = Vec::new();
        if !unreachable_nodes.is_empty() {
            errors.push(format!("{} node(s) unreachable from entryPoint", unreachable_nodes.len()));
        }
        if !cycles.is_empty() {
            errors.push("Invalid workflow graph: cycle detected".to_string());
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            unreachable_nodes,
            cycles: if cycles.is_empty() { None } else { Some(cycles) },
        }
    }
}

/// Execution-time switches for [`GraphWorkflowDriver::execute`].
#[derive(Clone)]
pub struct GraphExecutionOptions {
    pub validate_graph: bool,
}

impl Default for GraphExecutionOptions {
    /// Validation runs unless the caller opts out.
    fn default() -> Self {
        Self { validate_graph: true }
    }
}

/// The full graph run outcome.
#[derive(Clone, Default)]
pub struct GraphExecutionResult {
    pub phases: Vec<PhaseResult>,
    pub execution_history: Vec<PhaseResult>,
    pub results: ResultsMap,
}

/// Drives a [`WorkflowGraph`] with a token-flow scheduler.
pub struct GraphWorkflowDriver {
    gateway: Arc<Gateway>,
}

enum Token {
    Node(NodeId),
    MergeArrival { merge_id: NodeId, from: NodeId },
}

impl GraphWorkflowDriver {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub async fn execute(
        &self,
        workflow_id: &str,
        graph: &WorkflowGraph,
        base_config: &AttemptConfig,
        workflow_override: &ConfigOverride,
        hooks: &WorkflowHooks,
        options: &GraphExecutionOptions,
        buffer: &Arc<StableBuffer>,
    ) -> StableResult<GraphExecutionResult> {
        if options.validate_graph {
            let report = graph.validate();
            if report.cycles.is_some() {
                return Err(StableError::GraphInvalid(
                    "Invalid workflow graph: cycle detected".to_string(),
                ));
            }
        }

        let mut results: ResultsMap = HashMap::new();
        let mut history: Vec<PhaseResult> = Vec::new();
        let mut merge_arrivals: HashMap<NodeId, HashSet<NodeId>> = HashMap::new();
        let mut wave: Vec<Token> = vec![Token::Node(graph.entry_point.clone())];

        while !wave.is_empty() {
            let mut ready_nodes: Vec<NodeId> = Vec::new();
            let mut next_wave: Vec<Token> = Vec::new();

            for token in wave {
                match token {
                    Token::Node(id) => ready_nodes.push(id),
                    Token::MergeArrival { merge_id, from } => {
                        let upstream = match graph.nodes.get(&merge_id) {
                            Some(NodeKind::MergePoint(upstream)) => upstream.clone(),
                            _ => Vec::new(),
                        };
                        let arrived = merge_arrivals.entry(merge_id.clone()).or_default();
                        arrived.insert(from);
                        if upstream.iter().all(|u| arrived.contains(u)) {
                            ready_nodes.push(merge_id);
                        }
                    }
                }
            }

            let outcomes: Vec<(NodeId, Vec<NodeId>, Option<PhaseResult>)> = join_all(
                ready_nodes.into_iter().map(|id| self.process_node(workflow_id, &id, graph, base_config, workflow_override, hooks, &results, buffer)),
            )
            .await;

            for (id, downstream, phase_result) in outcomes {
                if let Some(result) = phase_result {
                    results.insert(id.clone(), result.clone());
                    history.push(result);
                }
                for next in downstream {
                    match graph.nodes.get(&next) {
                        Some(NodeKind::MergePoint(_)) => {
                            next_wave.push(Token::MergeArrival { merge_id: next, from: id.clone() })
                        }
                        _ => next_wave.push(Token::Node(next)),
                    }
                }
            }

            wave = next_wave;
        }

        let phases = history.clone();
        Ok(GraphExecutionResult { phases, execution_history: history, results })
    }

    /// Executes one node and returns `(node_id, downstream_node_ids,
    /// phase_result_if_any)`.
    async fn process_node(
        &self,
        workflow_id: &str,
        id: &str,
        graph: &WorkflowGraph,
        base_config: &AttemptConfig,
        workflow_override: &ConfigOverride,
        hooks: &WorkflowHooks,
        results_so_far: &ResultsMap,
        buffer: &Arc<StableBuffer>,
    ) -> (NodeId, Vec<NodeId>, Option<PhaseResult>) {
        match graph.nodes.get(id) {
            Some(NodeKind::Phase(phase)) => {
                let phase_result = self
                    .run_phase(workflow_id, phase.clone(), base_config, workflow_override, hooks, buffer)
                    .await;
                let downstream = self.edges_for(graph, id, &phase_result, buffer).await;
                (id.to_string(), downstream, Some(phase_result))
            }
            Some(NodeKind::Conditional(evaluate)) => {
                let next = evaluate(results_so_far.clone(), Arc::clone(buffer)).await;
                (id.to_string(), vec![next], None)
            }
            Some(NodeKind::ParallelGroup(children)) => (id.to_string(), children.clone(), None),
            Some(NodeKind::MergePoint(_)) => {
                let downstream = graph.edges.get(id).map(|edges| edges.iter().map(|e| e.to.clone()).collect()).unwrap_or_default();
                (id.to_string(), downstream, None)
            }
            None => (id.to_string(), Vec::new(), None),
        }
    }

    async fn edges_for(
        &self,
        graph: &WorkflowGraph,
        id: &str,
        phase_result: &PhaseResult,
        buffer: &Arc<StableBuffer>,
    ) -> Vec<NodeId> {
        let mut downstream = Vec::new();
        if let Some(edges) = graph.edges.get(id) {
            for edge in edges {
                let matches = match &edge.condition {
                    EdgeCondition::Success => phase_result.success,
                    EdgeCondition::Failure => !phase_result.success,
                    EdgeCondition::Always => true,
                    EdgeCondition::Custom(evaluate) => {
                        let mut snapshot = ResultsMap::new();
                        snapshot.insert(id.to_string(), phase_result.clone());
                        evaluate(snapshot, Arc::clone(buffer)).await
                    }
                };
                if matches {
                    downstream.push(edge.to.clone());
                }
            }
        }
        downstream
    }

    async fn run_phase(
        &self,
        workflow_id: &str,
        phase: Phase,
        base_config: &AttemptConfig,
        workflow_override: &ConfigOverride,
        hooks: &WorkflowHooks,
        buffer: &Arc<StableBuffer>,
    ) -> PhaseResult {
        let ctx = HookExecutionContext {
            workflow_id: Some(workflow_id.to_string()),
            phase_id: Some(phase.id.clone()),
            ..Default::default()
        };

        let mut effective_phase = phase.clone();
        if let Some(pre) = &hooks.pre_phase_execution {
            let wrapped = pre(phase.clone(), Arc::clone(buffer));
            let pre_result = match &hooks.state_persistence {
                Some(sp) => sp.wrap("prePhaseExecution", buffer, ctx.clone(), Value::Null, wrapped).await,
                None => wrapped.await,
            };
            if let Ok(modified) = pre_result {
                effective_phase = modified;
            }
        }

        let gateway_config = GatewayConfig {
            global: workflow_override.clone(),
            groups: HashMap::from([(
                effective_phase.id.clone(),
                effective_phase.common_config.clone().unwrap_or_default(),
            )]),
            items: effective_phase.item_overrides.clone(),
        };
        let items: Vec<Item> = effective_phase
            .items
            .iter()
            .cloned()
            .map(|item| item.with_group(effective_phase.id.clone()))
            .collect();

        let gateway_result = self
            .gateway
            .execute(&items, base_config, &gateway_config, &GatewayOptions::default(), buffer)
            .await;

        let phase_result = match gateway_result {
            Ok(result) => {
                let success = result.responses.iter().all(|r| r.success);
                PhaseResult {
                    phase_id: effective_phase.id.clone(),
                    execution_number: 1,
                    success,
                    gateway_result: Some(result),
                    error: None,
                }
            }
            Err(e) => {
                if let Some(handle_error) = &hooks.handle_phase_error {
                    handle_error(effective_phase.id.clone(), e.to_string(), Arc::clone(buffer)).await;
                }
                PhaseResult {
                    phase_id: effective_phase.id.clone(),
                    execution_number: 1,
                    success: false,
                    gateway_result: None,
                    error: Some(e.to_string()),
                }
            }
        };

        if let Some(complete) = &hooks.handle_phase_completion {
            let wrapped = complete(phase_result.clone(), Arc::clone(buffer));
            match &hooks.state_persistence {
                Some(sp) => {
                    let _ = sp
                        .wrap("handlePhaseCompletion", buffer, ctx.clone(), Value::Null, async {
                            wrapped.await;
                            Ok(())
                        })
                        .await;
                }
                None => wrapped.await,
            }
        }

        phase_result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt_loop::AttemptLoop;
    use crate::descriptor::{Method, Protocol, RequestDescriptor};
    use crate::transport::{Transport, TransportError, TransportResponse};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;

    struct AlwaysOk;

    #[async_trait]
    impl Transport for AlwaysOk {
        async fn dispatch(
            &self,
            _request: &RequestDescriptor,
            _timeout: Option<Duration>,
        ) -> Result<TransportResponse, TransportError> {
            Ok(TransportResponse {
                status: 200,
                data: Value::Null,
                status_text: "OK".to_string(),
                headers: Default::default(),
            })
        }
    }

    fn phase(id: &str) -> Phase {
        let item = Item::request(
            format!("{id}-item"),
            RequestDescriptor::builder("example.com", "/x").protocol(Protocol::Https).method(Method::Get).build(),
        );
        Phase::new(id, vec![item])
    }

    fn driver() -> GraphWorkflowDriver {
        let attempt_loop = Arc::new(AttemptLoop::new(Arc::new(AlwaysOk)));
        GraphWorkflowDriver::new(Arc::new(Gateway::new(attempt_loop)))
    }

    #[test]
    fn self_loop_is_rejected_as_a_cycle() {
        let err = GraphBuilder::new()
            .entry_point("a")
            .node("a", NodeKind::Phase(phase("a")))
            .edge("a", "a", EdgeCondition::Always)
            .build()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("DAG constraint violated"));
        assert!(msg.contains("cycle"));
    }

    #[tokio::test]
    async fn default_options_validate_and_reject_cyclic_graph() {
        let driver = driver();
        let buffer = StableBuffer::new();
        let graph = GraphBuilder::new()
            .enforce_dag(false)
            .entry_point("a")
            .node("a", NodeKind::Phase(phase("a")))
            .node("b", NodeKind::Phase(phase("b")))
            .edge("a", "b", EdgeCondition::Always)
            .edge("b", "a", EdgeCondition::Always)
            .build()
            .unwrap();

        let err = driver
            .execute(
                "wf-1",
                &graph,
                &AttemptConfig::default(),
                &ConfigOverride::default(),
                &WorkflowHooks::default(),
                &GraphExecutionOptions::default(),
                &buffer,
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn validate_reports_unreachable_nodes() {
        let graph = GraphBuilder::new()
            .enforce_dag(false)
            .entry_point("a")
            .node("a", NodeKind::Phase(phase("a")))
            .node("b", NodeKind::Phase(phase("b")))
            .build()
            .unwrap();
        let report = graph.validate();
        assert!(!report.valid);
        assert_eq!(report.unreachable_nodes, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn linear_chain_executes_in_order() {
        let driver = driver();
        let buffer = StableBuffer::new();
        let graph = GraphBuilder::new()
            .entry_point("a")
            .node("a", NodeKind::Phase(phase("a")))
            .node("b", NodeKind::Phase(phase("b")))
            .edge("a", "b", EdgeCondition::Success)
            .build()
            .unwrap();

        let result = driver
            .execute(
                "wf-1",
                &graph,
                &AttemptConfig::default(),
                &ConfigOverride::default(),
                &WorkflowHooks::default(),
                &GraphExecutionOptions::default(),
                &buffer,
            )
            .await
            .unwrap();

        assert_eq!(result.execution_history.len(), 2);
        assert!(result.results.contains_key("a"));
        assert!(result.results.contains_key("b"));
    }

    #[tokio::test]
    async fn parallel_group_fans_out_to_all_children() {
        let driver = driver();
        let buffer = StableBuffer::new();
        let graph = GraphBuilder::new()
            .entry_point("fan")
            .node("fan", NodeKind::ParallelGroup(vec!["b".to_string(), "c".to_string()]))
            .node("b", NodeKind::Phase(phase("b")))
            .node("c", NodeKind::Phase(phase("c")))
            .build()
            .unwrap();

        let result = driver
            .execute(
                "wf-1",
                &graph,
                &AttemptConfig::default(),
                &ConfigOverride::default(),
                &WorkflowHooks::default(),
                &GraphExecutionOptions::default(),
                &buffer,
            )
            .await
            .unwrap();

        assert_eq!(result.execution_history.len(), 2);
        assert!(result.results.contains_key("b"));
        assert!(result.results.contains_key("c"));
    }

    #[tokio::test]
    async fn merge_point_waits_for_all_upstream() {
        let driver = driver();
        let buffer = StableBuffer::new();
        let graph = GraphBuilder::new()
            .entry_point("fan")
            .node("fan", NodeKind::ParallelGroup(vec!["b".to_string(), "c".to_string()]))
            .node("b", NodeKind::Phase(phase("b")))
            .node("c", NodeKind::Phase(phase("c")))
            .node("merge", NodeKind::MergePoint(vec!["b".to_string(), "c".to_string()]))
            .node("d", NodeKind::Phase(phase("d")))
            .edge("b", "merge", EdgeCondition::Always)
            .edge("c", "merge", EdgeCondition::Always)
            .edge("merge", "d", EdgeCondition::Always)
            .build()
            .unwrap();

        let result = driver
            .execute(
                "wf-1",
                &graph,
                &AttemptConfig::default(),
                &ConfigOverride::default(),
                &WorkflowHooks::default(),
                &GraphExecutionOptions::default(),
                &buffer,
            )
            .await
            .unwrap();

        assert_eq!(result.execution_history.len(), 3);
        assert!(result.results.contains_key("d"));
    }
}
