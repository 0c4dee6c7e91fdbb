//! Linear Workflow Driver: a phase list executed in order,
//! with decision-hook-driven non-linear control flow, a mixed-execution
//! barrier mode, and a branch-cohort mode.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::{join_all, BoxFuture};
use serde_json::Value;

use crate::attempt_loop::AttemptConfig;
use crate::buffer::StableBuffer;
use crate::descriptor::Item;
use crate::error::StableResult;
use crate::gateway::{ConfigOverride, Gateway, GatewayConfig, GatewayOptions, GatewayResult};
use crate::hooks::{HookExecutionContext, StatePersistence};

/// One phase of items executed as a gateway batch (spec §4.D/§4.E).
#[derive(Clone)]
pub struct Phase {
    pub id: String,
    pub items: Vec<Item>,
    pub common_config: Option<ConfigOverride>,
    pub item_overrides: HashMap<String, ConfigOverride>,
    pub mark_concurrent_phase: bool,
}

impl Phase {
    pub fn new(id: impl Into<String>, items: Vec<Item>) -> Self {
        Self {
            id: id.into(),
            items,
            common_config: None,
            item_overrides: HashMap::new(),
            mark_concurrent_phase: false,
        }
    }

    pub fn concurrent(mut self) -> Self {
        self.mark_concurrent_phase = true;
        self
    }

    pub fn with_common_config(mut self, config: ConfigOverride) -> Self {
        self.common_config = Some(config);
        self
    }
}

/// The outcome of running one phase (spec §4.E step 5).
#[derive(Clone)]
pub struct PhaseResult {
    pub phase_id: String,
    pub execution_number: u32,
    pub success: bool,
    pub gateway_result: Option<GatewayResult>,
    pub error: Option<String>,
}

/// One named sequence of phases. Cohorts of
/// branches marked `markConcurrentBranch` run in parallel; the rest run
/// serially.
#[derive(Clone)]
pub struct Branch {
    pub id: String,
    pub phases: Vec<Phase>,
    pub mark_concurrent_branch: bool,
}

impl Branch {
    pub fn new(id: impl Into<String>, phases: Vec<Phase>) -> Self {
        Self { id: id.into(), phases, mark_concurrent_branch: false }
    }

    pub fn concurrent(mut self) -> Self {
        self.mark_concurrent_branch = true;
        self
    }
}

/// The outcome of running one branch's phase list to completion or early
/// termination.
#[derive(Clone)]
pub struct BranchResult {
    pub branch_id: String,
    pub phase_results: Vec<PhaseResult>,
    pub terminated_early: bool,
    pub termination_reason: Option<String>,
}

/// Decision returned from a `branchDecisionHook`, mirroring
/// [`PhaseExecutionDecision`] with JUMP/SKIP targeting another branch id.
#[derive(Clone)]
pub enum BranchExecutionDecision {
    Continue,
    Skip,
    Replay,
    Jump { target_branch_id: String },
    Terminate { reason: String },
}

pub type BranchDecisionHook =
    Arc<dyn Fn(BranchResult, Arc<StableBuffer>) -> BoxFuture<'static, BranchExecutionDecision> + Send + Sync>;

/// The full multi-branch run outcome.
#[derive(Clone)]
pub struct BranchWorkflowResult {
    pub branch_results: Vec<BranchResult>,
    pub terminated_early: bool,
    pub termination_reason: Option<String>,
}

/// Decision returned from a `phaseDecisionHook`.
#[derive(Clone)]
pub enum PhaseExecutionDecision {
    Continue,
    Skip,
    Replay,
    Jump { target_phase_id: String },
    Terminate { reason: String },
}

/// A decision plus any phases to inject after the current one.
pub struct PhaseDecisionOutcome {
    pub decision: PhaseExecutionDecision,
    pub add_phases: Vec<Phase>,
}

pub type PrePhaseExecutionHook =
    Arc<dyn Fn(Phase, Arc<StableBuffer>) -> BoxFuture<'static, StableResult<Phase>> + Send + Sync>;
pub type HandlePhaseCompletionHook =
    Arc<dyn Fn(PhaseResult, Arc<StableBuffer>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type HandlePhaseErrorHook =
    Arc<dyn Fn(String, String, Arc<StableBuffer>) -> BoxFuture<'static, ()> + Send + Sync>;
pub type PhaseDecisionHook = Arc<
    dyn Fn(PhaseResult, Arc<StableBuffer>) -> BoxFuture<'static, PhaseDecisionOutcome> + Send + Sync,
>;

/// Workflow-level non-linear/mixed-execution switches.
#[derive(Clone, Default)]
pub struct WorkflowOptions {
    pub enable_non_linear_execution: bool,
    pub enable_mixed_execution: bool,
    pub stop_on_first_phase_error: bool,
    pub max_replay_count: Option<u32>,
}

/// Hooks consulted at each phase boundary (spec §4.E, §4.G).
#[derive(Clone, Default)]
pub struct WorkflowHooks {
    pub pre_phase_execution: Option<PrePhaseExecutionHook>,
    pub handle_phase_completion: Option<HandlePhaseCompletionHook>,
    pub handle_phase_error: Option<HandlePhaseErrorHook>,
    pub phase_decision: Option<PhaseDecisionHook>,
    pub branch_decision: Option<BranchDecisionHook>,
    pub state_persistence: Option<StatePersistence>,
}

/// The full run outcome: every phase executed, in execution order
/// (including replays), plus early-termination bookkeeping.
#[derive(Clone)]
pub struct WorkflowResult {
    pub phase_results: Vec<PhaseResult>,
    pub terminated_early: bool,
    pub termination_reason: Option<String>,
}

/// Drives a phase list to completion, honoring decision hooks and the
/// mixed-execution barrier.
pub struct LinearWorkflowDriver {
    gateway: Arc<Gateway>,
}

impl LinearWorkflowDriver {
    pub fn new(gateway: Arc<Gateway>) -> Self {
        Self { gateway }
    }

    pub async fn run(
        &self,
        workflow_id: &str,
        phases: Vec<Phase>,
        base_config: &AttemptConfig,
        workflow_override: &ConfigOverride,
        options: &WorkflowOptions,
        hooks: &WorkflowHooks,
        buffer: &Arc<StableBuffer>,
    ) -> StableResult<WorkflowResult> {
        let mut queue: Vec<Phase> = phases;
        let mut cursor = 0usize;
        let mut replay_counts: HashMap<String, u32> = HashMap::new();
        let mut execution_counts: HashMap<String, u32> = HashMap::new();
        let mut results = Vec::new();
        let mut terminated_early = false;
        let mut termination_reason = None;

        while cursor < queue.len() {
            let group_end = if options.enable_mixed_execution {
                self.find_concurrent_group_end(&queue, cursor)
            } else {
                cursor + 1
            };

            if group_end - cursor > 1 {
                let group_results = self
                    .run_concurrent_group(
                        workflow_id,
                        &queue[cursor..group_end],
                        base_config,
                        workflow_override,
                        hooks,
                        &mut execution_counts,
                        buffer,
                    )
                    .await;
                let any_failed = group_results.iter().any(|r| !r.success);
                results.extend(group_results);
                cursor = group_end;
                if options.stop_on_first_phase_error && any_failed {
                    terminated_early = true;
                    termination_reason = Some("stopOnFirstPhaseError".to_string());
                    break;
                }
                continue;
            }

            let phase = queue[cursor].clone();
            let (phase_result, outcome) = self
                .run_one_phase(workflow_id, phase, base_config, workflow_override, hooks, &mut execution_counts, buffer)
                .await;

            let failed = !phase_result.success;
            results.push(phase_result.clone());

            if options.stop_on_first_phase_error && failed {
                terminated_early = true;
                termination_reason = Some("stopOnFirstPhaseError".to_string());
                break;
            }

            let outcome = if options.enable_non_linear_execution {
                outcome
            } else {
                PhaseDecisionOutcome { decision: PhaseExecutionDecision::Continue, add_phases: Vec::new() }
            };

            for extra in outcome.add_phases {
                queue.insert(cursor + 1, extra);
            }

            match outcome.decision {
                PhaseExecutionDecision::Continue => {
                    cursor += 1;
                }
                PhaseExecutionDecision::Skip => {
                    cursor = (cursor + 2).min(queue.len());
                }
                PhaseExecutionDecision::Replay => {
                    let count = replay_counts.entry(phase_result.phase_id.clone()).or_insert(0);
                    *count += 1;
                    let exceeded = options.max_replay_count.is_some_and(|max| *count > max);
                    if exceeded {
                        cursor += 1;
                    }
                    // else: cursor unchanged, same phase executes again
                }
                PhaseExecutionDecision::Jump { target_phase_id } => {
                    match queue.iter().position(|p| p.id == target_phase_id) {
                        Some(idx) => cursor = idx,
                        None => cursor += 1,
                    }
                }
                PhaseExecutionDecision::Terminate { reason } => {
                    terminated_early = true;
                    termination_reason = Some(reason);
                    break;
                }
            }
        }

        Ok(WorkflowResult { phase_results: results, terminated_early, termination_reason })
    }

    /// Drives `branches` instead of `phases`.
    /// Each branch runs its own phase list through [`Self::run`], so
    /// per-phase decisions, mixed execution, and hooks behave identically
    /// inside a branch; `hooks.branch_decision` governs branch-to-branch
    /// control flow the same way `phase_decision` does for phases.
    pub async fn run_branches(
        &self,
        workflow_id: &str,
        branches: Vec<Branch>,
        base_config: &AttemptConfig,
        workflow_override: &ConfigOverride,
        options: &WorkflowOptions,
        hooks: &WorkflowHooks,
        buffer: &Arc<StableBuffer>,
    ) -> StableResult<BranchWorkflowResult> {
        let mut queue: Vec<Branch> = branches;
        let mut cursor = 0usize;
        let mut replay_counts: HashMap<String, u32> = HashMap::new();
        let mut results = Vec::new();
        let mut terminated_early = false;
        let mut termination_reason = None;

        while cursor < queue.len() {
            let group_end = self.find_concurrent_branch_group_end(&queue, cursor);

            if group_end - cursor > 1 {
                let group_results = self
                    .run_concurrent_branch_group(
                        workflow_id,
                        &queue[cursor..group_end],
                        base_config,
                        workflow_override,
                        options,
                        hooks,
                        buffer,
                    )
                    .await;
                let any_failed = group_results.iter().any(Self::branch_failed);
                results.extend(group_results);
                cursor = group_end;
                if options.stop_on_first_phase_error && any_failed {
                    terminated_early = true;
                    termination_reason = Some("stopOnFirstPhaseError".to_string());
                    break;
                }
                continue;
            }

            let branch = queue[cursor].clone();
            let branch_result = self
                .run_one_branch(workflow_id, branch, base_config, workflow_override, options, hooks, buffer)
                .await;

            let failed = Self::branch_failed(&branch_result);
            results.push(branch_result.clone());

            if options.stop_on_first_phase_error && failed {
                terminated_early = true;
                termination_reason = Some("stopOnFirstPhaseError".to_string());
                break;
            }

            let decision = if let Some(decide) = &hooks.branch_decision {
                decide(branch_result.clone(), Arc::clone(buffer)).await
            } else {
                BranchExecutionDecision::Continue
            };

            match decision {
                BranchExecutionDecision::Continue => {
                    cursor += 1;
                }
                BranchExecutionDecision::Skip => {
                    cursor = (cursor + 2).min(queue.len());
                }
                BranchExecutionDecision::Replay => {
                    let count = replay_counts.entry(branch_result.branch_id.clone()).or_insert(0);
                    *count += 1;
                    let exceeded = options.max_replay_count.is_some_and(|max| *count > max);
                    if exceeded {
                        cursor += 1;
                    }
                }
                BranchExecutionDecision::Jump { target_branch_id } => {
                    match queue.iter().position(|b| b.id == target_branch_id) {
                        Some(idx) => cursor = idx,
                        None => cursor += 1,
                    }
                }
                BranchExecutionDecision::Terminate { reason } => {
                    terminated_early = true;
                    termination_reason = Some(reason);
                    break;
                }
            }
        }

        Ok(BranchWorkflowResult { branch_results: results, terminated_early, termination_reason })
    }

    fn branch_failed(result: &BranchResult) -> bool {
        result.terminated_early || result.phase_results.iter().any(|p| !p.success)
    }

    fn find_concurrent_branch_group_end(&self, queue: &[Branch], start: usize) -> usize {
        if !queue[start].mark_concurrent_branch {
            return start + 1;
        }
        let mut end = start + 1;
        while end < queue.len() && queue[end].mark_concurrent_branch {
            end += 1;
        }
        end
    }

    async fn run_concurrent_branch_group(
        &self,
        workflow_id: &str,
        branches: &[Branch],
        base_config: &AttemptConfig,
        workflow_override: &ConfigOverride,
        options: &WorkflowOptions,
        hooks: &WorkflowHooks,
        buffer: &Arc<StableBuffer>,
    ) -> Vec<BranchResult> {
        let futures = branches.iter().map(|branch| {
            self.run_one_branch(workflow_id, branch.clone(), base_config, workflow_override, options, hooks, buffer)
        });
        join_all(futures).await
    }

    async fn run_one_branch(
        &self,
        workflow_id: &str,
        branch: Branch,
        base_config: &AttemptConfig,
        workflow_override: &ConfigOverride,
        options: &WorkflowOptions,
        hooks: &WorkflowHooks,
        buffer: &Arc<StableBuffer>,
    ) -> BranchResult {
        let result = self
            .run(workflow_id, branch.phases, base_config, workflow_override, options, hooks, buffer)
            .await
            .unwrap_or_else(|e| WorkflowResult {
                phase_results: Vec::new(),
                terminated_early: true,
                termination_reason: Some(e.to_string()),
            });

        BranchResult {
            branch_id: branch.id,
            phase_results: result.phase_results,
            terminated_early: result.terminated_early,
            termination_reason: result.termination_reason,
        }
    }

    fn find_concurrent_group_end(&self, queue: &[Phase], start: usize) -> usize {
        if !queue[start].mark_concurrent_phase {
            return start + 1;
        }
        let mut end = start + 1;
        while end < queue.len() && queue[end].mark_concurrent_phase {
            end += 1;
        }
        end
    }

    async fn run_concurrent_group(
        &self,
        workflow_id: &str,
        phases: &[Phase],
        base_config: &AttemptConfig,
        workflow_override: &ConfigOverride,
        hooks: &WorkflowHooks,
        execution_counts: &mut HashMap<String, u32>,
        buffer: &Arc<StableBuffer>,
    ) -> Vec<PhaseResult> {
        for phase in phases {
            *execution_counts.entry(phase.id.clone()).or_insert(0) += 1;
        }
        let futures = phases.iter().map(|phase| {
            let phase = phase.clone();
            let execution_number = execution_counts[&phase.id];
            async move {
                self.execute_phase_body(workflow_id, phase, base_config, workflow_override, hooks, execution_number, buffer)
                    .await
            }
        });
        join_all(futures).await
    }

    async fn run_one_phase(
        &self,
        workflow_id: &str,
        phase: Phase,
        base_config: &AttemptConfig,
        workflow_override: &ConfigOverride,
        hooks: &WorkflowHooks,
        execution_counts: &mut HashMap<String, u32>,
        buffer: &Arc<StableBuffer>,
    ) -> (PhaseResult, PhaseDecisionOutcome) {
        let execution_number = {
            let count = execution_counts.entry(phase.id.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let phase_result = self
            .execute_phase_body(workflow_id, phase, base_config, workflow_override, hooks, execution_number, buffer)
            .await;

        let outcome = if let Some(decide) = &hooks.phase_decision {
            decide(phase_result.clone(), Arc::clone(buffer)).await
        } else {
            PhaseDecisionOutcome { decision: PhaseExecutionDecision::Continue, add_phases: Vec::new() }
        };

        (phase_result, outcome)
    }

    /// Steps 1–6 of for a single phase (pre-phase hook,
    /// effective-config resolution, gateway call, completion/error hook).
    async fn execute_phase_body(
        &self,
        workflow_id: &str,
        phase: Phase,
        base_config: &AttemptConfig,
        workflow_override: &ConfigOverride,
        hooks: &WorkflowHooks,
        execution_number: u32,
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
                    execution_number,
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
                    execution_number,
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
    use crate::descriptor::{Method, Protocol, RequestDescriptor};
    use crate::transport::{Transport, TransportError, TransportResponse};
    use async_trait::async_trait;
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

    fn driver() -> LinearWorkflowDriver {
        let attempt_loop = Arc::new(crate::attempt_loop::AttemptLoop::new(Arc::new(AlwaysOk)));
        LinearWorkflowDriver::new(Arc::new(Gateway::new(attempt_loop)))
    }

    #[tokio::test]
    async fn runs_all_phases_in_order_by_default() {
        let driver = driver();
        let buffer = StableBuffer::new();
        let phases = vec![phase("p1"), phase("p2"), phase("p3")];
        let result = driver
            .run(
                "wf-1",
                phases,
                &AttemptConfig::default(),
                &ConfigOverride::default(),
                &WorkflowOptions::default(),
                &WorkflowHooks::default(),
                &buffer,
            )
            .await
            .unwrap();

        assert_eq!(result.phase_results.len(), 3);
        assert!(!result.terminated_early);
        assert_eq!(result.phase_results[0].phase_id, "p1");
        assert_eq!(result.phase_results[2].phase_id, "p3");
    }

    #[tokio::test]
    async fn jump_decision_skips_intermediate_phases() {
        let driver = driver();
        let buffer = StableBuffer::new();
        let phases = vec![phase("p1"), phase("p2"), phase("p3")];

        let hooks = WorkflowHooks {
            phase_decision: Some(Arc::new(|result, _buffer| {
                Box::pin(async move {
                    if result.phase_id == "p1" {
                        PhaseDecisionOutcome {
                            decision: PhaseExecutionDecision::Jump { target_phase_id: "p3".to_string() },
                            add_phases: Vec::new(),
                        }
                    } else {
                        PhaseDecisionOutcome { decision: PhaseExecutionDecision::Continue, add_phases: Vec::new() }
                    }
                })
            })),
            ..Default::default()
        };

        let result = driver
            .run(
                "wf-1",
                phases,
                &AttemptConfig::default(),
                &ConfigOverride::default(),
                &WorkflowOptions { enable_non_linear_execution: true, ..Default::default() },
                &hooks,
                &buffer,
            )
            .await
            .unwrap();

        let phase_ids: Vec<&str> = result.phase_results.iter().map(|r| r.phase_id.as_str()).collect();
        assert_eq!(phase_ids, vec!["p1", "p3"]);
    }

    #[tokio::test]
    async fn terminate_decision_stops_the_workflow() {
        let driver = driver();
        let buffer = StableBuffer::new();
        let phases = vec![phase("p1"), phase("p2")];

        let hooks = WorkflowHooks {
            phase_decision: Some(Arc::new(|_result, _buffer| {
                Box::pin(async move {
                    PhaseDecisionOutcome {
                        decision: PhaseExecutionDecision::Terminate { reason: "stop".to_string() },
                        add_phases: Vec::new(),
                    }
                })
            })),
            ..Default::default()
        };

        let result = driver
            .run(
                "wf-1",
                phases,
                &AttemptConfig::default(),
                &ConfigOverride::default(),
                &WorkflowOptions { enable_non_linear_execution: true, ..Default::default() },
                &hooks,
                &buffer,
            )
            .await
            .unwrap();

        assert!(result.terminated_early);
        assert_eq!(result.termination_reason.as_deref(), Some("stop"));
        assert_eq!(result.phase_results.len(), 1);
    }

    #[tokio::test]
    async fn mixed_execution_runs_marked_phases_concurrently() {
        let driver = driver();
        let buffer = StableBuffer::new();
        let phases = vec![phase("p1").concurrent(), phase("p2").concurrent(), phase("p3")];

        let result = driver
            .run(
                "wf-1",
                phases,
                &AttemptConfig::default(),
                &ConfigOverride::default(),
                &WorkflowOptions { enable_mixed_execution: true, ..Default::default() },
                &WorkflowHooks::default(),
                &buffer,
            )
            .await
            .unwrap();

        assert_eq!(result.phase_results.len(), 3);
        assert!(result.phase_results.iter().all(|r| r.success));
    }
}
