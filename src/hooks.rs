//! Hook contracts and the State Persistence Wrapper (spec §4.G, §9 "Hook
//! polymorphism" design note).
//!
//! Hooks are modeled as a record of optional function values keyed by
//! their role rather than as methods on a polymorphic object, per spec
//! §9. Each hook is `Arc<dyn Fn(...) -> BoxFuture<...> + Send + Sync>` so
//! the same hook value can be shared across concurrent phases.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::buffer::{StableBuffer, TransactionContext};
use crate::error::{StableError, StableResult};

/// Execution context passed to a persistence function.
#[derive(Debug, Clone, Default)]
pub struct HookExecutionContext {
    pub workflow_id: Option<String>,
    pub branch_id: Option<String>,
    pub phase_id: Option<String>,
    pub request_id: Option<String>,
}

/// `persistenceFunction({buffer, executionContext, params}) -> Option<map>`.
/// A `Some` return is merged into the buffer (replacing same-name keys);
/// persistence-function failures never fail the wrapped hook.
pub type PersistenceFn = Arc<
    dyn Fn(
            Arc<StableBuffer>,
            HookExecutionContext,
            Value,
        ) -> BoxFuture<'static, StableResult<Option<HashMap<String, Value>>>>
        + Send
        + Sync,
>;

/// Load-before / store-after persistence callbacks for one hook role.
#[derive(Clone, Default)]
pub struct StatePersistence {
    pub load_before: Option<PersistenceFn>,
    pub store_after: Option<PersistenceFn>,
}

impl StatePersistence {
    /// Wrap `hook` so that, per call: load-before runs (merging its
    /// returned map into the buffer before `hook`), then `hook` runs, then
    /// store-after runs against the now-mutated buffer. Exactly one call
    /// per direction per invocation. Persistence failures are
    /// logged with the literal prefixes requires and never
    /// propagate.
    pub async fn wrap<T, F>(
        &self,
        hook_name: &str,
        buffer: &Arc<StableBuffer>,
        ctx: HookExecutionContext,
        params: Value,
        hook: F,
    ) -> StableResult<T>
    where
        F: std::future::Future<Output = StableResult<T>>,
    {
        if let Some(load) = &self.load_before {
            match load(Arc::clone(buffer), ctx.clone(), params.clone()).await {
                Ok(Some(patch)) => {
                    buffer
                        .run(
                            TransactionContext {
                                activity: "state-persistence-load".to_string(),
                                hook_name: Some(hook_name.to_string()),
                                workflow_id: ctx.workflow_id.clone(),
                                phase_id: ctx.phase_id.clone(),
                                request_id: ctx.request_id.clone(),
                            },
                            move |state| {
                                for (k, v) in patch {
                                    state.insert(k, v);
                                }
                            },
                        )
                        .await;
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(
                        hook = hook_name,
                        error = %e,
                        "State persistence: Failed to load state"
                    );
                }
            }
        }

        let result = hook.await;

        if let Some(store) = &self.store_after {
            if let Err(e) = store(Arc::clone(buffer), ctx.clone(), params).await {
                tracing::error!(
                    hook = hook_name,
                    error = %e,
                    "State persistence: Failed to store state"
                );
            }
        }

        result
    }
}

/// Receives `{data, params, commonBuffer}`, returns whether the response
/// is valid (spec §4.A step 7). `false` classifies the attempt
/// FAIL_VALIDATION even on an HTTP 2xx.
pub type ResponseAnalyzer =
    Arc<dyn Fn(Value, Value, Arc<StableBuffer>) -> BoxFuture<'static, bool> + Send + Sync>;

/// `true` converts an exhausted-retries failure into a failed `ItemResult`
/// instead of raising.
pub type FinalErrorAnalyzer =
    Arc<dyn Fn(&StableError) -> bool + Send + Sync>;

/// Receives `{inputParams, commonBuffer, itemOptions}`, may return a patch
/// of request/function options merged only if `applyPreExecutionConfigOverride`.
pub type PreExecutionHook = Arc<
    dyn Fn(Value, Arc<StableBuffer>, Value) -> BoxFuture<'static, StableResult<Option<Value>>>
        + Send
        + Sync,
>;

/// Fires on success when `logAllSuccessfulAttempts` is set.
pub type SuccessHook = Arc<dyn Fn(Value, Arc<StableBuffer>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Fires on failure when `logAllErrors` is set.
pub type ErrorHook =
    Arc<dyn Fn(StableError, Arc<StableBuffer>) -> BoxFuture<'static, ()> + Send + Sync>;
