//! Gateway Executor: hierarchical config merge over a batch of
//! items, concurrent or sequential dispatch, and a `maxTimeout` race against
//! the whole batch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::attempt_loop::{AttemptConfig, AttemptLoop};
use crate::buffer::StableBuffer;
use crate::descriptor::{Item, ItemResponse, ItemResult};
use crate::error::{StableError, StableResult};

/// Execution mode for a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Concurrent,
    Sequential,
}

/// Gateway-wide options, merged with group- and item-level overrides
/// (global → group → item precedence,).
#[derive(Clone)]
pub struct GatewayOptions {
    pub execution_mode: ExecutionMode,
    pub stop_on_first_error: bool,
    pub max_timeout_ms: u64,
    /// Caps how many items may be in flight at once in
    /// [`ExecutionMode::Concurrent`] (spec §4.D "launch all items in
    /// parallel subject to maxConcurrentRequests"). `None` leaves the
    /// batch unbounded.
    pub max_concurrent_requests: Option<usize>,
    pub execution_context: HashMap<String, String>,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            execution_mode: ExecutionMode::Concurrent,
            stop_on_first_error: false,
            max_timeout_ms: 0,
            max_concurrent_requests: None,
            execution_context: HashMap::new(),
        }
    }
}

/// A named override layer. `None`
/// fields fall through to the next-lower-precedence layer.
#[derive(Clone, Default)]
pub struct ConfigOverride {
    pub attempts: Option<u32>,
    pub wait_ms: Option<u64>,
    pub execution_timeout_ms: Option<u64>,
}

impl ConfigOverride {
    fn apply(&self, base: &mut AttemptConfig) {
        if let Some(v) = self.attempts {
            base.attempts = v;
        }
        if let Some(v) = self.wait_ms {
            base.wait_ms = v;
        }
        if let Some(v) = self.execution_timeout_ms {
            base.execution_timeout_ms = v;
        }
    }
}

/// The gateway's merged view of config at three levels.
#[derive(Clone, Default)]
pub struct GatewayConfig {
    pub global: ConfigOverride,
    pub groups: HashMap<String, ConfigOverride>,
    pub items: HashMap<String, ConfigOverride>,
}

impl GatewayConfig {
    /// Merges global → group (by `item.group_id`, defaulting to `"default"`)
    /// → item (by `item.id`) into `base`, field-wise, last writer wins.
    pub fn resolve(&self, item: &Item, base: &AttemptConfig) -> AttemptConfig {
        let mut resolved = base.clone();
        self.global.apply(&mut resolved);
        let group_key = item.group_id.clone().unwrap_or_else(|| "default".to_string());
        if let Some(group) = self.groups.get(&group_key) {
            group.apply(&mut resolved);
        }
        if let Some(item_override) = self.items.get(&item.id) {
            item_override.apply(&mut resolved);
        }
        resolved
    }
}

/// Per-group aggregate metrics.
#[derive(Debug, Clone, Default)]
pub struct GroupMetrics {
    pub total: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub total_execution_time_ms: u64,
}

/// The gateway's batch result: item responses in input order plus
/// per-group aggregates.
#[derive(Debug, Clone)]
pub struct GatewayResult {
    pub responses: Vec<ItemResponse>,
    pub group_metrics: HashMap<String, GroupMetrics>,
}

/// Executes a batch of items under one shared [`StableBuffer`] and a
/// hierarchical config.
pub struct Gateway {
    attempt_loop: Arc<AttemptLoop>,
}

impl Gateway {
    pub fn new(attempt_loop: Arc<AttemptLoop>) -> Self {
        Self { attempt_loop }
    }

    pub async fn execute(
        &self,
        items: &[Item],
        base_config: &AttemptConfig,
        gateway_config: &GatewayConfig,
        options: &GatewayOptions,
        buffer: &Arc<StableBuffer>,
    ) -> StableResult<GatewayResult> {
        let run_batch = self.run_all(items, base_config, gateway_config, options, buffer);

        let item_results = if options.max_timeout_ms > 0 {
            let timeout = Duration::from_millis(options.max_timeout_ms);
            match tokio::time::timeout(timeout, run_batch).await {
                Ok(results) => results,
                Err(_) => {
                    let context = options
                        .execution_context
                        .iter()
                        .map(|(k, v)| format!(" {k}={v}"))
                        .collect::<String>();
                    return Err(StableError::GatewayTimeout { millis: options.max_timeout_ms, context });
                }
            }
        } else {
            run_batch.await
        };

        Ok(self.assemble(items, item_results))
    }

    /// Returns `(index, result)` pairs in ascending index order. In
    /// concurrent mode with `stop_on_first_error`, an item whose permit was
    /// never acquired because an earlier failure was already observed is
    /// omitted entirely rather than represented with a placeholder result
    /// (spec §8: `|output|=|B|` except in a `stopOnFirstError` early-stop).
    async fn run_all(
        &self,
        items: &[Item],
        base_config: &AttemptConfig,
        gateway_config: &GatewayConfig,
        options: &GatewayOptions,
        buffer: &Arc<StableBuffer>,
    ) -> Vec<(usize, StableResult<ItemResult>)> {
        match options.execution_mode {
            ExecutionMode::Concurrent => {
                let semaphore = options.max_concurrent_requests.map(|n| Arc::new(Semaphore::new(n.max(1))));
                let stopped = Arc::new(AtomicBool::new(false));
                let stop_on_first_error = options.stop_on_first_error;

                let futures = items.iter().enumerate().map(|(idx, item)| {
                    let resolved = gateway_config.resolve(item, base_config);
                    let semaphore = semaphore.clone();
                    let stopped = Arc::clone(&stopped);
                    async move {
                        if stop_on_first_error && stopped.load(Ordering::Acquire) {
                            return (idx, None);
                        }
                        let _permit = match &semaphore {
                            Some(sem) => Some(sem.acquire().await.expect("semaphore is never closed")),
                            None => None,
                        };
                        if stop_on_first_error && stopped.load(Ordering::Acquire) {
                            return (idx, None);
                        }
                        let result = self.attempt_loop.run(item, &resolved, buffer).await;
                        if stop_on_first_error {
                            let failed = matches!(&result, Ok(r) if !r.success) || result.is_err();
                            if failed {
                                stopped.store(true, Ordering::Release);
                            }
                        }
                        (idx, Some(result))
                    }
                });
                join_all(futures)
                    .await
                    .into_iter()
                    .filter_map(|(idx, result)| result.map(|r| (idx, r)))
                    .collect()
            }
            ExecutionMode::Sequential => {
                let mut results = Vec::with_capacity(items.len());
                for (idx, item) in items.iter().enumerate() {
                    let resolved = gateway_config.resolve(item, base_config);
                    let result = self.attempt_loop.run(item, &resolved, buffer).await;
                    let item_failed = matches!(&result, Ok(r) if !r.success) || result.is_err();
                    let stop = options.stop_on_first_error && item_failed;
                    results.push((idx, result));
                    if stop {
                        break;
                    }
                }
                results
            }
        }
    }

    fn assemble(&self, items: &[Item], results: Vec<(usize, StableResult<ItemResult>)>) -> GatewayResult {
        let mut responses = Vec::with_capacity(results.len());
        let mut group_metrics: HashMap<String, GroupMetrics> = HashMap::new();

        for (idx, result) in results.into_iter() {
            let item = &items[idx];
            let group_key = item.group_id.clone().unwrap_or_else(|| "default".to_string());
            let entry = group_metrics.entry(group_key).or_default();
            entry.total += 1;

            let (success, data, error, execution_time_ms) = match result {
                Ok(item_result) => {
                    let time = item_result.metrics.total_execution_time_ms;
                    (item_result.success, item_result.data, item_result.error, time)
                }
                Err(e) => (false, None, Some(e.to_string()), 0),
            };

            if success {
                entry.succeeded += 1;
            } else {
                entry.failed += 1;
            }
            entry.total_execution_time_ms += execution_time_ms;

            responses.push(ItemResponse {
                request_id: item.id.clone(),
                group_id: item.group_id.clone(),
                item_type: item.kind.type_name().to_string(),
                success,
                data,
                error,
            });
        }

        GatewayResult { responses, group_metrics }
    }
}
