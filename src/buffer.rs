//! StableBuffer: a single-writer, queue-serialized mutable map shared by
//! concurrent workflow phases and hook callbacks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;
use tokio::sync::Mutex;

/// Execution context threaded through a transaction for logging.
#[derive(Debug, Clone, Default)]
pub struct TransactionContext {
    pub activity: String,
    pub hook_name: Option<String>,
    pub workflow_id: Option<String>,
    pub phase_id: Option<String>,
    pub request_id: Option<String>,
}

/// One entry emitted to `logTransaction` after each transaction.
#[derive(Debug, Clone)]
pub struct TransactionLog {
    pub transaction_id: u64,
    pub activity: String,
    pub hook_name: Option<String>,
    pub workflow_id: Option<String>,
    pub phase_id: Option<String>,
    pub request_id: Option<String>,
    pub success: bool,
    pub state_before: HashMap<String, Value>,
    pub state_after: HashMap<String, Value>,
    pub error_message: Option<String>,
    pub queue_wait_ms: u64,
    pub execution_ms: u64,
}

/// Bounds checked on [`StableBuffer::metrics`]; a violation produces an
/// anomaly entry rather than failing the transaction.
#[derive(Debug, Clone, Default)]
pub struct MetricsGuardrails {
    pub max_total_transactions: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Anomaly {
    pub severity: &'static str,
    pub kind: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct GuardrailReport {
    pub is_valid: bool,
    pub anomalies: Vec<Anomaly>,
}

type LogSink = dyn Fn(TransactionLog) + Send + Sync;

/// The shared mutable buffer. Cloning an `Arc<StableBuffer>` handle is how
/// callers share it across concurrent activities; the buffer itself is
/// never destroyed by this crate (spec §3 lifecycle).
pub struct StableBuffer {
    state: Mutex<HashMap<String, Value>>,
    transaction_counter: AtomicU64,
    total_transactions: AtomicU64,
    log_sink: parking_lot::Mutex<Option<Arc<LogSink>>>,
    guardrails: parking_lot::Mutex<MetricsGuardrails>,
}

impl StableBuffer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HashMap::new()),
            transaction_counter: AtomicU64::new(0),
            total_transactions: AtomicU64::new(0),
            log_sink: parking_lot::Mutex::new(None),
            guardrails: parking_lot::Mutex::new(MetricsGuardrails::default()),
        })
    }

    pub fn with_initial(initial: HashMap<String, Value>) -> Arc<Self> {
        let buffer = Self::new();
        *buffer.state.try_lock().expect("fresh buffer is uncontended") = initial;
        buffer
    }

    pub fn set_log_sink(&self, sink: impl Fn(TransactionLog) + Send + Sync + 'static) {
        *self.log_sink.lock() = Some(Arc::new(sink));
    }

    pub fn set_guardrails(&self, guardrails: MetricsGuardrails) {
        *self.guardrails.lock() = guardrails;
    }

    /// Enqueue `f`, execute it with exclusive access to the live state, and
    /// resolve with `f`'s return value. The internal mutex preserves
    /// submission order (FIFO); reentry from within `f` would deadlock and
    /// is forbidden by contract.
    pub async fn run<F, R>(&self, ctx: TransactionContext, f: F) -> R
    where
        F: FnOnce(&mut HashMap<String, Value>) -> R,
    {
        let enqueued_at = Instant::now();
        let mut guard = self.state.lock().await;
        let queue_wait_ms = enqueued_at.elapsed().as_millis() as u64;

        let state_before = guard.clone();
        let started_at = Instant::now();
        let result = f(&mut guard);
        let execution_ms = started_at.elapsed().as_millis() as u64;
        let state_after = guard.clone();
        drop(guard);

        let transaction_id = self.transaction_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.total_transactions.fetch_add(1, Ordering::AcqRel);

        if let Some(sink) = self.log_sink.lock().clone() {
            sink(TransactionLog {
                transaction_id,
                activity: ctx.activity,
                hook_name: ctx.hook_name,
                workflow_id: ctx.workflow_id,
                phase_id: ctx.phase_id,
                request_id: ctx.request_id,
                success: true,
                state_before,
                state_after,
                error_message: None,
                queue_wait_ms,
                execution_ms,
            });
        }

        result
    }

    /// Alias for [`Self::run`], used at call sites that frame the closure
    /// as a discrete state transaction rather than an ad-hoc mutation.
    pub async fn transaction<F, R>(&self, ctx: TransactionContext, f: F) -> R
    where
        F: FnOnce(&mut HashMap<String, Value>) -> R,
    {
        self.run(ctx, f).await
    }

    /// A deep-copy snapshot; callers must not assume it stays current.
    pub async fn read(&self) -> HashMap<String, Value> {
        self.state.lock().await.clone()
    }

    /// The live state behind the same mutex `run` uses. Holding the guard
    /// blocks other transactions, so callers should treat it as a brief
    /// peek, not a place to stash long-lived mutable access (spec §4.C
    /// "callers must not mutate outside a `run`").
    pub async fn get_state(&self) -> tokio::sync::MutexGuard<'_, HashMap<String, Value>> {
        self.state.lock().await
    }

    /// Reconstructs a fresh buffer by re-running `handlers` (keyed by
    /// `hookName`) against the transaction log in order (spec §4.C
    /// "Replay"). Logs for hook names with no registered handler are
    /// skipped; the resulting buffer reflects only replayable activity.
    pub async fn replay(
        logs: &[TransactionLog],
        handlers: &HashMap<String, Arc<dyn Fn(&mut HashMap<String, Value>) + Send + Sync>>,
    ) -> Arc<Self> {
        let buffer = Self::new();
        for log in logs {
            let Some(hook_name) = &log.hook_name else { continue };
            let Some(handler) = handlers.get(hook_name) else { continue };
            let handler = Arc::clone(handler);
            buffer
                .run(
                    TransactionContext {
                        activity: format!("replay:{}", log.activity),
                        hook_name: Some(hook_name.clone()),
                        workflow_id: log.workflow_id.clone(),
                        phase_id: log.phase_id.clone(),
                        request_id: log.request_id.clone(),
                    },
                    move |state| handler(state),
                )
                .await;
        }
        buffer
    }

    pub fn metrics(&self) -> (u64, GuardrailReport) {
        let total = self.total_transactions.load(Ordering::Acquire);
        let guardrails = self.guardrails.lock().clone();
        let mut anomalies = Vec::new();
        if let Some(max) = guardrails.max_total_transactions {
            if total > max {
                anomalies.push(Anomaly {
                    severity: "high",
                    kind: "totalTransactions",
                    detail: format!("{total} transactions exceeds guardrail max {max}"),
                });
            }
        }
        (total, GuardrailReport { is_valid: anomalies.is_empty(), anomalies })
    }
}
