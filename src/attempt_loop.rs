//! The attempt loop: one retry-governed execution of a
//! request or function with every policy applied in a fixed order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::buffer::StableBuffer;
use crate::descriptor::{
    AttemptRecord, Classification, FunctionDescriptor, InfrastructureMetrics, Item, ItemKind,
    ItemMetrics, ItemResult,
};
use crate::error::{is_retryable_status, StableError, StableResult};
use crate::fingerprint::{fingerprint_function, fingerprint_request};
use crate::hooks::{
    ErrorHook, FinalErrorAnalyzer, HookExecutionContext, PreExecutionHook, ResponseAnalyzer,
    StatePersistence, SuccessHook,
};
use crate::resilience::{Cache, CircuitBreaker, ConcurrencyLimiter, RateLimiter};
use crate::transport::Transport;

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Fixed,
    Linear,
    Exponential,
}

impl RetryStrategy {
    /// `k` is the 1-based ordinal of the attempt that just failed. Result
    /// is clamped to `max_allowed_wait_ms` when that bound is positive.
    pub fn delay_ms(self, wait_ms: u64, k: u32, max_allowed_wait_ms: u64) -> u64 {
        let raw = match self {
            RetryStrategy::Fixed => wait_ms,
            RetryStrategy::Linear => wait_ms.saturating_mul(k as u64),
            RetryStrategy::Exponential => wait_ms.saturating_mul(1u64 << (k.saturating_sub(1))),
        };
        if max_allowed_wait_ms > 0 {
            raw.min(max_allowed_wait_ms)
        } else {
            raw
        }
    }
}

/// The effective, fully-resolved configuration for one attempt-loop
/// invocation.
#[derive(Clone)]
pub struct AttemptConfig {
    pub attempts: u32,
    pub wait_ms: u64,
    pub retry_strategy: RetryStrategy,
    pub max_allowed_wait_ms: u64,
    pub perform_all_attempts: bool,
    pub log_all_errors: bool,
    pub log_all_successful_attempts: bool,
    pub return_result: bool,
    pub execution_timeout_ms: u64,
    pub apply_pre_execution_config_override: bool,
    pub continue_on_pre_execution_hook_failure: bool,
    pub cacheable_headers: Vec<String>,
    pub cache: Option<Arc<Cache>>,
    pub circuit_breaker: Option<Arc<CircuitBreaker>>,
    pub rate_limiter: Option<Arc<RateLimiter>>,
    pub concurrency_limiter: Option<Arc<ConcurrencyLimiter>>,
    pub response_analyzer: Option<ResponseAnalyzer>,
    pub final_error_analyzer: Option<FinalErrorAnalyzer>,
    pub pre_execution: Option<PreExecutionHook>,
    pub handle_successful_attempt_data: Option<SuccessHook>,
    pub handle_errors: Option<ErrorHook>,
    pub state_persistence: Option<StatePersistence>,
    pub execution_context: HashMap<String, String>,
}

impl Default for AttemptConfig {
    fn default() -> Self {
        Self {
            attempts: 1,
            wait_ms: 0,
            retry_strategy: RetryStrategy::Fixed,
            max_allowed_wait_ms: 0,
            perform_all_attempts: false,
            log_all_errors: false,
            log_all_successful_attempts: false,
            return_result: true,
            execution_timeout_ms: 0,
            apply_pre_execution_config_override: false,
            continue_on_pre_execution_hook_failure: true,
            cacheable_headers: Vec::new(),
            cache: None,
            circuit_breaker: None,
            rate_limiter: None,
            concurrency_limiter: None,
            response_analyzer: None,
            final_error_analyzer: None,
            pre_execution: None,
            handle_successful_attempt_data: None,
            handle_errors: None,
            state_persistence: None,
            execution_context: HashMap::new(),
        }
    }
}

/// Drives the per-attempt algorithm in strict step order.
pub struct AttemptLoop {
    transport: Arc<dyn Transport>,
}

impl AttemptLoop {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Executes `item` up to `config.attempts` times, returning an
    /// `ItemResult`. Raises only when `config.return_result` is false and
    /// all attempts were exhausted without a `finalErrorAnalyzer` verdict.
    pub async fn run(
        &self,
        item: &Item,
        config: &AttemptConfig,
        buffer: &Arc<StableBuffer>,
    ) -> StableResult<ItemResult> {
        if config.attempts < 1 {
            return Err(StableError::InvalidInput("attempts must be >= 1".to_string()));
        }

        let deadline = if config.execution_timeout_ms > 0 {
            Some(Instant::now() + Duration::from_millis(config.execution_timeout_ms))
        } else {
            None
        };

        let mut attempts = Vec::new();
        let mut last_success_data: Option<Value> = None;
        let mut last_error: Option<StableError> = None;
        let mut any_success = false;

        for k in 1..=config.attempts {
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(self.timeout_result(attempts, config));
                }
            }

            let started_at = Instant::now();
            let started_chrono = Utc::now();
            let outcome = self.run_one_attempt(item, config, buffer, k, deadline).await;
            let ended_chrono = Utc::now();
            let execution_time_ms = started_at.elapsed().as_millis() as u64;

            let (classification, http_status, error, retryable) = match &outcome {
                Ok(data) => (Classification::Success, extract_status(data), None, false),
                Err(AttemptError::Classified { classification, http_status, message, retryable }) => {
                    (*classification, *http_status, Some(message.clone()), *retryable)
                }
            };

            attempts.push(AttemptRecord {
                ordinal: k,
                of: config.attempts,
                started_at: started_chrono,
                ended_at: ended_chrono,
                execution_time_ms,
                classification,
                http_status,
                error: error.clone(),
                retryable,
            });

            self.run_post_attempt_hooks(item, config, buffer, k, &outcome).await;

            match outcome {
                Ok(success_data) => {
                    any_success = true;
                    last_success_data = Some(success_data);
                    if !config.perform_all_attempts {
                        break;
                    }
                }
                Err(AttemptError::Classified { classification, http_status, message, retryable }) => {
                    let stable_error = classification_to_error(classification, http_status, &message);
                    last_error = Some(stable_error);

                    if k >= config.attempts || !retryable {
                        break;
                    }

                    let delay_ms =
                        config.retry_strategy.delay_ms(config.wait_ms, k, config.max_allowed_wait_ms);
                    if delay_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    }
                }
            }
        }

        let successful_attempts = attempts.iter().filter(|a| a.classification == Classification::Success).count() as u32;
        let failed_attempts = attempts.len() as u32 - successful_attempts;
        let total_execution_time_ms: u64 = attempts.iter().map(|a| a.execution_time_ms).sum();
        let metrics = ItemMetrics {
            total_attempts: attempts.len() as u32,
            successful_attempts,
            failed_attempts,
            total_execution_time_ms,
            average_attempt_time_ms: if attempts.is_empty() {
                0.0
            } else {
                total_execution_time_ms as f64 / attempts.len() as f64
            },
            infrastructure_metrics: self.infrastructure_metrics(config),
        };

        if any_success {
            return Ok(ItemResult {
                success: true,
                data: last_success_data,
                error: None,
                attempts,
                metrics,
            });
        }

        let error = last_error.unwrap_or(StableError::InvalidInput("no attempts executed".to_string()));
        let convert_to_failed_result = match &config.final_error_analyzer {
            Some(analyzer) => analyzer(&error),
            None => true,
        };

        if convert_to_failed_result {
            Ok(ItemResult { success: false, data: None, error: Some(error.to_string()), attempts, metrics })
        } else if config.return_result {
            Ok(ItemResult { success: false, data: None, error: Some(error.to_string()), attempts, metrics })
        } else {
            Err(error)
        }
    }

    fn timeout_result(&self, attempts: Vec<AttemptRecord>, config: &AttemptConfig) -> ItemResult {
        let successful_attempts =
            attempts.iter().filter(|a| a.classification == Classification::Success).count() as u32;
        let failed_attempts = attempts.len() as u32 - successful_attempts;
        let total_execution_time_ms: u64 = attempts.iter().map(|a| a.execution_time_ms).sum();
        warn!(millis = config.execution_timeout_ms, "attempt loop execution timeout exceeded");
        ItemResult {
            success: false,
            data: None,
            error: Some(
                StableError::Timeout { millis: config.execution_timeout_ms }.to_string(),
            ),
            attempts: attempts.clone(),
            metrics: ItemMetrics {
                total_attempts: attempts.len() as u32,
                successful_attempts,
                failed_attempts,
                total_execution_time_ms,
                average_attempt_time_ms: if attempts.is_empty() {
                    0.0
                } else {
                    total_execution_time_ms as f64 / attempts.len() as f64
                },
                infrastructure_metrics: self.infrastructure_metrics(config),
            },
        }
    }

    fn infrastructure_metrics(&self, config: &AttemptConfig) -> InfrastructureMetrics {
        InfrastructureMetrics {
            circuit_breaker: config
                .circuit_breaker
                .as_ref()
                .and_then(|cb| serde_json::to_value(cb.metrics()).ok()),
            cache: config.cache.as_ref().and_then(|c| serde_json::to_value(c.metrics()).ok()),
            rate_limiter: config
                .rate_limiter
                .as_ref()
                .and_then(|r| serde_json::to_value(r.metrics()).ok()),
            concurrency_limiter: config
                .concurrency_limiter
                .as_ref()
                .and_then(|c| serde_json::to_value(c.metrics()).ok()),
        }
    }

    /// Steps 1–8 of for a single attempt.
    async fn run_one_attempt(
        &self,
        item: &Item,
        config: &AttemptConfig,
        buffer: &Arc<StableBuffer>,
        ordinal: u32,
        deadline: Option<Instant>,
    ) -> Result<Value, AttemptError> {
        // Step 1: pre-execution hook. A returned patch is merged into the
        // request/function options only when `applyPreExecutionConfigOverride`
        // is set; otherwise the hook may observe but not mutate the attempt.
        let mut effective_item = item.clone();
        if let Some(pre) = &config.pre_execution {
            let ctx = HookExecutionContext { request_id: Some(item.id.clone()), ..Default::default() };
            let params = serde_json::json!({ "ordinal": ordinal });
            let wrapped = async {
                pre(params.clone(), Arc::clone(buffer), serde_json::json!({})).await
            };
            let outcome = match &config.state_persistence {
                Some(sp) => sp.wrap("preExecution", buffer, ctx, params, wrapped).await,
                None => wrapped.await,
            };
            match outcome {
                Ok(Some(patch)) if config.apply_pre_execution_config_override => {
                    effective_item = apply_pre_execution_patch(&effective_item, &patch);
                }
                Ok(_) => {}
                Err(e) if !config.continue_on_pre_execution_hook_failure => {
                    return Err(AttemptError::Classified {
                        classification: Classification::FailValidation,
                        http_status: None,
                        message: format!("pre-execution hook failed: {e}"),
                        retryable: true,
                    });
                }
                Err(e) => {
                    tracing::error!(error = %e, "pre-execution hook failed, continuing");
                }
            }
        }
        let item = &effective_item;

        // Step 2: cache lookup (requests always; functions only when flagged).
        let fingerprint = self.fingerprint_of(item, config);
        if let (Some(cache), Some(fp)) = (&config.cache, &fingerprint) {
            if let Some(cached) = cache.get(fp) {
                debug!(item = %item.id, "cache hit");
                return Ok(cached);
            }
        }

        // Step 3: circuit breaker gate.
        if let Some(cb) = &config.circuit_breaker {
            if !cb.can_execute() {
                return Err(AttemptError::Classified {
                    classification: Classification::FailCircuitOpen,
                    http_status: None,
                    message: format!(
                        "circuit breaker open, retry after {}ms",
                        cb.retry_after_ms()
                    ),
                    retryable: false,
                });
            }
        }

        // Step 4: rate limiter gate.
        if let Some(limiter) = &config.rate_limiter {
            limiter.acquire().await;
        }

        // Step 5: concurrency limiter gate.
        let _permit = match &config.concurrency_limiter {
            Some(limiter) => Some(limiter.acquire().await),
            None => None,
        };

        // Step 6: dispatch, bounded by executionTimeout.
        let remaining_timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let dispatch_result = self.dispatch(item, remaining_timeout).await;

        let data = match dispatch_result {
            Ok(data) => data,
            Err(err) => {
                if let Some(cb) = &config.circuit_breaker {
                    cb.record_failure();
                }
                if let Some(permit) = _permit {
                    permit.record(false);
                }
                return Err(err);
            }
        };

        // Step 7: response analyzer.
        if let Some(analyzer) = &config.response_analyzer {
            let ctx = HookExecutionContext { request_id: Some(item.id.clone()), ..Default::default() };
            let params = Value::Null;
            let wrapped = async { analyzer(data.clone(), params.clone(), Arc::clone(buffer)).await };
            let valid = match &config.state_persistence {
                Some(sp) => sp
                    .wrap("responseAnalyzer", buffer, ctx, params.clone(), async {
                        Ok(wrapped.await)
                    })
                    .await
                    .unwrap_or(false),
                None => wrapped.await,
            };
            if !valid {
                if let Some(cb) = &config.circuit_breaker {
                    cb.record_failure();
                }
                if let Some(permit) = _permit {
                    permit.record(false);
                }
                return Err(AttemptError::Classified {
                    classification: Classification::FailValidation,
                    http_status: extract_status(&data),
                    message: "INVALID_CONTENT: response validation failed".to_string(),
                    retryable: true,
                });
            }
        }

        // Step 8: record outcome (circuit breaker success, cache set).
        if let Some(cb) = &config.circuit_breaker {
            cb.record_success();
        }
        if let Some(permit) = _permit {
            permit.record(true);
        }
        if let (Some(cache), Some(fp)) = (&config.cache, &fingerprint) {
            cache.set(fp.clone(), data.clone());
        }

        Ok(data)
    }

    /// Step 9: success/error hooks, routed through the State Persistence
    /// Wrapper.
    async fn run_post_attempt_hooks(
        &self,
        item: &Item,
        config: &AttemptConfig,
        buffer: &Arc<StableBuffer>,
        ordinal: u32,
        outcome: &Result<Value, AttemptError>,
    ) {
        match outcome {
            Ok(data) if config.log_all_successful_attempts => {
                if let Some(hook) = &config.handle_successful_attempt_data {
                    let ctx =
                        HookExecutionContext { request_id: Some(item.id.clone()), ..Default::default() };
                    let params = serde_json::json!({ "ordinal": ordinal });
                    let wrapped = async {
                        hook(data.clone(), Arc::clone(buffer)).await;
                        Ok(())
                    };
                    let result: StableResult<()> = match &config.state_persistence {
                        Some(sp) => sp.wrap("handleSuccessfulAttemptData", buffer, ctx, params, wrapped).await,
                        None => wrapped.await,
                    };
                    if let Err(e) = result {
                        tracing::error!(error = %e, "success hook failed");
                    }
                    info!(item = %item.id, ordinal, "attempt succeeded");
                }
            }
            Err(AttemptError::Classified { classification, http_status, message, .. })
                if config.log_all_errors =>
            {
                if let Some(hook) = &config.handle_errors {
                    let error = classification_to_error(*classification, *http_status, message);
                    let ctx =
                        HookExecutionContext { request_id: Some(item.id.clone()), ..Default::default() };
                    let params = serde_json::json!({ "ordinal": ordinal });
                    let wrapped = async {
                        hook(error, Arc::clone(buffer)).await;
                        Ok(())
                    };
                    let result: StableResult<()> = match &config.state_persistence {
                        Some(sp) => sp.wrap("handleErrors", buffer, ctx, params, wrapped).await,
                        None => wrapped.await,
                    };
                    if let Err(e) = result {
                        tracing::error!(error = %e, "error hook failed");
                    }
                }
            }
            _ => {}
        }
    }

    fn fingerprint_of(&self, item: &Item, config: &AttemptConfig) -> Option<String> {
        if config.cache.is_none() {
            return None;
        }
        match &item.kind {
            ItemKind::Request(req) => {
                let headers: Vec<&str> = config.cacheable_headers.iter().map(String::as_str).collect();
                Some(fingerprint_request(req, &headers))
            }
            ItemKind::Function(func) if func.cacheable => Some(fingerprint_function(func)),
            ItemKind::Function(_) => None,
        }
    }

    async fn dispatch(
        &self,
        item: &Item,
        timeout: Option<Duration>,
    ) -> Result<Value, AttemptError> {
        match &item.kind {
            ItemKind::Request(request) => {
                match self.transport.dispatch(request, timeout).await {
                    Ok(response) => {
                        if response.status >= 400 {
                            Err(AttemptError::Classified {
                                classification: Classification::FailHttp,
                                http_status: Some(response.status),
                                message: format!("HTTP_ERROR: status {}", response.status),
                                retryable: is_retryable_status(response.status),
                            })
                        } else {
                            Ok(response.data)
                        }
                    }
                    Err(transport_err) => {
                        if let Some((status, body)) = transport_err.response {
                            return Err(AttemptError::Classified {
                                classification: Classification::FailHttp,
                                http_status: Some(status),
                                message: format!("HTTP_ERROR: status {status}: {body}"),
                                retryable: is_retryable_status(status),
                            });
                        }
                        let retryable = transport_err
                            .code
                            .as_deref()
                            .map(|c| crate::error::RETRYABLE_NETWORK_CODES.contains(&c))
                            .unwrap_or(true);
                        Err(AttemptError::Classified {
                            classification: Classification::FailNetwork,
                            http_status: None,
                            message: transport_err.message,
                            retryable,
                        })
                    }
                }
            }
            ItemKind::Function(function) => self.dispatch_function(function, timeout).await,
        }
    }

    async fn dispatch_function(
        &self,
        function: &FunctionDescriptor,
        timeout: Option<Duration>,
    ) -> Result<Value, AttemptError> {
        let call = Arc::clone(&function.call);
        let args = function.args.clone();
        let fut = call(args);

        let inner: StableResult<Value> = match timeout {
            Some(t) => match tokio::time::timeout(t, fut).await {
                Ok(inner) => inner,
                Err(_) => {
                    return Err(AttemptError::Classified {
                        classification: Classification::FailTimeout,
                        http_status: None,
                        message: format!("timeout: execution exceeded {}ms", t.as_millis()),
                        retryable: true,
                    })
                }
            },
            None => fut.await,
        };

        inner.map_err(|e| AttemptError::Classified {
            classification: Classification::FailValidation,
            http_status: None,
            message: e.to_string(),
            retryable: e.is_retryable(),
        })
    }
}

enum AttemptError {
    Classified {
        classification: Classification,
        http_status: Option<u16>,
        message: String,
        retryable: bool,
    },
}

fn classification_to_error(
    classification: Classification,
    http_status: Option<u16>,
    message: &str,
) -> StableError {
    match classification {
        Classification::FailHttp => {
            StableError::HttpError { status: http_status.unwrap_or(0), url: message.to_string() }
        }
        Classification::FailNetwork => StableError::Network(message.to_string()),
        Classification::FailValidation => StableError::InvalidContent,
        Classification::FailTimeout => StableError::Timeout { millis: 0 },
        Classification::FailCircuitOpen => StableError::CircuitOpen { retry_after_ms: 0 },
        Classification::Success => StableError::InvalidInput("unexpected success".to_string()),
    }
}

fn extract_status(data: &Value) -> Option<u16> {
    data.get("status").and_then(|s| s.as_u64()).map(|s| s as u16)
}

/// Merges a pre-execution hook's patch into a cloned item (spec §4.A
/// step 1, `applyPreExecutionConfigOverride`). `headers`/`query` objects
/// are merged key-wise; `body`/`path`/`args` replace wholesale when
/// present. Unrecognized or malformed patches are ignored rather than
/// failing the attempt.
fn apply_pre_execution_patch(item: &Item, patch: &Value) -> Item {
    let mut patched = item.clone();
    let Some(patch) = patch.as_object() else { return patched };

    match &mut patched.kind {
        ItemKind::Request(request) => {
            if let Some(headers) = patch.get("headers").and_then(Value::as_object) {
                for (name, value) in headers {
                    if let Some(value) = value.as_str() {
                        request.headers.insert(name.clone(), value.to_string());
                    }
                }
            }
            if let Some(query) = patch.get("query").and_then(Value::as_object) {
                for (name, value) in query {
                    if let Some(value) = value.as_str() {
                        request.query.insert(name.clone(), value.to_string());
                    }
                }
            }
            if let Some(body) = patch.get("body") {
                request.body = Some(body.clone());
            }
            if let Some(path) = patch.get("path").and_then(Value::as_str) {
                request.path = path.to_string();
            }
        }
        ItemKind::Function(function) => {
            if let Some(args) = patch.get("args") {
                function.args = args.clone();
            }
        }
    }

    patched
}
