//! Resilience-and-orchestration engine for outbound HTTP requests and
//! in-process function calls.
//!
//! This crate provides:
//! - A per-item attempt loop with retry strategies, circuit breaker,
//!   rate limiter, concurrency limiter, and response-driven caching
//! - A gateway executor running batches under a hierarchical config
//!   merge (global → group → item)
//! - Linear and graph workflow drivers built on top of the gateway
//! - A shared, queue-serialized state buffer for hooks and workflow
//!   phases
//! - An optional distributed-coordination adapter trait (feature
//!   `coordinator`), never a backend of its own

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

pub mod attempt_loop;
pub mod buffer;
#[cfg(feature = "coordinator")]
pub mod coordinator;
pub mod descriptor;
pub mod error;
pub mod fingerprint;
pub mod gateway;
pub mod hooks;
pub mod resilience;
pub mod transport;
pub mod workflow;

pub use attempt_loop::{AttemptConfig, AttemptLoop, RetryStrategy};
pub use buffer::{StableBuffer, TransactionContext, TransactionLog};
#[cfg(feature = "coordinator")]
pub use coordinator::{Coordinator, InMemoryCoordinator};
pub use descriptor::{
    Classification, FunctionDescriptor, Item, ItemKind, ItemResponse, ItemResult,
    RequestDescriptor, RequestDescriptorBuilder,
};
pub use error::{StableError, StableResult};
pub use gateway::{ConfigOverride, ExecutionMode, Gateway, GatewayConfig, GatewayOptions, GatewayResult};
pub use hooks::{HookExecutionContext, StatePersistence};
pub use resilience::{Cache, CircuitBreaker, ConcurrencyLimiter, RateLimiter};
pub use transport::Transport;
pub use workflow::{
    GraphBuilder, GraphWorkflowDriver, LinearWorkflowDriver, Phase, WorkflowHooks, WorkflowOptions,
};
