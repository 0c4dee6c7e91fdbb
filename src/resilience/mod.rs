//! Policy units: circuit breaker, rate limiter, concurrency limiter, cache
//!. Each owns independent internal serialization and is safe
//! for concurrent use from any caller task.

pub mod cache;
pub mod circuit_breaker;
pub mod concurrency_limiter;
pub mod rate_limiter;

pub use cache::{Cache, CacheConfig, CacheMetrics};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use concurrency_limiter::{ConcurrencyLimiter, ConcurrencyLimiterMetrics, ConcurrencyPermit};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterMetrics};
