//! Sliding-window rate limiter policy unit.
//!
//! Admission is delegated to `governor`; the FIFO wait-queue and
//! peak/throttle metrics are layered on top since `governor` alone only
//! accepts or rejects a single check, it does not park callers.

use std::collections::VecDeque;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use governor::{Quota, RateLimiter as GovernorLimiter};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

/// Rate limiter configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub max_requests: u32,
    pub window_ms: u64,
}

/// A sliding-window rate limiter guarding one resource key.
pub struct RateLimiter {
    config: RateLimiterConfig,
    inner: GovernorLimiter<
        governor::state::NotKeyed,
        governor::state::InMemoryState,
        governor::clock::DefaultClock,
    >,
    fifo: Mutex<()>,
    admitted: AtomicU64,
    waited: AtomicU64,
    peak_concurrent_waiters: AtomicU64,
    current_waiters: std::sync::atomic::AtomicI64,
}

/// Derived metrics for dashboards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterMetrics {
    pub admitted: u64,
    pub waited: u64,
    pub throttle_fraction: f64,
    pub peak_concurrent_waiters: u64,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Arc<Self> {
        let per = Duration::from_millis(config.window_ms.max(1));
        let quota = Quota::with_period(per / config.max_requests.max(1))
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::new(1).unwrap()))
            .allow_burst(NonZeroU32::new(config.max_requests.max(1)).unwrap());
        Arc::new(Self {
            config,
            inner: GovernorLimiter::direct(quota),
            fifo: Mutex::new(()),
            admitted: AtomicU64::new(0),
            waited: AtomicU64::new(0),
            peak_concurrent_waiters: AtomicU64::new(0),
            current_waiters: std::sync::atomic::AtomicI64::new(0),
        })
    }

    /// Enqueue-and-wait in FIFO order until a slot in the sliding window
    /// opens (spec §4.A step 4). The internal mutex serializes admission
    /// checks so waiters are released in arrival order.
    pub async fn acquire(&self) {
        let before = Instant::now();
        let active = self.current_waiters.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_concurrent_waiters.fetch_max(active as u64, Ordering::AcqRel);

        let _permit = self.fifo.lock().await;
        let poll_interval = Duration::from_millis(5);
        loop {
            match self.inner.check() {
                Ok(()) => break,
                Err(_not_until) => {
                    debug!(poll_ms = poll_interval.as_millis(), "rate limiter waiting for slot");
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
        self.current_waiters.fetch_sub(1, Ordering::AcqRel);

        let waited_ms = before.elapsed().as_millis();
        self.admitted.fetch_add(1, Ordering::AcqRel);
        if waited_ms > 0 {
            self.waited.fetch_add(1, Ordering::AcqRel);
        }
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let admitted = self.admitted.load(Ordering::Acquire);
        let waited = self.waited.load(Ordering::Acquire);
        RateLimiterMetrics {
            admitted,
            waited,
            throttle_fraction: if admitted > 0 { waited as f64 / admitted as f64 } else { 0.0 },
            peak_concurrent_waiters: self.peak_concurrent_waiters.load(Ordering::Acquire),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn admits_up_to_burst_immediately() {
        let limiter = RateLimiter::new(RateLimiterConfig { max_requests: 3, window_ms: 1000 });
        for _ in 0..3 {
            limiter.acquire().await;
        }
        assert_eq!(limiter.metrics().admitted, 3);
    }

    #[tokio::test]
    async fn fourth_request_waits() {
        let limiter = RateLimiter::new(RateLimiterConfig { max_requests: 2, window_ms: 200 });
        for _ in 0..2 {
            limiter.acquire().await;
        }
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert_eq!(limiter.metrics().waited, 1);
    }
}
