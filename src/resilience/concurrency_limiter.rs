//! Counting-semaphore concurrency limiter policy unit.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, SemaphorePermit};

/// A FIFO counting semaphore of a configured size with queue-wait and
/// peak-concurrency tracking.
pub struct ConcurrencyLimiter {
    limit: usize,
    semaphore: Semaphore,
    running: AtomicI64,
    peak_running: AtomicU64,
    total_queue_wait_ms: AtomicU64,
    acquisitions: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyLimiterMetrics {
    pub limit: usize,
    pub running: i64,
    pub peak_running: u64,
    pub average_queue_wait_ms: f64,
    pub successes: u64,
    pub failures: u64,
}

/// RAII guard released back to the semaphore's FIFO queue on drop; callers
/// must call [`ConcurrencyLimiter::release`] to record success/failure
/// before dropping, or the slot is recorded as neither.
pub struct ConcurrencyPermit<'a> {
    limiter: &'a ConcurrencyLimiter,
    _permit: SemaphorePermit<'a>,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            limit,
            semaphore: Semaphore::new(limit),
            running: AtomicI64::new(0),
            peak_running: AtomicU64::new(0),
            total_queue_wait_ms: AtomicU64::new(0),
            acquisitions: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        })
    }

    /// Acquire one of `limit` tokens, parking FIFO on contention (the
    /// `tokio::sync::Semaphore` wait list is itself FIFO).
    pub async fn acquire(&self) -> ConcurrencyPermit<'_> {
        let started = Instant::now();
        let permit = self
            .semaphore
            .acquire()
            .await
            .expect("semaphore is never closed");
        let waited_ms = started.elapsed().as_millis() as u64;
        self.total_queue_wait_ms.fetch_add(waited_ms, Ordering::AcqRel);
        self.acquisitions.fetch_add(1, Ordering::AcqRel);

        let running = self.running.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_running.fetch_max(running as u64, Ordering::AcqRel);

        ConcurrencyPermit { limiter: self, _permit: permit }
    }

    pub fn metrics(&self) -> ConcurrencyLimiterMetrics {
        let acquisitions = self.acquisitions.load(Ordering::Acquire).max(1);
        ConcurrencyLimiterMetrics {
            limit: self.limit,
            running: self.running.load(Ordering::Acquire),
            peak_running: self.peak_running.load(Ordering::Acquire),
            average_queue_wait_ms: self.total_queue_wait_ms.load(Ordering::Acquire) as f64
                / acquisitions as f64,
            successes: self.successes.load(Ordering::Acquire),
            failures: self.failures.load(Ordering::Acquire),
        }
    }
}

impl<'a> ConcurrencyPermit<'a> {
    pub fn record(self, success: bool) {
        if success {
            self.limiter.successes.fetch_add(1, Ordering::AcqRel);
        } else {
            self.limiter.failures.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Drop for ConcurrencyPermit<'_> {
    fn drop(&mut self) {
        self.limiter.running.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    #[tokio::test]
    async fn bounds_concurrent_holders() {
        let limiter = ConcurrencyLimiter::new(2);
        let p1 = limiter.acquire().await;
        let p2 = limiter.acquire().await;
        assert_eq!(limiter.metrics().running, 2);

        let limiter2 = StdArc::clone(&limiter);
        let handle = tokio::spawn(async move {
            let p3 = limiter2.acquire().await;
            p3.record(true);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        p1.record(true);
        drop(p2);
        handle.await.unwrap();
        assert_eq!(limiter.metrics().peak_running, 2);
    }
}
