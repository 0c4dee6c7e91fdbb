//! Circuit breaker policy unit.
//!
//! State machine with a sliding window of recent outcomes, grounded on the
//! teacher's atomic-state `CircuitBreaker`
//! (`knhk-workflow-engine/src/connectors/resilience.rs`) but extended with
//! failure-percentage thresholds and bounded half-open admission instead
//! of a bare failure counter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Circuit breaker state (spec §6 stable strings: CLOSED/OPEN/HALF_OPEN).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => Self::Open,
            2 => Self::HalfOpen,
            _ => Self::Closed,
        }
    }
}

/// Circuit breaker configuration (spec §4.B parameters).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold_percentage: f64,
    pub minimum_requests: u32,
    pub recovery_timeout_ms: u64,
    pub success_threshold_percentage: f64,
    pub half_open_max_requests: u32,
    pub track_individual_attempts: bool,
    /// Size of the sliding outcome window used to compute failure%.
    pub window_size: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold_percentage: 50.0,
            minimum_requests: 5,
            recovery_timeout_ms: 30_000,
            success_threshold_percentage: 50.0,
            half_open_max_requests: 1,
            track_individual_attempts: true,
            window_size: 20,
        }
    }
}

#[derive(Debug, Default)]
struct Window {
    outcomes: VecDeque<bool>,
}

impl Window {
    fn push(&mut self, success: bool, cap: usize) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > cap {
            self.outcomes.pop_front();
        }
    }

    fn failure_percentage(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|o| !**o).count();
        (failures as f64 / self.outcomes.len() as f64) * 100.0
    }
}

/// Derived metrics for dashboards/diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub state_transitions: u64,
    pub open_count: u64,
    pub average_open_duration_ms: f64,
    pub recovery_success_rate: f64,
    pub failure_percentage: f64,
}

/// A circuit breaker guarding one resource key.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: AtomicU8,
    open_until: Mutex<Option<Instant>>,
    window: Mutex<Window>,
    half_open_in_flight: AtomicU32,
    half_open_successes: AtomicU32,
    half_open_probes: AtomicU32,
    state_transitions: AtomicU64,
    open_count: AtomicU64,
    total_open_duration_ms: AtomicU64,
    recovery_attempts: AtomicU64,
    recovery_successes: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            state: AtomicU8::new(CircuitState::Closed as u8),
            open_until: Mutex::new(None),
            window: Mutex::new(Window::default()),
            half_open_in_flight: AtomicU32::new(0),
            half_open_successes: AtomicU32::new(0),
            half_open_probes: AtomicU32::new(0),
            state_transitions: AtomicU64::new(0),
            open_count: AtomicU64::new(0),
            total_open_duration_ms: AtomicU64::new(0),
            recovery_attempts: AtomicU64::new(0),
            recovery_successes: AtomicU64::new(0),
        })
    }

    pub fn state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    fn transition_to(&self, next: CircuitState) {
        let prev = self.state();
        if prev == next {
            return;
        }
        self.state.store(next as u8, Ordering::Release);
        self.state_transitions.fetch_add(1, Ordering::AcqRel);
        match next {
            CircuitState::Open => {
                self.open_count.fetch_add(1, Ordering::AcqRel);
                let recovery_at = Instant::now() + Duration::from_millis(self.config.recovery_timeout_ms);
                *self.open_until.lock() = Some(recovery_at);
                warn!(previous = ?prev, "circuit breaker opening");
            }
            CircuitState::HalfOpen => {
                self.half_open_successes.store(0, Ordering::Release);
                self.half_open_probes.store(0, Ordering::Release);
                self.half_open_in_flight.store(0, Ordering::Release);
                info!("circuit breaker transitioning to half-open");
            }
            CircuitState::Closed => {
                if let Some(until) = self.open_until.lock().take() {
                    let now = Instant::now();
                    if until <= now {
                        let dur = until.elapsed().as_millis() as u64;
                        self.total_open_duration_ms.fetch_add(dur, Ordering::AcqRel);
                    }
                }
                self.window.lock().outcomes.clear();
                info!("circuit breaker closed");
            }
        }
    }

    /// Returns `true` when the attempt may proceed, consuming a half-open
    /// probe slot when the state is HALF_OPEN (spec §4.A step 3).
    pub fn can_execute(&self) -> bool {
        match self.state() {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let now = Instant::now();
                let should_probe = matches!(*self.open_until.lock(), Some(until) if now >= until);
                if should_probe {
                    self.transition_to(CircuitState::HalfOpen);
                    self.try_admit_half_open_probe()
                } else {
                    debug!("circuit breaker open, short-circuiting");
                    false
                }
            }
            CircuitState::HalfOpen => self.try_admit_half_open_probe(),
        }
    }

    fn try_admit_half_open_probe(&self) -> bool {
        let issued = self.half_open_probes.fetch_add(1, Ordering::AcqRel);
        if issued < self.config.half_open_max_requests {
            self.half_open_in_flight.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            self.half_open_probes.fetch_sub(1, Ordering::AcqRel);
            false
        }
    }

    /// Milliseconds until the circuit is eligible to probe again, for
    /// callers that want to surface `retryAfterMs` without polling.
    pub fn retry_after_ms(&self) -> u64 {
        match *self.open_until.lock() {
            Some(until) => until.saturating_duration_since(Instant::now()).as_millis() as u64,
            None => 0,
        }
    }

    pub fn record_success(&self) {
        let mut window = self.window.lock();
        window.push(true, self.config.window_size);
        drop(window);

        if self.state() == CircuitState::HalfOpen {
            self.half_open_in_flight.fetch_sub(1, Ordering::AcqRel);
            self.recovery_attempts.fetch_add(1, Ordering::AcqRel);
            let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
            let probes = self.half_open_probes.load(Ordering::Acquire).max(1);
            let success_pct = (successes as f64 / probes as f64) * 100.0;
            if success_pct >= self.config.success_threshold_percentage {
                self.recovery_successes.fetch_add(1, Ordering::AcqRel);
                self.transition_to(CircuitState::Closed);
            }
        }
    }

    pub fn record_failure(&self) {
        let mut window = self.window.lock();
        window.push(false, self.config.window_size);
        let size = window.outcomes.len() as u32;
        let failure_pct = window.failure_percentage();
        drop(window);

        match self.state() {
            CircuitState::HalfOpen => {
                self.half_open_in_flight.fetch_sub(1, Ordering::AcqRel);
                self.recovery_attempts.fetch_add(1, Ordering::AcqRel);
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Closed => {
                if size >= self.config.minimum_requests
                    && failure_pct >= self.config.failure_threshold_percentage
                {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::Open => {}
        }
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let open_count = self.open_count.load(Ordering::Acquire);
        let total_open_ms = self.total_open_duration_ms.load(Ordering::Acquire);
        let average_open_duration_ms =
            if open_count > 0 { total_open_ms as f64 / open_count as f64 } else { 0.0 };
        let attempts = self.recovery_attempts.load(Ordering::Acquire);
        let successes = self.recovery_successes.load(Ordering::Acquire);
        let recovery_success_rate = if attempts > 0 { successes as f64 / attempts as f64 } else { 0.0 };
        CircuitBreakerMetrics {
            state: self.state(),
            state_transitions: self.state_transitions.load(Ordering::Acquire),
            open_count,
            average_open_duration_ms,
            recovery_success_rate,
            failure_percentage: self.window.lock().failure_percentage(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cb(min_requests: u32, threshold_pct: f64, recovery_ms: u64) -> Arc<CircuitBreaker> {
        CircuitBreaker::new(CircuitBreakerConfig {
            minimum_requests: min_requests,
            failure_threshold_percentage: threshold_pct,
            recovery_timeout_ms: recovery_ms,
            success_threshold_percentage: 100.0,
            half_open_max_requests: 1,
            track_individual_attempts: true,
            window_size: 20,
        })
    }

    #[test]
    fn opens_after_threshold_breached() {
        let breaker = cb(4, 50.0, 10_000);
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.record_success();
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!breaker.can_execute());
    }

    #[test]
    fn stays_closed_below_minimum_requests() {
        let breaker = cb(10, 10.0, 10_000);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_probe_then_close_on_success() {
        let breaker = cb(2, 50.0, 1);
        breaker.record_failure();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.can_execute());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.record_success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_probe_failure() {
        let breaker = cb(2, 50.0, 1);
        breaker.record_failure();
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.can_execute());

        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_admits_only_configured_probe_count() {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig {
            minimum_requests: 1,
            failure_threshold_percentage: 1.0,
            recovery_timeout_ms: 1,
            success_threshold_percentage: 100.0,
            half_open_max_requests: 1,
            track_individual_attempts: true,
            window_size: 20,
        });
        breaker.record_failure();
        std::thread::sleep(Duration::from_millis(5));
        assert!(breaker.can_execute());
        // second probe while the first is still in-flight is rejected
        assert!(!breaker.can_execute());
    }
}
