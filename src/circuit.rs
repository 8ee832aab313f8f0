//! Circuit breaker (§4.2).
//!
//! A state machine over a sliding window of recent failure timestamps.
//! `closed -> open` on crossing the failure threshold, `open -> half_open`
//! once the open duration has elapsed, `half_open -> closed` after enough
//! consecutive successes, `half_open -> open` on any failure. The breaker
//! does not distinguish failure kinds; the exclude-flag passed by the
//! caller is the only input beyond success/failure.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::config::CircuitConfig;

/// Current classification of the circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Result of asking the breaker for permission to execute a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    Rejected { reason: String },
}

struct Inner {
    state: CircuitState,
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    half_open_successes: usize,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            opened_at: None,
            half_open_successes: 0,
        }
    }

    /// Evicts failure-sequence entries older than the configured window.
    /// Called on every read and every mutation, per §3's invariant that the
    /// sequence only ever holds entries `>= now - failure_window`.
    fn evict_expired(&mut self, window: Duration) {
        let now = Instant::now();
        while let Some(&front) = self.failures.front() {
            if now.duration_since(front) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }

    fn transition_to_open(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.half_open_successes = 0;
        tracing::warn!(state = "open", "circuit breaker tripped");
    }

    fn transition_to_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_successes = 0;
        tracing::info!(state = "half_open", "circuit breaker probing");
    }

    fn transition_to_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.failures.clear();
        self.half_open_successes = 0;
        tracing::info!(state = "closed", "circuit breaker recovered");
    }
}

/// The circuit breaker. Owns its state behind a single-writer mutex;
/// callers only ever see snapshots via [`CircuitBreaker::state`] or the
/// return values of its methods.
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::new()),
        }
    }

    /// §4.2 `canExecute`. In `open`, evicts expired window entries first,
    /// then checks whether `open_duration` has elapsed; if so, transitions
    /// to `half_open` *before* returning `Allowed`, so this very call
    /// becomes the probe.
    pub async fn can_execute(&self, config: &CircuitConfig) -> Admission {
        let mut inner = self.inner.lock().await;
        inner.evict_expired(config.failure_window);

        match inner.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::HalfOpen => Admission::Allowed,
            CircuitState::Open => {
                let opened_at = inner.opened_at.expect("opened_at set while Open");
                if opened_at.elapsed() >= config.open_duration {
                    inner.transition_to_half_open();
                    Admission::Allowed
                } else {
                    let remaining = config.open_duration - opened_at.elapsed();
                    Admission::Rejected {
                        reason: format!("Circuit open. Retry in {}s", remaining.as_secs()),
                    }
                }
            }
        }
    }

    /// §4.2 `recordSuccess`. No-op in `closed`. In `half_open`, increments
    /// the recovery counter and closes the circuit once the recovery
    /// threshold is met.
    pub async fn record_success(&self, config: &CircuitConfig) {
        let mut inner = self.inner.lock().await;
        if inner.state == CircuitState::HalfOpen {
            inner.half_open_successes += 1;
            if inner.half_open_successes >= config.recovery_threshold {
                inner.transition_to_closed();
            }
        }
    }

    /// §4.2 `recordFailure(excluded)`. A no-op when `excluded` (EXPLAIN
    /// ANALYZE calls never contribute to the failure sequence, §3/§8).
    /// Otherwise appends `now`, evicts expired entries, and consults the
    /// transition table.
    pub async fn record_failure(&self, config: &CircuitConfig, excluded: bool) {
        if excluded {
            return;
        }

        let mut inner = self.inner.lock().await;

        match inner.state {
            CircuitState::HalfOpen => {
                inner.transition_to_open();
            }
            CircuitState::Closed | CircuitState::Open => {
                inner.failures.push_back(Instant::now());
                inner.evict_expired(config.failure_window);
                if inner.state == CircuitState::Closed
                    && inner.failures.len() >= config.failure_threshold
                {
                    inner.transition_to_open();
                }
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.lock().await.state
    }

    /// Milliseconds remaining until the breaker becomes eligible for
    /// half-open, or `None` if it is not currently open.
    pub async fn opens_in_ms(&self, config: &CircuitConfig) -> Option<u64> {
        let inner = self.inner.lock().await;
        if inner.state != CircuitState::Open {
            return None;
        }
        let opened_at = inner.opened_at?;
        let remaining = config
            .open_duration
            .saturating_sub(opened_at.elapsed());
        Some(remaining.as_millis() as u64)
    }

    /// Number of failures currently counted in the (pruned) window.
    pub async fn recent_failure_count(&self, config: &CircuitConfig) -> usize {
        let mut inner = self.inner.lock().await;
        inner.evict_expired(config.failure_window);
        inner.failures.len()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 5,
            failure_window: Duration::from_secs(60),
            open_duration: Duration::from_millis(200),
            recovery_threshold: 2,
        }
    }

    #[tokio::test]
    async fn trips_after_threshold_failures() {
        let breaker = CircuitBreaker::new();
        let c = cfg();
        for _ in 0..4 {
            breaker.record_failure(&c, false).await;
            assert_eq!(breaker.state().await, CircuitState::Closed);
        }
        breaker.record_failure(&c, false).await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        match breaker.can_execute(&c).await {
            Admission::Rejected { reason } => assert!(reason.starts_with("Circuit open. Retry in")),
            Admission::Allowed => panic!("expected rejection while open"),
        }
    }

    #[tokio::test]
    async fn half_open_closes_after_recovery_threshold() {
        let breaker = CircuitBreaker::new();
        let c = cfg();
        for _ in 0..5 {
            breaker.record_failure(&c, false).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);

        tokio::time::sleep(c.open_duration + Duration::from_millis(20)).await;
        assert_eq!(breaker.can_execute(&c).await, Admission::Allowed);
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_success(&c).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);
        breaker.record_success(&c).await;
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_with_fresh_opened_at() {
        let breaker = CircuitBreaker::new();
        let c = cfg();
        for _ in 0..5 {
            breaker.record_failure(&c, false).await;
        }
        tokio::time::sleep(c.open_duration + Duration::from_millis(20)).await;
        breaker.can_execute(&c).await;
        assert_eq!(breaker.state().await, CircuitState::HalfOpen);

        breaker.record_failure(&c, false).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }

    #[tokio::test]
    async fn excluded_failures_never_join_the_window() {
        let breaker = CircuitBreaker::new();
        let c = cfg();
        for _ in 0..10 {
            breaker.record_failure(&c, true).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
        assert_eq!(breaker.recent_failure_count(&c).await, 0);
    }

    #[tokio::test]
    async fn sub_threshold_failures_leave_circuit_closed() {
        let breaker = CircuitBreaker::new();
        let c = cfg();
        for _ in 0..(c.failure_threshold - 1) {
            breaker.record_failure(&c, false).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn never_transitions_open_to_closed_directly() {
        // The only path out of Open is through HalfOpen; verify success
        // recorded while still Open (shouldn't happen operationally, but
        // the no-op contract must hold) does not close the circuit.
        let breaker = CircuitBreaker::new();
        let c = cfg();
        for _ in 0..5 {
            breaker.record_failure(&c, false).await;
        }
        assert_eq!(breaker.state().await, CircuitState::Open);
        breaker.record_success(&c).await;
        assert_eq!(breaker.state().await, CircuitState::Open);
    }
}
