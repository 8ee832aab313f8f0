//! Manager façade & failure taxonomy wiring (§4.5).
//!
//! Composes the circuit breaker, health monitor, and timeout planner
//! behind five entry points: `can_execute`, `get_timeout`,
//! `is_excluded_from_circuit`, `record_success`, `record_failure`. The
//! façade only ever reads snapshots from its components — it owns no
//! mutable state of its own beyond a start time for uptime accounting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::circuit::{Admission, CircuitBreaker, CircuitState};
use crate::config::GatewayConfig;
use crate::health::{HealthClassification, HealthMonitor, PingFn};
use crate::timeout::{plan_timeout, QueryShape, TimeoutPlan};

/// The NEVERHANG manager: the single façade every tool call traverses.
pub struct GatewayManager {
    config: GatewayConfig,
    circuit: CircuitBreaker,
    health: Arc<HealthMonitor>,
    started_at: Instant,
    total_calls: AtomicU64,
    successful_calls: AtomicU64,
}

impl GatewayManager {
    pub fn new(config: GatewayConfig, ping: PingFn) -> Self {
        let health = HealthMonitor::new(ping, &config.timeout, &config.health);
        Self {
            config,
            circuit: CircuitBreaker::new(),
            health,
            started_at: Instant::now(),
            total_calls: AtomicU64::new(0),
            successful_calls: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn health_monitor(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// `EXPLAIN ANALYZE` calls are excluded from the circuit's failure
    /// sequence, regardless of outcome (§3, §8).
    pub fn is_excluded_from_circuit(&self, query: &str) -> bool {
        QueryShape::detect(query).is_explain_analyze
    }

    /// `canExecute() -> {allowed, reason?}`.
    pub async fn can_execute(&self) -> Admission {
        self.circuit.can_execute(&self.config.circuit).await
    }

    /// `getTimeout(query, userOverride?) -> {ms, reason}`.
    pub async fn get_timeout(&self, query: &str, user_override: Option<Duration>) -> TimeoutPlan {
        let health = self.health.classification().await;
        plan_timeout(&self.config.timeout, query, health, user_override)
    }

    pub async fn record_success(&self) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        self.successful_calls.fetch_add(1, Ordering::Relaxed);
        self.circuit.record_success(&self.config.circuit).await;
    }

    /// `recordFailure(query)`: derives the exclude-flag from the query text
    /// and forwards to the breaker.
    pub async fn record_failure(&self, query: &str) {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        let excluded = self.is_excluded_from_circuit(query);
        self.circuit.record_failure(&self.config.circuit, excluded).await;
    }

    /// `getStats` — the snapshot consumed by the `health` tool. Shape
    /// matches §6's stable health snapshot format bit-for-bit.
    pub async fn stats(&self, pool: &crate::pool::PoolStats) -> serde_json::Value {
        let health = self.health.snapshot().await;
        let circuit_state = self.circuit.state().await;
        let circuit_opens_in_ms = self.circuit.opens_in_ms(&self.config.circuit).await;
        let recent_failures = self.circuit.recent_failure_count(&self.config.circuit).await;
        let p95 = self.health.latency_p95().await;

        let total = self.total_calls.load(Ordering::Relaxed);
        let successful = self.successful_calls.load(Ordering::Relaxed);
        let uptime_percent = if total == 0 {
            100.0
        } else {
            (successful as f64 / total as f64) * 100.0
        };

        serde_json::json!({
            "status": classification_str(health.classification),
            "circuit": circuit_state_str(circuit_state),
            "circuit_opens_in_ms": circuit_opens_in_ms,
            "latency_ms": health.last_latency.map(|d| d.as_millis() as u64),
            "latency_p95_ms": p95.as_millis() as u64,
            "pool": {
                "total": pool.total,
                "idle": pool.idle,
                "waiting": pool.waiting,
            },
            "recent_failures": recent_failures,
            "last_success": instant_as_unix_offset_ms(health.last_success, self.started_at),
            "last_failure": instant_as_unix_offset_ms(health.last_failure, self.started_at),
            "uptime_percent": uptime_percent,
            "config": {
                "base_timeout_ms": self.config.timeout.base_timeout.as_millis() as u64,
                "connection_timeout_ms": self.config.timeout.connection_timeout.as_millis() as u64,
                "max_connections": self.config.pool.max_connections,
                "circuit_failure_threshold": self.config.circuit.failure_threshold,
                "circuit_open_duration_ms": self.config.circuit.open_duration.as_millis() as u64,
                "adaptive_timeout": self.config.timeout.adaptive,
            },
        })
    }
}

fn classification_str(c: HealthClassification) -> &'static str {
    match c {
        HealthClassification::Healthy => "healthy",
        HealthClassification::Degraded => "degraded",
        HealthClassification::Unhealthy => "unhealthy",
    }
}

fn circuit_state_str(c: CircuitState) -> &'static str {
    match c {
        CircuitState::Closed => "closed",
        CircuitState::Open => "open",
        CircuitState::HalfOpen => "half_open",
    }
}

/// Express an `Instant` timestamp as milliseconds since the manager
/// started, since `Instant` has no wall-clock epoch to serialize directly.
fn instant_as_unix_offset_ms(instant: Option<Instant>, started_at: Instant) -> Option<u64> {
    instant.map(|t| t.saturating_duration_since(started_at).as_millis() as u64)
}
