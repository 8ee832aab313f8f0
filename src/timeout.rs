//! Adaptive timeout planner (§4.1).
//!
//! A pure function from `(query text, health classification, optional user
//! override)` to `(deadline, reason)`. No state, no locking, no I/O — cheap
//! enough to call on every guarded invocation.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::config::TimeoutConfig;
use crate::health::HealthClassification;

static JOIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bjoin\b").unwrap());
static SUBQUERY_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\(\s*select\b").unwrap());
static AGGREGATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(count|sum|avg|min|max|group\s+by)\b").unwrap());
static EXPLAIN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bexplain\b").unwrap());
static ANALYZE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\banalyze\b").unwrap());
static FROM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bfrom\b").unwrap());

/// Derived, non-persistent shape fingerprint of a query's text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryShape {
    pub has_join: bool,
    pub has_subquery: bool,
    pub has_aggregation: bool,
    pub is_explain_analyze: bool,
    pub table_count: usize,
}

impl QueryShape {
    /// Case-insensitive substring/word-boundary scan over the query text.
    /// No SQL parser is used or needed; this is a fixed regular-language
    /// classifier, not a semantic analysis.
    pub fn detect(query: &str) -> Self {
        Self {
            has_join: JOIN_RE.is_match(query),
            has_subquery: SUBQUERY_RE.is_match(query),
            has_aggregation: AGGREGATION_RE.is_match(query),
            is_explain_analyze: EXPLAIN_RE.is_match(query) && ANALYZE_RE.is_match(query),
            table_count: FROM_RE.find_iter(query).count(),
        }
    }
}

/// A planned deadline and the human-readable reason it was chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutPlan {
    pub deadline: Duration,
    pub reason: String,
}

fn clamp(d: Duration, min: Duration, max: Duration) -> Duration {
    d.clamp(min, max)
}

/// Computes the planned deadline for a call.
///
/// `user_override`, when present, wins outright (subject to clamping).
/// Otherwise, if adaptive mode is off, the base timeout is returned as-is.
/// Otherwise the multipliers of §4.1 are stacked in the documented order.
pub fn plan_timeout(
    config: &TimeoutConfig,
    query: &str,
    health: HealthClassification,
    user_override: Option<Duration>,
) -> TimeoutPlan {
    if let Some(override_ms) = user_override {
        let clamped = clamp(override_ms, config.min_timeout, config.max_timeout);
        let reason = if clamped != override_ms {
            format!(
                "user override {}ms clamped to {}ms",
                override_ms.as_millis(),
                clamped.as_millis()
            )
        } else {
            format!("user override {}ms", clamped.as_millis())
        };
        return TimeoutPlan {
            deadline: clamped,
            reason,
        };
    }

    if !config.adaptive {
        return TimeoutPlan {
            deadline: clamp(config.base_timeout, config.min_timeout, config.max_timeout),
            reason: "base timeout".to_string(),
        };
    }

    let shape = QueryShape::detect(query);
    let mut multiplier = 1.0f64;
    let mut parts: Vec<String> = Vec::new();

    if shape.is_explain_analyze {
        multiplier *= 3.0;
        parts.push("EXPLAIN ANALYZE (3.0x)".to_string());
    } else {
        if shape.has_join {
            multiplier *= 1.5;
            parts.push("JOIN (1.5x)".to_string());
        }
        if shape.has_subquery {
            multiplier *= 2.0;
            parts.push("subquery (2.0x)".to_string());
        }
        if shape.table_count > 1 {
            multiplier *= 1.5;
            parts.push("multi-table (1.5x)".to_string());
        }
        if shape.has_aggregation {
            multiplier *= 1.5;
            parts.push("aggregation (1.5x)".to_string());
        }
    }

    let (health_multiplier, health_label) = match health {
        HealthClassification::Healthy => (1.0, "healthy health (1.0x)"),
        HealthClassification::Degraded => (0.5, "degraded health (0.5x)"),
        HealthClassification::Unhealthy => (0.25, "unhealthy health (0.25x)"),
    };
    multiplier *= health_multiplier;
    // A no-op health multiplier is only worth naming in the reason if some
    // shape multiplier also fired; on its own it degenerates to the plain
    // base-timeout case of §8 scenario 1.
    if health_multiplier != 1.0 || !parts.is_empty() {
        parts.push(health_label.to_string());
    }

    let raw_ms = (config.base_timeout.as_millis() as f64) * multiplier;
    let raw = Duration::from_millis(raw_ms.round() as u64);
    let deadline = clamp(raw, config.min_timeout, config.max_timeout);

    let mut reason = if parts.is_empty() {
        "base timeout".to_string()
    } else {
        parts.join(", ")
    };
    if deadline != raw {
        reason.push_str(", clamped");
    }

    TimeoutPlan { deadline, reason }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TimeoutConfig {
        TimeoutConfig {
            base_timeout: Duration::from_millis(10_000),
            connection_timeout: Duration::from_millis(2_000),
            health_check_timeout: Duration::from_millis(2_000),
            adaptive: true,
            min_timeout: Duration::from_millis(2_000),
            max_timeout: Duration::from_millis(30_000),
        }
    }

    #[test]
    fn healthy_simple_select() {
        let plan = plan_timeout(&cfg(), "SELECT id FROM t", HealthClassification::Healthy, None);
        assert_eq!(plan.deadline, Duration::from_millis(10_000));
        assert_eq!(plan.reason, "base timeout");
    }

    #[test]
    fn degraded_join() {
        let plan = plan_timeout(
            &cfg(),
            "SELECT a.id FROM a JOIN b ON a.k=b.k WHERE a.x=1",
            HealthClassification::Degraded,
            None,
        );
        // 10000 * 1.5 * 0.5 = 7500
        assert_eq!(plan.deadline, Duration::from_millis(7_500));
        assert!(plan.reason.contains("JOIN (1.5x)"));
        assert!(plan.reason.contains("degraded health (0.5x)"));
    }

    #[test]
    fn explain_analyze_times_three_and_skips_shape_multipliers() {
        let plan = plan_timeout(
            &cfg(),
            "EXPLAIN ANALYZE SELECT * FROM big JOIN other ON true",
            HealthClassification::Healthy,
            None,
        );
        // 10000 * 3.0 = 30000, clamped to max 30000 anyway
        assert_eq!(plan.deadline, Duration::from_millis(30_000));
    }

    #[test]
    fn override_clamps_below_min() {
        let plan = plan_timeout(
            &cfg(),
            "SELECT 1",
            HealthClassification::Healthy,
            Some(Duration::from_millis(500)),
        );
        assert_eq!(plan.deadline, Duration::from_millis(2_000));
        assert!(plan.reason.contains("clamped"));
    }

    #[test]
    fn override_clamps_above_max() {
        let plan = plan_timeout(
            &cfg(),
            "SELECT 1",
            HealthClassification::Healthy,
            Some(Duration::from_millis(60_000)),
        );
        assert_eq!(plan.deadline, Duration::from_millis(30_000));
    }

    #[test]
    fn planner_is_pure() {
        let a = plan_timeout(&cfg(), "SELECT 1", HealthClassification::Healthy, None);
        let b = plan_timeout(&cfg(), "SELECT 1", HealthClassification::Healthy, None);
        assert_eq!(a, b);
    }

    #[test]
    fn degraded_deadline_never_exceeds_healthy_deadline() {
        let query = "SELECT * FROM a JOIN b ON true WHERE count(*) > 0";
        let healthy = plan_timeout(&cfg(), query, HealthClassification::Healthy, None);
        let degraded = plan_timeout(&cfg(), query, HealthClassification::Degraded, None);
        let unhealthy = plan_timeout(&cfg(), query, HealthClassification::Unhealthy, None);
        assert!(degraded.deadline <= healthy.deadline);
        assert!(unhealthy.deadline <= degraded.deadline);
    }

    #[test]
    fn adaptive_disabled_returns_base() {
        let mut c = cfg();
        c.adaptive = false;
        let plan = plan_timeout(&c, "SELECT * FROM a JOIN b ON true", HealthClassification::Unhealthy, None);
        assert_eq!(plan.deadline, Duration::from_millis(10_000));
        assert_eq!(plan.reason, "base timeout");
    }

    #[test]
    fn shape_detection_matches_fixed_classifier() {
        let shape = QueryShape::detect("SELECT * FROM a WHERE id IN (SELECT id FROM b)");
        assert!(shape.has_subquery);
        assert!(!shape.has_join);
        assert_eq!(shape.table_count, 2);
    }
}
