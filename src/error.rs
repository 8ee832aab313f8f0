//! The gateway's closed failure taxonomy (§4.5, §7).
//!
//! Every failure that can escape a guarded call is one of exactly seven
//! kinds. The executor never lets a raw driver error reach the caller
//! unclassified; it always wraps it in a [`GatewayError`] carrying a kind,
//! a human message, the elapsed wall time, and (where available) the
//! underlying cause.

use std::fmt;
use std::time::Duration;

/// The closed set of failure kinds a guarded call can produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Planned deadline elapsed during execution.
    Timeout,
    /// Could not obtain a live connection within the connect deadline.
    ConnectionFailed,
    /// No connection slot available before the connect deadline.
    PoolExhausted,
    /// Breaker refused the call; call never reached the database.
    CircuitOpen,
    /// Backend returned a statement-level error (syntax, constraint, ...).
    QueryError,
    /// Pre-flight safety rejection or backend auth/authorization error.
    PermissionDenied,
    /// Outer cancellation observed before completion.
    Cancelled,
}

impl FailureKind {
    /// Whether a caller may usefully retry a call that failed this way.
    pub fn retryable(self) -> bool {
        matches!(
            self,
            FailureKind::Timeout
                | FailureKind::ConnectionFailed
                | FailureKind::PoolExhausted
                | FailureKind::CircuitOpen
        )
    }

    /// A fixed, short actionable suggestion for this kind of failure.
    pub fn suggestion(self) -> &'static str {
        match self {
            FailureKind::Timeout => "retry with a larger override, or simplify the query",
            FailureKind::ConnectionFailed => "retry shortly; the database may be unreachable",
            FailureKind::PoolExhausted => "retry shortly; all connections are in use",
            FailureKind::CircuitOpen => "wait for the circuit to recover before retrying",
            FailureKind::QueryError => "fix the statement; this will not succeed on retry",
            FailureKind::PermissionDenied => "this operation is not permitted; do not retry",
            FailureKind::Cancelled => "the call was cancelled before completion",
        }
    }

    /// The stable wire name used in the §6 failure format's `type` field.
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Timeout => "timeout",
            FailureKind::ConnectionFailed => "connection_failed",
            FailureKind::PoolExhausted => "pool_exhausted",
            FailureKind::CircuitOpen => "circuit_open",
            FailureKind::QueryError => "query_error",
            FailureKind::PermissionDenied => "permission_denied",
            FailureKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified failure from a guarded call.
///
/// This is the only error type that crosses the NEVERHANG core boundary;
/// every internal error (driver errors, timeouts, pool exhaustion) is
/// translated into one of these before the caller sees it.
#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct GatewayError {
    pub kind: FailureKind,
    pub message: String,
    pub duration: Duration,
    #[source]
    pub cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl GatewayError {
    pub fn new(kind: FailureKind, message: impl Into<String>, duration: Duration) -> Self {
        Self {
            kind,
            message: message.into(),
            duration,
            cause: None,
        }
    }

    pub fn with_cause(
        kind: FailureKind,
        message: impl Into<String>,
        duration: Duration,
        cause: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            duration,
            cause: Some(Box::new(cause)),
        }
    }

    pub fn retryable(&self) -> bool {
        self.kind.retryable()
    }

    pub fn suggestion(&self) -> &'static str {
        self.kind.suggestion()
    }

    /// The stable `{ type, message, duration_ms, retryable, suggestion }`
    /// wire format of §6.
    pub fn to_wire(&self) -> serde_json::Value {
        serde_json::json!({
            "type": self.kind.as_str(),
            "message": self.message,
            "duration_ms": self.duration.as_millis() as u64,
            "retryable": self.retryable(),
            "suggestion": self.suggestion(),
        })
    }
}

/// Classifies a `tokio_postgres::Error` per §4.4 step 5's translation
/// rules: connectivity errors become `ConnectionFailed`, auth/authorization
/// errors become `PermissionDenied`, and everything else is `QueryError`.
pub fn classify_driver_error(err: &tokio_postgres::Error) -> FailureKind {
    if err.is_closed() {
        return FailureKind::ConnectionFailed;
    }
    if let Some(db_err) = err.as_db_error() {
        let code = db_err.code();
        use tokio_postgres::error::SqlState;
        if *code == SqlState::INVALID_AUTHORIZATION_SPECIFICATION
            || *code == SqlState::INVALID_PASSWORD
            || *code == SqlState::INSUFFICIENT_PRIVILEGE
        {
            return FailureKind::PermissionDenied;
        }
        return FailureKind::QueryError;
    }
    // No structured DbError: treat as a connectivity problem (the driver
    // raises these for I/O failures, protocol violations, etc.)
    FailureKind::ConnectionFailed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_kinds_match_taxonomy() {
        assert!(FailureKind::Timeout.retryable());
        assert!(FailureKind::ConnectionFailed.retryable());
        assert!(FailureKind::PoolExhausted.retryable());
        assert!(FailureKind::CircuitOpen.retryable());
        assert!(!FailureKind::QueryError.retryable());
        assert!(!FailureKind::PermissionDenied.retryable());
        assert!(!FailureKind::Cancelled.retryable());
    }

    #[test]
    fn wire_format_has_stable_shape() {
        let err = GatewayError::new(FailureKind::Timeout, "deadline elapsed", Duration::from_millis(1234));
        let wire = err.to_wire();
        assert_eq!(wire["type"], "timeout");
        assert_eq!(wire["duration_ms"], 1234);
        assert_eq!(wire["retryable"], true);
        assert!(wire["suggestion"].is_string());
    }
}
