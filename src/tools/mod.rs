//! Tool Dispatch (§6): six thin adapters over the guarded executor.
//!
//! Every adapter follows the same shape: turn JSON args into a SQL
//! string/params pair, run the shared pre-flight hooks, then call
//! [`crate::executor::safe_query`]. None of this is part of the NEVERHANG
//! core — it is the non-core surface §1 explicitly scopes the core away
//! from.

mod execute;
mod explain;
mod health;
mod introspect;
mod query;
mod stats;

use serde_json::Value;

use crate::error::{FailureKind, GatewayError};
use crate::manager::GatewayManager;
use crate::policy::PolicyViolation;
use crate::pool::Pool;

/// Dispatches one tool call by name. Unknown tool names are themselves a
/// `permission_denied` failure, matching how a pre-flight rejection looks
/// to the caller.
pub async fn dispatch(
    manager: &GatewayManager,
    pool: &Pool,
    tool: &str,
    args: &Value,
) -> Result<Value, GatewayError> {
    match tool {
        "query" => query::run(manager, pool, args).await,
        "execute" => execute::run(manager, pool, args).await,
        "introspect" => introspect::run(manager, pool, args).await,
        "explain" => explain::run(manager, pool, args).await,
        "stats" => stats::run(manager, pool, args).await,
        "health" => health::run(manager, pool).await,
        other => Err(GatewayError::new(
            FailureKind::PermissionDenied,
            format!("unknown tool '{other}'"),
            std::time::Duration::ZERO,
        )),
    }
}

fn required_str(args: &Value, field: &'static str) -> Result<String, GatewayError> {
    args.get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            GatewayError::new(
                FailureKind::PermissionDenied,
                format!("missing required argument '{field}'"),
                std::time::Duration::ZERO,
            )
        })
}

fn optional_str(args: &Value, field: &'static str) -> Option<String> {
    args.get(field).and_then(Value::as_str).map(str::to_string)
}

fn optional_params(args: &Value) -> Vec<Value> {
    args.get("params")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default()
}

fn optional_timeout_ms(args: &Value) -> Option<u64> {
    args.get("timeout_ms").and_then(Value::as_u64)
}

fn violation_to_error(violation: PolicyViolation) -> GatewayError {
    GatewayError::new(FailureKind::PermissionDenied, violation.0, std::time::Duration::ZERO)
}
