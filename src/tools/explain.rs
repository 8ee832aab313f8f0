//! `explain` tool: wraps the caller's SQL in `EXPLAIN (FORMAT JSON)`, or
//! `EXPLAIN (ANALYZE, FORMAT JSON)` when analysis is requested. Only the
//! analyze form is excluded from the circuit breaker's failure sequence
//! (§4.2, §8) — the planner recognizes it by the same fixed tokens.

use serde_json::Value;

use super::{optional_params, optional_timeout_ms, required_str, violation_to_error};
use crate::error::GatewayError;
use crate::executor::{safe_query, SafeQueryOptions};
use crate::manager::GatewayManager;
use crate::policy::{check_blacklist, check_denylist, Blacklist};
use crate::pool::Pool;

pub async fn run(manager: &GatewayManager, pool: &Pool, args: &Value) -> Result<Value, GatewayError> {
    let sql = required_str(args, "sql")?;
    let params = optional_params(args);
    let analyze = args.get("analyze").and_then(Value::as_bool).unwrap_or(false);

    let blacklist = Blacklist::from_config(&manager.config().policy);
    check_denylist(&sql).map_err(violation_to_error)?;
    check_blacklist(&sql, &blacklist).map_err(violation_to_error)?;

    let wrapped = if analyze {
        format!("EXPLAIN (ANALYZE, FORMAT JSON) {sql}")
    } else {
        format!("EXPLAIN (FORMAT JSON) {sql}")
    };

    let result = safe_query(
        manager,
        pool,
        &wrapped,
        &params,
        SafeQueryOptions {
            user_override_ms: optional_timeout_ms(args),
        },
    )
    .await?;

    Ok(serde_json::json!({
        "plan": result.rows,
        "duration_ms": result.duration_ms,
        "analyzed": analyze,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_explain_rejects_denylisted_statement() {
        let bl = Blacklist::default();
        assert!(check_denylist("DROP TABLE users").is_err());
        let _ = bl;
    }
}
