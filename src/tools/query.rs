//! `query` tool: read-only `SELECT`, auto-`LIMIT` applied unless the caller
//! supplied one already or overrides it with `max_rows_hint`.

use serde_json::Value;

use super::{optional_params, optional_timeout_ms, required_str, violation_to_error};
use crate::error::GatewayError;
use crate::executor::{safe_query, SafeQueryOptions};
use crate::manager::GatewayManager;
use crate::policy::{preflight_query, Blacklist};
use crate::pool::Pool;

pub async fn run(manager: &GatewayManager, pool: &Pool, args: &Value) -> Result<Value, GatewayError> {
    let sql = required_str(args, "sql")?;
    let params = optional_params(args);

    let policy = &manager.config().policy;
    let blacklist = Blacklist::from_config(policy);
    let default_limit = args
        .get("max_rows_hint")
        .and_then(Value::as_u64)
        .map(|n| n as u32)
        .unwrap_or(policy.default_select_limit);

    let sql = preflight_query(&sql, &blacklist, default_limit).map_err(violation_to_error)?;

    let result = safe_query(
        manager,
        pool,
        &sql,
        &params,
        SafeQueryOptions {
            user_override_ms: optional_timeout_ms(args),
        },
    )
    .await?;

    Ok(serde_json::json!({
        "rows": result.rows,
        "row_count": result.row_count,
        "fields": result.fields,
        "duration_ms": result.duration_ms,
    }))
}
