//! `execute` tool: `INSERT`/`UPDATE`/`DELETE`, guarded by the WHERE-clause
//! requirement (top-level only) and `RETURNING` column filtering.

use serde_json::Value;

use super::{optional_params, optional_timeout_ms, required_str, violation_to_error};
use crate::error::GatewayError;
use crate::executor::{safe_query, SafeQueryOptions};
use crate::manager::GatewayManager;
use crate::policy::{preflight_execute, Blacklist};
use crate::pool::Pool;

pub async fn run(manager: &GatewayManager, pool: &Pool, args: &Value) -> Result<Value, GatewayError> {
    let sql = required_str(args, "sql")?;
    let params = optional_params(args);

    let blacklist = Blacklist::from_config(&manager.config().policy);
    preflight_execute(&sql, &blacklist).map_err(violation_to_error)?;

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
