//! Guarded executor (§4.4): the six-step sequence every tool call traverses.
//!
//! 1. Ask the manager for execution permission.
//! 2. Ask the manager for the planned deadline.
//! 3. Acquire a pooled connection under the connect deadline.
//! 4. (Handled inside the pool: validate-on-borrow.)
//! 5. Run the statement under the planned deadline, translating driver
//!    errors into the closed failure taxonomy.
//! 6. Record the outcome with the manager and release the connection.

use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde_json::Value;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;

use crate::error::{classify_driver_error, FailureKind, GatewayError};
use crate::manager::GatewayManager;
use crate::pool::Pool;

/// A single bound parameter. Every value is sent to Postgres as text and
/// declared with an explicit `Type::TEXT`/`Type::UNKNOWN`, so the server's
/// normal implicit-cast rules apply regardless of the target column's real
/// type — the gateway never needs to infer parameter types itself.
#[derive(Debug, Clone)]
pub enum SqlParam {
    Null,
    Text(String),
}

impl SqlParam {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => SqlParam::Null,
            Value::Bool(b) => SqlParam::Text(b.to_string()),
            Value::Number(n) => SqlParam::Text(n.to_string()),
            Value::String(s) => SqlParam::Text(s.clone()),
            other => SqlParam::Text(other.to_string()),
        }
    }
}

impl ToSql for SqlParam {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match self {
            SqlParam::Null => Ok(IsNull::Yes),
            SqlParam::Text(s) => {
                out.extend_from_slice(s.as_bytes());
                Ok(IsNull::No)
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

/// Describes a single output column.
#[derive(Debug, Clone, serde::Serialize)]
pub struct FieldInfo {
    pub name: String,
    pub type_oid: u32,
}

/// Result of a successful `safeQuery` call.
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub rows: Vec<Value>,
    pub row_count: usize,
    pub fields: Vec<FieldInfo>,
    pub duration_ms: u64,
}

/// Options the tool layer may pass down with a call (§6).
#[derive(Debug, Clone, Default)]
pub struct SafeQueryOptions {
    pub user_override_ms: Option<u64>,
}

fn pg_value_to_json(row: &Row, idx: usize) -> Value {
    let ty = row.columns()[idx].type_();
    macro_rules! as_json {
        ($t:ty) => {
            row.try_get::<_, Option<$t>>(idx)
                .ok()
                .flatten()
                .map(|v| serde_json::json!(v))
        };
    }

    let decoded = match *ty {
        Type::BOOL => as_json!(bool),
        Type::INT2 => as_json!(i16),
        Type::INT4 => as_json!(i32),
        Type::INT8 => as_json!(i64),
        Type::FLOAT4 => as_json!(f32),
        Type::FLOAT8 => as_json!(f64),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(idx).ok().flatten(),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => as_json!(String),
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String),
    };

    decoded.unwrap_or(Value::Null)
}

fn row_to_json(row: &Row) -> Value {
    let mut obj = serde_json::Map::new();
    for (idx, col) in row.columns().iter().enumerate() {
        obj.insert(col.name().to_string(), pg_value_to_json(row, idx));
    }
    Value::Object(obj)
}

/// `safeQuery(sql, params, options) -> {rows, rowCount, fields, durationMs}`
/// (§6). This is the one call surface the tool adapters use; all guard
/// behavior lives here and in the components it composes.
pub async fn safe_query(
    manager: &GatewayManager,
    pool: &Pool,
    sql: &str,
    params: &[Value],
    options: SafeQueryOptions,
) -> Result<QueryResult, GatewayError> {
    let call_start = Instant::now();

    // Step 1: execution permission.
    if let crate::circuit::Admission::Rejected { reason } = manager.can_execute().await {
        return Err(GatewayError::new(
            FailureKind::CircuitOpen,
            reason,
            call_start.elapsed(),
        ));
    }

    // Step 2: planned deadline.
    let override_duration = options.user_override_ms.map(Duration::from_millis);
    let plan = manager.get_timeout(sql, override_duration).await;

    // Step 3 (+4 inside the pool): acquire a connection.
    let connect_deadline = manager.config().timeout.connection_timeout;
    let conn = match pool.acquire(connect_deadline).await {
        Ok(conn) => conn,
        Err(err) => {
            manager.record_failure(sql).await;
            return Err(err);
        }
    };

    // Step 5: run the statement under the planned deadline.
    let bound_params: Vec<SqlParam> = params.iter().map(SqlParam::from_json).collect();
    let typed_params: Vec<(&(dyn ToSql + Sync), Type)> = bound_params
        .iter()
        .map(|p| (p as &(dyn ToSql + Sync), Type::TEXT))
        .collect();

    let query_fut = conn.client().query_typed(sql, &typed_params);
    let outcome = tokio::time::timeout(plan.deadline, query_fut).await;

    match outcome {
        Err(_) => {
            pool.release(conn);
            manager.record_failure(sql).await;
            Err(GatewayError::new(
                FailureKind::Timeout,
                format!("planned deadline of {}ms elapsed ({})", plan.deadline.as_millis(), plan.reason),
                call_start.elapsed(),
            ))
        }
        Ok(Err(driver_err)) => {
            pool.release(conn);
            let kind = classify_driver_error(&driver_err);
            manager.record_failure(sql).await;
            Err(GatewayError::with_cause(
                kind,
                "postgres returned an error",
                call_start.elapsed(),
                driver_err,
            ))
        }
        Ok(Ok(rows)) => {
            let fields = rows
                .first()
                .map(|r| {
                    r.columns()
                        .iter()
                        .map(|c| FieldInfo {
                            name: c.name().to_string(),
                            type_oid: c.type_().oid(),
                        })
                        .collect()
                })
                .unwrap_or_default();
            let json_rows: Vec<Value> = rows.iter().map(row_to_json).collect();
            let row_count = json_rows.len();

            pool.release(conn);
            manager.record_success().await;

            Ok(QueryResult {
                rows: json_rows,
                row_count,
                fields,
                duration_ms: call_start.elapsed().as_millis() as u64,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_param_from_json_preserves_null() {
        assert!(matches!(SqlParam::from_json(&Value::Null), SqlParam::Null));
    }

    #[test]
    fn sql_param_from_json_stringifies_scalars() {
        match SqlParam::from_json(&Value::from(42)) {
            SqlParam::Text(s) => assert_eq!(s, "42"),
            SqlParam::Null => panic!("expected text"),
        }
    }
}
