//! `introspect` tool: schema/table/column enumeration via
//! `information_schema`. An ordinary caller of the core — no special-cased
//! safety behavior beyond the shared pre-flight hooks, since the SQL here
//! is built by the adapter itself rather than supplied by the caller.

use serde_json::Value;

use super::optional_str;
use crate::error::GatewayError;
use crate::executor::{safe_query, SafeQueryOptions};
use crate::manager::GatewayManager;
use crate::pool::Pool;

/// Builds the introspection query for the requested scope.
///
/// - no `table` -> list tables (and their schema) visible in `schema`
///   (default `public`).
/// - `table` given -> list columns, types, and nullability for that table.
fn build_sql(schema: &str, table: Option<&str>) -> (String, Vec<Value>) {
    match table {
        None => (
            "SELECT table_schema, table_name, table_type \
             FROM information_schema.tables \
             WHERE table_schema = $1 \
             ORDER BY table_name"
                .to_string(),
            vec![Value::String(schema.to_string())],
        ),
        Some(table) => (
            "SELECT column_name, data_type, is_nullable, column_default \
             FROM information_schema.columns \
             WHERE table_schema = $1 AND table_name = $2 \
             ORDER BY ordinal_position"
                .to_string(),
            vec![Value::String(schema.to_string()), Value::String(table.to_string())],
        ),
    }
}

pub async fn run(manager: &GatewayManager, pool: &Pool, args: &Value) -> Result<Value, GatewayError> {
    let schema = optional_str(args, "schema").unwrap_or_else(|| "public".to_string());
    let table = optional_str(args, "table");

    let (sql, params) = build_sql(&schema, table.as_deref());

    let result = safe_query(manager, pool, &sql, &params, SafeQueryOptions::default()).await?;

    Ok(serde_json::json!({
        "rows": result.rows,
        "row_count": result.row_count,
        "duration_ms": result.duration_ms,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_table_lists_tables_in_schema() {
        let (sql, params) = build_sql("public", None);
        assert!(sql.contains("information_schema.tables"));
        assert_eq!(params, vec![Value::String("public".to_string())]);
    }

    #[test]
    fn table_given_lists_columns() {
        let (sql, params) = build_sql("public", Some("users"));
        assert!(sql.contains("information_schema.columns"));
        assert_eq!(params.len(), 2);
    }
}
