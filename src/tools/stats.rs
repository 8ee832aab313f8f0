//! `stats` tool: table/index size and row-count accounting via
//! `pg_total_relation_size` and friends. An ordinary caller of the core.

use serde_json::Value;

use super::optional_str;
use crate::error::GatewayError;
use crate::executor::{safe_query, SafeQueryOptions};
use crate::manager::GatewayManager;
use crate::pool::Pool;

fn build_sql(schema: &str, table: Option<&str>) -> (String, Vec<Value>) {
    match table {
        None => (
            "SELECT relname AS table_name, \
                    pg_total_relation_size(c.oid) AS total_bytes, \
                    pg_relation_size(c.oid) AS table_bytes, \
                    pg_indexes_size(c.oid) AS index_bytes, \
                    (SELECT reltuples::bigint FROM pg_class WHERE oid = c.oid) AS row_estimate \
             FROM pg_class c \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relkind = 'r' \
             ORDER BY total_bytes DESC"
                .to_string(),
            vec![Value::String(schema.to_string())],
        ),
        Some(table) => (
            "SELECT relname AS table_name, \
                    pg_total_relation_size(c.oid) AS total_bytes, \
                    pg_relation_size(c.oid) AS table_bytes, \
                    pg_indexes_size(c.oid) AS index_bytes, \
                    (SELECT reltuples::bigint FROM pg_class WHERE oid = c.oid) AS row_estimate \
             FROM pg_class c \
             JOIN pg_namespace n ON n.oid = c.relnamespace \
             WHERE n.nspname = $1 AND c.relname = $2 AND c.relkind = 'r'"
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
    fn whole_schema_query_orders_by_total_size() {
        let (sql, params) = build_sql("public", None);
        assert!(sql.contains("pg_total_relation_size"));
        assert!(sql.contains("ORDER BY total_bytes DESC"));
        assert_eq!(params.len(), 1);
    }

    #[test]
    fn single_table_query_scopes_to_one_relation() {
        let (sql, params) = build_sql("public", Some("orders"));
        assert!(sql.contains("c.relname = $2"));
        assert_eq!(params.len(), 2);
    }
}
