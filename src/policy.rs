//! Pre-flight safety policy (§6 collaborators).
//!
//! Explicitly out of the NEVERHANG core (§1): these are pattern-level,
//! pre-parse rules the tool layer applies *before* calling into the
//! guarded executor. No SQL parser is used here either — the same
//! fixed-pattern philosophy as the timeout planner's shape detection.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

/// Statements or fragments that are never allowed, regardless of caller.
static DENYLIST: &[&str] = &[
    r"(?i)\bdrop\s+table\b",
    r"(?i)\bdrop\s+database\b",
    r"(?i)\btruncate\b",
    r"(?i)\balter\s+(system|role|user)\b",
    r"(?i)\bgrant\b",
    r"(?i)\brevoke\b",
    r"(?i)\bpg_read_file\b",
    r"(?i)\bpg_read_binary_file\b",
    r"(?i)\bcopy\b.*\bprogram\b",
    r"(?i)\bcreate\s+(role|user)\b",
];

static DENYLIST_RE: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    DENYLIST
        .iter()
        .map(|p| Regex::new(p).expect("static denylist pattern is valid"))
        .collect()
});

static UPDATE_DELETE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\s*(update|delete)\b").unwrap());
static WHERE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bwhere\b").unwrap());
static SELECT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)^\s*select\b").unwrap());
static LIMIT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\blimit\s+\d+").unwrap());
static RETURNING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\breturning\s+(.+?)\s*(;|$)").unwrap());

/// A rejected pre-flight check, carrying a human-readable reason. The tool
/// layer surfaces this as a `permission_denied` failure (§4.5) without ever
/// handing the statement to the core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation(pub String);

/// Blacklisted schema objects a query must not touch.
#[derive(Debug, Clone, Default)]
pub struct Blacklist {
    pub tables: HashSet<String>,
    pub columns: HashSet<String>,
}

impl Blacklist {
    pub fn from_config(config: &crate::config::PolicyConfig) -> Self {
        Self {
            tables: config.blacklisted_tables.iter().map(|s| s.to_lowercase()).collect(),
            columns: config.blacklisted_columns.iter().map(|s| s.to_lowercase()).collect(),
        }
    }
}

/// Denylist pattern check over the raw SQL text.
pub fn check_denylist(sql: &str) -> Result<(), PolicyViolation> {
    for re in DENYLIST_RE.iter() {
        if re.is_match(sql) {
            return Err(PolicyViolation(format!(
                "statement matches a denylisted pattern: {}",
                re.as_str()
            )));
        }
    }
    Ok(())
}

/// Table/column blacklist check. A crude substring scan is intentional:
/// it is a coarse safety net, not a semantic guarantee, and runs before
/// the core ever sees the statement.
pub fn check_blacklist(sql: &str, blacklist: &Blacklist) -> Result<(), PolicyViolation> {
    let lower = sql.to_lowercase();
    for table in &blacklist.tables {
        if lower.contains(&table.to_lowercase()) {
            return Err(PolicyViolation(format!("table '{table}' is blacklisted")));
        }
    }
    for column in &blacklist.columns {
        if lower.contains(&column.to_lowercase()) {
            return Err(PolicyViolation(format!("column '{column}' is blacklisted")));
        }
    }
    Ok(())
}

/// WHERE-clause requirement for top-level `UPDATE`/`DELETE`.
///
/// Open Question (§9, resolved in DESIGN.md): this guards the top-level
/// statement only. A `WHERE` inside a CTE prologue ahead of an unguarded
/// top-level `UPDATE`/`DELETE` does not satisfy this check, matching the
/// documented behavior of the system this was distilled from.
pub fn require_where_for_mutation(sql: &str) -> Result<(), PolicyViolation> {
    if UPDATE_DELETE_RE.is_match(sql) && !WHERE_RE.is_match(sql) {
        return Err(PolicyViolation(
            "UPDATE/DELETE without a WHERE clause is rejected".to_string(),
        ));
    }
    Ok(())
}

/// Auto-`LIMIT` injection for a bare `SELECT` with no existing `LIMIT`.
pub fn apply_auto_limit(sql: &str, default_limit: u32) -> String {
    if SELECT_RE.is_match(sql) && !LIMIT_RE.is_match(sql) {
        format!("{} LIMIT {}", sql.trim_end_matches(';').trim_end(), default_limit)
    } else {
        sql.to_string()
    }
}

/// `RETURNING` column filtering: rejects a mutation whose `RETURNING`
/// clause would surface a blacklisted column.
pub fn check_returning(sql: &str, blacklist: &Blacklist) -> Result<(), PolicyViolation> {
    let Some(caps) = RETURNING_RE.captures(sql) else {
        return Ok(());
    };
    let columns = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
    for raw_col in columns.split(',') {
        let col = raw_col.trim().trim_matches('"').to_lowercase();
        if col == "*" {
            continue;
        }
        if blacklist.columns.contains(&col) {
            return Err(PolicyViolation(format!(
                "RETURNING column '{col}' is blacklisted"
            )));
        }
    }
    Ok(())
}

/// Runs the full pre-flight sequence for the `query` tool (read path):
/// denylist, blacklist, then auto-`LIMIT` injection. Returns the SQL the
/// executor should actually run.
pub fn preflight_query(
    sql: &str,
    blacklist: &Blacklist,
    default_limit: u32,
) -> Result<String, PolicyViolation> {
    check_denylist(sql)?;
    check_blacklist(sql, blacklist)?;
    Ok(apply_auto_limit(sql, default_limit))
}

/// Runs the full pre-flight sequence for the `execute` tool (write path):
/// denylist, blacklist, WHERE-clause requirement, then RETURNING filtering.
pub fn preflight_execute(sql: &str, blacklist: &Blacklist) -> Result<(), PolicyViolation> {
    check_denylist(sql)?;
    check_blacklist(sql, blacklist)?;
    require_where_for_mutation(sql)?;
    check_returning(sql, blacklist)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denylist_rejects_drop_table() {
        assert!(check_denylist("DROP TABLE users").is_err());
    }

    #[test]
    fn denylist_allows_ordinary_select() {
        assert!(check_denylist("SELECT * FROM users").is_ok());
    }

    #[test]
    fn blacklist_rejects_configured_table() {
        let mut bl = Blacklist::default();
        bl.tables.insert("secrets".to_string());
        assert!(check_blacklist("SELECT * FROM secrets", &bl).is_err());
    }

    #[test]
    fn update_without_where_is_rejected() {
        assert!(require_where_for_mutation("UPDATE users SET active = false").is_err());
    }

    #[test]
    fn update_with_where_is_allowed() {
        assert!(require_where_for_mutation("UPDATE users SET active = false WHERE id = 1").is_ok());
    }

    #[test]
    fn auto_limit_injected_on_bare_select() {
        let sql = apply_auto_limit("SELECT * FROM users", 100);
        assert_eq!(sql, "SELECT * FROM users LIMIT 100");
    }

    #[test]
    fn auto_limit_not_duplicated_when_already_present() {
        let sql = apply_auto_limit("SELECT * FROM users LIMIT 10", 100);
        assert_eq!(sql, "SELECT * FROM users LIMIT 10");
    }

    #[test]
    fn returning_rejects_blacklisted_column() {
        let mut bl = Blacklist::default();
        bl.columns.insert("password_hash".to_string());
        let result = check_returning(
            "UPDATE users SET name = $1 WHERE id = 1 RETURNING id, password_hash",
            &bl,
        );
        assert!(result.is_err());
    }

    #[test]
    fn preflight_query_injects_limit_and_passes_blacklist() {
        let bl = Blacklist::default();
        let sql = preflight_query("SELECT * FROM users", &bl, 50).unwrap();
        assert_eq!(sql, "SELECT * FROM users LIMIT 50");
    }

    #[test]
    fn preflight_execute_rejects_unguarded_delete() {
        let bl = Blacklist::default();
        assert!(preflight_execute("DELETE FROM users", &bl).is_err());
    }

    #[test]
    fn returning_allows_non_blacklisted_columns() {
        let bl = Blacklist::default();
        let result = check_returning(
            "UPDATE users SET name = $1 WHERE id = 1 RETURNING id, name",
            &bl,
        );
        assert!(result.is_ok());
    }
}
