//! Immutable configuration loaded once at process start.
//!
//! Every tunable in this module has a default matching the documented
//! defaults of the gateway's configuration surface, and can be overridden by
//! an environment variable of the same name, upper-cased and prefixed with
//! `PG_NEVERHANG_`. Parsing happens once, eagerly, at startup: a malformed
//! value is a fatal configuration error, never a silently-ignored default.

use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Connection parameters for the upstream Postgres instance.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub ssl: bool,
    /// When set, overrides host/port/database/user/password entirely.
    pub connection_string: Option<String>,
}

/// Pool discipline tunables (§4.4).
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: usize,
    pub min_connections: usize,
    pub connection_ttl: Duration,
    pub idle_timeout: Duration,
    pub validate_on_borrow: bool,
}

/// Circuit breaker tunables (§4.2).
#[derive(Debug, Clone)]
pub struct CircuitConfig {
    pub failure_threshold: usize,
    pub failure_window: Duration,
    pub open_duration: Duration,
    pub recovery_threshold: usize,
}

/// Health monitor tunables (§4.3).
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub check_interval: Duration,
    pub degraded_interval: Duration,
}

/// Adaptive timeout tunables (§4.1).
#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub base_timeout: Duration,
    pub connection_timeout: Duration,
    pub health_check_timeout: Duration,
    pub adaptive: bool,
    pub min_timeout: Duration,
    pub max_timeout: Duration,
}

/// Pre-flight policy tunables (§6).
#[derive(Debug, Clone)]
pub struct PolicyConfig {
    pub blacklisted_tables: Vec<String>,
    pub blacklisted_columns: Vec<String>,
    pub default_select_limit: u32,
}

/// The full, immutable gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub database: DatabaseConfig,
    pub pool: PoolConfig,
    pub circuit: CircuitConfig,
    pub health: HealthConfig,
    pub timeout: TimeoutConfig,
    pub policy: PolicyConfig,
}

/// Fatal at startup: the environment does not describe a valid configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({source})")]
    InvalidValue {
        key: &'static str,
        value: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Reads `PG_NEVERHANG_{key}` from the environment, falling back to
/// `default` when unset, and parsing via `FromStr`.
///
/// Mirrors the small env-driven config helpers the rest of this codebase's
/// ecosystem uses: a single place that turns "string from the outside
/// world" into "typed value or a named fatal error", so config loading
/// never panics on a typo silently downstream.
fn env_config<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(format!("PG_NEVERHANG_{key}")) {
        Ok(raw) => raw.parse::<T>().map_err(|e| ConfigError::InvalidValue {
            key,
            value: raw,
            source: Box::new(e),
        }),
        Err(_) => Ok(default),
    }
}

fn env_config_ms(key: &'static str, default_ms: u64) -> Result<Duration, ConfigError> {
    env_config(key, default_ms).map(Duration::from_millis)
}

fn env_config_string(key: &'static str, default: &str) -> String {
    env::var(format!("PG_NEVERHANG_{key}")).unwrap_or_else(|_| default.to_string())
}

impl GatewayConfig {
    /// Loads configuration from the environment, applying defaults for
    /// anything unset. Returns a `ConfigError` for malformed values; the
    /// caller (main) treats this as fatal per the gateway's error-handling
    /// design.
    pub fn from_env() -> Result<Self, ConfigError> {
        let connection_string = env::var("PG_NEVERHANG_connection_string").ok();

        let database = DatabaseConfig {
            host: env_config_string("host", "localhost"),
            port: env_config("port", 5432u16)?,
            database: env_config_string("database", "postgres"),
            user: env_config_string("user", "postgres"),
            password: env_config_string("password", ""),
            ssl: env_config("ssl", false)?,
            connection_string,
        };

        let pool = PoolConfig {
            max_connections: env_config("max_connections", 5usize)?,
            min_connections: env_config("min_connections", 1usize)?,
            connection_ttl: env_config_ms("connection_ttl_ms", 300_000)?,
            idle_timeout: env_config_ms("idle_timeout_ms", 60_000)?,
            validate_on_borrow: env_config("validate_on_borrow", true)?,
        };

        let circuit = CircuitConfig {
            failure_threshold: env_config("circuit_failure_threshold", 5usize)?,
            failure_window: env_config_ms("circuit_failure_window_ms", 60_000)?,
            open_duration: env_config_ms("circuit_open_duration_ms", 30_000)?,
            recovery_threshold: env_config("circuit_recovery_threshold", 2usize)?,
        };

        let health = HealthConfig {
            check_interval: env_config_ms("health_check_interval_ms", 30_000)?,
            degraded_interval: env_config_ms("health_degraded_interval_ms", 5_000)?,
        };

        let timeout = TimeoutConfig {
            base_timeout: env_config_ms("base_timeout_ms", 10_000)?,
            connection_timeout: env_config_ms("connection_timeout_ms", 2_000)?,
            health_check_timeout: env_config_ms("health_check_timeout_ms", 2_000)?,
            adaptive: env_config("adaptive_timeout", true)?,
            min_timeout: env_config_ms("min_timeout_ms", 2_000)?,
            max_timeout: env_config_ms("max_timeout_ms", 30_000)?,
        };

        let policy = PolicyConfig {
            blacklisted_tables: split_csv_env("blacklisted_tables"),
            blacklisted_columns: split_csv_env("blacklisted_columns"),
            default_select_limit: env_config("default_select_limit", 1_000u32)?,
        };

        Ok(Self {
            database,
            pool,
            circuit,
            health,
            timeout,
            policy,
        })
    }
}

fn split_csv_env(key: &'static str) -> Vec<String> {
    env::var(format!("PG_NEVERHANG_{key}"))
        .ok()
        .map(|raw| {
            raw.split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        // SAFETY: tests run single-threaded enough for this; we don't
        // mutate process env here, so from_env() reads an empty overlay.
        let cfg = GatewayConfig {
            database: DatabaseConfig {
                host: "localhost".into(),
                port: 5432,
                database: "postgres".into(),
                user: "postgres".into(),
                password: String::new(),
                ssl: false,
                connection_string: None,
            },
            pool: PoolConfig {
                max_connections: 5,
                min_connections: 1,
                connection_ttl: Duration::from_millis(300_000),
                idle_timeout: Duration::from_millis(60_000),
                validate_on_borrow: true,
            },
            circuit: CircuitConfig {
                failure_threshold: 5,
                failure_window: Duration::from_millis(60_000),
                open_duration: Duration::from_millis(30_000),
                recovery_threshold: 2,
            },
            health: HealthConfig {
                check_interval: Duration::from_millis(30_000),
                degraded_interval: Duration::from_millis(5_000),
            },
            timeout: TimeoutConfig {
                base_timeout: Duration::from_millis(10_000),
                connection_timeout: Duration::from_millis(2_000),
                health_check_timeout: Duration::from_millis(2_000),
                adaptive: true,
                min_timeout: Duration::from_millis(2_000),
                max_timeout: Duration::from_millis(30_000),
            },
            policy: PolicyConfig {
                blacklisted_tables: vec![],
                blacklisted_columns: vec![],
                default_select_limit: 1_000,
            },
        };

        assert_eq!(cfg.timeout.base_timeout, Duration::from_secs(10));
        assert_eq!(cfg.pool.max_connections, 5);
        assert_eq!(cfg.circuit.failure_threshold, 5);
    }

    #[test]
    fn env_config_falls_back_to_default() {
        env::remove_var("PG_NEVERHANG_does_not_exist");
        let v: u64 = env_config("does_not_exist", 42).unwrap();
        assert_eq!(v, 42);
    }

    #[test]
    fn env_config_rejects_malformed_value() {
        env::set_var("PG_NEVERHANG_test_bad_number", "not-a-number");
        let result: Result<u64, ConfigError> = env_config("test_bad_number", 1);
        assert!(result.is_err());
        env::remove_var("PG_NEVERHANG_test_bad_number");
    }
}
