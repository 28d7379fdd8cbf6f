use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    pub database_url: String,
    pub http_addr: String,
    pub db_max_connections: u32,
    pub record_store_url: String,
    pub record_store_table: String,
    pub sweep_interval: Duration,
    pub checkin: CheckInSettings,
}

/// Knobs consumed on the check-in path and by the sweeper.
#[derive(Debug, Clone)]
pub struct CheckInSettings {
    pub claim_limit: u32,
    pub retry_window: Duration,
    pub default_max_attempts: u32,
    pub default_command_ttl: Duration,
    pub check_in_interval_secs: i64,
    pub stale_factor: u32,
    pub max_telemetry_batch: usize,
}

impl Default for CheckInSettings {
    fn default() -> Self {
        Self {
            claim_limit: 10,
            retry_window: Duration::from_secs(300),
            default_max_attempts: 3,
            default_command_ttl: Duration::from_secs(86_400),
            check_in_interval_secs: 300,
            stale_factor: 3,
            max_telemetry_batch: 500,
        }
    }
}

impl Settings {
    pub fn from_env() -> Self {
        let database_url =
            env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://coordinator.db".to_string());
        let record_store_url =
            env::var("RECORD_STORE_URL").unwrap_or_else(|_| database_url.clone());
        let defaults = CheckInSettings::default();

        Self {
            http_addr: env::var("HTTP_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 5),
            record_store_table: env::var("RECORD_STORE_TABLE")
                .unwrap_or_else(|_| "Entry".to_string()),
            sweep_interval: Duration::from_secs(env_or("SWEEP_INTERVAL_SECS", 60)),
            checkin: CheckInSettings {
                claim_limit: env_or("CLAIM_LIMIT", defaults.claim_limit),
                retry_window: Duration::from_secs(env_or(
                    "RETRY_WINDOW_SECS",
                    defaults.retry_window.as_secs(),
                )),
                default_max_attempts: env_or("DEFAULT_MAX_ATTEMPTS", defaults.default_max_attempts),
                default_command_ttl: Duration::from_secs(env_or(
                    "DEFAULT_COMMAND_TTL_SECS",
                    defaults.default_command_ttl.as_secs(),
                )),
                check_in_interval_secs: env_or(
                    "CHECK_IN_INTERVAL_SECS",
                    defaults.check_in_interval_secs,
                ),
                stale_factor: env_or("STALE_FACTOR", defaults.stale_factor),
                max_telemetry_batch: env_or("MAX_TELEMETRY_BATCH", defaults.max_telemetry_batch),
            },
            database_url,
            record_store_url,
        }
    }
}

/// Reads `key` and parses it, falling back to `default` when unset or malformed.
fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_or_falls_back_on_garbage() {
        env::set_var("COORDINATOR_TEST_GARBAGE", "not-a-number");
        assert_eq!(env_or("COORDINATOR_TEST_GARBAGE", 7u32), 7);
        env::remove_var("COORDINATOR_TEST_GARBAGE");
    }

    #[test]
    fn test_env_or_parses_value() {
        env::set_var("COORDINATOR_TEST_LIMIT", "42");
        assert_eq!(env_or("COORDINATOR_TEST_LIMIT", 7u32), 42);
        env::remove_var("COORDINATOR_TEST_LIMIT");
    }
}
