use std::str::FromStr;
use std::time::Duration;

use config::ConfigError;

/// Which ledger store implementation backs the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => Err(ConfigError::Message(format!(
                "STORE_BACKEND must be 'postgres' or 'memory', got '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub store_backend: StoreBackend,
    /// Seconds a payment may stay outstanding before it is flagged overdue
    pub payment_deadline_secs: u64,
    pub overdue_sweep_interval_secs: u64,
    pub store_retry_attempts: u32,
    pub db_max_connections: u32,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; `from_env` passes the process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        Ok(Self {
            database_url: lookup("DATABASE_URL")
                .unwrap_or_else(|| "postgresql://localhost/income_ledger".to_string()),
            bind_address: lookup("BIND_ADDRESS")
                .unwrap_or_else(|| "0.0.0.0:8080".to_string()),
            store_backend: parse_or(&lookup, "STORE_BACKEND", StoreBackend::Postgres)?,
            payment_deadline_secs: parse_or(&lookup, "PAYMENT_DEADLINE_SECS", 2 * 24 * 60 * 60)?,
            overdue_sweep_interval_secs: parse_or(&lookup, "OVERDUE_SWEEP_INTERVAL_SECS", 60)?,
            store_retry_attempts: parse_or(&lookup, "STORE_RETRY_ATTEMPTS", 3)?,
            db_max_connections: parse_or(&lookup, "DB_MAX_CONNECTIONS", 20)?,
        })
    }

    pub fn payment_deadline(&self) -> Duration {
        Duration::from_secs(self.payment_deadline_secs)
    }

    pub fn overdue_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.overdue_sweep_interval_secs.max(1))
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::Message(format!("{} is invalid: {}", key, e))),
        None => Ok(default),
    }
}
