//! Worker configuration

use std::env;

use planhub_shared::DEFAULT_MAX_CONNECTIONS;

/// Every minute, at second 0
const DEFAULT_EXPIRY_SWEEP_CRON: &str = "0 * * * * *";
/// Top of every hour
const DEFAULT_INVARIANT_CHECK_CRON: &str = "0 0 * * * *";

/// Worker configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Schedules (six-field cron, seconds first)
    pub expiry_sweep_cron: String,
    pub invariant_check_cron: String,

    // Feature flags
    pub enable_expiry_sweep: bool,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_CONNECTIONS),
            run_migrations: flag("RUN_MIGRATIONS", false),

            expiry_sweep_cron: cron("EXPIRY_SWEEP_CRON", DEFAULT_EXPIRY_SWEEP_CRON)?,
            invariant_check_cron: cron("INVARIANT_CHECK_CRON", DEFAULT_INVARIANT_CHECK_CRON)?,

            enable_expiry_sweep: flag("ENABLE_EXPIRY_SWEEP", true),
        })
    }
}

fn flag(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

/// Cron expressions must have six fields; five-field crontab lines are a common mistake
fn cron(name: &'static str, default: &str) -> Result<String, ConfigError> {
    let value = env::var(name).unwrap_or_else(|_| default.to_string());
    if value.split_whitespace().count() != 6 {
        return Err(ConfigError::InvalidCron(name));
    }
    Ok(value)
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid cron expression in {0} (expected six fields: sec min hour day month weekday)")]
    InvalidCron(&'static str),
}
