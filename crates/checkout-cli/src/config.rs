//! Application configuration loaded from environment variables.

use std::time::Duration;

use checkout::DEFAULT_CHECKOUT_DEADLINE;
use inventory_store::{DEFAULT_LOCK_TIMEOUT, bounded_lock_timeout};

/// Runtime configuration with sensible defaults.
///
/// Reads from environment variables, after loading `.env` if present:
/// - `DATABASE_URL` - full connection string; when unset it is composed from
///   `DB_HOST` (`localhost`), `DB_PORT` (`5432`), `DB_USER` (`postgres`),
///   `DB_PASSWORD` (empty) and `DB_NAME` (`ecommerce_db`)
/// - `DB_MAX_CONNECTIONS` - pool size (default: `10`)
/// - `CHECKOUT_LOCK_TIMEOUT_MS` - row lock wait bound (default: `5000`, minimum `1`)
/// - `CHECKOUT_DEADLINE_MS` - whole checkout bound (default: `10000`)
/// - `RUST_LOG` - tracing filter directive (default: `"info"`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub lock_timeout: Duration,
    pub checkout_deadline: Duration,
    pub log_level: String,
}

impl Config {
    /// Loads configuration from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        // A missing .env file is normal outside development
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let number = |key: &str, default: u64| {
            lookup(key)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .unwrap_or(default)
        };

        let database_url = lookup("DATABASE_URL").unwrap_or_else(|| {
            let user = var("DB_USER", "postgres");
            let password = var("DB_PASSWORD", "");
            let credentials = if password.is_empty() {
                user
            } else {
                format!("{user}:{password}")
            };
            format!(
                "postgres://{credentials}@{}:{}/{}",
                var("DB_HOST", "localhost"),
                var("DB_PORT", "5432"),
                var("DB_NAME", "ecommerce_db"),
            )
        });

        let defaults = Self::default();
        Self {
            database_url,
            max_connections: lookup("DB_MAX_CONNECTIONS")
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(defaults.max_connections),
            lock_timeout: bounded_lock_timeout(Duration::from_millis(number(
                "CHECKOUT_LOCK_TIMEOUT_MS",
                defaults.lock_timeout.as_millis() as u64,
            ))),
            checkout_deadline: Duration::from_millis(number(
                "CHECKOUT_DEADLINE_MS",
                defaults.checkout_deadline.as_millis() as u64,
            )),
            log_level: var("RUST_LOG", "info"),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://postgres@localhost:5432/ecommerce_db".to_string(),
            max_connections: 10,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            checkout_deadline: DEFAULT_CHECKOUT_DEADLINE,
            log_level: "info".to_string(),
        }
    }
}
