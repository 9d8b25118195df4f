// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::backoff::{BackoffPolicy, EntropyMode};
use crate::reconciler::ReconcilerConfig;

/// Intentful engine configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// Use the short debug jitter instead of the production one
    pub debug: bool,
    /// How often the watchlist is scanned
    pub poll_interval: Duration,
    /// Default backoff exponent
    pub retry_exponent: f64,
    /// Upper bound of any retry delay
    pub max_backoff: Duration,
    /// Default number of handler failures before a watcher fails
    pub max_handler_retries: u32,
    /// Handler call timeout
    pub handler_timeout: Duration,
    /// Maximum concurrent handler calls
    pub max_concurrent_handlers: usize,
    /// Provider definitions to register at startup
    pub providers_file: Option<PathBuf>,
}

fn parse_var<T: FromStr>(
    name: &'static str,
    default: &str,
    message: &'static str,
) -> Result<T, ConfigError> {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .parse()
        .map_err(|_| ConfigError::Invalid(name, message))
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `INTENTFUL_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `INTENTFUL_DEBUG`: debug jitter bounds (default: false)
    /// - `INTENTFUL_POLL_INTERVAL_MS`: watchlist scan period (default: 3000)
    /// - `INTENTFUL_RETRY_EXPONENT`: backoff exponent, at least 1 (default: 2)
    /// - `INTENTFUL_MAX_BACKOFF_SECS`: backoff clamp (default: 300)
    /// - `INTENTFUL_MAX_HANDLER_RETRIES`: retry ceiling (default: 10)
    /// - `INTENTFUL_HANDLER_TIMEOUT_SECS`: handler timeout (default: 60)
    /// - `INTENTFUL_MAX_CONCURRENT_HANDLERS`: parallel handler calls (default: 32)
    /// - `INTENTFUL_PROVIDERS_FILE`: JSON array of providers to register (default: none)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("INTENTFUL_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("INTENTFUL_DATABASE_URL"))?;

        let debug: bool = parse_var("INTENTFUL_DEBUG", "false", "must be true or false")?;

        let poll_interval_ms: u64 = parse_var(
            "INTENTFUL_POLL_INTERVAL_MS",
            "3000",
            "must be a positive integer",
        )?;
        if poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "INTENTFUL_POLL_INTERVAL_MS",
                "must be a positive integer",
            ));
        }

        let retry_exponent: f64 = parse_var(
            "INTENTFUL_RETRY_EXPONENT",
            "2",
            "must be a number of at least 1",
        )?;
        if !(retry_exponent >= 1.0 && retry_exponent.is_finite()) {
            return Err(ConfigError::Invalid(
                "INTENTFUL_RETRY_EXPONENT",
                "must be a number of at least 1",
            ));
        }

        let max_backoff_secs: u64 = parse_var(
            "INTENTFUL_MAX_BACKOFF_SECS",
            "300",
            "must be a non-negative integer",
        )?;

        let max_handler_retries: u32 = parse_var(
            "INTENTFUL_MAX_HANDLER_RETRIES",
            "10",
            "must be a positive integer",
        )?;
        if max_handler_retries == 0 {
            return Err(ConfigError::Invalid(
                "INTENTFUL_MAX_HANDLER_RETRIES",
                "must be a positive integer",
            ));
        }

        let handler_timeout_secs: u64 = parse_var(
            "INTENTFUL_HANDLER_TIMEOUT_SECS",
            "60",
            "must be a positive integer",
        )?;

        let max_concurrent_handlers: usize = parse_var(
            "INTENTFUL_MAX_CONCURRENT_HANDLERS",
            "32",
            "must be a positive integer",
        )?;
        if max_concurrent_handlers == 0 {
            return Err(ConfigError::Invalid(
                "INTENTFUL_MAX_CONCURRENT_HANDLERS",
                "must be a positive integer",
            ));
        }

        let providers_file = std::env::var("INTENTFUL_PROVIDERS_FILE")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            database_url,
            debug,
            poll_interval: Duration::from_millis(poll_interval_ms),
            retry_exponent,
            max_backoff: Duration::from_secs(max_backoff_secs),
            max_handler_retries,
            handler_timeout: Duration::from_secs(handler_timeout_secs),
            max_concurrent_handlers,
            providers_file,
        })
    }

    /// Reconciler settings derived from this configuration.
    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            poll_interval: self.poll_interval,
            max_concurrent_handlers: self.max_concurrent_handlers,
            retry_ceiling: self.max_handler_retries,
            backoff: BackoffPolicy {
                retry_exponent: self.retry_exponent,
                max_backoff: self.max_backoff,
            },
            entropy: if self.debug {
                EntropyMode::Debug
            } else {
                EntropyMode::Production
            },
            handler_timeout: self.handler_timeout,
        }
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Serializes tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const OPTIONAL_VARS: &[&str] = &[
        "INTENTFUL_DEBUG",
        "INTENTFUL_POLL_INTERVAL_MS",
        "INTENTFUL_RETRY_EXPONENT",
        "INTENTFUL_MAX_BACKOFF_SECS",
        "INTENTFUL_MAX_HANDLER_RETRIES",
        "INTENTFUL_HANDLER_TIMEOUT_SECS",
        "INTENTFUL_MAX_CONCURRENT_HANDLERS",
        "INTENTFUL_PROVIDERS_FILE",
    ];

    /// Sets env vars for a test and restores them on drop
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        /// Start from the database URL and no optional variables.
        fn baseline() -> Self {
            let mut guard = Self::new();
            guard.set("INTENTFUL_DATABASE_URL", "sqlite::memory:");
            for var in OPTIONAL_VARS {
                guard.remove(var);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            let old = env::var(key).ok();
            self.vars.push((key.to_string(), old));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_with_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::baseline();

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite::memory:");
        assert!(!config.debug);
        assert_eq!(config.poll_interval, Duration::from_millis(3000));
        assert_eq!(config.retry_exponent, 2.0);
        assert_eq!(config.max_backoff, Duration::from_secs(300));
        assert_eq!(config.max_handler_retries, 10);
        assert_eq!(config.handler_timeout, Duration::from_secs(60));
        assert_eq!(config.max_concurrent_handlers, 32);
        assert!(config.providers_file.is_none());
    }

    #[test]
    fn test_config_from_env_all_custom() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::baseline();

        guard.set("INTENTFUL_DATABASE_URL", "sqlite:/var/lib/intentful.db?mode=rwc");
        guard.set("INTENTFUL_DEBUG", "true");
        guard.set("INTENTFUL_POLL_INTERVAL_MS", "250");
        guard.set("INTENTFUL_RETRY_EXPONENT", "1.5");
        guard.set("INTENTFUL_MAX_BACKOFF_SECS", "30");
        guard.set("INTENTFUL_MAX_HANDLER_RETRIES", "3");
        guard.set("INTENTFUL_HANDLER_TIMEOUT_SECS", "5");
        guard.set("INTENTFUL_MAX_CONCURRENT_HANDLERS", "4");
        guard.set("INTENTFUL_PROVIDERS_FILE", "providers.json");

        let config = Config::from_env().unwrap();

        assert_eq!(config.database_url, "sqlite:/var/lib/intentful.db?mode=rwc");
        assert!(config.debug);
        assert_eq!(config.poll_interval, Duration::from_millis(250));
        assert_eq!(config.retry_exponent, 1.5);
        assert_eq!(config.max_backoff, Duration::from_secs(30));
        assert_eq!(config.max_handler_retries, 3);
        assert_eq!(config.handler_timeout, Duration::from_secs(5));
        assert_eq!(config.max_concurrent_handlers, 4);
        assert_eq!(config.providers_file, Some(PathBuf::from("providers.json")));

        let reconciler = config.reconciler_config();
        assert_eq!(reconciler.entropy, EntropyMode::Debug);
        assert_eq!(reconciler.retry_ceiling, 3);
        assert_eq!(reconciler.backoff.retry_exponent, 1.5);
    }

    #[test]
    fn test_config_missing_database_url() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::baseline();

        guard.remove("INTENTFUL_DATABASE_URL");

        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Missing("INTENTFUL_DATABASE_URL")));
        assert!(err.to_string().contains("INTENTFUL_DATABASE_URL"));
    }

    #[test]
    fn test_config_invalid_values() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let cases = [
            ("INTENTFUL_DEBUG", "yes"),
            ("INTENTFUL_POLL_INTERVAL_MS", "0"),
            ("INTENTFUL_POLL_INTERVAL_MS", "soon"),
            ("INTENTFUL_RETRY_EXPONENT", "0.5"),
            ("INTENTFUL_MAX_BACKOFF_SECS", "-1"),
            ("INTENTFUL_MAX_HANDLER_RETRIES", "0"),
            ("INTENTFUL_MAX_CONCURRENT_HANDLERS", "abc"),
        ];

        for (name, value) in cases {
            let mut guard = EnvGuard::baseline();
            guard.set(name, value);

            let err = Config::from_env().unwrap_err();
            assert!(
                matches!(err, ConfigError::Invalid(var, _) if var == name),
                "{name}={value} should be rejected, got {err:?}"
            );
        }
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::Invalid("INTENTFUL_RETRY_EXPONENT", "must be a number of at least 1");
        assert_eq!(
            err.to_string(),
            "invalid value for INTENTFUL_RETRY_EXPONENT: must be a number of at least 1"
        );
    }
}
