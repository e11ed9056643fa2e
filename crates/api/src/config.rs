//! Application configuration

use std::env;

use billsync_billing::dispatch::DEFAULT_QUEUE_CAPACITY;
use billsync_billing::processor::{DEFAULT_PROVIDER, DEFAULT_SUBSCRIPTION_PERIOD_DAYS};
use billsync_billing::ProcessorConfig;
use billsync_worker::SchedulerConfig;

pub const DEFAULT_WEBHOOK_TOLERANCE_SECS: i64 = 300;

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub bind_address: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,
    pub run_migrations: bool,

    // Webhooks
    /// Path segment and header prefix (`x-<provider>-signature`)
    pub provider_name: String,
    /// None disables signature checks
    pub webhook_secret: Option<String>,
    pub webhook_tolerance_secs: i64,
    pub dispatch_queue_capacity: usize,

    // Processing
    pub subscription_period_days: i64,

    // Admin authentication
    pub admin_jwt_secret: String,

    // Background jobs
    pub run_scheduler: bool,
    pub scheduler: SchedulerConfig,

    // Logging
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3000".to_string()),

            // Database
            database_url: env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .unwrap_or(10),
            run_migrations: flag("RUN_MIGRATIONS", true),

            // Webhooks
            provider_name: env::var("PROVIDER_NAME")
                .ok()
                .map(|p| p.trim().to_ascii_lowercase())
                .filter(|p| !p.is_empty())
                .unwrap_or_else(|| DEFAULT_PROVIDER.to_string()),
            webhook_secret: env::var("WEBHOOK_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            webhook_tolerance_secs: env::var("WEBHOOK_TOLERANCE_SECS")
                .unwrap_or_else(|_| DEFAULT_WEBHOOK_TOLERANCE_SECS.to_string())
                .parse()
                .unwrap_or(DEFAULT_WEBHOOK_TOLERANCE_SECS),
            dispatch_queue_capacity: env::var("DISPATCH_QUEUE_CAPACITY")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_QUEUE_CAPACITY),

            // Processing
            subscription_period_days: env::var("SUBSCRIPTION_PERIOD_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|days| *days > 0)
                .unwrap_or(DEFAULT_SUBSCRIPTION_PERIOD_DAYS),

            // Admin authentication
            admin_jwt_secret: {
                let secret = env::var("ADMIN_JWT_SECRET")
                    .map_err(|_| ConfigError::Missing("ADMIN_JWT_SECRET"))?;
                if secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "ADMIN_JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },

            // Background jobs
            run_scheduler: flag("RUN_SCHEDULER", true),
            scheduler: SchedulerConfig::from_env(),

            // Logging
            log_format: match env::var("LOG_FORMAT") {
                Ok(f) if f.eq_ignore_ascii_case("json") => LogFormat::Json,
                _ => LogFormat::Pretty,
            },
        })
    }

    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            provider: self.provider_name.clone(),
            subscription_period_days: self.subscription_period_days,
        }
    }
}

fn flag(name: &str, default: bool) -> bool {
    match env::var(name) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const STRONG_SECRET: &str = "test-admin-secret-must-be-at-least-32-chars";

    fn setup_minimal_config() {
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("ADMIN_JWT_SECRET", STRONG_SECRET);
    }

    fn cleanup_config() {
        for var in [
            "DATABASE_URL",
            "ADMIN_JWT_SECRET",
            "WEBHOOK_SECRET",
            "PROVIDER_NAME",
            "RUN_SCHEDULER",
            "LOG_FORMAT",
        ] {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup_config();
        setup_minimal_config();
        let config = Config::from_env().unwrap();
        cleanup_config();

        assert_eq!(config.bind_address, "0.0.0.0:3000");
        assert_eq!(config.provider_name, "kiwify");
        assert!(config.webhook_secret.is_none());
        assert_eq!(config.webhook_tolerance_secs, 300);
        assert_eq!(config.dispatch_queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(config.run_migrations);
        assert!(config.run_scheduler);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    #[serial]
    fn test_missing_database_url() {
        cleanup_config();
        env::set_var("ADMIN_JWT_SECRET", STRONG_SECRET);
        let result = Config::from_env();
        cleanup_config();

        assert!(matches!(result, Err(ConfigError::Missing("DATABASE_URL"))));
    }

    #[test]
    #[serial]
    fn test_weak_admin_secret_rejected() {
        cleanup_config();
        env::set_var("DATABASE_URL", "postgres://test");
        env::set_var("ADMIN_JWT_SECRET", "too-short");
        let result = Config::from_env();
        cleanup_config();

        assert!(matches!(result, Err(ConfigError::WeakSecret(_))));
    }

    #[test]
    #[serial]
    fn test_overrides() {
        cleanup_config();
        setup_minimal_config();
        env::set_var("WEBHOOK_SECRET", "whsec_123");
        env::set_var("PROVIDER_NAME", " Hotmart ");
        env::set_var("RUN_SCHEDULER", "false");
        env::set_var("LOG_FORMAT", "JSON");
        let config = Config::from_env().unwrap();
        cleanup_config();

        assert_eq!(config.webhook_secret.as_deref(), Some("whsec_123"));
        assert_eq!(config.provider_name, "hotmart");
        assert!(!config.run_scheduler);
        assert_eq!(config.log_format, LogFormat::Json);
    }
}
