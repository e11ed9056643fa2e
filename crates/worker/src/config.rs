//! Scheduler configuration

use std::env;
use std::time::Duration;

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
pub const DEFAULT_SWEEP_BATCH_SIZE: i64 = 100;
pub const DEFAULT_RECONCILIATION_CRON: &str = "0 0 3 * * *";
pub const DEFAULT_RECONCILIATION_WINDOW_DAYS: i64 = 7;
pub const DEFAULT_HOUSEKEEPING_CRON: &str = "0 30 4 * * *";
pub const DEFAULT_RAW_EVENT_RETENTION_DAYS: i64 = 365;

/// Job schedules, loaded from environment variables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub sweep_interval: Duration,
    pub sweep_batch_size: i64,
    /// 6-field cron (seconds first), UTC
    pub reconciliation_cron: String,
    pub reconciliation_window_days: i64,
    pub housekeeping_cron: String,
    pub raw_event_retention_days: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            sweep_batch_size: DEFAULT_SWEEP_BATCH_SIZE,
            reconciliation_cron: DEFAULT_RECONCILIATION_CRON.to_string(),
            reconciliation_window_days: DEFAULT_RECONCILIATION_WINDOW_DAYS,
            housekeeping_cron: DEFAULT_HOUSEKEEPING_CRON.to_string(),
            raw_event_retention_days: DEFAULT_RAW_EVENT_RETENTION_DAYS,
        }
    }
}

impl SchedulerConfig {
    /// Unset or unparseable values fall back to the defaults
    pub fn from_env() -> Self {
        Self {
            sweep_interval: Duration::from_secs(
                env::var("SWEEP_INTERVAL_SECS")
                    .ok()
                    .and_then(|v| v.parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            ),
            sweep_batch_size: env::var("SWEEP_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|n| *n > 0)
                .unwrap_or(DEFAULT_SWEEP_BATCH_SIZE),
            reconciliation_cron: env::var("RECONCILIATION_CRON")
                .unwrap_or_else(|_| DEFAULT_RECONCILIATION_CRON.to_string()),
            reconciliation_window_days: env::var("RECONCILIATION_WINDOW_DAYS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_RECONCILIATION_WINDOW_DAYS),
            housekeeping_cron: env::var("HOUSEKEEPING_CRON")
                .unwrap_or_else(|_| DEFAULT_HOUSEKEEPING_CRON.to_string()),
            raw_event_retention_days: env::var("RAW_EVENT_RETENTION_DAYS")
                .ok()
                .and_then(|v| v.parse::<i64>().ok())
                .filter(|days| *days > 0)
                .unwrap_or(DEFAULT_RAW_EVENT_RETENTION_DAYS),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 6] = [
        "SWEEP_INTERVAL_SECS",
        "SWEEP_BATCH_SIZE",
        "RECONCILIATION_CRON",
        "RECONCILIATION_WINDOW_DAYS",
        "HOUSEKEEPING_CRON",
        "RAW_EVENT_RETENTION_DAYS",
    ];

    fn clear() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults_when_unset() {
        clear();
        assert_eq!(SchedulerConfig::from_env(), SchedulerConfig::default());
    }

    #[test]
    #[serial]
    fn test_overrides_and_fallbacks() {
        clear();
        env::set_var("SWEEP_INTERVAL_SECS", "60");
        env::set_var("SWEEP_BATCH_SIZE", "not-a-number");
        env::set_var("RECONCILIATION_CRON", "0 15 2 * * *");
        env::set_var("RAW_EVENT_RETENTION_DAYS", "0");

        let config = SchedulerConfig::from_env();
        clear();

        assert_eq!(config.sweep_interval, Duration::from_secs(60));
        assert_eq!(config.sweep_batch_size, DEFAULT_SWEEP_BATCH_SIZE);
        assert_eq!(config.reconciliation_cron, "0 15 2 * * *");
        assert_eq!(config.raw_event_retention_days, DEFAULT_RAW_EVENT_RETENTION_DAYS);
    }
}
