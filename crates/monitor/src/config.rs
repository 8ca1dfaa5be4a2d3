//! Monitor configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Monitor configuration, read from `LOGGIST_*` environment variables
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Name attached to structured log events
    #[serde(default = "default_instance_name")]
    pub instance_name: String,

    /// API server port for health, metrics and the dashboard routes
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default = "default_prometheus_url")]
    pub prometheus_url: String,

    #[serde(default = "default_loki_url")]
    pub loki_url: String,

    /// SQLite database file; parent directories are created on open
    #[serde(default = "default_database_path")]
    pub database_path: String,

    #[serde(default = "default_check_interval")]
    pub budget_check_interval_secs: u64,

    #[serde(default = "default_check_interval")]
    pub signal_check_interval_secs: u64,

    /// Burst size of each client's token bucket
    #[serde(default = "default_rate_limit_capacity")]
    pub rate_limit_capacity: u32,

    #[serde(default = "default_rate_limit_refill")]
    pub rate_limit_refill_per_sec: f64,

    #[serde(default = "default_max_stream_subscribers")]
    pub max_stream_subscribers: usize,

    #[serde(default = "default_true")]
    pub log_tail_enabled: bool,
}

fn default_instance_name() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "loggist".to_string())
}

fn default_api_port() -> u16 {
    3001
}

fn default_prometheus_url() -> String {
    "http://localhost:9090".to_string()
}

fn default_loki_url() -> String {
    "http://localhost:3100".to_string()
}

fn default_database_path() -> String {
    "./data/loggist.db".to_string()
}

fn default_check_interval() -> u64 {
    60
}

fn default_rate_limit_capacity() -> u32 {
    60
}

fn default_rate_limit_refill() -> f64 {
    1.0
}

fn default_max_stream_subscribers() -> usize {
    monitor_lib::fanout::DEFAULT_MAX_SUBSCRIBERS
}

fn default_true() -> bool {
    true
}

impl MonitorConfig {
    /// Load configuration from the process environment
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from an explicit variable map instead of the process environment
    pub fn load_from(vars: Option<HashMap<String, String>>) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("LOGGIST")
                    .try_parsing(true)
                    .source(vars),
            )
            .build()
            .context("Failed to read LOGGIST_* environment")?;

        let config: Self = config
            .try_deserialize()
            .context("Invalid LOGGIST_* configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.budget_check_interval_secs == 0 || self.signal_check_interval_secs == 0 {
            anyhow::bail!("Check intervals must be at least one second");
        }
        if self.rate_limit_capacity == 0 {
            anyhow::bail!("LOGGIST_RATE_LIMIT_CAPACITY must be positive");
        }
        if !self.rate_limit_refill_per_sec.is_finite() || self.rate_limit_refill_per_sec < 0.0 {
            anyhow::bail!("LOGGIST_RATE_LIMIT_REFILL_PER_SEC must be a non-negative number");
        }
        Ok(())
    }

    pub fn budget_check_interval(&self) -> Duration {
        Duration::from_secs(self.budget_check_interval_secs)
    }

    pub fn signal_check_interval(&self) -> Duration {
        Duration::from_secs(self.signal_check_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Option<HashMap<String, String>> {
        Some(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    #[test]
    fn test_defaults() {
        let config = MonitorConfig::load_from(vars(&[])).unwrap();

        assert_eq!(config.api_port, 3001);
        assert_eq!(config.prometheus_url, "http://localhost:9090");
        assert_eq!(config.loki_url, "http://localhost:3100");
        assert_eq!(config.database_path, "./data/loggist.db");
        assert_eq!(config.budget_check_interval(), Duration::from_secs(60));
        assert_eq!(config.signal_check_interval(), Duration::from_secs(60));
        assert_eq!(config.rate_limit_capacity, 60);
        assert_eq!(config.rate_limit_refill_per_sec, 1.0);
        assert_eq!(config.max_stream_subscribers, 50);
        assert!(config.log_tail_enabled);
    }

    #[test]
    fn test_overrides_from_environment() {
        let config = MonitorConfig::load_from(vars(&[
            ("LOGGIST_API_PORT", "8088"),
            ("LOGGIST_PROMETHEUS_URL", "http://prom:9090"),
            ("LOGGIST_SIGNAL_CHECK_INTERVAL_SECS", "30"),
            ("LOGGIST_RATE_LIMIT_REFILL_PER_SEC", "2.5"),
            ("LOGGIST_LOG_TAIL_ENABLED", "false"),
            ("UNRELATED_API_PORT", "1"),
        ]))
        .unwrap();

        assert_eq!(config.api_port, 8088);
        assert_eq!(config.prometheus_url, "http://prom:9090");
        assert_eq!(config.signal_check_interval(), Duration::from_secs(30));
        assert_eq!(config.rate_limit_refill_per_sec, 2.5);
        assert!(!config.log_tail_enabled);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(MonitorConfig::load_from(vars(&[("LOGGIST_API_PORT", "not-a-port")])).is_err());
        assert!(
            MonitorConfig::load_from(vars(&[("LOGGIST_BUDGET_CHECK_INTERVAL_SECS", "0")]))
                .is_err()
        );
        assert!(MonitorConfig::load_from(vars(&[("LOGGIST_RATE_LIMIT_CAPACITY", "0")])).is_err());
    }
}
