//! Configuration for the bonus ledger

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Service configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service name
    pub service_name: String,

    /// Address the HTTP layer listens on
    pub run_address: String,

    /// PostgreSQL connection string; in-memory storage when absent
    pub database_uri: Option<String>,

    /// Connection pool size
    pub database_max_connections: u32,

    /// Base URL of the accrual authority
    pub accrual_address: String,

    /// Log output: "text" or "json"
    pub log_format: String,

    /// Reconciliation loop configuration
    pub reconciliation: ReconciliationConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "bonus-ledger".to_string(),
            run_address: "localhost:8080".to_string(),
            database_uri: None,
            database_max_connections: 10,
            accrual_address: "http://localhost:8081".to_string(),
            log_format: "text".to_string(),
            reconciliation: ReconciliationConfig::default(),
        }
    }
}

/// Reconciliation loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// Pause between iterations (milliseconds)
    pub interval_ms: u64,

    /// Budget for one accrual authority call or storage step (milliseconds)
    pub request_timeout_ms: u64,

    /// Back-off after a 429 without a usable Retry-After (milliseconds)
    pub rate_limit_backoff_ms: u64,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,        // 10s tick
            request_timeout_ms: 5_000,
            rate_limit_backoff_ms: 60_000,
        }
    }
}

impl ReconciliationConfig {
    /// Pause between iterations
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Per-call time budget
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Default back-off after a rate-limit response
    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse TOML text
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        toml::from_str(content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Apply overrides from a variable lookup on top of the defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> crate::Result<Self> {
        let mut config = Config::default();

        if let Some(addr) = lookup("RUN_ADDRESS") {
            config.run_address = addr;
        }

        if let Some(uri) = lookup("DATABASE_URI").filter(|uri| !uri.is_empty()) {
            config.database_uri = Some(uri);
        }

        if let Some(addr) = lookup("ACCRUAL_SYSTEM_ADDRESS") {
            config.accrual_address = addr;
        }

        if let Some(format) = lookup("BONUS_LOG_FORMAT") {
            config.log_format = format;
        }

        if let Some(value) = lookup("BONUS_RECONCILE_INTERVAL_MS") {
            config.reconciliation.interval_ms = parse_millis("BONUS_RECONCILE_INTERVAL_MS", &value)?;
        }

        if let Some(value) = lookup("BONUS_REQUEST_TIMEOUT_MS") {
            config.reconciliation.request_timeout_ms =
                parse_millis("BONUS_REQUEST_TIMEOUT_MS", &value)?;
        }

        if let Some(value) = lookup("BONUS_RATE_LIMIT_BACKOFF_MS") {
            config.reconciliation.rate_limit_backoff_ms =
                parse_millis("BONUS_RATE_LIMIT_BACKOFF_MS", &value)?;
        }

        Ok(config)
    }

    /// Reject configurations the service cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.accrual_address.trim().is_empty() {
            return Err(crate::Error::Config(
                "accrual_address is required".to_string(),
            ));
        }

        if self.reconciliation.interval_ms == 0 {
            return Err(crate::Error::Config(
                "reconciliation.interval_ms cannot be 0".to_string(),
            ));
        }

        if self.reconciliation.request_timeout_ms == 0 {
            return Err(crate::Error::Config(
                "reconciliation.request_timeout_ms cannot be 0".to_string(),
            ));
        }

        if self.database_max_connections == 0 {
            return Err(crate::Error::Config(
                "database_max_connections cannot be 0".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_millis(name: &str, value: &str) -> crate::Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|e| crate::Error::Config(format!("{} must be an integer: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service_name, "bonus-ledger");
        assert_eq!(config.reconciliation.interval(), Duration::from_secs(10));
        assert!(config.database_uri.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("RUN_ADDRESS", "0.0.0.0:9000"),
            ("DATABASE_URI", "postgres://bonus@localhost/bonus"),
            ("ACCRUAL_SYSTEM_ADDRESS", "http://accrual:8080"),
            ("BONUS_RECONCILE_INTERVAL_MS", "250"),
            ("BONUS_REQUEST_TIMEOUT_MS", "1500"),
            ("BONUS_RATE_LIMIT_BACKOFF_MS", "30000"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|name| vars.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(config.run_address, "0.0.0.0:9000");
        assert_eq!(
            config.database_uri.as_deref(),
            Some("postgres://bonus@localhost/bonus")
        );
        assert_eq!(config.accrual_address, "http://accrual:8080");
        assert_eq!(config.reconciliation.interval_ms, 250);
        assert_eq!(config.reconciliation.request_timeout_ms, 1_500);
        assert_eq!(
            config.reconciliation.rate_limit_backoff(),
            Duration::from_secs(30)
        );
    }

    #[test]
    fn test_bad_env_value() {
        let result = Config::from_lookup(|name| {
            (name == "BONUS_REQUEST_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(result, Err(crate::Error::Config(_))));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = Config::from_toml(
            r#"
            accrual_address = "http://accrual:8080"

            [reconciliation]
            interval_ms = 500
            "#,
        )
        .unwrap();
        assert_eq!(config.accrual_address, "http://accrual:8080");
        assert_eq!(config.reconciliation.interval_ms, 500);
        assert_eq!(config.reconciliation.request_timeout_ms, 5_000);
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.reconciliation.interval_ms = 0;
        assert!(config.validate().is_err());
    }
}
