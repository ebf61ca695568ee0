//! Configuration module for reconciliation-service.

use crate::engine::rules::default_partial_variance;
use crate::engine::DEFAULT_CHUNK_SIZE;
use rust_decimal::Decimal;
use service_core::config::{self as core_config, env_or};
use service_core::error::AppError;
use std::env;

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub engine: EngineConfig,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub chunk_size: usize,
    pub partial_match_variance: Decimal,
    pub disabled_rules: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            partial_match_variance: default_partial_variance(),
            disabled_rules: Vec::new(),
        }
    }
}

impl EngineConfig {
    fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        let config = Self {
            chunk_size: env_or("RECONCILIATION_CHUNK_SIZE", defaults.chunk_size)?,
            partial_match_variance: env_or(
                "PARTIAL_MATCH_VARIANCE",
                defaults.partial_match_variance,
            )?,
            disabled_rules: env::var("RECONCILIATION_DISABLED_RULES")
                .map(|raw| parse_list(&raw))
                .unwrap_or_default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.chunk_size == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "RECONCILIATION_CHUNK_SIZE must be greater than zero"
            )));
        }
        if self.partial_match_variance.is_sign_negative()
            || self.partial_match_variance > Decimal::ONE
        {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PARTIAL_MATCH_VARIANCE must be between 0 and 1"
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub queue_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry_attempts: 3,
            retry_delay_ms: 5000,
            queue_size: 100,
        }
    }
}

impl WorkerConfig {
    fn from_env() -> Result<Self, AppError> {
        let defaults = Self::default();
        Ok(Self {
            concurrency: env_or("WORKER_CONCURRENCY", defaults.concurrency)?.max(1),
            retry_attempts: env_or("WORKER_RETRY_ATTEMPTS", defaults.retry_attempts)?.max(1),
            retry_delay_ms: env_or("WORKER_RETRY_DELAY_MS", defaults.retry_delay_ms)?,
            queue_size: env_or("WORKER_QUEUE_SIZE", defaults.queue_size)?.max(1),
        })
    }
}

impl ReconciliationConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        Ok(Self {
            common,
            service_name: env::var("SERVICE_NAME")
                .unwrap_or_else(|_| "reconciliation-service".to_string()),
            service_version: env::var("SERVICE_VERSION")
                .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|s| !s.is_empty()),
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").map_err(|_| {
                    AppError::ConfigError(anyhow::anyhow!("DATABASE_URL is required"))
                })?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            engine: EngineConfig::from_env()?,
            worker: WorkerConfig::from_env()?,
        })
    }
}

/// Comma-separated list, blanks dropped.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const ENGINE_VARS: [&str; 3] = [
        "RECONCILIATION_CHUNK_SIZE",
        "PARTIAL_MATCH_VARIANCE",
        "RECONCILIATION_DISABLED_RULES",
    ];

    fn clear(vars: &[&str]) {
        for var in vars {
            env::remove_var(var);
        }
    }

    #[test]
    fn parses_disabled_rule_list() {
        assert_eq!(
            parse_list(" PARTIAL_MATCH, ,DUPLICATE_DETECTION "),
            vec!["PARTIAL_MATCH", "DUPLICATE_DETECTION"]
        );
        assert!(parse_list("").is_empty());
    }

    #[test]
    #[serial]
    fn engine_defaults_apply_when_unset() {
        clear(&ENGINE_VARS);
        let config = EngineConfig::from_env().unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.partial_match_variance, Decimal::new(2, 2));
    }

    #[test]
    #[serial]
    fn engine_reads_overrides() {
        clear(&ENGINE_VARS);
        env::set_var("RECONCILIATION_CHUNK_SIZE", "250");
        env::set_var("PARTIAL_MATCH_VARIANCE", "0.05");
        env::set_var("RECONCILIATION_DISABLED_RULES", "DUPLICATE_DETECTION");

        let config = EngineConfig::from_env().unwrap();
        clear(&ENGINE_VARS);

        assert_eq!(config.chunk_size, 250);
        assert_eq!(config.partial_match_variance, Decimal::new(5, 2));
        assert_eq!(config.disabled_rules, vec!["DUPLICATE_DETECTION"]);
    }

    #[test]
    #[serial]
    fn zero_chunk_size_is_rejected() {
        clear(&ENGINE_VARS);
        env::set_var("RECONCILIATION_CHUNK_SIZE", "0");
        let result = EngineConfig::from_env();
        clear(&ENGINE_VARS);

        assert!(matches!(result, Err(AppError::ConfigError(_))));
    }

    #[test]
    #[serial]
    fn variance_outside_unit_range_is_rejected() {
        for raw in ["-0.01", "1.5"] {
            clear(&ENGINE_VARS);
            env::set_var("PARTIAL_MATCH_VARIANCE", raw);
            let result = EngineConfig::from_env();
            clear(&ENGINE_VARS);

            assert!(matches!(result, Err(AppError::ConfigError(_))), "{raw} was accepted");
        }

        let whole = EngineConfig {
            partial_match_variance: Decimal::ONE,
            ..EngineConfig::default()
        };
        assert!(whole.validate().is_ok());
    }

    #[test]
    #[serial]
    fn worker_settings_have_floor_of_one() {
        let vars = ["WORKER_CONCURRENCY", "WORKER_QUEUE_SIZE"];
        env::set_var("WORKER_CONCURRENCY", "0");
        env::set_var("WORKER_QUEUE_SIZE", "0");
        let config = WorkerConfig::from_env().unwrap();
        clear(&vars);

        assert_eq!(config.concurrency, 1);
        assert_eq!(config.queue_size, 1);
        assert_eq!(config.retry_delay_ms, 5000);
    }
}
