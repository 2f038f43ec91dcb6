//! Configuration

use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::str::FromStr;
use tracing::{info, warn};

/// Configuration for the dispatch system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Broker connection string (`redis://...` or `memory://...`)
    pub broker_url: String,

    /// Prefix for every broker key
    pub key_prefix: String,

    /// Number of workers per task category
    pub worker_count: usize,

    /// Idle sleep between claims on an empty queue, in milliseconds
    pub poll_interval_ms: u64,

    /// Per-job timeout in seconds
    pub job_timeout_secs: u64,

    /// Graceful shutdown timeout in seconds
    pub shutdown_timeout_secs: u64,

    /// Completed or failed jobs the broker retains per queue; older ones are evicted
    pub keep_finished: usize,

    /// Samples kept per metric name
    pub metrics_history_capacity: usize,

    /// Health snapshots kept
    pub health_history_capacity: usize,

    /// Period of the collector's self-sampling timer in seconds
    pub self_sample_interval_secs: u64,

    /// Dollar cost of one credit when an execution reports no explicit cost
    pub credit_unit_cost: f64,

    /// Cost per execution considered fully efficient
    pub cost_budget_per_execution: f64,

    /// Duration per execution considered fully efficient, in milliseconds
    pub target_duration_ms: u64,

    /// Health alert thresholds
    pub health_thresholds: HealthThresholds,

    /// Strategy threshold-crossing limits
    pub strategy_thresholds: StrategyThresholds,
}

/// Limits that raise a health alert when crossed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthThresholds {
    /// Alert when availability drops below this
    pub min_availability: f64,
    /// Alert when the error rate exceeds this
    pub max_error_rate: f64,
    /// Alert when saturation exceeds this
    pub max_saturation: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_availability: 0.9,
            max_error_rate: 0.05,
            max_saturation: 0.8,
        }
    }
}

/// Aggregate strategy limits checked after each execution
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StrategyThresholds {
    /// Minimum acceptable success rate
    pub min_success_rate: f64,
    /// Maximum acceptable average execution time in milliseconds
    pub max_execution_time_ms: f64,
    /// Minimum acceptable average confidence
    pub min_confidence: f64,
    /// Maximum acceptable average cost
    pub max_cost: f64,
    /// Executions required before thresholds are evaluated
    pub min_samples: u64,
}

impl Default for StrategyThresholds {
    fn default() -> Self {
        Self {
            min_success_rate: 0.8,
            max_execution_time_ms: 30_000.0,
            min_confidence: 0.6,
            max_cost: 0.10,
            min_samples: 5,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: "dispatch".to_string(),
            worker_count: num_cpus(),
            poll_interval_ms: 100,
            job_timeout_secs: 300,
            shutdown_timeout_secs: 30,
            keep_finished: crate::broker::DEFAULT_KEEP_FINISHED,
            metrics_history_capacity: 1000,
            health_history_capacity: 100,
            self_sample_interval_secs: 60,
            credit_unit_cost: 0.000_01,
            cost_budget_per_execution: 0.05,
            target_duration_ms: 30_000,
            health_thresholds: HealthThresholds::default(),
            strategy_thresholds: StrategyThresholds::default(),
        }
    }
}

impl Config {
    /// Create a new configuration pointing at the given broker
    pub fn new(broker_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            ..Default::default()
        }
    }

    /// Load configuration from file, environment variables, or defaults
    pub fn load() -> crate::Result<Self> {
        if let Ok(config_path) = env::var("DISPATCH_CONFIG") {
            info!("Loading config from DISPATCH_CONFIG: {}", config_path);
            return Self::from_file(&config_path);
        }

        let default_paths = [
            "config.yaml",
            "config.toml",
            "config/config.yaml",
            "config/config.toml",
        ];

        for path in default_paths {
            if Path::new(path).exists() {
                info!("Loading config from: {}", path);
                return Self::from_file(path);
            }
        }

        if let Ok(config) = Self::from_env() {
            info!("Loaded config from environment variables");
            return Ok(config);
        }

        warn!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load configuration from a file (YAML or TOML)
    pub fn from_file(path: &str) -> crate::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .build()
            .map_err(|e| {
                crate::DispatchError::Config(format!("Failed to load config file: {}", e))
            })?;

        let config: Config = settings.try_deserialize().map_err(|e| {
            crate::DispatchError::Config(format!("Failed to parse config: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from `DISPATCH_*` environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Self::default();
        let mut found_any = false;

        if let Ok(val) = env::var("DISPATCH_BROKER_URL") {
            config.broker_url = val;
            found_any = true;
        }

        if let Ok(val) = env::var("DISPATCH_KEY_PREFIX") {
            config.key_prefix = val;
            found_any = true;
        }

        found_any |= parse_env("DISPATCH_WORKER_COUNT", &mut config.worker_count)?;
        found_any |= parse_env("DISPATCH_POLL_INTERVAL_MS", &mut config.poll_interval_ms)?;
        found_any |= parse_env("DISPATCH_JOB_TIMEOUT_SECS", &mut config.job_timeout_secs)?;
        found_any |= parse_env(
            "DISPATCH_SHUTDOWN_TIMEOUT_SECS",
            &mut config.shutdown_timeout_secs,
        )?;
        found_any |= parse_env("DISPATCH_KEEP_FINISHED", &mut config.keep_finished)?;
        found_any |= parse_env(
            "DISPATCH_METRICS_HISTORY_CAPACITY",
            &mut config.metrics_history_capacity,
        )?;
        found_any |= parse_env(
            "DISPATCH_SELF_SAMPLE_INTERVAL_SECS",
            &mut config.self_sample_interval_secs,
        )?;
        found_any |= parse_env("DISPATCH_CREDIT_UNIT_COST", &mut config.credit_unit_cost)?;

        if !found_any {
            return Err(crate::DispatchError::Config(
                "No environment variables found".to_string(),
            ));
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> crate::Result<()> {
        if self.broker_url.trim().is_empty() {
            return Err(crate::DispatchError::Config(
                "Broker URL must not be empty".to_string(),
            ));
        }

        if self.worker_count == 0 {
            return Err(crate::DispatchError::Config(
                "Worker count must be greater than 0".to_string(),
            ));
        }

        if self.job_timeout_secs == 0 {
            return Err(crate::DispatchError::Config(
                "Job timeout must be greater than 0".to_string(),
            ));
        }

        if self.metrics_history_capacity == 0 || self.health_history_capacity == 0 {
            return Err(crate::DispatchError::Config(
                "History capacities must be greater than 0".to_string(),
            ));
        }

        if self.self_sample_interval_secs == 0 {
            return Err(crate::DispatchError::Config(
                "Self-sample interval must be greater than 0".to_string(),
            ));
        }

        if self.credit_unit_cost < 0.0 || self.cost_budget_per_execution <= 0.0 {
            return Err(crate::DispatchError::Config(
                "Cost settings must be positive".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T>(key: &str, target: &mut T) -> crate::Result<bool>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => {
            *target = val.parse().map_err(|e| {
                crate::DispatchError::Config(format!("Invalid {}: {}", key, e))
            })?;
            Ok(true)
        }
        Err(_) => Ok(false),
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}
