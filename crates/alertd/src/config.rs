//! Daemon Settings
//!
//! Layered as built-in defaults, then an optional settings file, then
//! `ALERTD_` environment variables (`ALERTD_SCHEDULER__WORKERS=8`).

use alert_model::Severity;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Commands to run as alert sources
    #[serde(default)]
    pub checks: Vec<CheckConfig>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum concurrent evaluations
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Delay before a failed check runs again
    #[serde(default = "default_retry_interval", with = "humantime_serde")]
    pub retry_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            retry_interval: default_retry_interval(),
        }
    }
}

/// Which grouping stage ends the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupingMode {
    None,
    /// In-memory window, first alert per window
    #[default]
    Window,
    /// Persisted windows merged with an occurrence count
    Recurring,
}

/// Correlation pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// How long an exact occurrence is remembered
    #[serde(default = "default_dedup_ttl", with = "humantime_serde")]
    pub dedup_ttl: Duration,

    /// How long an incident anchor is remembered
    #[serde(default = "default_logical_ttl", with = "humantime_serde")]
    pub logical_ttl: Duration,

    /// Repeated starts within this span belong to the same incident
    #[serde(default = "default_start_grace", with = "humantime_serde")]
    pub start_grace: Duration,

    #[serde(default)]
    pub grouping: GroupingMode,

    #[serde(default = "default_group_interval", with = "humantime_serde")]
    pub group_interval: Duration,

    #[serde(default = "default_group_period", with = "humantime_serde")]
    pub group_period: Duration,

    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub sweep_interval: Option<Duration>,

    /// Repository key of the recurring grouping stage
    #[serde(default = "default_group_id")]
    pub group_id: String,

    #[serde(default = "default_shutdown_timeout", with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dedup_ttl: default_dedup_ttl(),
            logical_ttl: default_logical_ttl(),
            start_grace: default_start_grace(),
            grouping: GroupingMode::default(),
            group_interval: default_group_interval(),
            group_period: default_group_period(),
            sweep_interval: None,
            group_id: default_group_id(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// A shell command evaluated as an alert source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckConfig {
    /// Becomes the alert's source id
    pub name: String,

    /// Run with `sh -c`; a non-zero exit raises the alert
    pub command: String,

    #[serde(default = "default_check_interval", with = "humantime_serde")]
    pub interval: Duration,

    #[serde(default = "default_check_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    #[serde(default = "default_severity")]
    pub severity: Severity,

    #[serde(default)]
    pub notifiers: Vec<String>,

    #[serde(default)]
    pub receivers: Vec<String>,
}

// Default value helpers
fn default_log_level() -> String {
    "info".to_string()
}

fn default_workers() -> usize {
    4
}

fn default_retry_interval() -> Duration {
    alert_scheduler::DEFAULT_RETRY_INTERVAL
}

fn default_dedup_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_logical_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_start_grace() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_group_interval() -> Duration {
    Duration::from_secs(15 * 60)
}

fn default_group_period() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_group_id() -> String {
    "alertd".to_string()
}

fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_check_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_severity() -> Severity {
    Severity::High
}

impl Settings {
    /// Load configuration from defaults, `path` if given, and the environment
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = Self::defaults()?;

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("ALERTD")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    fn defaults() -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        Ok(Config::builder().add_source(Config::try_from(&Settings::default())?))
    }

    #[cfg(test)]
    fn from_toml(toml: &str) -> Result<Self, ConfigError> {
        Self::defaults()?
            .add_source(File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()
    }
}
