//! Runtime configuration
//!
//! A [`SentinelConfig`] is read from a TOML file where every section is optional,
//! then overridden from the environment, then validated.
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `SENTINEL_LOG_LEVEL` | `log_level` |
//! | `SENTINEL_PROMETHEUS_URL` | switches the store to Prometheus at this URL |
//! | `SENTINEL_METRICS_INTERVAL_SECS` | `scheduler.metrics_interval_secs` |
//! | `SENTINEL_PREDICTION_INTERVAL_SECS` | `scheduler.prediction_interval_secs` |
//!
//! # Examples
//!
//! ```rust
//! use sentinel::config::SentinelConfig;
//!
//! let config = SentinelConfig::from_toml_str(r#"
//!     log_level = "debug"
//!
//!     [[fips]]
//!     fip_id = "sbi-fip"
//!     bank_name = "State Bank of India"
//!     user_base = 4500
//! "#).unwrap();
//!
//! assert_eq!(config.fips.len(), 1);
//! assert_eq!(config.scheduler.metrics_interval_secs, 120);
//! ```

use crate::alerts::AlertRules;
use crate::pipeline::PipelineConfig;
use crate::registry::SubscriptionDraft;
use crate::scheduler::SchedulerConfig;
use crate::store::PrometheusConfig;
use crate::webhook::DispatcherConfig;
use health::{AnalyzerConfig, FipProfile, ForecastConfig, ImpactConfig, ScoringConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

pub const ENV_LOG_LEVEL: &str = "SENTINEL_LOG_LEVEL";
pub const ENV_PROMETHEUS_URL: &str = "SENTINEL_PROMETHEUS_URL";
pub const ENV_METRICS_INTERVAL: &str = "SENTINEL_METRICS_INTERVAL_SECS";
pub const ENV_PREDICTION_INTERVAL: &str = "SENTINEL_PREDICTION_INTERVAL_SECS";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {name}: {value}")]
    Env { name: String, value: String },

    #[error("Invalid configuration: {message}")]
    Invalid { message: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Where metrics are read from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreBackend {
    /// In-process store, empty at startup
    Memory,
    Prometheus(PrometheusConfig),
}

impl Default for StoreBackend {
    fn default() -> Self {
        StoreBackend::Prometheus(PrometheusConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SentinelConfig {
    /// Default tracing filter when `RUST_LOG` is unset
    pub log_level: String,
    pub store: StoreBackend,
    pub scoring: ScoringConfig,
    pub analyzer: AnalyzerConfig,
    pub forecast: ForecastConfig,
    pub impact: ImpactConfig,
    pub alerts: AlertRules,
    pub dispatcher: DispatcherConfig,
    pub pipeline: PipelineConfig,
    pub scheduler: SchedulerConfig,
    /// Monitored FIPs
    pub fips: Vec<FipProfile>,
    /// Subscriptions registered at startup
    pub webhooks: Vec<SubscriptionDraft>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            store: StoreBackend::default(),
            scoring: ScoringConfig::default(),
            analyzer: AnalyzerConfig::default(),
            forecast: ForecastConfig::default(),
            impact: ImpactConfig::default(),
            alerts: AlertRules::default(),
            dispatcher: DispatcherConfig::default(),
            pipeline: PipelineConfig::default(),
            scheduler: SchedulerConfig::default(),
            fips: Vec::new(),
            webhooks: Vec::new(),
        }
    }
}

impl SentinelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_fip(mut self, profile: FipProfile) -> Self {
        self.fips.push(profile);
        self
    }

    pub fn with_webhook(mut self, draft: SubscriptionDraft) -> Self {
        self.webhooks.push(draft);
        self
    }

    pub fn with_store(mut self, store: StoreBackend) -> Self {
        self.store = store;
        self
    }

    pub fn from_toml_str(source: &str) -> ConfigResult<Self> {
        Ok(toml::from_str(source)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("Loaded configuration from {}", path.display());
        Self::from_toml_str(&source)
    }

    /// File (or defaults), then environment overrides, then validation.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> ConfigResult<()> {
        if let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.log_level = level;
        }

        if let Some(url) = lookup(ENV_PROMETHEUS_URL) {
            match &mut self.store {
                StoreBackend::Prometheus(prometheus) => prometheus.base_url = url,
                StoreBackend::Memory => {
                    self.store =
                        StoreBackend::Prometheus(PrometheusConfig::default().with_base_url(url))
                }
            }
        }

        if let Some(secs) = lookup(ENV_METRICS_INTERVAL) {
            self.scheduler.metrics_interval_secs = parse_secs(ENV_METRICS_INTERVAL, &secs)?;
        }

        if let Some(secs) = lookup(ENV_PREDICTION_INTERVAL) {
            self.scheduler.prediction_interval_secs = parse_secs(ENV_PREDICTION_INTERVAL, &secs)?;
        }

        Ok(())
    }

    pub fn validate(&self) -> ConfigResult<()> {
        let section = |name: &str, result: Result<(), String>| {
            result.map_err(|message| ConfigError::Invalid {
                message: format!("[{}] {}", name, message),
            })
        };

        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "log_level cannot be empty".to_string(),
            });
        }

        if let StoreBackend::Prometheus(prometheus) = &self.store {
            section("store", prometheus.validate())?;
        }
        section("scoring", self.scoring.validate())?;
        section("analyzer", self.analyzer.validate())?;
        section("forecast", self.forecast.validate())?;
        section("impact", self.impact.validate())?;
        section("alerts", self.alerts.validate())?;
        section("dispatcher", self.dispatcher.validate())?;
        section("pipeline", self.pipeline.validate())?;
        section("scheduler", self.scheduler.validate())?;

        let mut seen = HashSet::new();
        for fip in &self.fips {
            if fip.fip_id.trim().is_empty() {
                return Err(ConfigError::Invalid {
                    message: format!("FIP '{}' has an empty fip_id", fip.bank_name),
                });
            }
            if !seen.insert(fip.fip_id.as_str()) {
                return Err(ConfigError::Invalid {
                    message: format!("FIP '{}' is listed more than once", fip.fip_id),
                });
            }
        }

        for draft in &self.webhooks {
            draft.validate().map_err(|e| ConfigError::Invalid {
                message: format!("webhook '{}': {}", draft.name, e),
            })?;
        }

        Ok(())
    }

    pub fn to_toml_string(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

fn parse_secs(name: &str, value: &str) -> ConfigResult<u64> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|secs| *secs > 0)
        .ok_or_else(|| ConfigError::Env {
            name: name.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use health::Severity;
    use serial_test::serial;
    use std::collections::HashMap;
    use std::io::Write;

    const SAMPLE: &str = r#"
log_level = "debug"

[store]
backend = "prometheus"
base_url = "http://prometheus.internal:9090"

[alerts]
debounce_minutes = 5
consent_warning = 90.0

[scheduler]
metrics_interval_secs = 60

[[fips]]
fip_id = "sbi-fip"
bank_name = "State Bank of India"
user_base = 4500

[[fips]]
fip_id = "hdfc-fip"
bank_name = "HDFC Bank"
user_base = 3200

[[webhooks]]
name = "pager"
url = "https://hooks.example.com/pager"
alert_types = ["critical"]
"#;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = SentinelConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.metrics_interval_secs, 120);
        assert_eq!(config.scheduler.prediction_interval_secs, 900);
        assert_eq!(config.alerts.debounce_minutes, 10);
        assert!(matches!(config.store, StoreBackend::Prometheus(_)));
    }

    #[test]
    fn test_parse_partial_file() {
        let config = SentinelConfig::from_toml_str(SAMPLE).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.alerts.debounce_minutes, 5);
        assert_eq!(config.alerts.consent_warning, 90.0);
        assert_eq!(config.alerts.consent_critical, 70.0);
        assert_eq!(config.scheduler.metrics_interval_secs, 60);
        assert_eq!(config.scheduler.prediction_interval_secs, 900);
        assert_eq!(config.fips.len(), 2);
        assert_eq!(
            config.webhooks[0].alert_types.iter().collect::<Vec<_>>(),
            vec![&Severity::Critical]
        );
        match &config.store {
            StoreBackend::Prometheus(prometheus) => {
                assert_eq!(prometheus.base_url, "http://prometheus.internal:9090");
                assert_eq!(prometheus.fip_label, "fip_name");
            }
            other => panic!("unexpected store {:?}", other),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_backend() {
        let config = SentinelConfig::from_toml_str("[store]\nbackend = \"memory\"\n").unwrap();
        assert_eq!(config.store, StoreBackend::Memory);
    }

    #[test]
    fn test_overrides() {
        let mut config = SentinelConfig::default().with_store(StoreBackend::Memory);
        config
            .apply_overrides(lookup(&[
                (ENV_LOG_LEVEL, "warn"),
                (ENV_PROMETHEUS_URL, "http://metrics:9090"),
                (ENV_PREDICTION_INTERVAL, "300"),
            ]))
            .unwrap();

        assert_eq!(config.log_level, "warn");
        assert_eq!(config.scheduler.prediction_interval_secs, 300);
        assert_eq!(config.scheduler.metrics_interval_secs, 120);
        assert_eq!(
            config.store,
            StoreBackend::Prometheus(
                PrometheusConfig::default().with_base_url("http://metrics:9090")
            )
        );

        let err = config
            .apply_overrides(lookup(&[(ENV_METRICS_INTERVAL, "soon")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Env { .. }));
        assert!(config
            .apply_overrides(lookup(&[(ENV_METRICS_INTERVAL, "0")]))
            .is_err());
    }

    #[test]
    fn test_validation_errors() {
        let duplicate = SentinelConfig::default()
            .with_fip(FipProfile::new("sbi-fip", "State Bank of India", 1))
            .with_fip(FipProfile::new("sbi-fip", "SBI again", 1));
        assert!(duplicate.validate().unwrap_err().to_string().contains("more than once"));

        let bad_hook =
            SentinelConfig::default().with_webhook(SubscriptionDraft::new("ops", "ftp://nowhere"));
        assert!(bad_hook.validate().is_err());

        let mut bad_section = SentinelConfig::default();
        bad_section.scheduler.metrics_interval_secs = 0;
        assert!(bad_section
            .validate()
            .unwrap_err()
            .to_string()
            .contains("[scheduler]"));
    }

    #[test]
    fn test_round_trip_through_toml() {
        let config = SentinelConfig::from_toml_str(SAMPLE).unwrap();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(SentinelConfig::from_toml_str(&rendered).unwrap(), config);
    }

    #[test]
    #[serial]
    fn test_load_file_with_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        std::env::set_var(ENV_METRICS_INTERVAL, "30");
        let loaded = SentinelConfig::load(Some(file.path()));
        std::env::remove_var(ENV_METRICS_INTERVAL);

        let config = loaded.unwrap();
        assert_eq!(config.scheduler.metrics_interval_secs, 30);
        assert_eq!(config.fips.len(), 2);
    }

    #[test]
    #[serial]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SentinelConfig::load(Some(dir.path().join("absent.toml").as_path()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
