//! Logging setup
//!
//! Installs the global `tracing` subscriber once per process. `RUST_LOG` wins over the
//! configured level.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    #[error("Telemetry initialization failed: {reason}")]
    InitializationFailed { reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Filter used when `RUST_LOG` is unset, e.g. `info` or `sentinel=debug,health=info`
    pub log_level: String,
    /// Include source file and line in each event
    pub with_source_location: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "fip-sentinel".to_string(),
            log_level: "info".to_string(),
            with_source_location: false,
        }
    }
}

impl TelemetryConfig {
    pub fn with_log_level(mut self, log_level: impl Into<String>) -> Self {
        self.log_level = log_level.into();
        self
    }

    pub fn with_source_location(mut self) -> Self {
        self.with_source_location = true;
        self
    }

    fn filter(&self) -> Result<EnvFilter, TelemetryError> {
        if let Ok(filter) = EnvFilter::try_from_default_env() {
            return Ok(filter);
        }

        EnvFilter::try_new(&self.log_level).map_err(|e| TelemetryError::InvalidFilter {
            filter: self.log_level.clone(),
            reason: e.to_string(),
        })
    }
}

/// Install the global subscriber. A second call returns an error instead of panicking.
pub fn init_tracing(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(config.filter()?)
        .with_target(false)
        .with_file(config.with_source_location)
        .with_line_number(config.with_source_location)
        .finish();

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        TelemetryError::InitializationFailed {
            reason: format!("Failed to set tracing subscriber: {}", e),
        }
    })?;

    info!("{} logging initialized", config.service_name);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_invalid_filter_is_rejected() {
        std::env::remove_var("RUST_LOG");
        let config = TelemetryConfig::default().with_log_level("sentinel=loud");
        assert!(matches!(
            init_tracing(&config),
            Err(TelemetryError::InvalidFilter { .. })
        ));
    }

    #[test]
    #[serial]
    fn test_second_initialization_fails() {
        std::env::remove_var("RUST_LOG");
        let config = TelemetryConfig::default().with_log_level("warn");
        // Another test in this binary may have installed a subscriber already.
        let _ = init_tracing(&config);
        assert!(matches!(
            init_tracing(&config),
            Err(TelemetryError::InitializationFailed { .. })
        ));
    }
}
