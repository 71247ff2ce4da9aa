use crate::types::{HealthStatus, MetricKind};
use serde::{Deserialize, Serialize};

/// Relative weight of each metric in the composite health score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricWeights {
    pub consent_success_rate: f64,
    pub data_fetch_success_rate: f64,
    pub avg_response_time_seconds: f64,
    pub error_rate: f64,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self {
            consent_success_rate: 0.3,
            data_fetch_success_rate: 0.3,
            avg_response_time_seconds: 0.2,
            error_rate: 0.2,
        }
    }
}

impl MetricWeights {
    pub fn weight(&self, metric: MetricKind) -> f64 {
        match metric {
            MetricKind::ConsentSuccessRate => self.consent_success_rate,
            MetricKind::DataFetchSuccessRate => self.data_fetch_success_rate,
            MetricKind::AvgResponseTimeSeconds => self.avg_response_time_seconds,
            MetricKind::ErrorRate => self.error_rate,
        }
    }

    pub fn total(&self) -> f64 {
        MetricKind::ALL.iter().map(|m| self.weight(*m)).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoringConfig {
    pub weights: MetricWeights,
    /// Response time at or above which the response-time component scores zero.
    pub max_response_time_seconds: f64,
    pub healthy_threshold: f64,
    pub degraded_threshold: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            weights: MetricWeights::default(),
            max_response_time_seconds: 10.0,
            healthy_threshold: 7.0,
            degraded_threshold: 4.0,
        }
    }
}

impl ScoringConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_weights(mut self, weights: MetricWeights) -> Self {
        self.weights = weights;
        self
    }

    pub fn with_max_response_time(mut self, seconds: f64) -> Self {
        self.max_response_time_seconds = seconds;
        self
    }

    pub fn with_thresholds(mut self, healthy: f64, degraded: f64) -> Self {
        self.healthy_threshold = healthy;
        self.degraded_threshold = degraded;
        self
    }

    pub fn classify(&self, score: f64) -> HealthStatus {
        if score >= self.healthy_threshold {
            HealthStatus::Healthy
        } else if score >= self.degraded_threshold {
            HealthStatus::Degraded
        } else {
            HealthStatus::Critical
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for metric in MetricKind::ALL {
            let weight = self.weights.weight(metric);
            if !weight.is_finite() || weight < 0.0 {
                return Err(format!("Weight for {} must be non-negative", metric));
            }
        }

        if (self.weights.total() - 1.0).abs() > 1e-6 {
            return Err(format!(
                "Metric weights must sum to 1.0, got {:.4}",
                self.weights.total()
            ));
        }

        if !(self.max_response_time_seconds > 0.0) {
            return Err("Max response time must be greater than 0".to_string());
        }

        if !(0.0..=10.0).contains(&self.degraded_threshold)
            || !(0.0..=10.0).contains(&self.healthy_threshold)
        {
            return Err("Status thresholds must be between 0 and 10".to_string());
        }

        if self.degraded_threshold >= self.healthy_threshold {
            return Err("Degraded threshold must be below the healthy threshold".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    pub history_days: u32,
    /// Share of observed weeks a bucket must be degraded in to count as recurring.
    pub recurrence_threshold: f64,
    pub min_observed_weeks: usize,
    /// Relative response-time increase that marks a peak-load signature.
    pub spike_factor: f64,
    /// Relative success-rate drop that counts as a floored metric.
    pub floor_drop: f64,
    /// Relative drop of a single metric that marks a degradation signature.
    pub decline_threshold: f64,
    /// Relative request volume drop that marks a backup signature.
    pub volume_drop: f64,
    /// Z-score magnitude an anomalous sample must exceed.
    pub anomaly_z_threshold: f64,
    /// Consecutive anomalous samples required before an anomaly is raised.
    pub anomaly_consecutive_samples: usize,
    pub baseline_window: usize,
    pub min_baseline_samples: usize,
    pub anomaly_ttl_minutes: u32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            history_days: 30,
            recurrence_threshold: 0.6,
            min_observed_weeks: 2,
            spike_factor: 0.5,
            floor_drop: 0.5,
            decline_threshold: 0.15,
            volume_drop: 0.5,
            anomaly_z_threshold: 3.0,
            anomaly_consecutive_samples: 3,
            baseline_window: 96,
            min_baseline_samples: 10,
            anomaly_ttl_minutes: 60,
        }
    }
}

impl AnalyzerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_recurrence_threshold(mut self, threshold: f64) -> Self {
        self.recurrence_threshold = threshold;
        self
    }

    pub fn with_anomaly_rule(mut self, z_threshold: f64, consecutive: usize) -> Self {
        self.anomaly_z_threshold = z_threshold;
        self.anomaly_consecutive_samples = consecutive;
        self
    }

    pub fn with_anomaly_ttl_minutes(mut self, minutes: u32) -> Self {
        self.anomaly_ttl_minutes = minutes;
        self
    }

    pub fn with_baseline(mut self, window: usize, min_samples: usize) -> Self {
        self.baseline_window = window;
        self.min_baseline_samples = min_samples;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.history_days == 0 {
            return Err("History window must be at least one day".to_string());
        }

        if !(self.recurrence_threshold > 0.0 && self.recurrence_threshold <= 1.0) {
            return Err("Recurrence threshold must be in (0, 1]".to_string());
        }

        if self.min_observed_weeks == 0 {
            return Err("At least one observed week is required".to_string());
        }

        if !(self.anomaly_z_threshold > 0.0) {
            return Err("Anomaly z threshold must be greater than 0".to_string());
        }

        if self.anomaly_consecutive_samples == 0 {
            return Err("Anomaly consecutive samples must be greater than 0".to_string());
        }

        if self.min_baseline_samples < 2 || self.baseline_window < self.min_baseline_samples {
            return Err(
                "Baseline window must hold at least the minimum baseline samples (>= 2)"
                    .to_string(),
            );
        }

        if self.anomaly_ttl_minutes == 0 {
            return Err("Anomaly TTL must be greater than 0".to_string());
        }

        for (name, value) in [
            ("spike_factor", self.spike_factor),
            ("floor_drop", self.floor_drop),
            ("decline_threshold", self.decline_threshold),
            ("volume_drop", self.volume_drop),
        ] {
            if !(value > 0.0) {
                return Err(format!("{} must be greater than 0", name));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForecastConfig {
    pub healthy_base: f64,
    pub degraded_base: f64,
    pub critical_base: f64,
    /// Score slope (points per hour) below which the trend counts as declining.
    pub decline_slope_threshold: f64,
    /// Probability added per point-per-hour of decline.
    pub trend_sensitivity: f64,
    pub max_trend_boost: f64,
    /// Probability removed when the score is recovering faster than the threshold.
    pub recovery_credit: f64,
    pub pattern_boost: f64,
    pub anomaly_boost: f64,
    pub max_anomaly_boost: f64,
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            healthy_base: 0.1,
            degraded_base: 0.4,
            critical_base: 0.75,
            decline_slope_threshold: 0.25,
            trend_sensitivity: 0.1,
            max_trend_boost: 0.2,
            recovery_credit: 0.05,
            pattern_boost: 0.3,
            anomaly_boost: 0.1,
            max_anomaly_boost: 0.2,
        }
    }
}

impl ForecastConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_probabilities(mut self, healthy: f64, degraded: f64, critical: f64) -> Self {
        self.healthy_base = healthy;
        self.degraded_base = degraded;
        self.critical_base = critical;
        self
    }

    pub fn with_pattern_boost(mut self, boost: f64) -> Self {
        self.pattern_boost = boost;
        self
    }

    pub fn base_probability(&self, status: HealthStatus) -> Option<f64> {
        match status {
            HealthStatus::Healthy => Some(self.healthy_base),
            HealthStatus::Degraded => Some(self.degraded_base),
            HealthStatus::Critical => Some(self.critical_base),
            HealthStatus::Unknown => None,
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("healthy_base", self.healthy_base),
            ("degraded_base", self.degraded_base),
            ("critical_base", self.critical_base),
            ("max_trend_boost", self.max_trend_boost),
            ("recovery_credit", self.recovery_credit),
            ("pattern_boost", self.pattern_boost),
            ("anomaly_boost", self.anomaly_boost),
            ("max_anomaly_boost", self.max_anomaly_boost),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(format!("{} must be between 0.0 and 1.0", name));
            }
        }

        if !(self.healthy_base <= self.degraded_base && self.degraded_base <= self.critical_base) {
            return Err("Base probabilities must not decrease with severity".to_string());
        }

        if !(self.decline_slope_threshold >= 0.0) || !(self.trend_sensitivity >= 0.0) {
            return Err("Trend settings must be non-negative".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImpactConfig {
    pub revenue_per_user: f64,
    pub operational_cost_per_user: f64,
    pub moderate_probability: f64,
    pub severe_probability: f64,
    pub sla_medium_probability: f64,
    pub sla_high_probability: f64,
}

impl Default for ImpactConfig {
    fn default() -> Self {
        Self {
            revenue_per_user: 150.0,
            operational_cost_per_user: 50.0,
            moderate_probability: 0.4,
            severe_probability: 0.7,
            sla_medium_probability: 0.3,
            sla_high_probability: 0.6,
        }
    }
}

impl ImpactConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_costs(mut self, revenue_per_user: f64, operational_cost_per_user: f64) -> Self {
        self.revenue_per_user = revenue_per_user;
        self.operational_cost_per_user = operational_cost_per_user;
        self
    }

    pub fn cost_per_user(&self) -> f64 {
        self.revenue_per_user + self.operational_cost_per_user
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.revenue_per_user >= 0.0) || !(self.operational_cost_per_user >= 0.0) {
            return Err("Per-user costs must be non-negative".to_string());
        }

        if !(0.0 < self.moderate_probability
            && self.moderate_probability < self.severe_probability
            && self.severe_probability <= 1.0)
        {
            return Err(
                "Satisfaction thresholds must satisfy 0 < moderate < severe <= 1".to_string(),
            );
        }

        if !(0.0 < self.sla_medium_probability
            && self.sla_medium_probability < self.sla_high_probability
            && self.sla_high_probability <= 1.0)
        {
            return Err("SLA thresholds must satisfy 0 < medium < high <= 1".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_configs_validate() {
        assert!(ScoringConfig::default().validate().is_ok());
        assert!(AnalyzerConfig::default().validate().is_ok());
        assert!(ForecastConfig::default().validate().is_ok());
        assert!(ImpactConfig::default().validate().is_ok());
    }

    #[test]
    fn test_scoring_classification() {
        let config = ScoringConfig::default();
        assert_eq!(config.classify(7.0), HealthStatus::Healthy);
        assert_eq!(config.classify(6.99), HealthStatus::Degraded);
        assert_eq!(config.classify(4.0), HealthStatus::Degraded);
        assert_eq!(config.classify(3.99), HealthStatus::Critical);
    }

    #[test]
    fn test_scoring_validation() {
        let mut config = ScoringConfig::default();
        config.weights.error_rate = 0.5;
        assert!(config.validate().is_err());

        let config = ScoringConfig::new().with_thresholds(4.0, 7.0);
        assert!(config.validate().is_err());

        let config = ScoringConfig::new().with_max_response_time(0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_analyzer_builder() {
        let config = AnalyzerConfig::new()
            .with_recurrence_threshold(0.75)
            .with_anomaly_rule(2.5, 4)
            .with_anomaly_ttl_minutes(30);
        assert_eq!(config.recurrence_threshold, 0.75);
        assert_eq!(config.anomaly_consecutive_samples, 4);
        assert!(config.validate().is_ok());

        assert!(AnalyzerConfig::new().with_baseline(5, 10).validate().is_err());
        assert!(AnalyzerConfig::new()
            .with_recurrence_threshold(1.5)
            .validate()
            .is_err());
    }

    #[test]
    fn test_forecast_base_probabilities() {
        let config = ForecastConfig::default();
        assert_eq!(config.base_probability(HealthStatus::Unknown), None);
        assert!(
            config.base_probability(HealthStatus::Critical)
                > config.base_probability(HealthStatus::Healthy)
        );

        let inverted = ForecastConfig::new().with_base_probabilities(0.8, 0.4, 0.1);
        assert!(inverted.validate().is_err());
    }

    #[test]
    fn test_impact_config_partial_deserialize() {
        let config: ImpactConfig = serde_json::from_str(r#"{"revenue_per_user": 100.0}"#).unwrap();
        assert_eq!(config.revenue_per_user, 100.0);
        assert_eq!(config.operational_cost_per_user, 50.0);
        assert_eq!(config.cost_per_user(), 150.0);
    }
}
