//! Alert lifecycle management
//!
//! The [`AlertEngine`] turns per-FIP evaluation results into deduplicated alerts.
//! Each `(fip_id, alert_type)` pair has at most one live alert which is refreshed in
//! place while its condition keeps firing and resolved once the condition has stayed
//! clear for the debounce period.
//!
//! # Features
//!
//! - Threshold, health-status, forecast, anomaly, divergence and instability conditions
//! - Stable alert identity across refreshes
//! - Debounced resolution
//! - Acknowledge and manual resolve
//! - Severity-ranked listing with filters and a summary
//! - Typed [`AlertTransition`] events for downstream notification
//!
//! # Examples
//!
//! ```rust
//! use chrono::Utc;
//! use health::{FipProfile, HealthScorer, MetricSnapshot, WeightedScorer};
//! use sentinel::alerts::{AlertEngine, AlertRules, FipEvaluation};
//!
//! let engine = AlertEngine::new(AlertRules::default());
//! let profile = FipProfile::new("sbi-fip", "State Bank of India", 4500);
//! let snapshot = MetricSnapshot::new("sbi-fip", Utc::now())
//!     .with_consent_rate(10.0)
//!     .with_data_fetch_rate(8.0)
//!     .with_response_time(9.0)
//!     .with_error_rate(88.0);
//! let assessment = WeightedScorer::default().assess(&snapshot);
//!
//! let transitions = engine
//!     .evaluate(&FipEvaluation::new(&profile, &snapshot, &assessment, Utc::now()))
//!     .unwrap();
//! assert!(transitions.iter().all(|t| t.should_notify()));
//! ```

use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
use health::stats::{coefficient_of_variation, mean};
use health::{
    Anomaly, FipProfile, Forecast, HealthAssessment, HealthStatus, ImpactEstimate, MetricKind,
    MetricSnapshot, Pattern, Severity,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Alert engine errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlertError {
    /// Evaluation input had no FIP identifier
    #[error("Alert evaluation requires a FIP identifier")]
    MissingFipId,

    /// No alert with this id
    #[error("Alert not found: {alert_id}")]
    NotFound { alert_id: String },

    /// The alert was already resolved
    #[error("Alert {alert_id} is already resolved")]
    AlreadyResolved { alert_id: String },
}

pub type AlertResult<T> = Result<T, AlertError>;

/// Condition an alert tracks. Together with the FIP id it forms the alert's identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    /// Health status dropped to degraded or critical
    HealthStatus,
    /// Consent success rate below threshold
    ConsentRate,
    /// Data fetch success rate below threshold
    DataFetchRate,
    /// Average response time above threshold
    ResponseTime,
    /// Forecast downtime probability above threshold
    DowntimeForecast,
    /// Active statistical anomaly
    Anomaly,
    /// Consent and data fetch rates diverging
    MetricDivergence,
    /// High short-term variance
    Instability,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::HealthStatus => "health_status",
            AlertType::ConsentRate => "consent_rate",
            AlertType::DataFetchRate => "data_fetch_rate",
            AlertType::ResponseTime => "response_time",
            AlertType::DowntimeForecast => "downtime_forecast",
            AlertType::Anomaly => "anomaly",
            AlertType::MetricDivergence => "metric_divergence",
            AlertType::Instability => "instability",
        }
    }

    fn follow_up(&self) -> &'static str {
        match self {
            AlertType::HealthStatus => "Review the FIP's recent error logs",
            AlertType::ConsentRate => "Verify the consent and authentication flow",
            AlertType::DataFetchRate => "Check data source connectivity and FIP API health",
            AlertType::ResponseTime => "Review load balancing and request throttling",
            AlertType::DowntimeForecast => "Reschedule batch fetches outside the forecast window",
            AlertType::Anomaly => "Correlate the anomalous metric with recent FIP changes",
            AlertType::MetricDivergence => {
                "Compare consent and data fetch pipelines for a partial outage"
            }
            AlertType::Instability => "Track metric variance until it stabilizes",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Open,
    Acknowledged,
    Resolved,
}

impl AlertStatus {
    pub fn is_active(&self) -> bool {
        !matches!(self, AlertStatus::Resolved)
    }
}

/// Metric values behind an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMetrics {
    /// Value that triggered the condition
    pub current_value: f64,
    /// Mean of the same metric over the recent window, when known
    pub historical_average: Option<f64>,
    /// Current value minus the historical average (or the z-score for anomalies)
    pub deviation: Option<f64>,
    /// Threshold that was crossed, if the condition has one
    pub threshold: Option<f64>,
}

impl AlertMetrics {
    fn current(value: f64) -> Self {
        Self {
            current_value: value,
            historical_average: None,
            deviation: None,
            threshold: None,
        }
    }

    fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = Some(threshold);
        self
    }

    fn with_average(mut self, average: Option<f64>) -> Self {
        self.historical_average = average;
        self.deviation = average.map(|avg| self.current_value - avg);
        self
    }
}

/// Business context attached to an alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertContext {
    /// Users expected to be affected, from the latest impact estimate
    pub affected_users: u64,
    /// Estimated cost of the disruption
    pub cost_estimate: f64,
    pub business_impact: String,
    pub historical_pattern: String,
    /// Whether the alert was raised during business hours
    pub peak_hour: bool,
}

/// A deduplicated alert for one FIP and condition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique identifier, stable across refreshes
    pub alert_id: String,
    pub fip_id: String,
    pub bank_name: String,
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub metrics: AlertMetrics,
    /// Timestamp of the snapshot the alert was last evaluated from
    pub snapshot_at: DateTime<Utc>,
    pub context: AlertContext,
    /// Confidence in `[0, 1]`
    pub confidence: f64,
    pub status: AlertStatus,
    /// Ordered, most urgent first
    pub recommended_actions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Number of evaluations that re-confirmed the condition
    pub refresh_count: u32,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolution_note: Option<String>,
}

/// A condition that fired during one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct AlertCondition {
    pub alert_type: AlertType,
    pub severity: Severity,
    pub message: String,
    pub metrics: AlertMetrics,
    pub confidence: f64,
}

/// State change produced by an evaluation
#[derive(Debug, Clone, PartialEq)]
pub enum AlertTransition {
    Opened(Alert),
    Refreshed { alert: Alert, escalated: bool },
    Resolved(Alert),
}

impl AlertTransition {
    pub fn alert(&self) -> &Alert {
        match self {
            AlertTransition::Opened(alert) => alert,
            AlertTransition::Refreshed { alert, .. } => alert,
            AlertTransition::Resolved(alert) => alert,
        }
    }

    /// New alerts and severity escalations go out to subscribers; plain refreshes do not.
    pub fn should_notify(&self) -> bool {
        match self {
            AlertTransition::Opened(_) => true,
            AlertTransition::Refreshed { escalated, .. } => *escalated,
            AlertTransition::Resolved(_) => false,
        }
    }
}

/// Alert thresholds and lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertRules {
    pub consent_warning: f64,
    pub consent_critical: f64,
    pub data_fetch_warning: f64,
    pub data_fetch_critical: f64,
    pub response_time_warning: f64,
    pub response_time_critical: f64,
    pub forecast_warning: f64,
    pub forecast_critical: f64,
    /// Percentage-point gap between consent and data fetch rates
    pub divergence_threshold: f64,
    /// Coefficient of variation (percent) over the stability window
    pub instability_threshold: f64,
    pub stability_window_minutes: u32,
    pub min_stability_samples: usize,
    /// How long a condition must stay clear before its alert resolves
    pub debounce_minutes: u32,
    /// Business hours in UTC, `[start, end)`
    pub business_hours_start: u32,
    pub business_hours_end: u32,
    pub max_resolved_history: usize,
    pub max_actions: usize,
}

impl Default for AlertRules {
    fn default() -> Self {
        Self {
            consent_warning: 85.0,
            consent_critical: 70.0,
            data_fetch_warning: 80.0,
            data_fetch_critical: 65.0,
            response_time_warning: 3.0,
            response_time_critical: 5.0,
            forecast_warning: 0.5,
            forecast_critical: 0.8,
            divergence_threshold: 20.0,
            instability_threshold: 15.0,
            stability_window_minutes: 180,
            min_stability_samples: 3,
            debounce_minutes: 10,
            business_hours_start: 9,
            business_hours_end: 18,
            max_resolved_history: 1000,
            max_actions: 5,
        }
    }
}

impl AlertRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_debounce_minutes(mut self, minutes: u32) -> Self {
        self.debounce_minutes = minutes;
        self
    }

    pub fn with_forecast_thresholds(mut self, warning: f64, critical: f64) -> Self {
        self.forecast_warning = warning;
        self.forecast_critical = critical;
        self
    }

    pub fn debounce(&self) -> ChronoDuration {
        ChronoDuration::minutes(i64::from(self.debounce_minutes))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.consent_critical > self.consent_warning {
            return Err(
                "Consent critical threshold must not exceed the warning threshold".to_string(),
            );
        }

        if self.data_fetch_critical > self.data_fetch_warning {
            return Err(
                "Data fetch critical threshold must not exceed the warning threshold".to_string(),
            );
        }

        if self.response_time_critical < self.response_time_warning {
            return Err(
                "Response time critical threshold must not be below the warning threshold"
                    .to_string(),
            );
        }

        if !(0.0..=1.0).contains(&self.forecast_warning)
            || !(0.0..=1.0).contains(&self.forecast_critical)
            || self.forecast_critical < self.forecast_warning
        {
            return Err(
                "Forecast thresholds must satisfy 0 <= warning <= critical <= 1".to_string(),
            );
        }

        if self.business_hours_start >= self.business_hours_end || self.business_hours_end > 24 {
            return Err("Business hours must be a non-empty range within the day".to_string());
        }

        if self.max_actions == 0 {
            return Err("At least one recommended action must be allowed".to_string());
        }

        Ok(())
    }
}

/// Everything the engine needs to evaluate one FIP.
#[derive(Debug, Clone)]
pub struct FipEvaluation<'a> {
    pub profile: &'a FipProfile,
    pub snapshot: &'a MetricSnapshot,
    pub assessment: &'a HealthAssessment,
    pub forecast: Option<&'a Forecast>,
    pub impact: Option<&'a ImpactEstimate>,
    pub patterns: &'a [Pattern],
    pub anomalies: &'a [Anomaly],
    /// Recent snapshots, oldest first
    pub recent: &'a [MetricSnapshot],
    pub now: DateTime<Utc>,
}

impl<'a> FipEvaluation<'a> {
    pub fn new(
        profile: &'a FipProfile,
        snapshot: &'a MetricSnapshot,
        assessment: &'a HealthAssessment,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            profile,
            snapshot,
            assessment,
            forecast: None,
            impact: None,
            patterns: &[],
            anomalies: &[],
            recent: &[],
            now,
        }
    }

    pub fn with_forecast(
        mut self,
        forecast: Option<&'a Forecast>,
        impact: Option<&'a ImpactEstimate>,
    ) -> Self {
        self.forecast = forecast;
        self.impact = impact;
        self
    }

    pub fn with_analysis(mut self, patterns: &'a [Pattern], anomalies: &'a [Anomaly]) -> Self {
        self.patterns = patterns;
        self.anomalies = anomalies;
        self
    }

    pub fn with_recent(mut self, recent: &'a [MetricSnapshot]) -> Self {
        self.recent = recent;
        self
    }

    fn recent_average(&self, metric: MetricKind) -> Option<f64> {
        let values: Vec<f64> = self
            .recent
            .iter()
            .filter_map(|s| s.valid_value(metric))
            .collect();
        mean(&values)
    }
}

/// Filter for listing active alerts
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertFilter {
    pub severity: Option<Severity>,
    pub fip_id: Option<String>,
    pub alert_type: Option<AlertType>,
    /// Case-insensitive match against bank name, FIP id and message
    pub text: Option<String>,
}

impl AlertFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    pub fn with_fip(mut self, fip_id: impl Into<String>) -> Self {
        self.fip_id = Some(fip_id.into());
        self
    }

    pub fn with_type(mut self, alert_type: AlertType) -> Self {
        self.alert_type = Some(alert_type);
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn matches(&self, alert: &Alert) -> bool {
        if self.severity.is_some_and(|s| s != alert.severity) {
            return false;
        }
        if self.fip_id.as_ref().is_some_and(|f| *f != alert.fip_id) {
            return false;
        }
        if self.alert_type.is_some_and(|t| t != alert.alert_type) {
            return false;
        }
        if let Some(text) = self.text.as_ref().map(|t| t.trim().to_lowercase()) {
            if !text.is_empty() {
                let haystack = format!("{} {} {}", alert.bank_name, alert.fip_id, alert.message)
                    .to_lowercase();
                if !haystack.contains(&text) {
                    return false;
                }
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertSummary {
    pub total_active: usize,
    pub critical: usize,
    pub warning: usize,
    pub info: usize,
    pub acknowledged: usize,
    pub affected_fips: Vec<String>,
    pub total_affected_users: u64,
}

#[derive(Debug, Clone)]
struct OpenEntry {
    alert_id: String,
    cleared_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct AlertBook {
    alerts: HashMap<String, Alert>,
    open: HashMap<(String, AlertType), OpenEntry>,
    resolved_order: VecDeque<String>,
}

impl AlertBook {
    fn retire(&mut self, alert_id: &str, max_history: usize) {
        self.resolved_order.push_back(alert_id.to_string());
        while self.resolved_order.len() > max_history {
            if let Some(oldest) = self.resolved_order.pop_front() {
                self.alerts.remove(&oldest);
            }
        }
    }
}

/// Owns every alert and serializes all transitions behind one lock.
#[derive(Debug, Default)]
pub struct AlertEngine {
    rules: AlertRules,
    book: Mutex<AlertBook>,
}

impl AlertEngine {
    pub fn new(rules: AlertRules) -> Self {
        Self {
            rules,
            book: Mutex::new(AlertBook::default()),
        }
    }

    pub fn rules(&self) -> &AlertRules {
        &self.rules
    }

    /// Conditions currently firing for the evaluated FIP. Pure; does not touch alert state.
    pub fn conditions(&self, eval: &FipEvaluation<'_>) -> Vec<AlertCondition> {
        let rules = &self.rules;
        let bank = &eval.profile.bank_name;
        let mut conditions = Vec::new();

        match eval.assessment.status {
            HealthStatus::Critical | HealthStatus::Degraded => {
                let critical = eval.assessment.status == HealthStatus::Critical;
                conditions.push(AlertCondition {
                    alert_type: AlertType::HealthStatus,
                    severity: if critical {
                        Severity::Critical
                    } else {
                        Severity::Warning
                    },
                    message: format!(
                        "{} health is {} (score {:.2}/10)",
                        bank, eval.assessment.status, eval.assessment.score
                    ),
                    metrics: AlertMetrics::current(eval.assessment.score),
                    confidence: if critical { 0.95 } else { 0.85 },
                });
            }
            HealthStatus::Healthy | HealthStatus::Unknown => {}
        }

        let low_rate_checks = [
            (
                AlertType::ConsentRate,
                MetricKind::ConsentSuccessRate,
                "consent success rate",
                rules.consent_warning,
                rules.consent_critical,
            ),
            (
                AlertType::DataFetchRate,
                MetricKind::DataFetchSuccessRate,
                "data fetch success rate",
                rules.data_fetch_warning,
                rules.data_fetch_critical,
            ),
        ];
        for (alert_type, metric, label, warning, critical) in low_rate_checks {
            let Some(value) = eval.snapshot.valid_value(metric) else {
                continue;
            };
            let (severity, threshold) = if value < critical {
                (Severity::Critical, critical)
            } else if value < warning {
                (Severity::Warning, warning)
            } else {
                continue;
            };
            conditions.push(AlertCondition {
                alert_type,
                severity,
                message: format!(
                    "{} {} is {:.1}%, below the {} threshold of {:.0}%",
                    bank, label, value, severity, threshold
                ),
                metrics: AlertMetrics::current(value)
                    .with_threshold(threshold)
                    .with_average(eval.recent_average(metric)),
                confidence: 0.9,
            });
        }

        if let Some(seconds) = eval
            .snapshot
            .valid_value(MetricKind::AvgResponseTimeSeconds)
        {
            let breach = if seconds > rules.response_time_critical {
                Some((Severity::Critical, rules.response_time_critical))
            } else if seconds > rules.response_time_warning {
                Some((Severity::Warning, rules.response_time_warning))
            } else {
                None
            };
            if let Some((severity, threshold)) = breach {
                conditions.push(AlertCondition {
                    alert_type: AlertType::ResponseTime,
                    severity,
                    message: format!(
                        "{} average response time is {:.2}s, above the {} threshold of {:.1}s",
                        bank, seconds, severity, threshold
                    ),
                    metrics: AlertMetrics::current(seconds)
                        .with_threshold(threshold)
                        .with_average(eval.recent_average(MetricKind::AvgResponseTimeSeconds)),
                    confidence: 0.85,
                });
            }
        }

        if let Some(forecast) = eval.forecast {
            let breach = if forecast.probability >= rules.forecast_critical {
                Some((Severity::Critical, rules.forecast_critical))
            } else if forecast.probability >= rules.forecast_warning {
                Some((Severity::Warning, rules.forecast_warning))
            } else {
                None
            };
            if let Some((severity, threshold)) = breach {
                conditions.push(AlertCondition {
                    alert_type: AlertType::DowntimeForecast,
                    severity,
                    message: format!(
                        "{} has a {:.0}% probability of downtime {} ({} confidence)",
                        bank,
                        forecast.probability * 100.0,
                        forecast.time_window,
                        forecast.confidence
                    ),
                    metrics: AlertMetrics::current(forecast.probability).with_threshold(threshold),
                    confidence: forecast.confidence.weight(),
                });
            }
        }

        let active: Vec<&Anomaly> = eval
            .anomalies
            .iter()
            .filter(|a| a.is_active(eval.now))
            .collect();
        if let Some(strongest) = active
            .iter()
            .max_by(|a, b| a.z_score.abs().total_cmp(&b.z_score.abs()))
        {
            let severity = active
                .iter()
                .map(|a| a.severity_hint)
                .max()
                .unwrap_or(Severity::Warning);
            conditions.push(AlertCondition {
                alert_type: AlertType::Anomaly,
                severity,
                message: format!(
                    "{} has {} active anomal{}: {}",
                    bank,
                    active.len(),
                    if active.len() == 1 { "y" } else { "ies" },
                    strongest.description
                ),
                metrics: AlertMetrics {
                    current_value: strongest.observed_value,
                    historical_average: Some(strongest.baseline_mean),
                    deviation: Some(strongest.z_score),
                    threshold: None,
                },
                confidence: 0.75,
            });
        }

        if let (Some(consent), Some(data_fetch)) = (
            eval.snapshot.valid_value(MetricKind::ConsentSuccessRate),
            eval.snapshot.valid_value(MetricKind::DataFetchSuccessRate),
        ) {
            let gap = (consent - data_fetch).abs();
            if gap > rules.divergence_threshold {
                conditions.push(AlertCondition {
                    alert_type: AlertType::MetricDivergence,
                    severity: Severity::Warning,
                    message: format!(
                        "{} consent ({:.1}%) and data fetch ({:.1}%) success rates differ by {:.1} points",
                        bank, consent, data_fetch, gap
                    ),
                    metrics: AlertMetrics {
                        current_value: gap,
                        historical_average: None,
                        deviation: Some(consent - data_fetch),
                        threshold: Some(rules.divergence_threshold),
                    },
                    confidence: 0.7,
                });
            }
        }

        if let Some(condition) = self.instability(eval) {
            conditions.push(condition);
        }

        conditions
    }

    fn instability(&self, eval: &FipEvaluation<'_>) -> Option<AlertCondition> {
        let since =
            eval.now - ChronoDuration::minutes(i64::from(self.rules.stability_window_minutes));
        let window: Vec<&MetricSnapshot> = eval
            .recent
            .iter()
            .filter(|s| s.timestamp >= since && s.timestamp <= eval.now)
            .collect();

        [MetricKind::ConsentSuccessRate, MetricKind::DataFetchSuccessRate]
            .into_iter()
            .filter_map(|metric| {
                let values: Vec<f64> =
                    window.iter().filter_map(|s| s.valid_value(metric)).collect();
                if values.len() < self.rules.min_stability_samples {
                    return None;
                }
                coefficient_of_variation(&values).map(|cv| (metric, cv, mean(&values)))
            })
            .filter(|(_, cv, _)| *cv > self.rules.instability_threshold)
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(metric, cv, average)| AlertCondition {
                alert_type: AlertType::Instability,
                severity: Severity::Warning,
                message: format!(
                    "{} {} is unstable: {:.1}% variation over the last {} minutes",
                    eval.profile.bank_name, metric, cv, self.rules.stability_window_minutes
                ),
                metrics: AlertMetrics {
                    current_value: cv,
                    historical_average: average,
                    deviation: None,
                    threshold: Some(self.rules.instability_threshold),
                },
                confidence: 0.7,
            })
    }

    fn context(&self, eval: &FipEvaluation<'_>) -> AlertContext {
        let hour = eval.now.hour();
        let peak_hour =
            hour >= self.rules.business_hours_start && hour < self.rules.business_hours_end;
        let (affected_users, cost_estimate) = eval
            .impact
            .map(|i| (i.affected_users, i.cost_estimate))
            .unwrap_or((0, 0.0));
        let user_base = eval.profile.user_base;

        let business_impact = if peak_hour && user_base > 0 && affected_users * 10 > user_base * 3
        {
            format!(
                "Severe: {} of {} users affected during business hours",
                affected_users, user_base
            )
        } else if peak_hour {
            format!(
                "High: disruption during business hours affecting about {} users",
                affected_users
            )
        } else {
            format!(
                "Moderate: off-peak disruption affecting about {} users",
                affected_users
            )
        };

        let historical_pattern = eval
            .patterns
            .first()
            .map(|p| p.description.clone())
            .unwrap_or_else(|| "No recurring pattern detected".to_string());

        AlertContext {
            affected_users,
            cost_estimate,
            business_impact,
            historical_pattern,
            peak_hour,
        }
    }

    pub fn recommended_actions(&self, alert_type: AlertType, severity: Severity) -> Vec<String> {
        let base: &[&str] = match severity {
            Severity::Critical => &[
                "Immediately activate fallback data collection for affected users",
                "Notify affected users and downstream FIUs of the disruption",
                "Escalate to the FIP technical team",
            ],
            Severity::Warning => &[
                "Prepare fallback procedures for affected users",
                "Monitor performance metrics every 15 minutes",
            ],
            Severity::Info => &["Continue standard monitoring"],
        };

        let mut actions: Vec<String> = base.iter().map(|a| a.to_string()).collect();
        actions.push(alert_type.follow_up().to_string());
        actions.truncate(self.rules.max_actions);
        actions
    }

    /// Evaluate one FIP and apply the resulting transitions.
    pub fn evaluate(&self, eval: &FipEvaluation<'_>) -> AlertResult<Vec<AlertTransition>> {
        let fip_id = eval.profile.fip_id.trim();
        if fip_id.is_empty() || eval.snapshot.fip_id.trim().is_empty() {
            return Err(AlertError::MissingFipId);
        }

        let conditions = self.conditions(eval);
        let context = self.context(eval);
        Ok(self.apply(
            fip_id,
            &eval.profile.bank_name,
            conditions,
            &context,
            eval.snapshot.timestamp,
            eval.now,
        ))
    }

    fn apply(
        &self,
        fip_id: &str,
        bank_name: &str,
        conditions: Vec<AlertCondition>,
        context: &AlertContext,
        snapshot_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Vec<AlertTransition> {
        let mut guard = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        let book = &mut *guard;
        let mut transitions = Vec::new();
        let firing: HashSet<AlertType> = conditions.iter().map(|c| c.alert_type).collect();

        for condition in conditions {
            let key = (fip_id.to_string(), condition.alert_type);
            let actions = self.recommended_actions(condition.alert_type, condition.severity);

            let existing_id = book.open.get_mut(&key).map(|entry| {
                entry.cleared_since = None;
                entry.alert_id.clone()
            });
            let existing = match existing_id {
                Some(id) => book.alerts.get_mut(&id),
                None => None,
            };

            if let Some(alert) = existing {
                let escalated = condition.severity > alert.severity;
                alert.severity = condition.severity;
                alert.message = condition.message;
                alert.metrics = condition.metrics;
                alert.confidence = condition.confidence.clamp(0.0, 1.0);
                alert.context = context.clone();
                alert.snapshot_at = snapshot_at;
                alert.recommended_actions = actions;
                alert.updated_at = now;
                alert.refresh_count += 1;
                if escalated {
                    warn!(
                        "Alert {} for {} escalated to {}",
                        alert.alert_id, fip_id, alert.severity
                    );
                }
                debug!(
                    "Refreshed {} alert {} for {} ({} refreshes)",
                    alert.alert_type, alert.alert_id, fip_id, alert.refresh_count
                );
                transitions.push(AlertTransition::Refreshed {
                    alert: alert.clone(),
                    escalated,
                });
                continue;
            }

            let alert = Alert {
                alert_id: Uuid::new_v4().to_string(),
                fip_id: fip_id.to_string(),
                bank_name: bank_name.to_string(),
                alert_type: condition.alert_type,
                severity: condition.severity,
                message: condition.message,
                metrics: condition.metrics,
                snapshot_at,
                context: context.clone(),
                confidence: condition.confidence.clamp(0.0, 1.0),
                status: AlertStatus::Open,
                recommended_actions: actions,
                created_at: now,
                updated_at: now,
                refresh_count: 0,
                acknowledged_at: None,
                resolved_at: None,
                resolution_note: None,
            };

            match alert.severity {
                Severity::Critical => {
                    error!("CRITICAL ALERT: {} - {}", alert.alert_type, alert.message)
                }
                Severity::Warning => {
                    warn!("WARNING ALERT: {} - {}", alert.alert_type, alert.message)
                }
                Severity::Info => info!("INFO ALERT: {} - {}", alert.alert_type, alert.message),
            }

            book.open.insert(
                key,
                OpenEntry {
                    alert_id: alert.alert_id.clone(),
                    cleared_since: None,
                },
            );
            book.alerts.insert(alert.alert_id.clone(), alert.clone());
            transitions.push(AlertTransition::Opened(alert));
        }

        let mut cleared: Vec<(String, AlertType)> = book
            .open
            .keys()
            .filter(|(fip, alert_type)| fip == fip_id && !firing.contains(alert_type))
            .cloned()
            .collect();
        cleared.sort_by_key(|(_, alert_type)| *alert_type);

        let debounce = self.rules.debounce();
        for key in cleared {
            let Some(entry) = book.open.get_mut(&key) else {
                continue;
            };
            let since = *entry.cleared_since.get_or_insert(now);
            if now - since < debounce {
                continue;
            }

            let Some(entry) = book.open.remove(&key) else {
                continue;
            };
            if let Some(alert) = book.alerts.get_mut(&entry.alert_id) {
                alert.status = AlertStatus::Resolved;
                alert.resolved_at = Some(now);
                alert.updated_at = now;
                alert.resolution_note = Some(format!(
                    "Condition clear since {}",
                    since.format("%Y-%m-%d %H:%M:%S UTC")
                ));
                info!("Alert {} for {} resolved", alert.alert_id, fip_id);
                transitions.push(AlertTransition::Resolved(alert.clone()));
            }
            book.retire(&entry.alert_id, self.rules.max_resolved_history);
        }

        transitions
    }

    pub fn acknowledge(&self, alert_id: &str, now: DateTime<Utc>) -> AlertResult<Alert> {
        let mut book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        let alert = book
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| AlertError::NotFound {
                alert_id: alert_id.to_string(),
            })?;

        if alert.status == AlertStatus::Resolved {
            return Err(AlertError::AlreadyResolved {
                alert_id: alert_id.to_string(),
            });
        }

        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_at = Some(now);
        alert.updated_at = now;
        info!("Alert {} acknowledged", alert_id);
        Ok(alert.clone())
    }

    pub fn resolve(
        &self,
        alert_id: &str,
        note: Option<String>,
        now: DateTime<Utc>,
    ) -> AlertResult<Alert> {
        let mut guard = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        let book = &mut *guard;
        let alert = book
            .alerts
            .get_mut(alert_id)
            .ok_or_else(|| AlertError::NotFound {
                alert_id: alert_id.to_string(),
            })?;

        if alert.status == AlertStatus::Resolved {
            return Err(AlertError::AlreadyResolved {
                alert_id: alert_id.to_string(),
            });
        }

        alert.status = AlertStatus::Resolved;
        alert.resolved_at = Some(now);
        alert.updated_at = now;
        alert.resolution_note = Some(note.unwrap_or_else(|| "Resolved manually".to_string()));
        let resolved = alert.clone();

        book.open
            .remove(&(resolved.fip_id.clone(), resolved.alert_type));
        book.retire(alert_id, self.rules.max_resolved_history);
        info!("Alert {} resolved manually", alert_id);
        Ok(resolved)
    }

    pub fn get(&self, alert_id: &str) -> Option<Alert> {
        let book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        book.alerts.get(alert_id).cloned()
    }

    /// Active alerts, most severe first, then by confidence and age.
    pub fn active(&self, filter: &AlertFilter) -> Vec<Alert> {
        let book = self.book.lock().unwrap_or_else(PoisonError::into_inner);
        let mut alerts: Vec<Alert> = book
            .alerts
            .values()
            .filter(|a| a.status.is_active() && filter.matches(a))
            .cloned()
            .collect();
        alerts.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then_with(|| b.confidence.total_cmp(&a.confidence))
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.alert_id.cmp(&b.alert_id))
        });
        alerts
    }

    pub fn summary(&self) -> AlertSummary {
        summarize(&self.active(&AlertFilter::default()))
    }
}

pub fn summarize(alerts: &[Alert]) -> AlertSummary {
    let mut summary = AlertSummary {
        total_active: alerts.len(),
        ..AlertSummary::default()
    };
    let mut users_by_fip: HashMap<&str, u64> = HashMap::new();

    for alert in alerts {
        match alert.severity {
            Severity::Critical => summary.critical += 1,
            Severity::Warning => summary.warning += 1,
            Severity::Info => summary.info += 1,
        }
        if alert.status == AlertStatus::Acknowledged {
            summary.acknowledged += 1;
        }
        let users = users_by_fip.entry(alert.fip_id.as_str()).or_insert(0);
        *users = (*users).max(alert.context.affected_users);
    }

    let mut fips: Vec<String> = users_by_fip.keys().map(|f| f.to_string()).collect();
    fips.sort();
    summary.affected_fips = fips;
    summary.total_affected_users = users_by_fip.values().sum();
    summary
}
