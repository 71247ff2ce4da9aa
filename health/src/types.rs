use crate::error::{HealthError, HealthResult};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Hours in one week; pattern buckets are indexed `0..HOURS_PER_WEEK` starting Monday 00:00 UTC.
pub const HOURS_PER_WEEK: usize = 168;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    ConsentSuccessRate,
    DataFetchSuccessRate,
    AvgResponseTimeSeconds,
    ErrorRate,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [
        MetricKind::ConsentSuccessRate,
        MetricKind::DataFetchSuccessRate,
        MetricKind::AvgResponseTimeSeconds,
        MetricKind::ErrorRate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::ConsentSuccessRate => "consent_success_rate",
            MetricKind::DataFetchSuccessRate => "data_fetch_success_rate",
            MetricKind::AvgResponseTimeSeconds => "avg_response_time_seconds",
            MetricKind::ErrorRate => "error_rate",
        }
    }

    /// Whether `value` lies inside the metric's valid domain.
    pub fn accepts(&self, value: f64) -> bool {
        if !value.is_finite() {
            return false;
        }
        match self {
            MetricKind::AvgResponseTimeSeconds => value >= 0.0,
            _ => (0.0..=100.0).contains(&value),
        }
    }

    pub fn higher_is_better(&self) -> bool {
        matches!(
            self,
            MetricKind::ConsentSuccessRate | MetricKind::DataFetchSuccessRate
        )
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One point-in-time metric sample for a FIP.
///
/// Each metric may be absent. A present value outside its domain is treated as
/// invalid by the scorer and rejected by [`MetricSnapshot::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    pub fip_id: String,
    pub timestamp: DateTime<Utc>,
    pub consent_success_rate: Option<f64>,
    pub data_fetch_success_rate: Option<f64>,
    pub avg_response_time_seconds: Option<f64>,
    pub error_rate: Option<f64>,
    #[serde(default)]
    pub request_count: u64,
}

impl MetricSnapshot {
    pub fn new(fip_id: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            fip_id: fip_id.into(),
            timestamp,
            consent_success_rate: None,
            data_fetch_success_rate: None,
            avg_response_time_seconds: None,
            error_rate: None,
            request_count: 0,
        }
    }

    pub fn with_consent_rate(mut self, rate: f64) -> Self {
        self.consent_success_rate = Some(rate);
        self
    }

    pub fn with_data_fetch_rate(mut self, rate: f64) -> Self {
        self.data_fetch_success_rate = Some(rate);
        self
    }

    pub fn with_response_time(mut self, seconds: f64) -> Self {
        self.avg_response_time_seconds = Some(seconds);
        self
    }

    pub fn with_error_rate(mut self, rate: f64) -> Self {
        self.error_rate = Some(rate);
        self
    }

    pub fn with_request_count(mut self, count: u64) -> Self {
        self.request_count = count;
        self
    }

    pub fn value(&self, metric: MetricKind) -> Option<f64> {
        match metric {
            MetricKind::ConsentSuccessRate => self.consent_success_rate,
            MetricKind::DataFetchSuccessRate => self.data_fetch_success_rate,
            MetricKind::AvgResponseTimeSeconds => self.avg_response_time_seconds,
            MetricKind::ErrorRate => self.error_rate,
        }
    }

    /// The metric value if present and inside its domain.
    pub fn valid_value(&self, metric: MetricKind) -> Option<f64> {
        self.value(metric).filter(|v| metric.accepts(*v))
    }

    pub fn validate(&self) -> HealthResult<()> {
        if self.fip_id.trim().is_empty() {
            return Err(HealthError::MissingFipId);
        }

        for metric in MetricKind::ALL {
            if let Some(value) = self.value(metric) {
                if !metric.accepts(value) {
                    return Err(HealthError::InvalidSnapshot {
                        fip_id: self.fip_id.clone(),
                        reason: format!("{} out of range: {}", metric, value),
                    });
                }
            }
        }

        Ok(())
    }
}

/// Static description of a FIP used for impact estimation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FipProfile {
    pub fip_id: String,
    pub bank_name: String,
    #[serde(default)]
    pub user_base: u64,
}

impl FipProfile {
    pub fn new(fip_id: impl Into<String>, bank_name: impl Into<String>, user_base: u64) -> Self {
        Self {
            fip_id: fip_id.into(),
            bank_name: bank_name.into(),
            user_base,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "info" => Ok(Severity::Info),
            "warning" => Ok(Severity::Warning),
            "critical" => Ok(Severity::Critical),
            other => Err(format!("unknown severity: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Unknown,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Critical => "critical",
            HealthStatus::Unknown => "unknown",
        }
    }

    /// Unknown assessments carry no usable signal and are excluded from forecasting.
    pub fn is_evaluable(&self) -> bool {
        !matches!(self, HealthStatus::Unknown)
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, HealthStatus::Degraded | HealthStatus::Critical)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthAssessment {
    pub fip_id: String,
    /// Composite score in `[0, 10]`.
    pub score: f64,
    pub status: HealthStatus,
    /// Timestamp of the snapshot the assessment was computed from.
    pub computed_at: DateTime<Utc>,
    /// Metrics left out of the composite because they were missing or out of range.
    pub excluded_metrics: Vec<MetricKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatternCategory {
    Maintenance,
    PeakLoad,
    Degradation,
    Backup,
}

impl PatternCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PatternCategory::Maintenance => "maintenance",
            PatternCategory::PeakLoad => "peak_load",
            PatternCategory::Degradation => "degradation",
            PatternCategory::Backup => "backup",
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            PatternCategory::Maintenance => "maintenance window",
            PatternCategory::PeakLoad => "peak load slowdown",
            PatternCategory::Degradation => "performance degradation",
            PatternCategory::Backup => "backup window",
        }
    }

    /// Categories that take the FIP out of service rather than slowing it down.
    pub fn is_planned_outage(&self) -> bool {
        matches!(self, PatternCategory::Maintenance | PatternCategory::Backup)
    }
}

impl fmt::Display for PatternCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Hour-of-week bucket index for a timestamp.
pub fn hour_of_week(timestamp: DateTime<Utc>) -> usize {
    timestamp.weekday().num_days_from_monday() as usize * 24 + timestamp.hour() as usize
}

fn truncate_to_hour(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    let secs_into_hour = timestamp.timestamp().rem_euclid(3600);
    timestamp
        - ChronoDuration::seconds(secs_into_hour)
        - ChronoDuration::nanoseconds(i64::from(timestamp.timestamp_subsec_nanos()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    Weekly { weekday: Weekday, start_hour: u32 },
}

impl Recurrence {
    pub fn weekly_from_bucket(bucket: usize) -> Self {
        let bucket = bucket % HOURS_PER_WEEK;
        let weekday = match bucket / 24 {
            0 => Weekday::Mon,
            1 => Weekday::Tue,
            2 => Weekday::Wed,
            3 => Weekday::Thu,
            4 => Weekday::Fri,
            5 => Weekday::Sat,
            _ => Weekday::Sun,
        };
        Recurrence::Weekly {
            weekday,
            start_hour: (bucket % 24) as u32,
        }
    }

    pub fn bucket(&self) -> usize {
        match self {
            Recurrence::Weekly {
                weekday,
                start_hour,
            } => weekday.num_days_from_monday() as usize * 24 + (*start_hour as usize % 24),
        }
    }

    /// Earliest occurrence start at or after `after`.
    pub fn next_start(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        let floor = truncate_to_hour(after);
        let current = hour_of_week(floor) as i64;
        let delta = (self.bucket() as i64 - current).rem_euclid(HOURS_PER_WEEK as i64);
        let candidate = floor + ChronoDuration::hours(delta);
        if candidate < after {
            candidate + ChronoDuration::hours(HOURS_PER_WEEK as i64)
        } else {
            candidate
        }
    }
}

impl fmt::Display for Recurrence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Recurrence::Weekly {
                weekday,
                start_hour,
            } => write!(f, "weekly on {} at {:02}:00 UTC", weekday, start_hour),
        }
    }
}

/// A recurring degradation detected from historical samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub fip_id: String,
    pub category: PatternCategory,
    pub description: String,
    pub recurrence: Recurrence,
    pub typical_duration: Duration,
    /// Fraction of observed weeks in which the degradation occurred.
    pub frequency: f64,
    /// Deviation magnitude of the degraded samples against the healthy baseline.
    pub deviation: f64,
}

impl Pattern {
    fn window_length(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.typical_duration.as_secs().max(1) as i64)
    }

    pub fn next_occurrence(&self, after: DateTime<Utc>) -> DateTime<Utc> {
        self.recurrence.next_start(after)
    }

    /// Start of the first occurrence whose window overlaps `[from, until)`.
    pub fn occurrence_within(
        &self,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Option<DateTime<Utc>> {
        let length = self.window_length();
        let mut start = self.recurrence.next_start(from - length);
        if start + length <= from {
            start += ChronoDuration::hours(HOURS_PER_WEEK as i64);
        }
        (start < until).then_some(start)
    }

    pub fn is_active_at(&self, at: DateTime<Utc>) -> bool {
        self.occurrence_within(at, at + ChronoDuration::seconds(1))
            .map(|start| start <= at)
            .unwrap_or(false)
    }

    pub fn window_end(&self, start: DateTime<Utc>) -> DateTime<Utc> {
        start + self.window_length()
    }
}

/// A statistically unusual metric reading that persisted for several samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub fip_id: String,
    pub metric: MetricKind,
    pub description: String,
    pub severity_hint: Severity,
    pub z_score: f64,
    pub observed_value: f64,
    pub baseline_mean: f64,
    pub first_seen: DateTime<Utc>,
    /// Timestamp of the most recent confirming sample.
    pub detected_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Anomaly {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Confidence {
    Low,
    Medium,
    High,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::Low => "low",
            Confidence::Medium => "medium",
            Confidence::High => "high",
        }
    }

    /// Numeric weight attached to alerts raised from a forecast.
    pub fn weight(&self) -> f64 {
        match self {
            Confidence::Low => 0.5,
            Confidence::Medium => 0.7,
            Confidence::High => 0.9,
        }
    }
}

impl fmt::Display for Confidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TimeWindow {
    Relative { label: String, within_minutes: u32 },
    Absolute {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeWindow::Relative { label, .. } => f.write_str(label),
            TimeWindow::Absolute { start, end } => write!(
                f,
                "{} to {} UTC",
                start.format("%a %Y-%m-%d %H:%M"),
                end.format("%H:%M")
            ),
        }
    }
}

/// Evidence that moved a forecast away from its status baseline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    DecliningTrend { slope_per_hour: f64 },
    RecurringPattern {
        category: PatternCategory,
        starts_at: DateTime<Utc>,
    },
    ActiveAnomalies { count: usize },
}

/// Forecast look-ahead, written as `30m`, `6h` or `7d`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Horizon {
    minutes: u32,
}

impl Horizon {
    pub const MAX_MINUTES: u32 = 30 * 24 * 60;
    pub const DAY: Horizon = Horizon { minutes: 24 * 60 };

    pub fn from_minutes(minutes: u32) -> HealthResult<Self> {
        if minutes == 0 || minutes > Self::MAX_MINUTES {
            return Err(HealthError::InvalidHorizon {
                value: format!("{}m", minutes),
            });
        }
        Ok(Self { minutes })
    }

    pub fn hours(hours: u32) -> HealthResult<Self> {
        Self::from_minutes(hours.saturating_mul(60))
    }

    pub fn minutes(&self) -> u32 {
        self.minutes
    }

    pub fn as_duration(&self) -> ChronoDuration {
        ChronoDuration::minutes(i64::from(self.minutes))
    }
}

impl Default for Horizon {
    fn default() -> Self {
        Self::DAY
    }
}

impl FromStr for Horizon {
    type Err = HealthError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || HealthError::InvalidHorizon {
            value: s.to_string(),
        };
        let trimmed = s.trim();
        let unit = trimmed.chars().last().ok_or_else(invalid)?;
        let amount: u32 = trimmed[..trimmed.len() - unit.len_utf8()]
            .parse()
            .map_err(|_| invalid())?;
        let minutes = match unit {
            'm' => amount,
            'h' => amount.checked_mul(60).ok_or_else(invalid)?,
            'd' => amount.checked_mul(24 * 60).ok_or_else(invalid)?,
            _ => return Err(invalid()),
        };
        Self::from_minutes(minutes).map_err(|_| invalid())
    }
}

impl fmt::Display for Horizon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.minutes % (24 * 60) == 0 {
            write!(f, "{}d", self.minutes / (24 * 60))
        } else if self.minutes % 60 == 0 {
            write!(f, "{}h", self.minutes / 60)
        } else {
            write!(f, "{}m", self.minutes)
        }
    }
}

impl TryFrom<String> for Horizon {
    type Error = HealthError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Horizon> for String {
    fn from(horizon: Horizon) -> Self {
        horizon.to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub fip_id: String,
    /// Probability of downtime within the horizon, in `[0, 1]`.
    pub probability: f64,
    pub time_window: TimeWindow,
    pub confidence: Confidence,
    pub signals: Vec<Signal>,
    pub reasoning: String,
    pub generated_at: DateTime<Utc>,
    pub horizon: Horizon,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SatisfactionImpact {
    Minor,
    Moderate,
    Severe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImpactEstimate {
    pub fip_id: String,
    pub bank_name: String,
    pub probability: f64,
    pub affected_users: u64,
    pub cost_estimate: f64,
    pub revenue_impact: f64,
    pub operational_cost: f64,
    pub severity_tier: Severity,
    pub satisfaction_impact: SatisfactionImpact,
    pub sla_breach_risk: RiskLevel,
}
