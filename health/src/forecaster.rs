//! Downtime forecasting
//!
//! A [`DowntimeForecaster`] combines the current [`HealthAssessment`] with trend,
//! recurring [`Pattern`]s and active [`Anomaly`] records into a [`Forecast`].
//!
//! # Features
//!
//! - Status-based prior adjusted by score momentum, upcoming patterns and anomalies
//! - Confidence derived from how many independent signals agree
//! - Time window narrowed to the next pattern occurrence when one falls in the horizon
//! - Templated, reproducible reasoning text
//! - Hour-by-hour maintenance outlook across FIPs
//!
//! # Examples
//!
//! ```rust
//! use chrono::Utc;
//! use health::{
//!     Confidence, DowntimeForecaster, ForecastInput, HealthScorer, Horizon, MetricSnapshot,
//!     SignalForecaster, WeightedScorer,
//! };
//!
//! let now = Utc::now();
//! let snapshot = MetricSnapshot::new("sbi-fip", now)
//!     .with_consent_rate(10.0)
//!     .with_data_fetch_rate(8.0)
//!     .with_response_time(9.0)
//!     .with_error_rate(88.0);
//! let assessment = WeightedScorer::default().assess(&snapshot);
//!
//! let forecast = SignalForecaster::default()
//!     .forecast(&ForecastInput::new(&assessment, Horizon::DAY, now))
//!     .unwrap();
//! assert!(forecast.probability >= 0.7);
//! assert_eq!(forecast.confidence, Confidence::Low);
//! ```

use crate::config::ForecastConfig;
use crate::error::{HealthError, HealthResult};
use crate::stats::linear_slope;
use crate::types::{
    Anomaly, Confidence, Forecast, HealthAssessment, Horizon, Pattern, PatternCategory, Signal,
    TimeWindow,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Generic windows used when no pattern pins down a time, most urgent first.
const URGENCY_WINDOWS: [(f64, &str, u32); 3] = [
    (0.7, "next 30 minutes", 30),
    (0.4, "next 2-6 hours", 6 * 60),
    (0.0, "next 24 hours", 24 * 60),
];

#[derive(Debug, Clone)]
pub struct ForecastInput<'a> {
    pub assessment: &'a HealthAssessment,
    /// Score slope in points per hour, negative when health is declining.
    pub trend_slope: Option<f64>,
    pub patterns: &'a [Pattern],
    pub anomalies: &'a [Anomaly],
    pub horizon: Horizon,
    pub now: DateTime<Utc>,
}

impl<'a> ForecastInput<'a> {
    pub fn new(assessment: &'a HealthAssessment, horizon: Horizon, now: DateTime<Utc>) -> Self {
        Self {
            assessment,
            trend_slope: None,
            patterns: &[],
            anomalies: &[],
            horizon,
            now,
        }
    }

    pub fn with_trend(mut self, slope: Option<f64>) -> Self {
        self.trend_slope = slope;
        self
    }

    pub fn with_patterns(mut self, patterns: &'a [Pattern]) -> Self {
        self.patterns = patterns;
        self
    }

    pub fn with_anomalies(mut self, anomalies: &'a [Anomaly]) -> Self {
        self.anomalies = anomalies;
        self
    }
}

pub trait DowntimeForecaster: Send + Sync {
    fn forecast(&self, input: &ForecastInput<'_>) -> HealthResult<Forecast>;

    fn forecaster_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Default)]
pub struct SignalForecaster {
    config: ForecastConfig,
}

impl SignalForecaster {
    pub fn new(config: ForecastConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ForecastConfig {
        &self.config
    }

    fn upcoming_pattern<'p>(
        &self,
        input: &ForecastInput<'p>,
    ) -> Option<(&'p Pattern, DateTime<Utc>)> {
        let until = input.now + input.horizon.as_duration();
        input
            .patterns
            .iter()
            .filter(|p| p.fip_id == input.assessment.fip_id)
            .filter_map(|p| p.occurrence_within(input.now, until).map(|start| (p, start)))
            .min_by(|(a, a_start), (b, b_start)| {
                a_start
                    .cmp(b_start)
                    .then_with(|| b.deviation.total_cmp(&a.deviation))
            })
    }

    fn urgency_window(probability: f64, horizon: Horizon) -> TimeWindow {
        let (_, label, within) = URGENCY_WINDOWS
            .iter()
            .find(|(floor, _, _)| probability >= *floor)
            .copied()
            .unwrap_or(URGENCY_WINDOWS[URGENCY_WINDOWS.len() - 1]);

        if within > horizon.minutes() {
            TimeWindow::Relative {
                label: format!("within the next {}", horizon),
                within_minutes: horizon.minutes(),
            }
        } else {
            TimeWindow::Relative {
                label: label.to_string(),
                within_minutes: within,
            }
        }
    }
}

impl DowntimeForecaster for SignalForecaster {
    fn forecast(&self, input: &ForecastInput<'_>) -> HealthResult<Forecast> {
        let assessment = input.assessment;
        let base = self
            .config
            .base_probability(assessment.status)
            .ok_or_else(|| HealthError::NotForecastable {
                fip_id: assessment.fip_id.clone(),
                reason: "health status is unknown".to_string(),
            })?;

        let mut probability = base;
        let mut signals = Vec::new();
        let mut reasons = vec![format!(
            "Health score {:.1}/10 ({}) gives a base downtime probability of {:.0}%.",
            assessment.score,
            assessment.status,
            base * 100.0
        )];

        if let Some(slope) = input.trend_slope.filter(|s| s.is_finite()) {
            if slope < -self.config.decline_slope_threshold {
                probability +=
                    (-slope * self.config.trend_sensitivity).min(self.config.max_trend_boost);
                signals.push(Signal::DecliningTrend {
                    slope_per_hour: slope,
                });
                reasons.push(format!("Score is falling {:.2} points per hour.", -slope));
            } else if slope > self.config.decline_slope_threshold {
                probability -= self.config.recovery_credit;
                reasons.push(format!("Score is recovering {:.2} points per hour.", slope));
            }
        }

        let upcoming = self.upcoming_pattern(input);
        if let Some((pattern, starts_at)) = upcoming {
            probability += self.config.pattern_boost;
            signals.push(Signal::RecurringPattern {
                category: pattern.category,
                starts_at,
            });
            reasons.push(format!(
                "Recurring {} expected from {} UTC ({:.0}% of observed weeks).",
                pattern.category.describe(),
                starts_at.format("%a %Y-%m-%d %H:%M"),
                pattern.frequency * 100.0
            ));
        }

        let mut active: Vec<&Anomaly> = input
            .anomalies
            .iter()
            .filter(|a| a.fip_id == assessment.fip_id && a.is_active(input.now))
            .collect();
        active.sort_by(|a, b| a.metric.cmp(&b.metric).then(a.detected_at.cmp(&b.detected_at)));
        if !active.is_empty() {
            probability += (self.config.anomaly_boost * active.len() as f64)
                .min(self.config.max_anomaly_boost);
            signals.push(Signal::ActiveAnomalies {
                count: active.len(),
            });
            let listed: Vec<String> = active
                .iter()
                .map(|a| format!("{} (z={:.1})", a.metric, a.z_score))
                .collect();
            reasons.push(format!(
                "{} active anomal{}: {}.",
                active.len(),
                if active.len() == 1 { "y" } else { "ies" },
                listed.join(", ")
            ));
        }

        let probability = probability.clamp(0.0, 1.0);

        let only_anomalies = matches!(signals.as_slice(), [Signal::ActiveAnomalies { .. }]);
        let confidence = match signals.len() {
            0 => Confidence::Low,
            1 if only_anomalies => Confidence::Low,
            n if n >= 3 => Confidence::High,
            _ => Confidence::Medium,
        };

        let time_window = match upcoming {
            Some((pattern, starts_at)) => TimeWindow::Absolute {
                start: starts_at,
                end: pattern.window_end(starts_at),
            },
            None => Self::urgency_window(probability, input.horizon),
        };

        reasons.push(format!(
            "Estimated downtime probability {:.0}% {} with {} confidence.",
            probability * 100.0,
            time_window,
            confidence
        ));

        debug!(
            "Forecast for {}: probability {:.3}, {} signals",
            assessment.fip_id,
            probability,
            signals.len()
        );

        Ok(Forecast {
            fip_id: assessment.fip_id.clone(),
            probability,
            time_window,
            confidence,
            signals,
            reasoning: reasons.join(" "),
            generated_at: input.now,
            horizon: input.horizon,
        })
    }

    fn forecaster_name(&self) -> &'static str {
        "signal"
    }
}

/// Least-squares score slope in points per hour over evaluable assessments.
pub fn score_trend(assessments: &[HealthAssessment]) -> Option<f64> {
    let evaluable: Vec<&HealthAssessment> = assessments
        .iter()
        .filter(|a| a.status.is_evaluable())
        .collect();
    let origin = evaluable.iter().map(|a| a.computed_at).min()?;
    let points: Vec<(f64, f64)> = evaluable
        .iter()
        .map(|a| {
            let hours = (a.computed_at - origin).num_seconds() as f64 / 3600.0;
            (hours, a.score)
        })
        .collect();
    linear_slope(&points)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceWindow {
    pub fip_id: String,
    pub category: PatternCategory,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HourlyOutlook {
    pub hour_offset: u32,
    pub starts_at: DateTime<Utc>,
    pub windows: Vec<MaintenanceWindow>,
}

impl HourlyOutlook {
    pub fn is_high_risk(&self) -> bool {
        !self.windows.is_empty()
    }
}

/// For each of the next `hours` hours, the planned-outage windows that overlap it.
pub fn maintenance_outlook<'a>(
    patterns: impl IntoIterator<Item = &'a Pattern>,
    now: DateTime<Utc>,
    hours: u32,
) -> Vec<HourlyOutlook> {
    let planned: Vec<&Pattern> = patterns
        .into_iter()
        .filter(|p| p.category.is_planned_outage())
        .collect();

    (0..hours)
        .map(|offset| {
            let slot_start = now + ChronoDuration::hours(i64::from(offset));
            let slot_end = slot_start + ChronoDuration::hours(1);
            let mut windows: Vec<MaintenanceWindow> = planned
                .iter()
                .filter_map(|p| {
                    p.occurrence_within(slot_start, slot_end)
                        .map(|start| MaintenanceWindow {
                            fip_id: p.fip_id.clone(),
                            category: p.category,
                            starts_at: start,
                            ends_at: p.window_end(start),
                            description: p.description.clone(),
                        })
                })
                .collect();
            windows.sort_by(|a, b| a.fip_id.cmp(&b.fip_id).then(a.starts_at.cmp(&b.starts_at)));

            HourlyOutlook {
                hour_offset: offset,
                starts_at: slot_start,
                windows,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HealthStatus, MetricKind, Recurrence, Severity};
    use chrono::{TimeZone, Weekday};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        // Saturday.
        Utc.with_ymd_and_hms(2024, 3, 9, 12, 0, 0).unwrap()
    }

    fn assessment(score: f64, status: HealthStatus) -> HealthAssessment {
        HealthAssessment {
            fip_id: "sbi-fip".to_string(),
            score,
            status,
            computed_at: now(),
            excluded_metrics: Vec::new(),
        }
    }

    fn sunday_maintenance() -> Pattern {
        Pattern {
            fip_id: "sbi-fip".to_string(),
            category: PatternCategory::Maintenance,
            description: "Recurring maintenance window".to_string(),
            recurrence: Recurrence::Weekly {
                weekday: Weekday::Sun,
                start_hour: 2,
            },
            typical_duration: Duration::from_secs(2 * 3600),
            frequency: 1.0,
            deviation: 0.9,
        }
    }

    fn anomaly() -> Anomaly {
        Anomaly {
            fip_id: "sbi-fip".to_string(),
            metric: MetricKind::ConsentSuccessRate,
            description: "consent dropped".to_string(),
            severity_hint: Severity::Warning,
            z_score: -4.2,
            observed_value: 70.0,
            baseline_mean: 95.0,
            first_seen: now() - ChronoDuration::minutes(45),
            detected_at: now() - ChronoDuration::minutes(5),
            expires_at: now() + ChronoDuration::minutes(55),
        }
    }

    #[test]
    fn test_unknown_status_is_rejected() {
        let unknown = assessment(0.0, HealthStatus::Unknown);
        let input = ForecastInput::new(&unknown, Horizon::DAY, now());
        let result = SignalForecaster::default().forecast(&input);
        assert!(matches!(result, Err(HealthError::NotForecastable { .. })));
    }

    #[test]
    fn test_status_only_forecast_is_low_confidence() {
        let forecaster = SignalForecaster::default();
        let healthy = assessment(9.0, HealthStatus::Healthy);
        let forecast = forecaster
            .forecast(&ForecastInput::new(&healthy, Horizon::DAY, now()))
            .unwrap();
        assert!((forecast.probability - 0.1).abs() < 1e-9);
        assert_eq!(forecast.confidence, Confidence::Low);
        assert!(forecast.signals.is_empty());
        assert_eq!(
            forecast.time_window,
            TimeWindow::Relative {
                label: "next 24 hours".to_string(),
                within_minutes: 24 * 60
            }
        );
    }

    #[test]
    fn test_pattern_narrows_window_and_raises_probability() {
        let forecaster = SignalForecaster::default();
        let healthy = assessment(8.5, HealthStatus::Healthy);
        let patterns = vec![sunday_maintenance()];
        let forecast = forecaster
            .forecast(&ForecastInput::new(&healthy, Horizon::DAY, now()).with_patterns(&patterns))
            .unwrap();

        assert!((forecast.probability - 0.4).abs() < 1e-9);
        assert_eq!(forecast.confidence, Confidence::Medium);
        let start = Utc.with_ymd_and_hms(2024, 3, 10, 2, 0, 0).unwrap();
        assert_eq!(
            forecast.time_window,
            TimeWindow::Absolute {
                start,
                end: start + ChronoDuration::hours(2)
            }
        );

        let short = forecaster
            .forecast(
                &ForecastInput::new(&healthy, Horizon::hours(6).unwrap(), now())
                    .with_patterns(&patterns),
            )
            .unwrap();
        assert!((short.probability - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_all_signals_give_high_confidence() {
        let forecaster = SignalForecaster::default();
        let degraded = assessment(5.0, HealthStatus::Degraded);
        let patterns = vec![sunday_maintenance()];
        let anomalies = vec![anomaly()];
        let forecast = forecaster
            .forecast(
                &ForecastInput::new(&degraded, Horizon::DAY, now())
                    .with_trend(Some(-1.5))
                    .with_patterns(&patterns)
                    .with_anomalies(&anomalies),
            )
            .unwrap();

        assert_eq!(forecast.confidence, Confidence::High);
        assert_eq!(forecast.signals.len(), 3);
        // 0.4 + 0.15 + 0.3 + 0.1
        assert!((forecast.probability - 0.95).abs() < 1e-9);
        assert!(forecast.reasoning.contains("falling 1.50 points per hour"));
        assert!(forecast.reasoning.contains("consent_success_rate (z=-4.2)"));
    }

    #[test]
    fn test_anomaly_only_forecast_is_low_confidence() {
        let forecaster = SignalForecaster::default();
        let healthy = assessment(8.0, HealthStatus::Healthy);
        let anomalies = vec![anomaly()];
        let forecast = forecaster
            .forecast(&ForecastInput::new(&healthy, Horizon::DAY, now()).with_anomalies(&anomalies))
            .unwrap();
        assert_eq!(forecast.confidence, Confidence::Low);
        assert!((forecast.probability - 0.2).abs() < 1e-9);

        let expired = vec![Anomaly {
            expires_at: now() - ChronoDuration::minutes(1),
            ..anomaly()
        }];
        let forecast = forecaster
            .forecast(&ForecastInput::new(&healthy, Horizon::DAY, now()).with_anomalies(&expired))
            .unwrap();
        assert!(forecast.signals.is_empty());
    }

    #[test]
    fn test_probability_is_clamped_and_high_needs_two_signals() {
        let forecaster = SignalForecaster::default();
        let patterns = vec![sunday_maintenance()];
        let anomalies = vec![anomaly(), Anomaly { metric: MetricKind::ErrorRate, ..anomaly() }];

        for status in [HealthStatus::Healthy, HealthStatus::Degraded, HealthStatus::Critical] {
            for trend in [None, Some(-5.0), Some(3.0)] {
                for with_pattern in [false, true] {
                    let current = assessment(5.0, status);
                    let mut input = ForecastInput::new(&current, Horizon::DAY, now())
                        .with_trend(trend)
                        .with_anomalies(&anomalies);
                    if with_pattern {
                        input = input.with_patterns(&patterns);
                    }
                    let forecast = forecaster.forecast(&input).unwrap();
                    assert!((0.0..=1.0).contains(&forecast.probability));
                    if forecast.confidence == Confidence::High {
                        assert!(forecast.signals.len() >= 2);
                    }
                }
            }
        }
    }

    #[test]
    fn test_critical_forecast_uses_urgent_window() {
        let critical = assessment(1.0, HealthStatus::Critical);
        let forecast = SignalForecaster::default()
            .forecast(&ForecastInput::new(&critical, Horizon::DAY, now()))
            .unwrap();
        assert_eq!(forecast.time_window.to_string(), "next 30 minutes");

        let healthy = assessment(9.0, HealthStatus::Healthy);
        let forecast = SignalForecaster::default()
            .forecast(&ForecastInput::new(&healthy, Horizon::hours(1).unwrap(), now()))
            .unwrap();
        assert_eq!(forecast.time_window.to_string(), "within the next 1h");
    }

    #[test]
    fn test_reasoning_is_reproducible() {
        let forecaster = SignalForecaster::default();
        let degraded = assessment(5.5, HealthStatus::Degraded);
        let anomalies = vec![anomaly()];
        let input = ForecastInput::new(&degraded, Horizon::DAY, now())
            .with_trend(Some(-0.8))
            .with_anomalies(&anomalies);
        let first = forecaster.forecast(&input).unwrap();
        let second = forecaster.forecast(&input).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_score_trend() {
        let samples: Vec<HealthAssessment> = (0..4)
            .map(|i| HealthAssessment {
                computed_at: now() + ChronoDuration::minutes(30 * i),
                score: 8.0 - i as f64,
                ..assessment(0.0, HealthStatus::Healthy)
            })
            .collect();
        let slope = score_trend(&samples).unwrap();
        assert!((slope + 2.0).abs() < 1e-9);
        assert_eq!(score_trend(&samples[..1]), None);
    }

    #[test]
    fn test_maintenance_outlook() {
        let mut peak = sunday_maintenance();
        peak.category = PatternCategory::PeakLoad;
        let patterns = vec![sunday_maintenance(), peak];

        let outlook = maintenance_outlook(&patterns, now(), 24);
        assert_eq!(outlook.len(), 24);
        let flagged: Vec<u32> = outlook
            .iter()
            .filter(|h| h.is_high_risk())
            .map(|h| h.hour_offset)
            .collect();
        // Saturday 12:00 + 14h = Sunday 02:00, window lasts two hours.
        assert_eq!(flagged, vec![14, 15]);
        assert_eq!(outlook[14].windows.len(), 1);
        assert_eq!(outlook[14].windows[0].category, PatternCategory::Maintenance);
    }
}
