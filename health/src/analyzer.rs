//! Recurring pattern and anomaly detection over a FIP's metric history
//!
//! Patterns are found by bucketing samples into the 168 hours of the week and looking
//! for buckets that are degraded in most of the weeks they were observed. Anomalies
//! are runs of samples that sit far outside a rolling per-metric baseline.
//!
//! # Examples
//!
//! ```rust
//! use chrono::Utc;
//! use health::{AnalyzerConfig, PatternAnalyzer, WeightedScorer};
//!
//! let analyzer = PatternAnalyzer::new(AnalyzerConfig::default());
//! let report = analyzer.analyze("sbi-fip", &[], &WeightedScorer::default(), Utc::now());
//! assert!(report.patterns.is_empty());
//! assert!(report.anomalies.is_empty());
//! ```

use crate::config::AnalyzerConfig;
use crate::scorer::HealthScorer;
use crate::stats::{self, RollingStats};
use crate::types::{
    hour_of_week, Anomaly, MetricKind, MetricSnapshot, Pattern, PatternCategory, Recurrence,
    Severity, HOURS_PER_WEEK,
};
use chrono::{DateTime, Datelike, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub fip_id: String,
    pub patterns: Vec<Pattern>,
    pub anomalies: Vec<Anomaly>,
    pub samples_analyzed: usize,
    pub analyzed_at: DateTime<Utc>,
}

impl AnalysisReport {
    pub fn empty(fip_id: impl Into<String>, analyzed_at: DateTime<Utc>) -> Self {
        Self {
            fip_id: fip_id.into(),
            patterns: Vec::new(),
            anomalies: Vec::new(),
            samples_analyzed: 0,
            analyzed_at,
        }
    }

    pub fn active_anomalies(&self, now: DateTime<Utc>) -> Vec<Anomaly> {
        self.anomalies
            .iter()
            .filter(|a| a.is_active(now))
            .cloned()
            .collect()
    }
}

/// Mean metric values over a set of samples.
#[derive(Debug, Clone, Default)]
struct Signature {
    consent: Option<f64>,
    data_fetch: Option<f64>,
    response_time: Option<f64>,
    error_rate: Option<f64>,
    volume: Option<f64>,
}

impl Signature {
    fn of<'a>(samples: impl Iterator<Item = &'a MetricSnapshot> + Clone) -> Self {
        let metric_mean = |metric: MetricKind| {
            let values: Vec<f64> = samples
                .clone()
                .filter_map(|s| s.valid_value(metric))
                .collect();
            stats::mean(&values)
        };
        let volumes: Vec<f64> = samples.clone().map(|s| s.request_count as f64).collect();

        Self {
            consent: metric_mean(MetricKind::ConsentSuccessRate),
            data_fetch: metric_mean(MetricKind::DataFetchSuccessRate),
            response_time: metric_mean(MetricKind::AvgResponseTimeSeconds),
            error_rate: metric_mean(MetricKind::ErrorRate),
            volume: stats::mean(&volumes),
        }
    }
}

fn relative_drop(baseline: Option<f64>, observed: Option<f64>) -> f64 {
    match (baseline, observed) {
        (Some(base), Some(value)) if base > 0.0 => ((base - value) / base).max(0.0),
        _ => 0.0,
    }
}

#[derive(Default)]
struct Bucket<'a> {
    observed_weeks: BTreeSet<(i32, u32)>,
    degraded_weeks: BTreeSet<(i32, u32)>,
    degraded: Vec<&'a MetricSnapshot>,
}

#[derive(Debug, Clone)]
struct RecurringBucket {
    index: usize,
    category: PatternCategory,
    magnitude: f64,
    frequency: f64,
    degraded_weeks: usize,
    observed_weeks: usize,
}

#[derive(Debug, Clone)]
struct OutlierRun {
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    samples: usize,
    peak_z: f64,
    value: f64,
    baseline_mean: f64,
}

#[derive(Debug, Clone, Default)]
pub struct PatternAnalyzer {
    config: AnalyzerConfig,
}

impl PatternAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn history_window(&self) -> ChronoDuration {
        ChronoDuration::days(i64::from(self.config.history_days))
    }

    /// Analyze the trailing history window ending at `now`. Samples for other FIPs or
    /// outside the window are ignored.
    pub fn analyze(
        &self,
        fip_id: &str,
        history: &[MetricSnapshot],
        scorer: &dyn HealthScorer,
        now: DateTime<Utc>,
    ) -> AnalysisReport {
        let since = now - self.history_window();
        let mut samples: Vec<&MetricSnapshot> = history
            .iter()
            .filter(|s| s.fip_id == fip_id && s.timestamp >= since && s.timestamp <= now)
            .collect();
        samples.sort_by_key(|s| s.timestamp);

        let patterns = self.detect_patterns(fip_id, &samples, scorer);
        let anomalies = self.detect_anomalies(fip_id, &samples, now);

        debug!(
            "Analyzed {} samples for {}: {} patterns, {} active anomalies",
            samples.len(),
            fip_id,
            patterns.len(),
            anomalies.len()
        );

        AnalysisReport {
            fip_id: fip_id.to_string(),
            patterns,
            anomalies,
            samples_analyzed: samples.len(),
            analyzed_at: now,
        }
    }

    fn detect_patterns(
        &self,
        fip_id: &str,
        samples: &[&MetricSnapshot],
        scorer: &dyn HealthScorer,
    ) -> Vec<Pattern> {
        let mut buckets: Vec<Bucket<'_>> =
            (0..HOURS_PER_WEEK).map(|_| Bucket::default()).collect();
        let mut healthy: Vec<&MetricSnapshot> = Vec::new();

        for sample in samples {
            let assessment = scorer.assess(sample);
            if !assessment.status.is_evaluable() {
                continue;
            }

            let iso = sample.timestamp.iso_week();
            let week = (iso.year(), iso.week());
            let bucket = &mut buckets[hour_of_week(sample.timestamp)];
            bucket.observed_weeks.insert(week);

            if assessment.status.is_degraded() {
                bucket.degraded_weeks.insert(week);
                bucket.degraded.push(sample);
            } else {
                healthy.push(sample);
            }
        }

        let baseline = if healthy.is_empty() {
            Signature::of(samples.iter().copied())
        } else {
            Signature::of(healthy.iter().copied())
        };

        let recurring: Vec<RecurringBucket> = buckets
            .iter()
            .enumerate()
            .filter_map(|(index, bucket)| self.recurring_bucket(index, bucket, &baseline))
            .collect();

        merge_contiguous(recurring)
            .into_iter()
            .map(|group| build_pattern(fip_id, &group))
            .collect()
    }

    fn recurring_bucket(
        &self,
        index: usize,
        bucket: &Bucket<'_>,
        baseline: &Signature,
    ) -> Option<RecurringBucket> {
        let observed = bucket.observed_weeks.len();
        if observed < self.config.min_observed_weeks || bucket.degraded.is_empty() {
            return None;
        }

        let frequency = bucket.degraded_weeks.len() as f64 / observed as f64;
        if frequency < self.config.recurrence_threshold {
            return None;
        }

        let signature = Signature::of(bucket.degraded.iter().copied());
        let (category, magnitude) = self.categorize(baseline, &signature);

        Some(RecurringBucket {
            index,
            category,
            magnitude,
            frequency,
            degraded_weeks: bucket.degraded_weeks.len(),
            observed_weeks: observed,
        })
    }

    /// Category whose signature deviates most from the baseline. Earlier candidates win ties.
    fn categorize(&self, baseline: &Signature, observed: &Signature) -> (PatternCategory, f64) {
        let consent_drop = relative_drop(baseline.consent, observed.consent);
        let data_drop = relative_drop(baseline.data_fetch, observed.data_fetch);
        let volume_drop = relative_drop(baseline.volume, observed.volume);
        let response_rise = match (baseline.response_time, observed.response_time) {
            (Some(base), Some(value)) if base > 0.0 => ((value - base) / base).max(0.0),
            _ => 0.0,
        };
        let error_rise = match (baseline.error_rate, observed.error_rate) {
            (Some(base), Some(value)) => ((value - base) / 100.0).max(0.0),
            _ => 0.0,
        };
        let response_magnitude = response_rise / (1.0 + response_rise);
        let floored = consent_drop >= self.config.floor_drop && data_drop >= self.config.floor_drop;
        let volume_collapsed = volume_drop >= self.config.volume_drop;

        let mut candidates: Vec<(PatternCategory, f64)> = Vec::new();

        if floored {
            candidates.push((PatternCategory::Maintenance, (consent_drop + data_drop) / 2.0));
        }

        if response_rise >= self.config.spike_factor && !volume_collapsed {
            candidates.push((PatternCategory::PeakLoad, response_magnitude));
        }

        let declining: Vec<f64> = [consent_drop, data_drop, error_rise]
            .into_iter()
            .filter(|d| *d >= self.config.decline_threshold)
            .collect();
        if declining.len() == 1 {
            candidates.push((PatternCategory::Degradation, declining[0]));
        }

        if volume_collapsed
            && consent_drop < self.config.floor_drop
            && data_drop < self.config.floor_drop
        {
            candidates.push((PatternCategory::Backup, volume_drop));
        }

        let mut candidates = candidates.into_iter();
        let Some(mut best) = candidates.next() else {
            let strongest = consent_drop
                .max(data_drop)
                .max(error_rise)
                .max(response_magnitude);
            return (PatternCategory::Degradation, strongest);
        };
        for candidate in candidates {
            if candidate.1 > best.1 {
                best = candidate;
            }
        }
        best
    }

    fn detect_anomalies(
        &self,
        fip_id: &str,
        samples: &[&MetricSnapshot],
        now: DateTime<Utc>,
    ) -> Vec<Anomaly> {
        let ttl = ChronoDuration::minutes(i64::from(self.config.anomaly_ttl_minutes));
        let k = self.config.anomaly_z_threshold;

        MetricKind::ALL
            .iter()
            .filter_map(|metric| {
                let run = self.latest_confirmed_run(*metric, samples)?;
                let expires_at = run.last_seen + ttl;
                if expires_at <= now {
                    return None;
                }

                let direction = if run.peak_z > 0.0 { "above" } else { "below" };
                let severity_hint = if run.peak_z.abs() >= 2.0 * k {
                    Severity::Critical
                } else {
                    Severity::Warning
                };

                Some(Anomaly {
                    fip_id: fip_id.to_string(),
                    metric: *metric,
                    description: format!(
                        "{} at {:.2} is {:.1} standard deviations {} its rolling baseline of {:.2} for {} consecutive samples",
                        metric,
                        run.value,
                        run.peak_z.abs(),
                        direction,
                        run.baseline_mean,
                        run.samples
                    ),
                    severity_hint,
                    z_score: run.peak_z,
                    observed_value: run.value,
                    baseline_mean: run.baseline_mean,
                    first_seen: run.first_seen,
                    detected_at: run.last_seen,
                    expires_at,
                })
            })
            .collect()
    }

    /// Most recent run of outliers that reached the consecutive-sample requirement.
    /// Outliers never feed the baseline.
    fn latest_confirmed_run(
        &self,
        metric: MetricKind,
        samples: &[&MetricSnapshot],
    ) -> Option<OutlierRun> {
        let mut baseline = RollingStats::new(self.config.baseline_window);
        let mut current: Option<OutlierRun> = None;
        let mut confirmed: Option<OutlierRun> = None;

        for sample in samples {
            let Some(value) = sample.valid_value(metric) else {
                continue;
            };

            if baseline.len() >= self.config.min_baseline_samples {
                let z = baseline.z_score(value);
                if z.abs() > self.config.anomaly_z_threshold {
                    let run = current.get_or_insert_with(|| OutlierRun {
                        first_seen: sample.timestamp,
                        last_seen: sample.timestamp,
                        samples: 0,
                        peak_z: z,
                        value,
                        baseline_mean: baseline.mean(),
                    });
                    run.samples += 1;
                    run.last_seen = sample.timestamp;
                    run.value = value;
                    if z.abs() > run.peak_z.abs() {
                        run.peak_z = z;
                    }
                    if run.samples >= self.config.anomaly_consecutive_samples {
                        confirmed = Some(run.clone());
                    }
                    continue;
                }
            }

            current = None;
            baseline.push(value);
        }

        confirmed
    }
}

/// Groups hour-adjacent buckets of the same category, including across the Sunday/Monday boundary.
fn merge_contiguous(buckets: Vec<RecurringBucket>) -> Vec<Vec<RecurringBucket>> {
    let mut groups: Vec<Vec<RecurringBucket>> = Vec::new();

    for bucket in buckets {
        let extends = groups
            .last()
            .and_then(|group| group.last())
            .map(|prev| prev.index + 1 == bucket.index && prev.category == bucket.category)
            .unwrap_or(false);
        if extends {
            if let Some(group) = groups.last_mut() {
                group.push(bucket);
            }
        } else {
            groups.push(vec![bucket]);
        }
    }

    if groups.len() > 1 {
        let head = &groups[0][0];
        let tail = &groups[groups.len() - 1];
        let tail = &tail[tail.len() - 1];
        let wraps =
            head.index == 0 && tail.index == HOURS_PER_WEEK - 1 && head.category == tail.category;
        if wraps {
            let head = groups.remove(0);
            if let Some(last) = groups.last_mut() {
                last.extend(head);
            }
        }
    }

    groups
}

fn build_pattern(fip_id: &str, group: &[RecurringBucket]) -> Pattern {
    let first = &group[0];
    let hours = group.len();
    let frequency = group.iter().map(|b| b.frequency).sum::<f64>() / hours as f64;
    let deviation = group.iter().map(|b| b.magnitude).fold(0.0_f64, f64::max);
    let recurrence = Recurrence::weekly_from_bucket(first.index);

    Pattern {
        fip_id: fip_id.to_string(),
        category: first.category,
        description: format!(
            "Recurring {} {} lasting about {}h (degraded in {} of {} observed weeks)",
            first.category.describe(),
            recurrence,
            hours,
            first.degraded_weeks,
            first.observed_weeks
        ),
        recurrence,
        typical_duration: Duration::from_secs(hours as u64 * 3600),
        frequency,
        deviation,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scorer::WeightedScorer;
    use chrono::{TimeZone, Timelike, Weekday};

    fn healthy_sample(fip: &str, at: DateTime<Utc>, i: usize) -> MetricSnapshot {
        let wobble = (i % 5) as f64 - 2.0;
        MetricSnapshot::new(fip, at)
            .with_consent_rate(95.0 + wobble * 0.5)
            .with_data_fetch_rate(92.0 + wobble * 0.4)
            .with_response_time(1.0 + wobble * 0.05)
            .with_error_rate(2.0)
            .with_request_count(1000)
    }

    fn hourly_history(
        fip: &str,
        now: DateTime<Utc>,
        days: i64,
        mut degrade: impl FnMut(DateTime<Utc>) -> Option<MetricSnapshot>,
    ) -> Vec<MetricSnapshot> {
        let start = now - ChronoDuration::days(days);
        (0..days * 24)
            .map(|h| {
                let at = start + ChronoDuration::hours(h);
                degrade(at).unwrap_or_else(|| healthy_sample(fip, at, h as usize))
            })
            .collect()
    }

    fn sunday_noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 31, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_detects_weekly_maintenance_window() {
        let now = sunday_noon();
        let history = hourly_history("sbi-fip", now, 28, |at| {
            let in_window = at.weekday() == Weekday::Sun && (2..=4).contains(&at.hour());
            in_window.then(|| {
                MetricSnapshot::new("sbi-fip", at)
                    .with_consent_rate(5.0)
                    .with_data_fetch_rate(5.0)
                    .with_response_time(8.0)
                    .with_error_rate(80.0)
                    .with_request_count(0)
            })
        });

        let analyzer = PatternAnalyzer::default();
        let report = analyzer.analyze("sbi-fip", &history, &WeightedScorer::default(), now);

        assert_eq!(report.patterns.len(), 1);
        let pattern = &report.patterns[0];
        assert_eq!(pattern.category, PatternCategory::Maintenance);
        assert_eq!(
            pattern.recurrence,
            Recurrence::Weekly {
                weekday: Weekday::Sun,
                start_hour: 2
            }
        );
        assert_eq!(pattern.typical_duration, Duration::from_secs(3 * 3600));
        assert!((pattern.frequency - 1.0).abs() < 1e-9);
        assert!(pattern.description.contains("maintenance window"));
    }

    #[test]
    fn test_peak_load_requires_recurrence_threshold() {
        let now = sunday_noon();
        let mut mondays = 0;
        let mut tuesdays = 0;
        let history = hourly_history("hdfc-fip", now, 28, |at| {
            let slow = || {
                MetricSnapshot::new("hdfc-fip", at)
                    .with_consent_rate(80.0)
                    .with_data_fetch_rate(75.0)
                    .with_response_time(9.5)
                    .with_error_rate(10.0)
                    .with_request_count(1500)
            };
            if at.weekday() == Weekday::Mon && at.hour() == 10 {
                mondays += 1;
                // Three of the four observed Mondays.
                (mondays != 2).then(slow)
            } else if at.weekday() == Weekday::Tue && at.hour() == 15 {
                tuesdays += 1;
                // Two of the four observed Tuesdays.
                (tuesdays % 2 == 0).then(slow)
            } else {
                None
            }
        });

        let report = PatternAnalyzer::default().analyze(
            "hdfc-fip",
            &history,
            &WeightedScorer::default(),
            now,
        );

        assert_eq!(report.patterns.len(), 1);
        let pattern = &report.patterns[0];
        assert_eq!(pattern.category, PatternCategory::PeakLoad);
        assert_eq!(pattern.recurrence.bucket(), 10);
        assert!((pattern.frequency - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_single_week_is_not_a_pattern() {
        let now = sunday_noon();
        let history = hourly_history("axis-fip", now, 6, |at| {
            (at.weekday() == Weekday::Wed && at.hour() == 3).then(|| {
                MetricSnapshot::new("axis-fip", at)
                    .with_consent_rate(1.0)
                    .with_data_fetch_rate(1.0)
            })
        });

        let report = PatternAnalyzer::default().analyze(
            "axis-fip",
            &history,
            &WeightedScorer::default(),
            now,
        );
        assert!(report.patterns.is_empty());
    }

    fn anomaly_series(now: DateTime<Utc>, outliers: usize) -> Vec<MetricSnapshot> {
        let total = 30;
        (0..total)
            .map(|i| {
                let at = now - ChronoDuration::minutes(15 * (total - i) as i64);
                let consent = if i >= total - outliers {
                    60.0
                } else if i % 2 == 0 {
                    95.0
                } else {
                    96.0
                };
                MetricSnapshot::new("icici-fip", at)
                    .with_consent_rate(consent)
                    .with_data_fetch_rate(90.0)
            })
            .collect()
    }

    #[test]
    fn test_anomaly_needs_consecutive_samples() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        let analyzer = PatternAnalyzer::default();
        let scorer = WeightedScorer::default();

        let report = analyzer.analyze("icici-fip", &anomaly_series(now, 3), &scorer, now);
        assert_eq!(report.anomalies.len(), 1);
        let anomaly = &report.anomalies[0];
        assert_eq!(anomaly.metric, MetricKind::ConsentSuccessRate);
        assert_eq!(anomaly.severity_hint, Severity::Critical);
        assert!(anomaly.z_score < 0.0);
        assert_eq!(anomaly.detected_at, now - ChronoDuration::minutes(15));
        assert_eq!(anomaly.expires_at, anomaly.detected_at + ChronoDuration::minutes(60));

        let report = analyzer.analyze("icici-fip", &anomaly_series(now, 2), &scorer, now);
        assert!(report.anomalies.is_empty());
    }

    #[test]
    fn test_anomaly_expires_after_ttl() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        let history = anomaly_series(now, 4);
        let analyzer = PatternAnalyzer::default();
        let scorer = WeightedScorer::default();

        let later = now + ChronoDuration::minutes(50);
        let report = analyzer.analyze("icici-fip", &history, &scorer, later);
        assert!(report.anomalies.is_empty());
        assert!(report.active_anomalies(later).is_empty());
    }

    #[test]
    fn test_ignores_other_fips() {
        let now = Utc.with_ymd_and_hms(2024, 3, 5, 9, 0, 0).unwrap();
        let report = PatternAnalyzer::default().analyze(
            "kotak-fip",
            &anomaly_series(now, 3),
            &WeightedScorer::default(),
            now,
        );
        assert_eq!(report.samples_analyzed, 0);
    }

    #[test]
    fn test_contiguous_buckets_wrap_the_week() {
        let bucket = |index| RecurringBucket {
            index,
            category: PatternCategory::Backup,
            magnitude: 0.8,
            frequency: 1.0,
            degraded_weeks: 3,
            observed_weeks: 3,
        };
        let groups = merge_contiguous(vec![bucket(0), bucket(1), bucket(100), bucket(167)]);
        assert_eq!(groups.len(), 2);
        let wrapped = &groups[1];
        assert_eq!(
            wrapped.iter().map(|b| b.index).collect::<Vec<_>>(),
            vec![167, 0, 1]
        );
        assert_eq!(build_pattern("x", wrapped).recurrence.bucket(), 167);
    }
}
