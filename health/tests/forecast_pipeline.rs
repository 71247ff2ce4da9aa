use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc, Weekday};
use health::{
    score_trend, Confidence, DowntimeForecaster, FipProfile, ForecastInput, HealthScorer,
    HealthStatus, Horizon, ImpactEstimator, MetricSnapshot, PatternAnalyzer, PatternCategory,
    SignalForecaster, TimeWindow, WeightedScorer,
};

const FIP: &str = "icici-fip";

fn saturday_evening() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 30, 20, 0, 0).unwrap()
}

/// Four weeks of hourly samples with a Sunday 01:00-02:59 maintenance window.
fn history(now: DateTime<Utc>) -> Vec<MetricSnapshot> {
    let start = now - Duration::days(28);
    (0..28 * 24)
        .map(|h| {
            let at = start + Duration::hours(h);
            if at.weekday() == Weekday::Sun && (1..=2).contains(&at.hour()) {
                MetricSnapshot::new(FIP, at)
                    .with_consent_rate(2.0)
                    .with_data_fetch_rate(3.0)
                    .with_response_time(9.0)
                    .with_error_rate(95.0)
            } else {
                let wobble = (h % 3) as f64;
                MetricSnapshot::new(FIP, at)
                    .with_consent_rate(94.0 + wobble)
                    .with_data_fetch_rate(91.0 + wobble)
                    .with_response_time(1.2)
                    .with_error_rate(3.0)
                    .with_request_count(800)
            }
        })
        .collect()
}

#[test]
fn test_history_to_impact() {
    let now = saturday_evening();
    let samples = history(now);
    let scorer = WeightedScorer::default();

    let report = PatternAnalyzer::default().analyze(FIP, &samples, &scorer, now);
    assert_eq!(report.patterns.len(), 1);
    assert_eq!(report.patterns[0].category, PatternCategory::Maintenance);

    let current = scorer.assess(samples.last().unwrap());
    assert_eq!(current.status, HealthStatus::Healthy);

    let recent: Vec<_> = samples.iter().rev().take(6).map(|s| scorer.assess(s)).collect();
    let forecast = SignalForecaster::default()
        .forecast(
            &ForecastInput::new(&current, Horizon::DAY, now)
                .with_trend(score_trend(&recent))
                .with_patterns(&report.patterns)
                .with_anomalies(&report.anomalies),
        )
        .unwrap();

    match &forecast.time_window {
        TimeWindow::Absolute { start, end } => {
            assert_eq!(*start, Utc.with_ymd_and_hms(2024, 3, 31, 1, 0, 0).unwrap());
            assert_eq!(*end - *start, Duration::hours(2));
        }
        other => panic!("expected an absolute window, got {:?}", other),
    }
    assert_ne!(forecast.confidence, Confidence::High);
    assert!(forecast.reasoning.contains("maintenance window"));

    let profile = FipProfile::new(FIP, "ICICI Bank", 2800);
    let impact = ImpactEstimator::default().estimate(&forecast, &profile).unwrap();
    assert_eq!(
        impact.affected_users,
        (2800.0 * forecast.probability).round() as u64
    );
}

#[test]
fn test_forecasts_are_reproducible() {
    let now = saturday_evening();
    let samples = history(now);
    let scorer = WeightedScorer::default();
    let analyzer = PatternAnalyzer::default();
    let forecaster = SignalForecaster::default();

    let run = || {
        let report = analyzer.analyze(FIP, &samples, &scorer, now);
        let current = scorer.assess(samples.last().unwrap());
        forecaster
            .forecast(
                &ForecastInput::new(&current, Horizon::hours(12).unwrap(), now)
                    .with_patterns(&report.patterns),
            )
            .unwrap()
    };

    assert_eq!(run(), run());
}
