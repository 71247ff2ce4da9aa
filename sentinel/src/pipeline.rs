//! Per-FIP evaluation pipeline
//!
//! One evaluation fetches the latest snapshot, scores it and feeds the alert engine.
//! A full evaluation additionally fetches the history window, re-runs pattern and
//! anomaly analysis and recomputes the forecast and impact estimate. FIPs are evaluated
//! concurrently with a bounded width; a failing FIP is skipped for the cycle and keeps
//! its last known good state.

use crate::alerts::{AlertEngine, AlertError, AlertTransition, FipEvaluation};
use crate::store::{MetricStore, StoreError};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use health::{
    maintenance_outlook, score_trend, AnalysisReport, Anomaly, DowntimeForecaster, FipProfile,
    Forecast, ForecastInput, HealthAssessment, HealthError, HealthScorer, HealthStatus, Horizon,
    HourlyOutlook, ImpactEstimate, ImpactEstimator, MetricSnapshot, Pattern, PatternAnalyzer,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Unknown FIP: {fip_id}")]
    UnknownFip { fip_id: String },

    #[error("No metrics available for {fip_id}")]
    NoData { fip_id: String },

    #[error("Metric store error for {fip_id}: {source}")]
    Store {
        fip_id: String,
        #[source]
        source: StoreError,
    },

    #[error(transparent)]
    Health(#[from] HealthError),

    #[error(transparent)]
    Alert(#[from] AlertError),
}

pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// FIPs evaluated at the same time
    pub max_concurrent_fips: usize,
    /// How far back recent snapshots are kept for instability and averages
    pub recent_window_minutes: u32,
    /// Upper bound on recent snapshots kept per FIP
    pub max_recent_samples: usize,
    /// Recent assessments used for the score trend
    pub trend_samples: usize,
    /// Horizon used by the scheduled prediction refresh
    pub default_horizon: Horizon,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_fips: 8,
            recent_window_minutes: 180,
            max_recent_samples: 256,
            trend_samples: 12,
            default_horizon: Horizon::DAY,
        }
    }
}

impl PipelineConfig {
    pub fn with_concurrency(mut self, max_concurrent_fips: usize) -> Self {
        self.max_concurrent_fips = max_concurrent_fips;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_fips == 0 {
            return Err("FIP concurrency must be greater than 0".to_string());
        }

        if self.max_recent_samples == 0 || self.trend_samples == 0 {
            return Err("Recent sample bounds must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Score and alert using cached analysis
    Metrics,
    /// Refresh history, analysis, forecast and impact, then alert
    Full,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Metrics => f.write_str("metrics"),
            Stage::Full => f.write_str("full"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastEntry {
    pub forecast: Forecast,
    pub impact: ImpactEstimate,
}

#[derive(Debug, Default)]
struct FipState {
    recent: Vec<MetricSnapshot>,
    assessments: Vec<HealthAssessment>,
    last_good: Option<HealthAssessment>,
    analysis: Option<AnalysisReport>,
    last_error: Option<String>,
    last_evaluated: Option<DateTime<Utc>>,
}

/// Read-only view of one FIP's evaluation state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FipStatus {
    pub profile: FipProfile,
    /// Latest assessment, `None` until the FIP was evaluated once
    pub assessment: Option<HealthAssessment>,
    /// Latest assessment that could be evaluated
    pub last_good: Option<HealthAssessment>,
    pub forecast: Option<ForecastEntry>,
    pub patterns: Vec<Pattern>,
    pub active_anomalies: Vec<Anomaly>,
    pub last_evaluated: Option<DateTime<Utc>>,
    /// Why the last evaluation was skipped, if it was
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FipCycle {
    pub fip_id: String,
    pub assessment: HealthAssessment,
    pub forecast: Option<Forecast>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedFip {
    pub fip_id: String,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub stage: Stage,
    pub started_at: DateTime<Utc>,
    pub evaluated: Vec<FipCycle>,
    pub skipped: Vec<SkippedFip>,
    pub transitions: Vec<AlertTransition>,
}

impl CycleReport {
    /// Transitions subscribers should hear about.
    pub fn notifications(&self) -> impl Iterator<Item = &AlertTransition> {
        self.transitions.iter().filter(|t| t.should_notify())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FipPrediction {
    pub fip_id: String,
    pub bank_name: String,
    pub assessment: HealthAssessment,
    pub forecast: Forecast,
    pub impact: ImpactEstimate,
    pub patterns: Vec<Pattern>,
    pub anomalies: Vec<Anomaly>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionReport {
    pub horizon: Horizon,
    pub generated_at: DateTime<Utc>,
    pub predictions: Vec<FipPrediction>,
    /// FIPs that could not be evaluated, with the reason
    pub unavailable: Vec<SkippedFip>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FipOutlook {
    pub fip_id: String,
    pub bank_name: String,
    pub hours: Vec<HourlyOutlook>,
}

pub struct Pipeline {
    store: Arc<dyn MetricStore>,
    scorer: Arc<dyn HealthScorer>,
    analyzer: PatternAnalyzer,
    forecaster: Arc<dyn DowntimeForecaster>,
    impact: ImpactEstimator,
    alerts: Arc<AlertEngine>,
    profiles: BTreeMap<String, FipProfile>,
    states: Mutex<HashMap<String, FipState>>,
    forecasts: RwLock<HashMap<(String, Horizon), ForecastEntry>>,
    config: PipelineConfig,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MetricStore>,
        scorer: Arc<dyn HealthScorer>,
        analyzer: PatternAnalyzer,
        forecaster: Arc<dyn DowntimeForecaster>,
        impact: ImpactEstimator,
        alerts: Arc<AlertEngine>,
        profiles: impl IntoIterator<Item = FipProfile>,
        config: PipelineConfig,
    ) -> Self {
        let profiles = profiles
            .into_iter()
            .map(|p| (p.fip_id.clone(), p))
            .collect();

        Self {
            store,
            scorer,
            analyzer,
            forecaster,
            impact,
            alerts,
            profiles,
            states: Mutex::new(HashMap::new()),
            forecasts: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn profiles(&self) -> impl Iterator<Item = &FipProfile> {
        self.profiles.values()
    }

    pub fn profile(&self, fip_id: &str) -> PipelineResult<&FipProfile> {
        self.profiles
            .get(fip_id)
            .ok_or_else(|| PipelineError::UnknownFip {
                fip_id: fip_id.to_string(),
            })
    }

    pub fn alerts(&self) -> &Arc<AlertEngine> {
        &self.alerts
    }

    fn store_error(fip_id: &str) -> impl FnOnce(StoreError) -> PipelineError + '_ {
        move |source| PipelineError::Store {
            fip_id: fip_id.to_string(),
            source,
        }
    }

    /// Evaluate every configured FIP. Failures are isolated per FIP.
    pub async fn evaluate_all(&self, stage: Stage, now: DateTime<Utc>) -> CycleReport {
        let permits = Semaphore::new(self.config.max_concurrent_fips.max(1));
        let results = join_all(self.profiles.values().map(|profile| {
            let permits = &permits;
            async move {
                let _permit = permits.acquire().await;
                (
                    profile.fip_id.clone(),
                    self.evaluate_fip(profile, stage, now).await,
                )
            }
        }))
        .await;

        let mut report = CycleReport {
            stage,
            started_at: now,
            evaluated: Vec::new(),
            skipped: Vec::new(),
            transitions: Vec::new(),
        };

        for (fip_id, result) in results {
            match result {
                Ok((cycle, transitions)) => {
                    report.evaluated.push(cycle);
                    report.transitions.extend(transitions);
                }
                Err(e) => {
                    warn!("Skipping {} for this {} cycle: {}", fip_id, stage, e);
                    self.with_state(&fip_id, |state| state.last_error = Some(e.to_string()));
                    report.skipped.push(SkippedFip {
                        fip_id,
                        reason: e.to_string(),
                    });
                }
            }
        }

        report.evaluated.sort_by(|a, b| a.fip_id.cmp(&b.fip_id));
        report.skipped.sort_by(|a, b| a.fip_id.cmp(&b.fip_id));
        info!(
            "{} cycle finished: {} evaluated, {} skipped, {} alert transition(s)",
            stage,
            report.evaluated.len(),
            report.skipped.len(),
            report.transitions.len()
        );
        report
    }

    /// Evaluate a single FIP. State is only updated once every fetch has succeeded.
    pub async fn evaluate_fip(
        &self,
        profile: &FipProfile,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> PipelineResult<(FipCycle, Vec<AlertTransition>)> {
        let fip_id = profile.fip_id.as_str();
        let (snapshot, assessment) = self.refresh(profile, stage, now).await?;
        let (recent, trend, analysis) = self.with_state(fip_id, |state| {
            (
                state.recent.clone(),
                self.trend(state),
                state
                    .analysis
                    .clone()
                    .unwrap_or_else(|| AnalysisReport::empty(fip_id, now)),
            )
        });

        let horizon = self.config.default_horizon;
        if stage == Stage::Full {
            match self.forecast_entry(profile, &assessment, trend, &analysis, horizon, now) {
                Ok(entry) => self.store_forecast(fip_id, horizon, entry),
                Err(e) => {
                    debug!("No forecast for {}: {}", fip_id, e);
                    self.clear_forecast(fip_id, horizon);
                }
            }
        }

        let entry = self.forecast(fip_id, horizon);
        let anomalies = analysis.active_anomalies(now);
        let evaluation = FipEvaluation::new(profile, &snapshot, &assessment, now)
            .with_forecast(
                entry.as_ref().map(|e| &e.forecast),
                entry.as_ref().map(|e| &e.impact),
            )
            .with_analysis(&analysis.patterns, &anomalies)
            .with_recent(&recent);
        let transitions = self.alerts.evaluate(&evaluation)?;

        Ok((
            FipCycle {
                fip_id: fip_id.to_string(),
                assessment,
                forecast: entry.map(|e| e.forecast),
            },
            transitions,
        ))
    }

    /// Fetch, score and (for a full stage) analyze one FIP, then record the results.
    async fn refresh(
        &self,
        profile: &FipProfile,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> PipelineResult<(MetricSnapshot, HealthAssessment)> {
        let fip_id = profile.fip_id.as_str();
        let snapshot = self
            .store
            .latest(fip_id)
            .await
            .map_err(Self::store_error(fip_id))?
            .ok_or_else(|| PipelineError::NoData {
                fip_id: fip_id.to_string(),
            })?;

        let analysis = match stage {
            Stage::Full => {
                let history = self
                    .store
                    .history(fip_id, now - self.analyzer.history_window(), now)
                    .await
                    .map_err(Self::store_error(fip_id))?;
                let report = self
                    .analyzer
                    .analyze(fip_id, &history, self.scorer.as_ref(), now);
                debug!(
                    "Analyzed {} samples for {}: {} pattern(s), {} anomalies",
                    report.samples_analyzed,
                    fip_id,
                    report.patterns.len(),
                    report.anomalies.len()
                );
                Some(report)
            }
            Stage::Metrics => None,
        };

        let assessment = self.scorer.assess(&snapshot);
        self.with_state(fip_id, |state| {
            if let Some(report) = analysis {
                state.analysis = Some(report);
            }
            self.remember(state, &snapshot, &assessment, now);
            state.last_error = None;
            state.last_evaluated = Some(now);
        });

        Ok((snapshot, assessment))
    }

    fn cached_inputs(
        &self,
        fip_id: &str,
    ) -> Option<(HealthAssessment, Option<f64>, Option<AnalysisReport>)> {
        self.with_state(fip_id, |state| {
            let assessment = state.assessments.last()?.clone();
            Some((assessment, self.trend(state), state.analysis.clone()))
        })
    }

    fn trend(&self, state: &FipState) -> Option<f64> {
        let from = state
            .assessments
            .len()
            .saturating_sub(self.config.trend_samples);
        score_trend(&state.assessments[from..])
    }

    fn with_state<T>(&self, fip_id: &str, f: impl FnOnce(&mut FipState) -> T) -> T {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        f(states.entry(fip_id.to_string()).or_default())
    }

    fn remember(
        &self,
        state: &mut FipState,
        snapshot: &MetricSnapshot,
        assessment: &HealthAssessment,
        now: DateTime<Utc>,
    ) {
        let is_new = state
            .recent
            .last()
            .map_or(true, |last| last.timestamp < snapshot.timestamp);
        if is_new {
            state.recent.push(snapshot.clone());
            state.assessments.push(assessment.clone());
        }

        let cutoff = now - ChronoDuration::minutes(i64::from(self.config.recent_window_minutes));
        let stale = state
            .recent
            .iter()
            .take_while(|s| s.timestamp < cutoff)
            .count()
            .max(state.recent.len().saturating_sub(self.config.max_recent_samples));
        state.recent.drain(..stale);

        let excess = state
            .assessments
            .len()
            .saturating_sub(self.config.max_recent_samples);
        state.assessments.drain(..excess);

        if assessment.status.is_evaluable() {
            state.last_good = Some(assessment.clone());
        }
    }

    fn forecast_entry(
        &self,
        profile: &FipProfile,
        assessment: &HealthAssessment,
        trend: Option<f64>,
        analysis: &AnalysisReport,
        horizon: Horizon,
        now: DateTime<Utc>,
    ) -> PipelineResult<ForecastEntry> {
        let anomalies = analysis.active_anomalies(now);
        let forecast = self.forecaster.forecast(
            &ForecastInput::new(assessment, horizon, now)
                .with_trend(trend)
                .with_patterns(&analysis.patterns)
                .with_anomalies(&anomalies),
        )?;
        let impact = self.impact.estimate(&forecast, profile)?;
        Ok(ForecastEntry { forecast, impact })
    }

    fn store_forecast(&self, fip_id: &str, horizon: Horizon, entry: ForecastEntry) {
        let mut forecasts = self.forecasts.write().unwrap_or_else(PoisonError::into_inner);
        forecasts.insert((fip_id.to_string(), horizon), entry);
    }

    fn clear_forecast(&self, fip_id: &str, horizon: Horizon) {
        let mut forecasts = self.forecasts.write().unwrap_or_else(PoisonError::into_inner);
        forecasts.remove(&(fip_id.to_string(), horizon));
    }

    /// Current forecast for `(fip_id, horizon)`, if one was computed.
    pub fn forecast(&self, fip_id: &str, horizon: Horizon) -> Option<ForecastEntry> {
        let forecasts = self.forecasts.read().unwrap_or_else(PoisonError::into_inner);
        forecasts.get(&(fip_id.to_string(), horizon)).cloned()
    }

    /// Forecast the requested FIPs (all when empty) for `horizon`. FIPs that cannot be
    /// evaluated are listed in `unavailable` rather than failing the request.
    pub async fn predict(
        &self,
        fip_ids: &[String],
        horizon: Horizon,
        now: DateTime<Utc>,
    ) -> PredictionReport {
        let requested: Vec<String> = if fip_ids.is_empty() {
            self.profiles.keys().cloned().collect()
        } else {
            fip_ids.to_vec()
        };

        let permits = Semaphore::new(self.config.max_concurrent_fips.max(1));
        let results = join_all(requested.into_iter().map(|fip_id| {
            let permits = &permits;
            async move {
                let _permit = permits.acquire().await;
                let result = self.predict_fip(&fip_id, horizon, now).await;
                (fip_id, result)
            }
        }))
        .await;

        let mut report = PredictionReport {
            horizon,
            generated_at: now,
            predictions: Vec::new(),
            unavailable: Vec::new(),
        };
        for (fip_id, result) in results {
            match result {
                Ok(prediction) => report.predictions.push(prediction),
                Err(e) => {
                    debug!("Prediction unavailable for {}: {}", fip_id, e);
                    report.unavailable.push(SkippedFip {
                        fip_id,
                        reason: e.to_string(),
                    });
                }
            }
        }
        report
    }

    async fn predict_fip(
        &self,
        fip_id: &str,
        horizon: Horizon,
        now: DateTime<Utc>,
    ) -> PipelineResult<FipPrediction> {
        let profile = self.profile(fip_id)?;
        let (assessment, trend, analysis) = match self.cached_inputs(fip_id) {
            Some((assessment, trend, Some(analysis))) => (assessment, trend, analysis),
            _ => {
                // Never analyzed: refresh without touching alert state.
                self.refresh(profile, Stage::Full, now).await?;
                let (assessment, trend, analysis) =
                    self.cached_inputs(fip_id)
                        .ok_or_else(|| PipelineError::NoData {
                            fip_id: fip_id.to_string(),
                        })?;
                (
                    assessment,
                    trend,
                    analysis.unwrap_or_else(|| AnalysisReport::empty(fip_id, now)),
                )
            }
        };

        let entry = self.forecast_entry(profile, &assessment, trend, &analysis, horizon, now)?;
        self.store_forecast(fip_id, horizon, entry.clone());

        Ok(FipPrediction {
            fip_id: fip_id.to_string(),
            bank_name: profile.bank_name.clone(),
            assessment,
            forecast: entry.forecast,
            impact: entry.impact,
            anomalies: analysis.active_anomalies(now),
            patterns: analysis.patterns,
        })
    }

    pub fn status(&self, fip_id: &str, now: DateTime<Utc>) -> PipelineResult<FipStatus> {
        let profile = self.profile(fip_id)?.clone();
        let forecast = self.forecast(fip_id, self.config.default_horizon);
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        let state = states.get(fip_id);

        Ok(FipStatus {
            profile,
            assessment: state.and_then(|s| s.assessments.last().cloned()),
            last_good: state.and_then(|s| s.last_good.clone()),
            forecast,
            patterns: state
                .and_then(|s| s.analysis.as_ref())
                .map(|a| a.patterns.clone())
                .unwrap_or_default(),
            active_anomalies: state
                .and_then(|s| s.analysis.as_ref())
                .map(|a| a.active_anomalies(now))
                .unwrap_or_default(),
            last_evaluated: state.and_then(|s| s.last_evaluated),
            last_error: state.and_then(|s| s.last_error.clone()),
        })
    }

    pub fn statuses(&self, now: DateTime<Utc>) -> Vec<FipStatus> {
        self.profiles
            .keys()
            .filter_map(|fip_id| self.status(fip_id, now).ok())
            .collect()
    }

    /// Planned-outage outlook for the next `hours` hours, per FIP.
    pub fn maintenance_outlook(&self, hours: u32, now: DateTime<Utc>) -> Vec<FipOutlook> {
        let states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        self.profiles
            .values()
            .map(|profile| {
                let patterns = states
                    .get(&profile.fip_id)
                    .and_then(|s| s.analysis.as_ref())
                    .map(|a| a.patterns.as_slice())
                    .unwrap_or_default();
                FipOutlook {
                    fip_id: profile.fip_id.clone(),
                    bank_name: profile.bank_name.clone(),
                    hours: maintenance_outlook(patterns, now, hours),
                }
            })
            .collect()
    }
}

/// Counts of FIPs per health status; FIPs never evaluated count as unknown.
pub fn status_counts(statuses: &[FipStatus]) -> BTreeMap<String, usize> {
    let mut counts: BTreeMap<String, usize> = [
        HealthStatus::Healthy,
        HealthStatus::Degraded,
        HealthStatus::Critical,
        HealthStatus::Unknown,
    ]
    .iter()
    .map(|s| (s.as_str().to_string(), 0))
    .collect();

    for status in statuses {
        let key = status
            .assessment
            .as_ref()
            .map(|a| a.status)
            .unwrap_or(HealthStatus::Unknown);
        *counts.entry(key.as_str().to_string()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertRules, AlertType};
    use crate::store::{InMemoryMetricStore, StoreResult};
    use async_trait::async_trait;
    use chrono::{Datelike, TimeZone, Timelike, Weekday};
    use health::{PatternCategory, SignalForecaster, WeightedScorer};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 30, 20, 0, 0).unwrap()
    }

    fn profiles() -> Vec<FipProfile> {
        vec![
            FipProfile::new("sbi-fip", "State Bank of India", 4500),
            FipProfile::new("hdfc-fip", "HDFC Bank", 3200),
        ]
    }

    fn pipeline(store: Arc<dyn MetricStore>) -> Pipeline {
        Pipeline::new(
            store,
            Arc::new(WeightedScorer::default()),
            PatternAnalyzer::default(),
            Arc::new(SignalForecaster::default()),
            ImpactEstimator::default(),
            Arc::new(AlertEngine::new(AlertRules::default())),
            profiles(),
            PipelineConfig::default(),
        )
    }

    fn healthy(fip_id: &str, at: DateTime<Utc>) -> MetricSnapshot {
        MetricSnapshot::new(fip_id, at)
            .with_consent_rate(95.0)
            .with_data_fetch_rate(92.0)
            .with_response_time(1.2)
            .with_error_rate(2.0)
            .with_request_count(800)
    }

    fn critical(fip_id: &str, at: DateTime<Utc>) -> MetricSnapshot {
        MetricSnapshot::new(fip_id, at)
            .with_consent_rate(10.0)
            .with_data_fetch_rate(8.0)
            .with_response_time(9.0)
            .with_error_rate(88.0)
    }

    /// Four weeks of hourly samples with a Sunday 01:00-02:59 maintenance window.
    fn weekly_maintenance(fip_id: &str, until: DateTime<Utc>) -> Vec<MetricSnapshot> {
        let start = until - ChronoDuration::days(28);
        (1..=28 * 24)
            .map(|h| {
                let at = start + ChronoDuration::hours(h);
                if at.weekday() == Weekday::Sun && (1..=2).contains(&at.hour()) {
                    critical(fip_id, at)
                } else {
                    healthy(fip_id, at)
                }
            })
            .collect()
    }

    /// Fails every request for one FIP and delegates the rest.
    struct PartialOutage {
        inner: InMemoryMetricStore,
        down: String,
    }

    #[async_trait]
    impl MetricStore for PartialOutage {
        async fn latest(&self, fip_id: &str) -> StoreResult<Option<MetricSnapshot>> {
            if fip_id == self.down {
                return Err(StoreError::Unavailable {
                    message: "connection refused".to_string(),
                });
            }
            self.inner.latest(fip_id).await
        }

        async fn history(
            &self,
            fip_id: &str,
            since: DateTime<Utc>,
            until: DateTime<Utc>,
        ) -> StoreResult<Vec<MetricSnapshot>> {
            self.inner.history(fip_id, since, until).await
        }

        fn store_name(&self) -> &'static str {
            "partial-outage"
        }
    }

    #[tokio::test]
    async fn test_missing_data_is_isolated() {
        let store = Arc::new(InMemoryMetricStore::new());
        store.record(critical("sbi-fip", now())).unwrap();
        let pipeline = pipeline(store);

        let report = pipeline.evaluate_all(Stage::Metrics, now()).await;
        assert_eq!(report.evaluated.len(), 1);
        assert_eq!(report.evaluated[0].fip_id, "sbi-fip");
        assert_eq!(report.evaluated[0].assessment.status, HealthStatus::Critical);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(report.skipped[0].fip_id, "hdfc-fip");
        assert!(report
            .notifications()
            .any(|t| t.alert().alert_type == AlertType::HealthStatus));

        let hdfc = pipeline.status("hdfc-fip", now()).unwrap();
        assert!(hdfc.assessment.is_none());
        assert!(hdfc.last_error.unwrap().contains("No metrics"));
    }

    #[tokio::test]
    async fn test_store_failure_keeps_last_known_good() {
        let memory = InMemoryMetricStore::new();
        memory.record(healthy("hdfc-fip", now())).unwrap();
        memory.record(healthy("sbi-fip", now())).unwrap();
        let store = Arc::new(PartialOutage {
            inner: memory,
            down: "nobody".to_string(),
        });
        let first = pipeline(store.clone());
        first.evaluate_all(Stage::Metrics, now()).await;
        let before = first.status("hdfc-fip", now()).unwrap();

        // Same pipeline state, but the store now fails for hdfc.
        let outage = Arc::new(PartialOutage {
            inner: InMemoryMetricStore::new(),
            down: "hdfc-fip".to_string(),
        });
        let failing = Pipeline {
            store: outage,
            ..first
        };
        let later = now() + ChronoDuration::minutes(2);
        let report = failing.evaluate_all(Stage::Metrics, later).await;
        assert!(report.skipped.iter().any(|s| s.fip_id == "hdfc-fip"));

        let after = failing.status("hdfc-fip", later).unwrap();
        assert_eq!(after.assessment, before.assessment);
        assert_eq!(after.last_good, before.last_good);
        assert!(after.last_error.unwrap().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_full_stage_detects_maintenance_and_forecasts() {
        let store = Arc::new(InMemoryMetricStore::new());
        store.record_all(weekly_maintenance("sbi-fip", now())).unwrap();
        let pipeline = pipeline(store);

        let report = pipeline.evaluate_all(Stage::Full, now()).await;
        assert_eq!(report.evaluated.len(), 1);
        assert!(report.evaluated[0].forecast.is_some());

        let status = pipeline.status("sbi-fip", now()).unwrap();
        assert_eq!(status.patterns.len(), 1);
        assert_eq!(status.patterns[0].category, PatternCategory::Maintenance);
        let entry = status.forecast.unwrap();
        assert_eq!(entry.forecast.horizon, Horizon::DAY);
        assert_eq!(entry.impact.fip_id, "sbi-fip");

        let outlook = pipeline.maintenance_outlook(24, now());
        let sbi = outlook.iter().find(|o| o.fip_id == "sbi-fip").unwrap();
        assert_eq!(sbi.hours.len(), 24);
        assert!(sbi.hours.iter().any(|h| h.is_high_risk()));
        let hdfc = outlook.iter().find(|o| o.fip_id == "hdfc-fip").unwrap();
        assert!(hdfc.hours.iter().all(|h| !h.is_high_risk()));
    }

    #[tokio::test]
    async fn test_predict_reports_unavailable_fips() {
        let store = Arc::new(InMemoryMetricStore::new());
        store.record_all(weekly_maintenance("sbi-fip", now())).unwrap();
        let pipeline = pipeline(store);
        let six_hours = Horizon::hours(6).unwrap();

        let report = pipeline
            .predict(
                &[
                    "sbi-fip".to_string(),
                    "hdfc-fip".to_string(),
                    "axis-fip".to_string(),
                ],
                six_hours,
                now(),
            )
            .await;

        assert_eq!(report.predictions.len(), 1);
        assert_eq!(report.predictions[0].fip_id, "sbi-fip");
        assert_eq!(report.predictions[0].forecast.horizon, six_hours);
        let unavailable: Vec<&str> = report.unavailable.iter().map(|u| u.fip_id.as_str()).collect();
        assert_eq!(unavailable, vec!["hdfc-fip", "axis-fip"]);

        // Predictions never open alerts.
        assert!(pipeline.alerts().active(&Default::default()).is_empty());

        let first = pipeline.forecast("sbi-fip", six_hours).unwrap();
        pipeline.predict(&["sbi-fip".to_string()], six_hours, now()).await;
        assert_eq!(pipeline.forecast("sbi-fip", six_hours).unwrap(), first);
        assert!(pipeline.forecast("sbi-fip", Horizon::DAY).is_none());
    }
}
