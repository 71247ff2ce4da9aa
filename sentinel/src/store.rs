//! Metric store adapters
//!
//! The engine only reads metrics: the latest snapshot for a FIP and a trailing
//! history window. [`InMemoryMetricStore`] keeps samples in process and
//! [`PrometheusMetricStore`] reads them from a Prometheus-compatible HTTP API.
//!
//! # Examples
//!
//! ```rust
//! use chrono::Utc;
//! use health::MetricSnapshot;
//! use sentinel::store::{InMemoryMetricStore, MetricStore};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = InMemoryMetricStore::new();
//! store.record(MetricSnapshot::new("sbi-fip", Utc::now()).with_consent_rate(93.5))?;
//!
//! let latest = store.latest("sbi-fip").await?;
//! assert!(latest.is_some());
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use health::{HealthError, MetricKind, MetricSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Metric store unavailable: {message}")]
    Unavailable { message: String },

    #[error("Failed to decode metric store response: {message}")]
    Decode { message: String },

    #[error("Rejected sample: {0}")]
    InvalidSample(#[from] HealthError),

    #[error("Sample for {fip_id} at {timestamp} was already recorded")]
    DuplicateSample {
        fip_id: String,
        timestamp: DateTime<Utc>,
    },

    #[error("Invalid store configuration: {message}")]
    InvalidConfig { message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn latest(&self, fip_id: &str) -> StoreResult<Option<MetricSnapshot>>;

    /// Samples with `since <= timestamp <= until`, oldest first.
    async fn history(
        &self,
        fip_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<MetricSnapshot>>;

    fn store_name(&self) -> &'static str;
}

/// Bounded per-FIP sample buffer. Samples are validated on the way in and never modified.
#[derive(Debug)]
pub struct InMemoryMetricStore {
    series: RwLock<HashMap<String, Vec<MetricSnapshot>>>,
    max_samples_per_fip: usize,
}

impl Default for InMemoryMetricStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryMetricStore {
    /// 31 days of 15-minute samples.
    pub const DEFAULT_CAPACITY: usize = 31 * 24 * 4;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(max_samples_per_fip: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_samples_per_fip: max_samples_per_fip.max(1),
        }
    }

    pub fn record(&self, snapshot: MetricSnapshot) -> StoreResult<()> {
        snapshot.validate()?;

        let mut series = self.series.write().unwrap_or_else(PoisonError::into_inner);
        let samples = series.entry(snapshot.fip_id.clone()).or_default();

        let position = samples.partition_point(|s| s.timestamp < snapshot.timestamp);
        if samples
            .get(position)
            .is_some_and(|s| s.timestamp == snapshot.timestamp)
        {
            return Err(StoreError::DuplicateSample {
                fip_id: snapshot.fip_id,
                timestamp: snapshot.timestamp,
            });
        }
        samples.insert(position, snapshot);

        if samples.len() > self.max_samples_per_fip {
            let overflow = samples.len() - self.max_samples_per_fip;
            samples.drain(..overflow);
        }

        Ok(())
    }

    pub fn record_all(
        &self,
        snapshots: impl IntoIterator<Item = MetricSnapshot>,
    ) -> StoreResult<usize> {
        let mut recorded = 0;
        for snapshot in snapshots {
            self.record(snapshot)?;
            recorded += 1;
        }
        Ok(recorded)
    }

    pub fn fip_ids(&self) -> Vec<String> {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = series.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn sample_count(&self, fip_id: &str) -> usize {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        series.get(fip_id).map(Vec::len).unwrap_or(0)
    }
}

#[async_trait]
impl MetricStore for InMemoryMetricStore {
    async fn latest(&self, fip_id: &str) -> StoreResult<Option<MetricSnapshot>> {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        Ok(series.get(fip_id).and_then(|samples| samples.last().cloned()))
    }

    async fn history(
        &self,
        fip_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<MetricSnapshot>> {
        let series = self.series.read().unwrap_or_else(PoisonError::into_inner);
        Ok(series
            .get(fip_id)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.timestamp >= since && s.timestamp <= until)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn store_name(&self) -> &'static str {
        "memory"
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrometheusConfig {
    pub base_url: String,
    pub timeout_secs: u64,
    /// Resolution of range queries.
    pub step_secs: u64,
    /// Label carrying the FIP identifier on every series.
    pub fip_label: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090".to_string(),
            timeout_secs: 10,
            step_secs: 900,
            fip_label: "fip_name".to_string(),
        }
    }
}

impl PrometheusConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_step_secs(mut self, step_secs: u64) -> Self {
        self.step_secs = step_secs;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_url.is_empty() {
            return Err("Prometheus URL cannot be empty".to_string());
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err("Prometheus URL must start with http:// or https://".to_string());
        }

        if self.timeout_secs == 0 {
            return Err("Timeout must be greater than 0".to_string());
        }

        if self.step_secs == 0 {
            return Err("Range query step must be greater than 0".to_string());
        }

        if self.fip_label.is_empty() {
            return Err("FIP label cannot be empty".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
enum Field {
    Metric(MetricKind),
    RequestCount,
}

const SERIES: [(Field, &str); 5] = [
    (
        Field::Metric(MetricKind::ConsentSuccessRate),
        "fip_consent_success_rate",
    ),
    (
        Field::Metric(MetricKind::DataFetchSuccessRate),
        "fip_data_fetch_success_rate",
    ),
    (
        Field::Metric(MetricKind::AvgResponseTimeSeconds),
        "fip_avg_response_time_seconds",
    ),
    (Field::Metric(MetricKind::ErrorRate), "fip_error_rate"),
    (Field::RequestCount, "fip_total_requests"),
];

#[derive(Debug, Deserialize)]
struct QueryResponse {
    status: String,
    #[serde(default)]
    data: Option<QueryData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    #[serde(default)]
    result: Vec<QuerySeries>,
}

#[derive(Debug, Deserialize)]
struct QuerySeries {
    #[serde(default)]
    value: Option<(f64, String)>,
    #[serde(default)]
    values: Vec<(f64, String)>,
}

/// Reads snapshots from the Prometheus HTTP API (`/api/v1/query` and `/api/v1/query_range`).
#[derive(Debug, Clone)]
pub struct PrometheusMetricStore {
    client: reqwest::Client,
    config: PrometheusConfig,
}

impl PrometheusMetricStore {
    pub fn new(config: PrometheusConfig) -> StoreResult<Self> {
        config
            .validate()
            .map_err(|message| StoreError::InvalidConfig { message })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &PrometheusConfig {
        &self.config
    }

    fn selector(&self, metric: &str, fip_id: &str) -> String {
        let escaped = fip_id.replace('\\', "\\\\").replace('"', "\\\"");
        format!("{}{{{}=\"{}\"}}", metric, self.config.fip_label, escaped)
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn fetch(&self, path: &str, params: &[(&str, String)]) -> StoreResult<Vec<QuerySeries>> {
        let response = self
            .client
            .get(self.endpoint(path))
            .query(params)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Unavailable {
                message: format!("HTTP {}: {}", status, body),
            });
        }

        let body: QueryResponse = response.json().await.map_err(|e| StoreError::Decode {
            message: e.to_string(),
        })?;

        if body.status != "success" {
            return Err(StoreError::Unavailable {
                message: body.error.unwrap_or_else(|| format!("status {}", body.status)),
            });
        }

        Ok(body.data.map(|d| d.result).unwrap_or_default())
    }

    fn parse_point(point: &(f64, String)) -> Option<(DateTime<Utc>, f64)> {
        let value: f64 = point.1.parse().ok()?;
        if !value.is_finite() {
            return None;
        }
        let timestamp = Utc
            .timestamp_millis_opt((point.0 * 1000.0).round() as i64)
            .single()?;
        Some((timestamp, value))
    }

    fn apply(snapshot: &mut MetricSnapshot, field: Field, value: f64) {
        match field {
            Field::Metric(metric) => {
                if !metric.accepts(value) {
                    warn!(
                        "Dropping out-of-range {} value {} for {}",
                        metric, value, snapshot.fip_id
                    );
                    return;
                }
                match metric {
                    MetricKind::ConsentSuccessRate => snapshot.consent_success_rate = Some(value),
                    MetricKind::DataFetchSuccessRate => {
                        snapshot.data_fetch_success_rate = Some(value)
                    }
                    MetricKind::AvgResponseTimeSeconds => {
                        snapshot.avg_response_time_seconds = Some(value)
                    }
                    MetricKind::ErrorRate => snapshot.error_rate = Some(value),
                }
            }
            Field::RequestCount => snapshot.request_count = value.max(0.0).round() as u64,
        }
    }
}

#[async_trait]
impl MetricStore for PrometheusMetricStore {
    async fn latest(&self, fip_id: &str) -> StoreResult<Option<MetricSnapshot>> {
        let queries = SERIES.iter().map(|(field, name)| async move {
            let series = self
                .fetch("/api/v1/query", &[("query", self.selector(name, fip_id))])
                .await?;
            let point = series
                .iter()
                .filter_map(|s| s.value.as_ref().and_then(Self::parse_point))
                .max_by_key(|(ts, _)| *ts);
            Ok::<_, StoreError>((*field, point))
        });

        let points = futures::future::try_join_all(queries).await?;
        let latest = points.iter().filter_map(|(_, p)| p.map(|(ts, _)| ts)).max();
        let Some(timestamp) = latest else {
            debug!("No current samples for {}", fip_id);
            return Ok(None);
        };

        let mut snapshot = MetricSnapshot::new(fip_id, timestamp);
        for (field, point) in points {
            if let Some((_, value)) = point {
                Self::apply(&mut snapshot, field, value);
            }
        }
        Ok(Some(snapshot))
    }

    async fn history(
        &self,
        fip_id: &str,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> StoreResult<Vec<MetricSnapshot>> {
        if since > until {
            return Ok(Vec::new());
        }

        let start = since.timestamp().to_string();
        let end = until.timestamp().to_string();
        let step = format!("{}s", self.config.step_secs);

        let queries = SERIES.iter().map(|(field, name)| {
            let params = [
                ("query", self.selector(name, fip_id)),
                ("start", start.clone()),
                ("end", end.clone()),
                ("step", step.clone()),
            ];
            async move {
                let series = self.fetch("/api/v1/query_range", &params).await?;
                let points: Vec<(DateTime<Utc>, f64)> = series
                    .iter()
                    .flat_map(|s| s.values.iter().filter_map(Self::parse_point))
                    .collect();
                Ok::<_, StoreError>((*field, points))
            }
        });

        let mut merged: BTreeMap<DateTime<Utc>, MetricSnapshot> = BTreeMap::new();
        for (field, points) in futures::future::try_join_all(queries).await? {
            for (timestamp, value) in points {
                let snapshot = merged
                    .entry(timestamp)
                    .or_insert_with(|| MetricSnapshot::new(fip_id, timestamp));
                Self::apply(snapshot, field, value);
            }
        }

        Ok(merged
            .into_values()
            .filter(|s| s.timestamp >= since && s.timestamp <= until)
            .collect())
    }

    fn store_name(&self) -> &'static str {
        "prometheus"
    }
}
