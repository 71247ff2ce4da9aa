//! Query and mutation surface
//!
//! [`SentinelSystem`] wires the store, pipeline, alert engine, subscription registry,
//! dispatcher and scheduler together and exposes the operations an API layer or the
//! CLI needs.
//!
//! # Examples
//!
//! ```rust
//! use std::sync::Arc;
//! use chrono::Utc;
//! use health::{FipProfile, MetricSnapshot};
//! use sentinel::config::{SentinelConfig, StoreBackend};
//! use sentinel::pipeline::Stage;
//! use sentinel::store::InMemoryMetricStore;
//! use sentinel::system::SentinelSystem;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryMetricStore::new());
//! store.record(MetricSnapshot::new("sbi-fip", Utc::now()).with_consent_rate(62.0))?;
//!
//! let config = SentinelConfig::default()
//!     .with_store(StoreBackend::Memory)
//!     .with_fip(FipProfile::new("sbi-fip", "State Bank of India", 4500));
//! let system = SentinelSystem::builder(config).with_store(store).build()?;
//!
//! let outcome = system.run_cycle(Stage::Metrics).await;
//! println!("{} alert transition(s)", outcome.report.transitions.len());
//! println!("{:?}", system.alert_summary());
//! # Ok(())
//! # }
//! ```

use crate::alerts::{Alert, AlertEngine, AlertError, AlertFilter, AlertSummary};
use crate::config::{ConfigError, SentinelConfig, StoreBackend};
use crate::pipeline::{
    status_counts, CycleReport, FipOutlook, FipStatus, Pipeline, PipelineError, PredictionReport,
    Stage,
};
use crate::registry::{RegistryError, SubscriptionDraft, SubscriptionRegistry, WebhookSubscription};
use crate::scheduler::Scheduler;
use crate::store::{InMemoryMetricStore, MetricStore, PrometheusMetricStore, StoreError};
use crate::webhook::{
    DeliveryAttempt, DeliveryReport, DispatchError, DispatchSummary, DispatchWorker,
    HttpTransport, ShutdownReport, WebhookDispatcher, WebhookTransport,
};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use health::stats::mean;
use health::{
    DowntimeForecaster, HealthScorer, Horizon, ImpactEstimator, PatternAnalyzer, SignalForecaster,
    WeightedScorer,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SentinelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Alert error: {0}")]
    Alert(#[from] AlertError),

    #[error("Subscription error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),
}

pub type SentinelResult<T> = Result<T, SentinelError>;

/// One FIP's status together with its active alerts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FipStatusView {
    #[serde(flatten)]
    pub status: FipStatus,
    pub active_alerts: Vec<Alert>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemOverview {
    pub generated_at: DateTime<Utc>,
    pub total_fips: usize,
    /// FIP count per health status
    pub status_counts: BTreeMap<String, usize>,
    /// Mean score over FIPs with an evaluable assessment
    pub average_score: Option<f64>,
    pub fips: Vec<FipStatus>,
    pub alerts: AlertSummary,
}

#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub report: CycleReport,
    /// Deliveries made inline; empty when notifications went to the dispatch queue
    pub deliveries: Vec<DispatchSummary>,
}

pub struct SentinelBuilder {
    config: SentinelConfig,
    store: Option<Arc<dyn MetricStore>>,
    scorer: Option<Arc<dyn HealthScorer>>,
    forecaster: Option<Arc<dyn DowntimeForecaster>>,
    transport: Option<Arc<dyn WebhookTransport>>,
}

impl SentinelBuilder {
    pub fn with_store(mut self, store: Arc<dyn MetricStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn HealthScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_forecaster(mut self, forecaster: Arc<dyn DowntimeForecaster>) -> Self {
        self.forecaster = Some(forecaster);
        self
    }

    pub fn with_transport(mut self, transport: Arc<dyn WebhookTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn build(self) -> SentinelResult<SentinelSystem> {
        let config = self.config;
        config.validate()?;

        let store: Arc<dyn MetricStore> = match self.store {
            Some(store) => store,
            None => match &config.store {
                StoreBackend::Memory => Arc::new(InMemoryMetricStore::new()),
                StoreBackend::Prometheus(prometheus) => {
                    Arc::new(PrometheusMetricStore::new(prometheus.clone())?)
                }
            },
        };
        let scorer = self
            .scorer
            .unwrap_or_else(|| Arc::new(WeightedScorer::new(config.scoring.clone())));
        let forecaster = self
            .forecaster
            .unwrap_or_else(|| Arc::new(SignalForecaster::new(config.forecast.clone())));
        let transport: Arc<dyn WebhookTransport> = match self.transport {
            Some(transport) => transport,
            None => Arc::new(HttpTransport::new(config.dispatcher.retry.request_timeout())?),
        };

        let registry = Arc::new(SubscriptionRegistry::new());
        for draft in &config.webhooks {
            registry.create(draft.clone())?;
        }

        let alerts = Arc::new(AlertEngine::new(config.alerts.clone()));
        let pipeline = Arc::new(Pipeline::new(
            store,
            scorer,
            PatternAnalyzer::new(config.analyzer.clone()),
            forecaster,
            ImpactEstimator::new(config.impact.clone()),
            Arc::clone(&alerts),
            config.fips.clone(),
            config.pipeline.clone(),
        ));
        let dispatcher = Arc::new(WebhookDispatcher::with_transport(
            Arc::clone(&registry),
            transport,
            config.dispatcher.clone(),
        )?);
        let scheduler = Scheduler::new(Arc::clone(&pipeline), config.scheduler.clone());

        info!(
            "Sentinel ready: {} FIP(s), {} webhook subscription(s), {} store",
            config.fips.len(),
            config.webhooks.len(),
            pipeline_store_name(&config)
        );

        Ok(SentinelSystem {
            config,
            pipeline,
            alerts,
            registry,
            dispatcher,
            scheduler,
            worker: None,
        })
    }
}

fn pipeline_store_name(config: &SentinelConfig) -> &'static str {
    match config.store {
        StoreBackend::Memory => "in-memory",
        StoreBackend::Prometheus(_) => "prometheus",
    }
}

pub struct SentinelSystem {
    config: SentinelConfig,
    pipeline: Arc<Pipeline>,
    alerts: Arc<AlertEngine>,
    registry: Arc<SubscriptionRegistry>,
    dispatcher: Arc<WebhookDispatcher>,
    scheduler: Scheduler,
    worker: Option<DispatchWorker>,
}

impl SentinelSystem {
    pub fn builder(config: SentinelConfig) -> SentinelBuilder {
        SentinelBuilder {
            config,
            store: None,
            scorer: None,
            forecaster: None,
            transport: None,
        }
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Start the dispatch worker and both refresh loops.
    pub fn start(&mut self) {
        if self.is_running() {
            return;
        }
        let worker = Arc::clone(&self.dispatcher).spawn();
        self.scheduler.set_notifier(Some(worker.handle()));
        self.scheduler.start();
        self.worker = Some(worker);
    }

    /// Stop both loops, then flush notifications the dispatch worker already accepted.
    pub async fn stop(&mut self) -> Option<ShutdownReport> {
        self.scheduler.stop();
        self.scheduler.set_notifier(None);
        match self.worker.take() {
            Some(worker) => Some(worker.shutdown().await),
            None => None,
        }
    }

    /// Run one evaluation cycle now. Notifications go to the dispatch queue when the
    /// system is running and are delivered inline otherwise.
    pub async fn run_cycle(&self, stage: Stage) -> CycleOutcome {
        if self.worker.is_some() {
            return CycleOutcome {
                report: self.scheduler.run_once(stage).await,
                deliveries: Vec::new(),
            };
        }

        let report = self.pipeline.evaluate_all(stage, Utc::now()).await;
        let deliveries = join_all(
            report
                .notifications()
                .map(|transition| self.dispatcher.dispatch(transition.alert())),
        )
        .await;
        CycleOutcome { report, deliveries }
    }

    pub fn fip_status(&self, fip_id: &str) -> SentinelResult<FipStatusView> {
        let status = self.pipeline.status(fip_id, Utc::now())?;
        let active_alerts = self.alerts.active(&AlertFilter::new().with_fip(fip_id));
        Ok(FipStatusView {
            status,
            active_alerts,
        })
    }

    pub fn overview(&self) -> SystemOverview {
        let now = Utc::now();
        let fips = self.pipeline.statuses(now);
        let scores: Vec<f64> = fips
            .iter()
            .filter_map(|f| f.assessment.as_ref())
            .filter(|a| a.status.is_evaluable())
            .map(|a| a.score)
            .collect();

        SystemOverview {
            generated_at: now,
            total_fips: fips.len(),
            status_counts: status_counts(&fips),
            average_score: mean(&scores),
            alerts: self.alerts.summary(),
            fips,
        }
    }

    pub async fn predict(&self, fip_ids: &[String], horizon: Horizon) -> PredictionReport {
        self.pipeline.predict(fip_ids, horizon, Utc::now()).await
    }

    pub fn maintenance_outlook(&self, hours: u32) -> Vec<FipOutlook> {
        self.pipeline.maintenance_outlook(hours, Utc::now())
    }

    pub fn active_alerts(&self, filter: &AlertFilter) -> Vec<Alert> {
        self.alerts.active(filter)
    }

    pub fn alert_summary(&self) -> AlertSummary {
        self.alerts.summary()
    }

    pub fn acknowledge(&self, alert_id: &str) -> SentinelResult<Alert> {
        Ok(self.alerts.acknowledge(alert_id, Utc::now())?)
    }

    pub fn resolve(&self, alert_id: &str, note: Option<String>) -> SentinelResult<Alert> {
        Ok(self.alerts.resolve(alert_id, note, Utc::now())?)
    }

    /// Send the alert's current state to its subscribers now.
    pub async fn renotify(&self, alert_id: &str) -> SentinelResult<DispatchSummary> {
        let alert = self.alerts.get(alert_id).ok_or_else(|| AlertError::NotFound {
            alert_id: alert_id.to_string(),
        })?;
        info!("Re-notifying subscribers of alert {}", alert_id);
        Ok(self.dispatcher.dispatch(&alert).await)
    }

    pub fn create_webhook(&self, draft: SubscriptionDraft) -> SentinelResult<WebhookSubscription> {
        Ok(self.registry.create(draft)?)
    }

    pub fn update_webhook(
        &self,
        id: &str,
        draft: SubscriptionDraft,
    ) -> SentinelResult<WebhookSubscription> {
        Ok(self.registry.update(id, draft)?)
    }

    pub fn set_webhook_enabled(
        &self,
        id: &str,
        enabled: bool,
    ) -> SentinelResult<WebhookSubscription> {
        Ok(self.registry.set_enabled(id, enabled)?)
    }

    pub fn delete_webhook(&self, id: &str) -> SentinelResult<WebhookSubscription> {
        Ok(self.registry.delete(id)?)
    }

    pub fn webhooks(&self) -> Vec<WebhookSubscription> {
        self.registry.list()
    }

    pub async fn test_webhook(&self, id: &str) -> SentinelResult<DeliveryReport> {
        Ok(self.dispatcher.test_subscription(id).await?)
    }

    pub async fn test_all_webhooks(&self) -> Vec<DeliveryReport> {
        self.dispatcher.test_all().await
    }

    pub fn recent_deliveries(&self, limit: usize) -> Vec<DeliveryAttempt> {
        self.dispatcher.recent_deliveries(limit)
    }
}

impl Drop for SentinelSystem {
    fn drop(&mut self) {
        // A dropped worker flushes its queue on its own.
        self.scheduler.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::AlertType;
    use crate::webhook::AlertPayload;
    use async_trait::async_trait;
    use health::{FipProfile, MetricSnapshot, Severity};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<(String, AlertPayload)>>,
    }

    #[async_trait]
    impl WebhookTransport for RecordingTransport {
        async fn send(
            &self,
            subscription: &WebhookSubscription,
            payload: &AlertPayload,
        ) -> crate::webhook::DispatchResult<u16> {
            self.sent
                .lock()
                .unwrap()
                .push((subscription.name.clone(), payload.clone()));
            Ok(200)
        }
    }

    fn config() -> SentinelConfig {
        SentinelConfig::default()
            .with_store(StoreBackend::Memory)
            .with_fip(FipProfile::new("sbi-fip", "State Bank of India", 4500))
            .with_fip(FipProfile::new("hdfc-fip", "HDFC Bank", 3200))
            .with_webhook(
                SubscriptionDraft::new("pager", "https://hooks.example.com/pager")
                    .with_severities([Severity::Critical]),
            )
    }

    fn seeded_store() -> Arc<InMemoryMetricStore> {
        let store = Arc::new(InMemoryMetricStore::new());
        let now = Utc::now();
        store
            .record(
                MetricSnapshot::new("sbi-fip", now)
                    .with_consent_rate(62.0)
                    .with_data_fetch_rate(58.0)
                    .with_response_time(6.5)
                    .with_error_rate(38.0),
            )
            .unwrap();
        store
            .record(
                MetricSnapshot::new("hdfc-fip", now)
                    .with_consent_rate(96.0)
                    .with_data_fetch_rate(94.0)
                    .with_response_time(1.2)
                    .with_error_rate(2.0),
            )
            .unwrap();
        store
    }

    fn system(transport: Arc<RecordingTransport>) -> SentinelSystem {
        SentinelSystem::builder(config())
            .with_store(seeded_store())
            .with_transport(transport)
            .build()
            .unwrap()
    }

    #[test]
    fn test_build_rejects_invalid_config() {
        let mut config = config();
        config.alerts.consent_critical = 99.0;
        let result = SentinelSystem::builder(config).build();
        assert!(matches!(result, Err(SentinelError::Config(_))));
    }

    #[test]
    fn test_seed_webhooks_are_registered() {
        let system = system(Arc::new(RecordingTransport::default()));
        let hooks = system.webhooks();
        assert_eq!(hooks.len(), 1);
        assert_eq!(hooks[0].name, "pager");
    }

    #[tokio::test]
    async fn test_cycle_delivers_inline_and_updates_views() {
        let transport = Arc::new(RecordingTransport::default());
        let system = system(Arc::clone(&transport));

        let outcome = system.run_cycle(Stage::Metrics).await;
        assert_eq!(outcome.report.evaluated.len(), 2);
        assert!(!outcome.deliveries.is_empty());

        // Only critical alerts reach the pager subscription.
        let sent = transport.sent.lock().unwrap().clone();
        assert!(!sent.is_empty());
        assert!(sent
            .iter()
            .all(|(name, payload)| name == "pager" && payload.severity == Severity::Critical));

        let view = system.fip_status("sbi-fip").unwrap();
        assert!(!view.active_alerts.is_empty());
        assert!(view.active_alerts.iter().all(|a| a.fip_id == "sbi-fip"));
        assert!(system.fip_status("hdfc-fip").unwrap().active_alerts.is_empty());

        let overview = system.overview();
        assert_eq!(overview.total_fips, 2);
        assert_eq!(overview.status_counts["healthy"], 1);
        assert!(overview.average_score.is_some());
        assert_eq!(overview.alerts, system.alert_summary());
    }

    #[tokio::test]
    async fn test_unknown_fip_status() {
        let system = system(Arc::new(RecordingTransport::default()));
        assert!(matches!(
            system.fip_status("nope"),
            Err(SentinelError::Pipeline(PipelineError::UnknownFip { .. }))
        ));
    }

    #[tokio::test]
    async fn test_alert_lifecycle_and_renotify() {
        let transport = Arc::new(RecordingTransport::default());
        let system = system(Arc::clone(&transport));
        system.run_cycle(Stage::Metrics).await;

        let alert = system
            .active_alerts(&AlertFilter::new().with_type(AlertType::HealthStatus))
            .pop()
            .unwrap();
        let before = transport.sent.lock().unwrap().len();

        let acked = system.acknowledge(&alert.alert_id).unwrap();
        assert!(acked.acknowledged_at.is_some());

        let summary = system.renotify(&alert.alert_id).await.unwrap();
        assert_eq!(summary.alert_id, alert.alert_id);
        assert_eq!(
            transport.sent.lock().unwrap().len(),
            before + summary.delivered()
        );

        let resolved = system
            .resolve(&alert.alert_id, Some("failover complete".to_string()))
            .unwrap();
        assert_eq!(resolved.resolution_note.as_deref(), Some("failover complete"));
        assert!(matches!(
            system.resolve(&alert.alert_id, None),
            Err(SentinelError::Alert(AlertError::AlreadyResolved { .. }))
        ));
        assert!(matches!(
            system.renotify("missing").await,
            Err(SentinelError::Alert(AlertError::NotFound { .. }))
        ));
    }

    #[tokio::test]
    async fn test_webhook_management() {
        let transport = Arc::new(RecordingTransport::default());
        let system = system(Arc::clone(&transport));

        let ops = system
            .create_webhook(SubscriptionDraft::new("ops", "https://hooks.example.com/ops"))
            .unwrap();
        assert_eq!(system.webhooks().len(), 2);

        let report = system.test_webhook(&ops.id).await.unwrap();
        assert!(report.is_delivered());
        assert!(transport.sent.lock().unwrap()[0].1.test);

        system.set_webhook_enabled(&ops.id, false).unwrap();
        let reports = system.test_all_webhooks().await;
        assert_eq!(reports.len(), 1);

        let renamed = system
            .update_webhook(
                &ops.id,
                SubscriptionDraft::new("ops-2", "https://hooks.example.com/ops"),
            )
            .unwrap();
        assert_eq!(renamed.name, "ops-2");

        system.delete_webhook(&ops.id).unwrap();
        assert!(matches!(
            system.delete_webhook(&ops.id),
            Err(SentinelError::Registry(_))
        ));
        assert!(!system.recent_deliveries(10).is_empty());
    }

    #[tokio::test]
    async fn test_start_routes_notifications_through_queue() {
        let transport = Arc::new(RecordingTransport::default());
        let mut system = system(Arc::clone(&transport));

        system.start();
        assert!(system.is_running());

        let outcome = system.run_cycle(Stage::Metrics).await;
        assert!(outcome.deliveries.is_empty());

        // Stopping right away still delivers what was queued.
        let report = system.stop().await.unwrap();
        assert_eq!(report.abandoned, 0);
        assert!(!transport.sent.lock().unwrap().is_empty());
        assert!(!system.is_running());
        assert!(system.stop().await.is_none());
    }
}
