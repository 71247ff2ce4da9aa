//! Webhook delivery
//!
//! [`WebhookDispatcher`] fans an alert out to every enabled subscription that wants its
//! severity. Deliveries run concurrently, bounded by a semaphore, and fail independently.
//! A failed delivery is retried with exponential backoff and jitter; the subscription is
//! re-read from the registry before each retry so disabling or deleting it stops the
//! sequence.
//!
//! # Examples
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sentinel::registry::{SubscriptionDraft, SubscriptionRegistry};
//! use sentinel::webhook::{DispatcherConfig, WebhookDispatcher};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Arc::new(SubscriptionRegistry::new());
//! let ops = registry.create(SubscriptionDraft::new("ops", "https://hooks.example.com/fip"))?;
//!
//! let dispatcher = WebhookDispatcher::new(registry, DispatcherConfig::default())?;
//! let report = dispatcher.test_subscription(&ops.id).await?;
//! println!("{}: {:?}", report.subscription_name, report.status);
//! # Ok(())
//! # }
//! ```

use crate::alerts::{Alert, AlertContext, AlertMetrics, AlertStatus};
use crate::registry::{HttpMethod, RegistryError, SubscriptionRegistry, WebhookSubscription};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use health::Severity;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request to {url} timed out")]
    Timeout { url: String },

    #[error("Subscription error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Dispatch queue is full")]
    QueueFull,

    #[error("Dispatch queue is closed")]
    QueueClosed,

    #[error("Invalid dispatcher configuration: {message}")]
    InvalidConfig { message: String },
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Retry schedule for a single delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Base delay for exponential backoff (in milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay for exponential backoff (in milliseconds)
    pub max_delay_ms: u64,
    /// Jitter factor for randomizing retry delays (0.0 to 1.0)
    pub jitter_factor: f64,
    /// Timeout for each HTTP call (in seconds)
    pub request_timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_factor: 0.1,
            request_timeout_secs: 10,
        }
    }
}

impl RetryPolicy {
    pub fn with_retries(max_retries: u32, base_delay_ms: u64) -> Self {
        Self {
            max_retries,
            base_delay_ms,
            ..Default::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Wait before the `retry`-th retry (one-based): the base delay doubled per earlier
    /// retry, capped at `max_delay_ms`, plus up to `jitter_factor` of that again.
    pub fn backoff(&self, retry: u32) -> Duration {
        let doublings = retry.saturating_sub(1);
        let factor = 1_u64.checked_shl(doublings).unwrap_or(u64::MAX);
        let wait_ms = self
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.max_delay_ms);

        let spread_ms = (wait_ms as f64 * self.jitter_factor) as u64;
        let jitter_ms = match spread_ms {
            0 => 0,
            spread => rand::thread_rng().gen_range(0..=spread),
        };
        Duration::from_millis(wait_ms.saturating_add(jitter_ms))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay_ms > self.max_delay_ms {
            return Err("Base retry delay cannot exceed the maximum delay".to_string());
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err("Jitter factor must be between 0.0 and 1.0".to_string());
        }

        if self.request_timeout_secs == 0 {
            return Err("Request timeout must be greater than 0".to_string());
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub retry: RetryPolicy,
    /// Deliveries in flight at once across all subscriptions
    pub max_concurrent_deliveries: usize,
    /// Alerts waiting for dispatch before enqueueing fails
    pub queue_capacity: usize,
    /// Delivery attempts kept for inspection
    pub delivery_log_size: usize,
    /// How long shutdown waits for queued and in-flight deliveries (in milliseconds)
    pub shutdown_grace_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            max_concurrent_deliveries: 16,
            queue_capacity: 256,
            delivery_log_size: 500,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl DispatcherConfig {
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_concurrency(mut self, max_concurrent_deliveries: usize) -> Self {
        self.max_concurrent_deliveries = max_concurrent_deliveries;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace_ms = u64::try_from(grace.as_millis()).unwrap_or(u64::MAX);
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        self.retry.validate()?;

        if self.max_concurrent_deliveries == 0 {
            return Err("Delivery concurrency must be greater than 0".to_string());
        }

        if self.queue_capacity == 0 {
            return Err("Dispatch queue capacity must be greater than 0".to_string());
        }

        Ok(())
    }
}

/// JSON body sent to subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertPayload {
    pub alert_id: String,
    #[serde(rename = "type")]
    pub alert_type: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub fip_id: String,
    pub bank_name: String,
    pub message: String,
    pub metrics: AlertMetrics,
    pub context: AlertContext,
    pub confidence: f64,
    pub recommended_actions: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Set on payloads sent by the test operations
    pub test: bool,
}

impl From<&Alert> for AlertPayload {
    fn from(alert: &Alert) -> Self {
        Self {
            alert_id: alert.alert_id.clone(),
            alert_type: alert.alert_type.as_str().to_string(),
            severity: alert.severity,
            status: alert.status,
            fip_id: alert.fip_id.clone(),
            bank_name: alert.bank_name.clone(),
            message: alert.message.clone(),
            metrics: alert.metrics.clone(),
            context: alert.context.clone(),
            confidence: alert.confidence,
            recommended_actions: alert.recommended_actions.clone(),
            timestamp: alert.updated_at,
            test: false,
        }
    }
}

impl AlertPayload {
    /// Synthetic payload used to check an endpoint.
    pub fn test(now: DateTime<Utc>) -> Self {
        Self {
            alert_id: format!("test-{}", uuid::Uuid::new_v4()),
            alert_type: "test".to_string(),
            severity: Severity::Info,
            status: AlertStatus::Open,
            fip_id: "test-fip".to_string(),
            bank_name: "Test Bank".to_string(),
            message: "Test notification from FIP Sentinel".to_string(),
            metrics: AlertMetrics {
                current_value: 0.0,
                historical_average: None,
                deviation: None,
                threshold: None,
            },
            context: AlertContext {
                affected_users: 0,
                cost_estimate: 0.0,
                business_impact: "None: test notification".to_string(),
                historical_pattern: "None".to_string(),
                peak_hour: false,
            },
            confidence: 1.0,
            recommended_actions: vec!["No action required".to_string()],
            timestamp: now,
            test: true,
        }
    }
}

/// Sends one payload to one subscription and reports the HTTP status code.
#[async_trait]
pub trait WebhookTransport: Send + Sync {
    async fn send(
        &self,
        subscription: &WebhookSubscription,
        payload: &AlertPayload,
    ) -> DispatchResult<u16>;
}

#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> DispatchResult<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WebhookTransport for HttpTransport {
    async fn send(
        &self,
        subscription: &WebhookSubscription,
        payload: &AlertPayload,
    ) -> DispatchResult<u16> {
        let method = match subscription.http_method {
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
        };

        let mut request = self
            .client
            .request(method, subscription.url.as_str())
            .json(payload);
        for (name, value) in &subscription.headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                DispatchError::Timeout {
                    url: subscription.url.clone(),
                }
            } else {
                DispatchError::Http(e)
            }
        })?;

        Ok(response.status().as_u16())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Success,
    Failed,
    /// The HTTP call is still in flight
    Pending,
}

/// One HTTP call made for a delivery
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub alert_id: String,
    pub subscription_id: String,
    /// One-based
    pub attempt_number: u32,
    pub outcome: DeliveryOutcome,
    pub attempted_at: DateTime<Utc>,
    pub status_code: Option<u16>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryStatus {
    Delivered,
    Failed { error: String },
    /// The subscription was disabled or deleted between attempts
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryReport {
    pub subscription_id: String,
    pub subscription_name: String,
    pub alert_id: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
}

impl DeliveryReport {
    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchSummary {
    pub alert_id: String,
    pub reports: Vec<DeliveryReport>,
}

impl DispatchSummary {
    pub fn delivered(&self) -> usize {
        self.reports.iter().filter(|r| r.is_delivered()).count()
    }

    pub fn failed(&self) -> usize {
        self.reports
            .iter()
            .filter(|r| matches!(r.status, DeliveryStatus::Failed { .. }))
            .count()
    }
}

pub struct WebhookDispatcher {
    registry: Arc<SubscriptionRegistry>,
    transport: Arc<dyn WebhookTransport>,
    config: DispatcherConfig,
    permits: Semaphore,
    log: Mutex<VecDeque<DeliveryAttempt>>,
}

impl WebhookDispatcher {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        config: DispatcherConfig,
    ) -> DispatchResult<Self> {
        let transport = HttpTransport::new(config.retry.request_timeout())?;
        Self::with_transport(registry, Arc::new(transport), config)
    }

    pub fn with_transport(
        registry: Arc<SubscriptionRegistry>,
        transport: Arc<dyn WebhookTransport>,
        config: DispatcherConfig,
    ) -> DispatchResult<Self> {
        config
            .validate()
            .map_err(|message| DispatchError::InvalidConfig { message })?;

        Ok(Self {
            registry,
            transport,
            permits: Semaphore::new(config.max_concurrent_deliveries),
            config,
            log: Mutex::new(VecDeque::new()),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Deliver `alert` to every matching subscription. Never fails as a whole.
    pub async fn dispatch(&self, alert: &Alert) -> DispatchSummary {
        let payload = AlertPayload::from(alert);
        let targets = self.registry.matching(alert.severity);
        debug!(
            "Dispatching alert {} to {} subscription(s)",
            alert.alert_id,
            targets.len()
        );

        let reports = join_all(
            targets
                .iter()
                .map(|subscription| self.deliver(subscription, &payload)),
        )
        .await;

        DispatchSummary {
            alert_id: alert.alert_id.clone(),
            reports,
        }
    }

    async fn deliver(
        &self,
        subscription: &WebhookSubscription,
        payload: &AlertPayload,
    ) -> DeliveryReport {
        let max_attempts = self.config.retry.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 1..=max_attempts {
            if attempt > 1 {
                tokio::time::sleep(self.config.retry.backoff(attempt - 1)).await;
                if !self.registry.is_active(&subscription.id) {
                    warn!(
                        "Stopped delivery of alert {} to {}: subscription disabled or removed",
                        payload.alert_id, subscription.name
                    );
                    return self.report(
                        subscription,
                        payload,
                        DeliveryStatus::Cancelled,
                        attempt - 1,
                    );
                }
            }

            match self.attempt(subscription, payload, attempt).await {
                Ok(()) => {
                    return self.report(subscription, payload, DeliveryStatus::Delivered, attempt);
                }
                Err(message) => {
                    debug!(
                        "Attempt {}/{} for alert {} to {} failed: {}",
                        attempt, max_attempts, payload.alert_id, subscription.name, message
                    );
                    last_error = message;
                }
            }
        }

        error!(
            "Webhook delivery of alert {} to {} failed after {} attempts: {}",
            payload.alert_id, subscription.url, max_attempts, last_error
        );
        self.report(
            subscription,
            payload,
            DeliveryStatus::Failed { error: last_error },
            max_attempts,
        )
    }

    async fn attempt(
        &self,
        subscription: &WebhookSubscription,
        payload: &AlertPayload,
        attempt_number: u32,
    ) -> Result<(), String> {
        let sent = match self.permits.acquire().await {
            Ok(_permit) => {
                self.record(DeliveryAttempt {
                    alert_id: payload.alert_id.clone(),
                    subscription_id: subscription.id.clone(),
                    attempt_number,
                    outcome: DeliveryOutcome::Pending,
                    attempted_at: Utc::now(),
                    status_code: None,
                    error: None,
                });
                self.transport.send(subscription, payload).await
            }
            Err(_) => Err(DispatchError::QueueClosed),
        };

        let (outcome, status_code, error) = match sent {
            Ok(code) if (200..300).contains(&code) => (DeliveryOutcome::Success, Some(code), None),
            Ok(code) => (
                DeliveryOutcome::Failed,
                Some(code),
                Some(format!("endpoint returned HTTP {}", code)),
            ),
            Err(e) => (DeliveryOutcome::Failed, None, Some(e.to_string())),
        };

        self.settle(DeliveryAttempt {
            alert_id: payload.alert_id.clone(),
            subscription_id: subscription.id.clone(),
            attempt_number,
            outcome,
            attempted_at: Utc::now(),
            status_code,
            error: error.clone(),
        });

        match error {
            None => Ok(()),
            Some(message) => Err(message),
        }
    }

    fn report(
        &self,
        subscription: &WebhookSubscription,
        payload: &AlertPayload,
        status: DeliveryStatus,
        attempts: u32,
    ) -> DeliveryReport {
        DeliveryReport {
            subscription_id: subscription.id.clone(),
            subscription_name: subscription.name.clone(),
            alert_id: payload.alert_id.clone(),
            status,
            attempts,
        }
    }

    fn record(&self, attempt: DeliveryAttempt) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.push_back(attempt);
        while log.len() > self.config.delivery_log_size {
            log.pop_front();
        }
    }

    /// Replace the pending entry for this attempt with its result. The pending entry
    /// keeps its start time.
    fn settle(&self, finished: DeliveryAttempt) {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let pending = log.iter_mut().rev().find(|a| {
            a.outcome == DeliveryOutcome::Pending
                && a.attempt_number == finished.attempt_number
                && a.alert_id == finished.alert_id
                && a.subscription_id == finished.subscription_id
        });
        match pending {
            Some(entry) => {
                entry.outcome = finished.outcome;
                entry.status_code = finished.status_code;
                entry.error = finished.error;
            }
            None => {
                log.push_back(finished);
                while log.len() > self.config.delivery_log_size {
                    log.pop_front();
                }
            }
        }
    }

    /// Most recent delivery attempts, newest first.
    pub fn recent_deliveries(&self, limit: usize) -> Vec<DeliveryAttempt> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.iter().rev().take(limit).cloned().collect()
    }

    /// Send a synthetic payload once to one subscription, enabled or not.
    pub async fn test_subscription(&self, id: &str) -> DispatchResult<DeliveryReport> {
        let subscription = self.registry.get(id)?;
        Ok(self
            .send_test(&subscription, &AlertPayload::test(Utc::now()))
            .await)
    }

    /// Send a synthetic payload once to every enabled subscription.
    pub async fn test_all(&self) -> Vec<DeliveryReport> {
        let payload = AlertPayload::test(Utc::now());
        let snapshot = self.registry.snapshot();
        let targets: Vec<&WebhookSubscription> = snapshot.values().filter(|s| s.enabled).collect();
        info!("Testing {} webhook subscription(s)", targets.len());

        join_all(targets.into_iter().map(|s| self.send_test(s, &payload))).await
    }

    async fn send_test(
        &self,
        subscription: &WebhookSubscription,
        payload: &AlertPayload,
    ) -> DeliveryReport {
        let status = match self.attempt(subscription, payload, 1).await {
            Ok(()) => DeliveryStatus::Delivered,
            Err(error) => {
                warn!("Webhook test for {} failed: {}", subscription.name, error);
                DeliveryStatus::Failed { error }
            }
        };
        self.report(subscription, payload, status, 1)
    }

    /// Start the queue worker. Each dequeued alert is dispatched on its own tracked task.
    pub fn spawn(self: Arc<Self>) -> DispatchWorker {
        let (sender, mut receiver) = mpsc::channel::<Alert>(self.config.queue_capacity);
        let (stop, mut stopped) = oneshot::channel::<()>();
        let grace = self.config.shutdown_grace();
        let dispatcher = self;

        let task = tokio::spawn(async move {
            info!("Webhook dispatch worker started");
            let mut deliveries = JoinSet::new();

            loop {
                tokio::select! {
                    received = receiver.recv() => match received {
                        Some(alert) => {
                            deliveries.spawn(Arc::clone(&dispatcher).dispatch_owned(alert));
                        }
                        None => break,
                    },
                    Some(_) = deliveries.join_next(), if !deliveries.is_empty() => {}
                    _ = &mut stopped => break,
                }
            }

            // No new alerts from here on; whatever was already accepted still goes out.
            receiver.close();
            let mut report = ShutdownReport::default();
            while let Some(alert) = receiver.recv().await {
                report.drained += 1;
                deliveries.spawn(Arc::clone(&dispatcher).dispatch_owned(alert));
            }

            let finished = tokio::time::timeout(grace, async {
                let mut completed = 0;
                while deliveries.join_next().await.is_some() {
                    completed += 1;
                }
                completed
            })
            .await;

            match finished {
                Ok(completed) => report.completed = completed,
                Err(_) => {
                    report.abandoned = deliveries.len();
                    warn!(
                        "Abandoning {} webhook deliveries still running after {:?}",
                        report.abandoned, grace
                    );
                    deliveries.abort_all();
                }
            }

            info!(
                "Webhook dispatch worker stopped: {} queued alert(s) flushed, {} abandoned",
                report.drained, report.abandoned
            );
            report
        });

        DispatchWorker {
            handle: DispatchHandle { sender },
            stop,
            task,
        }
    }

    async fn dispatch_owned(self: Arc<Self>, alert: Alert) -> DispatchSummary {
        let summary = self.dispatch(&alert).await;
        debug!(
            "Alert {} dispatched: {} delivered, {} failed",
            summary.alert_id,
            summary.delivered(),
            summary.failed()
        );
        summary
    }
}

/// Enqueues alerts for the dispatch worker without waiting for delivery.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    sender: mpsc::Sender<Alert>,
}

impl DispatchHandle {
    pub fn enqueue(&self, alert: Alert) -> DispatchResult<()> {
        self.sender.try_send(alert).map_err(|e| match e {
            mpsc::error::TrySendError::Full(alert) => {
                warn!("Dispatch queue full, dropping notification for alert {}", alert.alert_id);
                DispatchError::QueueFull
            }
            mpsc::error::TrySendError::Closed(_) => DispatchError::QueueClosed,
        })
    }
}

/// What happened to accepted notifications when the worker stopped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Alerts still queued at stop and dispatched during shutdown
    pub drained: usize,
    /// Deliveries that finished inside the grace period
    pub completed: usize,
    /// Deliveries cut off when the grace period ran out
    pub abandoned: usize,
}

/// Dropping the worker without [`DispatchWorker::shutdown`] still flushes the queue in
/// the background.
pub struct DispatchWorker {
    handle: DispatchHandle,
    stop: oneshot::Sender<()>,
    task: JoinHandle<ShutdownReport>,
}

impl DispatchWorker {
    pub fn handle(&self) -> DispatchHandle {
        self.handle.clone()
    }

    /// Stop accepting alerts, flush the queue and wait up to the configured grace period
    /// for in-flight deliveries.
    pub async fn shutdown(self) -> ShutdownReport {
        let _ = self.stop.send(());
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                warn!("Webhook dispatch worker ended abnormally: {}", e);
                ShutdownReport::default()
            }
        }
    }
}
