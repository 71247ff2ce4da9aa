//! Evaluation cadence
//!
//! Two background loops drive the pipeline: a short metrics refresh that scores and
//! alerts with cached analysis, and a longer prediction refresh that re-analyzes
//! history and recomputes forecasts. Alerts that should be notified are handed to the
//! dispatch queue; evaluation never waits on delivery.

use crate::pipeline::{CycleReport, Pipeline, Stage};
use crate::webhook::DispatchHandle;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between metrics refreshes
    pub metrics_interval_secs: u64,
    /// Seconds between prediction refreshes
    pub prediction_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            metrics_interval_secs: 120,
            prediction_interval_secs: 900,
        }
    }
}

impl SchedulerConfig {
    pub fn with_intervals(metrics_interval_secs: u64, prediction_interval_secs: u64) -> Self {
        Self {
            metrics_interval_secs,
            prediction_interval_secs,
        }
    }

    pub fn interval(&self, stage: Stage) -> Duration {
        match stage {
            Stage::Metrics => Duration::from_secs(self.metrics_interval_secs),
            Stage::Full => Duration::from_secs(self.prediction_interval_secs),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.metrics_interval_secs == 0 || self.prediction_interval_secs == 0 {
            return Err("Refresh intervals must be greater than 0".to_string());
        }

        Ok(())
    }
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    notifier: Option<DispatchHandle>,
    config: SchedulerConfig,
    tasks: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, config: SchedulerConfig) -> Self {
        Self {
            pipeline,
            notifier: None,
            config,
            tasks: Vec::new(),
        }
    }

    /// Forward notifiable alert transitions to this dispatch queue. Takes effect on
    /// the next start.
    pub fn set_notifier(&mut self, notifier: Option<DispatchHandle>) {
        self.notifier = notifier;
    }

    pub fn is_running(&self) -> bool {
        !self.tasks.is_empty()
    }

    /// Run one cycle now and notify subscribers of its transitions.
    pub async fn run_once(&self, stage: Stage) -> CycleReport {
        run_cycle(&self.pipeline, self.notifier.as_ref(), stage).await
    }

    pub fn start(&mut self) {
        if self.is_running() {
            warn!("Scheduler already running");
            return;
        }

        info!(
            "Starting scheduler: metrics every {}s, predictions every {}s",
            self.config.metrics_interval_secs, self.config.prediction_interval_secs
        );

        for stage in [Stage::Full, Stage::Metrics] {
            let pipeline = Arc::clone(&self.pipeline);
            let notifier = self.notifier.clone();
            let period = self.config.interval(stage);

            let task = tokio::spawn(async move {
                let mut ticker = interval(period);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                loop {
                    ticker.tick().await;
                    debug!("Running {} refresh", stage);
                    run_cycle(&pipeline, notifier.as_ref(), stage).await;
                }
            });
            self.tasks.push(task);
        }
    }

    pub fn stop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
        info!("Scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn run_cycle(
    pipeline: &Pipeline,
    notifier: Option<&DispatchHandle>,
    stage: Stage,
) -> CycleReport {
    let report = pipeline.evaluate_all(stage, Utc::now()).await;

    if let Some(notifier) = notifier {
        for transition in report.notifications() {
            if let Err(e) = notifier.enqueue(transition.alert().clone()) {
                warn!(
                    "Could not queue notification for alert {}: {}",
                    transition.alert().alert_id,
                    e
                );
            }
        }
    }

    report
}
