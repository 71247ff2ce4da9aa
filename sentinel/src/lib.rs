pub mod alerts;
pub mod config;
pub mod pipeline;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod system;
pub mod telemetry;
pub mod webhook;

pub use alerts::{
    Alert, AlertContext, AlertEngine, AlertError, AlertFilter, AlertMetrics, AlertResult,
    AlertRules, AlertStatus, AlertSummary, AlertTransition, AlertType, FipEvaluation,
};
pub use config::{ConfigError, ConfigResult, SentinelConfig, StoreBackend};
pub use pipeline::{
    CycleReport, FipOutlook, FipPrediction, FipStatus, Pipeline, PipelineConfig, PipelineError,
    PipelineResult, PredictionReport, Stage,
};
pub use registry::{
    HttpMethod, RegistryError, RegistryResult, SubscriptionDraft, SubscriptionRegistry,
    WebhookSubscription,
};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use store::{
    InMemoryMetricStore, MetricStore, PrometheusConfig, PrometheusMetricStore, StoreError,
    StoreResult,
};
pub use system::{
    CycleOutcome, FipStatusView, SentinelBuilder, SentinelError, SentinelResult, SentinelSystem,
    SystemOverview,
};
pub use telemetry::{init_tracing, TelemetryConfig, TelemetryError};
pub use webhook::{
    AlertPayload, DeliveryAttempt, DeliveryReport, DeliveryStatus, DispatchError, DispatchHandle,
    DispatchResult, DispatchSummary, DispatcherConfig, HttpTransport, RetryPolicy,
    ShutdownReport, WebhookDispatcher, WebhookTransport,
};

pub mod prelude {
    pub use crate::alerts::*;
    pub use crate::config::*;
    pub use crate::pipeline::*;
    pub use crate::registry::*;
    pub use crate::scheduler::*;
    pub use crate::store::*;
    pub use crate::system::*;
    pub use crate::telemetry::*;
    pub use crate::webhook::*;
}
