pub mod analyzer;
pub mod config;
pub mod error;
pub mod forecaster;
pub mod impact;
pub mod scorer;
pub mod stats;
pub mod types;

pub use analyzer::{AnalysisReport, PatternAnalyzer};
pub use config::{AnalyzerConfig, ForecastConfig, ImpactConfig, MetricWeights, ScoringConfig};
pub use error::{HealthError, HealthResult};
pub use forecaster::{
    maintenance_outlook, score_trend, DowntimeForecaster, ForecastInput, HourlyOutlook,
    MaintenanceWindow, SignalForecaster,
};
pub use impact::ImpactEstimator;
pub use scorer::{HealthScorer, WeightedScorer};
pub use types::{
    hour_of_week, Anomaly, Confidence, FipProfile, Forecast, HealthAssessment, HealthStatus,
    Horizon, ImpactEstimate, MetricKind, MetricSnapshot, Pattern, PatternCategory, Recurrence,
    RiskLevel, SatisfactionImpact, Severity, Signal, TimeWindow,
};

pub mod prelude {
    pub use crate::analyzer::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::forecaster::*;
    pub use crate::impact::*;
    pub use crate::scorer::*;
    pub use crate::types::*;
}
