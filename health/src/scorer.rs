//! Composite health scoring
//!
//! A [`HealthScorer`] maps one [`MetricSnapshot`] to a [`HealthAssessment`]. The
//! default [`WeightedScorer`] normalizes each metric into `[0, 1]`, combines them
//! with configurable weights and scales the result to `[0, 10]`.
//!
//! # Examples
//!
//! ```rust
//! use chrono::Utc;
//! use health::{HealthScorer, HealthStatus, MetricSnapshot, WeightedScorer};
//!
//! let scorer = WeightedScorer::default();
//! let snapshot = MetricSnapshot::new("sbi-fip", Utc::now())
//!     .with_consent_rate(85.0)
//!     .with_data_fetch_rate(80.0)
//!     .with_response_time(1.0)
//!     .with_error_rate(5.0);
//!
//! let assessment = scorer.assess(&snapshot);
//! assert_eq!(assessment.status, HealthStatus::Healthy);
//! assert!((assessment.score - 8.65).abs() < 1e-9);
//! ```

use crate::config::ScoringConfig;
use crate::types::{HealthAssessment, HealthStatus, MetricKind, MetricSnapshot};
use tracing::warn;

pub trait HealthScorer: Send + Sync {
    /// Pure function of the snapshot and the scorer's thresholds.
    fn assess(&self, snapshot: &MetricSnapshot) -> HealthAssessment;

    fn scorer_name(&self) -> &'static str;
}

#[derive(Debug, Clone, Default)]
pub struct WeightedScorer {
    config: ScoringConfig,
}

impl WeightedScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Component score in `[0, 1]`, or `None` when the metric is missing or invalid.
    pub fn normalize(&self, metric: MetricKind, snapshot: &MetricSnapshot) -> Option<f64> {
        let value = snapshot.valid_value(metric)?;
        let normalized = match metric {
            MetricKind::ConsentSuccessRate | MetricKind::DataFetchSuccessRate => value / 100.0,
            MetricKind::AvgResponseTimeSeconds => {
                1.0 - value / self.config.max_response_time_seconds
            }
            MetricKind::ErrorRate => 1.0 - value / 100.0,
        };
        Some(normalized.clamp(0.0, 1.0))
    }
}

impl HealthScorer for WeightedScorer {
    fn assess(&self, snapshot: &MetricSnapshot) -> HealthAssessment {
        let mut weighted_sum = 0.0;
        let mut weight_total = 0.0;
        let mut excluded_metrics = Vec::new();

        for metric in MetricKind::ALL {
            match self.normalize(metric, snapshot) {
                Some(component) => {
                    let weight = self.config.weights.weight(metric);
                    weighted_sum += weight * component;
                    weight_total += weight;
                }
                None => excluded_metrics.push(metric),
            }
        }

        if weight_total <= 0.0 {
            return HealthAssessment {
                fip_id: snapshot.fip_id.clone(),
                score: 0.0,
                status: HealthStatus::Unknown,
                computed_at: snapshot.timestamp,
                excluded_metrics,
            };
        }

        let raw = weighted_sum / weight_total * 10.0;
        let score = if (0.0..=10.0).contains(&raw) {
            raw
        } else {
            warn!(
                "Composite score {} for {} fell outside [0, 10], clamping",
                raw, snapshot.fip_id
            );
            if raw.is_nan() {
                0.0
            } else {
                raw.clamp(0.0, 10.0)
            }
        };

        HealthAssessment {
            fip_id: snapshot.fip_id.clone(),
            score,
            status: self.config.classify(score),
            computed_at: snapshot.timestamp,
            excluded_metrics,
        }
    }

    fn scorer_name(&self) -> &'static str {
        "weighted"
    }
}
