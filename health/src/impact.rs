use crate::config::ImpactConfig;
use crate::error::{HealthError, HealthResult};
use crate::types::{
    FipProfile, Forecast, ImpactEstimate, RiskLevel, SatisfactionImpact, Severity,
};

/// Turns a forecast into user and cost impact for one FIP.
#[derive(Debug, Clone, Default)]
pub struct ImpactEstimator {
    config: ImpactConfig,
}

impl ImpactEstimator {
    pub fn new(config: ImpactConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ImpactConfig {
        &self.config
    }

    pub fn severity_tier(&self, probability: f64) -> Severity {
        if probability > self.config.severe_probability {
            Severity::Critical
        } else if probability > self.config.moderate_probability {
            Severity::Warning
        } else {
            Severity::Info
        }
    }

    pub fn estimate(
        &self,
        forecast: &Forecast,
        profile: &FipProfile,
    ) -> HealthResult<ImpactEstimate> {
        if forecast.fip_id != profile.fip_id {
            return Err(HealthError::ProfileMismatch {
                forecast_fip: forecast.fip_id.clone(),
                profile_fip: profile.fip_id.clone(),
            });
        }

        let probability = forecast.probability.clamp(0.0, 1.0);
        // f64::round rounds half away from zero.
        let affected_users = (profile.user_base as f64 * probability).round() as u64;
        let revenue_impact = affected_users as f64 * self.config.revenue_per_user;
        let operational_cost = affected_users as f64 * self.config.operational_cost_per_user;

        let severity_tier = self.severity_tier(probability);
        let satisfaction_impact = match severity_tier {
            Severity::Critical => SatisfactionImpact::Severe,
            Severity::Warning => SatisfactionImpact::Moderate,
            Severity::Info => SatisfactionImpact::Minor,
        };

        let sla_breach_risk = if probability > self.config.sla_high_probability {
            RiskLevel::High
        } else if probability > self.config.sla_medium_probability {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        Ok(ImpactEstimate {
            fip_id: profile.fip_id.clone(),
            bank_name: profile.bank_name.clone(),
            probability,
            affected_users,
            cost_estimate: revenue_impact + operational_cost,
            revenue_impact,
            operational_cost,
            severity_tier,
            satisfaction_impact,
            sla_breach_risk,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Confidence, Horizon, TimeWindow};
    use chrono::Utc;

    fn forecast(fip: &str, probability: f64) -> Forecast {
        Forecast {
            fip_id: fip.to_string(),
            probability,
            time_window: TimeWindow::Relative {
                label: "next 30 minutes".to_string(),
                within_minutes: 30,
            },
            confidence: Confidence::Medium,
            signals: Vec::new(),
            reasoning: String::new(),
            generated_at: Utc::now(),
            horizon: Horizon::DAY,
        }
    }

    #[test]
    fn test_affected_users_are_probability_weighted() {
        let estimator = ImpactEstimator::default();
        let profile = FipProfile::new("sbi-fip", "State Bank of India", 1000);
        let impact = estimator.estimate(&forecast("sbi-fip", 0.95), &profile).unwrap();

        assert_eq!(impact.affected_users, 950);
        assert_eq!(impact.revenue_impact, 950.0 * 150.0);
        assert_eq!(impact.operational_cost, 950.0 * 50.0);
        assert_eq!(impact.cost_estimate, 950.0 * 200.0);
        assert_eq!(impact.satisfaction_impact, SatisfactionImpact::Severe);
        assert_eq!(impact.severity_tier, Severity::Critical);
        assert_eq!(impact.sla_breach_risk, RiskLevel::High);
    }

    #[test]
    fn test_rounding_half_away_from_zero() {
        let estimator = ImpactEstimator::default();
        let profile = FipProfile::new("hdfc-fip", "HDFC Bank", 5);
        let impact = estimator.estimate(&forecast("hdfc-fip", 0.5), &profile).unwrap();
        assert_eq!(impact.affected_users, 3);
        assert_eq!(impact.satisfaction_impact, SatisfactionImpact::Moderate);
        assert_eq!(impact.sla_breach_risk, RiskLevel::Medium);
    }

    #[test]
    fn test_empty_user_base_has_no_impact() {
        let estimator = ImpactEstimator::default();
        let profile = FipProfile::new("new-fip", "New Bank", 0);
        let impact = estimator.estimate(&forecast("new-fip", 0.99), &profile).unwrap();
        assert_eq!(impact.affected_users, 0);
        assert_eq!(impact.cost_estimate, 0.0);
    }

    #[test]
    fn test_low_probability_is_minor() {
        let estimator = ImpactEstimator::default();
        let profile = FipProfile::new("axis-fip", "Axis Bank", 2500);
        let impact = estimator.estimate(&forecast("axis-fip", 0.1), &profile).unwrap();
        assert_eq!(impact.affected_users, 250);
        assert_eq!(impact.satisfaction_impact, SatisfactionImpact::Minor);
        assert_eq!(impact.sla_breach_risk, RiskLevel::Low);
    }

    #[test]
    fn test_mismatched_profile_is_rejected() {
        let estimator = ImpactEstimator::default();
        let profile = FipProfile::new("axis-fip", "Axis Bank", 2500);
        assert!(matches!(
            estimator.estimate(&forecast("sbi-fip", 0.5), &profile),
            Err(HealthError::ProfileMismatch { .. })
        ));
    }
}
