use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum HealthError {
    #[error("Snapshot is missing a FIP identifier")]
    MissingFipId,

    #[error("Invalid snapshot for {fip_id}: {reason}")]
    InvalidSnapshot { fip_id: String, reason: String },

    #[error("FIP {fip_id} cannot be forecast: {reason}")]
    NotForecastable { fip_id: String, reason: String },

    #[error("Forecast for {forecast_fip} does not match profile {profile_fip}")]
    ProfileMismatch {
        forecast_fip: String,
        profile_fip: String,
    },

    #[error("Invalid horizon: {value}")]
    InvalidHorizon { value: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

pub type HealthResult<T> = Result<T, HealthError>;
