//! Error types for the forecasting core
//!
//! Only whole-series failures surface as [`ForecastError`]. Failures local to a
//! segment fit are swallowed by the outlier filter, and batch runs collect
//! per-geography failures instead of aborting.

use thiserror::Error;

/// Crate-wide result alias.
pub type ForecastResult<T> = Result<T, ForecastError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ForecastError {
    /// No fit can be attempted at all, the geography must be abandoned.
    #[error("insufficient data for {stage}: {reason}")]
    InsufficientData { stage: &'static str, reason: String },

    #[error("invalid parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },

    #[error("invalid series: {0}")]
    InvalidSeries(String),

    #[error("numerical error: {0}")]
    Numerical(String),
}

impl ForecastError {
    pub fn insufficient(stage: &'static str, reason: impl Into<String>) -> Self {
        ForecastError::InsufficientData {
            stage,
            reason: reason.into(),
        }
    }

    pub fn invalid(name: &'static str, reason: impl Into<String>) -> Self {
        ForecastError::InvalidParameter {
            name,
            reason: reason.into(),
        }
    }

    pub fn is_insufficient_data(&self) -> bool {
        matches!(self, ForecastError::InsufficientData { .. })
    }
}
