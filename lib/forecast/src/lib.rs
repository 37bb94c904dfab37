//! Epidemic mortality forecasting library
//!
//! Fits a continuous piecewise log-linear model to daily deaths, extrapolates
//! it with a confidence band and derives healthcare demand from the forecast
//! death curve.
//!
//! # Module Structure
//!
//! - `error`: Error taxonomy shared by every stage
//! - `params`: Epidemiological rates and delays, forecast options
//! - `series`: Date-indexed series and cleaning of cumulative counts
//! - `breakpoints`: Policy-change dates to fitting breakpoints
//! - `outlier`: Per-segment Huber regression used to reject outliers
//! - `piecewise`: Continuous piecewise-linear least squares
//! - `forecaster`: Smoothing, fitting, last-segment override and bands
//! - `derive`: Infections, hospitalizations and bed occupancy from deaths
//! - `metrics`: Daily and cumulative output tables
//! - `orchestrator`: Per-geography pipeline, back test, population
//!   adjustment and parallel batch runs
//! - `dist`: Normal distribution (error function and its inverse)
//! - `submission`: Weekly quantile forecasts by epiweek

pub mod breakpoints;
pub mod derive;
pub mod dist;
pub mod error;
pub mod forecaster;
pub mod metrics;
pub mod orchestrator;
pub mod outlier;
pub mod params;
pub mod piecewise;
pub mod series;
pub mod submission;

// Re-export commonly used types and functions for external use
pub use crate::error::{ForecastError, ForecastResult};
pub use crate::forecaster::{DeathForecast, DeathForecaster, LogForecast, ModelSummary};
pub use crate::metrics::{Metric, MetricTable};
pub use crate::orchestrator::{
    BatchForecast, GeographyForecast, GeographyForecaster, GeographyInput, LogDiagnostics,
};
pub use crate::params::{DelayParameters, EpiParameters, ForecastOptions, RateParameters};
pub use crate::series::TimeSeries;
pub use crate::submission::{SubmissionRow, weekly_quantile_forecast};
