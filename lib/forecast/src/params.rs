//! Epidemiological parameters and forecast options
//!
//! Rates and delays are immutable once built and are passed explicitly into
//! every derivation, so concurrent forecasts with different parameter sets
//! never observe each other.

use chrono::NaiveDate;
use derive_builder::Builder;
use serde::{Deserialize, Serialize};

use crate::error::{ForecastError, ForecastResult};

pub const DEFAULT_FORECAST_HORIZON: usize = 60;
pub const DEFAULT_CONTAIN_RATE: f64 = 0.8;
/// Width of the trailing mean applied to daily deaths before the log transform.
pub const SMOOTHING_DAYS: usize = 7;
pub const SMOOTHING_MIN_PERIODS: usize = 3;
pub const MIN_LAST_SEGMENT_POINTS: usize = 4;
pub const MAX_LAST_SLOPE: f64 = 0.3;
pub const DEFAULT_VACCINE_EFFICACY: f64 = 0.95;

/// Outcome rates, in percent of all infections.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateParameters {
    pub death_rate: f64,
    pub icu_rate: f64,
    pub hospital_rate: f64,
    pub symptom_rate: f64,
}

impl Default for RateParameters {
    fn default() -> Self {
        RateParameters {
            death_rate: 0.36,
            icu_rate: 0.78,
            hospital_rate: 2.18,
            symptom_rate: 10.2,
        }
    }
}

impl RateParameters {
    pub fn validate(&self) -> ForecastResult<()> {
        let rates = [
            ("death_rate", self.death_rate),
            ("icu_rate", self.icu_rate),
            ("hospital_rate", self.hospital_rate),
            ("symptom_rate", self.symptom_rate),
        ];
        for (name, rate) in rates {
            if !rate.is_finite() || rate <= 0.0 || rate > 100.0 {
                return Err(ForecastError::invalid(
                    name,
                    format!("{rate} must be a percentage in (0, 100]"),
                ));
            }
        }
        // death <= icu <= hospital <= symptom
        for pair in rates.windows(2) {
            let (lo_name, lo) = pair[0];
            let (hi_name, hi) = pair[1];
            if lo > hi {
                return Err(ForecastError::invalid(
                    hi_name,
                    format!("{hi} must not be below {lo_name} ({lo})"),
                ));
            }
        }
        Ok(())
    }

    /// Infections per death.
    pub fn infection_multiplier(&self) -> f64 {
        100.0 / self.death_rate
    }

    pub fn symptom_multiplier(&self) -> f64 {
        self.symptom_rate / self.death_rate
    }

    pub fn hospital_multiplier(&self) -> f64 {
        self.hospital_rate / self.death_rate
    }

    /// ICU patients who recover, per death.
    pub fn icu_recovery_ratio(&self) -> f64 {
        (self.icu_rate - self.death_rate) / self.death_rate
    }

    /// Hospital patients who never reach the ICU, per death.
    pub fn ward_only_ratio(&self) -> f64 {
        (self.hospital_rate - self.icu_rate) / self.death_rate
    }
}

/// Stage durations, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayParameters {
    pub infect_to_hospital: u32,
    pub hospital_to_icu: u32,
    pub icu_to_death: u32,
    pub icu_to_recover: u32,
    pub non_icu_discharge: u32,
}

impl Default for DelayParameters {
    fn default() -> Self {
        DelayParameters {
            infect_to_hospital: 11,
            hospital_to_icu: 4,
            icu_to_death: 4,
            icu_to_recover: 7,
            non_icu_discharge: 5,
        }
    }
}

impl DelayParameters {
    pub fn validate(&self) -> ForecastResult<()> {
        let delays = [
            ("infect_to_hospital", self.infect_to_hospital),
            ("hospital_to_icu", self.hospital_to_icu),
            ("icu_to_death", self.icu_to_death),
            ("icu_to_recover", self.icu_to_recover),
            ("non_icu_discharge", self.non_icu_discharge),
        ];
        for (name, days) in delays {
            if days == 0 {
                return Err(ForecastError::invalid(name, "delay must be at least 1 day"));
            }
        }
        Ok(())
    }

    /// Lag between a change in transmission and its effect on deaths.
    pub fn infection_to_death(&self) -> i64 {
        i64::from(self.infect_to_hospital) + self.hospital_to_death()
    }

    pub fn hospital_to_death(&self) -> i64 {
        i64::from(self.hospital_to_icu) + i64::from(self.icu_to_death)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct EpiParameters {
    pub rates: RateParameters,
    pub delays: DelayParameters,
}

impl EpiParameters {
    pub fn new(rates: RateParameters, delays: DelayParameters) -> ForecastResult<Self> {
        let params = EpiParameters { rates, delays };
        params.validate()?;
        Ok(params)
    }

    /// Rates calibrated for Vietnamese provinces.
    pub fn vietnam() -> Self {
        EpiParameters {
            rates: RateParameters {
                death_rate: 1.25,
                icu_rate: 3.75,
                hospital_rate: 7.5,
                symptom_rate: 12.5,
            },
            delays: DelayParameters::default(),
        }
    }

    pub fn validate(&self) -> ForecastResult<()> {
        self.rates.validate()?;
        self.delays.validate()
    }
}

/// Knobs of a single forecast run.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
#[builder(build_fn(validate = "Self::validate"))]
#[serde(default)]
pub struct ForecastOptions {
    /// Days forecast past the last observation.
    #[builder(default = "DEFAULT_FORECAST_HORIZON")]
    pub forecast_horizon: usize,
    /// Expected effectiveness of a policy response, used when the last segment
    /// cannot be trusted.
    #[builder(default = "DEFAULT_CONTAIN_RATE")]
    pub contain_rate: f64,
    #[builder(default = "SMOOTHING_DAYS")]
    pub smoothing_days: usize,
    #[builder(default = "SMOOTHING_MIN_PERIODS")]
    pub smoothing_min_periods: usize,
    #[builder(default = "MIN_LAST_SEGMENT_POINTS")]
    pub min_last_segment_points: usize,
    #[builder(default = "MAX_LAST_SLOPE")]
    pub max_last_slope: f64,
    /// Back-test cut-off: fit only on deaths reported up to this date.
    #[builder(default, setter(strip_option))]
    pub last_data_date: Option<NaiveDate>,
    #[builder(default = "true")]
    pub use_vaccine_data: bool,
    #[builder(default = "DEFAULT_VACCINE_EFFICACY")]
    pub vaccine_efficacy: f64,
}

impl Default for ForecastOptions {
    fn default() -> Self {
        ForecastOptions {
            forecast_horizon: DEFAULT_FORECAST_HORIZON,
            contain_rate: DEFAULT_CONTAIN_RATE,
            smoothing_days: SMOOTHING_DAYS,
            smoothing_min_periods: SMOOTHING_MIN_PERIODS,
            min_last_segment_points: MIN_LAST_SEGMENT_POINTS,
            max_last_slope: MAX_LAST_SLOPE,
            last_data_date: None,
            use_vaccine_data: true,
            vaccine_efficacy: DEFAULT_VACCINE_EFFICACY,
        }
    }
}

impl ForecastOptions {
    pub fn builder() -> ForecastOptionsBuilder {
        ForecastOptionsBuilder::default()
    }

    pub fn validate(&self) -> ForecastResult<()> {
        check_contain_rate(self.contain_rate).map_err(|e| ForecastError::invalid("contain_rate", e))?;
        check_smoothing(self.smoothing_days, self.smoothing_min_periods)
            .map_err(|e| ForecastError::invalid("smoothing_days", e))?;
        check_efficacy(self.vaccine_efficacy)
            .map_err(|e| ForecastError::invalid("vaccine_efficacy", e))?;
        if !self.max_last_slope.is_finite() || self.max_last_slope <= 0.0 {
            return Err(ForecastError::invalid(
                "max_last_slope",
                format!("{} must be positive", self.max_last_slope),
            ));
        }
        Ok(())
    }
}

impl ForecastOptionsBuilder {
    fn validate(&self) -> Result<(), String> {
        if let Some(rate) = self.contain_rate {
            check_contain_rate(rate)?;
        }
        let days = self.smoothing_days.unwrap_or(SMOOTHING_DAYS);
        let min_periods = self.smoothing_min_periods.unwrap_or(SMOOTHING_MIN_PERIODS);
        check_smoothing(days, min_periods)?;
        if let Some(efficacy) = self.vaccine_efficacy {
            check_efficacy(efficacy)?;
        }
        Ok(())
    }
}

fn check_contain_rate(rate: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&rate) {
        Ok(())
    } else {
        Err(format!("contain_rate must be in [0, 1], got {rate}"))
    }
}

fn check_smoothing(days: usize, min_periods: usize) -> Result<(), String> {
    if days == 0 || min_periods == 0 || min_periods > days {
        Err(format!(
            "smoothing window {days} with min periods {min_periods} is not usable"
        ))
    } else {
        Ok(())
    }
}

fn check_efficacy(efficacy: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&efficacy) {
        Ok(())
    } else {
        Err(format!("vaccine_efficacy must be in [0, 1], got {efficacy}"))
    }
}
