//! Healthcare metrics imputed from a daily death curve
//!
//! Infections, symptomatic and hospitalized cases are the death curve moved
//! earlier in time and scaled by a rate ratio. ICU and hospital-bed occupancy
//! spread every death day over the days its patients occupied a bed, which is
//! a discrete convolution with a fixed kernel.

use smallvec::SmallVec;

use crate::error::{ForecastError, ForecastResult};
use crate::params::EpiParameters;
use crate::series::{TimeSeries, day_index, offset_date};

/// Constant occupancy over `periods` days ending `end_offset` days after the
/// death day.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pulse {
    pub periods: i64,
    pub end_offset: i64,
    pub scale: f64,
}

impl Pulse {
    pub fn new(periods: i64, end_offset: i64, scale: f64) -> Self {
        Pulse {
            periods,
            end_offset,
            scale,
        }
    }

    fn first_offset(&self) -> i64 {
        self.end_offset - self.periods + 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OccupancyKernel {
    pulses: SmallVec<[Pulse; 3]>,
    /// Days dropped from the end of the convolved series.
    trim: usize,
}

impl OccupancyKernel {
    pub fn from_pulses(pulses: &[Pulse], trim: usize) -> ForecastResult<Self> {
        if pulses.is_empty() {
            return Err(ForecastError::invalid("pulses", "kernel needs at least one pulse"));
        }
        if let Some(p) = pulses.iter().find(|p| p.periods < 1 || !p.scale.is_finite()) {
            return Err(ForecastError::invalid(
                "pulses",
                format!("pulse of {} days scaled by {} is not usable", p.periods, p.scale),
            ));
        }
        Ok(OccupancyKernel {
            pulses: pulses.iter().copied().collect(),
            trim,
        })
    }

    /// ICU beds: patients who die occupy one for the last `icu_to_death` days,
    /// ICU survivors for `icu_to_recover` days.
    pub fn icu(params: &EpiParameters) -> Self {
        let d = &params.delays;
        let (to_death, to_recover) = (i64::from(d.icu_to_death), i64::from(d.icu_to_recover));
        OccupancyKernel {
            pulses: SmallVec::from_slice(&[
                Pulse::new(to_death, 0, 1.0),
                Pulse::new(to_recover, to_recover - to_death, params.rates.icu_recovery_ratio()),
            ]),
            trim: d.icu_to_recover as usize,
        }
    }

    /// Hospital beds: deaths, ICU survivors, and patients discharged without
    /// ever needing intensive care.
    pub fn hospital_beds(params: &EpiParameters) -> Self {
        let d = &params.delays;
        let to_icu = i64::from(d.hospital_to_icu);
        let to_death = i64::from(d.icu_to_death);
        let to_recover = i64::from(d.icu_to_recover);
        let discharge = i64::from(d.non_icu_discharge);
        let rates = &params.rates;
        let survivor_stay = to_icu + to_recover + discharge;
        OccupancyKernel {
            pulses: SmallVec::from_slice(&[
                Pulse::new(to_icu + to_death, 0, 1.0),
                Pulse::new(
                    survivor_stay,
                    to_recover - to_death + discharge,
                    rates.icu_recovery_ratio(),
                ),
                Pulse::new(
                    discharge,
                    -to_icu - to_death + discharge,
                    rates.ward_only_ratio(),
                ),
            ]),
            trim: survivor_stay as usize,
        }
    }

    /// Offset of the first weight, and the weights per consecutive day offset.
    pub fn weights(&self) -> (i64, Vec<f64>) {
        let lo = self.pulses.iter().map(Pulse::first_offset).min().unwrap_or(0);
        let hi = self.pulses.iter().map(|p| p.end_offset).max().unwrap_or(0);
        let mut weights = vec![0.0; (hi - lo + 1) as usize];
        for pulse in &self.pulses {
            for offset in pulse.first_offset()..=pulse.end_offset {
                weights[(offset - lo) as usize] += pulse.scale;
            }
        }
        (lo, weights)
    }

    /// Bed-days generated by a single death.
    pub fn total_mass(&self) -> f64 {
        self.pulses.iter().map(|p| p.periods as f64 * p.scale).sum()
    }

    /// Superposes every death day's pulses. The output covers consecutive days
    /// from the earliest to the latest pulse day, minus the trailing trim;
    /// calendar days absent from the input contribute nothing.
    pub fn apply(&self, daily_deaths: &TimeSeries) -> TimeSeries {
        let (Some(first), Some(last)) = (daily_deaths.first_date(), daily_deaths.last_date()) else {
            return TimeSeries::default();
        };
        let (lo, weights) = self.weights();
        let span = day_index(first, last) as usize + weights.len();
        let mut occupancy = vec![0.0; span];
        for (date, deaths) in daily_deaths.iter().filter(|(_, v)| v.is_finite()) {
            let base = day_index(first, date) as usize;
            for (slot, w) in occupancy[base..base + weights.len()].iter_mut().zip(&weights) {
                *slot += w * deaths;
            }
        }
        occupancy.truncate(span.saturating_sub(self.trim));
        TimeSeries::from_start(offset_date(first, lo), occupancy)
    }
}

pub fn infected(daily_deaths: &TimeSeries, params: &EpiParameters) -> TimeSeries {
    let scale = params.rates.infection_multiplier();
    daily_deaths
        .shift_days(-params.delays.infection_to_death())
        .map_values(|v| v * scale)
}

pub fn symptomatic(daily_deaths: &TimeSeries, params: &EpiParameters) -> TimeSeries {
    let scale = params.rates.symptom_multiplier();
    daily_deaths
        .shift_days(-params.delays.hospital_to_death())
        .map_values(|v| v * scale)
}

pub fn hospitalized(daily_deaths: &TimeSeries, params: &EpiParameters) -> TimeSeries {
    let scale = params.rates.hospital_multiplier();
    daily_deaths
        .shift_days(-params.delays.hospital_to_death())
        .map_values(|v| v * scale)
}

pub fn icu_occupancy(daily_deaths: &TimeSeries, params: &EpiParameters) -> TimeSeries {
    OccupancyKernel::icu(params).apply(daily_deaths)
}

pub fn hospital_bed_occupancy(daily_deaths: &TimeSeries, params: &EpiParameters) -> TimeSeries {
    OccupancyKernel::hospital_beds(params).apply(daily_deaths)
}

/// Every metric derived from one death curve.
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedMetrics {
    pub infected: TimeSeries,
    pub symptomatic: TimeSeries,
    pub hospitalized: TimeSeries,
    pub icu: TimeSeries,
    pub hospital_beds: TimeSeries,
}

impl DerivedMetrics {
    pub fn from_deaths(daily_deaths: &TimeSeries, params: &EpiParameters) -> Self {
        DerivedMetrics {
            infected: infected(daily_deaths, params),
            symptomatic: symptomatic(daily_deaths, params),
            hospitalized: hospitalized(daily_deaths, params),
            icu: icu_occupancy(daily_deaths, params),
            hospital_beds: hospital_bed_occupancy(daily_deaths, params),
        }
    }
}
