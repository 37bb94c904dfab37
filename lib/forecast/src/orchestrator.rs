//! Per-geography forecast pipeline and batch runs
//!
//! One geography is forecast as: clean the cumulative deaths, fit and
//! extrapolate them, derive the healthcare metrics, and, when the population
//! is known, refit once with deaths deflated by the remaining susceptible
//! fraction. Geographies are independent, so a batch runs them in parallel
//! and a failing geography is reported without stopping the others.

use chrono::NaiveDate;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::derive::DerivedMetrics;
use crate::error::{ForecastError, ForecastResult};
use crate::forecaster::{DeathForecaster, LogForecast, ModelSummary};
use crate::metrics::{Metric, MetricTable};
use crate::params::{EpiParameters, ForecastOptions};
use crate::series::{TimeSeries, offset_date, preprocess_cumulative, rolling_mean};

/// Lower clip of the susceptible fraction.
pub const MIN_POP_RATIO: f64 = 0.0001;

/// Raw inputs of one geography, as supplied by the data layer.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GeographyInput {
    pub name: String,
    /// Cumulative deaths by date; `None` marks an unreported day.
    pub deaths: Vec<(NaiveDate, Option<f64>)>,
    pub confirmed: Option<Vec<(NaiveDate, Option<f64>)>>,
    pub policy_change_dates: Vec<NaiveDate>,
    pub population: Option<f64>,
    /// Projected percentage of the population fully vaccinated.
    pub vaccinated: Option<TimeSeries>,
    /// Explicit susceptible fraction; disables the computed adjustment.
    pub pop_ratio: Option<TimeSeries>,
}

impl GeographyInput {
    pub fn new(name: impl Into<String>, deaths: Vec<(NaiveDate, Option<f64>)>) -> Self {
        GeographyInput {
            name: name.into(),
            deaths,
            ..Default::default()
        }
    }

    pub fn with_confirmed(mut self, confirmed: Vec<(NaiveDate, Option<f64>)>) -> Self {
        self.confirmed = Some(confirmed);
        self
    }

    pub fn with_policy_change_dates(mut self, dates: Vec<NaiveDate>) -> Self {
        self.policy_change_dates = dates;
        self
    }

    pub fn with_population(mut self, population: f64) -> Self {
        self.population = Some(population);
        self
    }

    pub fn with_vaccinated(mut self, vaccinated: TimeSeries) -> Self {
        self.vaccinated = Some(vaccinated);
        self
    }

    pub fn with_pop_ratio(mut self, pop_ratio: TimeSeries) -> Self {
        self.pop_ratio = Some(pop_ratio);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeographyForecast {
    pub name: String,
    pub daily: MetricTable,
    pub cumulative: MetricTable,
    pub summary: ModelSummary,
    /// Susceptible fraction used by the final fit, if any.
    pub pop_ratio: Option<TimeSeries>,
    /// Cut-off of a back test.
    pub last_data_date: Option<NaiveDate>,
}

/// Log-scale view of a fit next to the log of every observed daily count.
#[derive(Debug, Clone, PartialEq)]
pub struct LogDiagnostics {
    pub name: String,
    pub observed: TimeSeries,
    pub forecast: LogForecast,
}

#[derive(Debug, Default)]
pub struct BatchForecast {
    pub forecasts: Vec<GeographyForecast>,
    pub failures: Vec<(String, ForecastError)>,
}

impl BatchForecast {
    /// Per-date sum of every successful daily table.
    pub fn aggregate_daily(&self) -> MetricTable {
        MetricTable::sum(self.forecasts.iter().map(|f| &f.daily))
    }

    pub fn aggregate_cumulative(&self) -> MetricTable {
        MetricTable::sum(self.forecasts.iter().map(|f| &f.cumulative))
    }
}

/// Susceptible fraction `delay` days after each date of `cumulative_infected`:
/// the share never infected, discounted by effective vaccination, clipped to
/// `[MIN_POP_RATIO, 1]`. Missing vaccination counts as none.
pub fn population_ratio(
    cumulative_infected: &TimeSeries,
    population: f64,
    vaccinated: Option<&TimeSeries>,
    vaccine_efficacy: f64,
    delay: i64,
) -> TimeSeries {
    cumulative_infected.shift_days(delay).map_values_dated(|date, infected| {
        let vacc = vaccinated
            .and_then(|v| v.get(date))
            .filter(|v| v.is_finite())
            .unwrap_or(0.0);
        let ratio = (population - infected) / population * (1.0 - vaccine_efficacy * vacc / 100.0);
        ratio.clamp(MIN_POP_RATIO, 1.0)
    })
}

#[derive(Debug, Clone)]
pub struct GeographyForecaster {
    forecaster: DeathForecaster,
}

impl GeographyForecaster {
    pub fn new(params: EpiParameters, options: ForecastOptions) -> ForecastResult<Self> {
        Ok(GeographyForecaster {
            forecaster: DeathForecaster::new(params, options)?,
        })
    }

    pub fn params(&self) -> &EpiParameters {
        self.forecaster.params()
    }

    pub fn options(&self) -> &ForecastOptions {
        self.forecaster.options()
    }

    pub fn forecast_geography(&self, input: &GeographyInput) -> ForecastResult<GeographyForecast> {
        let opts = self.options();
        let full = preprocess_cumulative(&input.deaths);
        let fit_series = match opts.last_data_date {
            Some(cut) => full.truncate_after(cut),
            None => full.clone(),
        };
        let confirmed = input
            .confirmed
            .as_deref()
            .map(|raw| preprocess_cumulative(raw).daily())
            .unwrap_or_default();

        let policy = &input.policy_change_dates;
        let (mut daily, mut summary) =
            self.daily_table(&full, &fit_series, &confirmed, policy, input.pop_ratio.as_ref())?;
        let mut pop_ratio = input.pop_ratio.clone();

        let population = input.population.filter(|p| *p > 0.0);
        if let (None, true, Some(population)) = (&input.pop_ratio, opts.use_vaccine_data, population) {
            let ratio = population_ratio(
                &daily.cumulative().series(Metric::Infected),
                population,
                input.vaccinated.as_ref(),
                opts.vaccine_efficacy,
                self.params().delays.infection_to_death(),
            );
            debug!(geography = %input.name, dates = ratio.len(), "refitting with population ratio");
            (daily, summary) = self.daily_table(&full, &fit_series, &confirmed, policy, Some(&ratio))?;
            pop_ratio = Some(ratio);
        }

        Ok(GeographyForecast {
            name: input.name.clone(),
            cumulative: daily.cumulative(),
            daily,
            summary,
            pop_ratio,
            last_data_date: opts.last_data_date,
        })
    }

    /// Log-scale fit over the configured horizon, for diagnostics.
    pub fn forecast_log(&self, input: &GeographyInput) -> ForecastResult<LogDiagnostics> {
        let full = preprocess_cumulative(&input.deaths);
        let fit_series = match self.options().last_data_date {
            Some(cut) => full.truncate_after(cut),
            None => full.clone(),
        };
        let forecast = self.forecaster.forecast_log(
            &fit_series,
            &input.policy_change_dates,
            self.options().forecast_horizon,
            input.pop_ratio.as_ref(),
        )?;
        let observed = TimeSeries::from_pairs(
            full.daily()
                .iter()
                .filter(|(_, v)| *v > 0.0)
                .map(|(d, v)| (d, v.ln())),
        )?;
        Ok(LogDiagnostics {
            name: input.name.clone(),
            observed,
            forecast,
        })
    }

    /// Forecasts every geography in parallel. Results keep the input order.
    pub fn forecast_batch(&self, inputs: &[GeographyInput]) -> BatchForecast {
        let results: Vec<(String, ForecastResult<GeographyForecast>)> = inputs
            .par_iter()
            .map(|input| (input.name.clone(), self.forecast_geography(input)))
            .collect();
        let mut batch = BatchForecast::default();
        for (name, result) in results {
            match result {
                Ok(forecast) => batch.forecasts.push(forecast),
                Err(e) => {
                    warn!(geography = %name, error = %e, "skipping geography");
                    batch.failures.push((name, e));
                }
            }
        }
        info!(
            succeeded = batch.forecasts.len(),
            failed = batch.failures.len(),
            "batch forecast finished"
        );
        batch
    }

    fn daily_table(
        &self,
        full: &TimeSeries,
        fit_series: &TimeSeries,
        confirmed: &TimeSeries,
        policy_change_dates: &[NaiveDate],
        pop_ratio: Option<&TimeSeries>,
    ) -> ForecastResult<(MetricTable, ModelSummary)> {
        let opts = self.options();
        let params = self.params();
        let extended = opts.forecast_horizon + params.delays.infection_to_death().max(0) as usize;
        let forecast = self
            .forecaster
            .forecast(fit_series, policy_change_dates, extended, pop_ratio)?;
        let predicted = forecast.predicted_series();
        let derived = DerivedMetrics::from_deaths(&predicted, params);

        // a back test still shows every observation, not only the fitted ones
        let observed = if opts.last_data_date.is_some() { full } else { fit_series };
        let death = observed.daily();
        let end = fit_series
            .last_date()
            .map(|d| offset_date(d, opts.forecast_horizon as i64));

        let mut table = MetricTable::from_series(
            &[
                (Metric::Death, &death),
                (Metric::AvgDeath7d, &self.smoothed(&death)),
                (Metric::PredictedDeath, &predicted),
                (Metric::LowerBound, &forecast.lower_series()),
                (Metric::UpperBound, &forecast.upper_series()),
                (Metric::Confirmed, &TimeSeries::default()),
                (Metric::Infected, &derived.infected),
                (Metric::Symptomatic, &derived.symptomatic),
                (Metric::Hospitalized, &derived.hospitalized),
                (Metric::Icu, &derived.icu),
                (Metric::HospitalBeds, &derived.hospital_beds),
            ],
            end,
        );
        // confirmed cases never extend the date range
        table.set_column(Metric::Confirmed, confirmed);
        Ok((table, forecast.summary))
    }

    fn smoothed(&self, daily: &TimeSeries) -> TimeSeries {
        let opts = self.options();
        let avg = rolling_mean(daily.values(), opts.smoothing_days, opts.smoothing_min_periods);
        let pairs = daily
            .dates()
            .iter()
            .zip(avg)
            .filter_map(|(d, v)| v.map(|v| (*d, v)));
        TimeSeries::from_pairs(pairs).unwrap_or_default()
    }
}
