//! Piecewise log-linear death forecaster
//!
//! Daily deaths of an epidemic in its growth phase behave like `d(t) = b·a^t`,
//! which is a line after a log transform. Policy changes bend the line, so the
//! log series is fitted with a continuous piecewise-linear model whose
//! breakpoints are the policy-effective dates, then extrapolated.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{debug, warn};

use crate::breakpoints::{policy_effective_dates, resolve_breakpoints};
use crate::error::{ForecastError, ForecastResult};
use crate::outlier::outlier_mask;
use crate::params::{EpiParameters, ForecastOptions};
use crate::piecewise::{PiecewiseModel, Segment, fit_with_breaks};
use crate::series::{TimeSeries, day_index, offset_date, rolling_mean};

/// Two-sided 95% normal quantile.
pub const Z_95: f64 = 1.96;
/// Smoothed daily deaths at or below this are unobservable in log space.
pub const MIN_OBSERVABLE: f64 = 0.01;

/// Diagnostics of one fit, suitable for logging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelSummary {
    pub series_start: NaiveDate,
    pub breakpoints: Vec<i64>,
    /// Coefficients as fitted, before any last-segment override.
    pub coefficients: Vec<f64>,
    /// Segments actually used for prediction.
    pub segments: Vec<Segment>,
    pub override_applied: bool,
    pub fitted_points: usize,
    pub outliers: usize,
}

impl ModelSummary {
    pub fn breakpoint_dates(&self) -> Vec<NaiveDate> {
        self.breakpoints
            .iter()
            .map(|b| offset_date(self.series_start, *b))
            .collect()
    }
}

/// Log-scale forecast over contiguous days from the series start.
#[derive(Debug, Clone, PartialEq)]
pub struct LogForecast {
    pub dates: Vec<NaiveDate>,
    pub mean: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    /// Smoothed log deaths that entered the fit (before outlier removal).
    pub observed: Vec<Option<f64>>,
    pub summary: ModelSummary,
}

impl LogForecast {
    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn into_death_forecast(self) -> DeathForecast {
        DeathForecast {
            predicted: self.mean.iter().map(|v| v.exp()).collect(),
            lower: self.lower.iter().map(|v| v.exp()).collect(),
            upper: self.upper.iter().map(|v| v.exp()).collect(),
            dates: self.dates,
            summary: self.summary,
        }
    }
}

/// Daily death forecast on the count scale.
#[derive(Debug, Clone, PartialEq)]
pub struct DeathForecast {
    pub dates: Vec<NaiveDate>,
    pub predicted: Vec<f64>,
    pub lower: Vec<f64>,
    pub upper: Vec<f64>,
    pub summary: ModelSummary,
}

impl DeathForecast {
    pub fn predicted_series(&self) -> TimeSeries {
        self.to_series(&self.predicted)
    }

    pub fn lower_series(&self) -> TimeSeries {
        self.to_series(&self.lower)
    }

    pub fn upper_series(&self) -> TimeSeries {
        self.to_series(&self.upper)
    }

    fn to_series(&self, values: &[f64]) -> TimeSeries {
        match self.dates.first() {
            Some(start) => TimeSeries::from_start(*start, values.to_vec()),
            None => TimeSeries::default(),
        }
    }
}

/// Replacement slope for an untrustworthy last segment.
pub fn contained_slope(previous_slope: f64, contain_rate: f64) -> f64 {
    if previous_slope < 0.0 {
        -previous_slope * (1.0 - contain_rate)
    } else {
        -previous_slope * (1.0 + contain_rate)
    }
}

#[derive(Debug, Clone)]
pub struct DeathForecaster {
    params: EpiParameters,
    options: ForecastOptions,
}

impl DeathForecaster {
    pub fn new(params: EpiParameters, options: ForecastOptions) -> ForecastResult<Self> {
        params.validate()?;
        options.validate()?;
        Ok(DeathForecaster { params, options })
    }

    pub fn params(&self) -> &EpiParameters {
        &self.params
    }

    pub fn options(&self) -> &ForecastOptions {
        &self.options
    }

    /// Fits the cleaned cumulative series and forecasts `horizon` days past
    /// its last date.
    ///
    /// `pop_ratio` deflates daily deaths by the susceptible fraction before
    /// the fit; its log is added back to every output. Dates without a ratio
    /// use 1.
    pub fn forecast_log(
        &self,
        cumulative: &TimeSeries,
        policy_change_dates: &[NaiveDate],
        horizon: usize,
        pop_ratio: Option<&TimeSeries>,
    ) -> ForecastResult<LogForecast> {
        let (Some(start), Some(data_end)) = (cumulative.first_date(), cumulative.last_date()) else {
            return Err(ForecastError::insufficient("forecast", "empty death series"));
        };
        let delays = &self.params.delays;
        let opts = &self.options;
        let ratio_at = |date: NaiveDate| {
            pop_ratio
                .and_then(|r| r.get(date))
                .filter(|r| r.is_finite() && *r > 0.0)
                .unwrap_or(1.0)
        };

        let daily = cumulative.daily();
        let adjusted: Vec<f64> = daily.iter().map(|(d, v)| v / ratio_at(d)).collect();
        let smoothed = rolling_mean(&adjusted, opts.smoothing_days, opts.smoothing_min_periods);
        let effective = policy_effective_dates(policy_change_dates, delays);
        let blank_days = opts.smoothing_days as i64;
        let observed = TimeSeries::from_pairs(daily.dates().iter().zip(&smoothed).filter_map(
            |(date, avg)| {
                let blanked = effective
                    .iter()
                    .any(|e| *date > *e && *date <= offset_date(*e, blank_days));
                avg.filter(|v| *v > MIN_OBSERVABLE && !blanked)
                    .map(|v| (*date, v.ln()))
            },
        ))?;

        let points: Vec<(i64, f64)> = observed
            .iter()
            .map(|(d, v)| (day_index(start, d), v))
            .collect();
        if points.is_empty() {
            return Err(ForecastError::insufficient(
                "forecast",
                "no observable daily deaths after smoothing",
            ));
        }

        let horizon_end = day_index(start, data_end) + horizon as i64;
        let breaks = resolve_breakpoints(policy_change_dates, start, horizon_end, delays);
        let mask = outlier_mask(&points, &breaks);
        let inliers: Vec<(i64, f64)> = points
            .iter()
            .zip(&mask)
            .filter(|(_, outlier)| !**outlier)
            .map(|(p, _)| *p)
            .collect();
        let (x, y): (Vec<f64>, Vec<f64>) = inliers.iter().map(|(x, y)| (*x as f64, *y)).unzip();
        let fit = fit_with_breaks(&x, &y, &breaks)?;
        debug!(
            breakpoints = ?breaks.as_slice(),
            coefficients = ?fit.model.coefficients(),
            points = inliers.len(),
            outliers = points.len() - inliers.len(),
            "fitted piecewise log-linear model"
        );

        let smoothing = opts.smoothing_days as f64;
        let span = horizon_end.max(0);
        let mut variance: Vec<f64> = (0..=span)
            .map(|t| smoothing * fit.prediction_variance(t as f64))
            .collect();

        let mut model = fit.model.clone();
        let replacement = self.override_slope(&fit.model, &inliers);
        if let Some(slope) = replacement {
            let last = model.num_segments() - 1;
            let boundary = breaks[breaks.len() - 2];
            warn!(
                fitted_slope = model.slope(last),
                replacement = slope,
                boundary,
                "last segment cannot be trusted, using contained slope"
            );
            model = model.with_last_slope(slope);
            let anchor_idx = (boundary + 1).clamp(0, span) as usize;
            let anchor = variance[anchor_idx];
            for (t, v) in variance.iter_mut().enumerate().skip(anchor_idx) {
                *v = anchor * (t as i64 - boundary) as f64;
            }
        }

        let dates: Vec<NaiveDate> = (0..=span).map(|t| offset_date(start, t)).collect();
        let mut mean = Vec::with_capacity(dates.len());
        let mut lower = Vec::with_capacity(dates.len());
        let mut upper = Vec::with_capacity(dates.len());
        for ((t, date), var) in dates.iter().enumerate().zip(&variance) {
            let log_ratio = ratio_at(*date).ln();
            let mu = model.predict(t as f64);
            let half_width = Z_95 * var.sqrt();
            mean.push(mu + log_ratio);
            lower.push(mu - half_width + log_ratio);
            upper.push(mu + half_width + log_ratio);
        }
        let observed = dates
            .iter()
            .map(|d| observed.get(*d).map(|v| v + ratio_at(*d).ln()))
            .collect();

        Ok(LogForecast {
            summary: ModelSummary {
                series_start: start,
                breakpoints: breaks.to_vec(),
                coefficients: fit.model.coefficients().to_vec(),
                segments: model.segments(),
                override_applied: replacement.is_some(),
                fitted_points: inliers.len(),
                outliers: points.len() - inliers.len(),
            },
            dates,
            mean,
            lower,
            upper,
            observed,
        })
    }

    pub fn forecast(
        &self,
        cumulative: &TimeSeries,
        policy_change_dates: &[NaiveDate],
        horizon: usize,
        pop_ratio: Option<&TimeSeries>,
    ) -> ForecastResult<DeathForecast> {
        self.forecast_log(cumulative, policy_change_dates, horizon, pop_ratio)
            .map(LogForecast::into_death_forecast)
    }

    /// `Some(slope)` when the last segment has too few usable points or a
    /// runaway slope. Needs at least two segments.
    fn override_slope(&self, model: &PiecewiseModel, inliers: &[(i64, f64)]) -> Option<f64> {
        let segments = model.num_segments();
        if segments < 2 {
            return None;
        }
        let boundary = model.breakpoints()[segments - 1];
        let usable = inliers.iter().filter(|(x, _)| *x >= boundary).count();
        let last = model.slope(segments - 1);
        let limit = self.options.max_last_slope.max(model.slope(0).abs());
        if usable >= self.options.min_last_segment_points && last.abs() <= limit {
            return None;
        }
        Some(contained_slope(
            model.slope(segments - 2),
            self.options.contain_rate,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::preprocess_cumulative;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid test date")
    }

    /// Cumulative deaths whose daily increments follow `daily(i)`.
    fn cumulative_from(start: NaiveDate, days: i64, daily: impl Fn(i64) -> f64) -> TimeSeries {
        let mut total = 0.0;
        let raw: Vec<(NaiveDate, Option<f64>)> = (0..days)
            .map(|i| {
                total += daily(i);
                (offset_date(start, i), Some(total))
            })
            .collect();
        preprocess_cumulative(&raw)
    }

    fn forecaster() -> DeathForecaster {
        DeathForecaster::new(EpiParameters::default(), ForecastOptions::default())
            .expect("default forecaster")
    }

    #[test]
    fn test_exponential_growth_slope_recovered() {
        let cumulative = cumulative_from(date("2020-03-01"), 60, |i| 5.0 * (0.05 * i as f64).exp());
        let forecast = forecaster()
            .forecast_log(&cumulative, &[], 30, None)
            .expect("forecast should succeed");
        assert_eq!(forecast.summary.segments.len(), 1);
        assert!(!forecast.summary.override_applied);
        assert!((forecast.summary.segments[0].slope - 0.05).abs() < 0.01);
        for ((lo, mu), hi) in forecast.lower.iter().zip(&forecast.mean).zip(&forecast.upper) {
            assert!(lo <= mu && mu <= hi);
        }
    }

    #[test]
    fn test_output_spans_history_and_horizon() {
        let start = date("2020-03-01");
        let cumulative = cumulative_from(start, 40, |i| 3.0 + i as f64);
        let forecast = forecaster()
            .forecast(&cumulative, &[date("2020-03-15")], 25, None)
            .expect("forecast should succeed");
        // one synthetic day before the first report, 40 reported days, 25 ahead
        assert_eq!(forecast.dates.len(), 1 + 40 + 25);
        assert_eq!(forecast.dates[0], date("2020-02-29"));
        assert_eq!(forecast.dates.last().copied(), Some(offset_date(start, 39 + 25)));
        assert_eq!(forecast.predicted.len(), forecast.dates.len());
        assert!(forecast.predicted.iter().all(|v| v.is_finite() && *v > 0.0));
    }

    #[test]
    fn test_forecast_is_deterministic() {
        let cumulative = cumulative_from(date("2020-03-01"), 50, |i| {
            10.0 * (0.04 * i as f64).exp() * if i % 7 == 0 { 1.6 } else { 1.0 }
        });
        let policy = [date("2020-03-20")];
        let first = forecaster()
            .forecast_log(&cumulative, &policy, 30, None)
            .expect("forecast should succeed");
        let second = forecaster()
            .forecast_log(&cumulative, &policy, 30, None)
            .expect("forecast should succeed");
        assert_eq!(first, second);
    }

    #[test]
    fn test_reporting_spike_is_excluded_from_slope() {
        let start = date("2020-03-01");
        // a tenfold report on 2020-04-10, day-index 41
        let cumulative = cumulative_from(start, 60, |i| {
            let spike = if i == 40 { 10.0 } else { 1.0 };
            5.0 * (0.05 * i as f64).exp() * (1.0 + 0.03 * (i as f64).sin()) * spike
        });
        let mut builder = ForecastOptions::builder();
        builder.smoothing_days(1).smoothing_min_periods(1);
        let unsmoothed = DeathForecaster::new(
            EpiParameters::default(),
            builder.build().expect("valid options"),
        )
        .expect("valid forecaster");
        let forecast = unsmoothed
            .forecast_log(&cumulative, &[], 10, None)
            .expect("forecast should succeed");
        let summary = &forecast.summary;
        assert_eq!(summary.outliers, 1);
        assert_eq!(summary.fitted_points, 59);

        let points: Vec<(i64, f64)> = forecast
            .observed
            .iter()
            .enumerate()
            .filter_map(|(t, v)| v.map(|v| (t as i64, v)))
            .collect();
        let mask = outlier_mask(&points, &summary.breakpoints);
        let flagged: Vec<i64> = points
            .iter()
            .zip(&mask)
            .filter(|(_, outlier)| **outlier)
            .map(|(p, _)| p.0)
            .collect();
        assert_eq!(flagged, vec![41]);

        let fit_slope = |keep: &dyn Fn(i64) -> bool| {
            let (x, y): (Vec<f64>, Vec<f64>) = points
                .iter()
                .filter(|(t, _)| keep(*t))
                .map(|(t, v)| (*t as f64, *v))
                .unzip();
            fit_with_breaks(&x, &y, &summary.breakpoints)
                .expect("fit should succeed")
                .model
                .slope(0)
        };
        let without_spike = fit_slope(&|t| t != 41);
        let with_spike = fit_slope(&|_| true);
        let slope = summary.segments[0].slope;
        assert!((slope - without_spike).abs() < 1e-9, "slope {slope}");
        assert!((with_spike - without_spike).abs() > 1e-3);
        assert!((slope - 0.05).abs() < 1e-3);
    }

    #[test]
    fn test_no_observable_deaths_is_insufficient() {
        let empty = preprocess_cumulative(&[(date("2020-03-01"), Some(0.0))]);
        let err = forecaster()
            .forecast_log(&empty, &[], 10, None)
            .expect_err("empty series must fail");
        assert!(err.is_insufficient_data());

        // reported once and never again: every daily value is zero
        let flat = preprocess_cumulative(&[
            (date("2020-03-01"), Some(1.0)),
            (date("2020-03-02"), Some(1.0)),
        ]);
        let err = forecaster()
            .forecast_log(&flat, &[], 10, None)
            .expect_err("flat series must fail");
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn test_contained_slope_formula() {
        assert!((contained_slope(0.1, 0.8) + 0.18).abs() < 1e-12);
        assert!((contained_slope(-0.1, 0.8) - 0.02).abs() < 1e-12);
        assert_eq!(contained_slope(0.1, 0.0), -0.1);
    }

    #[test]
    fn test_override_when_last_segment_too_short() {
        let start = date("2020-03-01");
        // the policy takes effect on 2020-04-17, day-index 48, and blanking
        // leaves a single usable point after it
        let cumulative = cumulative_from(start, 50, |i| 2.0 * (0.1 * i as f64).exp());
        let policy = [date("2020-03-29")];
        let forecast = forecaster()
            .forecast_log(&cumulative, &policy, 30, None)
            .expect("forecast should succeed");
        let summary = &forecast.summary;
        assert!(summary.override_applied);
        assert_eq!(summary.segments.len(), 2);
        let previous = summary.segments[0].slope;
        let last = summary.segments[1].slope;
        assert!(previous > 0.0);
        assert!(last < 0.0);
        assert!((last - contained_slope(previous, 0.8)).abs() < 1e-12);
        assert!((last + previous * 1.8).abs() < 1e-12);
    }

    #[test]
    fn test_override_after_decline_and_variance_extrapolation() {
        let start = date("2020-03-01");
        let cumulative = cumulative_from(start, 50, |i| {
            500.0 * (-0.05 * i as f64).exp() * (1.0 + 0.1 * (i as f64).sin())
        });
        let policy = [date("2020-03-29")];
        let forecast = forecaster()
            .forecast_log(&cumulative, &policy, 30, None)
            .expect("forecast should succeed");
        let summary = &forecast.summary;
        assert!(summary.override_applied);
        let previous = summary.segments[0].slope;
        let last = summary.segments[1].slope;
        assert!(previous < 0.0);
        assert!((last - (-previous * 0.2)).abs() < 1e-12);

        // band width grows with sqrt(t - boundary) past the boundary
        let boundary = summary.breakpoints[1] as usize;
        let width = |t: usize| forecast.upper[t] - forecast.lower[t];
        let ratio = width(boundary + 4) / width(boundary + 1);
        assert!((ratio - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_pop_ratio_is_added_back() {
        let start = date("2020-03-01");
        let cumulative = cumulative_from(start, 40, |i| 4.0 * (0.03 * i as f64).exp());
        let plain = forecaster()
            .forecast_log(&cumulative, &[], 10, None)
            .expect("forecast should succeed");
        let half = TimeSeries::from_start(offset_date(start, -1), vec![0.5; 51]);
        let adjusted = forecaster()
            .forecast_log(&cumulative, &[], 10, Some(&half))
            .expect("forecast should succeed");
        // a constant ratio doubles the fitted input and halves it again
        for (a, b) in plain.mean.iter().zip(&adjusted.mean) {
            assert!((a - b).abs() < 1e-8);
        }
    }
}
