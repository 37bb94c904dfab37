//! Weekly quantile forecasts in the forecast-hub submission layout
//!
//! Daily forecasts are 7-day averages with a daily 95% band. A weekly target
//! takes the last day of each epiweek, widens the band by `√7` and reads
//! the other quantiles off a normal approximation of that band.

use std::collections::BTreeMap;

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use crate::dist::NormalDist;
use crate::error::{ForecastError, ForecastResult};
use crate::metrics::{Metric, MetricTable};
use crate::series::{day_index, offset_date};

pub const LOWER_QUANTILES: [f64; 11] = [
    0.010, 0.025, 0.050, 0.100, 0.150, 0.200, 0.250, 0.300, 0.350, 0.400, 0.450,
];
pub const UPPER_QUANTILES: [f64; 11] = [
    0.550, 0.600, 0.650, 0.700, 0.750, 0.800, 0.850, 0.900, 0.950, 0.975, 0.990,
];
const DAYS_PER_WEEK: f64 = 7.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetAggregation {
    Inc,
    Cum,
}

impl TargetAggregation {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetAggregation::Inc => "inc",
            TargetAggregation::Cum => "cum",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionRow {
    pub forecast_date: NaiveDate,
    pub target: String,
    pub target_end_date: NaiveDate,
    /// `None` for the point forecast.
    pub quantile: Option<f64>,
    pub value: f64,
    pub location: String,
}

impl SubmissionRow {
    pub fn kind(&self) -> &'static str {
        if self.quantile.is_some() { "quantile" } else { "point" }
    }
}

/// Saturday closing the Sunday-start epiweek of `date`.
pub fn epiweek_end_date(date: NaiveDate) -> NaiveDate {
    let into_week = i64::from(date.weekday().num_days_from_sunday());
    offset_date(date, 6 - into_week)
}

pub fn target_label(
    target_end_date: NaiveDate,
    forecast_date: NaiveDate,
    aggregation: TargetAggregation,
) -> String {
    let weeks = day_index(epiweek_end_date(forecast_date), target_end_date).div_euclid(7) + 1;
    format!("{weeks} wk ahead {} death", aggregation.as_str())
}

/// Weekly incident-death quantiles for targets ending after `forecast_date`.
///
/// Uses the predicted death and bound columns of a daily table.
pub fn weekly_quantile_forecast(
    daily: &MetricTable,
    location: &str,
    forecast_date: NaiveDate,
) -> ForecastResult<Vec<SubmissionRow>> {
    let (Some(predicted), Some(lower), Some(upper)) = (
        daily.column(Metric::PredictedDeath),
        daily.column(Metric::LowerBound),
        daily.column(Metric::UpperBound),
    ) else {
        return Ok(Vec::new());
    };

    // last complete row of every epiweek
    let mut week_rows: BTreeMap<NaiveDate, (f64, f64, f64)> = BTreeMap::new();
    for (row, date) in daily.dates().iter().enumerate() {
        if let (Some(v), Some(lo), Some(hi)) = (predicted[row], lower[row], upper[row]) {
            week_rows.insert(epiweek_end_date(*date), (v, lo, hi));
        }
    }

    let norm = NormalDist::default();
    let z_band = norm.inv_cdf(0.975)?;
    let lower_z: Vec<(f64, f64)> = LOWER_QUANTILES
        .iter()
        .map(|q| -> ForecastResult<(f64, f64)> { Ok((*q, norm.inv_cdf(1.0 - q)? / z_band)) })
        .collect::<ForecastResult<_>>()?;
    let upper_z: Vec<(f64, f64)> = UPPER_QUANTILES
        .iter()
        .map(|q| -> ForecastResult<(f64, f64)> { Ok((*q, norm.inv_cdf(*q)? / z_band)) })
        .collect::<ForecastResult<_>>()?;

    let week_scale = DAYS_PER_WEEK.sqrt();
    let mut rows = Vec::new();
    for (end, (value, lower, upper)) in week_rows.range(offset_date(forecast_date, 1)..) {
        let weekly_lower = (value - (value - lower) * week_scale).max(0.0);
        let weekly_upper = value + (upper - value) * week_scale;
        let target = target_label(*end, forecast_date, TargetAggregation::Inc);
        let row = |quantile: Option<f64>, daily_value: f64| SubmissionRow {
            forecast_date,
            target: target.clone(),
            target_end_date: *end,
            quantile,
            value: daily_value * DAYS_PER_WEEK,
            location: location.to_string(),
        };
        rows.push(row(None, *value));
        for (q, z) in &lower_z {
            rows.push(row(Some(*q), (value - (value - weekly_lower) * z).max(0.0)));
        }
        rows.push(row(Some(0.5), *value));
        for (q, z) in &upper_z {
            rows.push(row(Some(*q), value + (weekly_upper - value) * z));
        }
    }
    Ok(rows)
}

/// Observed cumulative deaths at the close of the epiweek before the one
/// holding `forecast_date`, the base of every cumulative target.
///
/// Falls back to the latest count before that Saturday when it is missing.
pub fn last_epiweek_cumulative(
    cumulative: &MetricTable,
    forecast_date: NaiveDate,
) -> ForecastResult<f64> {
    let week_end = epiweek_end_date(offset_date(forecast_date, -7));
    cumulative
        .series(Metric::Death)
        .truncate_after(week_end)
        .last_value()
        .ok_or_else(|| {
            ForecastError::insufficient(
                "submission",
                format!("no cumulative deaths observed by {week_end}"),
            )
        })
}

/// Incident rows followed by cumulative ones: the running total per quantile
/// on top of the last observed cumulative count.
pub fn add_cumulative_targets(rows: &[SubmissionRow], last_cumulative: f64) -> Vec<SubmissionRow> {
    let mut totals: BTreeMap<Option<u64>, f64> = BTreeMap::new();
    let mut ordered: Vec<&SubmissionRow> = rows.iter().collect();
    ordered.sort_by_key(|r| r.target_end_date);
    let cumulative: Vec<SubmissionRow> = ordered
        .into_iter()
        .map(|r| {
            let total = totals.entry(r.quantile.map(f64::to_bits)).or_insert(last_cumulative);
            *total += r.value;
            SubmissionRow {
                target: r.target.replace(" inc ", " cum "),
                value: *total,
                ..r.clone()
            }
        })
        .collect();
    rows.iter().cloned().chain(cumulative).collect()
}

/// Sums rows of many locations into one, keyed by target and quantile.
pub fn aggregate_locations(rows: &[SubmissionRow], location: &str) -> Vec<SubmissionRow> {
    let mut sums: BTreeMap<(NaiveDate, NaiveDate, String, Option<u64>), SubmissionRow> = BTreeMap::new();
    for r in rows {
        let key = (
            r.target_end_date,
            r.forecast_date,
            r.target.clone(),
            r.quantile.map(f64::to_bits),
        );
        sums.entry(key)
            .and_modify(|total| total.value += r.value)
            .or_insert_with(|| SubmissionRow {
                location: location.to_string(),
                ..r.clone()
            });
    }
    sums.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::TimeSeries;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid test date")
    }

    fn flat_table(start: &str, days: usize, value: f64, half_width: f64) -> MetricTable {
        let start = date(start);
        let predicted = TimeSeries::from_start(start, vec![value; days]);
        let lower = TimeSeries::from_start(start, vec![value - half_width; days]);
        let upper = TimeSeries::from_start(start, vec![value + half_width; days]);
        MetricTable::from_series(
            &[
                (Metric::PredictedDeath, &predicted),
                (Metric::LowerBound, &lower),
                (Metric::UpperBound, &upper),
            ],
            None,
        )
    }

    #[test]
    fn test_epiweek_end_date() {
        // 2020-11-01 is a Sunday
        assert_eq!(epiweek_end_date(date("2020-11-01")), date("2020-11-07"));
        assert_eq!(epiweek_end_date(date("2020-11-04")), date("2020-11-07"));
        assert_eq!(epiweek_end_date(date("2020-11-07")), date("2020-11-07"));
        assert_eq!(epiweek_end_date(date("2020-11-08")), date("2020-11-14"));
    }

    #[test]
    fn test_target_label() {
        let monday = date("2020-11-02");
        assert_eq!(
            target_label(date("2020-11-07"), monday, TargetAggregation::Inc),
            "1 wk ahead inc death"
        );
        assert_eq!(
            target_label(date("2020-11-21"), monday, TargetAggregation::Cum),
            "3 wk ahead cum death"
        );
    }

    #[test]
    fn test_weekly_quantiles() {
        let table = flat_table("2020-10-20", 30, 10.0, 1.0);
        let forecast_date = date("2020-11-02");
        let rows = weekly_quantile_forecast(&table, "06", forecast_date).expect("valid forecast");
        // weeks ending 11-07 and 11-14, plus the partial week ending 11-21
        let ends: Vec<NaiveDate> = rows.iter().map(|r| r.target_end_date).collect();
        assert!(ends.iter().all(|d| *d > forecast_date));
        assert_eq!(rows.len(), 3 * 24);

        let week_one: Vec<&SubmissionRow> =
            rows.iter().filter(|r| r.target_end_date == date("2020-11-07")).collect();
        assert_eq!(week_one.len(), 24);
        assert_eq!(week_one[0].kind(), "point");
        assert_eq!(week_one[0].value, 70.0);
        let at = |q: f64| {
            week_one
                .iter()
                .find(|r| r.quantile == Some(q))
                .map(|r| r.value)
                .expect("quantile present")
        };
        assert_eq!(at(0.5), 70.0);
        // the 97.5% quantile is the widened upper bound
        assert!((at(0.975) - 7.0 * (10.0 + 7f64.sqrt())).abs() < 1e-9);
        assert!((at(0.025) - 7.0 * (10.0 - 7f64.sqrt())).abs() < 1e-9);
        let values: Vec<f64> = week_one[1..].iter().map(|r| r.value).collect();
        assert!(values.windows(2).all(|w| w[0] <= w[1]));
        assert!(week_one.iter().all(|r| r.target == "1 wk ahead inc death" && r.location == "06"));
    }

    #[test]
    fn test_lower_quantiles_clip_at_zero() {
        let table = flat_table("2020-11-01", 14, 1.0, 0.9);
        let rows = weekly_quantile_forecast(&table, "US", date("2020-10-31")).expect("valid forecast");
        assert!(rows.iter().all(|r| r.value >= 0.0));
        assert!(rows.iter().any(|r| r.quantile == Some(0.01) && r.value == 0.0));
    }

    #[test]
    fn test_add_cumulative_targets() {
        let table = flat_table("2020-11-01", 14, 2.0, 0.5);
        let inc = weekly_quantile_forecast(&table, "US", date("2020-10-31")).expect("valid forecast");
        let all = add_cumulative_targets(&inc, 100.0);
        assert_eq!(all.len(), 2 * inc.len());
        let cum_point: Vec<f64> = all
            .iter()
            .filter(|r| r.target.contains("cum") && r.quantile.is_none())
            .map(|r| r.value)
            .collect();
        assert_eq!(cum_point, vec![114.0, 128.0]);
        assert!(all.iter().any(|r| r.target == "2 wk ahead cum death"));
    }

    #[test]
    fn test_last_epiweek_cumulative() {
        // reports through Sunday 2020-04-12, forecast made on Monday 04-13
        let start = date("2020-03-01");
        let counts: Vec<f64> = (1..=43).map(f64::from).collect();
        let deaths = TimeSeries::from_start(start, counts);
        let table = MetricTable::from_series(&[(Metric::Death, &deaths)], None);
        let monday = date("2020-04-13");
        // Saturday 04-11 is day 41
        assert_eq!(last_epiweek_cumulative(&table, monday), Ok(42.0));
        assert_eq!(last_epiweek_cumulative(&table, date("2020-04-11")), Ok(35.0));

        let gapped = deaths.truncate_after(date("2020-04-10"));
        let table = MetricTable::from_series(&[(Metric::Death, &gapped)], None);
        assert_eq!(last_epiweek_cumulative(&table, monday), Ok(41.0));

        let err = last_epiweek_cumulative(&table, date("2020-03-02")).expect_err("nothing observed");
        assert!(err.is_insufficient_data());
    }

    #[test]
    fn test_aggregate_locations() {
        let table = flat_table("2020-11-01", 7, 2.0, 0.5);
        let mut rows = weekly_quantile_forecast(&table, "01", date("2020-10-31")).expect("valid forecast");
        rows.extend(weekly_quantile_forecast(&table, "02", date("2020-10-31")).expect("valid forecast"));
        let total = aggregate_locations(&rows, "US");
        assert_eq!(total.len(), 24);
        let point = total.iter().find(|r| r.quantile.is_none()).expect("point row");
        assert_eq!(point.value, 28.0);
        assert_eq!(point.location, "US");
    }
}
