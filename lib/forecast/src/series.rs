//! Date-indexed series and the cumulative-count preprocessor
//!
//! Gaps in the reporting calendar are preserved, never interpolated. Daily
//! differencing treats adjacent available dates as consecutive, which
//! understates volatility around reporting gaps.

use std::collections::BTreeMap;

use chrono::{Days, NaiveDate};

use crate::error::{ForecastError, ForecastResult};

/// Ordered `(date, value)` pairs with strictly increasing dates.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TimeSeries {
    dates: Vec<NaiveDate>,
    values: Vec<f64>,
}

impl TimeSeries {
    pub fn new(dates: Vec<NaiveDate>, values: Vec<f64>) -> ForecastResult<Self> {
        if dates.len() != values.len() {
            return Err(ForecastError::InvalidSeries(format!(
                "{} dates but {} values",
                dates.len(),
                values.len()
            )));
        }
        if let Some(pos) = dates.windows(2).position(|w| w[0] >= w[1]) {
            return Err(ForecastError::InvalidSeries(format!(
                "dates must be strictly increasing, {} is followed by {}",
                dates[pos],
                dates[pos + 1]
            )));
        }
        Ok(TimeSeries { dates, values })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (NaiveDate, f64)>) -> ForecastResult<Self> {
        let (dates, values) = pairs.into_iter().unzip();
        Self::new(dates, values)
    }

    /// Consecutive calendar days starting at `start`.
    pub fn from_start(start: NaiveDate, values: Vec<f64>) -> Self {
        let dates = (0..values.len())
            .map(|i| offset_date(start, i as i64))
            .collect();
        TimeSeries { dates, values }
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn iter(&self) -> impl Iterator<Item = (NaiveDate, f64)> + '_ {
        self.dates.iter().copied().zip(self.values.iter().copied())
    }

    pub fn first_date(&self) -> Option<NaiveDate> {
        self.dates.first().copied()
    }

    pub fn last_date(&self) -> Option<NaiveDate> {
        self.dates.last().copied()
    }

    pub fn last_value(&self) -> Option<f64> {
        self.values.last().copied()
    }

    pub fn get(&self, date: NaiveDate) -> Option<f64> {
        self.dates
            .binary_search(&date)
            .ok()
            .map(|idx| self.values[idx])
    }

    /// First differences of a cumulative series. The first entry has no
    /// predecessor and gets 0.
    pub fn daily(&self) -> TimeSeries {
        let mut values = Vec::with_capacity(self.values.len());
        if !self.values.is_empty() {
            values.push(0.0);
        }
        values.extend(self.values.windows(2).map(|w| w[1] - w[0]));
        TimeSeries {
            dates: self.dates.clone(),
            values,
        }
    }

    /// Keeps entries dated on or before `date`.
    pub fn truncate_after(&self, date: NaiveDate) -> TimeSeries {
        let end = self.dates.partition_point(|d| *d <= date);
        TimeSeries {
            dates: self.dates[..end].to_vec(),
            values: self.values[..end].to_vec(),
        }
    }

    /// Moves every date by `days` (negative moves earlier).
    pub fn shift_days(&self, days: i64) -> TimeSeries {
        TimeSeries {
            dates: self.dates.iter().map(|d| offset_date(*d, days)).collect(),
            values: self.values.clone(),
        }
    }

    pub fn map_values(&self, f: impl Fn(f64) -> f64) -> TimeSeries {
        TimeSeries {
            dates: self.dates.clone(),
            values: self.values.iter().map(|v| f(*v)).collect(),
        }
    }

    pub fn map_values_dated(&self, f: impl Fn(NaiveDate, f64) -> f64) -> TimeSeries {
        TimeSeries {
            dates: self.dates.clone(),
            values: self.iter().map(|(d, v)| f(d, v)).collect(),
        }
    }
}

/// Cleans a raw cumulative series.
///
/// Missing, non-finite and non-positive values are unreported and dropped.
/// A synthetic zero is placed one day before the earliest remaining date so
/// the first difference is defined. An input with nothing reported yields an
/// empty series.
pub fn preprocess_cumulative(raw: &[(NaiveDate, Option<f64>)]) -> TimeSeries {
    let reported: BTreeMap<NaiveDate, f64> = raw
        .iter()
        .filter_map(|(date, value)| match value {
            Some(v) if v.is_finite() && *v > 0.0 => Some((*date, *v)),
            _ => None,
        })
        .collect();
    let Some(earliest) = reported.keys().next().copied() else {
        return TimeSeries::default();
    };
    let mut dates = Vec::with_capacity(reported.len() + 1);
    let mut values = Vec::with_capacity(reported.len() + 1);
    dates.push(offset_date(earliest, -1));
    values.push(0.0);
    for (date, value) in reported {
        dates.push(date);
        values.push(value);
    }
    TimeSeries { dates, values }
}

/// Trailing row-wise mean; `None` while fewer than `min_periods` finite values
/// sit in the window.
pub fn rolling_mean(values: &[f64], window: usize, min_periods: usize) -> Vec<Option<f64>> {
    (0..values.len())
        .map(|i| {
            let start = (i + 1).saturating_sub(window);
            let (sum, count) = values[start..=i]
                .iter()
                .filter(|v| v.is_finite())
                .fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
            (count >= min_periods.max(1)).then(|| sum / count as f64)
        })
        .collect()
}

/// Running total that skips missing entries; a missing entry stays missing.
pub fn cumulative_sum(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let mut total = 0.0;
    values
        .iter()
        .map(|v| {
            v.map(|v| {
                total += v;
                total
            })
        })
        .collect()
}

pub fn offset_date(date: NaiveDate, days: i64) -> NaiveDate {
    let magnitude = Days::new(days.unsigned_abs());
    let shifted = if days >= 0 {
        date.checked_add_days(magnitude)
    } else {
        date.checked_sub_days(magnitude)
    };
    shifted.unwrap_or(if days >= 0 { NaiveDate::MAX } else { NaiveDate::MIN })
}

/// Whole days from `start` to `date`.
pub fn day_index(start: NaiveDate, date: NaiveDate) -> i64 {
    (date - start).num_days()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid test date")
    }

    #[test]
    fn test_new_rejects_unordered_dates() {
        let err = TimeSeries::new(vec![date("2020-03-02"), date("2020-03-01")], vec![1.0, 2.0])
            .expect_err("unordered dates must fail");
        assert!(err.to_string().contains("strictly increasing"));
        assert!(TimeSeries::new(vec![date("2020-03-01")], vec![]).is_err());
    }

    #[test]
    fn test_preprocess_drops_unreported_and_pads() {
        let raw = vec![
            (date("2020-03-05"), Some(4.0)),
            (date("2020-03-02"), Some(0.0)),
            (date("2020-03-03"), None),
            (date("2020-03-04"), Some(1.0)),
            (date("2020-03-07"), Some(9.0)),
        ];
        let cleaned = preprocess_cumulative(&raw);
        assert_eq!(
            cleaned.dates(),
            &[
                date("2020-03-03"),
                date("2020-03-04"),
                date("2020-03-05"),
                date("2020-03-07")
            ]
        );
        assert_eq!(cleaned.values(), &[0.0, 1.0, 4.0, 9.0]);
    }

    #[test]
    fn test_preprocess_all_unreported_is_empty() {
        let raw = vec![
            (date("2020-03-01"), Some(0.0)),
            (date("2020-03-02"), None),
            (date("2020-03-03"), Some(-2.0)),
        ];
        assert!(preprocess_cumulative(&raw).is_empty());
        assert!(preprocess_cumulative(&[]).is_empty());
    }

    #[test]
    fn test_daily_has_defined_leading_value() {
        let raw = vec![
            (date("2020-03-01"), Some(2.0)),
            (date("2020-03-02"), Some(5.0)),
            (date("2020-03-04"), Some(4.0)),
        ];
        let daily = preprocess_cumulative(&raw).daily();
        assert_eq!(daily.values(), &[0.0, 2.0, 3.0, -1.0]);
        assert!(daily.values().iter().all(|v| !v.is_nan()));
        // the gap between 03-02 and 03-04 is treated as adjacent
        assert_eq!(daily.get(date("2020-03-04")), Some(-1.0));
    }

    #[test]
    fn test_rolling_mean_min_periods() {
        let values = [1.0, 2.0, 3.0, 4.0, f64::NAN, 6.0];
        let avg = rolling_mean(&values, 3, 2);
        assert_eq!(avg[0], None);
        assert_eq!(avg[1], Some(1.5));
        assert_eq!(avg[2], Some(2.0));
        assert_eq!(avg[3], Some(3.0));
        assert_eq!(avg[4], Some(3.5));
        assert_eq!(avg[5], Some(5.0));
    }

    #[test]
    fn test_cumulative_sum_skips_missing() {
        let out = cumulative_sum(&[Some(1.0), None, Some(2.0), Some(3.0)]);
        assert_eq!(out, vec![Some(1.0), None, Some(3.0), Some(6.0)]);
    }

    #[test]
    fn test_truncate_and_shift() {
        let series = TimeSeries::from_start(date("2020-03-01"), vec![1.0, 2.0, 3.0]);
        let cut = series.truncate_after(date("2020-03-02"));
        assert_eq!(cut.values(), &[1.0, 2.0]);
        let shifted = series.shift_days(-2);
        assert_eq!(shifted.first_date(), Some(date("2020-02-28")));
        assert_eq!(day_index(date("2020-02-28"), date("2020-03-01")), 2);
    }
}
