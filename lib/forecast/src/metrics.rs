//! Date-indexed output tables
//!
//! A [`MetricTable`] aligns any number of series on the union of their dates.
//! Cells stay `None` where a series has no value, so observed columns end at
//! the last report while forecast columns run to the horizon.

use std::collections::BTreeSet;
use std::fmt;

use chrono::NaiveDate;
use serde::Serialize;

use crate::series::{TimeSeries, cumulative_sum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Death,
    AvgDeath7d,
    PredictedDeath,
    LowerBound,
    UpperBound,
    Confirmed,
    Infected,
    Symptomatic,
    Hospitalized,
    Icu,
    HospitalBeds,
}

impl Metric {
    /// Column order of the daily table.
    pub const DAILY: [Metric; 11] = [
        Metric::Death,
        Metric::AvgDeath7d,
        Metric::PredictedDeath,
        Metric::LowerBound,
        Metric::UpperBound,
        Metric::Confirmed,
        Metric::Infected,
        Metric::Symptomatic,
        Metric::Hospitalized,
        Metric::Icu,
        Metric::HospitalBeds,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Metric::Death => "death",
            Metric::AvgDeath7d => "avg_death_7d",
            Metric::PredictedDeath => "predicted_death",
            Metric::LowerBound => "lower_bound",
            Metric::UpperBound => "upper_bound",
            Metric::Confirmed => "confirmed",
            Metric::Infected => "infected",
            Metric::Symptomatic => "symptomatic",
            Metric::Hospitalized => "hospitalized",
            Metric::Icu => "icu",
            Metric::HospitalBeds => "hospital_beds",
        }
    }

    /// Occupancy is a stock, not a flow, and is never accumulated.
    pub fn is_occupancy(&self) -> bool {
        matches!(self, Metric::Icu | Metric::HospitalBeds)
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct MetricTable {
    dates: Vec<NaiveDate>,
    columns: Vec<(Metric, Vec<Option<f64>>)>,
}

impl MetricTable {
    /// Aligns `columns` on the union of their dates, dropping dates after
    /// `end`. Non-finite values become `None`.
    pub fn from_series(columns: &[(Metric, &TimeSeries)], end: Option<NaiveDate>) -> Self {
        let dates: BTreeSet<NaiveDate> = columns
            .iter()
            .flat_map(|(_, series)| series.dates().iter().copied())
            .filter(|d| end.is_none_or(|end| *d <= end))
            .collect();
        let dates: Vec<NaiveDate> = dates.into_iter().collect();
        let columns = columns
            .iter()
            .map(|(metric, series)| (*metric, align(&dates, series)))
            .collect();
        MetricTable { dates, columns }
    }

    pub fn dates(&self) -> &[NaiveDate] {
        &self.dates
    }

    pub fn len(&self) -> usize {
        self.dates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dates.is_empty()
    }

    pub fn metrics(&self) -> impl Iterator<Item = Metric> + '_ {
        self.columns.iter().map(|(m, _)| *m)
    }

    pub fn column(&self, metric: Metric) -> Option<&[Option<f64>]> {
        self.columns
            .iter()
            .find(|(m, _)| *m == metric)
            .map(|(_, values)| values.as_slice())
    }

    pub fn value(&self, date: NaiveDate, metric: Metric) -> Option<f64> {
        let row = self.dates.binary_search(&date).ok()?;
        self.column(metric).and_then(|values| values[row])
    }

    /// Present cells of one column as a series.
    pub fn series(&self, metric: Metric) -> TimeSeries {
        let Some(values) = self.column(metric) else {
            return TimeSeries::default();
        };
        let (dates, values) = self
            .dates
            .iter()
            .zip(values)
            .filter_map(|(d, v)| v.map(|v| (*d, v)))
            .unzip();
        // a subsequence of strictly increasing dates stays strictly increasing
        TimeSeries::new(dates, values).unwrap_or_default()
    }

    /// Replaces (or appends) a column, aligned to the existing dates. Values
    /// on dates outside the table are dropped.
    pub fn set_column(&mut self, metric: Metric, series: &TimeSeries) {
        let values = align(&self.dates, series);
        match self.columns.iter_mut().find(|(m, _)| *m == metric) {
            Some((_, column)) => *column = values,
            None => self.columns.push((metric, values)),
        }
    }

    /// Running totals of every flow column. Occupancy columns are copied as
    /// they are and the 7-day average is dropped.
    pub fn cumulative(&self) -> MetricTable {
        let columns = self
            .columns
            .iter()
            .filter(|(m, _)| *m != Metric::AvgDeath7d)
            .map(|(m, values)| {
                if m.is_occupancy() {
                    (*m, values.clone())
                } else {
                    (*m, cumulative_sum(values))
                }
            })
            .collect();
        MetricTable {
            dates: self.dates.clone(),
            columns,
        }
    }

    /// Per-date sum over tables; a cell is `None` only when no table has a
    /// value for it. Columns follow the first table's order.
    pub fn sum<'a>(tables: impl IntoIterator<Item = &'a MetricTable>) -> MetricTable {
        let tables: Vec<&MetricTable> = tables.into_iter().collect();
        let dates: Vec<NaiveDate> = tables
            .iter()
            .flat_map(|t| t.dates.iter().copied())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let mut metrics: Vec<Metric> = Vec::new();
        for metric in tables.iter().flat_map(|t| t.metrics()) {
            if !metrics.contains(&metric) {
                metrics.push(metric);
            }
        }
        let columns = metrics
            .into_iter()
            .map(|metric| {
                let mut totals: Vec<Option<f64>> = vec![None; dates.len()];
                for table in &tables {
                    let Some(values) = table.column(metric) else {
                        continue;
                    };
                    for (date, value) in table.dates.iter().zip(values) {
                        if let (Some(v), Ok(row)) = (value, dates.binary_search(date)) {
                            *totals[row].get_or_insert(0.0) += v;
                        }
                    }
                }
                (metric, totals)
            })
            .collect();
        MetricTable { dates, columns }
    }

    /// Row view: date and one cell per column, in column order.
    pub fn rows(&self) -> impl Iterator<Item = (NaiveDate, Vec<Option<f64>>)> + '_ {
        self.dates.iter().enumerate().map(|(row, date)| {
            (
                *date,
                self.columns.iter().map(|(_, values)| values[row]).collect(),
            )
        })
    }
}

fn align(dates: &[NaiveDate], series: &TimeSeries) -> Vec<Option<f64>> {
    dates
        .iter()
        .map(|d| series.get(*d).filter(|v| v.is_finite()))
        .collect()
}
