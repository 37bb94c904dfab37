//! Policy-change dates to fitting breakpoints
//!
//! A policy change shows up in deaths only after the full
//! infection-to-death lag, so each date is shifted by that lag before it
//! becomes a day-index on the fitting axis.

use chrono::NaiveDate;
use smallvec::SmallVec;

use crate::params::DelayParameters;
use crate::series::{day_index, offset_date};

/// Ordered day-indices; always starts at 0 and ends at the horizon end.
pub type Breakpoints = SmallVec<[i64; 8]>;

pub fn policy_effective_dates(
    policy_change_dates: &[NaiveDate],
    delays: &DelayParameters,
) -> Vec<NaiveDate> {
    let lag = delays.infection_to_death();
    policy_change_dates
        .iter()
        .map(|d| offset_date(*d, lag))
        .collect()
}

/// Resolves breakpoints relative to `series_start`.
///
/// Interior indices outside `(0, horizon_end)` are dropped. Without policy
/// dates the result is `[0, horizon_end]`: a single exponential segment, the
/// pessimistic no-intervention assumption.
pub fn resolve_breakpoints(
    policy_change_dates: &[NaiveDate],
    series_start: NaiveDate,
    horizon_end: i64,
    delays: &DelayParameters,
) -> Breakpoints {
    let mut breaks: Breakpoints = SmallVec::new();
    breaks.push(0);
    breaks.extend(
        policy_effective_dates(policy_change_dates, delays)
            .into_iter()
            .map(|d| day_index(series_start, d))
            .filter(|idx| *idx > 0 && *idx < horizon_end),
    );
    breaks.push(horizon_end.max(1));
    breaks.sort_unstable();
    breaks.dedup();
    breaks
}
