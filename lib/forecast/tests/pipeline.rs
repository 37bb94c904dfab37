use chrono::{Days, NaiveDate};
use forecast::submission::{
    add_cumulative_targets, aggregate_locations, last_epiweek_cumulative, weekly_quantile_forecast,
};
use forecast::{EpiParameters, ForecastOptions, GeographyForecaster, GeographyInput, Metric};

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid test date")
}

/// 41 days of growth at `e^0.1` per day, then a decline at `e^-0.04`.
fn peaked_input(name: &str, scale: f64) -> GeographyInput {
    let start = date("2020-03-01");
    let mut total = 0.0;
    let deaths = (0..80u64)
        .map(|i| {
            let t = i as f64;
            let daily = if i <= 40 {
                scale * (0.1 * t).exp()
            } else {
                scale * (4.0 - 0.04 * (t - 40.0)).exp()
            };
            total += daily;
            (start + Days::new(i), Some(total))
        })
        .collect();
    // 2020-03-22 + 19 days of lag = 2020-04-10, the peak
    GeographyInput::new(name, deaths).with_policy_change_dates(vec![date("2020-03-22")])
}

fn forecaster() -> GeographyForecaster {
    let mut builder = ForecastOptions::builder();
    builder.forecast_horizon(28).use_vaccine_data(false);
    GeographyForecaster::new(
        EpiParameters::default(),
        builder.build().expect("valid options"),
    )
    .expect("valid forecaster")
}

#[test]
fn test_policy_change_bends_the_forecast() {
    let forecast = forecaster()
        .forecast_geography(&peaked_input("A", 2.0))
        .expect("forecast should succeed");
    let summary = &forecast.summary;
    assert!(summary.breakpoint_dates().contains(&date("2020-04-10")));
    assert!(!summary.override_applied);

    let first = summary.segments.first().expect("first segment").slope;
    let last = summary.segments.last().expect("last segment").slope;
    assert!((first - 0.1).abs() < 0.02, "growth slope {first}");
    // continuity at the peak pulls the fitted decline slightly toward zero
    assert!(last < -0.02 && last > -0.06, "decline slope {last}");

    let daily = &forecast.daily;
    let data_end = date("2020-05-19");
    assert_eq!(daily.dates().last().copied(), Some(data_end + Days::new(28)));
    let at_end = daily.value(data_end, Metric::PredictedDeath).expect("predicted at data end");
    let at_horizon = daily
        .value(data_end + Days::new(28), Metric::PredictedDeath)
        .expect("predicted at horizon");
    assert!(at_horizon < at_end);

    for (date, row) in daily.rows() {
        let lower = row[3];
        let predicted = row[2];
        let upper = row[4];
        if let (Some(lo), Some(p), Some(hi)) = (lower, predicted, upper) {
            assert!(lo <= p && p <= hi, "band out of order on {date}");
        }
    }
    let icu = daily.series(Metric::Icu);
    assert!(icu.values().iter().all(|v| *v >= 0.0));

    let cumulative = forecast.cumulative.series(Metric::PredictedDeath);
    assert!(cumulative.values().windows(2).all(|w| w[1] >= w[0]));
}

#[test]
fn test_forecast_is_deterministic() {
    let input = peaked_input("A", 2.0);
    let first = forecaster().forecast_geography(&input).expect("forecast should succeed");
    let second = forecaster().forecast_geography(&input).expect("forecast should succeed");
    assert_eq!(first, second);
}

#[test]
fn test_states_to_national_submission() {
    let inputs = vec![
        peaked_input("01", 2.0),
        peaked_input("02", 5.0),
        GeographyInput::new("99", Vec::new()),
    ];
    let batch = forecaster().forecast_batch(&inputs);
    assert_eq!(batch.forecasts.len(), 2);
    assert_eq!(batch.failures.len(), 1);
    assert_eq!(batch.failures[0].0, "99");

    let forecast_date = date("2020-05-19");
    let mut rows = Vec::new();
    for forecast in &batch.forecasts {
        rows.extend(
            weekly_quantile_forecast(&forecast.daily, &forecast.name, forecast_date)
                .expect("weekly forecast"),
        );
    }
    assert!(!rows.is_empty());
    assert_eq!(rows.len() % 24, 0);
    assert!(rows.iter().all(|r| r.target_end_date > forecast_date && r.value >= 0.0));

    let national = aggregate_locations(&rows, "US");
    assert_eq!(national.len() * 2, rows.len());
    assert!(national.iter().all(|r| r.location == "US"));

    // Saturday 2020-05-16 closes the epiweek before the forecast
    let national_cumulative = batch.aggregate_cumulative();
    let last_cumulative = last_epiweek_cumulative(&national_cumulative, forecast_date)
        .expect("observed cumulative deaths");
    assert_eq!(
        Some(last_cumulative),
        national_cumulative.value(date("2020-05-16"), Metric::Death)
    );
    let with_cum = add_cumulative_targets(&national, last_cumulative);
    let cum_points: Vec<f64> = with_cum
        .iter()
        .filter(|r| r.target.contains(" cum ") && r.quantile.is_none())
        .map(|r| r.value)
        .collect();
    assert!(!cum_points.is_empty());
    assert!(cum_points[0] > last_cumulative);
    assert!(cum_points.windows(2).all(|w| w[1] > w[0]));
}
