use anyhow::{Context, Result, anyhow, bail};
use arrow::array::{
    Array, ArrayRef, AsArray, Date32Array, Float64Array, RecordBatch, StringArray,
};
use arrow::compute::{cast, concat_batches};
use arrow::datatypes::{DataType, Date32Type, Field, Float64Type, Schema};
use chrono::{DateTime, Datelike, NaiveDate};
use epi_tvtf_api::TableFunction;
use epi_tvtf_api::arg::{Arg, Args, NamedArgs};
use forecast::submission::{
    SubmissionRow, add_cumulative_targets, aggregate_locations, last_epiweek_cumulative,
    weekly_quantile_forecast,
};
use forecast::{
    DelayParameters, EpiParameters, ForecastOptions, GeographyForecast, GeographyForecaster,
    GeographyInput, LogDiagnostics, Metric, MetricTable, ModelSummary, RateParameters, TimeSeries,
};
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{info, warn};

use crate::funcs::modellog::{ModelLog, ModelLogEntry};

/// Name of the aggregated rows of a grouped forecast.
pub const TOTAL: &str = "Total";
/// Days from 0001-01-01 to 1970-01-01.
const UNIX_EPOCH_FROM_CE: i32 = 719_163;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputKind {
    #[default]
    Daily,
    Cumulative,
    Log,
    Weekly,
}

impl OutputKind {
    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "daily" => Ok(OutputKind::Daily),
            "cumulative" | "cum" => Ok(OutputKind::Cumulative),
            "log" => Ok(OutputKind::Log),
            "weekly" => Ok(OutputKind::Weekly),
            _ => Err(anyhow!("Unknown output: {}", s)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
struct FieldConfig {
    date_field: String,
    death_field: String,
    confirmed_field: Option<String>,
    vaccinated_field: Option<String>,
    population_field: Option<String>,
    by: Option<String>,
}

/// `epi_forecast`: forecasts deaths and healthcare demand from a cumulative
/// death column, for one geography or one per group.
#[derive(Debug)]
pub struct EpiForecast {
    fields: FieldConfig,
    location: String,
    policy_change_dates: Vec<NaiveDate>,
    population: Option<f64>,
    forecast_date: Option<NaiveDate>,
    output: OutputKind,
    forecaster: GeographyForecaster,
    model_log: Option<ModelLog>,
    data_buffer: Vec<RecordBatch>,
}

impl EpiForecast {
    pub fn new(args: Option<Args>, named_arguments: NamedArgs) -> Result<Self> {
        let mut fields = FieldConfig {
            date_field: "date".to_string(),
            death_field: "death".to_string(),
            ..Default::default()
        };
        let positional = args.unwrap_or_default();
        match positional.as_slice() {
            [] => {}
            [Arg::Column(death)] => fields.death_field = death.clone(),
            [_] => bail!("The positional argument of `epi_forecast` must be a death column"),
            _ => bail!(
                "Invalid arguments, there is no {}-args constructor",
                positional.len()
            ),
        }

        let mut location = TOTAL.to_string();
        let mut policy_change_dates = Vec::new();
        let mut population = None;
        let mut forecast_date = None;
        let mut output = OutputKind::default();
        let mut model_log = None;
        let mut preset = EpiParameters::default();
        let mut rate_overrides: Vec<(String, f64)> = Vec::new();
        let mut delay_overrides: Vec<(String, u32)> = Vec::new();
        let mut options = ForecastOptions::builder();

        for (name, arg) in named_arguments {
            match name.as_str() {
                "date_field" => fields.date_field = string_arg(&name, &arg)?,
                "death_field" => fields.death_field = string_arg(&name, &arg)?,
                "confirmed_field" => fields.confirmed_field = Some(string_arg(&name, &arg)?),
                "vaccinated_field" => fields.vaccinated_field = Some(string_arg(&name, &arg)?),
                "population_field" => fields.population_field = Some(string_arg(&name, &arg)?),
                "by" => fields.by = Some(string_arg(&name, &arg)?),
                "location" => location = string_arg(&name, &arg)?,
                "policy_change_dates" => {
                    policy_change_dates.extend(parse_dates(&string_arg(&name, &arg)?)?)
                }
                "population" => {
                    let p = f64_arg(&name, &arg)?;
                    if p <= 0.0 {
                        bail!("population must be positive");
                    }
                    population = Some(p);
                }
                "forecast_date" => forecast_date = Some(date_arg(&name, &arg)?),
                "output" => output = OutputKind::from_str(&string_arg(&name, &arg)?)?,
                "model_log" => model_log = Some(ModelLog::open(string_arg(&name, &arg)?)?),
                "preset" => {
                    preset = match string_arg(&name, &arg)?.to_lowercase().as_str() {
                        "default" => EpiParameters::default(),
                        "vietnam" => EpiParameters::vietnam(),
                        other => bail!("Unknown preset: {}", other),
                    }
                }
                "death_rate" | "icu_rate" | "hospital_rate" | "symptom_rate" => {
                    let rate = f64_arg(&name, &arg)?;
                    rate_overrides.push((name, rate));
                }
                "infect_to_hospital" | "hospital_to_icu" | "icu_to_death" | "icu_to_recover"
                | "non_icu_discharge" => {
                    let days = u32::try_from(int_arg(&name, &arg)?)
                        .map_err(|_| anyhow!("{} must be a non-negative number of days", name))?;
                    delay_overrides.push((name, days));
                }
                "forecast_horizon" => {
                    let horizon = int_arg(&name, &arg)?;
                    if horizon <= 0 {
                        bail!("forecast_horizon must be a positive integer");
                    }
                    options.forecast_horizon(horizon as usize);
                }
                "contain_rate" => {
                    options.contain_rate(f64_arg(&name, &arg)?);
                }
                "vaccine_efficacy" => {
                    options.vaccine_efficacy(f64_arg(&name, &arg)?);
                }
                "use_vaccine_data" => {
                    options.use_vaccine_data(bool_arg(&name, &arg)?);
                }
                "last_data_date" => {
                    options.last_data_date(date_arg(&name, &arg)?);
                }
                _ => return Err(anyhow!("Unknown parameter: {}", name)),
            }
        }

        let params = apply_overrides(preset, &rate_overrides, &delay_overrides)?;
        let options = options.build().context("Invalid forecast options")?;
        let forecaster =
            GeographyForecaster::new(params, options).context("Invalid forecast parameters")?;

        Ok(EpiForecast {
            fields,
            location,
            policy_change_dates,
            population,
            forecast_date,
            output,
            forecaster,
            model_log,
            data_buffer: Vec::new(),
        })
    }

    /// One input per geography, in order of first appearance.
    fn geography_inputs(&self, batch: &RecordBatch) -> Result<Vec<GeographyInput>> {
        let fields = &self.fields;
        let dates = date_column(batch, &fields.date_field)?;
        let deaths = numeric_column(batch, &fields.death_field)?;
        let confirmed = optional_column(batch, fields.confirmed_field.as_deref())?;
        let vaccinated = optional_column(batch, fields.vaccinated_field.as_deref())?;
        let population = optional_column(batch, fields.population_field.as_deref())?;
        let groups = match fields.by.as_deref() {
            Some(by) => string_column(batch, by)?,
            None => vec![Some(self.location.clone()); batch.num_rows()],
        };

        #[derive(Default)]
        struct Rows {
            deaths: Vec<(NaiveDate, Option<f64>)>,
            confirmed: Vec<(NaiveDate, Option<f64>)>,
            vaccinated: BTreeMap<NaiveDate, f64>,
            population: Option<f64>,
        }

        let mut order: Vec<String> = Vec::new();
        let mut rows: HashMap<String, Rows> = HashMap::new();
        for (row, (date, group)) in dates.iter().zip(groups).enumerate() {
            let (Some(date), Some(group)) = (*date, group) else {
                continue;
            };
            let entry = rows.entry(group.clone()).or_insert_with(|| {
                order.push(group);
                Rows::default()
            });
            entry.deaths.push((date, deaths[row]));
            if let Some(confirmed) = &confirmed {
                entry.confirmed.push((date, confirmed[row]));
            }
            if let Some(v) = vaccinated.as_ref().and_then(|v| v[row]) {
                entry.vaccinated.insert(date, v);
            }
            if entry.population.is_none() {
                entry.population = population.as_ref().and_then(|p| p[row]);
            }
        }

        let mut inputs = Vec::with_capacity(order.len());
        for name in order {
            let Some(r) = rows.remove(&name) else {
                continue;
            };
            let mut input = GeographyInput::new(name, r.deaths)
                .with_policy_change_dates(self.policy_change_dates.clone());
            if confirmed.is_some() {
                input = input.with_confirmed(r.confirmed);
            }
            if !r.vaccinated.is_empty() {
                input = input.with_vaccinated(TimeSeries::from_pairs(r.vaccinated)?);
            }
            if let Some(p) = r.population.or(self.population).filter(|p| *p > 0.0) {
                input = input.with_population(p);
            }
            inputs.push(input);
        }
        Ok(inputs)
    }

    fn forecast_all(&self, inputs: &[GeographyInput]) -> Result<Vec<GeographyForecast>> {
        let batch = self.forecaster.forecast_batch(inputs);
        if self.fields.by.is_none() {
            if let Some((name, e)) = batch.failures.into_iter().next() {
                return Err(e).context(format!("Failed to forecast {}", name));
            }
        } else if batch.forecasts.is_empty() && !batch.failures.is_empty() {
            bail!("None of the {} groups could be forecast", batch.failures.len());
        }
        self.log_models(batch.forecasts.iter().map(|f| (f.name.as_str(), &f.summary)))?;
        Ok(batch.forecasts)
    }

    fn log_models<'a>(
        &self,
        summaries: impl Iterator<Item = (&'a str, &'a ModelSummary)>,
    ) -> Result<()> {
        let Some(log) = &self.model_log else {
            return Ok(());
        };
        let opts = self.forecaster.options();
        let entries: Vec<ModelLogEntry> = summaries
            .map(|(name, summary)| {
                ModelLogEntry::new(
                    name,
                    &self.policy_change_dates,
                    *self.forecaster.params(),
                    opts.last_data_date,
                    summary.clone(),
                )
            })
            .collect();
        log.append(&entries)
    }

    fn table_output(&self, forecasts: &[GeographyForecast]) -> Result<RecordBatch> {
        let cumulative = self.output == OutputKind::Cumulative;
        let pick = |f: &GeographyForecast| -> MetricTable {
            if cumulative { f.cumulative.clone() } else { f.daily.clone() }
        };
        let mut tables: Vec<(String, MetricTable)> =
            forecasts.iter().map(|f| (f.name.clone(), pick(f))).collect();
        if self.fields.by.is_some() {
            let total = MetricTable::sum(tables.iter().map(|(_, t)| t));
            tables.push((TOTAL.to_string(), total));
        }

        let metrics: Vec<Metric> = tables
            .first()
            .map(|(_, t)| t.metrics().collect())
            .unwrap_or_default();
        let mut group_values: Vec<String> = Vec::new();
        let mut dates: Vec<i32> = Vec::new();
        let mut columns: Vec<Vec<Option<f64>>> = vec![Vec::new(); metrics.len()];
        for (name, table) in &tables {
            group_values.extend(std::iter::repeat_n(name.clone(), table.len()));
            dates.extend(table.dates().iter().map(|d| to_date32(*d)));
            for (metric, column) in metrics.iter().zip(columns.iter_mut()) {
                match table.column(*metric) {
                    Some(values) => column.extend_from_slice(values),
                    None => column.extend(std::iter::repeat_n(None, table.len())),
                }
            }
        }

        let mut output_fields = Vec::new();
        let mut output_columns: Vec<ArrayRef> = Vec::new();
        if let Some(by) = &self.fields.by {
            output_fields.push(Field::new(by, DataType::Utf8, false));
            output_columns.push(Arc::new(StringArray::from(group_values)));
        }
        output_fields.push(Field::new("date", DataType::Date32, false));
        output_columns.push(Arc::new(Date32Array::from(dates)));
        for (metric, values) in metrics.iter().zip(columns) {
            output_fields.push(Field::new(metric.name(), DataType::Float64, true));
            output_columns.push(Arc::new(Float64Array::from(values)));
        }
        RecordBatch::try_new(Arc::new(Schema::new(output_fields)), output_columns)
            .context("Failed to create output RecordBatch")
    }

    fn log_output(&self, inputs: &[GeographyInput]) -> Result<RecordBatch> {
        let mut diagnostics: Vec<LogDiagnostics> = Vec::new();
        for input in inputs {
            match self.forecaster.forecast_log(input) {
                Ok(d) => diagnostics.push(d),
                Err(e) if self.fields.by.is_some() => {
                    warn!(geography = %input.name, error = %e, "skipping geography");
                }
                Err(e) => return Err(e).context(format!("Failed to forecast {}", input.name)),
            }
        }
        self.log_models(diagnostics.iter().map(|d| (d.name.as_str(), &d.forecast.summary)))?;

        let mut group_values: Vec<String> = Vec::new();
        let mut dates: Vec<i32> = Vec::new();
        let mut columns: [Vec<Option<f64>>; 5] = Default::default();
        for d in &diagnostics {
            let f = &d.forecast;
            group_values.extend(std::iter::repeat_n(d.name.clone(), f.len()));
            for (i, date) in f.dates.iter().enumerate() {
                dates.push(to_date32(*date));
                columns[0].push(d.observed.get(*date));
                columns[1].push(f.observed[i]);
                columns[2].push(Some(f.mean[i]));
                columns[3].push(Some(f.lower[i]));
                columns[4].push(Some(f.upper[i]));
            }
        }

        let mut output_fields = Vec::new();
        let mut output_columns: Vec<ArrayRef> = Vec::new();
        if let Some(by) = &self.fields.by {
            output_fields.push(Field::new(by, DataType::Utf8, false));
            output_columns.push(Arc::new(StringArray::from(group_values)));
        }
        output_fields.push(Field::new("date", DataType::Date32, false));
        output_columns.push(Arc::new(Date32Array::from(dates)));
        let names = [
            "log_death",
            "log_avg_death",
            "log_predicted",
            "log_lower",
            "log_upper",
        ];
        for (name, values) in names.into_iter().zip(columns) {
            output_fields.push(Field::new(name, DataType::Float64, true));
            output_columns.push(Arc::new(Float64Array::from(values)));
        }
        RecordBatch::try_new(Arc::new(Schema::new(output_fields)), output_columns)
            .context("Failed to create output RecordBatch")
    }

    fn weekly_output(&self, forecasts: &[GeographyForecast]) -> Result<RecordBatch> {
        let mut rows: Vec<SubmissionRow> = Vec::new();
        let mut totals: BTreeMap<NaiveDate, (Vec<SubmissionRow>, f64)> = BTreeMap::new();
        for f in forecasts {
            let Some(forecast_date) = self
                .forecast_date
                .or(f.last_data_date)
                .or_else(|| f.daily.series(Metric::Death).last_date())
            else {
                continue;
            };
            let incident = weekly_quantile_forecast(&f.daily, &f.name, forecast_date)?;
            let last_cumulative = last_epiweek_cumulative(&f.cumulative, forecast_date)
                .with_context(|| format!("No cumulative baseline for {}", f.name))?;
            rows.extend(add_cumulative_targets(&incident, last_cumulative));
            let total = totals.entry(forecast_date).or_default();
            total.0.extend(incident);
            total.1 += last_cumulative;
        }
        if self.fields.by.is_some() {
            for (incident, last_cumulative) in totals.values() {
                let national = aggregate_locations(incident, TOTAL);
                rows.extend(add_cumulative_targets(&national, *last_cumulative));
            }
        }

        let schema = Schema::new(vec![
            Field::new("forecast_date", DataType::Date32, false),
            Field::new("target", DataType::Utf8, false),
            Field::new("target_end_date", DataType::Date32, false),
            Field::new("location", DataType::Utf8, false),
            Field::new("type", DataType::Utf8, false),
            Field::new("quantile", DataType::Float64, true),
            Field::new("value", DataType::Float64, false),
        ]);
        let columns: Vec<ArrayRef> = vec![
            Arc::new(Date32Array::from_iter_values(
                rows.iter().map(|r| to_date32(r.forecast_date)),
            )),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| &r.target))),
            Arc::new(Date32Array::from_iter_values(
                rows.iter().map(|r| to_date32(r.target_end_date)),
            )),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| &r.location))),
            Arc::new(StringArray::from_iter_values(rows.iter().map(|r| r.kind()))),
            Arc::new(Float64Array::from(
                rows.iter().map(|r| r.quantile).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from_iter_values(rows.iter().map(|r| r.value))),
        ];
        RecordBatch::try_new(Arc::new(schema), columns)
            .context("Failed to create output RecordBatch")
    }
}

impl TableFunction for EpiForecast {
    fn process(&mut self, input: RecordBatch) -> Result<Option<RecordBatch>> {
        // the fit needs the whole series
        self.data_buffer.push(input);
        Ok(None)
    }

    fn finalize(&mut self) -> Result<Option<RecordBatch>> {
        let Some(first_batch) = self.data_buffer.first() else {
            return Ok(None);
        };
        let batch = concat_batches(&first_batch.schema(), &self.data_buffer)
            .context("Failed to concatenate input batches")?;
        self.data_buffer.clear();
        if batch.num_rows() == 0 {
            return Ok(None);
        }

        let inputs = self.geography_inputs(&batch)?;
        info!(geographies = inputs.len(), output = ?self.output, "running epi_forecast");
        let output = match self.output {
            OutputKind::Daily | OutputKind::Cumulative => {
                let forecasts = self.forecast_all(&inputs)?;
                self.table_output(&forecasts)?
            }
            OutputKind::Weekly => {
                let forecasts = self.forecast_all(&inputs)?;
                self.weekly_output(&forecasts)?
            }
            OutputKind::Log => self.log_output(&inputs)?,
        };
        Ok(Some(output))
    }
}

fn apply_overrides(
    preset: EpiParameters,
    rates: &[(String, f64)],
    delays: &[(String, u32)],
) -> Result<EpiParameters> {
    let mut r: RateParameters = preset.rates;
    for (name, value) in rates {
        match name.as_str() {
            "death_rate" => r.death_rate = *value,
            "icu_rate" => r.icu_rate = *value,
            "hospital_rate" => r.hospital_rate = *value,
            _ => r.symptom_rate = *value,
        }
    }
    let mut d: DelayParameters = preset.delays;
    for (name, value) in delays {
        match name.as_str() {
            "infect_to_hospital" => d.infect_to_hospital = *value,
            "hospital_to_icu" => d.hospital_to_icu = *value,
            "icu_to_death" => d.icu_to_death = *value,
            "icu_to_recover" => d.icu_to_recover = *value,
            _ => d.non_icu_discharge = *value,
        }
    }
    EpiParameters::new(r, d).context("Invalid epidemiological parameters")
}

fn string_arg(name: &str, arg: &Arg) -> Result<String> {
    arg.as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("{} must be a string", name))
}

fn f64_arg(name: &str, arg: &Arg) -> Result<f64> {
    arg.as_f64()
        .filter(|v| v.is_finite())
        .ok_or_else(|| anyhow!("{} must be a number", name))
}

fn int_arg(name: &str, arg: &Arg) -> Result<i64> {
    arg.as_i64()
        .ok_or_else(|| anyhow!("{} must be an integer", name))
}

fn bool_arg(name: &str, arg: &Arg) -> Result<bool> {
    arg.as_bool()
        .ok_or_else(|| anyhow!("{} must be a boolean", name))
}

fn date_arg(name: &str, arg: &Arg) -> Result<NaiveDate> {
    if let Arg::Timestamp(micros) = arg {
        return DateTime::from_timestamp_micros(*micros)
            .map(|t| t.date_naive())
            .ok_or_else(|| anyhow!("{} timestamp {} is out of range", name, micros));
    }
    let s = string_arg(name, arg)?;
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
        .context(format!("{} must be a YYYY-MM-DD date, got {}", name, s))
}

/// Dates separated by commas, semicolons or whitespace.
fn parse_dates(s: &str) -> Result<Vec<NaiveDate>> {
    let separator = Regex::new(r"[,;\s]+").context("Invalid date separator regex")?;
    separator
        .split(s.trim())
        .filter(|part| !part.is_empty())
        .map(|part| {
            NaiveDate::parse_from_str(part, "%Y-%m-%d")
                .context(format!("Invalid policy change date: {}", part))
        })
        .collect()
}

fn to_date32(date: NaiveDate) -> i32 {
    date.num_days_from_ce() - UNIX_EPOCH_FROM_CE
}

fn column<'a>(batch: &'a RecordBatch, name: &str) -> Result<&'a ArrayRef> {
    let idx = batch
        .schema()
        .index_of(name)
        .map_err(|_| anyhow!("Field not found: {}", name))?;
    Ok(batch.column(idx))
}

/// Date32, Date64, timestamp or `YYYY-MM-DD` string column.
fn date_column(batch: &RecordBatch, name: &str) -> Result<Vec<Option<NaiveDate>>> {
    let array = column(batch, name)?;
    let array = cast(array, &DataType::Date32)
        .context(format!("{} cannot be read as a date column", name))?;
    let dates = array.as_primitive::<Date32Type>();
    Ok((0..dates.len())
        .map(|i| {
            if dates.is_valid(i) {
                dates.value_as_date(i)
            } else {
                None
            }
        })
        .collect())
}

fn numeric_column(batch: &RecordBatch, name: &str) -> Result<Vec<Option<f64>>> {
    let array = column(batch, name)?;
    let array = cast(array, &DataType::Float64)
        .context(format!("{} cannot be read as a numeric column", name))?;
    Ok(array.as_primitive::<Float64Type>().iter().collect())
}

fn optional_column(batch: &RecordBatch, name: Option<&str>) -> Result<Option<Vec<Option<f64>>>> {
    name.map(|name| numeric_column(batch, name)).transpose()
}

fn string_column(batch: &RecordBatch, name: &str) -> Result<Vec<Option<String>>> {
    let array = column(batch, name)?;
    let array = cast(array, &DataType::Utf8)
        .context(format!("{} cannot be read as a string column", name))?;
    Ok(array
        .as_string::<i32>()
        .iter()
        .map(|v| v.map(str::to_string))
        .collect())
}
