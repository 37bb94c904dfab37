use anyhow::Context;
use arrow::{
    array::{ArrayRef, BooleanArray, Float64Array, StringArray, UInt32Array},
    csv::Writer,
    record_batch::RecordBatch,
};
use arrow_csv::WriterBuilder;
use arrow_schema::{DataType, Field, Schema, SchemaRef};
use chrono::{NaiveDate, Utc};
use forecast::{EpiParameters, ModelSummary};
use parking_lot::Mutex;
use std::{
    fs::File,
    io::BufWriter,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

/// One fitted geography, as recorded in the model log.
#[derive(Debug, Clone)]
pub struct ModelLogEntry {
    pub timestamp: String,
    pub geography: String,
    pub policy_change_dates: Vec<NaiveDate>,
    pub params: EpiParameters,
    pub last_data_date: Option<NaiveDate>,
    pub summary: ModelSummary,
}

impl ModelLogEntry {
    pub fn new(
        geography: impl Into<String>,
        policy_change_dates: &[NaiveDate],
        params: EpiParameters,
        last_data_date: Option<NaiveDate>,
        summary: ModelSummary,
    ) -> Self {
        ModelLogEntry {
            timestamp: Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            geography: geography.into(),
            policy_change_dates: policy_change_dates.to_vec(),
            params,
            last_data_date,
            summary,
        }
    }
}

/// Append-only CSV of every model fitted, one row per geography.
#[derive(Debug)]
pub struct ModelLog {
    path: PathBuf,
    writer: Mutex<Writer<BufWriter<File>>>,
    rows_written: AtomicU64,
}

impl ModelLog {
    /// Opens `path` for appending; the header goes only into an empty file.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<ModelLog> {
        let path = path.into();
        let file = File::options()
            .create(true)
            .append(true)
            .open(&path)
            .context(format!(
                "Failed to create/open model log at: {}",
                path.to_string_lossy()
            ))?;
        // Default to writing headers if we can't determine file size
        let should_write_headers = file.metadata().map(|meta| meta.len() == 0).unwrap_or(true);
        let writer = WriterBuilder::new()
            .with_header(should_write_headers)
            .build(BufWriter::new(file));
        Ok(ModelLog {
            path,
            writer: writer.into(),
            rows_written: 0.into(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written.load(Ordering::Acquire)
    }

    pub fn append(&self, entries: &[ModelLogEntry]) -> anyhow::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let batch = to_record_batch(entries)?;
        let mut writer = self.writer.lock();
        writer.write(&batch).context(format!(
            "Failed to append to model log at: {}",
            self.path.to_string_lossy()
        ))?;
        self.rows_written
            .fetch_add(batch.num_rows() as u64, Ordering::Relaxed);
        Ok(())
    }
}

fn schema() -> SchemaRef {
    let mut fields = vec![
        Field::new("timestamp", DataType::Utf8, false),
        Field::new("geography", DataType::Utf8, false),
        Field::new("policy_change_dates", DataType::Utf8, false),
    ];
    for rate in ["death_rate", "icu_rate", "hospital_rate", "symptom_rate"] {
        fields.push(Field::new(rate, DataType::Float64, false));
    }
    for delay in [
        "infect_to_hospital",
        "hospital_to_icu",
        "icu_to_death",
        "icu_to_recover",
        "non_icu_discharge",
    ] {
        fields.push(Field::new(delay, DataType::UInt32, false));
    }
    fields.extend([
        Field::new("back_test", DataType::Boolean, false),
        Field::new("last_data_date", DataType::Utf8, true),
        Field::new("breakpoints", DataType::Utf8, false),
        Field::new("coefficients", DataType::Utf8, false),
        Field::new("override_applied", DataType::Boolean, false),
    ]);
    Arc::new(Schema::new(fields))
}

fn join_dates(dates: &[NaiveDate]) -> String {
    dates
        .iter()
        .map(|d| d.format("%Y-%m-%d").to_string())
        .collect::<Vec<_>>()
        .join(";")
}

fn to_record_batch(entries: &[ModelLogEntry]) -> anyhow::Result<RecordBatch> {
    let strings = |f: &dyn Fn(&ModelLogEntry) -> String| {
        Arc::new(StringArray::from_iter_values(entries.iter().map(f))) as ArrayRef
    };
    let floats = |f: &dyn Fn(&ModelLogEntry) -> f64| {
        Arc::new(Float64Array::from_iter_values(entries.iter().map(f))) as ArrayRef
    };
    let days = |f: &dyn Fn(&ModelLogEntry) -> u32| {
        Arc::new(UInt32Array::from_iter_values(entries.iter().map(f))) as ArrayRef
    };
    let coefficients = entries
        .iter()
        .map(|e| serde_json::to_string(&e.summary.coefficients))
        .collect::<Result<Vec<_>, _>>()
        .context("Failed to serialize model coefficients")?;

    let columns = vec![
        strings(&|e| e.timestamp.clone()),
        strings(&|e| e.geography.clone()),
        strings(&|e| join_dates(&e.policy_change_dates)),
        floats(&|e| e.params.rates.death_rate),
        floats(&|e| e.params.rates.icu_rate),
        floats(&|e| e.params.rates.hospital_rate),
        floats(&|e| e.params.rates.symptom_rate),
        days(&|e| e.params.delays.infect_to_hospital),
        days(&|e| e.params.delays.hospital_to_icu),
        days(&|e| e.params.delays.icu_to_death),
        days(&|e| e.params.delays.icu_to_recover),
        days(&|e| e.params.delays.non_icu_discharge),
        Arc::new(BooleanArray::from(
            entries
                .iter()
                .map(|e| e.last_data_date.is_some())
                .collect::<Vec<_>>(),
        )) as ArrayRef,
        Arc::new(StringArray::from(
            entries
                .iter()
                .map(|e| e.last_data_date.map(|d| d.format("%Y-%m-%d").to_string()))
                .collect::<Vec<_>>(),
        )) as ArrayRef,
        strings(&|e| join_dates(&e.summary.breakpoint_dates())),
        Arc::new(StringArray::from(coefficients)) as ArrayRef,
        Arc::new(BooleanArray::from(
            entries
                .iter()
                .map(|e| e.summary.override_applied)
                .collect::<Vec<_>>(),
        )) as ArrayRef,
    ];
    RecordBatch::try_new(schema(), columns).context("Failed to create model log record batch")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{fs, io::Write};
    use tempfile::NamedTempFile;

    fn date(s: &str) -> NaiveDate {
        NaiveDate::parse_from_str(s, "%Y-%m-%d").expect("valid test date")
    }

    fn entry(geography: &str, last_data_date: Option<NaiveDate>) -> ModelLogEntry {
        let summary = ModelSummary {
            series_start: date("2020-03-01"),
            breakpoints: vec![0, 28, 90],
            coefficients: vec![0.5, 0.1, -0.15],
            segments: Vec::new(),
            override_applied: true,
            fitted_points: 40,
            outliers: 1,
        };
        ModelLogEntry {
            timestamp: "2020-05-01 12:00:00".to_string(),
            ..ModelLogEntry::new(
                geography,
                &[date("2020-03-10")],
                EpiParameters::default(),
                last_data_date,
                summary,
            )
        }
    }

    #[test]
    fn test_model_log_rows() {
        let temp_file = NamedTempFile::new().expect("Failed to create temporary file");
        let log = ModelLog::open(temp_file.path()).expect("Failed to open model log");
        log.append(&[entry("Texas", None), entry("Ohio", Some(date("2020-04-20")))])
            .expect("append failed");
        assert_eq!(log.rows_written(), 2);

        let content = fs::read_to_string(temp_file.path()).expect("Failed to read CSV file");
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("timestamp,geography,policy_change_dates,death_rate"));
        assert!(lines[1].contains("Texas,2020-03-10,0.36,0.78,2.18,10.2,11,4,4,7,5,false,,"));
        assert!(lines[1].contains("2020-03-01;2020-03-29;2020-05-30"));
        assert!(lines[2].contains("true,2020-04-20,"));
        assert!(lines[2].ends_with(",true"));
    }

    #[test]
    fn test_model_log_header_written_once() {
        let temp_file = NamedTempFile::new().expect("Failed to create temporary file");
        {
            let log = ModelLog::open(temp_file.path()).expect("Failed to open model log");
            log.append(&[entry("Texas", None)]).expect("append failed");
        }
        {
            let log = ModelLog::open(temp_file.path()).expect("Failed to reopen model log");
            log.append(&[entry("Ohio", None)]).expect("append failed");
            log.append(&[]).expect("empty append is a no-op");
            assert_eq!(log.rows_written(), 1);
        }
        let content = fs::read_to_string(temp_file.path()).expect("Failed to read CSV file");
        assert_eq!(content.matches("timestamp,geography").count(), 1);
        assert_eq!(content.lines().count(), 3);
    }

    #[test]
    fn test_model_log_appends_to_existing_content() {
        let temp_file = NamedTempFile::new().expect("Failed to create temporary file");
        {
            let mut file = File::create(temp_file.path()).expect("Failed to create file");
            writeln!(file, "timestamp,geography").expect("Failed to write header");
        }
        let log = ModelLog::open(temp_file.path()).expect("Failed to open model log");
        log.append(&[entry("Texas", None)]).expect("append failed");
        let content = fs::read_to_string(temp_file.path()).expect("Failed to read CSV file");
        assert_eq!(content.lines().count(), 2);
        assert_eq!(log.path(), temp_file.path());
    }

    #[test]
    fn test_model_log_invalid_path() {
        let invalid_path = "/nonexistent_dir/invalid/models.csv";
        let err = ModelLog::open(invalid_path).expect_err("open must fail");
        assert!(err.to_string().contains(invalid_path));
    }
}
