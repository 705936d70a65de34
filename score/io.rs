// ========================================================================================
//
//                          RECORD SOURCES AND SEGMENT SINKS
//
// ========================================================================================
//
// The engine never talks to a data mart or a results store directly. It reads records
// through `RecordSource` and hands finished rows to `SegmentSink`. The tab-separated
// adapters below are what the pipeline uses for local runs and tests.

use crate::survival::{CovariateKind, CovariateSpec};
use crate::types::{CovariateValue, Covariates, Record, SegmentRow};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TSV error: {0}")]
    Tsv(#[from] csv::Error),
    #[error("The required column '{0}' was not found in the input file.")]
    ColumnNotFound(String),
    #[error("Line {line}: column '{column}' holds '{value}', which is not a valid {expected}.")]
    InvalidValue {
        line: u64,
        column: String,
        value: String,
        expected: &'static str,
    },
    #[error("Invalid column schema: {0}")]
    InvalidSchema(String),
}

/// Supplies training, scoring or held-out records.
pub trait RecordSource {
    fn load_records(&self) -> Result<Vec<Record>, DataError>;
}

/// Receives one row per scored buyer.
pub trait SegmentSink {
    fn write_rows(&mut self, rows: &[SegmentRow]) -> Result<(), DataError>;
}

/// Column names of the non-covariate fields. Covariate columns carry the covariate's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnSchema {
    pub customer_id: String,
    pub client_id: String,
    pub outcome_time: String,
    /// Column holding the event flag.
    pub event: String,
    /// Cell value in `event` that means a second purchase was observed.
    pub event_value: String,
    /// Cell value in `event` that means the record is right-censored.
    pub censored_value: String,
    pub net_margin: String,
}

impl Default for ColumnSchema {
    fn default() -> Self {
        Self {
            customer_id: "customer_id".to_string(),
            client_id: "client_id".to_string(),
            outcome_time: "outcome_time".to_string(),
            event: "censored".to_string(),
            event_value: "1".to_string(),
            censored_value: "0".to_string(),
            net_margin: "net_margin_realized".to_string(),
        }
    }
}

impl ColumnSchema {
    fn fixed_columns(&self) -> [&str; 5] {
        [
            self.customer_id.as_str(),
            self.client_id.as_str(),
            self.outcome_time.as_str(),
            self.event.as_str(),
            self.net_margin.as_str(),
        ]
    }

    /// Column names must be non-empty and must not collide with each other or a covariate.
    pub fn validate(&self, covariates: &[CovariateSpec]) -> Result<(), DataError> {
        let mut names: Vec<&str> = self.fixed_columns().to_vec();
        names.extend(covariates.iter().map(|spec| spec.name.as_str()));
        if names.iter().any(|name| name.is_empty()) {
            return Err(DataError::InvalidSchema(
                "column names must not be empty".to_string(),
            ));
        }
        let mut sorted = names.clone();
        sorted.sort_unstable();
        if let Some(pair) = sorted.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(DataError::InvalidSchema(format!(
                "column '{}' is used twice",
                pair[0]
            )));
        }
        if self.event_value.trim().is_empty() || self.censored_value.trim().is_empty() {
            return Err(DataError::InvalidSchema(
                "event and censored values must not be empty".to_string(),
            ));
        }
        if self.event_value.trim() == self.censored_value.trim() {
            return Err(DataError::InvalidSchema(format!(
                "event and censored values are both '{}'",
                self.event_value
            )));
        }
        Ok(())
    }
}

struct ColumnIndex {
    customer_id: usize,
    client_id: usize,
    outcome_time: usize,
    event: usize,
    net_margin: Option<usize>,
    covariates: Vec<(usize, CovariateSpec)>,
}

impl ColumnIndex {
    fn resolve(
        headers: &csv::StringRecord,
        schema: &ColumnSchema,
        covariates: &[CovariateSpec],
    ) -> Result<Self, DataError> {
        let find = |name: &str| headers.iter().position(|header| header.trim() == name);
        let require =
            |name: &str| find(name).ok_or_else(|| DataError::ColumnNotFound(name.to_string()));
        Ok(Self {
            customer_id: require(&schema.customer_id)?,
            client_id: require(&schema.client_id)?,
            outcome_time: require(&schema.outcome_time)?,
            event: require(&schema.event)?,
            net_margin: find(&schema.net_margin),
            covariates: covariates
                .iter()
                .map(|spec| Ok((require(&spec.name)?, spec.clone())))
                .collect::<Result<_, DataError>>()?,
        })
    }
}

fn cell(row: &csv::StringRecord, idx: usize) -> Option<&str> {
    row.get(idx).map(str::trim).filter(|value| !value.is_empty())
}

fn invalid_value(
    row: &csv::StringRecord,
    column: &str,
    value: &str,
    expected: &'static str,
) -> DataError {
    DataError::InvalidValue {
        line: row.position().map_or(0, |position| position.line()),
        column: column.to_string(),
        value: value.to_string(),
        expected,
    }
}

fn required_cell<'r>(
    row: &'r csv::StringRecord,
    idx: usize,
    column: &str,
) -> Result<&'r str, DataError> {
    cell(row, idx).ok_or_else(|| invalid_value(row, column, "", "non-empty identifier"))
}

fn event_cell(
    row: &csv::StringRecord,
    idx: usize,
    schema: &ColumnSchema,
) -> Result<bool, DataError> {
    match cell(row, idx) {
        Some(value) if value == schema.event_value.trim() => Ok(true),
        Some(value) if value == schema.censored_value.trim() => Ok(false),
        other => Err(invalid_value(
            row,
            &schema.event,
            other.unwrap_or_default(),
            "event flag",
        )),
    }
}

fn parse_cell<T: std::str::FromStr>(
    row: &csv::StringRecord,
    idx: usize,
    column: &str,
    expected: &'static str,
) -> Result<Option<T>, DataError> {
    match cell(row, idx) {
        None => Ok(None),
        Some(value) => value
            .parse()
            .map(Some)
            .map_err(|_| invalid_value(row, column, value, expected)),
    }
}

/// Reads tab-separated records with a header row.
///
/// Empty covariate, outcome-time and margin cells are missing values. Identifiers must be
/// present and the event cell must hold either the event or the censored value.
pub fn read_records<R: io::Read>(
    reader: R,
    schema: &ColumnSchema,
    covariates: &[CovariateSpec],
) -> Result<Vec<Record>, DataError> {
    schema.validate(covariates)?;
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .flexible(true)
        .from_reader(reader);
    let headers = reader.headers()?.clone();
    let columns = ColumnIndex::resolve(&headers, schema, covariates)?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let mut values = Covariates::new();
        for (idx, spec) in &columns.covariates {
            let value = match spec.kind {
                CovariateKind::Numeric => parse_cell::<f64>(&row, *idx, &spec.name, "number")?
                    .map(CovariateValue::Numeric),
                CovariateKind::Categorical => {
                    cell(&row, *idx).map(|level| CovariateValue::Level(level.to_string()))
                }
            };
            if let Some(value) = value {
                values.insert(spec.name.clone(), value);
            }
        }

        let customer_id = required_cell(&row, columns.customer_id, &schema.customer_id)?;
        let client_id = required_cell(&row, columns.client_id, &schema.client_id)?;
        let outcome_time = parse_cell(
            &row,
            columns.outcome_time,
            &schema.outcome_time,
            "whole day count",
        )?;
        records.push(Record {
            customer_id: customer_id.to_string(),
            client_id: client_id.to_string(),
            covariates: values,
            outcome_time,
            event_observed: event_cell(&row, columns.event, schema)?,
            net_margin_realized: match columns.net_margin {
                Some(idx) => parse_cell(&row, idx, &schema.net_margin, "number")?,
                None => None,
            },
        });
    }
    Ok(records)
}

/// A tab-separated file of records.
#[derive(Debug, Clone)]
pub struct TsvRecordSource {
    path: PathBuf,
    schema: ColumnSchema,
    covariates: Vec<CovariateSpec>,
}

impl TsvRecordSource {
    pub fn new(
        path: impl Into<PathBuf>,
        schema: ColumnSchema,
        covariates: Vec<CovariateSpec>,
    ) -> Self {
        Self {
            path: path.into(),
            schema,
            covariates,
        }
    }
}

impl RecordSource for TsvRecordSource {
    fn load_records(&self) -> Result<Vec<Record>, DataError> {
        let file = File::open(&self.path)?;
        let records = read_records(file, &self.schema, &self.covariates)?;
        log::info!("Read {} records from {}", records.len(), self.path.display());
        Ok(records)
    }
}

const SEGMENT_HEADER: [&str; 6] = [
    "customer_id",
    "client_id",
    "score",
    "expected_value",
    "buyer_segment",
    "client_group",
];

/// Writes segment rows as tab-separated text, header first.
pub struct TsvSegmentSink<W: io::Write> {
    writer: csv::Writer<W>,
    header_written: bool,
}

impl TsvSegmentSink<File> {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, DataError> {
        Ok(Self::from_writer(File::create(path)?))
    }
}

impl<W: io::Write> TsvSegmentSink<W> {
    pub fn from_writer(writer: W) -> Self {
        Self {
            writer: csv::WriterBuilder::new()
                .delimiter(b'\t')
                .has_headers(false)
                .from_writer(writer),
            header_written: false,
        }
    }

    /// Flushes and returns the underlying writer.
    pub fn into_inner(self) -> Result<W, DataError> {
        self.writer
            .into_inner()
            .map_err(|err| DataError::Io(err.into_error()))
    }
}

impl<W: io::Write> SegmentSink for TsvSegmentSink<W> {
    fn write_rows(&mut self, rows: &[SegmentRow]) -> Result<(), DataError> {
        if !self.header_written {
            self.writer.write_record(SEGMENT_HEADER)?;
            self.header_written = true;
        }
        for row in rows {
            self.writer.serialize(row)?;
        }
        self.writer.flush()?;
        Ok(())
    }
}
