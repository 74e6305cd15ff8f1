//! Historical observation ingestion
//!
//! Loads hourly observation tables (CSV files or the column-oriented hourly
//! payload layout) into a validated [`ObservationSeries`]. Missing or
//! non-numeric cells are rejected; nothing is imputed.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use tracing::{debug, info};

use crate::domain::{vapour_pressure_deficit, Feature, Observation, ObservationSeries, FEATURE_COUNT};
use crate::error::{ForecastError, Result};

const TIMESTAMP_COLUMNS: [&str; 5] = ["time", "timestamp", "datetime", "date", "date_time"];

const NAIVE_FORMATS: [&str; 4] = [
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];

/// Column-oriented hourly block: one `time` array plus one array per variable
#[derive(Debug, Clone, Deserialize)]
pub struct HourlyPayload {
    pub time: Vec<String>,
    #[serde(flatten)]
    pub columns: HashMap<String, serde_json::Value>,
}

/// Where each feature comes from in a source table
#[derive(Debug, Clone, Copy)]
enum ColumnSource {
    Column(usize),
    DerivedVpd,
}

#[derive(Debug, Clone, Default)]
pub struct DataIngestor;

impl DataIngestor {
    pub fn new() -> Self {
        Self
    }

    pub fn from_csv_path(&self, path: impl AsRef<Path>) -> Result<ObservationSeries> {
        let path = path.as_ref();
        let file = std::fs::File::open(path).map_err(|e| {
            ForecastError::DataValidation(format!("cannot open {}: {e}", path.display()))
        })?;
        let series = self.from_csv_reader(file)?;
        info!(path = %path.display(), observations = series.len(), "loaded observation table");
        Ok(series)
    }

    pub fn from_csv_reader<R: Read>(&self, reader: R) -> Result<ObservationSeries> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let headers = rdr
            .headers()
            .map_err(|e| ForecastError::DataValidation(format!("unreadable header row: {e}")))?
            .clone();

        let header_names: Vec<&str> = headers.iter().collect();
        let ts_col = timestamp_column(&header_names)?;
        let sources = resolve_columns(&header_names)?;

        let mut observations = Vec::new();
        for (i, record) in rdr.records().enumerate() {
            // header is line 1
            let line = i + 2;
            let record = record
                .map_err(|e| ForecastError::DataValidation(format!("line {line}: {e}")))?;
            let timestamp = parse_timestamp(record.get(ts_col).unwrap_or(""))
                .map_err(|e| ForecastError::DataValidation(format!("line {line}: {e}")))?;
            let values = build_values(&sources, |col| {
                let cell = record.get(col).unwrap_or("");
                parse_cell(cell).map_err(|e| {
                    ForecastError::DataValidation(format!(
                        "line {line}, column '{}': {e}",
                        header_names[col]
                    ))
                })
            })?;
            observations.push(Observation::new(timestamp, values));
        }

        debug!(rows = observations.len(), "parsed csv rows");
        ObservationSeries::new(observations)
    }

    /// Ingest a column-oriented hourly block.
    ///
    /// When several aliases of one variable are present the canonical name
    /// wins, then the alphabetically first alias. Columns that feed no
    /// feature are ignored.
    pub fn from_hourly_payload(&self, payload: &HourlyPayload) -> Result<ObservationSeries> {
        let mut names: Vec<&str> = payload.columns.keys().map(String::as_str).collect();
        names.sort_by_key(|name| (!is_canonical(name), *name));
        let sources = resolve_columns(&names)?;

        let unused: &[serde_json::Value] = &[];
        let mut columns = vec![unused; names.len()];
        for source in &sources {
            let ColumnSource::Column(col) = *source else {
                continue;
            };
            let name = names[col];
            let values = payload.columns[name].as_array().ok_or_else(|| {
                ForecastError::DataValidation(format!("column '{name}' is not an array"))
            })?;
            if values.len() != payload.time.len() {
                return Err(ForecastError::DataValidation(format!(
                    "column '{name}' has {} entries, expected {}",
                    values.len(),
                    payload.time.len()
                )));
            }
            columns[col] = values.as_slice();
        }

        let mut observations = Vec::with_capacity(payload.time.len());
        for (row, raw_ts) in payload.time.iter().enumerate() {
            let timestamp = parse_timestamp(raw_ts)
                .map_err(|e| ForecastError::DataValidation(format!("row {row}: {e}")))?;
            let values = build_values(&sources, |col| {
                columns[col]
                    .get(row)
                    .and_then(serde_json::Value::as_f64)
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| {
                        ForecastError::DataValidation(format!(
                            "row {row}, column '{}': missing or non-numeric value",
                            names[col]
                        ))
                    })
            })?;
            observations.push(Observation::new(timestamp, values));
        }

        ObservationSeries::new(observations)
    }
}

fn is_canonical(name: &str) -> bool {
    Feature::from_column(name).is_some_and(|feature| feature.name() == name)
}

fn timestamp_column(headers: &[&str]) -> Result<usize> {
    headers
        .iter()
        .position(|h| TIMESTAMP_COLUMNS.contains(&h.trim().to_ascii_lowercase().as_str()))
        .ok_or_else(|| ForecastError::DataValidation("missing timestamp column".to_string()))
}

fn resolve_columns(headers: &[&str]) -> Result<[ColumnSource; FEATURE_COUNT]> {
    let mut found: [Option<usize>; FEATURE_COUNT] = [None; FEATURE_COUNT];
    for (col, header) in headers.iter().enumerate() {
        if let Some(feature) = Feature::from_column(header) {
            // first matching column wins
            found[feature.index()].get_or_insert(col);
        }
    }

    let mut sources = [ColumnSource::DerivedVpd; FEATURE_COUNT];
    for feature in Feature::ALL {
        sources[feature.index()] = match found[feature.index()] {
            Some(col) => ColumnSource::Column(col),
            None if feature == Feature::VapourPressureDeficit
                && found[Feature::Temperature.index()].is_some()
                && found[Feature::RelativeHumidity.index()].is_some() =>
            {
                ColumnSource::DerivedVpd
            }
            None => {
                return Err(ForecastError::DataValidation(format!(
                    "missing feature column '{feature}'"
                )))
            }
        };
    }
    Ok(sources)
}

fn build_values<F>(sources: &[ColumnSource; FEATURE_COUNT], mut cell: F) -> Result<[f64; FEATURE_COUNT]>
where
    F: FnMut(usize) -> Result<f64>,
{
    let mut values = [0.0; FEATURE_COUNT];
    for (i, source) in sources.iter().enumerate() {
        if let ColumnSource::Column(col) = source {
            values[i] = cell(*col)?;
        }
    }
    if let ColumnSource::DerivedVpd = sources[Feature::VapourPressureDeficit.index()] {
        values[Feature::VapourPressureDeficit.index()] = vapour_pressure_deficit(
            values[Feature::Temperature.index()],
            values[Feature::RelativeHumidity.index()],
        );
    }
    Ok(values)
}

fn parse_cell(cell: &str) -> std::result::Result<f64, String> {
    if cell.is_empty() {
        return Err("missing value".to_string());
    }
    let value: f64 = cell
        .parse()
        .map_err(|_| format!("non-numeric value '{cell}'"))?;
    if !value.is_finite() {
        return Err(format!("non-finite value '{cell}'"));
    }
    Ok(value)
}

fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NAIVE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| format!("unparseable timestamp '{raw}'"))
}
