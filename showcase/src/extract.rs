//! Temperature extraction from the known record shapes.
//!
//! The source CSVs come in four disjoint layouts, recognized by a marker
//! column. The strategies are probed in a fixed priority order; the first
//! whose marker is present wins. New source shapes are added by appending a
//! strategy, not by widening an existing one.

use data_types::Record;
use thiserror::Error;

/// One temperature observation derived from a record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub temperature: f64,
    /// How many underlying measurements this sample aggregates.
    pub weight: u64,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("column '{column}' holds a non-numeric value '{value}'")]
    NotNumeric { column: String, value: String },
}

#[derive(Debug, Clone, Copy)]
enum Strategy {
    /// `temp_max`/`temp_min` pair: midpoint of the two.
    MinMaxMidpoint,
    /// Wunderground's ` _tempm` column (the leading space is literal).
    TempM,
    /// `Data.Temperature.Avg Temp` column.
    AvgTemp,
    /// European dataset: mean over every non-empty `*_temp_mean` column,
    /// weighted by how many columns contributed.
    TempMeanColumns,
}

/// Probe order. Must stay stable: records carrying several markers must
/// resolve the same way on every node.
const STRATEGIES: [Strategy; 4] = [
    Strategy::MinMaxMidpoint,
    Strategy::TempM,
    Strategy::AvgTemp,
    Strategy::TempMeanColumns,
];

impl Strategy {
    fn applies(&self, record: &Record) -> bool {
        match self {
            Self::MinMaxMidpoint => record.contains("temp_max"),
            Self::TempM => record.contains(" _tempm"),
            Self::AvgTemp => record.contains("Data.Temperature.Avg Temp"),
            Self::TempMeanColumns => record
                .fields()
                .any(|(column, _)| column.ends_with("_temp_mean")),
        }
    }

    fn extract(&self, record: &Record) -> Result<Option<Sample>, ExtractError> {
        match self {
            Self::MinMaxMidpoint => {
                let min = required_numeric(record, "temp_min")?;
                let max = required_numeric(record, "temp_max")?;
                Ok(Some(Sample {
                    temperature: (min + max) / 2.0,
                    weight: 1,
                }))
            }
            Self::TempM => Ok(Some(Sample {
                temperature: required_numeric(record, " _tempm")?,
                weight: 1,
            })),
            Self::AvgTemp => Ok(Some(Sample {
                temperature: required_numeric(record, "Data.Temperature.Avg Temp")?,
                weight: 1,
            })),
            Self::TempMeanColumns => {
                let mut sum = 0.0;
                let mut used = 0u64;
                for (column, value) in record.fields() {
                    if !column.ends_with("_temp_mean") || is_empty(value) {
                        continue;
                    }
                    match record.numeric(column) {
                        Some(v) => {
                            sum += v;
                            used += 1;
                        }
                        None => {
                            return Err(ExtractError::NotNumeric {
                                column: column.to_string(),
                                value: value.to_string(),
                            })
                        }
                    }
                }
                // a row where every station column is blank carries no signal
                Ok((used > 0).then(|| Sample {
                    temperature: sum / used as f64,
                    weight: used,
                }))
            }
        }
    }
}

/// Derive the temperature sample for a record.
///
/// `Ok(None)` means the record carries no usable temperature (no marker, all
/// mean columns empty, or a non-finite result) and is dropped silently; a
/// marker column holding garbage is an error.
pub fn extract_sample(record: &Record) -> Result<Option<Sample>, ExtractError> {
    let strategy = match STRATEGIES.iter().find(|s| s.applies(record)) {
        Some(strategy) => strategy,
        None => return Ok(None),
    };
    Ok(strategy
        .extract(record)?
        .filter(|sample| sample.temperature.is_finite()))
}

fn required_numeric(record: &Record, column: &str) -> Result<f64, ExtractError> {
    record
        .numeric(column)
        .ok_or_else(|| ExtractError::NotNumeric {
            column: column.to_string(),
            value: record
                .get(column)
                .map(|v| v.to_string())
                .unwrap_or_default(),
        })
}

fn is_empty(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}
