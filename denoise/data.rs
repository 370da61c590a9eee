//! # Tabular Input Loading
//!
//! Reads the headerless, tab-separated tables the command-line driver consumes:
//!
//! - numeric matrices (rule matches, rule-to-label mapping, features), one row per line;
//! - label vectors, one class id per line;
//! - label mappings, `name<TAB>id` per line.
//!
//! Failures are treated as user-input errors and report the file, row and column
//! (1-based) of the offending cell.

use crate::evaluate::LabelMapping;
use ndarray::Array2;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed tab-separated input: {0}")]
    Csv(#[from] csv::Error),

    #[error("Could not parse '{value}' in {path} at row {row}, column {column}.")]
    Parse {
        path: String,
        row: usize,
        column: usize,
        value: String,
    },

    #[error("Row {row} of {path} has {found} columns, but the first row has {expected}.")]
    Ragged {
        path: String,
        row: usize,
        expected: usize,
        found: usize,
    },

    #[error("The input file '{0}' contains no rows.")]
    Empty(String),
}

fn read_records(path: &Path) -> Result<Vec<csv::StringRecord>, DataError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?;
    let records = reader
        .records()
        .filter(|record| !matches!(record, Ok(r) if r.iter().all(str::is_empty)))
        .collect::<Result<Vec<_>, _>>()?;
    if records.is_empty() {
        return Err(DataError::Empty(path.display().to_string()));
    }
    Ok(records)
}

fn parse_cell<T: std::str::FromStr>(
    path: &Path,
    row: usize,
    column: usize,
    value: &str,
) -> Result<T, DataError> {
    value.parse().map_err(|_| DataError::Parse {
        path: path.display().to_string(),
        row: row + 1,
        column: column + 1,
        value: value.to_string(),
    })
}

/// Loads a dense matrix of finite numbers.
pub fn load_matrix(path: &Path) -> Result<Array2<f64>, DataError> {
    let records = read_records(path)?;
    let n_cols = records[0].len();
    let mut values = Vec::with_capacity(records.len() * n_cols);
    for (row, record) in records.iter().enumerate() {
        if record.len() != n_cols {
            return Err(DataError::Ragged {
                path: path.display().to_string(),
                row: row + 1,
                expected: n_cols,
                found: record.len(),
            });
        }
        for (column, cell) in record.iter().enumerate() {
            let value: f64 = parse_cell(path, row, column, cell)?;
            if !value.is_finite() {
                return Err(DataError::Parse {
                    path: path.display().to_string(),
                    row: row + 1,
                    column: column + 1,
                    value: cell.to_string(),
                });
            }
            values.push(value);
        }
    }
    log::debug!(
        "Loaded a {}x{} table from {}.",
        records.len(),
        n_cols,
        path.display()
    );
    Array2::from_shape_vec((records.len(), n_cols), values).map_err(|e| {
        DataError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    })
}

/// Loads one class id per line.
pub fn load_labels(path: &Path) -> Result<Vec<usize>, DataError> {
    read_records(path)?
        .iter()
        .enumerate()
        .map(|(row, record)| {
            if record.len() != 1 {
                return Err(DataError::Ragged {
                    path: path.display().to_string(),
                    row: row + 1,
                    expected: 1,
                    found: record.len(),
                });
            }
            parse_cell(path, row, 0, &record[0])
        })
        .collect()
}

/// Loads `name<TAB>id` pairs.
pub fn load_label_mapping(path: &Path) -> Result<LabelMapping, DataError> {
    let mut mapping = LabelMapping::new();
    for (row, record) in read_records(path)?.iter().enumerate() {
        if record.len() != 2 {
            return Err(DataError::Ragged {
                path: path.display().to_string(),
                row: row + 1,
                expected: 2,
                found: record.len(),
            });
        }
        let id: usize = parse_cell(path, row, 1, &record[1])?;
        mapping.insert(&record[0], id);
    }
    Ok(mapping)
}
