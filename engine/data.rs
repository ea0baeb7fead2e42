//! Loading of the dependent variable and permutation matrix.
//!
//! Both inputs are small text tables: the dependent variable is one number
//! per line (a single-column file), the permutation matrix has one row per
//! observation and one column per permutation. Failures are user-input
//! errors and carry the line they occurred on.

use crate::permute::{PermutationKind, PermutationMatrix, PermuteError};
use csv::ReaderBuilder;
use ndarray::{Array1, Array2};
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("line {line}: '{value}' is not a number")]
    NotANumber { line: usize, value: String },
    #[error("line {line} has {found} columns but line 1 has {expected}")]
    RaggedRow { line: usize, found: usize, expected: usize },
    #[error("'{0}' contains no data rows")]
    Empty(String),
    #[error(transparent)]
    Permute(#[from] PermuteError),
}

fn reader_for(path: &Path) -> Result<csv::Reader<std::fs::File>, DataError> {
    Ok(ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)?)
}

fn parse_field(field: &str, line: usize) -> Result<f64, DataError> {
    field
        .parse::<f64>()
        .map_err(|_| DataError::NotANumber { line, value: field.to_string() })
}

/// Rows may be comma- or whitespace-separated (or both), so each CSV field
/// is split again on whitespace before parsing.
fn fields_of(record: &csv::StringRecord) -> Vec<&str> {
    record.iter().flat_map(str::split_whitespace).collect()
}

/// Loads the dependent variable: the first column of the file, one entry
/// per observation.
pub fn load_variable(path: &Path) -> Result<Array1<f64>, DataError> {
    let mut reader = reader_for(path)?;
    let mut values = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let Some(&field) = fields_of(&record).first() else {
            continue;
        };
        values.push(parse_field(field, i + 1)?);
    }
    if values.is_empty() {
        return Err(DataError::Empty(path.display().to_string()));
    }
    Ok(Array1::from_vec(values))
}

/// Loads a permutation matrix: one row per observation, one column per
/// permutation. Entries are validated against `kind` and the observation
/// count before use.
pub fn load_permutation_matrix(
    path: &Path,
    kind: PermutationKind,
    n_observations: usize,
) -> Result<PermutationMatrix, DataError> {
    let mut reader = reader_for(path)?;
    let mut rows: Vec<Vec<f64>> = Vec::new();
    let mut width = 0usize;
    for (i, record) in reader.records().enumerate() {
        let record = record?;
        let fields = fields_of(&record);
        if fields.is_empty() {
            continue;
        }
        if rows.is_empty() {
            width = fields.len();
        } else if fields.len() != width {
            return Err(DataError::RaggedRow {
                line: i + 1,
                found: fields.len(),
                expected: width,
            });
        }
        let row: Vec<f64> = fields
            .iter()
            .map(|f| parse_field(f, i + 1))
            .collect::<Result<_, _>>()?;
        rows.push(row);
    }
    if rows.is_empty() {
        return Err(DataError::Empty(path.display().to_string()));
    }
    let mut matrix = Array2::zeros((rows.len(), width));
    for (r, row) in rows.iter().enumerate() {
        for (c, &v) in row.iter().enumerate() {
            matrix[[r, c]] = v;
        }
    }
    Ok(PermutationMatrix::new(kind, matrix, n_observations)?)
}
