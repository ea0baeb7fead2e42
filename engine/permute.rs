//! Permutation of the dependent variable for randomization inference.
//!
//! A permutation matrix holds one permutation per column. Order columns hold
//! zero-based indices into the original variable; sign columns hold +1/-1
//! multipliers. A scan either runs unpermuted, applies one column, or (in
//! sweep mode, driven by the caller) applies every column in turn to build a
//! null distribution of extreme statistics.

use ndarray::{Array1, Array2, ArrayView1};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PermuteError {
    #[error("permutation column {index} out of range; matrix has {ncols} columns")]
    ColumnOutOfRange { index: usize, ncols: usize },
    #[error("permutation matrix has {rows} rows but the dependent variable has {expected}")]
    RowCountMismatch { rows: usize, expected: usize },
    #[error("order permutation entry {value} at row {row} is not a valid observation index")]
    BadOrderIndex { value: f64, row: usize },
    #[error("sign permutation entry {value} at row {row} is not +1 or -1")]
    BadSign { value: f64, row: usize },
}

/// How one permutation column is interpreted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PermutationKind {
    /// Columns reindex the variable: `new[i] = old[col[i]]`.
    Order,
    /// Columns flip signs: `new[i] = col[i] * old[i]`.
    Sign,
}

/// A permutation matrix with a fixed interpretation for all its columns.
#[derive(Clone, Debug)]
pub struct PermutationMatrix {
    kind: PermutationKind,
    columns: Array2<f64>,
}

impl PermutationMatrix {
    /// Wraps a raw matrix, validating every entry against `kind` and the
    /// expected observation count.
    pub fn new(
        kind: PermutationKind,
        columns: Array2<f64>,
        n_observations: usize,
    ) -> Result<Self, PermuteError> {
        if columns.nrows() != n_observations {
            return Err(PermuteError::RowCountMismatch {
                rows: columns.nrows(),
                expected: n_observations,
            });
        }
        for col in columns.columns() {
            for (row, &v) in col.iter().enumerate() {
                match kind {
                    PermutationKind::Order => {
                        if v.fract() != 0.0 || v < 0.0 || v >= n_observations as f64 {
                            return Err(PermuteError::BadOrderIndex { value: v, row });
                        }
                    }
                    PermutationKind::Sign => {
                        if v != 1.0 && v != -1.0 {
                            return Err(PermuteError::BadSign { value: v, row });
                        }
                    }
                }
            }
        }
        Ok(Self { kind, columns })
    }

    pub fn kind(&self) -> PermutationKind {
        self.kind
    }

    pub fn n_columns(&self) -> usize {
        self.columns.ncols()
    }

    /// Applies column `index` to the dependent variable, producing the
    /// permuted variable for one scan.
    pub fn apply(
        &self,
        index: usize,
        variable: ArrayView1<'_, f64>,
    ) -> Result<Array1<f64>, PermuteError> {
        if index >= self.columns.ncols() {
            return Err(PermuteError::ColumnOutOfRange {
                index,
                ncols: self.columns.ncols(),
            });
        }
        let col = self.columns.column(index);
        let permuted = match self.kind {
            PermutationKind::Order => {
                Array1::from_iter(col.iter().map(|&j| variable[j as usize]))
            }
            PermutationKind::Sign => {
                Array1::from_iter(col.iter().zip(variable.iter()).map(|(&s, &v)| s * v))
            }
        };
        Ok(permuted)
    }
}
