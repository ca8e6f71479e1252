//! Dense column-major matrix
//!
//! Columns are stored as contiguous runs of `rows` values, so a range of
//! columns is a single contiguous slice. Partitions are cut along columns for
//! exactly that reason.

use crate::errors::{PoolError, Result};
use crate::executor::CombineOp;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::path::Path;

/// Dense 2-D `f64` matrix in column-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix {
    pub rows: usize,
    pub cols: usize,
    /// Column-major values, `data[c * rows + r]`
    pub data: Vec<f64>,
}

impl Matrix {
    /// Create a matrix from column-major data
    ///
    /// # Errors
    /// Returns a precondition error if the data length doesn't match `rows * cols`.
    pub fn new(rows: usize, cols: usize, data: Vec<f64>) -> Result<Self> {
        let matrix = Self { rows, cols, data };
        matrix.validate()?;
        Ok(matrix)
    }

    /// Check that `data` holds exactly `rows * cols` values
    ///
    /// The fields are public, so a matrix built by hand may be inconsistent.
    pub fn validate(&self) -> Result<()> {
        let expected = self.rows.checked_mul(self.cols).ok_or_else(|| {
            PoolError::Precondition(format!("Matrix shape {}x{} overflows", self.rows, self.cols))
        })?;
        if self.data.len() != expected {
            return Err(PoolError::Precondition(format!(
                "Data length {} doesn't match shape {}x{}",
                self.data.len(),
                self.rows,
                self.cols
            )));
        }
        Ok(())
    }

    /// Create a matrix filled with zeros
    pub fn zeros(rows: usize, cols: usize) -> Self {
        Self::filled(rows, cols, 0.0)
    }

    /// Create a matrix filled with a constant value
    pub fn filled(rows: usize, cols: usize, value: f64) -> Self {
        Self {
            rows,
            cols,
            data: vec![value; rows * cols],
        }
    }

    /// Build a matrix by evaluating `f(row, col)` at every position
    pub fn from_fn(rows: usize, cols: usize, f: impl Fn(usize, usize) -> f64) -> Self {
        let mut data = Vec::with_capacity(rows * cols);
        for c in 0..cols {
            for r in 0..rows {
                data.push(f(r, c));
            }
        }
        Self { rows, cols, data }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.rows, self.cols)
    }

    /// Get the total number of elements
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Check if the matrix has no elements
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, row: usize, col: usize) -> Option<f64> {
        if row >= self.rows || col >= self.cols {
            return None;
        }
        self.data.get(col * self.rows + row).copied()
    }

    /// Element range covered by `count` columns starting at `offset`
    fn column_span(&self, offset: usize, count: usize) -> Range<usize> {
        offset * self.rows..(offset + count) * self.rows
    }

    /// Contiguous slice of `count` columns starting at column `offset`
    ///
    /// # Panics
    /// Panics if the range runs past the last column.
    pub fn columns(&self, offset: usize, count: usize) -> &[f64] {
        &self.data[self.column_span(offset, count)]
    }

    /// Overwrite columns starting at `offset` with a column-major chunk
    ///
    /// # Errors
    /// Returns an error if the chunk is not a whole number of columns or does
    /// not fit.
    pub fn write_columns(&mut self, offset: usize, chunk: &[f64]) -> Result<()> {
        if self.rows == 0 {
            return if chunk.is_empty() {
                Ok(())
            } else {
                Err(PoolError::Protocol(format!(
                    "Got {} values for a matrix with no rows",
                    chunk.len()
                )))
            };
        }
        if chunk.len() % self.rows != 0 {
            return Err(PoolError::Protocol(format!(
                "Chunk of {} values is not a whole number of {}-row columns",
                chunk.len(),
                self.rows
            )));
        }
        let count = chunk.len() / self.rows;
        if offset + count > self.cols {
            return Err(PoolError::Protocol(format!(
                "Columns {}..{} out of bounds for {} columns",
                offset,
                offset + count,
                self.cols
            )));
        }
        let span = self.column_span(offset, count);
        self.data[span].copy_from_slice(chunk);
        Ok(())
    }

    /// Fail unless `other` has the same shape
    pub fn ensure_same_shape(&self, other: &Matrix) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(PoolError::DimensionMismatch {
                a_rows: self.rows,
                a_cols: self.cols,
                b_rows: other.rows,
                b_cols: other.cols,
            });
        }
        Ok(())
    }

    /// Elementwise combination computed locally, without any workers
    pub fn combine(&self, other: &Matrix, op: CombineOp) -> Result<Matrix> {
        self.ensure_same_shape(other)?;
        Ok(Matrix {
            rows: self.rows,
            cols: self.cols,
            data: op.apply(&self.data, &other.data),
        })
    }

    /// Load a matrix stored as JSON `{rows, cols, data}`
    pub fn load_json(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let raw: Matrix = serde_json::from_str(&content)
            .map_err(|e| PoolError::Serialization(format!("{}: {}", path.display(), e)))?;
        // Re-validate, the file may lie about its shape
        Matrix::new(raw.rows, raw.cols, raw.data)
    }

    /// Store the matrix as JSON `{rows, cols, data}`
    pub fn save_json(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| PoolError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_matrix_new() {
        let m = Matrix::new(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        assert_eq!(m.shape(), (2, 3));
        // Column-major: column 1 is [3, 4]
        assert_eq!(m.get(0, 1), Some(3.0));
        assert_eq!(m.get(1, 1), Some(4.0));
        assert_eq!(m.get(2, 0), None);
    }

    #[test]
    fn test_matrix_new_shape_mismatch() {
        let result = Matrix::new(2, 2, vec![1.0, 2.0, 3.0]);
        assert!(matches!(result, Err(PoolError::Precondition(_))));
    }

    #[test]
    fn test_validate_hand_built_matrix() {
        let bad = Matrix {
            rows: 2,
            cols: 4,
            data: vec![1.0; 3],
        };
        assert!(matches!(bad.validate(), Err(PoolError::Precondition(_))));
        assert!(Matrix::zeros(2, 4).validate().is_ok());
    }

    #[test]
    fn test_from_fn_is_column_major() {
        let m = Matrix::from_fn(2, 2, |r, c| (r * 10 + c) as f64);
        assert_eq!(m.data, vec![0.0, 10.0, 1.0, 11.0]);
    }

    #[test]
    fn test_columns_slice() {
        let m = Matrix::from_fn(3, 4, |r, c| (c * 3 + r) as f64);
        assert_eq!(m.columns(1, 2), &[3.0, 4.0, 5.0, 6.0, 7.0, 8.0]);
        assert!(m.columns(4, 0).is_empty());
    }

    #[test]
    fn test_write_columns() {
        let mut m = Matrix::zeros(2, 3);
        m.write_columns(1, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(m.data, vec![0.0, 0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_write_columns_rejects_partial_column() {
        let mut m = Matrix::zeros(2, 3);
        assert!(m.write_columns(0, &[1.0, 2.0, 3.0]).is_err());
        assert!(m.write_columns(2, &[1.0, 2.0, 3.0, 4.0]).is_err());
    }

    #[test]
    fn test_ensure_same_shape() {
        let a = Matrix::zeros(2, 4);
        let b = Matrix::zeros(4, 2);
        let err = a.ensure_same_shape(&b).unwrap_err();
        assert!(matches!(err, PoolError::DimensionMismatch { .. }));
        assert!(a.ensure_same_shape(&Matrix::zeros(2, 4)).is_ok());
    }

    #[test]
    fn test_combine_add() {
        let a = Matrix::filled(2, 2, 1.5);
        let b = Matrix::filled(2, 2, 2.0);
        let c = a.combine(&b, CombineOp::Add).unwrap();
        assert_eq!(c, Matrix::filled(2, 2, 3.5));
    }

    #[test]
    fn test_json_roundtrip_revalidates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.json");
        let m = Matrix::from_fn(3, 2, |r, c| (r + c) as f64);
        m.save_json(&path).unwrap();
        assert_eq!(Matrix::load_json(&path).unwrap(), m);

        std::fs::write(&path, r#"{"rows": 2, "cols": 2, "data": [1.0]}"#).unwrap();
        assert!(Matrix::load_json(&path).is_err());
    }
}
