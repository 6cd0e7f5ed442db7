use super::{MatrixHandler, MatrixKind};
use crate::error::MatrixError;

/// One row of a [`NaiveMatrix`].
#[derive(Debug, Clone, Default)]
pub(crate) struct NaiveRow {
    /// Coefficients indexed by absolute column (`a[row]`).
    pub(crate) values: Vec<f64>,
    /// Nonzero columns in registration order (`ci[row]`).
    pub(crate) cols: Vec<usize>,
    /// Membership flags (`nz[row]`).
    pub(crate) nz: Vec<bool>,
}

impl NaiveRow {
    fn new(n: usize) -> Self {
        Self {
            values: vec![0.0; n],
            cols: Vec::new(),
            nz: vec![false; n],
        }
    }

    /// Accumulate at `col`, registering it on first use. Returns true when
    /// the column is new for this row.
    #[inline]
    pub(crate) fn accumulate(&mut self, col: usize, value: f64) -> bool {
        if self.nz[col] {
            self.values[col] += value;
            false
        } else {
            self.values[col] = value;
            self.nz[col] = true;
            self.cols.push(col);
            true
        }
    }

    fn clear(&mut self) {
        for &c in &self.cols {
            self.values[c] = 0.0;
            self.nz[c] = false;
        }
        self.cols.clear();
    }
}

/// Sparse accumulator with dense row storage and mirrored row/column
/// index lists.
///
/// Every registered entry `(r, c)` appears once in the column list of row
/// `r` and once in the row list of column `c`. The pattern is rebuilt on
/// every pass: [`reset`](MatrixHandler::reset) forgets it together with the
/// values, and the factorization writes its fill-in into the same lists.
#[derive(Debug, Clone, Default)]
pub struct NaiveMatrix {
    n: usize,
    pub(crate) rows: Vec<NaiveRow>,
    /// Row lists per column (`ri[col]`).
    pub(crate) cols: Vec<Vec<usize>>,
}

impl NaiveMatrix {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            rows: (0..n).map(|_| NaiveRow::new(n)).collect(),
            cols: vec![Vec::new(); n],
        }
    }

    /// Build from `(row, col, value)` triplets; duplicates accumulate.
    pub fn from_triplets(n: usize, triplets: &[(usize, usize, f64)]) -> Result<Self, MatrixError> {
        let mut matrix = Self::new(n);
        for &(row, col, value) in triplets {
            matrix.add_entry(row, col, value)?;
        }
        Ok(matrix)
    }

    /// Number of registered entries.
    pub fn nnz(&self) -> usize {
        self.rows.iter().map(|r| r.cols.len()).sum()
    }

    /// Registered columns of `row`, in registration order.
    pub fn row_pattern(&self, row: usize) -> &[usize] {
        &self.rows[row].cols
    }

    /// Registered rows of `col`, in registration order.
    pub fn col_pattern(&self, col: usize) -> &[usize] {
        &self.cols[col]
    }

    pub fn is_registered(&self, row: usize, col: usize) -> bool {
        self.rows[row].nz[col]
    }

    /// Register `(row, col)` even when the value is zero.
    pub fn register(&mut self, row: usize, col: usize) -> Result<(), MatrixError> {
        self.check(row, col)?;
        if self.rows[row].accumulate(col, 0.0) {
            self.cols[col].push(row);
        }
        Ok(())
    }

    /// Add `other` into `self`, registering new entries (single thread).
    pub fn add_matrix(&mut self, other: &NaiveMatrix) -> Result<(), MatrixError> {
        if other.n != self.n {
            return Err(MatrixError::SizeMismatch {
                expected: self.n,
                got: other.n,
            });
        }
        for (r, row) in other.rows.iter().enumerate() {
            for &c in &row.cols {
                if self.rows[r].accumulate(c, row.values[c]) {
                    self.cols[c].push(r);
                }
            }
        }
        Ok(())
    }

    /// `y = A x` over the registered entries.
    pub fn mult_vec(&self, x: &[f64]) -> Vec<f64> {
        self.rows
            .iter()
            .map(|row| row.cols.iter().map(|&c| row.values[c] * x[c]).sum())
            .collect()
    }

    /// Check that the row and column lists mirror each other.
    pub fn pattern_consistent(&self) -> bool {
        let forward: usize = self.rows.iter().map(|r| r.cols.len()).sum();
        let backward: usize = self.cols.iter().map(|c| c.len()).sum();
        forward == backward
            && self.cols.iter().enumerate().all(|(c, rows)| {
                rows.iter().all(|&r| self.rows[r].nz[c])
            })
            && self.rows.iter().all(|row| row.cols.iter().all(|&c| row.nz[c]))
    }

    fn check(&self, row: usize, col: usize) -> Result<(), MatrixError> {
        if row >= self.n || col >= self.n {
            return Err(MatrixError::OutOfBounds {
                row,
                col,
                size: self.n,
            });
        }
        Ok(())
    }
}

impl MatrixHandler for NaiveMatrix {
    fn size(&self) -> usize {
        self.n
    }

    fn reset(&mut self) {
        for row in &mut self.rows {
            row.clear();
        }
        for col in &mut self.cols {
            col.clear();
        }
    }

    fn add_entry(&mut self, row: usize, col: usize, value: f64) -> Result<(), MatrixError> {
        self.check(row, col)?;
        if value == 0.0 {
            return Ok(());
        }
        if self.rows[row].accumulate(col, value) {
            self.cols[col].push(row);
        }
        Ok(())
    }

    fn get(&self, row: usize, col: usize) -> f64 {
        match self.rows.get(row) {
            Some(r) if col < self.n && r.nz[col] => r.values[col],
            _ => 0.0,
        }
    }

    fn kind(&mut self) -> MatrixKind<'_> {
        MatrixKind::Naive(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate_and_mirror() {
        let mut m = NaiveMatrix::new(3);
        m.add_entry(0, 2, 1.0).unwrap();
        m.add_entry(0, 2, 2.0).unwrap();
        m.add_entry(1, 0, 4.0).unwrap();
        m.add_entry(2, 2, 0.0).unwrap();
        assert_eq!(m.get(0, 2), 3.0);
        assert_eq!(m.nnz(), 2);
        assert_eq!(m.col_pattern(2), &[0]);
        assert!(m.pattern_consistent());
    }

    #[test]
    fn test_reset_forgets_pattern() {
        let mut m = NaiveMatrix::new(2);
        m.add_entry(1, 1, 5.0).unwrap();
        m.reset();
        assert_eq!(m.nnz(), 0);
        assert_eq!(m.get(1, 1), 0.0);
        assert!(m.col_pattern(1).is_empty());
    }

    #[test]
    fn test_out_of_bounds() {
        let mut m = NaiveMatrix::new(2);
        assert_eq!(
            m.add_entry(2, 0, 1.0),
            Err(MatrixError::OutOfBounds {
                row: 2,
                col: 0,
                size: 2
            })
        );
    }
}
