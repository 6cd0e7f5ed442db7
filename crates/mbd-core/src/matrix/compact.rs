use std::collections::{BTreeMap, HashMap};

use super::{MatrixHandler, MatrixKind};
use crate::error::MatrixError;

/// Sparse matrix with a growing pattern, frozen into a [`CompactMatrix`]
/// once the first assembly has shown which entries exist.
///
/// # Operating Modes
///
/// | Operation | PatternMatrix | CompactMatrix |
/// |-----------|---------------|---------------|
/// | add_entry | O(log nnz_col), any position | O(1), pattern only |
/// | reset     | O(nnz) | O(nnz) |
/// | freeze    | O(nnz) | n/a |
///
/// ```ignore
/// let mut pattern = PatternMatrix::new(3);
/// pattern.add_entry(0, 0, 1.0)?;
/// pattern.add_entry(1, 0, 2.0)?;
/// let mut compact = pattern.freeze();
/// compact.reset();
/// compact.add_entry(1, 0, 2.5)?;          // in pattern
/// assert!(compact.add_entry(2, 2, 1.0).is_err()); // rebuild needed
/// ```
#[derive(Debug, Clone)]
pub struct PatternMatrix {
    n: usize,
    /// Column-wise entries: col_entries[col][row] = value
    col_entries: Vec<BTreeMap<usize, f64>>,
    stats: PatternStats,
}

/// Counters for monitoring pattern discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatternStats {
    /// Number of add_entry() calls
    pub inserts: usize,
    /// Number of times the pattern was frozen
    pub freezes: usize,
    /// Non-zeros of the last frozen pattern
    pub nnz: usize,
}

impl PatternMatrix {
    pub fn new(n: usize) -> Self {
        Self {
            n,
            col_entries: vec![BTreeMap::new(); n],
            stats: PatternStats::default(),
        }
    }

    pub fn nnz(&self) -> usize {
        self.col_entries.iter().map(|c| c.len()).sum()
    }

    pub fn stats(&self) -> &PatternStats {
        &self.stats
    }

    /// Lock the current pattern into CSC form, keeping the values.
    pub fn freeze(&mut self) -> CompactMatrix {
        let mut ap = Vec::with_capacity(self.n + 1);
        let mut ai = Vec::with_capacity(self.nnz());
        let mut ax = Vec::with_capacity(self.nnz());
        let mut index_map = vec![HashMap::new(); self.n];

        ap.push(0);
        for (col, entries) in self.col_entries.iter().enumerate() {
            for (&row, &value) in entries {
                index_map[col].insert(row, ai.len());
                ai.push(row as i64);
                ax.push(value);
            }
            ap.push(ai.len() as i64);
        }

        self.stats.freezes += 1;
        self.stats.nnz = ax.len();

        CompactMatrix {
            n: self.n,
            ap,
            ai,
            ax,
            index_map,
        }
    }
}

impl MatrixHandler for PatternMatrix {
    fn size(&self) -> usize {
        self.n
    }

    /// Zero values; registered positions stay in the pattern.
    fn reset(&mut self) {
        for col in &mut self.col_entries {
            for value in col.values_mut() {
                *value = 0.0;
            }
        }
    }

    fn add_entry(&mut self, row: usize, col: usize, value: f64) -> Result<(), MatrixError> {
        if row >= self.n || col >= self.n {
            return Err(MatrixError::OutOfBounds {
                row,
                col,
                size: self.n,
            });
        }
        self.stats.inserts += 1;
        *self.col_entries[col].entry(row).or_insert(0.0) += value;
        Ok(())
    }

    fn get(&self, row: usize, col: usize) -> f64 {
        self.col_entries
            .get(col)
            .and_then(|c| c.get(&row))
            .copied()
            .unwrap_or(0.0)
    }

    fn kind(&mut self) -> MatrixKind<'_> {
        MatrixKind::Pattern(self)
    }
}

/// Compressed sparse column matrix with a frozen pattern.
///
/// Adding a nonzero value outside the pattern fails with
/// [`MatrixError::RebuildMatrix`]; the owner is expected to go back to a
/// [`PatternMatrix`] and assemble again.
#[derive(Debug, Clone)]
pub struct CompactMatrix {
    n: usize,
    ap: Vec<i64>,
    ai: Vec<i64>,
    ax: Vec<f64>,
    /// index_map[col][row] = position in `ax`
    index_map: Vec<HashMap<usize, usize>>,
}

impl CompactMatrix {
    pub fn nnz(&self) -> usize {
        self.ax.len()
    }

    /// Same pattern, zero values. Used for per-thread assembly copies.
    pub fn copy_pattern(&self) -> Self {
        Self {
            n: self.n,
            ap: self.ap.clone(),
            ai: self.ai.clone(),
            ax: vec![0.0; self.ax.len()],
            index_map: self.index_map.clone(),
        }
    }

    /// Element-wise sum of a copy sharing this pattern.
    pub fn add_values_from(&mut self, other: &CompactMatrix) -> Result<(), MatrixError> {
        if other.ax.len() != self.ax.len() || other.n != self.n {
            return Err(MatrixError::SizeMismatch {
                expected: self.ax.len(),
                got: other.ax.len(),
            });
        }
        for (dst, src) in self.ax.iter_mut().zip(&other.ax) {
            *dst += *src;
        }
        Ok(())
    }

    /// CSC arrays `(ap, ai, ax)` for the linear solver backends.
    pub fn csc(&self) -> (&[i64], &[i64], &[f64]) {
        (&self.ap, &self.ai, &self.ax)
    }

    /// Back to a growing pattern holding the current values.
    pub fn thaw(&self) -> PatternMatrix {
        let mut pattern = PatternMatrix::new(self.n);
        for col in 0..self.n {
            let start = self.ap[col] as usize;
            let end = self.ap[col + 1] as usize;
            for idx in start..end {
                pattern.col_entries[col].insert(self.ai[idx] as usize, self.ax[idx]);
            }
        }
        pattern
    }
}

impl MatrixHandler for CompactMatrix {
    fn size(&self) -> usize {
        self.n
    }

    fn reset(&mut self) {
        self.ax.fill(0.0);
    }

    fn add_entry(&mut self, row: usize, col: usize, value: f64) -> Result<(), MatrixError> {
        if row >= self.n || col >= self.n {
            return Err(MatrixError::OutOfBounds {
                row,
                col,
                size: self.n,
            });
        }
        match self.index_map[col].get(&row) {
            Some(&idx) => {
                self.ax[idx] += value;
                Ok(())
            }
            None if value == 0.0 => Ok(()),
            None => Err(MatrixError::RebuildMatrix { row, col }),
        }
    }

    fn get(&self, row: usize, col: usize) -> f64 {
        self.index_map
            .get(col)
            .and_then(|m| m.get(&row))
            .map_or(0.0, |&idx| self.ax[idx])
    }

    fn kind(&mut self) -> MatrixKind<'_> {
        MatrixKind::Compact(self)
    }
}
