//! Matrix handlers and per-element scratch buffers.
//!
//! Elements never touch a global matrix directly. They fill a
//! [`WorkMatrix`] / [`WorkVector`] with global indices and coefficients, and
//! the assembly layer adds the scratch into whichever [`MatrixHandler`] the
//! solution manager exposes:
//!
//! | Handler | Pattern | Used by |
//! |---------|---------|---------|
//! | [`NaiveMatrix`] | grows on every pass | naive factorization |
//! | [`PatternMatrix`] | grows, then frozen | first compact pass |
//! | [`CompactMatrix`] | fixed CSC | `LinearSolver` backends |
//! | `SchurMatrix` | routed per domain | Schur complement manager |

mod compact;
mod naive;

pub use compact::{CompactMatrix, PatternMatrix, PatternStats};
pub use naive::NaiveMatrix;
pub(crate) use naive::NaiveRow;

use crate::error::MatrixError;

/// Concrete view of a handler, used to pick the assembly strategy.
pub enum MatrixKind<'a> {
    Naive(&'a mut NaiveMatrix),
    Pattern(&'a mut PatternMatrix),
    Compact(&'a mut CompactMatrix),
    /// Any other handler; assembled single-threaded through `add_entry`.
    Generic,
}

/// Global sparse matrix the Jacobian is assembled into.
pub trait MatrixHandler: Send {
    /// Number of rows (and columns).
    fn size(&self) -> usize;

    /// Zero all values before a new assembly pass.
    fn reset(&mut self);

    /// Accumulate `value` at `(row, col)`.
    fn add_entry(&mut self, row: usize, col: usize, value: f64) -> Result<(), MatrixError>;

    fn get(&self, row: usize, col: usize) -> f64;

    fn kind(&mut self) -> MatrixKind<'_> {
        MatrixKind::Generic
    }

    /// Add an element scratch block, shifted and scaled.
    fn add_work(&mut self, work: &WorkMatrix, shift: &AssemblyShift) -> Result<(), MatrixError> {
        for (row, col, value) in work.entries() {
            self.add_entry(row + shift.row, col + shift.col, value * shift.scale)?;
        }
        Ok(())
    }
}

/// Offset and multiplier applied when a scratch block lands in a global
/// matrix or vector.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AssemblyShift {
    pub row: usize,
    pub col: usize,
    pub scale: f64,
}

impl Default for AssemblyShift {
    fn default() -> Self {
        Self {
            row: 0,
            col: 0,
            scale: 1.0,
        }
    }
}

impl AssemblyShift {
    pub fn block(row: usize, col: usize) -> Self {
        Self {
            row,
            col,
            scale: 1.0,
        }
    }

    pub fn scaled(self, scale: f64) -> Self {
        Self {
            scale: self.scale * scale,
            ..self
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WorkMode {
    Empty,
    Full { rows: usize, cols: usize },
    Sparse,
}

/// Element scratch matrix, either a dense block addressed by row/column
/// index lists or a list of `(row, col, value)` items.
#[derive(Debug, Clone)]
pub struct WorkMatrix {
    mode: WorkMode,
    row_index: Vec<usize>,
    col_index: Vec<usize>,
    block: Vec<f64>,
    items: Vec<(usize, usize, f64)>,
}

impl Default for WorkMatrix {
    fn default() -> Self {
        Self::with_capacity(0, 0)
    }
}

impl WorkMatrix {
    /// Scratch sized for blocks up to `rows x cols`.
    pub fn with_capacity(rows: usize, cols: usize) -> Self {
        Self {
            mode: WorkMode::Empty,
            row_index: Vec::with_capacity(rows),
            col_index: Vec::with_capacity(cols),
            block: Vec::with_capacity(rows * cols),
            items: Vec::with_capacity(rows * cols),
        }
    }

    /// Drop the previous contents; the scratch contributes nothing.
    pub fn clear(&mut self) {
        self.mode = WorkMode::Empty;
        self.row_index.clear();
        self.col_index.clear();
        self.block.clear();
        self.items.clear();
    }

    /// Switch to a zeroed dense `rows x cols` block.
    pub fn set_full(&mut self, rows: usize, cols: usize) {
        self.clear();
        self.mode = WorkMode::Full { rows, cols };
        self.row_index.resize(rows, 0);
        self.col_index.resize(cols, 0);
        self.block.resize(rows * cols, 0.0);
    }

    /// Switch to an empty list of sparse items.
    pub fn set_sparse(&mut self) {
        self.clear();
        self.mode = WorkMode::Sparse;
    }

    pub fn put_row_index(&mut self, i: usize, row: usize) {
        self.row_index[i] = row;
    }

    pub fn put_col_index(&mut self, j: usize, col: usize) {
        self.col_index[j] = col;
    }

    pub fn put_coef(&mut self, i: usize, j: usize, value: f64) {
        let cols = self.col_index.len();
        self.block[i * cols + j] = value;
    }

    pub fn inc_coef(&mut self, i: usize, j: usize, value: f64) {
        let cols = self.col_index.len();
        self.block[i * cols + j] += value;
    }

    pub fn coef(&self, i: usize, j: usize) -> f64 {
        self.block[i * self.col_index.len() + j]
    }

    /// Append a sparse item with global indices.
    pub fn put_item(&mut self, row: usize, col: usize, value: f64) {
        debug_assert_eq!(self.mode, WorkMode::Sparse);
        self.items.push((row, col, value));
    }

    /// Global `(row, col, value)` triplets of the current contents.
    pub fn entries(&self) -> Box<dyn Iterator<Item = (usize, usize, f64)> + '_> {
        match self.mode {
            WorkMode::Empty => Box::new(std::iter::empty()),
            WorkMode::Sparse => Box::new(self.items.iter().copied()),
            WorkMode::Full { rows, cols } => Box::new((0..rows).flat_map(move |i| {
                (0..cols).map(move |j| {
                    (self.row_index[i], self.col_index[j], self.block[i * cols + j])
                })
            })),
        }
    }
}

/// Element scratch vector: global row indices and values.
#[derive(Debug, Clone, Default)]
pub struct WorkVector {
    row_index: Vec<usize>,
    values: Vec<f64>,
}

impl WorkVector {
    pub fn with_capacity(rows: usize) -> Self {
        Self {
            row_index: Vec::with_capacity(rows),
            values: Vec::with_capacity(rows),
        }
    }

    /// Zeroed vector of `rows` entries.
    pub fn resize(&mut self, rows: usize) {
        self.row_index.clear();
        self.values.clear();
        self.row_index.resize(rows, 0);
        self.values.resize(rows, 0.0);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn put_row_index(&mut self, i: usize, row: usize) {
        self.row_index[i] = row;
    }

    pub fn put_coef(&mut self, i: usize, value: f64) {
        self.values[i] = value;
    }

    pub fn inc_coef(&mut self, i: usize, value: f64) {
        self.values[i] += value;
    }

    pub fn entries(&self) -> impl Iterator<Item = (usize, f64)> + '_ {
        self.row_index.iter().copied().zip(self.values.iter().copied())
    }

    /// Accumulate into a global vector with the row offset of `shift`.
    pub fn add_to(&self, out: &mut [f64], shift: &AssemblyShift) -> Result<(), MatrixError> {
        let size = out.len();
        for (row, value) in self.entries() {
            let target = row + shift.row;
            let slot = out.get_mut(target).ok_or(MatrixError::OutOfBounds {
                row: target,
                col: 0,
                size,
            })?;
            *slot += value * shift.scale;
        }
        Ok(())
    }
}
