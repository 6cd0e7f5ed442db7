//! Naive sparse LU
//!
//! Gaussian elimination directly on a [`NaiveMatrix`]: dense row storage,
//! row pivoting only, fill-in registered as it appears. Columns keep their
//! original order, so the solution needs no column permutation.
//!
//! # Algorithm
//!
//! 1. **Pivot**: among the rows not yet eliminated, keep those whose entry
//!    in column `i` is at least `min_pivot` times the largest one, then take
//!    the one with the fewest nonzeros (sparsity-preserving tie-break).
//! 2. **Eliminate**: the pivot entry is replaced by its reciprocal, every
//!    other remaining row stores its multiplier in column `i` and updates
//!    the columns right of `i` present in the pivot row.
//! 3. **Solve**: forward substitution in pivot order, backward in reverse.
//!
//! # Threads
//!
//! | Kernel | Partition | Synchronization |
//! |--------|-----------|-----------------|
//! | factor | `row % ncpu` | pivot publication + per-step barrier |
//! | solve  | `i % ncpu`   | per-entry completion flags |
//! | sum    | contiguous row ranges | per-column lock on fill-in |

mod factor;
mod shared;
mod solve;
mod sum;

pub use factor::{factor, factor_parallel};
pub use solve::{solve, solve_parallel};
pub use sum::{row_range, sum_into, sum_parallel};

pub(crate) use shared::SharedNaive;
pub(crate) use sum::sum_rows;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::NaiveError;
use crate::matrix::NaiveMatrix;
use crate::sync::SpinWait;

/// Default relative pivot threshold.
pub const MIN_PIVOT: f64 = 1.0e-8;

/// Configuration of the naive kernels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NaiveConfig {
    /// Relative pivot threshold; 0 selects [`MIN_PIVOT`].
    pub min_pivot: f64,
    /// Spin diagnostic deadline in milliseconds; 0 spins forever.
    pub spin_deadline_ms: u64,
}

impl Default for NaiveConfig {
    fn default() -> Self {
        Self {
            min_pivot: MIN_PIVOT,
            spin_deadline_ms: 0,
        }
    }
}

impl NaiveConfig {
    pub fn effective_min_pivot(&self) -> f64 {
        if self.min_pivot == 0.0 {
            MIN_PIVOT
        } else {
            self.min_pivot
        }
    }

    pub(crate) fn spin_wait(&self) -> SpinWait {
        SpinWait::new((self.spin_deadline_ms > 0).then(|| Duration::from_millis(self.spin_deadline_ms)))
    }
}

/// Pivot order of a factored matrix: `pivots[i]` is the row eliminated at
/// step `i`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NaiveFactors {
    pub(crate) pivots: Vec<usize>,
}

impl NaiveFactors {
    pub fn pivots(&self) -> &[usize] {
        &self.pivots
    }
}

/// Factor-then-solve driver holding the last factorization.
#[derive(Debug, Clone)]
pub struct NaiveSolver {
    config: NaiveConfig,
    threads: usize,
    factors: Option<NaiveFactors>,
    /// Statistics
    pub factor_count: usize,
}

impl NaiveSolver {
    pub fn new(threads: usize, config: NaiveConfig) -> Self {
        Self {
            config,
            threads: threads.max(1),
            factors: None,
            factor_count: 0,
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn config(&self) -> &NaiveConfig {
        &self.config
    }

    /// Factor in place; the matrix holds L and U afterwards.
    pub fn factor(&mut self, matrix: &mut NaiveMatrix) -> Result<(), NaiveError> {
        self.factors = None;
        let factors = if self.threads > 1 {
            factor_parallel(matrix, self.threads, &self.config)?
        } else {
            factor(matrix, &self.config)?
        };
        self.factors = Some(factors);
        self.factor_count += 1;
        Ok(())
    }

    pub fn solve(&self, matrix: &NaiveMatrix, rhs: &[f64], sol: &mut [f64]) -> Result<(), NaiveError> {
        let factors = self.factors.as_ref().ok_or(NaiveError::NotFactored)?;
        if self.threads > 1 {
            solve_parallel(matrix, factors, rhs, sol, self.threads, &self.config)
        } else {
            solve(matrix, factors, rhs, sol)
        }
    }

    pub fn is_factored(&self) -> bool {
        self.factors.is_some()
    }

    /// Forget the factorization, e.g. after the matrix was reset.
    pub fn invalidate(&mut self) {
        self.factors = None;
    }
}
