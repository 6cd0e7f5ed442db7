//! Reduction of per-thread naive matrices into one.

use std::ops::Range;
use std::thread;

use super::shared::SharedNaive;
use crate::error::MatrixError;
use crate::matrix::{MatrixHandler, NaiveMatrix};

/// Rows of `task` when `n` rows are split into `ncpu` contiguous ranges.
pub fn row_range(n: usize, task: usize, ncpu: usize) -> Range<usize> {
    (n * task / ncpu)..(n * (task + 1) / ncpu)
}

/// Add `sources` into `target` over `rows`.
///
/// Row ranges of concurrent callers must be disjoint; new entries register
/// in the target's column lists under the column locks.
pub(crate) fn sum_rows(target: &SharedNaive, sources: &[&NaiveMatrix], rows: Range<usize>) {
    for source in sources {
        for r in rows.clone() {
            let from = &source.rows[r];
            if from.cols.is_empty() {
                continue;
            }
            // Safety: rows are partitioned between the callers.
            let to = unsafe { target.row_mut(r) };
            for &c in &from.cols {
                if to.accumulate(c, from.values[c]) {
                    // Safety: nobody reads column lists during the sum.
                    unsafe { target.push_col(c, r) };
                }
            }
        }
    }
}

fn check_sources(target: &NaiveMatrix, sources: &[&NaiveMatrix]) -> Result<(), MatrixError> {
    let n = target.size();
    match sources.iter().find(|m| m.size() != n) {
        Some(bad) => Err(MatrixError::SizeMismatch {
            expected: n,
            got: bad.size(),
        }),
        None => Ok(()),
    }
}

/// Add every matrix of `sources` into `target`, splitting the rows
/// between `ncpu` threads.
pub fn sum_parallel(
    target: &mut NaiveMatrix,
    sources: &[&NaiveMatrix],
    ncpu: usize,
) -> Result<(), MatrixError> {
    check_sources(target, sources)?;
    let n = target.size();
    let ncpu = ncpu.clamp(1, n.max(1));

    let shared = SharedNaive::new(std::mem::take(target));
    if ncpu == 1 {
        sum_rows(&shared, sources, 0..n);
    } else {
        thread::scope(|s| {
            let shared = &shared;
            for task in 1..ncpu {
                s.spawn(move || sum_rows(shared, sources, row_range(n, task, ncpu)));
            }
            sum_rows(shared, sources, row_range(n, 0, ncpu));
        });
    }
    *target = shared.into_inner();
    Ok(())
}

/// Add every matrix of `sources` into `target` on the calling thread.
pub fn sum_into(target: &mut NaiveMatrix, sources: &[&NaiveMatrix]) -> Result<(), MatrixError> {
    check_sources(target, sources)?;
    for source in sources {
        target.add_matrix(source)?;
    }
    Ok(())
}
