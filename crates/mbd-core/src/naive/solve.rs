//! Forward and backward substitution over a factored [`NaiveMatrix`].
//!
//! Entry `i` of the forward pass uses row `piv[i]`: its columns `c < i`
//! hold the multipliers of step `c`, its column `i` the reciprocal pivot.
//! In the parallel version entry `i` belongs to task `i % ncpu` and is
//! computed as soon as the entries it depends on are posted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;

use super::{NaiveConfig, NaiveFactors};
use crate::error::NaiveError;
use crate::matrix::{MatrixHandler, NaiveMatrix};
use crate::sync::{CompletionFlags, SpinWait, StepBarrier};

fn check_sizes(
    matrix: &NaiveMatrix,
    factors: &NaiveFactors,
    rhs: &[f64],
    sol: &[f64],
) -> Result<usize, NaiveError> {
    let n = matrix.size();
    if factors.pivots.len() != n {
        return Err(NaiveError::NotFactored);
    }
    for len in [rhs.len(), sol.len()] {
        if len != n {
            return Err(NaiveError::SizeMismatch { expected: n, got: len });
        }
    }
    Ok(n)
}

/// Solve `A x = rhs` on the calling thread.
pub fn solve(
    matrix: &NaiveMatrix,
    factors: &NaiveFactors,
    rhs: &[f64],
    sol: &mut [f64],
) -> Result<(), NaiveError> {
    let n = check_sizes(matrix, factors, rhs, sol)?;
    if n == 0 {
        return Ok(());
    }
    let piv = &factors.pivots;
    let mut fwd = vec![0.0; n];

    for i in 0..n {
        let row = &matrix.rows[piv[i]];
        let mut s = rhs[piv[i]];
        for &c in &row.cols {
            if c < i {
                s -= row.values[c] * fwd[c];
            }
        }
        fwd[i] = s;
    }

    for i in (0..n).rev() {
        let row = &matrix.rows[piv[i]];
        let mut s = fwd[i];
        for &c in &row.cols {
            if c > i {
                s -= row.values[c] * sol[c];
            }
        }
        sol[i] = s * row.values[i];
    }
    Ok(())
}

/// Values written once by their owning task, read after its flag is seen.
struct PostedValues {
    bits: Vec<AtomicU64>,
}

impl PostedValues {
    fn new(n: usize) -> Self {
        Self {
            bits: (0..n).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    #[inline]
    fn set(&self, i: usize, value: f64) {
        self.bits[i].store(value.to_bits(), Ordering::Relaxed);
    }

    #[inline]
    fn get(&self, i: usize) -> f64 {
        f64::from_bits(self.bits[i].load(Ordering::Relaxed))
    }
}

struct SolveState<'a> {
    matrix: &'a NaiveMatrix,
    piv: &'a [usize],
    rhs: &'a [f64],
    fwd: PostedValues,
    sol: PostedValues,
    fwd_done: CompletionFlags,
    sol_done: CompletionFlags,
    phase: StepBarrier,
    ncpu: usize,
    spin: SpinWait,
}

/// Solve `A x = rhs` with `ncpu` cooperating threads.
pub fn solve_parallel(
    matrix: &NaiveMatrix,
    factors: &NaiveFactors,
    rhs: &[f64],
    sol: &mut [f64],
    ncpu: usize,
    config: &NaiveConfig,
) -> Result<(), NaiveError> {
    let n = check_sizes(matrix, factors, rhs, sol)?;
    let ncpu = ncpu.clamp(1, n.max(1));
    if ncpu == 1 {
        return solve(matrix, factors, rhs, sol);
    }

    let state = SolveState {
        matrix,
        piv: &factors.pivots,
        rhs,
        fwd: PostedValues::new(n),
        sol: PostedValues::new(n),
        fwd_done: CompletionFlags::new(n),
        sol_done: CompletionFlags::new(n),
        phase: StepBarrier::new(1, ncpu),
        ncpu,
        spin: config.spin_wait(),
    };

    thread::scope(|s| {
        let state = &state;
        let workers: Vec<_> = (1..ncpu)
            .map(|task| (task, s.spawn(move || run_task(state, task))))
            .collect();
        let mut result = run_task(state, 0);
        for (task, handle) in workers {
            let outcome = handle
                .join()
                .unwrap_or(Err(NaiveError::TaskPanicked { task }));
            if result.is_ok() {
                result = outcome;
            }
        }
        result
    })?;

    for (i, x) in sol.iter_mut().enumerate() {
        *x = state.sol.get(i);
    }
    Ok(())
}

fn run_task(state: &SolveState<'_>, task: usize) -> Result<(), NaiveError> {
    let n = state.piv.len();
    let spin = &state.spin;

    for i in (task..n).step_by(state.ncpu) {
        let r = state.piv[i];
        let row = &state.matrix.rows[r];
        let mut s = state.rhs[r];
        for &c in &row.cols {
            if c < i {
                state.fwd_done.wait(spin, c)?;
                s -= row.values[c] * state.fwd.get(c);
            }
        }
        state.fwd.set(i, s);
        state.fwd_done.post(i);
    }

    state.phase.arrive_and_wait(spin, 0)?;

    for i in (0..n).rev().filter(|i| i % state.ncpu == task) {
        let row = &state.matrix.rows[state.piv[i]];
        let mut s = state.fwd.get(i);
        for &c in &row.cols {
            if c > i {
                state.sol_done.wait(spin, c)?;
                s -= row.values[c] * state.sol.get(c);
            }
        }
        state.sol.set(i, s * row.values[i]);
        state.sol_done.post(i);
    }
    Ok(())
}
