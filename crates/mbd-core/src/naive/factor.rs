//! In-place LU factorization with row pivoting.
//!
//! Step `i` eliminates column `i`: task 0 picks the pivot row among the
//! rows not yet eliminated, every task then updates its own rows
//! (`row % ncpu == task`) and the tasks meet at a per-step barrier because
//! step `i + 1` reads fill-in written by any task during step `i`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use super::shared::SharedNaive;
use super::{NaiveConfig, NaiveFactors};
use crate::error::NaiveError;
use crate::matrix::{MatrixHandler, NaiveMatrix};
use crate::sync::{PivotSlots, SpinWait, StepBarrier};

struct FactorState<'a> {
    shared: &'a SharedNaive,
    /// Rows not yet chosen as pivot. Written by task 0 only, before the
    /// pivot of the step is published.
    todo: Vec<AtomicBool>,
    pivots: PivotSlots,
    barrier: StepBarrier,
    min_pivot: f64,
    ncpu: usize,
    spin: SpinWait,
}

/// Factor `matrix` in place on the calling thread.
pub fn factor(matrix: &mut NaiveMatrix, config: &NaiveConfig) -> Result<NaiveFactors, NaiveError> {
    factor_parallel(matrix, 1, config)
}

/// Factor `matrix` in place with `ncpu` cooperating threads.
///
/// The calling thread acts as task 0 and the others are scoped OS threads:
/// the tasks spin on each other every step, which a cooperative pool
/// could not schedule.
pub fn factor_parallel(
    matrix: &mut NaiveMatrix,
    ncpu: usize,
    config: &NaiveConfig,
) -> Result<NaiveFactors, NaiveError> {
    let n = matrix.size();
    if n == 0 {
        return Ok(NaiveFactors {
            pivots: Vec::new(),
        });
    }
    let ncpu = ncpu.clamp(1, n);

    let shared = SharedNaive::new(std::mem::take(matrix));
    let state = FactorState {
        shared: &shared,
        todo: (0..n).map(|_| AtomicBool::new(true)).collect(),
        pivots: PivotSlots::new(n),
        barrier: StepBarrier::new(n, ncpu),
        min_pivot: config.effective_min_pivot(),
        ncpu,
        spin: config.spin_wait(),
    };

    let result = if ncpu == 1 {
        run_task(&state, 0)
    } else {
        thread::scope(|s| {
            let state = &state;
            let mut workers = Vec::with_capacity(ncpu - 1);
            let mut failed = None;
            for task in 1..ncpu {
                match thread::Builder::new()
                    .name(format!("naive-factor-{task}"))
                    .spawn_scoped(s, move || run_task(state, task))
                {
                    Ok(handle) => workers.push((task, handle)),
                    Err(_) => {
                        failed = Some(task);
                        break;
                    }
                }
            }
            let mut result = match failed {
                Some(task) => {
                    // release the tasks already waiting for the first pivot
                    state.pivots.abort(0);
                    Err(NaiveError::SpawnFailed { task })
                }
                None => run_task(state, 0),
            };
            for (task, handle) in workers {
                let outcome = handle
                    .join()
                    .unwrap_or(Err(NaiveError::TaskPanicked { task }));
                if result.is_ok() {
                    result = outcome;
                }
            }
            result
        })
    };

    let FactorState { pivots, .. } = state;
    *matrix = shared.into_inner();
    result?;

    let pivots = pivots.into_rows().ok_or(NaiveError::NotFactored)?;
    Ok(NaiveFactors { pivots })
}

fn run_task(state: &FactorState<'_>, task: usize) -> Result<(), NaiveError> {
    let shared = state.shared;
    let n = shared.size();

    for i in 0..n {
        let pvr = if task == 0 {
            match select_pivot(state, i) {
                Ok(pvr) => {
                    state.pivots.publish(i, pvr);
                    pvr
                }
                Err(err) => {
                    state.pivots.abort(i);
                    return Err(err);
                }
            }
        } else {
            match state.pivots.wait(&state.spin, i)? {
                Some(pvr) => pvr,
                // task 0 reports the failure
                None => return Ok(()),
            }
        };

        // Safety: the pivot row left the todo set, no task writes it.
        let pivot = unsafe { shared.row(pvr) };
        let den = pivot.values[i];
        // Safety: fill-in of step i only lands in columns > i.
        let col_rows = unsafe { shared.col(i) };

        for &r in col_rows {
            if r % state.ncpu != task || !state.todo[r].load(Ordering::Relaxed) {
                continue;
            }
            // Safety: row r belongs to this task for the whole step.
            let row = unsafe { shared.row_mut(r) };
            let mul = row.values[i] * den;
            row.values[i] = mul;
            for &pvc in &pivot.cols {
                if pvc <= i {
                    continue;
                }
                let update = mul * pivot.values[pvc];
                if row.nz[pvc] {
                    row.values[pvc] -= update;
                } else {
                    row.values[pvc] = -update;
                    row.nz[pvc] = true;
                    row.cols.push(pvc);
                    // Safety: column pvc > i is not read during step i.
                    unsafe { shared.push_col(pvc, r) };
                }
            }
        }

        state.barrier.arrive_and_wait(&state.spin, i)?;
    }
    Ok(())
}

/// Pick the pivot of column `i`: among remaining rows with magnitude at
/// least `min_pivot` times the largest one, the row with fewest nonzeros,
/// the lowest row index on ties. Fill-in reaches the column lists in
/// thread order, so the list order cannot break ties.
fn select_pivot(state: &FactorState<'_>, i: usize) -> Result<usize, NaiveError> {
    let shared = state.shared;
    // Safety: all other tasks are waiting for this step's pivot.
    let col_rows = unsafe { shared.col(i) };

    let mut largest = 0.0f64;
    let mut remaining = false;
    for &r in col_rows {
        if state.todo[r].load(Ordering::Relaxed) {
            remaining = true;
            largest = largest.max(unsafe { shared.row(r) }.values[i].abs());
        }
    }
    if !remaining {
        return Err(NaiveError::NullColumn { col: i });
    }
    if largest == 0.0 || !largest.is_finite() {
        return Err(NaiveError::NoPivot { col: i });
    }

    let threshold = largest * state.min_pivot;
    let mut best: Option<(usize, usize)> = None;
    for &r in col_rows {
        if !state.todo[r].load(Ordering::Relaxed) {
            continue;
        }
        let row = unsafe { shared.row(r) };
        let magnitude = row.values[i].abs();
        let fill = row.cols.len();
        let better = best.map_or(true, |(br, nc)| fill < nc || (fill == nc && r < br));
        if magnitude >= threshold && better {
            best = Some((r, fill));
        }
    }
    let (pvr, _) = best.ok_or(NaiveError::NoPivot { col: i })?;

    state.todo[pvr].store(false, Ordering::Relaxed);
    // Safety: no other task touches rows before the pivot is published.
    let pivot = unsafe { shared.row_mut(pvr) };
    pivot.values[i] = 1.0 / pivot.values[i];
    Ok(pvr)
}
