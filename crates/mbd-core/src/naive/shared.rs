use crate::matrix::{MatrixHandler, NaiveMatrix, NaiveRow};
use crate::sync::SpinLock;

/// A [`NaiveMatrix`] opened up for concurrent row updates.
///
/// The parallel kernels partition rows between threads, so two threads
/// never hold mutable access to the same row. Column row-lists are
/// appended only under the matching column lock, and only while no thread
/// reads that list. Callers of the `unsafe` accessors uphold exactly these
/// two rules.
pub(crate) struct SharedNaive {
    matrix: NaiveMatrix,
    rows: *mut NaiveRow,
    cols: *mut Vec<usize>,
    col_locks: Vec<SpinLock>,
}

// Safety: access to the raw row/column pointers follows the partition
// rules documented on the type.
unsafe impl Send for SharedNaive {}
unsafe impl Sync for SharedNaive {}

impl SharedNaive {
    pub(crate) fn new(mut matrix: NaiveMatrix) -> Self {
        let rows = matrix.rows.as_mut_ptr();
        let cols = matrix.cols.as_mut_ptr();
        let col_locks = (0..matrix.size()).map(|_| SpinLock::new()).collect();
        Self {
            matrix,
            rows,
            cols,
            col_locks,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.col_locks.len()
    }

    /// # Safety
    /// No other thread may be mutating row `r`.
    #[inline]
    pub(crate) unsafe fn row(&self, r: usize) -> &NaiveRow {
        debug_assert!(r < self.size());
        &*self.rows.add(r)
    }

    /// # Safety
    /// The calling thread must be the only one accessing row `r`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn row_mut(&self, r: usize) -> &mut NaiveRow {
        debug_assert!(r < self.size());
        &mut *self.rows.add(r)
    }

    /// # Safety
    /// No thread may append to column `c` while the slice is alive.
    #[inline]
    pub(crate) unsafe fn col(&self, c: usize) -> &[usize] {
        debug_assert!(c < self.size());
        &*self.cols.add(c)
    }

    /// Register row `r` in the row list of column `c`.
    ///
    /// # Safety
    /// No thread may be reading column `c`'s list concurrently.
    #[inline]
    pub(crate) unsafe fn push_col(&self, c: usize, r: usize) {
        let _guard = self.col_locks[c].lock();
        (*self.cols.add(c)).push(r);
    }

    pub(crate) fn into_inner(self) -> NaiveMatrix {
        self.matrix
    }
}
