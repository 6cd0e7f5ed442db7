//! Completion cells for the naive kernels.
//!
//! These are not locks around critical sections. Each index is written by
//! exactly one thread and read by many: the writer posts, readers spin
//! until they observe the post. All posts are `Release` stores and all
//! observations are `Acquire` loads, so data written before a post is
//! visible to any thread that has seen it.
//!
//! The one real lock is [`SpinLock`], guarding the append to a column's
//! row list when a fill-in entry is registered.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crate::error::NaiveError;

/// Spins before each `yield_now` while waiting.
const SPINS_BEFORE_YIELD: u32 = 1 << 10;

/// Busy-wait helper with an optional diagnostic deadline.
#[derive(Debug, Clone, Copy)]
pub struct SpinWait {
    deadline: Option<Duration>,
}

impl SpinWait {
    pub fn new(deadline: Option<Duration>) -> Self {
        Self { deadline }
    }

    /// Spin until `ready` returns true.
    ///
    /// `what`/`index` only name the awaited cell in the timeout error.
    #[inline]
    pub fn until(
        &self,
        what: &'static str,
        index: usize,
        mut ready: impl FnMut() -> bool,
    ) -> Result<(), NaiveError> {
        if ready() {
            return Ok(());
        }
        let start = self.deadline.map(|_| Instant::now());
        let mut spins = 0u32;
        loop {
            if ready() {
                return Ok(());
            }
            spins = spins.wrapping_add(1);
            if spins % SPINS_BEFORE_YIELD == 0 {
                std::thread::yield_now();
                if let (Some(limit), Some(start)) = (self.deadline, start) {
                    if start.elapsed() > limit {
                        return Err(NaiveError::SyncTimeout { what, index });
                    }
                }
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// One flag per index, posted once by its single writer.
#[derive(Debug)]
pub struct CompletionFlags {
    flags: Vec<AtomicBool>,
}

impl CompletionFlags {
    pub fn new(n: usize) -> Self {
        Self {
            flags: (0..n).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    #[inline]
    pub fn post(&self, i: usize) {
        self.flags[i].store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_posted(&self, i: usize) -> bool {
        self.flags[i].load(Ordering::Acquire)
    }

    #[inline]
    pub fn wait(&self, spin: &SpinWait, i: usize) -> Result<(), NaiveError> {
        spin.until("completion flag", i, || self.is_posted(i))
    }

    /// Reset every flag. Requires exclusive access, so no reader can be
    /// spinning on a flag being cleared.
    pub fn clear_all(&mut self) {
        for flag in &mut self.flags {
            *flag.get_mut() = false;
        }
    }
}

const SLOT_EMPTY: usize = usize::MAX;
const SLOT_ABORTED: usize = usize::MAX - 1;

/// Pivot row per elimination step, published by the selecting thread.
#[derive(Debug)]
pub struct PivotSlots {
    slots: Vec<AtomicUsize>,
}

impl PivotSlots {
    pub fn new(n: usize) -> Self {
        Self {
            slots: (0..n).map(|_| AtomicUsize::new(SLOT_EMPTY)).collect(),
        }
    }

    /// Publish the pivot row of step `i`. Everything the selector wrote
    /// before this call (the reciprocal pivot, the todo flags) becomes
    /// visible to readers that observe the row.
    #[inline]
    pub fn publish(&self, i: usize, row: usize) {
        debug_assert!(row < SLOT_ABORTED);
        self.slots[i].store(row, Ordering::Release);
    }

    /// Mark step `i` as failed so waiting threads stop spinning.
    pub fn abort(&self, i: usize) {
        self.slots[i].store(SLOT_ABORTED, Ordering::Release);
    }

    /// Wait for step `i`; `Ok(None)` means the selector aborted.
    #[inline]
    pub fn wait(&self, spin: &SpinWait, i: usize) -> Result<Option<usize>, NaiveError> {
        let mut value = SLOT_EMPTY;
        spin.until("pivot", i, || {
            value = self.slots[i].load(Ordering::Acquire);
            value != SLOT_EMPTY
        })?;
        Ok((value != SLOT_ABORTED).then_some(value))
    }

    /// Read a published pivot after the factorization has completed.
    pub fn get(&self, i: usize) -> Option<usize> {
        match self.slots[i].load(Ordering::Acquire) {
            SLOT_EMPTY | SLOT_ABORTED => None,
            row => Some(row),
        }
    }

    pub fn into_rows(self) -> Option<Vec<usize>> {
        self.slots
            .into_iter()
            .map(|slot| match slot.into_inner() {
                SLOT_EMPTY | SLOT_ABORTED => None,
                row => Some(row),
            })
            .collect()
    }
}

/// Per-step arrival counters: nobody leaves step `i` before all parties
/// have arrived at it.
#[derive(Debug)]
pub struct StepBarrier {
    arrivals: Vec<AtomicUsize>,
    parties: usize,
}

impl StepBarrier {
    pub fn new(steps: usize, parties: usize) -> Self {
        Self {
            arrivals: (0..steps).map(|_| AtomicUsize::new(0)).collect(),
            parties,
        }
    }

    #[inline]
    pub fn arrive_and_wait(&self, spin: &SpinWait, step: usize) -> Result<(), NaiveError> {
        self.arrivals[step].fetch_add(1, Ordering::AcqRel);
        spin.until("step barrier", step, || {
            self.arrivals[step].load(Ordering::Acquire) >= self.parties
        })
    }
}

/// Compare-and-swap lock for short structural updates.
#[derive(Debug, Default)]
pub struct SpinLock {
    locked: AtomicBool,
}

impl SpinLock {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn lock(&self) -> SpinGuard<'_> {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.locked.load(Ordering::Relaxed) {
                std::hint::spin_loop();
            }
        }
        SpinGuard { lock: self }
    }
}

/// Releases the [`SpinLock`] on drop.
pub struct SpinGuard<'a> {
    lock: &'a SpinLock,
}

impl Drop for SpinGuard<'_> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}
