//! Fixed pool of long-lived worker threads.
//!
//! Workers are spawned once and each owns a private state. An operation
//! goes to one worker through that worker's channel; every worker reports
//! completion on a single shared channel, and the caller joins by
//! receiving the number of results it dispatched. Dropping the pool closes
//! the operation channels, which is the workers' exit signal.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::PoolError;

type Completion<Out> = (usize, Result<Out, PoolError>);

pub struct WorkerPool<Op: Send + 'static, Out: Send + 'static> {
    senders: Vec<Sender<Op>>,
    done: Receiver<Completion<Out>>,
    handles: Vec<JoinHandle<()>>,
}

impl<Op: Send + 'static, Out: Send + 'static> WorkerPool<Op, Out> {
    /// Spawn one worker per entry of `states`. Worker `k` runs
    /// `handler(&mut states[k], op)` for every operation it receives.
    pub fn spawn<S, F>(name: &str, states: Vec<S>, handler: F) -> Result<Self, PoolError>
    where
        S: Send + 'static,
        F: Fn(&mut S, Op) -> Out + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let (done_tx, done) = mpsc::channel();
        let mut senders = Vec::with_capacity(states.len());
        let mut handles = Vec::with_capacity(states.len());

        for (worker, mut state) in states.into_iter().enumerate() {
            let (tx, rx) = mpsc::channel::<Op>();
            let done_tx = done_tx.clone();
            let handler = Arc::clone(&handler);
            let handle = thread::Builder::new()
                .name(format!("{name}-{worker}"))
                .spawn(move || {
                    while let Ok(op) = rx.recv() {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut state, op)))
                            .map_err(|_| PoolError::WorkerPanicked { worker });
                        if done_tx.send((worker, outcome)).is_err() {
                            break;
                        }
                    }
                })
                .map_err(|_| PoolError::SpawnFailed { worker })?;
            senders.push(tx);
            handles.push(handle);
        }
        debug!(name, workers = handles.len(), "worker pool started");

        Ok(Self {
            senders,
            done,
            handles,
        })
    }

    pub fn workers(&self) -> usize {
        self.senders.len()
    }

    /// Queue `op` on `worker`.
    pub fn dispatch(&self, worker: usize, op: Op) -> Result<(), PoolError> {
        self.senders
            .get(worker)
            .ok_or(PoolError::Disconnected)?
            .send(op)
            .map_err(|_| PoolError::Disconnected)
    }

    /// Queue one operation per worker.
    pub fn broadcast(&self, mut make: impl FnMut(usize) -> Op) -> Result<(), PoolError> {
        for worker in 0..self.workers() {
            self.dispatch(worker, make(worker))?;
        }
        Ok(())
    }

    /// Wait for `count` completions, returned in worker order.
    pub fn join(&self, count: usize) -> Result<Vec<Result<Out, PoolError>>, PoolError> {
        let mut results: Vec<Option<Result<Out, PoolError>>> =
            (0..self.workers()).map(|_| None).collect();
        for _ in 0..count {
            let (worker, outcome) = self.done.recv().map_err(|_| PoolError::Disconnected)?;
            if let Some(slot) = results.get_mut(worker) {
                *slot = Some(outcome);
            }
        }
        Ok(results.into_iter().flatten().collect())
    }

    /// Close the channels of workers `worker..`, as if they had exited.
    #[cfg(test)]
    pub(crate) fn close_from(&mut self, worker: usize) {
        self.senders.truncate(worker);
    }
}

impl<Op: Send + 'static, Out: Send + 'static> Drop for WorkerPool<Op, Out> {
    fn drop(&mut self) {
        self.senders.clear();
        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("worker thread terminated abnormally");
            }
        }
    }
}
