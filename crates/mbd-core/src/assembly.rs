//! Multi-threaded residual and Jacobian assembly.
//!
//! Elements are claimed in index order from a shared [`ElementSet`]: every
//! thread walks the set with its own cursor and takes the elements nobody
//! claimed yet. Each thread fills its own scratch buffers and its own
//! target (the caller's matrix for thread 0, a private copy for the pool
//! workers); the private targets are summed into the caller's after the
//! join.
//!
//! The strategy depends on the handler, detected from
//! [`MatrixHandler::kind`]:
//!
//! | Kind | Per-thread target | Merge |
//! |------|-------------------|-------|
//! | `Naive` | own `NaiveMatrix` | parallel row-range sum |
//! | `Pattern` | none, single thread | - |
//! | `Compact` | `copy_pattern()` | element-wise value sum |
//! | `Generic` | none, single thread | - |
//!
//! Element failures never cross a thread boundary as panics: each thread
//! reports a [`TaskOutcome`] and the orchestrator turns the merged outcome
//! into an [`AssemblyError`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard};

use tracing::{debug, trace};

use crate::error::{AssemblyError, ConfigError, ElementError, MatrixError, PoolError};
use crate::matrix::{
    AssemblyShift, CompactMatrix, MatrixHandler, MatrixKind, NaiveMatrix, WorkMatrix, WorkVector,
};
use crate::naive::{row_range, sum_rows, SharedNaive};
use crate::pool::WorkerPool;

/// Residual and Jacobian contributor.
///
/// The residual scratch receives `-F(x', x)`. The Jacobian scratch receives
/// `∂F/∂x' + coef·∂F/∂x`, with global row/column indices.
pub trait Element: Send {
    fn label(&self) -> u32;

    /// Largest scratch block `(rows, cols)` the element fills.
    fn work_space_dim(&self) -> (usize, usize);

    fn assemble_jacobian(
        &mut self,
        work: &mut WorkMatrix,
        coef: f64,
        x: &[f64],
        xp: &[f64],
    ) -> Result<(), ElementError>;

    fn assemble_residual(
        &mut self,
        work: &mut WorkVector,
        coef: f64,
        x: &[f64],
        xp: &[f64],
    ) -> Result<(), ElementError>;

    /// Called once per converged step.
    fn after_convergence(&mut self, _x: &[f64], _xp: &[f64]) {}
}

/// Elements behind per-element locks, with claim flags for one pass.
pub struct ElementSet {
    elements: Vec<Mutex<Box<dyn Element>>>,
    claimed: Vec<AtomicBool>,
}

impl ElementSet {
    pub fn new(elements: Vec<Box<dyn Element>>) -> Self {
        let claimed = elements.iter().map(|_| AtomicBool::new(false)).collect();
        Self {
            elements: elements.into_iter().map(Mutex::new).collect(),
            claimed,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Largest `(rows, cols)` over all elements.
    pub fn max_work_space_dim(&self) -> (usize, usize) {
        (0..self.len())
            .map(|i| self.lock(i).work_space_dim())
            .fold((0, 0), |(r, c), (er, ec)| (r.max(er), c.max(ec)))
    }

    /// Release every claim. Must not race with `claim_next`.
    pub fn reset_access(&self) {
        for flag in &self.claimed {
            flag.store(false, Ordering::Relaxed);
        }
    }

    /// Next unclaimed element at or after `cursor`.
    pub fn claim_next(&self, cursor: &mut usize) -> Option<usize> {
        while *cursor < self.claimed.len() {
            let i = *cursor;
            *cursor += 1;
            if !self.claimed[i].swap(true, Ordering::AcqRel) {
                return Some(i);
            }
        }
        None
    }

    pub fn lock(&self, i: usize) -> MutexGuard<'_, Box<dyn Element>> {
        self.elements[i]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn for_each(&self, mut f: impl FnMut(&mut dyn Element)) {
        for i in 0..self.len() {
            f(self.lock(i).as_mut());
        }
    }
}

/// What one Jacobian pass adds to the matrix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JacobianPass {
    pub coef: f64,
    pub shift: AssemblyShift,
    /// Add `scale·(J(1) - J(0))`, i.e. only the `∂F/∂x` part scaled.
    pub difference: bool,
}

impl JacobianPass {
    pub fn new(coef: f64) -> Self {
        Self {
            coef,
            shift: AssemblyShift::default(),
            difference: false,
        }
    }

    pub fn with_shift(self, shift: AssemblyShift) -> Self {
        Self { shift, ..self }
    }

    /// Off-diagonal block of a multi-stage scheme: `shift.scale·∂F/∂x`.
    pub fn difference(shift: AssemblyShift) -> Self {
        Self {
            coef: 1.0,
            shift,
            difference: true,
        }
    }
}

/// Per-thread result of one pass.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Ok,
    StructuralChange,
    RebuildMatrix,
    NumericError { element: u32, reason: String },
    Matrix(MatrixError),
}

impl TaskOutcome {
    fn severity(&self) -> u8 {
        match self {
            TaskOutcome::Ok => 0,
            TaskOutcome::StructuralChange => 1,
            TaskOutcome::RebuildMatrix => 2,
            TaskOutcome::Matrix(_) => 3,
            TaskOutcome::NumericError { .. } => 4,
        }
    }

    fn merge(self, other: TaskOutcome) -> TaskOutcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    fn from_element(label: u32, err: ElementError) -> TaskOutcome {
        match err {
            ElementError::ChangedStructure => TaskOutcome::StructuralChange,
            ElementError::DivideByZero(reason) => TaskOutcome::NumericError {
                element: label,
                reason,
            },
            ElementError::Matrix(MatrixError::RebuildMatrix { .. }) => TaskOutcome::RebuildMatrix,
            ElementError::Matrix(err) => TaskOutcome::Matrix(err),
        }
    }

    /// Stop this thread's walk over the elements.
    fn is_fatal(&self) -> bool {
        self.severity() >= 2
    }

    fn into_result(self) -> Result<(), AssemblyError> {
        match self {
            TaskOutcome::Ok => Ok(()),
            TaskOutcome::StructuralChange => Err(AssemblyError::ChangedStructure),
            TaskOutcome::RebuildMatrix => Err(AssemblyError::RebuildMatrix),
            TaskOutcome::NumericError { element, reason } => {
                Err(AssemblyError::DivideByZero { element, reason })
            }
            TaskOutcome::Matrix(err) => Err(err.into()),
        }
    }
}

/// WorkMatA, WorkMatB, WorkVec of one thread.
struct Scratch {
    mat_a: WorkMatrix,
    mat_b: WorkMatrix,
    vec: WorkVector,
}

impl Scratch {
    fn new((rows, cols): (usize, usize)) -> Self {
        Self {
            mat_a: WorkMatrix::with_capacity(rows, cols),
            mat_b: WorkMatrix::with_capacity(rows, cols),
            vec: WorkVector::with_capacity(rows),
        }
    }
}

/// Inputs shared by every thread of one pass.
struct PassInput {
    n: usize,
    x: Vec<f64>,
    xp: Vec<f64>,
    pass: JacobianPass,
}

fn jacobian_one(
    element: &mut dyn Element,
    scratch: &mut Scratch,
    input: &PassInput,
    matrix: &mut dyn MatrixHandler,
) -> Result<(), ElementError> {
    let pass = &input.pass;
    scratch.mat_a.clear();
    element.assemble_jacobian(&mut scratch.mat_a, pass.coef, &input.x, &input.xp)?;
    matrix.add_work(&scratch.mat_a, &pass.shift)?;
    if pass.difference {
        scratch.mat_b.clear();
        element.assemble_jacobian(&mut scratch.mat_b, 0.0, &input.x, &input.xp)?;
        matrix.add_work(&scratch.mat_b, &pass.shift.scaled(-1.0))?;
    }
    Ok(())
}

fn jacobian_task(
    elements: &ElementSet,
    scratch: &mut Scratch,
    input: &PassInput,
    matrix: &mut dyn MatrixHandler,
) -> TaskOutcome {
    let mut cursor = 0;
    let mut outcome = TaskOutcome::Ok;
    while let Some(i) = elements.claim_next(&mut cursor) {
        let mut element = elements.lock(i);
        if let Err(err) = jacobian_one(element.as_mut(), scratch, input, matrix) {
            outcome = outcome.merge(TaskOutcome::from_element(element.label(), err));
            if outcome.is_fatal() {
                break;
            }
        }
    }
    outcome
}

fn residual_task(
    elements: &ElementSet,
    scratch: &mut Scratch,
    input: &PassInput,
    out: &mut [f64],
) -> TaskOutcome {
    let mut cursor = 0;
    let mut outcome = TaskOutcome::Ok;
    while let Some(i) = elements.claim_next(&mut cursor) {
        let mut element = elements.lock(i);
        scratch.vec.resize(0);
        let filled = element
            .assemble_residual(&mut scratch.vec, input.pass.coef, &input.x, &input.xp)
            .and_then(|_| {
                scratch
                    .vec
                    .add_to(out, &input.pass.shift)
                    .map_err(ElementError::from)
            });
        if let Err(err) = filled {
            outcome = outcome.merge(TaskOutcome::from_element(element.label(), err));
            if outcome.is_fatal() {
                break;
            }
        }
    }
    outcome
}

/// Sum of the worker accumulators into the caller's naive matrix.
struct SumJob {
    target: SharedNaive,
    sources: Vec<Arc<RwLock<NaiveMatrix>>>,
    ncpu: usize,
}

impl SumJob {
    fn run(&self, task: usize) {
        let guards: Vec<RwLockReadGuard<'_, NaiveMatrix>> = self
            .sources
            .iter()
            .map(|m| m.read().unwrap_or_else(PoisonError::into_inner))
            .collect();
        let sources: Vec<&NaiveMatrix> = guards.iter().map(|g| &**g).collect();
        let n = self.target.size();
        sum_rows(&self.target, &sources, row_range(n, task, self.ncpu));
    }
}

/// Operation codes of the assembly workers. Closing the pool is the exit.
enum AssemblyOp {
    JacobianCompact {
        input: Arc<PassInput>,
        matrix: CompactMatrix,
    },
    JacobianNaive {
        input: Arc<PassInput>,
        matrix: Arc<RwLock<NaiveMatrix>>,
    },
    SumNaive {
        job: Arc<SumJob>,
        task: usize,
    },
    Residual {
        input: Arc<PassInput>,
        buffer: Vec<f64>,
    },
}

struct TaskReport {
    outcome: TaskOutcome,
    compact: Option<CompactMatrix>,
    residual: Option<Vec<f64>>,
}

impl TaskReport {
    fn outcome(outcome: TaskOutcome) -> Self {
        Self {
            outcome,
            compact: None,
            residual: None,
        }
    }
}

struct WorkerState {
    elements: Arc<ElementSet>,
    scratch: Scratch,
}

fn run_op(state: &mut WorkerState, op: AssemblyOp) -> TaskReport {
    let elements = &state.elements;
    match op {
        AssemblyOp::JacobianCompact { input, mut matrix } => {
            matrix.reset();
            let outcome = jacobian_task(elements, &mut state.scratch, &input, &mut matrix);
            TaskReport {
                outcome,
                compact: Some(matrix),
                residual: None,
            }
        }
        AssemblyOp::JacobianNaive { input, matrix } => {
            let mut guard = matrix.write().unwrap_or_else(PoisonError::into_inner);
            if guard.size() == input.n {
                guard.reset();
            } else {
                *guard = NaiveMatrix::new(input.n);
            }
            TaskReport::outcome(jacobian_task(
                elements,
                &mut state.scratch,
                &input,
                &mut *guard,
            ))
        }
        AssemblyOp::SumNaive { job, task } => {
            job.run(task);
            TaskReport::outcome(TaskOutcome::Ok)
        }
        AssemblyOp::Residual { input, mut buffer } => {
            let outcome = residual_task(elements, &mut state.scratch, &input, &mut buffer);
            TaskReport {
                outcome,
                compact: None,
                residual: Some(buffer),
            }
        }
    }
}

/// Assembly strategy picked from the handler kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssemblyMode {
    Naive,
    Compact,
    Generic,
}

/// Progress of the compact-column path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcState {
    /// No pattern yet.
    No,
    /// Pattern discovered single-threaded, not frozen yet.
    First,
    /// Per-thread copies of the frozen pattern exist.
    Yes,
}

pub struct AssemblyOrchestrator {
    elements: Arc<ElementSet>,
    threads: usize,
    scratch: Scratch,
    pool: Option<WorkerPool<AssemblyOp, TaskReport>>,
    mode: Option<AssemblyMode>,
    cc_state: CcState,
    naive: Vec<Arc<RwLock<NaiveMatrix>>>,
    compact_copies: Vec<Option<CompactMatrix>>,
    residual_buffers: Vec<Vec<f64>>,
}

impl AssemblyOrchestrator {
    /// `threads` counts the caller: `threads - 1` pool workers are spawned.
    pub fn new(elements: Vec<Box<dyn Element>>, threads: usize) -> Result<Self, ConfigError> {
        if threads == 0 {
            return Err(ConfigError::Invalid("assembly needs at least one thread".into()));
        }
        if elements.is_empty() {
            return Err(ConfigError::Invalid("no elements to assemble".into()));
        }
        if threads > elements.len() {
            return Err(ConfigError::Invalid(format!(
                "{threads} assembly threads for {} elements",
                elements.len()
            )));
        }
        let elements = Arc::new(ElementSet::new(elements));
        let dim = elements.max_work_space_dim();
        if dim.0 == 0 || dim.1 == 0 {
            return Err(ConfigError::Invalid(format!(
                "element work space {}x{} is empty",
                dim.0, dim.1
            )));
        }

        let workers = threads - 1;
        let pool = if workers > 0 {
            let states = (0..workers)
                .map(|_| WorkerState {
                    elements: Arc::clone(&elements),
                    scratch: Scratch::new(dim),
                })
                .collect();
            let pool = WorkerPool::spawn("mbd-assembly", states, run_op)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
            Some(pool)
        } else {
            None
        };
        debug!(threads, elements = elements.len(), ?dim, "assembly orchestrator ready");

        Ok(Self {
            elements,
            threads,
            scratch: Scratch::new(dim),
            pool,
            mode: None,
            cc_state: CcState::No,
            naive: (0..workers)
                .map(|_| Arc::new(RwLock::new(NaiveMatrix::default())))
                .collect(),
            compact_copies: (0..workers).map(|_| None).collect(),
            residual_buffers: vec![Vec::new(); workers],
        })
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn mode(&self) -> Option<AssemblyMode> {
        self.mode
    }

    pub fn cc_state(&self) -> CcState {
        self.cc_state
    }

    pub fn elements(&self) -> &ElementSet {
        &self.elements
    }

    fn input(&self, n: usize, x: &[f64], xp: &[f64], pass: JacobianPass) -> Arc<PassInput> {
        Arc::new(PassInput {
            n,
            x: x.to_vec(),
            xp: xp.to_vec(),
            pass,
        })
    }

    fn detect(&mut self, matrix: &mut dyn MatrixHandler) -> AssemblyMode {
        let mode = match matrix.kind() {
            MatrixKind::Naive(_) => AssemblyMode::Naive,
            MatrixKind::Pattern(_) | MatrixKind::Compact(_) => AssemblyMode::Compact,
            MatrixKind::Generic => AssemblyMode::Generic,
        };
        if self.mode != Some(mode) {
            debug!(?mode, threads = self.threads, "assembly mode detected");
            self.mode = Some(mode);
            self.cc_state = CcState::No;
            for copy in &mut self.compact_copies {
                *copy = None;
            }
        }
        mode
    }

    /// Add one Jacobian pass into `matrix`.
    pub fn assemble_jacobian(
        &mut self,
        matrix: &mut dyn MatrixHandler,
        x: &[f64],
        xp: &[f64],
        pass: JacobianPass,
    ) -> Result<(), AssemblyError> {
        let n = matrix.size();
        let input = self.input(n, x, xp, pass);
        self.elements.reset_access();
        let mode = self.detect(matrix);
        trace!(?mode, coef = pass.coef, "jacobian pass");

        if self.pool.is_none() || mode == AssemblyMode::Generic {
            if mode == AssemblyMode::Compact && self.cc_state == CcState::No {
                self.cc_state = CcState::First;
            }
            return self.jacobian_single(matrix, &input);
        }

        match matrix.kind() {
            MatrixKind::Naive(global) => self.jacobian_naive(global, input),
            MatrixKind::Compact(master) => self.jacobian_compact(master, input),
            MatrixKind::Pattern(pattern) => {
                // the pattern is discovered by the calling thread alone
                self.cc_state = CcState::First;
                self.jacobian_single(pattern, &input)
            }
            MatrixKind::Generic => self.jacobian_single(matrix, &input),
        }
    }

    fn jacobian_single(
        &mut self,
        matrix: &mut dyn MatrixHandler,
        input: &PassInput,
    ) -> Result<(), AssemblyError> {
        jacobian_task(&self.elements, &mut self.scratch, input, matrix).into_result()
    }

    fn jacobian_naive(
        &mut self,
        global: &mut NaiveMatrix,
        input: Arc<PassInput>,
    ) -> Result<(), AssemblyError> {
        let pool = self.pool.as_ref().ok_or(PoolError::Disconnected)?;
        let naive = &self.naive;
        pool.broadcast(|w| AssemblyOp::JacobianNaive {
            input: Arc::clone(&input),
            matrix: Arc::clone(&naive[w]),
        })?;
        let mut outcome = jacobian_task(&self.elements, &mut self.scratch, &input, &mut *global);
        for report in pool.join(pool.workers())? {
            outcome = outcome.merge(report?.outcome);
        }
        if outcome.is_fatal() {
            return outcome.into_result();
        }

        let ncpu = self.threads.min(global.size().max(1));
        let job = Arc::new(SumJob {
            target: SharedNaive::new(std::mem::take(global)),
            sources: self.naive.clone(),
            ncpu,
        });
        let mut dispatched = 0;
        let mut dispatch = Ok(());
        for task in 1..ncpu {
            dispatch = pool.dispatch(
                task - 1,
                AssemblyOp::SumNaive {
                    job: Arc::clone(&job),
                    task,
                },
            );
            if dispatch.is_err() {
                break;
            }
            dispatched += 1;
        }
        if dispatch.is_ok() {
            job.run(0);
        }
        // hand the target back before reporting a dispatch failure
        let sums = pool.join(dispatched);
        let job = Arc::try_unwrap(job).map_err(|_| PoolError::Disconnected)?;
        *global = job.target.into_inner();
        dispatch?;
        for report in sums? {
            report?;
        }
        outcome.into_result()
    }

    fn jacobian_compact(
        &mut self,
        master: &mut CompactMatrix,
        input: Arc<PassInput>,
    ) -> Result<(), AssemblyError> {
        let pool = self.pool.as_ref().ok_or(PoolError::Disconnected)?;
        if self.cc_state != CcState::Yes {
            for copy in &mut self.compact_copies {
                *copy = Some(master.copy_pattern());
            }
            self.cc_state = CcState::Yes;
            debug!(nnz = master.nnz(), "per-thread compact copies created");
        }
        let mut dispatched = 0;
        for (w, copy) in self.compact_copies.iter_mut().enumerate() {
            let matrix = copy.take().unwrap_or_else(|| master.copy_pattern());
            pool.dispatch(
                w,
                AssemblyOp::JacobianCompact {
                    input: Arc::clone(&input),
                    matrix,
                },
            )?;
            dispatched += 1;
        }
        let mut outcome = jacobian_task(&self.elements, &mut self.scratch, &input, &mut *master);
        let mut copies = Vec::with_capacity(dispatched);
        for report in pool.join(dispatched)? {
            let report = report?;
            outcome = outcome.merge(report.outcome);
            copies.push(report.compact);
        }

        if outcome == TaskOutcome::RebuildMatrix {
            debug!("compact pattern outdated, per-thread copies discarded");
            self.cc_state = CcState::No;
            return Err(AssemblyError::RebuildMatrix);
        }
        for (w, copy) in copies.into_iter().enumerate() {
            if let Some(copy) = &copy {
                master.add_values_from(copy)?;
            }
            self.compact_copies[w] = copy;
        }
        outcome.into_result()
    }

    /// Add the residual into `out`, rows shifted by `shift`.
    pub fn assemble_residual(
        &mut self,
        out: &mut [f64],
        x: &[f64],
        xp: &[f64],
        coef: f64,
        shift: AssemblyShift,
    ) -> Result<(), AssemblyError> {
        let input = self.input(out.len(), x, xp, JacobianPass::new(coef).with_shift(shift));
        self.elements.reset_access();

        let Some(pool) = self.pool.as_ref() else {
            return residual_task(&self.elements, &mut self.scratch, &input, out).into_result();
        };
        for w in 0..pool.workers() {
            let mut buffer = std::mem::take(&mut self.residual_buffers[w]);
            buffer.clear();
            buffer.resize(out.len(), 0.0);
            pool.dispatch(
                w,
                AssemblyOp::Residual {
                    input: Arc::clone(&input),
                    buffer,
                },
            )?;
        }
        let mut outcome = residual_task(&self.elements, &mut self.scratch, &input, out);
        for (w, report) in pool.join(pool.workers())?.into_iter().enumerate() {
            let report = report?;
            outcome = outcome.merge(report.outcome);
            if let Some(buffer) = report.residual {
                for (dst, src) in out.iter_mut().zip(&buffer) {
                    *dst += src;
                }
                self.residual_buffers[w] = buffer;
            }
        }
        outcome.into_result()
    }

    /// Notify every element that the step converged.
    pub fn after_convergence(&self, x: &[f64], xp: &[f64]) {
        self.elements.for_each(|e| e.after_convergence(x, xp));
    }
}
