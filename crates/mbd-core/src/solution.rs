//! Solution managers: the linear-system side of a Newton iteration.
//!
//! A manager owns the Jacobian handler, the residual buffer and the
//! solution buffer. The Newton loop resets and fills them through the
//! accessors below and calls [`SolutionManager::solve`], which factors the
//! matrix when it changed since the last factorization and then solves
//! for the current residual.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::convergence::NonlinearSolverTest;
use crate::error::{ConfigError, SolverError};
use crate::matrix::{CompactMatrix, MatrixHandler, NaiveMatrix, PatternMatrix};
use crate::naive::{NaiveConfig, NaiveSolver};
use crate::schur::{DomainPartition, SchurSolutionManager};
use crate::solver::{create_solver, LinearSolver, SolverType};

pub trait SolutionManager: Send {
    fn name(&self) -> &'static str;

    fn size(&self) -> usize;

    /// Zero the Jacobian before a new assembly; drops the factorization.
    fn matrix_reset(&mut self);

    /// Go back to pattern discovery; used after a rebuild request.
    fn matrix_initialize(&mut self);

    fn matrix(&mut self) -> &mut dyn MatrixHandler;

    fn residual(&self) -> &[f64];

    fn residual_mut(&mut self) -> &mut [f64];

    fn solution(&self) -> &[f64];

    /// Solve `J x = r` for the current residual.
    fn solve(&mut self) -> Result<(), SolverError>;

    /// Test value of the residual buffer.
    fn residual_test(&self, test: &dyn NonlinearSolverTest) -> f64 {
        test.make_test(self.residual())
    }
}

/// Naive matrix factored by the naive kernel.
pub struct NaiveSolutionManager {
    matrix: NaiveMatrix,
    solver: NaiveSolver,
    residual: Vec<f64>,
    solution: Vec<f64>,
}

impl NaiveSolutionManager {
    pub fn new(n: usize, threads: usize, config: NaiveConfig) -> Self {
        Self {
            matrix: NaiveMatrix::new(n),
            solver: NaiveSolver::new(threads, config),
            residual: vec![0.0; n],
            solution: vec![0.0; n],
        }
    }

    pub fn threads(&self) -> usize {
        self.solver.threads()
    }

    pub fn factor_count(&self) -> usize {
        self.solver.factor_count
    }
}

impl SolutionManager for NaiveSolutionManager {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn size(&self) -> usize {
        self.residual.len()
    }

    fn matrix_reset(&mut self) {
        self.matrix.reset();
        self.solver.invalidate();
    }

    fn matrix_initialize(&mut self) {
        self.matrix_reset();
    }

    fn matrix(&mut self) -> &mut dyn MatrixHandler {
        &mut self.matrix
    }

    fn residual(&self) -> &[f64] {
        &self.residual
    }

    fn residual_mut(&mut self) -> &mut [f64] {
        &mut self.residual
    }

    fn solution(&self) -> &[f64] {
        &self.solution
    }

    fn solve(&mut self) -> Result<(), SolverError> {
        if !self.solver.is_factored() {
            trace!(nnz = self.matrix.nnz(), "naive factor");
            self.solver.factor(&mut self.matrix)?;
        }
        self.solver
            .solve(&self.matrix, &self.residual, &mut self.solution)?;
        Ok(())
    }
}

enum CompactState {
    Pattern(PatternMatrix),
    Compact(CompactMatrix),
}

/// Pattern discovery on the first pass, then a frozen CSC matrix handed
/// to a [`LinearSolver`] backend.
pub struct CompactSolutionManager {
    n: usize,
    state: CompactState,
    solver: Box<dyn LinearSolver>,
    factored: bool,
    residual: Vec<f64>,
    solution: Vec<f64>,
    /// Statistics
    pub rebuilds: usize,
}

impl CompactSolutionManager {
    pub fn new(n: usize, solver_type: SolverType) -> Self {
        Self::with_solver(n, create_solver(solver_type, n))
    }

    pub fn with_solver(n: usize, mut solver: Box<dyn LinearSolver>) -> Self {
        solver.prepare(n);
        Self {
            n,
            state: CompactState::Pattern(PatternMatrix::new(n)),
            solver,
            factored: false,
            residual: vec![0.0; n],
            solution: vec![0.0; n],
            rebuilds: 0,
        }
    }

    pub fn is_frozen(&self) -> bool {
        matches!(self.state, CompactState::Compact(_))
    }

    pub fn solver_name(&self) -> &'static str {
        self.solver.name()
    }
}

impl SolutionManager for CompactSolutionManager {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn size(&self) -> usize {
        self.n
    }

    fn matrix_reset(&mut self) {
        match &mut self.state {
            CompactState::Pattern(m) => m.reset(),
            CompactState::Compact(m) => m.reset(),
        }
        self.factored = false;
    }

    fn matrix_initialize(&mut self) {
        debug!(n = self.n, "compact pattern reinitialized");
        self.state = CompactState::Pattern(PatternMatrix::new(self.n));
        self.solver.reset_pattern();
        self.factored = false;
        self.rebuilds += 1;
    }

    fn matrix(&mut self) -> &mut dyn MatrixHandler {
        match &mut self.state {
            CompactState::Pattern(m) => m,
            CompactState::Compact(m) => m,
        }
    }

    fn residual(&self) -> &[f64] {
        &self.residual
    }

    fn residual_mut(&mut self) -> &mut [f64] {
        &mut self.residual
    }

    fn solution(&self) -> &[f64] {
        &self.solution
    }

    fn solve(&mut self) -> Result<(), SolverError> {
        if let CompactState::Pattern(pattern) = &mut self.state {
            let compact = pattern.freeze();
            debug!(nnz = compact.nnz(), "compact pattern frozen");
            self.state = CompactState::Compact(compact);
            self.solver.reset_pattern();
            self.factored = false;
        }
        let CompactState::Compact(matrix) = &self.state else {
            return Err(SolverError::FactorFailed);
        };
        if !self.factored {
            let (ap, ai, ax) = matrix.csc();
            self.solver.analyze(ap, ai)?;
            self.solver.factor(ap, ai, ax)?;
            self.factored = true;
        }
        self.solution.copy_from_slice(&self.residual);
        self.solver.solve(&mut self.solution)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolutionManagerKind {
    #[default]
    Naive,
    Compact,
    Schur,
}

impl SolutionManagerKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "naive" => Some(Self::Naive),
            "compact" | "cc" => Some(Self::Compact),
            "schur" => Some(Self::Schur),
            _ => None,
        }
    }
}

/// Everything needed to build a solution manager.
#[derive(Debug, Clone, Default)]
pub struct SolutionConfig {
    pub kind: SolutionManagerKind,
    /// Threads of the naive kernels.
    pub threads: usize,
    pub solver: SolverType,
    pub naive: NaiveConfig,
    /// Required by the Schur manager.
    pub partition: Option<DomainPartition>,
}

pub fn create_solution_manager(
    n: usize,
    config: &SolutionConfig,
) -> Result<Box<dyn SolutionManager>, ConfigError> {
    if n == 0 {
        return Err(ConfigError::Invalid("empty linear system".into()));
    }
    let threads = config.threads.max(1);
    match config.kind {
        SolutionManagerKind::Naive => Ok(Box::new(NaiveSolutionManager::new(
            n,
            threads,
            config.naive.clone(),
        ))),
        SolutionManagerKind::Compact => Ok(Box::new(CompactSolutionManager::new(n, config.solver))),
        SolutionManagerKind::Schur => {
            let partition = config.partition.clone().ok_or_else(|| {
                ConfigError::Invalid("schur solution manager needs a domain partition".into())
            })?;
            if partition.size() != n {
                return Err(ConfigError::Invalid(format!(
                    "domain partition covers {} dofs, system has {n}",
                    partition.size()
                )));
            }
            Ok(Box::new(SchurSolutionManager::new(partition, config.naive.clone())?))
        }
    }
}
