//! Error types for the solving pipeline.
//!
//! Each layer owns one enum; the outer layers wrap the inner ones with
//! `#[from]` so `?` carries a factorization failure all the way up to the
//! step driver without losing the column that failed.

use thiserror::Error;

/// Errors raised by matrix handlers while accumulating entries.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum MatrixError {
    #[error("entry ({row}, {col}) outside a {size}x{size} matrix")]
    OutOfBounds { row: usize, col: usize, size: usize },

    /// A compact matrix received an entry outside its frozen pattern.
    #[error("entry ({row}, {col}) is not in the compact pattern, matrix must be rebuilt")]
    RebuildMatrix { row: usize, col: usize },

    /// An entry couples the local unknowns of two different domains.
    #[error("entry ({row}, {col}) couples local dofs of domains {first} and {second}")]
    DomainCoupling {
        row: usize,
        col: usize,
        first: usize,
        second: usize,
    },

    #[error("matrix size mismatch: expected {expected}, got {got}")]
    SizeMismatch { expected: usize, got: usize },
}

/// Errors raised by the naive factorization and solve kernels.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NaiveError {
    /// No remaining row has an entry in this column (ENULCOL).
    #[error("null column {col}")]
    NullColumn { col: usize },

    /// No remaining row passes the pivot threshold in this column (ENOPIV).
    #[error("no acceptable pivot in column {col}")]
    NoPivot { col: usize },

    #[error("vector length {got} does not match matrix size {expected}")]
    SizeMismatch { expected: usize, got: usize },

    #[error("matrix has not been factored")]
    NotFactored,

    /// A spin wait exceeded the configured diagnostic deadline.
    #[error("{what} {index} not posted before the spin deadline")]
    SyncTimeout { what: &'static str, index: usize },

    #[error("naive worker thread {task} panicked")]
    TaskPanicked { task: usize },

    #[error("failed to start naive worker thread {task}")]
    SpawnFailed { task: usize },
}

/// Errors raised by linear solver backends.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolverError {
    #[error("symbolic analysis failed")]
    AnalyzeFailed,

    #[error("numerical factorization failed")]
    FactorFailed,

    #[error("solve step failed")]
    SolveFailed,

    #[error("singular matrix: zero pivot at row/column {pivot}")]
    SingularMatrix { pivot: usize },

    #[error("invalid matrix: {reason}")]
    InvalidMatrix { reason: String },

    #[error(transparent)]
    Naive(#[from] NaiveError),

    #[error("interface system of domain decomposition failed: {0}")]
    Interface(String),
}

/// Errors raised by a single element while filling its scratch buffers.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ElementError {
    /// The element changed which equations are active.
    #[error("element changed the equation structure")]
    ChangedStructure,

    #[error("division by zero: {0}")]
    DivideByZero(String),

    #[error(transparent)]
    Matrix(#[from] MatrixError),
}

/// Errors raised by the fixed worker pool.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PoolError {
    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: usize },

    #[error("failed to start worker {worker}")]
    SpawnFailed { worker: usize },

    #[error("worker pool disconnected")]
    Disconnected,
}

/// Errors raised by a residual or Jacobian assembly pass.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AssemblyError {
    /// At least one element reported a structural change during the pass.
    #[error("equation structure changed during assembly")]
    ChangedStructure,

    /// The compact pattern no longer covers the assembled entries.
    #[error("matrix pattern must be rebuilt")]
    RebuildMatrix,

    #[error("element {element}: division by zero: {reason}")]
    DivideByZero { element: u32, reason: String },

    #[error(transparent)]
    Matrix(MatrixError),

    #[error(transparent)]
    Naive(#[from] NaiveError),

    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl From<MatrixError> for AssemblyError {
    fn from(err: MatrixError) -> Self {
        match err {
            MatrixError::RebuildMatrix { .. } => AssemblyError::RebuildMatrix,
            other => AssemblyError::Matrix(other),
        }
    }
}

/// Errors (and the divergence outcome) of the nonlinear solver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NonlinearError {
    #[error("no convergence after {iterations} iterations (residual test {residual:.3e})")]
    NoConvergence { iterations: usize, residual: f64 },

    /// The backend asked for a pattern rebuild more often than allowed.
    #[error("matrix rebuild requested {retries} consecutive times")]
    RebuildLimit { retries: usize },

    #[error("residual test is not finite ({0})")]
    Diverged(f64),

    #[error(transparent)]
    Assembly(#[from] AssemblyError),

    #[error(transparent)]
    Solver(#[from] SolverError),
}

/// Errors raised while advancing a time step.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum IntegratorError {
    #[error("invalid time step {0}")]
    InvalidStep(f64),

    #[error("spectral radius {0} outside the admissible range")]
    InvalidRadius(f64),

    #[error("state size {got} does not match {expected} dofs")]
    SizeMismatch { expected: usize, got: usize },

    #[error("state history holds {got} previous states, scheme needs {needed}")]
    MissingHistory { needed: usize, got: usize },

    #[error(transparent)]
    Nonlinear(#[from] NonlinearError),
}

/// Invalid configuration detected at construction time.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level error of a simulation run.
#[derive(Debug, Error)]
pub enum MbdError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("step {step} at t={time:.6e}: {source}")]
    Step {
        step: usize,
        time: f64,
        #[source]
        source: IntegratorError,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience alias for `Result<T, MbdError>`.
pub type MbdResult<T> = Result<T, MbdError>;
