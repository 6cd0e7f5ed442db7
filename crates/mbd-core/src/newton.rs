use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, trace, warn};

use crate::convergence::{create_test, NonlinearSolverTest, TestKind};
use crate::error::{AssemblyError, ConfigError, NonlinearError};
use crate::matrix::MatrixHandler;
use crate::solution::SolutionManager;

/// A system `F(x) = 0` seen by the Newton loop.
///
/// `residual` adds `-F` into a zeroed buffer, `jacobian` adds `∂F/∂x` into
/// a reset handler and `update` applies the solved increment.
pub trait NonlinearProblem {
    fn residual(&mut self, out: &mut [f64]) -> Result<(), AssemblyError>;

    fn jacobian(&mut self, matrix: &mut dyn MatrixHandler) -> Result<(), AssemblyError>;

    fn update(&mut self, delta: &[f64]);

    /// Factor applied to the residual test value.
    fn test_scale(&self, _test: &dyn NonlinearSolverTest) -> f64 {
        1.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonConfig {
    pub tolerance: f64,
    /// Iterations allowed past the first one: the residual is tested after
    /// up to `max_iterations + 1` solves before giving up.
    pub max_iterations: usize,
    /// Zero disables the solution test.
    pub solution_tolerance: f64,
    /// Rebuild the Jacobian at every iteration.
    pub true_newton: bool,
    pub iterations_before_assembly: usize,
    /// Carry the iteration count, hence the Jacobian age, across solves.
    pub keep_jacobian: bool,
    /// Force a Jacobian when the residual reports a structural change.
    pub honor_jacobian_request: bool,
    /// Consecutive pattern rebuilds allowed while assembling one Jacobian.
    pub max_rebuild_retries: usize,
    pub print_residual: bool,
    pub print_solution: bool,
    pub residual_test: TestKind,
    pub solution_test: TestKind,
    /// Multiply test entries by the per-dof scale.
    pub scale_tests: bool,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            tolerance: 1e-6,
            max_iterations: 20,
            solution_tolerance: 0.0,
            true_newton: true,
            iterations_before_assembly: 1,
            keep_jacobian: false,
            honor_jacobian_request: false,
            max_rebuild_retries: 3,
            print_residual: false,
            print_solution: false,
            residual_test: TestKind::Norm,
            solution_test: TestKind::Norm,
            scale_tests: false,
        }
    }
}

impl NewtonConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.tolerance >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "residual tolerance {} must be non-negative",
                self.tolerance
            )));
        }
        if !(self.solution_tolerance >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "solution tolerance {} must be non-negative",
                self.solution_tolerance
            )));
        }
        if self.iterations_before_assembly == 0 {
            return Err(ConfigError::Invalid(
                "iterations before assembly must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NewtonOutcome {
    Converged { iterations: usize, residual: f64 },
    ConvergedOnSolution { iterations: usize, solution: f64 },
}

impl NewtonOutcome {
    pub fn iterations(&self) -> usize {
        match *self {
            NewtonOutcome::Converged { iterations, .. }
            | NewtonOutcome::ConvergedOnSolution { iterations, .. } => iterations,
        }
    }
}

pub trait NonlinearSolver: Send {
    fn name(&self) -> &'static str;

    fn solve(
        &mut self,
        problem: &mut dyn NonlinearProblem,
        sm: &mut dyn SolutionManager,
    ) -> Result<NewtonOutcome, NonlinearError>;

    fn total_jacobians(&self) -> usize;

    /// Forget the Jacobian age; the next iteration assembles.
    fn reset(&mut self);
}

pub struct NewtonRaphsonSolver {
    config: NewtonConfig,
    residual_test: Box<dyn NonlinearSolverTest>,
    solution_test: Box<dyn NonlinearSolverTest>,
    performed: usize,
    jacobian_valid: bool,
    /// Statistics
    pub total_jacobians: usize,
    pub total_iterations: usize,
}

impl NewtonRaphsonSolver {
    pub fn new(config: NewtonConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if config.true_newton && config.iterations_before_assembly > 1 {
            warn!(
                every = config.iterations_before_assembly,
                "true Newton overrides iterations before assembly"
            );
        }
        Ok(Self {
            residual_test: create_test(config.residual_test, None),
            solution_test: create_test(config.solution_test, None),
            config,
            performed: 0,
            jacobian_valid: false,
            total_jacobians: 0,
            total_iterations: 0,
        })
    }

    /// Per-dof scale for the tests; ignored unless `scale_tests` is set.
    pub fn with_scale(mut self, scale: &[f64]) -> Self {
        if self.config.scale_tests {
            self.residual_test = create_test(self.config.residual_test, Some(scale.to_vec()));
            self.solution_test = create_test(self.config.solution_test, Some(scale.to_vec()));
        }
        self
    }

    pub fn config(&self) -> &NewtonConfig {
        &self.config
    }

    pub fn performed_iterations(&self) -> usize {
        self.performed
    }

    fn assemble_jacobian(
        &mut self,
        problem: &mut dyn NonlinearProblem,
        sm: &mut dyn SolutionManager,
    ) -> Result<(), NonlinearError> {
        // the reset drops the previous factorization
        self.jacobian_valid = false;
        sm.matrix_reset();
        let mut retries = 0;
        loop {
            match problem.jacobian(sm.matrix()) {
                Ok(()) => break,
                Err(AssemblyError::RebuildMatrix) => {
                    retries += 1;
                    if retries > self.config.max_rebuild_retries {
                        return Err(NonlinearError::RebuildLimit { retries });
                    }
                    debug!(retries, "rebuilding matrix");
                    sm.matrix_initialize();
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.total_jacobians += 1;
        self.jacobian_valid = true;
        Ok(())
    }
}

impl NonlinearSolver for NewtonRaphsonSolver {
    fn name(&self) -> &'static str {
        "newton-raphson"
    }

    fn solve(
        &mut self,
        problem: &mut dyn NonlinearProblem,
        sm: &mut dyn SolutionManager,
    ) -> Result<NewtonOutcome, NonlinearError> {
        let span = info_span!("newton", size = sm.size(), manager = sm.name());
        let _enter = span.enter();

        if !self.config.keep_jacobian {
            self.performed = 0;
        }
        let mut count = 0;
        let mut force_jacobian = false;

        loop {
            let residual = sm.residual_mut();
            residual.fill(0.0);
            match problem.residual(residual) {
                Ok(()) => {}
                Err(AssemblyError::ChangedStructure) => {
                    if self.config.honor_jacobian_request {
                        force_jacobian = true;
                    }
                }
                Err(err) => return Err(err.into()),
            }
            if self.config.print_residual {
                info!(iteration = count, residual = ?sm.residual(), "residual");
            }

            let test = self.residual_test.as_ref();
            let err = sm.residual_test(test) * problem.test_scale(test);
            trace!(iteration = count, err, "residual test");
            if err < self.config.tolerance {
                debug!(iterations = count, err, "converged");
                return Ok(NewtonOutcome::Converged {
                    iterations: count,
                    residual: err,
                });
            }
            if !err.is_finite() {
                return Err(NonlinearError::Diverged(err));
            }
            if count > self.config.max_iterations {
                return Err(NonlinearError::NoConvergence {
                    iterations: count,
                    residual: err,
                });
            }
            count += 1;
            self.total_iterations += 1;

            if self.config.true_newton
                || self.performed % self.config.iterations_before_assembly == 0
                || force_jacobian
                || !self.jacobian_valid
            {
                self.assemble_jacobian(problem, sm)?;
                force_jacobian = false;
            }
            self.performed += 1;

            if let Err(err) = sm.solve() {
                self.jacobian_valid = false;
                return Err(err.into());
            }
            if self.config.print_solution {
                info!(iteration = count, solution = ?sm.solution(), "solution");
            }
            problem.update(sm.solution());

            if self.config.solution_tolerance > 0.0 {
                let sol_err = self.solution_test.make_test(sm.solution());
                trace!(iteration = count, sol_err, "solution test");
                if sol_err < self.config.solution_tolerance {
                    return Ok(NewtonOutcome::ConvergedOnSolution {
                        iterations: count,
                        solution: sol_err,
                    });
                }
            }
        }
    }

    fn total_jacobians(&self) -> usize {
        self.total_jacobians
    }

    fn reset(&mut self) {
        self.performed = 0;
        self.jacobian_valid = false;
    }
}
