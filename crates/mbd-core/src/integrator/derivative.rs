use tracing::{debug, info_span};

use super::schemes::StepProblem;
use super::{StepChange, StepContext, StepIntegrator};
use crate::error::IntegratorError;
use crate::newton::NewtonOutcome;

/// Coefficient of the initial-derivative solve.
pub const DEFAULT_DERIVATIVE_COEF: f64 = 1e-6;

/// Computes consistent derivatives at the current time: the state moves
/// only by `coef` times the derivative increment, and nothing is predicted.
#[derive(Debug, Clone)]
pub struct DerivativeSolver {
    coef: f64,
}

impl DerivativeSolver {
    pub fn new(coef: f64) -> Self {
        Self { coef }
    }

    pub fn coef(&self) -> f64 {
        self.coef
    }
}

impl Default for DerivativeSolver {
    fn default() -> Self {
        Self::new(DEFAULT_DERIVATIVE_COEF)
    }
}

impl StepIntegrator for DerivativeSolver {
    fn name(&self) -> &'static str {
        "derivatives"
    }

    fn steps(&self) -> usize {
        0
    }

    fn unknown_states(&self) -> usize {
        1
    }

    fn set_coef(&mut self, _dt: f64, _alpha: f64, _change: StepChange) -> Result<(), IntegratorError> {
        Ok(())
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<NewtonOutcome, IntegratorError> {
        let span = info_span!("derivatives", coef = self.coef);
        let _enter = span.enter();

        let n = ctx.model.size();
        if ctx.current.len() != n || ctx.current.xp.len() != n {
            return Err(IntegratorError::SizeMismatch {
                expected: n,
                got: ctx.current.len(),
            });
        }
        let mut problem = StepProblem {
            model: &mut *ctx.model,
            state: &mut *ctx.current,
            b0: self.coef,
            b0_alg: self.coef,
            modified_test: false,
        };
        let outcome = ctx.solver.solve(&mut problem, &mut *ctx.sm)?;
        debug!(iterations = outcome.iterations(), "initial derivatives computed");

        ctx.model.after_convergence(&ctx.current.x, &ctx.current.xp);
        Ok(outcome)
    }
}
