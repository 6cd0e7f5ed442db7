//! Two-stage collocation scheme with nodes `0`, `c = 1 + θ` and `1`,
//! `θ = -ρ/(1+ρ)`.
//!
//! Both the stage derivative and the end derivative are unknowns, so one
//! step solves a `2N` system laid out as
//!
//! ```text
//! [ ∂F/∂x' + jx00·∂F/∂x        jx01·∂F/∂x        ] [ d_c ]   [ -F(t_c) ]
//! [        jx10·∂F/∂x    ∂F/∂x' + jx11·∂F/∂x     ] [ d_1 ] = [ -F(t_1) ]
//! ```
//!
//! The off-diagonal blocks come from difference passes of the elements.

use tracing::{debug, info_span};

use super::{
    check_step, modified_test_scale, SpectralRadius, State, StepChange, StepContext,
    StepIntegrator,
};
use crate::assembly::JacobianPass;
use crate::convergence::NonlinearSolverTest;
use crate::error::{AssemblyError, IntegratorError};
use crate::matrix::{AssemblyShift, MatrixHandler};
use crate::model::{DofOrder, Model};
use crate::newton::{NewtonOutcome, NonlinearProblem};

/// Smallest admissible spectral radius; `ρ = 0` puts the stage at `t_0`.
const MIN_RHO: f64 = 1e-6;

#[derive(Debug, Clone)]
pub struct ThirdOrderIntegrator {
    rho: SpectralRadius,
    time: f64,
    theta: f64,
    dt: f64,
    /// End-point quadrature weights on the nodes `0, c, 1`.
    w: [f64; 3],
    /// State sensitivities `∂X_i/∂XP_j`, `h` included.
    jx: [[f64; 2]; 2],
    /// Weight of `XP_0` in the stage state.
    m0: f64,
    modified_test: bool,
    stage: State,
}

impl ThirdOrderIntegrator {
    pub fn new(rho: impl Into<SpectralRadius>) -> Self {
        Self {
            rho: rho.into(),
            time: 0.0,
            theta: 0.0,
            dt: 0.0,
            w: [0.0; 3],
            jx: [[0.0; 2]; 2],
            m0: 0.0,
            modified_test: false,
            stage: State::zeros(0),
        }
    }

    pub fn with_modified_test(mut self, enabled: bool) -> Self {
        self.modified_test = enabled;
        self
    }

    pub fn theta(&self) -> f64 {
        self.theta
    }

    pub fn weights(&self) -> [f64; 3] {
        self.w
    }

    pub fn jx(&self) -> [[f64; 2]; 2] {
        self.jx
    }

    /// Converged stage state of the last step.
    pub fn stage(&self) -> &State {
        &self.stage
    }

    /// Constant-derivative predictor for the stage and the end point.
    fn predict(&mut self, dofs: &[DofOrder], prev: &State, end: &mut State) {
        let h = self.dt;
        let c = 1.0 + self.theta;
        self.stage.clone_from(prev);
        end.clone_from(prev);
        for (i, order) in dofs.iter().enumerate() {
            if *order == DofOrder::Differential {
                self.stage.x[i] = prev.x[i] + c * h * prev.xp[i];
                end.x[i] = prev.x[i] + h * prev.xp[i];
            }
        }
    }
}

struct ThirdOrderProblem<'a> {
    model: &'a mut Model,
    stage: &'a mut State,
    end: &'a mut State,
    jx: [[f64; 2]; 2],
    modified_test: bool,
}

impl NonlinearProblem for ThirdOrderProblem<'_> {
    fn residual(&mut self, out: &mut [f64]) -> Result<(), AssemblyError> {
        let n = self.model.size();
        self.model.assemble_residual(
            out,
            &self.stage.x,
            &self.stage.xp,
            self.jx[0][0],
            AssemblyShift::default(),
        )?;
        self.model.assemble_residual(
            out,
            &self.end.x,
            &self.end.xp,
            self.jx[1][1],
            AssemblyShift::block(n, 0),
        )
    }

    fn jacobian(&mut self, matrix: &mut dyn MatrixHandler) -> Result<(), AssemblyError> {
        let n = self.model.size();
        let jx = self.jx;
        let (sx, sxp) = (&self.stage.x, &self.stage.xp);
        let (ex, exp) = (&self.end.x, &self.end.xp);

        self.model
            .assemble_jacobian(matrix, sx, sxp, JacobianPass::new(jx[0][0]))?;
        self.model.assemble_jacobian(
            matrix,
            sx,
            sxp,
            JacobianPass::difference(AssemblyShift::block(0, n).scaled(jx[0][1])),
        )?;
        self.model.assemble_jacobian(
            matrix,
            ex,
            exp,
            JacobianPass::difference(AssemblyShift::block(n, 0).scaled(jx[1][0])),
        )?;
        self.model.assemble_jacobian(
            matrix,
            ex,
            exp,
            JacobianPass::new(jx[1][1]).with_shift(AssemblyShift::block(n, n)),
        )
    }

    fn update(&mut self, delta: &[f64]) {
        let n = self.model.size();
        let jx = self.jx;
        for i in 0..n {
            let (dc, d1) = (delta[i], delta[n + i]);
            match self.model.dof_order(i) {
                DofOrder::Differential => {
                    self.stage.xp[i] += dc;
                    self.end.xp[i] += d1;
                    self.stage.x[i] += jx[0][0] * dc + jx[0][1] * d1;
                    self.end.x[i] += jx[1][0] * dc + jx[1][1] * d1;
                }
                DofOrder::Algebraic => {
                    self.stage.x[i] += dc;
                    self.end.x[i] += d1;
                    self.stage.xp[i] += jx[0][0] * dc;
                    self.end.xp[i] += jx[1][1] * d1;
                }
            }
        }
    }

    fn test_scale(&self, test: &dyn NonlinearSolverTest) -> f64 {
        if !self.modified_test {
            return 1.0;
        }
        let dofs = self.model.dofs();
        let stage = modified_test_scale(dofs, &self.stage.xp, test);
        let end = modified_test_scale(dofs, &self.end.xp, test);
        1.0 / (1.0 / stage + 1.0 / end - 1.0)
    }
}

impl StepIntegrator for ThirdOrderIntegrator {
    fn name(&self) -> &'static str {
        "third-order"
    }

    fn steps(&self) -> usize {
        1
    }

    fn unknown_states(&self) -> usize {
        2
    }

    fn set_coef(&mut self, dt: f64, _alpha: f64, _change: StepChange) -> Result<(), IntegratorError> {
        let rho = self.rho.checked(self.time, MIN_RHO)?;
        let theta = -rho / (1.0 + rho);
        let one_rho = 1.0 + rho;

        self.dt = dt;
        self.theta = theta;
        self.w = [
            (2.0 + 3.0 * theta) / (6.0 * (1.0 + theta)),
            -1.0 / (6.0 * theta * (1.0 + theta)),
            (1.0 + 3.0 * theta) / (6.0 * theta),
        ];
        self.jx = [
            [
                (1.0 + 3.0 * rho) / (6.0 * rho * one_rho) * dt,
                -1.0 / (6.0 * rho * one_rho * one_rho) * dt,
            ],
            [
                one_rho * one_rho / (6.0 * rho) * dt,
                (2.0 * rho - 1.0) / (6.0 * rho) * dt,
            ],
        ];
        self.m0 = 1.0 / one_rho - (self.jx[0][0] + self.jx[0][1]) / dt;
        Ok(())
    }

    fn set_drive_time(&mut self, time: f64) {
        self.time = time;
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<NewtonOutcome, IntegratorError> {
        let span = info_span!("step", scheme = "third-order", dt = ctx.dt);
        let _enter = span.enter();

        check_step(ctx)?;
        ctx.history.require(1)?;
        let n = ctx.model.size();
        if ctx.sm.size() != 2 * n {
            return Err(IntegratorError::SizeMismatch {
                expected: 2 * n,
                got: ctx.sm.size(),
            });
        }
        self.set_coef(ctx.dt, ctx.alpha, ctx.change)?;
        let Some(prev) = ctx.history.get(0) else {
            return Err(IntegratorError::MissingHistory { needed: 1, got: 0 });
        };
        self.predict(ctx.model.dofs(), prev, ctx.current);

        let mut problem = ThirdOrderProblem {
            model: &mut *ctx.model,
            stage: &mut self.stage,
            end: &mut *ctx.current,
            jx: self.jx,
            modified_test: self.modified_test,
        };
        let outcome = ctx.solver.solve(&mut problem, &mut *ctx.sm)?;
        debug!(
            iterations = outcome.iterations(),
            m0 = self.m0,
            "third order step converged"
        );

        ctx.model.after_convergence(&ctx.current.x, &ctx.current.xp);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_weights_integrate_quadratics() {
        let mut integrator = ThirdOrderIntegrator::new(0.6);
        integrator.set_coef(1.0, 1.0, StepChange::NewStep).unwrap();
        let c = 1.0 + integrator.theta();
        let w = integrator.weights();
        // ∫_0^1 s^k ds on the nodes 0, c, 1
        assert_relative_eq!(w[0] + w[1] + w[2], 1.0, epsilon = 1e-14);
        assert_relative_eq!(w[1] * c + w[2], 0.5, epsilon = 1e-14);
        assert_relative_eq!(w[1] * c * c + w[2], 1.0 / 3.0, epsilon = 1e-14);

        // end row of jx matches the weights
        let jx = integrator.jx();
        assert_relative_eq!(jx[1][0], w[1], epsilon = 1e-14);
        assert_relative_eq!(jx[1][1], w[2], epsilon = 1e-14);
    }

    #[test]
    fn test_stage_row_integrates_to_stage() {
        let mut integrator = ThirdOrderIntegrator::new(0.4);
        integrator.set_coef(1.0, 1.0, StepChange::NewStep).unwrap();
        let c = 1.0 + integrator.theta();
        let jx = integrator.jx();
        let m0 = integrator.m0;
        // ∫_0^c s^k ds
        assert_relative_eq!(m0 + jx[0][0] + jx[0][1], c, epsilon = 1e-14);
        assert_relative_eq!(jx[0][0] * c + jx[0][1], c * c / 2.0, epsilon = 1e-14);
        assert_relative_eq!(jx[0][0] * c * c + jx[0][1], c * c * c / 3.0, epsilon = 1e-14);
    }

    #[test]
    fn test_zero_radius_rejected() {
        let mut integrator = ThirdOrderIntegrator::new(0.0);
        assert!(matches!(
            integrator.set_coef(0.1, 1.0, StepChange::NewStep),
            Err(IntegratorError::InvalidRadius(_))
        ));
    }
}
