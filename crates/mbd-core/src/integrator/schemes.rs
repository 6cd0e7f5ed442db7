//! One- and two-step schemes sharing the predictor-corrector driver
//! [`StepNIntegrator`].

use tracing::{debug, info_span, trace};

use super::{
    check_step, modified_test_scale, SpectralRadius, State, StateHistory, StepChange,
    StepContext, StepIntegrator,
};
use crate::assembly::JacobianPass;
use crate::convergence::NonlinearSolverTest;
use crate::error::{AssemblyError, IntegratorError};
use crate::matrix::{AssemblyShift, MatrixHandler};
use crate::model::{DofOrder, Model};
use crate::newton::{NewtonOutcome, NonlinearProblem};

/// Raw slots of one dof at `t_{n-1}` and `t_{n-2}`.
///
/// For an algebraic dof `xp1`/`xp2` hold the integral of the variable.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Past {
    pub x1: f64,
    pub x2: f64,
    pub xp1: f64,
    pub xp2: f64,
}

/// Coefficients and predictor formulas of one scheme.
pub trait StepScheme: Send {
    fn name(&self) -> &'static str;

    fn steps(&self) -> usize;

    /// Set the coefficients for a step; returns `(b0, b0_alg)`.
    fn set_coef(
        &mut self,
        dt: f64,
        alpha: f64,
        change: StepChange,
        time: f64,
    ) -> Result<(f64, f64), IntegratorError>;

    /// Derivative of a differential dof.
    fn pred_der(&self, p: &Past) -> f64;

    /// State of a differential dof, given the predicted derivative.
    fn pred_state(&self, p: &Past, xp: f64) -> f64;

    /// Value of an algebraic dof.
    fn pred_der_alg(&self, p: &Past) -> f64;

    /// Integral of an algebraic dof, given its predicted value.
    fn pred_state_alg(&self, p: &Past, x: f64) -> f64;
}

#[derive(Debug, Clone, Default)]
pub struct ImplicitEuler {
    b0: f64,
}

impl StepScheme for ImplicitEuler {
    fn name(&self) -> &'static str {
        "implicit-euler"
    }

    fn steps(&self) -> usize {
        1
    }

    fn set_coef(
        &mut self,
        dt: f64,
        alpha: f64,
        _change: StepChange,
        _time: f64,
    ) -> Result<(f64, f64), IntegratorError> {
        self.b0 = dt * alpha;
        Ok((self.b0, self.b0))
    }

    fn pred_der(&self, p: &Past) -> f64 {
        p.xp1
    }

    fn pred_state(&self, p: &Past, xp: f64) -> f64 {
        p.x1 + self.b0 * xp
    }

    fn pred_der_alg(&self, p: &Past) -> f64 {
        p.x1
    }

    fn pred_state_alg(&self, _p: &Past, x: f64) -> f64 {
        self.b0 * x
    }
}

#[derive(Debug, Clone, Default)]
pub struct CrankNicolson {
    b0: f64,
}

impl StepScheme for CrankNicolson {
    fn name(&self) -> &'static str {
        "crank-nicolson"
    }

    fn steps(&self) -> usize {
        1
    }

    fn set_coef(
        &mut self,
        dt: f64,
        alpha: f64,
        _change: StepChange,
        _time: f64,
    ) -> Result<(f64, f64), IntegratorError> {
        self.b0 = dt * alpha / 2.0;
        Ok((self.b0, self.b0))
    }

    fn pred_der(&self, p: &Past) -> f64 {
        p.xp1
    }

    fn pred_state(&self, p: &Past, xp: f64) -> f64 {
        p.x1 + self.b0 * (xp + p.xp1)
    }

    fn pred_der_alg(&self, p: &Past) -> f64 {
        p.x1
    }

    fn pred_state_alg(&self, p: &Past, x: f64) -> f64 {
        self.b0 * (x + p.x1)
    }
}

/// Cubic derivative extrapolation shared by the two-step schemes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Extrapolation {
    mp: [f64; 2],
    np: [f64; 2],
}

impl Extrapolation {
    /// `mp` are left undivided by `dt`; call [`Self::finish`] once the
    /// other coefficients are built.
    fn new(alpha: f64) -> Self {
        let mp0 = -6.0 * alpha * (1.0 + alpha);
        Self {
            mp: [mp0, -mp0],
            np: [1.0 + 4.0 * alpha + 3.0 * alpha * alpha, alpha * (2.0 + 3.0 * alpha)],
        }
    }

    fn finish(&mut self, dt: f64) {
        self.mp[0] /= dt;
        self.mp[1] /= dt;
    }

    fn der(&self, p: &Past) -> f64 {
        self.mp[0] * p.x1 + self.mp[1] * p.x2 + self.np[0] * p.xp1 + self.np[1] * p.xp2
    }

    fn der_alg(&self, p: &Past) -> f64 {
        self.np[0] * p.x1 + self.np[1] * p.x2 - self.mp[1] * p.xp1
    }
}

/// `a` and `b` of one dof class.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MultistepCoef {
    pub a: [f64; 2],
    pub b: [f64; 3],
}

impl MultistepCoef {
    fn new(dt: f64, alpha: f64, rho: f64) -> Self {
        let one_rho = (1.0 - rho) * (1.0 - rho);
        let den = 2.0 * (1.0 + alpha) - one_rho;
        let beta = alpha * (one_rho * (2.0 + alpha) + 2.0 * (2.0 * rho - 1.0) * (1.0 + alpha)) / den;
        let delta = 0.5 * alpha * alpha * one_rho / den;
        Self {
            a: [1.0 - beta, beta],
            b: [
                dt * (delta / alpha + alpha / 2.0),
                dt * (beta / 2.0 + alpha / 2.0 - delta / alpha * (1.0 + alpha)),
                dt * (beta / 2.0 + delta),
            ],
        }
    }
}

/// Two-step scheme with tunable high-frequency dissipation.
#[derive(Debug, Clone)]
pub struct Multistep {
    rho: SpectralRadius,
    algebraic_rho: SpectralRadius,
    ext: Extrapolation,
    diff: MultistepCoef,
    alg: MultistepCoef,
}

impl Multistep {
    pub fn new(rho: impl Into<SpectralRadius>, algebraic_rho: impl Into<SpectralRadius>) -> Self {
        Self {
            rho: rho.into(),
            algebraic_rho: algebraic_rho.into(),
            ext: Extrapolation::default(),
            diff: MultistepCoef::default(),
            alg: MultistepCoef::default(),
        }
    }

    pub fn differential(&self) -> &MultistepCoef {
        &self.diff
    }

    pub fn algebraic(&self) -> &MultistepCoef {
        &self.alg
    }

    /// Extrapolation coefficients `(mp, np)`, `mp` already divided by `dt`.
    pub fn extrapolation(&self) -> ([f64; 2], [f64; 2]) {
        (self.ext.mp, self.ext.np)
    }
}

impl StepScheme for Multistep {
    fn name(&self) -> &'static str {
        "multistep"
    }

    fn steps(&self) -> usize {
        2
    }

    fn set_coef(
        &mut self,
        dt: f64,
        alpha: f64,
        _change: StepChange,
        time: f64,
    ) -> Result<(f64, f64), IntegratorError> {
        let rho = self.rho.checked(time, 0.0)?;
        let algebraic_rho = self.algebraic_rho.checked(time, 0.0)?;

        self.ext = Extrapolation::new(alpha);
        self.diff = MultistepCoef::new(dt, alpha, rho);
        self.alg = if algebraic_rho != rho {
            MultistepCoef::new(dt, alpha, algebraic_rho)
        } else {
            self.diff
        };
        trace!(
            rho,
            algebraic_rho,
            asymptotic_rho = -self.diff.b[1] / (2.0 * self.diff.b[0]),
            "multistep coefficients"
        );
        self.ext.finish(dt);
        Ok((self.diff.b[0], self.alg.b[0]))
    }

    fn pred_der(&self, p: &Past) -> f64 {
        self.ext.der(p)
    }

    fn pred_state(&self, p: &Past, xp: f64) -> f64 {
        let c = &self.diff;
        c.a[0] * p.x1 + c.a[1] * p.x2 + c.b[0] * xp + c.b[1] * p.xp1 + c.b[2] * p.xp2
    }

    fn pred_der_alg(&self, p: &Past) -> f64 {
        self.ext.der_alg(p)
    }

    fn pred_state_alg(&self, p: &Past, x: f64) -> f64 {
        let c = &self.alg;
        c.b[0] * x + c.b[1] * p.x1 + c.b[2] * p.x2 - c.a[1] * p.xp1
    }
}

/// Alternates a trapezoidal step with a two-step dissipative one.
#[derive(Debug, Clone)]
pub struct Hope {
    rho: SpectralRadius,
    algebraic_rho: SpectralRadius,
    trapezoid: bool,
    ext: Extrapolation,
    diff: MultistepCoef,
    alg: MultistepCoef,
}

impl Hope {
    pub fn new(rho: impl Into<SpectralRadius>, algebraic_rho: impl Into<SpectralRadius>) -> Self {
        Self {
            rho: rho.into(),
            algebraic_rho: algebraic_rho.into(),
            trapezoid: false,
            ext: Extrapolation::default(),
            diff: MultistepCoef::default(),
            alg: MultistepCoef::default(),
        }
    }

    /// True while the current step is the trapezoidal one.
    pub fn is_trapezoid(&self) -> bool {
        self.trapezoid
    }

    pub fn differential(&self) -> &MultistepCoef {
        &self.diff
    }

    fn dissipative(dt_mod: f64, rho: f64) -> MultistepCoef {
        let big_alpha = 4.0 * rho / (3.0 + rho);
        MultistepCoef {
            a: [(4.0 - big_alpha) / 3.0, (big_alpha - 1.0) / 3.0],
            b: [dt_mod * (4.0 - big_alpha) / 6.0, dt_mod * big_alpha / 2.0, 0.0],
        }
    }
}

impl StepScheme for Hope {
    fn name(&self) -> &'static str {
        "hope"
    }

    fn steps(&self) -> usize {
        2
    }

    fn set_coef(
        &mut self,
        dt: f64,
        alpha: f64,
        change: StepChange,
        time: f64,
    ) -> Result<(f64, f64), IntegratorError> {
        if change == StepChange::NewStep {
            self.trapezoid = !self.trapezoid;
        }
        let dt_mod = dt * alpha;
        self.ext = Extrapolation::new(alpha);

        if self.trapezoid {
            let half = dt_mod / 2.0;
            self.diff.b = [half, half, 0.0];
            self.alg.b = [half, half, 0.0];
        } else {
            let rho = self.rho.checked(time, 0.0)?;
            let algebraic_rho = self.algebraic_rho.checked(time, 0.0)?;
            self.diff = Self::dissipative(dt_mod, rho);
            self.alg = if algebraic_rho != rho {
                Self::dissipative(dt_mod, algebraic_rho)
            } else {
                self.diff
            };
        }
        self.ext.finish(dt);
        Ok((self.diff.b[0], self.alg.b[0]))
    }

    fn pred_der(&self, p: &Past) -> f64 {
        self.ext.der(p)
    }

    fn pred_state(&self, p: &Past, xp: f64) -> f64 {
        if self.trapezoid {
            p.x1 + self.alg.b[0] * (xp + p.xp1)
        } else {
            let c = &self.diff;
            c.a[0] * p.x1 + c.a[1] * p.x2 + c.b[0] * xp + c.b[1] * p.xp1
        }
    }

    fn pred_der_alg(&self, p: &Past) -> f64 {
        self.ext.der_alg(p)
    }

    fn pred_state_alg(&self, p: &Past, x: f64) -> f64 {
        let c = &self.alg;
        if self.trapezoid {
            c.b[0] * (x + p.x1)
        } else {
            c.b[0] * x + c.b[1] * p.x1 - c.a[1] * p.xp1
        }
    }
}

/// Predictor-corrector driver over N unknowns.
#[derive(Debug, Clone)]
pub struct StepNIntegrator<S> {
    scheme: S,
    b0: f64,
    b0_alg: f64,
    modified_test: bool,
    time: f64,
}

impl<S: StepScheme> StepNIntegrator<S> {
    pub fn new(scheme: S) -> Self {
        Self {
            scheme,
            b0: 0.0,
            b0_alg: 0.0,
            modified_test: false,
            time: 0.0,
        }
    }

    pub fn with_modified_test(mut self, enabled: bool) -> Self {
        self.modified_test = enabled;
        self
    }

    pub fn scheme(&self) -> &S {
        &self.scheme
    }

    pub fn b0_differential(&self) -> f64 {
        self.b0
    }

    pub fn b0_algebraic(&self) -> f64 {
        self.b0_alg
    }

    /// Fill `current` from the history with the scheme's predictor.
    pub fn predict(&self, dofs: &[DofOrder], history: &StateHistory, current: &mut State) {
        let (Some(prev), second) = (history.get(0), history.get(1)) else {
            return;
        };
        let second = second.unwrap_or(prev);
        for (i, order) in dofs.iter().enumerate() {
            let p = Past {
                x1: prev.x[i],
                x2: second.x[i],
                xp1: prev.xp[i],
                xp2: second.xp[i],
            };
            match order {
                DofOrder::Differential => {
                    let xp = self.scheme.pred_der(&p);
                    current.xp[i] = xp;
                    current.x[i] = self.scheme.pred_state(&p, xp);
                }
                DofOrder::Algebraic => {
                    let x = self.scheme.pred_der_alg(&p);
                    current.x[i] = x;
                    current.xp[i] = self.scheme.pred_state_alg(&p, x);
                }
            }
        }
    }
}

/// One step of a [`StepNIntegrator`] seen as a nonlinear problem.
pub(super) struct StepProblem<'a> {
    pub(super) model: &'a mut Model,
    pub(super) state: &'a mut State,
    pub(super) b0: f64,
    pub(super) b0_alg: f64,
    pub(super) modified_test: bool,
}

impl NonlinearProblem for StepProblem<'_> {
    fn residual(&mut self, out: &mut [f64]) -> Result<(), AssemblyError> {
        self.model.assemble_residual(
            out,
            &self.state.x,
            &self.state.xp,
            self.b0,
            AssemblyShift::default(),
        )
    }

    fn jacobian(&mut self, matrix: &mut dyn MatrixHandler) -> Result<(), AssemblyError> {
        self.model
            .assemble_jacobian(matrix, &self.state.x, &self.state.xp, JacobianPass::new(self.b0))
    }

    fn update(&mut self, delta: &[f64]) {
        for (i, &d) in delta.iter().enumerate() {
            match self.model.dof_order(i) {
                DofOrder::Differential => {
                    self.state.xp[i] += d;
                    self.state.x[i] += self.b0 * d;
                }
                DofOrder::Algebraic => {
                    self.state.x[i] += d;
                    self.state.xp[i] += self.b0_alg * d;
                }
            }
        }
    }

    fn test_scale(&self, test: &dyn NonlinearSolverTest) -> f64 {
        if self.modified_test {
            modified_test_scale(self.model.dofs(), &self.state.xp, test)
        } else {
            1.0
        }
    }
}

impl<S: StepScheme> StepIntegrator for StepNIntegrator<S> {
    fn name(&self) -> &'static str {
        self.scheme.name()
    }

    fn steps(&self) -> usize {
        self.scheme.steps()
    }

    fn unknown_states(&self) -> usize {
        1
    }

    fn set_coef(&mut self, dt: f64, alpha: f64, change: StepChange) -> Result<(), IntegratorError> {
        let (b0, b0_alg) = self.scheme.set_coef(dt, alpha, change, self.time)?;
        self.b0 = b0;
        self.b0_alg = b0_alg;
        Ok(())
    }

    fn set_drive_time(&mut self, time: f64) {
        self.time = time;
    }

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<NewtonOutcome, IntegratorError> {
        let span = info_span!("step", scheme = self.scheme.name(), dt = ctx.dt);
        let _enter = span.enter();

        check_step(ctx)?;
        ctx.history.require(self.scheme.steps())?;
        self.set_coef(ctx.dt, ctx.alpha, ctx.change)?;
        self.predict(ctx.model.dofs(), ctx.history, ctx.current);

        let mut problem = StepProblem {
            model: &mut *ctx.model,
            state: &mut *ctx.current,
            b0: self.b0,
            b0_alg: self.b0_alg,
            modified_test: self.modified_test,
        };
        let outcome = ctx.solver.solve(&mut problem, &mut *ctx.sm)?;
        debug!(iterations = outcome.iterations(), "step converged");

        ctx.model.after_convergence(&ctx.current.x, &ctx.current.xp);
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn past(f: impl Fn(f64) -> f64, df: impl Fn(f64) -> f64, h: f64) -> Past {
        Past {
            x1: f(-h),
            x2: f(-2.0 * h),
            xp1: df(-h),
            xp2: df(-2.0 * h),
        }
    }

    #[test]
    fn test_one_step_b0() {
        let mut ie = ImplicitEuler::default();
        let mut cn = CrankNicolson::default();
        assert_eq!(ie.set_coef(0.1, 1.0, StepChange::NewStep, 0.0).unwrap(), (0.1, 0.1));
        assert_eq!(cn.set_coef(0.1, 1.0, StepChange::NewStep, 0.0).unwrap(), (0.05, 0.05));
    }

    #[test]
    fn test_multistep_exact_on_quadratic() {
        let h = 0.01;
        for rho in [0.0, 0.3, 0.6, 1.0] {
            let mut ms = Multistep::new(rho, rho);
            ms.set_coef(h, 1.0, StepChange::NewStep, 0.0).unwrap();
            let p = past(|t| t * t, |t| 2.0 * t, h);
            assert_relative_eq!(ms.pred_state(&p, 0.0), 0.0, epsilon = 1e-14);

            // cubic extrapolation of the derivative
            let p = past(|t| t * t * t - t, |t| 3.0 * t * t - 1.0, h);
            assert_relative_eq!(ms.pred_der(&p), -1.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_multistep_rho_one_is_two_step_trapezoid() {
        let mut ms = Multistep::new(1.0, 1.0);
        let (b0, _) = ms.set_coef(0.2, 1.0, StepChange::NewStep, 0.0).unwrap();
        assert_relative_eq!(b0, 0.1, epsilon = 1e-15);
        let c = ms.differential();
        assert_relative_eq!(c.a[0], 0.0, epsilon = 1e-15);
        assert_relative_eq!(c.a[1], 1.0, epsilon = 1e-15);
        assert_relative_eq!(c.b[1], 0.2, epsilon = 1e-15);
        assert_relative_eq!(c.b[2], 0.1, epsilon = 1e-15);
    }

    #[test]
    fn test_hope_toggles_on_new_step_only() {
        let mut hope = Hope::new(0.6, 0.6);
        hope.set_coef(0.1, 1.0, StepChange::NewStep, 0.0).unwrap();
        assert!(hope.is_trapezoid());
        hope.set_coef(0.1, 1.0, StepChange::RepeatStep, 0.0).unwrap();
        assert!(hope.is_trapezoid());
        let (b0, _) = hope.set_coef(0.1, 1.0, StepChange::NewStep, 0.0).unwrap();
        assert!(!hope.is_trapezoid());
        let big_alpha = 4.0 * 0.6 / 3.6;
        assert_relative_eq!(b0, 0.1 * (4.0 - big_alpha) / 6.0, epsilon = 1e-15);
    }

    #[test]
    fn test_radius_out_of_range() {
        let mut ms = Multistep::new(1.5, 0.0);
        assert_eq!(
            ms.set_coef(0.1, 1.0, StepChange::NewStep, 0.0),
            Err(IntegratorError::InvalidRadius(1.5))
        );
    }
}
