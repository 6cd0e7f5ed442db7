//! Time-step integrators.
//!
//! An integrator turns one time step into a nonlinear problem: it sets its
//! coefficients, predicts the new state from the history, hands itself to
//! the nonlinear solver as the [`NonlinearProblem`] and, once converged,
//! notifies the model.
//!
//! States store `x` and `xp` per dof. For algebraic dofs the `xp` slot holds
//! the time integral of the variable rather than a derivative.
//!
//! | Scheme | Previous states | Unknown blocks |
//! |--------|-----------------|----------------|
//! | [`ImplicitEuler`] | 1 | 1 |
//! | [`CrankNicolson`] | 1 | 1 |
//! | [`Multistep`] | 2 | 1 |
//! | [`Hope`] | 2 | 1 |
//! | [`ThirdOrderIntegrator`] | 1 | 2 |
//! | [`DerivativeSolver`] | 0 | 1 |
//!
//! [`NonlinearProblem`]: crate::newton::NonlinearProblem

mod derivative;
mod schemes;
mod third_order;

pub use derivative::{DerivativeSolver, DEFAULT_DERIVATIVE_COEF};
pub use schemes::{
    CrankNicolson, Hope, ImplicitEuler, Multistep, MultistepCoef, Past, StepNIntegrator,
    StepScheme,
};
pub use third_order::ThirdOrderIntegrator;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::convergence::NonlinearSolverTest;
use crate::error::{ConfigError, IntegratorError};
use crate::model::{DofOrder, Model};
use crate::newton::{NewtonOutcome, NonlinearSolver};
use crate::solution::SolutionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepChange {
    /// First attempt at a new step.
    NewStep,
    /// Same step again, e.g. after a failed attempt.
    RepeatStep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub x: Vec<f64>,
    pub xp: Vec<f64>,
}

impl State {
    pub fn new(x: Vec<f64>, xp: Vec<f64>) -> Self {
        Self { x, xp }
    }

    pub fn zeros(n: usize) -> Self {
        Self {
            x: vec![0.0; n],
            xp: vec![0.0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }
}

/// Previous converged states, most recent first.
#[derive(Debug, Clone, Default)]
pub struct StateHistory {
    states: VecDeque<State>,
    capacity: usize,
}

impl StateHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            states: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, state: State) {
        self.states.push_front(state);
        self.states.truncate(self.capacity.max(1));
    }

    /// `get(0)` is the state at `t_{n-1}`.
    pub fn get(&self, k: usize) -> Option<&State> {
        self.states.get(k)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn require(&self, needed: usize) -> Result<(), IntegratorError> {
        if self.states.len() < needed {
            return Err(IntegratorError::MissingHistory {
                needed,
                got: self.states.len(),
            });
        }
        Ok(())
    }
}

/// Spectral radius at infinity, fixed or scheduled over time.
#[derive(Clone)]
pub enum SpectralRadius {
    Constant(f64),
    Function(Arc<dyn Fn(f64) -> f64 + Send + Sync>),
}

impl SpectralRadius {
    pub fn at(&self, time: f64) -> f64 {
        match self {
            SpectralRadius::Constant(rho) => *rho,
            SpectralRadius::Function(f) => f(time),
        }
    }

    pub fn function(f: impl Fn(f64) -> f64 + Send + Sync + 'static) -> Self {
        SpectralRadius::Function(Arc::new(f))
    }

    /// Value at `time`, checked against `[min, 1]`.
    pub(crate) fn checked(&self, time: f64, min: f64) -> Result<f64, IntegratorError> {
        let rho = self.at(time);
        if !(rho >= min && rho <= 1.0) {
            return Err(IntegratorError::InvalidRadius(rho));
        }
        Ok(rho)
    }
}

impl Default for SpectralRadius {
    fn default() -> Self {
        SpectralRadius::Constant(0.6)
    }
}

impl fmt::Debug for SpectralRadius {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpectralRadius::Constant(rho) => write!(f, "Constant({rho})"),
            SpectralRadius::Function(_) => write!(f, "Function(..)"),
        }
    }
}

impl From<f64> for SpectralRadius {
    fn from(rho: f64) -> Self {
        SpectralRadius::Constant(rho)
    }
}

/// Collaborators of one step.
pub struct StepContext<'a> {
    pub model: &'a mut Model,
    pub solver: &'a mut dyn NonlinearSolver,
    pub sm: &'a mut dyn SolutionManager,
    pub history: &'a StateHistory,
    /// Receives the converged state.
    pub current: &'a mut State,
    pub dt: f64,
    /// Ratio between this step and the previous one.
    pub alpha: f64,
    pub change: StepChange,
}

pub trait StepIntegrator: Send {
    fn name(&self) -> &'static str;

    /// Previous states the predictor reads.
    fn steps(&self) -> usize;

    /// Unknown blocks per dof solved at once.
    fn unknown_states(&self) -> usize;

    fn set_coef(&mut self, dt: f64, alpha: f64, change: StepChange) -> Result<(), IntegratorError>;

    /// Time at which scheduled parameters are evaluated.
    fn set_drive_time(&mut self, _time: f64) {}

    fn advance(&mut self, ctx: &mut StepContext<'_>) -> Result<NewtonOutcome, IntegratorError>;
}

/// `1 / (1 + Σ_diff (xp_i·s_i)²)`: damps the residual test when the
/// derivatives are large.
pub(crate) fn modified_test_scale(
    dofs: &[DofOrder],
    xp: &[f64],
    test: &dyn NonlinearSolverTest,
) -> f64 {
    let sum: f64 = dofs
        .iter()
        .zip(xp)
        .enumerate()
        .filter(|(_, (order, _))| **order == DofOrder::Differential)
        .map(|(i, (_, &d))| {
            let s = d * test.scale_coef(i);
            s * s
        })
        .sum();
    1.0 / (1.0 + sum)
}

pub(crate) fn check_step(ctx: &StepContext<'_>) -> Result<(), IntegratorError> {
    if !(ctx.dt > 0.0) || !ctx.dt.is_finite() {
        return Err(IntegratorError::InvalidStep(ctx.dt));
    }
    let n = ctx.model.size();
    if ctx.current.len() != n || ctx.current.xp.len() != n {
        return Err(IntegratorError::SizeMismatch {
            expected: n,
            got: ctx.current.len(),
        });
    }
    Ok(())
}

/// Integrator families selectable by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IntegratorKind {
    ImplicitEuler,
    CrankNicolson,
    #[default]
    Multistep,
    Hope,
    ThirdOrder,
}

impl IntegratorKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "implicit-euler" | "ie" | "euler" => Some(Self::ImplicitEuler),
            "crank-nicolson" | "cn" => Some(Self::CrankNicolson),
            "multistep" | "ms" => Some(Self::Multistep),
            "hope" => Some(Self::Hope),
            "third-order" | "thirdorder" => Some(Self::ThirdOrder),
            _ => None,
        }
    }
}

pub fn create_integrator(
    kind: IntegratorKind,
    rho: SpectralRadius,
    algebraic_rho: SpectralRadius,
    modified_residual_test: bool,
) -> Result<Box<dyn StepIntegrator>, ConfigError> {
    let integrator: Box<dyn StepIntegrator> = match kind {
        IntegratorKind::ImplicitEuler => Box::new(
            StepNIntegrator::new(ImplicitEuler::default()).with_modified_test(modified_residual_test),
        ),
        IntegratorKind::CrankNicolson => Box::new(
            StepNIntegrator::new(CrankNicolson::default()).with_modified_test(modified_residual_test),
        ),
        IntegratorKind::Multistep => Box::new(
            StepNIntegrator::new(Multistep::new(rho, algebraic_rho))
                .with_modified_test(modified_residual_test),
        ),
        IntegratorKind::Hope => Box::new(
            StepNIntegrator::new(Hope::new(rho, algebraic_rho))
                .with_modified_test(modified_residual_test),
        ),
        IntegratorKind::ThirdOrder => {
            if let SpectralRadius::Constant(r) = rho {
                if !(r > 0.0 && r <= 1.0) {
                    return Err(ConfigError::Invalid(format!(
                        "third order scheme needs 0 < rho <= 1, got {r}"
                    )));
                }
            }
            Box::new(ThirdOrderIntegrator::new(rho).with_modified_test(modified_residual_test))
        }
    };
    Ok(integrator)
}
