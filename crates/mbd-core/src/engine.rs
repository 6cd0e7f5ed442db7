use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span};

use crate::error::{ConfigError, IntegratorError, MbdError, MbdResult};
use crate::integrator::{
    create_integrator, DerivativeSolver, IntegratorKind, SpectralRadius, State, StateHistory,
    StepChange, StepContext, StepIntegrator, DEFAULT_DERIVATIVE_COEF,
};
use crate::model::{DofOrder, Model};
use crate::newton::{NewtonConfig, NewtonRaphsonSolver, NonlinearSolver};
use crate::solution::{create_solution_manager, SolutionConfig, SolutionManager};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub initial_time: f64,
    pub dt: f64,
    pub steps: usize,
    pub integrator: IntegratorKind,
    pub rho: f64,
    pub algebraic_rho: f64,
    pub modified_residual_test: bool,
    /// Solve for consistent derivatives before the first step.
    pub derivatives: bool,
    pub derivative_coef: f64,
    /// Keep every n-th step in the trajectory; the last step is always kept.
    pub record_every: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            initial_time: 0.0,
            dt: 1e-3,
            steps: 1000,
            integrator: IntegratorKind::default(),
            rho: 0.6,
            algebraic_rho: 0.6,
            modified_residual_test: false,
            derivatives: false,
            derivative_coef: DEFAULT_DERIVATIVE_COEF,
            record_every: 1,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.dt > 0.0) || !self.dt.is_finite() {
            return Err(ConfigError::Invalid(format!("time step {} must be positive", self.dt)));
        }
        if self.record_every == 0 {
            return Err(ConfigError::Invalid("record_every must be at least 1".into()));
        }
        if !(self.derivative_coef > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "derivative coefficient {} must be positive",
                self.derivative_coef
            )));
        }
        Ok(())
    }
}

/// One recorded time point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub time: f64,
    pub x: Vec<f64>,
    pub xp: Vec<f64>,
    pub iterations: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub integrator: String,
    pub solution_manager: String,
    pub threads: usize,
    pub steps: usize,
    pub iterations: usize,
    pub jacobians: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    pub names: Vec<String>,
    pub dofs: Vec<DofOrder>,
    pub samples: Vec<Sample>,
    pub stats: RunStats,
}

impl Trajectory {
    pub fn push(&mut self, time: f64, state: &State, iterations: usize) {
        self.samples.push(Sample {
            time,
            x: state.x.clone(),
            xp: state.xp.clone(),
            iterations,
        });
    }

    pub fn last(&self) -> Option<&Sample> {
        self.samples.last()
    }

    pub fn times(&self) -> impl Iterator<Item = f64> + '_ {
        self.samples.iter().map(|s| s.time)
    }

    /// Values of dof `index` over time.
    pub fn series(&self, index: usize) -> Vec<f64> {
        self.samples.iter().map(|s| s.x[index]).collect()
    }
}

/// Fixed-step driver: one model, one integrator, one nonlinear solver.
pub struct Engine {
    model: Model,
    integrator: Box<dyn StepIntegrator>,
    solver: NewtonRaphsonSolver,
    sm: Box<dyn SolutionManager>,
    derivatives: Option<DerivativePhase>,
    config: EngineConfig,
    solution: SolutionConfig,
}

/// Initial-derivative solve on an N-sized manager of the same kind.
struct DerivativePhase {
    integrator: DerivativeSolver,
    solver: NewtonRaphsonSolver,
    sm: Box<dyn SolutionManager>,
}

impl Engine {
    pub fn new(
        model: Model,
        config: EngineConfig,
        newton: NewtonConfig,
        solution: SolutionConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let integrator = create_integrator(
            config.integrator,
            SpectralRadius::Constant(config.rho),
            SpectralRadius::Constant(config.algebraic_rho),
            config.modified_residual_test,
        )?;
        let unknowns = model.size() * integrator.unknown_states();
        let sm = create_solution_manager(unknowns, &solution)?;
        let solver = NewtonRaphsonSolver::new(newton.clone())?.with_scale(model.scale());
        let derivatives = if config.derivatives {
            let mut single = solution.clone();
            if let Some(partition) = &solution.partition {
                single.partition = Some(partition.truncated(model.size())?);
            }
            Some(DerivativePhase {
                integrator: DerivativeSolver::new(config.derivative_coef),
                solver: NewtonRaphsonSolver::new(newton)?.with_scale(model.scale()),
                sm: create_solution_manager(model.size(), &single)?,
            })
        } else {
            None
        };
        debug!(
            integrator = integrator.name(),
            manager = sm.name(),
            unknowns,
            "engine ready"
        );
        Ok(Self {
            model,
            integrator,
            solver,
            sm,
            derivatives,
            config,
            solution,
        })
    }

    /// Replace the integrator built from the config, e.g. with a scheduled
    /// spectral radius.
    pub fn with_integrator(mut self, integrator: Box<dyn StepIntegrator>) -> Result<Self, ConfigError> {
        let unknowns = self.model.size() * integrator.unknown_states();
        if unknowns != self.sm.size() {
            self.sm = create_solution_manager(unknowns, &self.solution)?;
            self.solver.reset();
        }
        self.integrator = integrator;
        Ok(self)
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn integrator_name(&self) -> &'static str {
        self.integrator.name()
    }

    /// Integrate from `initial` and record the trajectory.
    pub fn run(&mut self, initial: State) -> MbdResult<Trajectory> {
        let n = self.model.size();
        if initial.x.len() != n || initial.xp.len() != n {
            return Err(ConfigError::Invalid(format!(
                "initial state has {} values for {n} dofs",
                initial.x.len()
            ))
            .into());
        }
        let span = info_span!(
            "run",
            integrator = self.integrator.name(),
            steps = self.config.steps,
            dt = self.config.dt
        );
        let _enter = span.enter();

        let dt = self.config.dt;
        let mut time = self.config.initial_time;
        let mut current = initial;
        self.model.set_time(time);

        let mut trajectory = Trajectory {
            names: self.model.names().to_vec(),
            dofs: self.model.dofs().to_vec(),
            samples: Vec::with_capacity(self.config.steps / self.config.record_every + 2),
            stats: RunStats {
                integrator: self.integrator.name().to_string(),
                solution_manager: self.sm.name().to_string(),
                threads: self.model.threads(),
                ..Default::default()
            },
        };

        let start_iterations = self
            .derivatives(&mut current)
            .map_err(|source| MbdError::Step {
                step: 0,
                time,
                source,
            })?;
        trajectory.stats.iterations += start_iterations;
        trajectory.push(time, &current, start_iterations);

        let mut history = StateHistory::new(self.integrator.steps().max(1));
        if self.integrator.steps() > 1 {
            history.push(back_extrapolate(self.model.dofs(), &current, dt));
        }
        history.push(current.clone());

        for step in 1..=self.config.steps {
            let next_time = self.config.initial_time + step as f64 * dt;
            self.integrator.set_drive_time(next_time);
            self.model.set_time(next_time);

            let mut next = current.clone();
            let mut ctx = StepContext {
                model: &mut self.model,
                solver: &mut self.solver,
                sm: self.sm.as_mut(),
                history: &history,
                current: &mut next,
                dt,
                alpha: 1.0,
                change: StepChange::NewStep,
            };
            let outcome = self
                .integrator
                .advance(&mut ctx)
                .map_err(|source| MbdError::Step {
                    step,
                    time: next_time,
                    source,
                })?;

            trajectory.stats.steps += 1;
            trajectory.stats.iterations += outcome.iterations();
            if step % self.config.record_every == 0 || step == self.config.steps {
                trajectory.push(next_time, &next, outcome.iterations());
            }
            history.push(next.clone());
            current = next;
            time = next_time;
        }
        trajectory.stats.jacobians = self.solver.total_jacobians();

        info!(
            time,
            steps = trajectory.stats.steps,
            iterations = trajectory.stats.iterations,
            jacobians = trajectory.stats.jacobians,
            "run complete"
        );
        Ok(trajectory)
    }

    fn derivatives(&mut self, state: &mut State) -> Result<usize, IntegratorError> {
        let Some(phase) = self.derivatives.as_mut() else {
            return Ok(0);
        };
        let history = StateHistory::new(1);
        let mut ctx = StepContext {
            model: &mut self.model,
            solver: &mut phase.solver,
            sm: phase.sm.as_mut(),
            history: &history,
            current: state,
            dt: 0.0,
            alpha: 1.0,
            change: StepChange::NewStep,
        };
        let outcome = phase.integrator.advance(&mut ctx)?;
        Ok(outcome.iterations())
    }
}

/// Fictitious state one step before `state`, assuming constant derivatives.
fn back_extrapolate(dofs: &[DofOrder], state: &State, dt: f64) -> State {
    let mut prev = state.clone();
    for (i, order) in dofs.iter().enumerate() {
        match order {
            DofOrder::Differential => prev.x[i] = state.x[i] - dt * state.xp[i],
            DofOrder::Algebraic => prev.xp[i] = state.xp[i] - dt * state.x[i],
        }
    }
    prev
}
