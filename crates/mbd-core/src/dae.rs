//! Built-in DAE problems.
//!
//! * Planar pendulum in Cartesian coordinates, index 3:
//!   `x' = u`, `y' = v`, `u' = -λx/l`, `v' = -λy/l - g`, `sqrt(x² + y²) = l`.
//!   Unknowns `x, y, u, v` are differential, `λ` is algebraic.
//! * Chain of masses joined by spring-dampers, the first one tied to the
//!   ground. Linear, so exact solutions are available for one mass.
//!
//! Both are split over several elements so that assembly can run on more
//! than one thread.

use serde::{Deserialize, Serialize};

use crate::assembly::Element;
use crate::error::{ConfigError, ElementError};
use crate::integrator::State;
use crate::matrix::{WorkMatrix, WorkVector};
use crate::model::{DofOrder, Model};
use crate::schur::DomainPartition;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PendulumParams {
    pub length: f64,
    pub gravity: f64,
}

impl Default for PendulumParams {
    fn default() -> Self {
        Self {
            length: 1.0,
            gravity: 9.81,
        }
    }
}

impl PendulumParams {
    pub fn omega(&self) -> f64 {
        (self.gravity / self.length).sqrt()
    }

    /// Consistent state at rest with initial angle `theta0` from the
    /// downward vertical.
    pub fn consistent_state(&self, theta0: f64) -> State {
        let (l, g) = (self.length, self.gravity);
        let (s, c) = theta0.sin_cos();
        State::new(
            vec![l * s, -l * c, 0.0, 0.0, g * c],
            vec![0.0, 0.0, -g * c * s, -g * s * s, 0.0],
        )
    }

    /// Small-angle solution `θ(t) = θ0 cos(ωt)`.
    pub fn small_angle(&self, theta0: f64, time: f64) -> f64 {
        theta0 * (self.omega() * time).cos()
    }

    /// Angle from the downward vertical of a state.
    pub fn angle(x: &[f64]) -> f64 {
        x[0].atan2(-x[1])
    }
}

pub const PENDULUM_DOFS: [DofOrder; 5] = [
    DofOrder::Differential,
    DofOrder::Differential,
    DofOrder::Differential,
    DofOrder::Differential,
    DofOrder::Algebraic,
];

pub const PENDULUM_NAMES: [&str; 5] = ["x", "y", "u", "v", "lambda"];

const X: usize = 0;
const Y: usize = 1;
const U: usize = 2;
const V: usize = 3;
const L: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendulumRows {
    /// `x' - u`, `y' - v`
    Kinematics,
    /// `u' + λx/l`, `v' + λy/l + g`
    Dynamics,
    /// `sqrt(x² + y²) - l`
    Constraint,
}

/// One row group of the pendulum equations, dofs starting at `base`.
#[derive(Debug, Clone)]
pub struct Pendulum {
    label: u32,
    base: usize,
    rows: PendulumRows,
    params: PendulumParams,
}

impl Pendulum {
    /// The three elements of a pendulum whose dofs start at `base`.
    pub fn elements(params: PendulumParams, base: usize, first_label: u32) -> Vec<Box<dyn Element>> {
        [
            PendulumRows::Kinematics,
            PendulumRows::Dynamics,
            PendulumRows::Constraint,
        ]
        .into_iter()
        .enumerate()
        .map(|(k, rows)| {
            Box::new(Pendulum {
                label: first_label + k as u32,
                base,
                rows,
                params,
            }) as Box<dyn Element>
        })
        .collect()
    }

    fn radius(&self, x: &[f64]) -> Result<f64, ElementError> {
        let (px, py) = (x[self.base + X], x[self.base + Y]);
        let r = (px * px + py * py).sqrt();
        if r == 0.0 {
            return Err(ElementError::DivideByZero(format!(
                "pendulum {} has zero radius",
                self.label
            )));
        }
        Ok(r)
    }
}

impl Element for Pendulum {
    fn label(&self) -> u32 {
        self.label
    }

    fn work_space_dim(&self) -> (usize, usize) {
        match self.rows {
            PendulumRows::Kinematics => (2, 4),
            PendulumRows::Dynamics => (2, 5),
            PendulumRows::Constraint => (1, 2),
        }
    }

    fn assemble_jacobian(
        &mut self,
        work: &mut WorkMatrix,
        coef: f64,
        x: &[f64],
        _xp: &[f64],
    ) -> Result<(), ElementError> {
        let b = self.base;
        let l = self.params.length;
        match self.rows {
            PendulumRows::Kinematics => {
                work.set_sparse();
                work.put_item(b + X, b + X, 1.0);
                work.put_item(b + X, b + U, -coef);
                work.put_item(b + Y, b + Y, 1.0);
                work.put_item(b + Y, b + V, -coef);
            }
            PendulumRows::Dynamics => {
                let lambda = x[b + L];
                work.set_full(2, 5);
                work.put_row_index(0, b + U);
                work.put_row_index(1, b + V);
                for j in 0..5 {
                    work.put_col_index(j, b + j);
                }
                work.put_coef(0, U, 1.0);
                work.put_coef(0, X, coef * lambda / l);
                work.put_coef(0, L, x[b + X] / l);
                work.put_coef(1, V, 1.0);
                work.put_coef(1, Y, coef * lambda / l);
                work.put_coef(1, L, x[b + Y] / l);
            }
            PendulumRows::Constraint => {
                let r = self.radius(x)?;
                work.set_full(1, 2);
                work.put_row_index(0, b + L);
                work.put_col_index(0, b + X);
                work.put_col_index(1, b + Y);
                work.put_coef(0, 0, coef * x[b + X] / r);
                work.put_coef(0, 1, coef * x[b + Y] / r);
            }
        }
        Ok(())
    }

    fn assemble_residual(
        &mut self,
        work: &mut WorkVector,
        _coef: f64,
        x: &[f64],
        xp: &[f64],
    ) -> Result<(), ElementError> {
        let b = self.base;
        let PendulumParams { length: l, gravity: g } = self.params;
        match self.rows {
            PendulumRows::Kinematics => {
                work.resize(2);
                work.put_row_index(0, b + X);
                work.put_coef(0, -(xp[b + X] - x[b + U]));
                work.put_row_index(1, b + Y);
                work.put_coef(1, -(xp[b + Y] - x[b + V]));
            }
            PendulumRows::Dynamics => {
                let lambda = x[b + L];
                work.resize(2);
                work.put_row_index(0, b + U);
                work.put_coef(0, -(xp[b + U] + lambda * x[b + X] / l));
                work.put_row_index(1, b + V);
                work.put_coef(1, -(xp[b + V] + lambda * x[b + Y] / l + g));
            }
            PendulumRows::Constraint => {
                let r = self.radius(x)?;
                work.resize(1);
                work.put_row_index(0, b + L);
                work.put_coef(0, -(r - l));
            }
        }
        Ok(())
    }
}

/// Single pendulum model.
pub fn pendulum_model(params: PendulumParams, threads: usize) -> Result<Model, ConfigError> {
    Model::new(PENDULUM_DOFS.to_vec(), Pendulum::elements(params, 0, 1), threads)?
        .with_names(PENDULUM_NAMES.iter().map(|s| s.to_string()).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainParams {
    pub mass: f64,
    pub stiffness: f64,
    pub damping: f64,
}

impl Default for ChainParams {
    fn default() -> Self {
        Self {
            mass: 1.0,
            stiffness: 100.0,
            damping: 0.0,
        }
    }
}

/// Point mass with position dof `pos` and velocity dof `pos + 1`:
/// `x' - v = 0` and `m·v' = forces`.
#[derive(Debug, Clone)]
pub struct Mass {
    label: u32,
    pos: usize,
    mass: f64,
}

impl Mass {
    pub fn new(label: u32, pos: usize, mass: f64) -> Self {
        Self { label, pos, mass }
    }
}

impl Element for Mass {
    fn label(&self) -> u32 {
        self.label
    }

    fn work_space_dim(&self) -> (usize, usize) {
        (2, 2)
    }

    fn assemble_jacobian(
        &mut self,
        work: &mut WorkMatrix,
        coef: f64,
        _x: &[f64],
        _xp: &[f64],
    ) -> Result<(), ElementError> {
        let (p, v) = (self.pos, self.pos + 1);
        work.set_full(2, 2);
        work.put_row_index(0, p);
        work.put_row_index(1, v);
        work.put_col_index(0, p);
        work.put_col_index(1, v);
        work.put_coef(0, 0, 1.0);
        work.put_coef(0, 1, -coef);
        work.put_coef(1, 1, self.mass);
        Ok(())
    }

    fn assemble_residual(
        &mut self,
        work: &mut WorkVector,
        _coef: f64,
        x: &[f64],
        xp: &[f64],
    ) -> Result<(), ElementError> {
        let (p, v) = (self.pos, self.pos + 1);
        work.resize(2);
        work.put_row_index(0, p);
        work.put_coef(0, -(xp[p] - x[v]));
        work.put_row_index(1, v);
        work.put_coef(1, -self.mass * xp[v]);
        Ok(())
    }
}

/// Spring-damper between mass `a` and mass `b`, or the ground when `b` is
/// `None`. Masses are given by their position dof.
#[derive(Debug, Clone)]
pub struct SpringDamper {
    label: u32,
    a: usize,
    b: Option<usize>,
    stiffness: f64,
    damping: f64,
}

impl SpringDamper {
    pub fn new(label: u32, a: usize, b: Option<usize>, stiffness: f64, damping: f64) -> Self {
        Self {
            label,
            a,
            b,
            stiffness,
            damping,
        }
    }

    fn force(&self, x: &[f64]) -> f64 {
        let (xa, va) = (x[self.a], x[self.a + 1]);
        let (xb, vb) = self.b.map_or((0.0, 0.0), |b| (x[b], x[b + 1]));
        self.stiffness * (xa - xb) + self.damping * (va - vb)
    }
}

impl Element for SpringDamper {
    fn label(&self) -> u32 {
        self.label
    }

    fn work_space_dim(&self) -> (usize, usize) {
        (2, 4)
    }

    fn assemble_jacobian(
        &mut self,
        work: &mut WorkMatrix,
        coef: f64,
        _x: &[f64],
        _xp: &[f64],
    ) -> Result<(), ElementError> {
        let (k, c) = (coef * self.stiffness, coef * self.damping);
        let va = self.a + 1;
        work.set_sparse();
        work.put_item(va, self.a, k);
        work.put_item(va, va, c);
        if let Some(b) = self.b {
            let vb = b + 1;
            work.put_item(va, b, -k);
            work.put_item(va, vb, -c);
            work.put_item(vb, self.a, -k);
            work.put_item(vb, va, -c);
            work.put_item(vb, b, k);
            work.put_item(vb, vb, c);
        }
        Ok(())
    }

    fn assemble_residual(
        &mut self,
        work: &mut WorkVector,
        _coef: f64,
        x: &[f64],
        _xp: &[f64],
    ) -> Result<(), ElementError> {
        let f = self.force(x);
        match self.b {
            Some(b) => {
                work.resize(2);
                work.put_row_index(1, b + 1);
                work.put_coef(1, f);
            }
            None => work.resize(1),
        }
        work.put_row_index(0, self.a + 1);
        work.put_coef(0, -f);
        Ok(())
    }
}

/// `masses` masses in a row, the first tied to the ground. Dofs are
/// `x0, v0, x1, v1, ...`.
pub fn chain_model(masses: usize, params: ChainParams, threads: usize) -> Result<Model, ConfigError> {
    if masses == 0 {
        return Err(ConfigError::Invalid("chain needs at least one mass".into()));
    }
    let mut elements: Vec<Box<dyn Element>> = Vec::with_capacity(2 * masses);
    for i in 0..masses {
        let pos = 2 * i;
        elements.push(Box::new(Mass::new(2 * i as u32, pos, params.mass)));
        let other = if i == 0 { None } else { Some(pos - 2) };
        elements.push(Box::new(SpringDamper::new(
            2 * i as u32 + 1,
            pos,
            other,
            params.stiffness,
            params.damping,
        )));
    }
    let names = (0..masses)
        .flat_map(|i| [format!("x{i}"), format!("v{i}")])
        .collect();
    Model::new(vec![DofOrder::Differential; 2 * masses], elements, threads)?.with_names(names)
}

/// Split a chain into `domains` groups of consecutive masses. The first
/// mass of every group but the first is an interface dof, so springs only
/// couple a domain with the interface. `blocks` repeats the assignment for
/// integrators solving several states at once.
pub fn chain_partition(
    masses: usize,
    domains: usize,
    blocks: usize,
) -> Result<DomainPartition, ConfigError> {
    if domains == 0 || 2 * domains > masses + 1 {
        return Err(ConfigError::Invalid(format!(
            "cannot split {masses} masses into {domains} domains"
        )));
    }
    let per_domain = masses.div_ceil(domains);
    let mut domain_of = Vec::with_capacity(2 * masses * blocks);
    for i in 0..masses {
        let k = (i / per_domain).min(domains - 1);
        let owner = if k > 0 && i == k * per_domain { None } else { Some(k) };
        domain_of.extend([owner, owner]);
    }
    let one = domain_of.clone();
    for _ in 1..blocks {
        domain_of.extend_from_slice(&one);
    }
    DomainPartition::new(domain_of)
}

/// Chain at rest with the last mass displaced by `offset`; accelerations
/// are consistent.
pub fn chain_initial_state(masses: usize, params: ChainParams, offset: f64) -> State {
    let mut state = State::zeros(2 * masses);
    let last = 2 * (masses - 1);
    state.x[last] = offset;
    // only the springs touching the last mass are stretched
    let f = params.stiffness * offset;
    state.xp[last + 1] -= f / params.mass;
    if masses > 1 {
        state.xp[last - 1] += f / params.mass;
    }
    state
}
