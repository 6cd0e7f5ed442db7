//! Dof table plus the element assembly that integrators drive.

use serde::{Deserialize, Serialize};

use crate::assembly::{AssemblyOrchestrator, Element, JacobianPass};
use crate::error::{AssemblyError, ConfigError};
use crate::matrix::{AssemblyShift, MatrixHandler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DofOrder {
    Differential,
    Algebraic,
}

pub struct Model {
    dofs: Vec<DofOrder>,
    names: Vec<String>,
    scale: Vec<f64>,
    orchestrator: AssemblyOrchestrator,
    time: f64,
}

impl Model {
    pub fn new(
        dofs: Vec<DofOrder>,
        elements: Vec<Box<dyn Element>>,
        threads: usize,
    ) -> Result<Self, ConfigError> {
        if dofs.is_empty() {
            return Err(ConfigError::Invalid("model has no dofs".into()));
        }
        let orchestrator = AssemblyOrchestrator::new(elements, threads)?;
        let scale = vec![1.0; dofs.len()];
        let names = (0..dofs.len()).map(|i| format!("q{i}")).collect();
        Ok(Self {
            dofs,
            names,
            scale,
            orchestrator,
            time: 0.0,
        })
    }

    /// Per-dof scale used by the scaled tests and the modified residual test.
    pub fn with_scale(mut self, scale: Vec<f64>) -> Result<Self, ConfigError> {
        if scale.len() != self.dofs.len() {
            return Err(ConfigError::Invalid(format!(
                "{} scale factors for {} dofs",
                scale.len(),
                self.dofs.len()
            )));
        }
        self.scale = scale;
        Ok(self)
    }

    pub fn with_names(mut self, names: Vec<String>) -> Result<Self, ConfigError> {
        if names.len() != self.dofs.len() {
            return Err(ConfigError::Invalid(format!(
                "{} names for {} dofs",
                names.len(),
                self.dofs.len()
            )));
        }
        self.names = names;
        Ok(self)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn size(&self) -> usize {
        self.dofs.len()
    }

    pub fn dof_order(&self, index: usize) -> DofOrder {
        self.dofs[index]
    }

    pub fn dofs(&self) -> &[DofOrder] {
        &self.dofs
    }

    pub fn scale(&self) -> &[f64] {
        &self.scale
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn set_time(&mut self, time: f64) {
        self.time = time;
    }

    pub fn orchestrator(&self) -> &AssemblyOrchestrator {
        &self.orchestrator
    }

    pub fn threads(&self) -> usize {
        self.orchestrator.threads()
    }

    /// Add `-F(x', x)` into `out`, rows shifted by `shift.row`.
    pub fn assemble_residual(
        &mut self,
        out: &mut [f64],
        x: &[f64],
        xp: &[f64],
        coef: f64,
        shift: AssemblyShift,
    ) -> Result<(), AssemblyError> {
        self.orchestrator.assemble_residual(out, x, xp, coef, shift)
    }

    pub fn assemble_jacobian(
        &mut self,
        matrix: &mut dyn MatrixHandler,
        x: &[f64],
        xp: &[f64],
        pass: JacobianPass,
    ) -> Result<(), AssemblyError> {
        self.orchestrator.assemble_jacobian(matrix, x, xp, pass)
    }

    pub fn after_convergence(&self, x: &[f64], xp: &[f64]) {
        self.orchestrator.after_convergence(x, xp);
    }
}
