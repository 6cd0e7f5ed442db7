//! Nonlinear solving core for multibody dynamics.
//!
//! A step integrator turns each time step into a nonlinear problem, the
//! Newton-Raphson solver drives residual and Jacobian assembly over the
//! model elements, and a solution manager factors and solves the linear
//! systems. The naive sparse LU kernel and the assembly run on several
//! threads; the Schur manager splits the system over domains.

pub mod assembly;
pub mod convergence;
pub mod csv_export;
pub mod dae;
pub mod engine;
pub mod error;
pub mod integrator;
pub mod json_export;
pub mod matrix;
pub mod model;
pub mod naive;
pub mod newton;
pub mod options;
pub mod pool;
pub mod schur;
pub mod solution;
pub mod solver;
pub mod sync;

pub use engine::{Engine, EngineConfig, Trajectory};
pub use error::{MbdError, MbdResult};
pub use model::{DofOrder, Model};
pub use options::SolverOptions;
