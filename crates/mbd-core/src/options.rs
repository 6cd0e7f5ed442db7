/// # Adding a solver option
///
/// 1. Add an entry to `OPTION_DEFS`:
///    ```ignore
///    OptionDef {
///        name: "myoption",
///        description: "What this option controls",
///        default: OptionValue::Float(1.0),
///        range: OptionRange::FloatRange(0.0, 100.0),
///    },
///    ```
///
/// 2. Read it where a config is built:
///    ```ignore
///    let val = options.get_float("myoption");
///    ```
///
/// Parsing, range checks and redefinition warnings are handled by
/// [`SolverOptions::set`]. Options are read once while building the
/// configs, never inside the step loop.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::convergence::TestKind;
use crate::engine::EngineConfig;
use crate::integrator::IntegratorKind;
use crate::naive::NaiveConfig;
use crate::newton::NewtonConfig;
use crate::solution::{SolutionConfig, SolutionManagerKind};
use crate::solver::SolverType;

/// Typed value for a solver option.
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
}

impl std::fmt::Display for OptionValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OptionValue::Int(v) => write!(f, "{}", v),
            OptionValue::Float(v) => write!(f, "{}", v),
            OptionValue::Str(v) => write!(f, "{}", v),
            OptionValue::Bool(v) => write!(f, "{}", v),
        }
    }
}

/// Range constraint for validating option values.
#[derive(Debug, Clone)]
pub enum OptionRange {
    None,
    /// Inclusive range for integers.
    IntRange(i64, i64),
    /// Exclusive range for floats.
    FloatRange(f64, f64),
    /// Inclusive range for floats.
    FloatClosed(f64, f64),
    StringEnum(&'static [&'static str]),
}

/// Static definition of one solver option.
#[derive(Debug, Clone)]
pub struct OptionDef {
    pub name: &'static str,
    pub description: &'static str,
    pub default: OptionValue,
    pub range: OptionRange,
}

const TESTS: &[&str] = &["none", "norm", "minmax"];

// `OptionValue::Str` cannot be built in a const, so string defaults are
// resolved through `default_str`.
const OPTION_DEFS: &[OptionDef] = &[
    OptionDef {
        name: "tolerance",
        description: "Residual test tolerance",
        default: OptionValue::Float(1e-6),
        range: OptionRange::FloatRange(0.0, 1e3),
    },
    OptionDef {
        name: "max_iterations",
        description: "Newton iteration limit per step",
        default: OptionValue::Int(20),
        range: OptionRange::IntRange(1, 10000),
    },
    OptionDef {
        name: "solution_tolerance",
        description: "Solution increment tolerance, 0 disables the test",
        default: OptionValue::Float(0.0),
        range: OptionRange::FloatClosed(0.0, 1e3),
    },
    OptionDef {
        name: "true_newton",
        description: "Assemble the Jacobian at every iteration",
        default: OptionValue::Bool(true),
        range: OptionRange::None,
    },
    OptionDef {
        name: "iterations_before_assembly",
        description: "Jacobian reuse count of modified Newton",
        default: OptionValue::Int(1),
        range: OptionRange::IntRange(1, 1000),
    },
    OptionDef {
        name: "keep_jacobian",
        description: "Keep the Jacobian age across steps",
        default: OptionValue::Bool(false),
        range: OptionRange::None,
    },
    OptionDef {
        name: "honor_jacobian_request",
        description: "Reassemble when an element reports a structure change",
        default: OptionValue::Bool(false),
        range: OptionRange::None,
    },
    OptionDef {
        name: "max_rebuild_retries",
        description: "Consecutive matrix rebuilds allowed in one assembly",
        default: OptionValue::Int(3),
        range: OptionRange::IntRange(0, 100),
    },
    OptionDef {
        name: "residual_test",
        description: "Residual test: none, norm or minmax",
        default: OptionValue::Int(0),
        range: OptionRange::StringEnum(TESTS),
    },
    OptionDef {
        name: "solution_test",
        description: "Solution test: none, norm or minmax",
        default: OptionValue::Int(0),
        range: OptionRange::StringEnum(TESTS),
    },
    OptionDef {
        name: "scale_tests",
        description: "Scale test entries by the dof scale",
        default: OptionValue::Bool(false),
        range: OptionRange::None,
    },
    OptionDef {
        name: "print_residual",
        description: "Log the residual at each iteration",
        default: OptionValue::Bool(false),
        range: OptionRange::None,
    },
    OptionDef {
        name: "print_solution",
        description: "Log the solution at each iteration",
        default: OptionValue::Bool(false),
        range: OptionRange::None,
    },
    OptionDef {
        name: "solver",
        description: "Solution manager: naive, compact or schur",
        default: OptionValue::Int(0),
        range: OptionRange::StringEnum(&["naive", "compact", "cc", "schur"]),
    },
    OptionDef {
        name: "linear_solver",
        description: "Backend of the compact manager: dense, faer or auto",
        default: OptionValue::Int(0),
        range: OptionRange::StringEnum(&["dense", "faer", "auto"]),
    },
    OptionDef {
        name: "threads",
        description: "Threads of the naive factorization and solve",
        default: OptionValue::Int(1),
        range: OptionRange::IntRange(1, 256),
    },
    OptionDef {
        name: "assembly_threads",
        description: "Threads of residual and Jacobian assembly",
        default: OptionValue::Int(1),
        range: OptionRange::IntRange(1, 256),
    },
    OptionDef {
        name: "min_pivot",
        description: "Relative pivot threshold of the naive factorization",
        default: OptionValue::Float(1e-8),
        range: OptionRange::FloatRange(0.0, 1.0),
    },
    OptionDef {
        name: "spin_deadline_ms",
        description: "Spin diagnostic deadline, 0 waits forever",
        default: OptionValue::Int(0),
        range: OptionRange::IntRange(0, 3_600_000),
    },
    OptionDef {
        name: "integrator",
        description: "Step integrator",
        default: OptionValue::Int(0),
        range: OptionRange::StringEnum(&[
            "implicit-euler",
            "ie",
            "crank-nicolson",
            "cn",
            "multistep",
            "ms",
            "hope",
            "third-order",
        ]),
    },
    OptionDef {
        name: "rho",
        description: "Spectral radius at infinity",
        default: OptionValue::Float(0.6),
        range: OptionRange::FloatClosed(0.0, 1.0),
    },
    OptionDef {
        name: "algebraic_rho",
        description: "Spectral radius at infinity of algebraic dofs",
        default: OptionValue::Float(0.6),
        range: OptionRange::FloatClosed(0.0, 1.0),
    },
    OptionDef {
        name: "modified_residual_test",
        description: "Scale the residual test by the derivative magnitude",
        default: OptionValue::Bool(false),
        range: OptionRange::None,
    },
    OptionDef {
        name: "dt",
        description: "Time step",
        default: OptionValue::Float(1e-3),
        range: OptionRange::FloatRange(0.0, 1e6),
    },
    OptionDef {
        name: "steps",
        description: "Number of time steps",
        default: OptionValue::Int(1000),
        range: OptionRange::IntRange(0, i64::MAX),
    },
    OptionDef {
        name: "derivatives",
        description: "Solve for initial derivatives",
        default: OptionValue::Bool(false),
        range: OptionRange::None,
    },
    OptionDef {
        name: "derivative_coef",
        description: "Coefficient of the initial-derivative solve",
        default: OptionValue::Float(1e-6),
        range: OptionRange::FloatRange(0.0, 1.0),
    },
    OptionDef {
        name: "record_every",
        description: "Trajectory decimation",
        default: OptionValue::Int(1),
        range: OptionRange::IntRange(1, i64::MAX),
    },
];

fn default_str(name: &str) -> Option<&'static str> {
    match name {
        "residual_test" | "solution_test" => Some("norm"),
        "solver" => Some("naive"),
        "linear_solver" => Some("auto"),
        "integrator" => Some("multistep"),
        _ => None,
    }
}

fn default_value(def: &OptionDef) -> OptionValue {
    match default_str(def.name) {
        Some(s) => OptionValue::Str(s.to_string()),
        None => def.default.clone(),
    }
}

/// A stored option entry with its current value and whether the user set it.
#[derive(Debug, Clone)]
struct OptionEntry {
    value: OptionValue,
    is_set: bool,
}

/// Container for all solver options, populated with defaults.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    entries: HashMap<String, OptionEntry>,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl SolverOptions {
    pub fn new() -> Self {
        let mut entries = HashMap::new();
        for def in OPTION_DEFS {
            entries.insert(
                def.name.to_string(),
                OptionEntry {
                    value: default_value(def),
                    is_set: false,
                },
            );
        }
        Self { entries }
    }

    pub fn definitions() -> &'static [OptionDef] {
        OPTION_DEFS
    }

    /// Set an option by name from a raw string value.
    ///
    /// Unknown names, unparsable values and out-of-range values are
    /// warned about and ignored. Returns whether the value was stored.
    pub fn set(&mut self, key: &str, raw_value: &str) -> bool {
        let key_lower = key.to_ascii_lowercase().replace('-', "_");

        let Some(def) = OPTION_DEFS.iter().find(|d| d.name == key_lower) else {
            warn!(option = key, "unknown option ignored");
            return false;
        };

        let parsed = match default_value(def) {
            OptionValue::Float(_) => match raw_value.trim().parse::<f64>() {
                Ok(v) => OptionValue::Float(v),
                Err(_) => {
                    warn!(option = %key_lower, value = raw_value, "not a valid number, ignored");
                    return false;
                }
            },
            OptionValue::Int(_) => match raw_value.trim().parse::<i64>() {
                Ok(v) => OptionValue::Int(v),
                Err(_) => {
                    warn!(option = %key_lower, value = raw_value, "not a valid integer, ignored");
                    return false;
                }
            },
            OptionValue::Str(_) => OptionValue::Str(raw_value.trim().to_ascii_lowercase()),
            OptionValue::Bool(_) => match raw_value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => OptionValue::Bool(true),
                "0" | "false" | "no" | "off" => OptionValue::Bool(false),
                _ => {
                    warn!(option = %key_lower, value = raw_value, "not a valid boolean, ignored");
                    return false;
                }
            },
        };

        if !validate_range(&parsed, &def.range) {
            warn!(
                option = %key_lower,
                value = %parsed,
                range = %format_range(&def.range),
                "value out of range, keeping {}",
                self.value(&key_lower).map(|v| v.to_string()).unwrap_or_default()
            );
            return false;
        }

        if let Some(entry) = self.entries.get(&key_lower) {
            if entry.is_set {
                warn!(option = %key_lower, old = %entry.value, new = %parsed, "option redefined");
            }
        }

        self.entries.insert(
            key_lower,
            OptionEntry {
                value: parsed,
                is_set: true,
            },
        );
        true
    }

    /// Apply `key=value` pairs.
    pub fn set_all<'a>(&mut self, pairs: impl IntoIterator<Item = (&'a str, &'a str)>) {
        for (key, value) in pairs {
            self.set(key, value);
        }
    }

    fn value(&self, key: &str) -> Option<&OptionValue> {
        self.entries.get(key).map(|e| &e.value)
    }

    pub fn get_float(&self, key: &str) -> f64 {
        match self.value(key) {
            Some(OptionValue::Float(v)) => *v,
            _ => 0.0,
        }
    }

    pub fn get_int(&self, key: &str) -> i64 {
        match self.value(key) {
            Some(OptionValue::Int(v)) => *v,
            _ => 0,
        }
    }

    pub fn get_usize(&self, key: &str) -> usize {
        usize::try_from(self.get_int(key)).unwrap_or(0)
    }

    pub fn get_string(&self, key: &str) -> &str {
        match self.value(key) {
            Some(OptionValue::Str(v)) => v.as_str(),
            _ => "",
        }
    }

    pub fn get_bool(&self, key: &str) -> bool {
        matches!(self.value(key), Some(OptionValue::Bool(true)))
    }

    /// Check whether the user explicitly set this option.
    pub fn is_set(&self, key: &str) -> bool {
        self.entries.get(key).map_or(false, |e| e.is_set)
    }

    /// Log all user-set options.
    pub fn log_user_options(&self) {
        let mut user_set: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_set)
            .collect();
        user_set.sort_by_key(|(name, _)| (*name).clone());
        for (name, entry) in &user_set {
            info!(option = %name, value = %entry.value, "user option");
        }
    }

    pub fn newton_config(&self) -> NewtonConfig {
        NewtonConfig {
            tolerance: self.get_float("tolerance"),
            max_iterations: self.get_usize("max_iterations"),
            solution_tolerance: self.get_float("solution_tolerance"),
            true_newton: self.get_bool("true_newton"),
            iterations_before_assembly: self.get_usize("iterations_before_assembly"),
            keep_jacobian: self.get_bool("keep_jacobian"),
            honor_jacobian_request: self.get_bool("honor_jacobian_request"),
            max_rebuild_retries: self.get_usize("max_rebuild_retries"),
            print_residual: self.get_bool("print_residual"),
            print_solution: self.get_bool("print_solution"),
            residual_test: TestKind::parse(self.get_string("residual_test")).unwrap_or_default(),
            solution_test: TestKind::parse(self.get_string("solution_test")).unwrap_or_default(),
            scale_tests: self.get_bool("scale_tests"),
        }
    }

    pub fn naive_config(&self) -> NaiveConfig {
        NaiveConfig {
            min_pivot: self.get_float("min_pivot"),
            spin_deadline_ms: u64::try_from(self.get_int("spin_deadline_ms")).unwrap_or(0),
        }
    }

    /// Solution manager settings; a Schur partition must be added by the
    /// caller.
    pub fn solution_config(&self) -> SolutionConfig {
        SolutionConfig {
            kind: SolutionManagerKind::parse(self.get_string("solver")).unwrap_or_default(),
            threads: self.get_usize("threads"),
            solver: SolverType::parse(self.get_string("linear_solver")).unwrap_or_default(),
            naive: self.naive_config(),
            partition: None,
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            initial_time: 0.0,
            dt: self.get_float("dt"),
            steps: self.get_usize("steps"),
            integrator: IntegratorKind::parse(self.get_string("integrator")).unwrap_or_default(),
            rho: self.get_float("rho"),
            algebraic_rho: self.get_float("algebraic_rho"),
            modified_residual_test: self.get_bool("modified_residual_test"),
            derivatives: self.get_bool("derivatives"),
            derivative_coef: self.get_float("derivative_coef"),
            record_every: self.get_usize("record_every"),
        }
    }

    pub fn assembly_threads(&self) -> usize {
        self.get_usize("assembly_threads").max(1)
    }
}

fn validate_range(value: &OptionValue, range: &OptionRange) -> bool {
    match (value, range) {
        (_, OptionRange::None) => true,
        (OptionValue::Float(v), OptionRange::FloatRange(min, max)) => *v > *min && *v < *max,
        (OptionValue::Float(v), OptionRange::FloatClosed(min, max)) => *v >= *min && *v <= *max,
        (OptionValue::Int(v), OptionRange::IntRange(min, max)) => *v >= *min && *v <= *max,
        (OptionValue::Str(v), OptionRange::StringEnum(allowed)) => {
            allowed.iter().any(|a| a.eq_ignore_ascii_case(v))
        }
        _ => true,
    }
}

fn format_range(range: &OptionRange) -> String {
    match range {
        OptionRange::None => "no range".to_string(),
        OptionRange::IntRange(min, max) => format!("{} to {}", min, max),
        OptionRange::FloatRange(min, max) => format!("{} to {} exclusive", min, max),
        OptionRange::FloatClosed(min, max) => format!("{} to {}", min, max),
        OptionRange::StringEnum(values) => format!("one of: {}", values.join(", ")),
    }
}
