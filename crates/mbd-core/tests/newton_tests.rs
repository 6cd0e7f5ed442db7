use approx::assert_relative_eq;
use mbd_core::convergence::TestKind;
use mbd_core::error::{AssemblyError, MatrixError, NonlinearError};
use mbd_core::matrix::MatrixHandler;
use mbd_core::naive::NaiveConfig;
use mbd_core::newton::{
    NewtonConfig, NewtonOutcome, NewtonRaphsonSolver, NonlinearProblem, NonlinearSolver,
};
use mbd_core::solution::{
    create_solution_manager, CompactSolutionManager, NaiveSolutionManager, SolutionConfig,
    SolutionManager, SolutionManagerKind,
};
use mbd_core::solver::SolverType;

/// `A x = b` with a fixed 3x3 matrix.
struct Linear {
    x: Vec<f64>,
}

const A: [[f64; 3]; 3] = [[4.0, 1.0, 0.0], [1.0, 3.0, -1.0], [0.0, -1.0, 2.0]];
const B: [f64; 3] = [1.0, 2.0, 3.0];

impl NonlinearProblem for Linear {
    fn residual(&mut self, out: &mut [f64]) -> Result<(), AssemblyError> {
        for (r, row) in A.iter().enumerate() {
            let ax: f64 = row.iter().zip(&self.x).map(|(a, x)| a * x).sum();
            out[r] = B[r] - ax;
        }
        Ok(())
    }

    fn jacobian(&mut self, matrix: &mut dyn MatrixHandler) -> Result<(), AssemblyError> {
        for (r, row) in A.iter().enumerate() {
            for (c, &a) in row.iter().enumerate() {
                if a != 0.0 {
                    matrix.add_entry(r, c, a)?;
                }
            }
        }
        Ok(())
    }

    fn update(&mut self, delta: &[f64]) {
        for (x, d) in self.x.iter_mut().zip(delta) {
            *x += d;
        }
    }
}

/// `1 - x = 0` solved with a wrong constant slope: every step scales the
/// error by `1 - 1/slope`.
struct WrongSlope {
    x: f64,
    slope: f64,
}

impl NonlinearProblem for WrongSlope {
    fn residual(&mut self, out: &mut [f64]) -> Result<(), AssemblyError> {
        out[0] = 1.0 - self.x;
        Ok(())
    }

    fn jacobian(&mut self, matrix: &mut dyn MatrixHandler) -> Result<(), AssemblyError> {
        matrix.add_entry(0, 0, self.slope)?;
        Ok(())
    }

    fn update(&mut self, delta: &[f64]) {
        self.x += delta[0];
    }
}

fn naive_sm(n: usize) -> NaiveSolutionManager {
    NaiveSolutionManager::new(n, 1, NaiveConfig::default())
}

#[test]
fn test_linear_problem_converges_in_one_iteration() {
    for kind in [SolutionManagerKind::Naive, SolutionManagerKind::Compact] {
        let config = SolutionConfig {
            kind,
            threads: 2,
            solver: SolverType::Dense,
            ..Default::default()
        };
        let mut sm = create_solution_manager(3, &config).unwrap();
        let mut solver = NewtonRaphsonSolver::new(NewtonConfig {
            tolerance: 1e-12,
            ..Default::default()
        })
        .unwrap();
        let mut problem = Linear { x: vec![0.0; 3] };
        let outcome = solver.solve(&mut problem, sm.as_mut()).unwrap();
        assert_eq!(outcome.iterations(), 1);
        assert!(matches!(outcome, NewtonOutcome::Converged { .. }));

        assert_relative_eq!(problem.x[0], -1.0 / 9.0, epsilon = 1e-12);
        assert_relative_eq!(problem.x[1], 13.0 / 9.0, epsilon = 1e-12);
        assert_relative_eq!(problem.x[2], 20.0 / 9.0, epsilon = 1e-12);
    }
}

#[test]
fn test_converged_start_needs_no_iteration() {
    let mut solver = NewtonRaphsonSolver::new(NewtonConfig::default()).unwrap();
    let mut problem = Linear {
        x: vec![-1.0 / 9.0, 13.0 / 9.0, 20.0 / 9.0],
    };
    let outcome = solver.solve(&mut problem, &mut naive_sm(3)).unwrap();
    assert_eq!(outcome.iterations(), 0);
    assert_eq!(solver.total_jacobians(), 0);
}

#[test]
fn test_zero_tolerance_never_satisfied_by_residual() {
    let mut solver = NewtonRaphsonSolver::new(NewtonConfig {
        tolerance: 0.0,
        max_iterations: 3,
        ..Default::default()
    })
    .unwrap();
    let mut problem = Linear { x: vec![0.0; 3] };
    let err = solver.solve(&mut problem, &mut naive_sm(3)).unwrap_err();
    assert!(matches!(err, NonlinearError::NoConvergence { iterations: 4, .. }));
    assert_eq!(solver.total_jacobians(), 4);
}

#[test]
fn test_last_allowed_iteration_may_converge() {
    // the error halves at every step: 1, 0.5, 0.25, 0.125, 0.0625
    let run = |max_iterations: usize| {
        let mut solver = NewtonRaphsonSolver::new(NewtonConfig {
            tolerance: 0.1,
            max_iterations,
            ..Default::default()
        })
        .unwrap();
        let mut problem = WrongSlope { x: 0.0, slope: 2.0 };
        solver.solve(&mut problem, &mut naive_sm(1))
    };
    let outcome = run(3).unwrap();
    assert!(matches!(outcome, NewtonOutcome::Converged { iterations: 4, .. }));
    assert_relative_eq!(outcome_residual(outcome), 0.0625, epsilon = 1e-15);

    assert!(matches!(
        run(2).unwrap_err(),
        NonlinearError::NoConvergence { iterations: 3, .. }
    ));
}

fn outcome_residual(outcome: NewtonOutcome) -> f64 {
    match outcome {
        NewtonOutcome::Converged { residual, .. } => residual,
        NewtonOutcome::ConvergedOnSolution { solution, .. } => solution,
    }
}

#[test]
fn test_solution_test_stops_iterations() {
    let mut solver = NewtonRaphsonSolver::new(NewtonConfig {
        tolerance: 0.0,
        solution_tolerance: 1e-9,
        solution_test: TestKind::MinMax,
        ..Default::default()
    })
    .unwrap();
    let mut problem = Linear { x: vec![0.0; 3] };
    let outcome = solver.solve(&mut problem, &mut naive_sm(3)).unwrap();
    // the second increment is zero
    assert!(matches!(
        outcome,
        NewtonOutcome::ConvergedOnSolution { iterations: 2, .. }
    ));
}

#[test]
fn test_bounded_oscillation_is_no_convergence() {
    // half the true slope: the iterate jumps between 0 and 2
    let mut solver = NewtonRaphsonSolver::new(NewtonConfig {
        max_iterations: 8,
        ..Default::default()
    })
    .unwrap();
    let mut problem = WrongSlope { x: 0.0, slope: 0.5 };
    let err = solver.solve(&mut problem, &mut naive_sm(1)).unwrap_err();
    match err {
        NonlinearError::NoConvergence {
            iterations,
            residual,
        } => {
            assert_eq!(iterations, 9);
            assert_relative_eq!(residual, 1.0, epsilon = 1e-12);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_relative_eq!(problem.x, 2.0, epsilon = 1e-12);
}

#[test]
fn test_growing_residual_is_divergence() {
    // the first step lands near 1e200 and the norm overflows
    let mut solver = NewtonRaphsonSolver::new(NewtonConfig {
        max_iterations: 8,
        ..Default::default()
    })
    .unwrap();
    let mut problem = WrongSlope {
        x: 0.0,
        slope: 1e-200,
    };
    let err = solver.solve(&mut problem, &mut naive_sm(1)).unwrap_err();
    assert!(matches!(err, NonlinearError::Diverged(e) if !e.is_finite()), "{err:?}");
    assert_eq!(solver.total_jacobians(), 1);
}

#[test]
fn test_keep_jacobian_across_solves() {
    let config = NewtonConfig {
        tolerance: 1e-12,
        true_newton: false,
        iterations_before_assembly: 50,
        keep_jacobian: true,
        ..Default::default()
    };
    let mut solver = NewtonRaphsonSolver::new(config).unwrap();
    let mut sm = naive_sm(3);
    for _ in 0..3 {
        let mut problem = Linear { x: vec![0.0; 3] };
        solver.solve(&mut problem, &mut sm).unwrap();
    }
    assert_eq!(solver.total_jacobians(), 1);
    assert_eq!(solver.performed_iterations(), 3);

    solver.reset();
    let mut problem = Linear { x: vec![0.0; 3] };
    solver.solve(&mut problem, &mut sm).unwrap();
    assert_eq!(solver.total_jacobians(), 2);
}

/// Gains an off-diagonal entry after the first Jacobian, or keeps asking
/// for a new matrix pattern when `always` is set.
struct Restructuring {
    x: Vec<f64>,
    jacobians: usize,
    always: bool,
}

impl NonlinearProblem for Restructuring {
    fn residual(&mut self, out: &mut [f64]) -> Result<(), AssemblyError> {
        out[0] = 1.0 - 2.0 * self.x[0];
        out[1] = 2.0 - 2.0 * self.x[1] - 0.5 * self.x[0];
        Ok(())
    }

    fn jacobian(&mut self, matrix: &mut dyn MatrixHandler) -> Result<(), AssemblyError> {
        self.jacobians += 1;
        if self.always {
            return Err(AssemblyError::RebuildMatrix);
        }
        matrix.add_entry(0, 0, 2.0)?;
        matrix.add_entry(1, 1, 2.0)?;
        if self.jacobians > 1 {
            matrix.add_entry(1, 0, 0.5)?;
        }
        Ok(())
    }

    fn update(&mut self, delta: &[f64]) {
        for (x, d) in self.x.iter_mut().zip(delta) {
            *x += d;
        }
    }
}

#[test]
fn test_compact_pattern_rebuilt_on_new_entry() {
    let mut sm = CompactSolutionManager::new(2, SolverType::Dense);
    let mut solver = NewtonRaphsonSolver::new(NewtonConfig {
        tolerance: 1e-12,
        ..Default::default()
    })
    .unwrap();
    let mut problem = Restructuring {
        x: vec![0.0; 2],
        jacobians: 0,
        always: false,
    };
    solver.solve(&mut problem, &mut sm).unwrap();
    assert_eq!(sm.rebuilds, 1);
    assert!(sm.is_frozen());
    assert_relative_eq!(problem.x[0], 0.5, epsilon = 1e-12);
    assert_relative_eq!(problem.x[1], 0.875, epsilon = 1e-12);

    // a compact matrix refuses the entry directly
    assert!(matches!(
        sm.matrix().add_entry(0, 1, 1.0),
        Err(MatrixError::RebuildMatrix { row: 0, col: 1 })
    ));
}

#[test]
fn test_rebuild_retries_are_capped() {
    let mut solver = NewtonRaphsonSolver::new(NewtonConfig {
        max_rebuild_retries: 2,
        ..Default::default()
    })
    .unwrap();
    let mut problem = Restructuring {
        x: vec![0.0; 2],
        jacobians: 0,
        always: true,
    };
    let err = solver.solve(&mut problem, &mut naive_sm(2)).unwrap_err();
    assert_eq!(err, NonlinearError::RebuildLimit { retries: 3 });
    assert_eq!(problem.jacobians, 3);
}

/// Diagonal `2 x = 1` whose next residual or Jacobian call can be made to
/// fail once.
struct Flaky {
    x: f64,
    changed: bool,
    fail_jacobian: Option<AssemblyError>,
    jacobians: usize,
}

impl Flaky {
    fn new() -> Self {
        Self {
            x: 0.0,
            changed: false,
            fail_jacobian: None,
            jacobians: 0,
        }
    }
}

impl NonlinearProblem for Flaky {
    fn residual(&mut self, out: &mut [f64]) -> Result<(), AssemblyError> {
        out[0] = 1.0 - 2.0 * self.x;
        if std::mem::take(&mut self.changed) {
            return Err(AssemblyError::ChangedStructure);
        }
        Ok(())
    }

    fn jacobian(&mut self, matrix: &mut dyn MatrixHandler) -> Result<(), AssemblyError> {
        self.jacobians += 1;
        if let Some(err) = self.fail_jacobian.take() {
            return Err(err);
        }
        matrix.add_entry(0, 0, 2.0)?;
        Ok(())
    }

    fn update(&mut self, delta: &[f64]) {
        self.x += delta[0];
    }
}

#[test]
fn test_structure_change_in_jacobian_is_not_retried() {
    let mut solver = NewtonRaphsonSolver::new(NewtonConfig::default()).unwrap();
    let mut problem = Flaky::new();
    problem.fail_jacobian = Some(AssemblyError::ChangedStructure);
    let err = solver.solve(&mut problem, &mut naive_sm(1)).unwrap_err();
    assert_eq!(err, NonlinearError::Assembly(AssemblyError::ChangedStructure));
    assert_eq!(problem.jacobians, 1);
}

#[test]
fn test_failed_jacobian_is_not_reused() {
    let mut solver = NewtonRaphsonSolver::new(NewtonConfig {
        tolerance: 1e-12,
        true_newton: false,
        iterations_before_assembly: 50,
        keep_jacobian: true,
        honor_jacobian_request: true,
        ..Default::default()
    })
    .unwrap();
    let mut sm = naive_sm(1);
    let mut problem = Flaky::new();
    solver.solve(&mut problem, &mut sm).unwrap();
    assert_eq!(problem.jacobians, 1);

    // the forced Jacobian fails after the matrix was reset
    problem.x = 0.0;
    problem.changed = true;
    problem.fail_jacobian = Some(AssemblyError::DivideByZero {
        element: 7,
        reason: "zero length".into(),
    });
    let err = solver.solve(&mut problem, &mut sm).unwrap_err();
    assert!(matches!(
        err,
        NonlinearError::Assembly(AssemblyError::DivideByZero { element: 7, .. })
    ));
    assert_eq!(problem.jacobians, 2);

    // the Jacobian age alone would skip the assembly here
    problem.x = 0.0;
    let outcome = solver.solve(&mut problem, &mut sm).unwrap();
    assert_eq!(outcome.iterations(), 1);
    assert_eq!(problem.jacobians, 3);
    assert_relative_eq!(problem.x, 0.5, epsilon = 1e-12);
}

#[test]
fn test_singular_jacobian_propagates() {
    struct Singular;
    impl NonlinearProblem for Singular {
        fn residual(&mut self, out: &mut [f64]) -> Result<(), AssemblyError> {
            out.fill(1.0);
            Ok(())
        }
        fn jacobian(&mut self, matrix: &mut dyn MatrixHandler) -> Result<(), AssemblyError> {
            matrix.add_entry(0, 0, 1.0)?;
            matrix.add_entry(1, 0, 1.0)?;
            Ok(())
        }
        fn update(&mut self, _delta: &[f64]) {}
    }

    let mut solver = NewtonRaphsonSolver::new(NewtonConfig::default()).unwrap();
    let err = solver.solve(&mut Singular, &mut naive_sm(2)).unwrap_err();
    assert!(matches!(err, NonlinearError::Solver(_)));
}
