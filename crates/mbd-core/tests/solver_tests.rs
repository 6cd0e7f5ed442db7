use mbd_core::matrix::{CompactMatrix, MatrixHandler, PatternMatrix};
use mbd_core::solver::{create_solver, LinearSolver, SolverType, DENSE_LIMIT};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

// ============================================================================
// Helpers
// ============================================================================

/// Tridiagonal matrix with a dominant diagonal, frozen to CSC.
fn tridiagonal(n: usize, seed: u64) -> CompactMatrix {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut pattern = PatternMatrix::new(n);
    for i in 0..n {
        pattern.add_entry(i, i, 4.0 + rng.gen_range(0.0..1.0)).unwrap();
        if i > 0 {
            pattern.add_entry(i, i - 1, rng.gen_range(-1.0..1.0)).unwrap();
            pattern.add_entry(i - 1, i, rng.gen_range(-1.0..1.0)).unwrap();
        }
    }
    pattern.freeze()
}

fn mult(m: &CompactMatrix, x: &[f64]) -> Vec<f64> {
    let n = m.size();
    (0..n)
        .map(|r| (0..n).map(|c| m.get(r, c) * x[c]).sum())
        .collect()
}

fn solve_with(solver: &mut dyn LinearSolver, m: &CompactMatrix, b: &[f64]) -> Vec<f64> {
    let (ap, ai, ax) = m.csc();
    solver.prepare(m.size());
    solver.analyze(ap, ai).unwrap();
    solver.factor(ap, ai, ax).unwrap();
    let mut x = b.to_vec();
    solver.solve(&mut x).unwrap();
    x
}

// ============================================================================
// Solver Selection Tests
// ============================================================================

#[test]
fn test_solver_type_parse() {
    assert_eq!(SolverType::parse("Dense"), Some(SolverType::Dense));
    assert_eq!(SolverType::parse("auto"), Some(SolverType::Auto));
    assert_eq!(SolverType::parse("naive"), None);
}

#[test]
fn test_auto_picks_dense_for_small_systems() {
    assert_eq!(create_solver(SolverType::Auto, 4).name(), "Dense");
    assert_eq!(create_solver(SolverType::Auto, DENSE_LIMIT - 1).name(), "Dense");
    assert_eq!(create_solver(SolverType::Dense, 200).name(), "Dense");
}

#[cfg(feature = "faer-solver")]
#[test]
fn test_auto_picks_faer_for_large_systems() {
    assert_eq!(create_solver(SolverType::Auto, DENSE_LIMIT).name(), "Faer");
    assert_eq!(create_solver(SolverType::Faer, 2).name(), "Faer");
}

// ============================================================================
// Solve Tests
// ============================================================================

#[test]
fn test_solvers_agree_on_compact_matrix() {
    let n = 60;
    let m = tridiagonal(n, 11);
    let b: Vec<f64> = (0..n).map(|i| (i as f64).cos()).collect();

    for kind in [SolverType::Dense, SolverType::Faer, SolverType::Auto] {
        let mut solver = create_solver(kind, n);
        let x = solve_with(solver.as_mut(), &m, &b);
        for (ax, b) in mult(&m, &x).iter().zip(&b) {
            assert!((ax - b).abs() < 1e-10, "{}: {ax} vs {b}", solver.name());
        }
    }
}

#[test]
fn test_refactor_with_new_values() {
    let n = 40;
    let mut m = tridiagonal(n, 5);
    let mut solver = create_solver(SolverType::Auto, n);
    let b = vec![1.0; n];
    // same pattern, doubled values: the solution halves
    let first = solve_with(solver.as_mut(), &m, &b);
    let copy = m.clone();
    m.add_values_from(&copy).unwrap();
    let second = solve_with(solver.as_mut(), &m, &b);
    for (a, b) in first.iter().zip(&second) {
        assert!((a - 2.0 * b).abs() < 1e-12);
    }
}

#[test]
fn test_singular_matrix_is_rejected() {
    let mut pattern = PatternMatrix::new(3);
    pattern.add_entry(0, 0, 1.0).unwrap();
    pattern.add_entry(1, 1, 1.0).unwrap();
    pattern.add_entry(2, 1, 1.0).unwrap();
    let m = pattern.freeze();
    let (ap, ai, ax) = m.csc();

    let mut solver = create_solver(SolverType::Dense, 3);
    assert!(solver.factor(ap, ai, ax).is_err());
}

#[test]
fn test_wrong_rhs_length_is_rejected() {
    let m = tridiagonal(5, 1);
    let (ap, ai, ax) = m.csc();
    let mut solver = create_solver(SolverType::Dense, 5);
    solver.factor(ap, ai, ax).unwrap();
    let mut rhs = vec![1.0; 4];
    assert!(solver.solve(&mut rhs).is_err());
}
