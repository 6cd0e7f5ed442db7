//! Direct solvers for the frozen compressed-column Jacobian.
//!
//! [`DenseSolver`] scatters the CSC arrays into a row-major block and runs
//! LU with partial pivoting; the Schur manager also uses it for the
//! interface system. [`FaerSolver`] (feature `faer-solver`, on by default)
//! keeps the symbolic LU of the current pattern and only refactors the
//! values while the pattern holds.

use serde::{Deserialize, Serialize};

pub use crate::error::SolverError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SolverType {
    Dense,
    Faer,
    /// Dense below [`DENSE_LIMIT`] unknowns, sparse above.
    #[default]
    Auto,
}

impl SolverType {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "dense" => Some(SolverType::Dense),
            "faer" => Some(SolverType::Faer),
            "auto" => Some(SolverType::Auto),
            _ => None,
        }
    }
}

/// Backend of the compact solution manager.
pub trait LinearSolver: Send {
    fn name(&self) -> &'static str;

    /// Size the solver for `n` unknowns. A new size drops any cached state.
    fn prepare(&mut self, n: usize);

    /// Symbolic step for the pattern `(ap, ai)`.
    fn analyze(&mut self, ap: &[i64], ai: &[i64]) -> Result<(), SolverError>;

    fn factor(&mut self, ap: &[i64], ai: &[i64], ax: &[f64]) -> Result<(), SolverError>;

    /// Overwrite `rhs` with the solution.
    fn solve(&mut self, rhs: &mut [f64]) -> Result<(), SolverError>;

    /// The matrix pattern was rebuilt.
    fn reset_pattern(&mut self);
}

pub const DENSE_LIMIT: usize = 32;

pub fn create_solver(kind: SolverType, n: usize) -> Box<dyn LinearSolver> {
    let sparse = match kind {
        SolverType::Dense => false,
        SolverType::Faer => true,
        SolverType::Auto => n >= DENSE_LIMIT,
    };
    #[cfg(feature = "faer-solver")]
    {
        if sparse {
            return Box::new(FaerSolver::new(n));
        }
    }
    #[cfg(not(feature = "faer-solver"))]
    {
        if sparse && kind == SolverType::Faer {
            tracing::warn!("built without faer, using the dense solver");
        }
    }
    Box::new(DenseSolver::new(n))
}

fn check_csc(n: usize, ap: &[i64], ai: &[i64]) -> Result<(), SolverError> {
    if ap.len() != n + 1 {
        return Err(SolverError::InvalidMatrix {
            reason: format!("{} column pointers for {n} columns", ap.len()),
        });
    }
    if ai.iter().any(|&r| r < 0 || r as usize >= n) {
        return Err(SolverError::InvalidMatrix {
            reason: format!("row index outside 0..{n}"),
        });
    }
    Ok(())
}

/// Row-major LU with partial pivoting.
#[derive(Debug, Clone, Default)]
pub struct DenseSolver {
    n: usize,
    lu: Vec<f64>,
    /// `perm[k]`: original row now at position `k`.
    perm: Vec<usize>,
    factored: bool,
}

impl DenseSolver {
    pub fn new(n: usize) -> Self {
        let mut solver = Self::default();
        solver.resize(n);
        solver
    }

    fn resize(&mut self, n: usize) {
        self.n = n;
        self.lu.clear();
        self.lu.resize(n * n, 0.0);
        self.perm = (0..n).collect();
        self.factored = false;
    }

    /// Factor the row-major block `values` of size `n x n`.
    pub fn factor_dense(&mut self, n: usize, values: &[f64]) -> Result<(), SolverError> {
        if values.len() != n * n {
            return Err(SolverError::InvalidMatrix {
                reason: format!("dense block has {} values, expected {}", values.len(), n * n),
            });
        }
        if n != self.n {
            self.resize(n);
        }
        self.lu.copy_from_slice(values);
        self.decompose()
    }

    fn decompose(&mut self) -> Result<(), SolverError> {
        let n = self.n;
        self.factored = false;
        for (k, p) in self.perm.iter_mut().enumerate() {
            *p = k;
        }
        for k in 0..n {
            let (pivot, largest) = (k..n)
                .map(|r| (r, self.lu[r * n + k].abs()))
                .fold((k, 0.0), |best, cand| if cand.1 > best.1 { cand } else { best });
            if largest == 0.0 {
                return Err(SolverError::SingularMatrix { pivot: k });
            }
            if pivot != k {
                for j in 0..n {
                    self.lu.swap(k * n + j, pivot * n + j);
                }
                self.perm.swap(k, pivot);
            }

            let (head, tail) = self.lu.split_at_mut((k + 1) * n);
            let pivot_row = &head[k * n..];
            let inv = 1.0 / pivot_row[k];
            for row in tail.chunks_exact_mut(n) {
                let mul = row[k] * inv;
                row[k] = mul;
                if mul != 0.0 {
                    for (a, p) in row[k + 1..].iter_mut().zip(&pivot_row[k + 1..]) {
                        *a -= mul * p;
                    }
                }
            }
        }
        self.factored = true;
        Ok(())
    }
}

impl LinearSolver for DenseSolver {
    fn name(&self) -> &'static str {
        "Dense"
    }

    fn prepare(&mut self, n: usize) {
        if n != self.n {
            self.resize(n);
        }
    }

    fn analyze(&mut self, ap: &[i64], ai: &[i64]) -> Result<(), SolverError> {
        check_csc(self.n, ap, ai)
    }

    fn factor(&mut self, ap: &[i64], ai: &[i64], ax: &[f64]) -> Result<(), SolverError> {
        let n = self.n;
        check_csc(n, ap, ai)?;
        self.lu.fill(0.0);
        for col in 0..n {
            for k in ap[col] as usize..ap[col + 1] as usize {
                self.lu[ai[k] as usize * n + col] += ax[k];
            }
        }
        self.decompose()
    }

    fn solve(&mut self, rhs: &mut [f64]) -> Result<(), SolverError> {
        let n = self.n;
        if !self.factored {
            return Err(SolverError::SolveFailed);
        }
        if rhs.len() != n {
            return Err(SolverError::InvalidMatrix {
                reason: format!("right-hand side of length {} for {n} unknowns", rhs.len()),
            });
        }
        let mut y: Vec<f64> = self.perm.iter().map(|&p| rhs[p]).collect();
        for i in 0..n {
            let row = &self.lu[i * n..i * n + i];
            let dot: f64 = row.iter().zip(&y[..i]).map(|(a, b)| a * b).sum();
            y[i] -= dot;
        }
        for i in (0..n).rev() {
            let row = &self.lu[i * n..(i + 1) * n];
            let dot: f64 = row[i + 1..].iter().zip(&y[i + 1..]).map(|(a, b)| a * b).sum();
            y[i] = (y[i] - dot) / row[i];
        }
        rhs.copy_from_slice(&y);
        Ok(())
    }

    fn reset_pattern(&mut self) {
        self.factored = false;
    }
}

#[cfg(feature = "faer-solver")]
pub use sparse::FaerSolver;

#[cfg(feature = "faer-solver")]
mod sparse {
    use faer::prelude::SpSolver;
    use faer::sparse::linalg::solvers::{Lu, SymbolicLu};
    use faer::sparse::SparseColMat;
    use faer::Mat;

    use tracing::trace;

    use super::{check_csc, LinearSolver, SolverError};

    fn to_faer(
        n: usize,
        ap: &[i64],
        ai: &[i64],
        ax: &[f64],
    ) -> Result<SparseColMat<usize, f64>, SolverError> {
        check_csc(n, ap, ai)?;
        let mut triplets = Vec::with_capacity(ax.len());
        for col in 0..n {
            let (start, end) = (ap[col] as usize, ap[col + 1] as usize);
            triplets.extend((start..end).map(|k| (ai[k] as usize, col, ax[k])));
        }
        SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets).map_err(|e| {
            SolverError::InvalidMatrix {
                reason: format!("{e:?}"),
            }
        })
    }

    /// Sparse LU with the symbolic analysis kept per pattern.
    pub struct FaerSolver {
        n: usize,
        pattern: Option<(Vec<i64>, Vec<i64>, SymbolicLu<usize>)>,
        lu: Option<Lu<usize, f64>>,
        pub factorizations: usize,
    }

    // Safety: the factorization owns its buffers and is only reached through
    // `&mut self`.
    unsafe impl Send for FaerSolver {}

    impl FaerSolver {
        pub fn new(n: usize) -> Self {
            Self {
                n,
                pattern: None,
                lu: None,
                factorizations: 0,
            }
        }

        fn symbolic_for(&mut self, ap: &[i64], ai: &[i64]) -> Result<SymbolicLu<usize>, SolverError> {
            if let Some((p, i, symbolic)) = &self.pattern {
                if p == ap && i == ai {
                    return Ok(symbolic.clone());
                }
            }
            let ones = vec![1.0; ai.len()];
            let mat = to_faer(self.n, ap, ai, &ones)?;
            let symbolic =
                SymbolicLu::try_new(mat.symbolic()).map_err(|_| SolverError::AnalyzeFailed)?;
            trace!(n = self.n, nnz = ai.len(), "sparse symbolic analysis");
            self.pattern = Some((ap.to_vec(), ai.to_vec(), symbolic.clone()));
            Ok(symbolic)
        }
    }

    impl LinearSolver for FaerSolver {
        fn name(&self) -> &'static str {
            "Faer"
        }

        fn prepare(&mut self, n: usize) {
            if n != self.n {
                self.reset_pattern();
                self.n = n;
            }
        }

        fn analyze(&mut self, ap: &[i64], ai: &[i64]) -> Result<(), SolverError> {
            self.symbolic_for(ap, ai).map(|_| ())
        }

        fn factor(&mut self, ap: &[i64], ai: &[i64], ax: &[f64]) -> Result<(), SolverError> {
            self.lu = None;
            let symbolic = self.symbolic_for(ap, ai)?;
            let mat = to_faer(self.n, ap, ai, ax)?;
            let lu = Lu::try_new_with_symbolic(symbolic, mat.as_ref())
                .map_err(|_| SolverError::FactorFailed)?;
            self.lu = Some(lu);
            self.factorizations += 1;
            Ok(())
        }

        fn solve(&mut self, rhs: &mut [f64]) -> Result<(), SolverError> {
            let lu = self.lu.as_ref().ok_or(SolverError::SolveFailed)?;
            if rhs.len() != self.n {
                return Err(SolverError::InvalidMatrix {
                    reason: format!("right-hand side of length {} for {} unknowns", rhs.len(), self.n),
                });
            }
            let x = lu.solve(&Mat::from_fn(self.n, 1, |i, _| rhs[i]));
            for (i, value) in rhs.iter_mut().enumerate() {
                *value = x[(i, 0)];
            }
            // a singular sparse factor shows up as non-finite values
            if rhs.iter().any(|v| !v.is_finite()) {
                return Err(SolverError::SolveFailed);
            }
            Ok(())
        }

        fn reset_pattern(&mut self) {
            self.pattern = None;
            self.lu = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// [[4, 1], [2, 3]] in CSC form.
    fn small_csc() -> (Vec<i64>, Vec<i64>, Vec<f64>) {
        (vec![0, 2, 4], vec![0, 1, 0, 1], vec![4.0, 2.0, 1.0, 3.0])
    }

    #[test]
    fn test_dense_solve_small() {
        let (ap, ai, ax) = small_csc();
        let mut solver = DenseSolver::new(2);
        solver.factor(&ap, &ai, &ax).unwrap();
        let mut rhs = vec![5.0, 5.0];
        solver.solve(&mut rhs).unwrap();
        assert!((rhs[0] - 1.0).abs() < 1e-12);
        assert!((rhs[1] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_dense_singular() {
        let mut solver = DenseSolver::new(2);
        let err = solver.factor_dense(2, &[1.0, 2.0, 2.0, 4.0]).unwrap_err();
        assert_eq!(err, SolverError::SingularMatrix { pivot: 1 });
        let mut rhs = vec![1.0, 1.0];
        assert_eq!(solver.solve(&mut rhs), Err(SolverError::SolveFailed));
    }

    #[test]
    fn test_dense_rejects_row_out_of_range() {
        let mut solver = DenseSolver::new(2);
        let err = solver.factor(&[0, 1, 2], &[0, 2], &[1.0, 1.0]).unwrap_err();
        assert!(matches!(err, SolverError::InvalidMatrix { .. }));
    }

    #[cfg(feature = "faer-solver")]
    #[test]
    fn test_faer_reuses_symbolic_analysis() {
        let (ap, ai, ax) = small_csc();
        let mut faer = FaerSolver::new(2);
        faer.analyze(&ap, &ai).unwrap();
        faer.factor(&ap, &ai, &ax).unwrap();
        let mut rhs = vec![6.0, 8.0];
        faer.solve(&mut rhs).unwrap();
        assert!((rhs[0] - 1.0).abs() < 1e-12);
        assert!((rhs[1] - 2.0).abs() < 1e-12);

        let doubled: Vec<f64> = ax.iter().map(|v| 2.0 * v).collect();
        faer.factor(&ap, &ai, &doubled).unwrap();
        let mut rhs = vec![6.0, 8.0];
        faer.solve(&mut rhs).unwrap();
        assert!((rhs[0] - 0.5).abs() < 1e-12);
        assert_eq!(faer.factorizations, 2);
    }
}
