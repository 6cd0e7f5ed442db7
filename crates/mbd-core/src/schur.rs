//! Schur complement solution manager
//!
//! The unknowns are split into per-domain local sets and one interface
//! set shared by all domains:
//!
//! ```text
//! ┌───────┬───────┬───────┐
//! │ A_LL¹ │   0   │ A_LI¹ │
//! ├───────┼───────┼───────┤
//! │   0   │ A_LL² │ A_LI² │
//! ├───────┼───────┼───────┤
//! │ A_IL¹ │ A_IL² │ A_II  │
//! └───────┴───────┴───────┘
//! ```
//!
//! Each domain runs on its own thread (its rank) and owns its blocks:
//!
//! 1. **Reduce**: factor `A_LL`, compute `z = A_LL⁻¹ r_L`,
//!    `G = A_LL⁻¹ A_LI`, `S_k = -A_IL G`, `g_k = -A_IL z`
//! 2. **Gather**: the domains send `S_k`, `g_k` to the master, which
//!    solves `(A_II + Σ S_k) x_I = r_I + Σ g_k` densely
//! 3. **Broadcast**: `x_I` goes back to every domain, which
//!    back-substitutes `x_L = z - G x_I`
//!
//! While the Jacobian is reused, step 1 only recomputes `z` and `g_k`
//! with the cached factors.

use std::sync::mpsc;
use std::thread;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::convergence::NonlinearSolverTest;
use crate::error::{ConfigError, MatrixError, SolverError};
use crate::matrix::{MatrixHandler, NaiveMatrix};
use crate::naive::{NaiveConfig, NaiveSolver};
use crate::solution::SolutionManager;
use crate::solver::{DenseSolver, LinearSolver};

/// Assignment of every dof to a domain (`Some(k)`) or to the interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainPartition {
    domain_of: Vec<Option<usize>>,
    domains: usize,
}

impl DomainPartition {
    pub fn new(domain_of: Vec<Option<usize>>) -> Result<Self, ConfigError> {
        let domains = domain_of.iter().flatten().max().map_or(0, |&k| k + 1);
        if domains == 0 {
            return Err(ConfigError::Invalid("partition has no local dofs".into()));
        }
        for k in 0..domains {
            if !domain_of.contains(&Some(k)) {
                return Err(ConfigError::Invalid(format!("domain {k} has no local dofs")));
            }
        }
        Ok(Self { domain_of, domains })
    }

    /// Consecutive local blocks of the given sizes followed by
    /// `interface` interface dofs.
    pub fn from_blocks(block_sizes: &[usize], interface: usize) -> Result<Self, ConfigError> {
        let mut domain_of = Vec::new();
        for (k, &size) in block_sizes.iter().enumerate() {
            domain_of.extend(std::iter::repeat(Some(k)).take(size));
        }
        domain_of.extend(std::iter::repeat(None).take(interface));
        Self::new(domain_of)
    }

    pub fn size(&self) -> usize {
        self.domain_of.len()
    }

    /// The assignment of the first `n` dofs, e.g. one state out of the
    /// repeated blocks of a multi-state integrator.
    pub fn truncated(&self, n: usize) -> Result<Self, ConfigError> {
        if n > self.size() {
            return Err(ConfigError::Invalid(format!(
                "partition covers {} dofs, {n} requested",
                self.size()
            )));
        }
        Self::new(self.domain_of[..n].to_vec())
    }

    pub fn domains(&self) -> usize {
        self.domains
    }

    pub fn domain_of(&self, dof: usize) -> Option<usize> {
        self.domain_of.get(dof).copied().flatten()
    }

    pub fn local_dofs(&self, domain: usize) -> Vec<usize> {
        (0..self.size())
            .filter(|&i| self.domain_of[i] == Some(domain))
            .collect()
    }

    pub fn interface_dofs(&self) -> Vec<usize> {
        (0..self.size())
            .filter(|&i| self.domain_of[i].is_none())
            .collect()
    }
}

/// Blocks owned by one domain.
struct DomainBlocks {
    /// Global index of each local dof.
    dofs: Vec<usize>,
    a_ll: NaiveMatrix,
    /// Row-major `nl x ni`.
    a_li: Vec<f64>,
    /// Row-major `ni x nl`.
    a_il: Vec<f64>,
    solver: NaiveSolver,
    /// `A_LL⁻¹ A_LI`, column-major `ni` columns of length `nl`.
    g: Vec<f64>,
}

/// What a domain sends to the master.
struct DomainReduction {
    domain: usize,
    /// `S_k`, only after a refactorization.
    s: Option<Vec<f64>>,
    g: Vec<f64>,
}

impl DomainBlocks {
    fn nl(&self) -> usize {
        self.dofs.len()
    }

    /// Step 1 on the domain's own thread.
    fn reduce(
        &mut self,
        r_l: &[f64],
        ni: usize,
        refactor: bool,
    ) -> Result<(Vec<f64>, Option<Vec<f64>>, Vec<f64>), SolverError> {
        let nl = self.nl();
        let mut s = None;
        if refactor {
            self.solver.factor(&mut self.a_ll)?;
            let mut column = vec![0.0; nl];
            let mut g_col = vec![0.0; nl];
            for j in 0..ni {
                for (i, c) in column.iter_mut().enumerate() {
                    *c = self.a_li[i * ni + j];
                }
                self.solver.solve(&self.a_ll, &column, &mut g_col)?;
                self.g[j * nl..(j + 1) * nl].copy_from_slice(&g_col);
            }
            // S_k = -A_IL G, row-major ni x ni
            let mut s_k = vec![0.0; ni * ni];
            for r in 0..ni {
                for j in 0..ni {
                    let g_j = &self.g[j * nl..(j + 1) * nl];
                    let dot: f64 = (0..nl).map(|k| self.a_il[r * nl + k] * g_j[k]).sum();
                    s_k[r * ni + j] = -dot;
                }
            }
            s = Some(s_k);
        }
        let mut z = vec![0.0; nl];
        self.solver.solve(&self.a_ll, r_l, &mut z)?;
        let g_k = (0..ni)
            .map(|r| -(0..nl).map(|k| self.a_il[r * nl + k] * z[k]).sum::<f64>())
            .collect();
        Ok((z, s, g_k))
    }

    /// Step 3: `x_L = z - G x_I`.
    fn back_substitute(&self, mut z: Vec<f64>, x_i: &[f64]) -> Vec<f64> {
        let nl = self.nl();
        for (j, &xj) in x_i.iter().enumerate() {
            if xj == 0.0 {
                continue;
            }
            for (k, zk) in z.iter_mut().enumerate() {
                *zk -= self.g[j * nl + k] * xj;
            }
        }
        z
    }
}

/// Jacobian handler routing every entry to its block.
pub struct SchurMatrix {
    n: usize,
    partition: DomainPartition,
    /// Position of each dof inside its domain's local set or the interface.
    position: Vec<usize>,
    ni: usize,
    blocks: Vec<DomainBlocks>,
    /// Row-major `ni x ni`.
    a_ii: Vec<f64>,
}

impl SchurMatrix {
    fn new(partition: DomainPartition, config: &NaiveConfig) -> Self {
        let n = partition.size();
        let interface = partition.interface_dofs();
        let ni = interface.len();
        let mut position = vec![0; n];
        for (p, &dof) in interface.iter().enumerate() {
            position[dof] = p;
        }
        let blocks = (0..partition.domains())
            .map(|k| {
                let dofs = partition.local_dofs(k);
                for (p, &dof) in dofs.iter().enumerate() {
                    position[dof] = p;
                }
                let nl = dofs.len();
                DomainBlocks {
                    dofs,
                    a_ll: NaiveMatrix::new(nl),
                    a_li: vec![0.0; nl * ni],
                    a_il: vec![0.0; ni * nl],
                    solver: NaiveSolver::new(1, config.clone()),
                    g: vec![0.0; nl * ni],
                }
            })
            .collect();
        Self {
            n,
            partition,
            position,
            ni,
            blocks,
            a_ii: vec![0.0; ni * ni],
        }
    }

    pub fn partition(&self) -> &DomainPartition {
        &self.partition
    }

    fn check(&self, row: usize, col: usize) -> Result<(), MatrixError> {
        if row >= self.n || col >= self.n {
            return Err(MatrixError::OutOfBounds {
                row,
                col,
                size: self.n,
            });
        }
        Ok(())
    }
}

impl MatrixHandler for SchurMatrix {
    fn size(&self) -> usize {
        self.n
    }

    fn reset(&mut self) {
        for b in &mut self.blocks {
            b.a_ll.reset();
            b.a_li.fill(0.0);
            b.a_il.fill(0.0);
            b.solver.invalidate();
        }
        self.a_ii.fill(0.0);
    }

    fn add_entry(&mut self, row: usize, col: usize, value: f64) -> Result<(), MatrixError> {
        self.check(row, col)?;
        let (pr, pc, ni) = (self.position[row], self.position[col], self.ni);
        match (self.partition.domain_of(row), self.partition.domain_of(col)) {
            (Some(a), Some(b)) if a == b => self.blocks[a].a_ll.add_entry(pr, pc, value),
            (Some(first), Some(second)) => Err(MatrixError::DomainCoupling {
                row,
                col,
                first,
                second,
            }),
            (Some(a), None) => {
                self.blocks[a].a_li[pr * ni + pc] += value;
                Ok(())
            }
            (None, Some(b)) => {
                let nl = self.blocks[b].nl();
                self.blocks[b].a_il[pr * nl + pc] += value;
                Ok(())
            }
            (None, None) => {
                self.a_ii[pr * ni + pc] += value;
                Ok(())
            }
        }
    }

    fn get(&self, row: usize, col: usize) -> f64 {
        if self.check(row, col).is_err() {
            return 0.0;
        }
        let (pr, pc, ni) = (self.position[row], self.position[col], self.ni);
        match (self.partition.domain_of(row), self.partition.domain_of(col)) {
            (Some(a), Some(b)) if a == b => self.blocks[a].a_ll.get(pr, pc),
            (Some(_), Some(_)) => 0.0,
            (Some(a), None) => self.blocks[a].a_li[pr * ni + pc],
            (None, Some(b)) => self.blocks[b].a_il[pr * self.blocks[b].nl() + pc],
            (None, None) => self.a_ii[pr * ni + pc],
        }
    }
}

/// Schur complement manager, one thread per domain during [`solve`].
///
/// [`solve`]: SolutionManager::solve
pub struct SchurSolutionManager {
    matrix: SchurMatrix,
    interface: Vec<usize>,
    interface_solver: DenseSolver,
    factored: bool,
    residual: Vec<f64>,
    solution: Vec<f64>,
}

impl SchurSolutionManager {
    pub fn new(partition: DomainPartition, config: NaiveConfig) -> Result<Self, ConfigError> {
        let n = partition.size();
        let interface = partition.interface_dofs();
        let ni = interface.len();
        Ok(Self {
            matrix: SchurMatrix::new(partition, &config),
            interface,
            interface_solver: DenseSolver::new(ni),
            factored: false,
            residual: vec![0.0; n],
            solution: vec![0.0; n],
        })
    }

    pub fn domains(&self) -> usize {
        self.matrix.blocks.len()
    }
}

/// Master side of the gather: assemble and solve the interface system.
fn solve_interface(
    solver: &mut DenseSolver,
    a_ii: &[f64],
    mut g: Vec<f64>,
    reductions: &[DomainReduction],
    refactor: bool,
) -> Result<Vec<f64>, SolverError> {
    let ni = g.len();
    if refactor {
        let mut s = a_ii.to_vec();
        for red in reductions {
            let s_k = red.s.as_ref().ok_or_else(|| {
                SolverError::Interface(format!("domain {} sent no complement", red.domain))
            })?;
            for (dst, src) in s.iter_mut().zip(s_k) {
                *dst += src;
            }
        }
        solver
            .factor_dense(ni, &s)
            .map_err(|e| SolverError::Interface(e.to_string()))?;
    }
    for red in reductions {
        for (dst, src) in g.iter_mut().zip(&red.g) {
            *dst += src;
        }
    }
    if ni > 0 {
        LinearSolver::solve(solver, &mut g).map_err(|e| SolverError::Interface(e.to_string()))?;
    }
    Ok(g)
}

impl SolutionManager for SchurSolutionManager {
    fn name(&self) -> &'static str {
        "schur"
    }

    fn size(&self) -> usize {
        self.residual.len()
    }

    fn matrix_reset(&mut self) {
        self.matrix.reset();
        self.factored = false;
    }

    fn matrix_initialize(&mut self) {
        self.matrix_reset();
    }

    fn matrix(&mut self) -> &mut dyn MatrixHandler {
        &mut self.matrix
    }

    fn residual(&self) -> &[f64] {
        &self.residual
    }

    fn residual_mut(&mut self) -> &mut [f64] {
        &mut self.residual
    }

    fn solution(&self) -> &[f64] {
        &self.solution
    }

    fn solve(&mut self) -> Result<(), SolverError> {
        let refactor = !self.factored;
        let ni = self.interface.len();
        let domains = self.matrix.blocks.len();
        trace!(domains, ni, refactor, "schur solve");

        let (gather_tx, gather_rx) = mpsc::channel::<Result<DomainReduction, SolverError>>();
        let residual = &self.residual;
        let r_i: Vec<f64> = self.interface.iter().map(|&i| residual[i]).collect();
        let a_ii = &self.matrix.a_ii;
        let interface_solver = &mut self.interface_solver;
        let blocks = &mut self.matrix.blocks;

        let outcome = thread::scope(|s| {
            let mut broadcast = Vec::with_capacity(domains);
            let mut handles = Vec::with_capacity(domains);
            for (domain, block) in blocks.iter_mut().enumerate() {
                let (tx, rx) = mpsc::channel::<Vec<f64>>();
                broadcast.push(tx);
                let gather_tx = gather_tx.clone();
                handles.push(s.spawn(move || -> Option<Vec<f64>> {
                    let r_l: Vec<f64> = block.dofs.iter().map(|&i| residual[i]).collect();
                    let (z, s_k, g_k) = match block.reduce(&r_l, ni, refactor) {
                        Ok(parts) => parts,
                        Err(err) => {
                            let _ = gather_tx.send(Err(err));
                            return None;
                        }
                    };
                    let sent = gather_tx.send(Ok(DomainReduction {
                        domain,
                        s: s_k,
                        g: g_k,
                    }));
                    drop(gather_tx);
                    if sent.is_err() {
                        return None;
                    }
                    // master dropped the senders on failure
                    let x_i = rx.recv().ok()?;
                    Some(block.back_substitute(z, &x_i))
                }));
            }
            drop(gather_tx);

            let mut reductions = Vec::with_capacity(domains);
            let mut failure = None;
            for message in gather_rx.iter().take(domains) {
                match message {
                    Ok(red) => reductions.push(red),
                    Err(err) => {
                        failure = Some(err);
                        break;
                    }
                }
            }
            if reductions.len() < domains && failure.is_none() {
                failure = Some(SolverError::Interface("domain thread exited early".into()));
            }

            let x_i = match failure {
                Some(err) => Err(err),
                None => solve_interface(interface_solver, a_ii, r_i, &reductions, refactor),
            };
            match x_i {
                Ok(x_i) => {
                    for tx in &broadcast {
                        let _ = tx.send(x_i.clone());
                    }
                    broadcast.clear();
                    let locals: Vec<Option<Vec<f64>>> = handles
                        .into_iter()
                        .map(|h| h.join().ok().flatten())
                        .collect();
                    Ok((x_i, locals))
                }
                Err(err) => {
                    broadcast.clear();
                    for h in handles {
                        let _ = h.join();
                    }
                    Err(err)
                }
            }
        });

        let (x_i, locals) = outcome?;
        for (&dof, &value) in self.interface.iter().zip(&x_i) {
            self.solution[dof] = value;
        }
        for (block, local) in self.matrix.blocks.iter().zip(locals) {
            let x_l = local
                .ok_or_else(|| SolverError::Interface("domain back-substitution failed".into()))?;
            for (&dof, value) in block.dofs.iter().zip(x_l) {
                self.solution[dof] = value;
            }
        }
        if refactor {
            debug!(domains, ni, "schur complement refactored");
        }
        self.factored = true;
        Ok(())
    }

    /// Partial tests per domain and for the interface, merged.
    fn residual_test(&self, test: &dyn NonlinearSolverTest) -> f64 {
        let fold = |dofs: &[usize]| {
            dofs.iter()
                .fold(0.0, |acc, &i| test.test_one(acc, self.residual[i], i))
        };
        let merged = self
            .matrix
            .blocks
            .iter()
            .map(|b| fold(&b.dofs))
            .fold(fold(&self.interface), |acc, part| test.test_merge(acc, part));
        test.test_post(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_rejects_empty_domain() {
        assert!(DomainPartition::new(vec![Some(0), Some(2), None]).is_err());
        assert!(DomainPartition::new(vec![None, None]).is_err());
        let p = DomainPartition::from_blocks(&[2, 1], 1).unwrap();
        assert_eq!(p.domains(), 2);
        assert_eq!(p.interface_dofs(), vec![3]);
    }

    #[test]
    fn test_domain_coupling_rejected() {
        let p = DomainPartition::from_blocks(&[1, 1], 1).unwrap();
        let mut m = SchurMatrix::new(p, &NaiveConfig::default());
        assert!(m.add_entry(0, 2, 1.0).is_ok());
        assert!(matches!(
            m.add_entry(0, 1, 1.0),
            Err(MatrixError::DomainCoupling { first: 0, second: 1, .. })
        ));
        m.add_entry(2, 0, 3.0).unwrap();
        assert_eq!(m.get(2, 0), 3.0);
    }
}
