use approx::assert_relative_eq;
use mbd_core::assembly::{AssemblyMode, AssemblyOrchestrator, CcState, Element, JacobianPass};
use mbd_core::dae::{chain_initial_state, chain_model, pendulum_model, ChainParams, PendulumParams};
use mbd_core::error::{AssemblyError, ElementError};
use mbd_core::integrator::State;
use mbd_core::matrix::{
    AssemblyShift, CompactMatrix, MatrixHandler, NaiveMatrix, PatternMatrix, WorkMatrix,
    WorkVector,
};
use mbd_core::model::Model;

const MASSES: usize = 9;

fn chain(threads: usize) -> (Model, State) {
    let params = ChainParams {
        damping: 0.3,
        ..Default::default()
    };
    let mut state = chain_initial_state(MASSES, params, 0.2);
    // spread the state so every spring is stretched
    for (i, x) in state.x.iter_mut().enumerate() {
        *x += 0.01 * i as f64;
    }
    (chain_model(MASSES, params, threads).unwrap(), state)
}

fn assert_same(a: &dyn MatrixHandler, b: &dyn MatrixHandler) {
    assert_eq!(a.size(), b.size());
    for r in 0..a.size() {
        for c in 0..a.size() {
            assert_relative_eq!(a.get(r, c), b.get(r, c), epsilon = 1e-12);
        }
    }
}

#[test]
fn test_naive_jacobian_multi_matches_single() {
    let (mut single, state) = chain(1);
    let n = single.size();
    let mut expected = NaiveMatrix::new(n);
    single
        .assemble_jacobian(&mut expected, &state.x, &state.xp, JacobianPass::new(0.01))
        .unwrap();

    for threads in [2, 3, 5] {
        let (mut model, _) = chain(threads);
        let mut matrix = NaiveMatrix::new(n);
        // twice: the per-thread accumulators are reset between passes
        for _ in 0..2 {
            matrix.reset();
            model
                .assemble_jacobian(&mut matrix, &state.x, &state.xp, JacobianPass::new(0.01))
                .unwrap();
        }
        assert_eq!(model.orchestrator().mode(), Some(AssemblyMode::Naive));
        assert!(matrix.pattern_consistent());
        assert_eq!(matrix.nnz(), expected.nnz());
        assert_same(&matrix, &expected);
    }
}

#[test]
fn test_compact_jacobian_multi_matches_single() {
    let (mut single, state) = chain(1);
    let n = single.size();
    let mut expected = NaiveMatrix::new(n);
    single
        .assemble_jacobian(&mut expected, &state.x, &state.xp, JacobianPass::new(0.02))
        .unwrap();

    let (mut model, _) = chain(4);
    let mut pattern = PatternMatrix::new(n);
    model
        .assemble_jacobian(&mut pattern, &state.x, &state.xp, JacobianPass::new(0.02))
        .unwrap();
    assert_eq!(model.orchestrator().cc_state(), CcState::First);

    let mut compact: CompactMatrix = pattern.freeze();
    for _ in 0..3 {
        compact.reset();
        model
            .assemble_jacobian(&mut compact, &state.x, &state.xp, JacobianPass::new(0.02))
            .unwrap();
        assert_eq!(model.orchestrator().cc_state(), CcState::Yes);
        assert_same(&compact, &expected);
    }
}

#[test]
fn test_residual_multi_matches_single() {
    let (mut single, state) = chain(1);
    let n = single.size();
    let mut expected = vec![0.0; n];
    single
        .assemble_residual(&mut expected, &state.x, &state.xp, 0.01, AssemblyShift::default())
        .unwrap();
    assert!(expected.iter().any(|v| v.abs() > 1e-6));

    for threads in [2, 4, 9] {
        let (mut model, _) = chain(threads);
        let mut out = vec![0.0; n];
        model
            .assemble_residual(&mut out, &state.x, &state.xp, 0.01, AssemblyShift::default())
            .unwrap();
        for (a, e) in out.iter().zip(&expected) {
            assert_relative_eq!(*a, *e, epsilon = 1e-12);
        }
    }
}

#[test]
fn test_shifted_blocks() {
    let (mut model, state) = chain(2);
    let n = model.size();
    let mut big = NaiveMatrix::new(2 * n);
    model
        .assemble_jacobian(
            &mut big,
            &state.x,
            &state.xp,
            JacobianPass::new(0.5).with_shift(AssemblyShift::block(n, n)),
        )
        .unwrap();
    model
        .assemble_jacobian(
            &mut big,
            &state.x,
            &state.xp,
            JacobianPass::difference(AssemblyShift::block(0, n).scaled(2.0)),
        )
        .unwrap();

    let mut plain = NaiveMatrix::new(n);
    model
        .assemble_jacobian(&mut plain, &state.x, &state.xp, JacobianPass::new(0.5))
        .unwrap();
    let mut derivative = NaiveMatrix::new(n);
    model
        .assemble_jacobian(&mut derivative, &state.x, &state.xp, JacobianPass::new(0.0))
        .unwrap();

    for r in 0..n {
        for c in 0..n {
            assert_relative_eq!(big.get(n + r, n + c), plain.get(r, c), epsilon = 1e-14);
            // 2·(J(1) - J(0)) is twice the state part
            let state_part = 2.0 * (plain.get(r, c) - derivative.get(r, c)) / 0.5;
            assert_relative_eq!(big.get(r, n + c), state_part, epsilon = 1e-12);
            assert_eq!(big.get(r, c), 0.0);
        }
    }
}

#[test]
fn test_divide_by_zero_reports_element() {
    for threads in [1, 3] {
        let mut model = pendulum_model(PendulumParams::default(), threads).unwrap();
        let state = State::zeros(5);
        let mut out = vec![0.0; 5];
        let err = model
            .assemble_residual(&mut out, &state.x, &state.xp, 0.1, AssemblyShift::default())
            .unwrap_err();
        assert!(matches!(err, AssemblyError::DivideByZero { element: 3, .. }));

        let mut matrix = NaiveMatrix::new(5);
        let err = model
            .assemble_jacobian(&mut matrix, &state.x, &state.xp, JacobianPass::new(0.1))
            .unwrap_err();
        assert!(matches!(err, AssemblyError::DivideByZero { element: 3, .. }));
    }
}

/// Diagonal entry, plus an off-diagonal one once `grown` is set.
struct Growing {
    label: u32,
    row: usize,
    grown: bool,
    structure_changes: bool,
}

impl Element for Growing {
    fn label(&self) -> u32 {
        self.label
    }

    fn work_space_dim(&self) -> (usize, usize) {
        (1, 2)
    }

    fn assemble_jacobian(
        &mut self,
        work: &mut WorkMatrix,
        _coef: f64,
        _x: &[f64],
        _xp: &[f64],
    ) -> Result<(), ElementError> {
        work.set_sparse();
        work.put_item(self.row, self.row, 2.0);
        if self.grown {
            work.put_item(self.row, 0, 1.0);
        }
        Ok(())
    }

    fn assemble_residual(
        &mut self,
        work: &mut WorkVector,
        _coef: f64,
        _x: &[f64],
        _xp: &[f64],
    ) -> Result<(), ElementError> {
        if self.structure_changes {
            return Err(ElementError::ChangedStructure);
        }
        work.resize(1);
        work.put_row_index(0, self.row);
        work.put_coef(0, 1.0);
        Ok(())
    }
}

fn growing(grown: bool) -> Vec<Box<dyn Element>> {
    (0..4)
        .map(|i| {
            Box::new(Growing {
                label: i as u32,
                row: i,
                grown: grown && i == 3,
                structure_changes: false,
            }) as Box<dyn Element>
        })
        .collect()
}

#[test]
fn test_new_compact_entry_requests_rebuild() {
    let x = vec![0.0; 4];
    let mut pattern = PatternMatrix::new(4);
    let mut small = AssemblyOrchestrator::new(growing(false), 2).unwrap();
    small
        .assemble_jacobian(&mut pattern, &x, &x, JacobianPass::new(1.0))
        .unwrap();
    let mut compact = pattern.freeze();
    small
        .assemble_jacobian(&mut compact, &x, &x, JacobianPass::new(1.0))
        .unwrap();
    assert_eq!(small.cc_state(), CcState::Yes);

    let mut grown = AssemblyOrchestrator::new(growing(true), 2).unwrap();
    grown
        .assemble_jacobian(&mut compact, &x, &x, JacobianPass::new(1.0))
        .unwrap_err();
    let err = grown
        .assemble_jacobian(&mut compact, &x, &x, JacobianPass::new(1.0))
        .unwrap_err();
    assert_eq!(err, AssemblyError::RebuildMatrix);
    assert_eq!(grown.cc_state(), CcState::No);

    // a fresh pattern accepts the new entry
    let mut pattern = compact.thaw();
    grown
        .assemble_jacobian(&mut pattern, &x, &x, JacobianPass::new(1.0))
        .unwrap();
    assert_eq!(pattern.freeze().nnz(), 5);
}

#[test]
fn test_structure_change_is_reported() {
    let elements: Vec<Box<dyn Element>> = (0..3)
        .map(|i| {
            Box::new(Growing {
                label: i as u32,
                row: i,
                grown: false,
                structure_changes: i == 1,
            }) as Box<dyn Element>
        })
        .collect();
    let mut orchestrator = AssemblyOrchestrator::new(elements, 3).unwrap();
    let mut out = vec![0.0; 3];
    let x = vec![0.0; 3];
    let err = orchestrator
        .assemble_residual(&mut out, &x, &x, 1.0, AssemblyShift::default())
        .unwrap_err();
    assert_eq!(err, AssemblyError::ChangedStructure);
    // the other elements still contributed
    assert_eq!(out, vec![1.0, 0.0, 1.0]);
}

#[test]
fn test_invalid_thread_counts() {
    assert!(AssemblyOrchestrator::new(growing(false), 0).is_err());
    assert!(AssemblyOrchestrator::new(growing(false), 5).is_err());
    assert!(AssemblyOrchestrator::new(Vec::new(), 1).is_err());
}
