use approx::assert_relative_eq;
use mbd_core::assembly::JacobianPass;
use mbd_core::dae::{chain_initial_state, chain_model, chain_partition, ChainParams};
use mbd_core::engine::{Engine, EngineConfig};
use mbd_core::error::MatrixError;
use mbd_core::integrator::IntegratorKind;
use mbd_core::matrix::{AssemblyShift, MatrixHandler};
use mbd_core::model::Model;
use mbd_core::naive::NaiveConfig;
use mbd_core::newton::NewtonConfig;
use mbd_core::schur::{DomainPartition, SchurSolutionManager};
use mbd_core::solution::{
    NaiveSolutionManager, SolutionConfig, SolutionManager, SolutionManagerKind,
};

const MASSES: usize = 6;

fn params() -> ChainParams {
    ChainParams {
        damping: 0.4,
        ..Default::default()
    }
}

fn load(sm: &mut dyn SolutionManager, model: &mut Model, coef: f64) {
    let mut state = chain_initial_state(MASSES, params(), 0.2);
    for (i, v) in state.x.iter_mut().enumerate() {
        *v += 0.03 * (i as f64).sin();
    }
    sm.matrix_reset();
    model
        .assemble_jacobian(sm.matrix(), &state.x, &state.xp, JacobianPass::new(coef))
        .unwrap();
    model
        .assemble_residual(
            sm.residual_mut(),
            &state.x,
            &state.xp,
            coef,
            AssemblyShift::default(),
        )
        .unwrap();
}

#[test]
fn test_schur_matches_direct_solve() {
    let mut model = chain_model(MASSES, params(), 2).unwrap();
    let n = model.size();

    let mut direct = NaiveSolutionManager::new(n, 1, NaiveConfig::default());
    load(&mut direct, &mut model, 0.01);
    direct.solve().unwrap();

    for domains in [2, 3] {
        let partition = chain_partition(MASSES, domains, 1).unwrap();
        let mut schur = SchurSolutionManager::new(partition, NaiveConfig::default()).unwrap();
        assert_eq!(schur.domains(), domains);
        load(&mut schur, &mut model, 0.01);
        schur.solve().unwrap();

        for (a, b) in schur.solution().iter().zip(direct.solution()) {
            assert_relative_eq!(*a, *b, epsilon = 1e-10, max_relative = 1e-10);
        }
    }
}

#[test]
fn test_schur_reuses_factors_for_new_residual() {
    let mut model = chain_model(MASSES, params(), 1).unwrap();
    let n = model.size();
    let partition = chain_partition(MASSES, 3, 1).unwrap();
    let mut schur = SchurSolutionManager::new(partition, NaiveConfig::default()).unwrap();
    let mut direct = NaiveSolutionManager::new(n, 1, NaiveConfig::default());
    load(&mut schur, &mut model, 0.05);
    load(&mut direct, &mut model, 0.05);
    schur.solve().unwrap();

    // second right-hand side on the same Jacobian
    for (i, r) in schur.residual_mut().iter_mut().enumerate() {
        *r = 1.0 + i as f64;
    }
    for (i, r) in direct.residual_mut().iter_mut().enumerate() {
        *r = 1.0 + i as f64;
    }
    schur.solve().unwrap();
    direct.solve().unwrap();
    for (a, b) in schur.solution().iter().zip(direct.solution()) {
        assert_relative_eq!(*a, *b, epsilon = 1e-10, max_relative = 1e-10);
    }
}

#[test]
fn test_schur_matrix_rejects_cross_domain_entry() {
    let partition = DomainPartition::new(vec![Some(0), Some(1), None]).unwrap();
    let mut schur = SchurSolutionManager::new(partition, NaiveConfig::default()).unwrap();
    assert!(matches!(
        schur.matrix().add_entry(0, 1, 1.0),
        Err(MatrixError::DomainCoupling {
            first: 0,
            second: 1,
            ..
        })
    ));
    schur.matrix().add_entry(0, 2, 1.0).unwrap();
    assert_eq!(schur.matrix().get(0, 2), 1.0);
}

#[test]
fn test_engine_runs_on_schur_manager() {
    let run = |kind: SolutionManagerKind, integrator: IntegratorKind| {
        let blocks = if integrator == IntegratorKind::ThirdOrder { 2 } else { 1 };
        let solution = SolutionConfig {
            kind,
            partition: Some(chain_partition(MASSES, 3, blocks).unwrap()),
            ..Default::default()
        };
        let config = EngineConfig {
            dt: 2e-3,
            steps: 50,
            integrator,
            // the derivative solve runs on one block of the partition
            derivatives: true,
            ..Default::default()
        };
        let newton = NewtonConfig {
            tolerance: 1e-12,
            ..Default::default()
        };
        let model = chain_model(MASSES, params(), 2).unwrap();
        let mut engine = Engine::new(model, config, newton, solution).unwrap();
        engine
            .run(chain_initial_state(MASSES, params(), 0.1))
            .unwrap()
    };

    for integrator in [IntegratorKind::Multistep, IntegratorKind::ThirdOrder] {
        let schur = run(SolutionManagerKind::Schur, integrator);
        let naive = run(SolutionManagerKind::Naive, integrator);
        assert_eq!(schur.stats.solution_manager, "schur");
        for (a, b) in schur.samples.iter().zip(&naive.samples) {
            for (x, y) in a.x.iter().zip(&b.x) {
                assert_relative_eq!(*x, *y, epsilon = 1e-10);
            }
        }
    }
}

#[test]
fn test_schur_requires_partition_of_right_size() {
    let solution = SolutionConfig {
        kind: SolutionManagerKind::Schur,
        partition: Some(chain_partition(MASSES, 2, 1).unwrap()),
        ..Default::default()
    };
    let model = chain_model(MASSES + 1, params(), 1).unwrap();
    let result = Engine::new(
        model,
        EngineConfig::default(),
        NewtonConfig::default(),
        solution,
    );
    assert!(result.is_err());

    let missing = SolutionConfig {
        kind: SolutionManagerKind::Schur,
        ..Default::default()
    };
    let model = chain_model(MASSES, params(), 1).unwrap();
    assert!(Engine::new(model, EngineConfig::default(), NewtonConfig::default(), missing).is_err());
}

#[test]
fn test_distributed_residual_test_matches_whole() {
    use mbd_core::convergence::{MinMaxTest, NonlinearSolverTest, NormTest};

    let partition = chain_partition(MASSES, 3, 1).unwrap();
    let mut schur = SchurSolutionManager::new(partition, NaiveConfig::default()).unwrap();
    for (i, r) in schur.residual_mut().iter_mut().enumerate() {
        *r = (i as f64 * 0.7).sin();
    }
    let whole = schur.residual().to_vec();
    assert_relative_eq!(
        schur.residual_test(&NormTest),
        NormTest.make_test(&whole),
        epsilon = 1e-14
    );
    assert_eq!(schur.residual_test(&MinMaxTest), MinMaxTest.make_test(&whole));
}
