use approx::assert_relative_eq;
use mbd_core::dae::{
    chain_initial_state, chain_model, pendulum_model, ChainParams, PendulumParams,
};
use mbd_core::engine::{Engine, EngineConfig};
use mbd_core::integrator::{IntegratorKind, State};
use mbd_core::newton::NewtonConfig;
use mbd_core::solution::{SolutionConfig, SolutionManagerKind};
use mbd_core::MbdError;

const OFFSET: f64 = 0.1;

fn oscillator() -> ChainParams {
    ChainParams {
        mass: 1.0,
        stiffness: 1.0,
        damping: 0.0,
    }
}

fn tight() -> NewtonConfig {
    NewtonConfig {
        tolerance: 1e-12,
        ..Default::default()
    }
}

/// Phase-space error of a single undamped mass after `duration`.
fn oscillator_error(kind: IntegratorKind, dt: f64, duration: f64) -> f64 {
    let params = oscillator();
    let steps = (duration / dt).round() as usize;
    let config = EngineConfig {
        dt,
        steps,
        integrator: kind,
        rho: 0.6,
        algebraic_rho: 0.6,
        record_every: steps,
        ..Default::default()
    };
    let model = chain_model(1, params, 1).unwrap();
    let mut engine = Engine::new(model, config, tight(), SolutionConfig::default()).unwrap();
    let trajectory = engine.run(chain_initial_state(1, params, OFFSET)).unwrap();
    let last = trajectory.last().unwrap();

    let omega = (params.stiffness / params.mass).sqrt();
    let t = last.time;
    let ex = last.x[0] - OFFSET * (omega * t).cos();
    let ev = last.x[1] + OFFSET * omega * (omega * t).sin();
    (ex * ex + ev * ev).sqrt()
}

fn order_ratio(kind: IntegratorKind, dt: f64, duration: f64) -> f64 {
    oscillator_error(kind, dt, duration) / oscillator_error(kind, dt / 2.0, duration)
}

#[test]
fn test_implicit_euler_is_first_order() {
    let ratio = order_ratio(IntegratorKind::ImplicitEuler, 0.01, 1.0);
    assert!((1.7..2.3).contains(&ratio), "ratio {ratio}");
}

#[test]
fn test_multistep_is_second_order() {
    let ratio = order_ratio(IntegratorKind::Multistep, 0.01, 1.0);
    assert!(ratio > 3.0, "ratio {ratio}");
}

#[test]
fn test_third_order_scheme_order() {
    let ratio = order_ratio(IntegratorKind::ThirdOrder, 0.1, 2.0);
    assert!(ratio > 5.0, "ratio {ratio}");
}

#[test]
fn test_second_order_schemes_are_accurate() {
    for kind in [
        IntegratorKind::CrankNicolson,
        IntegratorKind::Hope,
        IntegratorKind::Multistep,
    ] {
        let err = oscillator_error(kind, 0.01, 1.0);
        assert!(err < 1e-3 * OFFSET, "{kind:?} error {err}");
    }
}

#[test]
fn test_pendulum_follows_small_angle_solution() {
    let params = PendulumParams::default();
    let theta0 = 0.05;
    let config = EngineConfig {
        dt: 1e-3,
        steps: 1000,
        integrator: IntegratorKind::ImplicitEuler,
        ..Default::default()
    };
    let model = pendulum_model(params, 1).unwrap();
    let mut engine =
        Engine::new(model, config, NewtonConfig::default(), SolutionConfig::default()).unwrap();
    let trajectory = engine.run(params.consistent_state(theta0)).unwrap();

    assert_eq!(trajectory.samples.len(), 1001);
    assert_eq!(trajectory.stats.steps, 1000);
    assert_eq!(trajectory.stats.integrator, "implicit-euler");

    let (l, g, omega) = (params.length, params.gravity, params.omega());
    assert_relative_eq!(trajectory.samples[0].x[4], g * theta0.cos(), epsilon = 1e-12);
    for sample in &trajectory.samples {
        let t = sample.time;
        let angle = PendulumParams::angle(&sample.x);
        let expected = params.small_angle(theta0, t);
        assert!(
            (angle - expected).abs() < 0.02 * theta0,
            "t = {t}: {angle} vs {expected}"
        );
        // the constraint holds at every converged step
        let r = (sample.x[0].powi(2) + sample.x[1].powi(2)).sqrt();
        assert_relative_eq!(r, params.length, epsilon = 1e-6);

        // horizontal velocity and rod tension of the linearized motion
        let rate = -theta0 * omega * (omega * t).sin();
        let u = l * expected.cos() * rate;
        let lambda = g * expected.cos() + l * rate * rate;
        assert!((sample.x[2] - u).abs() < 2e-3, "t = {t}: u {} vs {u}", sample.x[2]);
        assert!(
            (sample.x[4] - lambda).abs() < 1e-3,
            "t = {t}: lambda {} vs {lambda}",
            sample.x[4]
        );
    }
}

fn pendulum_run(assembly_threads: usize, sm_threads: usize, kind: IntegratorKind) -> Vec<State> {
    let params = PendulumParams::default();
    let config = EngineConfig {
        dt: 2e-3,
        steps: 200,
        integrator: kind,
        ..Default::default()
    };
    let solution = SolutionConfig {
        threads: sm_threads,
        ..Default::default()
    };
    let model = pendulum_model(params, assembly_threads).unwrap();
    let newton = NewtonConfig {
        tolerance: 1e-10,
        ..Default::default()
    };
    let mut engine = Engine::new(model, config, newton, solution).unwrap();
    let trajectory = engine.run(params.consistent_state(0.3)).unwrap();
    trajectory
        .samples
        .into_iter()
        .map(|s| State::new(s.x, s.xp))
        .collect()
}

#[test]
fn test_pendulum_threads_agree() {
    for kind in [IntegratorKind::Multistep, IntegratorKind::ImplicitEuler] {
        let single = pendulum_run(1, 1, kind);
        let multi = pendulum_run(3, 2, kind);
        assert_eq!(single.len(), multi.len());
        for (a, b) in single.iter().zip(&multi) {
            for (x, y) in a.x.iter().zip(&b.x) {
                assert_relative_eq!(*x, *y, epsilon = 1e-9);
            }
        }
    }
}

#[test]
fn test_third_order_threads_agree() {
    let params = ChainParams {
        damping: 0.5,
        ..Default::default()
    };
    let run = |assembly_threads: usize, sm_threads: usize| {
        let config = EngineConfig {
            dt: 5e-3,
            steps: 50,
            integrator: IntegratorKind::ThirdOrder,
            ..Default::default()
        };
        let solution = SolutionConfig {
            threads: sm_threads,
            ..Default::default()
        };
        let model = chain_model(4, params, assembly_threads).unwrap();
        let mut engine = Engine::new(model, config, tight(), solution).unwrap();
        engine.run(chain_initial_state(4, params, 0.05)).unwrap()
    };
    let single = run(1, 1);
    let multi = run(4, 3);
    assert_eq!(multi.stats.threads, 4);
    for (a, b) in single.samples.iter().zip(&multi.samples) {
        for (x, y) in a.x.iter().zip(&b.x) {
            assert_relative_eq!(*x, *y, epsilon = 1e-10);
        }
    }
}

#[test]
fn test_compact_manager_matches_naive() {
    let params = ChainParams {
        damping: 0.2,
        ..Default::default()
    };
    let run = |kind: SolutionManagerKind| {
        let config = EngineConfig {
            dt: 1e-3,
            steps: 100,
            ..Default::default()
        };
        let solution = SolutionConfig {
            kind,
            ..Default::default()
        };
        let model = chain_model(5, params, 2).unwrap();
        let mut engine = Engine::new(model, config, tight(), solution).unwrap();
        engine.run(chain_initial_state(5, params, 0.05)).unwrap()
    };
    let naive = run(SolutionManagerKind::Naive);
    let compact = run(SolutionManagerKind::Compact);
    assert_eq!(compact.stats.solution_manager, "compact");
    let (a, b) = (naive.last().unwrap(), compact.last().unwrap());
    for (x, y) in a.x.iter().zip(&b.x) {
        assert_relative_eq!(*x, *y, epsilon = 1e-10);
    }
}

#[test]
fn test_initial_derivatives_are_computed() {
    let params = ChainParams::default();
    let masses = 3;
    let consistent = chain_initial_state(masses, params, OFFSET);
    let mut start = consistent.clone();
    start.xp.fill(0.0);

    let config = EngineConfig {
        dt: 1e-3,
        steps: 5,
        derivatives: true,
        ..Default::default()
    };
    let model = chain_model(masses, params, 1).unwrap();
    let mut engine = Engine::new(model, config, tight(), SolutionConfig::default()).unwrap();
    let trajectory = engine.run(start).unwrap();

    let first = &trajectory.samples[0];
    assert!(first.iterations > 0);
    for (xp, expected) in first.xp.iter().zip(&consistent.xp) {
        assert_relative_eq!(*xp, *expected, epsilon = 1e-4);
    }
    for (x, expected) in first.x.iter().zip(&consistent.x) {
        assert_relative_eq!(*x, *expected, epsilon = 1e-4);
    }
}

#[test]
fn test_record_every_keeps_last_step() {
    let params = oscillator();
    let config = EngineConfig {
        dt: 0.01,
        steps: 25,
        record_every: 10,
        ..Default::default()
    };
    let model = chain_model(1, params, 1).unwrap();
    let mut engine = Engine::new(model, config, tight(), SolutionConfig::default()).unwrap();
    let trajectory = engine.run(chain_initial_state(1, params, OFFSET)).unwrap();
    let times: Vec<f64> = trajectory.times().collect();
    assert_eq!(times.len(), 4);
    assert_relative_eq!(times[3], 0.25, epsilon = 1e-12);
    assert_eq!(trajectory.series(0).len(), 4);
}

#[test]
fn test_engine_rejects_bad_input() {
    let params = oscillator();
    let model = chain_model(1, params, 1).unwrap();
    let config = EngineConfig {
        dt: 0.0,
        ..Default::default()
    };
    assert!(Engine::new(model, config, NewtonConfig::default(), SolutionConfig::default()).is_err());

    let model = chain_model(1, params, 1).unwrap();
    let mut engine = Engine::new(
        model,
        EngineConfig::default(),
        NewtonConfig::default(),
        SolutionConfig::default(),
    )
    .unwrap();
    let err = engine.run(State::zeros(3)).unwrap_err();
    assert!(matches!(err, MbdError::Config(_)));
}

#[test]
fn test_step_failure_reports_step() {
    let params = PendulumParams::default();
    let model = pendulum_model(params, 1).unwrap();
    let mut engine = Engine::new(
        model,
        EngineConfig {
            steps: 3,
            integrator: IntegratorKind::ImplicitEuler,
            ..Default::default()
        },
        NewtonConfig::default(),
        SolutionConfig::default(),
    )
    .unwrap();
    // zero radius
    let err = engine.run(State::zeros(5)).unwrap_err();
    assert!(matches!(err, MbdError::Step { step: 1, .. }));
}
