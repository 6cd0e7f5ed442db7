use std::env;
use std::path::PathBuf;
use std::process::ExitCode;

use mbd_core::csv_export::write_csv_trajectory;
use mbd_core::dae::{
    chain_initial_state, chain_model, chain_partition, pendulum_model, ChainParams, PendulumParams,
};
use mbd_core::integrator::{IntegratorKind, State};
use mbd_core::json_export::write_json_trajectory;
use mbd_core::solution::SolutionManagerKind;
use mbd_core::{Engine, MbdResult, Model, SolverOptions, Trajectory};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn print_help() {
    println!(
        r#"mbd DAE integration driver

USAGE:
    mbd-cli <PROBLEM> [OPTIONS]

ARGS:
    <PROBLEM>               pendulum or chain

OPTIONS:
    -h, --help              Print help information
    -V, --version           Print version information
    -o, --output <PATH>     Write the trajectory to a file
    -f, --format <FORMAT>   Output format: csv, json (default: csv)
    -s, --set <KEY=VALUE>   Set a solver option (repeatable)
    --list-options          Print the solver options and exit
    --precision <N>         CSV precision (1-15 significant digits, default: 6)
    --derivative-columns    Add the derivative columns to the CSV output
    --theta0 <RAD>          Pendulum initial angle (default: 0.05)
    --masses <N>            Chain length (default: 4)
    --offset <VALUE>        Initial displacement of the last mass (default: 0.01)
    --stiffness <VALUE>     Chain spring stiffness (default: 100)
    --damping <VALUE>       Chain damping (default: 0)
    --domains <N>           Chain domains of the schur solver (default: 2)
    -v, --verbose           More log output (repeatable, RUST_LOG overrides)

EXAMPLES:
    mbd-cli pendulum -s dt=1e-3 -s steps=2000 -o pendulum.csv
    mbd-cli chain --masses 8 -s solver=schur --domains 3 -f json -o chain.json
    mbd-cli pendulum -s integrator=third-order -s rho=0.6 -s threads=2"#
    );
}

fn print_version() {
    println!("mbd {}", VERSION);
}

fn print_options() {
    for def in SolverOptions::definitions() {
        println!("    {:<28} {}", def.name, def.description);
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Csv,
    Json,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Problem {
    Pendulum,
    Chain,
}

struct Args {
    problem: Problem,
    output_path: Option<PathBuf>,
    output_format: OutputFormat,
    options: SolverOptions,
    precision: usize,
    derivative_columns: bool,
    theta0: f64,
    masses: usize,
    offset: f64,
    chain: ChainParams,
    domains: usize,
    verbose: u8,
}

fn fail(message: impl std::fmt::Display) -> ! {
    eprintln!("{}", message);
    std::process::exit(2);
}

fn parse_value<T: std::str::FromStr>(arg: &str, value: Option<String>) -> T {
    let Some(value) = value else {
        fail(format!("missing value for {}", arg));
    };
    match value.parse::<T>() {
        Ok(v) => v,
        Err(_) => fail(format!("invalid value for {}: {}", arg, value)),
    }
}

fn parse_args() -> Args {
    let mut args = env::args().skip(1);
    let mut problem: Option<Problem> = None;
    let mut parsed = Args {
        problem: Problem::Pendulum,
        output_path: None,
        output_format: OutputFormat::Csv,
        options: SolverOptions::new(),
        precision: 6,
        derivative_columns: false,
        theta0: 0.05,
        masses: 4,
        offset: 0.01,
        chain: ChainParams::default(),
        domains: 2,
        verbose: 0,
    };
    // applied after the subscriber is installed so warnings are visible
    let mut sets: Vec<(String, String)> = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-V" => {
                print_version();
                std::process::exit(0);
            }
            "--list-options" => {
                print_options();
                std::process::exit(0);
            }
            "--output" | "-o" => {
                let Some(path) = args.next() else {
                    fail(format!("missing value for {}", arg));
                };
                parsed.output_path = Some(PathBuf::from(path));
            }
            "--format" | "-f" => {
                let Some(value) = args.next() else {
                    fail(format!("missing value for {}", arg));
                };
                parsed.output_format = match value.to_ascii_lowercase().as_str() {
                    "csv" => OutputFormat::Csv,
                    "json" => OutputFormat::Json,
                    _ => fail(format!("unknown format: {} (expected: csv, json)", value)),
                };
            }
            "--set" | "-s" => {
                let Some(value) = args.next() else {
                    fail(format!("missing value for {}", arg));
                };
                let Some((key, raw)) = value.split_once('=') else {
                    fail(format!("expected KEY=VALUE, got {}", value));
                };
                sets.push((key.to_string(), raw.to_string()));
            }
            "--precision" => {
                parsed.precision = match parse_value::<usize>(&arg, args.next()) {
                    p if (1..=15).contains(&p) => p,
                    _ => fail("precision must be between 1 and 15"),
                };
            }
            "--derivative-columns" => parsed.derivative_columns = true,
            "--theta0" => parsed.theta0 = parse_value(&arg, args.next()),
            "--masses" => parsed.masses = parse_value(&arg, args.next()),
            "--offset" => parsed.offset = parse_value(&arg, args.next()),
            "--stiffness" => parsed.chain.stiffness = parse_value(&arg, args.next()),
            "--damping" => parsed.chain.damping = parse_value(&arg, args.next()),
            "--domains" => parsed.domains = parse_value(&arg, args.next()),
            "--verbose" | "-v" => parsed.verbose += 1,
            "-vv" => parsed.verbose += 2,
            _ => {
                if problem.is_some() {
                    fail(format!("unexpected argument: {}", arg));
                }
                problem = Some(match arg.to_ascii_lowercase().as_str() {
                    "pendulum" => Problem::Pendulum,
                    "chain" => Problem::Chain,
                    _ => fail(format!("unknown problem: {} (expected: pendulum, chain)", arg)),
                });
            }
        }
    }

    let Some(problem) = problem else {
        fail("usage: mbd-cli <pendulum|chain> [OPTIONS]");
    };
    parsed.problem = problem;

    init_tracing(parsed.verbose);
    for (key, raw) in &sets {
        parsed.options.set(key, raw);
    }
    parsed
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn unknown_states(kind: IntegratorKind) -> usize {
    match kind {
        IntegratorKind::ThirdOrder => 2,
        _ => 1,
    }
}

fn build(args: &Args) -> MbdResult<(Engine, State)> {
    let options = &args.options;
    let threads = options.assembly_threads();
    let engine_config = options.engine_config();
    let mut solution = options.solution_config();

    let (model, initial): (Model, State) = match args.problem {
        Problem::Pendulum => {
            let params = PendulumParams::default();
            (pendulum_model(params, threads)?, params.consistent_state(args.theta0))
        }
        Problem::Chain => {
            let params = args.chain;
            if solution.kind == SolutionManagerKind::Schur {
                solution.partition = Some(chain_partition(
                    args.masses,
                    args.domains,
                    unknown_states(engine_config.integrator),
                )?);
            }
            (
                chain_model(args.masses, params, threads)?,
                chain_initial_state(args.masses, params, args.offset),
            )
        }
    };

    let engine = Engine::new(model, engine_config, options.newton_config(), solution)?;
    Ok((engine, initial))
}

fn write_output(args: &Args, trajectory: &Trajectory) -> MbdResult<()> {
    let Some(path) = &args.output_path else {
        if let Some(last) = trajectory.last() {
            println!("t = {:.6e}", last.time);
            for (name, value) in trajectory.names.iter().zip(&last.x) {
                println!("    {:<10} {:.prec$e}", name, value, prec = args.precision);
            }
        }
        return Ok(());
    };
    match args.output_format {
        OutputFormat::Csv => {
            write_csv_trajectory(trajectory, path, args.precision, args.derivative_columns)?
        }
        OutputFormat::Json => write_json_trajectory(trajectory, path)?,
    }
    info!(path = %path.display(), samples = trajectory.samples.len(), "trajectory written");
    Ok(())
}

fn run(args: &Args) -> MbdResult<()> {
    args.options.log_user_options();
    let (mut engine, initial) = build(args)?;
    let trajectory = engine.run(initial)?;
    let stats = &trajectory.stats;
    println!(
        "{} / {}: {} steps, {} iterations, {} jacobians",
        stats.integrator, stats.solution_manager, stats.steps, stats.iterations, stats.jacobians
    );
    write_output(args, &trajectory)
}

fn main() -> ExitCode {
    let args = parse_args();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "run failed");
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
