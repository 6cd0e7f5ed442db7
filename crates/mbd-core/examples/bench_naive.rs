//! Benchmark: single-thread vs parallel naive LU factorization
//!
//! Synthetic 2D grid matrices (5-point stencil). The naive matrix stores
//! dense rows, so grids stay small.
//!
//! Each size is refactored several times; the median time is reported.
//!
//! Run with:
//!   cargo run -p mbd-core --release --example bench_naive

use mbd_core::matrix::NaiveMatrix;
use mbd_core::naive::{factor, factor_parallel, solve, NaiveConfig};
use std::time::Instant;

// ============================================================================
// Grid Mesh Generator
// ============================================================================

fn build_grid_mesh(grid_size: usize, scale: f64) -> Vec<(usize, usize, f64)> {
    let mut entries = Vec::new();
    for row in 0..grid_size {
        for col_g in 0..grid_size {
            let node = row * grid_size + col_g;
            let mut diag = 0.0;
            if row > 0 {
                entries.push((node, (row - 1) * grid_size + col_g, -scale));
                diag += 1.0;
            }
            if row < grid_size - 1 {
                entries.push((node, (row + 1) * grid_size + col_g, -scale));
                diag += 1.0;
            }
            if col_g > 0 {
                entries.push((node, row * grid_size + (col_g - 1), -scale));
                diag += 1.0;
            }
            if col_g < grid_size - 1 {
                entries.push((node, row * grid_size + (col_g + 1), -scale));
                diag += 1.0;
            }
            entries.push((node, node, (diag + 0.1) * scale));
        }
    }
    entries
}

// ============================================================================
// Benchmark Runner
// ============================================================================

fn median(times: &mut [f64]) -> f64 {
    times.sort_by(|a, b| a.total_cmp(b));
    let mid = times.len() / 2;
    if times.len() % 2 == 0 {
        (times[mid - 1] + times[mid]) / 2.0
    } else {
        times[mid]
    }
}

fn time_factor(
    n: usize,
    entries: &[(usize, usize, f64)],
    threads: usize,
    repeats: usize,
    rhs: &[f64],
) -> (f64, Vec<f64>) {
    let config = NaiveConfig::default();
    let mut times = Vec::with_capacity(repeats);
    let mut sol = vec![0.0; n];
    for _ in 0..repeats {
        let mut matrix = NaiveMatrix::from_triplets(n, entries).expect("grid entries in range");
        let t0 = Instant::now();
        let factors = if threads > 1 {
            factor_parallel(&mut matrix, threads, &config)
        } else {
            factor(&mut matrix, &config)
        }
        .expect("grid matrix is nonsingular");
        times.push(t0.elapsed().as_secs_f64() * 1000.0);
        solve(&matrix, &factors, rhs, &mut sol).expect("solve after factor");
    }
    (median(&mut times), sol)
}

fn run_benchmark(grid_size: usize, threads: usize, repeats: usize) {
    let n = grid_size * grid_size;
    let entries = build_grid_mesh(grid_size, 1.0);
    println!(
        "=== Grid {}x{} | n = {}, nnz = {} ===",
        grid_size,
        grid_size,
        n,
        entries.len()
    );

    let rhs: Vec<f64> = (0..n).map(|i| ((i * 7 + 3) % 100) as f64 * 0.01).collect();
    let (seq_median, seq_sol) = time_factor(n, &entries, 1, repeats, &rhs);
    let (par_median, par_sol) = time_factor(n, &entries, threads, repeats, &rhs);

    let max_diff = seq_sol
        .iter()
        .zip(&par_sol)
        .map(|(a, b)| (a - b).abs())
        .fold(0.0f64, f64::max);

    println!("  Single     ({:>3} factors): median {:>10.3} ms", repeats, seq_median);
    println!(
        "  Parallel   ({:>3} factors): median {:>10.3} ms  ({} threads)",
        repeats, par_median, threads
    );
    let speedup = seq_median / par_median;
    if speedup >= 1.0 {
        println!("  >>> {:.2}x faster (parallel)", speedup);
    } else {
        println!("  >>> {:.2}x slower (parallel)", 1.0 / speedup);
    }
    println!(
        "  Solution match: max|diff| = {:.2e}  {}",
        max_diff,
        if max_diff < 1e-10 { "OK" } else { "MISMATCH" }
    );
    println!();
}

fn main() {
    let threads = std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(2)
        .min(8);

    println!("================================================================");
    println!("  Naive LU: single vs parallel factorization");
    println!("  threads: {}", threads);
    println!("================================================================");
    println!();

    for &grid_size in &[10, 20, 30, 40] {
        let repeats = if grid_size >= 30 { 5 } else { 20 };
        run_benchmark(grid_size, threads.max(2), repeats);
    }
}
