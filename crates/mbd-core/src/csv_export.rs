//! CSV trajectory output.
//!
//! One row per recorded sample: `time`, the dof values, optionally the
//! derivative slots (`d(name)` for differential dofs, `int(name)` for the
//! integral of algebraic ones) and the Newton iteration count.

use std::fs;
use std::path::Path;

use crate::engine::Trajectory;
use crate::model::DofOrder;

/// Render a trajectory as CSV text.
pub fn trajectory_to_csv(traj: &Trajectory, precision: usize, derivatives: bool) -> String {
    let mut out = String::new();

    // Header row
    out.push_str("time");
    for name in &traj.names {
        out.push_str(&format!(",{}", name));
    }
    if derivatives {
        for (name, order) in traj.names.iter().zip(&traj.dofs) {
            match order {
                DofOrder::Differential => out.push_str(&format!(",d({})", name)),
                DofOrder::Algebraic => out.push_str(&format!(",int({})", name)),
            }
        }
    }
    out.push_str(",iterations\n");

    // Data rows
    for sample in &traj.samples {
        out.push_str(&format!("{:.prec$e}", sample.time, prec = precision));
        for value in &sample.x {
            out.push_str(&format!(",{:.prec$e}", value, prec = precision));
        }
        if derivatives {
            for value in &sample.xp {
                out.push_str(&format!(",{:.prec$e}", value, prec = precision));
            }
        }
        out.push_str(&format!(",{}\n", sample.iterations));
    }
    out
}

/// Write a trajectory to a CSV file.
pub fn write_csv_trajectory(
    traj: &Trajectory,
    path: &Path,
    precision: usize,
    derivatives: bool,
) -> std::io::Result<()> {
    fs::write(path, trajectory_to_csv(traj, precision, derivatives))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::State;

    #[test]
    fn test_csv_layout() {
        let mut traj = Trajectory {
            names: vec!["x".into(), "lambda".into()],
            dofs: vec![DofOrder::Differential, DofOrder::Algebraic],
            ..Default::default()
        };
        traj.push(0.0, &State::new(vec![1.0, 2.0], vec![0.0, 0.5]), 0);
        traj.push(0.1, &State::new(vec![1.5, 2.5], vec![1.0, 0.7]), 3);

        let csv = trajectory_to_csv(&traj, 3, true);
        let lines: Vec<_> = csv.lines().collect();
        assert_eq!(lines[0], "time,x,lambda,d(x),int(lambda),iterations");
        assert_eq!(lines.len(), 3);
        assert!(lines[2].starts_with("1.000e-1,1.500e0,2.500e0"));
        assert!(lines[2].ends_with(",3"));

        let plain = trajectory_to_csv(&traj, 3, false);
        assert_eq!(plain.lines().next(), Some("time,x,lambda,iterations"));
    }
}
