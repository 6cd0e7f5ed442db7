//! JSON trajectory output.
//!
//! The document carries a format tag and the crate version next to the
//! serialized [`Trajectory`].

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use serde::Serialize;

use crate::engine::Trajectory;

const VERSION: &str = env!("CARGO_PKG_VERSION");
const FORMAT: &str = "mbd-json";

#[derive(Serialize)]
struct Document<'a> {
    format: &'static str,
    version: &'static str,
    #[serde(flatten)]
    trajectory: &'a Trajectory,
}

impl<'a> Document<'a> {
    fn new(trajectory: &'a Trajectory) -> Self {
        Self {
            format: FORMAT,
            version: VERSION,
            trajectory,
        }
    }
}

pub fn trajectory_to_json(traj: &Trajectory) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&Document::new(traj))
}

/// Write a trajectory to a JSON file.
pub fn write_json_trajectory(traj: &Trajectory, path: &Path) -> std::io::Result<()> {
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, &Document::new(traj))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrator::State;
    use crate::model::DofOrder;

    #[test]
    fn test_json_document() {
        let mut traj = Trajectory {
            names: vec!["x".into()],
            dofs: vec![DofOrder::Differential],
            ..Default::default()
        };
        traj.stats.integrator = "implicit-euler".into();
        traj.push(0.25, &State::new(vec![1.0], vec![-2.0]), 2);

        let text = trajectory_to_json(&traj).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["format"], "mbd-json");
        assert_eq!(value["dofs"][0], "differential");
        assert_eq!(value["samples"][0]["time"], 0.25);
        assert_eq!(value["samples"][0]["xp"][0], -2.0);
        assert_eq!(value["stats"]["integrator"], "implicit-euler");

        let back: Trajectory = serde_json::from_value(value).unwrap();
        assert_eq!(back, traj);
    }
}
