//! Debug types for Gauss-Newton iteration tracking.
//!
//! When `collect_debug` is set, each outer iteration records the pose it
//! linearized around, the losses there, the linear-solver outcome and the
//! update that was applied.

use anyhow::Result;
use nalgebra::{DVector, Vector3};
use serde::Serialize;

use crate::linear::LinearSolveStats;

/// Debug information captured at each Gauss-Newton iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationDebug {
    /// Iteration number (0-indexed).
    pub iteration: usize,

    /// Focal entry `P[0][0]` at the start of this iteration.
    pub focal: f32,

    /// Rotation coefficients at the start of this iteration.
    pub rotation: Vec<f32>,

    /// Translation coefficients at the start of this iteration.
    pub translation: Vec<f32>,

    /// Squared reprojection loss at the linearization point.
    pub reprojection_loss: f64,

    /// Total loss including regularization rows.
    pub total_loss: f64,

    pub linear_solve: LinearSolveStats,

    /// Pose part of the solution `[focal, rx, ry, rz, tx, ty, tz]`.
    pub pose_update: Vec<f32>,

    /// Norm of the full solution vector.
    pub update_norm: f32,

    /// Number of expression coefficients that hit the `[0, 1]` clamp.
    pub clamped_expressions: usize,
}

impl IterationDebug {
    /// Create a new iteration debug with default values.
    pub fn new(iteration: usize) -> Self {
        Self {
            iteration,
            focal: 0.0,
            rotation: vec![0.0; 3],
            translation: vec![0.0; 3],
            reprojection_loss: 0.0,
            total_loss: 0.0,
            linear_solve: LinearSolveStats::default(),
            pose_update: vec![0.0; 7],
            update_norm: 0.0,
            clamped_expressions: 0,
        }
    }

    /// Set the pose the iteration linearized around.
    pub fn set_pose(&mut self, focal: f32, rotation: &Vector3<f32>, translation: &Vector3<f32>) {
        self.focal = focal;
        self.rotation = rotation.iter().copied().collect();
        self.translation = translation.iter().copied().collect();
    }

    /// Set the update from the linear solution vector.
    pub fn set_update(&mut self, solution: &DVector<f32>) {
        self.pose_update = solution.iter().take(7).copied().collect();
        self.update_norm = solution.norm();
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Format as a compact log line.
    pub fn to_log_line(&self) -> String {
        format!(
            "iter={} focal={:.5} rot=[{:.5},{:.5},{:.5}] trans=[{:.5},{:.5},{:.5}] loss={:.6e} total={:.6e} cg_iters={} zr={:.3e} step={:.3e}",
            self.iteration,
            self.focal,
            self.rotation[0], self.rotation[1], self.rotation[2],
            self.translation[0], self.translation[1], self.translation[2],
            self.reprojection_loss,
            self.total_loss,
            self.linear_solve.iterations,
            self.linear_solve.final_zr,
            self.update_norm,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_update() {
        let mut debug = IterationDebug::new(2);
        let solution = DVector::from_vec(vec![3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 4.0, 0.0, 0.0]);

        debug.set_update(&solution);

        assert_eq!(debug.pose_update.len(), 7);
        assert_eq!(debug.pose_update[6], 4.0);
        assert_eq!(debug.update_norm, 5.0);
    }

    #[test]
    fn test_to_json() {
        let mut debug = IterationDebug::new(0);
        debug.set_pose(1.2, &Vector3::new(0.1, 0.2, 0.3), &Vector3::new(0.0, 0.0, -0.6));
        debug.reprojection_loss = 0.5;

        let json = debug.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["iteration"], 0);
        assert_eq!(value["reprojection_loss"], 0.5);
        assert_eq!(value["rotation"].as_array().unwrap().len(), 3);
        assert!(debug.to_log_line().starts_with("iter=0"));
    }
}
