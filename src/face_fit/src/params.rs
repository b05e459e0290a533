//! face_fit run parameters

use std::path::Path;

use anyhow::{ensure, Context, Result};
use face_gn_cuda::SolverConfig;
use serde::{Deserialize, Serialize};

/// Synthetic scene configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SceneParams {
    pub vertex_count: usize,
    pub num_landmarks: usize,
    /// Standard deviation reported for every shape and expression coefficient
    pub coefficient_std_dev: f32,
    pub seed: u64,
    /// Ground-truth XYZ Euler rotation (radians)
    pub rotation: [f32; 3],
    /// Ground-truth translation; the camera looks down -z
    pub translation: [f32; 3],
}

impl Default for SceneParams {
    fn default() -> Self {
        Self {
            vertex_count: 2000,
            num_landmarks: 68,
            coefficient_std_dev: 1.0,
            seed: 7,
            rotation: [0.05, -0.15, 0.02],
            translation: [0.0, 0.0, -0.6],
        }
    }
}

/// Initial-guess perturbation applied before fitting
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PerturbationParams {
    /// Rotation noise sigma (radians)
    pub rotation_sigma: f32,
    /// Translation noise sigma
    pub translation_sigma: f32,
    /// Additive noise sigma on the focal entry P[0][0]
    pub focal_sigma: f32,
    /// Reset shape and expression coefficients of the initial guess
    pub reset_coefficients: bool,
}

impl Default for PerturbationParams {
    fn default() -> Self {
        Self {
            rotation_sigma: 0.03,
            translation_sigma: 0.01,
            focal_sigma: 0.02,
            reset_coefficients: true,
        }
    }
}

/// Everything a run needs, loadable from one JSON file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FitParams {
    pub solver: SolverConfig,
    pub scene: SceneParams,
    pub perturbation: PerturbationParams,
}

impl FitParams {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let params: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        self.solver.validate()?;
        ensure!(self.scene.vertex_count > 0, "vertex_count must be positive");
        ensure!(
            self.scene.num_landmarks <= self.scene.vertex_count,
            "num_landmarks ({}) exceeds vertex_count ({})",
            self.scene.num_landmarks,
            self.scene.vertex_count
        );
        ensure!(
            self.scene.coefficient_std_dev > 0.0,
            "coefficient_std_dev must be positive"
        );
        ensure!(
            self.scene.translation[2] < 0.0,
            "Face must sit in front of the camera (translation z < 0)"
        );
        let p = &self.perturbation;
        ensure!(
            p.rotation_sigma >= 0.0 && p.translation_sigma >= 0.0 && p.focal_sigma >= 0.0,
            "Perturbation sigmas must be non-negative"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use face_gn_cuda::LinearSolverKind;

    #[test]
    fn test_partial_json_takes_defaults() {
        let json = r#"{ "solver": { "linear_solver": "cg" }, "scene": { "seed": 3 } }"#;
        let params: FitParams = serde_json::from_str(json).unwrap();

        assert_eq!(params.solver.linear_solver, LinearSolverKind::Cg);
        assert_eq!(params.solver.num_gn_iterations, 5);
        assert_eq!(params.scene.seed, 3);
        assert_eq!(params.scene.num_landmarks, 68);
        assert!(params.perturbation.reset_coefficients);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_demo_configs_load() {
        let demos = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../demos");
        for name in ["default.json", "host_direct.json"] {
            let params = FitParams::load(&demos.join(name)).unwrap();
            assert!(params.scene.num_landmarks > 0, "{name}");
        }

        let host = FitParams::load(&demos.join("host_direct.json")).unwrap();
        assert_eq!(host.solver.linear_solver, LinearSolverKind::DirectInverse);
        assert!(!host.solver.use_gpu);
        assert_eq!(host.perturbation.focal_sigma, 0.0);
    }

    #[test]
    fn test_rejects_face_behind_camera() {
        let mut params = FitParams::default();
        params.scene.translation = [0.0, 0.0, 0.5];
        assert!(params.validate().is_err());
    }
}
