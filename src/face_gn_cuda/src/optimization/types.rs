//! Type definitions for Gauss-Newton face fitting.

use std::path::Path;

use anyhow::{ensure, Context, Result};
use serde::{Deserialize, Serialize};

use super::debug::IterationDebug;
use crate::linear::{LinearSolveParams, LinearSolveStats, LinearSolverKind};
use crate::timing::FitTiming;

/// Which builder produces the Jacobian and residuals.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemBuilderKind {
    /// Device kernels. Falls back to `Reference` without a GPU.
    #[default]
    Parallel,
    /// Sequential host builder; solved on device when a GPU is present.
    Reference,
}

/// Configuration for Gauss-Newton face fitting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    /// Number of leading shape basis columns to fit (k).
    pub num_shape_coefficients: usize,

    /// Number of leading expression basis columns to fit (m).
    pub num_expression_coefficients: usize,

    /// Regularization weight is `10^exponent`.
    pub regularization_weight_exponent: f32,

    /// Fixed number of outer iterations. There is no early exit.
    pub num_gn_iterations: usize,

    /// PCG iteration cap per outer iteration.
    pub num_pcg_iterations: usize,

    /// PCG stops when `zᵀr` drops below this.
    pub pcg_tolerance: f32,

    /// Floor for step-size and β denominators.
    pub near_zero: f32,

    pub linear_solver: LinearSolverKind,

    pub builder: SystemBuilderKind,

    /// Use the CUDA backend when available.
    pub use_gpu: bool,

    pub device_id: usize,

    /// α, scale of `JᵀJ` in the normal equations.
    pub alpha_lhs: f32,

    /// s, scale of `Jᵀr` in the normal equations.
    pub rhs_scale: f32,

    /// Record an [`IterationDebug`] per outer iteration.
    pub collect_debug: bool,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            num_shape_coefficients: 80,
            num_expression_coefficients: 76,
            regularization_weight_exponent: -4.0,
            num_gn_iterations: 5,
            num_pcg_iterations: 20,
            pcg_tolerance: 1e-6,
            near_zero: 1e-8,
            linear_solver: LinearSolverKind::Pcg,
            builder: SystemBuilderKind::Parallel,
            use_gpu: true,
            device_id: 0,
            alpha_lhs: 1.0,
            rhs_scale: 1.0,
            collect_debug: false,
        }
    }
}

impl SolverConfig {
    /// Create a builder starting from the defaults.
    pub fn builder() -> SolverConfigBuilder {
        SolverConfigBuilder::new()
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse solver config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a JSON file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read solver config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.num_gn_iterations > 0,
            "num_gn_iterations must be positive"
        );
        ensure!(
            self.num_pcg_iterations > 0,
            "num_pcg_iterations must be positive"
        );
        ensure!(
            self.pcg_tolerance.is_finite() && self.pcg_tolerance > 0.0,
            "pcg_tolerance must be positive, got {}",
            self.pcg_tolerance
        );
        ensure!(
            self.near_zero.is_finite() && self.near_zero > 0.0,
            "near_zero must be positive, got {}",
            self.near_zero
        );
        ensure!(
            self.regularization_weight_exponent.is_finite(),
            "regularization_weight_exponent must be finite"
        );
        ensure!(
            self.alpha_lhs.is_finite() && self.alpha_lhs != 0.0,
            "alpha_lhs must be finite and non-zero"
        );
        ensure!(self.rhs_scale.is_finite(), "rhs_scale must be finite");
        Ok(())
    }

    /// Effective regularization weight `10^exponent`.
    pub fn regularization_weight(&self) -> f32 {
        10f32.powf(self.regularization_weight_exponent)
    }

    /// Parameters handed to the linear solver each iteration.
    pub fn linear_solve_params(&self) -> LinearSolveParams {
        LinearSolveParams {
            kind: self.linear_solver,
            max_iterations: self.num_pcg_iterations,
            tolerance: self.pcg_tolerance,
            near_zero: self.near_zero,
            alpha_lhs: self.alpha_lhs,
            rhs_scale: self.rhs_scale,
        }
    }
}

/// Builder for [`SolverConfig`].
#[derive(Debug, Clone, Default)]
pub struct SolverConfigBuilder {
    config: SolverConfig,
}

impl SolverConfigBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn num_shape_coefficients(mut self, count: usize) -> Self {
        self.config.num_shape_coefficients = count;
        self
    }

    pub fn num_expression_coefficients(mut self, count: usize) -> Self {
        self.config.num_expression_coefficients = count;
        self
    }

    /// Set the regularization weight exponent (weight = 10^exponent).
    pub fn regularization_weight_exponent(mut self, exponent: f32) -> Self {
        self.config.regularization_weight_exponent = exponent;
        self
    }

    pub fn num_gn_iterations(mut self, iterations: usize) -> Self {
        self.config.num_gn_iterations = iterations;
        self
    }

    pub fn num_pcg_iterations(mut self, iterations: usize) -> Self {
        self.config.num_pcg_iterations = iterations;
        self
    }

    pub fn pcg_tolerance(mut self, tolerance: f32) -> Self {
        self.config.pcg_tolerance = tolerance;
        self
    }

    pub fn near_zero(mut self, epsilon: f32) -> Self {
        self.config.near_zero = epsilon;
        self
    }

    pub fn linear_solver(mut self, kind: LinearSolverKind) -> Self {
        self.config.linear_solver = kind;
        self
    }

    pub fn builder(mut self, kind: SystemBuilderKind) -> Self {
        self.config.builder = kind;
        self
    }

    /// Enable or disable GPU acceleration.
    ///
    /// Falls back to the host path if CUDA is not available.
    pub fn use_gpu(mut self, use_gpu: bool) -> Self {
        self.config.use_gpu = use_gpu;
        self
    }

    pub fn device_id(mut self, device_id: usize) -> Self {
        self.config.device_id = device_id;
        self
    }

    pub fn alpha_lhs(mut self, alpha: f32) -> Self {
        self.config.alpha_lhs = alpha;
        self
    }

    pub fn rhs_scale(mut self, scale: f32) -> Self {
        self.config.rhs_scale = scale;
        self
    }

    pub fn collect_debug(mut self, enabled: bool) -> Self {
        self.config.collect_debug = enabled;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<SolverConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Which backend actually ran a solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolveBackend {
    #[default]
    Host,
    /// Host-built system solved on the device.
    DeviceSolve,
    /// Device-built system solved on the device.
    Device,
}

/// Outcome of one [`solve`](crate::GaussNewtonSolver::solve) call.
///
/// Losses are measured at the linearization point of each iteration, i.e.
/// before that iteration's update is applied.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SolveReport {
    /// Outer iterations run.
    pub iterations: usize,

    /// True when the observation set was empty and nothing ran.
    pub skipped: bool,

    pub backend: SolveBackend,

    /// Linear solver statistics per outer iteration.
    pub linear_stats: Vec<LinearSolveStats>,

    /// Sum of squared feature residuals per outer iteration.
    pub reprojection_losses: Vec<f64>,

    /// Sum of squared residuals including regularization, per outer iteration.
    pub total_losses: Vec<f64>,

    /// Populated when `collect_debug` is set.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub debug: Vec<IterationDebug>,

    /// Populated when the `profiling` feature is enabled.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timing: Option<FitTiming>,
}

impl SolveReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    pub fn initial_reprojection_loss(&self) -> Option<f64> {
        self.reprojection_losses.first().copied()
    }

    /// Reprojection loss at the last linearization point.
    pub fn final_reprojection_loss(&self) -> Option<f64> {
        self.reprojection_losses.last().copied()
    }
}
