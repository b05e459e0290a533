//! Gauss-Newton face fitting loop.
//!
//! Each `solve()` runs a fixed number of outer iterations:
//!
//! ```text
//! for iteration in 0..num_gn_iterations:
//!   1. face.recompute_geometry()
//!   2. build J, r at the current state (device kernels or host reference)
//!   3. solve (α·JᵀJ)x = s·Jᵀr (device or host PCG/CG/direct)
//!   4. θ -= x (σ-scaled for coefficients, expressions clamped to [0, 1])
//! ```
//!
//! There is no early exit. Device buffers live for one `solve()`; the GPU
//! runtime lives as long as the solver.

use anyhow::{ensure, Context, Result};
use nalgebra::{DVector, Matrix4};
use tracing::{debug, info, warn};

use super::debug::IterationDebug;
use super::types::{SolveBackend, SolveReport, SolverConfig, SystemBuilderKind};
use super::update::apply_update;
use crate::derivatives::{
    build_feature_rows_cpu, build_regularizer_rows_cpu, residual_losses, DeviceSystem,
    FrameGeometry, GpuSystemBuilder, LinearSystem, SystemLayout,
};
use crate::linear::{
    solve_normal_equations_cpu, solve_normal_equations_gpu, LinearSolveParams, LinearSolveStats,
    SolverWorkspace,
};
use crate::model::{FaceModel, FeatureCorrespondence};
use crate::runtime::{is_cuda_available, GpuRuntime};
use crate::time_phase;
use crate::timing::TimingCollector;

/// Linear step computed at one linearization point.
struct Step {
    solution: DVector<f32>,
    stats: LinearSolveStats,
    reprojection_loss: f64,
    total_loss: f64,
}

/// Where J and r come from on a device backend.
enum DeviceBuffers {
    /// Built in place by the parallel kernels.
    Parallel(GpuSystemBuilder),
    /// Built on the host and copied in every iteration.
    Uploaded(DeviceSystem),
}

/// Device buffers owned by one `solve()` call and reused by its iterations.
struct DeviceState {
    buffers: DeviceBuffers,
    workspace: SolverWorkspace,
}

/// Gauss-Newton solver for parametric face fitting.
pub struct GaussNewtonSolver {
    config: SolverConfig,
    /// GPU runtime (if GPU acceleration is enabled and available)
    gpu_runtime: Option<GpuRuntime>,
}

impl GaussNewtonSolver {
    /// Create a solver, initializing the GPU runtime when requested.
    ///
    /// GPU initialization failure is not an error: the solver logs a warning
    /// and uses the host path.
    pub fn new(config: SolverConfig) -> Result<Self> {
        config.validate()?;

        let gpu_runtime = if config.use_gpu && is_cuda_available() {
            match GpuRuntime::with_device_id(config.device_id) {
                Ok(runtime) => {
                    info!(device_id = config.device_id, "GPU runtime initialized");
                    Some(runtime)
                }
                Err(e) => {
                    warn!("Failed to initialize GPU runtime: {e:#}. Falling back to the host reference path.");
                    None
                }
            }
        } else {
            if config.use_gpu {
                warn!("CUDA not available. Falling back to the host reference path.");
            }
            None
        };

        Ok(Self {
            config,
            gpu_runtime,
        })
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Whether a GPU runtime is active.
    pub fn has_gpu(&self) -> bool {
        self.gpu_runtime.is_some()
    }

    /// Backend the next `solve()` will use.
    pub fn backend(&self) -> SolveBackend {
        match (self.config.builder, self.gpu_runtime.is_some()) {
            (SystemBuilderKind::Parallel, true) => SolveBackend::Device,
            (SystemBuilderKind::Reference, true) => SolveBackend::DeviceSolve,
            (_, false) => SolveBackend::Host,
        }
    }

    /// Fit the face to the observed features, mutating the face coefficients
    /// and the focal entry `projection[(0, 0)]` in place.
    ///
    /// An empty feature set is a no-op. On error the face keeps the state of
    /// the last successfully applied update.
    pub fn solve<M: FaceModel + ?Sized>(
        &mut self,
        features: &[FeatureCorrespondence],
        face: &mut M,
        projection: &mut Matrix4<f32>,
    ) -> Result<SolveReport> {
        if features.is_empty() {
            debug!("No features to fit, skipping solve");
            return Ok(SolveReport::skipped());
        }

        let layout = self.validate_inputs(features, face)?;
        let weight = self.config.regularization_weight();
        let params = self.config.linear_solve_params();
        let backend = self.backend();

        let mut collector = TimingCollector::new();
        collector.start_solve();

        let mut report = SolveReport {
            backend,
            ..Default::default()
        };

        // Per-solve device buffers
        let mut device = match (&self.gpu_runtime, backend) {
            (Some(runtime), SolveBackend::Device | SolveBackend::DeviceSolve) => {
                let buffers = if backend == SolveBackend::Device {
                    DeviceBuffers::Parallel(GpuSystemBuilder::new(
                        runtime,
                        layout,
                        features,
                        face.shape_basis(),
                        face.expression_basis(),
                    )?)
                } else {
                    DeviceBuffers::Uploaded(DeviceSystem::allocate(runtime, layout))
                };
                let workspace = SolverWorkspace::new(
                    runtime,
                    params.kind,
                    layout.num_residuals(),
                    layout.num_unknowns(),
                );
                Some(DeviceState { buffers, workspace })
            }
            _ => None,
        };

        for iteration in 0..self.config.num_gn_iterations {
            collector.start_iteration();

            time_phase!(collector, "geometry", face.recompute_geometry())
                .with_context(|| format!("Geometry refresh failed at iteration {iteration}"))?;

            let mut iteration_debug = self.config.collect_debug.then(|| {
                let mut record = IterationDebug::new(iteration);
                let state = face.state_mut();
                record.set_pose(projection[(0, 0)], state.rotation, state.translation);
                record
            });

            let step = {
                let geometry = FrameGeometry::capture(&*face, projection);
                match device.as_mut() {
                    Some(DeviceState {
                        buffers: DeviceBuffers::Parallel(builder),
                        workspace,
                    }) => self.device_step(
                        builder,
                        workspace,
                        &geometry,
                        weight,
                        &params,
                        &mut collector,
                    )?,
                    Some(DeviceState {
                        buffers: DeviceBuffers::Uploaded(system),
                        workspace,
                    }) => self.host_step(
                        layout,
                        &geometry,
                        features,
                        weight,
                        &params,
                        Some((&*system, &*workspace)),
                        &mut collector,
                    )?,
                    None => self.host_step(
                        layout,
                        &geometry,
                        features,
                        weight,
                        &params,
                        None,
                        &mut collector,
                    )?,
                }
            };

            let clamped = time_phase!(
                collector,
                "update",
                apply_update(&step.solution, &layout, face, projection)
            )
            .with_context(|| format!("Update rejected at iteration {iteration}"))?;

            debug!(
                iteration,
                reprojection_loss = step.reprojection_loss,
                total_loss = step.total_loss,
                cg_iterations = step.stats.iterations,
                final_zr = step.stats.final_zr,
                converged = step.stats.converged,
                clamped,
                "Gauss-Newton iteration"
            );

            if let Some(record) = iteration_debug.as_mut() {
                record.reprojection_loss = step.reprojection_loss;
                record.total_loss = step.total_loss;
                record.linear_solve = step.stats;
                record.clamped_expressions = clamped;
                record.set_update(&step.solution);
            }
            report.debug.extend(iteration_debug);

            report.iterations += 1;
            report.linear_stats.push(step.stats);
            report.reprojection_losses.push(step.reprojection_loss);
            report.total_losses.push(step.total_loss);

            collector.end_iteration();
        }

        let timing = collector.finish();
        if cfg!(feature = "profiling") {
            report.timing = Some(timing);
        }

        Ok(report)
    }

    /// Build on the device and solve on the device.
    fn device_step(
        &self,
        builder: &mut GpuSystemBuilder,
        workspace: &SolverWorkspace,
        geometry: &FrameGeometry<'_>,
        weight: f32,
        params: &LinearSolveParams,
        collector: &mut TimingCollector,
    ) -> Result<Step> {
        let runtime = self.runtime()?;

        // Wait for the kernels so the phase covers device work, not the launch
        let system = time_phase!(collector, "jacobian", {
            let system = builder.build(runtime, geometry, weight)?;
            runtime.sync_kernels();
            system
        });

        let (solution, stats) = time_phase!(
            collector,
            "solver",
            solve_normal_equations_gpu(runtime, params, &system.solver_input(), workspace)
        )?;

        let residuals = runtime.read_f32(&system.residuals, system.layout.num_residuals());
        let (reprojection_loss, total_loss) =
            residual_losses(&residuals, system.layout.num_feature_rows());

        Ok(Step {
            solution,
            stats,
            reprojection_loss,
            total_loss,
        })
    }

    /// Build on the host; solve on the device when device buffers are given.
    #[allow(clippy::too_many_arguments)]
    fn host_step(
        &self,
        layout: SystemLayout,
        geometry: &FrameGeometry<'_>,
        features: &[FeatureCorrespondence],
        weight: f32,
        params: &LinearSolveParams,
        device: Option<(&DeviceSystem, &SolverWorkspace)>,
        collector: &mut TimingCollector,
    ) -> Result<Step> {
        let mut system = LinearSystem::zeros(layout);
        time_phase!(
            collector,
            "jacobian",
            build_feature_rows_cpu(geometry, features, &mut system)
        );
        time_phase!(
            collector,
            "regularizer",
            build_regularizer_rows_cpu(geometry, weight, &mut system)
        );

        let (solution, stats) = time_phase!(collector, "solver", {
            match device {
                Some((device_system, workspace)) => {
                    let runtime = self.runtime()?;
                    device_system.write(runtime, &system)?;
                    solve_normal_equations_gpu(
                        runtime,
                        params,
                        &device_system.solver_input(),
                        workspace,
                    )
                }
                None => solve_normal_equations_cpu(params, &system.jacobian, &system.residuals),
            }
        })?;

        Ok(Step {
            solution,
            stats,
            reprojection_loss: system.reprojection_loss(),
            total_loss: system.total_loss(),
        })
    }

    fn runtime(&self) -> Result<&GpuRuntime> {
        self.gpu_runtime
            .as_ref()
            .context("GPU runtime is not initialized")
    }

    /// Check sizes once so the builders can index without bounds surprises.
    fn validate_inputs<M: FaceModel + ?Sized>(
        &self,
        features: &[FeatureCorrespondence],
        face: &M,
    ) -> Result<SystemLayout> {
        let k = self.config.num_shape_coefficients;
        let m = self.config.num_expression_coefficients;
        let vertex_count = face.vertex_count();
        let basis_rows = 3 * vertex_count;

        ensure!(
            face.vertices().len() == vertex_count,
            "Face reports {} vertices but holds {}",
            vertex_count,
            face.vertices().len()
        );

        let shape_basis = face.shape_basis();
        let expression_basis = face.expression_basis();
        ensure!(
            shape_basis.nrows() == basis_rows && expression_basis.nrows() == basis_rows,
            "Basis row counts ({}, {}) do not match 3 x {} vertices",
            shape_basis.nrows(),
            expression_basis.nrows(),
            vertex_count
        );
        ensure!(
            shape_basis.ncols() >= k,
            "Shape basis has {} columns, {} requested",
            shape_basis.ncols(),
            k
        );
        ensure!(
            expression_basis.ncols() >= m,
            "Expression basis has {} columns, {} requested",
            expression_basis.ncols(),
            m
        );
        ensure!(
            face.shape_coefficients().len() >= k && face.shape_std_dev().len() >= k,
            "Shape coefficients or standard deviations shorter than {k}"
        );
        ensure!(
            face.expression_coefficients().len() >= m && face.expression_std_dev().len() >= m,
            "Expression coefficients or standard deviations shorter than {m}"
        );
        ensure!(
            face.shape_std_dev()[..k].iter().all(|s| *s > 0.0)
                && face.expression_std_dev()[..m].iter().all(|s| *s > 0.0),
            "Standard deviations must be positive"
        );

        if let Some(bad) = features
            .iter()
            .find(|f| f.vertex_id as usize >= vertex_count)
        {
            anyhow::bail!(
                "Feature vertex id {} out of range ({} vertices)",
                bad.vertex_id,
                vertex_count
            );
        }

        Ok(SystemLayout::new(features.len(), k, m))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::LinearSolverKind;
    use crate::runtime::cuda_device_count;
    use crate::test_utils::{landmark_ids, make_projection, render_observations, SyntheticFace};
    use nalgebra::Vector3;

    const VERTICES: usize = 200;
    const FEATURES: usize = 40;

    fn host_config() -> SolverConfig {
        SolverConfig::builder()
            .num_shape_coefficients(4)
            .num_expression_coefficients(3)
            .use_gpu(false)
            .build()
            .unwrap()
    }

    /// Scene rendered at the face's ground-truth state.
    fn scene() -> (SyntheticFace, Matrix4<f32>, Vec<FeatureCorrespondence>) {
        let mut face = SyntheticFace::new(VERTICES, 6, 5, 1.0, 42);
        face.set_rotation(Vector3::new(0.05, -0.1, 0.02));
        let projection = make_projection();
        let ids = landmark_ids(FEATURES, VERTICES);
        let features = render_observations(&face, &projection, &ids);
        (face, projection, features)
    }

    fn perturb(face: &mut SyntheticFace) {
        face.set_rotation(face.rotation() + Vector3::new(0.04, -0.03, 0.02));
        face.set_translation(face.translation() + Vector3::new(0.01, -0.015, 0.03));
    }

    #[test]
    fn test_empty_features_is_noop() {
        let (mut face, mut projection, _) = scene();
        let before_projection = projection;
        let before_rotation = face.rotation();
        let mut solver = GaussNewtonSolver::new(host_config()).unwrap();

        let report = solver.solve(&[], &mut face, &mut projection).unwrap();

        assert!(report.skipped);
        assert_eq!(report.iterations, 0);
        assert_eq!(projection, before_projection);
        assert_eq!(face.rotation(), before_rotation);
    }

    #[test]
    fn test_unperturbed_scene_stays_at_zero_loss() {
        let (mut face, mut projection, features) = scene();
        let before_rotation = face.rotation();
        let mut solver = GaussNewtonSolver::new(host_config()).unwrap();

        let report = solver.solve(&features, &mut face, &mut projection).unwrap();

        assert_eq!(report.iterations, 5);
        for loss in &report.reprojection_losses {
            assert!(*loss < 1e-10, "loss {loss}");
        }
        assert!((face.rotation() - before_rotation).norm() < 1e-5);
    }

    #[test]
    fn test_perturbed_pose_loss_decreases() {
        let (mut face, mut projection, features) = scene();
        perturb(&mut face);
        let mut solver = GaussNewtonSolver::new(host_config()).unwrap();

        let report = solver.solve(&features, &mut face, &mut projection).unwrap();

        let initial = report.initial_reprojection_loss().unwrap();
        let last = report.final_reprojection_loss().unwrap();
        test_println!("loss {initial:.3e} -> {last:.3e}");
        assert!(last < initial * 0.1, "loss {initial} -> {last}");
        assert_eq!(report.linear_stats.len(), 5);
        for stats in &report.linear_stats {
            assert!(stats.iterations <= 7 + 4 + 3);
        }
    }

    #[test]
    fn test_first_step_exact_with_scaled_basis() {
        let mut face = SyntheticFace::new(VERTICES, 6, 5, 2.5, 42);
        face.set_rotation(Vector3::new(0.05, -0.1, 0.02));
        face.set_shape_coefficients(&[0.3, -0.2, 0.1, 0.25, 0.0, 0.0]);
        let mut projection = make_projection();
        let features = render_observations(&face, &projection, &landmark_ids(FEATURES, VERTICES));
        face.set_shape_coefficients(&[0.0; 6]);

        let config = SolverConfig {
            num_gn_iterations: 2,
            regularization_weight_exponent: -12.0,
            pcg_tolerance: 1e-14,
            ..host_config()
        };
        let mut solver = GaussNewtonSolver::new(config).unwrap();
        let report = solver.solve(&features, &mut face, &mut projection).unwrap();

        // A step scaled by 1 / std_dev would only remove 60% of the residual
        let losses = &report.reprojection_losses;
        test_println!("loss {:.3e} -> {:.3e}", losses[0], losses[1]);
        assert!(losses[1] < losses[0] * 0.05, "loss {} -> {}", losses[0], losses[1]);
    }

    #[test]
    fn test_linear_solvers_agree_on_first_step() {
        let mut rotations = Vec::new();
        for kind in [
            LinearSolverKind::Pcg,
            LinearSolverKind::Cg,
            LinearSolverKind::DirectInverse,
        ] {
            let (mut face, mut projection, features) = scene();
            perturb(&mut face);
            // Pose only keeps the normal matrix well conditioned in f32
            let config = SolverConfig {
                num_shape_coefficients: 0,
                num_expression_coefficients: 0,
                linear_solver: kind,
                num_gn_iterations: 1,
                pcg_tolerance: 1e-14,
                ..host_config()
            };
            let mut solver = GaussNewtonSolver::new(config).unwrap();

            solver.solve(&features, &mut face, &mut projection).unwrap();
            rotations.push(face.rotation());
        }

        for rotation in &rotations[1..] {
            assert!((rotation - rotations[0]).norm() < 5e-3);
        }
    }

    #[test]
    fn test_expression_coefficients_stay_in_unit_interval() {
        let (mut face, mut projection, _) = scene();
        face.set_expression_coefficients(&[1.0, 0.0, 1.0, 0.5, 0.5]);
        let features = render_observations(&face, &projection, &landmark_ids(FEATURES, VERTICES));
        face.set_expression_coefficients(&[0.9, 0.1, 0.95, 0.5, 0.5]);
        perturb(&mut face);

        let mut solver = GaussNewtonSolver::new(host_config()).unwrap();
        solver.solve(&features, &mut face, &mut projection).unwrap();

        for value in face.expression_coefficients() {
            assert!((0.0..=1.0).contains(value), "expression {value}");
        }
    }

    #[test]
    fn test_debug_records() {
        let (mut face, mut projection, features) = scene();
        perturb(&mut face);
        let config = SolverConfig {
            collect_debug: true,
            num_gn_iterations: 2,
            ..host_config()
        };
        let mut solver = GaussNewtonSolver::new(config).unwrap();

        let report = solver.solve(&features, &mut face, &mut projection).unwrap();

        assert_eq!(report.debug.len(), 2);
        assert_eq!(report.debug[1].iteration, 1);
        assert_eq!(report.debug[0].reprojection_loss, report.reprojection_losses[0]);
        assert!(report.debug[0].update_norm > 0.0);
    }

    #[test]
    fn test_rejects_out_of_range_vertex() {
        let (mut face, mut projection, mut features) = scene();
        features[3].vertex_id = VERTICES as u32;
        let mut solver = GaussNewtonSolver::new(host_config()).unwrap();

        assert!(solver.solve(&features, &mut face, &mut projection).is_err());
    }

    #[test]
    fn test_rejects_oversized_coefficient_count() {
        let (mut face, mut projection, features) = scene();
        let config = SolverConfig {
            num_shape_coefficients: 7,
            ..host_config()
        };
        let mut solver = GaussNewtonSolver::new(config).unwrap();

        assert!(solver.solve(&features, &mut face, &mut projection).is_err());
    }

    #[test]
    fn test_non_finite_step_leaves_model_untouched() {
        let (mut face, mut projection, mut features) = scene();
        // Put vertex 0 on the camera plane so its clip w is zero
        let depth = face.vertices()[0].z;
        face.set_rotation(Vector3::zeros());
        face.set_translation(Vector3::new(0.0, 0.0, -depth));
        features[0].vertex_id = 0;
        let before_projection = projection;
        let before_translation = face.translation();
        let mut solver = GaussNewtonSolver::new(host_config()).unwrap();

        let result = solver.solve(&features, &mut face, &mut projection);

        assert!(result.is_err());
        assert_eq!(projection, before_projection);
        assert_eq!(face.translation(), before_translation);
        assert_eq!(face.rotation(), Vector3::zeros());
    }

    #[test]
    fn test_gpu_request_without_cuda_uses_host() {
        let config = SolverConfig {
            use_gpu: true,
            ..host_config()
        };
        let solver = GaussNewtonSolver::new(config).unwrap();

        if !is_cuda_available() {
            assert!(!solver.has_gpu());
            assert_eq!(solver.backend(), SolveBackend::Host);
        }
        assert_eq!(solver.backend() == SolveBackend::Device, solver.has_gpu());
    }

    #[test]
    fn test_missing_device_falls_back_to_host() {
        let config = SolverConfig {
            use_gpu: true,
            device_id: cuda_device_count() + 1,
            ..host_config()
        };
        let mut solver = GaussNewtonSolver::new(config).unwrap();
        assert!(!solver.has_gpu());
        assert_eq!(solver.backend(), SolveBackend::Host);

        let (mut face, mut projection, features) = scene();
        perturb(&mut face);
        let report = solver.solve(&features, &mut face, &mut projection).unwrap();

        assert_eq!(report.backend, SolveBackend::Host);
        let initial = report.initial_reprojection_loss().unwrap();
        let last = report.final_reprojection_loss().unwrap();
        assert!(last < initial * 0.1, "loss {initial} -> {last}");
    }

    #[test]
    fn test_gpu_matches_host() {
        require_cuda!();

        let mut results = Vec::new();
        for (use_gpu, builder) in [
            (false, SystemBuilderKind::Parallel),
            (true, SystemBuilderKind::Parallel),
            (true, SystemBuilderKind::Reference),
        ] {
            let (mut face, mut projection, features) = scene();
            perturb(&mut face);
            let config = SolverConfig {
                use_gpu,
                builder,
                ..host_config()
            };
            let mut solver = GaussNewtonSolver::new(config).unwrap();

            let report = solver.solve(&features, &mut face, &mut projection).unwrap();
            let initial = report.initial_reprojection_loss().unwrap();
            let last = report.final_reprojection_loss().unwrap();
            assert!(last < initial * 0.1, "loss {initial} -> {last}");
            results.push((report.backend, face.rotation(), face.translation()));
        }

        assert_eq!(results[0].0, SolveBackend::Host);
        assert_eq!(results[1].0, SolveBackend::Device);
        assert_eq!(results[2].0, SolveBackend::DeviceSolve);
        for (_, rotation, translation) in &results[1..] {
            assert!((rotation - results[0].1).norm() < 1e-3);
            assert!((translation - results[0].2).norm() < 1e-3);
        }
    }
}
