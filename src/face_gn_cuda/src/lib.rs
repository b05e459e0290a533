//! CubeCL-based CUDA Gauss-Newton face fitting library.
//!
//! Fits a parametric 3D face model (rigid pose, camera focal term, linear
//! shape and expression blendshape coefficients) to sparse 2D landmark
//! observations. The projection chain is differentiated analytically and the
//! normal equations are solved with a matrix-free preconditioned conjugate
//! gradient method built on cuBLAS primitives.
//!
//! # Architecture
//!
//! Each outer iteration is split into phases:
//! - Phase 1: Geometry refresh through the [`FaceModel`] collaborator
//! - Phase 2: Jacobian + residual construction (one worker per feature row pair)
//! - Phase 3: Regularization rows (one worker per coefficient)
//! - Phase 4: Jacobi preconditioner + PCG solve of `(αJᵀJ)x = sJᵀr`
//! - Phase 5: Parameter update with expression clamping
//!
//! # Usage
//!
//! ```ignore
//! use face_gn_cuda::{FeaturePrior, GaussNewtonSolver, SolverConfig};
//!
//! let config = SolverConfig::builder()
//!     .num_shape_coefficients(80)
//!     .num_expression_coefficients(76)
//!     .num_gn_iterations(5)
//!     .build()?;
//! let mut solver = GaussNewtonSolver::new(config)?;
//!
//! let prior = FeaturePrior::new(landmark_vertex_ids);
//! let features = prior.pair(&detected_landmarks)?;
//!
//! let report = solver.solve(&features, &mut face, &mut projection)?;
//! println!("loss: {:?}", report.final_reprojection_loss());
//! ```

/// Print diagnostic output from tests.
#[doc(hidden)]
#[macro_export]
macro_rules! test_println {
    ($($arg:tt)*) => {
        if cfg!(test) {
            eprintln!($($arg)*);
        }
    };
}

/// Skip test at runtime if CUDA is not available.
#[cfg(test)]
macro_rules! require_cuda {
    () => {
        if !$crate::runtime::is_cuda_available() {
            $crate::test_println!("Skipping test: CUDA not available");
            return;
        }
    };
}

pub mod derivatives;
pub mod linear;
pub mod model;
pub mod optimization;
pub mod runtime;
pub mod test_utils;
pub mod timing;

pub use derivatives::{LinearSystem, SystemLayout};
pub use linear::{LinearSolveStats, LinearSolverKind};
pub use model::{FaceModel, FeatureCorrespondence, FeaturePrior};
pub use optimization::{
    GaussNewtonSolver, IterationDebug, SolveReport, SolverConfig, SolverConfigBuilder,
    SystemBuilderKind,
};

// GPU runtime (optional, for direct GPU access)
pub use runtime::{is_cuda_available, GpuRuntime};
