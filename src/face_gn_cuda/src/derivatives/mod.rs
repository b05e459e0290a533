//! Jacobian and residual construction for the Gauss-Newton system.
//!
//! Two builders produce the same dense, column-major system:
//! - [`cpu`]: sequential nalgebra reference built from the per-stage
//!   Jacobians (projection, camera, intrinsics, pose)
//! - [`gpu`]: CubeCL kernels with one thread per feature row pair and one
//!   thread per regularization row
//!
//! See [`SystemLayout`] for the unknown and residual ordering.

pub mod cpu;
pub mod gpu;
pub mod kernels;
pub mod types;

pub use cpu::{
    build_feature_rows_cpu, build_regularizer_rows_cpu, build_system_cpu, project_vertex,
    ProjectedVertex,
};
pub use gpu::{DeviceSystem, GpuSystemBuilder};
pub use types::{
    residual_losses, FrameGeometry, LinearSystem, SystemLayout, FOCAL_COL, POSE_UNKNOWNS,
    ROTATION_COL, TRANSLATION_COL,
};
