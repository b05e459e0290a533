//! Normal-equation solvers for the Gauss-Newton step.
//!
//! - [`cpu`]: host PCG/CG/direct solver (nalgebra)
//! - [`gpu`]: device PCG/CG/direct solver (cuBLAS + CubeCL kernels)
//! - [`preconditioner`]: Jacobi preconditioner, host and device
//! - [`cublas`]: cuBLAS wrappers used by the device solver

pub mod cpu;
pub mod cublas;
pub mod gpu;
pub mod preconditioner;
pub mod types;

pub use cpu::solve_normal_equations_cpu;
pub use cublas::{BlasError, CublasContext};
pub use gpu::{solve_normal_equations_gpu, DeviceSystemRef, SolverWorkspace};
pub use preconditioner::jacobi_preconditioner;
pub use types::{LinearSolveParams, LinearSolveStats, LinearSolverKind, PRECONDITIONER_FLOOR};
