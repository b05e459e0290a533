//! Gauss-Newton optimization for face fitting.

pub mod debug;
pub mod solver;
pub mod types;
pub mod update;

pub use debug::IterationDebug;
pub use solver::GaussNewtonSolver;
pub use types::{SolveBackend, SolveReport, SolverConfig, SolverConfigBuilder, SystemBuilderKind};
pub use update::apply_update;
