//! Configuration and result types shared by the host and device linear solvers.

use serde::{Deserialize, Serialize};

/// Floor applied to the Jacobi preconditioner denominator.
pub const PRECONDITIONER_FLOOR: f32 = 1e-8;

/// Strategy for solving the Gauss-Newton normal equations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinearSolverKind {
    /// Matrix-free conjugate gradient with a Jacobi preconditioner.
    #[default]
    Pcg,
    /// Matrix-free conjugate gradient without preconditioning.
    Cg,
    /// Form `JᵀJ`, invert it explicitly and multiply. Reference only.
    DirectInverse,
}

/// Parameters of one normal-equation solve `(α·JᵀJ)x = s·Jᵀr`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearSolveParams {
    pub kind: LinearSolverKind,
    /// Iteration cap; the effective bound is `min(num_unknowns, max_iterations)`.
    pub max_iterations: usize,
    /// Convergence threshold on `zᵀr`.
    pub tolerance: f32,
    /// Floor for step-size and β denominators.
    pub near_zero: f32,
    /// α, scale of the normal matrix.
    pub alpha_lhs: f32,
    /// s, scale of the right-hand side.
    pub rhs_scale: f32,
}

impl Default for LinearSolveParams {
    fn default() -> Self {
        Self {
            kind: LinearSolverKind::Pcg,
            max_iterations: 20,
            tolerance: 1e-6,
            near_zero: 1e-8,
            alpha_lhs: 1.0,
            rhs_scale: 1.0,
        }
    }
}

impl LinearSolveParams {
    /// Iteration bound for a system with `num_unknowns` columns.
    pub fn iteration_bound(&self, num_unknowns: usize) -> usize {
        num_unknowns.min(self.max_iterations)
    }
}

/// Outcome of one linear solve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct LinearSolveStats {
    /// CG iterations performed (0 for the direct solve).
    pub iterations: usize,
    /// `zᵀr` after the last iteration (`rᵀr` for CG, 0 for the direct solve).
    pub final_zr: f32,
    /// Whether `zᵀr` fell below the tolerance.
    pub converged: bool,
}
