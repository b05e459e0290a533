//! Host linear solver with the same recurrences as the device solver.
//!
//! Used when no GPU is available and as the reference the device path is
//! tested against. All variants solve `(α·JᵀJ)x = s·Jᵀr` and leave the
//! update convention to the caller.

use anyhow::{bail, Result};
use nalgebra::{DMatrix, DVector};

use super::preconditioner::jacobi_preconditioner;
use super::types::{LinearSolveParams, LinearSolveStats, LinearSolverKind};

/// Solve the normal equations for one Gauss-Newton step on the host.
pub fn solve_normal_equations_cpu(
    params: &LinearSolveParams,
    jacobian: &DMatrix<f32>,
    residuals: &DVector<f32>,
) -> Result<(DVector<f32>, LinearSolveStats)> {
    match params.kind {
        LinearSolverKind::Pcg => {
            let preconditioner = jacobi_preconditioner(jacobian);
            Ok(conjugate_gradient(
                params,
                jacobian,
                residuals,
                Some(&preconditioner),
            ))
        }
        LinearSolverKind::Cg => Ok(conjugate_gradient(params, jacobian, residuals, None)),
        LinearSolverKind::DirectInverse => direct_inverse(params, jacobian, residuals),
    }
}

/// Matrix-free (preconditioned) conjugate gradient.
///
/// Without a preconditioner `z = r`, which reduces the recurrence to plain CG.
fn conjugate_gradient(
    params: &LinearSolveParams,
    jacobian: &DMatrix<f32>,
    residuals: &DVector<f32>,
    preconditioner: Option<&DVector<f32>>,
) -> (DVector<f32>, LinearSolveStats) {
    let n = jacobian.ncols();
    let apply = |v: &DVector<f32>| match preconditioner {
        Some(m) => m.component_mul(v),
        None => v.clone(),
    };

    let mut x = DVector::zeros(n);
    let mut r = jacobian.tr_mul(residuals) * params.rhs_scale;
    let mut z = apply(&r);
    let mut p = z.clone();
    let mut old_zr = z.dot(&r);

    let mut stats = LinearSolveStats {
        final_zr: old_zr,
        ..Default::default()
    };

    for _ in 0..params.iteration_bound(n) {
        // JᵀJ·p without forming JᵀJ
        let jp = (jacobian * &p) * params.alpha_lhs;
        let jtjp = jacobian.tr_mul(&jp);

        let curvature = p.dot(&jtjp);
        let step = old_zr / curvature.max(params.near_zero);

        x.axpy(step, &p, 1.0);
        r.axpy(-step, &jtjp, 1.0);

        z = apply(&r);
        let new_zr = z.dot(&r);
        stats.iterations += 1;
        stats.final_zr = new_zr;

        if new_zr < params.tolerance {
            stats.converged = true;
            break;
        }

        let beta = new_zr / old_zr.max(params.near_zero);
        p = &z + p * beta;
        old_zr = new_zr;
    }

    (x, stats)
}

/// Explicit `(α·JᵀJ)⁻¹ · s·Jᵀr`.
fn direct_inverse(
    params: &LinearSolveParams,
    jacobian: &DMatrix<f32>,
    residuals: &DVector<f32>,
) -> Result<(DVector<f32>, LinearSolveStats)> {
    let normal = jacobian.tr_mul(jacobian) * params.alpha_lhs;
    let rhs = jacobian.tr_mul(residuals) * params.rhs_scale;

    let Some(inverse) = normal.try_inverse() else {
        bail!("Normal matrix is singular");
    };

    Ok((inverse * rhs, LinearSolveStats::default()))
}
