//! Jacobi preconditioner and elementwise helpers.
//!
//! `M[c] = 1 / max(2 · Σ_rows J[row, c]², 1e-8)`, the inverse diagonal of the
//! Gauss-Newton Hessian approximation `2·JᵀJ`. The floor keeps the output
//! finite for all-zero columns.

use cubecl::prelude::*;
use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use super::types::PRECONDITIONER_FLOOR;

/// Compute the Jacobi preconditioner, one thread per Jacobian column.
///
/// Each thread sums its whole column serially instead of splitting the rows
/// over a cube with a shared-memory reduction. A column is one contiguous run
/// of `num_rows` values, and there are at most a few hundred columns.
///
/// # Arguments
/// * `jacobian` - [num_rows * num_cols] column-major
/// * `num_rows` - leading dimension
/// * `num_cols` - number of unknowns
/// * `floor` - denominator floor
/// * `preconditioner` - [num_cols] output
#[cube(launch_unchecked)]
pub fn jacobi_preconditioner_kernel<F: Float>(
    jacobian: &Array<F>,
    num_rows: u32,
    num_cols: u32,
    floor: F,
    preconditioner: &mut Array<F>,
) {
    let col = ABSOLUTE_POS;

    if col >= num_cols {
        terminate!();
    }

    let base = col * num_rows;
    let mut sum = F::new(0.0);
    for row in 0..num_rows {
        let value = jacobian[base + row];
        sum += value * value;
    }

    let mut denominator = F::new(2.0) * sum;
    if denominator < floor {
        denominator = floor;
    }
    preconditioner[col] = F::new(1.0) / denominator;
}

/// `out[i] = a[i] * b[i]`.
#[cube(launch_unchecked)]
pub fn elementwise_multiply_kernel<F: Float>(
    a: &Array<F>,
    b: &Array<F>,
    len: u32,
    out: &mut Array<F>,
) {
    let idx = ABSOLUTE_POS;

    if idx >= len {
        terminate!();
    }

    out[idx] = a[idx] * b[idx];
}

/// Host Jacobi preconditioner, parallel over columns.
pub fn jacobi_preconditioner(jacobian: &DMatrix<f32>) -> DVector<f32> {
    let values: Vec<f32> = (0..jacobian.ncols())
        .into_par_iter()
        .map(|col| {
            let sum = jacobian.column(col).norm_squared();
            1.0 / (2.0 * sum).max(PRECONDITIONER_FLOOR)
        })
        .collect();
    DVector::from_vec(values)
}
