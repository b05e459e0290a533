//! GPU kernels for building the Gauss-Newton Jacobian and residuals.
//!
//! One thread per feature writes that feature's two residual rows and its
//! Jacobian row pair; one thread per coefficient writes a regularizer row.
//! Threads never write outside their own rows, so the only ordering
//! requirement is that the Jacobian is zeroed (see [`fill_kernel`]) before a
//! build.
//!
//! All 4x4 and 3x3 matrices are passed row-major. The Jacobian and the basis
//! matrices are column-major:
//! - `jacobian[col * num_residuals + row]`
//! - `basis[col * basis_rows + 3 * vertex_id + axis]`

use cubecl::prelude::*;

/// Fill a buffer with a constant.
///
/// # Arguments
/// * `buffer` - [len] output
/// * `value` - fill value
/// * `len` - number of elements
#[cube(launch_unchecked)]
pub fn fill_kernel<F: Float>(buffer: &mut Array<F>, value: F, len: u32) {
    let idx = ABSOLUTE_POS;

    if idx >= len {
        terminate!();
    }

    buffer[idx] = value;
}

/// Compute residuals and Jacobian row pairs for all sparse features.
///
/// Chain rule per feature (local vertex `l`):
/// - world = M · [l, 1], clip = P · [world, 1], uv = clip.xy / clip.w
/// - Jproj (2x3): perspective divide, depends on 1/w and 1/w²
/// - Jcam (3x3): diag(P00, P11, -1)
/// - Jpose (3x6): [dRx·l, dRy·l, dRz·l, I]
/// - basis block: Jproj · Jcam · R · B[3v..3v+3, :]
///
/// # Arguments
/// * `vertices` - [V * 3] local vertex positions
/// * `vertex_ids` - [N] vertex id per feature
/// * `observed` - [N * 2] observed screen positions
/// * `model_matrix` - [16] row-major model matrix
/// * `rotation_derivatives` - [27] dR/drx, dR/dry, dR/drz, each row-major
/// * `projection` - [16] row-major projection matrix
/// * `shape_basis` - [basis_rows * num_shape] column-major
/// * `expression_basis` - [basis_rows * num_expression] column-major
/// * `num_features` - N
/// * `num_residuals` - Jacobian leading dimension (2N + k + m)
/// * `basis_rows` - 3 * V
/// * `shape_col` - first shape column (7)
/// * `num_shape` - k
/// * `num_expression` - m
/// * `jacobian` - [num_residuals * (7 + k + m)] output, pre-zeroed
/// * `residuals` - [num_residuals] output
#[cube(launch_unchecked)]
pub fn build_feature_rows_kernel<F: Float>(
    vertices: &Array<F>,
    vertex_ids: &Array<u32>,
    observed: &Array<F>,
    model_matrix: &Array<F>,
    rotation_derivatives: &Array<F>,
    projection: &Array<F>,
    shape_basis: &Array<F>,
    expression_basis: &Array<F>,
    num_features: u32,
    num_residuals: u32,
    basis_rows: u32,
    shape_col: u32,
    num_shape: u32,
    num_expression: u32,
    jacobian: &mut Array<F>,
    residuals: &mut Array<F>,
) {
    let idx = ABSOLUTE_POS;

    if idx >= num_features {
        terminate!();
    }

    let vbase = vertex_ids[idx] * 3;
    let lx = vertices[vbase];
    let ly = vertices[vbase + 1];
    let lz = vertices[vbase + 2];

    // World coordinates
    let wx = model_matrix[0] * lx + model_matrix[1] * ly + model_matrix[2] * lz + model_matrix[3];
    let wy = model_matrix[4] * lx + model_matrix[5] * ly + model_matrix[6] * lz + model_matrix[7];
    let wz =
        model_matrix[8] * lx + model_matrix[9] * ly + model_matrix[10] * lz + model_matrix[11];

    // Clip coordinates (z is not needed)
    let cx = projection[0] * wx + projection[1] * wy + projection[2] * wz + projection[3];
    let cy = projection[4] * wx + projection[5] * wy + projection[6] * wz + projection[7];
    let cw = projection[12] * wx + projection[13] * wy + projection[14] * wz + projection[15];

    let inv_w = F::new(1.0) / cw;
    let inv_w2 = inv_w * inv_w;

    let row = idx * 2;
    residuals[row] = cx * inv_w - observed[row];
    residuals[row + 1] = cy * inv_w - observed[row + 1];

    // Perspective divide Jacobian; entries (0,1) and (1,0) are zero
    let a00 = inv_w;
    let a02 = F::new(0.0) - cx * inv_w2;
    let a11 = inv_w;
    let a12 = F::new(0.0) - cy * inv_w2;

    // Jproj · Jcam, Jcam = diag(P00, P11, -1)
    let pw00 = a00 * projection[0];
    let pw02 = F::new(0.0) - a02;
    let pw11 = a11 * projection[5];
    let pw12 = F::new(0.0) - a12;

    // Focal: Jproj · [world.x, 0, 0]
    jacobian[row] = a00 * wx;

    // Rotation: Jproj · Jcam · (dR · l)
    for axis in 0..3u32 {
        let d = axis * 9;
        let dx = rotation_derivatives[d] * lx
            + rotation_derivatives[d + 1] * ly
            + rotation_derivatives[d + 2] * lz;
        let dy = rotation_derivatives[d + 3] * lx
            + rotation_derivatives[d + 4] * ly
            + rotation_derivatives[d + 5] * lz;
        let dz = rotation_derivatives[d + 6] * lx
            + rotation_derivatives[d + 7] * ly
            + rotation_derivatives[d + 8] * lz;

        let col = (axis + 1) * num_residuals;
        jacobian[col + row] = pw00 * dx + pw02 * dz;
        jacobian[col + row + 1] = pw11 * dy + pw12 * dz;
    }

    // Translation: columns of Jproj · Jcam
    jacobian[4 * num_residuals + row] = pw00;
    jacobian[5 * num_residuals + row + 1] = pw11;
    jacobian[6 * num_residuals + row] = pw02;
    jacobian[6 * num_residuals + row + 1] = pw12;

    // Jproj · Jcam · R
    let q00 = pw00 * model_matrix[0] + pw02 * model_matrix[8];
    let q01 = pw00 * model_matrix[1] + pw02 * model_matrix[9];
    let q02 = pw00 * model_matrix[2] + pw02 * model_matrix[10];
    let q10 = pw11 * model_matrix[4] + pw12 * model_matrix[8];
    let q11 = pw11 * model_matrix[5] + pw12 * model_matrix[9];
    let q12 = pw11 * model_matrix[6] + pw12 * model_matrix[10];

    for j in 0..num_shape {
        let b = j * basis_rows + vbase;
        let bx = shape_basis[b];
        let by = shape_basis[b + 1];
        let bz = shape_basis[b + 2];

        let col = (shape_col + j) * num_residuals;
        jacobian[col + row] = q00 * bx + q01 * by + q02 * bz;
        jacobian[col + row + 1] = q10 * bx + q11 * by + q12 * bz;
    }

    let expression_col = shape_col + num_shape;
    for j in 0..num_expression {
        let b = j * basis_rows + vbase;
        let bx = expression_basis[b];
        let by = expression_basis[b + 1];
        let bz = expression_basis[b + 2];

        let col = (expression_col + j) * num_residuals;
        jacobian[col + row] = q00 * bx + q01 * by + q02 * bz;
        jacobian[col + row + 1] = q10 * bx + q11 * by + q12 * bz;
    }
}

/// Write the weighted L2 prior rows for all regularized coefficients.
///
/// Row `row_offset + j` gets `sqrt_weight` on the diagonal column
/// `shape_col + j` and residual `sqrt_weight * coefficients[j]`.
///
/// # Arguments
/// * `coefficients` - [k + m] shape coefficients followed by expression coefficients
/// * `sqrt_weight` - √(10^exponent)
/// * `num_coefficients` - k + m
/// * `row_offset` - first regularizer row (2N)
/// * `shape_col` - first coefficient column (7)
/// * `num_residuals` - Jacobian leading dimension
/// * `jacobian` - output, pre-zeroed
/// * `residuals` - output
#[cube(launch_unchecked)]
pub fn build_regularizer_rows_kernel<F: Float>(
    coefficients: &Array<F>,
    sqrt_weight: F,
    num_coefficients: u32,
    row_offset: u32,
    shape_col: u32,
    num_residuals: u32,
    jacobian: &mut Array<F>,
    residuals: &mut Array<F>,
) {
    let idx = ABSOLUTE_POS;

    if idx >= num_coefficients {
        terminate!();
    }

    let row = row_offset + idx;
    let col = shape_col + idx;
    jacobian[col * num_residuals + row] = sqrt_weight;
    residuals[row] = sqrt_weight * coefficients[idx];
}
