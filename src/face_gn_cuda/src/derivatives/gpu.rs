//! Device-resident Jacobian/residual builder.
//!
//! Per `solve()` call the builder uploads the feature correspondences and the
//! fitted basis columns once and allocates the Jacobian and residual buffers.
//! Per Gauss-Newton iteration only the vertices, coefficients and the three
//! small matrices are re-uploaded before the kernels run.

use anyhow::{ensure, Result};
use cubecl::cuda::CudaRuntime;
use cubecl::prelude::*;
use cubecl::server::Handle;
use nalgebra::{DMatrix, Matrix3, Matrix4};

use super::kernels::{build_feature_rows_kernel, build_regularizer_rows_kernel};
use super::types::{FrameGeometry, LinearSystem, SystemLayout};
use crate::linear::DeviceSystemRef;
use crate::model::FeatureCorrespondence;
use crate::runtime::{GpuRuntime, BLOCK_SIZE};

/// Flatten a 4x4 matrix row-major, the order the kernels index.
pub fn matrix4_to_row_major(m: &Matrix4<f32>) -> [f32; 16] {
    let mut out = [0.0f32; 16];
    for row in 0..4 {
        for col in 0..4 {
            out[row * 4 + col] = m[(row, col)];
        }
    }
    out
}

/// Flatten three 3x3 matrices row-major, back to back.
pub fn matrices3_to_row_major(ms: &[Matrix3<f32>; 3]) -> [f32; 27] {
    let mut out = [0.0f32; 27];
    for (k, m) in ms.iter().enumerate() {
        for row in 0..3 {
            for col in 0..3 {
                out[k * 9 + row * 3 + col] = m[(row, col)];
            }
        }
    }
    out
}

/// Leading `count` columns of a column-major basis as one contiguous slice.
fn leading_columns(basis: &DMatrix<f32>, count: usize) -> &[f32] {
    &basis.as_slice()[..basis.nrows() * count]
}

/// Jacobian and residual buffers of one system on the device.
pub struct DeviceSystem {
    pub layout: SystemLayout,
    pub jacobian: Handle,
    pub residuals: Handle,
}

impl DeviceSystem {
    /// Allocate buffers for `layout`. Contents are undefined until built.
    pub fn allocate(runtime: &GpuRuntime, layout: SystemLayout) -> Self {
        Self {
            layout,
            jacobian: runtime.empty_f32(layout.jacobian_len()),
            residuals: runtime.empty_f32(layout.num_residuals()),
        }
    }

    /// Copy a host-built system into the existing buffers.
    pub fn write(&self, runtime: &GpuRuntime, system: &LinearSystem) -> Result<()> {
        ensure!(
            system.layout == self.layout,
            "Host system layout {:?} does not match device buffers {:?}",
            system.layout,
            self.layout
        );
        runtime.write_f32(&self.jacobian, system.jacobian.as_slice())?;
        runtime.write_f32(&self.residuals, system.residuals.as_slice())?;
        Ok(())
    }

    /// Borrow as an input to the device linear solver.
    pub fn solver_input(&self) -> DeviceSystemRef<'_> {
        DeviceSystemRef {
            jacobian: &self.jacobian,
            residuals: &self.residuals,
            num_rows: self.layout.num_residuals(),
            num_cols: self.layout.num_unknowns(),
        }
    }

    /// Download into a host [`LinearSystem`].
    pub fn read_back(&self, runtime: &GpuRuntime) -> LinearSystem {
        runtime.sync_kernels();
        let jacobian = runtime.read_f32(&self.jacobian, self.layout.jacobian_len());
        let residuals = runtime.read_f32(&self.residuals, self.layout.num_residuals());
        LinearSystem::from_column_major(self.layout, &jacobian, &residuals)
    }
}

/// Parallel builder: one thread per feature, one per regularized coefficient.
pub struct GpuSystemBuilder {
    layout: SystemLayout,
    vertex_count: usize,
    vertex_ids: Handle,
    observed: Handle,
    shape_basis: Handle,
    expression_basis: Handle,
    system: DeviceSystem,
}

impl GpuSystemBuilder {
    /// Upload the per-solve inputs and allocate the system buffers.
    pub fn new(
        runtime: &GpuRuntime,
        layout: SystemLayout,
        features: &[FeatureCorrespondence],
        shape_basis: &DMatrix<f32>,
        expression_basis: &DMatrix<f32>,
    ) -> Result<Self> {
        ensure!(
            features.len() == layout.num_features,
            "Feature count {} does not match layout {}",
            features.len(),
            layout.num_features
        );
        ensure!(
            shape_basis.nrows() == expression_basis.nrows(),
            "Shape and expression bases have different row counts"
        );
        ensure!(
            shape_basis.ncols() >= layout.num_shape
                && expression_basis.ncols() >= layout.num_expression,
            "Basis narrower than the configured coefficient count"
        );

        let vertex_ids: Vec<u32> = features.iter().map(|f| f.vertex_id).collect();
        let observed: Vec<f32> = features
            .iter()
            .flat_map(|f| [f.observed.x, f.observed.y])
            .collect();

        Ok(Self {
            layout,
            vertex_count: shape_basis.nrows() / 3,
            vertex_ids: runtime.upload_u32(&vertex_ids),
            observed: runtime.upload_f32(&observed),
            shape_basis: runtime.upload_f32(leading_columns(shape_basis, layout.num_shape)),
            expression_basis: runtime
                .upload_f32(leading_columns(expression_basis, layout.num_expression)),
            system: DeviceSystem::allocate(runtime, layout),
        })
    }

    /// Zero the Jacobian and rebuild all rows for the given geometry.
    ///
    /// Kernels are queued, not awaited; the device solver synchronizes before
    /// it reads the buffers.
    pub fn build(
        &mut self,
        runtime: &GpuRuntime,
        geometry: &FrameGeometry<'_>,
        regularization_weight: f32,
    ) -> Result<&DeviceSystem> {
        let layout = self.layout;
        let num_residuals = layout.num_residuals();
        let basis_rows = 3 * self.vertex_count;

        ensure!(
            geometry.vertices.len() == self.vertex_count,
            "Vertex count changed from {} to {}",
            self.vertex_count,
            geometry.vertices.len()
        );

        let vertices: Vec<f32> = geometry
            .vertices
            .iter()
            .flat_map(|v| [v.x, v.y, v.z])
            .collect();
        let coefficients: Vec<f32> = geometry.shape_coefficients[..layout.num_shape]
            .iter()
            .chain(&geometry.expression_coefficients[..layout.num_expression])
            .copied()
            .collect();

        let vertices_gpu = runtime.upload_f32(&vertices);
        let model_gpu = runtime.upload_f32(&matrix4_to_row_major(&geometry.model_matrix));
        let rotation_gpu =
            runtime.upload_f32(&matrices3_to_row_major(&geometry.rotation_derivatives));
        let projection_gpu = runtime.upload_f32(&matrix4_to_row_major(&geometry.projection));
        let coefficients_gpu = runtime.upload_f32(&coefficients);

        // Builders only write their own non-zero entries
        runtime.fill_f32(&self.system.jacobian, layout.jacobian_len(), 0.0);

        if layout.num_features > 0 {
            let cube_count = (layout.num_features as u32).div_ceil(BLOCK_SIZE);
            unsafe {
                build_feature_rows_kernel::launch_unchecked::<f32, CudaRuntime>(
                    runtime.client(),
                    CubeCount::Static(cube_count, 1, 1),
                    CubeDim::new(BLOCK_SIZE, 1, 1),
                    ArrayArg::from_raw_parts::<f32>(&vertices_gpu, vertices.len(), 1),
                    ArrayArg::from_raw_parts::<u32>(&self.vertex_ids, layout.num_features, 1),
                    ArrayArg::from_raw_parts::<f32>(&self.observed, layout.num_features * 2, 1),
                    ArrayArg::from_raw_parts::<f32>(&model_gpu, 16, 1),
                    ArrayArg::from_raw_parts::<f32>(&rotation_gpu, 27, 1),
                    ArrayArg::from_raw_parts::<f32>(&projection_gpu, 16, 1),
                    ArrayArg::from_raw_parts::<f32>(
                        &self.shape_basis,
                        (basis_rows * layout.num_shape).max(1),
                        1,
                    ),
                    ArrayArg::from_raw_parts::<f32>(
                        &self.expression_basis,
                        (basis_rows * layout.num_expression).max(1),
                        1,
                    ),
                    ScalarArg::new(layout.num_features as u32),
                    ScalarArg::new(num_residuals as u32),
                    ScalarArg::new(basis_rows as u32),
                    ScalarArg::new(layout.shape_col() as u32),
                    ScalarArg::new(layout.num_shape as u32),
                    ScalarArg::new(layout.num_expression as u32),
                    ArrayArg::from_raw_parts::<f32>(
                        &self.system.jacobian,
                        layout.jacobian_len(),
                        1,
                    ),
                    ArrayArg::from_raw_parts::<f32>(&self.system.residuals, num_residuals, 1),
                );
            }
        }

        let num_coefficients = layout.num_coefficients();
        if num_coefficients > 0 {
            let cube_count = (num_coefficients as u32).div_ceil(BLOCK_SIZE);
            unsafe {
                build_regularizer_rows_kernel::launch_unchecked::<f32, CudaRuntime>(
                    runtime.client(),
                    CubeCount::Static(cube_count, 1, 1),
                    CubeDim::new(BLOCK_SIZE, 1, 1),
                    ArrayArg::from_raw_parts::<f32>(&coefficients_gpu, num_coefficients, 1),
                    ScalarArg::new(regularization_weight.sqrt()),
                    ScalarArg::new(num_coefficients as u32),
                    ScalarArg::new(layout.regularizer_row() as u32),
                    ScalarArg::new(layout.shape_col() as u32),
                    ScalarArg::new(num_residuals as u32),
                    ArrayArg::from_raw_parts::<f32>(
                        &self.system.jacobian,
                        layout.jacobian_len(),
                        1,
                    ),
                    ArrayArg::from_raw_parts::<f32>(&self.system.residuals, num_residuals, 1),
                );
            }
        }

        Ok(&self.system)
    }
}
