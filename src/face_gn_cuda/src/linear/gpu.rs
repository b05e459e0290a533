//! Device linear solver on cuBLAS primitives.
//!
//! The Jacobian and residual stay on the device. Each PCG iteration costs two
//! `gemv`, two `dot` (each a host round trip for the scalar), three `axpy`,
//! one `scal` and one preconditioner multiply. Only the solution vector is
//! read back.
//!
//! Solution and scratch vectors live in a [`SolverWorkspace`] that the caller
//! allocates once per Gauss-Newton solve and passes to every linear solve.
//!
//! ```text
//! r = s·Jᵀres, z = M∘r, p = z
//! loop min(n, cap):
//!   Jp = α·J·p, JtJp = Jᵀ·Jp
//!   step = zr / max(p·JtJp, ε)
//!   x += step·p, r -= step·JtJp
//!   z = M∘r, zr' = z·r, stop if zr' < tol
//!   p = z + (zr' / max(zr, ε))·p
//! ```

use anyhow::{ensure, Result};
use cubecl::cuda::CudaRuntime;
use cubecl::prelude::*;
use cubecl::server::Handle;
use nalgebra::DVector;

use super::preconditioner::{elementwise_multiply_kernel, jacobi_preconditioner_kernel};
use super::types::{LinearSolveParams, LinearSolveStats, LinearSolverKind, PRECONDITIONER_FLOOR};
use crate::runtime::{GpuRuntime, BLOCK_SIZE};

/// Dense column-major system resident on the device.
pub struct DeviceSystemRef<'a> {
    pub jacobian: &'a Handle,
    pub residuals: &'a Handle,
    pub num_rows: usize,
    pub num_cols: usize,
}

/// Device vectors reused by every linear solve of one system shape.
///
/// `normal` and `inverse` are only sized `n × n` for the direct solver.
pub struct SolverWorkspace {
    num_rows: usize,
    num_cols: usize,
    normal_len: usize,
    x: Handle,
    r: Handle,
    z: Handle,
    p: Handle,
    jp: Handle,
    jtjp: Handle,
    preconditioner: Handle,
    rhs: Handle,
    normal: Handle,
    inverse: Handle,
}

impl SolverWorkspace {
    pub fn new(
        runtime: &GpuRuntime,
        kind: LinearSolverKind,
        num_rows: usize,
        num_cols: usize,
    ) -> Self {
        let square = match kind {
            LinearSolverKind::DirectInverse => num_cols * num_cols,
            LinearSolverKind::Pcg | LinearSolverKind::Cg => 0,
        };
        Self {
            num_rows,
            num_cols,
            normal_len: square,
            x: runtime.empty_f32(num_cols),
            r: runtime.empty_f32(num_cols),
            z: runtime.empty_f32(num_cols),
            p: runtime.empty_f32(num_cols),
            jp: runtime.empty_f32(num_rows),
            jtjp: runtime.empty_f32(num_cols),
            preconditioner: runtime.empty_f32(num_cols),
            rhs: runtime.empty_f32(num_cols),
            normal: runtime.empty_f32(square),
            inverse: runtime.empty_f32(square),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.num_rows, self.num_cols)
    }
}

/// Solve `(α·JᵀJ)x = s·Jᵀr` on the device and return `x` on the host.
///
/// Pending builder kernels are flushed before the first cuBLAS call.
pub fn solve_normal_equations_gpu(
    runtime: &GpuRuntime,
    params: &LinearSolveParams,
    system: &DeviceSystemRef<'_>,
    workspace: &SolverWorkspace,
) -> Result<(DVector<f32>, LinearSolveStats)> {
    ensure!(
        workspace.shape() == (system.num_rows, system.num_cols),
        "Workspace sized {:?}, system is {}x{}",
        workspace.shape(),
        system.num_rows,
        system.num_cols
    );
    match params.kind {
        LinearSolverKind::Pcg => conjugate_gradient(runtime, params, system, workspace, true),
        LinearSolverKind::Cg => conjugate_gradient(runtime, params, system, workspace, false),
        LinearSolverKind::DirectInverse => direct_inverse(runtime, params, system, workspace),
    }
}

fn launch_preconditioner(runtime: &GpuRuntime, system: &DeviceSystemRef<'_>, output: &Handle) {
    let cube_count = (system.num_cols as u32).div_ceil(BLOCK_SIZE);
    unsafe {
        jacobi_preconditioner_kernel::launch_unchecked::<f32, CudaRuntime>(
            runtime.client(),
            CubeCount::Static(cube_count, 1, 1),
            CubeDim::new(BLOCK_SIZE, 1, 1),
            ArrayArg::from_raw_parts::<f32>(system.jacobian, system.num_rows * system.num_cols, 1),
            ScalarArg::new(system.num_rows as u32),
            ScalarArg::new(system.num_cols as u32),
            ScalarArg::new(PRECONDITIONER_FLOOR),
            ArrayArg::from_raw_parts::<f32>(output, system.num_cols, 1),
        );
    }
}

fn launch_multiply(runtime: &GpuRuntime, a: &Handle, b: &Handle, out: &Handle, len: usize) {
    let cube_count = (len as u32).div_ceil(BLOCK_SIZE);
    unsafe {
        elementwise_multiply_kernel::launch_unchecked::<f32, CudaRuntime>(
            runtime.client(),
            CubeCount::Static(cube_count, 1, 1),
            CubeDim::new(BLOCK_SIZE, 1, 1),
            ArrayArg::from_raw_parts::<f32>(a, len, 1),
            ArrayArg::from_raw_parts::<f32>(b, len, 1),
            ScalarArg::new(len as u32),
            ArrayArg::from_raw_parts::<f32>(out, len, 1),
        );
    }
}

fn conjugate_gradient(
    runtime: &GpuRuntime,
    params: &LinearSolveParams,
    system: &DeviceSystemRef<'_>,
    workspace: &SolverWorkspace,
    preconditioned: bool,
) -> Result<(DVector<f32>, LinearSolveStats)> {
    let rows = system.num_rows;
    let n = system.num_cols;
    let blas = runtime.blas();
    let SolverWorkspace {
        x,
        r,
        z,
        p,
        jp,
        jtjp,
        preconditioner,
        ..
    } = workspace;

    runtime.fill_f32(x, n, 0.0);
    if preconditioned {
        launch_preconditioner(runtime, system, preconditioner);
    }
    runtime.sync_kernels();

    let j_ptr = runtime.raw_ptr(system.jacobian);
    let res_ptr = runtime.raw_ptr(system.residuals);
    let x_ptr = runtime.raw_ptr(x);
    let r_ptr = runtime.raw_ptr(r);
    let z_ptr = runtime.raw_ptr(z);
    let p_ptr = runtime.raw_ptr(p);
    let jp_ptr = runtime.raw_ptr(jp);
    let jtjp_ptr = runtime.raw_ptr(jtjp);

    // z = M∘r (PCG) or z = r (CG)
    let precondition = || -> Result<()> {
        if preconditioned {
            runtime.sync_blas()?;
            launch_multiply(runtime, preconditioner, r, z, n);
            runtime.sync_kernels();
        } else {
            unsafe { blas.copy(n, r_ptr, z_ptr)? };
        }
        Ok(())
    };

    unsafe { blas.gemv(true, rows, n, params.rhs_scale, j_ptr, res_ptr, 0.0, r_ptr)? };
    precondition()?;
    unsafe { blas.copy(n, z_ptr, p_ptr)? };
    let mut old_zr = unsafe { blas.dot(n, z_ptr, r_ptr)? };

    let mut stats = LinearSolveStats {
        final_zr: old_zr,
        ..Default::default()
    };

    for _ in 0..params.iteration_bound(n) {
        unsafe {
            blas.gemv(false, rows, n, params.alpha_lhs, j_ptr, p_ptr, 0.0, jp_ptr)?;
            blas.gemv(true, rows, n, 1.0, j_ptr, jp_ptr, 0.0, jtjp_ptr)?;
        }

        let curvature = unsafe { blas.dot(n, p_ptr, jtjp_ptr)? };
        let step = old_zr / curvature.max(params.near_zero);

        unsafe {
            blas.axpy(n, step, p_ptr, x_ptr)?;
            blas.axpy(n, -step, jtjp_ptr, r_ptr)?;
        }

        precondition()?;
        let new_zr = unsafe { blas.dot(n, z_ptr, r_ptr)? };
        stats.iterations += 1;
        stats.final_zr = new_zr;

        if new_zr < params.tolerance {
            stats.converged = true;
            break;
        }

        let beta = new_zr / old_zr.max(params.near_zero);
        unsafe {
            blas.scal(n, beta, p_ptr)?;
            blas.axpy(n, 1.0, z_ptr, p_ptr)?;
        }
        old_zr = new_zr;
    }

    runtime.sync_blas()?;
    let solution = runtime.read_f32(x, n);

    tracing::trace!(
        iterations = stats.iterations,
        final_zr = stats.final_zr,
        converged = stats.converged,
        "Device CG finished"
    );

    Ok((DVector::from_vec(solution), stats))
}

fn direct_inverse(
    runtime: &GpuRuntime,
    params: &LinearSolveParams,
    system: &DeviceSystemRef<'_>,
    workspace: &SolverWorkspace,
) -> Result<(DVector<f32>, LinearSolveStats)> {
    let rows = system.num_rows;
    let n = system.num_cols;
    let blas = runtime.blas();
    ensure!(
        workspace.normal_len >= n * n,
        "Workspace was not allocated for the direct solver"
    );
    runtime.sync_kernels();

    let j_ptr = runtime.raw_ptr(system.jacobian);
    let normal_ptr = runtime.raw_ptr(&workspace.normal);
    let inverse_ptr = runtime.raw_ptr(&workspace.inverse);
    let rhs_ptr = runtime.raw_ptr(&workspace.rhs);
    let x_ptr = runtime.raw_ptr(&workspace.x);

    unsafe {
        // α·JᵀJ
        blas.gemm(true, false, n, n, rows, params.alpha_lhs, j_ptr, j_ptr, 0.0, normal_ptr)?;
        // s·Jᵀr
        blas.gemv(
            true,
            rows,
            n,
            params.rhs_scale,
            j_ptr,
            runtime.raw_ptr(system.residuals),
            0.0,
            rhs_ptr,
        )?;
        blas.invert(n, normal_ptr, inverse_ptr)?;
        blas.gemv(false, n, n, 1.0, inverse_ptr, rhs_ptr, 0.0, x_ptr)?;
    }

    runtime.sync_blas()?;
    let solution = runtime.read_f32(&workspace.x, n);

    Ok((DVector::from_vec(solution), LinearSolveStats::default()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linear::cpu::solve_normal_equations_cpu;
    use approx::assert_relative_eq;
    use nalgebra::DMatrix;

    fn test_system() -> (DMatrix<f32>, DVector<f32>) {
        let jacobian = DMatrix::from_fn(30, 9, |r, c| {
            let base = ((r * 5 + c * 7) % 13) as f32 * 0.05 - 0.3;
            if r % 9 == c {
                base + 2.0
            } else {
                base
            }
        });
        let residuals = DVector::from_fn(30, |r, _| ((r % 7) as f32 - 3.0) * 0.1);
        (jacobian, residuals)
    }

    fn solve_both(kind: LinearSolverKind) -> (DVector<f32>, DVector<f32>) {
        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let (jacobian, residuals) = test_system();
        let params = LinearSolveParams {
            kind,
            tolerance: 1e-12,
            ..Default::default()
        };

        let j_gpu = runtime.upload_f32(jacobian.as_slice());
        let r_gpu = runtime.upload_f32(residuals.as_slice());
        let system = DeviceSystemRef {
            jacobian: &j_gpu,
            residuals: &r_gpu,
            num_rows: 30,
            num_cols: 9,
        };

        let workspace = SolverWorkspace::new(&runtime, kind, 30, 9);

        let (gpu, _) = solve_normal_equations_gpu(&runtime, &params, &system, &workspace).unwrap();
        // A second solve on the same workspace must not see stale state
        let (again, _) =
            solve_normal_equations_gpu(&runtime, &params, &system, &workspace).unwrap();
        assert_eq!(gpu, again);

        let (cpu, _) = solve_normal_equations_cpu(&params, &jacobian, &residuals).unwrap();
        (gpu, cpu)
    }

    #[test]
    fn test_workspace_shape_checked() {
        require_cuda!();

        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let (jacobian, residuals) = test_system();
        let j_gpu = runtime.upload_f32(jacobian.as_slice());
        let r_gpu = runtime.upload_f32(residuals.as_slice());
        let system = DeviceSystemRef {
            jacobian: &j_gpu,
            residuals: &r_gpu,
            num_rows: 30,
            num_cols: 9,
        };
        let params = LinearSolveParams {
            kind: LinearSolverKind::DirectInverse,
            ..Default::default()
        };

        let wrong_shape = SolverWorkspace::new(&runtime, LinearSolverKind::DirectInverse, 30, 8);
        assert!(solve_normal_equations_gpu(&runtime, &params, &system, &wrong_shape).is_err());

        let iterative_only = SolverWorkspace::new(&runtime, LinearSolverKind::Pcg, 30, 9);
        assert!(solve_normal_equations_gpu(&runtime, &params, &system, &iterative_only).is_err());
    }

    #[test]
    fn test_gpu_pcg_matches_host() {
        require_cuda!();

        let (gpu, cpu) = solve_both(LinearSolverKind::Pcg);

        for i in 0..9 {
            assert_relative_eq!(gpu[i], cpu[i], epsilon = 1e-4, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_gpu_cg_matches_host() {
        require_cuda!();

        let (gpu, cpu) = solve_both(LinearSolverKind::Cg);

        for i in 0..9 {
            assert_relative_eq!(gpu[i], cpu[i], epsilon = 1e-4, max_relative = 1e-3);
        }
    }

    #[test]
    fn test_gpu_direct_matches_host() {
        require_cuda!();

        let (gpu, cpu) = solve_both(LinearSolverKind::DirectInverse);

        for i in 0..9 {
            assert_relative_eq!(gpu[i], cpu[i], epsilon = 1e-4, max_relative = 1e-3);
        }
    }
}
