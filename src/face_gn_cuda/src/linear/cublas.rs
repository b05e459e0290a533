//! Thin cuBLAS wrappers over raw device pointers.
//!
//! Every buffer the solver touches is owned by CubeCL; cuBLAS sees it through
//! [`GpuRuntime::raw_ptr`](crate::GpuRuntime::raw_ptr). All routines are
//! single-precision and use host pointer mode, so scalar arguments live on
//! the host and [`CublasContext::dot`] returns once its result is ready.
//!
//! Matrices are column-major, as cuBLAS expects.

use std::sync::Arc;

use cudarc::cublas::sys as cublas_sys;
use cudarc::cublas::CudaBlas;
use cudarc::driver::{CudaContext, CudaStream, DevicePtr, DevicePtrMut};
use thiserror::Error;

/// Errors from cuBLAS linear algebra.
#[derive(Error, Debug)]
pub enum BlasError {
    #[error("cuBLAS error: {0:?}")]
    CublasError(cublas_sys::cublasStatus_t),

    #[error("CUDA driver error: {0}")]
    CudaError(#[from] cudarc::driver::DriverError),

    #[error("Matrix is singular (info={0})")]
    SingularMatrix(i32),
}

impl From<cudarc::cublas::result::CublasError> for BlasError {
    fn from(e: cudarc::cublas::result::CublasError) -> Self {
        BlasError::CublasError(e.0)
    }
}

fn check(status: cublas_sys::cublasStatus_t) -> Result<(), BlasError> {
    if status != cublas_sys::cublasStatus_t::CUBLAS_STATUS_SUCCESS {
        return Err(BlasError::CublasError(status));
    }
    Ok(())
}

fn operation(transpose: bool) -> cublas_sys::cublasOperation_t {
    if transpose {
        cublas_sys::cublasOperation_t::CUBLAS_OP_T
    } else {
        cublas_sys::cublasOperation_t::CUBLAS_OP_N
    }
}

/// cuBLAS handle bound to its own CUDA stream.
pub struct CublasContext {
    blas: CudaBlas,

    /// CUDA context for memory operations
    ctx: Arc<CudaContext>,

    stream: Arc<CudaStream>,
}

impl CublasContext {
    pub fn new(device_id: usize) -> Result<Self, BlasError> {
        let ctx = CudaContext::new(device_id)?;
        let stream = ctx.default_stream();
        let blas = CudaBlas::new(stream.clone())?;

        Ok(Self { blas, ctx, stream })
    }

    fn handle(&self) -> cublas_sys::cublasHandle_t {
        *self.blas.handle()
    }

    /// Block until all queued cuBLAS work has finished.
    pub fn synchronize(&self) -> Result<(), BlasError> {
        self.stream.synchronize()?;
        Ok(())
    }

    /// Copy `data` from the host into the device buffer at `dst` and wait
    /// for the copy.
    ///
    /// # Safety
    /// `dst` must point to at least `data.len()` floats.
    pub unsafe fn copy_from_host(&self, dst: u64, data: &[f32]) -> Result<(), BlasError> {
        if data.is_empty() {
            return Ok(());
        }
        self.ctx.bind_to_thread()?;
        cudarc::driver::result::memcpy_htod_async(dst, data, self.stream.cu_stream())?;
        self.stream.synchronize()?;
        Ok(())
    }

    /// `y = alpha · op(A) · x + beta · y` with `A` of shape `rows × cols`.
    ///
    /// # Safety
    /// `a` must hold `rows * cols` floats; `x` and `y` must match `op(A)`.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn gemv(
        &self,
        transpose: bool,
        rows: usize,
        cols: usize,
        alpha: f32,
        a: u64,
        x: u64,
        beta: f32,
        y: u64,
    ) -> Result<(), BlasError> {
        check(cublas_sys::cublasSgemv_v2(
            self.handle(),
            operation(transpose),
            rows as i32,
            cols as i32,
            &alpha,
            a as *const f32,
            rows as i32, // lda
            x as *const f32,
            1,
            &beta,
            y as *mut f32,
            1,
        ))
    }

    /// `C = alpha · op(A) · op(B) + beta · C`, all leading dimensions tight.
    ///
    /// # Safety
    /// Buffers must hold `op(A)` (`m × k`), `op(B)` (`k × n`) and `C` (`m × n`).
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn gemm(
        &self,
        transpose_a: bool,
        transpose_b: bool,
        m: usize,
        n: usize,
        k: usize,
        alpha: f32,
        a: u64,
        b: u64,
        beta: f32,
        c: u64,
    ) -> Result<(), BlasError> {
        let lda = if transpose_a { k } else { m };
        let ldb = if transpose_b { n } else { k };
        check(cublas_sys::cublasSgemm_v2(
            self.handle(),
            operation(transpose_a),
            operation(transpose_b),
            m as i32,
            n as i32,
            k as i32,
            &alpha,
            a as *const f32,
            lda as i32,
            b as *const f32,
            ldb as i32,
            &beta,
            c as *mut f32,
            m as i32,
        ))
    }

    /// `xᵀy`. Blocks until the result is on the host.
    ///
    /// # Safety
    /// `x` and `y` must hold `n` floats.
    pub unsafe fn dot(&self, n: usize, x: u64, y: u64) -> Result<f32, BlasError> {
        let mut result = 0.0f32;
        check(cublas_sys::cublasSdot_v2(
            self.handle(),
            n as i32,
            x as *const f32,
            1,
            y as *const f32,
            1,
            &mut result,
        ))?;
        Ok(result)
    }

    /// `y += alpha · x`.
    ///
    /// # Safety
    /// `x` and `y` must hold `n` floats.
    pub unsafe fn axpy(&self, n: usize, alpha: f32, x: u64, y: u64) -> Result<(), BlasError> {
        check(cublas_sys::cublasSaxpy_v2(
            self.handle(),
            n as i32,
            &alpha,
            x as *const f32,
            1,
            y as *mut f32,
            1,
        ))
    }

    /// `x *= alpha`.
    ///
    /// # Safety
    /// `x` must hold `n` floats.
    pub unsafe fn scal(&self, n: usize, alpha: f32, x: u64) -> Result<(), BlasError> {
        check(cublas_sys::cublasSscal_v2(
            self.handle(),
            n as i32,
            &alpha,
            x as *mut f32,
            1,
        ))
    }

    /// `y = x`.
    ///
    /// # Safety
    /// `x` and `y` must hold `n` floats.
    pub unsafe fn copy(&self, n: usize, x: u64, y: u64) -> Result<(), BlasError> {
        check(cublas_sys::cublasScopy_v2(
            self.handle(),
            n as i32,
            x as *const f32,
            1,
            y as *mut f32,
            1,
        ))
    }

    /// Invert the `n × n` matrix at `a` into `inverse` by batched LU
    /// (batch of one). `a` is overwritten with its LU factors.
    ///
    /// # Safety
    /// `a` and `inverse` must each hold `n * n` floats and must not alias.
    pub unsafe fn invert(&self, n: usize, a: u64, inverse: u64) -> Result<(), BlasError> {
        // Batched routines take device arrays of matrix pointers
        let mut d_a_array = self.stream.alloc_zeros::<u64>(1)?;
        let mut d_c_array = self.stream.alloc_zeros::<u64>(1)?;
        self.stream.memcpy_htod(&[a], &mut d_a_array)?;
        self.stream.memcpy_htod(&[inverse], &mut d_c_array)?;

        let mut d_pivots = self.stream.alloc_zeros::<i32>(n.max(1))?;
        let mut d_info = self.stream.alloc_zeros::<i32>(1)?;

        // LU factorization: A = P * L * U
        {
            let (a_array_ptr, _a_guard) = d_a_array.device_ptr(&self.stream);
            let (pivot_ptr, _pivot_guard) = d_pivots.device_ptr_mut(&self.stream);
            let (info_ptr, _info_guard) = d_info.device_ptr_mut(&self.stream);

            check(cublas_sys::cublasSgetrfBatched(
                self.handle(),
                n as i32,
                a_array_ptr as *const *mut f32,
                n as i32,
                pivot_ptr as *mut i32,
                info_ptr as *mut i32,
                1,
            ))?;
        }
        self.check_info(&d_info)?;

        // Inverse from LU factors
        {
            let (a_array_ptr, _a_guard) = d_a_array.device_ptr(&self.stream);
            let (c_array_ptr, _c_guard) = d_c_array.device_ptr(&self.stream);
            let (pivot_ptr, _pivot_guard) = d_pivots.device_ptr(&self.stream);
            let (info_ptr, _info_guard) = d_info.device_ptr_mut(&self.stream);

            check(cublas_sys::cublasSgetriBatched(
                self.handle(),
                n as i32,
                a_array_ptr as *const *const f32,
                n as i32,
                pivot_ptr as *const i32,
                c_array_ptr as *const *mut f32,
                n as i32,
                info_ptr as *mut i32,
                1,
            ))?;
        }
        self.check_info(&d_info)
    }

    fn check_info(&self, d_info: &cudarc::driver::CudaSlice<i32>) -> Result<(), BlasError> {
        let mut info = [0i32];
        self.stream.memcpy_dtoh(d_info, &mut info)?;
        self.stream.synchronize()?;

        if info[0] != 0 {
            return Err(BlasError::SingularMatrix(info[0]));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::GpuRuntime;
    use approx::assert_relative_eq;

    #[test]
    fn test_dot_and_axpy() {
        require_cuda!();

        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let x = runtime.upload_f32(&[1.0, 2.0, 3.0]);
        let y = runtime.upload_f32(&[4.0, 5.0, 6.0]);
        runtime.sync_kernels();

        let blas = runtime.blas();
        let (x_ptr, y_ptr) = (runtime.raw_ptr(&x), runtime.raw_ptr(&y));

        let dot = unsafe { blas.dot(3, x_ptr, y_ptr) }.unwrap();
        assert_relative_eq!(dot, 32.0);

        unsafe { blas.axpy(3, 2.0, x_ptr, y_ptr) }.unwrap();
        runtime.sync_blas().unwrap();

        assert_eq!(runtime.read_f32(&y, 3), vec![6.0, 9.0, 12.0]);
    }

    #[test]
    fn test_copy_from_host_overwrites_buffer() {
        require_cuda!();

        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let buffer = runtime.filled_f32(4, 9.0);
        runtime.sync_kernels();

        unsafe {
            runtime
                .blas()
                .copy_from_host(runtime.raw_ptr(&buffer), &[1.0, 2.0, 3.0])
        }
        .unwrap();

        assert_eq!(runtime.read_f32(&buffer, 4), vec![1.0, 2.0, 3.0, 9.0]);
    }

    #[test]
    fn test_gemv_transpose() {
        require_cuda!();

        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        // Column-major 3x2: [[1, 4], [2, 5], [3, 6]]
        let a = runtime.upload_f32(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let x = runtime.upload_f32(&[1.0, 1.0, 1.0]);
        let y = runtime.upload_f32(&[0.0, 0.0]);
        runtime.sync_kernels();

        unsafe {
            runtime.blas().gemv(
                true,
                3,
                2,
                1.0,
                runtime.raw_ptr(&a),
                runtime.raw_ptr(&x),
                0.0,
                runtime.raw_ptr(&y),
            )
        }
        .unwrap();
        runtime.sync_blas().unwrap();

        assert_eq!(runtime.read_f32(&y, 2), vec![6.0, 15.0]);
    }

    #[test]
    fn test_invert() {
        require_cuda!();

        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        // diag(2, 4)
        let a = runtime.upload_f32(&[2.0, 0.0, 0.0, 4.0]);
        let inverse = runtime.empty_f32(4);
        runtime.sync_kernels();

        unsafe {
            runtime
                .blas()
                .invert(2, runtime.raw_ptr(&a), runtime.raw_ptr(&inverse))
        }
        .unwrap();
        runtime.sync_blas().unwrap();

        let result = runtime.read_f32(&inverse, 4);
        assert_relative_eq!(result[0], 0.5, epsilon = 1e-6);
        assert_relative_eq!(result[3], 0.25, epsilon = 1e-6);
        assert_relative_eq!(result[1], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn test_invert_singular() {
        require_cuda!();

        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let a = runtime.upload_f32(&[0.0; 4]);
        let inverse = runtime.empty_f32(4);
        runtime.sync_kernels();

        let result = unsafe {
            runtime
                .blas()
                .invert(2, runtime.raw_ptr(&a), runtime.raw_ptr(&inverse))
        };

        assert!(matches!(result, Err(BlasError::SingularMatrix(_))));
    }
}
