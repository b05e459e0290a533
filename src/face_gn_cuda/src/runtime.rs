//! GPU runtime management for CubeCL CUDA execution.
//!
//! This module owns the long-lived device state of a solver:
//! - CubeCL device and compute client (kernel launches, buffers)
//! - cuBLAS context on a cudarc stream (dense linear algebra)
//! - Host/device transfer helpers shared by the builder and the solver
//!
//! CubeCL kernels and cuBLAS calls run on different streams, so every hand-off
//! between the two goes through [`GpuRuntime::sync_kernels`] (before cuBLAS
//! reads kernel output) or [`GpuRuntime::sync_blas`] (before a kernel or a
//! readback consumes cuBLAS output).
//!
//! # Example
//!
//! ```ignore
//! use face_gn_cuda::runtime::GpuRuntime;
//!
//! let runtime = GpuRuntime::new()?;
//! let buffer = runtime.upload_f32(&[1.0, 2.0, 3.0]);
//! let values = runtime.read_f32(&buffer, 3);
//! ```

use std::panic::{catch_unwind, AssertUnwindSafe};

use anyhow::{anyhow, bail, Result};
use cubecl::client::ComputeClient;
use cubecl::cuda::{CudaDevice, CudaRuntime};
use cubecl::prelude::*;
use cubecl::server::Handle;

use crate::derivatives::kernels::fill_kernel;
use crate::linear::cublas::CublasContext;

/// Type alias for CUDA compute client.
pub type CudaClient = ComputeClient<<CudaRuntime as Runtime>::Server>;

/// Threads per cube for all 1D launches.
pub const BLOCK_SIZE: u32 = 256;

/// GPU runtime for Gauss-Newton face fitting.
pub struct GpuRuntime {
    /// CUDA device (kept alive for runtime lifetime)
    #[allow(dead_code)]
    device: CudaDevice,
    /// Compute client for kernel execution
    client: CudaClient,
    /// cuBLAS handle and its stream
    blas: CublasContext,
    device_id: usize,
}

impl GpuRuntime {
    /// Create a new GPU runtime with the default CUDA device.
    pub fn new() -> Result<Self> {
        Self::with_device_id(0)
    }

    /// Create a new GPU runtime with a specific CUDA device.
    ///
    /// Fails when the driver reports no device with this id. CubeCL panics
    /// during client creation are returned as errors.
    pub fn with_device_id(device_id: usize) -> Result<Self> {
        let count = cuda_device_count();
        if device_id >= count {
            bail!("CUDA device {device_id} not found ({count} devices)");
        }

        let device = CudaDevice::new(device_id);
        let client = catch_unwind(AssertUnwindSafe(|| CudaRuntime::client(&device)))
            .map_err(|_| anyhow!("CubeCL client creation failed on CUDA device {device_id}"))?;

        // Settle any work left by an earlier client on this device
        cubecl::future::block_on(client.sync());

        let blas = CublasContext::new(device_id)?;
        tracing::debug!(device_id, "GPU runtime initialized");

        Ok(Self {
            device,
            client,
            blas,
            device_id,
        })
    }

    /// Get the underlying compute client.
    pub fn client(&self) -> &CudaClient {
        &self.client
    }

    /// Get the cuBLAS context.
    pub fn blas(&self) -> &CublasContext {
        &self.blas
    }

    pub fn device_id(&self) -> usize {
        self.device_id
    }

    /// Get raw CUDA device pointer from CubeCL handle.
    pub fn raw_ptr(&self, handle: &Handle) -> u64 {
        let binding = handle.clone().binding();
        let resource = self.client.get_resource(binding);
        resource.resource().ptr
    }

    /// Upload `f32` data. Empty slices get a one-element placeholder so the
    /// handle is always bindable.
    pub fn upload_f32(&self, data: &[f32]) -> Handle {
        if data.is_empty() {
            return self.client.create(f32::as_bytes(&[0.0]));
        }
        self.client.create(f32::as_bytes(data))
    }

    /// Upload `u32` data, with the same placeholder rule as [`Self::upload_f32`].
    pub fn upload_u32(&self, data: &[u32]) -> Handle {
        if data.is_empty() {
            return self.client.create(u32::as_bytes(&[0]));
        }
        self.client.create(u32::as_bytes(data))
    }

    /// Allocate an uninitialized `f32` buffer of `len` elements (at least one).
    pub fn empty_f32(&self, len: usize) -> Handle {
        self.client.empty(len.max(1) * std::mem::size_of::<f32>())
    }

    /// Allocate a buffer of `len` elements set to `value`.
    pub fn filled_f32(&self, len: usize, value: f32) -> Handle {
        let handle = self.empty_f32(len);
        self.fill_f32(&handle, len, value);
        handle
    }

    /// Set the first `len` elements of `handle` to `value`.
    pub fn fill_f32(&self, handle: &Handle, len: usize, value: f32) {
        if len == 0 {
            return;
        }
        let cube_count = (len as u32).div_ceil(BLOCK_SIZE);
        unsafe {
            fill_kernel::launch_unchecked::<f32, CudaRuntime>(
                &self.client,
                CubeCount::Static(cube_count, 1, 1),
                CubeDim::new(BLOCK_SIZE, 1, 1),
                ArrayArg::from_raw_parts::<f32>(handle, len, 1),
                ScalarArg::new(value),
                ScalarArg::new(len as u32),
            );
        }
    }

    /// Overwrite the first `data.len()` elements of an existing buffer.
    ///
    /// Pending kernels are flushed first; the copy has finished on return.
    pub fn write_f32(&self, handle: &Handle, data: &[f32]) -> Result<()> {
        self.sync_kernels();
        unsafe { self.blas.copy_from_host(self.raw_ptr(handle), data)? };
        Ok(())
    }

    /// Download the first `len` elements of an `f32` buffer.
    pub fn read_f32(&self, handle: &Handle, len: usize) -> Vec<f32> {
        let bytes = self.client.read_one(handle.clone());
        let values = f32::from_bytes(&bytes);
        values[..len.min(values.len())].to_vec()
    }

    /// Wait for all queued CubeCL kernels.
    pub fn sync_kernels(&self) {
        cubecl::future::block_on(self.client.sync());
    }

    /// Wait for all queued cuBLAS work.
    pub fn sync_blas(&self) -> Result<()> {
        self.blas.synchronize()?;
        Ok(())
    }
}

/// Number of CUDA devices the driver reports; zero when the driver is
/// missing or fails to initialize.
pub fn cuda_device_count() -> usize {
    cudarc::driver::CudaContext::device_count()
        .map(|count| Ord::max(count, 0) as usize)
        .unwrap_or(0)
}

/// Check if CUDA is available on this system.
pub fn is_cuda_available() -> bool {
    cuda_device_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_cuda_availability_matches_driver() {
        let available = is_cuda_available();
        let driver_count = cudarc::driver::CudaContext::device_count().unwrap_or(0);
        crate::test_println!("CUDA available: {available} ({driver_count} devices)");

        assert_eq!(available, driver_count > 0);
    }

    #[test]
    fn test_missing_device_is_error() {
        let result = GpuRuntime::with_device_id(cuda_device_count() + 1);
        assert!(result.is_err());
    }

    #[test]
    fn test_upload_read_roundtrip() {
        require_cuda!();

        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let data = [1.0f32, -2.5, 3.25];

        let handle = runtime.upload_f32(&data);
        let result = runtime.read_f32(&handle, data.len());

        assert_eq!(result, data.to_vec());
    }

    #[test]
    fn test_fill() {
        require_cuda!();

        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");

        let handle = runtime.filled_f32(1000, 0.5);
        let result = runtime.read_f32(&handle, 1000);

        assert_eq!(result.len(), 1000);
        for value in result {
            assert_relative_eq!(value, 0.5);
        }
    }

    #[test]
    fn test_write_into_existing_buffer() {
        require_cuda!();

        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");
        let handle = runtime.filled_f32(3, 0.0);

        runtime.write_f32(&handle, &[4.0, 5.0, 6.0]).unwrap();
        runtime.write_f32(&handle, &[7.0]).unwrap();

        assert_eq!(runtime.read_f32(&handle, 3), vec![7.0, 5.0, 6.0]);
    }

    #[test]
    fn test_empty_upload_is_placeholder() {
        require_cuda!();

        let runtime = GpuRuntime::new().expect("Failed to create GPU runtime");

        let handle = runtime.upload_f32(&[]);
        let result = runtime.read_f32(&handle, 0);

        assert!(result.is_empty());
    }
}
