//! CUDA integration (cust-based)
//!
//! Built only with the `cuda` feature. Each wrapper owns its JIT-linked PTX
//! module, a NON_BLOCKING stream and a context handle, mirroring the CPU
//! modules under `algorithms`. The PTX is produced by `build.rs` from the
//! CUDA C sources under `kernels/` and embedded at compile time.

#![cfg(feature = "cuda")]

pub mod fft;
pub mod gaussian_wrapper;
pub mod shrink_wrap_wrapper;
pub mod task_queue;
pub mod vector_elementwise_wrapper;
pub mod vector_reduce_wrapper;

// re-exported so integration tests and downstream tooling can manage
// device buffers without depending on cust themselves
pub use cust;

pub use gaussian_wrapper::{CudaGaussian, CudaGaussianError};
pub use shrink_wrap_wrapper::{CudaShrinkWrap, CudaShrinkWrapError};
pub use task_queue::{TaskQueue, TaskQueueError};
pub use vector_elementwise_wrapper::{CudaElementwise, CudaElementwiseError};
pub use vector_reduce_wrapper::{CudaReduce, CudaReduceError};

use cust::memory::DeviceCopy;
use thiserror::Error;

/// Returns true if a CUDA device is available and the driver API can be
/// initialized. Kept defensive so it never panics when CUDA is missing.
#[inline]
pub fn cuda_available() -> bool {
    use cust::{device::Device, prelude::CudaFlags};
    if cust::init(CudaFlags::empty()).is_err() {
        return false;
    }
    match Device::num_devices() {
        Ok(n) => n > 0,
        Err(_) => false,
    }
}

/// Returns the number of CUDA devices available (0 on error).
#[inline]
pub fn cuda_device_count() -> usize {
    use cust::{device::Device, prelude::CudaFlags};
    if cust::init(CudaFlags::empty()).is_err() {
        return 0;
    }
    match Device::num_devices() {
        Ok(n) => n as usize,
        Err(_) => 0,
    }
}

/// Device-side single-precision complex value, layout-compatible with
/// `float2` / `cufftComplex`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CuComplex {
    pub re: f32,
    pub im: f32,
}

unsafe impl DeviceCopy for CuComplex {}

impl CuComplex {
    #[inline]
    pub fn new(re: f32, im: f32) -> Self {
        Self { re, im }
    }

    #[inline]
    pub fn norm(self) -> f32 {
        (self.re * self.re + self.im * self.im).sqrt()
    }
}

pub const WARP_WIDTH: u32 = 32;

#[derive(Debug, Error)]
#[error("invalid launch config: {blocks} blocks x {threads} threads")]
pub struct KernelConfigError {
    pub blocks: u32,
    pub threads: u32,
}

/// Launch shape for the linear (grid-stride) kernels. Validated with
/// [`KernelConfig::check`] at the entry of every device op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    pub blocks: u32,
    pub threads: u32,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            blocks: 96,
            threads: 256,
        }
    }
}

impl KernelConfig {
    /// Both extents nonzero, threads a multiple of the warp width and within
    /// the universal 1024 per-block limit.
    pub fn check(&self) -> Result<(), KernelConfigError> {
        let bad = self.blocks == 0
            || self.threads == 0
            || self.threads % WARP_WIDTH != 0
            || self.threads > 1024;
        if bad {
            return Err(KernelConfigError {
                blocks: self.blocks,
                threads: self.threads,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kernel_config_default_is_valid() {
        assert!(KernelConfig::default().check().is_ok());
    }

    #[test]
    fn kernel_config_rejects_bad_shapes() {
        for (blocks, threads) in [(0u32, 256u32), (96, 0), (96, 100), (96, 2048)] {
            let cfg = KernelConfig { blocks, threads };
            assert!(cfg.check().is_err(), "{blocks}x{threads} must be rejected");
        }
    }

    #[test]
    fn cucomplex_is_float2_layout() {
        assert_eq!(std::mem::size_of::<CuComplex>(), 8);
        assert_eq!(std::mem::align_of::<CuComplex>(), 4);
        assert!((CuComplex::new(3.0, 4.0).norm() - 5.0).abs() < 1e-6);
    }
}
