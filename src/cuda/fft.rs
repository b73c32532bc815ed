//! Minimal cuFFT binding: planned 2-D complex-to-complex transforms bound
//! to a caller-owned stream. Only the handful of entry points the
//! Shrink-Wrap driver needs are declared; the plan handle is wrapped in an
//! RAII type so it is always destroyed.
//!
//! cuFFT's inverse transform is unnormalized (no 1/N rescale), the same
//! convention as the CPU path.

use std::os::raw::{c_int, c_void};

use cust::memory::DevicePointer;
use cust::stream::Stream;
use thiserror::Error;

use crate::cuda::CuComplex;

type CufftHandle = c_int;

const CUFFT_SUCCESS: c_int = 0;
const CUFFT_C2C: c_int = 0x29;

/// Transform directions, matching the cuFFT constants.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FftDirection {
    Forward = -1,
    Inverse = 1,
}

#[link(name = "cufft")]
extern "C" {
    fn cufftPlan2d(plan: *mut CufftHandle, nx: c_int, ny: c_int, kind: c_int) -> c_int;
    fn cufftSetStream(plan: CufftHandle, stream: *mut c_void) -> c_int;
    fn cufftExecC2C(
        plan: CufftHandle,
        idata: *mut CuComplex,
        odata: *mut CuComplex,
        direction: c_int,
    ) -> c_int;
    fn cufftDestroy(plan: CufftHandle) -> c_int;
}

#[derive(Debug, Error)]
pub enum CufftError {
    #[error("cuFFT plan creation failed with code {0}")]
    PlanCreation(i32),
    #[error("cuFFT stream binding failed with code {0}")]
    StreamBinding(i32),
    #[error("cuFFT execution failed with code {0}")]
    Execution(i32),
}

/// A planned 2-D C2C transform tied to one stream. Executions are submitted
/// to that stream and ordered with every other operation on it, so one
/// end-of-job synchronize covers the FFTs as well.
pub struct FftPlan2d {
    handle: CufftHandle,
}

impl FftPlan2d {
    /// Plans a `width x height` transform (row-major data: `nx` is the
    /// slower, `ny` the faster dimension) and binds it to `stream`.
    pub fn new(width: usize, height: usize, stream: &Stream) -> Result<Self, CufftError> {
        let mut handle: CufftHandle = 0;
        let rc = unsafe {
            cufftPlan2d(&mut handle, height as c_int, width as c_int, CUFFT_C2C)
        };
        if rc != CUFFT_SUCCESS {
            return Err(CufftError::PlanCreation(rc));
        }
        let plan = Self { handle };
        let rc = unsafe { cufftSetStream(plan.handle, stream.as_inner() as *mut c_void) };
        if rc != CUFFT_SUCCESS {
            return Err(CufftError::StreamBinding(rc));
        }
        Ok(plan)
    }

    /// Executes the transform from `input` into `output`. Passing the same
    /// pointer twice performs the in-place variant.
    pub fn exec(
        &self,
        input: DevicePointer<CuComplex>,
        output: DevicePointer<CuComplex>,
        direction: FftDirection,
    ) -> Result<(), CufftError> {
        let rc = unsafe {
            cufftExecC2C(
                self.handle,
                input.as_raw() as *mut CuComplex,
                output.as_raw() as *mut CuComplex,
                direction as c_int,
            )
        };
        if rc != CUFFT_SUCCESS {
            return Err(CufftError::Execution(rc));
        }
        Ok(())
    }
}

impl Drop for FftPlan2d {
    fn drop(&mut self) {
        unsafe {
            cufftDestroy(self.handle);
        }
    }
}
