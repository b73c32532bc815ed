//! CUDA support for the vector reductions (min/max/sum, f32/f64) and the
//! fused masked HIO error.
//!
//! Parity goals with the CPU reference in `algorithms::vector_reduce`:
//! - PTX load via include_str!(OUT_DIR/reduce_kernel.ptx) with
//!   DetermineTargetFromContext + O2
//! - NON_BLOCKING stream, one global atomic per block (warp shuffle within)
//! - global accumulator seeded with the operator identity before launch
//! - every entry point validates its KernelConfig and blocks until the
//!   scalar is back on the host

#![cfg(feature = "cuda")]

use cust::context::Context;
use cust::device::Device;
use cust::function::{BlockSize, GridSize};
use cust::memory::{CopyDestination, DeviceBuffer, DevicePointer};
use cust::module::{Module, ModuleJitOption, OptLevel};
use cust::prelude::*;
use cust::stream::{Stream, StreamFlags};
use std::ffi::c_void;
use std::sync::Arc;
use thiserror::Error;

use crate::cuda::{CuComplex, KernelConfig, KernelConfigError};

#[derive(Error, Debug)]
pub enum CudaReduceError {
    #[error("CUDA error: {0}")]
    Cuda(#[from] cust::error::CudaError),
    #[error(transparent)]
    LaunchConfig(#[from] KernelConfigError),
    #[error("missing kernel symbol: {name}")]
    MissingKernelSymbol { name: &'static str },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

macro_rules! impl_reduce_launch {
    ($fn_name:ident, $ty:ty, $symbol:literal, $identity:expr) => {
        pub(crate) fn $fn_name(
            module: &Module,
            stream: &Stream,
            config: KernelConfig,
            data: DevicePointer<$ty>,
            n: usize,
        ) -> Result<$ty, CudaReduceError> {
            config.check()?;
            if n == 0 {
                return Ok($identity);
            }
            let func = module.get_function($symbol).map_err(|_| {
                CudaReduceError::MissingKernelSymbol { name: $symbol }
            })?;

            let mut d_result = DeviceBuffer::from_slice(&[$identity as $ty])?;
            let grid: GridSize = (config.blocks, 1, 1).into();
            let block: BlockSize = (config.threads, 1, 1).into();
            unsafe {
                let mut data_ptr = data.as_raw();
                let mut n_u = n as u32;
                let mut result_ptr = d_result.as_device_ptr().as_raw();
                let args: &mut [*mut c_void] = &mut [
                    &mut data_ptr as *mut _ as *mut c_void,
                    &mut n_u as *mut _ as *mut c_void,
                    &mut result_ptr as *mut _ as *mut c_void,
                ];
                stream.launch(&func, grid, block, 0, args)?;
            }
            stream.synchronize()?;

            let mut host = [$identity as $ty];
            d_result.copy_to(&mut host)?;
            Ok(host[0])
        }
    };
}

impl_reduce_launch!(launch_min_f32, f32, "vector_min_f32", f32::INFINITY);
impl_reduce_launch!(launch_max_f32, f32, "vector_max_f32", f32::NEG_INFINITY);
impl_reduce_launch!(launch_sum_f32, f32, "vector_sum_f32", 0.0f32);
impl_reduce_launch!(launch_min_f64, f64, "vector_min_f64", f64::INFINITY);
impl_reduce_launch!(launch_max_f64, f64, "vector_max_f64", f64::NEG_INFINITY);
impl_reduce_launch!(launch_sum_f64, f64, "vector_sum_f64", 0.0f64);

/// Masked RMS magnitude, `sqrt(sum_selected |z|^2) / count_selected`, with
/// the selection optionally inverted. Returns 0 for an empty selection.
pub(crate) fn launch_hio_error_f32(
    module: &Module,
    stream: &Stream,
    config: KernelConfig,
    gprime: DevicePointer<CuComplex>,
    is_masked: DevicePointer<f32>,
    n: usize,
    invert_mask: bool,
) -> Result<f32, CudaReduceError> {
    config.check()?;
    if n == 0 {
        return Ok(0.0);
    }
    let func = module.get_function("hio_error_f32").map_err(|_| {
        CudaReduceError::MissingKernelSymbol {
            name: "hio_error_f32",
        }
    })?;

    let mut d_total = DeviceBuffer::from_slice(&[0.0f32])?;
    let mut d_count = DeviceBuffer::from_slice(&[0u32])?;
    let grid: GridSize = (config.blocks, 1, 1).into();
    let block: BlockSize = (config.threads, 1, 1).into();
    unsafe {
        let mut gprime_ptr = gprime.as_raw();
        let mut mask_ptr = is_masked.as_raw();
        let mut n_u = n as u32;
        let mut invert_i = invert_mask as i32;
        let mut total_ptr = d_total.as_device_ptr().as_raw();
        let mut count_ptr = d_count.as_device_ptr().as_raw();
        let args: &mut [*mut c_void] = &mut [
            &mut gprime_ptr as *mut _ as *mut c_void,
            &mut mask_ptr as *mut _ as *mut c_void,
            &mut n_u as *mut _ as *mut c_void,
            &mut invert_i as *mut _ as *mut c_void,
            &mut total_ptr as *mut _ as *mut c_void,
            &mut count_ptr as *mut _ as *mut c_void,
        ];
        stream.launch(&func, grid, block, 0, args)?;
    }
    stream.synchronize()?;

    let mut total = [0.0f32];
    let mut count = [0u32];
    d_total.copy_to(&mut total)?;
    d_count.copy_to(&mut count)?;
    if count[0] == 0 {
        return Ok(0.0);
    }
    Ok(total[0].sqrt() / count[0] as f32)
}

/// Self-contained reduction engine: one context, module and stream per
/// instance. For reductions embedded in a larger per-stream pipeline use
/// the driver in `shrink_wrap_wrapper`, which shares its stream across all
/// device ops of a job.
pub struct CudaReduce {
    module: Module,
    stream: Stream,
    context: Arc<Context>,
    device_id: u32,
    config: KernelConfig,
}

impl CudaReduce {
    pub fn new(device_id: usize) -> Result<Self, CudaReduceError> {
        cust::init(CudaFlags::empty())?;
        let device = Device::get_device(device_id as u32)?;
        let context = Arc::new(Context::new(device)?);

        let ptx: &str = include_str!(concat!(env!("OUT_DIR"), "/reduce_kernel.ptx"));
        let jit_opts = &[
            ModuleJitOption::DetermineTargetFromContext,
            ModuleJitOption::OptLevel(OptLevel::O2),
        ];
        let module = match Module::from_ptx(ptx, jit_opts) {
            Ok(m) => m,
            Err(_) => Module::from_ptx(ptx, &[ModuleJitOption::DetermineTargetFromContext])?,
        };
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;

        Ok(Self {
            module,
            stream,
            context,
            device_id: device_id as u32,
            config: KernelConfig::default(),
        })
    }

    pub fn set_config(&mut self, config: KernelConfig) -> Result<(), CudaReduceError> {
        config.check()?;
        self.config = config;
        Ok(())
    }

    pub fn context_arc(&self) -> Arc<Context> {
        self.context.clone()
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn min_f32(&self, data: &DeviceBuffer<f32>) -> Result<f32, CudaReduceError> {
        launch_min_f32(
            &self.module,
            &self.stream,
            self.config,
            data.as_device_ptr(),
            data.len(),
        )
    }

    pub fn max_f32(&self, data: &DeviceBuffer<f32>) -> Result<f32, CudaReduceError> {
        launch_max_f32(
            &self.module,
            &self.stream,
            self.config,
            data.as_device_ptr(),
            data.len(),
        )
    }

    pub fn sum_f32(&self, data: &DeviceBuffer<f32>) -> Result<f32, CudaReduceError> {
        launch_sum_f32(
            &self.module,
            &self.stream,
            self.config,
            data.as_device_ptr(),
            data.len(),
        )
    }

    pub fn min_f64(&self, data: &DeviceBuffer<f64>) -> Result<f64, CudaReduceError> {
        launch_min_f64(
            &self.module,
            &self.stream,
            self.config,
            data.as_device_ptr(),
            data.len(),
        )
    }

    pub fn max_f64(&self, data: &DeviceBuffer<f64>) -> Result<f64, CudaReduceError> {
        launch_max_f64(
            &self.module,
            &self.stream,
            self.config,
            data.as_device_ptr(),
            data.len(),
        )
    }

    pub fn sum_f64(&self, data: &DeviceBuffer<f64>) -> Result<f64, CudaReduceError> {
        launch_sum_f64(
            &self.module,
            &self.stream,
            self.config,
            data.as_device_ptr(),
            data.len(),
        )
    }

    /// Masked HIO error over a complex device buffer; see
    /// `algorithms::vector_reduce::calculate_hio_error` for the exact
    /// semantics.
    pub fn hio_error_f32(
        &self,
        gprime: &DeviceBuffer<CuComplex>,
        is_masked: &DeviceBuffer<f32>,
        invert_mask: bool,
    ) -> Result<f32, CudaReduceError> {
        if gprime.len() != is_masked.len() {
            return Err(CudaReduceError::InvalidInput(format!(
                "estimate length {} does not match mask length {}",
                gprime.len(),
                is_masked.len()
            )));
        }
        launch_hio_error_f32(
            &self.module,
            &self.stream,
            self.config,
            gprime.as_device_ptr(),
            is_masked.as_device_ptr(),
            gprime.len(),
            invert_mask,
        )
    }
}
