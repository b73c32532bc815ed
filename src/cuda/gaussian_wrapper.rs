//! CUDA support for the separable Gaussian blur.
//!
//! The horizontal pass launches one block per row and reads its weights
//! from the module's constant-memory region, populated slot-wise from the
//! host-side [`WeightCache`]; the vertical pass covers columns in 32-wide
//! groups and receives its weights through a freshly copied device buffer.
//! Both paths use the same host-computed kernel, so their results are
//! bit-identical for equal sigmas.
//!
//! Cache mutation (including the constant-memory upload) is expected to be
//! serialized by the caller; the task queue holds its mutex across every
//! blur of a job.

#![cfg(feature = "cuda")]

use cust::context::Context;
use cust::device::Device;
use cust::function::{BlockSize, GridSize};
use cust::memory::{DeviceBuffer, DevicePointer};
use cust::module::{Module, ModuleJitOption, OptLevel};
use cust::prelude::*;
use cust::stream::{Stream, StreamFlags};
use std::ffi::{c_void, CStr};
use std::sync::Arc;
use thiserror::Error;

use crate::cuda::{KernelConfig, KernelConfigError};
use crate::libs::weight_cache::{WeightCache, WeightCacheError, MAX_KERNELS, MAX_WEIGHTS};

/// Symbol name of the `__constant__` weight region in the PTX module.
const WEIGHTS_SYMBOL: &CStr = c"gaussian_weights_c";

#[derive(Error, Debug)]
pub enum CudaGaussianError {
    #[error("CUDA error: {0}")]
    Cuda(#[from] cust::error::CudaError),
    #[error(transparent)]
    LaunchConfig(#[from] KernelConfigError),
    #[error(transparent)]
    Weights(#[from] WeightCacheError),
    #[error("missing kernel symbol: {name}")]
    MissingKernelSymbol { name: &'static str },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Ensures the kernel for `sigma` sits in the module's constant region and
/// returns its `(weight_offset, half_width)`. Uploads the whole region on
/// every insert, which also restores it after an overflow clear.
pub(crate) fn ensure_weights(
    module: &Module,
    cache: &mut WeightCache,
    sigma: f32,
) -> Result<(usize, usize), CudaGaussianError> {
    let slot = cache.lookup(sigma)?;
    if slot.inserted {
        let mut symbol = module
            .get_global::<[f32; MAX_KERNELS * MAX_WEIGHTS]>(WEIGHTS_SYMBOL)
            .map_err(|_| CudaGaussianError::MissingKernelSymbol {
                name: "gaussian_weights_c",
            })?;
        symbol.copy_from(cache.region())?;
    }
    let half = cache.weights(slot.slot).len() / 2;
    Ok((slot.slot * MAX_WEIGHTS, half))
}

/// Blurs `width x height` floats in place on `stream`. Weight-cache
/// bookkeeping and the constant upload happen host-side before the two
/// launches are queued; the stream is synchronized before returning so the
/// temporary vertical-weights buffer can be released.
pub(crate) fn launch_gaussian_blur(
    module: &Module,
    stream: &Stream,
    config: KernelConfig,
    cache: &mut WeightCache,
    data: DevicePointer<f32>,
    width: usize,
    height: usize,
    sigma: f32,
) -> Result<(), CudaGaussianError> {
    config.check()?;
    if width == 0 || height == 0 {
        return Err(CudaGaussianError::InvalidInput(format!(
            "empty image: {width}x{height}"
        )));
    }

    let (weight_offset, half) = ensure_weights(module, cache, sigma)?;

    // horizontal: one block per row, sliding window of threads + 2*half
    let horizontal = module
        .get_function("gaussian_blur_horizontal_f32")
        .map_err(|_| CudaGaussianError::MissingKernelSymbol {
            name: "gaussian_blur_horizontal_f32",
        })?;
    let h_shared = (config.threads as usize + 2 * half) * std::mem::size_of::<f32>();
    let grid: GridSize = (height as u32, 1, 1).into();
    let block: BlockSize = (config.threads, 1, 1).into();
    unsafe {
        let mut data_ptr = data.as_raw();
        let mut width_i = width as i32;
        let mut height_i = height as i32;
        let mut half_i = half as i32;
        let mut offset_i = weight_offset as i32;
        let args: &mut [*mut c_void] = &mut [
            &mut data_ptr as *mut _ as *mut c_void,
            &mut width_i as *mut _ as *mut c_void,
            &mut height_i as *mut _ as *mut c_void,
            &mut half_i as *mut _ as *mut c_void,
            &mut offset_i as *mut _ as *mut c_void,
        ];
        stream.launch(&horizontal, grid, block, h_shared as u32, args)?;
    }

    // vertical: 32-wide column groups, weights via a fresh device buffer
    let vertical = module
        .get_function("gaussian_blur_vertical_f32")
        .map_err(|_| CudaGaussianError::MissingKernelSymbol {
            name: "gaussian_blur_vertical_f32",
        })?;
    let d_weights = DeviceBuffer::from_slice(cache.weights(weight_offset / MAX_WEIGHTS))?;
    let rows_per_step = (config.threads / 32).clamp(1, 32);
    let v_shared =
        (rows_per_step as usize + 2 * half) * 32 * std::mem::size_of::<f32>();
    let grid: GridSize = ((width as u32 + 31) / 32, 1, 1).into();
    let block: BlockSize = (32, rows_per_step, 1).into();
    unsafe {
        let mut data_ptr = data.as_raw();
        let mut width_i = width as i32;
        let mut height_i = height as i32;
        let mut half_i = half as i32;
        let mut weights_ptr = d_weights.as_device_ptr().as_raw();
        let args: &mut [*mut c_void] = &mut [
            &mut data_ptr as *mut _ as *mut c_void,
            &mut width_i as *mut _ as *mut c_void,
            &mut height_i as *mut _ as *mut c_void,
            &mut half_i as *mut _ as *mut c_void,
            &mut weights_ptr as *mut _ as *mut c_void,
        ];
        stream.launch(&vertical, grid, block, v_shared as u32, args)?;
    }
    // the vertical weights buffer must outlive the queued launch
    stream.synchronize()?;
    drop(d_weights);
    Ok(())
}

/// Self-contained blur engine: one context, module, stream and weight
/// cache per instance. The cache persists across calls, so the recurring
/// sigmas of the Shrink-Wrap decay sequence hit warm slots.
pub struct CudaGaussian {
    module: Module,
    stream: Stream,
    context: Arc<Context>,
    device_id: u32,
    config: KernelConfig,
    cache: WeightCache,
}

impl CudaGaussian {
    pub fn new(device_id: usize) -> Result<Self, CudaGaussianError> {
        cust::init(CudaFlags::empty())?;
        let device = Device::get_device(device_id as u32)?;
        let context = Arc::new(Context::new(device)?);

        let ptx: &str = include_str!(concat!(env!("OUT_DIR"), "/gaussian_kernel.ptx"));
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
            cache: WeightCache::new(),
        })
    }

    pub fn set_config(&mut self, config: KernelConfig) -> Result<(), CudaGaussianError> {
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

    pub fn cache(&self) -> &WeightCache {
        &self.cache
    }

    /// Blurs a device-resident image in place and synchronizes.
    pub fn blur(
        &mut self,
        data: &mut DeviceBuffer<f32>,
        width: usize,
        height: usize,
        sigma: f32,
    ) -> Result<(), CudaGaussianError> {
        if data.len() != width * height {
            return Err(CudaGaussianError::InvalidInput(format!(
                "data length {} does not match {width}x{height}",
                data.len()
            )));
        }
        launch_gaussian_blur(
            &self.module,
            &self.stream,
            self.config,
            &mut self.cache,
            data.as_device_ptr(),
            width,
            height,
            sigma,
        )?;
        Ok(self.stream.synchronize()?)
    }
}
