//! CUDA Shrink-Wrap driver.
//!
//! Owns the three PTX modules (reductions, elementwise, blur), a cuFFT
//! plan cache point and one NON_BLOCKING stream. Every device operation of
//! a job (kernels, FFTs and copies) is submitted to that stream, so
//! operations execute in submission order and a single synchronize at the
//! end of the job is the only ordering the host needs.
//!
//! All buffers a job touches are allocated at entry and released (RAII)
//! before `reconstruct` returns; the weight cache alone persists across
//! jobs on this engine.

#![cfg(feature = "cuda")]

use cust::context::{Context, CurrentContext};
use cust::device::Device;
use cust::memory::{mem_get_info, AsyncCopyDestination, DeviceBuffer, LockedBuffer};
use cust::module::{Module, ModuleJitOption, OptLevel};
use cust::prelude::*;
use cust::stream::{Stream, StreamFlags};
use std::env;
use std::sync::Arc;
use thiserror::Error;

use crate::algorithms::shrink_wrap::{decay_sigma, ShrinkWrapParams};
use crate::cuda::fft::{CufftError, FftDirection, FftPlan2d};
use crate::cuda::gaussian_wrapper::{launch_gaussian_blur, CudaGaussianError};
use crate::cuda::vector_elementwise_wrapper::{
    launch_apply_modulus, launch_complex_norm, launch_copy_complex, launch_copy_from_real,
    launch_copy_to_real, launch_cutoff, launch_hio_domain_constraints, CudaElementwiseError,
};
use crate::cuda::vector_reduce_wrapper::{
    launch_hio_error_f32, launch_max_f32, CudaReduceError,
};
use crate::cuda::{CuComplex, KernelConfig, KernelConfigError};
use crate::libs::weight_cache::WeightCache;

const VRAM_HEADROOM: usize = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CudaShrinkWrapError {
    #[error("CUDA error: {0}")]
    Cuda(#[from] cust::error::CudaError),
    #[error(transparent)]
    LaunchConfig(#[from] KernelConfigError),
    #[error(transparent)]
    Fft(#[from] CufftError),
    #[error(transparent)]
    Reduce(#[from] CudaReduceError),
    #[error(transparent)]
    Elementwise(#[from] CudaElementwiseError),
    #[error(transparent)]
    Gaussian(#[from] CudaGaussianError),
    #[error("out of memory: required={required} free={free} headroom={headroom}")]
    OutOfMemory {
        required: usize,
        free: usize,
        headroom: usize,
    },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

fn load_module(ptx: &str) -> Result<Module, cust::error::CudaError> {
    let jit_opts = &[
        ModuleJitOption::DetermineTargetFromContext,
        ModuleJitOption::OptLevel(OptLevel::O2),
    ];
    match Module::from_ptx(ptx, jit_opts) {
        Ok(m) => Ok(m),
        Err(_) => Module::from_ptx(ptx, &[ModuleJitOption::DetermineTargetFromContext]),
    }
}

pub struct CudaShrinkWrap {
    reduce: Module,
    elementwise: Module,
    gaussian: Module,
    stream: Stream,
    context: Arc<Context>,
    device_id: u32,
    config: KernelConfig,
    cache: WeightCache,
}

impl CudaShrinkWrap {
    /// Builds an engine with its own context and stream on `device_id`.
    pub fn new(device_id: usize) -> Result<Self, CudaShrinkWrapError> {
        cust::init(CudaFlags::empty())?;
        let device = Device::get_device(device_id as u32)?;
        let context = Arc::new(Context::new(device)?);
        let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;
        Self::from_parts(context, device_id as u32, stream)
    }

    /// Builds an engine over an existing context/stream pair. Used by the
    /// task queue, which creates one engine per (device, stream) slot. The
    /// context must be current on the calling thread.
    pub fn from_parts(
        context: Arc<Context>,
        device_id: u32,
        stream: Stream,
    ) -> Result<Self, CudaShrinkWrapError> {
        let reduce = load_module(include_str!(concat!(env!("OUT_DIR"), "/reduce_kernel.ptx")))?;
        let elementwise = load_module(include_str!(concat!(
            env!("OUT_DIR"),
            "/elementwise_kernel.ptx"
        )))?;
        let gaussian = load_module(include_str!(concat!(
            env!("OUT_DIR"),
            "/gaussian_kernel.ptx"
        )))?;

        Ok(Self {
            reduce,
            elementwise,
            gaussian,
            stream,
            context,
            device_id,
            config: KernelConfig::default(),
            cache: WeightCache::new(),
        })
    }

    pub fn set_config(&mut self, config: KernelConfig) -> Result<(), CudaShrinkWrapError> {
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

    /// Makes this engine's context current on the calling thread. Workers
    /// must call this once before running jobs on the engine.
    pub fn bind(&self) -> Result<(), CudaShrinkWrapError> {
        CurrentContext::set_current(self.context.as_ref())?;
        Ok(())
    }

    #[inline]
    fn mem_check_enabled() -> bool {
        match env::var("CUDA_MEM_CHECK") {
            Ok(v) => v != "0" && v.to_lowercase() != "false",
            Err(_) => true,
        }
    }

    fn admit(&self, n: usize) -> Result<(), CudaShrinkWrapError> {
        // device buffers only: g + g' (complex) + intensity + mask (real);
        // the pinned staging buffer lives in host memory
        let required = n
            .checked_mul(2 * std::mem::size_of::<CuComplex>() + 2 * std::mem::size_of::<f32>())
            .ok_or_else(|| {
                CudaShrinkWrapError::InvalidInput("allocation size overflow".into())
            })?;
        if !Self::mem_check_enabled() {
            return Ok(());
        }
        if let Ok((free, _total)) = mem_get_info() {
            if required.saturating_add(VRAM_HEADROOM) > free {
                return Err(CudaShrinkWrapError::OutOfMemory {
                    required,
                    free,
                    headroom: VRAM_HEADROOM,
                });
            }
        }
        Ok(())
    }

    /// Reconstructs the object behind the measured Fourier magnitude
    /// `intensity`, overwriting the buffer with the result. Semantics match
    /// `algorithms::shrink_wrap` (see there for the parameter defaults);
    /// returns the last masked HIO error.
    pub fn reconstruct(
        &mut self,
        intensity: &mut [f32],
        width: usize,
        height: usize,
        params: &ShrinkWrapParams,
    ) -> Result<f32, CudaShrinkWrapError> {
        self.config.check()?;
        if width == 0 || height == 0 {
            return Err(CudaShrinkWrapError::InvalidInput(format!(
                "empty image: {width}x{height}"
            )));
        }
        if intensity.len() != width * height {
            return Err(CudaShrinkWrapError::InvalidInput(format!(
                "intensity length {} does not match {width}x{height}",
                intensity.len()
            )));
        }

        let p = params.resolve();
        let n = width * height;
        let mut sigma = p.sigma0;
        self.admit(n)?;

        let cfg = self.config;
        let stream = &self.stream;

        // per-job device buffers, all released on return
        let mut d_cur: DeviceBuffer<CuComplex> = unsafe { DeviceBuffer::uninitialized(n)? };
        let mut d_prev: DeviceBuffer<CuComplex> = unsafe { DeviceBuffer::uninitialized(n)? };
        let mut d_intensity: DeviceBuffer<f32> = unsafe { DeviceBuffer::uninitialized(n)? };
        let d_mask: DeviceBuffer<f32> = unsafe { DeviceBuffer::uninitialized(n)? };

        let mut staged = LockedBuffer::new(&0.0f32, n)?;
        staged.copy_from_slice(intensity);
        unsafe {
            d_intensity.async_copy_from(&staged, stream)?;
        }

        // plans for g -> g' (forward, out of place) and g' -> g' (inverse,
        // in place), both bound to the job's stream
        let plan = FftPlan2d::new(width, height, stream)?;

        // intensity -> autocorrelation, the first guess for the object
        launch_copy_to_real(
            &self.elementwise,
            stream,
            cfg,
            d_cur.as_device_ptr(),
            d_intensity.as_device_ptr(),
            n,
        )?;
        plan.exec(
            d_cur.as_device_ptr(),
            d_cur.as_device_ptr(),
            FftDirection::Inverse,
        )?;

        let mut current_error = 0.0f32;
        for cycle in 0..p.cycles {
            // update mask: blur |g'|, threshold against the current maximum
            launch_complex_norm(
                &self.elementwise,
                stream,
                cfg,
                d_mask.as_device_ptr(),
                d_cur.as_device_ptr(),
                n,
            )?;
            launch_gaussian_blur(
                &self.gaussian,
                stream,
                cfg,
                &mut self.cache,
                d_mask.as_device_ptr(),
                width,
                height,
                sigma,
            )?;
            let abs_max =
                launch_max_f32(&self.reduce, stream, cfg, d_mask.as_device_ptr(), n)?;
            let fraction = if cycle == 0 {
                p.cutoff_autocorr
            } else {
                p.cutoff_mask
            };
            launch_cutoff(
                &self.elementwise,
                stream,
                cfg,
                d_mask.as_device_ptr(),
                n,
                fraction * abs_max,
                1.0,
                0.0,
            )?;
            sigma = decay_sigma(sigma, p.sigma_decay);

            // g_{k+1} = g_k - beta * g' needs a previous iterate; seed it
            // with g' itself on the first cycle only
            if cycle == 0 {
                launch_copy_complex(
                    &self.elementwise,
                    stream,
                    cfg,
                    d_prev.as_device_ptr(),
                    d_cur.as_device_ptr(),
                    n,
                )?;
            }

            for _ in 0..p.hio_cycles {
                launch_hio_domain_constraints(
                    &self.elementwise,
                    stream,
                    cfg,
                    d_prev.as_device_ptr(),
                    d_cur.as_device_ptr(),
                    d_mask.as_device_ptr(),
                    n,
                    p.hio_beta,
                )?;
                plan.exec(
                    d_prev.as_device_ptr(),
                    d_cur.as_device_ptr(),
                    FftDirection::Forward,
                )?;
                launch_apply_modulus(
                    &self.elementwise,
                    stream,
                    cfg,
                    d_cur.as_device_ptr(),
                    d_cur.as_device_ptr(),
                    d_intensity.as_device_ptr(),
                    n,
                )?;
                plan.exec(
                    d_cur.as_device_ptr(),
                    d_cur.as_device_ptr(),
                    FftDirection::Inverse,
                )?;
            }

            current_error = launch_hio_error_f32(
                &self.reduce,
                stream,
                cfg,
                d_cur.as_device_ptr(),
                d_mask.as_device_ptr(),
                n,
                false,
            )?;
            if cfg!(debug_assertions) {
                eprintln!(
                    "[diffrec] device {}: cycle {}/{}: error {:e} (target {:e})",
                    self.device_id,
                    cycle + 1,
                    p.cycles,
                    current_error,
                    p.target_error
                );
            }
            if p.target_error > 0.0 && current_error < p.target_error {
                break;
            }
        }

        launch_copy_from_real(
            &self.elementwise,
            stream,
            cfg,
            d_intensity.as_device_ptr(),
            d_cur.as_device_ptr(),
            n,
        )?;
        unsafe {
            d_intensity.async_copy_to(&mut staged, stream)?;
        }
        stream.synchronize()?;
        intensity.copy_from_slice(&staged[..]);

        Ok(current_error)
    }
}
