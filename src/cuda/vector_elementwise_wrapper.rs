//! CUDA support for the elementwise operators of the Shrink-Wrap pipeline.
//!
//! Grid-stride kernels, safe to run in place where target and source alias;
//! the `pub(crate)` launchers take raw device pointers so the driver can
//! express the aliasing calls (`apply_modulus(cur, cur, ...)`) directly.

#![cfg(feature = "cuda")]

use cust::context::Context;
use cust::device::Device;
use cust::function::{BlockSize, GridSize};
use cust::memory::{DeviceBuffer, DevicePointer};
use cust::module::{Module, ModuleJitOption, OptLevel};
use cust::prelude::*;
use cust::stream::{Stream, StreamFlags};
use std::ffi::c_void;
use std::sync::Arc;
use thiserror::Error;

use crate::cuda::{CuComplex, KernelConfig, KernelConfigError};

#[derive(Error, Debug)]
pub enum CudaElementwiseError {
    #[error("CUDA error: {0}")]
    Cuda(#[from] cust::error::CudaError),
    #[error(transparent)]
    LaunchConfig(#[from] KernelConfigError),
    #[error("missing kernel symbol: {name}")]
    MissingKernelSymbol { name: &'static str },
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

#[inline]
fn get_function<'m>(
    module: &'m Module,
    name: &'static str,
) -> Result<cust::function::Function<'m>, CudaElementwiseError> {
    module
        .get_function(name)
        .map_err(|_| CudaElementwiseError::MissingKernelSymbol { name })
}

macro_rules! launch_linear {
    ($stream:expr, $func:expr, $config:expr, [$($arg:expr),+ $(,)?]) => {{
        let grid: GridSize = ($config.blocks, 1, 1).into();
        let block: BlockSize = ($config.threads, 1, 1).into();
        let args: &mut [*mut c_void] = &mut [
            $(&mut $arg as *mut _ as *mut c_void),+
        ];
        $stream.launch(&$func, grid, block, 0, args)?;
    }};
}

pub(crate) fn launch_copy_to_real(
    module: &Module,
    stream: &Stream,
    config: KernelConfig,
    target: DevicePointer<CuComplex>,
    source: DevicePointer<f32>,
    n: usize,
) -> Result<(), CudaElementwiseError> {
    config.check()?;
    let func = get_function(module, "copy_to_real_f32")?;
    unsafe {
        let mut target_ptr = target.as_raw();
        let mut source_ptr = source.as_raw();
        let mut n_u = n as u32;
        launch_linear!(stream, func, config, [target_ptr, source_ptr, n_u]);
    }
    Ok(())
}

pub(crate) fn launch_copy_from_real(
    module: &Module,
    stream: &Stream,
    config: KernelConfig,
    target: DevicePointer<f32>,
    source: DevicePointer<CuComplex>,
    n: usize,
) -> Result<(), CudaElementwiseError> {
    config.check()?;
    let func = get_function(module, "copy_from_real_f32")?;
    unsafe {
        let mut target_ptr = target.as_raw();
        let mut source_ptr = source.as_raw();
        let mut n_u = n as u32;
        launch_linear!(stream, func, config, [target_ptr, source_ptr, n_u]);
    }
    Ok(())
}

pub(crate) fn launch_copy_complex(
    module: &Module,
    stream: &Stream,
    config: KernelConfig,
    target: DevicePointer<CuComplex>,
    source: DevicePointer<CuComplex>,
    n: usize,
) -> Result<(), CudaElementwiseError> {
    config.check()?;
    let func = get_function(module, "copy_complex_f32")?;
    unsafe {
        let mut target_ptr = target.as_raw();
        let mut source_ptr = source.as_raw();
        let mut n_u = n as u32;
        launch_linear!(stream, func, config, [target_ptr, source_ptr, n_u]);
    }
    Ok(())
}

pub(crate) fn launch_complex_norm(
    module: &Module,
    stream: &Stream,
    config: KernelConfig,
    target: DevicePointer<f32>,
    source: DevicePointer<CuComplex>,
    n: usize,
) -> Result<(), CudaElementwiseError> {
    config.check()?;
    let func = get_function(module, "complex_norm_f32")?;
    unsafe {
        let mut target_ptr = target.as_raw();
        let mut source_ptr = source.as_raw();
        let mut n_u = n as u32;
        launch_linear!(stream, func, config, [target_ptr, source_ptr, n_u]);
    }
    Ok(())
}

pub(crate) fn launch_apply_modulus(
    module: &Module,
    stream: &Stream,
    config: KernelConfig,
    target: DevicePointer<CuComplex>,
    source: DevicePointer<CuComplex>,
    modulus: DevicePointer<f32>,
    n: usize,
) -> Result<(), CudaElementwiseError> {
    config.check()?;
    let func = get_function(module, "apply_modulus_f32")?;
    unsafe {
        let mut target_ptr = target.as_raw();
        let mut source_ptr = source.as_raw();
        let mut modulus_ptr = modulus.as_raw();
        let mut n_u = n as u32;
        launch_linear!(
            stream,
            func,
            config,
            [target_ptr, source_ptr, modulus_ptr, n_u]
        );
    }
    Ok(())
}

pub(crate) fn launch_cutoff(
    module: &Module,
    stream: &Stream,
    config: KernelConfig,
    data: DevicePointer<f32>,
    n: usize,
    threshold: f32,
    lower_value: f32,
    upper_value: f32,
) -> Result<(), CudaElementwiseError> {
    config.check()?;
    let func = get_function(module, "cutoff_f32")?;
    unsafe {
        let mut data_ptr = data.as_raw();
        let mut n_u = n as u32;
        let mut threshold_f = threshold;
        let mut lower_f = lower_value;
        let mut upper_f = upper_value;
        launch_linear!(
            stream,
            func,
            config,
            [data_ptr, n_u, threshold_f, lower_f, upper_f]
        );
    }
    Ok(())
}

pub(crate) fn launch_hio_domain_constraints(
    module: &Module,
    stream: &Stream,
    config: KernelConfig,
    gprevious: DevicePointer<CuComplex>,
    gprime: DevicePointer<CuComplex>,
    is_masked: DevicePointer<f32>,
    n: usize,
    hio_beta: f32,
) -> Result<(), CudaElementwiseError> {
    config.check()?;
    let func = get_function(module, "hio_domain_constraints_f32")?;
    unsafe {
        let mut gprev_ptr = gprevious.as_raw();
        let mut gprime_ptr = gprime.as_raw();
        let mut mask_ptr = is_masked.as_raw();
        let mut n_u = n as u32;
        let mut beta_f = hio_beta;
        launch_linear!(
            stream,
            func,
            config,
            [gprev_ptr, gprime_ptr, mask_ptr, n_u, beta_f]
        );
    }
    Ok(())
}

/// Self-contained elementwise engine with its own context, module and
/// stream. Every method synchronizes before returning, which keeps the
/// standalone API simple; the Shrink-Wrap driver uses the `launch_*`
/// functions directly to stay asynchronous within a job.
pub struct CudaElementwise {
    module: Module,
    stream: Stream,
    context: Arc<Context>,
    device_id: u32,
    config: KernelConfig,
}

impl CudaElementwise {
    pub fn new(device_id: usize) -> Result<Self, CudaElementwiseError> {
        cust::init(CudaFlags::empty())?;
        let device = Device::get_device(device_id as u32)?;
        let context = Arc::new(Context::new(device)?);

        let ptx: &str = include_str!(concat!(env!("OUT_DIR"), "/elementwise_kernel.ptx"));
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

    pub fn set_config(&mut self, config: KernelConfig) -> Result<(), CudaElementwiseError> {
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

    pub fn copy_to_real(
        &self,
        target: &mut DeviceBuffer<CuComplex>,
        source: &DeviceBuffer<f32>,
    ) -> Result<(), CudaElementwiseError> {
        self.expect_same_len(target.len(), source.len())?;
        launch_copy_to_real(
            &self.module,
            &self.stream,
            self.config,
            target.as_device_ptr(),
            source.as_device_ptr(),
            target.len(),
        )?;
        Ok(self.stream.synchronize()?)
    }

    pub fn copy_from_real(
        &self,
        target: &mut DeviceBuffer<f32>,
        source: &DeviceBuffer<CuComplex>,
    ) -> Result<(), CudaElementwiseError> {
        self.expect_same_len(target.len(), source.len())?;
        launch_copy_from_real(
            &self.module,
            &self.stream,
            self.config,
            target.as_device_ptr(),
            source.as_device_ptr(),
            target.len(),
        )?;
        Ok(self.stream.synchronize()?)
    }

    pub fn complex_norm(
        &self,
        target: &mut DeviceBuffer<f32>,
        source: &DeviceBuffer<CuComplex>,
    ) -> Result<(), CudaElementwiseError> {
        self.expect_same_len(target.len(), source.len())?;
        launch_complex_norm(
            &self.module,
            &self.stream,
            self.config,
            target.as_device_ptr(),
            source.as_device_ptr(),
            target.len(),
        )?;
        Ok(self.stream.synchronize()?)
    }

    /// In-place modulus replacement: `data[i] *= modulus[i] / max(|data[i]|, 1_if_zero)`.
    pub fn apply_modulus(
        &self,
        data: &mut DeviceBuffer<CuComplex>,
        modulus: &DeviceBuffer<f32>,
    ) -> Result<(), CudaElementwiseError> {
        self.expect_same_len(data.len(), modulus.len())?;
        launch_apply_modulus(
            &self.module,
            &self.stream,
            self.config,
            data.as_device_ptr(),
            data.as_device_ptr(),
            modulus.as_device_ptr(),
            data.len(),
        )?;
        Ok(self.stream.synchronize()?)
    }

    pub fn cutoff(
        &self,
        data: &mut DeviceBuffer<f32>,
        threshold: f32,
        lower_value: f32,
        upper_value: f32,
    ) -> Result<(), CudaElementwiseError> {
        launch_cutoff(
            &self.module,
            &self.stream,
            self.config,
            data.as_device_ptr(),
            data.len(),
            threshold,
            lower_value,
            upper_value,
        )?;
        Ok(self.stream.synchronize()?)
    }

    pub fn apply_hio_domain_constraints(
        &self,
        gprevious: &mut DeviceBuffer<CuComplex>,
        gprime: &DeviceBuffer<CuComplex>,
        is_masked: &DeviceBuffer<f32>,
        hio_beta: f32,
    ) -> Result<(), CudaElementwiseError> {
        self.expect_same_len(gprevious.len(), gprime.len())?;
        self.expect_same_len(gprevious.len(), is_masked.len())?;
        launch_hio_domain_constraints(
            &self.module,
            &self.stream,
            self.config,
            gprevious.as_device_ptr(),
            gprime.as_device_ptr(),
            is_masked.as_device_ptr(),
            gprevious.len(),
            hio_beta,
        )?;
        Ok(self.stream.synchronize()?)
    }

    #[inline]
    fn expect_same_len(&self, a: usize, b: usize) -> Result<(), CudaElementwiseError> {
        if a != b {
            return Err(CudaElementwiseError::InvalidInput(format!(
                "buffer lengths differ: {a} vs {b}"
            )));
        }
        Ok(())
    }
}
