//! # Shrink-Wrap Driver (CPU)
//!
//! Reconstructs a real, non-negative 2-D object from its measured Fourier
//! magnitude. The outer loop re-estimates the object's support by blurring
//! the magnitude of the current estimate and thresholding it (shrink-wrap);
//! the inner loop runs Fienup's HIO update against the fixed mask,
//! alternating between real space (support and non-negativity constraints)
//! and frequency space (modulus replacement).
//!
//! The first support guess comes from the autocorrelation, the inverse
//! transform of the measured intensity (Wiener-Khinchin). The inverse FFT is
//! deliberately left unnormalized, matching the convention the convergence
//! threshold was calibrated against.
//!
//! ## Parameters
//! All [`ShrinkWrapParams`] fields are optional; `None`, zero or a negative
//! value selects the documented default.
//!
//! ## Errors
//! - **EmptyImage**: a zero dimension.
//! - **BadLength**: the buffer does not hold `width * height` values.
//!
//! ## Returns
//! `Ok(error)` with the last masked HIO error on success; the input buffer
//! is overwritten with the reconstructed object.

use num_complex::Complex32;
use rayon::prelude::*;
use rustfft::{Fft, FftDirection, FftPlanner};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

use crate::algorithms::vector_elementwise::{
    apply_hio_domain_constraints, apply_modulus, complex_norm, copy_from_real, copy_to_real, cutoff,
};
use crate::algorithms::vector_reduce::{calculate_hio_error, vector_max_f32};
use crate::libs::gaussian::{gaussian_blur, GaussianError};

/// Lower bound for the blur sigma across outer cycles.
pub const SIGMA_FLOOR: f32 = 1.5;

pub const DEFAULT_CYCLES: u32 = 20;
pub const DEFAULT_HIO_CYCLES: u32 = 20;
pub const DEFAULT_TARGET_ERROR: f32 = 1e-5;
pub const DEFAULT_HIO_BETA: f32 = 0.9;
pub const DEFAULT_CUTOFF_AUTOCORR: f32 = 0.04;
pub const DEFAULT_CUTOFF_MASK: f32 = 0.20;
pub const DEFAULT_SIGMA0: f32 = 3.0;
pub const DEFAULT_SIGMA_DECAY: f32 = 0.01;

/// One sigma decay step: relative decrement bounded below by
/// [`SIGMA_FLOOR`]. The sequence it generates is monotonically
/// non-increasing.
#[inline]
pub fn decay_sigma(sigma: f32, sigma_decay: f32) -> f32 {
    SIGMA_FLOOR.max((1.0 - sigma_decay) * sigma)
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShrinkWrapParams {
    /// Outer mask-update iterations. Default 20.
    pub cycles: Option<u32>,
    /// Inner HIO iterations per cycle. Default 20.
    pub hio_cycles: Option<u32>,
    /// Early-exit threshold for the masked error. Default 1e-5.
    pub target_error: Option<f32>,
    /// HIO feedback coefficient. Default 0.9.
    pub hio_beta: Option<f32>,
    /// Threshold fraction for the first (autocorrelation) mask. Default 0.04.
    pub cutoff_autocorr: Option<f32>,
    /// Threshold fraction for subsequent masks. Default 0.20.
    pub cutoff_mask: Option<f32>,
    /// Initial blur sigma. Default 3.0.
    pub sigma0: Option<f32>,
    /// Relative sigma decrement per cycle. Default 0.01; floor 1.5.
    pub sigma_decay: Option<f32>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct ResolvedParams {
    pub cycles: u32,
    pub hio_cycles: u32,
    pub target_error: f32,
    pub hio_beta: f32,
    pub cutoff_autocorr: f32,
    pub cutoff_mask: f32,
    pub sigma0: f32,
    pub sigma_decay: f32,
}

#[inline]
fn positive_or(value: Option<f32>, default: f32) -> f32 {
    match value {
        Some(v) if v > 0.0 => v,
        _ => default,
    }
}

#[inline]
fn nonzero_or(value: Option<u32>, default: u32) -> u32 {
    match value {
        Some(v) if v > 0 => v,
        _ => default,
    }
}

impl ShrinkWrapParams {
    /// Applies the documented default for every missing or non-positive
    /// field, so callers can override a single parameter while keeping the
    /// rest at their defaults.
    pub(crate) fn resolve(&self) -> ResolvedParams {
        ResolvedParams {
            cycles: nonzero_or(self.cycles, DEFAULT_CYCLES),
            hio_cycles: nonzero_or(self.hio_cycles, DEFAULT_HIO_CYCLES),
            target_error: positive_or(self.target_error, DEFAULT_TARGET_ERROR),
            hio_beta: positive_or(self.hio_beta, DEFAULT_HIO_BETA),
            cutoff_autocorr: positive_or(self.cutoff_autocorr, DEFAULT_CUTOFF_AUTOCORR),
            cutoff_mask: positive_or(self.cutoff_mask, DEFAULT_CUTOFF_MASK),
            sigma0: positive_or(self.sigma0, DEFAULT_SIGMA0),
            sigma_decay: positive_or(self.sigma_decay, DEFAULT_SIGMA_DECAY),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ShrinkWrapBuilder {
    params: ShrinkWrapParams,
}

impl ShrinkWrapBuilder {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }
    #[inline]
    pub fn cycles(mut self, n: u32) -> Self {
        self.params.cycles = Some(n);
        self
    }
    #[inline]
    pub fn hio_cycles(mut self, n: u32) -> Self {
        self.params.hio_cycles = Some(n);
        self
    }
    #[inline]
    pub fn target_error(mut self, e: f32) -> Self {
        self.params.target_error = Some(e);
        self
    }
    #[inline]
    pub fn hio_beta(mut self, beta: f32) -> Self {
        self.params.hio_beta = Some(beta);
        self
    }
    #[inline]
    pub fn cutoff_autocorr(mut self, f: f32) -> Self {
        self.params.cutoff_autocorr = Some(f);
        self
    }
    #[inline]
    pub fn cutoff_mask(mut self, f: f32) -> Self {
        self.params.cutoff_mask = Some(f);
        self
    }
    #[inline]
    pub fn sigma0(mut self, sigma: f32) -> Self {
        self.params.sigma0 = Some(sigma);
        self
    }
    #[inline]
    pub fn sigma_decay(mut self, d: f32) -> Self {
        self.params.sigma_decay = Some(d);
        self
    }
    #[inline]
    pub fn build(self) -> ShrinkWrapParams {
        self.params
    }
    /// Runs the reconstruction on `intensity` in place.
    #[inline]
    pub fn apply(
        self,
        intensity: &mut [f32],
        width: usize,
        height: usize,
    ) -> Result<f32, ShrinkWrapError> {
        shrink_wrap(intensity, width, height, &self.params)
    }
}

#[derive(Debug, Error)]
pub enum ShrinkWrapError {
    #[error("shrink_wrap: empty image: {width}x{height}")]
    EmptyImage { width: usize, height: usize },

    #[error("shrink_wrap: intensity length {len} does not match {width}x{height}")]
    BadLength {
        len: usize,
        width: usize,
        height: usize,
    },

    #[error(transparent)]
    Gaussian(#[from] GaussianError),
}

/// Planned 2-D complex-to-complex transform, decomposed into a row pass and
/// a column pass (via transposes) of 1-D FFTs. The inverse direction is
/// unnormalized, like the planner's underlying 1-D transforms.
pub struct Fft2d {
    row: Arc<dyn Fft<f32>>,
    col: Arc<dyn Fft<f32>>,
    width: usize,
    height: usize,
}

impl Fft2d {
    pub fn new(
        planner: &mut FftPlanner<f32>,
        width: usize,
        height: usize,
        direction: FftDirection,
    ) -> Self {
        Self {
            row: planner.plan_fft(width, direction),
            col: planner.plan_fft(height, direction),
            width,
            height,
        }
    }

    /// Transforms `data` in place; `data.len()` must equal `width * height`.
    pub fn process(&self, data: &mut [Complex32]) {
        debug_assert_eq!(data.len(), self.width * self.height);

        data.par_chunks_mut(self.width).for_each_init(
            || vec![Complex32::default(); self.row.get_inplace_scratch_len()],
            |scratch, row| self.row.process_with_scratch(row, scratch),
        );

        // gather columns, transform, scatter back
        let mut transposed = vec![Complex32::default(); data.len()];
        transposed
            .par_chunks_mut(self.height)
            .enumerate()
            .for_each(|(col, out)| {
                for (row, v) in out.iter_mut().enumerate() {
                    *v = data[row * self.width + col];
                }
            });
        transposed.par_chunks_mut(self.height).for_each_init(
            || vec![Complex32::default(); self.col.get_inplace_scratch_len()],
            |scratch, col| self.col.process_with_scratch(col, scratch),
        );
        data.par_chunks_mut(self.width)
            .enumerate()
            .for_each(|(row, out)| {
                for (col, v) in out.iter_mut().enumerate() {
                    *v = transposed[col * self.height + row];
                }
            });
    }
}

/// Reconstructs the object behind the measured Fourier magnitude
/// `intensity`, overwriting the buffer with the result.
///
/// Returns the last masked HIO error on success.
pub fn shrink_wrap(
    intensity: &mut [f32],
    width: usize,
    height: usize,
    params: &ShrinkWrapParams,
) -> Result<f32, ShrinkWrapError> {
    if width == 0 || height == 0 {
        return Err(ShrinkWrapError::EmptyImage { width, height });
    }
    if intensity.len() != width * height {
        return Err(ShrinkWrapError::BadLength {
            len: intensity.len(),
            width,
            height,
        });
    }

    let p = params.resolve();
    let n = width * height;
    let mut sigma = p.sigma0;

    let mut planner = FftPlanner::new();
    let to_freq_space = Fft2d::new(&mut planner, width, height, FftDirection::Forward);
    let to_real_space = Fft2d::new(&mut planner, width, height, FftDirection::Inverse);

    let mut cur = vec![Complex32::default(); n];
    let mut gprevious = vec![Complex32::default(); n];
    let mut is_masked = vec![0.0f32; n];

    // intensity -> autocorrelation, the first guess for the object
    copy_to_real(&mut cur, intensity);
    to_real_space.process(&mut cur);

    let mut current_error = 0.0f32;
    for cycle in 0..p.cycles {
        // update mask: blur |g'|, threshold against the current maximum
        complex_norm(&mut is_masked, &cur);
        gaussian_blur(&mut is_masked, width, height, sigma)?;
        let abs_max = vector_max_f32(&is_masked);
        let fraction = if cycle == 0 {
            p.cutoff_autocorr
        } else {
            p.cutoff_mask
        };
        cutoff(&mut is_masked, fraction * abs_max, 1.0, 0.0);
        sigma = decay_sigma(sigma, p.sigma_decay);

        // g_{k+1} = g_k - beta * g' needs a previous iterate; approximate it
        // by g' itself on the first cycle only
        if cycle == 0 {
            gprevious.copy_from_slice(&cur);
        }

        for _ in 0..p.hio_cycles {
            apply_hio_domain_constraints(&mut gprevious, &cur, &is_masked, p.hio_beta);
            cur.copy_from_slice(&gprevious);
            to_freq_space.process(&mut cur);
            apply_modulus(&mut cur, intensity);
            to_real_space.process(&mut cur);
        }

        current_error = calculate_hio_error(&cur, &is_masked, false);
        if cfg!(debug_assertions) {
            eprintln!(
                "[diffrec] cycle {}/{}: error {:e} (target {:e})",
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

    copy_from_real(intensity, &cur);
    Ok(current_error)
}
