//! # Vector Reductions
//!
//! Parallel minimum, maximum and sum over contiguous buffers, plus the fused
//! masked HIO error used as the Shrink-Wrap convergence metric. Semantics
//! match the device kernels: reductions over an empty buffer return the
//! operator identity, and the HIO error of a selection with zero pixels
//! is 0.
//!
//! min/max are order-independent and agree exactly with a serial reference;
//! sums are accumulation-order dependent, so comparisons against a serial
//! reference must admit an `O(N * eps)` relative tolerance.

use num_complex::Complex32;
use rayon::prelude::*;

macro_rules! impl_vector_reduce {
    ($ty:ty, $min:ident, $max:ident, $sum:ident) => {
        /// Minimum over `data`; the identity (positive infinity) for an
        /// empty buffer.
        pub fn $min(data: &[$ty]) -> $ty {
            data.par_iter()
                .copied()
                .reduce(|| <$ty>::INFINITY, <$ty>::min)
        }

        /// Maximum over `data`; the identity (negative infinity) for an
        /// empty buffer.
        pub fn $max(data: &[$ty]) -> $ty {
            data.par_iter()
                .copied()
                .reduce(|| <$ty>::NEG_INFINITY, <$ty>::max)
        }

        /// Sum over `data`; 0 for an empty buffer.
        pub fn $sum(data: &[$ty]) -> $ty {
            data.par_iter().copied().reduce(|| 0.0, |a, b| a + b)
        }
    };
}

impl_vector_reduce!(f32, vector_min_f32, vector_max_f32, vector_sum_f32);
impl_vector_reduce!(f64, vector_min_f64, vector_max_f64, vector_sum_f64);

/// RMS magnitude of `gprime` over the pixels selected by `is_masked`
/// (selection inverted when `invert_mask` is set), i.e.
/// `sqrt(sum_selected |z|^2) / count_selected`.
///
/// Mask values are expected to be exactly 0 or 1 (the cutoff guarantees
/// this). Returns 0 when nothing is selected.
pub fn calculate_hio_error(gprime: &[Complex32], is_masked: &[f32], invert_mask: bool) -> f32 {
    debug_assert_eq!(gprime.len(), is_masked.len());
    let (total_error, masked_count) = gprime
        .par_iter()
        .zip(is_masked.par_iter())
        .map(|(z, &m)| {
            let should_count = (invert_mask as u32) ^ (m as u32);
            (
                should_count as f32 * (z.re * z.re + z.im * z.im),
                should_count as u64,
            )
        })
        .reduce(|| (0.0f32, 0u64), |a, b| (a.0 + b.0, a.1 + b.1));

    if masked_count == 0 {
        return 0.0;
    }
    total_error.sqrt() / masked_count as f32
}
