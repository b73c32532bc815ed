//! # Separable Gaussian Blur
//!
//! Blurs a 2-D real array by a horizontal 1-D convolution followed by a
//! vertical 1-D convolution with the same normalized kernel. Values past
//! either end of a row or column are taken to equal the nearest edge value,
//! so the normalized kernel still acts as a mean near borders.
//!
//! The kernel half-width grows with sigma as
//! `n = ceil(ERF_COVERAGE_FACTOR * sigma - 0.5)`, which bounds the absolute
//! error contributed by the truncated tails.
//!
//! ## Errors
//! - **InvalidSigma**: `sigma` is zero, negative or not finite.
//! - **EmptyImage**: one of the image dimensions is zero.
//! - **BadLength**: the data slice does not hold `width * height` values.

use aligned_vec::{AVec, CACHELINE_ALIGN};
use rayon::prelude::*;
use thiserror::Error;

/// Multiplier translating sigma into the truncation half-width. Derived from
/// the inverse error function so the dropped tails carry less than a fixed
/// absolute weight.
pub const ERF_COVERAGE_FACTOR: f64 = 2.884402748387961;

#[derive(Debug, Error)]
pub enum GaussianError {
    #[error("gaussian: invalid sigma: {sigma}")]
    InvalidSigma { sigma: f32 },

    #[error("gaussian: empty image: {width}x{height}")]
    EmptyImage { width: usize, height: usize },

    #[error("gaussian: data length {len} does not match {width}x{height}")]
    BadLength {
        len: usize,
        width: usize,
        height: usize,
    },
}

/// Number of neighbors on each side of the center weight for `sigma`.
#[inline]
pub fn kernel_half_width(sigma: f32) -> usize {
    (ERF_COVERAGE_FACTOR * sigma as f64 - 0.5).ceil() as usize
}

/// Evaluates the truncated, normalized Gaussian kernel for `sigma`.
///
/// The result has odd length `2 * kernel_half_width(sigma) + 1` and sums to
/// one within rounding.
pub fn calc_gaussian_weights(sigma: f32) -> Result<AVec<f32>, GaussianError> {
    if !(sigma > 0.0) || !sigma.is_finite() {
        return Err(GaussianError::InvalidSigma { sigma });
    }
    let half = kernel_half_width(sigma) as i64;
    let s = sigma as f64;
    let prefactor = 1.0 / ((2.0 * std::f64::consts::PI).sqrt() * s);

    let mut weights: AVec<f32> = AVec::with_capacity(CACHELINE_ALIGN, (2 * half + 1) as usize);
    for i in -half..=half {
        weights.push((prefactor * (-((i * i) as f64) / (2.0 * s * s)).exp()) as f32);
    }
    let sum: f32 = weights.iter().sum();
    for w in weights.iter_mut() {
        *w /= sum;
    }
    Ok(weights)
}

#[inline]
fn clamp_index(i: isize, n: usize) -> usize {
    i.clamp(0, n as isize - 1) as usize
}

fn check_dims(len: usize, width: usize, height: usize) -> Result<(), GaussianError> {
    if width == 0 || height == 0 {
        return Err(GaussianError::EmptyImage { width, height });
    }
    if len != width * height {
        return Err(GaussianError::BadLength { len, width, height });
    }
    Ok(())
}

/// Convolves every row of `data` with `weights` in place, clamping at the
/// row ends. `weights.len()` must be odd.
pub fn blur_horizontal(
    data: &mut [f32],
    width: usize,
    height: usize,
    weights: &[f32],
) -> Result<(), GaussianError> {
    check_dims(data.len(), width, height)?;
    debug_assert!(weights.len() % 2 == 1);
    let half = (weights.len() / 2) as isize;

    data.par_chunks_mut(width).for_each_init(
        || vec![0.0f32; width],
        |scratch, row| {
            scratch.copy_from_slice(row);
            for (col, out) in row.iter_mut().enumerate() {
                let mut sum = 0.0f32;
                for (k, &w) in weights.iter().enumerate() {
                    let idx = clamp_index(col as isize + k as isize - half, width);
                    sum += w * scratch[idx];
                }
                *out = sum;
            }
        },
    );
    Ok(())
}

/// Convolves every column of `data` with `weights` in place, clamping at the
/// column ends. `weights.len()` must be odd.
pub fn blur_vertical(
    data: &mut [f32],
    width: usize,
    height: usize,
    weights: &[f32],
) -> Result<(), GaussianError> {
    check_dims(data.len(), width, height)?;
    debug_assert!(weights.len() % 2 == 1);
    let half = (weights.len() / 2) as isize;

    // Row-major layout makes strided column walks cache-hostile; convolving
    // whole output rows against a snapshot keeps both passes parallel and
    // in-place from the caller's point of view.
    let snapshot = data.to_vec();
    data.par_chunks_mut(width)
        .enumerate()
        .for_each(|(row, out_row)| {
            out_row.fill(0.0);
            for (k, &w) in weights.iter().enumerate() {
                let src_row = clamp_index(row as isize + k as isize - half, height);
                let src = &snapshot[src_row * width..(src_row + 1) * width];
                for (out, &v) in out_row.iter_mut().zip(src) {
                    *out += w * v;
                }
            }
        });
    Ok(())
}

/// Blurs a `width x height` image in place with the Gaussian for `sigma`.
pub fn gaussian_blur(
    data: &mut [f32],
    width: usize,
    height: usize,
    sigma: f32,
) -> Result<(), GaussianError> {
    let weights = calc_gaussian_weights(sigma)?;
    blur_horizontal(data, width, height, &weights)?;
    blur_vertical(data, width, height, &weights)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_width_grows_with_sigma() {
        assert_eq!(kernel_half_width(1.5), 4);
        assert_eq!(kernel_half_width(3.0), 9);
        assert!(kernel_half_width(8.0) < 25);
        let mut prev = 0;
        for i in 1..=80 {
            let n = kernel_half_width(i as f32 * 0.1);
            assert!(n >= prev, "half width must not shrink");
            prev = n;
        }
    }

    #[test]
    fn weights_are_odd_normalized_and_symmetric() {
        for &sigma in &[0.5f32, 1.0, 1.5, 2.7, 3.0, 5.0, 8.0] {
            let w = calc_gaussian_weights(sigma).unwrap();
            assert_eq!(w.len(), 2 * kernel_half_width(sigma) + 1);
            assert_eq!(w.len() % 2, 1);
            let sum: f32 = w.iter().sum();
            assert!(
                (sum - 1.0).abs() <= w.len() as f32 * f32::EPSILON,
                "kernel for sigma {} sums to {}",
                sigma,
                sum
            );
            for i in 0..w.len() / 2 {
                assert_eq!(w[i], w[w.len() - 1 - i]);
            }
            let center = w[w.len() / 2];
            assert!(w.iter().all(|&v| v <= center));
        }
    }

    #[test]
    fn rejects_bad_sigma() {
        assert!(calc_gaussian_weights(0.0).is_err());
        assert!(calc_gaussian_weights(-1.0).is_err());
        assert!(calc_gaussian_weights(f32::NAN).is_err());
    }

    #[test]
    fn constant_image_is_invariant() {
        let (w, h) = (17, 9);
        let mut data = vec![0.75f32; w * h];
        gaussian_blur(&mut data, w, h, 2.0).unwrap();
        for &v in &data {
            assert!((v - 0.75).abs() < 1e-5, "border clamp must preserve constants");
        }
    }

    #[test]
    fn horizontal_impulse_reproduces_weights() {
        let width = 33;
        let weights = calc_gaussian_weights(1.5).unwrap();
        let half = weights.len() / 2;
        let mut data = vec![0.0f32; width];
        data[width / 2] = 1.0;
        blur_horizontal(&mut data, width, 1, &weights).unwrap();
        for (k, &w) in weights.iter().enumerate() {
            let idx = width / 2 + k - half;
            assert!((data[idx] - w).abs() < 1e-7);
        }
    }

    #[test]
    fn vertical_impulse_reproduces_weights() {
        let height = 33;
        let weights = calc_gaussian_weights(1.5).unwrap();
        let half = weights.len() / 2;
        let mut data = vec![0.0f32; height];
        data[height / 2] = 1.0;
        blur_vertical(&mut data, 1, height, &weights).unwrap();
        for (k, &w) in weights.iter().enumerate() {
            let idx = height / 2 + k - half;
            assert!((data[idx] - w).abs() < 1e-7);
        }
    }

    #[test]
    fn separable_passes_commute() {
        let (w, h) = (24, 16);
        let mut a: Vec<f32> = (0..w * h).map(|i| ((i * 37 % 101) as f32) * 0.01).collect();
        let mut b = a.clone();
        let weights = calc_gaussian_weights(2.0).unwrap();

        blur_horizontal(&mut a, w, h, &weights).unwrap();
        blur_vertical(&mut a, w, h, &weights).unwrap();

        blur_vertical(&mut b, w, h, &weights).unwrap();
        blur_horizontal(&mut b, w, h, &weights).unwrap();

        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4);
        }
    }

    #[test]
    fn dimension_validation() {
        let mut data = vec![0.0f32; 10];
        assert!(gaussian_blur(&mut data, 0, 10, 1.0).is_err());
        assert!(gaussian_blur(&mut data, 3, 5, 1.0).is_err());
    }

    #[cfg(feature = "proptest")]
    #[test]
    fn prop_kernel_normalized_for_any_sigma() {
        use proptest::prelude::*;

        let strat = 0.1f32..8.0f32;
        proptest::test_runner::TestRunner::default()
            .run(&strat, |sigma| {
                let w = calc_gaussian_weights(sigma).unwrap();
                let sum: f32 = w.iter().sum();
                prop_assert!((sum - 1.0).abs() <= w.len() as f32 * f32::EPSILON);
                prop_assert_eq!(w.len() % 2, 1);
                Ok(())
            })
            .unwrap();
    }
}
