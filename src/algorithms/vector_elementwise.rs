//! # Elementwise Operators
//!
//! Pure per-element maps shared by the Shrink-Wrap driver: real/complex
//! copies, complex magnitude, modulus replacement, threshold cutoff and the
//! HIO domain-constraint update. All operate in place over slices and match
//! the device kernels bit-for-bit in exact arithmetic.

use num_complex::Complex32;

/// `target[i] = source[i] + 0i`.
#[inline]
pub fn copy_to_real(target: &mut [Complex32], source: &[f32]) {
    debug_assert_eq!(target.len(), source.len());
    for (t, &s) in target.iter_mut().zip(source) {
        *t = Complex32::new(s, 0.0);
    }
}

/// `target[i] = source[i].re`, discarding the imaginary part.
#[inline]
pub fn copy_from_real(target: &mut [f32], source: &[Complex32]) {
    debug_assert_eq!(target.len(), source.len());
    for (t, s) in target.iter_mut().zip(source) {
        *t = s.re;
    }
}

/// `target[i] = |source[i]|`.
#[inline]
pub fn complex_norm(target: &mut [f32], source: &[Complex32]) {
    debug_assert_eq!(target.len(), source.len());
    for (t, s) in target.iter_mut().zip(source) {
        *t = (s.re * s.re + s.im * s.im).sqrt();
    }
}

/// Rescales each value of `data` so its magnitude equals `modulus[i]`,
/// keeping the phase. A zero-magnitude value is left unchanged (the divisor
/// is forced to 1) to avoid producing NaN.
#[inline]
pub fn apply_modulus(data: &mut [Complex32], modulus: &[f32]) {
    debug_assert_eq!(data.len(), modulus.len());
    for (z, &m) in data.iter_mut().zip(modulus) {
        let mut norm = (z.re * z.re + z.im * z.im).sqrt();
        if norm == 0.0 {
            norm = 1.0;
        }
        let factor = m / norm;
        z.re *= factor;
        z.im *= factor;
    }
}

/// `data[i] = data[i] < threshold ? lower_value : upper_value`.
///
/// The comparison is strict, so values exactly at the threshold take
/// `upper_value`.
#[inline]
pub fn cutoff(data: &mut [f32], threshold: f32, lower_value: f32, upper_value: f32) {
    for v in data.iter_mut() {
        *v = if *v < threshold { lower_value } else { upper_value };
    }
}

/// The HIO update rule. Outside the support (`is_masked[i] == 1`) and in
/// negative-real regions the previous iterate receives negative feedback,
/// everywhere else it adopts the current estimate:
///
/// `g[i] -= beta * g'[i]` if masked or `g'[i].re < 0`, else `g[i] = g'[i]`.
#[inline]
pub fn apply_hio_domain_constraints(
    gprevious: &mut [Complex32],
    gprime: &[Complex32],
    is_masked: &[f32],
    hio_beta: f32,
) {
    debug_assert_eq!(gprevious.len(), gprime.len());
    debug_assert_eq!(gprevious.len(), is_masked.len());
    for ((g, &cur), &m) in gprevious.iter_mut().zip(gprime).zip(is_masked) {
        if m == 1.0 || cur.re < 0.0 {
            g.re -= hio_beta * cur.re;
            g.im -= hio_beta * cur.im;
        } else {
            *g = cur;
        }
    }
}
