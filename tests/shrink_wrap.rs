// End-to-end tests for the CPU Shrink-Wrap driver

use diffrec::algorithms::shrink_wrap::{
    decay_sigma, shrink_wrap, Fft2d, ShrinkWrapBuilder, ShrinkWrapParams, SIGMA_FLOOR,
};
use diffrec::algorithms::vector_elementwise::cutoff;
use diffrec::algorithms::vector_reduce::vector_max_f32;
use diffrec::libs::gaussian::gaussian_blur;
use num_complex::Complex32;
use rustfft::{FftDirection, FftPlanner};

/// Compact, even-symmetric object centered on the origin (with wraparound),
/// so its transform is real and non-negative and the measured magnitude
/// carries a consistent phase.
fn test_object(width: usize, height: usize, spread: f32, peak: f32) -> Vec<f32> {
    let mut obj = vec![0.0f32; width * height];
    for row in 0..height {
        for col in 0..width {
            let dy = row.min(height - row) as f32;
            let dx = col.min(width - col) as f32;
            obj[row * width + col] = peak * (-(dx * dx + dy * dy) / (2.0 * spread * spread)).exp();
        }
    }
    obj
}

fn magnitude_of(object: &[f32], width: usize, height: usize) -> Vec<f32> {
    let mut planner = FftPlanner::new();
    let forward = Fft2d::new(&mut planner, width, height, FftDirection::Forward);
    let mut freq: Vec<Complex32> = object.iter().map(|&v| Complex32::new(v, 0.0)).collect();
    forward.process(&mut freq);
    freq.iter().map(|z| z.norm()).collect()
}

fn correlation(a: &[f32], b: &[f32]) -> f32 {
    let n = a.len() as f32;
    let mean_a: f32 = a.iter().sum::<f32>() / n;
    let mean_b: f32 = b.iter().sum::<f32>() / n;
    let mut cov = 0.0f32;
    let mut var_a = 0.0f32;
    let mut var_b = 0.0f32;
    for (&x, &y) in a.iter().zip(b) {
        cov += (x - mean_a) * (y - mean_b);
        var_a += (x - mean_a) * (x - mean_a);
        var_b += (y - mean_b) * (y - mean_b);
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

#[test]
fn identity_reconstruction_128() {
    let (w, h) = (128, 128);
    let object = test_object(w, h, 3.0, 1e-4);
    let mut intensity = magnitude_of(&object, w, h);

    let error = shrink_wrap(
        &mut intensity,
        w,
        h,
        &ShrinkWrapParams {
            target_error: Some(1e-3),
            ..Default::default()
        },
    )
    .expect("reconstruction failed");

    assert!(error < 1e-3, "did not converge within 20 cycles: error {error}");
    let corr = correlation(&intensity, &object);
    assert!(corr > 0.95, "correlation with the object is {corr}");
}

#[test]
fn mask_threshold_marks_weak_pixels_as_outside() {
    // scenario: blur a known array, then assert the binary mask is 1
    // exactly where the blurred value fell below fraction * max
    let (w, h) = (48, 32);
    let mut data = test_object(w, h, 4.0, 1.0);
    gaussian_blur(&mut data, w, h, 2.0).unwrap();

    let blurred = data.clone();
    let abs_max = vector_max_f32(&blurred);
    let fraction = 0.2f32;
    cutoff(&mut data, fraction * abs_max, 1.0, 0.0);

    for (i, (&mask, &value)) in data.iter().zip(&blurred).enumerate() {
        assert!(mask == 0.0 || mask == 1.0);
        if value < fraction * abs_max {
            assert_eq!(mask, 1.0, "pixel {i} below threshold must be outside");
        } else {
            assert_eq!(mask, 0.0, "pixel {i} at/above threshold must be inside");
        }
    }
}

#[test]
fn sigma_decay_reaches_floor_after_500_updates() {
    let mut sigma = 3.0f32;
    for _ in 0..500 {
        let next = decay_sigma(sigma, 0.01);
        assert!(next <= sigma);
        assert!(next >= SIGMA_FLOOR);
        sigma = next;
    }
    assert_eq!(sigma, 1.5);
}

#[test]
fn builder_overrides_compose_with_defaults() {
    let (w, h) = (16, 16);
    let object = test_object(w, h, 1.5, 1e-4);
    let mut intensity = magnitude_of(&object, w, h);

    // tiny run: a single outer cycle with one HIO pass still succeeds and
    // overwrites the buffer with a finite reconstruction
    let error = ShrinkWrapBuilder::new()
        .cycles(1)
        .hio_cycles(1)
        .apply(&mut intensity, w, h)
        .unwrap();
    assert!(error.is_finite());
    assert!(intensity.iter().all(|v| v.is_finite()));
}
