// Integration tests for the CUDA kernels against the CPU reference

#[cfg(feature = "cuda")]
use diffrec::cuda::cust::memory::{CopyDestination, DeviceBuffer};
#[cfg(feature = "cuda")]
use diffrec::algorithms::shrink_wrap::{shrink_wrap, ShrinkWrapParams};
#[cfg(feature = "cuda")]
use diffrec::algorithms::vector_reduce::{
    calculate_hio_error, vector_max_f32, vector_min_f32, vector_sum_f32,
};
#[cfg(feature = "cuda")]
use diffrec::cuda::{
    cuda_available, CuComplex, CudaElementwise, CudaGaussian, CudaReduce, CudaShrinkWrap,
};
#[cfg(feature = "cuda")]
use diffrec::libs::gaussian::gaussian_blur;
#[cfg(feature = "cuda")]
use num_complex::Complex32;

#[test]
fn cuda_feature_off_noop() {
    #[cfg(not(feature = "cuda"))]
    {
        assert!(!diffrec::cuda::cuda_available());
    }
}

#[cfg(feature = "cuda")]
fn sample(n: usize, mut state: u32) -> Vec<f32> {
    (0..n)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            (state >> 8) as f32 / (1u32 << 24) as f32 - 0.5
        })
        .collect()
}

#[cfg(feature = "cuda")]
#[test]
fn reduce_cuda_matches_cpu() -> Result<(), Box<dyn std::error::Error>> {
    if !cuda_available() {
        eprintln!("[reduce_cuda_matches_cpu] skipped - no CUDA device");
        return Ok(());
    }

    let data = sample(1 << 18, 0x2545f491);
    let cuda = CudaReduce::new(0)?;
    let d_data = DeviceBuffer::from_slice(&data)?;

    assert_eq!(cuda.min_f32(&d_data)?, vector_min_f32(&data));
    assert_eq!(cuda.max_f32(&d_data)?, vector_max_f32(&data));

    let gpu_sum = cuda.sum_f32(&d_data)?;
    let cpu_sum = vector_sum_f32(&data);
    let magnitude: f32 = data.iter().map(|v| v.abs()).sum();
    let tolerance = magnitude * (data.len() as f32).sqrt() * f32::EPSILON;
    assert!(
        (gpu_sum - cpu_sum).abs() <= tolerance,
        "gpu {gpu_sum} vs cpu {cpu_sum}"
    );

    // double precision path
    let data64: Vec<f64> = data.iter().map(|&v| v as f64).collect();
    let d_data64 = DeviceBuffer::from_slice(&data64)?;
    assert_eq!(
        cuda.min_f64(&d_data64)?,
        data64.iter().copied().fold(f64::INFINITY, f64::min)
    );
    assert_eq!(
        cuda.max_f64(&d_data64)?,
        data64.iter().copied().fold(f64::NEG_INFINITY, f64::max)
    );
    Ok(())
}

#[cfg(feature = "cuda")]
#[test]
fn hio_error_cuda_matches_cpu() -> Result<(), Box<dyn std::error::Error>> {
    if !cuda_available() {
        eprintln!("[hio_error_cuda_matches_cpu] skipped - no CUDA device");
        return Ok(());
    }

    let n = 1 << 16;
    let re = sample(n, 0x9e3779b9);
    let im = sample(n, 0x85ebca6b);
    let selector = sample(n, 0xc2b2ae35);

    let host: Vec<Complex32> = re
        .iter()
        .zip(&im)
        .map(|(&a, &b)| Complex32::new(a, b))
        .collect();
    let device: Vec<CuComplex> = host.iter().map(|z| CuComplex::new(z.re, z.im)).collect();
    let mask: Vec<f32> = selector
        .iter()
        .map(|&s| if s > 0.0 { 1.0 } else { 0.0 })
        .collect();

    let cuda = CudaReduce::new(0)?;
    let d_data = DeviceBuffer::from_slice(&device)?;
    let d_mask = DeviceBuffer::from_slice(&mask)?;

    for invert in [false, true] {
        let gpu = cuda.hio_error_f32(&d_data, &d_mask, invert)?;
        let cpu = calculate_hio_error(&host, &mask, invert);
        assert!(
            (gpu - cpu).abs() <= 1e-5 * cpu.max(1e-3),
            "invert={invert}: gpu {gpu} vs cpu {cpu}"
        );
    }
    Ok(())
}

#[cfg(feature = "cuda")]
#[test]
fn elementwise_cuda_matches_cpu() -> Result<(), Box<dyn std::error::Error>> {
    if !cuda_available() {
        eprintln!("[elementwise_cuda_matches_cpu] skipped - no CUDA device");
        return Ok(());
    }

    let n = 4096;
    let reals = sample(n, 0x27d4eb2f);
    let cuda = CudaElementwise::new(0)?;

    // copy_to_real then copy_from_real round-trips
    let d_reals = DeviceBuffer::from_slice(&reals)?;
    let mut d_complex: DeviceBuffer<CuComplex> =
        DeviceBuffer::from_slice(&vec![CuComplex::default(); n])?;
    cuda.copy_to_real(&mut d_complex, &d_reals)?;
    let mut d_back: DeviceBuffer<f32> = DeviceBuffer::from_slice(&vec![0.0f32; n])?;
    cuda.copy_from_real(&mut d_back, &d_complex)?;
    let mut back = vec![0.0f32; n];
    d_back.copy_to(&mut back)?;
    assert_eq!(back, reals);

    // cutoff leaves only the two fill values, strict comparison
    let mut d_cut = DeviceBuffer::from_slice(&reals)?;
    cuda.cutoff(&mut d_cut, 0.1, 1.0, 0.0)?;
    let mut cut = vec![0.0f32; n];
    d_cut.copy_to(&mut cut)?;
    for (c, &v) in cut.iter().zip(&reals) {
        assert_eq!(*c, if v < 0.1 { 1.0 } else { 0.0 });
    }

    // modulus replacement fixes magnitudes, zero magnitude stays zero
    let host: Vec<CuComplex> = sample(2 * n, 0x165667b1)
        .chunks(2)
        .map(|c| CuComplex::new(c[0], c[1]))
        .collect();
    let modulus: Vec<f32> = sample(n, 0xd3a2646c).iter().map(|v| v.abs() + 0.1).collect();
    let mut d_z = DeviceBuffer::from_slice(&host)?;
    let d_modulus = DeviceBuffer::from_slice(&modulus)?;
    cuda.apply_modulus(&mut d_z, &d_modulus)?;
    let mut z = vec![CuComplex::default(); n];
    d_z.copy_to(&mut z)?;
    for (v, &m) in z.iter().zip(&modulus) {
        assert!((v.norm() - m).abs() <= 1e-5 * m.max(1.0));
    }
    Ok(())
}

#[cfg(feature = "cuda")]
#[test]
fn gaussian_blur_cuda_matches_cpu() -> Result<(), Box<dyn std::error::Error>> {
    if !cuda_available() {
        eprintln!("[gaussian_blur_cuda_matches_cpu] skipped - no CUDA device");
        return Ok(());
    }

    let (w, h) = (127, 65); // off-aligned on purpose
    let host = sample(w * h, 0x2545f491);
    let mut cuda = CudaGaussian::new(0)?;

    for &sigma in &[1.5f32, 2.0, 3.0] {
        let mut reference = host.clone();
        gaussian_blur(&mut reference, w, h, sigma)?;

        let mut d_data = DeviceBuffer::from_slice(&host)?;
        cuda.blur(&mut d_data, w, h, sigma)?;
        let mut gpu = vec![0.0f32; w * h];
        d_data.copy_to(&mut gpu)?;

        for (i, (a, b)) in gpu.iter().zip(&reference).enumerate() {
            assert!(
                (a - b).abs() <= 1e-4,
                "sigma {sigma} pixel {i}: gpu {a} vs cpu {b}"
            );
        }
    }
    // three sigmas, three cache slots, no clear
    assert_eq!(cuda.cache().len(), 3);
    assert_eq!(cuda.cache().clear_count(), 0);
    Ok(())
}

#[cfg(feature = "cuda")]
#[test]
fn weight_cache_overflow_is_transparent() -> Result<(), Box<dyn std::error::Error>> {
    if !cuda_available() {
        eprintln!("[weight_cache_overflow_is_transparent] skipped - no CUDA device");
        return Ok(());
    }

    // 21 distinct sigmas against a 20-slot cache: one clear, identical
    // results before and after
    let (w, h) = (64, 64);
    let host = sample(w * h, 0x9e3779b9);
    let mut cuda = CudaGaussian::new(0)?;

    let sigmas: Vec<f32> = (0..21).map(|i| 1.5 + 0.05 * i as f32).collect();
    let mut first_pass = Vec::new();
    for &sigma in &sigmas {
        let mut d_data = DeviceBuffer::from_slice(&host)?;
        cuda.blur(&mut d_data, w, h, sigma)?;
        let mut out = vec![0.0f32; w * h];
        d_data.copy_to(&mut out)?;
        first_pass.push(out);
    }
    assert_eq!(cuda.cache().clear_count(), 1);

    // every sigma still produces bit-identical output on a fresh engine
    let mut fresh = CudaGaussian::new(0)?;
    for (&sigma, expected) in sigmas.iter().zip(&first_pass) {
        let mut d_data = DeviceBuffer::from_slice(&host)?;
        fresh.blur(&mut d_data, w, h, sigma)?;
        let mut out = vec![0.0f32; w * h];
        d_data.copy_to(&mut out)?;
        assert_eq!(&out, expected, "sigma {sigma} must be cache-independent");
    }
    Ok(())
}

#[cfg(feature = "cuda")]
#[test]
fn shrink_wrap_cuda_matches_cpu() -> Result<(), Box<dyn std::error::Error>> {
    if !cuda_available() {
        eprintln!("[shrink_wrap_cuda_matches_cpu] skipped - no CUDA device");
        return Ok(());
    }

    let (w, h) = (64, 64);
    let mut object = vec![0.0f32; w * h];
    for row in 0..h {
        for col in 0..w {
            let dy = row.min(h - row) as f32;
            let dx = col.min(w - col) as f32;
            object[row * w + col] = 1e-4 * (-(dx * dx + dy * dy) / 8.0).exp();
        }
    }
    // measured magnitude via the CPU transform
    let mut planner = rustfft::FftPlanner::new();
    let forward = diffrec::algorithms::shrink_wrap::Fft2d::new(
        &mut planner,
        w,
        h,
        rustfft::FftDirection::Forward,
    );
    let mut freq: Vec<Complex32> = object.iter().map(|&v| Complex32::new(v, 0.0)).collect();
    forward.process(&mut freq);
    let intensity: Vec<f32> = freq.iter().map(|z| z.norm()).collect();

    let params = ShrinkWrapParams {
        target_error: Some(1e-3),
        ..Default::default()
    };

    let mut cpu_result = intensity.clone();
    let cpu_error = shrink_wrap(&mut cpu_result, w, h, &params)?;

    let mut engine = CudaShrinkWrap::new(0)?;
    let mut gpu_result = intensity;
    let gpu_error = engine.reconstruct(&mut gpu_result, w, h, &params)?;

    assert!(cpu_error < 1e-3 && gpu_error < 1e-3);
    // FFT backends differ, so compare reconstructions loosely
    let peak = cpu_result.iter().cloned().fold(0.0f32, f32::max);
    for (a, b) in gpu_result.iter().zip(&cpu_result) {
        assert!((a - b).abs() <= 1e-2 * peak.max(1e-6));
    }
    Ok(())
}

#[cfg(feature = "cuda")]
#[test]
fn cuda_queue_round_robin_and_completion() -> Result<(), Box<dyn std::error::Error>> {
    use diffrec::cuda::TaskQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    if !cuda_available() {
        eprintln!("[cuda_queue_round_robin_and_completion] skipped - no CUDA device");
        return Ok(());
    }

    let mut queue = TaskQueue::new()?;
    let slots = queue.slot_count();
    assert!(slots > 0);
    assert_eq!(queue.slot_devices().len(), slots);

    let fired = Arc::new(AtomicUsize::new(0));
    let (w, h) = (32, 32);
    // submit more jobs than slots so saturation joins the oldest worker
    let jobs = slots.min(8) * 4;
    for job in 0..jobs {
        let fired = Arc::clone(&fired);
        queue.add_task(
            vec![0.5f32; w * h],
            (w, h),
            ShrinkWrapParams {
                cycles: Some(1),
                hio_cycles: Some(1),
                ..Default::default()
            },
            Arc::new(move |data, width, height, _name| {
                assert_eq!(data.len(), width * height);
                fired.fetch_add(1, Ordering::SeqCst);
            }),
            format!("job-{job}"),
        );
    }
    queue.deinit();
    assert_eq!(fired.load(Ordering::SeqCst), jobs);
    Ok(())
}
