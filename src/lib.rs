//! # diffrec
//!
//! Reconstruction of a real-valued 2-D object from a measured diffraction
//! intensity pattern (its Fourier magnitude) whose phase has been lost,
//! using the Shrink-Wrap variant of Fienup's Hybrid Input-Output (HIO)
//! algorithm.
//!
//! The crate ships two backends:
//!
//! - [`algorithms`] - a portable CPU implementation (rustfft + rayon) that
//!   doubles as the correctness reference in tests,
//! - [`cuda`] - cust-based device wrappers around the PTX kernels under
//!   `kernels/`, compiled in only with the `cuda` cargo feature.
//!
//! Image I/O, CLI handling and visualization are out of scope: the library
//! consumes raw `f32` buffers and invokes a caller-supplied write-out
//! callback (see [`io`]).

pub mod algorithms;
pub mod io;
pub mod libs;

#[cfg(feature = "cuda")]
pub mod cuda;

#[cfg(not(feature = "cuda"))]
pub mod cuda {
    /// Returns true if a CUDA device is available and the driver API can be
    /// initialized. Always false without the `cuda` feature.
    #[inline]
    pub fn cuda_available() -> bool {
        false
    }

    /// Returns the number of CUDA devices available (0 when disabled).
    #[inline]
    pub fn cuda_device_count() -> usize {
        0
    }
}
