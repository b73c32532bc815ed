//! CPU implementations of the Shrink-Wrap primitives and driver. These are
//! the correctness reference for the CUDA wrappers and the fallback path on
//! hosts without a device.

pub mod shrink_wrap;
pub mod vector_elementwise;
pub mod vector_reduce;

pub use shrink_wrap::{shrink_wrap, ShrinkWrapError, ShrinkWrapParams};
