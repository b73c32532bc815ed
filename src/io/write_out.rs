//! Write-out callback contract.
//!
//! A queue job finishes by invoking the caller-supplied callback with the
//! reconstructed buffer, its dimensions and the opaque identifier the task
//! was submitted under (typically a file name). The buffer is only borrowed
//! for the duration of the call; a callback that wants to keep the data
//! must copy it. Callbacks from different workers run concurrently and
//! without any queue lock held, so their thread safety is the caller's
//! concern.

use std::sync::Arc;

/// Shared, thread-safe write-out callback.
pub type WriteOutCallback = Arc<dyn Fn(&[f32], usize, usize, &str) + Send + Sync>;

/// A callback that discards the result. Useful for benchmarks and for
/// draining a queue in tests.
pub fn noop() -> WriteOutCallback {
    Arc::new(|_data, _width, _height, _name| {})
}
