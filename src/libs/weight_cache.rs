//! # Gaussian Weight Cache
//!
//! Bounded cache of Gaussian kernels keyed by sigma, mirroring the device
//! constant-memory region the horizontal blur kernel reads from. Lookup is
//! an exact `f32` match on purpose: the sigma decay recurrence of the
//! Shrink-Wrap driver produces values from a small discrete set, so the same
//! keys recur bit-identically.
//!
//! Capacity is [`MAX_KERNELS`] entries of at most [`MAX_WEIGHTS`] weights
//! each. A lookup that would exceed the capacity clears the whole cache and
//! starts over; mutation is expected to be serialized by the caller (the
//! task queue holds its mutex across every blur).

use crate::libs::gaussian::{calc_gaussian_weights, GaussianError};

/// Maximum number of cached kernels.
pub const MAX_KERNELS: usize = 20;
/// Maximum weight count per kernel (bounds the usable sigma).
pub const MAX_WEIGHTS: usize = 50;

/// Outcome of a [`WeightCache::lookup`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSlot {
    /// Slot index; weights live at `slot * MAX_WEIGHTS` in the region.
    pub slot: usize,
    /// True when the kernel was computed and stored by this lookup.
    pub inserted: bool,
    /// True when this lookup had to clear a full cache first.
    pub cleared: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum WeightCacheError {
    #[error(transparent)]
    Gaussian(#[from] GaussianError),

    #[error("weight cache: kernel for sigma {sigma} needs {len} weights, limit is {limit}")]
    KernelTooWide { sigma: f32, len: usize, limit: usize },
}

struct CacheEntry {
    sigma: f32,
    len: usize,
}

/// Host-side bookkeeping plus the flat weight region uploaded to the device.
pub struct WeightCache {
    entries: Vec<CacheEntry>,
    region: Box<[f32; MAX_KERNELS * MAX_WEIGHTS]>,
    clear_count: u64,
}

impl Default for WeightCache {
    fn default() -> Self {
        Self::new()
    }
}

impl WeightCache {
    pub fn new() -> Self {
        Self {
            entries: Vec::with_capacity(MAX_KERNELS),
            region: Box::new([0.0f32; MAX_KERNELS * MAX_WEIGHTS]),
            clear_count: 0,
        }
    }

    /// Returns the slot holding the kernel for `sigma`, computing and
    /// storing it on a miss. Clears the whole cache first when full.
    pub fn lookup(&mut self, sigma: f32) -> Result<CacheSlot, WeightCacheError> {
        if let Some(slot) = self.entries.iter().position(|e| e.sigma == sigma) {
            return Ok(CacheSlot {
                slot,
                inserted: false,
                cleared: false,
            });
        }

        let weights = calc_gaussian_weights(sigma)?;
        if weights.len() > MAX_WEIGHTS {
            return Err(WeightCacheError::KernelTooWide {
                sigma,
                len: weights.len(),
                limit: MAX_WEIGHTS,
            });
        }

        let cleared = self.entries.len() == MAX_KERNELS;
        if cleared {
            if cfg!(debug_assertions) {
                eprintln!(
                    "[diffrec] weight cache full ({} sigmas), clearing",
                    self.entries.len()
                );
            }
            self.clear();
        }

        let slot = self.entries.len();
        let base = slot * MAX_WEIGHTS;
        self.region[base..base + weights.len()].copy_from_slice(&weights);
        self.region[base + weights.len()..base + MAX_WEIGHTS].fill(0.0);
        self.entries.push(CacheEntry {
            sigma,
            len: weights.len(),
        });

        Ok(CacheSlot {
            slot,
            inserted: true,
            cleared,
        })
    }

    /// Weights stored in `slot`, trimmed to the kernel length.
    pub fn weights(&self, slot: usize) -> &[f32] {
        let len = self.entries[slot].len;
        &self.region[slot * MAX_WEIGHTS..slot * MAX_WEIGHTS + len]
    }

    /// The full flat region, sized `MAX_KERNELS * MAX_WEIGHTS`, in the
    /// layout the device constant memory expects.
    pub fn region(&self) -> &[f32; MAX_KERNELS * MAX_WEIGHTS] {
        &self.region
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How many times the cache has been cleared because it overflowed.
    pub fn clear_count(&self) -> u64 {
        self.clear_count
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.clear_count += 1;
    }
}
