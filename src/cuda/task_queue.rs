//! # Task Queue (CUDA)
//!
//! Multiplexes independent reconstructions over every (device, stream) pair
//! the host offers: one stream per multiprocessor of each device, so a
//! multi-GPU machine is saturated by submitting enough jobs.
//!
//! Dispatch follows the CPU queue in `io::task_queue`: slots rotate FIFO
//! round-robin through the shared [`SlotRing`]; one coarse mutex serializes
//! slot selection and the reconstruction call and is released before the
//! write-out callback; the worker pool is bounded by the slot count, with
//! submission joining the oldest worker once saturated.
//!
//! Each slot owns a full [`CudaShrinkWrap`] engine, so its weight cache and
//! constant-memory region persist across the jobs that land on it.

#![cfg(feature = "cuda")]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use cust::context::{Context, CurrentContext};
use cust::device::{Device, DeviceAttribute};
use cust::prelude::*;
use cust::stream::{Stream, StreamFlags};
use thiserror::Error;

use crate::algorithms::shrink_wrap::ShrinkWrapParams;
use crate::cuda::shrink_wrap_wrapper::{CudaShrinkWrap, CudaShrinkWrapError};
use crate::io::task_queue::SlotRing;
use crate::io::write_out::WriteOutCallback;

#[derive(Error, Debug)]
pub enum TaskQueueError {
    #[error("CUDA error: {0}")]
    Cuda(#[from] cust::error::CudaError),
    #[error(transparent)]
    Engine(#[from] CudaShrinkWrapError),
    #[error("no CUDA device available")]
    NoDevice,
    #[error("device {device} reports no multiprocessors")]
    NoMultiprocessors { device: u32 },
}

struct StreamSlot {
    device_id: u32,
    engine: CudaShrinkWrap,
}

struct QueueShared {
    // one lock for slot selection and the whole reconstruction call
    slots: Mutex<SlotRing<StreamSlot>>,
}

// Slots only move between threads under the queue mutex; the engine binds
// its context on whichever worker runs the job.
unsafe impl Send for QueueShared {}
unsafe impl Sync for QueueShared {}

/// Bounded-pool task queue running the CUDA Shrink-Wrap driver.
pub struct TaskQueue {
    shared: Arc<QueueShared>,
    workers: VecDeque<JoinHandle<()>>,
    capacity: usize,
}

impl TaskQueue {
    /// Enumerates every device and creates one stream slot per
    /// multiprocessor. Fails when no device (or an SM-less device) is
    /// found.
    pub fn new() -> Result<Self, TaskQueueError> {
        cust::init(CudaFlags::empty())?;
        let device_count = Device::num_devices()?;
        if device_count == 0 {
            return Err(TaskQueueError::NoDevice);
        }

        let mut slots = Vec::new();
        for device_id in 0..device_count {
            let device = Device::get_device(device_id)?;
            let multiprocessors =
                device.get_attribute(DeviceAttribute::MultiprocessorCount)?;
            if multiprocessors <= 0 {
                return Err(TaskQueueError::NoMultiprocessors { device: device_id });
            }
            let context = Arc::new(Context::new(device)?);
            CurrentContext::set_current(context.as_ref())?;
            for _ in 0..multiprocessors {
                let stream = Stream::new(StreamFlags::NON_BLOCKING, None)?;
                let engine = CudaShrinkWrap::from_parts(Arc::clone(&context), device_id, stream)?;
                slots.push(StreamSlot { device_id, engine });
            }
        }

        let capacity = slots.len();
        Ok(Self {
            shared: Arc::new(QueueShared {
                slots: Mutex::new(SlotRing::new(slots)),
            }),
            workers: VecDeque::with_capacity(capacity),
            capacity,
        })
    }

    /// Total stream slots, summed over all devices.
    pub fn slot_count(&self) -> usize {
        self.capacity
    }

    /// Submits a reconstruction job.
    ///
    /// Non-blocking while the pool has capacity; once saturated it joins
    /// the oldest worker first. The job owns `intensity` and hands it to
    /// `write_out` when the reconstruction finishes; a failed job logs the
    /// error and never invokes the callback.
    pub fn add_task(
        &mut self,
        intensity: Vec<f32>,
        dimensions: (usize, usize),
        params: ShrinkWrapParams,
        write_out: WriteOutCallback,
        name: impl Into<String>,
    ) {
        if self.workers.len() >= self.capacity {
            if let Some(oldest) = self.workers.pop_front() {
                if oldest.join().is_err() {
                    eprintln!("[diffrec] task queue: dropping worker that panicked");
                }
            }
        }

        let shared = Arc::clone(&self.shared);
        let name = name.into();
        let (width, height) = dimensions;
        let handle = std::thread::spawn(move || {
            let mut intensity = intensity;
            let result = {
                let mut slots = shared.slots.lock().expect("task queue lock poisoned");
                let slot = slots.rotate().expect("task queue has no slots");
                match slot.engine.bind() {
                    Ok(()) => slot
                        .engine
                        .reconstruct(&mut intensity, width, height, &params),
                    Err(e) => Err(e),
                }
                // lock drops here, before the callback
            };
            match result {
                Ok(_) => write_out(&intensity, width, height, &name),
                Err(e) => eprintln!("[diffrec] task '{name}' failed: {e}"),
            }
        });
        self.workers.push_back(handle);
    }

    /// Joins every outstanding worker and destroys the stream slots.
    pub fn deinit(&mut self) {
        while let Some(worker) = self.workers.pop_front() {
            if worker.join().is_err() {
                eprintln!("[diffrec] task queue: worker panicked during teardown");
            }
        }
        if let Ok(mut slots) = self.shared.slots.lock() {
            slots.drain();
        }
    }

    /// Devices backing the queue, one entry per slot, in current ring
    /// order (head first).
    pub fn slot_devices(&self) -> Vec<u32> {
        match self.shared.slots.lock() {
            Ok(ring) => ring.iter().map(|s| s.device_id).collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.deinit();
    }
}
