//! # Task Queue (CPU)
//!
//! Accepts independent reconstruction jobs and dispatches them across a
//! fixed set of worker slots, rotated FIFO round-robin on every dequeue.
//! The thread pool is bounded by the slot count: submission is non-blocking
//! while capacity remains and joins the oldest worker once saturated.
//!
//! One coarse mutex serializes slot selection and the reconstruction call
//! itself; it is released before the write-out callback runs, so callbacks
//! from different workers execute concurrently.
//!
//! The CUDA variant of this queue lives in `cuda::task_queue` and replaces
//! worker slots with (device, stream) descriptors; the rotation logic here
//! is shared through [`SlotRing`].

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use thiserror::Error;

use crate::algorithms::shrink_wrap::{shrink_wrap, ShrinkWrapParams};
use crate::io::write_out::WriteOutCallback;

/// FIFO ring of worker slots. `rotate` pops the head, pushes it to the
/// back, and hands out a mutable borrow of it, which yields strict
/// round-robin assignment over successive calls.
pub struct SlotRing<T> {
    items: VecDeque<T>,
}

impl<T> SlotRing<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: items.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Pops the head slot, reappends it, and returns it borrowed.
    pub fn rotate(&mut self) -> Option<&mut T> {
        let head = self.items.pop_front()?;
        self.items.push_back(head);
        self.items.back_mut()
    }

    /// Drains the ring, handing ownership of the slots back.
    pub fn drain(&mut self) -> Vec<T> {
        self.items.drain(..).collect()
    }

    /// Slots in current ring order, head first.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[derive(Debug, Error)]
pub enum TaskQueueError {
    #[error("task queue: no worker slots available")]
    NoSlots,
}

struct QueueShared {
    // one lock for slot selection and the whole reconstruction call
    slots: Mutex<SlotRing<usize>>,
}

/// Bounded-pool task queue running the CPU Shrink-Wrap driver.
pub struct TaskQueue {
    shared: Arc<QueueShared>,
    workers: VecDeque<JoinHandle<()>>,
    capacity: usize,
}

impl TaskQueue {
    /// Builds one worker slot per logical CPU.
    pub fn new() -> Result<Self, TaskQueueError> {
        let slots = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::with_slots(slots)
    }

    /// Builds a queue over an explicit number of slots.
    pub fn with_slots(slots: usize) -> Result<Self, TaskQueueError> {
        if slots == 0 {
            return Err(TaskQueueError::NoSlots);
        }
        Ok(Self {
            shared: Arc::new(QueueShared {
                slots: Mutex::new(SlotRing::new((0..slots).collect())),
            }),
            workers: VecDeque::with_capacity(slots),
            capacity: slots,
        })
    }

    pub fn slot_count(&self) -> usize {
        self.capacity
    }

    /// Submits a reconstruction job.
    ///
    /// Non-blocking while the pool has capacity; once saturated it joins
    /// the oldest worker first. The job owns `intensity` and hands it to
    /// `write_out` when the reconstruction finishes. A failed job logs the
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
                let _slot = slots.rotate().expect("task queue has no slots");
                shrink_wrap(&mut intensity, width, height, &params)
                // lock drops here, before the callback
            };
            match result {
                Ok(_) => write_out(&intensity, width, height, &name),
                Err(e) => eprintln!("[diffrec] task '{name}' failed: {e}"),
            }
        });
        self.workers.push_back(handle);
    }

    /// Joins every outstanding worker. Called by `Drop` as well; explicit
    /// use gives deterministic teardown points.
    pub fn deinit(&mut self) {
        while let Some(worker) = self.workers.pop_front() {
            if worker.join().is_err() {
                eprintln!("[diffrec] task queue: worker panicked during teardown");
            }
        }
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        self.deinit();
    }
}
