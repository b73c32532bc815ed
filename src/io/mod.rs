//! Job submission layer: the write-out callback contract and the task queue
//! multiplexing independent reconstructions over worker slots.

pub mod task_queue;
pub mod write_out;

pub use task_queue::{SlotRing, TaskQueue, TaskQueueError};
pub use write_out::{noop, WriteOutCallback};
