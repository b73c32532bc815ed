// CPU task-queue integration: submission, saturation, callback contract

use diffrec::algorithms::shrink_wrap::ShrinkWrapParams;
use diffrec::io::task_queue::{SlotRing, TaskQueue};
use diffrec::io::write_out::WriteOutCallback;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

#[test]
fn round_robin_covers_every_slot_equally() {
    // with S slots and 4*S dequeues, every slot serves exactly 4 times,
    // in submission order
    for slots in [1usize, 2, 3, 8] {
        let mut ring = SlotRing::new((0..slots).collect::<Vec<_>>());
        let mut served = vec![0usize; slots];
        for i in 0..4 * slots {
            let slot = *ring.rotate().unwrap();
            assert_eq!(slot, i % slots);
            served[slot] += 1;
        }
        assert!(served.iter().all(|&count| count == 4));
    }
}

#[test]
fn queue_saturation_runs_every_job_exactly_once() {
    let mut queue = TaskQueue::with_slots(4).unwrap();
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let (w, h) = (12, 10);
    let jobs = queue.slot_count() * 4;
    for job in 0..jobs {
        let seen = Arc::clone(&seen);
        let callback: WriteOutCallback = Arc::new(move |data, width, height, name| {
            assert_eq!((width, height), (12, 10));
            assert_eq!(data.len(), width * height);
            assert!(data.iter().all(|v| v.is_finite()));
            seen.lock().unwrap().push(name.to_string());
        });
        queue.add_task(
            vec![0.25f32; w * h],
            (w, h),
            ShrinkWrapParams {
                cycles: Some(2),
                hio_cycles: Some(2),
                ..Default::default()
            },
            callback,
            format!("frame-{job:03}"),
        );
    }
    queue.deinit();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), jobs);
    let unique: HashSet<&String> = seen.iter().collect();
    assert_eq!(unique.len(), jobs, "every job fires its callback exactly once");
}

#[test]
fn default_queue_uses_available_parallelism() {
    let queue = TaskQueue::new().unwrap();
    assert!(queue.slot_count() >= 1);
}
