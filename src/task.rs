//! Cross-thread task queue drained by the owning event loop.
//!
//! Lock-free FIFO; a drain only runs the tasks present when it started, so a
//! task that queues another cannot starve the poll phase.

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam::queue::SegQueue;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
pub struct TaskQueue {
    queue: SegQueue<Task>,
    draining: AtomicBool,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, task: Task) {
        self.queue.push(task);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// True while [`run_pending`](Self::run_pending) is executing tasks.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Runs the tasks queued so far, in FIFO order. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        self.draining.store(true, Ordering::Release);
        let batch = self.queue.len();
        let mut ran = 0;
        for _ in 0..batch {
            match self.queue.pop() {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => break,
            }
        }
        self.draining.store(false, Ordering::Release);
        ran
    }
}
