//! Timers ordered by `(due, sequence)` in a min-heap.
//!
//! Cancellation only flips an atomic flag, so it is safe from any thread; the
//! queue drops canceled entries the next time it sweeps past them.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

/// Repeat count for a timer that fires until canceled.
pub const REPEAT_FOREVER: i64 = -1;

pub type TimerCallback = Box<dyn FnMut() + Send + 'static>;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Handle returned when scheduling; cancel through it from any thread.
#[derive(Clone)]
pub struct TimerId {
    sequence: u64,
    canceled: Arc<AtomicBool>,
}

impl TimerId {
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Release);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

impl fmt::Debug for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerId")
            .field("sequence", &self.sequence)
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

pub struct Timer {
    due: Instant,
    interval: Duration,
    /// `-1` forever, `0` spent, `N > 0` firings left.
    repeats_remaining: i64,
    sequence: u64,
    canceled: Arc<AtomicBool>,
    callback: TimerCallback,
}

impl Timer {
    pub fn new(due: Instant, interval: Duration, repeats: i64, callback: TimerCallback) -> Self {
        Self {
            due,
            interval,
            repeats_remaining: repeats,
            sequence: NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed),
            canceled: Arc::new(AtomicBool::new(false)),
            callback,
        }
    }

    pub fn id(&self) -> TimerId {
        TimerId {
            sequence: self.sequence,
            canceled: self.canceled.clone(),
        }
    }

    pub fn due(&self) -> Instant {
        self.due
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn repeats_remaining(&self) -> i64 {
        self.repeats_remaining
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Fires the callback and counts down a finite repeat budget.
    pub fn run(&mut self) {
        (self.callback)();
        if self.repeats_remaining > 0 {
            self.repeats_remaining -= 1;
        }
    }

    fn should_restart(&self) -> bool {
        self.repeats_remaining != 0 && !self.interval.is_zero() && !self.is_canceled()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Key {
    due: Instant,
    sequence: u64,
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.due
            .cmp(&other.due)
            .then(self.sequence.cmp(&other.sequence))
    }
}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<Key>>,
    timers: HashMap<u64, Timer>,
}

impl TimerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.timers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.timers.is_empty()
    }

    pub fn insert(&mut self, timer: Timer) {
        if timer.is_canceled() {
            return;
        }
        self.heap.push(Reverse(Key {
            due: timer.due,
            sequence: timer.sequence,
        }));
        self.timers.insert(timer.sequence, timer);
    }

    /// Drops a canceled timer right away instead of waiting for the sweep.
    pub fn remove(&mut self, id: &TimerId) -> bool {
        self.timers.remove(&id.sequence).is_some()
    }

    /// Earliest due time among live timers, discarding canceled heads.
    pub fn next_due(&mut self) -> Option<Instant> {
        while let Some(Reverse(key)) = self.heap.peek().copied() {
            match self.timers.get(&key.sequence) {
                Some(t) if !t.is_canceled() => return Some(key.due),
                _ => {
                    self.heap.pop();
                    self.timers.remove(&key.sequence);
                }
            }
        }
        None
    }

    /// Pops every live timer with `due <= now`, in `(due, sequence)` order.
    pub fn expire(&mut self, now: Instant) -> Vec<Timer> {
        let mut expired = Vec::new();
        while let Some(Reverse(key)) = self.heap.peek().copied() {
            if key.due > now {
                break;
            }
            self.heap.pop();
            if let Some(timer) = self.timers.remove(&key.sequence)
                && !timer.is_canceled()
            {
                expired.push(timer);
            }
        }
        expired
    }

    /// Puts fired timers back when they still have repeats left.
    pub fn restart(&mut self, fired: Vec<Timer>) {
        for mut timer in fired {
            if timer.should_restart() {
                timer.due += timer.interval;
                self.insert(timer);
            }
        }
    }
}
