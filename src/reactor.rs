//! EventLoop: one poller, one timer queue, one thread.
//!
//! The thread that calls [`EventLoop::run`] owns the loop. Every other thread
//! talks to it through [`EventLoop::run_in_loop`] / [`EventLoop::queue_in_loop`],
//! which wake a blocked poll through the dedicated [`Waker`] channel.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use slab::Slab;
use thiserror::Error;

use crate::channel::{self, Channel, ChannelHandler, Token};
use crate::poller::{ActiveChannel, Poller, PollerError, PollerKind, new_poller};
use crate::task::{Task, TaskQueue};
use crate::timer::{REPEAT_FOREVER, Timer, TimerId, TimerQueue};
use crate::waker::Waker;

/// Upper bound on a single poll when no timer is due sooner.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LoopError {
    #[error("event loop is already running")]
    AlreadyLooping,

    #[error("event loop has already finished")]
    Finished,

    #[error("event loop is owned by another thread")]
    NotOwner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoopState {
    Created = 0,
    Looping = 1,
    Quit = 2,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => LoopState::Created,
            1 => LoopState::Looping,
            _ => LoopState::Quit,
        }
    }
}

pub struct EventLoop {
    me: Weak<EventLoop>,
    owner: OnceLock<ThreadId>,
    state: AtomicU8,
    quit: AtomicBool,
    event_handling: AtomicBool,
    iteration: AtomicU64,
    poll_return_time: Mutex<Option<Instant>>,
    poll_timeout: Duration,
    kind: PollerKind,
    poller: Mutex<Box<dyn Poller>>,
    handlers: Mutex<Slab<Weak<dyn ChannelHandler>>>,
    timers: Mutex<TimerQueue>,
    tasks: TaskQueue,
    waker: Arc<Waker>,
    wakeup_channel: Mutex<Channel>,
}

impl EventLoop {
    /// Creates a loop on the best backend the platform offers.
    pub fn new() -> io::Result<Arc<Self>> {
        Self::with_poller(None)
    }

    /// Creates a loop on `kind`, or on the detected default backend for `None`.
    pub fn with_poller(kind: Option<PollerKind>) -> io::Result<Arc<Self>> {
        Self::with_options(kind, DEFAULT_POLL_TIMEOUT)
    }

    /// Like [`with_poller`](Self::with_poller), with an explicit cap on how long
    /// one idle poll may block.
    pub fn with_options(kind: Option<PollerKind>, poll_timeout: Duration) -> io::Result<Arc<Self>> {
        let mut poller = new_poller(kind)?;
        let waker = Arc::new(Waker::new()?);

        let mut handlers: Slab<Weak<dyn ChannelHandler>> = Slab::with_capacity(64);
        let weak_waker: Weak<dyn ChannelHandler> = Arc::downgrade(&waker) as Weak<dyn ChannelHandler>;
        let token = Token(handlers.insert(weak_waker));
        let mut wakeup_channel = Channel::new(waker.fd(), token);
        wakeup_channel.enable_reading();
        poller
            .update_channel(&mut wakeup_channel)
            .map_err(into_io_error)?;

        let kind = poller.kind();
        tracing::debug!(backend = %kind, "event loop created");
        Ok(Arc::new_cyclic(|me| EventLoop {
            me: me.clone(),
            owner: OnceLock::new(),
            state: AtomicU8::new(LoopState::Created as u8),
            quit: AtomicBool::new(false),
            event_handling: AtomicBool::new(false),
            iteration: AtomicU64::new(0),
            poll_return_time: Mutex::new(None),
            poll_timeout,
            kind,
            poller: Mutex::new(poller),
            handlers: Mutex::new(handlers),
            timers: Mutex::new(TimerQueue::new()),
            tasks: TaskQueue::new(),
            waker,
            wakeup_channel: Mutex::new(wakeup_channel),
        }))
    }

    /// Runs the reactor until [`quit`](Self::quit) is observed.
    ///
    /// The calling thread becomes the loop's owner for its whole lifetime.
    pub fn run(&self) -> Result<(), LoopError> {
        let current = thread::current().id();
        if *self.owner.get_or_init(|| current) != current {
            return Err(LoopError::NotOwner);
        }
        match self.state.compare_exchange(
            LoopState::Created as u8,
            LoopState::Looping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {}
            Err(v) if LoopState::from_u8(v) == LoopState::Looping => {
                return Err(LoopError::AlreadyLooping);
            }
            Err(_) => return Err(LoopError::Finished),
        }
        tracing::debug!(backend = %self.kind, "event loop start looping");

        let mut active: Vec<ActiveChannel> = Vec::with_capacity(64);
        while !self.quit.load(Ordering::Acquire) {
            active.clear();
            let timeout = self.next_timeout();
            let polled = self.poller.lock().poll(Some(timeout), &mut active);
            let receive_time = match polled {
                Ok(t) => t,
                Err(e) => {
                    tracing::error!(error = %e, backend = %self.kind, "poll failed");
                    Instant::now()
                }
            };
            self.iteration.fetch_add(1, Ordering::Relaxed);
            *self.poll_return_time.lock() = Some(receive_time);

            self.event_handling.store(true, Ordering::Release);
            for a in &active {
                let handler = self.handlers.lock().get(a.token.0).and_then(Weak::upgrade);
                if let Some(handler) = handler {
                    channel::dispatch(a.ready, handler.as_ref(), receive_time);
                }
            }
            self.event_handling.store(false, Ordering::Release);

            self.run_expired_timers();
            self.tasks.run_pending();
        }
        // Tasks queued before quit was observed still run.
        self.tasks.run_pending();

        self.state.store(LoopState::Quit as u8, Ordering::Release);
        tracing::debug!(iterations = self.iteration(), "event loop stop looping");
        Ok(())
    }

    /// Asks the loop to exit after the current iteration.
    pub fn quit(&self) {
        self.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    /// Runs `task` now when called on the loop thread, otherwise queues it.
    pub fn run_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_in_loop_thread() {
            task();
        } else {
            self.queue_in_loop(task);
        }
    }

    /// Queues `task` behind every task queued before it and wakes the loop.
    pub fn queue_in_loop<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.tasks.push(Box::new(task) as Task);
        if !self.is_in_loop_thread() || self.tasks.is_draining() {
            self.wakeup();
        }
    }

    /// Tasks waiting for the next drain.
    pub fn queue_size(&self) -> usize {
        self.tasks.len()
    }

    /// Runs `callback` once at `when`, on the loop thread.
    pub fn run_at<F>(&self, when: Instant, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.add_timer(Timer::new(when, Duration::ZERO, 1, Box::new(callback)))
    }

    /// Runs `callback` once after `delay`.
    pub fn run_after<F>(&self, delay: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_at(Instant::now() + delay, callback)
    }

    /// Runs `callback` every `interval` until canceled. The first run is one
    /// interval from now.
    pub fn run_every<F>(&self, interval: Duration, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        self.run_every_n(interval, REPEAT_FOREVER, callback)
    }

    /// Fires `count` times (`REPEAT_FOREVER` for no limit), `interval` apart.
    ///
    /// Any other count below one schedules nothing and returns an already
    /// canceled id.
    pub fn run_every_n<F>(&self, interval: Duration, count: i64, callback: F) -> TimerId
    where
        F: FnMut() + Send + 'static,
    {
        let timer = Timer::new(Instant::now() + interval, interval, count, Box::new(callback));
        if count != REPEAT_FOREVER && count < 1 {
            let id = timer.id();
            id.cancel();
            return id;
        }
        self.add_timer(timer)
    }

    /// Marks the timer canceled now; the queue entry is dropped on the loop thread.
    pub fn cancel(&self, id: &TimerId) {
        id.cancel();
        let me = self.me.clone();
        let id = id.clone();
        self.run_in_loop(move || {
            if let Some(lp) = me.upgrade() {
                lp.timers.lock().remove(&id);
            }
        });
    }

    fn add_timer(&self, timer: Timer) -> TimerId {
        let id = timer.id();
        if self.is_in_loop_thread() {
            self.timers.lock().insert(timer);
        } else {
            let me = self.me.clone();
            self.queue_in_loop(move || {
                if let Some(lp) = me.upgrade() {
                    lp.timers.lock().insert(timer);
                }
            });
        }
        id
    }

    fn run_expired_timers(&self) {
        let mut fired = self.timers.lock().expire(Instant::now());
        if fired.is_empty() {
            return;
        }
        for timer in &mut fired {
            timer.run();
        }
        self.timers.lock().restart(fired);
    }

    fn next_timeout(&self) -> Duration {
        match self.timers.lock().next_due() {
            Some(due) => due
                .saturating_duration_since(Instant::now())
                .min(self.poll_timeout),
            None => self.poll_timeout,
        }
    }

    fn wakeup(&self) {
        if let Err(e) = self.waker.wake() {
            tracing::error!(error = %e, "failed to wake event loop");
        }
    }

    /// Adds a handler to the dispatch table; the loop never keeps it alive.
    pub fn register(&self, handler: Weak<dyn ChannelHandler>) -> Token {
        Token(self.handlers.lock().insert(handler))
    }

    /// Drops the handler for `token`. Unknown tokens are ignored.
    pub fn deregister(&self, token: Token) {
        let mut handlers = self.handlers.lock();
        if handlers.contains(token.0) {
            handlers.remove(token.0);
        }
    }

    /// Pushes the channel's interest mask to the poller. Loop thread only.
    pub fn update_channel(&self, channel: &mut Channel) -> Result<(), PollerError> {
        self.assert_in_loop_thread("update_channel");
        self.poller.lock().update_channel(channel)
    }

    /// Forgets the channel in the poller. Loop thread only.
    pub fn remove_channel(&self, channel: &mut Channel) -> Result<(), PollerError> {
        self.assert_in_loop_thread("remove_channel");
        self.poller.lock().remove_channel(channel)
    }

    /// True while the poller knows the channel, watched or not.
    pub fn has_channel(&self, channel: &Channel) -> bool {
        self.poller.lock().has_channel(channel)
    }

    /// True on the owning thread. Before [`run`](Self::run) no thread owns the loop.
    pub fn is_in_loop_thread(&self) -> bool {
        self.owner.get() == Some(&thread::current().id())
    }

    fn assert_in_loop_thread(&self, op: &str) {
        if let Some(owner) = self.owner.get()
            && *owner != thread::current().id()
        {
            tracing::error!(op, ?owner, current = ?thread::current().id(), "channel touched outside its loop thread");
        }
    }

    /// Current place in the `Created -> Looping -> Quit` lifecycle.
    pub fn state(&self) -> LoopState {
        LoopState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Completed poll rounds since [`run`](Self::run) started.
    pub fn iteration(&self) -> u64 {
        self.iteration.load(Ordering::Relaxed)
    }

    /// When the last poll returned; `None` before the first one.
    pub fn poll_return_time(&self) -> Option<Instant> {
        *self.poll_return_time.lock()
    }

    /// True while ready channels are being dispatched.
    pub fn event_handling(&self) -> bool {
        self.event_handling.load(Ordering::Acquire)
    }

    /// The backend picked at construction.
    pub fn backend(&self) -> PollerKind {
        self.kind
    }

    /// Thread that called [`run`](Self::run), if any has.
    pub fn owner(&self) -> Option<ThreadId> {
        self.owner.get().copied()
    }

    pub fn wakeup_token(&self) -> Token {
        self.wakeup_channel.lock().token()
    }
}

fn into_io_error(e: PollerError) -> io::Error {
    match e {
        PollerError::Io(e) => e,
        other => io::Error::other(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn spawn_loop(kind: Option<PollerKind>) -> (Arc<EventLoop>, thread::JoinHandle<Result<(), LoopError>>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let lp = EventLoop::with_poller(kind).unwrap();
            tx.send(lp.clone()).unwrap();
            lp.run()
        });
        (rx.recv().unwrap(), handle)
    }

    #[test]
    fn quit_from_another_thread() {
        for kind in [PollerKind::EventTable, PollerKind::PollArray, PollerKind::Select] {
            let (lp, handle) = spawn_loop(Some(kind));
            lp.quit();
            assert_eq!(handle.join().unwrap(), Ok(()));
            assert_eq!(lp.state(), LoopState::Quit);
            assert_eq!(lp.backend(), kind);
        }
    }

    #[test]
    fn run_in_loop_executes_on_owner_thread() {
        let (lp, handle) = spawn_loop(None);
        let (tx, rx) = mpsc::channel();
        let inner = lp.clone();
        lp.run_in_loop(move || {
            tx.send((thread::current().id(), inner.is_in_loop_thread())).unwrap();
        });
        let (tid, in_loop) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(in_loop);
        assert_eq!(Some(tid), lp.owner());
        assert_ne!(tid, thread::current().id());
        lp.quit();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn tasks_queued_before_run_are_executed() {
        let lp = EventLoop::new().unwrap();
        let hits = Arc::new(AtomicU64::new(0));
        for _ in 0..3 {
            let hits = hits.clone();
            lp.queue_in_loop(move || {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        let quitter = lp.clone();
        lp.queue_in_loop(move || quitter.quit());
        lp.run().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn second_run_fails() {
        let lp = EventLoop::new().unwrap();
        lp.quit();
        lp.run().unwrap();
        assert_eq!(lp.run(), Err(LoopError::Finished));
    }

    #[test]
    fn run_from_foreign_thread_is_rejected() {
        let (lp, handle) = spawn_loop(None);
        assert_eq!(lp.run(), Err(LoopError::NotOwner));
        lp.quit();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn timers_fire_in_order_and_cancel() {
        let (lp, handle) = spawn_loop(None);
        let (tx, rx) = mpsc::channel();
        for (tag, ms) in [(3u32, 60u64), (1, 20), (2, 40)] {
            let tx = tx.clone();
            lp.run_after(Duration::from_millis(ms), move || tx.send(tag).unwrap());
        }
        let canceled_tx = tx.clone();
        let id = lp.run_after(Duration::from_millis(30), move || canceled_tx.send(99).unwrap());
        lp.cancel(&id);

        let got: Vec<u32> = (0..3)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(got, vec![1, 2, 3]);
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        lp.quit();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn zero_repeat_count_schedules_nothing() {
        let (lp, handle) = spawn_loop(None);
        let (tx, rx) = mpsc::channel();
        let never = tx.clone();
        let id = lp.run_every_n(Duration::from_millis(5), 0, move || never.send("fired").unwrap());
        assert!(id.is_canceled());
        let negative = tx.clone();
        assert!(lp.run_every_n(Duration::from_millis(5), -7, move || negative.send("fired").unwrap()).is_canceled());
        lp.run_after(Duration::from_millis(60), move || tx.send("sentinel").unwrap());
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "sentinel");
        lp.quit();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn repeating_timer_stops_after_count() {
        let (lp, handle) = spawn_loop(None);
        let (tx, rx) = mpsc::channel();
        lp.run_every_n(Duration::from_millis(5), 3, move || tx.send(()).unwrap());
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(5)).unwrap();
        }
        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        lp.quit();
        handle.join().unwrap().unwrap();
    }
}
