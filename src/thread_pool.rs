//! Loop-per-thread pool. Each worker builds its own [`EventLoop`] so the loop
//! is owned by the thread that runs it.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};

use crossbeam::channel;

use crate::poller::PollerKind;
use crate::reactor::EventLoop;

pub struct EventLoopThread {
    event_loop: Arc<EventLoop>,
    handle: Option<JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawns the thread and blocks until its loop exists.
    pub fn start(name: String, kind: Option<PollerKind>) -> io::Result<Self> {
        let (tx, rx) = channel::bounded::<io::Result<Arc<EventLoop>>>(1);
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name).spawn(move || {
            let event_loop = match EventLoop::with_poller(kind) {
                Ok(lp) => lp,
                Err(e) => {
                    let _ = tx.send(Err(e));
                    return;
                }
            };
            if tx.send(Ok(event_loop.clone())).is_err() {
                return;
            }
            if let Err(e) = event_loop.run() {
                tracing::error!(thread = %thread_name, error = %e, "loop thread failed");
            }
        })?;

        let event_loop = rx
            .recv()
            .map_err(|_| io::Error::other("loop thread exited before publishing its loop"))??;
        Ok(Self {
            event_loop,
            handle: Some(handle),
        })
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn stop(&mut self) {
        self.event_loop.quit();
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            tracing::error!("loop thread panicked");
        }
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The base loop plus `n` I/O loops handed out round-robin.
pub struct EventLoopThreadPool {
    base: Arc<EventLoop>,
    name: String,
    threads: Vec<EventLoopThread>,
    next: AtomicUsize,
    started: bool,
}

impl EventLoopThreadPool {
    pub fn new(base: Arc<EventLoop>, name: impl Into<String>) -> Self {
        Self {
            base,
            name: name.into(),
            threads: Vec::new(),
            next: AtomicUsize::new(0),
            started: false,
        }
    }

    pub fn start(&mut self, num_threads: usize, kind: Option<PollerKind>) -> io::Result<()> {
        if self.started {
            return Ok(());
        }
        for i in 0..num_threads {
            let thread = EventLoopThread::start(format!("{}-io{}", self.name, i), kind)?;
            self.threads.push(thread);
        }
        self.started = true;
        tracing::info!(pool = %self.name, threads = num_threads, "loop pool started");
        Ok(())
    }

    /// Next I/O loop in round-robin order, or the base loop when there are none.
    pub fn next_loop(&self) -> Arc<EventLoop> {
        if self.threads.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[i].event_loop().clone()
    }

    pub fn all_loops(&self) -> Vec<Arc<EventLoop>> {
        if self.threads.is_empty() {
            return vec![self.base.clone()];
        }
        self.threads.iter().map(|t| t.event_loop().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    pub fn stop(&mut self) {
        for thread in &mut self.threads {
            thread.stop();
        }
        self.threads.clear();
    }
}
