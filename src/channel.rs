//! Channel: one descriptor, its interest mask and its registration state.
//!
//! The callbacks live behind [`ChannelHandler`]; the event loop keeps the
//! handler table keyed by [`Token`] so nothing in the poller points back into
//! connection objects.

use std::fmt;
use std::os::fd::RawFd;
use std::time::Instant;

pub use mio::Token;

/// Interest mask a channel asks the poller to watch.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Self = Self(0);
    pub const READABLE: Self = Self(0b01);
    pub const WRITABLE: Self = Self(0b10);

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn remove(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    pub const fn is_none(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => f.write_str("READABLE|WRITABLE"),
            (true, false) => f.write_str("READABLE"),
            (false, true) => f.write_str("WRITABLE"),
            (false, false) => f.write_str("NONE"),
        }
    }
}

/// Readiness observed by a poller for one channel in one poll cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    /// Peer closed its write half (RDHUP); data may still be pending.
    pub read_closed: bool,
    /// Both directions are gone (HUP).
    pub hangup: bool,
    pub error: bool,
}

impl Ready {
    pub fn is_empty(&self) -> bool {
        *self == Ready::default()
    }
}

/// Registration state used by the pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelIndex {
    /// Never registered, or fully removed.
    New,
    /// Known to the poller with a non-empty interest.
    Added,
    /// Known to the poller but currently not watched.
    Deleted,
}

/// Edge callbacks of a channel. Called only on the owning loop thread.
pub trait ChannelHandler: Send + Sync {
    fn handle_read(&self, receive_time: Instant);

    fn handle_write(&self) {}

    fn handle_close(&self) {}

    fn handle_error(&self) {}
}

#[derive(Debug)]
pub struct Channel {
    fd: RawFd,
    token: Token,
    interest: Interest,
    index: ChannelIndex,
}

impl Channel {
    pub fn new(fd: RawFd, token: Token) -> Self {
        Self {
            fd,
            token,
            interest: Interest::NONE,
            index: ChannelIndex::New,
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn interest(&self) -> Interest {
        self.interest
    }

    pub fn index(&self) -> ChannelIndex {
        self.index
    }

    pub fn set_index(&mut self, index: ChannelIndex) {
        self.index = index;
    }

    // The interest setters only edit the mask; the owner pushes the change
    // with `EventLoop::update_channel`.

    pub fn enable_reading(&mut self) {
        self.interest = self.interest.union(Interest::READABLE);
    }

    pub fn disable_reading(&mut self) {
        self.interest = self.interest.remove(Interest::READABLE);
    }

    pub fn enable_writing(&mut self) {
        self.interest = self.interest.union(Interest::WRITABLE);
    }

    pub fn disable_writing(&mut self) {
        self.interest = self.interest.remove(Interest::WRITABLE);
    }

    pub fn disable_all(&mut self) {
        self.interest = Interest::NONE;
    }

    pub fn is_none_event(&self) -> bool {
        self.interest.is_none()
    }

    pub fn is_reading(&self) -> bool {
        self.interest.is_readable()
    }

    pub fn is_writing(&self) -> bool {
        self.interest.is_writable()
    }
}

/// Runs the handler callbacks for one readiness report.
///
/// Close wins over a readable signal with nothing behind it; read runs before
/// write when both fire.
pub fn dispatch(ready: Ready, handler: &dyn ChannelHandler, receive_time: Instant) {
    if ready.hangup && !ready.readable {
        handler.handle_close();
        return;
    }
    if ready.error {
        handler.handle_error();
    }
    if ready.readable || ready.read_closed {
        handler.handle_read(receive_time);
    }
    if ready.writable {
        handler.handle_write();
    }
}
