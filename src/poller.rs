//! Poller: readiness multiplexing behind one contract.
//!
//! Three backends implement [`Poller`]: the event-table backend on `mio`
//! (epoll/kqueue), a `poll(2)` array and a `select(2)` bitmask. The event loop
//! picks one at startup and never looks at which.

mod event_table;
mod poll_array;
mod select;

use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::str::FromStr;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::channel::{Channel, Ready, Token};

pub use event_table::EventTablePoller;
pub use poll_array::PollArrayPoller;
pub use select::SelectPoller;

/// A channel reported ready by one poll cycle.
#[derive(Debug, Clone, Copy)]
pub struct ActiveChannel {
    pub token: Token,
    pub ready: Ready,
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("fd {fd} is already registered")]
    Duplicate { fd: RawFd },

    #[error("fd {fd} (token {token}) is not registered with this poller")]
    Unknown { fd: RawFd, token: usize },

    #[error("fd {fd} exceeds the select limit of {limit}")]
    FdOutOfRange { fd: RawFd, limit: usize },

    #[error("poller i/o error: {0}")]
    Io(#[from] io::Error),
}

pub trait Poller: Send {
    /// Waits up to `timeout` (forever on `None`) and appends ready channels to
    /// `active`. Returns the time the wait returned.
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<ActiveChannel>,
    ) -> io::Result<Instant>;

    /// Registers the channel, or pushes its new interest mask.
    fn update_channel(&mut self, channel: &mut Channel) -> Result<(), PollerError>;

    /// Forgets the channel and resets its index to `New`.
    fn remove_channel(&mut self, channel: &mut Channel) -> Result<(), PollerError>;

    fn has_channel(&self, channel: &Channel) -> bool;

    fn kind(&self) -> PollerKind;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerKind {
    EventTable,
    PollArray,
    Select,
}

impl PollerKind {
    /// Best backend the platform supports.
    pub fn detect() -> PollerKind {
        match mio::Poll::new() {
            Ok(_) => PollerKind::EventTable,
            Err(e) => {
                tracing::warn!(error = %e, "event-table poller unavailable, falling back to poll");
                PollerKind::PollArray
            }
        }
    }
}

impl fmt::Display for PollerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PollerKind::EventTable => "epoll",
            PollerKind::PollArray => "poll",
            PollerKind::Select => "select",
        })
    }
}

impl FromStr for PollerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "epoll" | "kqueue" | "event-table" => Ok(PollerKind::EventTable),
            "poll" => Ok(PollerKind::PollArray),
            "select" => Ok(PollerKind::Select),
            other => Err(format!("unknown poller backend `{other}`")),
        }
    }
}

/// Builds the requested backend, probing when `kind` is `None`.
pub fn new_poller(kind: Option<PollerKind>) -> io::Result<Box<dyn Poller>> {
    let kind = kind.unwrap_or_else(PollerKind::detect);
    Ok(match kind {
        PollerKind::EventTable => Box::new(EventTablePoller::new()?),
        PollerKind::PollArray => Box::new(PollArrayPoller::new()),
        PollerKind::Select => Box::new(SelectPoller::new()),
    })
}

/// Milliseconds for `poll`/`select`, rounded up so a timer is never polled early.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelIndex;
    use std::io::Write;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn backends() -> Vec<Box<dyn Poller>> {
        vec![
            new_poller(Some(PollerKind::EventTable)).unwrap(),
            new_poller(Some(PollerKind::PollArray)).unwrap(),
            new_poller(Some(PollerKind::Select)).unwrap(),
        ]
    }

    #[test]
    fn parse_kinds() {
        assert_eq!("epoll".parse::<PollerKind>(), Ok(PollerKind::EventTable));
        assert_eq!(" Poll ".parse::<PollerKind>(), Ok(PollerKind::PollArray));
        assert_eq!("select".parse::<PollerKind>(), Ok(PollerKind::Select));
        assert!("iocp".parse::<PollerKind>().is_err());
    }

    #[test]
    fn timeout_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(20))), 20);
    }

    #[test]
    fn index_state_machine_is_shared() {
        for mut poller in backends() {
            let (a, _b) = UnixStream::pair().unwrap();
            let mut ch = Channel::new(a.as_raw_fd(), Token(7));

            ch.enable_reading();
            poller.update_channel(&mut ch).unwrap();
            assert_eq!(ch.index(), ChannelIndex::Added, "{}", poller.kind());
            assert!(poller.has_channel(&ch));

            ch.disable_all();
            poller.update_channel(&mut ch).unwrap();
            assert_eq!(ch.index(), ChannelIndex::Deleted, "{}", poller.kind());
            assert!(poller.has_channel(&ch));

            ch.enable_reading();
            poller.update_channel(&mut ch).unwrap();
            assert_eq!(ch.index(), ChannelIndex::Added, "{}", poller.kind());

            poller.remove_channel(&mut ch).unwrap();
            assert_eq!(ch.index(), ChannelIndex::New);
            assert!(!poller.has_channel(&ch));
        }
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        for mut poller in backends() {
            let (a, _b) = UnixStream::pair().unwrap();
            let mut first = Channel::new(a.as_raw_fd(), Token(1));
            first.enable_reading();
            poller.update_channel(&mut first).unwrap();

            let mut second = Channel::new(a.as_raw_fd(), Token(2));
            second.enable_reading();
            assert!(poller.update_channel(&mut second).is_err(), "{}", poller.kind());
        }
    }

    #[test]
    fn reports_readable_and_writable() {
        for mut poller in backends() {
            let (a, mut b) = UnixStream::pair().unwrap();
            a.set_nonblocking(true).unwrap();
            let mut ch = Channel::new(a.as_raw_fd(), Token(3));
            ch.enable_reading();
            ch.enable_writing();
            poller.update_channel(&mut ch).unwrap();

            b.write_all(b"ping").unwrap();
            let mut active = Vec::new();
            poller
                .poll(Some(Duration::from_millis(500)), &mut active)
                .unwrap();
            assert_eq!(active.len(), 1, "{}", poller.kind());
            assert_eq!(active[0].token, Token(3));
            assert!(active[0].ready.readable, "{}", poller.kind());
            assert!(active[0].ready.writable, "{}", poller.kind());
        }
    }

    #[test]
    fn unwatched_channel_stays_quiet() {
        for mut poller in backends() {
            let (a, mut b) = UnixStream::pair().unwrap();
            let mut ch = Channel::new(a.as_raw_fd(), Token(4));
            ch.enable_reading();
            poller.update_channel(&mut ch).unwrap();
            ch.disable_all();
            poller.update_channel(&mut ch).unwrap();

            b.write_all(b"x").unwrap();
            let mut active = Vec::new();
            poller
                .poll(Some(Duration::from_millis(20)), &mut active)
                .unwrap();
            assert!(active.is_empty(), "{}", poller.kind());
        }
    }
}
