//! Poll-array backend: a linear `pollfd` array scanned on every call.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use super::{ActiveChannel, Poller, PollerError, PollerKind, timeout_millis};
use crate::channel::{Channel, ChannelIndex, Interest, Ready, Token};

#[cfg(any(target_os = "linux", target_os = "android"))]
const POLL_RDHUP: libc::c_short = libc::POLLRDHUP;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const POLL_RDHUP: libc::c_short = 0;

pub struct PollArrayPoller {
    pollfds: Vec<libc::pollfd>,
    tokens: Vec<Token>,
    /// fd -> slot in `pollfds`.
    channels: HashMap<RawFd, usize>,
}

impl Default for PollArrayPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl PollArrayPoller {
    pub fn new() -> Self {
        Self {
            pollfds: Vec::new(),
            tokens: Vec::new(),
            channels: HashMap::new(),
        }
    }

    fn poll_events(interest: Interest) -> libc::c_short {
        let mut events = 0;
        if interest.is_readable() {
            events |= libc::POLLIN | libc::POLLPRI | POLL_RDHUP;
        }
        if interest.is_writable() {
            events |= libc::POLLOUT;
        }
        events
    }

    fn slot_of(&self, channel: &Channel) -> Result<usize, PollerError> {
        match self.channels.get(&channel.fd()) {
            Some(&slot) if self.tokens[slot] == channel.token() => Ok(slot),
            _ => Err(PollerError::Unknown {
                fd: channel.fd(),
                token: channel.token().0,
            }),
        }
    }

    /// Negative fds are skipped by `poll(2)`; `-fd - 1` keeps fd 0 representable.
    fn ignored(fd: RawFd) -> RawFd {
        -fd - 1
    }
}

impl Poller for PollArrayPoller {
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<ActiveChannel>,
    ) -> io::Result<Instant> {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_millis(timeout),
            )
        };
        let now = Instant::now();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(now);
            }
            return Err(err);
        }

        let mut remaining = n as usize;
        for (pfd, token) in self.pollfds.iter().zip(&self.tokens) {
            if remaining == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            let revents = pfd.revents;
            active.push(ActiveChannel {
                token: *token,
                ready: Ready {
                    readable: revents & (libc::POLLIN | libc::POLLPRI) != 0,
                    writable: revents & libc::POLLOUT != 0,
                    read_closed: POLL_RDHUP != 0 && revents & POLL_RDHUP != 0,
                    hangup: revents & libc::POLLHUP != 0,
                    error: revents & (libc::POLLERR | libc::POLLNVAL) != 0,
                },
            });
        }
        Ok(now)
    }

    fn update_channel(&mut self, channel: &mut Channel) -> Result<(), PollerError> {
        let fd = channel.fd();
        let events = Self::poll_events(channel.interest());
        let slot = match channel.index() {
            ChannelIndex::New => {
                if self.channels.contains_key(&fd) {
                    return Err(PollerError::Duplicate { fd });
                }
                self.pollfds.push(libc::pollfd {
                    fd,
                    events,
                    revents: 0,
                });
                self.tokens.push(channel.token());
                let slot = self.pollfds.len() - 1;
                self.channels.insert(fd, slot);
                slot
            }
            ChannelIndex::Added | ChannelIndex::Deleted => self.slot_of(channel)?,
        };

        let pfd = &mut self.pollfds[slot];
        pfd.events = events;
        pfd.revents = 0;
        if channel.is_none_event() {
            pfd.fd = Self::ignored(fd);
            channel.set_index(ChannelIndex::Deleted);
        } else {
            pfd.fd = fd;
            channel.set_index(ChannelIndex::Added);
        }
        Ok(())
    }

    fn remove_channel(&mut self, channel: &mut Channel) -> Result<(), PollerError> {
        let slot = self.slot_of(channel)?;
        self.channels.remove(&channel.fd());
        self.pollfds.swap_remove(slot);
        self.tokens.swap_remove(slot);
        if let Some(moved) = self.pollfds.get(slot) {
            let moved_fd = if moved.fd < 0 { -moved.fd - 1 } else { moved.fd };
            self.channels.insert(moved_fd, slot);
        }
        channel.set_index(ChannelIndex::New);
        Ok(())
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.slot_of(channel).is_ok()
    }

    fn kind(&self) -> PollerKind {
        PollerKind::PollArray
    }
}
