//! Select-bitmask backend: fixed-size fd sets rebuilt on every call.

use std::collections::BTreeMap;
use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::time::{Duration, Instant};

use super::{ActiveChannel, Poller, PollerError, PollerKind};
use crate::channel::{Channel, ChannelIndex, Interest, Ready, Token};

/// Highest fd (exclusive) an `fd_set` can represent.
pub const SELECT_FD_LIMIT: usize = libc::FD_SETSIZE as usize;

struct Entry {
    token: Token,
    interest: Interest,
}

#[derive(Default)]
pub struct SelectPoller {
    channels: BTreeMap<RawFd, Entry>,
}

impl SelectPoller {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry_of(&self, channel: &Channel) -> Result<&Entry, PollerError> {
        match self.channels.get(&channel.fd()) {
            Some(entry) if entry.token == channel.token() => Ok(entry),
            _ => Err(PollerError::Unknown {
                fd: channel.fd(),
                token: channel.token().0,
            }),
        }
    }
}

impl Poller for SelectPoller {
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<ActiveChannel>,
    ) -> io::Result<Instant> {
        let mut readfds: libc::fd_set = unsafe { mem::zeroed() };
        let mut writefds: libc::fd_set = unsafe { mem::zeroed() };
        let mut maxfd: RawFd = -1;

        unsafe {
            libc::FD_ZERO(&mut readfds);
            libc::FD_ZERO(&mut writefds);
            for (&fd, entry) in &self.channels {
                if entry.interest.is_readable() {
                    libc::FD_SET(fd, &mut readfds);
                }
                if entry.interest.is_writable() {
                    libc::FD_SET(fd, &mut writefds);
                }
                if !entry.interest.is_none() {
                    maxfd = maxfd.max(fd);
                }
            }
        }

        let mut tv = timeout.map(|d| libc::timeval {
            tv_sec: d.as_secs() as libc::time_t,
            tv_usec: d.subsec_micros() as libc::suseconds_t,
        });
        let tv_ptr = tv
            .as_mut()
            .map_or(ptr::null_mut(), |tv| tv as *mut libc::timeval);

        let n = unsafe {
            libc::select(
                maxfd + 1,
                &mut readfds,
                &mut writefds,
                ptr::null_mut(),
                tv_ptr,
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
        for (&fd, entry) in &self.channels {
            if remaining == 0 {
                break;
            }
            let (readable, writable) =
                unsafe { (libc::FD_ISSET(fd, &readfds), libc::FD_ISSET(fd, &writefds)) };
            if !readable && !writable {
                continue;
            }
            // select counts each set bit separately.
            remaining = remaining.saturating_sub(readable as usize + writable as usize);
            active.push(ActiveChannel {
                token: entry.token,
                ready: Ready {
                    readable,
                    writable,
                    ..Ready::default()
                },
            });
        }
        Ok(now)
    }

    fn update_channel(&mut self, channel: &mut Channel) -> Result<(), PollerError> {
        let fd = channel.fd();
        if fd < 0 || fd as usize >= SELECT_FD_LIMIT {
            tracing::warn!(fd, limit = SELECT_FD_LIMIT, "fd out of range for select poller");
            return Err(PollerError::FdOutOfRange {
                fd,
                limit: SELECT_FD_LIMIT,
            });
        }
        match channel.index() {
            ChannelIndex::New => {
                if self.channels.contains_key(&fd) {
                    return Err(PollerError::Duplicate { fd });
                }
                self.channels.insert(
                    fd,
                    Entry {
                        token: channel.token(),
                        interest: channel.interest(),
                    },
                );
            }
            ChannelIndex::Added | ChannelIndex::Deleted => {
                self.entry_of(channel)?;
                if let Some(entry) = self.channels.get_mut(&fd) {
                    entry.interest = channel.interest();
                }
            }
        }
        channel.set_index(if channel.is_none_event() {
            ChannelIndex::Deleted
        } else {
            ChannelIndex::Added
        });
        Ok(())
    }

    fn remove_channel(&mut self, channel: &mut Channel) -> Result<(), PollerError> {
        self.entry_of(channel)?;
        self.channels.remove(&channel.fd());
        channel.set_index(ChannelIndex::New);
        Ok(())
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.entry_of(channel).is_ok()
    }

    fn kind(&self) -> PollerKind {
        PollerKind::Select
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_fd_beyond_limit() {
        let mut poller = SelectPoller::new();
        let mut ch = Channel::new(SELECT_FD_LIMIT as RawFd, Token(1));
        ch.enable_reading();
        assert!(matches!(
            poller.update_channel(&mut ch),
            Err(PollerError::FdOutOfRange { .. })
        ));
        assert_eq!(ch.index(), ChannelIndex::New);
    }
}
