//! Event-table backend: a persistent kernel interest list through `mio`.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Poll};

use super::{ActiveChannel, Poller, PollerError, PollerKind};
use crate::channel::{Channel, ChannelIndex, Interest, Ready, Token};

const INIT_EVENT_LIST_SIZE: usize = 16;

/// `mio` delivers edge-triggered readiness; channel handlers drain until
/// `WouldBlock`, which keeps them correct under level-triggered backends too.
pub struct EventTablePoller {
    poll: Poll,
    events: Events,
    channels: HashMap<RawFd, Token>,
}

impl EventTablePoller {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(INIT_EVENT_LIST_SIZE),
            channels: HashMap::new(),
        })
    }

    fn mio_interest(interest: Interest) -> Option<mio::Interest> {
        match (interest.is_readable(), interest.is_writable()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl Poller for EventTablePoller {
    fn poll(
        &mut self,
        timeout: Option<Duration>,
        active: &mut Vec<ActiveChannel>,
    ) -> io::Result<Instant> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                return Ok(Instant::now());
            }
            Err(e) => return Err(e),
        }
        let now = Instant::now();

        let first = active.len();
        let mut count = 0;
        for event in self.events.iter() {
            count += 1;
            let ready = Ready {
                readable: event.is_readable(),
                writable: event.is_writable(),
                read_closed: event.is_read_closed(),
                hangup: event.is_read_closed() && event.is_write_closed(),
                error: event.is_error(),
            };
            // kqueue reports read and write filters as separate events.
            match active[first..].iter_mut().find(|a| a.token == event.token()) {
                Some(existing) => {
                    existing.ready.readable |= ready.readable;
                    existing.ready.writable |= ready.writable;
                    existing.ready.read_closed |= ready.read_closed;
                    existing.ready.hangup |= ready.hangup;
                    existing.ready.error |= ready.error;
                }
                None => active.push(ActiveChannel {
                    token: event.token(),
                    ready,
                }),
            }
        }

        if count == self.events.capacity() {
            self.events = Events::with_capacity(self.events.capacity() * 2);
        }
        Ok(now)
    }

    fn update_channel(&mut self, channel: &mut Channel) -> Result<(), PollerError> {
        let fd = channel.fd();
        let registry = self.poll.registry();
        match channel.index() {
            ChannelIndex::New | ChannelIndex::Deleted => {
                if channel.index() == ChannelIndex::New {
                    if self.channels.contains_key(&fd) {
                        return Err(PollerError::Duplicate { fd });
                    }
                } else if self.channels.get(&fd) != Some(&channel.token()) {
                    return Err(PollerError::Unknown {
                        fd,
                        token: channel.token().0,
                    });
                }
                match Self::mio_interest(channel.interest()) {
                    Some(interest) => {
                        registry.register(&mut SourceFd(&fd), channel.token(), interest)?;
                        channel.set_index(ChannelIndex::Added);
                    }
                    None => channel.set_index(ChannelIndex::Deleted),
                }
                self.channels.insert(fd, channel.token());
            }
            ChannelIndex::Added => {
                if self.channels.get(&fd) != Some(&channel.token()) {
                    return Err(PollerError::Unknown {
                        fd,
                        token: channel.token().0,
                    });
                }
                match Self::mio_interest(channel.interest()) {
                    Some(interest) => {
                        registry.reregister(&mut SourceFd(&fd), channel.token(), interest)?;
                    }
                    None => {
                        registry.deregister(&mut SourceFd(&fd))?;
                        channel.set_index(ChannelIndex::Deleted);
                    }
                }
            }
        }
        Ok(())
    }

    fn remove_channel(&mut self, channel: &mut Channel) -> Result<(), PollerError> {
        let fd = channel.fd();
        if self.channels.get(&fd) != Some(&channel.token()) {
            return Err(PollerError::Unknown {
                fd,
                token: channel.token().0,
            });
        }
        self.channels.remove(&fd);
        if channel.index() == ChannelIndex::Added {
            self.poll.registry().deregister(&mut SourceFd(&fd))?;
        }
        channel.set_index(ChannelIndex::New);
        Ok(())
    }

    fn has_channel(&self, channel: &Channel) -> bool {
        self.channels.get(&channel.fd()) == Some(&channel.token())
    }

    fn kind(&self) -> PollerKind {
        PollerKind::EventTable
    }
}
