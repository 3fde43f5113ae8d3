//! Wake-up channel for a blocked poll.
//!
//! A non-blocking socket pair: writers poke one end, the loop keeps the other
//! end registered for reading and drains it.

use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::Instant;

use crate::channel::ChannelHandler;

pub struct Waker {
    reader: UnixStream,
    writer: UnixStream,
}

impl Waker {
    pub fn new() -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self { reader, writer })
    }

    /// The end the poller watches.
    pub fn fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Makes the reader end readable. A full pipe already guarantees that.
    pub fn wake(&self) -> io::Result<()> {
        match (&self.writer).write(&1u64.to_ne_bytes()) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Consumes every pending wake-up.
    pub fn drain(&self) -> usize {
        let mut buf = [0u8; 256];
        let mut total = 0;
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        tracing::error!(error = %e, "wake-up channel read failed");
                    }
                    break;
                }
            }
        }
        total
    }
}

impl ChannelHandler for Waker {
    fn handle_read(&self, _receive_time: Instant) {
        self.drain();
    }
}
