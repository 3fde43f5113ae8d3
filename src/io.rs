//! Listening socket and the acceptor channel built on it.

use std::fs::File;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use socket2::{Domain, Protocol, Socket, Type};

use crate::channel::{Channel, ChannelHandler};
use crate::reactor::EventLoop;

const LISTEN_BACKLOG: i32 = 1024;

pub type NewConnectionCallback = Box<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

/// Binds a non-blocking listener with `SO_REUSEADDR` (and `SO_REUSEPORT` on request).
pub fn bind_listener(addr: SocketAddr, reuse_port: bool) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}

/// Accepts connections on the base loop and hands each to a callback.
pub struct Acceptor {
    event_loop: Arc<EventLoop>,
    listener: TcpListener,
    channel: Mutex<Channel>,
    callback: Mutex<Option<Arc<NewConnectionCallback>>>,
    listening: AtomicBool,
    /// Spare descriptor released to shed a connection when the process hits EMFILE.
    idle_fd: Mutex<Option<File>>,
}

impl Acceptor {
    pub fn new(event_loop: Arc<EventLoop>, addr: SocketAddr, reuse_port: bool) -> io::Result<Arc<Self>> {
        let listener = bind_listener(addr, reuse_port)?;
        let idle_fd = File::open("/dev/null").ok();
        Ok(Arc::new_cyclic(|me: &Weak<Acceptor>| {
            let token = event_loop.register(me.clone() as Weak<dyn ChannelHandler>);
            let channel = Channel::new(listener.as_raw_fd(), token);
            Acceptor {
                event_loop,
                listener,
                channel: Mutex::new(channel),
                callback: Mutex::new(None),
                listening: AtomicBool::new(false),
                idle_fd: Mutex::new(idle_fd),
            }
        }))
    }

    pub fn set_new_connection_callback(&self, callback: NewConnectionCallback) {
        *self.callback.lock() = Some(Arc::new(callback));
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn listening(&self) -> bool {
        self.listening.load(Ordering::Acquire)
    }

    /// Starts watching the listener. Must run on the owning loop.
    pub fn listen(&self) -> io::Result<()> {
        let mut channel = self.channel.lock();
        channel.enable_reading();
        self.event_loop
            .update_channel(&mut channel)
            .map_err(io::Error::other)?;
        self.listening.store(true, Ordering::Release);
        tracing::info!(addr = ?self.listener.local_addr().ok(), "listening");
        Ok(())
    }

    /// Stops watching and drops the channel registration. Must run on the owning loop.
    pub fn close(&self) {
        let mut channel = self.channel.lock();
        channel.disable_all();
        if let Err(e) = self.event_loop.update_channel(&mut channel) {
            tracing::warn!(error = %e, "failed to disarm acceptor");
        }
        if let Err(e) = self.event_loop.remove_channel(&mut channel) {
            tracing::warn!(error = %e, "failed to remove acceptor channel");
        }
        self.event_loop.deregister(channel.token());
        self.listening.store(false, Ordering::Release);
    }

    fn shed_connection(&self) {
        let mut idle = self.idle_fd.lock();
        idle.take();
        if let Ok((stream, peer)) = self.listener.accept() {
            tracing::warn!(%peer, "too many open files, dropping connection");
            drop(stream);
        }
        *idle = File::open("/dev/null").ok();
    }
}

impl ChannelHandler for Acceptor {
    fn handle_read(&self, _receive_time: Instant) {
        let callback = self.callback.lock().clone();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => match &callback {
                    Some(cb) => cb(stream, peer),
                    None => {
                        tracing::debug!(%peer, "no connection callback, closing");
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(libc::EMFILE) => {
                    tracing::error!(error = %e, "accept failed");
                    self.shed_connection();
                    break;
                }
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binds_ephemeral_port() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), true).unwrap();
        let addr = listener.local_addr().unwrap();
        assert_ne!(addr.port(), 0);
        let _client = TcpStream::connect(addr).unwrap();
    }
}
