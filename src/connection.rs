//! One accepted TCP socket bound to one event loop.
//!
//! A `Connection` is shared: the server's table, queued loop tasks and
//! callbacks all hold `Arc`s. The loop's handler table only holds a `Weak`,
//! so the socket closes once the last strong holder lets go.

use std::fmt;
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use socket2::SockRef;

use crate::buffer::ByteBuffer;
use crate::channel::{Channel, ChannelHandler};
use crate::reactor::EventLoop;

pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

pub type ConnectionCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type MessageCallback = Arc<dyn Fn(&Arc<Connection>, &mut ByteBuffer, Instant) + Send + Sync>;
pub type WriteCompleteCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;
pub type HighWaterMarkCallback = Arc<dyn Fn(&Arc<Connection>, usize) + Send + Sync>;
pub type CloseCallback = Arc<dyn Fn(&Arc<Connection>) + Send + Sync>;

/// Lifecycle of a connection. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

impl ConnectionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnectionState::Connecting,
            1 => ConnectionState::Connected,
            2 => ConnectionState::Disconnecting,
            _ => ConnectionState::Disconnected,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Default, Clone)]
struct Callbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
    close: Option<CloseCallback>,
}

pub struct Connection {
    me: Weak<Connection>,
    id: ConnectionId,
    name: String,
    event_loop: Arc<EventLoop>,
    socket: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    // Lock order: channel, then output.
    channel: Mutex<Channel>,
    input: Mutex<ByteBuffer>,
    output: Mutex<ByteBuffer>,
    high_water_mark: AtomicUsize,
    callbacks: Mutex<Callbacks>,
}

impl Connection {
    pub fn new(
        event_loop: Arc<EventLoop>,
        id: ConnectionId,
        name: String,
        socket: TcpStream,
        peer_addr: SocketAddr,
    ) -> io::Result<Arc<Self>> {
        socket.set_nonblocking(true)?;
        SockRef::from(&socket).set_keepalive(true)?;
        let local_addr = socket.local_addr()?;
        tracing::debug!(conn = %name, fd = socket.as_raw_fd(), "connection created");

        Ok(Arc::new_cyclic(|me: &Weak<Connection>| {
            let token = event_loop.register(me.clone() as Weak<dyn ChannelHandler>);
            let channel = Channel::new(socket.as_raw_fd(), token);
            Connection {
                me: me.clone(),
                id,
                name,
                event_loop,
                socket,
                local_addr,
                peer_addr,
                state: AtomicU8::new(ConnectionState::Connecting as u8),
                channel: Mutex::new(channel),
                input: Mutex::new(ByteBuffer::new()),
                output: Mutex::new(ByteBuffer::new()),
                high_water_mark: AtomicUsize::new(DEFAULT_HIGH_WATER_MARK),
                callbacks: Mutex::new(Callbacks::default()),
            }
        }))
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn event_loop(&self) -> &Arc<EventLoop> {
        &self.event_loop
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn disconnected(&self) -> bool {
        self.state() == ConnectionState::Disconnected
    }

    /// Moves to `to` if the current state is one of `from`.
    fn advance(&self, from: &[ConnectionState], to: ConnectionState) -> bool {
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |cur| {
                let cur = ConnectionState::from_u8(cur);
                (from.contains(&cur) && to > cur).then_some(to as u8)
            })
            .is_ok()
    }

    pub fn set_connection_callback(&self, cb: ConnectionCallback) {
        self.callbacks.lock().connection = Some(cb);
    }

    pub fn set_message_callback(&self, cb: MessageCallback) {
        self.callbacks.lock().message = Some(cb);
    }

    pub fn set_write_complete_callback(&self, cb: WriteCompleteCallback) {
        self.callbacks.lock().write_complete = Some(cb);
    }

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback, mark: usize) {
        self.callbacks.lock().high_water_mark = Some(cb);
        self.high_water_mark.store(mark, Ordering::Relaxed);
    }

    pub fn set_close_callback(&self, cb: CloseCallback) {
        self.callbacks.lock().close = Some(cb);
    }

    pub fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        self.socket.set_nodelay(on)
    }

    /// Bytes queued for output but not yet accepted by the kernel.
    pub fn pending_output(&self) -> usize {
        self.output.lock().readable_bytes()
    }

    /// Called once on the owning loop after the server has set the callbacks.
    pub fn connect_established(&self) {
        let Some(me) = self.me.upgrade() else { return };
        if !self.advance(&[ConnectionState::Connecting], ConnectionState::Connected) {
            tracing::warn!(conn = %self.name, state = ?self.state(), "connection established twice");
            return;
        }
        let watched = {
            let mut channel = self.channel.lock();
            channel.enable_reading();
            self.event_loop.update_channel(&mut channel)
        };
        if let Err(e) = watched {
            // Unwatched sockets would never be read or closed.
            tracing::error!(conn = %self.name, error = %e, "failed to watch connection, closing");
            self.handle_close();
            return;
        }
        tracing::info!(conn = %self.name, peer = %self.peer_addr, "connection up");
        let cb = self.callbacks.lock().connection.clone();
        if let Some(cb) = cb {
            cb(&me);
        }
    }

    /// Last call a connection receives, on its owning loop, after the server
    /// dropped it from its table.
    pub fn connect_destroyed(&self) {
        let Some(me) = self.me.upgrade() else { return };
        if self.advance(&[ConnectionState::Connected], ConnectionState::Disconnected) {
            {
                let mut channel = self.channel.lock();
                channel.disable_all();
                if let Err(e) = self.event_loop.update_channel(&mut channel) {
                    tracing::warn!(conn = %self.name, error = %e, "failed to disarm connection");
                }
            }
            let cb = self.callbacks.lock().connection.clone();
            if let Some(cb) = cb {
                cb(&me);
            }
        }
        let mut channel = self.channel.lock();
        if self.event_loop.has_channel(&channel)
            && let Err(e) = self.event_loop.remove_channel(&mut channel)
        {
            tracing::warn!(conn = %self.name, error = %e, "failed to remove connection channel");
        }
        self.event_loop.deregister(channel.token());
    }

    /// Sends `data`, copying it when called off the owning loop.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnectionState::Connected {
            tracing::debug!(conn = %self.name, state = ?self.state(), "not connected, dropping send");
            return;
        }
        if self.event_loop.is_in_loop_thread() {
            self.send_in_loop(data);
        } else if let Some(me) = self.me.upgrade() {
            let data = data.to_vec();
            self.event_loop.queue_in_loop(move || me.send_in_loop(&data));
        }
    }

    /// Sends and empties `buf`.
    pub fn send_buffer(&self, buf: &mut ByteBuffer) {
        self.send(buf.peek());
        buf.retrieve_all();
    }

    fn send_in_loop(&self, data: &[u8]) {
        if self.disconnected() {
            tracing::warn!(conn = %self.name, "disconnected, give up writing");
            return;
        }
        let mut channel = self.channel.lock();
        let mut output = self.output.lock();

        let mut written = 0;
        if !channel.is_writing() && output.is_empty() {
            match write_nonblocking(&self.socket, data) {
                Ok(n) => written = n,
                Err(e) => {
                    tracing::error!(conn = %self.name, error = %e, "write failed");
                    return;
                }
            }
        }

        let remaining = data.len() - written;
        if remaining == 0 {
            drop(output);
            drop(channel);
            self.queue_write_complete();
            return;
        }

        let queued = output.readable_bytes();
        let mark = self.high_water_mark.load(Ordering::Relaxed);
        output.append(&data[written..]);
        if !channel.is_writing() {
            channel.enable_writing();
            if let Err(e) = self.event_loop.update_channel(&mut channel) {
                tracing::error!(conn = %self.name, error = %e, "failed to arm writing");
            }
        }
        drop(output);
        drop(channel);

        if queued < mark && queued + remaining >= mark {
            self.queue_high_water_mark(queued + remaining);
        }
    }

    /// Half-closes once the output buffer has drained.
    pub fn shutdown(&self) {
        if !self.advance(&[ConnectionState::Connected], ConnectionState::Disconnecting) {
            return;
        }
        if let Some(me) = self.me.upgrade() {
            self.event_loop.run_in_loop(move || me.shutdown_in_loop());
        }
    }

    fn shutdown_in_loop(&self) {
        if self.channel.lock().is_writing() {
            return;
        }
        if let Err(e) = self.socket.shutdown(Shutdown::Write) {
            tracing::warn!(conn = %self.name, error = %e, "shutdown failed");
        }
    }

    /// Closes on the owning loop, discarding unsent output. Idempotent.
    pub fn force_close(&self) {
        match self.state() {
            ConnectionState::Connected | ConnectionState::Disconnecting => {}
            _ => return,
        }
        self.advance(&[ConnectionState::Connected], ConnectionState::Disconnecting);
        if let Some(me) = self.me.upgrade() {
            self.event_loop.queue_in_loop(move || {
                if !me.disconnected() {
                    me.handle_close();
                }
            });
        }
    }

    fn queue_write_complete(&self) {
        let cb = self.callbacks.lock().write_complete.clone();
        if let (Some(cb), Some(me)) = (cb, self.me.upgrade()) {
            self.event_loop.queue_in_loop(move || cb(&me));
        }
    }

    fn queue_high_water_mark(&self, queued: usize) {
        tracing::debug!(conn = %self.name, queued, "output above high-water mark");
        let cb = self.callbacks.lock().high_water_mark.clone();
        if let (Some(cb), Some(me)) = (cb, self.me.upgrade()) {
            self.event_loop.queue_in_loop(move || cb(&me, queued));
        }
    }
}

/// Writes as much of `data` as the socket takes without blocking.
fn write_nonblocking(socket: &TcpStream, data: &[u8]) -> io::Result<usize> {
    let mut written = 0;
    let mut socket = socket;
    while written < data.len() {
        match socket.write(&data[written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => written += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

impl ChannelHandler for Connection {
    fn handle_read(&self, receive_time: Instant) {
        let Some(me) = self.me.upgrade() else { return };
        let mut input = self.input.lock();
        let mut received = 0;
        let mut eof = false;
        let mut failure = None;
        let mut socket = &self.socket;
        loop {
            match input.read_from(&mut socket) {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(n) => received += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if received > 0 {
            let cb = self.callbacks.lock().message.clone();
            match cb {
                Some(cb) => cb(&me, &mut input, receive_time),
                None => input.retrieve_all(),
            }
        }
        drop(input);

        if let Some(e) = failure {
            tracing::error!(conn = %self.name, error = %e, "read failed");
            self.handle_close();
        } else if eof {
            self.handle_close();
        }
    }

    fn handle_write(&self) {
        let mut channel = self.channel.lock();
        if !channel.is_writing() {
            tracing::trace!(conn = %self.name, "connection is down, no more writing");
            return;
        }
        let mut output = self.output.lock();
        match write_nonblocking(&self.socket, output.peek()) {
            Ok(n) => {
                if let Err(e) = output.retrieve(n) {
                    tracing::error!(conn = %self.name, error = %e, "output buffer out of sync");
                }
            }
            Err(e) => {
                tracing::error!(conn = %self.name, error = %e, "write failed");
                return;
            }
        }
        if !output.is_empty() {
            return;
        }
        channel.disable_writing();
        if let Err(e) = self.event_loop.update_channel(&mut channel) {
            tracing::error!(conn = %self.name, error = %e, "failed to disarm writing");
        }
        drop(output);
        drop(channel);

        self.queue_write_complete();
        if self.state() == ConnectionState::Disconnecting {
            self.shutdown_in_loop();
        }
    }

    fn handle_close(&self) {
        let Some(me) = self.me.upgrade() else { return };
        if !self.advance(
            &[ConnectionState::Connected, ConnectionState::Disconnecting],
            ConnectionState::Disconnected,
        ) {
            return;
        }
        {
            let mut channel = self.channel.lock();
            channel.disable_all();
            if let Err(e) = self.event_loop.update_channel(&mut channel) {
                tracing::warn!(conn = %self.name, error = %e, "failed to disarm connection");
            }
        }
        tracing::info!(conn = %self.name, peer = %self.peer_addr, "connection down");

        let callbacks = self.callbacks.lock().clone();
        if let Some(cb) = callbacks.connection {
            cb(&me);
        }
        if let Some(cb) = callbacks.close {
            cb(&me);
        }
    }

    fn handle_error(&self) {
        match self.socket.take_error() {
            Ok(Some(e)) => tracing::error!(conn = %self.name, error = %e, "socket error"),
            Ok(None) => {}
            Err(e) => tracing::error!(conn = %self.name, error = %e, "failed to read socket error"),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        tracing::debug!(conn = %self.name, state = ?self.state(), "connection dropped");
    }
}
