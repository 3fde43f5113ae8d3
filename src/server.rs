//! TCP server: an acceptor on the base loop, connections spread over a
//! loop-per-thread pool.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::connection::{
    Connection, ConnectionCallback, ConnectionId, DEFAULT_HIGH_WATER_MARK, HighWaterMarkCallback,
    MessageCallback, WriteCompleteCallback,
};
use crate::io::Acceptor;
use crate::poller::PollerKind;
use crate::reactor::EventLoop;
use crate::thread_pool::EventLoopThreadPool;

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub reuse_port: bool,
    /// I/O loop threads; 0 keeps every connection on the base loop.
    pub io_threads: usize,
    pub poller: Option<PollerKind>,
    pub high_water_mark: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            reuse_port: true,
            io_threads: 0,
            poller: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }
}

#[derive(Default, Clone)]
struct ServerCallbacks {
    connection: Option<ConnectionCallback>,
    message: Option<MessageCallback>,
    write_complete: Option<WriteCompleteCallback>,
    high_water_mark: Option<HighWaterMarkCallback>,
}

pub struct Server {
    me: Weak<Server>,
    name: String,
    listen_addr: SocketAddr,
    base_loop: Arc<EventLoop>,
    acceptor: Arc<Acceptor>,
    pool: Mutex<EventLoopThreadPool>,
    options: ServerOptions,
    connections: Mutex<HashMap<ConnectionId, Arc<Connection>>>,
    next_id: AtomicU64,
    started: AtomicBool,
    callbacks: Mutex<ServerCallbacks>,
}

impl Server {
    pub fn new(
        base_loop: Arc<EventLoop>,
        addr: SocketAddr,
        name: impl Into<String>,
        options: ServerOptions,
    ) -> io::Result<Arc<Self>> {
        let name = name.into();
        let acceptor = Acceptor::new(base_loop.clone(), addr, options.reuse_port)?;
        let listen_addr = acceptor.local_addr()?;
        let pool = EventLoopThreadPool::new(base_loop.clone(), name.clone());

        let server = Arc::new_cyclic(|me: &Weak<Server>| Server {
            me: me.clone(),
            name,
            listen_addr,
            base_loop,
            acceptor,
            pool: Mutex::new(pool),
            options,
            connections: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            started: AtomicBool::new(false),
            callbacks: Mutex::new(ServerCallbacks::default()),
        });

        let weak = Arc::downgrade(&server);
        server
            .acceptor
            .set_new_connection_callback(Box::new(move |stream, peer| {
                if let Some(server) = weak.upgrade() {
                    server.new_connection(stream, peer);
                }
            }));
        Ok(server)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn base_loop(&self) -> &Arc<EventLoop> {
        &self.base_loop
    }

    pub fn connection_count(&self) -> usize {
        self.connections.lock().len()
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

    pub fn set_high_water_mark_callback(&self, cb: HighWaterMarkCallback) {
        self.callbacks.lock().high_water_mark = Some(cb);
    }

    /// Starts the I/O threads and begins accepting. Safe to call more than once.
    pub fn start(&self) -> io::Result<()> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.pool
            .lock()
            .start(self.options.io_threads, self.options.poller)?;

        let acceptor = self.acceptor.clone();
        self.base_loop.run_in_loop(move || {
            if let Err(e) = acceptor.listen() {
                tracing::error!(error = %e, "failed to start listening");
            }
        });
        tracing::info!(server = %self.name, addr = %self.listen_addr, io_threads = self.options.io_threads, "server started");
        Ok(())
    }

    /// Stops accepting, force-closes every live connection and joins the I/O threads.
    pub fn stop(&self) {
        if !self.started.swap(false, Ordering::AcqRel) {
            return;
        }
        let acceptor = self.acceptor.clone();
        self.base_loop.run_in_loop(move || acceptor.close());

        let live: Vec<Arc<Connection>> = self.connections.lock().drain().map(|(_, c)| c).collect();
        for conn in &live {
            conn.force_close();
            let destroyed = conn.clone();
            conn.event_loop().queue_in_loop(move || destroyed.connect_destroyed());
        }
        self.pool.lock().stop();
        tracing::info!(server = %self.name, closed = live.len(), "server stopped");
    }

    fn new_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let io_loop = self.pool.lock().next_loop();
        let name = format!("{}-{}{}", self.name, self.listen_addr, id);
        tracing::info!(server = %self.name, conn = %name, %peer, "new connection");

        let conn = match Connection::new(io_loop.clone(), id, name, stream, peer) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(%peer, error = %e, "failed to set up connection");
                return;
            }
        };

        let callbacks = self.callbacks.lock().clone();
        match callbacks.connection {
            Some(cb) => conn.set_connection_callback(cb),
            None => conn.set_connection_callback(Arc::new(default_connection_callback)),
        }
        if let Some(cb) = callbacks.message {
            conn.set_message_callback(cb);
        }
        if let Some(cb) = callbacks.write_complete {
            conn.set_write_complete_callback(cb);
        }
        if let Some(cb) = callbacks.high_water_mark {
            conn.set_high_water_mark_callback(cb, self.options.high_water_mark);
        }
        let me = self.me.clone();
        conn.set_close_callback(Arc::new(move |c: &Arc<Connection>| {
            if let Some(server) = me.upgrade() {
                server.remove_connection(c);
            }
        }));

        self.connections.lock().insert(id, conn.clone());
        io_loop.run_in_loop(move || conn.connect_established());
    }

    fn remove_connection(&self, conn: &Arc<Connection>) {
        if self.connections.lock().remove(&conn.id()).is_none() {
            return;
        }
        tracing::debug!(server = %self.name, conn = %conn.name(), "connection removed");
        let destroyed = conn.clone();
        conn.event_loop().queue_in_loop(move || destroyed.connect_destroyed());
    }
}

fn default_connection_callback(conn: &Arc<Connection>) {
    tracing::trace!(
        conn = %conn.name(),
        local = %conn.local_addr(),
        peer = %conn.peer_addr(),
        up = conn.connected(),
        "connection state changed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ByteBuffer;
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::thread;
    use std::time::{Duration, Instant};

    fn spawn_loop() -> (Arc<EventLoop>, thread::JoinHandle<()>) {
        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let lp = EventLoop::new().unwrap();
            tx.send(lp.clone()).unwrap();
            lp.run().unwrap();
        });
        (rx.recv().unwrap(), handle)
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn echo_across_io_threads() {
        let (lp, handle) = spawn_loop();
        let options = ServerOptions {
            io_threads: 2,
            ..ServerOptions::default()
        };
        let server = Server::new(lp.clone(), "127.0.0.1:0".parse().unwrap(), "echo", options).unwrap();
        server.set_message_callback(Arc::new(|c: &Arc<Connection>, buf: &mut ByteBuffer, _| {
            c.send_buffer(buf);
        }));
        server.start().unwrap();
        server.start().unwrap();

        let mut clients: Vec<TcpStream> = (0..3)
            .map(|_| TcpStream::connect(server.local_addr()).unwrap())
            .collect();
        for (i, client) in clients.iter_mut().enumerate() {
            let msg = format!("ping-{i}");
            client.write_all(msg.as_bytes()).unwrap();
            let mut back = vec![0u8; msg.len()];
            client.read_exact(&mut back).unwrap();
            assert_eq!(back, msg.as_bytes());
        }
        assert!(wait_until(|| server.connection_count() == 3));

        clients.pop();
        assert!(wait_until(|| server.connection_count() == 2));

        server.stop();
        assert_eq!(server.connection_count(), 0);
        lp.quit();
        handle.join().unwrap();
    }

    #[test]
    fn connection_names_carry_listen_addr_and_id() {
        let (lp, handle) = spawn_loop();
        let server = Server::new(lp.clone(), "127.0.0.1:0".parse().unwrap(), "named", ServerOptions::default()).unwrap();
        let (tx, rx) = mpsc::channel();
        server.set_connection_callback(Arc::new(move |c: &Arc<Connection>| {
            if c.connected() {
                tx.send(c.name().to_string()).unwrap();
            }
        }));
        server.start().unwrap();
        let _client = TcpStream::connect(server.local_addr()).unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name, format!("named-{}#1", server.local_addr()));
        server.stop();
        lp.quit();
        handle.join().unwrap();
    }
}
