//! The file transfer service: a [`Server`] with one [`FileSession`] per connection.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use crate::buffer::ByteBuffer;
use crate::connection::{Connection, ConnectionId};
use crate::file_manager::FileManager;
use crate::file_session::{FileSession, TransferSettings};
use crate::protocol::FrameCodec;
use crate::reactor::EventLoop;
use crate::server::{Server, ServerOptions};

pub const SERVER_NAME: &str = "fileserver";

type SessionTable = Mutex<HashMap<ConnectionId, Arc<Mutex<FileSession>>>>;

pub struct FileServer {
    server: Arc<Server>,
    manager: Arc<FileManager>,
    sessions: Arc<SessionTable>,
}

impl FileServer {
    pub fn new(
        base_loop: Arc<EventLoop>,
        addr: SocketAddr,
        options: ServerOptions,
        manager: Arc<FileManager>,
        codec: FrameCodec,
        settings: TransferSettings,
    ) -> io::Result<Self> {
        let server = Server::new(base_loop, addr, SERVER_NAME, options)?;
        let sessions: Arc<SessionTable> = Arc::new(Mutex::new(HashMap::new()));

        let table = sessions.clone();
        let files = manager.clone();
        server.set_connection_callback(Arc::new(move |conn: &Arc<Connection>| {
            if conn.connected() {
                tracing::info!(peer = %conn.peer_addr(), conn = %conn.name(), "client connected");
                let session = FileSession::new(conn, codec, files.clone(), settings);
                table.lock().insert(conn.id(), Arc::new(Mutex::new(session)));
            } else if table.lock().remove(&conn.id()).is_some() {
                tracing::info!(peer = %conn.peer_addr(), conn = %conn.name(), "client disconnected");
            } else {
                tracing::warn!(peer = %conn.peer_addr(), "disconnected connection had no session");
            }
        }));

        let table = sessions.clone();
        server.set_message_callback(Arc::new(
            move |conn: &Arc<Connection>, buf: &mut ByteBuffer, receive_time: Instant| {
                let session = table.lock().get(&conn.id()).cloned();
                match session {
                    Some(session) => session.lock().on_message(buf, receive_time),
                    None => {
                        tracing::warn!(peer = %conn.peer_addr(), "data for connection without session");
                        buf.retrieve_all();
                    }
                }
            },
        ));

        Ok(Self {
            server,
            manager,
            sessions,
        })
    }

    pub fn start(&self) -> io::Result<()> {
        self.server.start()
    }

    pub fn stop(&self) {
        self.server.stop();
        self.sessions.lock().clear();
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn connection_count(&self) -> usize {
        self.server.connection_count()
    }

    pub fn manager(&self) -> &Arc<FileManager> {
        &self.manager
    }
}
