//! Protocol handler bound to a connection it does not own.

use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use crate::connection::{Connection, ConnectionId};
use crate::protocol::{FrameCodec, Message};

pub struct TcpSession {
    conn: Weak<Connection>,
    id: ConnectionId,
    peer: SocketAddr,
    codec: FrameCodec,
}

impl TcpSession {
    pub fn new(conn: &Arc<Connection>, codec: FrameCodec) -> Self {
        Self {
            conn: Arc::downgrade(conn),
            id: conn.id(),
            peer: conn.peer_addr(),
            codec,
        }
    }

    /// The connection, if it is still alive. Hold the result only for one operation.
    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.conn.upgrade()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub fn codec(&self) -> &FrameCodec {
        &self.codec
    }

    /// Frames and sends `msg`. Returns false when nothing was sent.
    pub fn send<M: Message>(&self, msg: &M) -> bool {
        let mut frame = match self.codec.encode(msg) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(peer = %self.peer, error = %e, "failed to encode message");
                return false;
            }
        };
        let Some(conn) = self.connection() else {
            tracing::debug!(peer = %self.peer, "connection already gone, dropping message");
            return false;
        };
        conn.send_buffer(&mut frame);
        true
    }

    pub fn close(&self) {
        if let Some(conn) = self.connection() {
            conn.force_close();
        }
    }
}
