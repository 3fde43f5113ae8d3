//! Reactor-style networking with pluggable poller backends, plus a resumable
//! chunked file transfer service built on it.

#[cfg(not(unix))]
compile_error!("fileloop only supports Unix targets");

pub mod buffer;
pub mod channel;
pub mod config;
pub mod connection;
pub mod error;
pub mod file_manager;
pub mod file_server;
pub mod file_session;
pub mod io;
pub mod logging;
pub mod poller;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod session;
pub mod task;
pub mod thread_pool;
pub mod timer;
pub mod waker;

pub use buffer::ByteBuffer;
pub use config::{ConfigReader, ServerConfig};
pub use connection::{Connection, ConnectionId, ConnectionState};
pub use error::{Error, Result};
pub use file_manager::FileManager;
pub use file_server::FileServer;
pub use file_session::{FileSession, FileTransfer, TransferSettings};
pub use poller::PollerKind;
pub use protocol::{FrameCodec, HeaderOrder, NetworkType, Request, Response, Status};
pub use reactor::EventLoop;
pub use server::{Server, ServerOptions};
pub use timer::TimerId;
