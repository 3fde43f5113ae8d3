use std::io;

use thiserror::Error;

use crate::buffer::BufferError;
use crate::config::ConfigError;
use crate::file_session::TransferError;
use crate::logging::LogError;
use crate::poller::PollerError;
use crate::protocol::ProtocolError;
use crate::reactor::LoopError;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Buffer(#[from] BufferError),

    #[error(transparent)]
    Poller(#[from] PollerError),

    #[error(transparent)]
    Loop(#[from] LoopError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Log(#[from] LogError),
}

pub type Result<T> = std::result::Result<T, Error>;
