//! File transfer wire format.
//!
//! A frame is an 8-byte signed body length followed by the body. Body
//! integers are network order; strings are a `u32` length and raw bytes.
//!
//! ```text
//! request:  cmd:i32 seq:i32 id:str offset:i64 filesize:i64 data:str [network:i32]
//! response: cmd:i32 seq:i32 status:i32 id:str offset:i64 filesize:i64 data:str
//! ```
//!
//! `network` is only present on download requests.

pub mod client;

use std::fmt;
use std::io::{self, Cursor, Read};
use std::str::FromStr;

use byteorder::{BigEndian, LittleEndian, NetworkEndian, ReadBytesExt};
use thiserror::Error;

use crate::buffer::{BufferError, ByteBuffer};

pub const HEADER_LEN: usize = 8;
pub const MAX_PACKAGE_SIZE: usize = 50 * 1024 * 1024;
pub const BROADBAND_CHUNK: usize = 512 * 1024;
pub const CELLULAR_CHUNK: usize = 64 * 1024;
/// Longest content id; one file name component on common filesystems.
pub const MAX_FILE_ID_LEN: usize = 255;
/// Response body size apart from the chunk, with the longest content id.
pub const RESPONSE_OVERHEAD: usize = 4 + 4 + 4 + (4 + MAX_FILE_ID_LEN) + 8 + 8 + 4;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("illegal package length {0}")]
    IllegalLength(i64),

    #[error("truncated field `{field}`")]
    Truncated { field: &'static str },

    #[error("field `{field}` has illegal length {len}")]
    FieldLength { field: &'static str, len: usize },

    #[error("unknown command {0}")]
    UnknownCommand(i32),

    #[error("unexpected command {0:?}")]
    UnexpectedCommand(Command),

    #[error("unknown status {0}")]
    UnknownStatus(i32),

    #[error("unknown network type {0}")]
    UnknownNetworkType(i32),

    #[error("download request carries {0} data bytes")]
    DownloadWithData(usize),

    #[error("{0} trailing bytes after message body")]
    TrailingBytes(usize),

    #[error("invalid file id {0:?}")]
    InvalidFileId(String),

    #[error("session state violation: {0}")]
    State(String),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

macro_rules! wire_enum {
    ($name:ident, $err:ident, { $($variant:ident = $val:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(i32)]
        pub enum $name {
            $($variant = $val),+
        }

        impl TryFrom<i32> for $name {
            type Error = ProtocolError;

            fn try_from(v: i32) -> Result<Self, ProtocolError> {
                match v {
                    $($val => Ok($name::$variant),)+
                    other => Err(ProtocolError::$err(other)),
                }
            }
        }
    };
}

wire_enum!(Command, UnknownCommand, {
    Unknown = 0,
    UploadReq = 1,
    UploadResp = 2,
    DownloadReq = 3,
    DownloadResp = 4,
});

wire_enum!(Status, UnknownStatus, {
    Unknown = 0,
    InProgress = 1,
    Complete = 2,
    NotFound = 3,
});

wire_enum!(NetworkType, UnknownNetworkType, {
    Broadband = 0,
    Cellular = 1,
});

/// Byte order of the frame header. Body fields are always network order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderOrder {
    #[default]
    Little,
    Big,
}

impl FromStr for HeaderOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "little" | "le" => Ok(HeaderOrder::Little),
            "big" | "be" | "network" => Ok(HeaderOrder::Big),
            other => Err(format!("unknown byte order `{other}`")),
        }
    }
}

impl fmt::Display for HeaderOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderOrder::Little => f.write_str("little"),
            HeaderOrder::Big => f.write_str("big"),
        }
    }
}

/// A message body that can be framed by [`FrameCodec`].
pub trait Message: Sized {
    fn encode_body(&self, out: &mut ByteBuffer) -> Result<(), ProtocolError>;

    fn decode_body(body: &[u8]) -> Result<Self, ProtocolError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub cmd: Command,
    pub seq: i32,
    pub file_id: String,
    pub offset: i64,
    pub file_size: i64,
    pub data: Vec<u8>,
    pub network: NetworkType,
}

impl Request {
    pub fn upload(seq: i32, file_id: impl Into<String>, offset: i64, file_size: i64, data: Vec<u8>) -> Self {
        Self {
            cmd: Command::UploadReq,
            seq,
            file_id: file_id.into(),
            offset,
            file_size,
            data,
            network: NetworkType::Broadband,
        }
    }

    pub fn download(seq: i32, file_id: impl Into<String>, offset: i64, network: NetworkType) -> Self {
        Self {
            cmd: Command::DownloadReq,
            seq,
            file_id: file_id.into(),
            offset,
            file_size: 0,
            data: Vec::new(),
            network,
        }
    }
}

impl Message for Request {
    fn encode_body(&self, out: &mut ByteBuffer) -> Result<(), ProtocolError> {
        out.append_i32(self.cmd as i32);
        out.append_i32(self.seq);
        append_string(out, "filemd5", self.file_id.as_bytes())?;
        out.append_i64(self.offset);
        out.append_i64(self.file_size);
        append_string(out, "filedata", &self.data)?;
        if self.cmd == Command::DownloadReq {
            out.append_i32(self.network as i32);
        }
        Ok(())
    }

    fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut rd = Cursor::new(body);
        let cmd = Command::try_from(read_i32(&mut rd, "cmd")?)?;
        if cmd != Command::UploadReq && cmd != Command::DownloadReq {
            return Err(ProtocolError::UnexpectedCommand(cmd));
        }
        let seq = read_i32(&mut rd, "seq")?;
        let file_id = String::from_utf8(read_string(&mut rd, "filemd5")?)
            .map_err(|e| ProtocolError::InvalidFileId(String::from_utf8_lossy(e.as_bytes()).into_owned()))?;
        let offset = read_i64(&mut rd, "offset")?;
        let file_size = read_i64(&mut rd, "filesize")?;
        let data = read_string(&mut rd, "filedata")?;
        let network = if cmd == Command::DownloadReq {
            if !data.is_empty() {
                return Err(ProtocolError::DownloadWithData(data.len()));
            }
            NetworkType::try_from(read_i32(&mut rd, "clientNetworkType")?)?
        } else {
            NetworkType::Broadband
        };
        expect_end(&rd)?;
        Ok(Self {
            cmd,
            seq,
            file_id,
            offset,
            file_size,
            data,
            network,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub cmd: Command,
    pub seq: i32,
    pub status: Status,
    pub file_id: String,
    /// Offset after the chunk this response acknowledges or carries.
    pub offset: i64,
    pub file_size: i64,
    pub data: Vec<u8>,
}

impl Response {
    /// Reply skeleton for `req` with no payload.
    pub fn reply_to(req: &Request, status: Status, offset: i64, file_size: i64) -> Self {
        let cmd = match req.cmd {
            Command::DownloadReq => Command::DownloadResp,
            _ => Command::UploadResp,
        };
        Self {
            cmd,
            seq: req.seq,
            status,
            file_id: req.file_id.clone(),
            offset,
            file_size,
            data: Vec::new(),
        }
    }

    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

impl Message for Response {
    fn encode_body(&self, out: &mut ByteBuffer) -> Result<(), ProtocolError> {
        out.append_i32(self.cmd as i32);
        out.append_i32(self.seq);
        out.append_i32(self.status as i32);
        append_string(out, "filemd5", self.file_id.as_bytes())?;
        out.append_i64(self.offset);
        out.append_i64(self.file_size);
        append_string(out, "filedata", &self.data)
    }

    fn decode_body(body: &[u8]) -> Result<Self, ProtocolError> {
        let mut rd = Cursor::new(body);
        let cmd = Command::try_from(read_i32(&mut rd, "cmd")?)?;
        let seq = read_i32(&mut rd, "seq")?;
        let status = Status::try_from(read_i32(&mut rd, "status")?)?;
        let file_id = String::from_utf8_lossy(&read_string(&mut rd, "filemd5")?).into_owned();
        let offset = read_i64(&mut rd, "offset")?;
        let file_size = read_i64(&mut rd, "filesize")?;
        let data = read_string(&mut rd, "filedata")?;
        expect_end(&rd)?;
        Ok(Self {
            cmd,
            seq,
            status,
            file_id,
            offset,
            file_size,
            data,
        })
    }
}

fn append_string(out: &mut ByteBuffer, field: &'static str, s: &[u8]) -> Result<(), ProtocolError> {
    let len = i32::try_from(s.len()).map_err(|_| ProtocolError::FieldLength { field, len: s.len() })?;
    out.append_i32(len);
    out.append(s);
    Ok(())
}

fn read_i32(rd: &mut Cursor<&[u8]>, field: &'static str) -> Result<i32, ProtocolError> {
    rd.read_i32::<NetworkEndian>().map_err(|_| ProtocolError::Truncated { field })
}

fn read_i64(rd: &mut Cursor<&[u8]>, field: &'static str) -> Result<i64, ProtocolError> {
    rd.read_i64::<NetworkEndian>().map_err(|_| ProtocolError::Truncated { field })
}

fn read_string(rd: &mut Cursor<&[u8]>, field: &'static str) -> Result<Vec<u8>, ProtocolError> {
    let len = rd.read_u32::<NetworkEndian>().map_err(|_| ProtocolError::Truncated { field })? as usize;
    let left = remaining(rd);
    if len > left {
        return Err(ProtocolError::FieldLength { field, len });
    }
    let mut s = vec![0u8; len];
    rd.read_exact(&mut s).map_err(|_| ProtocolError::Truncated { field })?;
    Ok(s)
}

fn remaining(rd: &Cursor<&[u8]>) -> usize {
    rd.get_ref().len().saturating_sub(rd.position() as usize)
}

fn expect_end(rd: &Cursor<&[u8]>) -> Result<(), ProtocolError> {
    match remaining(rd) {
        0 => Ok(()),
        n => Err(ProtocolError::TrailingBytes(n)),
    }
}

/// Splits frames out of a connection's input buffer and builds outgoing ones.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    header_order: HeaderOrder,
    max_body: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(HeaderOrder::default(), MAX_PACKAGE_SIZE)
    }
}

impl FrameCodec {
    pub fn new(header_order: HeaderOrder, max_body: usize) -> Self {
        Self { header_order, max_body }
    }

    pub fn header_order(&self) -> HeaderOrder {
        self.header_order
    }

    pub fn max_body(&self) -> usize {
        self.max_body
    }

    fn peek_len(&self, buf: &ByteBuffer) -> Option<i64> {
        match self.header_order {
            HeaderOrder::Little => buf.peek_i64_with::<LittleEndian>(),
            HeaderOrder::Big => buf.peek_i64_with::<BigEndian>(),
        }
    }

    /// Checks a declared body length.
    pub fn check_len(&self, len: i64) -> Result<usize, ProtocolError> {
        match usize::try_from(len) {
            Ok(n) if n > 0 && n <= self.max_body => Ok(n),
            _ => Err(ProtocolError::IllegalLength(len)),
        }
    }

    /// Takes one complete body out of `buf`.
    ///
    /// `Ok(None)` means more bytes are needed. An illegal length leaves the
    /// buffer untouched so the caller can dump the header.
    pub fn decode(&self, buf: &mut ByteBuffer) -> Result<Option<Vec<u8>>, ProtocolError> {
        let Some(len) = self.peek_len(buf) else {
            return Ok(None);
        };
        let len = self.check_len(len)?;
        if buf.readable_bytes() < HEADER_LEN + len {
            return Ok(None);
        }
        buf.retrieve(HEADER_LEN)?;
        Ok(Some(buf.retrieve_as_bytes(len)?))
    }

    pub fn decode_header(&self, header: [u8; HEADER_LEN]) -> Result<usize, ProtocolError> {
        let len = match self.header_order {
            HeaderOrder::Little => i64::from_le_bytes(header),
            HeaderOrder::Big => i64::from_be_bytes(header),
        };
        self.check_len(len)
    }

    /// Encodes `msg` with its header in the buffer's reserved prefix.
    pub fn encode<M: Message>(&self, msg: &M) -> Result<ByteBuffer, ProtocolError> {
        let mut buf = ByteBuffer::new();
        msg.encode_body(&mut buf)?;
        let len = buf.readable_bytes();
        if len > self.max_body {
            return Err(ProtocolError::IllegalLength(len as i64));
        }
        match self.header_order {
            HeaderOrder::Little => buf.prepend_i64_with::<LittleEndian>(len as i64)?,
            HeaderOrder::Big => buf.prepend_i64_with::<BigEndian>(len as i64)?,
        }
        Ok(buf)
    }
}

impl From<ProtocolError> for io::Error {
    fn from(e: ProtocolError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}
