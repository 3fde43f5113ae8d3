//! Blocking client for the file transfer protocol.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use super::{FrameCodec, HEADER_LEN, Message, NetworkType, Request, Response, Status};
use crate::error::Result;

const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Bytes and replies gathered by [`FileClient::download`].
#[derive(Debug, Default)]
pub struct Download {
    pub data: Vec<u8>,
    pub responses: Vec<Response>,
}

impl Download {
    pub fn status(&self) -> Status {
        self.responses.last().map_or(Status::Unknown, |r| r.status)
    }
}

pub struct FileClient {
    stream: TcpStream,
    codec: FrameCodec,
    next_seq: i32,
}

impl FileClient {
    pub fn connect(addr: SocketAddr, codec: FrameCodec) -> Result<Self> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(DEFAULT_READ_TIMEOUT))?;
        Ok(Self {
            stream,
            codec,
            next_seq: 0,
        })
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.stream.set_read_timeout(timeout)?;
        Ok(())
    }

    pub fn next_seq(&mut self) -> i32 {
        self.next_seq = self.next_seq.wrapping_add(1);
        self.next_seq
    }

    pub fn send(&mut self, req: &Request) -> Result<()> {
        let frame = self.codec.encode(req)?;
        self.stream.write_all(frame.peek())?;
        Ok(())
    }

    /// Writes bytes as-is, framing included.
    pub fn send_raw(&mut self, bytes: &[u8]) -> Result<()> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    pub fn read_response(&mut self) -> Result<Response> {
        let mut header = [0u8; HEADER_LEN];
        self.stream.read_exact(&mut header)?;
        let len = self.codec.decode_header(header)?;
        let mut body = vec![0u8; len];
        self.stream.read_exact(&mut body)?;
        Ok(Response::decode_body(&body)?)
    }

    pub fn call(&mut self, req: &Request) -> Result<Response> {
        self.send(req)?;
        self.read_response()
    }

    /// Uploads `data[from..]` in `chunk`-sized pieces and returns every reply.
    ///
    /// Stops early when the server answers anything but "in progress".
    pub fn upload(&mut self, file_id: &str, data: &[u8], from: usize, chunk: usize) -> Result<Vec<Response>> {
        let file_size = data.len() as i64;
        let chunk = chunk.max(1);
        let mut responses = Vec::new();
        let mut offset = from.min(data.len());
        loop {
            let end = (offset + chunk).min(data.len());
            let seq = self.next_seq();
            let req = Request::upload(seq, file_id, offset as i64, file_size, data[offset..end].to_vec());
            let resp = self.call(&req)?;
            let status = resp.status;
            responses.push(resp);
            if status != Status::InProgress || end == data.len() {
                break;
            }
            offset = end;
        }
        Ok(responses)
    }

    /// Downloads a whole file starting at `offset`.
    pub fn download(&mut self, file_id: &str, offset: i64, network: NetworkType) -> Result<Download> {
        let mut out = Download::default();
        let mut offset = offset;
        loop {
            let seq = self.next_seq();
            let resp = self.call(&Request::download(seq, file_id, offset, network))?;
            out.data.extend_from_slice(&resp.data);
            offset = resp.offset;
            let status = resp.status;
            out.responses.push(resp);
            if status != Status::InProgress {
                break;
            }
        }
        Ok(out)
    }

    /// True once the server has closed its end.
    pub fn is_closed(&mut self) -> bool {
        let mut byte = [0u8; 1];
        match self.stream.read(&mut byte) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => e.kind() == std::io::ErrorKind::ConnectionReset,
        }
    }
}
