//! Resumable chunked upload and download.
//!
//! [`FileTransfer`] is the per-connection state machine and knows nothing
//! about sockets; [`FileSession`] feeds it decoded frames and sends replies.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::buffer::ByteBuffer;
use crate::connection::Connection;
use crate::file_manager::FileManager;
use crate::logging;
use crate::protocol::{
    BROADBAND_CHUNK, CELLULAR_CHUNK, Command, FrameCodec, HEADER_LEN, Message, NetworkType, ProtocolError, Request,
    Response, Status,
};
use crate::session::TcpSession;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{op} failed for {file_id} at offset {offset} (size {size}): {source}")]
    Io {
        op: &'static str,
        file_id: String,
        offset: i64,
        size: i64,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct TransferSettings {
    pub broadband_chunk: usize,
    pub cellular_chunk: usize,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            broadband_chunk: BROADBAND_CHUNK,
            cellular_chunk: CELLULAR_CHUNK,
        }
    }
}

impl TransferSettings {
    pub fn chunk_for(&self, network: NetworkType) -> usize {
        match network {
            NetworkType::Broadband => self.broadband_chunk,
            NetworkType::Cellular => self.cellular_chunk,
        }
    }
}

enum TransferState {
    Idle,
    Uploading {
        file: File,
        file_id: String,
        file_size: i64,
    },
    Downloading {
        file: File,
        file_id: String,
        offset: i64,
        file_size: i64,
    },
}

/// One session's transfer state. At most one file is open at a time.
pub struct FileTransfer {
    manager: Arc<FileManager>,
    settings: TransferSettings,
    state: TransferState,
}

impl FileTransfer {
    pub fn new(manager: Arc<FileManager>, settings: TransferSettings) -> Self {
        Self {
            manager,
            settings,
            state: TransferState::Idle,
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, TransferState::Idle)
    }

    pub fn is_uploading(&self) -> bool {
        matches!(self.state, TransferState::Uploading { .. })
    }

    pub fn is_downloading(&self) -> bool {
        matches!(self.state, TransferState::Downloading { .. })
    }

    /// Closes any open file and forgets offsets.
    pub fn reset(&mut self) {
        self.state = TransferState::Idle;
    }

    /// Executes one request. Any error leaves the transfer idle.
    pub fn handle(&mut self, req: &Request) -> Result<Response, TransferError> {
        let result = match req.cmd {
            Command::UploadReq => self.upload(req),
            Command::DownloadReq => self.download(req),
            other => Err(ProtocolError::UnexpectedCommand(other).into()),
        };
        if result.is_err() {
            self.reset();
        }
        result
    }

    fn upload(&mut self, req: &Request) -> Result<Response, TransferError> {
        let next = i64::try_from(req.data.len())
            .ok()
            .and_then(|len| req.offset.checked_add(len))
            .filter(|&end| req.offset >= 0 && end <= req.file_size);
        let Some(next) = next else {
            return Err(state_error(format!(
                "upload chunk of {} bytes at offset {} outside file size {}",
                req.data.len(),
                req.offset,
                req.file_size
            )));
        };
        let path = self.manager.path_of(&req.file_id)?;

        match &self.state {
            TransferState::Uploading { file_id, file_size, .. } if *file_id == req.file_id => {
                if *file_size != req.file_size {
                    return Err(state_error(format!(
                        "file size changed from {file_size} to {} mid upload",
                        req.file_size
                    )));
                }
                if req.offset == 0 {
                    tracing::info!(id = %req.file_id, "upload restarted from zero");
                    self.start_upload(req, path, true)?;
                }
            }
            TransferState::Uploading { file_id, .. } => {
                if req.offset != 0 {
                    return Err(state_error(format!(
                        "chunk for {} while {file_id} is uploading",
                        req.file_id
                    )));
                }
                tracing::warn!(id = %file_id, next = %req.file_id, "abandoning unfinished upload");
                self.start_upload(req, path, true)?;
            }
            TransferState::Idle | TransferState::Downloading { .. } => {
                if self.manager.exists(&req.file_id) {
                    self.reset();
                    tracing::info!(id = %req.file_id, "file already exists, upload skipped");
                    return Ok(Response::reply_to(req, Status::Complete, req.file_size, req.file_size));
                }
                if req.offset == 0 {
                    self.start_upload(req, path, true)?;
                } else {
                    self.resume_upload(req, path)?;
                }
            }
        }

        let TransferState::Uploading { file, .. } = &mut self.state else {
            return Err(state_error("upload state lost".to_string()));
        };
        let io_err = |op, source| TransferError::Io {
            op,
            file_id: req.file_id.clone(),
            offset: req.offset,
            size: req.file_size,
            source,
        };
        file.seek(SeekFrom::Start(req.offset as u64)).map_err(|e| io_err("seek", e))?;
        file.write_all(&req.data).map_err(|e| io_err("write", e))?;
        file.flush().map_err(|e| io_err("flush", e))?;

        if next == req.file_size {
            self.manager.add_file(&req.file_id);
            self.reset();
            tracing::info!(id = %req.file_id, size = req.file_size, "upload complete");
            return Ok(Response::reply_to(req, Status::Complete, next, req.file_size));
        }
        tracing::debug!(id = %req.file_id, offset = next, size = req.file_size, "upload progress");
        Ok(Response::reply_to(req, Status::InProgress, next, req.file_size))
    }

    fn start_upload(&mut self, req: &Request, path: PathBuf, truncate: bool) -> Result<(), TransferError> {
        self.reset();
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(truncate)
            .open(&path)
            .map_err(|source| TransferError::Io {
                op: "open",
                file_id: req.file_id.clone(),
                offset: req.offset,
                size: req.file_size,
                source,
            })?;
        self.state = TransferState::Uploading {
            file,
            file_id: req.file_id.clone(),
            file_size: req.file_size,
        };
        Ok(())
    }

    /// Picks up a partial file left by an earlier connection.
    fn resume_upload(&mut self, req: &Request, path: PathBuf) -> Result<(), TransferError> {
        let on_disk = match path.metadata() {
            Ok(meta) if meta.is_file() => meta.len() as i64,
            _ => {
                return Err(state_error(format!(
                    "upload of {} at offset {} with no file open",
                    req.file_id, req.offset
                )));
            }
        };
        if on_disk < req.offset {
            return Err(state_error(format!(
                "upload of {} resumes at {} but only {on_disk} bytes are stored",
                req.file_id, req.offset
            )));
        }
        tracing::info!(id = %req.file_id, offset = req.offset, stored = on_disk, "resuming upload");
        self.start_upload(req, path, false)
    }

    fn download(&mut self, req: &Request) -> Result<Response, TransferError> {
        let continuing = matches!(
            &self.state,
            TransferState::Downloading { file_id, .. } if *file_id == req.file_id
        );
        if !continuing {
            self.reset();
            let path = self.manager.path_of(&req.file_id)?;
            if !self.manager.exists(&req.file_id) {
                tracing::info!(id = %req.file_id, "download of unknown file");
                return Ok(Response::reply_to(req, Status::NotFound, 0, 0));
            }
            self.start_download(req, path)?;
        }

        let chunk = self.settings.chunk_for(req.network);
        let TransferState::Downloading {
            file,
            offset,
            file_size,
            ..
        } = &mut self.state
        else {
            return Err(state_error("download state lost".to_string()));
        };
        if continuing && req.offset != *offset {
            tracing::debug!(id = %req.file_id, requested = req.offset, offset = *offset, "using session offset");
        }

        let start = *offset;
        let size = *file_size;
        let n = chunk.min((size - start) as usize);
        let mut data = vec![0u8; n];
        let io_err = |op, source| TransferError::Io {
            op,
            file_id: req.file_id.clone(),
            offset: start,
            size,
            source,
        };
        file.seek(SeekFrom::Start(start as u64)).map_err(|e| io_err("seek", e))?;
        file.read_exact(&mut data).map_err(|e| io_err("read", e))?;
        *offset = start + n as i64;

        let next = *offset;
        if next == size {
            self.reset();
            tracing::info!(id = %req.file_id, size, "download complete");
            return Ok(Response::reply_to(req, Status::Complete, next, size).with_data(data));
        }
        tracing::debug!(id = %req.file_id, offset = next, size, "download progress");
        Ok(Response::reply_to(req, Status::InProgress, next, size).with_data(data))
    }

    fn start_download(&mut self, req: &Request, path: PathBuf) -> Result<(), TransferError> {
        let io_err = |op, source| TransferError::Io {
            op,
            file_id: req.file_id.clone(),
            offset: req.offset,
            size: 0,
            source,
        };
        let mut file = File::open(&path).map_err(|e| io_err("open", e))?;
        let file_size = file.seek(SeekFrom::End(0)).map_err(|e| io_err("seek", e))? as i64;
        file.seek(SeekFrom::Start(0)).map_err(|e| io_err("seek", e))?;
        if req.offset < 0 || req.offset > file_size {
            return Err(state_error(format!(
                "download of {} at offset {} beyond size {file_size}",
                req.file_id, req.offset
            )));
        }
        self.state = TransferState::Downloading {
            file,
            file_id: req.file_id.clone(),
            offset: req.offset,
            file_size,
        };
        Ok(())
    }
}

fn state_error(msg: String) -> TransferError {
    TransferError::Protocol(ProtocolError::State(msg))
}

/// Binds a [`FileTransfer`] to one connection.
pub struct FileSession {
    session: TcpSession,
    transfer: FileTransfer,
}

impl FileSession {
    pub fn new(conn: &Arc<Connection>, codec: FrameCodec, manager: Arc<FileManager>, settings: TransferSettings) -> Self {
        Self {
            session: TcpSession::new(conn, codec),
            transfer: FileTransfer::new(manager, settings),
        }
    }

    pub fn session(&self) -> &TcpSession {
        &self.session
    }

    pub fn transfer(&self) -> &FileTransfer {
        &self.transfer
    }

    /// Consumes every complete frame in `buf`. Any failure closes the connection.
    pub fn on_message(&mut self, buf: &mut ByteBuffer, _receive_time: Instant) {
        loop {
            let body = match self.session.codec().decode(buf) {
                Ok(Some(body)) => body,
                Ok(None) => return,
                Err(e) => {
                    tracing::error!(peer = %self.session.peer_addr(), error = %e, "illegal package header");
                    let header = &buf.peek()[..buf.readable_bytes().min(HEADER_LEN)];
                    logging::dump_binary("package header", header);
                    buf.retrieve_all();
                    self.fail();
                    return;
                }
            };

            let req = match Request::decode_body(&body) {
                Ok(req) => req,
                Err(e) => {
                    tracing::error!(peer = %self.session.peer_addr(), len = body.len(), error = %e, "malformed request");
                    logging::dump_binary("request body", &body);
                    buf.retrieve_all();
                    self.fail();
                    return;
                }
            };
            tracing::debug!(
                peer = %self.session.peer_addr(),
                cmd = ?req.cmd,
                seq = req.seq,
                id = %req.file_id,
                offset = req.offset,
                size = req.file_size,
                len = req.data.len(),
                "request"
            );

            match self.transfer.handle(&req) {
                Ok(resp) => {
                    if !self.session.send(&resp) {
                        tracing::error!(
                            peer = %self.session.peer_addr(),
                            id = %req.file_id,
                            offset = resp.offset,
                            "reply not sent, closing"
                        );
                        buf.retrieve_all();
                        self.fail();
                        return;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        peer = %self.session.peer_addr(),
                        id = %req.file_id,
                        offset = req.offset,
                        size = req.file_size,
                        error = %e,
                        "transfer step failed"
                    );
                    buf.retrieve_all();
                    self.fail();
                    return;
                }
            }
        }
    }

    fn fail(&mut self) {
        self.transfer.reset();
        self.session.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn transfer() -> (TempDir, Arc<FileManager>, FileTransfer) {
        let dir = tempfile::tempdir().unwrap();
        let fm = Arc::new(FileManager::init(dir.path()).unwrap());
        let settings = TransferSettings {
            broadband_chunk: 4,
            cellular_chunk: 2,
        };
        let t = FileTransfer::new(fm.clone(), settings);
        (dir, fm, t)
    }

    fn up(offset: i64, size: i64, data: &[u8]) -> Request {
        Request::upload(1, "f1", offset, size, data.to_vec())
    }

    #[test]
    fn upload_in_chunks() {
        let (dir, fm, mut t) = transfer();
        let r = t.handle(&up(0, 10, b"01234")).unwrap();
        assert_eq!((r.status, r.offset, r.cmd), (Status::InProgress, 5, Command::UploadResp));
        assert!(t.is_uploading());
        assert!(!fm.exists("f1"));

        let r = t.handle(&up(5, 10, b"56789")).unwrap();
        assert_eq!((r.status, r.offset, r.file_size), (Status::Complete, 10, 10));
        assert!(t.is_idle());
        assert!(fm.exists("f1"));
        assert_eq!(fs::read(dir.path().join("f1")).unwrap(), b"0123456789");
    }

    #[test]
    fn duplicate_upload_skips_disk() {
        let (dir, fm, mut t) = transfer();
        fs::write(dir.path().join("f1"), b"old").unwrap();
        fm.add_file("f1");
        let r = t.handle(&up(0, 3, b"new")).unwrap();
        assert_eq!((r.status, r.offset), (Status::Complete, 3));
        assert_eq!(fs::read(dir.path().join("f1")).unwrap(), b"old");
        assert!(t.is_idle());
    }

    #[test]
    fn resume_after_new_session() {
        let (dir, fm, mut first) = transfer();
        first.handle(&up(0, 6, b"abc")).unwrap();
        drop(first);

        let mut second = FileTransfer::new(fm.clone(), TransferSettings::default());
        let r = second.handle(&up(3, 6, b"def")).unwrap();
        assert_eq!((r.status, r.offset), (Status::Complete, 6));
        assert_eq!(fs::read(dir.path().join("f1")).unwrap(), b"abcdef");
        assert!(fm.exists("f1"));
    }

    #[test]
    fn mid_file_chunk_without_partial_file_is_rejected() {
        let (_dir, _fm, mut t) = transfer();
        let err = t.handle(&up(4, 10, b"xx")).unwrap_err();
        assert!(matches!(err, TransferError::Protocol(ProtocolError::State(_))));
        assert!(t.is_idle());
    }

    #[test]
    fn resume_beyond_stored_bytes_is_rejected() {
        let (dir, _fm, mut t) = transfer();
        fs::write(dir.path().join("f1"), b"ab").unwrap();
        assert!(t.handle(&up(5, 10, b"xx")).is_err());
    }

    #[test]
    fn chunk_past_declared_size_is_rejected() {
        let (_dir, fm, mut t) = transfer();
        assert!(t.handle(&up(0, 2, b"abc")).is_err());
        assert!(!fm.exists("f1"));
    }

    #[test]
    fn zero_offset_restarts_upload() {
        let (dir, _fm, mut t) = transfer();
        t.handle(&up(0, 4, b"xy")).unwrap();
        t.handle(&up(0, 4, b"ab")).unwrap();
        let r = t.handle(&up(2, 4, b"cd")).unwrap();
        assert_eq!(r.status, Status::Complete);
        assert_eq!(fs::read(dir.path().join("f1")).unwrap(), b"abcd");
    }

    #[test]
    fn download_follows_network_chunk_size() {
        let (dir, fm, mut t) = transfer();
        fs::write(dir.path().join("f1"), b"0123456789").unwrap();
        fm.add_file("f1");

        let mut got = Vec::new();
        let mut sizes = Vec::new();
        loop {
            let r = t
                .handle(&Request::download(1, "f1", 0, NetworkType::Broadband))
                .unwrap();
            assert_eq!(r.cmd, Command::DownloadResp);
            assert_eq!(r.file_size, 10);
            sizes.push(r.data.len());
            got.extend_from_slice(&r.data);
            assert_eq!(r.offset as usize, got.len());
            if r.status == Status::Complete {
                break;
            }
            assert_eq!(r.status, Status::InProgress);
        }
        assert_eq!(sizes, vec![4, 4, 2]);
        assert_eq!(got, b"0123456789");
        assert!(t.is_idle());

        let r = t
            .handle(&Request::download(2, "f1", 0, NetworkType::Cellular))
            .unwrap();
        assert_eq!(r.data, b"01");
    }

    #[test]
    fn download_can_start_mid_file() {
        let (dir, fm, mut t) = transfer();
        fs::write(dir.path().join("f1"), b"abcdef").unwrap();
        fm.add_file("f1");
        let r = t
            .handle(&Request::download(1, "f1", 4, NetworkType::Broadband))
            .unwrap();
        assert_eq!((r.status, r.offset, r.data.as_slice()), (Status::Complete, 6, &b"ef"[..]));
        assert!(t.handle(&Request::download(1, "f1", 7, NetworkType::Broadband)).is_err());
    }

    #[test]
    fn empty_file_downloads_in_one_reply() {
        let (dir, fm, mut t) = transfer();
        fs::write(dir.path().join("f1"), b"").unwrap();
        fm.add_file("f1");
        let r = t
            .handle(&Request::download(1, "f1", 0, NetworkType::Broadband))
            .unwrap();
        assert_eq!((r.status, r.offset, r.file_size), (Status::Complete, 0, 0));
        assert!(r.data.is_empty());
    }

    #[test]
    fn unknown_download_is_not_found() {
        let (_dir, _fm, mut t) = transfer();
        let r = t
            .handle(&Request::download(5, "nope", 0, NetworkType::Broadband))
            .unwrap();
        assert_eq!((r.status, r.offset, r.file_size, r.seq), (Status::NotFound, 0, 0, 5));
        assert!(t.is_idle());
    }

    #[test]
    fn overflowing_upload_ranges_are_rejected() {
        let cases: [(i64, i64, &[u8]); 6] = [
            (i64::MAX, i64::MAX, b"x"),
            (i64::MAX - 2, i64::MAX, b"xyz"),
            (i64::MAX, 0, b""),
            (i64::MIN, i64::MAX, b"x"),
            (-1, 10, b""),
            (0, -1, b""),
        ];
        for (offset, size, data) in cases {
            let (_dir, fm, mut t) = transfer();
            let err = t.handle(&up(offset, size, data)).unwrap_err();
            assert!(
                matches!(err, TransferError::Protocol(ProtocolError::State(_))),
                "offset {offset} size {size}: {err}"
            );
            assert!(t.is_idle());
            assert!(!fm.exists("f1"));
        }
    }

    #[test]
    fn out_of_range_download_offsets_are_rejected() {
        for offset in [-1, 7, i64::MAX, i64::MIN] {
            let (dir, fm, mut t) = transfer();
            fs::write(dir.path().join("f1"), b"abcdef").unwrap();
            fm.add_file("f1");
            let req = Request::download(1, "f1", offset, NetworkType::Broadband);
            assert!(t.handle(&req).is_err(), "offset {offset} accepted");
            assert!(t.is_idle());
        }
    }

    proptest! {
        #[test]
        fn arbitrary_upload_numbers_get_a_reply_or_an_error(
            offset in any::<i64>(),
            size in any::<i64>(),
            len in 0usize..8,
        ) {
            let (_dir, _fm, mut t) = transfer();
            match t.handle(&up(offset, size, &vec![7u8; len])) {
                Ok(r) => {
                    prop_assert_eq!(offset, 0);
                    prop_assert_eq!(r.offset, len as i64);
                    prop_assert!(r.offset <= r.file_size);
                }
                Err(_) => prop_assert!(t.is_idle()),
            }
        }

        #[test]
        fn arbitrary_download_offsets_get_a_reply_or_an_error(first in any::<i64>(), second in any::<i64>()) {
            let (dir, fm, mut t) = transfer();
            fs::write(dir.path().join("f1"), b"0123456789").unwrap();
            fm.add_file("f1");
            for offset in [first, second] {
                match t.handle(&Request::download(1, "f1", offset, NetworkType::Cellular)) {
                    Ok(r) => {
                        prop_assert!(r.offset >= 0 && r.offset <= 10);
                        prop_assert_eq!(r.file_size, 10);
                    }
                    Err(_) => prop_assert!(t.is_idle()),
                }
            }
        }
    }

    #[test]
    fn bad_ids_never_touch_disk() {
        let (_dir, _fm, mut t) = transfer();
        let err = t
            .handle(&Request::upload(1, "../x", 0, 1, b"x".to_vec()))
            .unwrap_err();
        assert!(matches!(err, TransferError::Protocol(ProtocolError::InvalidFileId(_))));
    }
}
