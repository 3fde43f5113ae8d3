use std::fs;
use std::net::SocketAddr;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use fileloop::protocol::client::FileClient;
use fileloop::protocol::{BROADBAND_CHUNK, CELLULAR_CHUNK, MAX_PACKAGE_SIZE};
use fileloop::{
    EventLoop, FileManager, FileServer, FrameCodec, HeaderOrder, NetworkType, PollerKind, Request, ServerOptions,
    Status, TransferSettings,
};
use tempfile::TempDir;

struct Harness {
    dir: TempDir,
    event_loop: Arc<EventLoop>,
    handle: Option<thread::JoinHandle<()>>,
    server: FileServer,
}

impl Harness {
    fn start(poller: Option<PollerKind>, io_threads: usize) -> Self {
        Self::start_with(poller, io_threads, |_| {})
    }

    fn start_with(poller: Option<PollerKind>, io_threads: usize, seed: impl FnOnce(&std::path::Path)) -> Self {
        Self::build(poller, io_threads, FrameCodec::default(), seed)
    }

    fn build(
        poller: Option<PollerKind>,
        io_threads: usize,
        codec: FrameCodec,
        seed: impl FnOnce(&std::path::Path),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let files = dir.path().join("files");
        fs::create_dir_all(&files).unwrap();
        seed(&files);

        let (tx, rx) = mpsc::channel();
        let handle = thread::spawn(move || {
            let lp = EventLoop::with_poller(poller).unwrap();
            tx.send(lp.clone()).unwrap();
            lp.run().unwrap();
        });
        let event_loop = rx.recv().unwrap();

        let manager = Arc::new(FileManager::init(&files).unwrap());
        let options = ServerOptions {
            reuse_port: false,
            io_threads,
            poller,
            ..ServerOptions::default()
        };
        let server = FileServer::new(
            event_loop.clone(),
            "127.0.0.1:0".parse().unwrap(),
            options,
            manager,
            codec,
            TransferSettings::default(),
        )
        .unwrap();
        server.start().unwrap();
        Self {
            dir,
            event_loop,
            handle: Some(handle),
            server,
        }
    }

    fn addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    fn client(&self) -> FileClient {
        FileClient::connect(self.addr(), FrameCodec::default()).unwrap()
    }

    fn stored(&self, id: &str) -> Vec<u8> {
        fs::read(self.dir.path().join("files").join(id)).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.stop();
        self.event_loop.quit();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
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
fn upload_then_download_in_broadband_chunks() {
    let h = Harness::start(None, 2);
    let data = pattern(1_000_000);
    let mut client = h.client();

    let ups = client.upload("bigfile", &data, 0, 100_000).unwrap();
    assert_eq!(ups.len(), 10);
    for (i, r) in ups.iter().enumerate() {
        assert_eq!(r.offset, (i as i64 + 1) * 100_000);
        assert_eq!(r.file_size, 1_000_000);
    }
    assert!(ups[..9].iter().all(|r| r.status == Status::InProgress));
    assert_eq!(ups[9].status, Status::Complete);
    assert_eq!(h.stored("bigfile"), data);

    let down = client.download("bigfile", 0, NetworkType::Broadband).unwrap();
    assert_eq!(down.status(), Status::Complete);
    assert!(down.responses.iter().all(|r| r.data.len() <= BROADBAND_CHUNK));
    let last = down.responses.last().unwrap();
    assert_eq!(last.offset, last.file_size);
    assert_eq!(last.file_size, 1_000_000);
    assert_eq!(down.data, data);
}

#[test]
fn cellular_downloads_use_small_chunks() {
    let h = Harness::start(None, 1);
    let data = pattern(200_000);
    let mut client = h.client();
    client.upload("cell", &data, 0, 200_000).unwrap();

    let down = client.download("cell", 0, NetworkType::Cellular).unwrap();
    let sizes: Vec<usize> = down.responses.iter().map(|r| r.data.len()).collect();
    assert_eq!(sizes, vec![CELLULAR_CHUNK, CELLULAR_CHUNK, CELLULAR_CHUNK, 200_000 - 3 * CELLULAR_CHUNK]);
    assert_eq!(down.data, data);
}

#[test]
fn upload_resumes_after_reconnect() {
    let h = Harness::start(None, 2);
    let data = pattern(1000);

    let mut first = h.client();
    let seq = first.next_seq();
    let r = first
        .call(&Request::upload(seq, "resume", 0, 1000, data[..100].to_vec()))
        .unwrap();
    assert_eq!((r.status, r.offset), (Status::InProgress, 100));
    drop(first);

    let mut second = h.client();
    let replies = second.upload("resume", &data, 100, 900).unwrap();
    assert_eq!(replies.len(), 1);
    assert_eq!((replies[0].status, replies[0].offset), (Status::Complete, 1000));
    assert_eq!(h.stored("resume"), data);
}

#[test]
fn known_file_upload_completes_without_writing() {
    let h = Harness::start_with(None, 0, |dir| {
        fs::write(dir.join("known"), b"original").unwrap();
    });
    let mut client = h.client();
    let seq = client.next_seq();
    let r = client
        .call(&Request::upload(seq, "known", 0, 5, b"other".to_vec()))
        .unwrap();
    assert_eq!((r.status, r.offset, r.file_size), (Status::Complete, 5, 5));
    assert_eq!(h.stored("known"), b"original");
}

#[test]
fn missing_file_is_not_found_and_connection_stays_open() {
    let h = Harness::start(None, 1);
    let mut client = h.client();
    for _ in 0..2 {
        let down = client.download("absent", 0, NetworkType::Broadband).unwrap();
        assert_eq!(down.responses.len(), 1);
        let r = &down.responses[0];
        assert_eq!((r.status, r.offset, r.file_size), (Status::NotFound, 0, 0));
        assert!(r.data.is_empty());
    }
}

#[test]
fn illegal_package_lengths_close_without_reply() {
    let h = Harness::start(None, 1);
    for len in [0i64, -5, MAX_PACKAGE_SIZE as i64 + 1] {
        let mut client = h.client();
        client.send_raw(&len.to_le_bytes()).unwrap();
        assert!(client.is_closed(), "length {len} left the connection open");
    }
    assert!(wait_until(|| h.server.session_count() == 0));
}

#[test]
fn malformed_body_closes_connection() {
    let h = Harness::start(None, 1);
    let mut client = h.client();
    let mut frame = 4i64.to_le_bytes().to_vec();
    frame.extend_from_slice(&99i32.to_be_bytes());
    client.send_raw(&frame).unwrap();
    assert!(client.is_closed());
}

#[test]
fn mid_file_upload_for_unknown_file_closes_connection() {
    let h = Harness::start(None, 1);
    let mut client = h.client();
    let seq = client.next_seq();
    client
        .send(&Request::upload(seq, "ghost", 500, 1000, vec![1; 10]))
        .unwrap();
    assert!(client.is_closed());
}

#[test]
fn overflowing_upload_offsets_close_only_that_connection() {
    let h = Harness::start(None, 1);
    let cases = [
        (i64::MAX, i64::MAX, vec![1u8]),
        (i64::MAX - 1, i64::MAX, vec![1u8; 4]),
        (-1, 10, vec![1u8]),
        (0, -1, Vec::new()),
        (i64::MIN, 0, vec![1u8]),
    ];
    for (offset, size, data) in cases {
        let mut client = h.client();
        let seq = client.next_seq();
        client
            .send(&Request::upload(seq, "hostile", offset, size, data))
            .unwrap();
        assert!(client.is_closed(), "offset {offset} size {size} left the connection open");
    }

    let mut client = h.client();
    let down = client.download("absent", 0, NetworkType::Broadband).unwrap();
    assert_eq!(down.status(), Status::NotFound);
    let ups = client.upload("after", b"still serving", 0, 64).unwrap();
    assert_eq!(ups[0].status, Status::Complete);
}

#[test]
fn out_of_range_download_offsets_close_connection() {
    let h = Harness::start(None, 1);
    let mut client = h.client();
    client.upload("ten", &pattern(10), 0, 10).unwrap();
    for offset in [11, -1, i64::MAX, i64::MIN] {
        let mut client = h.client();
        let seq = client.next_seq();
        client
            .send(&Request::download(seq, "ten", offset, NetworkType::Cellular))
            .unwrap();
        assert!(client.is_closed(), "offset {offset} left the connection open");
    }
}

#[test]
fn reply_too_large_for_a_frame_closes_connection() {
    let codec = FrameCodec::new(HeaderOrder::Little, 128);
    let h = Harness::build(None, 1, codec, |_| {});
    let mut client = h.client();
    let ups = client.upload("big", &pattern(100), 0, 20).unwrap();
    assert_eq!(ups.last().unwrap().status, Status::Complete);

    let seq = client.next_seq();
    client
        .send(&Request::download(seq, "big", 0, NetworkType::Broadband))
        .unwrap();
    assert!(client.is_closed());
    assert!(wait_until(|| h.server.session_count() == 0));
}

#[test]
fn sessions_follow_connections() {
    let h = Harness::start(None, 2);
    let clients: Vec<FileClient> = (0..4).map(|_| h.client()).collect();
    assert!(wait_until(|| h.server.session_count() == 4));
    drop(clients);
    assert!(wait_until(|| h.server.session_count() == 0));
    assert!(wait_until(|| h.server.connection_count() == 0));
}

#[test]
fn every_backend_serves_transfers() {
    for kind in [PollerKind::EventTable, PollerKind::PollArray, PollerKind::Select] {
        let h = Harness::start(Some(kind), 1);
        let data = pattern(70_000);
        let mut client = h.client();
        let ups = client.upload("f", &data, 0, 16 * 1024).unwrap();
        assert_eq!(ups.last().unwrap().status, Status::Complete, "{kind}");
        let down = client.download("f", 0, NetworkType::Cellular).unwrap();
        assert_eq!(down.data, data, "{kind}");
    }
}
