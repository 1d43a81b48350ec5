//! End-to-end server tests over loopback UDP.
//!
//! Each test binds the server on an ephemeral port, drives it from a
//! scripted client socket, and inspects an in-memory backend afterwards.
//! The tests that spawn server threads are serialized with `serial_test`.

use std::collections::HashMap;
use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serial_test::serial;

use utftpd::tftp::core::{BLOCK_SIZE, ErrorCode, Packet};
use utftpd::{Backend, Config, Server};

#[derive(Default)]
struct MemState {
    files: HashMap<String, Vec<u8>>,
    read_opens: usize,
    write_opens: usize,
}

/// In-memory backend that counts opens and commits written files when the
/// server drops the write handle (the close-on-transfer-end contract).
#[derive(Clone, Default)]
struct MemBackend {
    state: Arc<Mutex<MemState>>,
}

impl MemBackend {
    fn with_file(self, name: &str, bytes: Vec<u8>) -> Self {
        self.state.lock().unwrap().files.insert(name.to_string(), bytes);
        self
    }

    fn file(&self, name: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().files.get(name).cloned()
    }

    fn read_opens(&self) -> usize {
        self.state.lock().unwrap().read_opens
    }

    fn write_opens(&self) -> usize {
        self.state.lock().unwrap().write_opens
    }
}

impl Backend for MemBackend {
    fn open_read(&mut self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        let mut state = self.state.lock().unwrap();
        state.read_opens += 1;
        match state.files.get(name) {
            Some(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            None => Err(io::Error::new(io::ErrorKind::NotFound, "no such file")),
        }
    }

    fn open_write(&mut self, name: &str) -> io::Result<Box<dyn Write + Send>> {
        let mut state = self.state.lock().unwrap();
        state.write_opens += 1;
        Ok(Box::new(MemWriter {
            name: name.to_string(),
            buf: Vec::new(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MemWriter {
    name: String,
    buf: Vec<u8>,
    state: Arc<Mutex<MemState>>,
}

impl Write for MemWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for MemWriter {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap()
            .files
            .insert(self.name.clone(), std::mem::take(&mut self.buf));
    }
}

/// Start a server with short timeouts on an ephemeral loopback port.
fn start_server(backend: MemBackend) -> Server<MemBackend> {
    let config = Config::new("127.0.0.1".parse().unwrap(), 0, std::env::temp_dir())
        .with_recv_timeout(Duration::from_millis(300))
        .with_send_timeout(Duration::from_secs(1));
    let mut server = Server::new(config, backend);
    server.start().unwrap();
    server
}

/// Drive the dispatch loop on a worker thread until `transfers` datagrams
/// arriving at the listener have been handled, then hand the server back.
fn run_transfers(mut server: Server<MemBackend>, transfers: usize) -> JoinHandle<Server<MemBackend>> {
    thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut handled = 0;
        while handled < transfers && Instant::now() < deadline {
            match server.run_once(true) {
                Ok(true) => handled += 1,
                Ok(false) => {}
                Err(_) => break,
            }
        }
        server
    })
}

struct TestClient {
    socket: UdpSocket,
    server: SocketAddr,
}

impl TestClient {
    fn new(server: SocketAddr) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        Self { socket, server }
    }

    fn send(&self, packet: &Packet) {
        self.socket
            .send_to(&packet.serialize().unwrap(), self.server)
            .unwrap();
    }

    fn send_raw(&self, bytes: &[u8]) {
        self.socket.send_to(bytes, self.server).unwrap();
    }

    fn recv_raw(&self) -> Vec<u8> {
        let mut buf = [0u8; 1024];
        let (len, _) = self.socket.recv_from(&mut buf).unwrap();
        buf[..len].to_vec()
    }

    fn recv(&self) -> Packet {
        Packet::deserialize(&self.recv_raw()).unwrap()
    }

    fn expect_ack(&self, block_num: u16) {
        assert_eq!(self.recv(), Packet::Ack(block_num));
    }

    fn expect_data(&self, block_num: u16) -> Vec<u8> {
        match self.recv() {
            Packet::Data { block_num: got, data } => {
                assert_eq!(got, block_num, "wrong data block");
                data
            }
            other => panic!("expected data block {block_num}, got {other:?}"),
        }
    }

    fn wrq(filename: &str) -> Packet {
        Packet::Wrq {
            filename: filename.to_string(),
            mode: "octet".to_string(),
            options: vec![],
        }
    }

    fn rrq(filename: &str) -> Packet {
        Packet::Rrq {
            filename: filename.to_string(),
            mode: "octet".to_string(),
            options: vec![],
        }
    }

    fn data(block_num: u16, data: Vec<u8>) -> Packet {
        Packet::Data { block_num, data }
    }
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[test]
#[serial]
fn write_transfer_two_blocks() {
    // The concrete scenario: 508 bytes, then a 10-byte final block.
    let backend = MemBackend::default();
    let mut server = start_server(backend.clone());
    let addr = server.local_addr().unwrap();
    let worker = run_transfers(server, 1);

    let client = TestClient::new(addr);
    client.send(&TestClient::wrq("a.txt"));
    client.expect_ack(0);
    let body = pattern(518);
    client.send(&TestClient::data(1, body[..508].to_vec()));
    client.expect_ack(1);
    client.send(&TestClient::data(2, body[508..].to_vec()));
    client.expect_ack(2);

    server = worker.join().unwrap();
    server.stop();
    assert_eq!(backend.file("a.txt").unwrap(), body);
    assert_eq!(backend.write_opens(), 1);
}

#[test]
#[serial]
fn redelivered_write_block_is_reacked_but_not_reapplied() {
    let backend = MemBackend::default();
    let server = start_server(backend.clone());
    let addr = server.local_addr().unwrap();
    let worker = run_transfers(server, 1);

    let client = TestClient::new(addr);
    client.send(&TestClient::wrq("dup.bin"));
    client.expect_ack(0);
    let first = pattern(BLOCK_SIZE);
    client.send(&TestClient::data(1, first.clone()));
    client.expect_ack(1);
    // Simulated network redelivery of an already-applied block.
    client.send(&TestClient::data(1, first.clone()));
    client.expect_ack(1);
    client.send(&TestClient::data(2, b"end".to_vec()));
    client.expect_ack(2);

    worker.join().unwrap();
    let mut expected = first;
    expected.extend_from_slice(b"end");
    assert_eq!(backend.file("dup.bin").unwrap(), expected);
}

#[test]
#[serial]
fn duplicate_wrq_is_reacked_without_reopening() {
    let backend = MemBackend::default();
    let server = start_server(backend.clone());
    let addr = server.local_addr().unwrap();
    let worker = run_transfers(server, 1);

    let client = TestClient::new(addr);
    client.send(&TestClient::wrq("once.bin"));
    client.expect_ack(0);
    // Client retransmits its request before it sees the first ack.
    client.send(&TestClient::wrq("once.bin"));
    client.expect_ack(0);
    client.send(&TestClient::data(1, b"payload".to_vec()));
    client.expect_ack(1);

    worker.join().unwrap();
    assert_eq!(backend.write_opens(), 1);
    assert_eq!(backend.file("once.bin").unwrap(), b"payload".to_vec());
}

#[test]
#[serial]
fn read_transfer_chunks_and_terminates_short() {
    let content = pattern(BLOCK_SIZE * 2 + 20);
    let backend = MemBackend::default().with_file("fw.bin", content.clone());
    let server = start_server(backend.clone());
    let addr = server.local_addr().unwrap();
    let worker = run_transfers(server, 1);

    let client = TestClient::new(addr);
    client.send(&TestClient::rrq("fw.bin"));
    let mut received = Vec::new();
    received.extend(client.expect_data(1));
    client.send(&Packet::Ack(1));
    received.extend(client.expect_data(2));
    client.send(&Packet::Ack(2));
    let last = client.expect_data(3);
    assert!(last.len() < BLOCK_SIZE);
    received.extend(last);
    client.send(&Packet::Ack(3));

    worker.join().unwrap();
    assert_eq!(received, content);
    assert_eq!(backend.read_opens(), 1);
}

#[test]
#[serial]
fn read_of_exact_multiple_ends_with_empty_block() {
    let content = pattern(BLOCK_SIZE);
    let backend = MemBackend::default().with_file("exact.bin", content.clone());
    let server = start_server(backend.clone());
    let addr = server.local_addr().unwrap();
    let worker = run_transfers(server, 1);

    let client = TestClient::new(addr);
    client.send(&TestClient::rrq("exact.bin"));
    assert_eq!(client.expect_data(1), content);
    client.send(&Packet::Ack(1));
    assert!(client.expect_data(2).is_empty());
    client.send(&Packet::Ack(2));

    worker.join().unwrap();
}

#[test]
#[serial]
fn stale_ack_retransmits_current_block_only() {
    let content = pattern(BLOCK_SIZE + 5);
    let backend = MemBackend::default().with_file("f.bin", content.clone());
    let server = start_server(backend.clone());
    let addr = server.local_addr().unwrap();
    let worker = run_transfers(server, 1);

    let client = TestClient::new(addr);
    client.send(&TestClient::rrq("f.bin"));
    client.expect_data(1);
    client.send(&Packet::Ack(1));
    let second = client.expect_data(2);
    // Stale re-ack of block 1: the server must not fall back to block 1,
    // it retransmits the block it is waiting on.
    client.send(&Packet::Ack(1));
    assert_eq!(client.expect_data(2), second);
    client.send(&Packet::Ack(2));

    worker.join().unwrap();
}

#[test]
#[serial]
fn missing_file_yields_error_and_no_data() {
    let content = pattern(10);
    let backend = MemBackend::default().with_file("present.bin", content.clone());
    let server = start_server(backend.clone());
    let addr = server.local_addr().unwrap();
    let worker = run_transfers(server, 2);

    let client = TestClient::new(addr);
    client.send(&TestClient::rrq("absent.bin"));
    match client.recv() {
        Packet::Error { code, .. } => assert_eq!(code, ErrorCode::FileNotFound),
        other => panic!("expected error packet, got {other:?}"),
    }

    // The listener survives and serves the next request.
    client.send(&TestClient::rrq("present.bin"));
    assert_eq!(client.expect_data(1), content);
    client.send(&Packet::Ack(1));

    worker.join().unwrap();
}

#[test]
#[serial]
fn unanswered_data_block_fails_after_three_attempts() {
    let content = pattern(BLOCK_SIZE + 1);
    let backend = MemBackend::default().with_file("slow.bin", content.clone());
    let server = start_server(backend.clone());
    let addr = server.local_addr().unwrap();
    let worker = run_transfers(server, 2);

    let client = TestClient::new(addr);
    client.send(&TestClient::rrq("slow.bin"));
    // Never acknowledge: the same block arrives once per attempt, then the
    // transfer is abandoned.
    for _ in 0..3 {
        client.expect_data(1);
    }
    assert!(client.socket.recv_from(&mut [0u8; 1024]).is_err());

    // The loop did not hang; a fresh request still goes through.
    client.send(&TestClient::rrq("slow.bin"));
    client.expect_data(1);
    client.send(&Packet::Ack(1));
    client.expect_data(2);
    client.send(&Packet::Ack(2));

    worker.join().unwrap();
}

#[test]
#[serial]
fn blksize_option_is_rejected_with_pinned_oack() {
    let backend = MemBackend::default();
    let server = start_server(backend.clone());
    let addr = server.local_addr().unwrap();
    let worker = run_transfers(server, 1);

    let client = TestClient::new(addr);
    client.send(&Packet::Wrq {
        filename: "neg.bin".to_string(),
        mode: "octet".to_string(),
        options: vec![("blksize".to_string(), "1024".to_string())],
    });
    let reply = client.recv_raw();
    assert_eq!(&reply[..2], b"\x00\x06");
    assert_eq!(&reply[2..], b"blksize\x00508\x00");

    // The transfer proceeds with the fixed block size.
    client.send(&TestClient::data(1, b"abc".to_vec()));
    client.expect_ack(1);

    worker.join().unwrap();
    assert_eq!(backend.file("neg.bin").unwrap(), b"abc".to_vec());
}

#[test]
#[serial]
fn garbage_datagram_is_ignored_and_loop_survives() {
    let content = pattern(4);
    let backend = MemBackend::default().with_file("ok.bin", content.clone());
    let server = start_server(backend.clone());
    let addr = server.local_addr().unwrap();
    let worker = run_transfers(server, 2);

    let client = TestClient::new(addr);
    client.send_raw(b"\x00\x09not a tftp packet");
    client.send(&TestClient::rrq("ok.bin"));
    assert_eq!(client.expect_data(1), content);
    client.send(&Packet::Ack(1));

    worker.join().unwrap();
}

#[test]
#[serial]
fn run_once_nonblocking_reports_no_event() {
    let mut server = start_server(MemBackend::default());
    assert!(!server.run_once(false).unwrap());
    server.stop();
    // stop is idempotent; polling a stopped server is an error.
    server.stop();
    assert!(server.run_once(true).is_err());
}
