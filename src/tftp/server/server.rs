use std::io::{self, Read, Write};
use std::net::{SocketAddr, UdpSocket};

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use super::Config;
use crate::tftp::backend::{Backend, error_code_for, read_chunk};
use crate::tftp::core::{BLOCK_SIZE, BUF_SIZE, ErrorCode, MAX_PACKET_SIZE, Packet};

/// How a transfer procedure left the server loop.
enum Outcome {
    Done,
    Failed,
    /// The write loop received a packet that is not part of the transfer.
    /// It is still in the receive buffer; the dispatcher re-parses it as a
    /// fresh request. Carries the datagram length.
    Repeat(usize),
}

/// Minimal stop-and-wait TFTP server.
///
/// Owns one UDP socket and serves one transfer at a time: the dispatch
/// loop receives a request, runs the matching transfer procedure to
/// completion or failure, then goes back to listening. Storage access
/// goes through the [`Backend`] collaborator.
///
/// # Example
///
/// ```rust,no_run
/// use utftpd::tftp::backend::FsBackend;
/// use utftpd::tftp::server::{Config, Server};
///
/// let config = Config::default();
/// let backend = FsBackend::new(config.directory.clone());
/// let mut server = Server::new(config, backend);
/// server.start().unwrap();
/// loop {
///     server.run_once(true).unwrap();
/// }
/// ```
pub struct Server<B: Backend> {
    config: Config,
    backend: B,
    socket: Option<UdpSocket>,
    /// Peer of the session in progress. Exactly one session is active at
    /// a time; updated on every receive, cleared on `stop`.
    peer: Option<SocketAddr>,
    buf: Vec<u8>,
}

impl<B: Backend> Server<B> {
    pub fn new(config: Config, backend: B) -> Self {
        Self {
            config,
            backend,
            socket: None,
            peer: None,
            buf: Vec::new(),
        }
    }

    /// Bind the UDP socket and mark the server ready. Fatal on bind
    /// failure. Does nothing if the server is already started.
    pub fn start(&mut self) -> Result<()> {
        if self.socket.is_some() {
            return Ok(());
        }
        let addr = SocketAddr::new(self.config.ip_address, self.config.port);
        let socket = UdpSocket::bind(addr)
            .with_context(|| format!("failed to bind UDP socket on {addr}"))?;
        socket.set_read_timeout(Some(self.config.recv_timeout))?;
        socket.set_write_timeout(Some(self.config.send_timeout))?;
        self.buf = vec![0u8; BUF_SIZE];
        info!("started on {}", socket.local_addr()?);
        self.socket = Some(socket);
        Ok(())
    }

    /// Close the socket and release the packet buffer. An in-flight
    /// receive on the socket fails, so an external loop driving
    /// [`Server::run_once`] exits. Idempotent.
    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            info!("stopped");
        }
        self.peer = None;
        self.buf = Vec::new();
    }

    /// Address the server is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let socket = self.socket.as_ref().context("server not started")?;
        Ok(socket.local_addr()?)
    }

    /// Perform one poll: receive a datagram and, if it is a valid request,
    /// run the whole transfer before returning.
    ///
    /// Returns `Ok(false)` when nothing was received (timeout, or no data
    /// pending in non-blocking mode), `Ok(true)` when a datagram was
    /// handled. Datagrams with malformed leading bytes are logged and
    /// ignored, not errors.
    pub fn run_once(&mut self, blocking: bool) -> Result<bool> {
        let socket = self.socket.as_ref().context("server not started")?;
        if !blocking {
            socket.set_nonblocking(true)?;
        }
        let received = socket.recv_from(&mut self.buf);
        if !blocking {
            socket.set_nonblocking(false)?;
        }
        match received {
            Ok((len, peer)) => {
                self.peer = Some(peer);
                self.handle_request(len)?;
                Ok(true)
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                Ok(false)
            }
            Err(e) => Err(e).context("receive failed"),
        }
    }

    /// Run the dispatch loop until a receive fails (typically because the
    /// socket was closed underneath us).
    pub fn listen(&mut self) -> Result<()> {
        loop {
            self.run_once(true)?;
        }
    }

    /// Classify the datagram in the buffer and run the matching transfer.
    /// Loops when a write transfer bails out on a packet that turns out to
    /// be a new request.
    fn handle_request(&mut self, mut len: usize) -> Result<()> {
        loop {
            let packet = match Packet::deserialize(&self.buf[..len]) {
                Ok(packet) => packet,
                Err(e) => {
                    warn!("ignoring malformed datagram from {}: {e:#}", self.peer_name());
                    return Ok(());
                }
            };
            match packet {
                Packet::Wrq { filename, mode, options } => {
                    let mut writer = match self.backend.open_write(&filename) {
                        Ok(writer) => writer,
                        Err(e) => {
                            error!("failed to open {filename} for writing: {e}");
                            self.send_error(error_code_for(&e), "cannot open file");
                            return Ok(());
                        }
                    };
                    debug!("write request for {filename} ({mode}) from {}", self.peer_name());
                    if options.iter().any(|(name, _)| name == "blksize") {
                        // RFC 2348 negotiation is not supported; pin the
                        // fixed block size instead of adopting the request.
                        info!("extended block size requested, rejecting");
                        let oack =
                            Packet::Oack(vec![("blksize".to_string(), BLOCK_SIZE.to_string())]);
                        if let Err(e) = self.send_packet(&oack) {
                            error!("failed to reject options: {e:#}");
                            return Ok(());
                        }
                    } else if let Err(e) = self.send_packet(&Packet::Ack(0)) {
                        error!("failed to acknowledge request: {e:#}");
                        return Ok(());
                    }
                    info!("receiving file: {filename}");
                    match self.process_write(writer.as_mut()) {
                        Outcome::Repeat(repeat_len) => {
                            // Handle closed by drop before the next request.
                            drop(writer);
                            len = repeat_len;
                        }
                        Outcome::Done | Outcome::Failed => return Ok(()),
                    }
                }
                Packet::Rrq { filename, mode, .. } => {
                    let mut reader = match self.backend.open_read(&filename) {
                        Ok(reader) => reader,
                        Err(e) => {
                            error!("failed to open {filename} for reading: {e}");
                            self.send_error(error_code_for(&e), "cannot open file");
                            return Ok(());
                        }
                    };
                    debug!("read request for {filename} ({mode}) from {}", self.peer_name());
                    info!("sending file: {filename}");
                    self.process_read(reader.as_mut());
                    return Ok(());
                }
                other => {
                    warn!("unexpected {} outside a transfer, ignoring", kind_name(&other));
                    return Ok(());
                }
            }
        }
    }

    /// Write (receive) procedure: wait for DATA blocks, acknowledge each,
    /// forward in-order payloads to the backend, until a short datagram
    /// marks the final block.
    fn process_write(&mut self, writer: &mut dyn Write) -> Outcome {
        let mut total: u64 = 0;
        let mut next_block: u16 = 1;
        loop {
            let len = match self.recv() {
                Ok(len) => len,
                Err(e) => {
                    error!("error on receive: {e}");
                    return Outcome::Failed;
                }
            };
            match Packet::deserialize(&self.buf[..len]) {
                Ok(Packet::Data { block_num, data }) => {
                    if let Err(e) = self.send_packet(&Packet::Ack(block_num)) {
                        error!("failed to send ack: {e:#}");
                        return Outcome::Failed;
                    }
                    if block_num == next_block {
                        if let Err(e) = writer.write_all(&data) {
                            error!("failed to write data to file: {e}");
                            self.send_error(error_code_for(&e), "cannot write file");
                            return Outcome::Failed;
                        }
                        next_block = next_block.wrapping_add(1);
                        total += data.len() as u64;
                        debug!("block {block_num} received, size {}", data.len());
                    } else {
                        // Retransmitted duplicate; re-acked above but the
                        // payload must not be applied twice.
                        info!("dup packet received: [{block_num}], expected [{next_block}]");
                    }
                    if len < MAX_PACKET_SIZE {
                        info!("file received ({total} bytes)");
                        return Outcome::Done;
                    }
                }
                Ok(Packet::Wrq { .. }) if next_block == 1 => {
                    // Some clients repeat the request until the first ack
                    // arrives. Re-ack without opening the file again.
                    info!("duplicate write request, re-acknowledging");
                    if let Err(e) = self.send_packet(&Packet::Ack(0)) {
                        error!("failed to send ack: {e:#}");
                        return Outcome::Failed;
                    }
                }
                _ => {
                    error!("not data packet received, abandoning transfer");
                    return Outcome::Repeat(len);
                }
            }
        }
    }

    /// Read (send) procedure: pull chunks from the backend, send each as a
    /// DATA block and wait for its acknowledgment, retransmitting up to the
    /// configured attempt budget.
    fn process_read(&mut self, reader: &mut dyn Read) -> Outcome {
        let mut block_num: u16 = 1;
        let mut total: u64 = 0;
        let mut chunk = [0u8; BLOCK_SIZE];
        loop {
            let size = match read_chunk(reader, &mut chunk) {
                Ok(size) => size,
                Err(e) => {
                    error!("failed to read data from file: {e}");
                    self.send_error(ErrorCode::IllegalOperation, "failed to read file");
                    return Outcome::Failed;
                }
            };
            let data = Packet::Data {
                block_num,
                data: chunk[..size].to_vec(),
            };
            let bytes = match data.serialize() {
                Ok(bytes) => bytes,
                Err(e) => {
                    error!("failed to encode data packet: {e:#}");
                    return Outcome::Failed;
                }
            };

            let mut acked = false;
            for attempt in 0..self.config.max_retries {
                debug!(
                    "sending block {block_num} ({size} bytes) to {}, attempt {}",
                    self.peer_name(),
                    attempt + 1
                );
                if let Err(e) = self.send_bytes(&bytes) {
                    error!("failed to send data: {e:#}");
                    return Outcome::Failed;
                }
                if self.wait_for_ack(block_num) {
                    acked = true;
                    break;
                }
                error!("no ack/wrong ack, retrying");
            }
            if !acked {
                error!(
                    "block {block_num} not acknowledged after {} attempts, abandoning transfer",
                    self.config.max_retries
                );
                return Outcome::Failed;
            }
            total += size as u64;
            if size < BLOCK_SIZE {
                info!("sent file ({total} bytes)");
                return Outcome::Done;
            }
            block_num = block_num.wrapping_add(1);
        }
    }

    /// Wait one receive-timeout for the acknowledgment of `block_num`.
    /// A malformed reply is answered with an ERROR packet; both that and a
    /// block-number mismatch count as a failed attempt.
    fn wait_for_ack(&mut self, block_num: u16) -> bool {
        debug!("waiting for ack");
        let len = match self.recv() {
            Ok(len) => len,
            Err(e) => {
                error!("error waiting for ack: {e}");
                return false;
            }
        };
        match Packet::deserialize(&self.buf[..len]) {
            Ok(Packet::Ack(acked)) if acked == block_num => true,
            Ok(Packet::Ack(acked)) => {
                error!("received ack not in order: [{acked}], expected [{block_num}]");
                false
            }
            _ => {
                error!("received wrong ack packet");
                self.send_error(ErrorCode::NotDefined, "incorrect ack");
                false
            }
        }
    }

    /// Receive one datagram from the current session's peer, updating the
    /// bound peer address (clients may answer from a fresh port).
    fn recv(&mut self) -> io::Result<usize> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "server not started"))?;
        let (len, peer) = socket.recv_from(&mut self.buf)?;
        self.peer = Some(peer);
        Ok(len)
    }

    fn send_packet(&self, packet: &Packet) -> Result<()> {
        self.send_bytes(&packet.serialize()?)
    }

    fn send_bytes(&self, bytes: &[u8]) -> Result<()> {
        let socket = self.socket.as_ref().context("server not started")?;
        let peer = self.peer.context("no peer bound")?;
        socket.send_to(bytes, peer)?;
        Ok(())
    }

    /// Best-effort ERROR packet to the current peer, if one is known.
    fn send_error(&self, code: ErrorCode, msg: &str) {
        if self.peer.is_none() {
            return;
        }
        let packet = Packet::Error {
            code,
            msg: msg.to_string(),
        };
        if let Err(e) = self.send_packet(&packet) {
            warn!("failed to send error packet ({code}): {e:#}");
        }
    }

    fn peer_name(&self) -> String {
        match self.peer {
            Some(peer) => peer.to_string(),
            None => "<no peer>".to_string(),
        }
    }
}

fn kind_name(packet: &Packet) -> &'static str {
    match packet {
        Packet::Rrq { .. } => "read request",
        Packet::Wrq { .. } => "write request",
        Packet::Data { .. } => "data packet",
        Packet::Ack(_) => "ack packet",
        Packet::Error { .. } => "error packet",
        Packet::Oack(_) => "option ack packet",
    }
}
