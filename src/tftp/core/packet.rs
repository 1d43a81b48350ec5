use anyhow::{Result, bail};

/// Largest datagram this server sends or accepts as a data carrier.
pub const MAX_PACKET_SIZE: usize = 512;

/// Maximum data payload of a single DATA packet (packet minus 4-byte header).
/// A payload shorter than this marks the final block of a transfer.
pub const BLOCK_SIZE: usize = MAX_PACKET_SIZE - 4;

/// Receive buffer size. Large enough to hold an RFC-sized 516-byte datagram
/// whole, so an oversized block is still judged non-final rather than split.
pub const BUF_SIZE: usize = 516;

/// TFTP error codes from RFC 1350 section 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    NotDefined = 0,
    FileNotFound = 1,
    AccessViolation = 2,
    DiskFull = 3,
    IllegalOperation = 4,
    UnknownTransferId = 5,
    FileExists = 6,
    NoSuchUser = 7,
}

impl From<u16> for ErrorCode {
    fn from(value: u16) -> Self {
        match value {
            1 => ErrorCode::FileNotFound,
            2 => ErrorCode::AccessViolation,
            3 => ErrorCode::DiskFull,
            4 => ErrorCode::IllegalOperation,
            5 => ErrorCode::UnknownTransferId,
            6 => ErrorCode::FileExists,
            7 => ErrorCode::NoSuchUser,
            _ => ErrorCode::NotDefined,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCode::NotDefined => "not defined",
            ErrorCode::FileNotFound => "file not found",
            ErrorCode::AccessViolation => "access violation",
            ErrorCode::DiskFull => "disk full",
            ErrorCode::IllegalOperation => "illegal operation",
            ErrorCode::UnknownTransferId => "unknown transfer id",
            ErrorCode::FileExists => "file exists",
            ErrorCode::NoSuchUser => "no such user",
        };
        write!(f, "{name}")
    }
}

/// A TFTP packet, decoded from or encoded to the RFC 1350 wire layout
/// `[opcode:2][fields...]` with all 16-bit fields big-endian.
///
/// `Oack` is encode-only: the server emits it once to pin the block size
/// when a client asks for a different one, and never parses it back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Rrq {
        filename: String,
        mode: String,
        options: Vec<(String, String)>,
    },
    Wrq {
        filename: String,
        mode: String,
        options: Vec<(String, String)>,
    },
    Data {
        block_num: u16,
        data: Vec<u8>,
    },
    Ack(u16),
    Error {
        code: ErrorCode,
        msg: String,
    },
    Oack(Vec<(String, String)>),
}

const OP_RRQ: u16 = 1;
const OP_WRQ: u16 = 2;
const OP_DATA: u16 = 3;
const OP_ACK: u16 = 4;
const OP_ERROR: u16 = 5;
const OP_OACK: u16 = 6;

impl Packet {
    /// Decode one datagram. An unknown opcode or a truncated body is a
    /// decode error; the caller reports it to the peer and keeps serving.
    pub fn deserialize(buf: &[u8]) -> Result<Packet> {
        if buf.len() < 2 {
            bail!("packet too short: {} bytes", buf.len());
        }
        let opcode = u16::from_be_bytes([buf[0], buf[1]]);
        match opcode {
            OP_RRQ | OP_WRQ => {
                let mut cursor = 2;
                let filename = read_cstr(buf, &mut cursor)?;
                let mode = read_cstr(buf, &mut cursor)?;
                let options = read_options(buf, &mut cursor)?;
                if opcode == OP_RRQ {
                    Ok(Packet::Rrq { filename, mode, options })
                } else {
                    Ok(Packet::Wrq { filename, mode, options })
                }
            }
            OP_DATA => {
                if buf.len() < 4 {
                    bail!("data packet too short: {} bytes", buf.len());
                }
                Ok(Packet::Data {
                    block_num: u16::from_be_bytes([buf[2], buf[3]]),
                    data: buf[4..].to_vec(),
                })
            }
            OP_ACK => {
                if buf.len() < 4 {
                    bail!("ack packet too short: {} bytes", buf.len());
                }
                Ok(Packet::Ack(u16::from_be_bytes([buf[2], buf[3]])))
            }
            OP_ERROR => {
                if buf.len() < 4 {
                    bail!("error packet too short: {} bytes", buf.len());
                }
                let mut cursor = 4;
                let msg = read_cstr(buf, &mut cursor)?;
                Ok(Packet::Error {
                    code: u16::from_be_bytes([buf[2], buf[3]]).into(),
                    msg,
                })
            }
            other => bail!("unknown opcode {other}"),
        }
    }

    /// Encode to wire bytes.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            Packet::Rrq { filename, mode, options }
            | Packet::Wrq { filename, mode, options } => {
                let opcode = if matches!(self, Packet::Rrq { .. }) { OP_RRQ } else { OP_WRQ };
                let mut buf = Vec::with_capacity(2 + filename.len() + mode.len() + 2);
                buf.extend_from_slice(&opcode.to_be_bytes());
                push_cstr(&mut buf, filename)?;
                push_cstr(&mut buf, mode)?;
                for (name, value) in options {
                    push_cstr(&mut buf, name)?;
                    push_cstr(&mut buf, value)?;
                }
                Ok(buf)
            }
            Packet::Data { block_num, data } => {
                if data.len() > BLOCK_SIZE {
                    bail!("data payload {} exceeds block size {}", data.len(), BLOCK_SIZE);
                }
                let mut buf = Vec::with_capacity(4 + data.len());
                buf.extend_from_slice(&OP_DATA.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                buf.extend_from_slice(data);
                Ok(buf)
            }
            Packet::Ack(block_num) => {
                let mut buf = Vec::with_capacity(4);
                buf.extend_from_slice(&OP_ACK.to_be_bytes());
                buf.extend_from_slice(&block_num.to_be_bytes());
                Ok(buf)
            }
            Packet::Error { code, msg } => {
                let mut buf = Vec::with_capacity(4 + msg.len() + 1);
                buf.extend_from_slice(&OP_ERROR.to_be_bytes());
                buf.extend_from_slice(&(*code as u16).to_be_bytes());
                push_cstr(&mut buf, msg)?;
                Ok(buf)
            }
            Packet::Oack(options) => {
                let mut buf = Vec::with_capacity(2);
                buf.extend_from_slice(&OP_OACK.to_be_bytes());
                for (name, value) in options {
                    push_cstr(&mut buf, name)?;
                    push_cstr(&mut buf, value)?;
                }
                Ok(buf)
            }
        }
    }
}

/// Read a NUL-terminated string and advance the cursor past the NUL.
fn read_cstr(buf: &[u8], cursor: &mut usize) -> Result<String> {
    let rest = &buf[*cursor..];
    let Some(nul) = rest.iter().position(|&b| b == 0) else {
        bail!("unterminated string field at offset {}", *cursor);
    };
    let s = std::str::from_utf8(&rest[..nul])?.to_string();
    *cursor += nul + 1;
    Ok(s)
}

/// Read trailing option name/value pairs until the buffer is exhausted.
fn read_options(buf: &[u8], cursor: &mut usize) -> Result<Vec<(String, String)>> {
    let mut options = Vec::new();
    while *cursor < buf.len() {
        let name = read_cstr(buf, cursor)?;
        let value = read_cstr(buf, cursor)?;
        options.push((name, value));
    }
    Ok(options)
}

fn push_cstr(buf: &mut Vec<u8>, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        bail!("embedded NUL in string field");
    }
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    Ok(())
}
