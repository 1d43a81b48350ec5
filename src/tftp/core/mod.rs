//! TFTP core protocol implementation
//!
//! This module contains the wire-level pieces of the protocol:
//! - `packet`: packet serialization and deserialization, opcodes, error codes

mod packet;

// Public core types
pub use packet::{BLOCK_SIZE, BUF_SIZE, ErrorCode, MAX_PACKET_SIZE, Packet};
