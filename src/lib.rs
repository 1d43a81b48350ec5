//! utftpd — minimal stop-and-wait TFTP server
//!
//! See [`tftp`] for the protocol implementation and [`tftp::server::Server`]
//! for the embeddable server type.

pub mod tftp;

pub use tftp::backend::{Backend, FsBackend};
pub use tftp::core::{ErrorCode, Packet};
pub use tftp::server::{Config, Server};
