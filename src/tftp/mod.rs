//! TFTP (Trivial File Transfer Protocol) server implementation
//!
//! This module implements a minimal stop-and-wait TFTP server after
//! [RFC 1350](https://www.rfc-editor.org/rfc/rfc1350) TFTP Protocol version 2.
//! Option negotiation (RFC 2347/2348) is recognized only to be rejected:
//! every transfer runs with the fixed block size, one packet in flight.
//!
//! ## Module Structure
//!
//! ```text
//! tftp/
//! ├── core/           # Core protocol implementation
//! │   └── packet      # Packet serialization/deserialization
//! │
//! ├── server/         # TFTP server
//! │   ├── server      # Dispatch loop and transfer state machines
//! │   └── config      # Server configuration
//! │
//! └── backend         # Storage collaborator trait + filesystem impl
//! ```
//!
//! ## Usage Examples
//!
//! ### Start TFTP Server
//!
//! ```rust,no_run
//! use utftpd::tftp::backend::FsBackend;
//! use utftpd::tftp::server::{Config, Server};
//! use std::path::PathBuf;
//!
//! let config = Config::new(
//!     "0.0.0.0".parse().unwrap(),
//!     69,
//!     PathBuf::from("/var/tftp"),
//! );
//!
//! let backend = FsBackend::new(config.directory.clone());
//! let mut server = Server::new(config, backend);
//! server.start().unwrap();
//! loop {
//!     server.run_once(true).unwrap();
//! }
//! ```

// Submodules
pub mod backend;
pub mod core;
pub mod server;
