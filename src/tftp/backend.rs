//! Storage collaborator interface
//!
//! The server core never touches a filesystem directly. It opens a read or
//! write handle through [`Backend`] when a request arrives, streams chunks
//! through it for the duration of one transfer, and closes it by dropping
//! the handle when the transfer ends.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};

use crate::tftp::core::ErrorCode;

/// Storage backend used by the server for one transfer at a time.
///
/// `open_read` failures surface to the peer as `file not found`,
/// `open_write` failures as `access violation` (refined by
/// [`error_code_for`] when the backend reports a specific cause).
pub trait Backend: Send {
    fn open_read(&mut self, name: &str) -> io::Result<Box<dyn Read + Send>>;
    fn open_write(&mut self, name: &str) -> io::Result<Box<dyn Write + Send>>;
}

/// Fill `buf` from `reader`, looping until it is full or the reader hits
/// EOF. A return shorter than `buf.len()` therefore means end of data,
/// which is exactly the condition that marks a transfer's final block.
pub fn read_chunk(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Map a backend I/O failure to the nearest TFTP error code.
pub fn error_code_for(err: &io::Error) -> ErrorCode {
    match err.kind() {
        io::ErrorKind::NotFound => ErrorCode::FileNotFound,
        io::ErrorKind::PermissionDenied => ErrorCode::AccessViolation,
        io::ErrorKind::StorageFull | io::ErrorKind::WriteZero => ErrorCode::DiskFull,
        io::ErrorKind::AlreadyExists => ErrorCode::FileExists,
        _ => ErrorCode::NotDefined,
    }
}

/// Filesystem backend serving a single root directory.
///
/// Requested names are resolved strictly inside the root: absolute paths
/// and any `..` component are refused before the filesystem is consulted.
pub struct FsBackend {
    root: PathBuf,
    read_only: bool,
}

impl FsBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: false,
        }
    }

    /// Refuse all write requests.
    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    fn resolve(&self, name: &str) -> io::Result<PathBuf> {
        let requested = Path::new(name);
        if requested.is_absolute() {
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("absolute path refused: {name}"),
            ));
        }
        for component in requested.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => {
                    return Err(io::Error::new(
                        io::ErrorKind::PermissionDenied,
                        format!("path escapes root directory: {name}"),
                    ));
                }
            }
        }
        Ok(self.root.join(requested))
    }
}

impl Backend for FsBackend {
    fn open_read(&mut self, name: &str) -> io::Result<Box<dyn Read + Send>> {
        let path = self.resolve(name)?;
        Ok(Box::new(File::open(path)?))
    }

    fn open_write(&mut self, name: &str) -> io::Result<Box<dyn Write + Send>> {
        if self.read_only {
            log::warn!("write request for {name} refused, server is read-only");
            return Err(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "server is read-only",
            ));
        }
        let path = self.resolve(name)?;
        Ok(Box::new(
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)?,
        ))
    }
}
