//! Wire error taxonomy shared by every component.

use std::fmt;

use thiserror::Error;

/// Kind codes carried in `response` messages and logs.
///
/// These are wire-stable: the string form of each variant is what a
/// client sees at the front of a failure message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed framing or JSON, missing fields, oversize, unknown
    /// (type, action) pair.
    Protocol,
    /// Checksum mismatch on a message or a stored body.
    Integrity,
    /// Timestamp outside the accepted window, or a version that is not
    /// newer than the stored one.
    Stale,
    NotFound,
    Exists,
    IsDirectory,
    InvalidPath,
    WriteFailed,
    Timeout,
    /// Peer unreachable.
    Unavailable,
    /// Invariant violated; the daemon logs and aborts.
    Fatal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Protocol => "protocol",
            ErrorKind::Integrity => "integrity",
            ErrorKind::Stale => "stale",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Exists => "exists",
            ErrorKind::IsDirectory => "is_directory",
            ErrorKind::InvalidPath => "invalid_path",
            ErrorKind::WriteFailed => "write_failed",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Fatal => "fatal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level error for the daemon binary and library entry points.
#[derive(Debug, Error)]
pub enum Error {
    #[error("config error: {0}")]
    Config(String),
    #[error(transparent)]
    Vfs(#[from] crate::store::vfs::VfsError),
    #[error(transparent)]
    Meta(#[from] crate::store::meta::MetaError),
    #[error(transparent)]
    Frame(#[from] crate::proto::frame::FrameError),
    #[error(transparent)]
    Message(#[from] crate::proto::message::MessageError),
    #[error(transparent)]
    Engine(#[from] crate::sync::engine::EngineError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config(_) => ErrorKind::Fatal,
            Error::Vfs(err) => err.kind(),
            Error::Meta(err) => err.kind(),
            Error::Frame(err) => err.kind(),
            Error::Message(err) => err.kind(),
            Error::Engine(err) => err.kind(),
            Error::Io(_) => ErrorKind::WriteFailed,
        }
    }
}
