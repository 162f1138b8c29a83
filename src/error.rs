//! Error taxonomy for the WAL engine.
//!
//! Variants mirror the kinds in the error-handling design rather than raw
//! `errno` values; `errno()` maps each kind to the closest POSIX constant
//! only at the CLI/FFI boundary. Internal code always propagates `Error`.

use std::fmt;

#[derive(Debug)]
pub enum Error {
    /// Bad paths, bad sizes, writer_count out of range, non-512-multiple sizes.
    Configuration(&'static str),
    /// Folder state inconsistent on restart: missing CF, version mismatch,
    /// resuming_epoch disagreeing with the persisted durable epoch.
    Restart(&'static str),
    /// Underlying file/mmap/write/fsync failure.
    Io(std::io::Error),
    /// NV quota exhausted with no recycleable segment within a deadline.
    Space(&'static str),
    /// Epoch argument older than the active writer frame, or a submission
    /// into the horizon epoch without waiting.
    Submission(&'static str),
    /// Cursor range is empty, or a segment is neither NV-resident nor
    /// disk-resident.
    Cursor(&'static str),
    /// Operation attempted on an instance being torn down.
    Shutdown,
    /// Data on disk or in NV failed a structural check (magic, size, CRC).
    Corrupt(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Configuration(msg) => write!(f, "configuration error: {msg}"),
            Error::Restart(msg) => write!(f, "restart/recovery error: {msg}"),
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Space(msg) => write!(f, "space exhausted: {msg}"),
            Error::Submission(msg) => write!(f, "submission error: {msg}"),
            Error::Cursor(msg) => write!(f, "cursor error: {msg}"),
            Error::Shutdown => write!(f, "instance is shutting down"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

impl Error {
    /// Closest POSIX errno for this error kind. Only meaningful at the
    /// CLI/FFI boundary; internal code never threads errno through.
    pub fn errno(&self) -> i32 {
        match self {
            Error::Configuration(_) => libc::EINVAL,
            Error::Restart(_) => libc::EUCLEAN,
            Error::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Error::Space(_) => libc::ENOSPC,
            Error::Submission(_) => libc::EINVAL,
            Error::Cursor(_) => libc::ENOENT,
            Error::Shutdown => libc::ESHUTDOWN,
            Error::Corrupt(_) => libc::EUCLEAN,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
