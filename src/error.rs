//! Typed errors for every fallible component, composed into one top-level
//! [`Error`] the CLI matches on to pick an exit code.

use std::path::PathBuf;

use thiserror::Error;

/// Failure resolving a user-supplied device name to its device-mapper backing
/// devices.
#[derive(Debug, Error)]
pub enum DeviceLocatorError {
    #[error("device-mapper has no entry for '{0}'")]
    SnapshotNotFound(String),

    #[error("'{0}' does not appear to be a snapshot")]
    NotASnapshot(String),

    #[error("snapshot '{snapshot}' references origin devnum {devnum} which has no dm entry")]
    OriginMissing { snapshot: String, devnum: String },

    #[error("snapshot '{snapshot}' references exception-store devnum {devnum} which has no dm entry")]
    ExceptionMissing { snapshot: String, devnum: String },

    #[error("failed to run '{command}': {source}")]
    CommandFailed {
        command: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Failure parsing the on-disk exception-store metadata.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("invalid snapshot magic number")]
    InvalidMagic,

    #[error("snapshot is marked invalid")]
    SnapshotInvalid,

    #[error("unsupported exception-store metadata version {0} (only version 1 is supported)")]
    UnsupportedMetadataVersion(u32),

    #[error("exception store is truncated: expected {expected} bytes, read {actual}")]
    TruncatedExceptionStore { expected: usize, actual: usize },
}

/// Failure in the wire protocol shared by sender and receiver.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("handshake failed: expected '{expected}', saw '{actual}'")]
    HandshakeMismatch { expected: String, actual: String },

    #[error("truncated record header: expected 12 bytes, read {0}")]
    TruncatedHeader(usize),

    #[error("short read of chunk payload: expected {expected} bytes, read {actual}")]
    ShortPayload { expected: usize, actual: usize },

    #[error("short read from origin device: expected {expected} bytes, read {actual}")]
    OriginReadShort { expected: usize, actual: usize },
}

/// Errors surfaced from configuration/argument handling.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no snapshot device specified")]
    MissingSnapshot,

    #[error("no destination device specified")]
    MissingDestination,

    #[error("no destination patch file specified")]
    MissingPatchFile,

    #[error("no snapback file specified")]
    MissingSnapbackFile,

    #[error("malformed device name '{0}'")]
    MalformedDeviceName(String),
}

/// Top-level error, composed from every component's error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    DeviceLocator(#[from] DeviceLocatorError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Raised by `?` at call sites that don't yet have a path to attach
    /// (e.g. reads/writes against an already-open stream). Prefer
    /// [`Error::io`] when a path is available.
    #[error(transparent)]
    UnpathedIo(#[from] std::io::Error),

    #[error("endian conversion overflowed while round-tripping {0:#x}")]
    EndianOverflow(u64),
}

impl Error {
    /// Wraps a `std::io::Error` with the path that produced it, for richer
    /// diagnostics than a bare `io::Error` would give the user.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io { path: path.into(), source }
    }
}
