//! The typed configuration value threaded explicitly into the sender and
//! receiver, replacing the original tool's global options bag (see the
//! Design Notes on "Global state → explicit parameters").

use std::path::PathBuf;

/// Where the sender should write its framed output.
#[derive(Debug, Clone)]
pub enum SenderTarget {
    /// Spawn a remote shell and pipe into its standard input.
    Network { host: String, remote_destdev: String },
    /// Write to a local file, or standard output when the path is `-`.
    Patch { path: PathBuf },
}

/// Where the receiver should read its framed input from.
#[derive(Debug, Clone)]
pub enum ReceiverSource {
    /// Read framed records from standard input ("server" mode).
    Stdin,
    /// Read framed records from a local file ("apply" mode).
    File { path: PathBuf },
}

/// Resolved, immutable configuration for one sync invocation. Built once by
/// the CLI from parsed arguments and passed into [`crate::sender`] /
/// [`crate::receiver`] constructors.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Write a pre-image rollback file to this path as records are applied.
    pub snapback_path: Option<PathBuf>,
    /// Suppress the final human-readable transfer summary.
    pub quiet: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig { snapback_path: None, quiet: false }
    }
}
