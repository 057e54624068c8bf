//! Delta transfer engine: manifests, hashing, delta resolution and chunked
//! file transfer sessions.

mod chunked;
mod delta;
mod hash;
mod progress;
mod scanner;
mod session;
mod validation;

use std::net::SocketAddr;
use std::path::PathBuf;

use dirdelta_protocol::{ErrorKind, ProtocolError};

pub use chunked::{FileSystemReader, IncrementalRead, StagingFile, read_chunk};
pub use delta::{Delta, resolve};
pub use hash::{HashEngine, HashFailure, HashReport, hash_bytes, hash_file};
pub use progress::{
    DownloadSummary, FailureInfo, FileOutcome, FileProgress, TerminalStatus, TransferCallback,
    TransferEvent,
};
pub use scanner::scan_directory;
pub use session::{ChunkPlan, ChunkSpec, SessionState, TransferSession};
pub use validation::{normalize_subdir, resolve_under_root, validate_relative_path};

/// Default staging suffix appended to files while they are being received.
pub const DEFAULT_STAGING_SUFFIX: &str = ".part";

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("path not found: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("path escapes application root: {0}")]
    PathEscapesRoot(String),

    #[error("failed to hash {path}: {source}")]
    HashComputation {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("peer disconnected: {0}")]
    PeerDisconnected(SocketAddr),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("checksum mismatch: {0}")]
    ChecksumMismatch(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("transport error: {0}")]
    Transport(String),
}

impl TransferError {
    /// Category used for callbacks and wire reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransferError::Io(_) | TransferError::Transport(_) => ErrorKind::Io,
            TransferError::PathNotFound(_) => ErrorKind::PathNotFound,
            TransferError::PathEscapesRoot(_) => ErrorKind::PathEscapesRoot,
            TransferError::HashComputation { .. } => ErrorKind::HashComputation,
            TransferError::PeerDisconnected(_) => ErrorKind::PeerDisconnected,
            TransferError::Cancelled => ErrorKind::Cancelled,
            TransferError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            TransferError::ChecksumMismatch(_) => ErrorKind::ChecksumMismatch,
            TransferError::Protocol(_) => ErrorKind::Protocol,
        }
    }
}
