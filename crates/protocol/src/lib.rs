//! Wire protocol types for dirdelta peer-to-peer directory transfers.
//!
//! A requester sends its local [`FileManifest`] in a download request; the
//! host answers with per-file headers, chunks and a completion message.
//! Every message travels as a [`Packet`] over an ordering channel of the
//! underlying transport.

pub mod constants;
pub mod envelope;
pub mod messages;
pub mod types;

// Re-export primary types for convenience.
pub use constants::{MAX_HEADER_LEN, MAX_ORDERING_CHANNELS, WIRE_VERSION};
pub use envelope::Packet;
pub use messages::Message;
pub use types::{
    ContentHash, ErrorKind, FileManifest, FileRecord, OrderingChannel, PacketPriority,
    SendParams, TransferHandle,
};

/// Errors produced while building or parsing protocol data.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid content hash: {0}")]
    InvalidHash(String),

    #[error("ordering channel {0} out of range (max {max})", max = MAX_ORDERING_CHANNELS - 1)]
    InvalidChannel(u8),

    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u8),

    #[error("malformed packet: {0}")]
    Malformed(String),
}
