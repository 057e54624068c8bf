use serde::{Deserialize, Serialize};

use crate::types::{ErrorKind, FileManifest, FileRecord, TransferHandle};

// ---------------------------------------------------------------------------
// Requester -> host
// ---------------------------------------------------------------------------

/// Asks the host for the files under `subdir` that differ from `manifest`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// Aggregate handle chosen by the requester; echoed in every reply.
    pub request: TransferHandle,
    /// Normalized subdirectory of the host's upload set.
    pub subdir: String,
    /// Requester's files, relative to its output directory.
    pub manifest: FileManifest,
}

/// Stops every file of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelRequest {
    pub request: TransferHandle,
}

/// Stops a single file of a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelFile {
    pub request: TransferHandle,
    pub file_id: u32,
}

// ---------------------------------------------------------------------------
// Host -> requester
// ---------------------------------------------------------------------------

/// The host refused the request before sending any file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRejected {
    pub request: TransferHandle,
    pub kind: ErrorKind,
    pub message: String,
}

/// Announces a file and how it will be chunked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileStart {
    pub request: TransferHandle,
    /// Index of the file within the request; scopes chunk sequence numbers.
    pub file_id: u32,
    /// Hashed record, path relative to the requested subdirectory.
    pub record: FileRecord,
    /// Bytes per chunk (the last chunk may be shorter).
    pub chunk_size: u64,
    pub chunk_count: u64,
}

/// Header of one chunk. The chunk bytes follow the header in the packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileChunk {
    pub request: TransferHandle,
    pub file_id: u32,
    pub sequence: u64,
    pub offset: u64,
    pub len: u64,
}

/// A file could not be sent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFailed {
    pub request: TransferHandle,
    pub file_id: u32,
    pub relative_path: String,
    pub size: u64,
    pub kind: ErrorKind,
    pub message: String,
}

/// Every file of the request has been sent or reported as failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadComplete {
    pub request: TransferHandle,
    /// Number of file ids used by the host for this request.
    pub files: u32,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Packet header, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    DownloadRequest(DownloadRequest),
    DownloadRejected(DownloadRejected),
    FileStart(FileStart),
    FileChunk(FileChunk),
    FileFailed(FileFailed),
    DownloadComplete(DownloadComplete),
    Cancel(CancelRequest),
    CancelFile(CancelFile),
}

impl Message {
    /// Aggregate request handle the message belongs to.
    pub fn request(&self) -> TransferHandle {
        match self {
            Message::DownloadRequest(m) => m.request,
            Message::DownloadRejected(m) => m.request,
            Message::FileStart(m) => m.request,
            Message::FileChunk(m) => m.request,
            Message::FileFailed(m) => m.request,
            Message::DownloadComplete(m) => m.request,
            Message::Cancel(m) => m.request,
            Message::CancelFile(m) => m.request,
        }
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Message::DownloadRequest(_) => "download_request",
            Message::DownloadRejected(_) => "download_rejected",
            Message::FileStart(_) => "file_start",
            Message::FileChunk(_) => "file_chunk",
            Message::FileFailed(_) => "file_failed",
            Message::DownloadComplete(_) => "download_complete",
            Message::Cancel(_) => "cancel",
            Message::CancelFile(_) => "cancel_file",
        }
    }
}
