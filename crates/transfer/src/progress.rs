//! Progress and completion reporting.

use chrono::{DateTime, Utc};
use dirdelta_protocol::{ErrorKind, TransferHandle};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::TransferError;

/// Error attached to a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<&TransferError> for FailureInfo {
    fn from(err: &TransferError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl From<TransferError> for FailureInfo {
    fn from(err: TransferError) -> Self {
        Self::from(&err)
    }
}

/// Snapshot sent after every chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileProgress {
    /// Aggregate request the file belongs to.
    pub request: TransferHandle,
    /// Handle of the file session.
    pub handle: TransferHandle,
    pub path: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// 1-based index of the chunk just transferred.
    pub chunk_index: u64,
    pub chunk_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Failed,
    Cancelled,
}

/// Terminal report of one file session, delivered exactly once.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileOutcome {
    pub request: TransferHandle,
    pub handle: TransferHandle,
    pub path: String,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    pub status: TerminalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

impl FileOutcome {
    /// Outcome for a file that failed before any session existed for it.
    ///
    /// `handle` is the request handle when no file handle was allocated.
    pub fn failed(
        request: TransferHandle,
        handle: TransferHandle,
        path: impl Into<String>,
        total_bytes: u64,
        error: FailureInfo,
    ) -> Self {
        let status = if matches!(error.kind, ErrorKind::Cancelled | ErrorKind::PeerDisconnected) {
            TerminalStatus::Cancelled
        } else {
            TerminalStatus::Failed
        };
        Self {
            request,
            handle,
            path: path.into(),
            bytes_transferred: 0,
            total_bytes,
            status,
            error: Some(error),
            started_at: None,
            finished_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TerminalStatus::Completed
    }
}

/// Aggregate report of a download request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadSummary {
    pub request: TransferHandle,
    pub completed: u32,
    pub failed: u32,
    pub cancelled: u32,
    /// Set when the host refused the request as a whole.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejected: Option<FailureInfo>,
    pub finished_at: DateTime<Utc>,
}

impl DownloadSummary {
    pub fn new(request: TransferHandle) -> Self {
        Self {
            request,
            completed: 0,
            failed: 0,
            cancelled: 0,
            rejected: None,
            finished_at: Utc::now(),
        }
    }

    /// Counts one terminal file outcome.
    pub fn record(&mut self, status: TerminalStatus) {
        match status {
            TerminalStatus::Completed => self.completed += 1,
            TerminalStatus::Failed => self.failed += 1,
            TerminalStatus::Cancelled => self.cancelled += 1,
        }
    }

    pub fn total(&self) -> u32 {
        self.completed + self.failed + self.cancelled
    }
}

/// Observer of a transfer.
///
/// Callbacks run on whichever task drives the session; implementations
/// must not block.
pub trait TransferCallback: Send + Sync {
    fn on_progress(&self, progress: &FileProgress);

    fn on_file_complete(&self, outcome: &FileOutcome);

    fn on_download_complete(&self, _summary: &DownloadSummary) {}
}

/// Owned form of a callback invocation, for channel-based observers.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferEvent {
    Progress(FileProgress),
    FileComplete(FileOutcome),
    DownloadComplete(DownloadSummary),
}

impl TransferCallback for mpsc::UnboundedSender<TransferEvent> {
    fn on_progress(&self, progress: &FileProgress) {
        let _ = self.send(TransferEvent::Progress(progress.clone()));
    }

    fn on_file_complete(&self, outcome: &FileOutcome) {
        let _ = self.send(TransferEvent::FileComplete(outcome.clone()));
    }

    fn on_download_complete(&self, summary: &DownloadSummary) {
        let _ = self.send(TransferEvent::DownloadComplete(summary.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_info_from_error() {
        let info = FailureInfo::from(&TransferError::PathEscapesRoot("../x".into()));
        assert_eq!(info.kind, ErrorKind::PathEscapesRoot);
        assert!(info.message.contains("../x"));
    }

    #[test]
    fn failed_outcome_maps_cancel_kind() {
        let outcome = FileOutcome::failed(
            TransferHandle(1),
            TransferHandle(2),
            "a.bin",
            10,
            FailureInfo::new(ErrorKind::Cancelled, "stopped"),
        );
        assert_eq!(outcome.status, TerminalStatus::Cancelled);

        let outcome = FileOutcome::failed(
            TransferHandle(1),
            TransferHandle(3),
            "b.bin",
            10,
            FailureInfo::new(ErrorKind::Io, "gone"),
        );
        assert_eq!(outcome.status, TerminalStatus::Failed);
        assert!(!outcome.is_success());

        let outcome = FileOutcome::failed(
            TransferHandle(1),
            TransferHandle(4),
            "c.bin",
            10,
            FailureInfo::new(ErrorKind::PeerDisconnected, "peer left"),
        );
        assert_eq!(outcome.status, TerminalStatus::Cancelled);
    }

    #[test]
    fn summary_counts() {
        let mut summary = DownloadSummary::new(TransferHandle(4));
        summary.record(TerminalStatus::Completed);
        summary.record(TerminalStatus::Completed);
        summary.record(TerminalStatus::Failed);
        assert_eq!(summary.completed, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.total(), 3);
    }

    #[test]
    fn channel_sender_forwards_events() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let summary = DownloadSummary::new(TransferHandle(9));
        tx.on_download_complete(&summary);

        match rx.try_recv().unwrap() {
            TransferEvent::DownloadComplete(s) => assert_eq!(s.request, TransferHandle(9)),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn outcome_json_shape() {
        let outcome = FileOutcome::failed(
            TransferHandle(1),
            TransferHandle(2),
            "a.bin",
            3,
            FailureInfo::new(ErrorKind::Io, "boom"),
        );
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["kind"], "io");
        assert_eq!(json["totalBytes"], 3);
        assert!(json.get("startedAt").is_none());
    }
}
