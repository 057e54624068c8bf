//! Per-file chunked transfer state machine.
//!
//! ```text
//! Requested -> Negotiating -> Transferring -> Completed
//!      \______________\_____________\______-> Failed | Cancelled
//! ```
//!
//! Terminal states are sticky; once a session has failed or been cancelled
//! no chunk can complete it.

use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use dirdelta_protocol::{ErrorKind, FileRecord, SendParams, TransferHandle};
use serde::Serialize;

use crate::TransferError;
use crate::progress::{FailureInfo, FileOutcome, FileProgress, TerminalStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    Negotiating,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed | SessionState::Cancelled
        )
    }
}

// ---------------------------------------------------------------------------
// Chunk planning
// ---------------------------------------------------------------------------

/// How a file is split into chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub chunk_size: u64,
    pub chunk_count: u64,
}

impl ChunkPlan {
    /// Plans `size` bytes with an optional chunk size.
    ///
    /// `None` (or zero) sends the whole file as one chunk. A zero-byte file
    /// has no chunks.
    pub fn for_size(size: u64, chunk_size: Option<u32>) -> Self {
        match chunk_size.filter(|&c| c > 0) {
            Some(c) => {
                let c = u64::from(c);
                Self {
                    chunk_size: c,
                    chunk_count: size.div_ceil(c),
                }
            }
            None => Self {
                chunk_size: size,
                chunk_count: u64::from(size > 0),
            },
        }
    }

    /// Checks that the plan covers exactly `size` bytes.
    pub fn validate(&self, size: u64) -> Result<(), TransferError> {
        let ok = if size == 0 {
            self.chunk_count == 0
        } else {
            self.chunk_size > 0 && self.chunk_count == size.div_ceil(self.chunk_size)
        };
        if ok {
            Ok(())
        } else {
            Err(TransferError::InvalidRequest(format!(
                "chunk plan {}x{} does not cover {size} bytes",
                self.chunk_count, self.chunk_size
            )))
        }
    }

    /// Length of chunk `sequence` for a file of `size` bytes.
    fn chunk_len(&self, size: u64, sequence: u64) -> u64 {
        let offset = sequence.saturating_mul(self.chunk_size);
        size.saturating_sub(offset).min(self.chunk_size)
    }
}

/// One chunk to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpec {
    pub sequence: u64,
    pub offset: u64,
    pub len: u64,
}

// ---------------------------------------------------------------------------
// TransferSession
// ---------------------------------------------------------------------------

/// Transfer of one hashed file between two peers.
///
/// Used on both sides: the sender walks [`next_chunk`](Self::next_chunk)
/// and records what it sent, the receiver records what arrived.
#[derive(Debug, Clone)]
pub struct TransferSession {
    request: TransferHandle,
    handle: TransferHandle,
    file_id: u32,
    record: FileRecord,
    peer: SocketAddr,
    params: SendParams,
    state: SessionState,
    plan: Option<ChunkPlan>,
    bytes_transferred: u64,
    next_sequence: u64,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<FailureInfo>,
}

impl TransferSession {
    /// Creates a session in [`SessionState::Requested`].
    ///
    /// The record must be hashed.
    pub fn new(
        request: TransferHandle,
        handle: TransferHandle,
        file_id: u32,
        record: FileRecord,
        peer: SocketAddr,
        params: SendParams,
    ) -> Result<Self, TransferError> {
        if !record.is_hashed() {
            return Err(TransferError::InvalidRequest(format!(
                "record {} has no hash",
                record.relative_path
            )));
        }
        Ok(Self {
            request,
            handle,
            file_id,
            record,
            peer,
            params,
            state: SessionState::Requested,
            plan: None,
            bytes_transferred: 0,
            next_sequence: 0,
            started_at: None,
            finished_at: None,
            error: None,
        })
    }

    /// Fixes the chunk plan on the sending side.
    pub fn negotiate(&mut self, chunk_size: Option<u32>) -> Result<ChunkPlan, TransferError> {
        let plan = ChunkPlan::for_size(self.record.size, chunk_size);
        self.adopt_plan(plan)?;
        Ok(plan)
    }

    /// Accepts the plan announced by the sender.
    pub fn adopt_plan(&mut self, plan: ChunkPlan) -> Result<(), TransferError> {
        self.expect_state(SessionState::Requested)?;
        plan.validate(self.record.size)?;
        self.plan = Some(plan);
        self.state = SessionState::Negotiating;
        Ok(())
    }

    /// Starts transferring. A zero-byte file completes immediately.
    pub fn begin(&mut self) -> Result<(), TransferError> {
        self.expect_state(SessionState::Negotiating)?;
        self.started_at = Some(Utc::now());
        self.state = SessionState::Transferring;
        if self.record.size == 0 {
            self.finish(SessionState::Completed);
        }
        Ok(())
    }

    /// The next chunk to send, or `None` once everything has been recorded.
    pub fn next_chunk(&self) -> Option<ChunkSpec> {
        if self.state != SessionState::Transferring {
            return None;
        }
        let plan = self.plan?;
        if self.next_sequence >= plan.chunk_count {
            return None;
        }
        Some(ChunkSpec {
            sequence: self.next_sequence,
            offset: self.bytes_transferred,
            len: plan.chunk_len(self.record.size, self.next_sequence),
        })
    }

    /// Records a transferred chunk and returns the updated progress.
    ///
    /// Only the next chunk in sequence, at the current offset and with the
    /// planned length, is accepted.
    pub fn record_chunk(
        &mut self,
        sequence: u64,
        offset: u64,
        len: u64,
    ) -> Result<FileProgress, TransferError> {
        let Some(expected) = self.next_chunk() else {
            return Err(TransferError::InvalidRequest(format!(
                "{} is not expecting chunks ({:?})",
                self.record.relative_path, self.state
            )));
        };
        if sequence != expected.sequence || offset != expected.offset || len != expected.len {
            return Err(TransferError::InvalidRequest(format!(
                "unexpected chunk {sequence}@{offset}+{len} for {}, wanted {}@{}+{}",
                self.record.relative_path, expected.sequence, expected.offset, expected.len
            )));
        }

        self.bytes_transferred += len;
        self.next_sequence += 1;
        if self.bytes_transferred == self.record.size {
            self.finish(SessionState::Completed);
        }
        Ok(self.progress())
    }

    /// Moves to `Failed`. Returns `false` if the session was already terminal.
    pub fn fail(&mut self, error: FailureInfo) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.error = Some(error);
        self.finish(SessionState::Failed);
        true
    }

    /// Moves to `Cancelled`, recording `reason` (usually
    /// [`ErrorKind::Cancelled`] or [`ErrorKind::PeerDisconnected`]).
    ///
    /// Returns `false` if the session was already terminal.
    pub fn cancel(&mut self, reason: ErrorKind) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.error = Some(FailureInfo::new(reason, reason.to_string()));
        self.finish(SessionState::Cancelled);
        true
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn progress(&self) -> FileProgress {
        FileProgress {
            request: self.request,
            handle: self.handle,
            path: self.record.relative_path.clone(),
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.record.size,
            chunk_index: self.next_sequence,
            chunk_count: self.plan.map_or(0, |p| p.chunk_count),
        }
    }

    /// Terminal report; `None` while the session is still running.
    pub fn outcome(&self) -> Option<FileOutcome> {
        let status = match self.state {
            SessionState::Completed => TerminalStatus::Completed,
            SessionState::Failed => TerminalStatus::Failed,
            SessionState::Cancelled => TerminalStatus::Cancelled,
            _ => return None,
        };
        Some(FileOutcome {
            request: self.request,
            handle: self.handle,
            path: self.record.relative_path.clone(),
            bytes_transferred: self.bytes_transferred,
            total_bytes: self.record.size,
            status,
            error: self.error.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at.unwrap_or_else(Utc::now),
        })
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn request(&self) -> TransferHandle {
        self.request
    }

    pub fn handle(&self) -> TransferHandle {
        self.handle
    }

    pub fn file_id(&self) -> u32 {
        self.file_id
    }

    pub fn record(&self) -> &FileRecord {
        &self.record
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn params(&self) -> SendParams {
        self.params
    }

    pub fn plan(&self) -> Option<ChunkPlan> {
        self.plan
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes_transferred
    }

    fn expect_state(&self, wanted: SessionState) -> Result<(), TransferError> {
        if self.state == wanted {
            return Ok(());
        }
        Err(TransferError::InvalidRequest(format!(
            "{} is {:?}, expected {wanted:?}",
            self.record.relative_path, self.state
        )))
    }

    fn finish(&mut self, state: SessionState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_bytes;

    fn peer() -> SocketAddr {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn session(size: u64) -> TransferSession {
        let record = FileRecord::new("f.bin", size).hashed(size, hash_bytes(b"f"));
        TransferSession::new(
            TransferHandle(1),
            TransferHandle(2),
            0,
            record,
            peer(),
            SendParams::default(),
        )
        .unwrap()
    }

    fn drain(s: &mut TransferSession) -> (u64, u64) {
        let mut chunks = 0;
        while let Some(spec) = s.next_chunk() {
            s.record_chunk(spec.sequence, spec.offset, spec.len).unwrap();
            chunks += 1;
        }
        (chunks, s.bytes_transferred())
    }

    #[test]
    fn unhashed_record_rejected() {
        let result = TransferSession::new(
            TransferHandle(1),
            TransferHandle(2),
            0,
            FileRecord::new("raw", 3),
            peer(),
            SendParams::default(),
        );
        assert!(matches!(result, Err(TransferError::InvalidRequest(_))));
    }

    #[test]
    fn chunk_count_is_ceil_and_bytes_exact() {
        let cases = [
            (10u64, 4u32),
            (12, 4),
            (1, 4096),
            (4096, 4096),
            (4097, 4096),
            (1_000_003, 65_536),
        ];
        for (size, chunk) in cases {
            let mut s = session(size);
            let plan = s.negotiate(Some(chunk)).unwrap();
            assert_eq!(plan.chunk_count, size.div_ceil(u64::from(chunk)));
            s.begin().unwrap();

            let (chunks, bytes) = drain(&mut s);
            assert_eq!(chunks, plan.chunk_count, "size {size} chunk {chunk}");
            assert_eq!(bytes, size);
            assert_eq!(s.state(), SessionState::Completed);
        }
    }

    #[test]
    fn whole_file_is_single_chunk() {
        let mut s = session(5000);
        let plan = s.negotiate(None).unwrap();
        assert_eq!(plan, ChunkPlan { chunk_size: 5000, chunk_count: 1 });
        s.begin().unwrap();
        assert_eq!(drain(&mut s), (1, 5000));
    }

    #[test]
    fn zero_byte_file_completes_at_begin() {
        let mut s = session(0);
        assert_eq!(s.negotiate(Some(16)).unwrap().chunk_count, 0);
        s.begin().unwrap();
        assert_eq!(s.state(), SessionState::Completed);
        assert!(s.next_chunk().is_none());
        assert_eq!(s.outcome().unwrap().status, TerminalStatus::Completed);
    }

    #[test]
    fn out_of_order_chunk_rejected() {
        let mut s = session(10);
        s.negotiate(Some(4)).unwrap();
        s.begin().unwrap();
        assert!(s.record_chunk(1, 4, 4).is_err());
        assert!(s.record_chunk(0, 0, 5).is_err());
        let progress = s.record_chunk(0, 0, 4).unwrap();
        assert_eq!(progress.chunk_index, 1);
        assert_eq!(progress.bytes_transferred, 4);
        assert_eq!(progress.chunk_count, 3);
    }

    #[test]
    fn cancelled_session_never_completes() {
        let mut s = session(8);
        s.negotiate(Some(4)).unwrap();
        s.begin().unwrap();
        s.record_chunk(0, 0, 4).unwrap();

        assert!(s.cancel(ErrorKind::Cancelled));
        assert!(s.record_chunk(1, 4, 4).is_err());
        assert!(!s.fail(FailureInfo::new(ErrorKind::Io, "late")));
        assert!(!s.cancel(ErrorKind::Cancelled));

        let outcome = s.outcome().unwrap();
        assert_eq!(outcome.status, TerminalStatus::Cancelled);
        assert_eq!(outcome.bytes_transferred, 4);
        assert_eq!(outcome.error.unwrap().kind, ErrorKind::Cancelled);
    }

    #[test]
    fn completed_session_cannot_fail() {
        let mut s = session(3);
        s.negotiate(None).unwrap();
        s.begin().unwrap();
        drain(&mut s);
        assert!(!s.cancel(ErrorKind::PeerDisconnected));
        assert_eq!(s.outcome().unwrap().status, TerminalStatus::Completed);
    }

    #[test]
    fn adopt_plan_checks_coverage() {
        let mut s = session(10);
        assert!(s.adopt_plan(ChunkPlan { chunk_size: 4, chunk_count: 2 }).is_err());
        assert_eq!(s.state(), SessionState::Requested);
        s.adopt_plan(ChunkPlan { chunk_size: 4, chunk_count: 3 }).unwrap();
        assert_eq!(s.state(), SessionState::Negotiating);
    }

    #[test]
    fn transitions_out_of_order_rejected() {
        let mut s = session(4);
        assert!(s.begin().is_err());
        s.negotiate(None).unwrap();
        assert!(s.negotiate(None).is_err());
        assert!(s.outcome().is_none());
    }
}
