//! Host side: answers download requests from the upload set.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use dirdelta_protocol::messages::{
    CancelFile, CancelRequest, DownloadComplete, DownloadRejected, DownloadRequest, FileChunk,
    FileFailed, FileStart,
};
use dirdelta_protocol::{
    ErrorKind, FileManifest, FileRecord, Message, Packet, SendParams, TransferHandle,
};
use dirdelta_transfer::{
    DownloadSummary, FailureInfo, FileOutcome, FileSystemReader, HashFailure, HashReport,
    IncrementalRead, TerminalStatus, TransferCallback, TransferError, TransferSession,
    normalize_subdir, read_chunk, resolve, resolve_under_root,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::coordinator::{State, TransferCoordinator, finished_summary, run_blocking};

/// Bookkeeping of one upload in progress.
pub(crate) struct OutgoingRequest {
    pub(crate) peer: SocketAddr,
    /// Handle chosen by the requester.
    pub(crate) request: TransferHandle,
    pub(crate) token: CancellationToken,
    /// Child tokens of the files being sent, by file id.
    pub(crate) file_tokens: HashMap<u32, CancellationToken>,
}

/// Everything a spawned upload needs, captured when the request arrives.
struct UploadJob {
    handle: TransferHandle,
    request: TransferHandle,
    peer: SocketAddr,
    subdir: String,
    base_dir: PathBuf,
    records: FileManifest,
    requester_manifest: FileManifest,
    params: SendParams,
    reader: Arc<dyn IncrementalRead>,
    chunk_size: Option<u32>,
    callback: Option<Arc<dyn TransferCallback>>,
    token: CancellationToken,
}

impl UploadJob {
    fn file_failed(&self, file_id: u32, record: &FileRecord, info: &FailureInfo) -> Packet {
        Packet::new(Message::FileFailed(FileFailed {
            request: self.request,
            file_id,
            relative_path: record.relative_path.clone(),
            size: record.size,
            kind: info.kind,
            message: info.message.clone(),
        }))
    }
}

/// Cancels every upload to `peer`, returning how many there were.
pub(crate) fn cancel_outgoing_to(state: &State, peer: SocketAddr) -> usize {
    let mut cancelled = 0;
    for outgoing in state.outgoing.values().filter(|o| o.peer == peer) {
        outgoing.token.cancel();
        cancelled += 1;
    }
    cancelled
}

impl TransferCoordinator {
    pub(crate) async fn on_download_request(
        self: &Arc<Self>,
        peer: SocketAddr,
        msg: DownloadRequest,
    ) -> Result<(), TransferError> {
        let subdir = match normalize_subdir(&msg.subdir) {
            Ok(subdir) => subdir,
            Err(e) => return self.reject(peer, msg.request, &e).await,
        };
        let base_dir = resolve_under_root(&self.config.app_root, &subdir)?;

        let job = {
            let mut state = self.state();
            if state
                .outgoing
                .values()
                .any(|o| o.peer == peer && o.request == msg.request)
            {
                warn!(
                    coordinator = %self.id,
                    %peer,
                    request = %msg.request,
                    "duplicate download request ignored"
                );
                return Ok(());
            }
            state.handles.allocate().map(|handle| {
                let token = CancellationToken::new();
                state.outgoing.insert(
                    handle,
                    OutgoingRequest {
                        peer,
                        request: msg.request,
                        token: token.clone(),
                        file_tokens: HashMap::new(),
                    },
                );
                let (reader, chunk_size) = match &state.read_source {
                    Some(source) => (Arc::clone(&source.reader), Some(source.chunk_size)),
                    None => (Arc::new(FileSystemReader) as Arc<dyn IncrementalRead>, None),
                };
                UploadJob {
                    handle,
                    request: msg.request,
                    peer,
                    records: state.uploads.with_prefix(&subdir),
                    subdir: subdir.clone(),
                    base_dir,
                    requester_manifest: msg.manifest,
                    params: state.upload_params,
                    reader,
                    chunk_size,
                    callback: state.upload_callback.clone(),
                    token,
                }
            })
        };
        let job = match job {
            Ok(job) => job,
            Err(e) => return self.reject(peer, msg.request, &e).await,
        };

        let coordinator = Arc::clone(self);
        tokio::spawn(async move { coordinator.run_upload(job).await });
        Ok(())
    }

    async fn reject(
        &self,
        peer: SocketAddr,
        request: TransferHandle,
        error: &TransferError,
    ) -> Result<(), TransferError> {
        warn!(coordinator = %self.id, %peer, %request, "download request rejected: {error}");
        let params = self.state().upload_params;
        let packet = Packet::new(Message::DownloadRejected(DownloadRejected {
            request,
            kind: error.kind(),
            message: error.to_string(),
        }));
        self.send_packet(peer, params, packet).await
    }

    pub(crate) fn on_cancel_request(&self, peer: SocketAddr, msg: CancelRequest) {
        let state = self.state();
        match state
            .outgoing
            .values()
            .find(|o| o.peer == peer && o.request == msg.request)
        {
            Some(outgoing) => {
                debug!(
                    coordinator = %self.id,
                    %peer,
                    request = %msg.request,
                    "upload cancelled by requester"
                );
                outgoing.token.cancel();
            }
            None => debug!(
                coordinator = %self.id,
                %peer,
                request = %msg.request,
                "cancel for unknown upload"
            ),
        }
    }

    pub(crate) fn on_cancel_file(&self, peer: SocketAddr, msg: CancelFile) {
        let state = self.state();
        let token = state
            .outgoing
            .values()
            .find(|o| o.peer == peer && o.request == msg.request)
            .and_then(|o| o.file_tokens.get(&msg.file_id));
        match token {
            Some(token) => token.cancel(),
            None => debug!(
                coordinator = %self.id,
                %peer,
                request = %msg.request,
                file_id = msg.file_id,
                "cancel for unknown file"
            ),
        }
    }

    /// Cancels the upload with local handle `handle`.
    pub(crate) fn cancel_outgoing(&self, handle: TransferHandle) -> bool {
        match self.state().outgoing.get(&handle) {
            Some(outgoing) => {
                outgoing.token.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_upload(self: Arc<Self>, job: UploadJob) {
        info!(
            coordinator = %self.id,
            upload = %job.handle,
            peer = %job.peer,
            request = %job.request,
            subdir = %job.subdir,
            files = job.records.len(),
            "upload started"
        );
        let mut summary = DownloadSummary::new(job.handle);
        let mut next_id: u32 = 0;

        let report = self.hash_upload(&job).await;
        for failure in &report.failures {
            let info = FailureInfo::new(ErrorKind::Io, failure.error.to_string());
            let status = self.fail_unsent(&job, next_id, &failure.record, info).await;
            summary.record(status);
            next_id += 1;
        }

        let delta = resolve(&job.requester_manifest, &report.manifest);
        debug!(
            coordinator = %self.id,
            upload = %job.handle,
            needed = delta.needed.len(),
            unchanged = delta.unchanged,
            bytes = delta.needed_bytes(),
            "delta resolved"
        );
        for path in &delta.unresolved {
            let record = report
                .manifest
                .get(path)
                .cloned()
                .unwrap_or_else(|| FileRecord::new(path.as_str(), 0));
            let info = FailureInfo::new(ErrorKind::HashComputation, format!("{path} has no hash"));
            let status = self.fail_unsent(&job, next_id, &record, info).await;
            summary.record(status);
            next_id += 1;
        }

        // Every needed file gets an id and a terminal report, sent or not.
        for record in delta.needed {
            let status = if job.token.is_cancelled() {
                let info = FailureInfo::new(ErrorKind::Cancelled, "upload cancelled");
                self.fail_unsent(&job, next_id, &record, info).await
            } else {
                self.send_file(&job, next_id, record).await
            };
            summary.record(status);
            next_id += 1;
        }

        let complete = Packet::new(Message::DownloadComplete(DownloadComplete {
            request: job.request,
            files: next_id,
        }));
        if let Err(e) = self.send_packet(job.peer, job.params, complete).await {
            warn!(coordinator = %self.id, upload = %job.handle, "completion not delivered: {e}");
        }

        {
            let mut state = self.state();
            state.outgoing.remove(&job.handle);
            state.handles.release(job.handle);
        }
        let summary = finished_summary(summary);
        info!(
            coordinator = %self.id,
            upload = %job.handle,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            "upload finished"
        );
        if let Some(callback) = &job.callback {
            callback.on_download_complete(&summary);
        }
    }

    /// Hashes the snapshot; a failed worker fails every record.
    async fn hash_upload(&self, job: &UploadJob) -> HashReport {
        let hasher = Arc::clone(&self.hasher);
        let records = job.records.clone();
        let base_dir = job.base_dir.clone();
        match run_blocking(move || hasher.compute_hashes(&records, &base_dir)).await {
            Ok(report) => report,
            Err(e) => {
                warn!(coordinator = %self.id, upload = %job.handle, "hash worker failed: {e}");
                HashReport {
                    manifest: FileManifest::new(),
                    failures: job
                        .records
                        .iter()
                        .map(|record| HashFailure {
                            record: record.clone(),
                            error: TransferError::Io(std::io::Error::other(e.to_string())),
                        })
                        .collect(),
                }
            }
        }
    }

    /// Reports a file that was never started.
    async fn fail_unsent(
        &self,
        job: &UploadJob,
        file_id: u32,
        record: &FileRecord,
        info: FailureInfo,
    ) -> TerminalStatus {
        warn!(
            coordinator = %self.id,
            upload = %job.handle,
            path = %record.relative_path,
            kind = %info.kind,
            "file not sent: {}",
            info.message
        );
        let _ = self
            .send_packet(job.peer, job.params, job.file_failed(file_id, record, &info))
            .await;
        let outcome = FileOutcome::failed(
            job.handle,
            job.handle,
            record.relative_path.as_str(),
            record.size,
            info,
        );
        if let Some(callback) = &job.callback {
            callback.on_file_complete(&outcome);
        }
        outcome.status
    }

    /// Sends one needed file and reports its outcome.
    async fn send_file(&self, job: &UploadJob, file_id: u32, record: FileRecord) -> TerminalStatus {
        let allocated = {
            let mut state = self.state();
            state.handles.allocate().map(|handle| {
                let token = job.token.child_token();
                if let Some(outgoing) = state.outgoing.get_mut(&job.handle) {
                    outgoing.file_tokens.insert(file_id, token.clone());
                }
                (handle, token)
            })
        };
        let (handle, token) = match allocated {
            Ok(allocated) => allocated,
            Err(e) => return self.fail_unsent(job, file_id, &record, FailureInfo::from(&e)).await,
        };

        let session = TransferSession::new(
            job.handle,
            handle,
            file_id,
            record.clone(),
            job.peer,
            job.params,
        );
        let outcome = match session {
            Ok(mut session) => {
                match self.stream_file(job, &mut session, &token).await {
                    Ok(()) => {}
                    Err(TransferError::Cancelled) => {
                        session.cancel(ErrorKind::Cancelled);
                    }
                    Err(e) => {
                        warn!(
                            coordinator = %self.id,
                            upload = %job.handle,
                            path = %record.relative_path,
                            "send failed: {e}"
                        );
                        session.fail(FailureInfo::from(&e));
                    }
                }
                session.outcome().unwrap_or_else(|| {
                    FileOutcome::failed(
                        job.handle,
                        handle,
                        record.relative_path.as_str(),
                        record.size,
                        FailureInfo::new(ErrorKind::Protocol, "session ended before completion"),
                    )
                })
            }
            Err(e) => FileOutcome::failed(
                job.handle,
                handle,
                record.relative_path.as_str(),
                record.size,
                FailureInfo::from(&e),
            ),
        };

        if let Some(error) = &outcome.error {
            let _ = self
                .send_packet(job.peer, job.params, job.file_failed(file_id, &record, error))
                .await;
        } else {
            debug!(
                coordinator = %self.id,
                upload = %job.handle,
                path = %record.relative_path,
                bytes = outcome.bytes_transferred,
                "file sent"
            );
        }

        {
            let mut state = self.state();
            state.handles.release(handle);
            if let Some(outgoing) = state.outgoing.get_mut(&job.handle) {
                outgoing.file_tokens.remove(&file_id);
            }
        }
        if let Some(callback) = &job.callback {
            callback.on_file_complete(&outcome);
        }
        outcome.status
    }

    /// Announces the file and sends its chunks in sequence order.
    async fn stream_file(
        &self,
        job: &UploadJob,
        session: &mut TransferSession,
        token: &CancellationToken,
    ) -> Result<(), TransferError> {
        let plan = session.negotiate(job.chunk_size)?;
        let record = session.record().clone();
        let file_id = session.file_id();

        let start = Packet::new(Message::FileStart(FileStart {
            request: job.request,
            file_id,
            record: record.clone(),
            chunk_size: plan.chunk_size,
            chunk_count: plan.chunk_count,
        }));
        self.send_packet(job.peer, job.params, start).await?;
        session.begin()?;

        let path = job.base_dir.join(&record.relative_path);
        while let Some(spec) = session.next_chunk() {
            let reader = Arc::clone(&job.reader);
            let chunk_path = path.clone();
            let read = run_blocking(move || {
                read_chunk(reader.as_ref(), &chunk_path, spec.offset, spec.len)
            });
            let data = tokio::select! {
                _ = token.cancelled() => return Err(TransferError::Cancelled),
                data = read => data??,
            };

            let chunk = Packet::with_data(
                Message::FileChunk(FileChunk {
                    request: job.request,
                    file_id,
                    sequence: spec.sequence,
                    offset: spec.offset,
                    len: spec.len,
                }),
                data,
            );
            self.send_packet(job.peer, job.params, chunk).await?;

            let progress = session.record_chunk(spec.sequence, spec.offset, spec.len)?;
            if let Some(callback) = &job.callback {
                callback.on_progress(&progress);
            }
        }
        Ok(())
    }
}
