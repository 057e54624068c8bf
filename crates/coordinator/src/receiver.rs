//! Requesting side: receives the files a host announces.
//!
//! Each announced file gets a receiving [`TransferSession`] and a staging
//! file. The last chunk "claims" its session by moving it out of the
//! request's table under the lock. A cancel that comes later no longer
//! finds the session; it marks the request instead, and the claimed file
//! checks that mark before its staging file is renamed into place. The
//! request's summary waits until every claimed file has settled.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use dirdelta_protocol::messages::{
    CancelFile, CancelRequest, DownloadComplete, DownloadRejected, FileChunk, FileFailed,
    FileStart,
};
use dirdelta_protocol::{ContentHash, ErrorKind, Message, Packet, SendParams, TransferHandle};
use dirdelta_transfer::{
    ChunkPlan, ChunkSpec, DownloadSummary, FailureInfo, FileOutcome, StagingFile,
    TransferCallback, TransferError, TransferEvent, TransferSession, validate_relative_path,
};
use tracing::{debug, info, warn};

use crate::coordinator::{
    Effects, Outbound, State, TransferCoordinator, finished_summary, run_blocking,
};
use crate::handles::HandleAllocator;

/// Staging file shared between the table and an in-flight write.
/// `None` once the file has been claimed or discarded.
pub(crate) type SharedStaging = Arc<Mutex<Option<StagingFile>>>;

/// One download request in progress.
pub(crate) struct IncomingRequest {
    handle: TransferHandle,
    peer: SocketAddr,
    params: SendParams,
    subdir: String,
    output_dir: PathBuf,
    callback: Arc<dyn TransferCallback>,
    files: HashMap<u32, IncomingFile>,
    /// File ids whose last chunk is being written and verified.
    claimed: HashSet<u32>,
    /// File ids that reached a terminal state.
    finished: HashSet<u32>,
    /// File count from the host's completion message.
    announced: Option<u32>,
    /// Set once the request was cancelled locally or lost its peer.
    ended: Option<ErrorKind>,
    summary: DownloadSummary,
}

struct IncomingFile {
    session: TransferSession,
    staging: SharedStaging,
    callback: Arc<dyn TransferCallback>,
}

impl IncomingRequest {
    pub(crate) fn new(
        handle: TransferHandle,
        peer: SocketAddr,
        params: SendParams,
        subdir: String,
        output_dir: PathBuf,
        callback: Arc<dyn TransferCallback>,
    ) -> Self {
        Self {
            handle,
            peer,
            params,
            subdir,
            output_dir,
            callback,
            files: HashMap::new(),
            claimed: HashSet::new(),
            finished: HashSet::new(),
            announced: None,
            ended: None,
            summary: DownloadSummary::new(handle),
        }
    }

    /// Whether messages from the host still apply to this request.
    fn accepts(&self, peer: SocketAddr) -> bool {
        self.peer == peer && self.ended.is_none()
    }

    fn claim(&mut self, file_id: u32) -> Option<IncomingFile> {
        let file = self.files.remove(&file_id)?;
        self.claimed.insert(file_id);
        Some(file)
    }

    fn settle(&mut self, file_id: u32, outcome: FileOutcome, effects: &mut Effects) {
        self.claimed.remove(&file_id);
        self.finished.insert(file_id);
        self.summary.record(outcome.status);
        effects.notify(Arc::clone(&self.callback), TransferEvent::FileComplete(outcome));
    }

    fn is_done(&self) -> bool {
        if !self.files.is_empty() || !self.claimed.is_empty() {
            return false;
        }
        if self.ended.is_some() || self.summary.rejected.is_some() {
            return true;
        }
        self.announced
            .is_some_and(|files| self.finished.len() >= files as usize)
    }

    /// Cancels every running file, in file id order.
    fn cancel_all(
        &mut self,
        reason: ErrorKind,
        handles: &mut HandleAllocator,
        effects: &mut Effects,
    ) {
        let mut files: Vec<(u32, IncomingFile)> = self.files.drain().collect();
        files.sort_by_key(|(file_id, _)| *file_id);
        for (file_id, mut file) in files {
            file.session.cancel(reason);
            handles.release(file.session.handle());
            effects.discard(file.staging);
            if let Some(outcome) = file.session.outcome() {
                self.settle(file_id, outcome, effects);
            }
        }
    }
}

/// Removes staging files of sessions that will never complete.
pub(crate) fn discard_all(discards: Vec<SharedStaging>) {
    for shared in discards {
        let staging = shared.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(staging) = staging {
            let path = staging.staging_path().to_path_buf();
            if let Err(e) = staging.discard() {
                warn!(path = %path.display(), "failed to remove staging file: {e}");
            }
        }
    }
}

fn cancel_file_packet(request: TransferHandle, file_id: u32) -> Packet {
    Packet::new(Message::CancelFile(CancelFile { request, file_id }))
}

/// Where the next received chunk goes.
enum ChunkRoute {
    Unknown,
    OutOfOrder,
    Last,
    Partial(SharedStaging),
}

enum ChunkStep {
    Skip,
    Write(SharedStaging),
    Finish(IncomingFile),
}

/// How a claimed file left its staging area.
enum Landing {
    /// Verified and renamed to its final path.
    Committed,
    /// The request ended first; the staging file was removed.
    Dropped(ErrorKind),
    Failed(TransferError),
}

impl TransferCoordinator {
    // -- host messages ------------------------------------------------------

    pub(crate) async fn on_file_start(
        &self,
        peer: SocketAddr,
        msg: FileStart,
    ) -> Result<(), TransferError> {
        let mut effects = Effects::default();

        let target = {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(req) = state
                .incoming
                .get_mut(&msg.request)
                .filter(|r| r.accepts(peer))
            else {
                debug!(
                    coordinator = %self.id,
                    %peer,
                    request = %msg.request,
                    "file_start for unknown request"
                );
                return Ok(());
            };
            if req.files.contains_key(&msg.file_id)
                || req.claimed.contains(&msg.file_id)
                || req.finished.contains(&msg.file_id)
            {
                debug!(
                    coordinator = %self.id,
                    request = %msg.request,
                    file_id = msg.file_id,
                    "duplicate file_start"
                );
                return Ok(());
            }

            match open_session(req, &mut state.handles, &msg) {
                Ok((session, target)) => {
                    debug!(
                        coordinator = %self.id,
                        request = %msg.request,
                        handle = %session.handle(),
                        path = %msg.record.relative_path,
                        size = msg.record.size,
                        chunks = msg.chunk_count,
                        "receiving file"
                    );
                    let callback = Arc::clone(&req.callback);
                    req.files.insert(
                        msg.file_id,
                        IncomingFile {
                            session,
                            staging: Arc::new(Mutex::new(None)),
                            callback,
                        },
                    );
                    Some(target)
                }
                Err(e) => {
                    warn!(
                        coordinator = %self.id,
                        request = %msg.request,
                        path = %msg.record.relative_path,
                        "refusing file: {e}"
                    );
                    let outcome = FileOutcome::failed(
                        msg.request,
                        msg.request,
                        msg.record.relative_path.as_str(),
                        msg.record.size,
                        FailureInfo::from(&e),
                    );
                    req.settle(msg.file_id, outcome, &mut effects);
                    let cancel = cancel_file_packet(msg.request, msg.file_id);
                    effects.send(req.peer, req.params, cancel);
                    self.close_if_done(state, msg.request, &mut effects);
                    None
                }
            }
        };

        if let Some(target) = target {
            let suffix = self.config.staging_suffix.clone();
            let created = run_blocking(move || StagingFile::create(&target, &suffix))
                .await
                .and_then(|r| r);
            self.attach_staging(&msg, created, &mut effects).await;
        }

        self.flush(effects.apply()).await;
        Ok(())
    }

    /// Hands the created staging file to the session and starts it.
    async fn attach_staging(
        &self,
        msg: &FileStart,
        created: Result<StagingFile, TransferError>,
        effects: &mut Effects,
    ) {
        let claimed = {
            let mut guard = self.state();
            let state = &mut *guard;
            let exists = state
                .incoming
                .get(&msg.request)
                .is_some_and(|r| r.files.contains_key(&msg.file_id));

            match created {
                Ok(staging) if !exists => {
                    effects.discard(Arc::new(Mutex::new(Some(staging))));
                    None
                }
                Err(_) if !exists => None,
                Err(e) => {
                    let info = FailureInfo::from(&e);
                    self.fail_file(state, msg.request, msg.file_id, info, true, effects);
                    None
                }
                Ok(staging) if msg.record.size == 0 => state
                    .incoming
                    .get_mut(&msg.request)
                    .and_then(|r| r.claim(msg.file_id))
                    .map(|file| (file, staging)),
                Ok(staging) => {
                    let begun = state
                        .incoming
                        .get_mut(&msg.request)
                        .and_then(|r| r.files.get_mut(&msg.file_id))
                        .map(|file| {
                            *file.staging.lock().unwrap_or_else(PoisonError::into_inner) =
                                Some(staging);
                            file.session.begin()
                        });
                    if let Some(Err(e)) = begun {
                        let info = FailureInfo::from(&e);
                        self.fail_file(state, msg.request, msg.file_id, info, true, effects);
                    }
                    None
                }
            }
        };

        // Zero-byte files complete as soon as the empty staging file is verified.
        if let Some((file, staging)) = claimed {
            let landing = match file.session.record().hash {
                Some(expected) => self.land(msg.request, staging, expected, None).await,
                None => {
                    effects.discard(Arc::new(Mutex::new(Some(staging))));
                    Landing::Failed(TransferError::InvalidRequest("record has no hash".into()))
                }
            };
            self.settle_claimed(msg.request, msg.file_id, file, landing, None, effects);
        }
    }

    pub(crate) async fn on_file_chunk(
        &self,
        peer: SocketAddr,
        msg: FileChunk,
        data: Vec<u8>,
    ) -> Result<(), TransferError> {
        let spec = ChunkSpec {
            sequence: msg.sequence,
            offset: msg.offset,
            len: msg.len,
        };
        let mut effects = Effects::default();

        let step = {
            let mut guard = self.state();
            let state = &mut *guard;
            let route = match state
                .incoming
                .get_mut(&msg.request)
                .filter(|r| r.accepts(peer))
                .and_then(|r| r.files.get_mut(&msg.file_id))
            {
                None => ChunkRoute::Unknown,
                Some(file) if file.session.next_chunk() != Some(spec) => ChunkRoute::OutOfOrder,
                Some(file) if spec.offset + spec.len == file.session.record().size => {
                    ChunkRoute::Last
                }
                Some(file) => ChunkRoute::Partial(Arc::clone(&file.staging)),
            };

            match route {
                ChunkRoute::Unknown => {
                    debug!(
                        coordinator = %self.id,
                        request = %msg.request,
                        file_id = msg.file_id,
                        sequence = msg.sequence,
                        "chunk for unknown or finished file discarded"
                    );
                    ChunkStep::Skip
                }
                ChunkRoute::OutOfOrder => {
                    let e = TransferError::InvalidRequest(format!(
                        "unexpected chunk {} at offset {}",
                        msg.sequence, msg.offset
                    ));
                    let info = FailureInfo::from(&e);
                    self.fail_file(state, msg.request, msg.file_id, info, true, &mut effects);
                    ChunkStep::Skip
                }
                ChunkRoute::Last => state
                    .incoming
                    .get_mut(&msg.request)
                    .and_then(|r| r.claim(msg.file_id))
                    .map_or(ChunkStep::Skip, ChunkStep::Finish),
                ChunkRoute::Partial(staging) => ChunkStep::Write(staging),
            }
        };

        match step {
            ChunkStep::Skip => {}
            ChunkStep::Write(staging) => {
                let offset = msg.offset;
                let written = run_blocking(move || {
                    let mut guard = staging.lock().unwrap_or_else(PoisonError::into_inner);
                    match guard.as_mut() {
                        Some(staging) => staging.write_at(offset, &data).map(|()| true),
                        None => Ok(false),
                    }
                })
                .await
                .and_then(|r| r);
                self.record_written(&msg, spec, written, &mut effects);
            }
            ChunkStep::Finish(file) => {
                let staging = file
                    .staging
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                let landing = match (staging, file.session.record().hash) {
                    (Some(staging), Some(expected)) => {
                        let chunk = Some((msg.offset, data));
                        self.land(msg.request, staging, expected, chunk).await
                    }
                    (staging, _) => {
                        effects.discard(Arc::new(Mutex::new(staging)));
                        Landing::Failed(TransferError::InvalidRequest(
                            "file has no staging area or hash".into(),
                        ))
                    }
                };
                let (request, file_id) = (msg.request, msg.file_id);
                self.settle_claimed(request, file_id, file, landing, Some(spec), &mut effects);
            }
        }

        self.flush(effects.apply()).await;
        Ok(())
    }

    fn record_written(
        &self,
        msg: &FileChunk,
        spec: ChunkSpec,
        written: Result<bool, TransferError>,
        effects: &mut Effects,
    ) {
        let mut guard = self.state();
        let state = &mut *guard;
        let error = match written {
            // Cancelled while the write was in flight.
            Ok(false) => return,
            Ok(true) => {
                let recorded = state
                    .incoming
                    .get_mut(&msg.request)
                    .and_then(|r| r.files.get_mut(&msg.file_id))
                    .map(|file| {
                        (
                            file.session.record_chunk(spec.sequence, spec.offset, spec.len),
                            Arc::clone(&file.callback),
                        )
                    });
                match recorded {
                    Some((Ok(progress), callback)) => {
                        effects.notify(callback, TransferEvent::Progress(progress));
                        return;
                    }
                    Some((Err(e), _)) => e,
                    None => return,
                }
            }
            Err(e) => e,
        };
        let info = FailureInfo::from(&error);
        self.fail_file(state, msg.request, msg.file_id, info, true, effects);
    }

    /// Writes the last chunk (if any), verifies the staged content and,
    /// unless the request ended meanwhile, moves it into place.
    async fn land(
        &self,
        request: TransferHandle,
        mut staging: StagingFile,
        expected: ContentHash,
        chunk: Option<(u64, Vec<u8>)>,
    ) -> Landing {
        let verified = run_blocking(move || {
            let checked = match &chunk {
                Some((offset, data)) => staging.write_at(*offset, data),
                None => Ok(()),
            }
            .and_then(|()| staging.verify(&expected));
            match checked {
                Ok(()) => Ok(staging),
                Err(e) => {
                    let _ = staging.discard();
                    Err(e)
                }
            }
        })
        .await
        .and_then(|r| r);
        let staging = match verified {
            Ok(staging) => staging,
            Err(e) => return Landing::Failed(e),
        };

        let ended = self
            .state()
            .incoming
            .get(&request)
            .map_or(Some(ErrorKind::Cancelled), |r| r.ended);
        if let Some(reason) = ended {
            let path = staging.staging_path().to_path_buf();
            if let Err(e) = run_blocking(move || staging.discard()).await.and_then(|r| r) {
                warn!(path = %path.display(), "failed to remove staging file: {e}");
            }
            return Landing::Dropped(reason);
        }

        match run_blocking(move || staging.persist()).await.and_then(|r| r) {
            Ok(_) => Landing::Committed,
            Err(e) => Landing::Failed(e),
        }
    }

    pub(crate) fn on_file_failed(
        &self,
        peer: SocketAddr,
        msg: FileFailed,
    ) -> Result<(), TransferError> {
        let mut effects = Effects::default();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(req) = state
                .incoming
                .get_mut(&msg.request)
                .filter(|r| r.accepts(peer))
            else {
                debug!(
                    coordinator = %self.id,
                    request = %msg.request,
                    "file_failed for unknown request"
                );
                return Ok(());
            };

            let info = FailureInfo::new(msg.kind, msg.message);
            if req.files.contains_key(&msg.file_id) {
                self.fail_file(state, msg.request, msg.file_id, info, false, &mut effects);
            } else if !req.finished.contains(&msg.file_id) && !req.claimed.contains(&msg.file_id) {
                warn!(
                    coordinator = %self.id,
                    request = %msg.request,
                    path = %msg.relative_path,
                    kind = %info.kind,
                    "host did not send file: {}",
                    info.message
                );
                let outcome = FileOutcome::failed(
                    msg.request,
                    msg.request,
                    msg.relative_path,
                    msg.size,
                    info,
                );
                req.settle(msg.file_id, outcome, &mut effects);
                self.close_if_done(state, msg.request, &mut effects);
            }
        }
        let _ = effects.apply();
        Ok(())
    }

    pub(crate) fn on_download_complete(
        &self,
        peer: SocketAddr,
        msg: DownloadComplete,
    ) -> Result<(), TransferError> {
        let mut effects = Effects::default();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            match state
                .incoming
                .get_mut(&msg.request)
                .filter(|r| r.accepts(peer))
            {
                Some(req) => req.announced = Some(msg.files),
                None => {
                    debug!(
                        coordinator = %self.id,
                        request = %msg.request,
                        "download_complete for unknown request"
                    );
                    return Ok(());
                }
            }
            self.close_if_done(state, msg.request, &mut effects);
        }
        let _ = effects.apply();
        Ok(())
    }

    pub(crate) fn on_download_rejected(
        &self,
        peer: SocketAddr,
        msg: DownloadRejected,
    ) -> Result<(), TransferError> {
        let mut effects = Effects::default();
        {
            let mut guard = self.state();
            let state = &mut *guard;
            let Some(req) = state
                .incoming
                .get_mut(&msg.request)
                .filter(|r| r.accepts(peer))
            else {
                debug!(
                    coordinator = %self.id,
                    request = %msg.request,
                    "rejection for unknown request"
                );
                return Ok(());
            };
            warn!(
                coordinator = %self.id,
                request = %msg.request,
                subdir = %req.subdir,
                kind = %msg.kind,
                "download rejected: {}",
                msg.message
            );
            req.summary.rejected = Some(FailureInfo::new(msg.kind, msg.message));
            req.cancel_all(ErrorKind::Cancelled, &mut state.handles, &mut effects);
            self.close_if_done(state, msg.request, &mut effects);
        }
        let _ = effects.apply();
        Ok(())
    }

    // -- local cancellation -------------------------------------------------

    /// Cancels a download request or one of its files.
    ///
    /// Returns the messages telling the host to stop, or `None` if
    /// `handle` is not a running download handle.
    pub(crate) fn cancel_incoming(&self, handle: TransferHandle) -> Option<Vec<Outbound>> {
        let mut effects = Effects::default();
        let found = {
            let mut guard = self.state();
            let state = &mut *guard;
            if state.incoming.contains_key(&handle) {
                self.end_request(state, handle, ErrorKind::Cancelled, &mut effects)
                    .map(|(peer, params)| {
                        info!(coordinator = %self.id, %handle, "download cancelled");
                        let cancel = Message::Cancel(CancelRequest { request: handle });
                        effects.send(peer, params, Packet::new(cancel));
                    })
            } else {
                self.cancel_file_handle(state, handle, &mut effects)
            }
        };
        let outbound = effects.apply();
        found.map(|()| outbound)
    }

    fn cancel_file_handle(
        &self,
        state: &mut State,
        handle: TransferHandle,
        effects: &mut Effects,
    ) -> Option<()> {
        let (request, file_id) = state.incoming.values().find_map(|r| {
            r.files
                .iter()
                .find(|(_, file)| file.session.handle() == handle)
                .map(|(file_id, _)| (r.handle, *file_id))
        })?;

        let req = state.incoming.get_mut(&request)?;
        let mut file = req.files.remove(&file_id)?;
        file.session.cancel(ErrorKind::Cancelled);
        state.handles.release(handle);
        effects.discard(file.staging);
        debug!(
            coordinator = %self.id,
            %request,
            %handle,
            path = %file.session.record().relative_path,
            "file download cancelled"
        );
        if let Some(outcome) = file.session.outcome() {
            req.settle(file_id, outcome, effects);
        }
        effects.send(req.peer, req.params, cancel_file_packet(request, file_id));
        self.close_if_done(state, request, effects);
        Some(())
    }

    /// Cancels every download served by `peer`, returning how many there were.
    pub(crate) fn drop_incoming_from(
        &self,
        state: &mut State,
        peer: SocketAddr,
        effects: &mut Effects,
    ) -> usize {
        let requests: Vec<TransferHandle> = state
            .incoming
            .values()
            .filter(|r| r.accepts(peer))
            .map(|r| r.handle)
            .collect();
        for request in &requests {
            self.end_request(state, *request, ErrorKind::PeerDisconnected, effects);
        }
        requests.len()
    }

    /// Ends a request, cancelling its running files with `reason`.
    ///
    /// The summary is reported once the files already claimed by their
    /// last chunk have settled. Returns `None` if the request is unknown or
    /// already ended.
    fn end_request(
        &self,
        state: &mut State,
        request: TransferHandle,
        reason: ErrorKind,
        effects: &mut Effects,
    ) -> Option<(SocketAddr, SendParams)> {
        let req = state
            .incoming
            .get_mut(&request)
            .filter(|r| r.ended.is_none())?;
        req.cancel_all(reason, &mut state.handles, effects);
        req.ended = Some(reason);
        debug!(
            coordinator = %self.id,
            %request,
            %reason,
            cancelled = req.summary.cancelled,
            claimed = req.claimed.len(),
            "download ended early"
        );
        let target = (req.peer, req.params);
        self.close_if_done(state, request, effects);
        Some(target)
    }

    // -- shared -------------------------------------------------------------

    /// Ends a running file and removes it from its request.
    ///
    /// Cancellation kinds cancel the session, anything else fails it.
    fn fail_file(
        &self,
        state: &mut State,
        request: TransferHandle,
        file_id: u32,
        info: FailureInfo,
        cancel_host: bool,
        effects: &mut Effects,
    ) {
        let Some(req) = state.incoming.get_mut(&request) else {
            return;
        };
        let Some(mut file) = req.files.remove(&file_id) else {
            return;
        };
        match info.kind {
            ErrorKind::Cancelled | ErrorKind::PeerDisconnected => {
                debug!(
                    coordinator = %self.id,
                    %request,
                    path = %file.session.record().relative_path,
                    kind = %info.kind,
                    "file download stopped by host"
                );
                file.session.cancel(info.kind);
            }
            _ => {
                warn!(
                    coordinator = %self.id,
                    %request,
                    path = %file.session.record().relative_path,
                    kind = %info.kind,
                    "file download failed: {}",
                    info.message
                );
                file.session.fail(info);
            }
        }
        state.handles.release(file.session.handle());
        effects.discard(file.staging);
        if let Some(outcome) = file.session.outcome() {
            req.settle(file_id, outcome, effects);
        }
        if cancel_host {
            effects.send(req.peer, req.params, cancel_file_packet(request, file_id));
        }
        self.close_if_done(state, request, effects);
    }

    /// Reports the outcome of a file whose last chunk claimed it.
    fn settle_claimed(
        &self,
        request: TransferHandle,
        file_id: u32,
        mut file: IncomingFile,
        landing: Landing,
        last_chunk: Option<ChunkSpec>,
        effects: &mut Effects,
    ) {
        let step = match landing {
            Landing::Committed => match last_chunk {
                Some(spec) => file
                    .session
                    .record_chunk(spec.sequence, spec.offset, spec.len)
                    .map(Some),
                None => file.session.begin().map(|()| None),
            },
            Landing::Dropped(reason) => {
                file.session.cancel(reason);
                Ok(None)
            }
            Landing::Failed(e) => Err(e),
        };
        match step {
            Ok(Some(progress)) => {
                effects.notify(Arc::clone(&file.callback), TransferEvent::Progress(progress));
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    coordinator = %self.id,
                    %request,
                    path = %file.session.record().relative_path,
                    "file download failed: {e}"
                );
                file.session.fail(FailureInfo::from(&e));
            }
        }

        let outcome = file.session.outcome().unwrap_or_else(|| {
            let record = file.session.record();
            FileOutcome::failed(
                request,
                file.session.handle(),
                record.relative_path.as_str(),
                record.size,
                FailureInfo::new(ErrorKind::Protocol, "file ended before its declared size"),
            )
        });
        if outcome.is_success() {
            debug!(
                coordinator = %self.id,
                %request,
                path = %outcome.path,
                bytes = outcome.bytes_transferred,
                "file received"
            );
        }

        let mut guard = self.state();
        let state = &mut *guard;
        state.handles.release(file.session.handle());
        match state.incoming.get_mut(&request) {
            Some(req) => {
                req.settle(file_id, outcome, effects);
                self.close_if_done(state, request, effects);
            }
            None => debug!(
                coordinator = %self.id,
                %request,
                path = %outcome.path,
                "outcome of a finished download dropped"
            ),
        }
    }

    /// Finishes `request` once every announced file is terminal.
    fn close_if_done(&self, state: &mut State, request: TransferHandle, effects: &mut Effects) {
        let done = state
            .incoming
            .get(&request)
            .is_some_and(IncomingRequest::is_done);
        if !done {
            return;
        }
        let Some(req) = state.incoming.remove(&request) else {
            return;
        };
        state.handles.release(request);

        let summary = finished_summary(req.summary);
        info!(
            coordinator = %self.id,
            %request,
            subdir = %req.subdir,
            completed = summary.completed,
            failed = summary.failed,
            cancelled = summary.cancelled,
            rejected = summary.rejected.is_some(),
            ended = ?req.ended,
            "download finished"
        );
        effects.notify(req.callback, TransferEvent::DownloadComplete(summary));
    }
}

/// Validates an announced file and creates its receiving session.
fn open_session(
    req: &IncomingRequest,
    handles: &mut HandleAllocator,
    msg: &FileStart,
) -> Result<(TransferSession, PathBuf), TransferError> {
    validate_relative_path(&msg.record.relative_path)?;
    let handle = handles.allocate()?;
    let session = TransferSession::new(
        msg.request,
        handle,
        msg.file_id,
        msg.record.clone(),
        req.peer,
        req.params,
    )
    .and_then(|mut session| {
        session.adopt_plan(ChunkPlan {
            chunk_size: msg.chunk_size,
            chunk_count: msg.chunk_count,
        })?;
        Ok(session)
    });
    match session {
        Ok(session) => Ok((session, req.output_dir.join(&msg.record.relative_path))),
        Err(e) => {
            handles.release(handle);
            Err(e)
        }
    }
}
