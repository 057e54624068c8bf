//! The transfer coordinator.
//!
//! One coordinator plays both roles: as a host it offers its upload set to
//! requesters, as a requester it downloads subdirectories from hosts. All
//! mutable state lives behind a single lock that is never held across an
//! `.await` or while callbacks run.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dirdelta_protocol::messages::DownloadRequest;
use dirdelta_protocol::{FileManifest, Message, Packet, SendParams, TransferHandle};
use dirdelta_transfer::{
    DownloadSummary, FileSystemReader, HashEngine, HashReport, IncrementalRead, TransferCallback,
    TransferError, TransferEvent, normalize_subdir, resolve_under_root, scan_directory,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::CoordinatorConfig;
use crate::handles::HandleAllocator;
use crate::receiver::{IncomingRequest, SharedStaging, discard_all};
use crate::sender::{OutgoingRequest, cancel_outgoing_to};
use crate::transport::{NetworkEvent, Transport};

/// A packet to send once the lock is released.
pub(crate) type Outbound = (SocketAddr, SendParams, Packet);

/// Work collected under the lock and carried out after releasing it.
#[derive(Default)]
pub(crate) struct Effects {
    notices: Vec<(Arc<dyn TransferCallback>, TransferEvent)>,
    outbound: Vec<Outbound>,
    /// Staging files of sessions that will never complete.
    discards: Vec<SharedStaging>,
}

impl Effects {
    pub(crate) fn notify(&mut self, callback: Arc<dyn TransferCallback>, event: TransferEvent) {
        self.notices.push((callback, event));
    }

    pub(crate) fn send(&mut self, peer: SocketAddr, params: SendParams, packet: Packet) {
        self.outbound.push((peer, params, packet));
    }

    pub(crate) fn discard(&mut self, staging: SharedStaging) {
        self.discards.push(staging);
    }

    /// Removes discarded staging files and fires the callbacks in order.
    /// Returns the packets still to be sent.
    pub(crate) fn apply(self) -> Vec<Outbound> {
        discard_all(self.discards);
        for (callback, event) in self.notices {
            match &event {
                TransferEvent::Progress(progress) => callback.on_progress(progress),
                TransferEvent::FileComplete(outcome) => callback.on_file_complete(outcome),
                TransferEvent::DownloadComplete(summary) => {
                    callback.on_download_complete(summary)
                }
            }
        }
        self.outbound
    }
}

// ---------------------------------------------------------------------------
// DownloadOptions
// ---------------------------------------------------------------------------

/// Parameters of [`TransferCoordinator::request_download`].
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Host to download from.
    pub peer: SocketAddr,
    /// Subdirectory of the host's upload set.
    pub subdir: String,
    /// Where received files are written.
    pub output_subdir: String,
    /// Resolve `output_subdir` below the application root instead of using
    /// it as given.
    pub prepend_app_dir: bool,
    /// Files already present in the output directory; `None` downloads
    /// everything.
    pub local_manifest: Option<FileManifest>,
    /// Priority and channel of the request and cancel messages.
    pub params: SendParams,
}

impl DownloadOptions {
    pub fn new(
        peer: SocketAddr,
        subdir: impl Into<String>,
        output_subdir: impl Into<String>,
    ) -> Self {
        Self {
            peer,
            subdir: subdir.into(),
            output_subdir: output_subdir.into(),
            prepend_app_dir: false,
            local_manifest: None,
            params: SendParams::default(),
        }
    }

    pub fn with_manifest(mut self, manifest: FileManifest) -> Self {
        self.local_manifest = Some(manifest);
        self
    }

    pub fn prepend_app_dir(mut self, prepend: bool) -> Self {
        self.prepend_app_dir = prepend;
        self
    }

    pub fn with_params(mut self, params: SendParams) -> Self {
        self.params = params;
        self
    }
}

// ---------------------------------------------------------------------------
// TransferCoordinator
// ---------------------------------------------------------------------------

/// Installed incremental reader and its chunk size.
#[derive(Clone)]
pub(crate) struct ReadSource {
    pub(crate) reader: Arc<dyn IncrementalRead>,
    pub(crate) chunk_size: u32,
}

pub(crate) struct State {
    pub(crate) uploads: FileManifest,
    pub(crate) handles: HandleAllocator,
    pub(crate) upload_params: SendParams,
    pub(crate) read_source: Option<ReadSource>,
    pub(crate) upload_callback: Option<Arc<dyn TransferCallback>>,
    pub(crate) incoming: HashMap<TransferHandle, IncomingRequest>,
    pub(crate) outgoing: HashMap<TransferHandle, OutgoingRequest>,
}

/// Owns the upload set, the handle space and every transfer session.
pub struct TransferCoordinator {
    pub(crate) id: Uuid,
    pub(crate) config: CoordinatorConfig,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) hasher: Arc<HashEngine>,
    pub(crate) state: Mutex<State>,
}

impl TransferCoordinator {
    /// Creates a coordinator sending through `transport`.
    ///
    /// A non-zero `chunk_size` in the configuration installs the
    /// filesystem reader for chunked sends.
    pub fn new<T: Transport>(
        config: CoordinatorConfig,
        transport: T,
    ) -> Result<Arc<Self>, TransferError> {
        config.validate()?;
        let upload_params = config.upload_params()?;
        let read_source = config.chunk_size().map(|chunk_size| ReadSource {
            reader: Arc::new(FileSystemReader),
            chunk_size,
        });
        let hasher = if config.hash_cache {
            HashEngine::with_cache()
        } else {
            HashEngine::new()
        };

        let id = Uuid::new_v4();
        info!(
            coordinator = %id,
            addr = %transport.local_addr(),
            root = %config.app_root.display(),
            "transfer coordinator created"
        );

        Ok(Arc::new(Self {
            id,
            config,
            transport: Arc::new(transport),
            hasher: Arc::new(hasher),
            state: Mutex::new(State {
                uploads: FileManifest::new(),
                handles: HandleAllocator::new(),
                upload_params,
                read_source,
                upload_callback: None,
                incoming: HashMap::new(),
                outgoing: HashMap::new(),
            }),
        }))
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // -- upload set ---------------------------------------------------------

    /// Adds every file below `app_root/subdir` to the upload set.
    ///
    /// Paths are stored relative to the application root; registering the
    /// same directory twice replaces the earlier records. Returns the number
    /// of files found.
    pub async fn register_upload_directory(&self, subdir: &str) -> Result<usize, TransferError> {
        let normalized = normalize_subdir(subdir)?;
        let dir = resolve_under_root(&self.config.app_root, &normalized)?;
        let manifest = run_blocking(move || scan_directory(&dir)).await??;
        let count = manifest.len();

        let total = {
            let mut state = self.state();
            state.uploads.extend(manifest.prefixed(&normalized));
            state.uploads.len()
        };
        info!(
            coordinator = %self.id,
            subdir = %normalized,
            files = count,
            total,
            "upload directory registered"
        );
        Ok(count)
    }

    /// Empties the upload set. Running uploads keep their snapshot.
    pub fn clear_uploads(&self) {
        let removed = std::mem::take(&mut self.state().uploads).len();
        debug!(coordinator = %self.id, removed, "upload set cleared");
    }

    pub fn upload_count(&self) -> usize {
        self.state().uploads.len()
    }

    /// Snapshot of the upload set.
    pub fn uploads(&self) -> FileManifest {
        self.state().uploads.clone()
    }

    /// Send parameters used for file headers, chunks and completion messages.
    pub fn set_upload_send_params(&self, params: SendParams) {
        self.state().upload_params = params;
    }

    /// Sends files in chunks of `chunk_size` bytes read through `reader`.
    pub fn set_incremental_read(
        &self,
        reader: Arc<dyn IncrementalRead>,
        chunk_size: u32,
    ) -> Result<(), TransferError> {
        if chunk_size == 0 {
            return Err(TransferError::InvalidRequest(
                "chunk size must be positive".into(),
            ));
        }
        self.state().read_source = Some(ReadSource { reader, chunk_size });
        Ok(())
    }

    /// Reverts to sending each file as one chunk.
    pub fn clear_incremental_read(&self) {
        self.state().read_source = None;
    }

    /// Observer of host-side sessions.
    pub fn set_upload_callback(&self, callback: Option<Arc<dyn TransferCallback>>) {
        self.state().upload_callback = callback;
    }

    // -- downloads ----------------------------------------------------------

    /// Asks `options.peer` for the files under `options.subdir` that differ
    /// from the local manifest.
    ///
    /// Paths escaping a root are rejected here, before anything is sent.
    /// Unhashed records of the local manifest are hashed against the output
    /// directory first; records that cannot be hashed count as missing.
    /// Results arrive through `callback`; the returned handle identifies the
    /// request for [`cancel`](Self::cancel).
    pub async fn request_download(
        &self,
        options: DownloadOptions,
        callback: Arc<dyn TransferCallback>,
    ) -> Result<TransferHandle, TransferError> {
        let subdir = normalize_subdir(&options.subdir)?;
        let output_dir = self.output_dir(&options.output_subdir, options.prepend_app_dir)?;

        let local = options.local_manifest.unwrap_or_default();
        let local = if local.is_fully_hashed() {
            local
        } else {
            let hasher = Arc::clone(&self.hasher);
            let dir = output_dir.clone();
            run_blocking(move || hasher.compute_hashes(&local, &dir))
                .await?
                .manifest
        };

        let handle = {
            let mut state = self.state();
            let handle = state.handles.allocate()?;
            state.incoming.insert(
                handle,
                IncomingRequest::new(
                    handle,
                    options.peer,
                    options.params,
                    subdir.clone(),
                    output_dir.clone(),
                    callback,
                ),
            );
            handle
        };

        let files = local.len();
        let packet = Packet::new(Message::DownloadRequest(DownloadRequest {
            request: handle,
            subdir: subdir.clone(),
            manifest: local,
        }));
        if let Err(e) = self.send_packet(options.peer, options.params, packet).await {
            let mut state = self.state();
            state.incoming.remove(&handle);
            state.handles.release(handle);
            return Err(e);
        }

        info!(
            coordinator = %self.id,
            %handle,
            peer = %options.peer,
            %subdir,
            output = %output_dir.display(),
            local_files = files,
            "download requested"
        );
        Ok(handle)
    }

    /// Hashes `manifest` against the output directory on a worker thread.
    pub async fn generate_hashes(
        &self,
        manifest: FileManifest,
        output_subdir: &str,
        prepend_app_dir: bool,
    ) -> Result<HashReport, TransferError> {
        let dir = self.output_dir(output_subdir, prepend_app_dir)?;
        let hasher = Arc::clone(&self.hasher);
        run_blocking(move || hasher.compute_hashes(&manifest, &dir)).await
    }

    fn output_dir(
        &self,
        output_subdir: &str,
        prepend_app_dir: bool,
    ) -> Result<PathBuf, TransferError> {
        if prepend_app_dir {
            resolve_under_root(&self.config.app_root, output_subdir)
        } else {
            Ok(PathBuf::from(output_subdir))
        }
    }

    // -- cancellation -------------------------------------------------------

    /// Cancels a download request, a single file of one, or an upload.
    ///
    /// Returns `false` if `handle` is unknown (for instance because the
    /// transfer already finished).
    pub async fn cancel(&self, handle: TransferHandle) -> bool {
        if let Some(outbound) = self.cancel_incoming(handle) {
            self.flush(outbound).await;
            return true;
        }
        self.cancel_outgoing(handle)
    }

    /// Cancels everything exchanged with `peer`.
    ///
    /// Nothing is sent: the peer is gone.
    pub fn peer_disconnected(&self, peer: SocketAddr) {
        let mut effects = Effects::default();
        let (downloads, uploads) = {
            let mut state = self.state();
            let downloads = self.drop_incoming_from(&mut state, peer, &mut effects);
            let uploads = cancel_outgoing_to(&state, peer);
            (downloads, uploads)
        };
        let _ = effects.apply();

        if downloads > 0 || uploads > 0 {
            warn!(
                coordinator = %self.id,
                %peer,
                downloads,
                uploads,
                "peer disconnected, transfers cancelled"
            );
        }
    }

    /// Stops every upload in progress.
    pub fn shutdown(&self) {
        let state = self.state();
        for outgoing in state.outgoing.values() {
            outgoing.token.cancel();
        }
        info!(
            coordinator = %self.id,
            uploads = state.outgoing.len(),
            downloads = state.incoming.len(),
            handles = state.handles.in_use(),
            "coordinator shutting down"
        );
    }

    // -- inbound ------------------------------------------------------------

    /// Handles one packet received from `peer`.
    pub async fn handle_packet(
        self: &Arc<Self>,
        peer: SocketAddr,
        payload: &[u8],
    ) -> Result<(), TransferError> {
        let Packet { message, data } = Packet::decode(payload)?;
        match message {
            Message::DownloadRequest(msg) => self.on_download_request(peer, msg).await,
            Message::Cancel(msg) => {
                self.on_cancel_request(peer, msg);
                Ok(())
            }
            Message::CancelFile(msg) => {
                self.on_cancel_file(peer, msg);
                Ok(())
            }
            Message::FileStart(msg) => self.on_file_start(peer, msg).await,
            Message::FileChunk(msg) => self.on_file_chunk(peer, msg, data).await,
            Message::FileFailed(msg) => self.on_file_failed(peer, msg),
            Message::DownloadComplete(msg) => self.on_download_complete(peer, msg),
            Message::DownloadRejected(msg) => self.on_download_rejected(peer, msg),
        }
    }

    /// Processes network events until `cancel` fires or the stream ends.
    ///
    /// Packets are handled one at a time, in arrival order.
    pub async fn serve(
        self: &Arc<Self>,
        mut events: mpsc::UnboundedReceiver<NetworkEvent>,
        cancel: CancellationToken,
    ) {
        debug!(coordinator = %self.id, "serving network events");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown();
                    break;
                }

                event = events.recv() => {
                    let Some(event) = event else {
                        debug!(coordinator = %self.id, "event stream closed");
                        break;
                    };
                    match event {
                        NetworkEvent::Packet { from, payload, .. } => {
                            if let Err(e) = self.handle_packet(from, &payload).await {
                                warn!(coordinator = %self.id, peer = %from, "packet rejected: {e}");
                            }
                        }
                        NetworkEvent::Connected(peer) => {
                            debug!(coordinator = %self.id, %peer, "peer connected");
                        }
                        NetworkEvent::Disconnected(peer) => self.peer_disconnected(peer),
                    }
                }
            }
        }
    }

    // -- observability ------------------------------------------------------

    /// Handles of download requests still in progress.
    pub fn active_downloads(&self) -> Vec<TransferHandle> {
        let mut handles: Vec<_> = self.state().incoming.keys().copied().collect();
        handles.sort();
        handles
    }

    /// Handles of uploads still in progress.
    pub fn active_uploads(&self) -> Vec<TransferHandle> {
        let mut handles: Vec<_> = self.state().outgoing.keys().copied().collect();
        handles.sort();
        handles
    }

    // -- plumbing -----------------------------------------------------------

    pub(crate) async fn send_packet(
        &self,
        peer: SocketAddr,
        params: SendParams,
        packet: Packet,
    ) -> Result<(), TransferError> {
        let name = packet.message.name();
        let bytes = packet.encode()?;
        self.transport.send(peer, params, bytes).await.inspect_err(|e| {
            debug!(coordinator = %self.id, %peer, message = name, "send failed: {e}");
        })
    }

    /// Sends queued packets, ignoring failures.
    pub(crate) async fn flush(&self, outbound: Vec<Outbound>) {
        for (peer, params, packet) in outbound {
            let _ = self.send_packet(peer, params, packet).await;
        }
    }
}

/// Runs blocking filesystem work off the async executor.
pub(crate) async fn run_blocking<T, F>(f: F) -> Result<T, TransferError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))
}

/// Summary reported for a request that ended early.
pub(crate) fn finished_summary(mut summary: DownloadSummary) -> DownloadSummary {
    summary.finished_at = chrono::Utc::now();
    summary
}
