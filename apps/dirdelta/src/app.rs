//! Mirror job: wires a host and a client coordinator together and runs
//! one download.

use std::sync::Arc;

use dirdelta_coordinator::{DownloadOptions, MemoryNetwork, NetworkEvent, TransferCoordinator};
use dirdelta_transfer::{
    DownloadSummary, FileOutcome, FileProgress, TransferCallback, TransferEvent, scan_directory,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Logs what the host sends.
struct UploadLog;

impl TransferCallback for UploadLog {
    fn on_progress(&self, progress: &FileProgress) {
        debug!(
            path = %progress.path,
            chunk = progress.chunk_index,
            chunks = progress.chunk_count,
            "chunk sent"
        );
    }

    fn on_file_complete(&self, outcome: &FileOutcome) {
        debug!(path = %outcome.path, status = ?outcome.status, "upload of file finished");
    }

    fn on_download_complete(&self, summary: &DownloadSummary) {
        info!(
            sent = summary.completed,
            failed = summary.failed,
            "upload finished"
        );
    }
}

fn spawn_serve(
    coordinator: &Arc<TransferCoordinator>,
    events: mpsc::UnboundedReceiver<NetworkEvent>,
    cancel: CancellationToken,
) {
    let coordinator = Arc::clone(coordinator);
    tokio::spawn(async move { coordinator.serve(events, cancel).await });
}

/// Mirrors the configured host directory into the client and returns the
/// download summary.
pub async fn run(config: Config) -> anyhow::Result<DownloadSummary> {
    mirror(config, CancellationToken::new()).await
}

/// Runs the mirror job. `cancel` stops both serve loops and fires on every
/// exit path, early returns included.
async fn mirror(config: Config, cancel: CancellationToken) -> anyhow::Result<DownloadSummary> {
    let _serving = cancel.clone().drop_guard();
    let network = MemoryNetwork::new();

    // -- Coordinators --
    let (host_transport, host_events) = network.endpoint(config.host_addr);
    let (client_transport, client_events) = network.endpoint(config.client_addr);
    let host = TransferCoordinator::new(config.host.clone(), host_transport)?;
    let client = TransferCoordinator::new(config.client.clone(), client_transport)?;
    spawn_serve(&host, host_events, cancel.clone());
    spawn_serve(&client, client_events, cancel.clone());
    network.connect(config.host_addr, config.client_addr);

    // -- Host --
    host.set_upload_callback(Some(Arc::new(UploadLog)));
    let files = host.register_upload_directory(&config.job.subdir).await?;
    info!(files, subdir = %config.job.subdir, "host ready");

    // -- Client --
    let output = config.output_dir();
    let local = if config.job.diff_existing && output.is_dir() {
        let dir = output.clone();
        Some(tokio::task::spawn_blocking(move || scan_directory(&dir)).await??)
    } else {
        None
    };
    if let Some(local) = &local {
        info!(files = local.len(), output = %output.display(), "existing files will be diffed");
    }

    let mut options = DownloadOptions::new(
        config.host_addr,
        config.job.subdir.clone(),
        config.job.output_subdir.clone(),
    )
    .prepend_app_dir(config.job.prepend_app_dir);
    if let Some(local) = local {
        options = options.with_manifest(local);
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = client.request_download(options, Arc::new(tx)).await?;

    let summary = loop {
        tokio::select! {
            event = rx.recv() => match event {
                Some(TransferEvent::Progress(progress)) => {
                    debug!(
                        path = %progress.path,
                        bytes = progress.bytes_transferred,
                        total = progress.total_bytes,
                        "receiving"
                    );
                }
                Some(TransferEvent::FileComplete(outcome)) if outcome.is_success() => {
                    info!(path = %outcome.path, bytes = outcome.bytes_transferred, "file mirrored");
                }
                Some(TransferEvent::FileComplete(outcome)) => {
                    let reason = outcome.error.as_ref().map(|e| e.message.as_str()).unwrap_or("");
                    warn!(
                        path = %outcome.path,
                        status = ?outcome.status,
                        "file not mirrored: {reason}"
                    );
                }
                Some(TransferEvent::DownloadComplete(summary)) => break summary,
                None => anyhow::bail!("download {handle} ended without a summary"),
            },

            _ = tokio::signal::ctrl_c() => {
                warn!(%handle, "interrupted, cancelling download");
                client.cancel(handle).await;
            }
        }
    };

    if let Some(rejected) = &summary.rejected {
        anyhow::bail!("host rejected the download: {}", rejected.message);
    }
    Ok(summary)
}
