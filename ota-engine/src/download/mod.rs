//! Payload download.
//!
//! [`DownloadAction`] streams the payload named by the install plan into a
//! [`PayloadSink`], hashing as it goes, and mirrors the bytes into the P2P
//! shared file when sharing is on.
//!
//! # Data flow
//!
//! ```text
//!   HttpFetcher ──chunk──┬──► SharedFileWriter   (positional, flock'd)
//!                        ├──► PayloadSink writer (sequential)
//!                        ├──► SHA-256
//!                        └──► prefs: next-data-offset
//! ```
//!
//! # Resume
//!
//! When the plan is a resume, the transfer starts at the persisted
//! next-data-offset. The hash is primed by re-reading that prefix from the
//! sink; if the prefix cannot be read the download starts over at 0.

pub mod checksum;
pub mod fetcher;
pub(crate) mod p2p_share;
pub mod writer;

pub use checksum::{calculate_file_checksum, hash_file_prefix, hex_digest_matches};
pub use fetcher::{
    FetchError, HttpFetcher, HttpFetcherFactory, ReqwestFetcher, ReqwestFetcherFactory,
    DEFAULT_CHUNK_TIMEOUT, DEFAULT_CONNECT_TIMEOUT, PEER_CHUNK_TIMEOUT,
};
pub use writer::{
    DirectFileWriter, FilePayloadSink, FileWriter, PartitionPayloadSink, PayloadSink,
    ScopedWriterCloser, WriteMode, PAYLOAD_FILE_MODE,
};

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::action::{ActionContext, ActionEvent, ActionOutcome, PipeObject};
use crate::error::ErrorCode;
use crate::install_plan::{InstallPlan, PayloadType};
use crate::p2p;
use crate::system::prefs::{self, Prefs};
use p2p_share::{ShareStop, SharedFileWriter};

/// Forget everything about a partially downloaded payload.
pub fn reset_update_progress(prefs: &dyn Prefs) {
    let results = [
        prefs.set_string(prefs::UPDATE_CHECK_RESPONSE_HASH, ""),
        prefs.set_int64(prefs::UPDATE_STATE_NEXT_DATA_OFFSET, -1),
        prefs.set_int64(prefs::RESUMED_UPDATE_FAILURES, 0),
    ];
    for result in results {
        if let Err(e) = result {
            warn!(error = %e, "Failed to reset update progress");
        }
    }
}

/// Sink used when none was supplied: full payloads carrying partition
/// images go straight to the target partitions.
fn default_sink(plan: &InstallPlan, payload_path: &Path) -> Box<dyn PayloadSink> {
    if plan.payload_type == PayloadType::Full && !plan.partitions.is_empty() {
        Box::new(PartitionPayloadSink::new())
    } else {
        Box::new(FilePayloadSink::new(payload_path))
    }
}

pub struct DownloadAction {
    fetcher: Box<dyn HttpFetcher>,
    payload_path: PathBuf,
    sink: Option<Box<dyn PayloadSink>>,
    http_response_code: u16,
    bytes_received: u64,
}

impl DownloadAction {
    /// `payload_path` is the staging file used by the default file sink.
    pub fn new(fetcher: Box<dyn HttpFetcher>, payload_path: impl Into<PathBuf>) -> Self {
        Self {
            fetcher,
            payload_path: payload_path.into(),
            sink: None,
            http_response_code: 0,
            bytes_received: 0,
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn PayloadSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Status of the last HTTP response, 0 if none arrived.
    pub fn http_response_code(&self) -> u16 {
        self.http_response_code
    }

    /// Payload bytes in the sink, counting the resumed prefix.
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub(crate) async fn perform(
        &mut self,
        input: Option<PipeObject>,
        ctx: &ActionContext<'_>,
    ) -> ActionOutcome {
        let Some(plan) = input.and_then(PipeObject::into_install_plan) else {
            error!("Download has no install plan");
            return ActionOutcome::failed(ErrorCode::Error);
        };

        let mut sink = match self.sink.take() {
            Some(sink) => sink,
            None => default_sink(&plan, &self.payload_path),
        };

        ctx.emit(ActionEvent::DownloadActive(true));
        let code = self.download(&plan, sink.as_mut(), ctx).await;
        ctx.emit(ActionEvent::DownloadActive(false));
        self.sink = Some(sink);

        if code.is_success() {
            ActionOutcome::success(PipeObject::InstallPlan(plan))
        } else {
            ActionOutcome::failed(code)
        }
    }

    fn resume_offset(plan: &InstallPlan, prefs: &dyn Prefs) -> u64 {
        if !plan.is_resume {
            return 0;
        }
        let offset = prefs
            .get_int64(prefs::UPDATE_STATE_NEXT_DATA_OFFSET)
            .filter(|offset| *offset > 0)
            .unwrap_or(0) as u64;
        if plan.payload_size > 0 {
            offset.min(plan.payload_size)
        } else {
            offset
        }
    }

    async fn download(
        &mut self,
        plan: &InstallPlan,
        sink: &mut dyn PayloadSink,
        ctx: &ActionContext<'_>,
    ) -> ErrorCode {
        let system = ctx.system();
        let prefs = system.prefs.as_ref();

        let mut offset = Self::resume_offset(plan, prefs);
        let mut hasher = Sha256::new();
        if offset > 0 {
            // Counted up front so a crash mid-resume still counts.
            let failures = prefs.get_int64(prefs::RESUMED_UPDATE_FAILURES).unwrap_or(0);
            if let Err(e) = prefs.set_int64(prefs::RESUMED_UPDATE_FAILURES, failures + 1) {
                warn!(error = %e, "Failed to record resume attempt");
            }
            if let Err(e) = sink.hash_prefix(plan, offset, &mut hasher) {
                warn!(offset, error = %e, "Cannot re-read downloaded prefix, starting over");
                offset = 0;
                hasher = Sha256::new();
            }
        }
        self.bytes_received = offset;

        let writer = match sink.open(plan, offset) {
            Ok(writer) => writer,
            Err(e) => {
                error!(offset, error = %e, "Unable to open payload destination");
                return ErrorCode::InstallDeviceOpenError;
            }
        };
        let mut writer = ScopedWriterCloser::new(writer);

        let file_id = p2p::file_id(&plan.payload_hash, plan.payload_size);
        let mut share = match &system.p2p_manager {
            Some(manager) if system.payload_state.using_p2p_for_sharing() => Some(
                SharedFileWriter::new(manager.clone(), file_id, plan.payload_size),
            ),
            Some(manager) => {
                if manager.file_get_path(&file_id).is_some() {
                    info!(file_id = %file_id, "Not sharing, removing stale shared file");
                    manager.file_remove(&file_id);
                }
                None
            }
            None => None,
        };

        let p2p_url = system.payload_state.p2p_url();
        if !p2p_url.is_empty() && p2p_url == plan.download_url {
            debug!(url = %p2p_url, "Downloading from a peer");
            self.fetcher.configure_for_peer();
        }

        info!(
            url = %plan.download_url,
            offset,
            size = plan.payload_size,
            sharing = share.is_some(),
            "Starting payload download"
        );
        self.fetcher.set_offset(offset);
        let begun = tokio::select! {
            biased;
            _ = ctx.cancelled() => None,
            result = self.fetcher.begin_transfer(&plan.download_url) => Some(result),
        };
        match begun {
            None => return self.cancel(share),
            Some(Err(e)) => {
                self.http_response_code = self.fetcher.http_response_code();
                error!(url = %plan.download_url, error = %e, "Transfer failed to start");
                close_share(share, false);
                return ErrorCode::DownloadTransferError;
            }
            Some(Ok(())) => self.http_response_code = self.fetcher.http_response_code(),
        }

        let mut received = offset;
        loop {
            let next = tokio::select! {
                biased;
                _ = ctx.cancelled() => None,
                chunk = self.fetcher.next_chunk() => Some(chunk),
            };
            let chunk = match next {
                None => return self.cancel(share),
                Some(Ok(Some(chunk))) => chunk,
                Some(Ok(None)) => break,
                Some(Err(e)) => {
                    self.http_response_code = self.fetcher.http_response_code();
                    error!(received, error = %e, "Transfer failed");
                    close_share(share, false);
                    return ErrorCode::DownloadTransferError;
                }
            };

            if let Some(shared) = share.as_mut() {
                match shared.write(received, &chunk) {
                    Ok(()) => {}
                    Err(ShareStop::Locked) => {
                        info!("Shared file belongs to another writer, not sharing");
                        share = None;
                    }
                    Err(stop) => {
                        debug!(?stop, "Stopped sharing");
                        close_share(share.take(), true);
                    }
                }
            }

            if let Err(e) = writer.write(&chunk) {
                error!(offset = received, error = %e, "Failed to write payload");
                self.fetcher.terminate_transfer();
                close_share(share, true);
                return ErrorCode::DownloadWriteError;
            }
            hasher.update(&chunk);
            received += chunk.len() as u64;
            self.bytes_received = received;

            if let Err(e) = prefs.set_int64(prefs::UPDATE_STATE_NEXT_DATA_OFFSET, received as i64) {
                warn!(error = %e, "Failed to persist download offset");
            }
            if let Some(shared) = share.as_mut() {
                if received >= plan.metadata_size {
                    shared.make_visible();
                }
            }
            ctx.emit(ActionEvent::BytesReceived {
                bytes_progressed: chunk.len() as u64,
                bytes_received: received,
                total: plan.payload_size,
            });
        }

        if let Err(e) = writer.close() {
            error!(error = %e, "Failed to finish writing payload");
            close_share(share, true);
            return ErrorCode::DownloadWriteError;
        }

        let digest = format!("{:x}", hasher.finalize());
        let code = verify_payload(plan, received, &digest);
        if code.is_success() {
            info!(bytes = received, "Payload downloaded and verified");
            close_share(share, false);
        } else {
            close_share(share, true);
            reset_update_progress(prefs);
        }
        code
    }

    fn cancel(&mut self, share: Option<SharedFileWriter>) -> ErrorCode {
        info!(received = self.bytes_received, "Download cancelled");
        self.fetcher.terminate_transfer();
        close_share(share, false);
        ErrorCode::UserCanceled
    }
}

fn close_share(share: Option<SharedFileWriter>, delete: bool) {
    if let Some(shared) = share {
        debug!(file_id = %shared.file_id(), visible = shared.is_visible(), delete, "Closing shared file");
        shared.close(delete);
    }
}

fn verify_payload(plan: &InstallPlan, received: u64, digest: &str) -> ErrorCode {
    if plan.payload_size > 0 && received != plan.payload_size {
        error!(expected = plan.payload_size, received, "Payload size mismatch");
        return ErrorCode::PayloadSizeMismatchError;
    }
    if plan.payload_hash.is_empty() {
        if plan.hash_checks_mandatory {
            error!("Payload hash is missing but hash checks are mandatory");
            return ErrorCode::DownloadPayloadVerificationError;
        }
        warn!("No payload hash supplied, skipping hash check");
        return ErrorCode::Success;
    }
    if !hex_digest_matches(digest, &plan.payload_hash) {
        error!(expected = %plan.payload_hash, actual = %digest, "Payload hash mismatch");
        return ErrorCode::PayloadHashMismatchError;
    }
    ErrorCode::Success
}
