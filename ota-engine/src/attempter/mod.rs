//! Update attempt orchestration.
//!
//! [`UpdateAttempter`] builds the action pipeline for an update or a
//! rollback, runs it, and acts as the processor's delegate: it turns action
//! outcomes into status transitions, the pending error event and the retry
//! bookkeeping kept in prefs and payload state.
//!
//! # Status machine
//!
//! ```text
//!   Idle ─► CheckingForUpdate ─┬─ no update ──────────────────────► Idle
//!                              └─► UpdateAvailable ─► Downloading
//!                                   ─► Verifying ─► Finalizing
//!                                   ─► UpdatedNeedReboot
//!
//!   any failure ─► ReportingErrorEvent ─► Idle
//!   Idle ─► AttemptingRollback ─► UpdatedNeedReboot
//!   Idle ─► Disabled (updates turned off by policy)
//! ```
//!
//! Failures are not reported right away. The error event is persisted when
//! the attempt fails and rides along with the next update check. A stopped
//! attempt leaves any earlier undelivered event in place.

mod scatter;
mod status;

pub use scatter::decrement_update_check_count;
pub use status::{StatusSnapshot, UpdateStatus};

use std::mem;
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::action::{
    Action, ActionEvent, ActionKind, ActionProcessor, ActionProcessorDelegate, InstallPlanAction,
    OmahaRequestAction, OmahaResponseHandlerAction, PipelineError, PostinstallRunnerAction,
};
use crate::download::{reset_update_progress, DownloadAction};
use crate::error::{ErrorCode, ErrorFlags};
use crate::install_plan::{InstallPlan, InstallPlanError, Partition, PayloadType};
use crate::logging::METRICS_TARGET;
use crate::omaha::{EventType, OmahaEvent, RequestParams};
use crate::system::boot_control::{slot_name, Slot};
use crate::system::prefs::{self, Prefs};
use crate::system::SystemState;
use crate::verifier::{FilesystemVerifierAction, VerifierMode};

/// Partitions switched back by a rollback.
pub const ROLLBACK_PARTITIONS: [&str; 2] = ["kernel", "root"];

/// Delta payloads are no longer requested after this many delta failures.
pub const MAX_DELTA_UPDATE_FAILURES: i64 = 3;

/// Minimum spacing of daily metrics reports.
pub const DAILY_METRICS_INTERVAL: TimeDelta = TimeDelta::hours(24);

/// Status broadcast buffer. Slow observers skip snapshots.
const STATUS_CHANNEL_CAPACITY: usize = 64;

/// Why an attempt could not be scheduled.
#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("attempter is busy ({0})")]
    NotIdle(UpdateStatus),

    #[error("rollback is not allowed on enterprise-enrolled devices")]
    EnterpriseEnrolled,

    #[error("no bootable slot to roll back to")]
    NoRollbackSlot,

    #[error("rollback slot {0} has unmapped partitions")]
    RollbackPartitionsUnavailable(String),

    #[error("invalid rollback plan: {0}")]
    InvalidPlan(#[from] InstallPlanError),

    #[error("failed to build the action pipeline: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Knobs for one update attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateRequest {
    /// User-initiated check: no scattering, no peer downloads.
    pub interactive: bool,
    /// Update server override.
    pub omaha_url: Option<String>,
    /// Target channel override.
    pub channel: Option<String>,
}

/// Map a generic action failure onto the action's own error family.
///
/// Specific codes pass through unchanged, as do failures of actions without
/// a family of their own.
pub fn error_code_for_action(kind: ActionKind, code: ErrorCode) -> ErrorCode {
    if code != ErrorCode::Error {
        return code;
    }
    match kind {
        ActionKind::OmahaRequest => ErrorCode::OmahaRequestError,
        ActionKind::OmahaResponseHandler => ErrorCode::OmahaResponseHandlerError,
        ActionKind::FilesystemVerifier => ErrorCode::FilesystemVerifierError,
        ActionKind::Download => ErrorCode::DownloadTransferError,
        ActionKind::PostinstallRunner => ErrorCode::PostinstallRunnerError,
        ActionKind::InstallPlan => code,
    }
}

/// Drives update and rollback attempts.
pub struct UpdateAttempter {
    system: Arc<SystemState>,
    base_params: RequestParams,
    params: RequestParams,
    status: UpdateStatus,
    status_tx: broadcast::Sender<StatusSnapshot>,
    processor: ActionProcessor,
    stop: CancellationToken,
    install_plan: Option<InstallPlan>,
    error_event: Option<OmahaEvent>,
    http_response_code: u16,
    server_poll_interval: Option<u32>,
    bytes_received: u64,
    total_bytes: u64,
    new_version: String,
    new_size: u64,
    last_checked_time: Option<DateTime<Utc>>,
}

impl UpdateAttempter {
    /// `params` carries the device's version, channel and update URL; each
    /// attempt starts from a copy.
    pub fn new(system: Arc<SystemState>, params: RequestParams) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            system,
            params: params.clone(),
            base_params: params,
            status: UpdateStatus::Idle,
            status_tx,
            processor: ActionProcessor::new(),
            stop: CancellationToken::new(),
            install_plan: None,
            error_event: None,
            http_response_code: 0,
            server_poll_interval: None,
            bytes_received: 0,
            total_bytes: 0,
            new_version: String::new(),
            new_size: 0,
            last_checked_time: None,
        }
    }

    // =========================================================================
    // Observation
    // =========================================================================

    pub fn status(&self) -> UpdateStatus {
        self.status
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let progress = if self.total_bytes > 0 {
            (self.bytes_received as f64 / self.total_bytes as f64).min(1.0)
        } else {
            0.0
        };
        StatusSnapshot {
            status: self.status,
            progress,
            bytes_received: self.bytes_received,
            total_bytes: self.total_bytes,
            new_version: self.new_version.clone(),
            new_size: self.new_size,
            last_checked_time: self.last_checked_time,
        }
    }

    /// Receive a snapshot on every status or progress change.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusSnapshot> {
        self.status_tx.subscribe()
    }

    /// Token that stops the running attempt when cancelled. A stopped
    /// attempter stops every later attempt too.
    pub fn stop_handle(&self) -> CancellationToken {
        self.stop.clone()
    }

    pub fn http_response_code(&self) -> u16 {
        self.http_response_code
    }

    /// Poll interval the server asked for, if any.
    pub fn server_poll_interval(&self) -> Option<u32> {
        self.server_poll_interval
    }

    /// Plan of the last handled response or rollback.
    pub fn install_plan(&self) -> Option<&InstallPlan> {
        self.install_plan.as_ref()
    }

    /// Error event waiting for the next update check.
    pub fn pending_error_event(&self) -> Option<OmahaEvent> {
        let json = self.system.prefs.get_string(prefs::PENDING_ERROR_EVENT)?;
        match serde_json::from_str(&json) {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(error = %e, "Discarding unreadable pending error event");
                if let Err(e) = self.system.prefs.delete(prefs::PENDING_ERROR_EVENT) {
                    warn!(error = %e, "Failed to discard pending error event");
                }
                None
            }
        }
    }

    /// Idle, or parked by policy. Either accepts a new attempt.
    fn is_resting(&self) -> bool {
        matches!(self.status, UpdateStatus::Idle | UpdateStatus::Disabled)
    }

    fn updates_disabled_by_policy(&self) -> bool {
        self.system
            .device_policy
            .as_ref()
            .is_some_and(|policy| policy.update_disabled)
    }

    fn set_status(&mut self, status: UpdateStatus) {
        if self.status != status {
            info!(from = %self.status, to = %status, "Update status changed");
        }
        self.status = status;
        self.broadcast();
    }

    fn broadcast(&self) {
        // No receivers is fine.
        let _ = self.status_tx.send(self.snapshot());
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Recover state left by a previous run.
    ///
    /// An update completed during this boot means a reboot is still pending.
    /// One completed during an earlier boot has been applied, so the markers
    /// are cleared. Shared P2P files left behind are cleaned up.
    pub fn update_engine_started(&mut self) {
        let prefs = self.system.prefs.as_ref();
        if let Some(completed_on) = prefs.get_string(prefs::UPDATE_COMPLETED_ON_BOOT_ID) {
            if self.system.hardware.boot_id().as_deref() == Some(completed_on.as_str()) {
                info!("Update already applied, waiting for reboot");
                self.set_status(UpdateStatus::UpdatedNeedReboot);
            } else {
                info!("Booted after a completed update");
                let _ = prefs.delete(prefs::UPDATE_COMPLETED_ON_BOOT_ID);
                let _ = prefs.delete(prefs::UPDATE_COMPLETED_BOOT_TIME);
            }
        }

        if let Some(p2p) = &self.system.p2p_manager {
            let shared = p2p.count_shared_files();
            if p2p.is_p2p_enabled() || shared > 0 {
                debug!(shared, "Running P2P housekeeping at startup");
                if !p2p.perform_housekeeping() {
                    warn!("P2P housekeeping failed");
                }
            }
        }

        self.check_and_report_daily_metrics();
    }

    // =========================================================================
    // Update
    // =========================================================================

    /// Run one update attempt to completion and return the resulting status.
    ///
    /// With updates disabled by device policy nothing is checked and the
    /// status becomes `Disabled`.
    pub async fn update(&mut self, request: UpdateRequest) -> Result<UpdateStatus, AttemptError> {
        if !self.is_resting() {
            warn!(status = %self.status, "Update requested while busy");
            return Err(AttemptError::NotIdle(self.status));
        }

        self.check_and_report_daily_metrics();
        if self.updates_disabled_by_policy() {
            info!("Updates disabled by device policy");
            self.set_status(UpdateStatus::Disabled);
            return Ok(self.status);
        }

        self.params = self.calculate_update_params(&request).await;
        self.processor = self.build_update_actions(&self.params)?;
        self.reset_attempt();
        self.last_checked_time = Some(self.system.clock.wallclock_now());
        self.set_status(UpdateStatus::CheckingForUpdate);

        self.run_processor().await;
        Ok(self.status)
    }

    async fn calculate_update_params(&self, request: &UpdateRequest) -> RequestParams {
        let mut params = self.base_params.clone();
        params.interactive = request.interactive;
        if let Some(url) = &request.omaha_url {
            params.update_url = url.clone();
        }
        if let Some(channel) = &request.channel {
            if !params.set_target_channel(channel) {
                warn!(channel = %channel, "Ignoring unknown target channel");
            }
        }

        let delta_failures = self
            .system
            .prefs
            .get_int64(prefs::DELTA_UPDATE_FAILURES)
            .unwrap_or(0);
        params.delta_okay = delta_failures < MAX_DELTA_UPDATE_FAILURES;
        if !params.delta_okay {
            info!(delta_failures, "Delta updates disabled after repeated failures");
        }

        if scatter::apply_scattering(&self.system, &mut params) {
            scatter::decrement_update_check_count(self.system.prefs.as_ref());
        }
        self.calculate_p2p_params(&mut params).await;

        info!(
            url = %params.update_url,
            channel = %params.target_channel,
            interactive = params.interactive,
            delta_okay = params.delta_okay,
            p2p_download = params.use_p2p_for_downloading,
            p2p_share = params.use_p2p_for_sharing,
            "Update parameters ready"
        );
        params
    }

    /// Peer sharing is on whenever P2P is enabled and its server runs.
    /// Downloading from peers additionally requires a background check.
    async fn calculate_p2p_params(&self, params: &mut RequestParams) {
        let mut sharing = false;
        let mut downloading = false;

        if let Some(p2p) = &self.system.p2p_manager {
            if p2p.is_p2p_enabled() {
                if !p2p.ensure_p2p_running().await {
                    warn!("P2P server failed to start, disabling P2P");
                } else if !p2p.perform_housekeeping() {
                    warn!("P2P housekeeping failed, disabling P2P");
                } else {
                    sharing = true;
                    downloading = !params.interactive;
                }
            }
        }

        let payload_state = &self.system.payload_state;
        payload_state.set_using_p2p_for_sharing(sharing);
        payload_state.set_using_p2p_for_downloading(downloading);
        payload_state.set_p2p_url("");
        params.use_p2p_for_sharing = sharing;
        params.use_p2p_for_downloading = downloading;
    }

    /// Queue the full update pipeline for `params`.
    pub fn build_update_actions(
        &self,
        params: &RequestParams,
    ) -> Result<ActionProcessor, PipelineError> {
        let system = &self.system;
        let mut processor = ActionProcessor::with_stop_handle(self.stop.clone());

        let check = processor.enqueue_action(OmahaRequestAction::check(
            params.clone(),
            self.pending_error_event(),
        ));
        let handler = processor.enqueue_action(OmahaResponseHandlerAction::new(
            params.clone(),
            system.deadline_file.clone(),
        ));
        let verify_source =
            processor.enqueue_action(FilesystemVerifierAction::new(VerifierMode::ComputeSourceHash));
        processor.enqueue_action(OmahaRequestAction::event(
            params.clone(),
            OmahaEvent::success(EventType::UpdateDownloadStarted),
        ));
        let download = processor.enqueue_action(DownloadAction::new(
            system.fetcher_factory.create(),
            system.payload_path.clone(),
        ));
        processor.enqueue_action(OmahaRequestAction::event(
            params.clone(),
            OmahaEvent::success(EventType::UpdateDownloadFinished),
        ));
        let verify_target =
            processor.enqueue_action(FilesystemVerifierAction::new(VerifierMode::VerifyTargetHash));
        let postinstall = processor.enqueue_action(PostinstallRunnerAction::new());
        processor.enqueue_action(OmahaRequestAction::event(
            params.clone(),
            OmahaEvent::update_complete(),
        ));

        processor.bond_actions(check, handler)?;
        processor.bond_actions(handler, verify_source)?;
        processor.bond_actions(verify_source, download)?;
        processor.bond_actions(download, verify_target)?;
        processor.bond_actions(verify_target, postinstall)?;
        Ok(processor)
    }

    // =========================================================================
    // Rollback
    // =========================================================================

    /// First bootable slot other than the running one.
    pub fn rollback_slot(&self) -> Option<Slot> {
        let boot_control = &self.system.boot_control;
        let num_slots = boot_control.num_slots();
        if num_slots < 2 {
            return None;
        }
        let current = boot_control.current_slot();
        (0..num_slots).find(|slot| *slot != current && boot_control.is_slot_bootable(*slot))
    }

    fn is_enterprise_enrolled(&self) -> bool {
        self.system
            .device_policy
            .as_ref()
            .is_some_and(|policy| policy.is_enterprise_enrolled())
    }

    /// Whether [`UpdateAttempter::rollback`] would be accepted now.
    pub fn can_rollback(&self) -> bool {
        self.is_resting()
            && !self.is_enterprise_enrolled()
            && self.rollback_slot().is_some()
    }

    /// Switch back to the previous slot. Rejected before anything runs when
    /// the attempter is busy, the device is enterprise enrolled or no other
    /// slot is bootable.
    pub async fn rollback(&mut self, powerwash: bool) -> Result<UpdateStatus, AttemptError> {
        if !self.is_resting() {
            return Err(AttemptError::NotIdle(self.status));
        }
        if self.is_enterprise_enrolled() {
            warn!("Rollback refused on an enterprise-enrolled device");
            return Err(AttemptError::EnterpriseEnrolled);
        }
        let Some(target) = self.rollback_slot() else {
            warn!("Rollback refused: no bootable alternate slot");
            return Err(AttemptError::NoRollbackSlot);
        };

        let mut plan = InstallPlan {
            powerwash_required: powerwash,
            partitions: ROLLBACK_PARTITIONS.into_iter().map(Partition::new).collect(),
            ..Default::default()
        };
        plan.set_slots(self.system.boot_control.current_slot(), target)?;
        if !plan.load_partitions_from_slots(self.system.boot_control.as_ref()) {
            let slot = slot_name(target);
            warn!(target_slot = %slot, "Rollback refused: partitions not mapped");
            return Err(AttemptError::RollbackPartitionsUnavailable(slot));
        }
        info!(target_slot = target, powerwash, "Attempting rollback");

        let mut processor = ActionProcessor::with_stop_handle(self.stop.clone());
        let install = processor.enqueue_action(InstallPlanAction::new(plan.clone()));
        let postinstall = processor.enqueue_action(PostinstallRunnerAction::new());
        processor.bond_actions(install, postinstall)?;

        self.processor = processor;
        self.reset_attempt();
        self.install_plan = Some(plan);
        self.set_status(UpdateStatus::AttemptingRollback);

        self.run_processor().await;
        Ok(self.status)
    }

    // =========================================================================
    // Processing
    // =========================================================================

    fn reset_attempt(&mut self) {
        self.install_plan = None;
        self.error_event = None;
        self.http_response_code = 0;
        self.bytes_received = 0;
        self.total_bytes = 0;
        self.new_version.clear();
        self.new_size = 0;
    }

    async fn run_processor(&mut self) {
        let system = Arc::clone(&self.system);
        let mut processor = mem::take(&mut self.processor);
        processor.start_processing(&system, self).await;
    }

    fn mark_delta_update_failure(&self) {
        let is_delta = self
            .install_plan
            .as_ref()
            .is_some_and(|plan| plan.payload_type == PayloadType::Delta);
        if !is_delta {
            return;
        }
        let prefs = self.system.prefs.as_ref();
        let failures = prefs.get_int64(prefs::DELTA_UPDATE_FAILURES).unwrap_or(0).max(0) + 1;
        info!(failures, "Recording delta update failure");
        if let Err(e) = prefs.set_int64(prefs::DELTA_UPDATE_FAILURES, failures) {
            warn!(error = %e, "Failed to persist delta failure count");
        }
    }

    /// Record the failure of `kind` for reporting with the next check.
    fn create_pending_error_event(&mut self, kind: ActionKind, code: ErrorCode) {
        if self.error_event.is_some() || self.status == UpdateStatus::ReportingErrorEvent {
            return;
        }
        let code = error_code_for_action(kind, code);
        let flags = ErrorFlags {
            dev_mode: !self.system.hardware.is_normal_boot_mode(),
            resumed: self.install_plan.as_ref().is_some_and(|plan| plan.is_resume),
            test_image: !self.system.hardware.is_official_build(),
            test_omaha_url: !self.params.is_update_url_official(),
        };
        let event = OmahaEvent::error(code, flags);
        info!(
            action = %kind,
            %code,
            reported = event.reported_code(),
            "Created pending error event"
        );
        self.error_event = Some(event);
    }

    /// Keep the failed attempt's event for the next check.
    fn persist_error_event(&self) {
        let Some(event) = &self.error_event else {
            return;
        };
        match serde_json::to_string(event) {
            Ok(json) => {
                if let Err(e) = self.system.prefs.set_string(prefs::PENDING_ERROR_EVENT, &json) {
                    warn!(error = %e, "Failed to persist pending error event");
                }
            }
            Err(e) => warn!(error = %e, "Failed to encode pending error event"),
        }
    }

    fn write_update_completed_marker(&self) {
        let prefs = self.system.prefs.as_ref();
        if let Some(boot_id) = self.system.hardware.boot_id() {
            if let Err(e) = prefs.set_string(prefs::UPDATE_COMPLETED_ON_BOOT_ID, &boot_id) {
                warn!(error = %e, "Failed to persist update-completed boot id");
            }
        }
        let boot_time = self.system.clock.boot_time().as_secs() as i64;
        if let Err(e) = prefs.set_int64(prefs::UPDATE_COMPLETED_BOOT_TIME, boot_time) {
            warn!(error = %e, "Failed to persist update-completed boot time");
        }
    }

    fn clear_attempt_counters(&self) {
        let prefs = self.system.prefs.as_ref();
        reset_update_progress(prefs);
        for key in [
            prefs::DELTA_UPDATE_FAILURES,
            prefs::UPDATE_FIRST_SEEN_AT,
            prefs::UPDATE_CHECK_COUNT,
            prefs::WALL_CLOCK_WAIT_PERIOD,
        ] {
            if let Err(e) = prefs.delete(key) {
                warn!(key, error = %e, "Failed to clear pref");
            }
        }
        self.system.payload_state.update_succeeded();
    }

    // =========================================================================
    // Daily metrics
    // =========================================================================

    /// Report daily metrics unless a report went out within the last 24
    /// hours. Returns whether a report was made.
    ///
    /// A last-reported time in the future means the clock went backwards;
    /// the report goes out and the timestamp is reset.
    pub fn check_and_report_daily_metrics(&self) -> bool {
        let prefs = self.system.prefs.as_ref();
        let now = self.system.clock.wallclock_now();

        let last_reported = prefs
            .get_int64(prefs::DAILY_METRICS_LAST_REPORTED_AT)
            .and_then(|secs| DateTime::from_timestamp(secs, 0));
        match last_reported {
            Some(last) => {
                let elapsed = now - last;
                if elapsed < TimeDelta::zero() {
                    warn!(
                        elapsed_secs = elapsed.num_seconds(),
                        "Daily metrics last reported in the future, reporting now"
                    );
                } else if elapsed < DAILY_METRICS_INTERVAL {
                    debug!(
                        elapsed_secs = elapsed.num_seconds(),
                        "Daily metrics already reported"
                    );
                    return false;
                }
            }
            None => debug!("No daily metrics reported yet"),
        }

        if let Err(e) = prefs.set_int64(prefs::DAILY_METRICS_LAST_REPORTED_AT, now.timestamp()) {
            warn!(error = %e, "Failed to persist daily metrics timestamp");
        }
        self.report_daily_metrics();
        true
    }

    fn report_daily_metrics(&self) {
        let boot_control = &self.system.boot_control;
        let shared_files = self
            .system
            .p2p_manager
            .as_ref()
            .map_or(0, |p2p| p2p.count_shared_files());
        info!(
            target: METRICS_TARGET,
            app_version = %self.base_params.app_version,
            channel = %self.base_params.current_channel,
            current_slot = boot_control.current_slot(),
            num_slots = boot_control.num_slots(),
            uptime_secs = self.system.clock.boot_time().as_secs(),
            p2p_shared_files = shared_files,
            "Daily metrics"
        );
    }
}

impl ActionProcessorDelegate for UpdateAttempter {
    fn action_completed(&mut self, action: &Action, code: ErrorCode) {
        match action {
            Action::OmahaRequest(request) => {
                self.http_response_code = request.http_response_code();
                if let Some(interval) = request.poll_interval() {
                    self.server_poll_interval = Some(interval);
                }
                // The check reached the server, so the pending event went out.
                if !request.is_event() && request.http_response_code() == 200 {
                    if let Err(e) = self.system.prefs.delete(prefs::PENDING_ERROR_EVENT) {
                        warn!(error = %e, "Failed to clear delivered error event");
                    }
                }
            }
            Action::Download(download) => {
                self.http_response_code = download.http_response_code();
            }
            Action::OmahaResponseHandler(handler) if code.is_success() => {
                let plan = handler.install_plan().clone();
                self.new_version = plan.version.clone();
                self.new_size = plan.payload_size;
                self.total_bytes = plan.payload_size;
                self.install_plan = Some(plan);
            }
            _ => {}
        }

        if code == ErrorCode::NoUpdate || code == ErrorCode::OmahaUpdateDeferredPerPolicy {
            return;
        }
        if !code.is_success() {
            if self.status >= UpdateStatus::Downloading && code != ErrorCode::DownloadTransferError
            {
                self.mark_delta_update_failure();
            }
            self.create_pending_error_event(action.kind(), code);
            return;
        }

        match action {
            Action::OmahaResponseHandler(_) => self.set_status(UpdateStatus::UpdateAvailable),
            Action::Download(_) => self.set_status(UpdateStatus::Verifying),
            Action::FilesystemVerifier(verifier)
                if verifier.mode() == VerifierMode::VerifyTargetHash =>
            {
                self.set_status(UpdateStatus::Finalizing)
            }
            _ => {}
        }
    }

    fn action_event(&mut self, _kind: ActionKind, event: &ActionEvent) {
        match event {
            ActionEvent::DownloadActive(true) => {
                if self.status != UpdateStatus::Downloading {
                    self.set_status(UpdateStatus::Downloading);
                }
            }
            ActionEvent::DownloadActive(false) => {}
            ActionEvent::BytesReceived {
                bytes_received,
                total,
                ..
            } => {
                self.bytes_received = *bytes_received;
                if *total > 0 {
                    self.total_bytes = *total;
                }
                self.broadcast();
            }
        }
    }

    fn processing_done(&mut self, code: ErrorCode) {
        match code {
            ErrorCode::Success => {
                info!("Update successfully applied, waiting for reboot");
                self.write_update_completed_marker();
                self.clear_attempt_counters();
                self.bytes_received = self.total_bytes;
                self.set_status(UpdateStatus::UpdatedNeedReboot);
            }
            ErrorCode::NoUpdate => {
                info!("No update available");
                self.set_status(UpdateStatus::Idle);
            }
            ErrorCode::OmahaUpdateDeferredPerPolicy => {
                info!("Update deferred by scattering");
                self.set_status(UpdateStatus::Idle);
            }
            _ => {
                let reported = self
                    .error_event
                    .as_ref()
                    .map_or(code, |event| event.error_code);
                error!(%code, %reported, "Update attempt failed");
                self.persist_error_event();
                self.system.payload_state.update_failed(reported);
                self.set_status(UpdateStatus::ReportingErrorEvent);
                self.set_status(UpdateStatus::Idle);
            }
        }
    }

    fn processing_stopped(&mut self) {
        info!("Update attempt stopped");
        self.error_event = None;
        self.set_status(UpdateStatus::Idle);
    }
}
