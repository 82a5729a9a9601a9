//! Update check and event reporting.
//!
//! The same action type serves two roles:
//!
//! - **check**: asks the server for an update, carrying any pending error
//!   event, and emits the response. A found update is looked up on peers
//!   when P2P downloading is on, and may be deferred here when scattering
//!   says this device should wait. A peer copy is never deferred.
//! - **event**: reports a lifecycle event. Delivery failures are logged and
//!   never fail the attempt.

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use tracing::{info, warn};

use super::{ActionContext, ActionOutcome, PipeObject};
use crate::error::ErrorCode;
use crate::omaha::{OmahaEvent, OmahaResponse, RequestParams};
use crate::p2p;
use crate::system::prefs::{self, Prefs};
use crate::system::SystemState;

/// Past this age a found update is applied regardless of scattering.
pub const MAX_DAYS_TO_SCATTER: i64 = 14;

pub struct OmahaRequestAction {
    params: RequestParams,
    event: Option<OmahaEvent>,
    pending_event: Option<OmahaEvent>,
    http_response_code: u16,
    poll_interval: Option<u32>,
}

impl OmahaRequestAction {
    /// Update check, reporting `pending_event` along the way.
    pub fn check(params: RequestParams, pending_event: Option<OmahaEvent>) -> Self {
        Self {
            params,
            event: None,
            pending_event,
            http_response_code: 0,
            poll_interval: None,
        }
    }

    /// Lifecycle event report.
    pub fn event(params: RequestParams, event: OmahaEvent) -> Self {
        Self {
            params,
            event: Some(event),
            pending_event: None,
            http_response_code: 0,
            poll_interval: None,
        }
    }

    pub fn is_event(&self) -> bool {
        self.event.is_some()
    }

    pub fn reported_event(&self) -> Option<&OmahaEvent> {
        self.event.as_ref().or(self.pending_event.as_ref())
    }

    pub fn http_response_code(&self) -> u16 {
        self.http_response_code
    }

    /// Poll interval dictated by the last response, if any.
    pub fn poll_interval(&self) -> Option<u32> {
        self.poll_interval
    }

    pub(crate) async fn perform(&mut self, ctx: &ActionContext<'_>) -> ActionOutcome {
        let system = ctx.system();
        if let Some(event) = &self.event {
            let send = system.omaha_client.send_event(&self.params, event);
            tokio::select! {
                biased;
                _ = ctx.cancelled() => return ActionOutcome::failed(ErrorCode::UserCanceled),
                result = send => {
                    if let Err(e) = result {
                        warn!(event = ?event.event_type, error = %e, "Failed to send event");
                    }
                }
            }
            return ActionOutcome::done();
        }

        let check = system
            .omaha_client
            .check_for_update(&self.params, self.pending_event.as_ref());
        let result = tokio::select! {
            biased;
            _ = ctx.cancelled() => return ActionOutcome::failed(ErrorCode::UserCanceled),
            result = check => result,
        };

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                self.http_response_code = e.http_response_code().unwrap_or(0);
                warn!(error = %e, "Update check failed");
                return ActionOutcome::failed(e.error_code());
            }
        };
        self.http_response_code = 200;
        if response.poll_interval > 0 {
            self.poll_interval = Some(response.poll_interval);
        }

        if response.update_exists {
            if let Err(code) = self.prepare_p2p(&response, ctx).await {
                return ActionOutcome::failed(code);
            }
            if self.should_defer_download(&response, system) {
                info!(version = %response.version, "Deferring update per scattering policy");
                return ActionOutcome::failed(ErrorCode::OmahaUpdateDeferredPerPolicy);
            }
        }
        ActionOutcome::success(PipeObject::OmahaResponse(response))
    }

    /// Apply the server's P2P overrides and record the response. When peers
    /// may still be used, find one holding at least the bytes this device
    /// resumes from; without one P2P downloading is turned off.
    async fn prepare_p2p(
        &self,
        response: &OmahaResponse,
        ctx: &ActionContext<'_>,
    ) -> Result<(), ErrorCode> {
        let system = ctx.system();
        let payload_state = &system.payload_state;

        if response.disable_p2p_for_downloading {
            info!("Server disabled P2P downloading for this payload");
            payload_state.set_using_p2p_for_downloading(false);
        }
        if response.disable_p2p_for_sharing {
            info!("Server disabled P2P sharing for this payload");
            payload_state.set_using_p2p_for_sharing(false);
        }
        payload_state.set_response(response);

        if !payload_state.using_p2p_for_downloading() {
            return Ok(());
        }
        let now = system.clock.wallclock_now();
        payload_state.p2p_new_attempt(now);
        if !payload_state.p2p_attempt_allowed(now) {
            info!("Too many P2P attempts for this payload, downloading over HTTP");
            payload_state.set_using_p2p_for_downloading(false);
            return Ok(());
        }
        let Some(p2p_manager) = &system.p2p_manager else {
            payload_state.set_using_p2p_for_downloading(false);
            return Ok(());
        };

        let file_id = p2p::file_id(&response.hash, response.size);
        let minimum_size = p2p::lookup_minimum_size(system.prefs.as_ref(), &response.hash);
        info!(file_id = %file_id, minimum_size, "Looking up payload on peers");
        let lookup = p2p_manager.lookup_url_for_file(&file_id, minimum_size);
        let found = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(ErrorCode::UserCanceled),
            found = lookup => found,
        };
        match found {
            Some(url) => {
                info!(url = %url, "Peer has the payload");
                payload_state.set_p2p_url(&url);
            }
            None => {
                info!("No suitable peer, disabling P2P downloading");
                payload_state.set_using_p2p_for_downloading(false);
            }
        }
        Ok(())
    }

    fn should_defer_download(&self, response: &OmahaResponse, system: &SystemState) -> bool {
        if self.params.interactive {
            info!("Not deferring: interactive update check");
            return false;
        }
        let payload_state = &system.payload_state;
        if payload_state.using_p2p_for_downloading() && !payload_state.p2p_url().is_empty() {
            info!("Not deferring: downloading from a local peer");
            return false;
        }
        if !self.params.wall_clock_based_wait_enabled {
            return false;
        }
        if !response.deadline.is_empty() {
            info!("Not deferring: update has a deadline");
            return false;
        }

        let now = system.clock.wallclock_now();
        !(self.is_wall_clock_wait_satisfied(system.prefs.as_ref(), now)
            && self.is_update_check_count_wait_satisfied(system.prefs.as_ref()))
    }

    fn is_wall_clock_wait_satisfied(&self, prefs: &dyn Prefs, now: DateTime<Utc>) -> bool {
        let first_seen = prefs
            .get_int64(prefs::UPDATE_FIRST_SEEN_AT)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .filter(|first_seen| *first_seen <= now);

        let first_seen = match first_seen {
            Some(first_seen) => first_seen,
            None => {
                // Missing, or in the future after a clock change.
                if let Err(e) = prefs.set_int64(prefs::UPDATE_FIRST_SEEN_AT, now.timestamp()) {
                    warn!(error = %e, "Failed to persist update first-seen time");
                }
                now
            }
        };

        let elapsed = now - first_seen;
        if elapsed > TimeDelta::days(MAX_DAYS_TO_SCATTER) {
            info!("Update first seen too long ago, ignoring scattering");
            return true;
        }
        let waiting_period =
            TimeDelta::from_std(self.params.waiting_period).unwrap_or(TimeDelta::MAX);
        if elapsed >= waiting_period {
            return true;
        }
        info!(
            elapsed_secs = elapsed.num_seconds(),
            waiting_secs = waiting_period.num_seconds(),
            "Wall-clock wait not yet satisfied"
        );
        false
    }

    fn is_update_check_count_wait_satisfied(&self, prefs: &dyn Prefs) -> bool {
        if !self.params.update_check_count_wait_enabled {
            return true;
        }

        let min = self.params.min_update_checks_needed;
        let max = self.params.max_update_checks_allowed;
        if !prefs.exists(prefs::UPDATE_CHECK_COUNT) {
            let count = if max > min {
                rand::rng().random_range(min..=max)
            } else {
                min
            };
            info!(count, "Starting update check count wait");
            if let Err(e) = prefs.set_int64(prefs::UPDATE_CHECK_COUNT, count) {
                warn!(error = %e, "Failed to persist update check count");
                return true;
            }
            return count <= 0;
        }

        match prefs.get_int64(prefs::UPDATE_CHECK_COUNT) {
            Some(0) => true,
            Some(count) if (1..=max).contains(&count) => {
                info!(remaining = count, "Update check count wait not yet satisfied");
                false
            }
            other => {
                warn!(value = ?other, "Invalid update check count, ignoring the wait");
                if let Err(e) = prefs.delete(prefs::UPDATE_CHECK_COUNT) {
                    warn!(error = %e, "Failed to clear update check count");
                }
                true
            }
        }
    }
}
