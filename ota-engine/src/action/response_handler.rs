//! Turns an update-check response into an install plan.

use std::fs;
use std::path::PathBuf;

use tracing::{error, info, warn};

use super::{ActionContext, ActionOutcome, PipeObject};
use crate::download::reset_update_progress;
use crate::error::ErrorCode;
use crate::install_plan::{InstallPlan, Partition, PayloadType};
use crate::omaha::{OmahaResponse, RequestParams};
use crate::system::boot_control::INVALID_SLOT;
use crate::system::prefs::{self, Prefs};
use crate::system::SystemState;

/// A resume is abandoned once it has been attempted this many times.
pub const MAX_RESUMED_UPDATE_FAILURES: i64 = 10;

pub struct OmahaResponseHandlerAction {
    params: RequestParams,
    deadline_file: Option<PathBuf>,
    install_plan: InstallPlan,
}

impl OmahaResponseHandlerAction {
    /// `deadline_file` receives the response deadline, if one is configured.
    pub fn new(params: RequestParams, deadline_file: Option<PathBuf>) -> Self {
        Self {
            params,
            deadline_file,
            install_plan: InstallPlan::default(),
        }
    }

    /// The plan built by the last run. Empty until a response with an
    /// update has been handled.
    pub fn install_plan(&self) -> &InstallPlan {
        &self.install_plan
    }

    pub(crate) async fn perform(
        &mut self,
        input: Option<PipeObject>,
        ctx: &ActionContext<'_>,
    ) -> ActionOutcome {
        let Some(response) = input.and_then(PipeObject::into_response) else {
            error!("No update-check response to handle");
            return ActionOutcome::failed(ErrorCode::Error);
        };
        if !response.update_exists {
            info!("There are no updates, aborting");
            return ActionOutcome::failed(ErrorCode::NoUpdate);
        }

        let system = ctx.system();
        system.payload_state.set_response(&response);

        let Some(download_url) = Self::select_url(&response, system) else {
            error!("Response carries no usable payload URL");
            return ActionOutcome::failed(ErrorCode::OmahaResponseInvalid);
        };

        let mut plan = match self.build_plan(&response, download_url, system) {
            Ok(plan) => plan,
            Err(code) => return ActionOutcome::failed(code),
        };

        plan.is_resume = Self::can_resume(&response, system.prefs.as_ref());
        if plan.is_resume {
            info!("Resuming the previous update attempt");
            system.payload_state.update_resumed();
        } else {
            reset_update_progress(system.prefs.as_ref());
            if let Err(e) = system
                .prefs
                .set_string(prefs::UPDATE_CHECK_RESPONSE_HASH, &response.hash)
            {
                warn!(error = %e, "Failed to persist response hash");
            }
            system.payload_state.update_restarted();
        }

        plan.hash_checks_mandatory = self.hash_checks_mandatory(&plan, system);
        plan.powerwash_required = self.params.to_more_stable_channel();
        if plan.powerwash_required {
            info!(
                current = %self.params.current_channel,
                target = %self.params.target_channel,
                "Moving to a more stable channel, powerwash required"
            );
        }

        self.write_deadline(&response.deadline);

        plan.dump();
        self.install_plan = plan.clone();
        ActionOutcome::success(PipeObject::InstallPlan(plan))
    }

    /// Pick the download URL: the peer found by the update check when P2P
    /// downloading is on, otherwise the payload state's current URL.
    fn select_url(response: &OmahaResponse, system: &SystemState) -> Option<String> {
        let payload_state = &system.payload_state;

        if payload_state.using_p2p_for_downloading() {
            let p2p_url = payload_state.p2p_url();
            if !p2p_url.is_empty() {
                info!(url = %p2p_url, "Downloading from peer");
                return Some(p2p_url);
            }
            info!("No peer has the payload, downloading over HTTP");
            payload_state.set_using_p2p_for_downloading(false);
        }

        let current = payload_state.current_url();
        if !current.is_empty() {
            return Some(current);
        }
        response.payload_urls.first().cloned()
    }

    fn build_plan(
        &self,
        response: &OmahaResponse,
        download_url: String,
        system: &SystemState,
    ) -> Result<InstallPlan, ErrorCode> {
        let mut plan = InstallPlan {
            download_url,
            version: response.version.clone(),
            payload_size: response.size,
            payload_hash: response.hash.clone(),
            metadata_size: response.metadata_size,
            metadata_signature: response.metadata_signature.clone(),
            public_key_rsa: response.public_key_rsa.clone(),
            payload_type: if response.is_delta_payload {
                PayloadType::Delta
            } else {
                PayloadType::Full
            },
            ..Default::default()
        };

        let boot_control = system.boot_control.as_ref();
        let current = boot_control.current_slot();
        let target = if current == 0 { 1 } else { 0 };
        if target >= boot_control.num_slots() {
            error!(num_slots = boot_control.num_slots(), "No slot to install into");
            return Err(ErrorCode::OmahaResponseHandlerError);
        }
        if let Err(e) = plan.set_slots(current, target) {
            error!(error = %e, "Invalid slot assignment");
            return Err(ErrorCode::OmahaResponseHandlerError);
        }
        if current == INVALID_SLOT {
            warn!("Running slot is unknown, delta payloads cannot apply");
        }

        for manifest in &response.partitions {
            let decode = |hex_hash: &str| {
                hex::decode(hex_hash).map_err(|e| {
                    error!(partition = %manifest.name, error = %e, "Bad partition hash");
                    ErrorCode::OmahaResponseInvalid
                })
            };
            plan.partitions.push(Partition {
                name: manifest.name.clone(),
                source_size: manifest.source_size,
                source_hash: decode(&manifest.source_hash)?,
                target_size: manifest.size,
                target_hash: decode(&manifest.hash)?,
                run_postinstall: manifest.run_postinstall,
                postinstall_path: manifest.postinstall_path.clone(),
                filesystem_type: manifest.filesystem_type.clone(),
                ..Default::default()
            });
        }
        if !plan.load_partitions_from_slots(boot_control) {
            error!("Unable to resolve target partition devices");
            return Err(ErrorCode::InstallDeviceOpenError);
        }
        Ok(plan)
    }

    fn can_resume(response: &OmahaResponse, prefs: &dyn Prefs) -> bool {
        let same_response = prefs
            .get_string(prefs::UPDATE_CHECK_RESPONSE_HASH)
            .is_some_and(|hash| !hash.is_empty() && hash == response.hash);
        if !same_response {
            return false;
        }
        let next_offset = prefs
            .get_int64(prefs::UPDATE_STATE_NEXT_DATA_OFFSET)
            .unwrap_or(-1);
        if next_offset <= 0 {
            return false;
        }
        let failures = prefs
            .get_int64(prefs::RESUMED_UPDATE_FAILURES)
            .unwrap_or(0);
        failures <= MAX_RESUMED_UPDATE_FAILURES
    }

    fn hash_checks_mandatory(&self, plan: &InstallPlan, system: &SystemState) -> bool {
        // Peer bytes are unauthenticated.
        if system.payload_state.using_p2p_for_downloading() {
            return true;
        }
        if system.hardware.is_official_build() {
            return true;
        }
        if !self.params.is_au_test_url(&self.params.update_url) {
            return true;
        }
        if !plan.public_key_rsa.is_empty() {
            return true;
        }
        info!("Unofficial build on the test server, waiving payload hash checks");
        false
    }

    fn write_deadline(&self, deadline: &str) {
        let Some(path) = &self.deadline_file else {
            return;
        };
        let result = if deadline.is_empty() {
            match fs::remove_file(path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        } else {
            fs::write(path, deadline)
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to update deadline file");
        }
    }
}
