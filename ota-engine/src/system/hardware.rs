//! Hardware and build properties.

use std::fs;
use std::path::PathBuf;

use tracing::{info, warn};

/// Facts about the device and its build.
pub trait Hardware: Send + Sync {
    fn is_official_build(&self) -> bool;

    /// False when booted in developer mode.
    fn is_normal_boot_mode(&self) -> bool;

    fn is_oobe_enabled(&self) -> bool;

    fn is_oobe_complete(&self) -> bool;

    /// Identifier unique to the current boot.
    fn boot_id(&self) -> Option<String>;

    /// Arrange for user data to be wiped on next boot.
    fn schedule_powerwash(&self) -> bool;
}

const BOOT_ID_PATH: &str = "/proc/sys/kernel/random/boot_id";

/// Contents written to the powerwash marker.
const POWERWASH_COMMAND: &str = "safe fast\n";

/// Hardware facts taken from configuration and the running kernel.
#[derive(Debug, Clone)]
pub struct SystemHardware {
    official_build: bool,
    normal_boot_mode: bool,
    oobe_complete_marker: Option<PathBuf>,
    powerwash_marker: PathBuf,
}

impl SystemHardware {
    pub fn new(official_build: bool, normal_boot_mode: bool, powerwash_marker: PathBuf) -> Self {
        Self {
            official_build,
            normal_boot_mode,
            oobe_complete_marker: None,
            powerwash_marker,
        }
    }

    /// Treat OOBE as enabled, completed once `marker` exists.
    pub fn with_oobe_marker(mut self, marker: PathBuf) -> Self {
        self.oobe_complete_marker = Some(marker);
        self
    }
}

impl Hardware for SystemHardware {
    fn is_official_build(&self) -> bool {
        self.official_build
    }

    fn is_normal_boot_mode(&self) -> bool {
        self.normal_boot_mode
    }

    fn is_oobe_enabled(&self) -> bool {
        self.oobe_complete_marker.is_some()
    }

    fn is_oobe_complete(&self) -> bool {
        self.oobe_complete_marker
            .as_ref()
            .map_or(true, |marker| marker.exists())
    }

    fn boot_id(&self) -> Option<String> {
        fs::read_to_string(BOOT_ID_PATH)
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
    }

    fn schedule_powerwash(&self) -> bool {
        match fs::write(&self.powerwash_marker, POWERWASH_COMMAND) {
            Ok(()) => {
                info!(marker = %self.powerwash_marker.display(), "Powerwash scheduled");
                true
            }
            Err(e) => {
                warn!(
                    marker = %self.powerwash_marker.display(),
                    error = %e,
                    "Failed to schedule powerwash"
                );
                false
            }
        }
    }
}
