//! Collaborators the engine talks to.
//!
//! Everything an action or the attempter needs from the outside world is
//! reached through [`SystemState`], one explicit context object built at
//! startup and passed by reference. There are no globals.
//!
//! | Field             | Trait              | Production implementation |
//! |-------------------|--------------------|---------------------------|
//! | `prefs`           | `Prefs`            | `FilePrefs`               |
//! | `boot_control`    | `BootControl`      | `DeviceBootControl`       |
//! | `payload_state`   | `PayloadState`     | `DefaultPayloadState`     |
//! | `hardware`        | `Hardware`         | `SystemHardware`          |
//! | `clock`           | `Clock`            | `SystemClock`             |
//! | `p2p_manager`     | `P2PManager`       | `DirP2PManager`           |
//! | `omaha_client`    | `OmahaClient`      | `FileOmahaClient`         |
//! | `fetcher_factory` | `HttpFetcherFactory` | `ReqwestFetcherFactory` |

pub mod boot_control;
pub mod clock;
pub mod hardware;
pub mod payload_state;
pub mod policy;
pub mod prefs;

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::config::ConfigFile;
use crate::download::{HttpFetcherFactory, ReqwestFetcherFactory};
use crate::error::{EngineError, EngineResult};
use crate::omaha::{FileOmahaClient, OmahaClient};
use crate::p2p::{DirP2PManager, P2PManager};
use boot_control::{BootControl, DeviceBootControl};
use clock::{Clock, SystemClock};
use hardware::{Hardware, SystemHardware};
use payload_state::{DefaultPayloadState, PayloadState};
use policy::DevicePolicy;
use prefs::{FilePrefs, Prefs};

/// Shared handles to the engine's collaborators.
#[derive(Clone)]
pub struct SystemState {
    pub prefs: Arc<dyn Prefs>,
    pub boot_control: Arc<dyn BootControl>,
    pub payload_state: Arc<dyn PayloadState>,
    pub hardware: Arc<dyn Hardware>,
    pub clock: Arc<dyn Clock>,
    pub p2p_manager: Option<Arc<dyn P2PManager>>,
    pub device_policy: Option<DevicePolicy>,
    pub omaha_client: Arc<dyn OmahaClient>,
    pub fetcher_factory: Arc<dyn HttpFetcherFactory>,
    /// Staging file for payloads that are not written to partitions.
    pub payload_path: PathBuf,
    pub deadline_file: Option<PathBuf>,
}

impl SystemState {
    /// Wire the production collaborators described by `config`.
    pub fn from_config(config: &ConfigFile) -> EngineResult<Self> {
        let prefs: Arc<dyn Prefs> = Arc::new(FilePrefs::open(&config.paths.prefs_dir)?);

        let boot_control = Arc::new(DeviceBootControl::new(
            config.boot.num_slots,
            config.boot.current_slot,
            &config.boot.device_dir,
            prefs.clone(),
        ));

        let mut hardware = SystemHardware::new(
            config.hardware.official_build,
            config.hardware.normal_boot_mode,
            config.paths.powerwash_marker.clone(),
        );
        if let Some(marker) = &config.hardware.oobe_marker {
            hardware = hardware.with_oobe_marker(marker.clone());
        }

        let p2p_enabled = resolve_p2p_enabled(
            config.policy.as_ref(),
            prefs.as_ref(),
            config.p2p.enabled,
        );
        let mut p2p = DirP2PManager::new(&config.p2p.directory, p2p_enabled);
        if let Some(command) = &config.p2p.server_command {
            p2p = p2p.with_server_command(command);
        }
        if let Some(command) = &config.p2p.client_command {
            p2p = p2p.with_client_command(command);
        }

        let mut omaha = FileOmahaClient::new(&config.omaha.response_file);
        if let Some(log) = &config.omaha.event_log {
            omaha = omaha.with_event_log(log);
        }

        let fetchers =
            ReqwestFetcherFactory::new(config.download.connect_timeout, config.download.timeout)
                .map_err(|e| EngineError::Http(e.to_string()))?;

        info!(
            prefs = %config.paths.prefs_dir.display(),
            slots = config.boot.num_slots,
            p2p_enabled,
            has_policy = config.policy.is_some(),
            "System state ready"
        );

        Ok(Self {
            payload_state: Arc::new(DefaultPayloadState::new(prefs.clone())),
            prefs,
            boot_control,
            hardware: Arc::new(hardware),
            clock: Arc::new(SystemClock),
            p2p_manager: Some(Arc::new(p2p)),
            device_policy: config.policy.clone(),
            omaha_client: Arc::new(omaha),
            fetcher_factory: Arc::new(fetchers),
            payload_path: config.paths.payload_path.clone(),
            deadline_file: config.paths.deadline_file.clone(),
        })
    }
}

/// Policy wins, then the local preference, then the configured default.
pub fn resolve_p2p_enabled(
    policy: Option<&DevicePolicy>,
    prefs: &dyn Prefs,
    configured: bool,
) -> bool {
    policy
        .and_then(|p| p.p2p_enabled)
        .or_else(|| prefs.get_bool(prefs::P2P_ENABLED))
        .unwrap_or(configured)
}

#[cfg(test)]
mod tests {
    use super::*;
    use prefs::MemoryPrefs;
    use tempfile::TempDir;

    #[test]
    fn test_p2p_enabled_precedence() {
        let prefs = MemoryPrefs::new();
        assert!(!resolve_p2p_enabled(None, &prefs, false));
        assert!(resolve_p2p_enabled(None, &prefs, true));

        prefs.set_bool(prefs::P2P_ENABLED, false).unwrap();
        assert!(!resolve_p2p_enabled(None, &prefs, true));

        let policy = DevicePolicy {
            p2p_enabled: Some(true),
            ..Default::default()
        };
        assert!(resolve_p2p_enabled(Some(&policy), &prefs, false));
    }

    #[test]
    fn test_from_config() {
        let temp = TempDir::new().unwrap();
        let mut config = ConfigFile::default();
        config.paths.prefs_dir = temp.path().join("prefs");
        config.paths.payload_path = temp.path().join("payload.bin");
        config.boot.current_slot = Some(1);
        config.boot.device_dir = temp.path().join("dev");
        config.p2p.directory = temp.path().join("p2p");

        let system = SystemState::from_config(&config).unwrap();
        assert_eq!(system.boot_control.current_slot(), 1);
        assert_eq!(system.boot_control.num_slots(), 2);
        assert!(system.device_policy.is_none());
        assert_eq!(system.payload_path, temp.path().join("payload.bin"));
        assert!(config.paths.prefs_dir.is_dir());
    }
}
