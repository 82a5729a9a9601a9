//! INI configuration file.
//!
//! The engine reads `config.ini` from the user configuration directory
//! (`$XDG_CONFIG_HOME/ota-engine/config.ini` on Linux). Every key is
//! optional; a missing file yields the defaults.
//!
//! ```ini
//! [omaha]
//! url = https://omaha.example.com/service/update2
//! app_version = 1.2.3.4
//! channel = stable-channel
//! target_channel = beta-channel
//! response_file = /var/lib/ota-engine/omaha-response.json
//! event_log = /var/lib/ota-engine/events.jsonl
//!
//! [paths]
//! prefs_dir = /var/lib/ota-engine/prefs
//! payload_path = /var/lib/ota-engine/payload.bin
//! deadline_file = /var/lib/ota-engine/update-deadline
//! powerwash_marker = /var/lib/ota-engine/factory_install_reset
//!
//! [boot]
//! num_slots = 2
//! current_slot = 0
//! device_dir = /dev/block/by-name
//!
//! [p2p]
//! enabled = false
//! directory = /var/cache/p2p
//! server_command = systemctl start p2p-server
//! client_command = /usr/sbin/p2p-client
//!
//! [policy]
//! scatter_factor_secs = 86400
//! owner = someone@example.com
//! update_disabled = false
//!
//! [hardware]
//! official_build = true
//! normal_boot_mode = true
//!
//! [download]
//! timeout_secs = 90
//!
//! [logging]
//! level = info
//! directory = /var/log/ota-engine
//! ```
//!
//! A `[policy]` section stands in for the device policy: when absent the
//! device has no policy at all.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

use crate::omaha::{RequestParams, DEFAULT_OMAHA_URL};
use crate::system::boot_control::Slot;
use crate::system::policy::DevicePolicy;

/// Directory name under the platform config and data directories.
pub const APP_DIR_NAME: &str = "ota-engine";

/// Name of the configuration file.
pub const CONFIG_FILE_NAME: &str = "config.ini";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid value '{value}' for [{section}] {key}")]
    InvalidValue {
        section: &'static str,
        key: &'static str,
        value: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OmahaSettings {
    pub url: String,
    pub app_version: String,
    pub channel: String,
    pub target_channel: Option<String>,
    pub response_file: PathBuf,
    pub event_log: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSettings {
    pub prefs_dir: PathBuf,
    pub payload_path: PathBuf,
    pub deadline_file: Option<PathBuf>,
    pub powerwash_marker: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootSettings {
    pub num_slots: u32,
    /// `None` means detect from the kernel command line.
    pub current_slot: Option<Slot>,
    pub device_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct P2PSettings {
    pub enabled: bool,
    pub directory: PathBuf,
    pub server_command: Option<String>,
    pub client_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareSettings {
    pub official_build: bool,
    pub normal_boot_mode: bool,
    /// OOBE is considered complete once this file exists.
    pub oobe_marker: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub connect_timeout: Duration,
    /// Longest wait for the next chunk from the origin.
    pub timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingSettings {
    pub level: String,
    pub directory: Option<PathBuf>,
}

/// Parsed configuration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub omaha: OmahaSettings,
    pub paths: PathSettings,
    pub boot: BootSettings,
    pub p2p: P2PSettings,
    pub policy: Option<DevicePolicy>,
    pub hardware: HardwareSettings,
    pub download: DownloadSettings,
    pub logging: LoggingSettings,
}

/// Directory holding engine state by default.
pub fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(APP_DIR_NAME)
}

/// Default location of the configuration file.
pub fn config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

impl Default for ConfigFile {
    fn default() -> Self {
        let data = data_dir();
        Self {
            omaha: OmahaSettings {
                url: DEFAULT_OMAHA_URL.to_string(),
                app_version: "0.0.0.0".to_string(),
                channel: "stable-channel".to_string(),
                target_channel: None,
                response_file: data.join("omaha-response.json"),
                event_log: None,
            },
            paths: PathSettings {
                prefs_dir: data.join("prefs"),
                payload_path: data.join("payload.bin"),
                deadline_file: Some(data.join("update-deadline")),
                powerwash_marker: data.join("factory_install_reset"),
            },
            boot: BootSettings {
                num_slots: 2,
                current_slot: None,
                device_dir: PathBuf::from("/dev/block/by-name"),
            },
            p2p: P2PSettings {
                enabled: false,
                directory: data.join("p2p"),
                server_command: None,
                client_command: None,
            },
            policy: None,
            hardware: HardwareSettings {
                official_build: true,
                normal_boot_mode: true,
                oobe_marker: None,
            },
            download: DownloadSettings {
                connect_timeout: crate::download::DEFAULT_CONNECT_TIMEOUT,
                timeout: crate::download::DEFAULT_CHUNK_TIMEOUT,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
                directory: None,
            },
        }
    }
}

impl ConfigFile {
    /// Load from the default location, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        match config_path() {
            Some(path) if path.exists() => Self::load_from(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text)
    }

    /// Parse INI text, applying defaults for anything not set.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("omaha")) {
            let omaha = &mut config.omaha;
            set_string(section, "url", &mut omaha.url);
            set_string(section, "app_version", &mut omaha.app_version);
            set_string(section, "channel", &mut omaha.channel);
            set_opt_string(section, "target_channel", &mut omaha.target_channel);
            set_path(section, "response_file", &mut omaha.response_file);
            set_opt_path(section, "event_log", &mut omaha.event_log);
        }

        if let Some(section) = ini.section(Some("paths")) {
            let paths = &mut config.paths;
            set_path(section, "prefs_dir", &mut paths.prefs_dir);
            set_path(section, "payload_path", &mut paths.payload_path);
            set_opt_path(section, "deadline_file", &mut paths.deadline_file);
            set_path(section, "powerwash_marker", &mut paths.powerwash_marker);
        }

        if let Some(section) = ini.section(Some("boot")) {
            let boot = &mut config.boot;
            if let Some(n) = parse_value("boot", "num_slots", section)? {
                boot.num_slots = n;
            }
            if let Some(slot) = parse_value("boot", "current_slot", section)? {
                boot.current_slot = Some(slot);
            }
            set_path(section, "device_dir", &mut boot.device_dir);
        }

        if let Some(section) = ini.section(Some("p2p")) {
            let p2p = &mut config.p2p;
            if let Some(enabled) = parse_bool("p2p", "enabled", section)? {
                p2p.enabled = enabled;
            }
            set_path(section, "directory", &mut p2p.directory);
            set_opt_string(section, "server_command", &mut p2p.server_command);
            set_opt_string(section, "client_command", &mut p2p.client_command);
        }

        if let Some(section) = ini.section(Some("policy")) {
            let mut policy = DevicePolicy::default();
            if let Some(secs) = parse_value("policy", "scatter_factor_secs", section)? {
                policy.scatter_factor_in_seconds = secs;
            }
            set_opt_string(section, "owner", &mut policy.owner);
            policy.p2p_enabled = parse_bool("policy", "p2p_enabled", section)?;
            if let Some(disabled) = parse_bool("policy", "update_disabled", section)? {
                policy.update_disabled = disabled;
            }
            config.policy = Some(policy);
        }

        if let Some(section) = ini.section(Some("hardware")) {
            let hardware = &mut config.hardware;
            if let Some(official) = parse_bool("hardware", "official_build", section)? {
                hardware.official_build = official;
            }
            if let Some(normal) = parse_bool("hardware", "normal_boot_mode", section)? {
                hardware.normal_boot_mode = normal;
            }
            set_opt_path(section, "oobe_marker", &mut hardware.oobe_marker);
        }

        if let Some(section) = ini.section(Some("download")) {
            if let Some(secs) = parse_value::<u64>("download", "timeout_secs", section)? {
                config.download.timeout = Duration::from_secs(secs);
            }
            if let Some(secs) = parse_value::<u64>("download", "connect_timeout_secs", section)? {
                config.download.connect_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(section) = ini.section(Some("logging")) {
            set_string(section, "level", &mut config.logging.level);
            set_opt_path(section, "directory", &mut config.logging.directory);
        }

        Ok(config)
    }

    /// Request parameters for an update check.
    pub fn request_params(&self) -> RequestParams {
        let mut params = RequestParams::new(&self.omaha.app_version, &self.omaha.channel)
            .with_update_url(&self.omaha.url);
        if let Some(target) = &self.omaha.target_channel {
            params.set_target_channel(target);
        }
        params
    }
}

fn value<'a>(section: &'a Properties, key: &str) -> Option<&'a str> {
    section.get(key).map(str::trim).filter(|v| !v.is_empty())
}

fn set_string(section: &Properties, key: &str, target: &mut String) {
    if let Some(v) = value(section, key) {
        *target = v.to_string();
    }
}

fn set_opt_string(section: &Properties, key: &str, target: &mut Option<String>) {
    if let Some(v) = value(section, key) {
        *target = Some(v.to_string());
    }
}

fn set_path(section: &Properties, key: &str, target: &mut PathBuf) {
    if let Some(v) = value(section, key) {
        *target = PathBuf::from(v);
    }
}

fn set_opt_path(section: &Properties, key: &str, target: &mut Option<PathBuf>) {
    if let Some(v) = value(section, key) {
        *target = Some(PathBuf::from(v));
    }
}

fn parse_value<T: FromStr>(
    section_name: &'static str,
    key: &'static str,
    section: &Properties,
) -> Result<Option<T>, ConfigError> {
    value(section, key)
        .map(|v| {
            v.parse().map_err(|_| ConfigError::InvalidValue {
                section: section_name,
                key,
                value: v.to_string(),
            })
        })
        .transpose()
}

fn parse_bool(
    section_name: &'static str,
    key: &'static str,
    section: &Properties,
) -> Result<Option<bool>, ConfigError> {
    value(section, key)
        .map(|v| match v.to_ascii_lowercase().as_str() {
            "true" | "yes" | "on" | "1" => Ok(true),
            "false" | "no" | "off" | "0" => Ok(false),
            _ => Err(ConfigError::InvalidValue {
                section: section_name,
                key,
                value: v.to_string(),
            }),
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_empty_config_is_default() {
        assert_eq!(ConfigFile::parse("").unwrap(), ConfigFile::default());
    }

    #[test]
    fn test_parse_sections() {
        let config = ConfigFile::parse(
            r#"
[omaha]
url = http://localhost:8080/update
channel = beta-channel
target_channel = stable-channel

[boot]
num_slots = 3
current_slot = 1

[p2p]
enabled = yes
client_command = /bin/p2p-client

[policy]
scatter_factor_secs = 3600
owner = someone@example.com
update_disabled = true

[download]
timeout_secs = 10
"#,
        )
        .unwrap();

        assert_eq!(config.omaha.url, "http://localhost:8080/update");
        assert_eq!(config.omaha.target_channel.as_deref(), Some("stable-channel"));
        assert_eq!(config.boot.num_slots, 3);
        assert_eq!(config.boot.current_slot, Some(1));
        assert!(config.p2p.enabled);
        assert_eq!(config.p2p.client_command.as_deref(), Some("/bin/p2p-client"));
        let policy = config.policy.unwrap();
        assert_eq!(policy.scatter_factor_in_seconds, 3600);
        assert!(!policy.is_enterprise_enrolled());
        assert!(policy.update_disabled);
        assert_eq!(config.download.timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_request_params_from_config() {
        let config = ConfigFile::parse(
            "[omaha]\nchannel = beta-channel\ntarget_channel = stable-channel\napp_version = 9.9\n",
        )
        .unwrap();
        let params = config.request_params();
        assert_eq!(params.app_version, "9.9");
        assert_eq!(params.current_channel, "beta-channel");
        assert_eq!(params.target_channel, "stable-channel");
        assert!(params.to_more_stable_channel());
    }

    #[test]
    fn test_empty_policy_section_is_enterprise() {
        let config = ConfigFile::parse("[policy]\n").unwrap();
        assert!(config.policy.unwrap().is_enterprise_enrolled());
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = ConfigFile::parse("[boot]\nnum_slots = many\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue { section: "boot", key: "num_slots", .. }
        ));

        let err = ConfigFile::parse("[p2p]\nenabled = maybe\n").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "enabled", .. }));
    }

    #[test]
    fn test_load_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[logging]\nlevel = debug\n").unwrap();

        let config = ConfigFile::load_from(&path).unwrap();
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_load_from_missing_file() {
        let temp = TempDir::new().unwrap();
        let err = ConfigFile::load_from(&temp.path().join("nope.ini")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
