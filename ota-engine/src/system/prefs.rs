//! Persistent key/value preferences.
//!
//! Prefs are the engine's only durable state between attempts and across
//! reboots: the resume offset, scatter counters, the pending error event and
//! so on. Two stores are provided:
//!
//! - [`FilePrefs`]: one file per key under a directory, replaced atomically.
//! - [`MemoryPrefs`]: in-process map, used by tests and dry runs.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use thiserror::Error;

// =============================================================================
// Keys
// =============================================================================

pub const UPDATE_CHECK_RESPONSE_HASH: &str = "update-check-response-hash";
pub const UPDATE_STATE_NEXT_DATA_OFFSET: &str = "update-state-next-data-offset";
pub const RESUMED_UPDATE_FAILURES: &str = "resumed-update-failures";
pub const DELTA_UPDATE_FAILURES: &str = "delta-update-failures";
pub const UPDATE_CHECK_COUNT: &str = "update-check-count";
pub const WALL_CLOCK_WAIT_PERIOD: &str = "wall-clock-wait-period";
pub const UPDATE_FIRST_SEEN_AT: &str = "update-first-seen-at";
pub const DAILY_METRICS_LAST_REPORTED_AT: &str = "daily-metrics-last-reported-at";
pub const UPDATE_COMPLETED_ON_BOOT_ID: &str = "update-completed-on-boot-id";
pub const UPDATE_COMPLETED_BOOT_TIME: &str = "update-completed-boot-time";
pub const PENDING_ERROR_EVENT: &str = "pending-error-event";
pub const CURRENT_URL_INDEX: &str = "current-url-index";
pub const CURRENT_URL_FAILURE_COUNT: &str = "current-url-failure-count";
pub const CURRENT_RESPONSE_SIGNATURE: &str = "current-response-signature";
pub const PREVIOUS_VERSION: &str = "previous-version";
pub const P2P_ENABLED: &str = "p2p-enabled";
pub const P2P_NUM_ATTEMPTS: &str = "p2p-num-attempts";
pub const P2P_FIRST_ATTEMPTED_AT: &str = "p2p-first-attempted-at";
pub const ACTIVE_BOOT_SLOT: &str = "active-boot-slot";

/// Prefix for per-slot "unbootable" markers kept by the device boot control.
pub const SLOT_UNBOOTABLE_PREFIX: &str = "slot-unbootable-";

/// Errors from the preferences store.
#[derive(Debug, Error)]
pub enum PrefsError {
    #[error("invalid preference key: {0:?}")]
    InvalidKey(String),

    #[error("failed to write preference {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to delete preference {key}: {source}")]
    Delete {
        key: String,
        #[source]
        source: io::Error,
    },
}

/// Durable key/value store.
///
/// Getters return `None` both for missing keys and for values that do not
/// parse as the requested type; callers that need to tell the two apart pair
/// the getter with [`Prefs::exists`].
pub trait Prefs: Send + Sync {
    fn get_string(&self, key: &str) -> Option<String>;

    fn set_string(&self, key: &str, value: &str) -> Result<(), PrefsError>;

    fn exists(&self, key: &str) -> bool;

    fn delete(&self, key: &str) -> Result<(), PrefsError>;

    fn get_int64(&self, key: &str) -> Option<i64> {
        self.get_string(key)
            .and_then(|value| value.trim().parse::<i64>().ok())
    }

    fn set_int64(&self, key: &str, value: i64) -> Result<(), PrefsError> {
        self.set_string(key, &value.to_string())
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get_string(key)?.trim() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        }
    }

    fn set_bool(&self, key: &str, value: bool) -> Result<(), PrefsError> {
        self.set_string(key, if value { "true" } else { "false" })
    }
}

fn validate_key(key: &str) -> Result<(), PrefsError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(PrefsError::InvalidKey(key.to_string()))
    }
}

// =============================================================================
// File-backed store
// =============================================================================

/// Preferences stored as one file per key.
#[derive(Debug, Clone)]
pub struct FilePrefs {
    dir: PathBuf,
}

impl FilePrefs {
    /// Open (and create if needed) a prefs directory.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }
}

impl Prefs for FilePrefs {
    fn get_string(&self, key: &str) -> Option<String> {
        validate_key(key).ok()?;
        fs::read_to_string(self.path_for(key)).ok()
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        validate_key(key)?;
        let path = self.path_for(key);
        let tmp = self.dir.join(format!(".{}.tmp", key));
        let write_err = |source| PrefsError::Write {
            key: key.to_string(),
            source,
        };
        fs::write(&tmp, value).map_err(write_err)?;
        fs::rename(&tmp, &path).map_err(write_err)
    }

    fn exists(&self, key: &str) -> bool {
        validate_key(key).is_ok() && self.path_for(key).is_file()
    }

    fn delete(&self, key: &str) -> Result<(), PrefsError> {
        validate_key(key)?;
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PrefsError::Delete {
                key: key.to_string(),
                source,
            }),
        }
    }
}

// =============================================================================
// In-memory store
// =============================================================================

/// Preferences held in memory only.
#[derive(Debug, Default)]
pub struct MemoryPrefs {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryPrefs {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Prefs for MemoryPrefs {
    fn get_string(&self, key: &str) -> Option<String> {
        self.values.lock().get(key).cloned()
    }

    fn set_string(&self, key: &str, value: &str) -> Result<(), PrefsError> {
        validate_key(key)?;
        self.values.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn exists(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    fn delete(&self, key: &str) -> Result<(), PrefsError> {
        self.values.lock().remove(key);
        Ok(())
    }
}
