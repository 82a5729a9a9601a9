//! Peer-to-peer payload sharing.
//!
//! While a device downloads a payload it can mirror the bytes into a shared
//! directory that a local server publishes to peers on the same network.
//! Devices that find a peer with the payload download from the peer instead
//! of the origin.
//!
//! # Shared files
//!
//! ```text
//! <dir>/<file_id>.ota.p2p.tmp   partial, not yet advertised
//! <dir>/<file_id>.ota.p2p       advertised to peers
//! <dir>/<file_id>.meta.json     expected final size
//! ```
//!
//! A file becomes visible (renamed away from `.tmp`) once it holds enough
//! bytes to be useful to a peer. Only the holder of an exclusive advisory
//! lock on the file writes to it.

mod manager;

pub use manager::{DirP2PManager, MAX_FILES_TO_KEEP, MAX_FILE_AGE};

use std::path::PathBuf;

use crate::system::prefs::{self, Prefs};
use crate::BoxFuture;

/// Extension of shared files.
pub const P2P_EXTENSION: &str = ".ota.p2p";

/// Extra extension of shared files not yet visible to peers.
pub const P2P_TMP_EXTENSION: &str = ".tmp";

/// Identifier of the shared file for a payload.
///
/// Derived from the payload hash and size so that two devices downloading
/// the same payload agree on the name.
pub fn file_id(payload_hash: &str, payload_size: u64) -> String {
    let sanitized: String = payload_hash
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect();
    format!("update_size_{}_hash_{}", payload_size, sanitized)
}

/// Bytes a peer must hold for this device to make progress from it.
///
/// A device resuming `payload_hash` needs everything up to its persisted
/// next data offset; otherwise any peer will do.
pub fn lookup_minimum_size(prefs: &dyn Prefs, payload_hash: &str) -> u64 {
    let resuming = prefs
        .get_string(prefs::UPDATE_CHECK_RESPONSE_HASH)
        .is_some_and(|hash| !hash.is_empty() && hash == payload_hash);
    if !resuming {
        return 0;
    }
    prefs
        .get_int64(prefs::UPDATE_STATE_NEXT_DATA_OFFSET)
        .filter(|offset| *offset > 0)
        .map_or(0, |offset| offset as u64)
}

/// Access to the local P2P cache and the peer lookup service.
pub trait P2PManager: Send + Sync {
    fn is_p2p_enabled(&self) -> bool;

    /// Start the local P2P server if needed.
    fn ensure_p2p_running(&self) -> BoxFuture<'_, bool>;

    /// Remove stale shared files.
    fn perform_housekeeping(&self) -> bool;

    fn count_shared_files(&self) -> usize;

    /// Create the shared file for `file_id`, or confirm an existing one
    /// agrees on `expected_size`.
    fn file_share(&self, file_id: &str, expected_size: u64) -> bool;

    fn file_get_path(&self, file_id: &str) -> Option<PathBuf>;

    fn file_get_size(&self, file_id: &str) -> Option<u64>;

    fn file_get_expected_size(&self, file_id: &str) -> Option<u64>;

    fn file_get_visible(&self, file_id: &str) -> Option<bool>;

    fn file_make_visible(&self, file_id: &str) -> bool;

    /// Delete the shared file and its metadata.
    fn file_remove(&self, file_id: &str) -> bool;

    /// Find a peer serving at least `minimum_size` bytes of `file_id`.
    fn lookup_url_for_file<'a>(
        &'a self,
        file_id: &'a str,
        minimum_size: u64,
    ) -> BoxFuture<'a, Option<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::prefs::MemoryPrefs;

    #[test]
    fn test_file_id_format() {
        assert_eq!(file_id("abc123", 42), "update_size_42_hash_abc123");
    }

    #[test]
    fn test_file_id_sanitizes_hash() {
        assert_eq!(file_id("a/b+c=", 1), "update_size_1_hash_a_b_c_");
    }

    #[test]
    fn test_lookup_minimum_size_follows_resume_offset() {
        let prefs = MemoryPrefs::new();
        assert_eq!(lookup_minimum_size(&prefs, "HASH"), 0);

        prefs.set_string(prefs::UPDATE_CHECK_RESPONSE_HASH, "HASH").unwrap();
        prefs.set_int64(prefs::UPDATE_STATE_NEXT_DATA_OFFSET, 4096).unwrap();
        assert_eq!(lookup_minimum_size(&prefs, "HASH"), 4096);
        assert_eq!(lookup_minimum_size(&prefs, "OTHER"), 0);

        prefs.set_int64(prefs::UPDATE_STATE_NEXT_DATA_OFFSET, -1).unwrap();
        assert_eq!(lookup_minimum_size(&prefs, "HASH"), 0);
    }
}
