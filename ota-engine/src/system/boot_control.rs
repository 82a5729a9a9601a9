//! A/B slot boot control.
//!
//! A device has `num_slots` copies of each partition. One slot is running,
//! the other is the install target. Slot indices are plain `u32` with
//! [`INVALID_SLOT`] as the "none" sentinel.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, warn};

use super::prefs::{self, Prefs};

/// Slot index.
pub type Slot = u32;

/// Sentinel for "no slot".
pub const INVALID_SLOT: Slot = u32::MAX;

/// Human-readable slot name: `A`, `B`, ... or `INVALID`.
pub fn slot_name(slot: Slot) -> String {
    if slot < 26 {
        char::from(b'A' + slot as u8).to_string()
    } else {
        "INVALID".to_string()
    }
}

/// Lowercase device suffix for a slot, e.g. `_a`.
pub fn slot_suffix(slot: Slot) -> Option<String> {
    (slot < 26).then(|| format!("_{}", char::from(b'a' + slot as u8)))
}

/// Access to the device's slot layout and boot flags.
pub trait BootControl: Send + Sync {
    fn num_slots(&self) -> u32;

    fn current_slot(&self) -> Slot;

    /// Block device backing `partition` in `slot`.
    fn partition_device(&self, partition: &str, slot: Slot) -> Option<PathBuf>;

    fn is_slot_bootable(&self, slot: Slot) -> bool;

    /// Returns false when the flag could not be changed.
    fn set_slot_bootable(&self, slot: Slot, bootable: bool) -> bool;

    /// Returns false when the flag could not be changed.
    fn set_active_boot_slot(&self, slot: Slot) -> bool;
}

/// Boot control over a by-name device directory.
///
/// Partitions resolve to `<device_dir>/<name>_<suffix>`. Bootable and active
/// flags are kept in prefs because there is no bootloader interface to
/// write them to.
pub struct DeviceBootControl {
    num_slots: u32,
    current_slot: Slot,
    device_dir: PathBuf,
    prefs: Arc<dyn Prefs>,
}

impl DeviceBootControl {
    pub fn new(
        num_slots: u32,
        current_slot: Option<Slot>,
        device_dir: impl Into<PathBuf>,
        prefs: Arc<dyn Prefs>,
    ) -> Self {
        let current_slot = current_slot
            .or_else(detect_current_slot)
            .filter(|slot| *slot < num_slots)
            .unwrap_or(INVALID_SLOT);
        Self {
            num_slots,
            current_slot,
            device_dir: device_dir.into(),
            prefs,
        }
    }

    fn unbootable_key(slot: Slot) -> String {
        format!("{}{}", prefs::SLOT_UNBOOTABLE_PREFIX, slot)
    }
}

/// Read the running slot from the kernel command line.
fn detect_current_slot() -> Option<Slot> {
    let cmdline = fs::read_to_string("/proc/cmdline").ok()?;
    let suffix = cmdline
        .split_whitespace()
        .find_map(|arg| arg.strip_prefix("androidboot.slot_suffix=_"))?;
    let letter = suffix.chars().next()?;
    if letter.is_ascii_lowercase() {
        Some(u32::from(letter as u8 - b'a'))
    } else {
        None
    }
}

impl BootControl for DeviceBootControl {
    fn num_slots(&self) -> u32 {
        self.num_slots
    }

    fn current_slot(&self) -> Slot {
        self.current_slot
    }

    fn partition_device(&self, partition: &str, slot: Slot) -> Option<PathBuf> {
        if slot >= self.num_slots {
            return None;
        }
        let suffix = slot_suffix(slot)?;
        Some(self.device_dir.join(format!("{}{}", partition, suffix)))
    }

    fn is_slot_bootable(&self, slot: Slot) -> bool {
        slot < self.num_slots && !self.prefs.exists(&Self::unbootable_key(slot))
    }

    fn set_slot_bootable(&self, slot: Slot, bootable: bool) -> bool {
        if slot >= self.num_slots {
            return false;
        }
        let key = Self::unbootable_key(slot);
        let result = if bootable {
            self.prefs.delete(&key)
        } else {
            self.prefs.set_bool(&key, true)
        };
        match result {
            Ok(()) => {
                debug!(slot = %slot_name(slot), bootable, "Slot bootable flag updated");
                true
            }
            Err(e) => {
                warn!(slot = %slot_name(slot), error = %e, "Failed to update bootable flag");
                false
            }
        }
    }

    fn set_active_boot_slot(&self, slot: Slot) -> bool {
        if slot >= self.num_slots {
            return false;
        }
        self.prefs
            .set_int64(prefs::ACTIVE_BOOT_SLOT, i64::from(slot))
            .map_err(|e| warn!(error = %e, "Failed to record active slot"))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::prefs::MemoryPrefs;

    fn boot_control() -> DeviceBootControl {
        DeviceBootControl::new(2, Some(0), "/dev/block/by-name", Arc::new(MemoryPrefs::new()))
    }

    #[test]
    fn test_slot_names() {
        assert_eq!(slot_name(0), "A");
        assert_eq!(slot_name(1), "B");
        assert_eq!(slot_name(INVALID_SLOT), "INVALID");
    }

    #[test]
    fn test_partition_device_paths() {
        let bc = boot_control();
        assert_eq!(
            bc.partition_device("system", 1),
            Some(PathBuf::from("/dev/block/by-name/system_b"))
        );
        assert_eq!(bc.partition_device("system", 2), None);
        assert_eq!(bc.partition_device("system", INVALID_SLOT), None);
    }

    #[test]
    fn test_bootable_flags() {
        let bc = boot_control();
        assert!(bc.is_slot_bootable(1));
        assert!(bc.set_slot_bootable(1, false));
        assert!(!bc.is_slot_bootable(1));
        assert!(bc.set_slot_bootable(1, true));
        assert!(bc.is_slot_bootable(1));
        assert!(!bc.set_slot_bootable(5, true));
    }

    #[test]
    fn test_current_slot_out_of_range_is_invalid() {
        let bc = DeviceBootControl::new(2, Some(3), "/dev", Arc::new(MemoryPrefs::new()));
        assert_eq!(bc.current_slot(), INVALID_SLOT);
    }
}
