//! The install plan: everything one update attempt needs to know.
//!
//! A plan is produced once, by the response handler (or synthesized for a
//! rollback), and then flows down the action pipeline. Later actions refine
//! it in place (source hashes, resolved device paths) but never rebuild it.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::system::boot_control::{slot_name, BootControl, Slot, INVALID_SLOT};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PayloadType {
    #[default]
    Unknown,
    Full,
    Delta,
}

impl fmt::Display for PayloadType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadType::Unknown => "unknown",
            PayloadType::Full => "full",
            PayloadType::Delta => "delta",
        };
        f.write_str(name)
    }
}

/// One partition touched by the update.
///
/// Hashes are raw SHA-256 digests. Paths are `None` until resolved against
/// a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partition {
    pub name: String,
    pub source_path: Option<PathBuf>,
    pub source_size: u64,
    pub source_hash: Vec<u8>,
    pub target_path: Option<PathBuf>,
    pub target_size: u64,
    pub target_hash: Vec<u8>,
    pub run_postinstall: bool,
    pub postinstall_path: String,
    pub filesystem_type: String,
}

impl Partition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InstallPlanError {
    #[error("source and target slot are both {}", slot_name(*.0))]
    SameSlot(Slot),
}

/// Description of one update attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPlan {
    pub is_resume: bool,
    pub payload_type: PayloadType,
    pub download_url: String,
    pub version: String,
    pub payload_size: u64,
    /// Lowercase hex SHA-256 of the payload, as supplied by the server.
    pub payload_hash: String,
    pub metadata_size: u64,
    pub metadata_signature: String,
    pub source_slot: Slot,
    pub target_slot: Slot,
    pub partitions: Vec<Partition>,
    pub hash_checks_mandatory: bool,
    pub powerwash_required: bool,
    pub public_key_rsa: String,
}

impl Default for InstallPlan {
    fn default() -> Self {
        Self {
            is_resume: false,
            payload_type: PayloadType::Unknown,
            download_url: String::new(),
            version: String::new(),
            payload_size: 0,
            payload_hash: String::new(),
            metadata_size: 0,
            metadata_signature: String::new(),
            source_slot: INVALID_SLOT,
            target_slot: INVALID_SLOT,
            partitions: Vec::new(),
            hash_checks_mandatory: false,
            powerwash_required: false,
            public_key_rsa: String::new(),
        }
    }
}

impl InstallPlan {
    /// Set both slots, refusing to point source and target at the same slot.
    pub fn set_slots(&mut self, source: Slot, target: Slot) -> Result<(), InstallPlanError> {
        if source != INVALID_SLOT && source == target {
            return Err(InstallPlanError::SameSlot(source));
        }
        self.source_slot = source;
        self.target_slot = target;
        Ok(())
    }

    /// Source and target differ whenever both are valid.
    pub fn has_valid_slots(&self) -> bool {
        self.source_slot == INVALID_SLOT
            || self.target_slot == INVALID_SLOT
            || self.source_slot != self.target_slot
    }

    /// Resolve partition device paths for the plan's slots.
    ///
    /// Returns false when a valid target slot has a partition that boot
    /// control cannot map. Unresolvable source partitions only lose their
    /// path, since a full payload does not need them.
    pub fn load_partitions_from_slots(&mut self, boot_control: &dyn BootControl) -> bool {
        let mut all_resolved = true;
        for partition in &mut self.partitions {
            partition.source_path = if self.source_slot == INVALID_SLOT {
                None
            } else {
                boot_control.partition_device(&partition.name, self.source_slot)
            };

            if self.target_slot == INVALID_SLOT {
                partition.target_path = None;
                continue;
            }
            partition.target_path =
                boot_control.partition_device(&partition.name, self.target_slot);
            if partition.target_path.is_none() {
                all_resolved = false;
            }
        }
        all_resolved
    }

    /// Log the full plan.
    pub fn dump(&self) {
        info!(
            is_resume = self.is_resume,
            payload_type = %self.payload_type,
            url = %self.download_url,
            version = %self.version,
            payload_size = self.payload_size,
            payload_hash = %self.payload_hash,
            metadata_size = self.metadata_size,
            source_slot = %slot_name(self.source_slot),
            target_slot = %slot_name(self.target_slot),
            hash_checks_mandatory = self.hash_checks_mandatory,
            powerwash_required = self.powerwash_required,
            "InstallPlan"
        );
        for partition in &self.partitions {
            info!(
                name = %partition.name,
                source = ?partition.source_path,
                source_size = partition.source_size,
                target = ?partition.target_path,
                target_size = partition.target_size,
                run_postinstall = partition.run_postinstall,
                "InstallPlan partition"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBootControl;
    use proptest::prelude::*;

    #[test]
    fn test_default_plan_has_invalid_slots() {
        let plan = InstallPlan::default();
        assert_eq!(plan.source_slot, INVALID_SLOT);
        assert_eq!(plan.target_slot, INVALID_SLOT);
        assert!(plan.has_valid_slots());
    }

    #[test]
    fn test_set_slots_rejects_same_slot() {
        let mut plan = InstallPlan::default();
        assert_eq!(plan.set_slots(1, 1), Err(InstallPlanError::SameSlot(1)));
        assert_eq!(plan.source_slot, INVALID_SLOT);
        assert!(plan.set_slots(0, 1).is_ok());
        assert_eq!((plan.source_slot, plan.target_slot), (0, 1));
    }

    #[test]
    fn test_load_partitions_from_slots() {
        let bc = FakeBootControl::new(2, 0);
        bc.set_partition_device("system", 0, "/dev/system_a");
        bc.set_partition_device("system", 1, "/dev/system_b");

        let mut plan = InstallPlan::default();
        plan.set_slots(0, 1).unwrap();
        plan.partitions.push(Partition::new("system"));

        assert!(plan.load_partitions_from_slots(&bc));
        assert_eq!(
            plan.partitions[0].source_path,
            Some(PathBuf::from("/dev/system_a"))
        );
        assert_eq!(
            plan.partitions[0].target_path,
            Some(PathBuf::from("/dev/system_b"))
        );
    }

    #[test]
    fn test_load_partitions_missing_target() {
        let bc = FakeBootControl::new(2, 0);
        bc.set_partition_device("system", 0, "/dev/system_a");

        let mut plan = InstallPlan::default();
        plan.set_slots(0, 1).unwrap();
        plan.partitions.push(Partition::new("system"));

        assert!(!plan.load_partitions_from_slots(&bc));
        assert!(plan.partitions[0].target_path.is_none());
    }

    #[test]
    fn test_load_partitions_without_source_slot() {
        let bc = FakeBootControl::new(2, 0);
        bc.set_partition_device("system", 1, "/dev/system_b");

        let mut plan = InstallPlan::default();
        plan.set_slots(INVALID_SLOT, 1).unwrap();
        plan.partitions.push(Partition::new("system"));

        assert!(plan.load_partitions_from_slots(&bc));
        assert!(plan.partitions[0].source_path.is_none());
    }

    fn slot() -> impl Strategy<Value = Slot> {
        prop_oneof![0u32..4, Just(INVALID_SLOT)]
    }

    proptest! {
        #[test]
        fn prop_set_slots_preserves_invariant(source in slot(), target in slot()) {
            let mut plan = InstallPlan::default();
            let result = plan.set_slots(source, target);
            prop_assert!(plan.has_valid_slots());
            if source != INVALID_SLOT && source == target {
                prop_assert!(result.is_err());
            } else {
                prop_assert_eq!(plan.source_slot, source);
                prop_assert_eq!(plan.target_slot, target);
            }
        }
    }
}
