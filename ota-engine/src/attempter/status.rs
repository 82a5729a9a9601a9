//! Attempt status and the snapshots broadcast to observers.

use std::fmt;

use chrono::{DateTime, Utc};

/// Where the attempter is in an update or rollback.
///
/// Ordered: later variants are further along, which lets callers ask
/// "has the attempt reached the download yet" with a comparison.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum UpdateStatus {
    #[default]
    Idle,
    CheckingForUpdate,
    UpdateAvailable,
    Downloading,
    Verifying,
    Finalizing,
    UpdatedNeedReboot,
    ReportingErrorEvent,
    AttemptingRollback,
    Disabled,
}

impl UpdateStatus {
    pub fn name(self) -> &'static str {
        match self {
            UpdateStatus::Idle => "UPDATE_STATUS_IDLE",
            UpdateStatus::CheckingForUpdate => "UPDATE_STATUS_CHECKING_FOR_UPDATE",
            UpdateStatus::UpdateAvailable => "UPDATE_STATUS_UPDATE_AVAILABLE",
            UpdateStatus::Downloading => "UPDATE_STATUS_DOWNLOADING",
            UpdateStatus::Verifying => "UPDATE_STATUS_VERIFYING",
            UpdateStatus::Finalizing => "UPDATE_STATUS_FINALIZING",
            UpdateStatus::UpdatedNeedReboot => "UPDATE_STATUS_UPDATED_NEED_REBOOT",
            UpdateStatus::ReportingErrorEvent => "UPDATE_STATUS_REPORTING_ERROR_EVENT",
            UpdateStatus::AttemptingRollback => "UPDATE_STATUS_ATTEMPTING_ROLLBACK",
            UpdateStatus::Disabled => "UPDATE_STATUS_DISABLED",
        }
    }
}

impl fmt::Display for UpdateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Point-in-time view of the attempter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatusSnapshot {
    pub status: UpdateStatus,
    /// Download progress in `[0.0, 1.0]`.
    pub progress: f64,
    pub bytes_received: u64,
    pub total_bytes: u64,
    pub new_version: String,
    pub new_size: u64,
    pub last_checked_time: Option<DateTime<Utc>>,
}

impl fmt::Display for StatusSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if self.status == UpdateStatus::Downloading {
            write!(f, " {:.1}%", self.progress * 100.0)?;
        }
        if !self.new_version.is_empty() {
            write!(f, " (version {}, {} bytes)", self.new_version, self.new_size)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_order() {
        assert!(UpdateStatus::Idle < UpdateStatus::CheckingForUpdate);
        assert!(UpdateStatus::Downloading < UpdateStatus::Finalizing);
        assert!(UpdateStatus::Finalizing >= UpdateStatus::Downloading);
        assert!(UpdateStatus::UpdateAvailable < UpdateStatus::Downloading);
    }

    #[test]
    fn test_snapshot_display() {
        let snapshot = StatusSnapshot {
            status: UpdateStatus::Downloading,
            progress: 0.25,
            new_version: "2.0".into(),
            new_size: 400,
            ..Default::default()
        };
        assert_eq!(
            snapshot.to_string(),
            "UPDATE_STATUS_DOWNLOADING 25.0% (version 2.0, 400 bytes)"
        );
        assert_eq!(StatusSnapshot::default().to_string(), "UPDATE_STATUS_IDLE");
    }
}
