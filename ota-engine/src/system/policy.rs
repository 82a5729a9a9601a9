//! Device policy values.
//!
//! Loading policy blobs is someone else's job; the engine only consumes the
//! few values below.

use std::time::Duration;

/// Policy knobs honored by the update engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevicePolicy {
    /// Maximum random delay before downloading a found update, in seconds.
    /// Negative values are treated as zero.
    pub scatter_factor_in_seconds: i64,

    /// Device owner. `None` or empty means the device is enterprise
    /// enrolled.
    pub owner: Option<String>,

    /// Explicit P2P setting, overriding the local preference.
    pub p2p_enabled: Option<bool>,

    /// Updates are turned off. Rollback stays available.
    pub update_disabled: bool,
}

impl DevicePolicy {
    pub fn is_enterprise_enrolled(&self) -> bool {
        self.owner.as_deref().map_or(true, str::is_empty)
    }

    pub fn scatter_factor(&self) -> Duration {
        Duration::from_secs(self.scatter_factor_in_seconds.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enterprise_detection() {
        let mut policy = DevicePolicy::default();
        assert!(policy.is_enterprise_enrolled());
        policy.owner = Some(String::new());
        assert!(policy.is_enterprise_enrolled());
        policy.owner = Some("someone@example.com".into());
        assert!(!policy.is_enterprise_enrolled());
    }

    #[test]
    fn test_negative_scatter_factor_sanitized() {
        let policy = DevicePolicy {
            scatter_factor_in_seconds: -50,
            ..Default::default()
        };
        assert_eq!(policy.scatter_factor(), Duration::ZERO);
    }
}
