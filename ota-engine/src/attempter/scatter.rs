//! Update scattering.
//!
//! When policy sets a scatter factor, devices wait a random wall-clock
//! period and a random number of update checks before acting on a newly
//! found update, so a fleet does not hit the payload servers at once.
//!
//! | Pref                     | Meaning                                  |
//! |--------------------------|------------------------------------------|
//! | `wall-clock-wait-period` | chosen waiting period, seconds           |
//! | `update-check-count`     | checks left before the update may apply  |
//! | `update-first-seen-at`   | when the update was first seen, unix sec |
//!
//! The request action enforces both waits; this module only decides
//! whether they apply and keeps the persisted values sane.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::omaha::{RequestParams, MAX_UPDATE_CHECKS};
use crate::system::policy::DevicePolicy;
use crate::system::prefs::{self, Prefs};
use crate::system::SystemState;

/// Fill the scattering fields of `params`. Returns whether scattering is
/// on for this check.
pub(crate) fn apply_scattering(system: &SystemState, params: &mut RequestParams) -> bool {
    let prefs = system.prefs.as_ref();
    let scatter_factor = system
        .device_policy
        .as_ref()
        .map(DevicePolicy::scatter_factor)
        .unwrap_or(Duration::ZERO);

    let oobe_pending =
        system.hardware.is_oobe_enabled() && !system.hardware.is_oobe_complete();
    let enabled = !scatter_factor.is_zero() && !params.interactive && !oobe_pending;

    if !enabled {
        debug!(
            scatter_secs = scatter_factor.as_secs(),
            interactive = params.interactive,
            oobe_pending,
            "Scattering disabled"
        );
        delete_pref(prefs, prefs::WALL_CLOCK_WAIT_PERIOD);
        delete_pref(prefs, prefs::UPDATE_CHECK_COUNT);
        if params.interactive {
            delete_pref(prefs, prefs::UPDATE_FIRST_SEEN_AT);
        }
        params.waiting_period = Duration::ZERO;
        params.wall_clock_based_wait_enabled = false;
        params.update_check_count_wait_enabled = false;
        system.payload_state.set_scattering_wait_period(Duration::ZERO);
        return false;
    }

    let max_secs = scatter_factor.as_secs() as i64;
    let waiting_secs = match prefs.get_int64(prefs::WALL_CLOCK_WAIT_PERIOD) {
        Some(secs) if secs > 0 && secs <= max_secs => {
            debug!(waiting_secs = secs, "Reusing persisted waiting period");
            secs
        }
        _ => generate_waiting_period(prefs, max_secs),
    };

    params.waiting_period = Duration::from_secs(waiting_secs as u64);
    params.wall_clock_based_wait_enabled = true;
    params.update_check_count_wait_enabled = true;
    system
        .payload_state
        .set_scattering_wait_period(params.waiting_period);
    info!(
        scatter_secs = max_secs,
        waiting_secs, "Scattering enabled"
    );
    true
}

fn generate_waiting_period(prefs: &dyn Prefs, max_secs: i64) -> i64 {
    let secs = rand::rng().random_range(1..=max_secs.max(1));
    info!(waiting_secs = secs, "Generated new waiting period");
    if let Err(e) = prefs.set_int64(prefs::WALL_CLOCK_WAIT_PERIOD, secs) {
        warn!(error = %e, "Failed to persist waiting period");
    }
    secs
}

/// Count one scheduled check against the persisted check count.
///
/// Returns false when no count is being tracked. An unreadable or
/// out-of-range count is deleted.
pub fn decrement_update_check_count(prefs: &dyn Prefs) -> bool {
    if !prefs.exists(prefs::UPDATE_CHECK_COUNT) {
        return false;
    }

    if let Some(count) = prefs.get_int64(prefs::UPDATE_CHECK_COUNT) {
        let count = (count - 1).max(0);
        if count <= MAX_UPDATE_CHECKS {
            match prefs.set_int64(prefs::UPDATE_CHECK_COUNT, count) {
                Ok(()) => {
                    debug!(remaining = count, "Decremented update check count");
                    return true;
                }
                Err(e) => warn!(error = %e, "Failed to persist update check count"),
            }
        }
    }

    warn!("Deleting invalid update check count");
    delete_pref(prefs, prefs::UPDATE_CHECK_COUNT);
    false
}

fn delete_pref(prefs: &dyn Prefs, key: &str) {
    if let Err(e) = prefs.delete(key) {
        warn!(key, error = %e, "Failed to delete pref");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeSystem;

    fn policy(scatter_secs: i64) -> Option<DevicePolicy> {
        Some(DevicePolicy {
            scatter_factor_in_seconds: scatter_secs,
            owner: Some("owner@example.com".into()),
            ..Default::default()
        })
    }

    #[test]
    fn test_disabled_without_policy() {
        let fake = FakeSystem::new();
        fake.prefs.set_int64(prefs::UPDATE_CHECK_COUNT, 4).unwrap();
        let mut params = RequestParams::default();

        assert!(!apply_scattering(&fake.system_state(), &mut params));
        assert!(!params.wall_clock_based_wait_enabled);
        assert!(!params.update_check_count_wait_enabled);
        assert_eq!(params.waiting_period, Duration::ZERO);
        assert!(!fake.prefs.exists(prefs::UPDATE_CHECK_COUNT));
    }

    #[test]
    fn test_negative_factor_disables() {
        let fake = FakeSystem::new();
        fake.set_policy(policy(-10));
        let mut params = RequestParams::default();
        assert!(!apply_scattering(&fake.system_state(), &mut params));
    }

    #[test]
    fn test_interactive_deletes_artifacts() {
        let fake = FakeSystem::new();
        fake.set_policy(policy(3600));
        fake.prefs.set_int64(prefs::WALL_CLOCK_WAIT_PERIOD, 100).unwrap();
        fake.prefs.set_int64(prefs::UPDATE_CHECK_COUNT, 4).unwrap();
        fake.prefs.set_int64(prefs::UPDATE_FIRST_SEEN_AT, 1000).unwrap();
        let mut params = RequestParams {
            interactive: true,
            ..Default::default()
        };

        assert!(!apply_scattering(&fake.system_state(), &mut params));
        assert!(!fake.prefs.exists(prefs::WALL_CLOCK_WAIT_PERIOD));
        assert!(!fake.prefs.exists(prefs::UPDATE_CHECK_COUNT));
        assert!(!fake.prefs.exists(prefs::UPDATE_FIRST_SEEN_AT));
    }

    #[test]
    fn test_oobe_pending_disables() {
        let fake = FakeSystem::new();
        fake.set_policy(policy(3600));
        fake.hardware.set_oobe(true, false);
        let mut params = RequestParams::default();
        assert!(!apply_scattering(&fake.system_state(), &mut params));
    }

    #[test]
    fn test_reuses_valid_waiting_period() {
        let fake = FakeSystem::new();
        fake.set_policy(policy(3600));
        fake.prefs.set_int64(prefs::WALL_CLOCK_WAIT_PERIOD, 120).unwrap();
        let mut params = RequestParams::default();

        assert!(apply_scattering(&fake.system_state(), &mut params));
        assert_eq!(params.waiting_period, Duration::from_secs(120));
        assert!(params.wall_clock_based_wait_enabled);
        assert!(params.update_check_count_wait_enabled);
    }

    #[test]
    fn test_regenerates_out_of_range_waiting_period() {
        let fake = FakeSystem::new();
        fake.set_policy(policy(60));
        fake.prefs.set_int64(prefs::WALL_CLOCK_WAIT_PERIOD, 7200).unwrap();
        let mut params = RequestParams::default();

        assert!(apply_scattering(&fake.system_state(), &mut params));
        let secs = params.waiting_period.as_secs();
        assert!((1..=60).contains(&secs));
        assert_eq!(
            fake.prefs.get_int64(prefs::WALL_CLOCK_WAIT_PERIOD),
            Some(secs as i64)
        );
    }

    #[test]
    fn test_decrement_update_check_count() {
        let fake = FakeSystem::new();
        let prefs = fake.prefs.as_ref();
        assert!(!decrement_update_check_count(prefs));

        prefs.set_int64(prefs::UPDATE_CHECK_COUNT, 2).unwrap();
        assert!(decrement_update_check_count(prefs));
        assert_eq!(prefs.get_int64(prefs::UPDATE_CHECK_COUNT), Some(1));
        assert!(decrement_update_check_count(prefs));
        assert!(decrement_update_check_count(prefs));
        assert_eq!(prefs.get_int64(prefs::UPDATE_CHECK_COUNT), Some(0));
    }

    #[test]
    fn test_decrement_deletes_invalid_count() {
        let fake = FakeSystem::new();
        let prefs = fake.prefs.as_ref();

        prefs.set_string(prefs::UPDATE_CHECK_COUNT, "garbage").unwrap();
        assert!(!decrement_update_check_count(prefs));
        assert!(!prefs.exists(prefs::UPDATE_CHECK_COUNT));

        prefs.set_int64(prefs::UPDATE_CHECK_COUNT, 50).unwrap();
        assert!(!decrement_update_check_count(prefs));
        assert!(!prefs.exists(prefs::UPDATE_CHECK_COUNT));
    }
}
