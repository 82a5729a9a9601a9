//! Parameters sent with every update check.

use std::time::Duration;

/// Production update server.
pub const DEFAULT_OMAHA_URL: &str = "https://omaha.example.com/service/update2";

/// Autoupdate test server. Unofficial builds pointed here may skip hash checks.
pub const AU_TEST_OMAHA_URL: &str = "https://omaha-autest.example.com/service/update2";

/// Release channels, least stable first.
///
/// The order matters: moving to a channel with a higher index is moving to a
/// more stable channel, which requires a powerwash.
pub const CHANNELS: [&str; 4] = [
    "canary-channel",
    "dev-channel",
    "beta-channel",
    "stable-channel",
];

/// Minimum number of update checks before a scattered update may proceed.
pub const MIN_UPDATE_CHECKS: i64 = 3;

/// Maximum number of update checks before a scattered update must proceed.
pub const MAX_UPDATE_CHECKS: i64 = 8;

/// Stability index of a channel, or `None` for unknown channels.
///
/// Both `stable-channel` and the bare `stable` are accepted.
pub fn channel_index(channel: &str) -> Option<usize> {
    let channel = channel.trim();
    CHANNELS
        .iter()
        .position(|known| *known == channel || known.strip_suffix("-channel") == Some(channel))
}

/// Whether switching from `current` to `target` moves to a more stable
/// channel. Unknown channels never count as more stable.
pub fn is_more_stable_channel(current: &str, target: &str) -> bool {
    match (channel_index(current), channel_index(target)) {
        (Some(current), Some(target)) => target > current,
        _ => false,
    }
}

/// Per-check request parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestParams {
    pub app_version: String,
    pub current_channel: String,
    pub target_channel: String,
    pub update_url: String,
    pub interactive: bool,
    pub delta_okay: bool,
    pub waiting_period: Duration,
    pub wall_clock_based_wait_enabled: bool,
    pub update_check_count_wait_enabled: bool,
    pub min_update_checks_needed: i64,
    pub max_update_checks_allowed: i64,
    pub use_p2p_for_downloading: bool,
    pub use_p2p_for_sharing: bool,
}

impl Default for RequestParams {
    fn default() -> Self {
        Self {
            app_version: String::new(),
            current_channel: CHANNELS[3].to_string(),
            target_channel: CHANNELS[3].to_string(),
            update_url: DEFAULT_OMAHA_URL.to_string(),
            interactive: false,
            delta_okay: true,
            waiting_period: Duration::ZERO,
            wall_clock_based_wait_enabled: false,
            update_check_count_wait_enabled: false,
            min_update_checks_needed: MIN_UPDATE_CHECKS,
            max_update_checks_allowed: MAX_UPDATE_CHECKS,
            use_p2p_for_downloading: false,
            use_p2p_for_sharing: false,
        }
    }
}

impl RequestParams {
    pub fn new(app_version: impl Into<String>, channel: impl Into<String>) -> Self {
        let channel = channel.into();
        Self {
            app_version: app_version.into(),
            current_channel: channel.clone(),
            target_channel: channel,
            ..Default::default()
        }
    }

    /// Builder-style setter for the update URL.
    pub fn with_update_url(mut self, url: impl Into<String>) -> Self {
        self.update_url = url.into();
        self
    }

    pub fn is_update_url_official(&self) -> bool {
        self.update_url.is_empty() || self.update_url == DEFAULT_OMAHA_URL
    }

    pub fn is_au_test_url(&self, url: &str) -> bool {
        url == AU_TEST_OMAHA_URL
    }

    pub fn to_more_stable_channel(&self) -> bool {
        is_more_stable_channel(&self.current_channel, &self.target_channel)
    }

    /// Change the target channel. Unknown channels are rejected.
    pub fn set_target_channel(&mut self, channel: &str) -> bool {
        match channel_index(channel) {
            Some(index) => {
                self.target_channel = CHANNELS[index].to_string();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_channel_index() {
        assert_eq!(channel_index("canary-channel"), Some(0));
        assert_eq!(channel_index("dev-channel"), Some(1));
        assert_eq!(channel_index("beta"), Some(2));
        assert_eq!(channel_index("stable-channel"), Some(3));
        assert_eq!(channel_index("foo-channel"), None);
        assert_eq!(channel_index(""), None);
    }

    #[test]
    fn test_more_stable_channel() {
        assert!(is_more_stable_channel("canary-channel", "stable-channel"));
        assert!(is_more_stable_channel("beta-channel", "stable-channel"));
        assert!(!is_more_stable_channel("stable-channel", "beta-channel"));
        assert!(!is_more_stable_channel("beta-channel", "beta-channel"));
        assert!(!is_more_stable_channel("foo-channel", "stable-channel"));
        assert!(!is_more_stable_channel("canary-channel", "foo-channel"));
    }

    #[test]
    fn test_set_target_channel() {
        let mut params = RequestParams::new("1.0.0", "beta-channel");
        assert!(params.set_target_channel("stable"));
        assert_eq!(params.target_channel, "stable-channel");
        assert!(params.to_more_stable_channel());
        assert!(!params.set_target_channel("nightly"));
        assert_eq!(params.target_channel, "stable-channel");
    }

    #[test]
    fn test_official_url() {
        let params = RequestParams::new("1.0.0", "stable-channel");
        assert!(params.is_update_url_official());
        let params = params.with_update_url(AU_TEST_OMAHA_URL);
        assert!(!params.is_update_url_official());
        assert!(params.is_au_test_url(AU_TEST_OMAHA_URL));
    }

    fn known_channel() -> impl Strategy<Value = &'static str> {
        prop::sample::select(CHANNELS.to_vec())
    }

    proptest! {
        #[test]
        fn prop_powerwash_iff_strictly_more_stable(
            current in known_channel(),
            target in known_channel(),
        ) {
            let expected = channel_index(target) > channel_index(current);
            prop_assert_eq!(is_more_stable_channel(current, target), expected);
        }

        #[test]
        fn prop_unknown_channel_never_more_stable(
            channel in known_channel(),
            unknown in "[a-z]{1,8}-nightly",
        ) {
            prop_assert!(!is_more_stable_channel(channel, &unknown));
            prop_assert!(!is_more_stable_channel(&unknown, channel));
        }

        #[test]
        fn prop_more_stable_is_antisymmetric(
            a in known_channel(),
            b in known_channel(),
        ) {
            prop_assert!(!(is_more_stable_channel(a, b) && is_more_stable_channel(b, a)));
        }
    }
}
