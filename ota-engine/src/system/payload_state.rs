//! Per-payload bookkeeping across attempts.
//!
//! Payload state remembers which of the response's URLs is in use, how many
//! times it has failed, and whether the current attempt uses peers. It is the
//! retry policy's memory: the attempter reports each failure here and the
//! next attempt picks up whatever URL this decides on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::{info, warn};

use super::prefs::{self, Prefs};
use crate::error::ErrorCode;
use crate::omaha::OmahaResponse;

/// Transfer failures tolerated on one URL before moving to the next.
pub const MAX_URL_FAILURES: i64 = 10;

/// Peer download attempts allowed for one payload.
pub const MAX_P2P_ATTEMPTS: i64 = 10;

/// Peers are given up on this long after the first peer attempt.
pub const MAX_P2P_ATTEMPT_PERIOD: TimeDelta = TimeDelta::days(5);

/// Payload bookkeeping used by the actions and the attempter.
pub trait PayloadState: Send + Sync {
    /// Record a fresh response. A response with different payloads resets
    /// URL rotation.
    fn set_response(&self, response: &OmahaResponse);

    /// URL to download from, or empty when there is none.
    fn current_url(&self) -> String;

    fn update_failed(&self, code: ErrorCode);

    fn update_resumed(&self);

    fn update_restarted(&self);

    fn update_succeeded(&self);

    fn using_p2p_for_downloading(&self) -> bool;

    fn set_using_p2p_for_downloading(&self, value: bool);

    fn using_p2p_for_sharing(&self) -> bool;

    fn set_using_p2p_for_sharing(&self, value: bool);

    fn p2p_url(&self) -> String;

    fn set_p2p_url(&self, url: &str);

    fn scattering_wait_period(&self) -> Duration;

    fn set_scattering_wait_period(&self, period: Duration);

    /// Count a peer download attempt for the current payload, made at `now`.
    fn p2p_new_attempt(&self, now: DateTime<Utc>);

    /// Whether the current payload may still be fetched from peers.
    fn p2p_attempt_allowed(&self, now: DateTime<Utc>) -> bool;
}

#[derive(Debug, Default)]
struct Inner {
    urls: Vec<String>,
    url_index: usize,
    url_failure_count: i64,
    num_resumes: u32,
    using_p2p_for_downloading: bool,
    using_p2p_for_sharing: bool,
    p2p_url: String,
    scattering_wait_period: Duration,
}

/// Payload state persisted through prefs.
pub struct DefaultPayloadState {
    prefs: Arc<dyn Prefs>,
    inner: Mutex<Inner>,
}

impl DefaultPayloadState {
    pub fn new(prefs: Arc<dyn Prefs>) -> Self {
        let url_index = prefs
            .get_int64(prefs::CURRENT_URL_INDEX)
            .filter(|index| *index >= 0)
            .unwrap_or(0) as usize;
        let url_failure_count = prefs
            .get_int64(prefs::CURRENT_URL_FAILURE_COUNT)
            .filter(|count| *count >= 0)
            .unwrap_or(0);
        Self {
            prefs,
            inner: Mutex::new(Inner {
                url_index,
                url_failure_count,
                ..Default::default()
            }),
        }
    }

    pub fn url_index(&self) -> usize {
        self.inner.lock().url_index
    }

    pub fn url_failure_count(&self) -> i64 {
        self.inner.lock().url_failure_count
    }

    pub fn num_resumes(&self) -> u32 {
        self.inner.lock().num_resumes
    }

    pub fn p2p_num_attempts(&self) -> i64 {
        self.prefs
            .get_int64(prefs::P2P_NUM_ATTEMPTS)
            .filter(|count| *count >= 0)
            .unwrap_or(0)
    }

    pub fn p2p_first_attempted_at(&self) -> Option<DateTime<Utc>> {
        self.prefs
            .get_int64(prefs::P2P_FIRST_ATTEMPTED_AT)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    fn reset_p2p_attempts(&self) {
        for key in [prefs::P2P_NUM_ATTEMPTS, prefs::P2P_FIRST_ATTEMPTED_AT] {
            if let Err(e) = self.prefs.delete(key) {
                warn!(key, error = %e, "Failed to clear P2P attempt state");
            }
        }
    }

    fn response_signature(response: &OmahaResponse) -> String {
        format!(
            "urls={};size={};hash={};delta={}",
            response.payload_urls.join(","),
            response.size,
            response.hash,
            response.is_delta_payload
        )
    }

    fn persist(&self, inner: &Inner) {
        let index = self
            .prefs
            .set_int64(prefs::CURRENT_URL_INDEX, inner.url_index as i64);
        let count = self
            .prefs
            .set_int64(prefs::CURRENT_URL_FAILURE_COUNT, inner.url_failure_count);
        if let Err(e) = index.and(count) {
            warn!(error = %e, "Failed to persist payload state");
        }
    }

    fn increment_url_index(&self, inner: &mut Inner) {
        inner.url_index += 1;
        if inner.url_index >= inner.urls.len() {
            inner.url_index = 0;
        }
        inner.url_failure_count = 0;
        info!(url_index = inner.url_index, "Moving to next payload URL");
    }
}

impl PayloadState for DefaultPayloadState {
    fn set_response(&self, response: &OmahaResponse) {
        let signature = Self::response_signature(response);
        let mut inner = self.inner.lock();
        inner.urls = response.payload_urls.clone();

        let previous = self.prefs.get_string(prefs::CURRENT_RESPONSE_SIGNATURE);
        if previous.as_deref() != Some(signature.as_str()) {
            info!("New payload response, resetting URL rotation");
            inner.url_index = 0;
            inner.url_failure_count = 0;
            inner.num_resumes = 0;
            self.reset_p2p_attempts();
            if let Err(e) = self
                .prefs
                .set_string(prefs::CURRENT_RESPONSE_SIGNATURE, &signature)
            {
                warn!(error = %e, "Failed to persist response signature");
            }
        }
        if inner.url_index >= inner.urls.len() {
            inner.url_index = 0;
        }
        self.persist(&inner);
    }

    fn current_url(&self) -> String {
        let inner = self.inner.lock();
        inner
            .urls
            .get(inner.url_index)
            .cloned()
            .unwrap_or_default()
    }

    fn update_failed(&self, code: ErrorCode) {
        let mut inner = self.inner.lock();

        // A failed peer download falls back to HTTP next time.
        if inner.using_p2p_for_downloading {
            inner.using_p2p_for_downloading = false;
            inner.p2p_url.clear();
        }

        match code {
            ErrorCode::PayloadHashMismatchError
            | ErrorCode::PayloadSizeMismatchError
            | ErrorCode::DownloadPayloadVerificationError => {
                info!(%code, "Payload error, not retrying this URL");
                self.increment_url_index(&mut inner);
            }
            ErrorCode::DownloadTransferError
            | ErrorCode::DownloadWriteError
            | ErrorCode::DownloadStateInitializationError
            | ErrorCode::FilesystemVerifierError
            | ErrorCode::PostinstallRunnerError
            | ErrorCode::InstallDeviceOpenError
            | ErrorCode::NewRootfsVerificationError => {
                inner.url_failure_count += 1;
                info!(%code, failures = inner.url_failure_count, "Counted URL failure");
                if inner.url_failure_count >= MAX_URL_FAILURES {
                    self.increment_url_index(&mut inner);
                }
            }
            _ => {
                info!(%code, "Failure not attributed to the payload URL");
            }
        }
        self.persist(&inner);
    }

    fn update_resumed(&self) {
        self.inner.lock().num_resumes += 1;
    }

    fn update_restarted(&self) {
        self.inner.lock().num_resumes = 0;
    }

    fn update_succeeded(&self) {
        let mut inner = self.inner.lock();
        inner.url_index = 0;
        inner.url_failure_count = 0;
        inner.num_resumes = 0;
        self.persist(&inner);
        self.reset_p2p_attempts();
    }

    fn using_p2p_for_downloading(&self) -> bool {
        self.inner.lock().using_p2p_for_downloading
    }

    fn set_using_p2p_for_downloading(&self, value: bool) {
        let mut inner = self.inner.lock();
        inner.using_p2p_for_downloading = value;
        if !value {
            inner.p2p_url.clear();
        }
    }

    fn using_p2p_for_sharing(&self) -> bool {
        self.inner.lock().using_p2p_for_sharing
    }

    fn set_using_p2p_for_sharing(&self, value: bool) {
        self.inner.lock().using_p2p_for_sharing = value;
    }

    fn p2p_url(&self) -> String {
        self.inner.lock().p2p_url.clone()
    }

    fn set_p2p_url(&self, url: &str) {
        self.inner.lock().p2p_url = url.to_string();
    }

    fn scattering_wait_period(&self) -> Duration {
        self.inner.lock().scattering_wait_period
    }

    fn set_scattering_wait_period(&self, period: Duration) {
        self.inner.lock().scattering_wait_period = period;
    }

    fn p2p_new_attempt(&self, now: DateTime<Utc>) {
        if self.p2p_first_attempted_at().is_none() {
            if let Err(e) = self
                .prefs
                .set_int64(prefs::P2P_FIRST_ATTEMPTED_AT, now.timestamp())
            {
                warn!(error = %e, "Failed to persist first P2P attempt time");
            }
        }
        let attempts = self.p2p_num_attempts() + 1;
        if let Err(e) = self.prefs.set_int64(prefs::P2P_NUM_ATTEMPTS, attempts) {
            warn!(error = %e, "Failed to persist P2P attempt count");
        }
    }

    fn p2p_attempt_allowed(&self, now: DateTime<Utc>) -> bool {
        let attempts = self.p2p_num_attempts();
        if attempts > MAX_P2P_ATTEMPTS {
            info!(attempts, "P2P attempt limit reached");
            return false;
        }
        if let Some(first) = self.p2p_first_attempted_at() {
            let spent = now - first;
            if spent < TimeDelta::zero() {
                warn!(
                    spent_secs = spent.num_seconds(),
                    "First P2P attempt is in the future, not using peers"
                );
                return false;
            }
            if spent > MAX_P2P_ATTEMPT_PERIOD {
                info!(spent_secs = spent.num_seconds(), "P2P attempt period expired");
                return false;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::prefs::MemoryPrefs;

    fn response(urls: &[&str]) -> OmahaResponse {
        OmahaResponse {
            update_exists: true,
            payload_urls: urls.iter().map(|u| u.to_string()).collect(),
            size: 100,
            hash: "abc".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_current_url_follows_response() {
        let state = DefaultPayloadState::new(Arc::new(MemoryPrefs::new()));
        assert_eq!(state.current_url(), "");
        state.set_response(&response(&["http://a", "http://b"]));
        assert_eq!(state.current_url(), "http://a");
    }

    #[test]
    fn test_payload_error_advances_url() {
        let state = DefaultPayloadState::new(Arc::new(MemoryPrefs::new()));
        state.set_response(&response(&["http://a", "http://b"]));
        state.update_failed(ErrorCode::PayloadHashMismatchError);
        assert_eq!(state.current_url(), "http://b");
        state.update_failed(ErrorCode::PayloadSizeMismatchError);
        assert_eq!(state.current_url(), "http://a");
    }

    #[test]
    fn test_transfer_errors_advance_after_limit() {
        let state = DefaultPayloadState::new(Arc::new(MemoryPrefs::new()));
        state.set_response(&response(&["http://a", "http://b"]));
        for _ in 0..MAX_URL_FAILURES - 1 {
            state.update_failed(ErrorCode::DownloadTransferError);
        }
        assert_eq!(state.current_url(), "http://a");
        state.update_failed(ErrorCode::DownloadTransferError);
        assert_eq!(state.current_url(), "http://b");
        assert_eq!(state.url_failure_count(), 0);
    }

    #[test]
    fn test_unrelated_errors_do_not_count() {
        let state = DefaultPayloadState::new(Arc::new(MemoryPrefs::new()));
        state.set_response(&response(&["http://a"]));
        state.update_failed(ErrorCode::OmahaRequestError);
        assert_eq!(state.url_failure_count(), 0);
    }

    #[test]
    fn test_url_index_persists_for_same_response() {
        let prefs: Arc<dyn Prefs> = Arc::new(MemoryPrefs::new());
        let state = DefaultPayloadState::new(Arc::clone(&prefs));
        state.set_response(&response(&["http://a", "http://b"]));
        state.update_failed(ErrorCode::PayloadHashMismatchError);

        let reloaded = DefaultPayloadState::new(Arc::clone(&prefs));
        reloaded.set_response(&response(&["http://a", "http://b"]));
        assert_eq!(reloaded.current_url(), "http://b");

        reloaded.set_response(&response(&["http://c", "http://d"]));
        assert_eq!(reloaded.current_url(), "http://c");
    }

    #[test]
    fn test_p2p_attempt_count_limit() {
        let state = DefaultPayloadState::new(Arc::new(MemoryPrefs::new()));
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        assert!(state.p2p_attempt_allowed(now));

        for _ in 0..MAX_P2P_ATTEMPTS {
            state.p2p_new_attempt(now);
            assert!(state.p2p_attempt_allowed(now));
        }
        state.p2p_new_attempt(now);
        assert_eq!(state.p2p_num_attempts(), MAX_P2P_ATTEMPTS + 1);
        assert!(!state.p2p_attempt_allowed(now));
    }

    #[test]
    fn test_p2p_attempt_period_limit() {
        let state = DefaultPayloadState::new(Arc::new(MemoryPrefs::new()));
        let first = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        state.p2p_new_attempt(first);
        state.p2p_new_attempt(first + TimeDelta::days(1));
        assert_eq!(state.p2p_first_attempted_at(), Some(first));

        assert!(state.p2p_attempt_allowed(first + MAX_P2P_ATTEMPT_PERIOD));
        assert!(!state.p2p_attempt_allowed(
            first + MAX_P2P_ATTEMPT_PERIOD + TimeDelta::seconds(1)
        ));
        assert!(!state.p2p_attempt_allowed(first - TimeDelta::hours(1)));
    }

    #[test]
    fn test_new_response_resets_p2p_attempts() {
        let prefs: Arc<dyn Prefs> = Arc::new(MemoryPrefs::new());
        let state = DefaultPayloadState::new(Arc::clone(&prefs));
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        state.set_response(&response(&["http://a"]));
        state.p2p_new_attempt(now);
        state.p2p_new_attempt(now);

        // Counts survive a restart for the same payload.
        let reloaded = DefaultPayloadState::new(Arc::clone(&prefs));
        reloaded.set_response(&response(&["http://a"]));
        assert_eq!(reloaded.p2p_num_attempts(), 2);

        reloaded.set_response(&response(&["http://b"]));
        assert_eq!(reloaded.p2p_num_attempts(), 0);
        assert!(reloaded.p2p_first_attempted_at().is_none());

        reloaded.p2p_new_attempt(now);
        reloaded.update_succeeded();
        assert_eq!(reloaded.p2p_num_attempts(), 0);
    }

    #[test]
    fn test_failure_disables_p2p_downloading() {
        let state = DefaultPayloadState::new(Arc::new(MemoryPrefs::new()));
        state.set_using_p2p_for_downloading(true);
        state.set_p2p_url("http://peer/file");
        state.update_failed(ErrorCode::DownloadTransferError);
        assert!(!state.using_p2p_for_downloading());
        assert_eq!(state.p2p_url(), "");
    }
}
