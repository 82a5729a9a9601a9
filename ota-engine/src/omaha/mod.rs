//! Update-server client surface.
//!
//! The engine never speaks the server's wire protocol itself. It sees a
//! parsed [`OmahaResponse`] and hands [`OmahaEvent`]s back through the
//! [`OmahaClient`] trait. [`FileOmahaClient`] is the one concrete client in
//! this crate: it reads a response from a JSON file and appends reported
//! events to a log, which is enough to drive the engine end to end.

mod params;

pub use params::{
    channel_index, is_more_stable_channel, RequestParams, AU_TEST_OMAHA_URL, CHANNELS,
    DEFAULT_OMAHA_URL, MAX_UPDATE_CHECKS, MIN_UPDATE_CHECKS,
};

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{reported_value, ErrorCode, ErrorFlags};
use crate::BoxFuture;

// =============================================================================
// Response
// =============================================================================

/// One partition image described by the server manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionManifest {
    pub name: String,
    pub size: u64,
    /// Lowercase hex SHA-256 of the partition image.
    pub hash: String,
    /// Size and hash the running slot must have for a delta to apply.
    pub source_size: u64,
    pub source_hash: String,
    pub run_postinstall: bool,
    pub postinstall_path: String,
    pub filesystem_type: String,
}

/// Parsed update-check response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OmahaResponse {
    pub update_exists: bool,
    pub version: String,
    /// Candidate payload URLs, in preference order.
    pub payload_urls: Vec<String>,
    /// Lowercase hex SHA-256 of the whole payload.
    pub hash: String,
    pub size: u64,
    pub more_info_url: String,
    pub prompt: bool,
    /// Deadline for applying the update; empty when there is none.
    pub deadline: String,
    pub metadata_size: u64,
    pub metadata_signature: String,
    pub public_key_rsa: String,
    pub is_delta_payload: bool,
    /// Server-dictated poll interval in seconds, 0 when unset.
    pub poll_interval: u32,
    pub partitions: Vec<PartitionManifest>,
    /// Server forbids fetching this payload from peers.
    pub disable_p2p_for_downloading: bool,
    /// Server forbids sharing this payload with peers.
    pub disable_p2p_for_sharing: bool,
}

// =============================================================================
// Events
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    UpdateComplete,
    UpdateDownloadStarted,
    UpdateDownloadFinished,
}

impl EventType {
    pub fn value(self) -> u32 {
        match self {
            EventType::UpdateComplete => 3,
            EventType::UpdateDownloadStarted => 13,
            EventType::UpdateDownloadFinished => 14,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventResult {
    Error,
    Success,
    SuccessReboot,
}

impl EventResult {
    pub fn value(self) -> u32 {
        match self {
            EventResult::Error => 0,
            EventResult::Success => 1,
            EventResult::SuccessReboot => 2,
        }
    }
}

/// Lifecycle or error event reported to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmahaEvent {
    pub event_type: EventType,
    pub result: EventResult,
    pub error_code: ErrorCode,
    #[serde(default)]
    pub flags: ErrorFlags,
}

impl OmahaEvent {
    /// Successful lifecycle event.
    pub fn success(event_type: EventType) -> Self {
        Self {
            event_type,
            result: EventResult::Success,
            error_code: ErrorCode::Success,
            flags: ErrorFlags::default(),
        }
    }

    /// Final event of a successful update: the device must reboot.
    pub fn update_complete() -> Self {
        Self {
            event_type: EventType::UpdateComplete,
            result: EventResult::SuccessReboot,
            error_code: ErrorCode::Success,
            flags: ErrorFlags::default(),
        }
    }

    /// Failed update, carrying the translated code and its flags.
    pub fn error(code: ErrorCode, flags: ErrorFlags) -> Self {
        Self {
            event_type: EventType::UpdateComplete,
            result: EventResult::Error,
            error_code: code,
            flags,
        }
    }

    /// Error code value as it appears on the wire, flags included.
    pub fn reported_code(&self) -> u32 {
        reported_value(self.error_code, self.flags)
    }
}

// =============================================================================
// Client
// =============================================================================

/// Failures talking to the update server.
#[derive(Debug, Error)]
pub enum OmahaClientError {
    #[error("server returned HTTP status {0}")]
    HttpStatus(u16),

    #[error("server returned an empty response")]
    EmptyResponse,

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl OmahaClientError {
    /// Code the request action completes with for this failure.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            OmahaClientError::HttpStatus(_) => ErrorCode::OmahaErrorInHttpResponse,
            OmahaClientError::EmptyResponse => ErrorCode::OmahaRequestEmptyResponseError,
            OmahaClientError::InvalidResponse(_) => ErrorCode::OmahaResponseInvalid,
            OmahaClientError::Transport(_) => ErrorCode::Error,
        }
    }

    pub fn http_response_code(&self) -> Option<u16> {
        match self {
            OmahaClientError::HttpStatus(code) => Some(*code),
            _ => None,
        }
    }
}

/// Connection to the update server.
pub trait OmahaClient: Send + Sync {
    /// Ask for an update. Any pending error event rides along.
    fn check_for_update<'a>(
        &'a self,
        params: &'a RequestParams,
        pending_event: Option<&'a OmahaEvent>,
    ) -> BoxFuture<'a, Result<OmahaResponse, OmahaClientError>>;

    /// Report a lifecycle event.
    fn send_event<'a>(
        &'a self,
        params: &'a RequestParams,
        event: &'a OmahaEvent,
    ) -> BoxFuture<'a, Result<(), OmahaClientError>>;
}

/// Event as appended to the event log.
#[derive(Debug, Serialize)]
struct EventRecord<'a> {
    app_version: &'a str,
    channel: &'a str,
    event_type: u32,
    result: u32,
    error_code: u32,
}

/// Client that reads responses from a JSON file.
#[derive(Debug, Clone)]
pub struct FileOmahaClient {
    response_file: PathBuf,
    event_log: Option<PathBuf>,
}

impl FileOmahaClient {
    pub fn new(response_file: impl Into<PathBuf>) -> Self {
        Self {
            response_file: response_file.into(),
            event_log: None,
        }
    }

    /// Append reported events to `path` as JSON lines.
    pub fn with_event_log(mut self, path: impl Into<PathBuf>) -> Self {
        self.event_log = Some(path.into());
        self
    }

    async fn append_event(
        &self,
        params: &RequestParams,
        event: &OmahaEvent,
    ) -> Result<(), OmahaClientError> {
        let Some(log) = &self.event_log else {
            return Ok(());
        };
        let record = EventRecord {
            app_version: &params.app_version,
            channel: &params.target_channel,
            event_type: event.event_type.value(),
            result: event.result.value(),
            error_code: event.reported_code(),
        };
        let mut line = serde_json::to_string(&record)
            .map_err(|e| OmahaClientError::Transport(e.to_string()))?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log)
            .await
            .map_err(|e| OmahaClientError::Transport(e.to_string()))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| OmahaClientError::Transport(e.to_string()))?;
        // tokio hands writes to a blocking task; flush before the handle drops.
        file.flush()
            .await
            .map_err(|e| OmahaClientError::Transport(e.to_string()))
    }
}

impl OmahaClient for FileOmahaClient {
    fn check_for_update<'a>(
        &'a self,
        params: &'a RequestParams,
        pending_event: Option<&'a OmahaEvent>,
    ) -> BoxFuture<'a, Result<OmahaResponse, OmahaClientError>> {
        Box::pin(async move {
            if let Some(event) = pending_event {
                self.append_event(params, event).await?;
            }

            let body = tokio::fs::read_to_string(&self.response_file)
                .await
                .map_err(|e| OmahaClientError::Transport(e.to_string()))?;
            if body.trim().is_empty() {
                return Err(OmahaClientError::EmptyResponse);
            }
            let response: OmahaResponse = serde_json::from_str(&body)
                .map_err(|e| OmahaClientError::InvalidResponse(e.to_string()))?;

            info!(
                file = %self.response_file.display(),
                update_exists = response.update_exists,
                version = %response.version,
                "Read update check response"
            );
            Ok(response)
        })
    }

    fn send_event<'a>(
        &'a self,
        params: &'a RequestParams,
        event: &'a OmahaEvent,
    ) -> BoxFuture<'a, Result<(), OmahaClientError>> {
        Box::pin(async move {
            debug!(event = ?event.event_type, result = ?event.result, "Sending event");
            self.append_event(params, event).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_response_defaults_for_missing_fields() {
        let response: OmahaResponse =
            serde_json::from_str(r#"{"update_exists": true, "version": "2.0"}"#).unwrap();
        assert!(response.update_exists);
        assert_eq!(response.size, 0);
        assert!(response.payload_urls.is_empty());
        assert!(response.partitions.is_empty());
    }

    #[test]
    fn test_error_event_reported_code() {
        let event = OmahaEvent::error(
            ErrorCode::DownloadTransferError,
            ErrorFlags {
                resumed: true,
                ..Default::default()
            },
        );
        assert_eq!(event.reported_code(), 9 | ErrorFlags::RESUMED);
        assert_eq!(event.result, EventResult::Error);
    }

    #[test]
    fn test_client_error_codes() {
        assert_eq!(
            OmahaClientError::HttpStatus(500).error_code(),
            ErrorCode::OmahaErrorInHttpResponse
        );
        assert_eq!(OmahaClientError::HttpStatus(500).http_response_code(), Some(500));
        assert_eq!(
            OmahaClientError::EmptyResponse.error_code(),
            ErrorCode::OmahaRequestEmptyResponseError
        );
    }

    #[tokio::test]
    async fn test_file_client_reads_response_and_logs_events() {
        let temp = TempDir::new().unwrap();
        let response_file = temp.path().join("response.json");
        let log = temp.path().join("events.jsonl");
        std::fs::write(
            &response_file,
            r#"{"update_exists": true, "version": "2.0", "payload_urls": ["http://x/p"], "size": 10, "hash": "ab"}"#,
        )
        .unwrap();

        let client = FileOmahaClient::new(&response_file).with_event_log(&log);
        let params = RequestParams::new("1.0", "stable-channel");
        let pending = OmahaEvent::error(ErrorCode::DownloadWriteError, ErrorFlags::default());

        let response = client
            .check_for_update(&params, Some(&pending))
            .await
            .unwrap();
        assert_eq!(response.version, "2.0");

        client
            .send_event(&params, &OmahaEvent::update_complete())
            .await
            .unwrap();

        let contents = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("\"error_code\":14"));
        assert!(lines[1].contains("\"result\":2"));
    }

    #[tokio::test]
    async fn test_file_client_event_visible_once_sent() {
        let temp = TempDir::new().unwrap();
        let log = temp.path().join("events.jsonl");
        let client = FileOmahaClient::new(temp.path().join("response.json")).with_event_log(&log);
        let params = RequestParams::default();

        for sent in 1..=20 {
            client
                .send_event(&params, &OmahaEvent::success(EventType::UpdateDownloadStarted))
                .await
                .unwrap();
            let contents = std::fs::read_to_string(&log).unwrap();
            assert_eq!(contents.lines().count(), sent);
            assert!(contents.ends_with('\n'));
        }
    }

    #[tokio::test]
    async fn test_file_client_empty_response() {
        let temp = TempDir::new().unwrap();
        let response_file = temp.path().join("response.json");
        std::fs::write(&response_file, "  \n").unwrap();

        let client = FileOmahaClient::new(&response_file);
        let params = RequestParams::default();
        let result = client.check_for_update(&params, None).await;
        assert!(matches!(result, Err(OmahaClientError::EmptyResponse)));
    }

    #[tokio::test]
    async fn test_file_client_invalid_response() {
        let temp = TempDir::new().unwrap();
        let response_file = temp.path().join("response.json");
        std::fs::write(&response_file, "{not json").unwrap();

        let client = FileOmahaClient::new(&response_file);
        let params = RequestParams::default();
        let result = client.check_for_update(&params, None).await;
        assert!(matches!(result, Err(OmahaClientError::InvalidResponse(_))));
    }
}
