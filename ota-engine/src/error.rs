//! Error codes and engine error types.
//!
//! Two families of errors live here:
//!
//! - [`ErrorCode`]: the closed set of outcome codes an action reports when it
//!   completes. These values travel to the update server inside event
//!   reports, so each variant carries its wire value.
//! - [`EngineError`]: ordinary Rust errors for engine plumbing (config,
//!   prefs, pipeline construction) that never reach the server.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::system::prefs::PrefsError;

/// Outcome of an action, as reported to the server.
///
/// `NoUpdate` is local only: it marks a check that found nothing to install
/// and is never reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    Error = 1,
    OmahaRequestError = 2,
    OmahaResponseHandlerError = 3,
    PostinstallRunnerError = 5,
    InstallDeviceOpenError = 7,
    DownloadTransferError = 9,
    PayloadHashMismatchError = 10,
    PayloadSizeMismatchError = 11,
    DownloadPayloadVerificationError = 12,
    DownloadWriteError = 14,
    NewRootfsVerificationError = 15,
    DownloadStateInitializationError = 20,
    OmahaRequestEmptyResponseError = 30,
    OmahaResponseInvalid = 34,
    OmahaUpdateIgnoredPerPolicy = 35,
    OmahaUpdateDeferredPerPolicy = 36,
    OmahaErrorInHttpResponse = 37,
    PostinstallPowerwashError = 41,
    FilesystemVerifierError = 47,
    UserCanceled = 48,
    NoUpdate = 1000,
}

impl ErrorCode {
    /// Wire value without flags.
    pub fn value(self) -> u32 {
        self as u32
    }

    pub fn is_success(self) -> bool {
        self == ErrorCode::Success
    }

    /// Codes produced by payload verification rather than transport.
    ///
    /// A payload error means the bytes served from the current URL are bad,
    /// so retrying the same URL is pointless.
    pub fn is_payload_error(self) -> bool {
        matches!(
            self,
            ErrorCode::PayloadHashMismatchError
                | ErrorCode::PayloadSizeMismatchError
                | ErrorCode::DownloadPayloadVerificationError
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::Error => "Error",
            ErrorCode::OmahaRequestError => "OmahaRequestError",
            ErrorCode::OmahaResponseHandlerError => "OmahaResponseHandlerError",
            ErrorCode::PostinstallRunnerError => "PostinstallRunnerError",
            ErrorCode::InstallDeviceOpenError => "InstallDeviceOpenError",
            ErrorCode::DownloadTransferError => "DownloadTransferError",
            ErrorCode::PayloadHashMismatchError => "PayloadHashMismatchError",
            ErrorCode::PayloadSizeMismatchError => "PayloadSizeMismatchError",
            ErrorCode::DownloadPayloadVerificationError => "DownloadPayloadVerificationError",
            ErrorCode::DownloadWriteError => "DownloadWriteError",
            ErrorCode::NewRootfsVerificationError => "NewRootfsVerificationError",
            ErrorCode::DownloadStateInitializationError => "DownloadStateInitializationError",
            ErrorCode::OmahaRequestEmptyResponseError => "OmahaRequestEmptyResponseError",
            ErrorCode::OmahaResponseInvalid => "OmahaResponseInvalid",
            ErrorCode::OmahaUpdateIgnoredPerPolicy => "OmahaUpdateIgnoredPerPolicy",
            ErrorCode::OmahaUpdateDeferredPerPolicy => "OmahaUpdateDeferredPerPolicy",
            ErrorCode::OmahaErrorInHttpResponse => "OmahaErrorInHttpResponse",
            ErrorCode::PostinstallPowerwashError => "PostinstallPowerwashError",
            ErrorCode::FilesystemVerifierError => "FilesystemVerifierError",
            ErrorCode::UserCanceled => "UserCanceled",
            ErrorCode::NoUpdate => "NoUpdate",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.value())
    }
}

/// Flag bits OR'd into a reported error code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFlags {
    pub dev_mode: bool,
    pub resumed: bool,
    pub test_image: bool,
    pub test_omaha_url: bool,
}

impl ErrorFlags {
    pub const DEV_MODE: u32 = 1 << 31;
    pub const RESUMED: u32 = 1 << 30;
    pub const TEST_IMAGE: u32 = 1 << 27;
    pub const TEST_OMAHA_URL: u32 = 1 << 26;

    pub fn bits(&self) -> u32 {
        let mut bits = 0;
        if self.dev_mode {
            bits |= Self::DEV_MODE;
        }
        if self.resumed {
            bits |= Self::RESUMED;
        }
        if self.test_image {
            bits |= Self::TEST_IMAGE;
        }
        if self.test_omaha_url {
            bits |= Self::TEST_OMAHA_URL;
        }
        bits
    }
}

/// Combine a code with its flags into the reported wire value.
pub fn reported_value(code: ErrorCode, flags: ErrorFlags) -> u32 {
    code.value() | flags.bits()
}

/// Errors from engine plumbing.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Preferences error: {0}")]
    Prefs(#[from] PrefsError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] crate::action::PipelineError),

    #[error("HTTP client error: {0}")]
    Http(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine plumbing.
pub type EngineResult<T> = Result<T, EngineError>;
