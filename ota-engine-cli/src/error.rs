//! CLI error type.

use std::fmt;

use ota_engine::attempter::AttemptError;
use ota_engine::config::ConfigError;
use ota_engine::EngineError;

/// Everything a command can fail with.
#[derive(Debug)]
pub enum CliError {
    /// Configuration could not be loaded or is unusable.
    Config(String),
    /// The engine could not be set up.
    Engine(EngineError),
    /// The attempter refused or failed to run an attempt.
    Attempt(AttemptError),
    /// The update ran and ended in a failure status.
    UpdateFailed(String),
    /// P2P cache operation failed.
    P2P(String),
    /// The async runtime could not be started.
    Runtime(std::io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Config(msg) => write!(f, "Configuration error: {}", msg),
            CliError::Engine(e) => write!(f, "Engine error: {}", e),
            CliError::Attempt(e) => write!(f, "{}", e),
            CliError::UpdateFailed(msg) => write!(f, "Update failed: {}", msg),
            CliError::P2P(msg) => write!(f, "P2P error: {}", msg),
            CliError::Runtime(e) => write!(f, "Failed to start runtime: {}", e),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Engine(e) => Some(e),
            CliError::Attempt(e) => Some(e),
            CliError::Runtime(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for CliError {
    fn from(e: ConfigError) -> Self {
        CliError::Config(e.to_string())
    }
}

impl From<EngineError> for CliError {
    fn from(e: EngineError) -> Self {
        CliError::Engine(e)
    }
}

impl From<AttemptError> for CliError {
    fn from(e: AttemptError) -> Self {
        CliError::Attempt(e)
    }
}
