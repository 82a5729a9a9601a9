//! Shared command plumbing: configuration, logging, engine wiring.

use std::path::PathBuf;
use std::sync::Arc;

use ota_engine::config::ConfigFile;
use ota_engine::logging::{init_logging, LogConfig, WorkerGuard};
use ota_engine::{SystemState, UpdateAttempter};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use crate::error::CliError;

/// Options shared by every command.
#[derive(Debug, Clone, Default)]
pub struct GlobalArgs {
    pub config: Option<PathBuf>,
    pub verbose: bool,
}

/// Loaded configuration plus the logging guard that must outlive the
/// command.
pub struct CliRunner {
    config: ConfigFile,
    _log_guard: Option<WorkerGuard>,
}

impl CliRunner {
    /// Load configuration and install logging.
    ///
    /// An explicit `--config` path must exist; the default location falls
    /// back to built-in defaults.
    pub fn new(args: &GlobalArgs) -> Result<Self, CliError> {
        let config = match &args.config {
            Some(path) => ConfigFile::load_from(path)?,
            None => ConfigFile::load()?,
        };

        let mut log_config = LogConfig::from(&config.logging);
        if args.verbose {
            log_config = log_config.with_level("debug");
        }
        // A subscriber installed by the host process is fine.
        let log_guard = init_logging(&log_config).ok().flatten();

        Ok(Self {
            config,
            _log_guard: log_guard,
        })
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn log_startup(&self, command: &str) {
        info!(
            command,
            version = env!("CARGO_PKG_VERSION"),
            app_version = %self.config.omaha.app_version,
            channel = %self.config.omaha.channel,
            "ota-engine starting"
        );
    }

    pub fn system(&self) -> Result<Arc<SystemState>, CliError> {
        Ok(Arc::new(SystemState::from_config(&self.config)?))
    }

    /// Attempter with startup recovery already applied.
    pub fn attempter(&self) -> Result<UpdateAttempter, CliError> {
        let mut attempter = UpdateAttempter::new(self.system()?, self.config.request_params());
        attempter.update_engine_started();
        debug!(status = %attempter.status(), "Attempter ready");
        Ok(attempter)
    }

    /// Single-threaded runtime: one action runs at a time.
    pub fn runtime(&self) -> Result<Runtime, CliError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(CliError::Runtime)
    }
}

/// Format a byte count for humans.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_explicit_config_must_exist() {
        let args = GlobalArgs {
            config: Some(PathBuf::from("/nonexistent/ota-engine/config.ini")),
            verbose: false,
        };
        assert!(matches!(CliRunner::new(&args), Err(CliError::Config(_))));
    }

    #[test]
    fn test_explicit_config_is_loaded() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[omaha]\napp_version = 9.9.9").unwrap();
        let args = GlobalArgs {
            config: Some(file.path().to_path_buf()),
            verbose: true,
        };
        let runner = CliRunner::new(&args).unwrap();
        assert_eq!(runner.config().omaha.app_version, "9.9.9");
    }

    proptest! {
        #[test]
        fn prop_format_bytes_never_empty(bytes in any::<u64>()) {
            let formatted = format_bytes(bytes);
            prop_assert!(formatted.ends_with('B'));
        }
    }
}
