//! P2P cache commands.

use std::io;

use clap::Subcommand;
use ota_engine::config::P2PSettings;
use ota_engine::p2p::{DirP2PManager, P2PManager};

use super::common::{format_bytes, CliRunner, GlobalArgs};
use crate::error::CliError;

#[derive(Debug, Clone, Subcommand)]
pub enum P2pAction {
    /// Remove old and surplus shared files
    Housekeeping,
    /// List shared files
    List,
}

/// One row of `p2p list`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedFile {
    pub file_id: String,
    pub size: u64,
    pub expected_size: Option<u64>,
    pub visible: bool,
}

impl SharedFile {
    pub fn is_complete(&self) -> bool {
        self.expected_size == Some(self.size)
    }
}

fn manager(settings: &P2PSettings) -> DirP2PManager {
    DirP2PManager::new(&settings.directory, settings.enabled)
}

/// Shared files in the cache, newest first. A missing cache directory is
/// an empty cache.
pub fn list_shared(p2p: &DirP2PManager) -> Result<Vec<SharedFile>, CliError> {
    let ids = match p2p.shared_file_ids() {
        Ok(ids) => ids,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CliError::P2P(format!(
                "cannot read {}: {}",
                p2p.dir().display(),
                e
            )))
        }
    };

    Ok(ids
        .into_iter()
        .map(|file_id| SharedFile {
            size: p2p.file_get_size(&file_id).unwrap_or(0),
            expected_size: p2p.file_get_expected_size(&file_id),
            visible: p2p.file_get_visible(&file_id).unwrap_or(false),
            file_id,
        })
        .collect())
}

/// Run a p2p subcommand.
pub fn run(global: &GlobalArgs, action: P2pAction) -> Result<(), CliError> {
    let runner = CliRunner::new(global)?;
    let settings = &runner.config().p2p;
    let p2p = manager(settings);

    match action {
        P2pAction::Housekeeping => {
            runner.log_startup("p2p housekeeping");
            let before = p2p.count_shared_files();
            if !p2p.perform_housekeeping() {
                return Err(CliError::P2P(format!(
                    "housekeeping failed in {}",
                    settings.directory.display()
                )));
            }
            let after = p2p.count_shared_files();
            println!(
                "{} Kept {} shared files, removed {}",
                console::style("✓").green(),
                after,
                before.saturating_sub(after)
            );
        }
        P2pAction::List => {
            let files = list_shared(&p2p)?;
            println!(
                "P2P cache: {} ({})",
                settings.directory.display(),
                if settings.enabled { "enabled" } else { "disabled" }
            );
            if files.is_empty() {
                println!("No shared files.");
                return Ok(());
            }
            println!();
            for file in &files {
                let state = if file.visible {
                    console::style("visible").green()
                } else {
                    console::style("partial").yellow()
                };
                let expected = file
                    .expected_size
                    .map(format_bytes)
                    .unwrap_or_else(|| "?".to_string());
                println!(
                    "  {:<40} {:>10} / {:<10} {}",
                    file.file_id,
                    format_bytes(file.size),
                    expected,
                    state
                );
            }
        }
    }
    Ok(())
}
