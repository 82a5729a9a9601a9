//! Update command: run one update attempt with a progress bar.

use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use ota_engine::{StatusSnapshot, UpdateRequest, UpdateStatus};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::common::{format_bytes, CliRunner, GlobalArgs};
use crate::error::CliError;

/// Arguments for the update command.
#[derive(Debug, Clone, Default)]
pub struct UpdateArgs {
    pub interactive: bool,
    pub omaha_url: Option<String>,
    pub channel: Option<String>,
}

impl From<UpdateArgs> for UpdateRequest {
    fn from(args: UpdateArgs) -> Self {
        UpdateRequest {
            interactive: args.interactive,
            omaha_url: args.omaha_url,
            channel: args.channel,
        }
    }
}

/// Run the update command.
pub fn run(global: &GlobalArgs, args: UpdateArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(global)?;
    runner.log_startup("update");
    let runtime = runner.runtime()?;
    let mut attempter = runner.attempter()?;

    if attempter.status() == UpdateStatus::UpdatedNeedReboot {
        println!("An update is already installed. Reboot to apply it.");
        return Ok(());
    }

    install_stop_handler(attempter.stop_handle())?;

    let status = runtime.block_on(async {
        let progress = tokio::spawn(render_progress(attempter.subscribe()));
        let result = attempter.update(args.into()).await;
        let last = attempter.snapshot();
        // Closing the channel ends the progress task.
        drop(attempter);
        if let Err(e) = progress.await {
            debug!(error = %e, "Progress task ended abnormally");
        }
        result.map(|status| (status, last))
    })?;

    let (status, snapshot) = status;
    report(status, &snapshot)
}

fn install_stop_handler(stop: CancellationToken) -> Result<(), CliError> {
    ctrlc::set_handler(move || {
        println!();
        println!("Received interrupt, stopping update...");
        stop.cancel();
    })
    .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))
}

fn report(status: UpdateStatus, snapshot: &StatusSnapshot) -> Result<(), CliError> {
    match status {
        UpdateStatus::UpdatedNeedReboot => {
            println!(
                "{} Update to {} installed ({}). Reboot to apply.",
                console::style("✓").green(),
                snapshot.new_version,
                format_bytes(snapshot.new_size)
            );
            Ok(())
        }
        UpdateStatus::Idle if snapshot.new_version.is_empty() => {
            println!("No update available.");
            Ok(())
        }
        UpdateStatus::Disabled => {
            println!("Updates are disabled by device policy.");
            Ok(())
        }
        UpdateStatus::Idle => Err(CliError::UpdateFailed(format!(
            "update to {} did not complete; the error is reported with the next check",
            snapshot.new_version
        ))),
        other => Err(CliError::UpdateFailed(format!("ended in {}", other))),
    }
}

fn progress_style() -> ProgressStyle {
    ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}",
    )
    .unwrap_or_else(|_| ProgressStyle::default_bar())
    .progress_chars("#>-")
}

/// Draw status snapshots until the attempter goes away.
async fn render_progress(mut rx: broadcast::Receiver<StatusSnapshot>) {
    let bar = ProgressBar::new_spinner();
    bar.enable_steady_tick(Duration::from_millis(120));
    let mut downloading = false;

    loop {
        match rx.recv().await {
            Ok(snapshot) => {
                if snapshot.status == UpdateStatus::Downloading && !downloading {
                    downloading = true;
                    bar.set_style(progress_style());
                }
                if snapshot.total_bytes > 0 {
                    bar.set_length(snapshot.total_bytes);
                    bar.set_position(snapshot.bytes_received);
                }
                bar.set_message(snapshot.status.name().to_string());
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Progress display fell behind");
            }
            Err(RecvError::Closed) => break,
        }
    }
    bar.finish_and_clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_into_request() {
        let args = UpdateArgs {
            interactive: true,
            omaha_url: Some("http://localhost/update".into()),
            channel: None,
        };
        let request = UpdateRequest::from(args);
        assert!(request.interactive);
        assert_eq!(request.omaha_url.as_deref(), Some("http://localhost/update"));
        assert!(request.channel.is_none());
    }

    #[test]
    fn test_report_outcomes() {
        let snapshot = StatusSnapshot::default();
        assert!(report(UpdateStatus::Idle, &snapshot).is_ok());

        let snapshot = StatusSnapshot {
            new_version: "2.0.0".into(),
            new_size: 2048,
            ..Default::default()
        };
        assert!(report(UpdateStatus::UpdatedNeedReboot, &snapshot).is_ok());
        assert!(matches!(
            report(UpdateStatus::Idle, &snapshot),
            Err(CliError::UpdateFailed(_))
        ));
        assert!(report(UpdateStatus::Disabled, &StatusSnapshot::default()).is_ok());
    }

    #[tokio::test]
    async fn test_render_progress_ends_when_sender_drops() {
        let (tx, rx) = broadcast::channel(4);
        let task = tokio::spawn(render_progress(rx));
        tx.send(StatusSnapshot {
            status: UpdateStatus::Downloading,
            total_bytes: 100,
            bytes_received: 50,
            ..Default::default()
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();
    }
}
