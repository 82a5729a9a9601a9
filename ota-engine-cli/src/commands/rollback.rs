//! Rollback command.

use ota_engine::system::boot_control::slot_name;
use ota_engine::UpdateStatus;

use super::common::{CliRunner, GlobalArgs};
use crate::error::CliError;

/// Run the rollback command. Powerwashes unless `no_powerwash` is set.
pub fn run(global: &GlobalArgs, no_powerwash: bool) -> Result<(), CliError> {
    let runner = CliRunner::new(global)?;
    runner.log_startup("rollback");
    let runtime = runner.runtime()?;
    let mut attempter = runner.attempter()?;

    let target = attempter.rollback_slot();
    if let Some(slot) = target {
        println!("Rolling back to slot {}", slot_name(slot));
        if !no_powerwash {
            println!("User data will be wiped on the next boot.");
        }
    }

    let status = runtime.block_on(attempter.rollback(!no_powerwash))?;
    match (status, target) {
        (UpdateStatus::UpdatedNeedReboot, Some(slot)) => {
            println!(
                "{} Slot {} is active. Reboot to finish the rollback.",
                console::style("✓").green(),
                slot_name(slot)
            );
            Ok(())
        }
        (other, _) => Err(CliError::UpdateFailed(format!("rollback ended in {}", other))),
    }
}
