//! Daily metrics command.

use ota_engine::UpdateAttempter;

use super::common::{CliRunner, GlobalArgs};
use crate::error::CliError;

/// Report daily metrics if a day has passed since the last report.
pub fn run(global: &GlobalArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(global)?;
    runner.log_startup("metrics");
    // Startup recovery would report on its own; go straight to the check.
    let attempter = UpdateAttempter::new(runner.system()?, runner.config().request_params());

    if attempter.check_and_report_daily_metrics() {
        println!("Daily metrics reported.");
    } else {
        println!("Daily metrics already reported in the last 24 hours.");
    }
    Ok(())
}
