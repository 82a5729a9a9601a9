//! Status command: show persisted engine state without changing it.

use chrono::DateTime;
use ota_engine::omaha::OmahaEvent;
use ota_engine::system::boot_control::slot_name;
use ota_engine::system::prefs;
use ota_engine::{SystemState, UpdateStatus};

use super::common::{CliRunner, GlobalArgs};
use crate::error::CliError;

/// Snapshot of everything the status command prints.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub status: UpdateStatus,
    pub current_slot: String,
    /// `(slot name, bootable)` for every slot.
    pub slots: Vec<(String, bool)>,
    pub pending_error: Option<OmahaEvent>,
    pub download_offset: Option<i64>,
    pub delta_failures: i64,
    pub wall_clock_wait_secs: Option<i64>,
    pub update_checks_left: Option<i64>,
    pub metrics_last_reported: Option<String>,
    pub p2p_enabled: bool,
    pub p2p_shared_files: usize,
}

/// Read the report from `system`.
pub fn collect(system: &SystemState) -> StatusReport {
    let prefs = system.prefs.as_ref();
    let boot_control = system.boot_control.as_ref();

    let completed_on = prefs.get_string(prefs::UPDATE_COMPLETED_ON_BOOT_ID);
    let status = match (completed_on, system.hardware.boot_id()) {
        (Some(completed), Some(current)) if completed == current => {
            UpdateStatus::UpdatedNeedReboot
        }
        _ => UpdateStatus::Idle,
    };

    let slots = (0..boot_control.num_slots())
        .map(|slot| (slot_name(slot), boot_control.is_slot_bootable(slot)))
        .collect();

    let pending_error = prefs
        .get_string(prefs::PENDING_ERROR_EVENT)
        .and_then(|json| serde_json::from_str(&json).ok());

    let (p2p_enabled, p2p_shared_files) = system
        .p2p_manager
        .as_ref()
        .map_or((false, 0), |p2p| (p2p.is_p2p_enabled(), p2p.count_shared_files()));

    StatusReport {
        status,
        current_slot: slot_name(boot_control.current_slot()),
        slots,
        pending_error,
        download_offset: prefs
            .get_int64(prefs::UPDATE_STATE_NEXT_DATA_OFFSET)
            .filter(|offset| *offset > 0),
        delta_failures: prefs.get_int64(prefs::DELTA_UPDATE_FAILURES).unwrap_or(0),
        wall_clock_wait_secs: prefs.get_int64(prefs::WALL_CLOCK_WAIT_PERIOD),
        update_checks_left: prefs.get_int64(prefs::UPDATE_CHECK_COUNT),
        metrics_last_reported: prefs
            .get_int64(prefs::DAILY_METRICS_LAST_REPORTED_AT)
            .and_then(|secs| DateTime::from_timestamp(secs, 0))
            .map(|at| at.to_rfc3339()),
        p2p_enabled,
        p2p_shared_files,
    }
}

/// Run the status command.
pub fn run(global: &GlobalArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(global)?;
    let system = runner.system()?;
    let report = collect(&system);
    let config = runner.config();

    println!("OTA Engine Status");
    println!("=================");
    println!();
    println!("Version:      {}", config.omaha.app_version);
    println!("Channel:      {}", config.omaha.channel);
    println!("Status:       {}", console::style(report.status.name()).bold());
    println!();
    println!("Slots (running {}):", report.current_slot);
    for (name, bootable) in &report.slots {
        let state = if *bootable {
            console::style("bootable").green()
        } else {
            console::style("unbootable").red()
        };
        println!("  {}  {}", name, state);
    }
    println!();

    match &report.pending_error {
        Some(event) => println!(
            "Pending error:  {} (reported as {})",
            event.error_code,
            event.reported_code()
        ),
        None => println!("Pending error:  none"),
    }
    if let Some(offset) = report.download_offset {
        println!("Download:       partial, next offset {}", offset);
    }
    if report.delta_failures > 0 {
        println!("Delta failures: {}", report.delta_failures);
    }
    if let Some(secs) = report.wall_clock_wait_secs {
        println!("Scatter wait:   {}s", secs);
    }
    if let Some(checks) = report.update_checks_left {
        println!("Checks left:    {}", checks);
    }
    println!(
        "Metrics:        {}",
        report
            .metrics_last_reported
            .as_deref()
            .unwrap_or("never reported")
    );
    println!(
        "P2P:            {} ({} shared files)",
        if report.p2p_enabled { "enabled" } else { "disabled" },
        report.p2p_shared_files
    );
    Ok(())
}
