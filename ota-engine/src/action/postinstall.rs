//! Post-install steps: partition hooks, powerwash, slot switch.

use tokio::process::Command;
use tracing::{error, info, warn};

use super::{ActionContext, ActionOutcome, PipeObject};
use crate::error::ErrorCode;
use crate::install_plan::{InstallPlan, Partition};
use crate::system::boot_control::slot_name;

/// Runs postinstall programs for the plan's partitions, schedules a
/// powerwash when the plan asks for one, then marks the target slot active.
///
/// Each program is invoked as `<postinstall_path> <target slot> <target
/// device>` and must exit 0.
#[derive(Debug, Default)]
pub struct PostinstallRunnerAction {
    programs_run: usize,
}

impl PostinstallRunnerAction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Programs that ran to a zero exit in the last run.
    pub fn programs_run(&self) -> usize {
        self.programs_run
    }

    pub(crate) async fn perform(
        &mut self,
        input: Option<PipeObject>,
        ctx: &ActionContext<'_>,
    ) -> ActionOutcome {
        let Some(plan) = input.and_then(PipeObject::into_install_plan) else {
            error!("Postinstall has no install plan");
            return ActionOutcome::failed(ErrorCode::Error);
        };
        self.programs_run = 0;

        for partition in plan.partitions.iter().filter(|p| p.run_postinstall) {
            if partition.postinstall_path.is_empty() {
                continue;
            }
            let code = self.run_program(&plan, partition, ctx).await;
            if !code.is_success() {
                return ActionOutcome::failed(code);
            }
        }

        let system = ctx.system();
        if plan.powerwash_required {
            if !system.hardware.schedule_powerwash() {
                error!("Failed to schedule powerwash");
                return ActionOutcome::failed(ErrorCode::PostinstallPowerwashError);
            }
            info!("Powerwash scheduled for next boot");
        }

        if !system.boot_control.set_active_boot_slot(plan.target_slot) {
            error!(slot = %slot_name(plan.target_slot), "Unable to mark slot active");
            return ActionOutcome::failed(ErrorCode::PostinstallRunnerError);
        }
        info!(slot = %slot_name(plan.target_slot), "Slot marked active for next boot");
        ActionOutcome::success(PipeObject::InstallPlan(plan))
    }

    async fn run_program(
        &mut self,
        plan: &InstallPlan,
        partition: &Partition,
        ctx: &ActionContext<'_>,
    ) -> ErrorCode {
        let device = partition
            .target_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        info!(
            partition = %partition.name,
            program = %partition.postinstall_path,
            device = %device,
            "Running postinstall"
        );

        let child = Command::new(&partition.postinstall_path)
            .arg(slot_name(plan.target_slot))
            .arg(&device)
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            biased;
            _ = ctx.cancelled() => {
                info!(partition = %partition.name, "Postinstall cancelled");
                return ErrorCode::UserCanceled;
            }
            output = child => output,
        };

        match output {
            Ok(output) if output.status.success() => {
                self.programs_run += 1;
                ErrorCode::Success
            }
            Ok(output) => {
                error!(
                    partition = %partition.name,
                    status = ?output.status,
                    stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                    "Postinstall program failed"
                );
                ErrorCode::PostinstallRunnerError
            }
            Err(e) => {
                warn!(program = %partition.postinstall_path, error = %e, "Unable to start postinstall");
                ErrorCode::PostinstallRunnerError
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::boot_control::BootControl;
    use crate::testing::FakeSystem;
    use std::os::unix::fs::PermissionsExt;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn plan_with(program: Option<&Path>) -> InstallPlan {
        let mut plan = InstallPlan::default();
        plan.set_slots(0, 1).unwrap();
        let mut partition = Partition::new("system");
        partition.target_path = Some(PathBuf::from("/dev/system_b"));
        if let Some(program) = program {
            partition.run_postinstall = true;
            partition.postinstall_path = program.display().to_string();
        }
        plan.partitions.push(partition);
        plan
    }

    async fn run(fake: &FakeSystem, plan: InstallPlan) -> (ActionOutcome, PostinstallRunnerAction) {
        let system = fake.system_state();
        let (tx, _rx) = mpsc::unbounded_channel();
        let ctx = ActionContext::new(&system, CancellationToken::new(), tx);
        let mut action = PostinstallRunnerAction::new();
        let outcome = action.perform(Some(PipeObject::InstallPlan(plan)), &ctx).await;
        (outcome, action)
    }

    #[tokio::test]
    async fn test_switches_active_slot() {
        let fake = FakeSystem::new();
        let (outcome, action) = run(&fake, plan_with(None)).await;
        assert_eq!(outcome.code, ErrorCode::Success);
        assert_eq!(action.programs_run(), 0);
        assert_eq!(fake.boot_control.active_slot(), Some(1));
    }

    #[tokio::test]
    async fn test_runs_program_with_slot_and_device() {
        let temp = TempDir::new().unwrap();
        let record = temp.path().join("args");
        let program = script(
            temp.path(),
            "postinst",
            &format!("echo \"$1 $2\" > {}", record.display()),
        );

        let fake = FakeSystem::new();
        let (outcome, action) = run(&fake, plan_with(Some(&program))).await;
        assert_eq!(outcome.code, ErrorCode::Success);
        assert_eq!(action.programs_run(), 1);
        assert_eq!(
            std::fs::read_to_string(&record).unwrap().trim(),
            "B /dev/system_b"
        );
    }

    #[tokio::test]
    async fn test_failing_program_keeps_slot() {
        let temp = TempDir::new().unwrap();
        let program = script(temp.path(), "postinst", "exit 3");

        let fake = FakeSystem::new();
        let (outcome, _) = run(&fake, plan_with(Some(&program))).await;
        assert_eq!(outcome.code, ErrorCode::PostinstallRunnerError);
        assert_eq!(fake.boot_control.active_slot(), None);
    }

    #[tokio::test]
    async fn test_powerwash_failure() {
        let fake = FakeSystem::new();
        fake.hardware.set_powerwash_result(false);
        let mut plan = plan_with(None);
        plan.powerwash_required = true;

        let (outcome, _) = run(&fake, plan).await;
        assert_eq!(outcome.code, ErrorCode::PostinstallPowerwashError);
        assert!(!fake.hardware.powerwash_scheduled());
    }

    #[tokio::test]
    async fn test_powerwash_scheduled() {
        let fake = FakeSystem::new();
        let mut plan = plan_with(None);
        plan.powerwash_required = true;

        let (outcome, _) = run(&fake, plan).await;
        assert_eq!(outcome.code, ErrorCode::Success);
        assert!(fake.hardware.powerwash_scheduled());
    }

    #[tokio::test]
    async fn test_slot_switch_failure() {
        let fake = FakeSystem::new();
        let mut plan = plan_with(None);
        plan.set_slots(0, 5).unwrap();
        let (outcome, _) = run(&fake, plan).await;
        assert_eq!(outcome.code, ErrorCode::PostinstallRunnerError);
        assert_eq!(fake.boot_control.num_slots(), 2);
    }
}
