//! Emits a prepared install plan into the pipeline.

use super::{ActionOutcome, PipeObject};
use crate::install_plan::InstallPlan;

/// Source action for pipelines that start from a known plan, such as a
/// rollback.
#[derive(Debug, Clone)]
pub struct InstallPlanAction {
    install_plan: InstallPlan,
}

impl InstallPlanAction {
    pub fn new(install_plan: InstallPlan) -> Self {
        Self { install_plan }
    }

    pub fn install_plan(&self) -> &InstallPlan {
        &self.install_plan
    }

    pub(crate) fn perform(&mut self) -> ActionOutcome {
        self.install_plan.dump();
        ActionOutcome::success(PipeObject::InstallPlan(self.install_plan.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_outputs_plan() {
        let mut plan = InstallPlan::default();
        plan.powerwash_required = true;
        let mut action = InstallPlanAction::new(plan.clone());

        let outcome = action.perform();
        assert_eq!(outcome.code, ErrorCode::Success);
        assert_eq!(outcome.output, Some(PipeObject::InstallPlan(plan)));
    }
}
