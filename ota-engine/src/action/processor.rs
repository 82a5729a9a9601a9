//! Sequential action runner.

use std::collections::{HashMap, VecDeque};

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Action, ActionContext, ActionEvent, ActionKind, ObjectType, PipeObject};
use crate::error::ErrorCode;
use crate::system::SystemState;

/// Handle to an enqueued action.
pub type ActionId = usize;

/// Errors building a pipeline.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("no queued action with id {0}")]
    UnknownAction(ActionId),

    #[error("action {from} must be enqueued before action {to} to feed it")]
    Backwards { from: ActionId, to: ActionId },

    #[error("{from} produces {output:?} but {to} consumes {input:?}")]
    TypeMismatch {
        from: ActionKind,
        output: ObjectType,
        to: ActionKind,
        input: ObjectType,
    },

    #[error("action {0} is already bonded")]
    AlreadyBonded(ActionId),
}

/// Receives pipeline progress.
///
/// All callbacks run on the processor's task, between or during actions,
/// never concurrently with each other.
pub trait ActionProcessorDelegate {
    /// An action finished with `code`. Not called for an action that was
    /// stopped.
    fn action_completed(&mut self, _action: &Action, _code: ErrorCode) {}

    /// A running action reported progress.
    fn action_event(&mut self, _kind: ActionKind, _event: &ActionEvent) {}

    /// The queue drained or an action failed. `code` is `Success` or the
    /// failing action's code.
    fn processing_done(&mut self, _code: ErrorCode) {}

    /// Processing was stopped before the queue drained.
    fn processing_stopped(&mut self) {}
}

impl ActionProcessorDelegate for () {}

/// Runs enqueued actions one at a time, in order.
pub struct ActionProcessor {
    queue: VecDeque<(ActionId, Action)>,
    /// producer -> consumer
    bonds: HashMap<ActionId, ActionId>,
    next_id: ActionId,
    current: Option<ActionKind>,
    cancel: CancellationToken,
}

impl Default for ActionProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl ActionProcessor {
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            bonds: HashMap::new(),
            next_id: 0,
            current: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Processor stopped by cancelling `stop`.
    pub fn with_stop_handle(stop: CancellationToken) -> Self {
        Self {
            cancel: stop,
            ..Self::new()
        }
    }

    pub fn enqueue_action(&mut self, action: impl Into<Action>) -> ActionId {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back((id, action.into()));
        id
    }

    fn find(&self, id: ActionId) -> Result<&Action, PipelineError> {
        self.queue
            .iter()
            .find(|(queued, _)| *queued == id)
            .map(|(_, action)| action)
            .ok_or(PipelineError::UnknownAction(id))
    }

    /// Feed `from`'s output into `to`'s input.
    pub fn bond_actions(&mut self, from: ActionId, to: ActionId) -> Result<(), PipelineError> {
        let producer = self.find(from)?;
        let consumer = self.find(to)?;
        if from >= to {
            return Err(PipelineError::Backwards { from, to });
        }
        if self.bonds.contains_key(&from) {
            return Err(PipelineError::AlreadyBonded(from));
        }
        if self.bonds.values().any(|consumer| *consumer == to) {
            return Err(PipelineError::AlreadyBonded(to));
        }
        let output = producer.output_type();
        let input = consumer.input_type();
        if output != input || output == ObjectType::Nothing {
            return Err(PipelineError::TypeMismatch {
                from: producer.kind(),
                output,
                to: consumer.kind(),
                input,
            });
        }
        self.bonds.insert(from, to);
        Ok(())
    }

    /// Kinds of the actions still queued, in order.
    pub fn queued_kinds(&self) -> Vec<ActionKind> {
        self.queue.iter().map(|(_, action)| action.kind()).collect()
    }

    /// Queued actions, in order.
    pub fn queued_actions(&self) -> impl Iterator<Item = &Action> {
        self.queue.iter().map(|(_, action)| action)
    }

    pub fn is_running(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_action(&self) -> Option<ActionKind> {
        self.current
    }

    /// Token that stops processing when cancelled.
    pub fn stop_handle(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask the running action to stop. The queue is dropped once it has.
    pub fn stop_processing(&self) {
        info!("Stopping action processing");
        self.cancel.cancel();
    }

    /// Run every queued action in order, reporting to `delegate`.
    pub async fn start_processing<D>(&mut self, system: &SystemState, delegate: &mut D)
    where
        D: ActionProcessorDelegate + ?Sized,
    {
        let mut inputs: HashMap<ActionId, PipeObject> = HashMap::new();
        let mut final_code = ErrorCode::Success;

        while let Some((id, mut action)) = self.queue.pop_front() {
            if self.cancel.is_cancelled() {
                self.queue.push_front((id, action));
                break;
            }

            let kind = action.kind();
            self.current = Some(kind);
            info!(action = %kind, "Starting action");

            let (events_tx, mut events_rx) = mpsc::unbounded_channel();
            let ctx = ActionContext::new(system, self.cancel.child_token(), events_tx);
            let input = inputs.remove(&id);

            let outcome = {
                let perform = action.perform(input, &ctx);
                tokio::pin!(perform);
                loop {
                    tokio::select! {
                        outcome = &mut perform => break outcome,
                        Some(event) = events_rx.recv() => delegate.action_event(kind, &event),
                    }
                }
            };
            drop(ctx);
            while let Ok(event) = events_rx.try_recv() {
                delegate.action_event(kind, &event);
            }
            self.current = None;

            if self.cancel.is_cancelled() {
                info!(action = %kind, code = %outcome.code, "Action stopped");
                break;
            }

            let code = outcome.code;
            info!(action = %kind, %code, "Action finished");
            if let Some(output) = outcome.output {
                match self.bonds.get(&id) {
                    Some(consumer) => {
                        debug!(from = id, to = *consumer, kind = ?output.object_type(), "Passing output");
                        inputs.insert(*consumer, output);
                    }
                    None => debug!(action = %kind, "Output has no consumer"),
                }
            }

            delegate.action_completed(&action, code);

            if !code.is_success() {
                if !self.queue.is_empty() {
                    warn!(
                        action = %kind,
                        %code,
                        skipped = self.queue.len(),
                        "Action failed, dropping remaining actions"
                    );
                }
                self.queue.clear();
                final_code = code;
                break;
            }
        }

        if self.cancel.is_cancelled() {
            self.queue.clear();
            delegate.processing_stopped();
            return;
        }
        info!(code = %final_code, "All actions processed");
        delegate.processing_done(final_code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{InstallPlanAction, OmahaRequestAction, OmahaResponseHandlerAction};
    use crate::install_plan::InstallPlan;
    use crate::omaha::{OmahaResponse, RequestParams};
    use crate::testing::FakeSystem;
    use crate::verifier::{FilesystemVerifierAction, VerifierMode};

    #[derive(Default)]
    struct Recorder {
        completed: Vec<(ActionKind, ErrorCode)>,
        done: Option<ErrorCode>,
        stopped: bool,
    }

    impl ActionProcessorDelegate for Recorder {
        fn action_completed(&mut self, action: &Action, code: ErrorCode) {
            self.completed.push((action.kind(), code));
        }

        fn processing_done(&mut self, code: ErrorCode) {
            self.done = Some(code);
        }

        fn processing_stopped(&mut self) {
            self.stopped = true;
        }
    }

    #[test]
    fn test_bond_type_mismatch_rejected() {
        let mut processor = ActionProcessor::new();
        let plan = processor.enqueue_action(InstallPlanAction::new(InstallPlan::default()));
        let handler = processor.enqueue_action(OmahaResponseHandlerAction::new(
            RequestParams::default(),
            None,
        ));
        assert!(matches!(
            processor.bond_actions(plan, handler),
            Err(PipelineError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_bond_rules() {
        let mut processor = ActionProcessor::new();
        let check = processor.enqueue_action(OmahaRequestAction::check(RequestParams::default(), None));
        let handler = processor.enqueue_action(OmahaResponseHandlerAction::new(
            RequestParams::default(),
            None,
        ));
        let verifier =
            processor.enqueue_action(FilesystemVerifierAction::new(VerifierMode::ComputeSourceHash));

        assert_eq!(
            processor.bond_actions(handler, check),
            Err(PipelineError::Backwards { from: handler, to: check })
        );
        assert!(processor.bond_actions(check, handler).is_ok());
        assert_eq!(
            processor.bond_actions(check, handler),
            Err(PipelineError::AlreadyBonded(check))
        );
        assert!(processor.bond_actions(handler, verifier).is_ok());
        assert_eq!(
            processor.bond_actions(handler, 99),
            Err(PipelineError::UnknownAction(99))
        );
    }

    #[tokio::test]
    async fn test_runs_in_order_and_passes_output() {
        let fake = FakeSystem::new();
        let system = fake.system_state();

        let mut plan = InstallPlan::default();
        plan.version = "1.2.3".into();

        let mut processor = ActionProcessor::new();
        let first = processor.enqueue_action(InstallPlanAction::new(plan));
        let second =
            processor.enqueue_action(FilesystemVerifierAction::new(VerifierMode::VerifyTargetHash));
        processor.bond_actions(first, second).unwrap();

        let mut recorder = Recorder::default();
        processor.start_processing(&system, &mut recorder).await;

        assert_eq!(
            recorder.completed,
            vec![
                (ActionKind::InstallPlan, ErrorCode::Success),
                (ActionKind::FilesystemVerifier, ErrorCode::Success),
            ]
        );
        assert_eq!(recorder.done, Some(ErrorCode::Success));
        assert!(!processor.is_running());
    }

    #[tokio::test]
    async fn test_stops_on_first_failure() {
        let fake = FakeSystem::new();
        let system = fake.system_state();

        let mut processor = ActionProcessor::new();
        // Unbonded verifier gets no plan and fails.
        processor.enqueue_action(FilesystemVerifierAction::new(VerifierMode::VerifyTargetHash));
        processor.enqueue_action(InstallPlanAction::new(InstallPlan::default()));

        let mut recorder = Recorder::default();
        processor.start_processing(&system, &mut recorder).await;

        assert_eq!(
            recorder.completed,
            vec![(ActionKind::FilesystemVerifier, ErrorCode::Error)]
        );
        assert_eq!(recorder.done, Some(ErrorCode::Error));
        assert!(processor.queued_kinds().is_empty());
    }

    #[tokio::test]
    async fn test_response_feeds_handler() {
        let fake = FakeSystem::new();
        fake.omaha.push_response(OmahaResponse {
            update_exists: false,
            ..Default::default()
        });
        let system = fake.system_state();

        let mut processor = ActionProcessor::new();
        let check = processor.enqueue_action(OmahaRequestAction::check(RequestParams::default(), None));
        let handler = processor.enqueue_action(OmahaResponseHandlerAction::new(
            RequestParams::default(),
            None,
        ));
        processor.bond_actions(check, handler).unwrap();

        let mut recorder = Recorder::default();
        processor.start_processing(&system, &mut recorder).await;

        assert_eq!(
            recorder.completed,
            vec![
                (ActionKind::OmahaRequest, ErrorCode::Success),
                (ActionKind::OmahaResponseHandler, ErrorCode::NoUpdate),
            ]
        );
        assert_eq!(recorder.done, Some(ErrorCode::NoUpdate));
    }

    #[tokio::test]
    async fn test_stop_before_start_reports_stopped() {
        let fake = FakeSystem::new();
        let system = fake.system_state();

        let mut processor = ActionProcessor::new();
        processor.enqueue_action(InstallPlanAction::new(InstallPlan::default()));
        processor.stop_processing();

        let mut recorder = Recorder::default();
        processor.start_processing(&system, &mut recorder).await;

        assert!(recorder.stopped);
        assert!(recorder.completed.is_empty());
        assert_eq!(recorder.done, None);
        assert!(processor.queued_kinds().is_empty());
    }
}
