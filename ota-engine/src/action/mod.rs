//! Typed action pipeline.
//!
//! An update attempt is a queue of [`Action`]s run one at a time by the
//! [`ActionProcessor`]. Each action declares what it consumes and what it
//! produces; bonds between actions carry one action's output into another's
//! input once the producer has finished.
//!
//! # Architecture
//!
//! ```text
//!   ActionProcessor
//!   ┌──────────────────────────────────────────────────────────────┐
//!   │ queue: [A0] → [A1] → [A2] → ...                              │
//!   │ bonds: A0 ──output──► A1 ──output──► A2                      │
//!   │                                                              │
//!   │ for each action:                                             │
//!   │   perform(input, ctx) ◄── cancel token, event channel        │
//!   │   events ──► delegate.action_event                           │
//!   │   outcome ─► delegate.action_completed                       │
//!   │ end ───────► delegate.processing_done | processing_stopped   │
//!   └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Actions are a closed set, so [`Action`] is an enum and dispatch is a
//! single `match`.

mod install_plan_action;
mod omaha_request;
mod postinstall;
mod processor;
mod response_handler;

pub use install_plan_action::InstallPlanAction;
pub use omaha_request::OmahaRequestAction;
pub use postinstall::PostinstallRunnerAction;
pub use processor::{ActionId, ActionProcessor, ActionProcessorDelegate, PipelineError};
pub use response_handler::OmahaResponseHandlerAction;

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use crate::download::DownloadAction;
use crate::error::ErrorCode;
use crate::install_plan::InstallPlan;
use crate::omaha::OmahaResponse;
use crate::system::SystemState;
use crate::verifier::FilesystemVerifierAction;

/// Kind of an action, used for logging and error translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    OmahaRequest,
    OmahaResponseHandler,
    InstallPlan,
    FilesystemVerifier,
    Download,
    PostinstallRunner,
}

impl ActionKind {
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::OmahaRequest => "OmahaRequestAction",
            ActionKind::OmahaResponseHandler => "OmahaResponseHandlerAction",
            ActionKind::InstallPlan => "InstallPlanAction",
            ActionKind::FilesystemVerifier => "FilesystemVerifierAction",
            ActionKind::Download => "DownloadAction",
            ActionKind::PostinstallRunner => "PostinstallRunnerAction",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Type of object flowing through a bond.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Nothing,
    OmahaResponse,
    InstallPlan,
}

/// Object carried from one action to the next.
#[derive(Debug, Clone, PartialEq)]
pub enum PipeObject {
    OmahaResponse(OmahaResponse),
    InstallPlan(InstallPlan),
}

impl PipeObject {
    pub fn object_type(&self) -> ObjectType {
        match self {
            PipeObject::OmahaResponse(_) => ObjectType::OmahaResponse,
            PipeObject::InstallPlan(_) => ObjectType::InstallPlan,
        }
    }

    pub fn into_response(self) -> Option<OmahaResponse> {
        match self {
            PipeObject::OmahaResponse(response) => Some(response),
            _ => None,
        }
    }

    pub fn into_install_plan(self) -> Option<InstallPlan> {
        match self {
            PipeObject::InstallPlan(plan) => Some(plan),
            _ => None,
        }
    }
}

/// Progress reported by a running action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionEvent {
    /// The download started or stopped moving bytes.
    DownloadActive(bool),
    /// Bytes arrived from the network.
    BytesReceived {
        bytes_progressed: u64,
        bytes_received: u64,
        total: u64,
    },
}

/// Result of running one action.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub code: ErrorCode,
    pub output: Option<PipeObject>,
}

impl ActionOutcome {
    pub fn success(output: PipeObject) -> Self {
        Self {
            code: ErrorCode::Success,
            output: Some(output),
        }
    }

    pub fn done() -> Self {
        Self {
            code: ErrorCode::Success,
            output: None,
        }
    }

    pub fn failed(code: ErrorCode) -> Self {
        Self { code, output: None }
    }
}

/// What an action can see while it runs.
pub struct ActionContext<'a> {
    system: &'a SystemState,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<ActionEvent>,
}

impl<'a> ActionContext<'a> {
    pub fn new(
        system: &'a SystemState,
        cancel: CancellationToken,
        events: mpsc::UnboundedSender<ActionEvent>,
    ) -> Self {
        Self {
            system,
            cancel,
            events,
        }
    }

    pub fn system(&self) -> &'a SystemState {
        self.system
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the action has been asked to stop.
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Report progress. Dropped silently if nobody is listening.
    pub fn emit(&self, event: ActionEvent) {
        let _ = self.events.send(event);
    }
}

/// One step of an update attempt.
pub enum Action {
    OmahaRequest(OmahaRequestAction),
    OmahaResponseHandler(OmahaResponseHandlerAction),
    InstallPlan(InstallPlanAction),
    FilesystemVerifier(FilesystemVerifierAction),
    Download(DownloadAction),
    PostinstallRunner(PostinstallRunnerAction),
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::OmahaRequest(_) => ActionKind::OmahaRequest,
            Action::OmahaResponseHandler(_) => ActionKind::OmahaResponseHandler,
            Action::InstallPlan(_) => ActionKind::InstallPlan,
            Action::FilesystemVerifier(_) => ActionKind::FilesystemVerifier,
            Action::Download(_) => ActionKind::Download,
            Action::PostinstallRunner(_) => ActionKind::PostinstallRunner,
        }
    }

    pub fn input_type(&self) -> ObjectType {
        match self {
            Action::OmahaRequest(_) | Action::InstallPlan(_) => ObjectType::Nothing,
            Action::OmahaResponseHandler(_) => ObjectType::OmahaResponse,
            Action::FilesystemVerifier(_) | Action::Download(_) | Action::PostinstallRunner(_) => {
                ObjectType::InstallPlan
            }
        }
    }

    pub fn output_type(&self) -> ObjectType {
        match self {
            Action::OmahaRequest(request) if request.is_event() => ObjectType::Nothing,
            Action::OmahaRequest(_) => ObjectType::OmahaResponse,
            _ => ObjectType::InstallPlan,
        }
    }

    /// Run the action to completion.
    ///
    /// `input` is whatever the bonded producer emitted, if anything.
    /// Cancellation is observed through `ctx`; a cancelled action still
    /// returns an outcome.
    pub async fn perform(
        &mut self,
        input: Option<PipeObject>,
        ctx: &ActionContext<'_>,
    ) -> ActionOutcome {
        match self {
            Action::OmahaRequest(action) => action.perform(ctx).await,
            Action::OmahaResponseHandler(action) => action.perform(input, ctx).await,
            Action::InstallPlan(action) => action.perform(),
            Action::FilesystemVerifier(action) => action.perform(input, ctx).await,
            Action::Download(action) => action.perform(input, ctx).await,
            Action::PostinstallRunner(action) => action.perform(input, ctx).await,
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Action").field(&self.kind()).finish()
    }
}

impl From<OmahaRequestAction> for Action {
    fn from(action: OmahaRequestAction) -> Self {
        Action::OmahaRequest(action)
    }
}

impl From<OmahaResponseHandlerAction> for Action {
    fn from(action: OmahaResponseHandlerAction) -> Self {
        Action::OmahaResponseHandler(action)
    }
}

impl From<InstallPlanAction> for Action {
    fn from(action: InstallPlanAction) -> Self {
        Action::InstallPlan(action)
    }
}

impl From<FilesystemVerifierAction> for Action {
    fn from(action: FilesystemVerifierAction) -> Self {
        Action::FilesystemVerifier(action)
    }
}

impl From<DownloadAction> for Action {
    fn from(action: DownloadAction) -> Self {
        Action::Download(action)
    }
}

impl From<PostinstallRunnerAction> for Action {
    fn from(action: PostinstallRunnerAction) -> Self {
        Action::PostinstallRunner(action)
    }
}
