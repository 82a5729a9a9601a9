//! Action pipelines driven through the public processor API.

use std::fs;

use ota_engine::action::{
    Action, ActionEvent, ActionId, ActionKind, ActionProcessor, ActionProcessorDelegate,
    InstallPlanAction, OmahaRequestAction, OmahaResponseHandlerAction,
};
use ota_engine::download::DownloadAction;
use ota_engine::install_plan::{InstallPlan, PayloadType};
use ota_engine::omaha::{OmahaResponse, RequestParams};
use ota_engine::system::boot_control::INVALID_SLOT;
use ota_engine::system::prefs::{self, Prefs};
use ota_engine::testing::{FailingSink, FakeSystem, MockHttpFetcher};
use ota_engine::verifier::{FilesystemVerifierAction, VerifierMode};
use ota_engine::ErrorCode;
use sha2::{Digest, Sha256};

#[derive(Default)]
struct Recorder {
    completed: Vec<(ActionKind, ErrorCode)>,
    plan: Option<InstallPlan>,
    events: Vec<ActionEvent>,
    done: Option<ErrorCode>,
    stopped: bool,
}

impl ActionProcessorDelegate for Recorder {
    fn action_completed(&mut self, action: &Action, code: ErrorCode) {
        if let Action::OmahaResponseHandler(handler) = action {
            self.plan = Some(handler.install_plan().clone());
        }
        self.completed.push((action.kind(), code));
    }

    fn action_event(&mut self, _kind: ActionKind, event: &ActionEvent) {
        self.events.push(event.clone());
    }

    fn processing_done(&mut self, code: ErrorCode) {
        self.done = Some(code);
    }

    fn processing_stopped(&mut self) {
        self.stopped = true;
    }
}

/// Check bonded to a response handler. Returns the handler's id.
fn check_and_handle(fake: &FakeSystem) -> (ActionProcessor, ActionId) {
    let params = RequestParams::new("1.0.0", "stable-channel");
    let mut processor = ActionProcessor::new();
    let check = processor.enqueue_action(OmahaRequestAction::check(params.clone(), None));
    let handler = processor.enqueue_action(OmahaResponseHandlerAction::new(
        params,
        Some(fake.deadline_file()),
    ));
    processor.bond_actions(check, handler).unwrap();
    (processor, handler)
}

#[tokio::test]
async fn test_response_becomes_install_plan() {
    let fake = FakeSystem::new();
    fake.omaha.push_response(OmahaResponse {
        update_exists: true,
        version: "a.b.c.d".into(),
        payload_urls: vec!["http://foo/pkg".into()],
        hash: "HASH".into(),
        size: 12,
        ..Default::default()
    });
    let (mut processor, _) = check_and_handle(&fake);
    let mut recorder = Recorder::default();

    processor
        .start_processing(&fake.system_state(), &mut recorder)
        .await;

    assert_eq!(recorder.done, Some(ErrorCode::Success));
    let plan = recorder.plan.unwrap();
    assert_eq!(plan.download_url, "http://foo/pkg");
    assert_eq!(plan.payload_hash, "HASH");
    assert_eq!(plan.payload_size, 12);
    assert_eq!(plan.version, "a.b.c.d");
    assert_eq!(plan.payload_type, PayloadType::Full);
    assert_eq!(plan.source_slot, 0);
    assert_eq!(plan.target_slot, 1);
    assert!(!plan.is_resume);
    assert!(!plan.powerwash_required);
}

#[tokio::test]
async fn test_no_update_stops_after_handler() {
    let fake = FakeSystem::new();
    fake.omaha.push_response(OmahaResponse::default());

    let (mut processor, handler) = check_and_handle(&fake);
    let verifier =
        processor.enqueue_action(FilesystemVerifierAction::new(VerifierMode::ComputeSourceHash));
    let download = processor.enqueue_action(DownloadAction::new(
        Box::new(MockHttpFetcher::new(vec![0u8; 16])),
        fake.payload_path(),
    ));
    processor.bond_actions(handler, verifier).unwrap();
    processor.bond_actions(verifier, download).unwrap();
    let mut recorder = Recorder::default();

    processor
        .start_processing(&fake.system_state(), &mut recorder)
        .await;

    assert_eq!(recorder.done, Some(ErrorCode::NoUpdate));
    assert_eq!(
        recorder.completed,
        vec![
            (ActionKind::OmahaRequest, ErrorCode::Success),
            (ActionKind::OmahaResponseHandler, ErrorCode::NoUpdate),
        ]
    );
    let plan = recorder.plan.unwrap();
    assert!(plan.download_url.is_empty());
    assert_eq!(plan.target_slot, INVALID_SLOT);
    assert!(recorder.events.is_empty());
    assert!(!fake.payload_path().exists());
}

#[tokio::test]
async fn test_write_failure_keeps_written_prefix() {
    const CHUNK: usize = 256;
    let fake = FakeSystem::new();
    let data: Vec<u8> = (0..5 * CHUNK).map(|i| (i % 253) as u8).collect();
    let path = fake.dir().join("output.bin");
    let plan = InstallPlan {
        download_url: "http://foo/pkg".into(),
        payload_size: data.len() as u64,
        payload_hash: hex::encode(Sha256::digest(&data)),
        payload_type: PayloadType::Full,
        hash_checks_mandatory: true,
        ..Default::default()
    };

    let mut processor = ActionProcessor::new();
    let install = processor.enqueue_action(InstallPlanAction::new(plan));
    let download = processor.enqueue_action(
        DownloadAction::new(
            Box::new(MockHttpFetcher::new(data.clone()).with_chunk_size(CHUNK)),
            fake.payload_path(),
        )
        .with_sink(Box::new(FailingSink::with_file(&path, 1))),
    );
    processor.bond_actions(install, download).unwrap();
    let mut recorder = Recorder::default();

    processor
        .start_processing(&fake.system_state(), &mut recorder)
        .await;

    assert_eq!(recorder.done, Some(ErrorCode::DownloadWriteError));
    assert_eq!(fs::read(&path).unwrap(), &data[..CHUNK]);
    // A hash comparison would have reset the progress markers.
    assert_eq!(
        fake.prefs.get_int64(prefs::UPDATE_STATE_NEXT_DATA_OFFSET),
        Some(CHUNK as i64)
    );
    assert!(!recorder.events.iter().any(|event| matches!(
        event,
        ActionEvent::BytesReceived { bytes_received, .. } if *bytes_received > CHUNK as u64
    )));
}

#[tokio::test]
async fn test_stop_before_start_reports_stopped() {
    let fake = FakeSystem::new();
    let (mut processor, _) = check_and_handle(&fake);
    processor.stop_processing();
    let mut recorder = Recorder::default();

    processor
        .start_processing(&fake.system_state(), &mut recorder)
        .await;

    assert!(recorder.stopped);
    assert!(recorder.done.is_none());
    assert!(recorder.completed.is_empty());
    assert!(fake.omaha.checks().is_empty());
}
