//! Partition hashing and verification.
//!
//! [`FilesystemVerifierAction`] hashes partition devices one at a time and
//! either records the digest (source hash for delta payloads) or compares it
//! with the digest the install plan expects.
//!
//! # State machine
//!
//! ```text
//!   Idle ──► StartNext ──► Reading(i) ──► FinishPartition(i) ──► StartNext
//!                │             │                  │
//!                │ (no more)   │ error/cancel     │ mismatch
//!                ▼             ▼                  ▼
//!             Cleanup ◄────────┴──────────────────┘
//! ```
//!
//! Cleanup runs exactly once per run, whatever the exit path.
//!
//! # Modes
//!
//! | Mode                | Reads         | Outcome on mismatch                   |
//! |---------------------|---------------|---------------------------------------|
//! | `ComputeSourceHash` | source device | n/a, fills `source_hash`              |
//! | `VerifySourceHash`  | source device | `DownloadStateInitializationError`    |
//! | `VerifyTargetHash`  | target device | `NewRootfsVerificationError`          |

use std::path::PathBuf;

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::{debug, error, info, warn};

use crate::action::{ActionContext, ActionOutcome, PipeObject};
use crate::error::ErrorCode;
use crate::install_plan::{InstallPlan, Partition, PayloadType};

/// Bytes read from a device per await.
pub const READ_BUFFER_SIZE: usize = 128 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifierMode {
    ComputeSourceHash,
    VerifySourceHash,
    VerifyTargetHash,
}

impl VerifierMode {
    fn mismatch_code(self) -> ErrorCode {
        match self {
            VerifierMode::VerifyTargetHash => ErrorCode::NewRootfsVerificationError,
            _ => ErrorCode::DownloadStateInitializationError,
        }
    }

    fn reads_source(self) -> bool {
        self != VerifierMode::VerifyTargetHash
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VerifierState {
    Idle,
    StartNext,
    Reading(usize),
    FinishPartition(usize),
    Cleanup(ErrorCode),
}

/// The partition currently being hashed.
struct Reading {
    file: File,
    hasher: Sha256,
    remaining: u64,
}

pub struct FilesystemVerifierAction {
    mode: VerifierMode,
    state: VerifierState,
    cleanup_pending: bool,
    partitions_processed: usize,
}

impl FilesystemVerifierAction {
    pub fn new(mode: VerifierMode) -> Self {
        Self {
            mode,
            state: VerifierState::Idle,
            cleanup_pending: false,
            partitions_processed: 0,
        }
    }

    pub fn mode(&self) -> VerifierMode {
        self.mode
    }

    /// True while a run has started and not yet torn down.
    pub fn is_cleanup_pending(&self) -> bool {
        self.cleanup_pending
    }

    /// Partitions fully hashed by the last run.
    pub fn partitions_processed(&self) -> usize {
        self.partitions_processed
    }

    fn device(&self, partition: &Partition) -> (Option<PathBuf>, u64) {
        if self.mode.reads_source() {
            (partition.source_path.clone(), partition.source_size)
        } else {
            (partition.target_path.clone(), partition.target_size)
        }
    }

    fn expected_hash<'p>(&self, partition: &'p Partition) -> &'p [u8] {
        if self.mode.reads_source() {
            &partition.source_hash
        } else {
            &partition.target_hash
        }
    }

    pub(crate) async fn perform(
        &mut self,
        input: Option<PipeObject>,
        ctx: &ActionContext<'_>,
    ) -> ActionOutcome {
        let Some(mut plan) = input.and_then(PipeObject::into_install_plan) else {
            error!("Verifier has no install plan");
            return ActionOutcome::failed(ErrorCode::Error);
        };

        if self.mode == VerifierMode::ComputeSourceHash && plan.payload_type == PayloadType::Full
        {
            info!("Full payload, no source hashes needed");
            return ActionOutcome::success(PipeObject::InstallPlan(plan));
        }

        let code = self.run(&mut plan, ctx).await;
        if code.is_success() {
            ActionOutcome::success(PipeObject::InstallPlan(plan))
        } else {
            ActionOutcome::failed(code)
        }
    }

    async fn run(&mut self, plan: &mut InstallPlan, ctx: &ActionContext<'_>) -> ErrorCode {
        self.state = VerifierState::StartNext;
        self.cleanup_pending = true;
        self.partitions_processed = 0;

        let mut next = 0;
        let mut reading: Option<Reading> = None;
        let mut buffer = vec![0u8; READ_BUFFER_SIZE];

        loop {
            self.state = match self.state {
                VerifierState::Idle => VerifierState::StartNext,

                VerifierState::StartNext => self.start_partition(plan, &mut next, &mut reading).await,

                VerifierState::Reading(index) => {
                    let Some(current) = reading.as_mut() else {
                        self.state = VerifierState::Cleanup(ErrorCode::Error);
                        continue;
                    };
                    if current.remaining == 0 {
                        self.state = VerifierState::FinishPartition(index);
                        continue;
                    }
                    let want = current.remaining.min(buffer.len() as u64) as usize;
                    let read = tokio::select! {
                        biased;
                        _ = ctx.cancelled() => None,
                        read = current.file.read(&mut buffer[..want]) => Some(read),
                    };
                    match read {
                        None => {
                            info!(partition = %plan.partitions[index].name, "Verification cancelled");
                            VerifierState::Cleanup(ErrorCode::UserCanceled)
                        }
                        Some(Err(e)) => {
                            error!(partition = %plan.partitions[index].name, error = %e, "Read failed");
                            VerifierState::Cleanup(ErrorCode::FilesystemVerifierError)
                        }
                        Some(Ok(0)) => {
                            error!(
                                partition = %plan.partitions[index].name,
                                missing = current.remaining,
                                "Device is shorter than the expected size"
                            );
                            VerifierState::Cleanup(ErrorCode::FilesystemVerifierError)
                        }
                        Some(Ok(n)) => {
                            current.hasher.update(&buffer[..n]);
                            current.remaining -= n as u64;
                            VerifierState::Reading(index)
                        }
                    }
                }

                VerifierState::FinishPartition(index) => {
                    let Some(done) = reading.take() else {
                        self.state = VerifierState::Cleanup(ErrorCode::Error);
                        continue;
                    };
                    let digest = done.hasher.finalize().to_vec();
                    self.partitions_processed += 1;
                    self.finish_partition(&mut plan.partitions[index], digest)
                }

                VerifierState::Cleanup(code) => {
                    self.cleanup(reading.take(), code);
                    return code;
                }
            };
        }
    }

    /// Open the next partition that needs hashing.
    async fn start_partition(
        &self,
        plan: &InstallPlan,
        next: &mut usize,
        reading: &mut Option<Reading>,
    ) -> VerifierState {
        while *next < plan.partitions.len() {
            let index = *next;
            *next += 1;
            let partition = &plan.partitions[index];

            if self.mode != VerifierMode::ComputeSourceHash
                && self.expected_hash(partition).is_empty()
            {
                warn!(partition = %partition.name, mode = ?self.mode, "No expected hash, skipping");
                continue;
            }

            let (path, size) = self.device(partition);
            let Some(path) = path else {
                error!(partition = %partition.name, mode = ?self.mode, "Partition has no device");
                return VerifierState::Cleanup(ErrorCode::FilesystemVerifierError);
            };
            let file = match File::open(&path).await {
                Ok(file) => file,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "Unable to open device");
                    return VerifierState::Cleanup(ErrorCode::FilesystemVerifierError);
                }
            };
            debug!(partition = %partition.name, path = %path.display(), size, "Hashing partition");
            *reading = Some(Reading {
                file,
                hasher: Sha256::new(),
                remaining: size,
            });
            return VerifierState::Reading(index);
        }
        VerifierState::Cleanup(ErrorCode::Success)
    }

    fn finish_partition(&self, partition: &mut Partition, digest: Vec<u8>) -> VerifierState {
        if self.mode == VerifierMode::ComputeSourceHash {
            debug!(partition = %partition.name, hash = %hex::encode(&digest), "Computed source hash");
            partition.source_hash = digest;
            return VerifierState::StartNext;
        }

        let expected = self.expected_hash(partition);
        if expected != digest.as_slice() {
            error!(
                partition = %partition.name,
                expected = %hex::encode(expected),
                actual = %hex::encode(&digest),
                "Partition hash mismatch"
            );
            return VerifierState::Cleanup(self.mode.mismatch_code());
        }
        info!(partition = %partition.name, mode = ?self.mode, "Partition hash verified");
        VerifierState::StartNext
    }

    fn cleanup(&mut self, reading: Option<Reading>, code: ErrorCode) {
        if !self.cleanup_pending {
            return;
        }
        drop(reading);
        self.cleanup_pending = false;
        self.state = VerifierState::Idle;
        debug!(
            code = %code,
            partitions = self.partitions_processed,
            "Verifier finished"
        );
    }
}
