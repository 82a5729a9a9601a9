//! OTA Engine - A/B over-the-air update client
//!
//! This library turns an update-check response into an install plan,
//! downloads and verifies the payload against the inactive slot, and drives
//! each attempt through a status machine with retry, rollback and
//! peer-to-peer payload sharing.
//!
//! # Layout
//!
//! ```text
//!   UpdateAttempter ─── owns ───► ActionProcessor
//!        │                         │
//!        │ status broadcast        ├─ OmahaRequestAction
//!        ▼                         ├─ OmahaResponseHandlerAction
//!   StatusSnapshot                 ├─ FilesystemVerifierAction
//!                                  ├─ DownloadAction ──► P2P cache
//!                                  └─ PostinstallRunnerAction
//!
//!   SystemState: prefs, boot control, payload state, hardware, clock,
//!                P2P manager, device policy, update server, fetchers
//! ```

use std::future::Future;
use std::pin::Pin;

pub mod action;
pub mod attempter;
pub mod config;
pub mod download;
pub mod error;
pub mod install_plan;
pub mod logging;
pub mod omaha;
pub mod p2p;
pub mod system;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod verifier;

pub use attempter::{StatusSnapshot, UpdateAttempter, UpdateRequest, UpdateStatus};
pub use config::ConfigFile;
pub use error::{EngineError, EngineResult, ErrorCode};
pub use install_plan::InstallPlan;
pub use system::SystemState;

/// Boxed future used at trait seams.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
