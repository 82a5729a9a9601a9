//! In-memory collaborators for tests. Built for this crate's own tests and
//! behind the `testing` feature for everyone else.
//!
//! [`FakeSystem`] bundles a fake for every [`SystemState`] field, keeps
//! typed handles to them so tests can script and inspect behavior, and owns
//! a scratch directory for payload files and the P2P cache.
//!
//! ```ignore
//! let fake = FakeSystem::new();
//! fake.omaha.push_response(response);
//! let system = fake.system_state();
//! ```

mod fakes;
mod fetcher;

pub use fakes::{FakeBootControl, FakeClock, FakeHardware, FakeOmahaClient, FakeP2PManager};
pub use fetcher::{FailingSink, FailingWriter, FetchLog, MockHttpFetcher, MockHttpFetcherFactory};

use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::p2p::P2PManager;
use crate::system::payload_state::DefaultPayloadState;
use crate::system::policy::DevicePolicy;
use crate::system::prefs::{MemoryPrefs, Prefs};
use crate::system::SystemState;

pub struct FakeSystem {
    pub prefs: Arc<MemoryPrefs>,
    pub boot_control: Arc<FakeBootControl>,
    pub hardware: Arc<FakeHardware>,
    pub clock: Arc<FakeClock>,
    pub payload_state: Arc<DefaultPayloadState>,
    pub omaha: Arc<FakeOmahaClient>,
    pub fetchers: Arc<MockHttpFetcherFactory>,
    pub p2p: Option<Arc<FakeP2PManager>>,
    policy: Mutex<Option<DevicePolicy>>,
    dir: TempDir,
}

impl Default for FakeSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeSystem {
    /// Two slots, running from slot 0, official build, no P2P, no policy.
    pub fn new() -> Self {
        let dir = match TempDir::new() {
            Ok(dir) => dir,
            Err(e) => panic!("cannot create scratch directory: {}", e),
        };
        let prefs = Arc::new(MemoryPrefs::new());
        let shared: Arc<dyn Prefs> = prefs.clone();
        Self {
            payload_state: Arc::new(DefaultPayloadState::new(shared)),
            prefs,
            boot_control: Arc::new(FakeBootControl::new(2, 0)),
            hardware: Arc::new(FakeHardware::new()),
            clock: Arc::new(FakeClock::new()),
            omaha: Arc::new(FakeOmahaClient::new()),
            fetchers: Arc::new(MockHttpFetcherFactory::default()),
            p2p: None,
            policy: Mutex::new(None),
            dir,
        }
    }

    /// Like [`FakeSystem::new`] with an enabled P2P manager over a scratch
    /// cache directory.
    pub fn with_p2p() -> Self {
        let mut fake = Self::new();
        let p2p = FakeP2PManager::new(fake.dir.path().join("p2p"));
        fake.p2p = Some(Arc::new(p2p));
        fake
    }

    /// The P2P fake. Panics when built without one.
    pub fn p2p(&self) -> &FakeP2PManager {
        match &self.p2p {
            Some(p2p) => p2p,
            None => panic!("FakeSystem was built without P2P"),
        }
    }

    pub fn set_policy(&self, policy: Option<DevicePolicy>) {
        *self.policy.lock() = policy;
    }

    pub fn dir(&self) -> &std::path::Path {
        self.dir.path()
    }

    pub fn payload_path(&self) -> PathBuf {
        self.dir.path().join("payload.bin")
    }

    pub fn deadline_file(&self) -> PathBuf {
        self.dir.path().join("update-deadline")
    }

    /// Write `contents` to a scratch file and map partition `name` on
    /// `slot` to it.
    pub fn add_partition_device(&self, name: &str, slot: u32, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(format!("{}_{}", name, slot));
        if let Err(e) = std::fs::write(&path, contents) {
            panic!("cannot create fake device {}: {}", path.display(), e);
        }
        self.boot_control.set_partition_device(name, slot, &path);
        path
    }

    pub fn system_state(&self) -> SystemState {
        SystemState {
            prefs: self.prefs.clone(),
            boot_control: self.boot_control.clone(),
            payload_state: self.payload_state.clone(),
            hardware: self.hardware.clone(),
            clock: self.clock.clone(),
            p2p_manager: self.p2p.clone().map(|p2p| p2p as Arc<dyn P2PManager>),
            device_policy: self.policy.lock().clone(),
            omaha_client: self.omaha.clone(),
            fetcher_factory: self.fetchers.clone(),
            payload_path: self.payload_path(),
            deadline_file: Some(self.deadline_file()),
        }
    }
}
