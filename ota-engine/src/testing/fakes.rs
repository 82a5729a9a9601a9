//! Fake boot control, hardware, clock, update server and P2P manager.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

use crate::omaha::{OmahaClient, OmahaClientError, OmahaEvent, OmahaResponse, RequestParams};
use crate::p2p::{DirP2PManager, P2PManager};
use crate::system::boot_control::{BootControl, Slot, INVALID_SLOT};
use crate::system::clock::Clock;
use crate::system::hardware::Hardware;
use crate::BoxFuture;

// =============================================================================
// Boot control
// =============================================================================

#[derive(Debug, Default)]
struct BootState {
    current_slot: Slot,
    devices: HashMap<(String, Slot), PathBuf>,
    unbootable: HashSet<Slot>,
    active_slot: Option<Slot>,
}

/// Boot control with scripted partitions. All slots start bootable.
#[derive(Debug)]
pub struct FakeBootControl {
    num_slots: u32,
    state: Mutex<BootState>,
}

impl FakeBootControl {
    pub fn new(num_slots: u32, current_slot: Slot) -> Self {
        Self {
            num_slots,
            state: Mutex::new(BootState {
                current_slot,
                ..Default::default()
            }),
        }
    }

    pub fn set_current_slot(&self, slot: Slot) {
        self.state.lock().current_slot = slot;
    }

    pub fn set_partition_device(&self, name: &str, slot: Slot, path: impl Into<PathBuf>) {
        self.state
            .lock()
            .devices
            .insert((name.to_string(), slot), path.into());
    }

    /// Slot most recently marked active, if any.
    pub fn active_slot(&self) -> Option<Slot> {
        self.state.lock().active_slot
    }
}

impl BootControl for FakeBootControl {
    fn num_slots(&self) -> u32 {
        self.num_slots
    }

    fn current_slot(&self) -> Slot {
        self.state.lock().current_slot
    }

    fn partition_device(&self, partition: &str, slot: Slot) -> Option<PathBuf> {
        self.state
            .lock()
            .devices
            .get(&(partition.to_string(), slot))
            .cloned()
    }

    fn is_slot_bootable(&self, slot: Slot) -> bool {
        slot < self.num_slots && !self.state.lock().unbootable.contains(&slot)
    }

    fn set_slot_bootable(&self, slot: Slot, bootable: bool) -> bool {
        if slot >= self.num_slots {
            return false;
        }
        let mut state = self.state.lock();
        if bootable {
            state.unbootable.remove(&slot);
        } else {
            state.unbootable.insert(slot);
        }
        true
    }

    fn set_active_boot_slot(&self, slot: Slot) -> bool {
        if slot == INVALID_SLOT || slot >= self.num_slots {
            return false;
        }
        self.state.lock().active_slot = Some(slot);
        true
    }
}

// =============================================================================
// Hardware
// =============================================================================

#[derive(Debug)]
struct HardwareState {
    official_build: bool,
    normal_boot_mode: bool,
    oobe_enabled: bool,
    oobe_complete: bool,
    boot_id: Option<String>,
    powerwash_result: bool,
    powerwash_scheduled: bool,
}

/// Official build in normal mode, OOBE disabled, powerwash succeeds.
#[derive(Debug)]
pub struct FakeHardware {
    state: Mutex<HardwareState>,
}

impl Default for FakeHardware {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeHardware {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(HardwareState {
                official_build: true,
                normal_boot_mode: true,
                oobe_enabled: false,
                oobe_complete: true,
                boot_id: Some("fake-boot-id".to_string()),
                powerwash_result: true,
                powerwash_scheduled: false,
            }),
        }
    }

    pub fn set_official_build(&self, official: bool) {
        self.state.lock().official_build = official;
    }

    pub fn set_normal_boot_mode(&self, normal: bool) {
        self.state.lock().normal_boot_mode = normal;
    }

    pub fn set_oobe(&self, enabled: bool, complete: bool) {
        let mut state = self.state.lock();
        state.oobe_enabled = enabled;
        state.oobe_complete = complete;
    }

    pub fn set_boot_id(&self, boot_id: Option<&str>) {
        self.state.lock().boot_id = boot_id.map(str::to_string);
    }

    pub fn set_powerwash_result(&self, result: bool) {
        self.state.lock().powerwash_result = result;
    }

    pub fn powerwash_scheduled(&self) -> bool {
        self.state.lock().powerwash_scheduled
    }
}

impl Hardware for FakeHardware {
    fn is_official_build(&self) -> bool {
        self.state.lock().official_build
    }

    fn is_normal_boot_mode(&self) -> bool {
        self.state.lock().normal_boot_mode
    }

    fn is_oobe_enabled(&self) -> bool {
        self.state.lock().oobe_enabled
    }

    fn is_oobe_complete(&self) -> bool {
        self.state.lock().oobe_complete
    }

    fn boot_id(&self) -> Option<String> {
        self.state.lock().boot_id.clone()
    }

    fn schedule_powerwash(&self) -> bool {
        let mut state = self.state.lock();
        if state.powerwash_result {
            state.powerwash_scheduled = true;
        }
        state.powerwash_result
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct FakeClock {
    wallclock: Mutex<DateTime<Utc>>,
    boot_time: Mutex<Duration>,
}

impl Default for FakeClock {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeClock {
    /// Starts at the current wall-clock time, one minute after boot.
    pub fn new() -> Self {
        Self {
            wallclock: Mutex::new(Utc::now()),
            boot_time: Mutex::new(Duration::from_secs(60)),
        }
    }

    pub fn set_wallclock(&self, now: DateTime<Utc>) {
        *self.wallclock.lock() = now;
    }

    pub fn set_boot_time(&self, since_boot: Duration) {
        *self.boot_time.lock() = since_boot;
    }

    /// Move both clocks forward.
    pub fn advance(&self, by: Duration) {
        let delta = TimeDelta::from_std(by).unwrap_or(TimeDelta::zero());
        *self.wallclock.lock() += delta;
        *self.boot_time.lock() += by;
    }
}

impl Clock for FakeClock {
    fn wallclock_now(&self) -> DateTime<Utc> {
        *self.wallclock.lock()
    }

    fn boot_time(&self) -> Duration {
        *self.boot_time.lock()
    }
}

// =============================================================================
// Update server
// =============================================================================

#[derive(Debug, Default)]
struct OmahaState {
    responses: VecDeque<Result<OmahaResponse, OmahaClientError>>,
    reported: Vec<OmahaEvent>,
    sent: Vec<OmahaEvent>,
    checks: Vec<RequestParams>,
    fail_events: bool,
}

/// Update server answering from a queue. With the queue empty every check
/// reports no update.
#[derive(Debug, Default)]
pub struct FakeOmahaClient {
    state: Mutex<OmahaState>,
}

impl FakeOmahaClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: OmahaResponse) {
        self.state.lock().responses.push_back(Ok(response));
    }

    pub fn push_error(&self, error: OmahaClientError) {
        self.state.lock().responses.push_back(Err(error));
    }

    /// Make every `send_event` fail.
    pub fn fail_events(&self, fail: bool) {
        self.state.lock().fail_events = fail;
    }

    /// Every event the server saw, pending events carried by checks
    /// included, in order.
    pub fn reported_events(&self) -> Vec<OmahaEvent> {
        self.state.lock().reported.clone()
    }

    /// Events delivered through `send_event` only.
    pub fn sent_events(&self) -> Vec<OmahaEvent> {
        self.state.lock().sent.clone()
    }

    /// Parameters of every update check, in order.
    pub fn checks(&self) -> Vec<RequestParams> {
        self.state.lock().checks.clone()
    }
}

impl OmahaClient for FakeOmahaClient {
    fn check_for_update<'a>(
        &'a self,
        params: &'a RequestParams,
        pending_event: Option<&'a OmahaEvent>,
    ) -> BoxFuture<'a, Result<OmahaResponse, OmahaClientError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            state.checks.push(params.clone());
            if let Some(event) = pending_event {
                state.reported.push(event.clone());
            }
            state
                .responses
                .pop_front()
                .unwrap_or_else(|| Ok(OmahaResponse::default()))
        })
    }

    fn send_event<'a>(
        &'a self,
        _params: &'a RequestParams,
        event: &'a OmahaEvent,
    ) -> BoxFuture<'a, Result<(), OmahaClientError>> {
        Box::pin(async move {
            let mut state = self.state.lock();
            if state.fail_events {
                return Err(OmahaClientError::Transport("event delivery disabled".into()));
            }
            state.reported.push(event.clone());
            state.sent.push(event.clone());
            Ok(())
        })
    }
}

// =============================================================================
// P2P
// =============================================================================

#[derive(Debug)]
struct P2PState {
    enabled: bool,
    ensure_running: bool,
    housekeeping: bool,
    lookup_url: Option<String>,
    ensure_calls: usize,
    housekeeping_calls: usize,
    lookups: Vec<(String, u64)>,
}

/// P2P manager over a real cache directory with scripted service calls.
#[derive(Debug)]
pub struct FakeP2PManager {
    files: DirP2PManager,
    state: Mutex<P2PState>,
}

impl FakeP2PManager {
    /// Enabled, with the server starting fine and no peers.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            files: DirP2PManager::new(dir, true),
            state: Mutex::new(P2PState {
                enabled: true,
                ensure_running: true,
                housekeeping: true,
                lookup_url: None,
                ensure_calls: 0,
                housekeeping_calls: 0,
                lookups: Vec::new(),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        self.files.dir()
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.state.lock().enabled = enabled;
    }

    pub fn set_ensure_running(&self, result: bool) {
        self.state.lock().ensure_running = result;
    }

    pub fn set_housekeeping_result(&self, result: bool) {
        self.state.lock().housekeeping = result;
    }

    pub fn set_lookup_url(&self, url: Option<String>) {
        self.state.lock().lookup_url = url;
    }

    pub fn ensure_calls(&self) -> usize {
        self.state.lock().ensure_calls
    }

    pub fn housekeeping_calls(&self) -> usize {
        self.state.lock().housekeeping_calls
    }

    /// `(file_id, minimum_size)` of every peer lookup.
    pub fn lookups(&self) -> Vec<(String, u64)> {
        self.state.lock().lookups.clone()
    }
}

impl P2PManager for FakeP2PManager {
    fn is_p2p_enabled(&self) -> bool {
        self.state.lock().enabled
    }

    fn ensure_p2p_running(&self) -> BoxFuture<'_, bool> {
        let mut state = self.state.lock();
        state.ensure_calls += 1;
        let running = state.ensure_running;
        Box::pin(async move { running })
    }

    fn perform_housekeeping(&self) -> bool {
        let result = {
            let mut state = self.state.lock();
            state.housekeeping_calls += 1;
            state.housekeeping
        };
        result && self.files.perform_housekeeping()
    }

    fn count_shared_files(&self) -> usize {
        self.files.count_shared_files()
    }

    fn file_share(&self, file_id: &str, expected_size: u64) -> bool {
        self.files.file_share(file_id, expected_size)
    }

    fn file_get_path(&self, file_id: &str) -> Option<PathBuf> {
        self.files.file_get_path(file_id)
    }

    fn file_get_size(&self, file_id: &str) -> Option<u64> {
        self.files.file_get_size(file_id)
    }

    fn file_get_expected_size(&self, file_id: &str) -> Option<u64> {
        self.files.file_get_expected_size(file_id)
    }

    fn file_get_visible(&self, file_id: &str) -> Option<bool> {
        self.files.file_get_visible(file_id)
    }

    fn file_make_visible(&self, file_id: &str) -> bool {
        self.files.file_make_visible(file_id)
    }

    fn file_remove(&self, file_id: &str) -> bool {
        self.files.file_remove(file_id)
    }

    fn lookup_url_for_file<'a>(
        &'a self,
        file_id: &'a str,
        minimum_size: u64,
    ) -> BoxFuture<'a, Option<String>> {
        let url = {
            let mut state = self.state.lock();
            state.lookups.push((file_id.to_string(), minimum_size));
            state.lookup_url.clone()
        };
        Box::pin(async move { url })
    }
}
