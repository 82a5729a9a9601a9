//! Directory-backed P2P manager.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{P2PManager, P2P_EXTENSION, P2P_TMP_EXTENSION};
use crate::BoxFuture;

/// Number of shared files kept by housekeeping.
pub const MAX_FILES_TO_KEEP: usize = 3;

/// Shared files older than this are removed by housekeeping.
pub const MAX_FILE_AGE: Duration = Duration::from_secs(5 * 24 * 60 * 60);

/// How long a peer lookup may take.
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(60);

/// How long the server start command may take.
const SERVER_START_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct ShareMeta {
    expected_size: u64,
}

/// P2P manager keeping shared files in a local directory.
#[derive(Debug, Clone)]
pub struct DirP2PManager {
    dir: PathBuf,
    enabled: bool,
    server_command: Option<String>,
    client_command: Option<String>,
    max_files_to_keep: usize,
    max_file_age: Duration,
}

impl DirP2PManager {
    pub fn new(dir: impl Into<PathBuf>, enabled: bool) -> Self {
        Self {
            dir: dir.into(),
            enabled,
            server_command: None,
            client_command: None,
            max_files_to_keep: MAX_FILES_TO_KEEP,
            max_file_age: MAX_FILE_AGE,
        }
    }

    /// Command that starts the local P2P server.
    pub fn with_server_command(mut self, command: impl Into<String>) -> Self {
        self.server_command = Some(command.into());
        self
    }

    /// Command used to look up peers, invoked as
    /// `<command> --get-url=<file_id> --minimum-size=<n>`.
    pub fn with_client_command(mut self, command: impl Into<String>) -> Self {
        self.client_command = Some(command.into());
        self
    }

    pub fn with_housekeeping_limits(mut self, max_files: usize, max_age: Duration) -> Self {
        self.max_files_to_keep = max_files;
        self.max_file_age = max_age;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn visible_path(&self, file_id: &str) -> PathBuf {
        self.dir.join(format!("{}{}", file_id, P2P_EXTENSION))
    }

    fn tmp_path(&self, file_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", file_id, P2P_EXTENSION, P2P_TMP_EXTENSION))
    }

    fn meta_path(&self, file_id: &str) -> PathBuf {
        self.dir.join(format!("{}.meta.json", file_id))
    }

    fn write_meta(&self, file_id: &str, expected_size: u64) -> io::Result<()> {
        let meta = serde_json::to_vec(&ShareMeta { expected_size })?;
        fs::write(self.meta_path(file_id), meta)
    }

    /// Shared files with their modification times, newest first. A missing
    /// directory holds no files.
    fn shared_files(&self) -> io::Result<Vec<(PathBuf, SystemTime)>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let shared = name.ends_with(P2P_EXTENSION)
                || name.ends_with(&format!("{}{}", P2P_EXTENSION, P2P_TMP_EXTENSION));
            if !shared {
                continue;
            }
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            files.push((entry.path(), modified));
        }
        files.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(files)
    }

    /// Ids of the shared files in the directory, newest first.
    pub fn shared_file_ids(&self) -> io::Result<Vec<String>> {
        Ok(self
            .shared_files()?
            .iter()
            .filter_map(|(path, _)| Self::file_id_of(path))
            .collect())
    }

    /// Strip the shared-file extensions to recover the file id.
    fn file_id_of(path: &Path) -> Option<String> {
        let name = path.file_name()?.to_string_lossy();
        let name = name.strip_suffix(P2P_TMP_EXTENSION).unwrap_or(&name);
        name.strip_suffix(P2P_EXTENSION).map(str::to_string)
    }
}

impl P2PManager for DirP2PManager {
    fn is_p2p_enabled(&self) -> bool {
        self.enabled
    }

    fn ensure_p2p_running(&self) -> BoxFuture<'_, bool> {
        Box::pin(async move {
            let Some(command) = &self.server_command else {
                return true;
            };
            let start = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(command)
                .kill_on_drop(true)
                .status();
            match tokio::time::timeout(SERVER_START_TIMEOUT, start).await {
                Ok(Ok(status)) if status.success() => true,
                Ok(Ok(status)) => {
                    warn!(command = %command, ?status, "P2P server command failed");
                    false
                }
                Ok(Err(e)) => {
                    warn!(command = %command, error = %e, "Failed to run P2P server command");
                    false
                }
                Err(_) => {
                    warn!(command = %command, "P2P server command timed out");
                    false
                }
            }
        })
    }

    fn perform_housekeeping(&self) -> bool {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "Cannot create P2P directory");
            return false;
        }
        let files = match self.shared_files() {
            Ok(files) => files,
            Err(e) => {
                warn!(dir = %self.dir.display(), error = %e, "P2P housekeeping failed");
                return false;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for (index, (path, modified)) in files.iter().enumerate() {
            let age = now.duration_since(*modified).unwrap_or(Duration::ZERO);
            if index < self.max_files_to_keep && age <= self.max_file_age {
                continue;
            }
            debug!(path = %path.display(), ?age, "Removing shared file");
            if let Some(file_id) = Self::file_id_of(path) {
                let _ = fs::remove_file(self.meta_path(&file_id));
            }
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove shared file"),
            }
        }
        info!(kept = files.len() - removed, removed, "P2P housekeeping done");
        true
    }

    fn count_shared_files(&self) -> usize {
        self.shared_files().map(|files| files.len()).unwrap_or(0)
    }

    fn file_share(&self, file_id: &str, expected_size: u64) -> bool {
        if let Some(existing) = self.file_get_expected_size(file_id) {
            if self.file_get_path(file_id).is_some() {
                if existing != expected_size {
                    warn!(
                        file_id,
                        existing, expected_size, "Shared file has a different expected size"
                    );
                    return false;
                }
                return true;
            }
        }

        if let Err(e) = fs::create_dir_all(&self.dir) {
            warn!(dir = %self.dir.display(), error = %e, "Cannot create P2P directory");
            return false;
        }
        if self.file_get_path(file_id).is_none() {
            if let Err(e) = fs::File::create(self.tmp_path(file_id)) {
                warn!(file_id, error = %e, "Cannot create shared file");
                return false;
            }
        }
        match self.write_meta(file_id, expected_size) {
            Ok(()) => true,
            Err(e) => {
                warn!(file_id, error = %e, "Cannot record shared file size");
                false
            }
        }
    }

    fn file_get_path(&self, file_id: &str) -> Option<PathBuf> {
        let visible = self.visible_path(file_id);
        if visible.is_file() {
            return Some(visible);
        }
        let tmp = self.tmp_path(file_id);
        tmp.is_file().then_some(tmp)
    }

    fn file_get_size(&self, file_id: &str) -> Option<u64> {
        let path = self.file_get_path(file_id)?;
        fs::metadata(path).ok().map(|m| m.len())
    }

    fn file_get_expected_size(&self, file_id: &str) -> Option<u64> {
        let bytes = fs::read(self.meta_path(file_id)).ok()?;
        serde_json::from_slice::<ShareMeta>(&bytes)
            .ok()
            .map(|meta| meta.expected_size)
    }

    fn file_get_visible(&self, file_id: &str) -> Option<bool> {
        if self.visible_path(file_id).is_file() {
            Some(true)
        } else if self.tmp_path(file_id).is_file() {
            Some(false)
        } else {
            None
        }
    }

    fn file_make_visible(&self, file_id: &str) -> bool {
        match self.file_get_visible(file_id) {
            Some(true) => true,
            Some(false) => fs::rename(self.tmp_path(file_id), self.visible_path(file_id))
                .map_err(|e| warn!(file_id, error = %e, "Cannot make shared file visible"))
                .is_ok(),
            None => false,
        }
    }

    fn file_remove(&self, file_id: &str) -> bool {
        let mut removed = false;
        for path in [self.visible_path(file_id), self.tmp_path(file_id)] {
            if fs::remove_file(&path).is_ok() {
                removed = true;
            }
        }
        let _ = fs::remove_file(self.meta_path(file_id));
        removed
    }

    fn lookup_url_for_file<'a>(
        &'a self,
        file_id: &'a str,
        minimum_size: u64,
    ) -> BoxFuture<'a, Option<String>> {
        Box::pin(async move {
            let command = self.client_command.as_ref()?;
            let lookup = tokio::process::Command::new(command)
                .arg(format!("--get-url={}", file_id))
                .arg(format!("--minimum-size={}", minimum_size))
                .kill_on_drop(true)
                .output();

            let output = match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
                Ok(Ok(output)) => output,
                Ok(Err(e)) => {
                    warn!(command = %command, error = %e, "Peer lookup failed to start");
                    return None;
                }
                Err(_) => {
                    warn!(file_id, "Peer lookup timed out");
                    return None;
                }
            };
            if !output.status.success() {
                info!(file_id, "No peer has the file");
                return None;
            }
            let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
            (!url.is_empty()).then_some(url)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use tempfile::TempDir;

    #[test]
    fn test_file_share_creates_hidden_file() {
        let temp = TempDir::new().unwrap();
        let manager = DirP2PManager::new(temp.path(), true);

        assert!(manager.file_share("f1", 1000));
        assert_eq!(manager.file_get_visible("f1"), Some(false));
        assert_eq!(manager.file_get_size("f1"), Some(0));
        assert_eq!(manager.file_get_expected_size("f1"), Some(1000));
    }

    #[test]
    fn test_file_share_existing_mismatched_size() {
        let temp = TempDir::new().unwrap();
        let manager = DirP2PManager::new(temp.path(), true);

        assert!(manager.file_share("f1", 1000));
        assert!(manager.file_share("f1", 1000));
        assert!(!manager.file_share("f1", 2000));
    }

    #[test]
    fn test_make_visible_and_remove() {
        let temp = TempDir::new().unwrap();
        let manager = DirP2PManager::new(temp.path(), true);

        assert!(!manager.file_make_visible("f1"));
        manager.file_share("f1", 10);
        assert!(manager.file_make_visible("f1"));
        assert_eq!(manager.file_get_visible("f1"), Some(true));
        assert!(manager
            .file_get_path("f1")
            .unwrap()
            .to_string_lossy()
            .ends_with(".ota.p2p"));

        assert!(manager.file_remove("f1"));
        assert_eq!(manager.file_get_path("f1"), None);
        assert_eq!(manager.file_get_expected_size("f1"), None);
    }

    #[test]
    fn test_shared_file_ids() {
        let temp = TempDir::new().unwrap();
        let manager = DirP2PManager::new(temp.path(), true);
        manager.file_share("hidden", 10);
        manager.file_share("shown", 10);
        manager.file_make_visible("shown");

        let mut ids = manager.shared_file_ids().unwrap();
        ids.sort();
        assert_eq!(ids, vec!["hidden".to_string(), "shown".to_string()]);
    }

    #[test]
    fn test_count_shared_files_ignores_other_files() {
        let temp = TempDir::new().unwrap();
        let manager = DirP2PManager::new(temp.path(), true);
        manager.file_share("f1", 10);
        manager.file_share("f2", 10);
        manager.file_make_visible("f2");
        fs::write(temp.path().join("unrelated.txt"), "x").unwrap();

        assert_eq!(manager.count_shared_files(), 2);
    }

    #[test]
    fn test_housekeeping_keeps_newest_files() {
        let temp = TempDir::new().unwrap();
        let manager = DirP2PManager::new(temp.path(), true);
        let now = FileTime::now().unix_seconds();

        for i in 0..5i64 {
            let id = format!("f{}", i);
            manager.file_share(&id, 10);
            manager.file_make_visible(&id);
            let path = manager.file_get_path(&id).unwrap();
            filetime::set_file_mtime(&path, FileTime::from_unix_time(now - 100 + i, 0)).unwrap();
        }

        assert!(manager.perform_housekeeping());
        assert_eq!(manager.count_shared_files(), MAX_FILES_TO_KEEP);
        assert!(manager.file_get_path("f4").is_some());
        assert!(manager.file_get_path("f2").is_some());
        assert!(manager.file_get_path("f1").is_none());
        assert!(manager.file_get_path("f0").is_none());
        assert_eq!(manager.file_get_expected_size("f0"), None);
    }

    #[test]
    fn test_housekeeping_removes_old_files() {
        let temp = TempDir::new().unwrap();
        let manager = DirP2PManager::new(temp.path(), true);
        let now = FileTime::now().unix_seconds();

        manager.file_share("old", 10);
        let old = manager.file_get_path("old").unwrap();
        let six_days = 6 * 24 * 60 * 60;
        filetime::set_file_mtime(&old, FileTime::from_unix_time(now - six_days, 0)).unwrap();
        manager.file_share("fresh", 10);

        assert!(manager.perform_housekeeping());
        assert!(manager.file_get_path("old").is_none());
        assert!(manager.file_get_path("fresh").is_some());
    }

    #[test]
    fn test_housekeeping_creates_missing_dir() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("cache").join("p2p");
        let manager = DirP2PManager::new(&dir, true);

        assert_eq!(manager.count_shared_files(), 0);
        assert!(manager.shared_file_ids().unwrap().is_empty());
        assert!(manager.perform_housekeeping());
        assert!(dir.is_dir());
    }

    #[test]
    fn test_housekeeping_fails_when_dir_cannot_be_created() {
        let temp = TempDir::new().unwrap();
        let blocker = temp.path().join("file");
        fs::write(&blocker, "x").unwrap();
        let manager = DirP2PManager::new(blocker.join("p2p"), true);

        assert!(!manager.perform_housekeeping());
        assert_eq!(manager.count_shared_files(), 0);
    }

    #[tokio::test]
    async fn test_ensure_running_without_server_command() {
        let temp = TempDir::new().unwrap();
        let manager = DirP2PManager::new(temp.path(), true);
        assert!(manager.ensure_p2p_running().await);
    }

    #[tokio::test]
    async fn test_ensure_running_reports_command_status() {
        let temp = TempDir::new().unwrap();
        let ok = DirP2PManager::new(temp.path(), true).with_server_command("true");
        assert!(ok.ensure_p2p_running().await);
        let failing = DirP2PManager::new(temp.path(), true).with_server_command("exit 3");
        assert!(!failing.ensure_p2p_running().await);
    }

    #[tokio::test]
    async fn test_lookup_without_client_command() {
        let temp = TempDir::new().unwrap();
        let manager = DirP2PManager::new(temp.path(), true);
        assert_eq!(manager.lookup_url_for_file("f1", 0).await, None);
    }
}
