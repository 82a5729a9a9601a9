//! Mirroring downloaded bytes into the P2P shared file.

use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::os::unix::io::AsRawFd;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::p2p::P2PManager;

/// Shared files are world-readable so the local P2P server can serve them.
const SHARED_FILE_MODE: u32 = 0o644;

/// Why sharing stopped for this attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ShareStop {
    /// The file could not be set up or written.
    Failed,
    /// Another process holds the file.
    Locked,
    /// The file is shorter than the write offset.
    Hole,
}

/// Writer side of one shared payload file.
///
/// The file is opened lazily on the first write so that the hole check
/// sees the resume offset. Writes are positional, so a chunk lands at its
/// payload offset regardless of what the file held before.
pub(crate) struct SharedFileWriter {
    p2p: Arc<dyn P2PManager>,
    file_id: String,
    expected_size: u64,
    file: Option<File>,
    visible: bool,
}

impl SharedFileWriter {
    pub(crate) fn new(p2p: Arc<dyn P2PManager>, file_id: String, expected_size: u64) -> Self {
        Self {
            p2p,
            file_id,
            expected_size,
            file: None,
            visible: false,
        }
    }

    pub(crate) fn file_id(&self) -> &str {
        &self.file_id
    }

    pub(crate) fn is_visible(&self) -> bool {
        self.visible
    }

    fn open(&mut self) -> Result<(), ShareStop> {
        let p2p = self.p2p.as_ref();
        if !p2p.file_share(&self.file_id, self.expected_size) {
            warn!(file_id = %self.file_id, "Unable to share file");
            return Err(ShareStop::Failed);
        }
        let path = p2p.file_get_path(&self.file_id).ok_or(ShareStop::Failed)?;

        let file = OpenOptions::new().write(true).open(&path).map_err(|e| {
            warn!(path = %path.display(), error = %e, "Unable to open shared file");
            ShareStop::Failed
        })?;

        // SAFETY: the descriptor belongs to `file`, which outlives the call.
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            warn!(path = %path.display(), "Shared file is locked by another writer");
            return Err(ShareStop::Locked);
        }

        if let Err(e) = fs::set_permissions(&path, fs::Permissions::from_mode(SHARED_FILE_MODE)) {
            debug!(path = %path.display(), error = %e, "Unable to relax shared file mode");
        }

        self.visible = p2p.file_get_visible(&self.file_id).unwrap_or(false);
        debug!(path = %path.display(), visible = self.visible, "Opened shared file");
        self.file = Some(file);
        Ok(())
    }

    /// Write `data` at payload offset `offset`.
    pub(crate) fn write(&mut self, offset: u64, data: &[u8]) -> Result<(), ShareStop> {
        if self.file.is_none() {
            self.open()?;
        }
        let Some(file) = self.file.as_ref() else {
            return Err(ShareStop::Failed);
        };

        let len = file.metadata().map(|m| m.len()).map_err(|_| ShareStop::Failed)?;
        if len < offset {
            info!(
                file_id = %self.file_id,
                len,
                offset,
                "Shared file has a hole, discarding it"
            );
            return Err(ShareStop::Hole);
        }

        file.write_all_at(data, offset).map_err(|e| {
            warn!(file_id = %self.file_id, error = %e, "Write to shared file failed");
            ShareStop::Failed
        })
    }

    /// Advertise the file to peers.
    pub(crate) fn make_visible(&mut self) {
        if self.visible || self.file.is_none() {
            return;
        }
        if self.p2p.file_make_visible(&self.file_id) {
            info!(file_id = %self.file_id, "Shared file is now visible to peers");
            self.visible = true;
        }
    }

    /// Release the file, deleting it when `delete` is set.
    pub(crate) fn close(mut self, delete: bool) {
        // Dropping the handle releases the lock before the unlink.
        self.file = None;
        if delete {
            info!(file_id = %self.file_id, "Deleting shared file");
            self.p2p.file_remove(&self.file_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::p2p::DirP2PManager;
    use proptest::prelude::*;
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> Arc<DirP2PManager> {
        Arc::new(DirP2PManager::new(temp.path(), true))
    }

    fn writer(p2p: &Arc<DirP2PManager>, expected_size: u64) -> SharedFileWriter {
        SharedFileWriter::new(p2p.clone(), "payload".to_string(), expected_size)
    }

    #[test]
    fn test_write_past_end_is_a_hole() {
        let temp = TempDir::new().unwrap();
        let p2p = manager(&temp);
        let mut shared = writer(&p2p, 1000);

        shared.write(0, &[1u8; 100]).unwrap();
        assert_eq!(shared.write(200, &[2u8; 100]), Err(ShareStop::Hole));

        shared.close(true);
        assert!(p2p.file_get_path("payload").is_none());
    }

    #[test]
    fn test_resume_appends_to_existing_file() {
        let temp = TempDir::new().unwrap();
        let p2p = manager(&temp);
        let mut first = writer(&p2p, 300);
        first.write(0, &[1u8; 100]).unwrap();
        first.close(false);

        let mut second = writer(&p2p, 300);
        second.write(100, &[2u8; 100]).unwrap();
        second.close(false);

        let path = p2p.file_get_path("payload").unwrap();
        let contents = fs::read(path).unwrap();
        assert_eq!(contents.len(), 200);
        assert!(contents[..100].iter().all(|b| *b == 1));
        assert!(contents[100..].iter().all(|b| *b == 2));
    }

    #[test]
    fn test_second_writer_is_locked_out() {
        let temp = TempDir::new().unwrap();
        let p2p = manager(&temp);
        let mut first = writer(&p2p, 100);
        first.write(0, &[0u8; 10]).unwrap();

        let mut second = writer(&p2p, 100);
        assert_eq!(second.write(10, &[0u8; 10]), Err(ShareStop::Locked));

        first.close(false);
        assert_eq!(p2p.file_get_size("payload"), Some(10));
    }

    #[test]
    fn test_make_visible_once_opened() {
        let temp = TempDir::new().unwrap();
        let p2p = manager(&temp);
        let mut shared = writer(&p2p, 10);

        shared.make_visible();
        assert!(!shared.is_visible());

        shared.write(0, &[0u8; 10]).unwrap();
        shared.make_visible();
        assert!(shared.is_visible());
        assert_eq!(p2p.file_get_visible(shared.file_id()), Some(true));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_sequential_writes_reproduce_payload(
            data in prop::collection::vec(any::<u8>(), 1..4096),
            chunk in 1usize..700,
        ) {
            let temp = TempDir::new().unwrap();
            let p2p = manager(&temp);
            let mut shared = writer(&p2p, data.len() as u64);

            let mut offset = 0;
            for piece in data.chunks(chunk) {
                prop_assert!(shared.write(offset as u64, piece).is_ok());
                offset += piece.len();
            }
            shared.close(false);

            let path = p2p.file_get_path("payload").unwrap();
            prop_assert_eq!(fs::read(path).unwrap(), data);
        }

        #[test]
        fn prop_any_gap_discards_file(existing in 0usize..512, gap in 1usize..512) {
            let temp = TempDir::new().unwrap();
            let p2p = manager(&temp);
            let mut shared = writer(&p2p, 2048);
            if existing > 0 {
                prop_assert!(shared.write(0, &vec![7u8; existing]).is_ok());
            } else {
                // Open without writing so the hole check sees an empty file.
                prop_assert!(shared.write(0, &[]).is_ok());
            }

            let offset = (existing + gap) as u64;
            prop_assert_eq!(shared.write(offset, &[1u8; 16]), Err(ShareStop::Hole));
            shared.close(true);
            prop_assert!(p2p.file_get_path("payload").is_none());
        }
    }
}
