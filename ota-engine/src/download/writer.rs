//! Payload writers and sinks.
//!
//! A [`PayloadSink`] decides where payload bytes go for a given plan and
//! hands out a [`FileWriter`] positioned at the resume offset. The download
//! action wraps that writer in a [`ScopedWriterCloser`] so it is closed on
//! every exit path.
//!
//! # Sinks
//!
//! | Sink                     | Destination                                      |
//! |--------------------------|--------------------------------------------------|
//! | [`FilePayloadSink`]      | One staging file holding the raw payload         |
//! | [`PartitionPayloadSink`] | Target partitions, images laid end to end        |

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use sha2::Sha256;
use tracing::{debug, warn};

use super::checksum::hash_file_prefix;
use crate::install_plan::InstallPlan;

/// Permissions for newly created payload files.
pub const PAYLOAD_FILE_MODE: u32 = 0o600;

/// Sequential writer for payload bytes.
pub trait FileWriter: Send {
    /// Write all of `bytes`. On error nothing is guaranteed about how much
    /// of `bytes` reached the destination.
    fn write(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Flush and release the destination. Further writes fail.
    fn close(&mut self) -> io::Result<()>;
}

/// How [`DirectFileWriter::open`] treats existing content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Create or truncate.
    Truncate,
    /// Create if missing, then append.
    Append,
    /// Write over an existing file or device from the start, keeping its length.
    Overwrite,
}

/// Writer over a single file.
#[derive(Debug)]
pub struct DirectFileWriter {
    path: PathBuf,
    file: Option<File>,
}

impl DirectFileWriter {
    pub fn open(path: &Path, mode: WriteMode, permissions: u32) -> io::Result<Self> {
        let mut options = OpenOptions::new();
        options.write(true).mode(permissions);
        match mode {
            WriteMode::Truncate => options.create(true).truncate(true),
            WriteMode::Append => options.create(true).append(true),
            WriteMode::Overwrite => &mut options,
        };
        let file = options.open(path)?;
        debug!(path = %path.display(), ?mode, "Opened payload writer");
        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn closed_error(&self) -> io::Error {
        io::Error::new(
            io::ErrorKind::BrokenPipe,
            format!("{} is closed", self.path.display()),
        )
    }
}

impl FileWriter for DirectFileWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.write_all(bytes),
            None => Err(self.closed_error()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.file.take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

/// Closes the wrapped writer when dropped, unless closed explicitly first.
pub struct ScopedWriterCloser {
    writer: Box<dyn FileWriter>,
    closed: bool,
}

impl ScopedWriterCloser {
    pub fn new(writer: Box<dyn FileWriter>) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.writer.write(bytes)
    }

    /// Close now and report the result.
    pub fn close(mut self) -> io::Result<()> {
        self.closed = true;
        self.writer.close()
    }
}

impl Drop for ScopedWriterCloser {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.writer.close() {
                warn!(error = %e, "Failed to close payload writer");
            }
        }
    }
}

/// Destination for payload bytes.
pub trait PayloadSink: Send {
    /// Open a writer positioned at payload offset `offset`.
    fn open(&mut self, plan: &InstallPlan, offset: u64) -> io::Result<Box<dyn FileWriter>>;

    /// Feed the first `len` payload bytes already in the sink into `hasher`.
    fn hash_prefix(&mut self, plan: &InstallPlan, len: u64, hasher: &mut Sha256)
        -> io::Result<()>;
}

// =============================================================================
// Staging file sink
// =============================================================================

/// Sink writing the raw payload to one file.
#[derive(Debug, Clone)]
pub struct FilePayloadSink {
    path: PathBuf,
}

impl FilePayloadSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl PayloadSink for FilePayloadSink {
    fn open(&mut self, _plan: &InstallPlan, offset: u64) -> io::Result<Box<dyn FileWriter>> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if offset == 0 {
            let writer = DirectFileWriter::open(&self.path, WriteMode::Truncate, PAYLOAD_FILE_MODE)?;
            return Ok(Box::new(writer));
        }

        // Drop anything past the resume point so appends land at `offset`.
        let file = OpenOptions::new().write(true).open(&self.path)?;
        let existing = file.metadata()?.len();
        if existing < offset {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "{} holds {} bytes, cannot resume at {}",
                    self.path.display(),
                    existing,
                    offset
                ),
            ));
        }
        file.set_len(offset)?;
        drop(file);

        let writer = DirectFileWriter::open(&self.path, WriteMode::Append, PAYLOAD_FILE_MODE)?;
        Ok(Box::new(writer))
    }

    fn hash_prefix(
        &mut self,
        _plan: &InstallPlan,
        len: u64,
        hasher: &mut Sha256,
    ) -> io::Result<()> {
        hash_file_prefix(&self.path, len, hasher)
    }
}

// =============================================================================
// Partition sink
// =============================================================================

/// Sink writing a full payload of raw images straight to the target
/// partitions, in plan order.
#[derive(Debug, Default, Clone)]
pub struct PartitionPayloadSink;

impl PartitionPayloadSink {
    pub fn new() -> Self {
        Self
    }

    fn targets(plan: &InstallPlan) -> io::Result<Vec<(PathBuf, u64)>> {
        plan.partitions
            .iter()
            .map(|partition| {
                partition
                    .target_path
                    .clone()
                    .map(|path| (path, partition.target_size))
                    .ok_or_else(|| {
                        io::Error::new(
                            io::ErrorKind::NotFound,
                            format!("partition {} has no target device", partition.name),
                        )
                    })
            })
            .collect()
    }
}

impl PayloadSink for PartitionPayloadSink {
    fn open(&mut self, plan: &InstallPlan, offset: u64) -> io::Result<Box<dyn FileWriter>> {
        let targets = Self::targets(plan)?;
        let mut writer = PartitionWriter {
            targets,
            index: 0,
            written: 0,
            current: None,
        };
        writer.seek_to(offset)?;
        Ok(Box::new(writer))
    }

    fn hash_prefix(
        &mut self,
        plan: &InstallPlan,
        len: u64,
        hasher: &mut Sha256,
    ) -> io::Result<()> {
        let mut remaining = len;
        for (path, size) in Self::targets(plan)? {
            if remaining == 0 {
                break;
            }
            let take = remaining.min(size);
            hash_file_prefix(&path, take, hasher)?;
            remaining -= take;
        }
        if remaining > 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "resume offset is past the end of the target partitions",
            ));
        }
        Ok(())
    }
}

/// Writer spreading bytes across consecutive partitions.
struct PartitionWriter {
    targets: Vec<(PathBuf, u64)>,
    index: usize,
    /// Bytes written into `targets[index]`.
    written: u64,
    current: Option<File>,
}

impl PartitionWriter {
    fn seek_to(&mut self, mut offset: u64) -> io::Result<()> {
        self.index = 0;
        while self.index < self.targets.len() && offset >= self.targets[self.index].1 {
            offset -= self.targets[self.index].1;
            self.index += 1;
        }
        if self.index == self.targets.len() && offset > 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "resume offset is past the end of the target partitions",
            ));
        }
        self.written = offset;
        self.current = None;
        Ok(())
    }

    fn current_file(&mut self) -> io::Result<&mut File> {
        if self.current.is_none() {
            let (path, _) = &self.targets[self.index];
            let mut file = OpenOptions::new().write(true).open(path)?;
            file.seek(SeekFrom::Start(self.written))?;
            self.current = Some(file);
        }
        self.current
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "partition not open"))
    }
}

impl FileWriter for PartitionWriter {
    fn write(&mut self, mut bytes: &[u8]) -> io::Result<()> {
        while !bytes.is_empty() {
            if self.index >= self.targets.len() {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "payload is larger than the target partitions",
                ));
            }
            let capacity = self.targets[self.index].1 - self.written;
            if capacity == 0 {
                if let Some(file) = self.current.take() {
                    file.sync_all()?;
                }
                self.index += 1;
                self.written = 0;
                continue;
            }
            let take = (bytes.len() as u64).min(capacity) as usize;
            self.current_file()?.write_all(&bytes[..take])?;
            self.written += take as u64;
            bytes = &bytes[take..];
        }
        Ok(())
    }

    fn close(&mut self) -> io::Result<()> {
        match self.current.take() {
            Some(file) => file.sync_all(),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::install_plan::Partition;
    use sha2::Digest;
    use tempfile::TempDir;

    #[test]
    fn test_direct_writer_truncate_and_append() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.bin");

        let mut writer = DirectFileWriter::open(&path, WriteMode::Truncate, 0o600).unwrap();
        writer.write(b"hello").unwrap();
        writer.close().unwrap();

        let mut writer = DirectFileWriter::open(&path, WriteMode::Append, 0o600).unwrap();
        writer.write(b" world").unwrap();
        writer.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn test_write_after_close_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.bin");
        let mut writer = DirectFileWriter::open(&path, WriteMode::Truncate, 0o600).unwrap();
        writer.close().unwrap();
        assert!(writer.write(b"x").is_err());
    }

    #[test]
    fn test_scoped_closer_closes_on_drop() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.bin");
        {
            let writer = DirectFileWriter::open(&path, WriteMode::Truncate, 0o600).unwrap();
            let mut scoped = ScopedWriterCloser::new(Box::new(writer));
            scoped.write(b"data").unwrap();
        }
        assert_eq!(std::fs::read(&path).unwrap(), b"data");
    }

    #[test]
    fn test_file_sink_resume_trims_tail() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("payload.bin");
        std::fs::write(&path, b"0123456789").unwrap();

        let plan = InstallPlan::default();
        let mut sink = FilePayloadSink::new(&path);
        let mut writer = sink.open(&plan, 4).unwrap();
        writer.write(b"abc").unwrap();
        writer.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), b"0123abc");
    }

    #[test]
    fn test_file_sink_resume_past_end_fails() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("payload.bin");
        std::fs::write(&path, b"01").unwrap();

        let mut sink = FilePayloadSink::new(&path);
        assert!(sink.open(&InstallPlan::default(), 5).is_err());
    }

    fn partition_plan(temp: &TempDir, sizes: &[u64]) -> InstallPlan {
        let mut plan = InstallPlan::default();
        for (i, size) in sizes.iter().enumerate() {
            let path = temp.path().join(format!("part{}", i));
            std::fs::write(&path, vec![0u8; *size as usize]).unwrap();
            let mut partition = Partition::new(format!("part{}", i));
            partition.target_path = Some(path);
            partition.target_size = *size;
            plan.partitions.push(partition);
        }
        plan
    }

    #[test]
    fn test_partition_sink_spans_partitions() {
        let temp = TempDir::new().unwrap();
        let plan = partition_plan(&temp, &[4, 6]);

        let mut sink = PartitionPayloadSink::new();
        let mut writer = sink.open(&plan, 0).unwrap();
        writer.write(b"abcdef").unwrap();
        writer.write(b"ghij").unwrap();
        writer.close().unwrap();

        assert_eq!(std::fs::read(temp.path().join("part0")).unwrap(), b"abcd");
        assert_eq!(std::fs::read(temp.path().join("part1")).unwrap(), b"efghij");
    }

    #[test]
    fn test_partition_sink_resume_and_prefix_hash() {
        let temp = TempDir::new().unwrap();
        let plan = partition_plan(&temp, &[4, 6]);

        let mut sink = PartitionPayloadSink::new();
        let mut writer = sink.open(&plan, 0).unwrap();
        writer.write(b"abcdef").unwrap();
        writer.close().unwrap();

        let mut writer = sink.open(&plan, 6).unwrap();
        writer.write(b"ghij").unwrap();
        writer.close().unwrap();
        assert_eq!(std::fs::read(temp.path().join("part1")).unwrap(), b"efghij");

        let mut hasher = Sha256::new();
        sink.hash_prefix(&plan, 7, &mut hasher).unwrap();
        let mut expected = Sha256::new();
        expected.update(b"abcdefg");
        assert_eq!(hasher.finalize(), expected.finalize());
    }

    #[test]
    fn test_partition_sink_overflow() {
        let temp = TempDir::new().unwrap();
        let plan = partition_plan(&temp, &[2]);

        let mut sink = PartitionPayloadSink::new();
        let mut writer = sink.open(&plan, 0).unwrap();
        let err = writer.write(b"abc").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
    }

    #[test]
    fn test_partition_sink_missing_target() {
        let mut plan = InstallPlan::default();
        plan.partitions.push(Partition::new("system"));
        let mut sink = PartitionPayloadSink::new();
        assert!(sink.open(&plan, 0).is_err());
    }
}
