//! Scripted fetchers and failing writers.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use sha2::Sha256;
use tokio_util::sync::CancellationToken;

use crate::download::{
    DirectFileWriter, FetchError, FileWriter, HttpFetcher, HttpFetcherFactory, PayloadSink,
    WriteMode, PAYLOAD_FILE_MODE,
};
use crate::install_plan::InstallPlan;
use crate::BoxFuture;

const DEFAULT_MOCK_CHUNK_SIZE: usize = 4096;

/// What a [`MockHttpFetcher`] was asked to do.
#[derive(Debug, Clone, Default)]
pub struct FetchLog {
    /// Start offset of every transfer.
    pub offsets: Vec<u64>,
    pub urls: Vec<String>,
    pub peer_configured: bool,
    pub terminated: bool,
}

/// Serves a fixed body from memory.
///
/// Answers 200 for a transfer from offset 0, 206 for a ranged one and 416
/// when the offset is past the end. Clones share the log.
#[derive(Debug, Clone)]
pub struct MockHttpFetcher {
    data: Arc<Vec<u8>>,
    chunk_size: usize,
    fail_status: Option<u16>,
    fail_after: Option<usize>,
    stall_after: Option<usize>,
    cancel_on_stall: Option<CancellationToken>,
    offset: u64,
    position: Option<usize>,
    chunks_served: usize,
    http_response_code: u16,
    log: Arc<Mutex<FetchLog>>,
}

impl MockHttpFetcher {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: Arc::new(data),
            chunk_size: DEFAULT_MOCK_CHUNK_SIZE,
            fail_status: None,
            fail_after: None,
            stall_after: None,
            cancel_on_stall: None,
            offset: 0,
            position: None,
            chunks_served: 0,
            http_response_code: 0,
            log: Arc::new(Mutex::new(FetchLog::default())),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    /// Reject every transfer with `status`.
    pub fn fail_with_status(mut self, status: u16) -> Self {
        self.fail_status = Some(status);
        self
    }

    /// Drop the connection after serving `chunks` chunks.
    pub fn fail_after(mut self, chunks: usize) -> Self {
        self.fail_after = Some(chunks);
        self
    }

    /// Stop producing data after `chunks` chunks without ending the body.
    pub fn stall_after(mut self, chunks: usize) -> Self {
        self.stall_after = Some(chunks);
        self
    }

    /// Cancel `token` when the stall begins.
    pub fn cancel_on_stall(mut self, token: CancellationToken) -> Self {
        self.cancel_on_stall = Some(token);
        self
    }

    pub fn log(&self) -> Arc<Mutex<FetchLog>> {
        self.log.clone()
    }
}

impl HttpFetcher for MockHttpFetcher {
    fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    fn begin_transfer<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<(), FetchError>> {
        Box::pin(async move {
            {
                let mut log = self.log.lock();
                log.offsets.push(self.offset);
                log.urls.push(url.to_string());
            }
            if let Some(status) = self.fail_status {
                self.http_response_code = status;
                return Err(FetchError::HttpStatus(status));
            }
            if self.offset > self.data.len() as u64 {
                self.http_response_code = 416;
                return Err(FetchError::HttpStatus(416));
            }
            self.http_response_code = if self.offset == 0 { 200 } else { 206 };
            self.position = Some(self.offset as usize);
            self.chunks_served = 0;
            Ok(())
        })
    }

    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, FetchError>> {
        Box::pin(async move {
            let position = self.position.ok_or(FetchError::NotStarted)?;
            if self.stall_after == Some(self.chunks_served) {
                if let Some(token) = &self.cancel_on_stall {
                    token.cancel();
                }
                std::future::pending::<()>().await;
            }
            if self.fail_after == Some(self.chunks_served) {
                self.position = None;
                return Err(FetchError::Transport("connection reset".into()));
            }
            if position >= self.data.len() {
                self.position = None;
                return Ok(None);
            }
            let end = (position + self.chunk_size).min(self.data.len());
            self.position = Some(end);
            self.chunks_served += 1;
            Ok(Some(Bytes::copy_from_slice(&self.data[position..end])))
        })
    }

    fn terminate_transfer(&mut self) {
        self.position = None;
        self.log.lock().terminated = true;
    }

    fn http_response_code(&self) -> u16 {
        self.http_response_code
    }

    fn configure_for_peer(&mut self) {
        self.log.lock().peer_configured = true;
    }
}

/// Hands out clones of a template fetcher.
#[derive(Debug)]
pub struct MockHttpFetcherFactory {
    template: Mutex<MockHttpFetcher>,
}

impl Default for MockHttpFetcherFactory {
    fn default() -> Self {
        Self::new(MockHttpFetcher::new(Vec::new()))
    }
}

impl MockHttpFetcherFactory {
    pub fn new(fetcher: MockHttpFetcher) -> Self {
        Self {
            template: Mutex::new(fetcher),
        }
    }

    /// Replace the template used by later downloads.
    pub fn set(&self, fetcher: MockHttpFetcher) {
        *self.template.lock() = fetcher;
    }

    /// Log of the current template, shared with every fetcher created
    /// from it.
    pub fn log(&self) -> Arc<Mutex<FetchLog>> {
        self.template.lock().log()
    }
}

impl HttpFetcherFactory for MockHttpFetcherFactory {
    fn create(&self) -> Box<dyn HttpFetcher> {
        Box::new(self.template.lock().clone())
    }
}

/// Writer that fails on the write with index `fail_on` (0-based).
///
/// Writes before the failing one go to `inner`, when there is one.
pub struct FailingWriter {
    inner: Option<Box<dyn FileWriter>>,
    fail_on: usize,
    writes: usize,
}

impl FailingWriter {
    pub fn new(fail_on: usize) -> Self {
        Self {
            inner: None,
            fail_on,
            writes: 0,
        }
    }

    pub fn wrapping(inner: Box<dyn FileWriter>, fail_on: usize) -> Self {
        Self {
            inner: Some(inner),
            fail_on,
            writes: 0,
        }
    }
}

impl FileWriter for FailingWriter {
    fn write(&mut self, bytes: &[u8]) -> io::Result<()> {
        let index = self.writes;
        self.writes += 1;
        if index >= self.fail_on {
            return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
        }
        match self.inner.as_mut() {
            Some(inner) => inner.write(bytes),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.close(),
            None => Ok(()),
        }
    }
}

/// Sink whose writers are [`FailingWriter`]s, optionally backed by a file.
#[derive(Debug)]
pub struct FailingSink {
    fail_on: usize,
    path: Option<PathBuf>,
}

impl FailingSink {
    pub fn new(fail_on: usize) -> Self {
        Self {
            fail_on,
            path: None,
        }
    }

    /// Write to `path` (truncated on open) until the failing write.
    pub fn with_file(path: impl Into<PathBuf>, fail_on: usize) -> Self {
        Self {
            fail_on,
            path: Some(path.into()),
        }
    }
}

impl PayloadSink for FailingSink {
    fn open(&mut self, _plan: &InstallPlan, _offset: u64) -> io::Result<Box<dyn FileWriter>> {
        let writer = match &self.path {
            Some(path) => {
                let file = DirectFileWriter::open(path, WriteMode::Truncate, PAYLOAD_FILE_MODE)?;
                FailingWriter::wrapping(Box::new(file), self.fail_on)
            }
            None => FailingWriter::new(self.fail_on),
        };
        Ok(Box::new(writer))
    }

    fn hash_prefix(
        &mut self,
        _plan: &InstallPlan,
        _len: u64,
        _hasher: &mut Sha256,
    ) -> io::Result<()> {
        Ok(())
    }
}
