//! HTTP byte-range fetching.
//!
//! The download action drives a fetcher one chunk at a time:
//!
//! ```text
//! set_offset(k) -> begin_transfer(url) -> next_chunk()* -> Ok(None)
//! ```
//!
//! Every call that touches the network is a future, so the action can race
//! it against cancellation. Dropping an in-flight `next_chunk` future and
//! calling [`HttpFetcher::terminate_transfer`] releases the connection.

use std::time::Duration;

use bytes::Bytes;
use reqwest::header::RANGE;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tracing::{debug, info};

use crate::BoxFuture;

/// Default overall connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// How long to wait for the next chunk from an origin server.
pub const DEFAULT_CHUNK_TIMEOUT: Duration = Duration::from_secs(90);

/// How long to wait for the next chunk from a peer. Peers are on the local
/// network, so a stall means the peer went away.
pub const PEER_CHUNK_TIMEOUT: Duration = Duration::from_secs(30);

/// Transfer failures.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("server returned HTTP status {0}")]
    HttpStatus(u16),

    #[error("server ignored the range request for offset {0}")]
    RangeIgnored(u64),

    #[error("timed out waiting for data")]
    Timeout,

    #[error("no transfer in progress")]
    NotStarted,

    #[error("transport error: {0}")]
    Transport(String),
}

/// Source of payload bytes.
pub trait HttpFetcher: Send {
    /// Byte offset the next transfer starts from.
    fn set_offset(&mut self, offset: u64);

    fn begin_transfer<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<(), FetchError>>;

    /// Next chunk of the body, `None` once the body is complete.
    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, FetchError>>;

    /// Abandon the transfer in progress, if any.
    fn terminate_transfer(&mut self);

    /// Status of the last response, 0 if none was received.
    fn http_response_code(&self) -> u16;

    /// Tune timeouts for downloading from a peer.
    fn configure_for_peer(&mut self) {}
}

/// Creates a fresh fetcher for each download.
pub trait HttpFetcherFactory: Send + Sync {
    fn create(&self) -> Box<dyn HttpFetcher>;
}

/// Fetcher built on reqwest.
pub struct ReqwestFetcher {
    client: Client,
    offset: u64,
    response: Option<Response>,
    http_response_code: u16,
    chunk_timeout: Duration,
}

impl ReqwestFetcher {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            offset: 0,
            response: None,
            http_response_code: 0,
            chunk_timeout: DEFAULT_CHUNK_TIMEOUT,
        }
    }

    pub fn with_chunk_timeout(mut self, timeout: Duration) -> Self {
        self.chunk_timeout = timeout;
        self
    }
}

impl HttpFetcher for ReqwestFetcher {
    fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    fn begin_transfer<'a>(&'a mut self, url: &'a str) -> BoxFuture<'a, Result<(), FetchError>> {
        Box::pin(async move {
            let mut request = self.client.get(url);
            if self.offset > 0 {
                request = request.header(RANGE, format!("bytes={}-", self.offset));
            }
            debug!(url, offset = self.offset, "Starting transfer");

            let response = request
                .send()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            let status = response.status();
            self.http_response_code = status.as_u16();

            if !status.is_success() {
                return Err(FetchError::HttpStatus(status.as_u16()));
            }
            if self.offset > 0 && status != StatusCode::PARTIAL_CONTENT {
                return Err(FetchError::RangeIgnored(self.offset));
            }
            self.response = Some(response);
            Ok(())
        })
    }

    fn next_chunk(&mut self) -> BoxFuture<'_, Result<Option<Bytes>, FetchError>> {
        Box::pin(async move {
            let response = self.response.as_mut().ok_or(FetchError::NotStarted)?;
            let chunk = tokio::time::timeout(self.chunk_timeout, response.chunk())
                .await
                .map_err(|_| FetchError::Timeout)?
                .map_err(|e| FetchError::Transport(e.to_string()))?;
            if chunk.is_none() {
                self.response = None;
            }
            Ok(chunk)
        })
    }

    fn terminate_transfer(&mut self) {
        if self.response.take().is_some() {
            info!("Transfer terminated");
        }
    }

    fn http_response_code(&self) -> u16 {
        self.http_response_code
    }

    fn configure_for_peer(&mut self) {
        self.chunk_timeout = PEER_CHUNK_TIMEOUT;
    }
}

/// Factory sharing one reqwest client across fetchers.
#[derive(Clone)]
pub struct ReqwestFetcherFactory {
    client: Client,
    chunk_timeout: Duration,
}

impl ReqwestFetcherFactory {
    pub fn new(connect_timeout: Duration, chunk_timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| FetchError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            chunk_timeout,
        })
    }
}

impl HttpFetcherFactory for ReqwestFetcherFactory {
    fn create(&self) -> Box<dyn HttpFetcher> {
        Box::new(ReqwestFetcher::new(self.client.clone()).with_chunk_timeout(self.chunk_timeout))
    }
}
