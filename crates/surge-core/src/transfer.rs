//! Transfer client - the single-request capability the engine is built on
//!
//! The engine never talks HTTP directly. It asks a `TransferClient` for one
//! byte range at a time and consumes the body as a stream of chunks.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::Client;
use std::time::Duration;
use surge_types::EngineConfig;
use thiserror::Error;
use tracing::debug;

/// Network-level failures. All of them are worth retrying.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("stream interrupted: {0}")]
    Interrupted(String),

    #[error("stream ended after {received} of {expected} bytes")]
    Incomplete { received: u64, expected: u64 },
}

/// Body of a response, delivered chunk by chunk
pub type BodyStream = BoxStream<'static, Result<Bytes, TransportError>>;

/// Parsed `Content-Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    /// First and last byte of the body, `None` for `bytes */N`
    pub range: Option<(u64, u64)>,
    /// Complete length, `None` for `bytes a-b/*`
    pub total: Option<u64>,
}

impl ContentRange {
    /// Parse values such as `bytes 0-99/1000`, `bytes 0-99/*` or `bytes */1000`
    pub fn parse(value: &str) -> Option<Self> {
        let rest = value.trim().strip_prefix("bytes")?.trim_start();
        let (range, total) = rest.split_once('/')?;

        let total = match total.trim() {
            "*" => None,
            n => Some(n.parse().ok()?),
        };
        let range = match range.trim() {
            "*" => None,
            r => {
                let (first, last) = r.split_once('-')?;
                Some((first.trim().parse().ok()?, last.trim().parse().ok()?))
            }
        };

        Some(Self { range, total })
    }
}

/// Response to a single range request
pub struct TransferResponse {
    pub status: u16,
    pub content_length: Option<u64>,
    pub accept_ranges: bool,
    pub content_range: Option<ContentRange>,
    pub body: BodyStream,
}

impl std::fmt::Debug for TransferResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferResponse")
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("accept_ranges", &self.accept_ranges)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}

/// Performs one request for a byte range and streams the body back.
///
/// `range_end` is inclusive; `None` asks for everything from `range_start`
/// on. A request for `0..` with no end is sent without a `Range` header.
#[async_trait]
pub trait TransferClient: Send + Sync {
    async fn request(
        &self,
        uri: &str,
        range_start: u64,
        range_end: Option<u64>,
    ) -> Result<TransferResponse, TransportError>;
}

/// `TransferClient` backed by reqwest
#[derive(Clone, Debug)]
pub struct HttpTransferClient {
    client: Client,
}

impl HttpTransferClient {
    pub fn new(config: &EngineConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .user_agent(config.user_agent.clone())
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .read_timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self { client })
    }

    /// Wrap an already configured client
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl TransferClient for HttpTransferClient {
    async fn request(
        &self,
        uri: &str,
        range_start: u64,
        range_end: Option<u64>,
    ) -> Result<TransferResponse, TransportError> {
        let mut request = self.client.get(uri);
        match range_end {
            Some(end) => {
                request = request.header(reqwest::header::RANGE, format!("bytes={}-{}", range_start, end));
            }
            None if range_start > 0 => {
                request = request.header(reqwest::header::RANGE, format!("bytes={}-", range_start));
            }
            None => {}
        }

        debug!("GET {} (range {}-{:?})", uri, range_start, range_end);
        let response = request.send().await.map_err(map_reqwest_error)?;

        let headers = response.headers();
        let content_length = headers
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let accept_ranges = headers
            .get(reqwest::header::ACCEPT_RANGES)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        let content_range = headers
            .get(reqwest::header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(ContentRange::parse);

        Ok(TransferResponse {
            status: response.status().as_u16(),
            content_length,
            accept_ranges,
            content_range,
            body: response
                .bytes_stream()
                .map(|chunk| chunk.map_err(map_reqwest_error))
                .boxed(),
        })
    }
}

fn map_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_connect() || e.is_request() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Interrupted(e.to_string())
    }
}
