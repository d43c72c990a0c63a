//! In-process transfer client and helpers for engine tests

use crate::transfer::{ContentRange, TransferClient, TransferResponse, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use surge_types::{EngineConfig, RetrySettings};
use tracing_subscriber::EnvFilter;

/// Route engine logs to the test harness; `RUST_LOG` picks the level
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small sizes and short backoffs so scenarios run in milliseconds
pub fn test_config() -> EngineConfig {
    EngineConfig {
        max_connections: 8,
        default_concurrency: 4,
        min_segment_size: 1_000,
        chunk_size: 100,
        retry: RetrySettings {
            max_attempts: 4,
            base_delay_ms: 5,
            max_delay_ms: 20,
        },
        ..EngineConfig::default()
    }
}

/// Deterministic, non-repeating-looking content
pub fn test_data(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + i / 251) % 256) as u8).collect()
}

#[derive(Debug, Clone)]
pub struct MockOptions {
    /// Answer ranged requests with 206; otherwise always send the whole body with 200
    pub supports_ranges: bool,
    /// Report the total size in `Content-Length` / `Content-Range`
    pub reports_length: bool,
    pub piece_size: usize,
    pub piece_delay: Duration,
    /// Time out this many segment fetches before answering; probes always answer
    pub fail_fetches: u32,
    /// Reject with 416 every ranged request starting at or after this offset
    pub reject_ranges_from: Option<u64>,
}

impl Default for MockOptions {
    fn default() -> Self {
        Self {
            supports_ranges: true,
            reports_length: true,
            piece_size: 64,
            piece_delay: Duration::ZERO,
            fail_fetches: 0,
            reject_ranges_from: None,
        }
    }
}

type FetchHook = Box<dyn FnOnce() + Send>;

/// Counts response bodies that are still being read
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    peak: AtomicUsize,
}

/// Released when the body stream it travels with is dropped
struct BodyGuard(Arc<InFlight>);

impl BodyGuard {
    fn new(in_flight: Arc<InFlight>) -> Self {
        let now = in_flight.current.fetch_add(1, Ordering::SeqCst) + 1;
        in_flight.peak.fetch_max(now, Ordering::SeqCst);
        Self(in_flight)
    }
}

impl Drop for BodyGuard {
    fn drop(&mut self) {
        self.0.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serves one in-memory resource and records every request it receives
pub struct MockServer {
    data: Bytes,
    options: MockOptions,
    failures_left: AtomicU32,
    reject_ranges_from: Mutex<Option<u64>>,
    requests: Mutex<Vec<(u64, Option<u64>)>>,
    fetch_hook: Mutex<Option<FetchHook>>,
    in_flight: Arc<InFlight>,
}

impl MockServer {
    pub fn new(data: Vec<u8>, options: MockOptions) -> Self {
        Self {
            data: Bytes::from(data),
            failures_left: AtomicU32::new(options.fail_fetches),
            reject_ranges_from: Mutex::new(options.reject_ranges_from),
            options,
            requests: Mutex::new(Vec::new()),
            fetch_hook: Mutex::new(None),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    /// Run `hook` once, while answering the first segment fetch.
    ///
    /// Requests are serialized around the hook, so every fetch answered after
    /// it observes its effect.
    pub fn before_first_fetch(&self, hook: impl FnOnce() + Send + 'static) {
        *self.fetch_hook.lock() = Some(Box::new(hook));
    }

    /// Most segment bodies ever open at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.in_flight.peak.load(Ordering::SeqCst)
    }

    /// `(range_start, range_end)` of every request so far, in arrival order
    pub fn requests(&self) -> Vec<(u64, Option<u64>)> {
        self.requests.lock().clone()
    }

    /// Stop rejecting ranges
    pub fn accept_all_ranges(&self) {
        *self.reject_ranges_from.lock() = None;
    }

    fn response(
        &self,
        status: u16,
        content_length: Option<u64>,
        content_range: Option<ContentRange>,
        body: Bytes,
        guard: Option<BodyGuard>,
    ) -> TransferResponse {
        let piece_size = self.options.piece_size.max(1);
        let delay = self.options.piece_delay;
        let pieces: Vec<Bytes> = (0..body.len())
            .step_by(piece_size)
            .map(|i| body.slice(i..(i + piece_size).min(body.len())))
            .collect();

        TransferResponse {
            status,
            content_length,
            accept_ranges: self.options.supports_ranges,
            content_range,
            body: futures::stream::iter(pieces)
                .then(move |piece| {
                    let _open = &guard;
                    async move {
                        if !delay.is_zero() {
                            tokio::time::sleep(delay).await;
                        }
                        Ok::<_, TransportError>(piece)
                    }
                })
                .boxed(),
        }
    }
}

#[async_trait]
impl TransferClient for MockServer {
    async fn request(
        &self,
        _uri: &str,
        range_start: u64,
        range_end: Option<u64>,
    ) -> Result<TransferResponse, TransportError> {
        let is_probe = range_start == 0 && range_end == Some(0);
        {
            let mut requests = self.requests.lock();
            requests.push((range_start, range_end));
            if !is_probe {
                if let Some(hook) = self.fetch_hook.lock().take() {
                    hook();
                }
            }
        }

        if !is_probe
            && self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            return Err(TransportError::Timeout);
        }

        let len = self.data.len() as u64;
        let ranged = range_start > 0 || range_end.is_some();

        if self.options.supports_ranges && ranged {
            let rejected = self
                .reject_ranges_from
                .lock()
                .is_some_and(|from| range_start > 0 && range_start >= from);
            if rejected || range_start >= len {
                let unsatisfied = ContentRange {
                    range: None,
                    total: Some(len),
                };
                return Ok(self.response(416, None, Some(unsatisfied), Bytes::new(), None));
            }

            let last = range_end.unwrap_or(len - 1).min(len - 1);
            let body = self.data.slice(range_start as usize..=last as usize);
            let content_range = ContentRange {
                range: Some((range_start, last)),
                total: self.options.reports_length.then_some(len),
            };
            let guard = (!is_probe).then(|| BodyGuard::new(self.in_flight.clone()));
            return Ok(self.response(
                206,
                Some(body.len() as u64),
                Some(content_range),
                body,
                guard,
            ));
        }

        let content_length = self.options.reports_length.then_some(len);
        let guard = (!is_probe).then(|| BodyGuard::new(self.in_flight.clone()));
        Ok(self.response(200, content_length, None, self.data.clone(), guard))
    }
}
