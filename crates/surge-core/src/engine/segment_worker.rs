//! Segment worker - downloads a single segment straight into the destination file
//!
//! Each worker owns one byte range. Bytes are written at their absolute
//! offset and progress is written through to the job store after every
//! fixed-size flush, so a stop or a crash never loses more than one chunk.

use crate::engine::persistence::TrackedJob;
use crate::engine::retry::{classify, RetryDecision, RetryPolicy};
use crate::error::SurgeError;
use crate::transfer::{TransferClient, TransportError};
use bytes::BytesMut;
use futures::StreamExt;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;
use surge_types::{CoreEvent, Segment, SegmentState};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How a segment run ended when it did not fail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentOutcome {
    /// Every byte of the range is on disk
    Done,
    /// Stopped by a pause, cancel or sibling failure
    Stopped,
}

/// A worker that fetches one segment of a job
pub struct SegmentWorker {
    job: Arc<TrackedJob>,
    index: u32,
    uri: String,
    path: PathBuf,
    client: Arc<dyn TransferClient>,
    policy: RetryPolicy,
    chunk_size: usize,
    connections: Arc<Semaphore>,
    stop: CancellationToken,
    event_tx: broadcast::Sender<CoreEvent>,
}

impl SegmentWorker {
    /// Create a new segment worker
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        job: Arc<TrackedJob>,
        index: u32,
        client: Arc<dyn TransferClient>,
        policy: RetryPolicy,
        chunk_size: usize,
        connections: Arc<Semaphore>,
        stop: CancellationToken,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        let (uri, path) = job.read(|j| (j.source_uri.clone(), j.destination.clone()));

        Self {
            job,
            index,
            uri,
            path,
            client,
            policy,
            chunk_size: chunk_size.max(1),
            connections,
            stop,
            event_tx,
        }
    }

    /// Run the segment until it is done, stopped, or out of retries
    pub async fn run(self) -> Result<SegmentOutcome, SurgeError> {
        let job_id = self.job.id();

        // Excess segments queue here until a connection slot frees up
        let _permit = tokio::select! {
            _ = self.stop.cancelled() => return Ok(SegmentOutcome::Stopped),
            permit = self.connections.clone().acquire_owned() => permit
                .map_err(|_| SurgeError::Unknown("connection pool closed".to_string()))?,
        };

        let segment = self
            .job
            .update_segment(self.index, |s| s.state = SegmentState::InFlight)
            .await?;
        info!(
            "Starting segment {} for job {} (bytes {}-{}, {} already received)",
            self.index, job_id, segment.start, segment.end, segment.bytes_received
        );

        let mut attempt = 1u32;
        loop {
            let error = match self.fetch().await {
                Ok(SegmentOutcome::Done) => {
                    self.finish().await?;
                    return Ok(SegmentOutcome::Done);
                }
                Ok(SegmentOutcome::Stopped) => {
                    self.settle(SegmentState::Pending).await?;
                    info!("Segment {} of job {} stopped", self.index, job_id);
                    return Ok(SegmentOutcome::Stopped);
                }
                Err(e) => e,
            };

            if error.is_storage() {
                if let Err(e) = self.settle(SegmentState::Errored).await {
                    warn!(
                        "Segment {} of job {}: could not record the failure: {}",
                        self.index, job_id, e
                    );
                }
                return Err(error);
            }

            match self.policy.decide(attempt, classify(&error)) {
                RetryDecision::NoRetry => {
                    warn!(
                        "Segment {} of job {} failed after {} attempt(s): {}",
                        self.index, job_id, attempt, error
                    );
                    self.settle(SegmentState::Errored).await?;
                    return Err(error);
                }
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        "Segment {} of job {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        self.index, job_id, attempt, self.policy.max_attempts, error, delay
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => {
                            self.settle(SegmentState::Pending).await?;
                            return Ok(SegmentOutcome::Stopped);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// One attempt: request the missing part of the range and stream it to disk
    async fn fetch(&self) -> Result<SegmentOutcome, SurgeError> {
        let segment = self.current();
        let offset = segment.next_offset();
        let remaining = segment.size().map(|size| size - segment.bytes_received);
        if remaining == Some(0) {
            return Ok(SegmentOutcome::Done);
        }

        let range_end = (!segment.is_unknown_size()).then_some(segment.end);
        let response = tokio::select! {
            _ = self.stop.cancelled() => return Ok(SegmentOutcome::Stopped),
            response = self.client.request(&self.uri, offset, range_end) => response?,
        };

        match response.status {
            206 => {
                if let Some((first, _)) = response.content_range.and_then(|c| c.range) {
                    if first != offset {
                        return Err(TransportError::Interrupted(format!(
                            "server answered with range starting at {} instead of {}",
                            first, offset
                        ))
                        .into());
                    }
                }
            }
            200 => {}
            416 => {
                return Err(SurgeError::RangeNotSatisfiable {
                    start: offset,
                    end: range_end.map(|e| e.to_string()).unwrap_or_default(),
                });
            }
            status => return Err(SurgeError::HttpStatus { status }),
        }

        // A 200 carries the whole resource; drop what precedes our offset
        let mut skip = if response.status == 200 { offset } else { 0 };
        if skip > 0 {
            debug!(
                "Segment {} of job {}: server ignored range, skipping {} bytes",
                self.index,
                self.job.id(),
                skip
            );
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&self.path)
            .await?;
        file.seek(SeekFrom::Start(offset)).await?;

        let mut body = response.body;
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut flushed = 0u64;

        loop {
            let next = tokio::select! {
                // Unflushed bytes are dropped; progress stays on a flush boundary
                _ = self.stop.cancelled() => return Ok(SegmentOutcome::Stopped),
                next = body.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let mut chunk = chunk?;

            if skip > 0 {
                let n = skip.min(chunk.len() as u64);
                let _ = chunk.split_to(n as usize);
                skip -= n;
            }
            if let Some(remaining) = remaining {
                let room = remaining - flushed - buffer.len() as u64;
                if chunk.len() as u64 > room {
                    chunk.truncate(room as usize);
                }
            }
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= self.chunk_size {
                let data = buffer.split_to(self.chunk_size);
                self.flush(&mut file, &data).await?;
                flushed += data.len() as u64;
            }

            if remaining.is_some_and(|r| flushed + buffer.len() as u64 >= r) {
                break;
            }
        }

        if !buffer.is_empty() {
            self.flush(&mut file, &buffer).await?;
            flushed += buffer.len() as u64;
        }

        match (remaining, segment.size()) {
            (Some(remaining), Some(size)) if flushed < remaining => {
                Err(TransportError::Incomplete {
                    received: segment.bytes_received + flushed,
                    expected: size,
                }
                .into())
            }
            _ => Ok(SegmentOutcome::Done),
        }
    }

    /// Write one chunk at the current position, sync it, then record it
    async fn flush(&self, file: &mut File, data: &[u8]) -> Result<(), SurgeError> {
        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await?;

        let len = data.len() as u64;
        let segment = self
            .job
            .update_segment(self.index, |s| s.bytes_received += len)
            .await?;

        let _ = self.event_tx.send(CoreEvent::SegmentProgress {
            job_id: self.job.id(),
            segment_index: self.index,
            bytes_received: segment.bytes_received,
        });
        Ok(())
    }

    /// Mark the segment done. An open segment learns its real end here.
    ///
    /// The destination could not be sized up front, so it is cut to the
    /// received length; whatever an older file left past that point goes.
    /// An empty stream has no last byte: the segment keeps its open end and
    /// the job records a size of zero.
    async fn finish(&self) -> Result<(), SurgeError> {
        let segment = self.current();
        if segment.is_unknown_size() {
            let received = segment.bytes_received;
            let total = segment.start + received;

            let file = OpenOptions::new().write(true).open(&self.path).await?;
            file.set_len(total).await?;
            file.sync_all().await?;

            let index = self.index as usize;
            self.job
                .update(|job| {
                    let segment = &mut job.segments[index];
                    if received > 0 {
                        segment.end = total - 1;
                    }
                    segment.state = SegmentState::Done;
                    job.total_size = Some(total);
                })
                .await?;
            info!(
                "Segment {} of job {} complete, resource size is {} bytes",
                self.index,
                self.job.id(),
                received
            );
        } else {
            self.settle(SegmentState::Done).await?;
            info!(
                "Segment {} of job {} complete ({} bytes)",
                self.index,
                self.job.id(),
                segment.bytes_received
            );
        }
        Ok(())
    }

    async fn settle(&self, state: SegmentState) -> Result<(), SurgeError> {
        self.job.update_segment(self.index, |s| s.state = state).await?;
        Ok(())
    }

    fn current(&self) -> Segment {
        self.job.read(|j| j.segments[self.index as usize].clone())
    }
}
