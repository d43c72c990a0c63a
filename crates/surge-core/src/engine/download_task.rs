//! Download task - coordinates the segment workers of one job run
//!
//! A run probes and plans the job if it has no plan yet, sizes the
//! destination file, then fetches every unfinished segment in parallel.
//! Segments write straight to their final offsets, so once every segment is
//! done there is nothing left to merge.

use crate::engine::persistence::TrackedJob;
use crate::engine::retry::{classify, RetryDecision, RetryPolicy};
use crate::engine::segment_worker::{SegmentOutcome, SegmentWorker};
use crate::engine::segmenter;
use crate::error::SurgeError;
use crate::transfer::TransferClient;
use std::sync::Arc;
use surge_types::{CoreEvent, DownloadJob, EngineConfig, JobStatus, SegmentState};
use tokio::fs::OpenOptions;
use tokio::sync::{broadcast, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Engine-wide resources every run shares
#[derive(Clone)]
pub struct TaskContext {
    pub client: Arc<dyn TransferClient>,
    pub config: Arc<EngineConfig>,
    /// Global cap on concurrent segment fetches across all jobs
    pub connections: Arc<Semaphore>,
    pub event_tx: broadcast::Sender<CoreEvent>,
}

impl TaskContext {
    pub fn new(
        client: Arc<dyn TransferClient>,
        config: EngineConfig,
        event_tx: broadcast::Sender<CoreEvent>,
    ) -> Self {
        let connections = Arc::new(Semaphore::new(config.max_connections.max(1) as usize));
        Self {
            client,
            config: Arc::new(config),
            connections,
            event_tx,
        }
    }
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// Every segment is done and the job is marked completed
    Completed,
    /// The job is marked failed; offsets are kept for a later start
    Failed(String),
    /// Stopped on request; the caller decides the resulting status
    Stopped,
}

/// What the probe request learned about the resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Probe {
    total_size: Option<u64>,
    accepts_ranges: bool,
}

/// One run of a download job
pub struct DownloadTask {
    job: Arc<TrackedJob>,
    ctx: TaskContext,
    stop: CancellationToken,
}

impl DownloadTask {
    pub fn new(job: Arc<TrackedJob>, ctx: TaskContext, stop: CancellationToken) -> Self {
        Self { job, ctx, stop }
    }

    /// Run the job and record completion or failure
    pub async fn run(self) -> RunOutcome {
        let id = self.job.id();

        match self.execute().await {
            Ok(RunOutcome::Completed) => {
                let size = self.job.read(|j| j.bytes_received());
                if let Err(e) = self.finish(JobStatus::Completed, None).await {
                    error!("Failed to record completion of job {}: {}", id, e);
                    return RunOutcome::Failed(e.to_string());
                }
                info!("Job {} completed ({} bytes)", id, size);
                RunOutcome::Completed
            }
            Ok(outcome) => outcome,
            Err(e) => {
                let message = e.to_string();
                error!("Job {} failed: {}", id, message);
                if let Err(save_error) = self.finish(JobStatus::Failed, Some(message.clone())).await {
                    error!("Failed to record failure of job {}: {}", id, save_error);
                }
                RunOutcome::Failed(message)
            }
        }
    }

    async fn execute(&self) -> Result<RunOutcome, SurgeError> {
        let id = self.job.id();

        if !self.job.read(DownloadJob::is_planned) {
            info!("Job {} has no plan yet, probing", id);
            if !self.plan().await? {
                return Ok(RunOutcome::Stopped);
            }
        }

        if self.job.read(DownloadJob::all_segments_done) {
            info!("All segments of job {} already complete", id);
            return Ok(RunOutcome::Completed);
        }

        self.prepare_file().await?;

        // Segments that failed in an earlier run get a fresh set of attempts
        let pending: Vec<u32> = self
            .job
            .update(|job| {
                job.segments
                    .iter_mut()
                    .filter(|s| !s.is_done())
                    .map(|s| {
                        s.state = SegmentState::Pending;
                        s.index
                    })
                    .collect()
            })
            .await?;

        info!("Job {}: fetching {} segment(s)", id, pending.len());

        // Storage failures stop siblings through this child without looking like a pause
        let abort = self.stop.child_token();
        let policy = RetryPolicy::from(&self.ctx.config.retry);
        let mut join_set = JoinSet::new();

        for index in pending {
            let worker = SegmentWorker::new(
                self.job.clone(),
                index,
                self.ctx.client.clone(),
                policy,
                self.ctx.config.chunk_size,
                self.ctx.connections.clone(),
                abort.clone(),
                self.ctx.event_tx.clone(),
            );
            join_set.spawn(async move { (index, worker.run().await) });
        }

        let mut first_error: Option<SurgeError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(SegmentOutcome::Done))) => {
                    debug!("Job {}: segment {} done", id, index);
                }
                Ok((index, Ok(SegmentOutcome::Stopped))) => {
                    debug!("Job {}: segment {} stopped", id, index);
                }
                Ok((index, Err(e))) => {
                    if e.is_storage() {
                        error!("Job {}: storage failure in segment {}: {}", id, index, e);
                        abort.cancel();
                    }
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!("Job {}: segment task panicked: {}", id, e);
                    abort.cancel();
                    first_error.get_or_insert(SurgeError::Unknown(format!("segment task panicked: {}", e)));
                }
            }
        }

        if self.job.read(DownloadJob::all_segments_done) {
            return Ok(RunOutcome::Completed);
        }
        if self.stop.is_cancelled() {
            return Ok(RunOutcome::Stopped);
        }
        Err(first_error
            .unwrap_or_else(|| SurgeError::Unknown("segments stopped before finishing".to_string())))
    }

    /// Probe the resource and persist the segment plan. Returns false if stopped.
    async fn plan(&self) -> Result<bool, SurgeError> {
        let Some(probe) = self.probe().await? else {
            return Ok(false);
        };

        let config = &self.ctx.config;
        let concurrency = if probe.accepts_ranges {
            config.default_concurrency
        } else {
            1
        };
        let segments = segmenter::plan(probe.total_size, concurrency, config.min_segment_size);
        let count = segments.len();

        self.job
            .update(|job| {
                job.total_size = probe.total_size;
                job.segments = segments;
            })
            .await?;

        info!(
            "Planned {} segment(s) for job {} (size: {:?}, ranges: {})",
            count,
            self.job.id(),
            probe.total_size,
            probe.accepts_ranges
        );
        Ok(true)
    }

    /// Ask for the first byte to learn the size and whether ranges work
    async fn probe(&self) -> Result<Option<Probe>, SurgeError> {
        let uri = self.job.read(|j| j.source_uri.clone());
        let policy = RetryPolicy::from(&self.ctx.config.retry);
        let mut attempt = 1u32;

        loop {
            let result = tokio::select! {
                _ = self.stop.cancelled() => return Ok(None),
                result = self.probe_once(&uri) => result,
            };

            let error = match result {
                Ok(probe) => return Ok(Some(probe)),
                Err(e) => e,
            };

            match policy.decide(attempt, classify(&error)) {
                RetryDecision::NoRetry => return Err(error),
                RetryDecision::RetryAfter(delay) => {
                    warn!(
                        "Probe of {} failed (attempt {}/{}): {}. Retrying in {:?}",
                        uri, attempt, policy.max_attempts, error, delay
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }

    async fn probe_once(&self, uri: &str) -> Result<Probe, SurgeError> {
        let response = self.ctx.client.request(uri, 0, Some(0)).await?;
        debug!("Probe of {}: {:?}", uri, response);

        let probe = match response.status {
            206 | 416 => Probe {
                total_size: response.content_range.and_then(|c| c.total),
                accepts_ranges: true,
            },
            // The server ignored the range and is sending everything
            200 => Probe {
                total_size: response.content_length,
                accepts_ranges: false,
            },
            status => return Err(SurgeError::HttpStatus { status }),
        };

        Ok(Probe {
            total_size: probe.total_size.filter(|size| *size > 0),
            ..probe
        })
    }

    /// Create the destination and size it so every segment can write at its offset
    async fn prepare_file(&self) -> Result<(), SurgeError> {
        let (path, total_size) = self.job.read(|j| (j.destination.clone(), j.total_size));

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .await?;

        if let Some(total) = total_size {
            if file.metadata().await?.len() != total {
                file.set_len(total).await?;
                debug!("Preallocated {:?} to {} bytes", path, total);
            }
        }
        file.sync_all().await?;
        Ok(())
    }

    async fn finish(&self, status: JobStatus, error: Option<String>) -> Result<(), SurgeError> {
        self.job.transition(status, error.clone()).await?;
        let _ = self.ctx.event_tx.send(CoreEvent::JobStatusChanged {
            id: self.job.id(),
            status,
            error,
        });
        Ok(())
    }
}
