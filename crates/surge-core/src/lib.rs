//! Surge Core - Download Engine
//!
//! This crate provides the core download functionality for Surge.
//! It splits a resource into byte ranges, fetches them in parallel straight
//! into the destination file, and persists every flush so that a paused,
//! failed or interrupted download resumes from its last written offset.

mod engine;
mod error;
mod transfer;

#[cfg(test)]
mod testing;

pub use engine::*;
pub use error::*;
pub use transfer::*;

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use surge_types::{CancelPolicy, CoreEvent, DownloadJob, EngineConfig, JobId, JobSnapshot, JobStatus};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

/// A registered job plus the lock that serializes its control operations
struct JobEntry {
    job: Arc<TrackedJob>,
    control: Mutex<()>,
}

impl JobEntry {
    fn new(job: Arc<TrackedJob>) -> Arc<Self> {
        Arc::new(Self {
            job,
            control: Mutex::new(()),
        })
    }

    fn status(&self) -> JobStatus {
        self.job.read(|j| j.status)
    }

    /// Fail with `InvalidTransition` unless the job is in one of `allowed`
    fn require(&self, operation: &'static str, allowed: &[JobStatus]) -> Result<JobStatus, SurgeError> {
        let status = self.status();
        if allowed.contains(&status) {
            Ok(status)
        } else {
            Err(SurgeError::InvalidTransition {
                id: self.job.id(),
                status,
                operation,
            })
        }
    }
}

/// The main Surge core instance
#[derive(Clone)]
pub struct SurgeCore {
    /// Every known job, terminal ones included
    jobs: Arc<RwLock<HashMap<JobId, Arc<JobEntry>>>>,
    /// Database connection
    store: JobStore,
    /// Event broadcaster
    event_tx: broadcast::Sender<CoreEvent>,
    /// Download manager
    download_manager: Arc<DownloadManager>,
}

impl SurgeCore {
    /// Open the engine over the job database in `data_dir`, using HTTP for transfers
    pub async fn open(data_dir: PathBuf, config: EngineConfig) -> Result<Self, SurgeError> {
        let client = HttpTransferClient::new(&config)
            .map_err(|e| SurgeError::Unknown(format!("Failed to build HTTP client: {}", e)))?;
        Self::with_client(data_dir, config, Arc::new(client)).await
    }

    /// Open the engine with a custom transfer client
    pub async fn with_client(
        data_dir: PathBuf,
        config: EngineConfig,
        client: Arc<dyn TransferClient>,
    ) -> Result<Self, SurgeError> {
        let store = JobStore::open(data_dir.join("jobs.db")).await?;

        let mut jobs = HashMap::new();
        for job in store.load_all().await? {
            let tracked = Arc::new(TrackedJob::new(job, store.clone()));
            if tracked.read(|j| j.status) == JobStatus::Running {
                // The previous process died mid-run
                tracked.transition(JobStatus::Paused, None).await?;
                info!("Job {} was interrupted, restored as paused", tracked.id());
            }
            jobs.insert(tracked.id(), JobEntry::new(tracked));
        }
        info!("Restored {} job(s) from {:?}", jobs.len(), data_dir);

        // Create event channel
        let (event_tx, _) = broadcast::channel(1000);

        let ctx = TaskContext::new(client, config, event_tx.clone());
        let download_manager = Arc::new(DownloadManager::new(ctx));

        Ok(Self {
            jobs: Arc::new(RwLock::new(jobs)),
            store,
            event_tx,
            download_manager,
        })
    }

    /// Subscribe to core events
    pub fn subscribe(&self) -> broadcast::Receiver<CoreEvent> {
        self.event_tx.subscribe()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.download_manager.context().config
    }

    fn emit(&self, event: CoreEvent) {
        let _ = self.event_tx.send(event);
    }

    fn entry(&self, id: JobId) -> Result<Arc<JobEntry>, SurgeError> {
        self.jobs.read().get(&id).cloned().ok_or(SurgeError::NotFound(id))
    }

    // ========================================================================
    // Job Operations
    // ========================================================================

    /// Register a new job in `Pending`.
    ///
    /// The id is derived from the source and destination. Submitting the same
    /// pair again replaces a completed or canceled record with a fresh job.
    pub async fn submit(
        &self,
        source_uri: &str,
        destination: impl Into<PathBuf>,
    ) -> Result<JobId, SurgeError> {
        url::Url::parse(source_uri).map_err(|_| SurgeError::InvalidUrl(source_uri.to_string()))?;

        let job = DownloadJob::new(source_uri.to_string(), destination.into());
        let id = job.id;

        let previous = self.jobs.read().get(&id).cloned();
        let _previous_control = match &previous {
            Some(entry) => {
                let guard = entry.control.lock().await;
                let status = entry.status();
                if !matches!(status, JobStatus::Completed | JobStatus::Canceled) {
                    return Err(SurgeError::AlreadyExists(id));
                }
                self.download_manager.stop(id).await;
                Some(guard)
            }
            None => None,
        };

        let entry = JobEntry::new(Arc::new(TrackedJob::new(job, self.store.clone())));
        let _control = entry.control.lock().await;
        {
            let mut jobs = self.jobs.write();
            let unchanged = match (jobs.get(&id), &previous) {
                (Some(current), Some(previous)) => Arc::ptr_eq(current, previous),
                (None, None) => true,
                _ => false,
            };
            if !unchanged {
                return Err(SurgeError::AlreadyExists(id));
            }
            jobs.insert(id, entry.clone());
        }

        if let Err(e) = entry.job.update(|_| ()).await {
            let mut jobs = self.jobs.write();
            match previous.clone() {
                Some(previous) => jobs.insert(id, previous),
                None => jobs.remove(&id),
            };
            return Err(e);
        }

        info!("Submitted job {} ({})", id, source_uri);
        self.emit(CoreEvent::JobAdded {
            job: entry.job.read(DownloadJob::snapshot),
        });
        Ok(id)
    }

    /// Start a pending, paused or failed job.
    ///
    /// A failed job keeps its offsets, so starting it again resumes every
    /// unfinished segment where it stopped.
    pub async fn start(&self, id: JobId) -> Result<(), SurgeError> {
        self.launch(
            id,
            "start",
            &[JobStatus::Pending, JobStatus::Paused, JobStatus::Failed],
        )
        .await
    }

    /// Resume a paused job with its existing plan and offsets
    pub async fn resume(&self, id: JobId) -> Result<(), SurgeError> {
        self.launch(id, "resume", &[JobStatus::Paused]).await
    }

    async fn launch(
        &self,
        id: JobId,
        operation: &'static str,
        allowed: &[JobStatus],
    ) -> Result<(), SurgeError> {
        let entry = self.entry(id)?;
        let _control = entry.control.lock().await;
        entry.require(operation, allowed)?;

        // A run that settled but is still registered gets reaped here
        self.download_manager.stop(id).await;

        self.set_status(&entry, JobStatus::Running, None).await?;
        self.download_manager.launch(entry.job.clone());
        info!("Job {}: {}", id, operation);
        Ok(())
    }

    /// Pause a running job.
    ///
    /// Returns once every worker has stopped at a flush boundary. If the run
    /// settles on its own before the signal lands, that outcome stands.
    pub async fn pause(&self, id: JobId) -> Result<(), SurgeError> {
        let entry = self.entry(id)?;
        let _control = entry.control.lock().await;
        entry.require("pause", &[JobStatus::Running])?;

        if self.stop_run(&entry).await {
            info!("Job {} settled before the pause took effect", id);
            return Ok(());
        }

        self.set_status(&entry, JobStatus::Paused, None).await?;
        info!("Paused job {} at {} bytes", id, entry.job.read(|j| j.bytes_received()));
        Ok(())
    }

    /// Cancel a running or paused job and apply the configured cancel policy
    pub async fn cancel(&self, id: JobId) -> Result<(), SurgeError> {
        let entry = self.entry(id)?;
        let _control = entry.control.lock().await;
        entry.require("cancel", &[JobStatus::Running, JobStatus::Paused])?;

        if self.stop_run(&entry).await {
            info!("Job {} settled before the cancel took effect", id);
            return Ok(());
        }

        if self.config().cancel_policy == CancelPolicy::DeletePartial {
            let path = entry.job.read(|j| j.destination.clone());
            remove_output(&path).await?;
        }

        self.set_status(&entry, JobStatus::Canceled, None).await?;
        info!("Canceled job {}", id);
        Ok(())
    }

    /// Remove a finished job from the registry and the store
    pub async fn delete(&self, id: JobId, remove_file: bool) -> Result<(), SurgeError> {
        let entry = self.entry(id)?;
        let _control = entry.control.lock().await;

        let status = entry.status();
        if !status.is_terminal() {
            return Err(SurgeError::InvalidTransition {
                id,
                status,
                operation: "delete",
            });
        }

        self.download_manager.stop(id).await;

        if remove_file {
            let path = entry.job.read(|j| j.destination.clone());
            remove_output(&path).await?;
        }

        // Remove from storage
        self.store.delete(id).await?;

        {
            let mut jobs = self.jobs.write();
            if jobs.get(&id).is_some_and(|current| Arc::ptr_eq(current, &entry)) {
                jobs.remove(&id);
            }
        }

        info!("Deleted job {}", id);
        self.emit(CoreEvent::JobRemoved { id });
        Ok(())
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current snapshot of a job. Never waits on I/O.
    pub fn query(&self, id: JobId) -> Result<JobSnapshot, SurgeError> {
        self.jobs
            .read()
            .get(&id)
            .map(|entry| entry.job.read(DownloadJob::snapshot))
            .ok_or(SurgeError::NotFound(id))
    }

    /// Snapshots of every registered job
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        self.jobs
            .read()
            .values()
            .map(|entry| entry.job.read(DownloadJob::snapshot))
            .collect()
    }

    /// Ids of persisted jobs that are not in a terminal status
    pub async fn list_active(&self) -> Result<Vec<JobId>, SurgeError> {
        Ok(self
            .store
            .list_active()
            .await?
            .into_iter()
            .map(|job| job.id)
            .collect())
    }

    /// Wait until the current run of a job ends, then return its snapshot.
    ///
    /// Returns right away when the job is not running.
    pub async fn wait(&self, id: JobId) -> Result<JobSnapshot, SurgeError> {
        let entry = self.entry(id)?;
        self.download_manager.wait(id).await;
        Ok(entry.job.read(DownloadJob::snapshot))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Pause every running job and close the store
    pub async fn shutdown(&self) {
        let running: Vec<JobId> = self
            .jobs
            .read()
            .iter()
            .filter(|(_, entry)| entry.status() == JobStatus::Running)
            .map(|(id, _)| *id)
            .collect();
        info!(
            "Shutting down with {} active run(s)",
            self.download_manager.active_count()
        );

        for id in running {
            if let Err(e) = self.pause(id).await {
                warn!("Failed to pause job {} during shutdown: {}", id, e);
            }
        }

        self.store.close().await;
        info!("Surge core shut down");
    }

    /// Stop the job's run, if any. True when the run settled on its own first.
    async fn stop_run(&self, entry: &JobEntry) -> bool {
        let outcome = self.download_manager.stop(entry.job.id()).await;
        matches!(outcome, Some(RunOutcome::Completed | RunOutcome::Failed(_)))
            || entry.status().is_terminal()
    }

    async fn set_status(
        &self,
        entry: &JobEntry,
        status: JobStatus,
        error: Option<String>,
    ) -> Result<(), SurgeError> {
        entry.job.transition(status, error.clone()).await?;
        self.emit(CoreEvent::JobStatusChanged {
            id: entry.job.id(),
            status,
            error,
        });
        Ok(())
    }
}

async fn remove_output(path: &Path) -> Result<(), SurgeError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!("Removed {:?}", path);
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
