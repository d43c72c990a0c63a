//! Download Manager - owns the running job tasks
//!
//! The manager spawns one `DownloadTask` per running job and keeps the
//! handle needed to stop it. It does not decide status transitions; the
//! controller in `SurgeCore` does that and asks the manager to launch or
//! stop runs.

use crate::engine::download_task::{DownloadTask, RunOutcome, TaskContext};
use crate::engine::persistence::TrackedJob;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use surge_types::JobId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Handle to a running download task
struct RunHandle {
    /// Tells this run apart from a later one of the same job
    run: u64,
    stop: CancellationToken,
    task: JoinHandle<RunOutcome>,
    /// Set once the run has settled, for observers that must not reap it
    outcome: watch::Receiver<Option<RunOutcome>>,
}

/// Download manager that coordinates all running jobs
pub struct DownloadManager {
    /// Runs that have been launched and have neither finished nor been stopped
    active_tasks: Arc<Mutex<HashMap<JobId, RunHandle>>>,
    next_run: AtomicU64,
    ctx: TaskContext,
}

impl DownloadManager {
    pub fn new(ctx: TaskContext) -> Self {
        Self {
            active_tasks: Arc::new(Mutex::new(HashMap::new())),
            next_run: AtomicU64::new(0),
            ctx,
        }
    }

    pub fn context(&self) -> &TaskContext {
        &self.ctx
    }

    /// Spawn a run for the job. The caller must have reaped any earlier run.
    ///
    /// A run that ends on its own removes itself from the registry before it
    /// publishes its outcome.
    pub fn launch(&self, job: Arc<TrackedJob>) {
        let id = job.id();
        let run = self.next_run.fetch_add(1, Ordering::Relaxed);
        let stop = CancellationToken::new();
        let task = DownloadTask::new(job, self.ctx.clone(), stop.clone());
        let (outcome_tx, outcome) = watch::channel(None);
        let registry = self.active_tasks.clone();

        // Held across the spawn so the run cannot deregister before it is registered
        let mut active_tasks = self.active_tasks.lock();
        let handle = tokio::spawn(async move {
            let result = task.run().await;
            {
                let mut active_tasks = registry.lock();
                if active_tasks.get(&id).is_some_and(|h| h.run == run) {
                    active_tasks.remove(&id);
                    debug!("Run {} of job {} deregistered", run, id);
                }
            }
            let _ = outcome_tx.send(Some(result.clone()));
            result
        });

        let previous = active_tasks.insert(
            id,
            RunHandle {
                run,
                stop,
                task: handle,
                outcome,
            },
        );
        drop(active_tasks);

        if let Some(previous) = previous {
            warn!("Job {} launched while an earlier run was still registered", id);
            previous.stop.cancel();
        }
        info!("Launched run for job {}", id);
    }

    /// Signal the run to stop and wait until every worker has acknowledged.
    ///
    /// Returns `None` when the job has no registered run, which includes a run
    /// that already ended on its own.
    pub async fn stop(&self, id: JobId) -> Option<RunOutcome> {
        let handle = self.active_tasks.lock().remove(&id)?;
        handle.stop.cancel();
        Some(join(id, handle.task).await)
    }

    /// Wait for the run to end on its own, without signalling or reaping it
    pub async fn wait(&self, id: JobId) -> Option<RunOutcome> {
        let mut outcome = self.active_tasks.lock().get(&id)?.outcome.clone();
        let settled = match outcome.wait_for(Option::is_some).await {
            Ok(settled) => settled.clone(),
            Err(_) => Some(RunOutcome::Failed("run ended abnormally".to_string())),
        };
        settled
    }

    /// Number of registered runs
    pub fn active_count(&self) -> usize {
        self.active_tasks.lock().len()
    }
}

async fn join(id: JobId, task: JoinHandle<RunOutcome>) -> RunOutcome {
    match task.await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Run for job {} ended abnormally: {}", id, e);
            RunOutcome::Failed(e.to_string())
        }
    }
}
