//! SQLite-based persistence layer for download jobs
//!
//! Stores jobs and their segments in a relational database. Every full save
//! runs in one transaction, so a reader recovering after a crash sees either
//! the previous record or the new one, never a mix.

use crate::error::SurgeError;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqliteRow, SqliteSynchronous,
};
use sqlx::Row;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use surge_types::{DownloadJob, JobId, JobStatus, Segment, SegmentState};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

/// Durable store of job records
#[derive(Clone, Debug)]
pub struct JobStore {
    pool: SqlitePool,
}

impl JobStore {
    /// Open (or create) the database at `db_path`
    pub async fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, SurgeError> {
        let path = db_path.as_ref();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full);

        let pool = SqlitePool::connect_with(options).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                source_uri TEXT NOT NULL,
                destination TEXT NOT NULL,
                total_size INTEGER,
                status TEXT NOT NULL,
                error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            );

            CREATE TABLE IF NOT EXISTS segments (
                job_id TEXT NOT NULL,
                segment_index INTEGER NOT NULL,
                start_byte INTEGER NOT NULL,
                end_byte INTEGER NOT NULL,
                bytes_received INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                PRIMARY KEY (job_id, segment_index),
                FOREIGN KEY (job_id) REFERENCES jobs(id) ON DELETE CASCADE
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            "#,
        )
        .execute(&pool)
        .await?;

        info!("Opened job store at {:?}", path);
        Ok(Self { pool })
    }

    /// Atomically persist the full job record
    pub async fn save(&self, job: &DownloadJob) -> Result<(), SurgeError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, source_uri, destination, total_size, status, error, created_at, completed_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                source_uri = excluded.source_uri,
                destination = excluded.destination,
                total_size = excluded.total_size,
                status = excluded.status,
                error = excluded.error,
                created_at = excluded.created_at,
                completed_at = excluded.completed_at
            "#,
        )
        .bind(job.id.to_string())
        .bind(&job.source_uri)
        .bind(job.destination.to_string_lossy().to_string())
        .bind(job.total_size.map(|s| s as i64))
        .bind(job.status.as_str())
        .bind(job.error.as_ref())
        .bind(job.created_at.to_rfc3339())
        .bind(job.completed_at.map(|d| d.to_rfc3339()))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM segments WHERE job_id = ?")
            .bind(job.id.to_string())
            .execute(&mut *tx)
            .await?;

        for segment in &job.segments {
            sqlx::query(
                r#"
                INSERT INTO segments (
                    job_id, segment_index, start_byte, end_byte, bytes_received, state
                ) VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(job.id.to_string())
            .bind(segment.index as i64)
            .bind(segment.start as i64)
            .bind(segment.end as i64)
            .bind(segment.bytes_received as i64)
            .bind(segment.state.as_str())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("Saved job {} ({})", job.id, job.status);
        Ok(())
    }

    /// Persist the progress and state of one segment
    pub async fn update_segment(&self, job_id: JobId, segment: &Segment) -> Result<(), SurgeError> {
        sqlx::query(
            r#"
            UPDATE segments
            SET end_byte = ?, bytes_received = ?, state = ?
            WHERE job_id = ? AND segment_index = ?
            "#,
        )
        .bind(segment.end as i64)
        .bind(segment.bytes_received as i64)
        .bind(segment.state.as_str())
        .bind(job_id.to_string())
        .bind(segment.index as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Load a job by ID, applying crash recovery to its segments
    pub async fn load(&self, id: JobId) -> Result<DownloadJob, SurgeError> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(SurgeError::NotFound(id))?;

        let segments = sqlx::query("SELECT * FROM segments WHERE job_id = ? ORDER BY segment_index")
            .bind(id.to_string())
            .fetch_all(&self.pool)
            .await?
            .iter()
            .map(row_to_segment)
            .collect::<Result<Vec<_>, _>>()?;

        row_to_job(&row, segments)
    }

    /// Load every job, oldest first
    pub async fn load_all(&self) -> Result<Vec<DownloadJob>, SurgeError> {
        let job_rows = sqlx::query("SELECT * FROM jobs ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;
        self.assemble(job_rows).await
    }

    /// Jobs that are not in a terminal status
    pub async fn list_active(&self) -> Result<Vec<DownloadJob>, SurgeError> {
        let job_rows = sqlx::query(
            "SELECT * FROM jobs WHERE status NOT IN ('completed', 'failed', 'canceled') ORDER BY created_at",
        )
        .fetch_all(&self.pool)
        .await?;
        self.assemble(job_rows).await
    }

    /// Remove a job and its segments
    pub async fn delete(&self, id: JobId) -> Result<(), SurgeError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM segments WHERE job_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Flush and close every connection
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Attach segments to job rows with a single segments query
    async fn assemble(&self, job_rows: Vec<SqliteRow>) -> Result<Vec<DownloadJob>, SurgeError> {
        if job_rows.is_empty() {
            return Ok(Vec::new());
        }

        let segment_rows = sqlx::query("SELECT * FROM segments ORDER BY job_id, segment_index")
            .fetch_all(&self.pool)
            .await?;

        let mut segments_map: HashMap<String, Vec<Segment>> = HashMap::new();
        for row in &segment_rows {
            let job_id: String = row.get("job_id");
            segments_map.entry(job_id).or_default().push(row_to_segment(row)?);
        }

        job_rows
            .iter()
            .map(|row| {
                let id: String = row.get("id");
                let segments = segments_map.remove(&id).unwrap_or_default();
                row_to_job(row, segments)
            })
            .collect()
    }
}

fn row_to_job(row: &SqliteRow, segments: Vec<Segment>) -> Result<DownloadJob, SurgeError> {
    let id: String = row.get("id");
    let status: String = row.get("status");
    let status = match status.as_str() {
        "pending" => JobStatus::Pending,
        "running" => JobStatus::Running,
        "paused" => JobStatus::Paused,
        "completed" => JobStatus::Completed,
        "failed" => JobStatus::Failed,
        "canceled" => JobStatus::Canceled,
        other => return Err(SurgeError::CorruptRecord(format!("job {} has status {:?}", id, other))),
    };

    Ok(DownloadJob {
        id: Uuid::parse_str(&id).map_err(|e| SurgeError::CorruptRecord(e.to_string()))?,
        source_uri: row.get("source_uri"),
        destination: PathBuf::from(row.get::<String, _>("destination")),
        total_size: row.get::<Option<i64>, _>("total_size").map(|s| s as u64),
        status,
        segments,
        error: row.get("error"),
        created_at: DateTime::parse_from_rfc3339(row.get::<String, _>("created_at").as_str())
            .map_err(|e| SurgeError::CorruptRecord(e.to_string()))?
            .with_timezone(&Utc),
        completed_at: row
            .get::<Option<String>, _>("completed_at")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
    })
}

/// A segment left in flight by a process that died is pending again; its
/// `bytes_received` is trusted as-is.
fn row_to_segment(row: &SqliteRow) -> Result<Segment, SurgeError> {
    let state: String = row.get("state");
    let state = match state.as_str() {
        "pending" | "inflight" => SegmentState::Pending,
        "done" => SegmentState::Done,
        "errored" => SegmentState::Errored,
        other => return Err(SurgeError::CorruptRecord(format!("segment state {:?}", other))),
    };

    Ok(Segment {
        index: row.get::<i64, _>("segment_index") as u32,
        start: row.get::<i64, _>("start_byte") as u64,
        end: row.get::<i64, _>("end_byte") as u64,
        bytes_received: row.get::<i64, _>("bytes_received") as u64,
        state,
    })
}

/// In-memory copy of a job whose every mutation is written through to the store.
///
/// Writes for one job are serialized by `write_lock`, so two saves of the same
/// job never race and the database always receives updates in the order they
/// were applied in memory. Readers take a cheap snapshot and never wait on I/O.
#[derive(Debug)]
pub struct TrackedJob {
    id: JobId,
    state: RwLock<DownloadJob>,
    write_lock: Mutex<()>,
    store: JobStore,
}

impl TrackedJob {
    pub fn new(job: DownloadJob, store: JobStore) -> Self {
        Self {
            id: job.id,
            state: RwLock::new(job),
            write_lock: Mutex::new(()),
            store,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn snapshot(&self) -> DownloadJob {
        self.state.read().clone()
    }

    /// Read a value out of the current in-memory record
    pub fn read<R>(&self, f: impl FnOnce(&DownloadJob) -> R) -> R {
        f(&self.state.read())
    }

    /// Mutate the job and persist the full record.
    ///
    /// The change reaches memory only once the store accepted it, so a failed
    /// save leaves the job exactly as it was.
    pub async fn update<R>(&self, f: impl FnOnce(&mut DownloadJob) -> R) -> Result<R, SurgeError> {
        let _guard = self.write_lock.lock().await;
        let mut record = self.snapshot();
        let result = f(&mut record);
        self.store.save(&record).await?;
        *self.state.write() = record;
        Ok(result)
    }

    /// Move the job to `status` and persist it.
    ///
    /// Only a run has segments in flight, so leaving `Running` puts any
    /// leftover `InFlight` marker back to `Pending`.
    pub async fn transition(&self, status: JobStatus, error: Option<String>) -> Result<(), SurgeError> {
        self.update(|job| {
            job.status = status;
            job.error = error;
            if status == JobStatus::Completed {
                job.completed_at = Some(Utc::now());
            }
            if status != JobStatus::Running {
                for segment in &mut job.segments {
                    if segment.state == SegmentState::InFlight {
                        segment.state = SegmentState::Pending;
                    }
                }
            }
        })
        .await
    }

    /// Mutate one segment and persist just that segment
    pub async fn update_segment(
        &self,
        index: u32,
        f: impl FnOnce(&mut Segment),
    ) -> Result<Segment, SurgeError> {
        let _guard = self.write_lock.lock().await;
        let mut segment = self
            .read(|job| job.segments.get(index as usize).cloned())
            .ok_or_else(|| SurgeError::Unknown(format!("job {} has no segment {}", self.id, index)))?;
        let before = segment.bytes_received;
        f(&mut segment);
        debug_assert!(segment.bytes_received >= before, "segment progress went backwards");

        self.store.update_segment(self.id, &segment).await?;
        if let Some(slot) = self.state.write().segments.get_mut(index as usize) {
            *slot = segment.clone();
        }
        Ok(segment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> anyhow::Result<(TempDir, JobStore)> {
        let dir = tempfile::tempdir()?;
        let store = JobStore::open(dir.path().join("jobs.db")).await?;
        Ok((dir, store))
    }

    fn planned_job(uri: &str) -> DownloadJob {
        let mut job = DownloadJob::new(uri.to_string(), PathBuf::from("/tmp/out.bin"));
        job.total_size = Some(300);
        job.segments = vec![
            Segment::new(0, 0, 99),
            Segment::new(1, 100, 199),
            Segment::new(2, 200, 299),
        ];
        job
    }

    #[tokio::test]
    async fn save_and_load_full_record() -> anyhow::Result<()> {
        let (_dir, store) = open_store().await?;
        let mut job = planned_job("https://example.com/file");
        job.status = JobStatus::Paused;
        job.segments[0].bytes_received = 100;
        job.segments[0].state = SegmentState::Done;
        job.segments[1].bytes_received = 40;
        store.save(&job).await?;

        let loaded = store.load(job.id).await?;
        assert_eq!(loaded.id, job.id);
        assert_eq!(loaded.status, JobStatus::Paused);
        assert_eq!(loaded.total_size, Some(300));
        assert_eq!(loaded.segments, job.segments);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_size_segment_survives_storage() -> anyhow::Result<()> {
        let (_dir, store) = open_store().await?;
        let mut job = DownloadJob::new("https://example.com/stream".into(), "/tmp/stream".into());
        job.segments = vec![Segment::open(0, 0)];
        store.save(&job).await?;

        let loaded = store.load(job.id).await?;
        assert_eq!(loaded.total_size, None);
        assert!(loaded.segments[0].is_unknown_size());
        Ok(())
    }

    #[tokio::test]
    async fn in_flight_segments_recover_as_pending_with_trusted_offsets() -> anyhow::Result<()> {
        let (_dir, store) = open_store().await?;
        let mut job = planned_job("https://example.com/crash");
        job.status = JobStatus::Running;
        job.segments[1].state = SegmentState::InFlight;
        job.segments[1].bytes_received = 64;
        store.save(&job).await?;

        let loaded = store.load(job.id).await?;
        assert_eq!(loaded.segments[1].state, SegmentState::Pending);
        assert_eq!(loaded.segments[1].bytes_received, 64);
        Ok(())
    }

    #[tokio::test]
    async fn list_active_skips_terminal_jobs() -> anyhow::Result<()> {
        let (_dir, store) = open_store().await?;
        let mut paused = planned_job("https://example.com/a");
        paused.status = JobStatus::Paused;
        let mut done = planned_job("https://example.com/b");
        done.status = JobStatus::Completed;
        let mut failed = planned_job("https://example.com/c");
        failed.status = JobStatus::Failed;
        for job in [&paused, &done, &failed] {
            store.save(job).await?;
        }

        let active = store.list_active().await?;
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, paused.id);
        assert_eq!(active[0].segments.len(), 3);
        assert_eq!(store.load_all().await?.len(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn delete_removes_record() -> anyhow::Result<()> {
        let (_dir, store) = open_store().await?;
        let job = planned_job("https://example.com/gone");
        store.save(&job).await?;
        store.delete(job.id).await?;

        assert!(matches!(store.load(job.id).await, Err(SurgeError::NotFound(id)) if id == job.id));
        Ok(())
    }

    #[tokio::test]
    async fn tracked_job_writes_through() -> anyhow::Result<()> {
        let (_dir, store) = open_store().await?;
        let job = planned_job("https://example.com/tracked");
        store.save(&job).await?;
        let tracked = TrackedJob::new(job.clone(), store.clone());

        tracked
            .update_segment(2, |s| {
                s.bytes_received = 50;
                s.state = SegmentState::InFlight;
            })
            .await?;
        tracked.update(|j| j.status = JobStatus::Paused).await?;

        let loaded = store.load(job.id).await?;
        assert_eq!(loaded.status, JobStatus::Paused);
        assert_eq!(loaded.segments[2].bytes_received, 50);
        assert_eq!(tracked.read(|j| j.bytes_received()), 50);
        Ok(())
    }

    #[tokio::test]
    async fn failed_save_leaves_memory_untouched() -> anyhow::Result<()> {
        let (_dir, store) = open_store().await?;
        let job = planned_job("https://example.com/closed");
        store.save(&job).await?;
        let tracked = TrackedJob::new(job, store.clone());
        store.close().await;

        let result = tracked.transition(JobStatus::Running, None).await;
        assert!(matches!(result, Err(SurgeError::Database(_))));
        assert_eq!(tracked.read(|j| j.status), JobStatus::Pending);

        let result = tracked.update_segment(1, |s| s.bytes_received = 10).await;
        assert!(result.is_err());
        assert_eq!(tracked.read(|j| j.segments[1].bytes_received), 0);
        Ok(())
    }
}
