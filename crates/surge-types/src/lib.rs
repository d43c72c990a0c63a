//! Shared types for Surge
//!
//! This crate contains the data model shared between the download engine
//! and whatever front end drives it (terminal UI, CLI, desktop shell).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Stable identifier of a download job
pub type JobId = Uuid;

// ============================================================================
// Job Types
// ============================================================================

/// One user-requested transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadJob {
    pub id: JobId,
    pub source_uri: String,
    pub destination: PathBuf,
    /// Byte length of the resource, `None` while unknown
    pub total_size: Option<u64>,
    pub status: JobStatus,
    /// Empty until the first run has planned the job
    pub segments: Vec<Segment>,
    /// Last job-level failure, cleared when the job runs again
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl DownloadJob {
    pub fn new(source_uri: String, destination: PathBuf) -> Self {
        Self {
            id: Self::derive_id(&source_uri, &destination),
            source_uri,
            destination,
            total_size: None,
            status: JobStatus::Pending,
            segments: Vec::new(),
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Derive the job id from its source and destination.
    ///
    /// The same pair always maps to the same id, so a resubmission after a
    /// restart finds the persisted record instead of creating a twin.
    pub fn derive_id(source_uri: &str, destination: &Path) -> JobId {
        let name = format!("{}\n{}", source_uri, destination.display());
        Uuid::new_v5(&Uuid::NAMESPACE_URL, name.as_bytes())
    }

    /// Whether the segment plan exists
    pub fn is_planned(&self) -> bool {
        !self.segments.is_empty()
    }

    /// Sum of confirmed bytes across all segments
    pub fn bytes_received(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes_received).sum()
    }

    /// True once a plan exists and every segment is done
    pub fn all_segments_done(&self) -> bool {
        self.is_planned() && self.segments.iter().all(Segment::is_done)
    }

    pub fn progress(&self) -> f64 {
        match self.total_size {
            Some(size) if size > 0 => (self.bytes_received() as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }

    /// Point-in-time view handed out to callers
    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            id: self.id,
            source_uri: self.source_uri.clone(),
            destination: self.destination.clone(),
            status: self.status,
            total_size: self.total_size,
            bytes_received: self.bytes_received(),
            segments: self.segments.iter().map(SegmentProgress::from).collect(),
            error: self.error.clone(),
        }
    }
}

/// Status of a download job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    /// Completed, failed and canceled jobs make no further progress on their own
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of a single segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentState {
    Pending,
    InFlight,
    Done,
    Errored,
}

impl SegmentState {
    pub fn as_str(self) -> &'static str {
        match self {
            SegmentState::Pending => "pending",
            SegmentState::InFlight => "inflight",
            SegmentState::Done => "done",
            SegmentState::Errored => "errored",
        }
    }
}

/// One contiguous byte range of a job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub index: u32,
    pub start: u64,
    /// Inclusive end offset, `Segment::OPEN_END` when the resource size is unknown
    pub end: u64,
    pub bytes_received: u64,
    pub state: SegmentState,
}

impl Segment {
    /// End marker of a segment that runs until the stream ends
    pub const OPEN_END: u64 = u64::MAX;

    pub fn new(index: u32, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            bytes_received: 0,
            state: SegmentState::Pending,
        }
    }

    /// A single segment spanning a stream of unknown length
    pub fn open(index: u32, start: u64) -> Self {
        Self::new(index, start, Self::OPEN_END)
    }

    pub fn is_unknown_size(&self) -> bool {
        self.end == Self::OPEN_END
    }

    /// Length of the byte range, `None` for an open segment
    pub fn size(&self) -> Option<u64> {
        if self.is_unknown_size() {
            None
        } else {
            Some(self.end - self.start + 1)
        }
    }

    /// Absolute offset of the next byte this segment needs
    pub fn next_offset(&self) -> u64 {
        self.start + self.bytes_received
    }

    pub fn is_done(&self) -> bool {
        self.state == SegmentState::Done
    }

    pub fn progress(&self) -> f64 {
        match self.size() {
            Some(size) if size > 0 => (self.bytes_received as f64 / size as f64) * 100.0,
            _ => 0.0,
        }
    }
}

// ============================================================================
// Query Types
// ============================================================================

/// Snapshot returned by a job query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub source_uri: String,
    pub destination: PathBuf,
    pub status: JobStatus,
    pub total_size: Option<u64>,
    pub bytes_received: u64,
    pub segments: Vec<SegmentProgress>,
    pub error: Option<String>,
}

/// Per-segment progress inside a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentProgress {
    pub index: u32,
    pub start: u64,
    /// Inclusive end; `None` while the size is unknown and for an empty resource
    pub end: Option<u64>,
    pub bytes_received: u64,
    pub state: SegmentState,
}

impl From<&Segment> for SegmentProgress {
    fn from(segment: &Segment) -> Self {
        Self {
            index: segment.index,
            start: segment.start,
            end: (!segment.is_unknown_size()).then_some(segment.end),
            bytes_received: segment.bytes_received,
            state: segment.state,
        }
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum concurrent segment fetches across all jobs
    pub max_connections: u32,
    /// Segments per job when the server supports ranges
    pub default_concurrency: u32,
    /// Smallest segment the planner will produce
    pub min_segment_size: u64,
    /// Bytes written between two progress flushes
    pub chunk_size: usize,
    pub retry: RetrySettings,
    pub cancel_policy: CancelPolicy,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_connections: 16,
            default_concurrency: 4,
            min_segment_size: 1024 * 1024,
            chunk_size: 256 * 1024,
            retry: RetrySettings::default(),
            cancel_policy: CancelPolicy::default(),
            user_agent: format!("Surge/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 30,
            request_timeout_secs: 120,
        }
    }
}

impl EngineConfig {
    /// Per-user directory holding the job database
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .map(|d| d.join("surge"))
            .unwrap_or_else(|| PathBuf::from(".surge"))
    }
}

/// Backoff settings for segment fetch retries
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Attempts per segment including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 250,
            max_delay_ms: 30_000,
        }
    }
}

/// What happens to the partial file when a job is canceled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelPolicy {
    #[default]
    DeletePartial,
    RetainPartial,
}

// ============================================================================
// Event Types
// ============================================================================

/// Events emitted by the engine to the UI
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    JobAdded {
        job: JobSnapshot,
    },
    JobStatusChanged {
        id: JobId,
        status: JobStatus,
        error: Option<String>,
    },
    SegmentProgress {
        job_id: JobId,
        segment_index: u32,
        bytes_received: u64,
    },
    JobRemoved {
        id: JobId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_is_stable_for_same_source_and_destination() {
        let a = DownloadJob::new("https://example.com/a.iso".into(), "/tmp/a.iso".into());
        let b = DownloadJob::new("https://example.com/a.iso".into(), "/tmp/a.iso".into());
        let c = DownloadJob::new("https://example.com/a.iso".into(), "/tmp/b.iso".into());
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
    }

    #[test]
    fn open_segment_has_no_size() {
        let segment = Segment::open(0, 0);
        assert!(segment.is_unknown_size());
        assert_eq!(segment.size(), None);
        assert_eq!(SegmentProgress::from(&segment).end, None);

        let segment = Segment::new(1, 100, 199);
        assert_eq!(segment.size(), Some(100));
    }

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Canceled.is_terminal());
        assert!(!JobStatus::Paused.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
    }

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"max_connections": 2, "retry": {"max_attempts": 9}}"#).unwrap();
        assert_eq!(config.max_connections, 2);
        assert_eq!(config.default_concurrency, 4);
        assert_eq!(config.retry.max_attempts, 9);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.cancel_policy, CancelPolicy::DeletePartial);
    }
}
