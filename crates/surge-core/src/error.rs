//! Error types for Surge core

use crate::transfer::TransportError;
use surge_types::{JobId, JobStatus};
use thiserror::Error;

/// Errors that can occur in Surge core
#[derive(Debug, Error)]
pub enum SurgeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Range {start}-{end} not satisfiable")]
    RangeNotSatisfiable { start: u64, end: String },

    #[error("Server responded with status {status}")]
    HttpStatus { status: u16 },

    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Cannot {operation} job {id} while it is {status}")]
    InvalidTransition {
        id: JobId,
        status: JobStatus,
        operation: &'static str,
    },

    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job already exists: {0}")]
    AlreadyExists(JobId),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Corrupt job record: {0}")]
    CorruptRecord(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SurgeError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            SurgeError::Transport(_) => true,
            SurgeError::HttpStatus { status } => {
                *status >= 500 || *status == 408 || *status == 429
            }
            _ => false,
        }
    }

    /// Failures of the destination disk or the job database
    pub fn is_storage(&self) -> bool {
        matches!(self, SurgeError::Storage(_) | SurgeError::Database(_))
    }
}
