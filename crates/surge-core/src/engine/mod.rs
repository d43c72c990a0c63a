//! Download Engine - the heart of Surge
//!
//! This module implements the segmented download engine:
//! - Segment planning for parallel range requests
//! - A worker pool bounded by a global connection cap
//! - Write-through persistence (SQLite) for crash-safe resume
//! - Cooperative pause/resume/cancel
//! - Exponential backoff for transport failures

mod download_task;
mod manager;
mod persistence;
mod retry;
mod segment_worker;
pub mod segmenter;

pub use download_task::*;
pub use manager::*;
pub use persistence::*;
pub use retry::*;
pub use segment_worker::*;
