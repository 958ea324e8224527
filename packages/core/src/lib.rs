//! Core domain types for the job queue system.
//!
//! This crate contains shared types used across all packages:
//! - JobRecord, JobStatus and JobRef for work items
//! - QueueOptions, QueueStats and WorkRequest for job containers
//! - Config for broker and worker timings

mod config;
mod job;
mod queue;

pub use config::{CleanUpConfig, Config, ConfigError, JobConfig};
pub use job::{
    JobField, JobId, JobRecord, JobRef, JobStatus, flatten_results, is_empty_result,
    progress_percent,
};
pub use queue::{QueueOptions, QueueStats, WorkRequest};
