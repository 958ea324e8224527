//! Queue domain types for job containers.

use serde::{Deserialize, Serialize};

/// Options a queue is registered with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Jobs of this type a single worker runs at once.
    pub concurrency: u32,
    /// Delete completed jobs instead of keeping them until their TTL.
    pub remove_on_success: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            remove_on_success: false,
        }
    }
}

impl QueueOptions {
    pub fn with_concurrency(concurrency: u32) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    /// Drop completed jobs right away.
    pub fn remove_on_success(mut self) -> Self {
        self.remove_on_success = true;
        self
    }
}

impl From<u32> for QueueOptions {
    fn from(concurrency: u32) -> Self {
        Self::with_concurrency(concurrency)
    }
}

/// Point-in-time counts of a queue's status collections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    #[serde(rename = "type")]
    pub job_type: String,
    pub active: u64,
    pub pending: u64,
    pub completed: u64,
    pub failed: u64,
    pub crashed: u64,
}

impl QueueStats {
    /// Jobs that reached a terminal state and are still retained.
    pub fn finished(&self) -> u64 {
        self.completed + self.failed + self.crashed
    }

    /// Jobs still waiting or running.
    pub fn outstanding(&self) -> u64 {
        self.pending + self.active
    }
}

/// One entry of a `get_work` request: how many more jobs of a type the
/// caller can run right now.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub available: u32,
}

impl WorkRequest {
    pub fn new(job_type: impl Into<String>, available: u32) -> Self {
        Self {
            job_type: job_type.into(),
            available,
        }
    }
}
