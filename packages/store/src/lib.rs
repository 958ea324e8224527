//! Storage port for the job queue system.
//!
//! A [`JobStore`] is one of two interchangeable backends chosen at
//! construction time:
//!
//! - `Memory`: process-local maps, for single-process use and tests
//! - `Surreal`: SurrealDB, shared between processes
//!
//! # Features
//!
//! - `rocksdb`: enable `rocksdb://` endpoints for the Surreal backend

mod connection;
mod memory;
mod schema;
mod surreal;

use std::time::Duration;

use queue_core::{
    JobField, JobId, JobRecord, JobRef, JobStatus, QueueOptions, QueueStats, WorkRequest,
};
use serde_json::Value;

pub use connection::{StoreBackend, StoreConfig, StoreError};
pub use memory::MemoryStore;
pub use schema::init_schema;
pub use surreal::SurrealStore;

/// `err` written on jobs force-finished because their worker gave them up.
pub const ABANDONED_ERR: &str = "Error: job abandoned by its worker";

/// What a reconciliation sweep changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Active jobs past their deadline, failed as abandoned instead of dropped.
    pub abandoned_jobs: usize,
    /// Job records whose TTL ran out.
    pub expired_jobs: usize,
    /// Results dropped because they expired or their job did.
    pub expired_results: usize,
    /// Collection entries no longer backed by a live record.
    pub stale_ids: usize,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.abandoned_jobs == 0
            && self.expired_jobs == 0
            && self.expired_results == 0
            && self.stale_ids == 0
    }
}

/// Atomic queue/job operations over one of the storage backends.
pub enum JobStore {
    Memory(MemoryStore),
    Surreal(SurrealStore),
}

impl JobStore {
    /// Build the backend selected by `config`. Claimed records and results
    /// are kept for `ttl`.
    pub async fn open(config: &StoreConfig, ttl: Duration) -> Result<Self, StoreError> {
        match config.backend {
            StoreBackend::Memory => Ok(Self::memory(ttl)),
            StoreBackend::Surreal => Ok(Self::Surreal(SurrealStore::connect(config, ttl).await?)),
        }
    }

    /// An empty in-process store.
    pub fn memory(ttl: Duration) -> Self {
        Self::Memory(MemoryStore::new(ttl))
    }

    pub fn backend(&self) -> StoreBackend {
        match self {
            Self::Memory(_) => StoreBackend::Memory,
            Self::Surreal(_) => StoreBackend::Surreal,
        }
    }

    /// Create a queue's counter and collections if they don't exist yet.
    pub async fn register_queue(
        &mut self,
        job_type: &str,
        options: QueueOptions,
    ) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.register_queue(job_type, options),
            Self::Surreal(store) => store.register_queue(job_type, options).await,
        }
    }

    /// Assign the next id of `job_type` and enqueue a pending job.
    pub async fn create_job(&mut self, job_type: &str, data: Value) -> Result<JobRecord, StoreError> {
        match self {
            Self::Memory(store) => store.create_job(job_type, data),
            Self::Surreal(store) => store.create_job(job_type, data).await,
        }
    }

    pub async fn get_job(&self, job_type: &str, id: JobId) -> Result<JobRecord, StoreError> {
        match self {
            Self::Memory(store) => store.get_job(job_type, id),
            Self::Surreal(store) => store.get_job(job_type, id).await,
        }
    }

    /// Claim up to `available` pending jobs of each requested type for
    /// `worker_id`. Each claim is a single pending→active move.
    pub async fn get_work(
        &mut self,
        worker_id: &str,
        requests: &[WorkRequest],
    ) -> Result<Vec<JobRecord>, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.get_work(worker_id, requests)),
            Self::Surreal(store) => store.get_work(worker_id, requests).await,
        }
    }

    /// Move a job into `status`'s collection. `status` must be terminal.
    /// `None` when the job is unknown, already finished, or was dropped by
    /// `remove_on_success`.
    pub async fn finish_job(
        &mut self,
        job_type: &str,
        id: JobId,
        status: JobStatus,
    ) -> Result<Option<JobRecord>, StoreError> {
        match self {
            Self::Memory(store) => store.finish_job(job_type, id, status),
            Self::Surreal(store) => store.finish_job(job_type, id, status).await,
        }
    }

    pub async fn update_job_field(
        &mut self,
        job_type: &str,
        id: JobId,
        field: &JobField,
    ) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.update_job_field(job_type, id, field),
            Self::Surreal(store) => store.update_job_field(job_type, id, field).await,
        }
    }

    pub async fn save_job_result(
        &mut self,
        job_type: &str,
        id: JobId,
        result: Value,
    ) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => store.save_job_result(job_type, id, result),
            Self::Surreal(store) => store.save_job_result(job_type, id, result).await,
        }
    }

    /// A job's stored result; `None` when nothing (or nothing live) is stored.
    pub async fn get_job_result(
        &self,
        job_type: &str,
        id: JobId,
    ) -> Result<Option<Value>, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.get_job_result(job_type, id)),
            Self::Surreal(store) => store.get_job_result(job_type, id).await,
        }
    }

    pub async fn get_stats(&self) -> Result<Vec<QueueStats>, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.get_stats()),
            Self::Surreal(store) => store.get_stats().await,
        }
    }

    /// The subset of `children` currently in a terminal state. Children
    /// that no longer exist count as terminal.
    pub async fn check_children(&self, children: &[JobRef]) -> Result<Vec<JobRef>, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.check_children(children)),
            Self::Surreal(store) => store.check_children(children).await,
        }
    }

    pub async fn get_children_results(
        &self,
        children: &[JobRef],
    ) -> Result<Vec<Option<Value>>, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.get_children_results(children)),
            Self::Surreal(store) => store.get_children_results(children).await,
        }
    }

    /// Force-finish still-active jobs as failed. Returns how many moved.
    pub async fn job_cleanup(&mut self, jobs: &[JobRef]) -> Result<usize, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.job_cleanup(jobs)),
            Self::Surreal(store) => store.job_cleanup(jobs).await,
        }
    }

    /// Delete a job, its result and its collection entry.
    pub async fn remove_job(&mut self, job_type: &str, id: JobId) -> Result<bool, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.remove_job(job_type, id)),
            Self::Surreal(store) => store.remove_job(job_type, id).await,
        }
    }

    pub async fn clear(&mut self) -> Result<(), StoreError> {
        match self {
            Self::Memory(store) => {
                store.clear();
                Ok(())
            }
            Self::Surreal(store) => store.clear().await,
        }
    }

    /// Fail active jobs past their deadline, drop expired records and
    /// results, then every collection entry no longer backed by a live record.
    pub async fn reap(&mut self) -> Result<ReapReport, StoreError> {
        match self {
            Self::Memory(store) => Ok(store.reap()),
            Self::Surreal(store) => store.reap().await,
        }
    }
}
