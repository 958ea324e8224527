//! Process-local JobStore backend.

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use queue_core::{
    JobField, JobId, JobRecord, JobRef, JobStatus, QueueOptions, QueueStats, WorkRequest,
};
use serde_json::Value;

use crate::{ABANDONED_ERR, ReapReport, StoreError};

/// Ordered id collections, one per stored status.
#[derive(Debug, Default)]
struct Collections {
    pending: VecDeque<JobId>,
    active: VecDeque<JobId>,
    completed: VecDeque<JobId>,
    failed: VecDeque<JobId>,
    crashed: VecDeque<JobId>,
}

impl Collections {
    fn get(&self, status: JobStatus) -> Option<&VecDeque<JobId>> {
        match status {
            JobStatus::Pending => Some(&self.pending),
            JobStatus::Active => Some(&self.active),
            JobStatus::Completed => Some(&self.completed),
            JobStatus::Failed => Some(&self.failed),
            JobStatus::Crashed => Some(&self.crashed),
            JobStatus::Created => None,
        }
    }

    fn get_mut(&mut self, status: JobStatus) -> Option<&mut VecDeque<JobId>> {
        match status {
            JobStatus::Pending => Some(&mut self.pending),
            JobStatus::Active => Some(&mut self.active),
            JobStatus::Completed => Some(&mut self.completed),
            JobStatus::Failed => Some(&mut self.failed),
            JobStatus::Crashed => Some(&mut self.crashed),
            JobStatus::Created => None,
        }
    }

    fn len(&self, status: JobStatus) -> u64 {
        self.get(status).map_or(0, |ids| ids.len() as u64)
    }

    /// Remove `id` from every collection.
    fn remove(&mut self, id: JobId) {
        for status in JobStatus::STORED {
            if let Some(ids) = self.get_mut(status) {
                ids.retain(|other| *other != id);
            }
        }
    }

    /// Keep only ids matching `keep`, returning how many were dropped.
    fn retain(&mut self, keep: impl Fn(JobId) -> bool) -> usize {
        let mut dropped = 0;
        for status in JobStatus::STORED {
            if let Some(ids) = self.get_mut(status) {
                let before = ids.len();
                ids.retain(|id| keep(*id));
                dropped += before - ids.len();
            }
        }
        dropped
    }

    fn all_ids(&self) -> HashSet<JobId> {
        JobStatus::STORED
            .iter()
            .filter_map(|status| self.get(*status))
            .flatten()
            .copied()
            .collect()
    }
}

#[derive(Debug)]
struct StoredJob {
    record: JobRecord,
    /// `None` until the job is claimed.
    expires_at: Option<DateTime<Utc>>,
}

impl StoredJob {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug)]
struct StoredResult {
    value: Value,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    latest_id: u64,
    collections: Collections,
    jobs: HashMap<JobId, StoredJob>,
    results: HashMap<JobId, StoredResult>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            latest_id: 0,
            collections: Collections::default(),
            jobs: HashMap::new(),
            results: HashMap::new(),
        }
    }

    fn live_job(&self, id: JobId, now: DateTime<Utc>) -> Option<&StoredJob> {
        self.jobs.get(&id).filter(|job| job.is_live(now))
    }

    fn live_job_mut(&mut self, id: JobId, now: DateTime<Utc>) -> Option<&mut StoredJob> {
        self.jobs.get_mut(&id).filter(|job| job.is_live(now))
    }

    /// Fail an active job whose worker gave it up, live or not.
    fn abandon(&mut self, id: JobId, deadline: DateTime<Utc>) -> bool {
        let Some(job) = self
            .jobs
            .get_mut(&id)
            .filter(|job| job.record.status == JobStatus::Active)
        else {
            return false;
        };
        job.record.status = JobStatus::Failed;
        job.record.progress = 100;
        job.record
            .err
            .get_or_insert_with(|| ABANDONED_ERR.to_string());
        job.expires_at = Some(deadline);
        self.collections.remove(id);
        self.collections.failed.push_back(id);
        true
    }
}

/// JobStore backend keeping everything in process memory.
///
/// Every mutating operation takes `&mut self`, so each one is atomic with
/// respect to every other caller of the same store.
#[derive(Debug)]
pub struct MemoryStore {
    ttl: TimeDelta,
    queues: HashMap<String, QueueState>,
}

impl MemoryStore {
    /// Create an empty store whose claimed records live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
            queues: HashMap::new(),
        }
    }

    fn deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn queue_mut(&mut self, job_type: &str) -> Result<&mut QueueState, StoreError> {
        self.queues
            .get_mut(job_type)
            .ok_or_else(|| StoreError::UnknownQueue(job_type.to_string()))
    }

    pub fn register_queue(
        &mut self,
        job_type: &str,
        options: QueueOptions,
    ) -> Result<(), StoreError> {
        if options.concurrency == 0 {
            return Err(StoreError::Validation(format!(
                "queue '{job_type}' needs a positive concurrency"
            )));
        }
        self.queues
            .entry(job_type.to_string())
            .or_insert_with(|| QueueState::new(options));
        Ok(())
    }

    pub fn create_job(&mut self, job_type: &str, data: Value) -> Result<JobRecord, StoreError> {
        let queue = self.queue_mut(job_type)?;
        queue.latest_id += 1;
        let id = JobId(queue.latest_id);
        let record = JobRecord::pending(job_type, id, data);
        queue.jobs.insert(
            id,
            StoredJob {
                record: record.clone(),
                expires_at: None,
            },
        );
        queue.collections.pending.push_back(id);
        Ok(record)
    }

    pub fn get_job(&self, job_type: &str, id: JobId) -> Result<JobRecord, StoreError> {
        self.queues
            .get(job_type)
            .and_then(|queue| queue.live_job(id, Utc::now()))
            .map(|job| job.record.clone())
            .ok_or_else(|| StoreError::NotFound(JobRef::new(job_type, id)))
    }

    pub fn get_work(&mut self, worker_id: &str, requests: &[WorkRequest]) -> Vec<JobRecord> {
        let now = Utc::now();
        let deadline = self.deadline(now);
        let mut claimed = Vec::new();

        for request in requests {
            let Some(queue) = self.queues.get_mut(&request.job_type) else {
                tracing::warn!("Skipping work request for unregistered queue {}", request.job_type);
                continue;
            };

            let mut taken = 0;
            while taken < request.available {
                let Some(id) = queue.collections.pending.pop_front() else {
                    break;
                };
                let Some(job) = queue.jobs.get_mut(&id) else {
                    continue;
                };
                queue.collections.active.push_back(id);
                job.record.status = JobStatus::Active;
                job.record.start_time = Some(now);
                job.record.worker_id = Some(worker_id.to_string());
                job.expires_at = Some(deadline);
                claimed.push(job.record.clone());
                taken += 1;
            }
        }

        claimed
    }

    pub fn finish_job(
        &mut self,
        job_type: &str,
        id: JobId,
        status: JobStatus,
    ) -> Result<Option<JobRecord>, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Validation(format!(
                "cannot finish a job into the {status} state"
            )));
        }
        let now = Utc::now();
        let deadline = self.deadline(now);
        let Some(queue) = self.queues.get_mut(job_type) else {
            return Ok(None);
        };
        if queue
            .live_job(id, now)
            .is_none_or(|job| job.record.status.is_terminal())
        {
            return Ok(None);
        }

        queue.collections.remove(id);
        if status == JobStatus::Completed && queue.options.remove_on_success {
            queue.jobs.remove(&id);
            queue.results.remove(&id);
            return Ok(None);
        }
        if let Some(ids) = queue.collections.get_mut(status) {
            ids.push_back(id);
        }

        let Some(job) = queue.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.record.status = status;
        job.record.progress = 100;
        job.expires_at = Some(deadline);
        Ok(Some(job.record.clone()))
    }

    pub fn update_job_field(
        &mut self,
        job_type: &str,
        id: JobId,
        field: &JobField,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let deadline = self.deadline(now);
        let job = self
            .queues
            .get_mut(job_type)
            .and_then(|queue| queue.live_job_mut(id, now))
            .ok_or_else(|| StoreError::NotFound(JobRef::new(job_type, id)))?;
        job.record.apply(field);
        if job.expires_at.is_some() {
            job.expires_at = Some(deadline);
        }
        Ok(())
    }

    pub fn save_job_result(
        &mut self,
        job_type: &str,
        id: JobId,
        result: Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let expires_at = self.deadline(now);
        let queue = self
            .queues
            .get_mut(job_type)
            .filter(|queue| queue.live_job(id, now).is_some())
            .ok_or_else(|| StoreError::NotFound(JobRef::new(job_type, id)))?;
        queue.results.insert(
            id,
            StoredResult {
                value: result,
                expires_at,
            },
        );
        Ok(())
    }

    pub fn get_job_result(&self, job_type: &str, id: JobId) -> Option<Value> {
        let now = Utc::now();
        self.queues
            .get(job_type)
            .and_then(|queue| queue.results.get(&id))
            .filter(|result| now < result.expires_at)
            .map(|result| result.value.clone())
    }

    pub fn get_stats(&self) -> Vec<QueueStats> {
        let mut stats: Vec<QueueStats> = self
            .queues
            .iter()
            .map(|(name, queue)| QueueStats {
                job_type: name.clone(),
                active: queue.collections.len(JobStatus::Active),
                pending: queue.collections.len(JobStatus::Pending),
                completed: queue.collections.len(JobStatus::Completed),
                failed: queue.collections.len(JobStatus::Failed),
                crashed: queue.collections.len(JobStatus::Crashed),
            })
            .collect();
        stats.sort_by(|a, b| a.job_type.cmp(&b.job_type));
        stats
    }

    pub fn check_children(&self, children: &[JobRef]) -> Vec<JobRef> {
        children
            .iter()
            .filter(|child| match self.get_job(&child.job_type, child.id) {
                Ok(record) => record.status.is_terminal(),
                // Gone for good: expired or removed on success.
                Err(_) => true,
            })
            .cloned()
            .collect()
    }

    pub fn get_children_results(&self, children: &[JobRef]) -> Vec<Option<Value>> {
        children
            .iter()
            .map(|child| self.get_job_result(&child.job_type, child.id))
            .collect()
    }

    /// Force-finish abandoned active jobs as failed.
    ///
    /// An active record is cleaned up even once its deadline has passed, as
    /// long as the reaper has not dropped it yet.
    pub fn job_cleanup(&mut self, jobs: &[JobRef]) -> usize {
        let deadline = self.deadline(Utc::now());
        jobs.iter()
            .filter(|job| {
                self.queues
                    .get_mut(&job.job_type)
                    .is_some_and(|queue| queue.abandon(job.id, deadline))
            })
            .count()
    }

    pub fn remove_job(&mut self, job_type: &str, id: JobId) -> bool {
        let Some(queue) = self.queues.get_mut(job_type) else {
            return false;
        };
        queue.collections.remove(id);
        queue.results.remove(&id);
        queue.jobs.remove(&id).is_some()
    }

    pub fn clear(&mut self) {
        self.queues.clear();
    }

    pub fn reap(&mut self) -> ReapReport {
        let now = Utc::now();
        let deadline = self.deadline(now);
        let mut report = ReapReport::default();

        for queue in self.queues.values_mut() {
            let stalled: Vec<JobId> = queue
                .jobs
                .iter()
                .filter(|(_, job)| {
                    job.record.status == JobStatus::Active && !job.is_live(now)
                })
                .map(|(id, _)| *id)
                .collect();
            for id in stalled {
                if queue.abandon(id, deadline) {
                    report.abandoned_jobs += 1;
                }
            }

            let jobs_before = queue.jobs.len();
            queue.jobs.retain(|_, job| job.is_live(now));
            report.expired_jobs += jobs_before - queue.jobs.len();

            let results_before = queue.results.len();
            queue.results.retain(|_, result| now < result.expires_at);
            report.expired_results += results_before - queue.results.len();

            let live: HashSet<JobId> = queue.jobs.keys().copied().collect();
            let stale: HashSet<JobId> = queue
                .collections
                .all_ids()
                .difference(&live)
                .copied()
                .collect();
            report.stale_ids += queue.collections.retain(|id| live.contains(&id));
            let results_before = queue.results.len();
            queue.results.retain(|id, _| !stale.contains(id));
            report.expired_results += results_before - queue.results.len();
        }

        report
    }
}
