//! Live job handle used by job logic.

use std::time::Duration;

use chrono::{DateTime, Utc};
use queue_core::{
    JobField, JobId, JobRecord, JobRef, JobStatus, flatten_results, progress_percent,
};
use serde_json::Value;

use crate::client::BrokerClient;
use crate::messages::{ActorError, ActorResult};

/// What a job needs from its environment: the broker and the timings.
#[derive(Clone)]
pub struct JobContext {
    pub broker: BrokerClient,
    /// Poll interval for [`Job::wait_for_children`].
    pub refresh_rate: Duration,
    /// Longest a job may stay active.
    pub ttl: Duration,
}

/// A job bound to a broker.
///
/// Built unsaved by [`crate::Worker::create_job`] or from a claimed record
/// by the worker. Every setter persists one field.
#[derive(Clone)]
pub struct Job {
    pub id: Option<JobId>,
    pub job_type: String,
    pub data: Value,
    pub status: JobStatus,
    pub progress: u8,
    pub start_time: Option<DateTime<Utc>>,
    pub err: Option<String>,
    pub children: Vec<JobRef>,
    context: JobContext,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("job_type", &self.job_type)
            .field("status", &self.status)
            .field("progress", &self.progress)
            .finish_non_exhaustive()
    }
}

impl Job {
    /// A job not yet known to the store.
    pub fn new(job_type: impl Into<String>, data: Value, context: JobContext) -> Self {
        Self {
            id: None,
            job_type: job_type.into(),
            data,
            status: JobStatus::Created,
            progress: 0,
            start_time: None,
            err: None,
            children: Vec::new(),
            context,
        }
    }

    pub fn from_record(record: JobRecord, context: JobContext) -> Self {
        Self {
            id: Some(record.id),
            job_type: record.job_type,
            data: record.data,
            status: record.status,
            progress: record.progress,
            start_time: record.start_time,
            err: record.err,
            children: record.children,
            context,
        }
    }

    /// `None` until the job is saved.
    pub fn job_ref(&self) -> Option<JobRef> {
        self.id.map(|id| JobRef::new(self.job_type.clone(), id))
    }

    fn saved_id(&self) -> ActorResult<JobId> {
        self.id
            .ok_or_else(|| ActorError::InvalidState(format!("{} job is not saved", self.job_type)))
    }

    fn broker(&self) -> &BrokerClient {
        &self.context.broker
    }

    /// Enqueue the job. Only valid once, on a freshly created job.
    pub async fn save(&mut self) -> ActorResult<JobRef> {
        if self.status != JobStatus::Created {
            return Err(ActorError::InvalidState(format!(
                "cannot save a {} job",
                self.status
            )));
        }
        let record = self
            .broker()
            .create_job(&self.job_type, self.data.clone())
            .await?;
        self.id = Some(record.id);
        self.status = record.status;
        Ok(record.job_ref())
    }

    /// Attach an existing job as a child. The parent must be active.
    pub async fn add_child(&mut self, child: JobRef) -> ActorResult<()> {
        let id = self.require_active()?;
        self.children.push(child);
        self.broker()
            .update_job_field(&self.job_type, id, JobField::Children(self.children.clone()))
            .await
    }

    /// Save a new job of `job_type` and attach it as a child.
    pub async fn create_child(&mut self, job_type: &str, data: Value) -> ActorResult<JobRef> {
        self.require_active()?;
        let mut child = Job::new(job_type, data, self.context.clone());
        let child_ref = child.save().await?;
        self.add_child(child_ref.clone()).await?;
        Ok(child_ref)
    }

    fn require_active(&self) -> ActorResult<JobId> {
        let id = self.saved_id()?;
        if self.status != JobStatus::Active {
            return Err(ActorError::InvalidState(format!(
                "{}#{} is {}, not active",
                self.job_type, id, self.status
            )));
        }
        Ok(id)
    }

    /// Report `step` out of `total` as a percentage. A zero `total` is ignored.
    pub async fn report_progress(&mut self, step: u64, total: u64) -> ActorResult<()> {
        let Some(progress) = progress_percent(step, total) else {
            return Ok(());
        };
        let id = self.saved_id()?;
        self.progress = progress;
        self.broker()
            .update_job_field(&self.job_type, id, JobField::Progress(progress))
            .await
    }

    pub async fn set_status(&mut self, status: JobStatus) -> ActorResult<()> {
        let id = self.saved_id()?;
        self.status = status;
        self.broker()
            .update_job_field(&self.job_type, id, JobField::Status(status))
            .await
    }

    pub async fn report_error(&mut self, err: impl Into<String>) -> ActorResult<()> {
        let id = self.saved_id()?;
        let err = err.into();
        self.err = Some(err.clone());
        self.broker()
            .update_job_field(&self.job_type, id, JobField::Err(err))
            .await
    }

    /// Wait until every child is terminal and return their results.
    ///
    /// Completed children contribute their stored result, flattened one
    /// level, in the order they finished. Failed, crashed or vanished
    /// children contribute nothing. Progress is reported as the share of
    /// finished children.
    pub async fn wait_for_children(&mut self) -> ActorResult<Vec<Value>> {
        let total = self.children.len() as u64;
        let mut remaining = self.children.clone();
        let mut results = Vec::with_capacity(remaining.len());
        let mut finished = 0u64;

        while !remaining.is_empty() {
            let done = self.broker().check_children(remaining.clone()).await?;
            if !done.is_empty() {
                for child in &done {
                    results.push(self.child_result(child).await?);
                }
                remaining.retain(|child| !done.contains(child));
                finished += done.len() as u64;
                self.report_progress(finished, total).await?;
            }
            if remaining.is_empty() {
                break;
            }
            tokio::time::sleep(self.context.refresh_rate).await;
        }

        Ok(flatten_results(results))
    }

    async fn child_result(&self, child: &JobRef) -> ActorResult<Option<Value>> {
        match self.broker().get_job(&child.job_type, child.id).await {
            Ok(record) if record.status == JobStatus::Completed => {
                self.broker().get_job_result(&child.job_type, child.id).await
            }
            Ok(_) => Ok(None),
            Err(ActorError::Store(e)) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Whether the job has been active for at least its TTL.
    pub fn expired(&self) -> bool {
        self.expired_at(Utc::now())
    }

    pub fn expired_at(&self, now: DateTime<Utc>) -> bool {
        let Some(start) = self.start_time else {
            return false;
        };
        let Ok(ttl) = chrono::TimeDelta::from_std(self.context.ttl) else {
            return false;
        };
        now - start >= ttl
    }
}
