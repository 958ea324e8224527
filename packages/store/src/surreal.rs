//! SurrealDB-backed JobStore, shared by every process pointed at the same
//! endpoint.
//!
//! Atomicity rests on single-statement record updates and transactions: the
//! id counter is a `+= 1` on the queue record, and claiming work moves the
//! head of `pending` onto `active` and marks those records active inside one
//! transaction.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use queue_core::{
    JobField, JobId, JobRecord, JobRef, JobStatus, QueueOptions, QueueStats, WorkRequest,
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use surrealdb::Surreal;
use surrealdb::engine::any::{Any, connect};
use surrealdb::opt::auth::Root;

use crate::{ABANDONED_ERR, ReapReport, StoreConfig, StoreError, init_schema};

const QUEUE: &str = "queue";
const JOB: &str = "job";
const RESULT: &str = "job_result";

/// `expires_at` of records that have not been claimed yet.
const NEVER: i64 = i64::MAX;

/// Moves up to `$count` ids from `pending` to `active` and marks their
/// records active. Either every write lands or none does.
const CLAIM_QUERY: &str = r#"
BEGIN TRANSACTION;
LET $before = (UPDATE type::thing('queue', $queue) SET
    active = array::concat(active, array::slice(pending, 0, $count)),
    pending = array::slice(pending, $count)
RETURN BEFORE);
LET $ids = array::slice($before[0].pending ?? [], 0, $count);
LET $jobs = (UPDATE job SET
    status = 'active',
    start_time = $now,
    worker_id = $worker,
    expires_at = $deadline
WHERE job_type = $queue AND job_id INSIDE $ids
RETURN AFTER);
RETURN { registered: array::len($before) > 0, ids: $ids, jobs: $jobs };
COMMIT TRANSACTION;
"#;

/// Outcome of one [`CLAIM_QUERY`].
#[derive(Debug, Deserialize)]
struct ClaimRow {
    registered: bool,
    /// Claimed ids in queue order.
    #[serde(default)]
    ids: Vec<JobId>,
    #[serde(default)]
    jobs: Vec<JobRow>,
}

/// Queue record: config, id counter and status collections.
#[derive(Debug, Serialize, Deserialize)]
struct QueueRow {
    name: String,
    concurrency: u32,
    #[serde(default)]
    remove_on_success: bool,
    #[serde(default)]
    latest_id: u64,
    #[serde(default)]
    pending: Vec<JobId>,
    #[serde(default)]
    active: Vec<JobId>,
    #[serde(default)]
    completed: Vec<JobId>,
    #[serde(default)]
    failed: Vec<JobId>,
    #[serde(default)]
    crashed: Vec<JobId>,
}

impl QueueRow {
    fn new(name: &str, options: &QueueOptions) -> Self {
        Self {
            name: name.to_string(),
            concurrency: options.concurrency,
            remove_on_success: options.remove_on_success,
            latest_id: 0,
            pending: Vec::new(),
            active: Vec::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            crashed: Vec::new(),
        }
    }

    fn stats(&self) -> QueueStats {
        QueueStats {
            job_type: self.name.clone(),
            active: self.active.len() as u64,
            pending: self.pending.len() as u64,
            completed: self.completed.len() as u64,
            failed: self.failed.len() as u64,
            crashed: self.crashed.len() as u64,
        }
    }

    fn all_ids(&self) -> impl Iterator<Item = JobId> + '_ {
        self.pending
            .iter()
            .chain(&self.active)
            .chain(&self.completed)
            .chain(&self.failed)
            .chain(&self.crashed)
            .copied()
    }
}

/// Internal record type for jobs. The SurrealDB record id is `<type>:<id>`;
/// the numeric id is kept in `job_id` for queries.
#[derive(Debug, Serialize, Deserialize)]
struct JobRow {
    job_id: JobId,
    job_type: String,
    #[serde(default)]
    data: Value,
    status: JobStatus,
    #[serde(default)]
    progress: u8,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    err: Option<String>,
    #[serde(default)]
    children: Vec<JobRef>,
    #[serde(default)]
    worker_id: Option<String>,
    expires_at: i64,
}

impl JobRow {
    fn new(record: JobRecord, expires_at: i64) -> Self {
        Self {
            job_id: record.id,
            job_type: record.job_type,
            data: record.data,
            status: record.status,
            progress: record.progress,
            start_time: record.start_time,
            err: record.err,
            children: record.children,
            worker_id: record.worker_id,
            expires_at,
        }
    }

    fn is_live(&self, now_ms: i64) -> bool {
        now_ms < self.expires_at
    }

    fn into_record(self) -> JobRecord {
        JobRecord {
            id: self.job_id,
            job_type: self.job_type,
            data: self.data,
            status: self.status,
            progress: self.progress,
            start_time: self.start_time,
            err: self.err,
            children: self.children,
            worker_id: self.worker_id,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ResultRow {
    job_id: JobId,
    job_type: String,
    #[serde(default)]
    result: Value,
    expires_at: i64,
}

/// Active job past its deadline, as found by the reaper.
#[derive(Debug, Deserialize)]
struct StalledRow {
    job_type: String,
    job_id: JobId,
}

fn job_key(job_type: &str, id: JobId) -> String {
    format!("{job_type}:{id}")
}

/// JobStore backend on SurrealDB.
pub struct SurrealStore {
    db: Surreal<Any>,
    ttl: TimeDelta,
}

impl SurrealStore {
    /// Connect to the configured endpoint and make sure the schema exists.
    pub async fn connect(config: &StoreConfig, ttl: Duration) -> Result<Self, StoreError> {
        tracing::info!("Connecting to job store: {}", config.endpoint);

        let db = connect(&config.endpoint).await?;

        // Authenticate if credentials provided
        if let Some((username, password)) = &config.credentials {
            db.signin(Root { username, password }).await?;
        }

        db.use_ns(&config.namespace)
            .use_db(&config.database)
            .await?;

        tracing::info!(
            "Connected to job store: {}/{}",
            config.namespace,
            config.database
        );

        init_schema(&db).await?;
        Ok(Self::with_db(db, ttl))
    }

    /// Wrap an already connected database.
    pub fn with_db(db: Surreal<Any>, ttl: Duration) -> Self {
        Self {
            db,
            ttl: TimeDelta::from_std(ttl).unwrap_or(TimeDelta::MAX),
        }
    }

    fn deadline(&self, now: DateTime<Utc>) -> i64 {
        now.timestamp_millis()
            .saturating_add(self.ttl.num_milliseconds())
    }

    async fn queue_row(&self, job_type: &str) -> Result<Option<QueueRow>, StoreError> {
        Ok(self.db.select((QUEUE, job_type.to_string())).await?)
    }

    async fn live_row(
        &self,
        job_type: &str,
        id: JobId,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRow>, StoreError> {
        let row: Option<JobRow> = self.db.select((JOB, job_key(job_type, id))).await?;
        Ok(row.filter(|row| row.is_live(now.timestamp_millis())))
    }

    pub async fn register_queue(
        &self,
        job_type: &str,
        options: QueueOptions,
    ) -> Result<(), StoreError> {
        if options.concurrency == 0 {
            return Err(StoreError::Validation(format!(
                "queue '{job_type}' needs a positive concurrency"
            )));
        }
        if self.queue_row(job_type).await?.is_some() {
            return Ok(());
        }

        let created: Result<Option<QueueRow>, surrealdb::Error> = self
            .db
            .create((QUEUE, job_type.to_string()))
            .content(QueueRow::new(job_type, &options))
            .await;

        match created {
            Ok(_) => {
                tracing::debug!("Registered queue {}", job_type);
                Ok(())
            }
            Err(e) => {
                // Lost a registration race against another process.
                if self.queue_row(job_type).await?.is_some() {
                    tracing::debug!("Queue {} registered concurrently: {}", job_type, e);
                    Ok(())
                } else {
                    Err(e.into())
                }
            }
        }
    }

    pub async fn create_job(&self, job_type: &str, data: Value) -> Result<JobRecord, StoreError> {
        let mut response = self
            .db
            .query("UPDATE type::thing('queue', $queue) SET latest_id += 1 RETURN AFTER")
            .bind(("queue", job_type.to_string()))
            .await?;
        let rows: Vec<QueueRow> = response.take(0)?;
        let row = rows
            .into_iter()
            .next()
            .ok_or_else(|| StoreError::UnknownQueue(job_type.to_string()))?;

        let record = JobRecord::pending(job_type, JobId(row.latest_id), data);
        let _: Option<JobRow> = self
            .db
            .create((JOB, job_key(job_type, record.id)))
            .content(JobRow::new(record.clone(), NEVER))
            .await?;

        self.db
            .query("UPDATE type::thing('queue', $queue) SET pending += $id")
            .bind(("queue", job_type.to_string()))
            .bind(("id", record.id))
            .await?
            .check()?;

        Ok(record)
    }

    pub async fn get_job(&self, job_type: &str, id: JobId) -> Result<JobRecord, StoreError> {
        self.live_row(job_type, id, Utc::now())
            .await?
            .map(JobRow::into_record)
            .ok_or_else(|| StoreError::NotFound(JobRef::new(job_type, id)))
    }

    pub async fn get_work(
        &self,
        worker_id: &str,
        requests: &[WorkRequest],
    ) -> Result<Vec<JobRecord>, StoreError> {
        let now = Utc::now();
        let mut claimed = Vec::new();

        for request in requests.iter().filter(|r| r.available > 0) {
            let mut response = self
                .db
                .query(CLAIM_QUERY)
                .bind(("queue", request.job_type.clone()))
                .bind(("count", i64::from(request.available)))
                .bind(("worker", worker_id.to_string()))
                .bind(("now", now))
                .bind(("deadline", self.deadline(now)))
                .await?;
            // Only the RETURN statement yields a value.
            let mut claim: Option<ClaimRow> = None;
            for index in (0..response.num_statements()).rev() {
                claim = response.take(index)?;
                if claim.is_some() {
                    break;
                }
            }
            let Some(claim) = claim.filter(|claim| claim.registered) else {
                tracing::warn!(
                    "Skipping work request for unregistered queue {}",
                    request.job_type
                );
                continue;
            };

            let mut rows: HashMap<JobId, JobRow> =
                claim.jobs.into_iter().map(|row| (row.job_id, row)).collect();
            for id in claim.ids {
                match rows.remove(&id) {
                    Some(row) => claimed.push(row.into_record()),
                    None => tracing::warn!(
                        "Claimed {}#{} without a backing record",
                        request.job_type,
                        id
                    ),
                }
            }
        }

        Ok(claimed)
    }

    pub async fn finish_job(
        &self,
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
        let live = self.live_row(job_type, id, now).await?;
        if live.is_none_or(|row| row.status.is_terminal()) {
            return Ok(None);
        }
        let Some(queue) = self.queue_row(job_type).await? else {
            return Ok(None);
        };

        let remove_only = status == JobStatus::Completed && queue.remove_on_success;
        let assignments: Vec<String> = JobStatus::STORED
            .iter()
            .map(|s| {
                let name = s.as_str();
                if *s == status && !remove_only {
                    format!("{name} = array::append(array::complement({name}, [$id]), $id)")
                } else {
                    format!("{name} = array::complement({name}, [$id])")
                }
            })
            .collect();
        self.db
            .query(format!(
                "UPDATE type::thing('queue', $queue) SET {}",
                assignments.join(", ")
            ))
            .bind(("queue", job_type.to_string()))
            .bind(("id", id))
            .await?
            .check()?;

        if remove_only {
            self.delete_rows(job_type, id).await?;
            return Ok(None);
        }

        let row: Option<JobRow> = self
            .db
            .update((JOB, job_key(job_type, id)))
            .merge(json!({
                "status": status,
                "progress": 100,
                "expires_at": self.deadline(now),
            }))
            .await?;
        Ok(row.map(JobRow::into_record))
    }

    pub async fn update_job_field(
        &self,
        job_type: &str,
        id: JobId,
        field: &JobField,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        let row = self
            .live_row(job_type, id, now)
            .await?
            .ok_or_else(|| StoreError::NotFound(JobRef::new(job_type, id)))?;

        let expires_at = if row.expires_at == NEVER {
            NEVER
        } else {
            self.deadline(now)
        };
        let mut patch = serde_json::Map::new();
        patch.insert(field.name().to_string(), field.value());
        patch.insert("expires_at".to_string(), json!(expires_at));

        let _: Option<JobRow> = self
            .db
            .update((JOB, job_key(job_type, id)))
            .merge(Value::Object(patch))
            .await?;
        Ok(())
    }

    pub async fn save_job_result(
        &self,
        job_type: &str,
        id: JobId,
        result: Value,
    ) -> Result<(), StoreError> {
        let now = Utc::now();
        if self.live_row(job_type, id, now).await?.is_none() {
            return Err(StoreError::NotFound(JobRef::new(job_type, id)));
        }

        let _: Option<ResultRow> = self
            .db
            .upsert((RESULT, job_key(job_type, id)))
            .content(ResultRow {
                job_id: id,
                job_type: job_type.to_string(),
                result,
                expires_at: self.deadline(now),
            })
            .await?;
        Ok(())
    }

    pub async fn get_job_result(
        &self,
        job_type: &str,
        id: JobId,
    ) -> Result<Option<Value>, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let row: Option<ResultRow> = self.db.select((RESULT, job_key(job_type, id))).await?;
        Ok(row
            .filter(|row| now_ms < row.expires_at)
            .map(|row| row.result))
    }

    pub async fn get_stats(&self) -> Result<Vec<QueueStats>, StoreError> {
        let rows: Vec<QueueRow> = self.db.select(QUEUE).await?;
        let mut stats: Vec<QueueStats> = rows.iter().map(QueueRow::stats).collect();
        stats.sort_by(|a, b| a.job_type.cmp(&b.job_type));
        Ok(stats)
    }

    pub async fn check_children(&self, children: &[JobRef]) -> Result<Vec<JobRef>, StoreError> {
        let now = Utc::now();
        let mut done = Vec::new();
        for child in children {
            let finished = match self.live_row(&child.job_type, child.id, now).await? {
                Some(row) => row.status.is_terminal(),
                None => true,
            };
            if finished {
                done.push(child.clone());
            }
        }
        Ok(done)
    }

    pub async fn get_children_results(
        &self,
        children: &[JobRef],
    ) -> Result<Vec<Option<Value>>, StoreError> {
        let mut results = Vec::with_capacity(children.len());
        for child in children {
            results.push(self.get_job_result(&child.job_type, child.id).await?);
        }
        Ok(results)
    }

    /// Force-finish abandoned active jobs as failed, including active records
    /// past their deadline that the reaper has not dropped yet.
    pub async fn job_cleanup(&self, jobs: &[JobRef]) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut cleaned = 0;
        for job in jobs {
            let key = job_key(&job.job_type, job.id);
            let row: Option<JobRow> = self.db.select((JOB, key.clone())).await?;
            let Some(row) = row.filter(|row| row.status == JobStatus::Active) else {
                continue;
            };
            let err = row.err.unwrap_or_else(|| ABANDONED_ERR.to_string());
            let _: Option<JobRow> = self
                .db
                .update((JOB, key))
                .merge(json!({
                    "err": err,
                    "expires_at": self.deadline(now),
                }))
                .await?;
            if self
                .finish_job(&job.job_type, job.id, JobStatus::Failed)
                .await?
                .is_some()
            {
                cleaned += 1;
            }
        }
        Ok(cleaned)
    }

    async fn delete_rows(&self, job_type: &str, id: JobId) -> Result<bool, StoreError> {
        let removed: Option<JobRow> = self.db.delete((JOB, job_key(job_type, id))).await?;
        let _: Option<ResultRow> = self.db.delete((RESULT, job_key(job_type, id))).await?;
        Ok(removed.is_some())
    }

    pub async fn remove_job(&self, job_type: &str, id: JobId) -> Result<bool, StoreError> {
        let removed = self.delete_rows(job_type, id).await?;
        self.db
            .query(
                r#"
                UPDATE type::thing('queue', $queue) SET
                    pending = array::complement(pending, [$id]),
                    active = array::complement(active, [$id]),
                    completed = array::complement(completed, [$id]),
                    failed = array::complement(failed, [$id]),
                    crashed = array::complement(crashed, [$id])
                "#,
            )
            .bind(("queue", job_type.to_string()))
            .bind(("id", id))
            .await?
            .check()?;
        Ok(removed)
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.db
            .query("DELETE queue; DELETE job; DELETE job_result;")
            .await?
            .check()?;
        Ok(())
    }

    pub async fn reap(&self) -> Result<ReapReport, StoreError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut report = ReapReport::default();

        let mut response = self
            .db
            .query("SELECT job_type, job_id FROM job WHERE status = 'active' AND expires_at <= $now")
            .bind(("now", now_ms))
            .await?;
        let stalled: Vec<StalledRow> = response.take(0)?;
        if !stalled.is_empty() {
            let refs: Vec<JobRef> = stalled
                .into_iter()
                .map(|row| JobRef::new(row.job_type, row.job_id))
                .collect();
            report.abandoned_jobs = self.job_cleanup(&refs).await?;
        }

        let mut response = self
            .db
            .query(
                r#"
                DELETE job WHERE expires_at <= $now RETURN BEFORE;
                DELETE job_result WHERE expires_at <= $now RETURN BEFORE;
                "#,
            )
            .bind(("now", now_ms))
            .await?;
        let expired_jobs: Vec<JobRow> = response.take(0)?;
        let expired_results: Vec<ResultRow> = response.take(1)?;
        report.expired_jobs = expired_jobs.len();
        report.expired_results = expired_results.len();

        // Snapshot the collections before reading the live ids: a job is
        // written before its id is enqueued, so every id seen here already
        // has a record unless that record is gone.
        let queues: Vec<QueueRow> = self.db.select(QUEUE).await?;
        for queue in queues {
            let mut response = self
                .db
                .query("SELECT VALUE job_id FROM job WHERE job_type = $queue")
                .bind(("queue", queue.name.clone()))
                .await?;
            let live: HashSet<JobId> = response.take::<Vec<JobId>>(0)?.into_iter().collect();
            let stale: Vec<JobId> = queue.all_ids().filter(|id| !live.contains(id)).collect();
            if stale.is_empty() {
                continue;
            }

            let stale_count = stale.len();
            let mut response = self
                .db
                .query(
                    r#"
                    UPDATE type::thing('queue', $queue) SET
                        pending = array::complement(pending, $stale),
                        active = array::complement(active, $stale),
                        completed = array::complement(completed, $stale),
                        failed = array::complement(failed, $stale),
                        crashed = array::complement(crashed, $stale);
                    DELETE job_result WHERE job_type = $queue AND job_id INSIDE $stale RETURN BEFORE;
                    "#,
                )
                .bind(("queue", queue.name.clone()))
                .bind(("stale", stale))
                .await?;
            let orphaned: Vec<ResultRow> = response.take(1)?;
            report.stale_ids += stale_count;
            report.expired_results += orphaned.len();
        }

        Ok(report)
    }
}
