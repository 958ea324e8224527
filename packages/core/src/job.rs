//! Job domain types for work items in the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a job, unique within its type and assigned by the store.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// The raw counter value.
    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Weak `{type, id}` reference to a job. Carries no ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobRef {
    #[serde(rename = "type")]
    pub job_type: String,
    pub id: JobId,
}

impl JobRef {
    pub fn new(job_type: impl Into<String>, id: impl Into<JobId>) -> Self {
        Self {
            job_type: job_type.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for JobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.job_type, self.id)
    }
}

/// Current status of a job in its lifecycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Built in memory, not yet saved.
    #[default]
    Created,
    /// Persisted and waiting for a worker.
    Pending,
    /// Claimed by exactly one worker.
    Active,
    /// Logic reported success.
    Completed,
    /// Logic reported an error, or the job was abandoned.
    Failed,
    /// Logic raised instead of reporting.
    Crashed,
}

impl JobStatus {
    /// Statuses that have a collection in the store, in display order.
    pub const STORED: [JobStatus; 5] = [
        JobStatus::Pending,
        JobStatus::Active,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Crashed,
    ];

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Crashed
        )
    }

    /// Get a simple status string for display.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Pending => "pending",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Crashed => "crashed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persisted job record as stored and exchanged between worker and broker.
///
/// The job result is not part of the record; it lives under its own key and
/// expires on its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: String,
    /// Opaque job payload.
    pub data: serde_json::Value,
    pub status: JobStatus,
    /// Percentage in `0..=100`.
    #[serde(default)]
    pub progress: u8,
    /// Set when a worker claims the job.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub err: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<JobRef>,
    /// Identity of the claiming worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
}

impl JobRecord {
    /// A fresh pending record, as built by the store on creation.
    pub fn pending(job_type: impl Into<String>, id: JobId, data: serde_json::Value) -> Self {
        Self {
            id,
            job_type: job_type.into(),
            data,
            status: JobStatus::Pending,
            progress: 0,
            start_time: None,
            err: None,
            children: Vec::new(),
            worker_id: None,
        }
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef::new(self.job_type.clone(), self.id)
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, field: &JobField) {
        match field {
            JobField::Progress(progress) => self.progress = *progress,
            JobField::Status(status) => self.status = *status,
            JobField::Err(err) => self.err = Some(err.clone()),
            JobField::Children(children) => self.children = children.clone(),
        }
    }
}

/// A single-field update applied to a job record while it is active.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "field", content = "value", rename_all = "snake_case")]
pub enum JobField {
    Progress(u8),
    Status(JobStatus),
    Err(String),
    Children(Vec<JobRef>),
}

impl JobField {
    /// Name of the record field this update writes.
    pub fn name(&self) -> &'static str {
        match self {
            JobField::Progress(_) => "progress",
            JobField::Status(_) => "status",
            JobField::Err(_) => "err",
            JobField::Children(_) => "children",
        }
    }

    /// The new field value as JSON.
    pub fn value(&self) -> serde_json::Value {
        match self {
            JobField::Progress(progress) => serde_json::json!(progress),
            JobField::Status(status) => serde_json::json!(status),
            JobField::Err(err) => serde_json::json!(err),
            JobField::Children(children) => serde_json::json!(children),
        }
    }
}

/// Percentage for `step` out of `total`, floored and clamped to 100.
///
/// Returns `None` when `total` is zero.
pub fn progress_percent(step: u64, total: u64) -> Option<u8> {
    if total == 0 {
        return None;
    }
    let percent = (u128::from(step) * 100 / u128::from(total)).min(100);
    Some(percent as u8)
}

/// Whether a job result counts as "nothing to store".
pub fn is_empty_result(result: &serde_json::Value) -> bool {
    match result {
        serde_json::Value::Null => true,
        serde_json::Value::Array(items) => items.is_empty(),
        serde_json::Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Merge child results one level deep: arrays are spliced in, scalars and
/// objects are kept as single items, absent results contribute nothing.
pub fn flatten_results<I>(results: I) -> Vec<serde_json::Value>
where
    I: IntoIterator<Item = Option<serde_json::Value>>,
{
    let mut flat = Vec::new();
    for result in results.into_iter().flatten() {
        match result {
            serde_json::Value::Array(items) => flat.extend(items),
            serde_json::Value::Null => {}
            other => flat.push(other),
        }
    }
    flat
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn terminal_statuses() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Crashed.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Active.is_terminal());
        assert!(!JobStatus::Created.is_terminal());
    }

    #[test]
    fn record_uses_wire_field_names() {
        let record = JobRecord::pending("email", JobId(7), json!({"to": "a@b.c"}));
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["type"], "email");
        assert_eq!(value["id"], 7);
        assert_eq!(value["status"], "pending");
        assert!(value.get("children").is_none());
    }

    #[test]
    fn progress_is_floored_and_clamped() {
        assert_eq!(progress_percent(55, 100), Some(55));
        assert_eq!(progress_percent(1, 3), Some(33));
        assert_eq!(progress_percent(2, 3), Some(66));
        assert_eq!(progress_percent(5, 4), Some(100));
        assert_eq!(progress_percent(1, 0), None);
    }

    #[test]
    fn flatten_merges_one_level() {
        let flat = flatten_results(vec![
            Some(json!([1])),
            None,
            Some(json!([2, [3]])),
            Some(json!("x")),
            Some(json!([])),
        ]);
        assert_eq!(flat, vec![json!(1), json!(2), json!([3]), json!("x")]);
    }

    #[test]
    fn apply_updates_single_field() {
        let mut record = JobRecord::pending("t", JobId(1), json!(null));
        record.apply(&JobField::Progress(40));
        record.apply(&JobField::Err("Error: boom".into()));
        assert_eq!(record.progress, 40);
        assert_eq!(record.err.as_deref(), Some("Error: boom"));
        assert_eq!(JobField::Status(JobStatus::Active).value(), json!("active"));
    }
}
