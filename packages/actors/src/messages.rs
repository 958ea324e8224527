//! Message types for actor communication.

use std::sync::Arc;

use queue_core::{
    JobField, JobId, JobRecord, JobRef, JobStatus, QueueOptions, QueueStats, WorkRequest,
};
use ractor::RpcReplyPort;
use serde_json::Value;
use store::{ReapReport, StoreError};

use crate::handler::JobHandler;

/// Reply port carrying a store result.
pub type StoreReply<T> = RpcReplyPort<Result<T, StoreError>>;

/// Messages for the Broker. One variant per store operation.
#[derive(Debug)]
pub enum BrokerMessage {
    /// Register a job type. A no-op if it already exists.
    RegisterQueue {
        job_type: String,
        options: QueueOptions,
        reply: StoreReply<()>,
    },

    /// Create a pending job with the next id.
    CreateJob {
        job_type: String,
        data: Value,
        reply: StoreReply<JobRecord>,
    },

    /// Fetch a live job record.
    GetJob {
        job_type: String,
        id: JobId,
        reply: StoreReply<JobRecord>,
    },

    /// Claim pending jobs for a worker.
    GetWork {
        worker_id: String,
        requests: Vec<WorkRequest>,
        reply: StoreReply<Vec<JobRecord>>,
    },

    /// Move a job to a terminal collection.
    FinishJob {
        job_type: String,
        id: JobId,
        status: JobStatus,
        reply: StoreReply<Option<JobRecord>>,
    },

    /// Overwrite one mutable field of a job.
    UpdateJobField {
        job_type: String,
        id: JobId,
        field: JobField,
        reply: StoreReply<()>,
    },

    /// Store a job's result with its own deadline.
    SaveJobResult {
        job_type: String,
        id: JobId,
        result: Value,
        reply: StoreReply<()>,
    },

    /// Fetch a stored result, if it has not expired.
    GetJobResult {
        job_type: String,
        id: JobId,
        reply: StoreReply<Option<Value>>,
    },

    /// Collection sizes of every queue.
    GetStats { reply: StoreReply<Vec<QueueStats>> },

    /// The subset of children that are done.
    CheckChildren {
        children: Vec<JobRef>,
        reply: StoreReply<Vec<JobRef>>,
    },

    /// Results of the given children, in order.
    GetChildrenResults {
        children: Vec<JobRef>,
        reply: StoreReply<Vec<Option<Value>>>,
    },

    /// Force-finish jobs abandoned by a worker.
    JobCleanup {
        jobs: Vec<JobRef>,
        reply: StoreReply<usize>,
    },

    /// Delete a job, its result and its id.
    RemoveJob {
        job_type: String,
        id: JobId,
        reply: StoreReply<bool>,
    },

    /// Drop every queue.
    Clear { reply: StoreReply<()> },

    /// Reconciliation sweep. Sent without a reply by the reaper tick.
    Reap {
        reply: Option<StoreReply<ReapReport>>,
    },

    /// Shutdown the broker.
    Shutdown,
}

/// How a job's logic ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Finished with an optional result.
    Completed(Option<Value>),
    /// Reported failure, with its error text.
    Failed(String),
    /// The logic returned an error or panicked.
    Crashed(String),
}

/// Messages for the WorkerActor.
pub enum WorkerMessage {
    /// Register the handler for a job type.
    Process {
        job_type: String,
        concurrency: u32,
        handler: Arc<dyn JobHandler>,
    },

    /// Scheduler tick: ask the broker for work if slots are free.
    Tick,

    /// Result of the in-flight `get_work` call.
    WorkArrived(Vec<JobRecord>),

    /// The in-flight `get_work` call failed.
    WorkFailed(String),

    /// A job's logic is done. `reply` is `None` for crashes.
    JobFinished {
        job: JobRef,
        outcome: Outcome,
        reply: Option<RpcReplyPort<Result<(), ActorError>>>,
    },

    /// Reaper tick: give up on expired jobs.
    Sweep,

    /// Stop fetching work. Running jobs finish.
    Pause,

    /// Start fetching work again.
    Resume,

    /// Jobs currently occupying a slot.
    ActiveJobs { reply: RpcReplyPort<Vec<JobRef>> },

    /// Shutdown the worker.
    Stop,
}

/// Result type for actor operations.
pub type ActorResult<T> = Result<T, ActorError>;

/// Error type for actor operations.
#[derive(Debug, thiserror::Error)]
pub enum ActorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Actor error: {0}")]
    Rpc(String),

    #[error("Timeout")]
    Timeout,

    #[error("Job already finished: {0}")]
    AlreadyFinished(JobRef),

    #[error("Invalid job state: {0}")]
    InvalidState(String),

    #[error("Failed to spawn actor: {0}")]
    Spawn(String),
}
