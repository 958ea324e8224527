//! Job handler trait and the completion handle passed to it.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use queue_core::JobRef;
use ractor::ActorRef;
use ractor::rpc::CallResult;
use serde_json::Value;

use crate::job::Job;
use crate::messages::{ActorError, ActorResult, Outcome, WorkerMessage};

/// Result type for job handlers. An `Err` marks the job as crashed.
pub type HandlerResult = Result<(), String>;

/// Future type for async job handlers.
pub type HandlerFuture = Pin<Box<dyn Future<Output = HandlerResult> + Send>>;

/// Trait for job handlers.
///
/// Implement this trait to define how jobs of one type are processed. The
/// handler reports the outcome through `done`; returning `Err` or panicking
/// instead marks the job as crashed.
pub trait JobHandler: Send + Sync + 'static {
    fn handle(&self, job: Job, done: Done) -> HandlerFuture;
}

/// A closure-based job handler.
///
/// ```ignore
/// worker
///     .process("email", 2, FnHandler::new(|job: Job, done: Done| async move {
///         send(&job.data).await.map_err(|e| e.to_string())?;
///         done.complete(None).await.map_err(|e| e.to_string())
///     }))
///     .await?;
/// ```
pub struct FnHandler<F> {
    handler: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(Job, Done) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    pub fn new(handler: F) -> Self {
        Self { handler }
    }
}

impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job, Done) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, job: Job, done: Done) -> HandlerFuture {
        Box::pin((self.handler)(job, done))
    }
}

/// One-shot completion handle for a running job.
///
/// Consumed on use. The worker confirms the completion only while the job
/// still holds a slot, so a job that already crashed or expired gets
/// [`ActorError::AlreadyFinished`].
pub struct Done {
    job: JobRef,
    worker: ActorRef<WorkerMessage>,
    timeout: Duration,
}

impl Done {
    pub(crate) fn new(job: JobRef, worker: ActorRef<WorkerMessage>, timeout: Duration) -> Self {
        Self {
            job,
            worker,
            timeout,
        }
    }

    /// The job this handle finishes.
    pub fn job(&self) -> &JobRef {
        &self.job
    }

    /// Mark the job completed. A non-empty `result` is stored for parents
    /// and callers to read.
    pub async fn complete(self, result: Option<Value>) -> ActorResult<()> {
        self.finish(Outcome::Completed(result)).await
    }

    /// Mark the job failed with `err`.
    pub async fn fail(self, err: impl Into<String>) -> ActorResult<()> {
        self.finish(Outcome::Failed(err.into())).await
    }

    async fn finish(self, outcome: Outcome) -> ActorResult<()> {
        let job = self.job.clone();
        let result = ractor::rpc::call(
            &self.worker,
            |reply| WorkerMessage::JobFinished {
                job,
                outcome,
                reply: Some(reply),
            },
            Some(self.timeout),
        )
        .await;

        match result {
            Ok(CallResult::Success(result)) => result,
            Ok(CallResult::Timeout) => Err(ActorError::Timeout),
            // A stopped worker no longer tracks the job.
            Ok(CallResult::SenderError) | Err(_) => Err(ActorError::AlreadyFinished(self.job)),
        }
    }
}
