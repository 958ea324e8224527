//! Public handle over a running worker actor.

use std::sync::Arc;

use queue_core::{Config, JobRef, QueueOptions, QueueStats};
use ractor::rpc::CallResult;
use ractor::{Actor, ActorRef};
use serde_json::Value;
use tokio::task::JoinHandle;
use ulid::Ulid;

use crate::client::BrokerClient;
use crate::handler::JobHandler;
use crate::job::{Job, JobContext};
use crate::messages::{ActorError, ActorResult, WorkerMessage};
use crate::worker_actor::{WorkerActor, WorkerArgs};

/// A worker process: claims jobs from the broker for every registered type
/// and runs them under their handler.
pub struct Worker {
    id: String,
    actor: ActorRef<WorkerMessage>,
    broker: BrokerClient,
    context: JobContext,
    handle: JoinHandle<()>,
}

impl Worker {
    /// Spawn a worker that talks to `broker`.
    pub async fn start(broker: BrokerClient, config: &Config) -> ActorResult<Self> {
        let id = format!("worker-{}", Ulid::new().to_string().to_lowercase());
        let args = WorkerArgs {
            worker_id: id.clone(),
            broker: broker.clone(),
            config: config.clone(),
        };
        let (actor, handle) = Actor::spawn(None, WorkerActor, args)
            .await
            .map_err(|e| ActorError::Spawn(e.to_string()))?;

        let context = JobContext {
            broker: broker.clone(),
            refresh_rate: config.refresh_rate(),
            ttl: config.job_ttl(),
        };

        Ok(Self {
            id,
            actor,
            broker,
            context,
            handle,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn broker(&self) -> &BrokerClient {
        &self.broker
    }

    /// Register `job_type` with the broker and run its jobs with `handler`,
    /// at most `options.concurrency` at a time on this worker.
    pub async fn process<H: JobHandler>(
        &self,
        job_type: &str,
        options: impl Into<QueueOptions>,
        handler: H,
    ) -> ActorResult<()> {
        let options = options.into();
        if options.concurrency == 0 {
            return Err(ActorError::InvalidState(format!(
                "{job_type} needs a concurrency of at least 1"
            )));
        }
        let concurrency = options.concurrency;
        self.broker.register_queue(job_type, options).await?;
        self.send(WorkerMessage::Process {
            job_type: job_type.to_string(),
            concurrency,
            handler: Arc::new(handler),
        })
    }

    /// An unsaved job of `job_type`; call [`Job::save`] to enqueue it.
    pub fn create_job(&self, job_type: &str, data: Value) -> Job {
        Job::new(job_type, data, self.context.clone())
    }

    /// Stop claiming work. Jobs already running finish normally.
    pub fn pause(&self) -> ActorResult<()> {
        self.send(WorkerMessage::Pause)
    }

    pub fn resume(&self) -> ActorResult<()> {
        self.send(WorkerMessage::Resume)
    }

    /// Jobs currently holding one of this worker's slots.
    pub async fn active_jobs(&self) -> ActorResult<Vec<JobRef>> {
        let result = ractor::rpc::call(
            &self.actor,
            |reply| WorkerMessage::ActiveJobs { reply },
            Some(self.broker.timeout()),
        )
        .await;
        match result {
            Ok(CallResult::Success(jobs)) => Ok(jobs),
            Ok(CallResult::Timeout) => Err(ActorError::Timeout),
            Ok(CallResult::SenderError) => Err(ActorError::Rpc("worker dropped the reply".into())),
            Err(e) => Err(ActorError::Rpc(e.to_string())),
        }
    }

    /// Counts for every queue known to the broker.
    pub async fn stats(&self) -> ActorResult<Vec<QueueStats>> {
        self.broker.get_stats().await
    }

    /// Stop the worker and wait for its actor to exit. Jobs still holding a
    /// slot are failed as abandoned.
    pub async fn stop(self) -> ActorResult<()> {
        self.send(WorkerMessage::Stop)?;
        self.handle
            .await
            .map_err(|e| ActorError::Rpc(e.to_string()))
    }

    fn send(&self, message: WorkerMessage) -> ActorResult<()> {
        self.actor
            .send_message(message)
            .map_err(|e| ActorError::Rpc(e.to_string()))
    }
}
