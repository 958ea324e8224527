//! Worker actor: slot scheduler and job runner.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures_util::FutureExt;
use queue_core::{Config, JobField, JobRef, JobStatus, WorkRequest, is_empty_result};
use ractor::{Actor, ActorProcessingErr, ActorRef};

use crate::client::BrokerClient;
use crate::handler::{Done, JobHandler};
use crate::job::{Job, JobContext};
use crate::messages::{ActorError, ActorResult, Outcome, WorkerMessage};

/// Per-type slots of a worker.
struct QueueSlot {
    /// Maximum jobs of this type running at once.
    concurrency: u32,
    /// Logic run for each claimed job.
    handler: Arc<dyn JobHandler>,
    /// Jobs holding a slot, in claim order.
    active_jobs: Vec<Job>,
}

impl QueueSlot {
    fn free(&self) -> u32 {
        self.concurrency
            .saturating_sub(self.active_jobs.len() as u32)
    }

    /// Drop `job` from the slot. Returns whether it was there.
    fn release(&mut self, job: &JobRef) -> bool {
        let before = self.active_jobs.len();
        self.active_jobs.retain(|active| active.id != Some(job.id));
        self.active_jobs.len() != before
    }
}

/// State for the worker actor.
pub struct WorkerActorState {
    /// Unique worker ID, recorded on every claimed job.
    worker_id: String,
    /// Broker handle used for claims and outcomes.
    broker: BrokerClient,
    /// Handed to every live job.
    context: JobContext,
    /// Slots by job type.
    queues: HashMap<String, QueueSlot>,
    /// Cleared by pause.
    active: bool,
    /// A `get_work` call is in flight.
    fetching_work: bool,
}

impl WorkerActorState {
    fn work_requests(&self) -> Vec<WorkRequest> {
        self.queues
            .iter()
            .filter(|(_, slot)| slot.free() > 0)
            .map(|(job_type, slot)| WorkRequest::new(job_type.clone(), slot.free()))
            .collect()
    }

    fn release(&mut self, job: &JobRef) -> bool {
        self.queues
            .get_mut(&job.job_type)
            .is_some_and(|slot| slot.release(job))
    }

    /// Empty every slot, returning the refs of the jobs that held one.
    fn drain(&mut self) -> Vec<JobRef> {
        self.queues
            .values_mut()
            .flat_map(|slot| slot.active_jobs.drain(..))
            .filter_map(|job| job.job_ref())
            .collect()
    }
}

/// Worker actor arguments.
pub struct WorkerArgs {
    /// Unique worker ID.
    pub worker_id: String,
    /// Client of the broker this worker pulls from.
    pub broker: BrokerClient,
    /// Tick, sweep and TTL settings.
    pub config: Config,
}

/// Worker actor that claims and runs jobs.
pub struct WorkerActor;

impl Actor for WorkerActor {
    type Msg = WorkerMessage;
    type State = WorkerActorState;
    type Arguments = WorkerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting worker: {}", args.worker_id);

        // Start the work loop
        let refresh_rate = args.config.refresh_rate();
        let myself_clone = myself.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(refresh_rate).await;
                if myself_clone.send_message(WorkerMessage::Tick).is_err() {
                    break;
                }
            }
        });

        if args.config.clean_up.active {
            let rate = args.config.clean_up_rate();
            let myself_clone = myself.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(rate).await;
                    if myself_clone.send_message(WorkerMessage::Sweep).is_err() {
                        break;
                    }
                }
            });
        }

        let context = JobContext {
            broker: args.broker.clone(),
            refresh_rate,
            ttl: args.config.job_ttl(),
        };

        Ok(WorkerActorState {
            worker_id: args.worker_id,
            broker: args.broker,
            context,
            queues: HashMap::new(),
            active: true,
            fetching_work: false,
        })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            WorkerMessage::Process {
                job_type,
                concurrency,
                handler,
            } => {
                tracing::info!(
                    "Worker {} processing {} (concurrency {})",
                    state.worker_id,
                    job_type,
                    concurrency
                );
                let slot = state.queues.entry(job_type).or_insert_with(|| QueueSlot {
                    concurrency,
                    handler: handler.clone(),
                    active_jobs: Vec::new(),
                });
                slot.concurrency = concurrency;
                slot.handler = handler;
            }

            WorkerMessage::Tick => {
                if !state.active || state.fetching_work {
                    return Ok(());
                }
                let requests = state.work_requests();
                if requests.is_empty() {
                    return Ok(());
                }

                state.fetching_work = true;
                let broker = state.broker.clone();
                let worker_id = state.worker_id.clone();
                let myself_clone = myself.clone();
                tokio::spawn(async move {
                    let message = match broker.get_work(&worker_id, requests).await {
                        Ok(records) => WorkerMessage::WorkArrived(records),
                        Err(e) => WorkerMessage::WorkFailed(e.to_string()),
                    };
                    let _ = myself_clone.send_message(message);
                });
            }

            WorkerMessage::WorkArrived(records) => {
                state.fetching_work = false;
                let timeout = state.broker.timeout() * 2;
                for record in records {
                    let job_ref = record.job_ref();
                    let Some(slot) = state.queues.get_mut(&record.job_type) else {
                        tracing::warn!("No handler for claimed job {}", job_ref);
                        continue;
                    };
                    tracing::debug!("Worker {} starting job {}", state.worker_id, job_ref);

                    let job = Job::from_record(record, state.context.clone());
                    slot.active_jobs.push(job.clone());
                    let done = Done::new(job_ref.clone(), myself.clone(), timeout);
                    tokio::spawn(run_job(
                        slot.handler.clone(),
                        job,
                        job_ref,
                        done,
                        myself.clone(),
                    ));
                }
            }

            WorkerMessage::WorkFailed(err) => {
                state.fetching_work = false;
                tracing::warn!("Worker {} failed to fetch work: {}", state.worker_id, err);
            }

            WorkerMessage::JobFinished {
                job,
                outcome,
                reply,
            } => {
                if !state.release(&job) {
                    tracing::debug!("Ignoring completion of untracked job {}", job);
                    if let Some(reply) = reply {
                        let _ = reply.send(Err(ActorError::AlreadyFinished(job)));
                    }
                    return Ok(());
                }

                let result = finish(&state.broker, &job, outcome).await;
                if let Err(e) = &result {
                    tracing::warn!("Failed to record outcome of job {}: {}", job, e);
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }

            WorkerMessage::Sweep => {
                let now = Utc::now();
                let mut expired = Vec::new();
                for slot in state.queues.values_mut() {
                    slot.active_jobs.retain(|job| {
                        if job.expired_at(now)
                            && let Some(job_ref) = job.job_ref()
                        {
                            expired.push(job_ref);
                            return false;
                        }
                        true
                    });
                }
                if expired.is_empty() {
                    return Ok(());
                }

                tracing::warn!(
                    "Worker {} giving up on {} expired jobs",
                    state.worker_id,
                    expired.len()
                );
                if let Err(e) = state.broker.job_cleanup(expired).await {
                    tracing::warn!("Job cleanup failed: {}", e);
                }
            }

            WorkerMessage::Pause => {
                tracing::info!("Pausing worker: {}", state.worker_id);
                state.active = false;
            }

            WorkerMessage::Resume => {
                tracing::info!("Resuming worker: {}", state.worker_id);
                state.active = true;
            }

            WorkerMessage::ActiveJobs { reply } => {
                let jobs = state
                    .queues
                    .values()
                    .flat_map(|slot| slot.active_jobs.iter().filter_map(Job::job_ref))
                    .collect();
                let _ = reply.send(jobs);
            }

            WorkerMessage::Stop => {
                tracing::info!("Shutting down worker: {}", state.worker_id);
                myself.stop(None);
            }
        }

        Ok(())
    }

    async fn post_stop(
        &self,
        _myself: ActorRef<Self::Msg>,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let abandoned = state.drain();
        if abandoned.is_empty() {
            return Ok(());
        }

        tracing::warn!(
            "Worker {} stopped with {} jobs in flight",
            state.worker_id,
            abandoned.len()
        );
        if let Err(e) = state.broker.job_cleanup(abandoned).await {
            tracing::warn!("Job cleanup failed: {}", e);
        }
        Ok(())
    }
}

/// Persist a job's outcome and move it to its terminal collection.
async fn finish(broker: &BrokerClient, job: &JobRef, outcome: Outcome) -> ActorResult<()> {
    match outcome {
        Outcome::Completed(result) => {
            // Result first: a completed job must already carry its result.
            if let Some(result) = result
                && !is_empty_result(&result)
            {
                broker.save_job_result(&job.job_type, job.id, result).await?;
            }
            broker
                .finish_job(&job.job_type, job.id, JobStatus::Completed)
                .await?;
        }
        Outcome::Failed(err) => {
            broker
                .update_job_field(&job.job_type, job.id, JobField::Err(err))
                .await?;
            broker
                .finish_job(&job.job_type, job.id, JobStatus::Failed)
                .await?;
        }
        Outcome::Crashed(err) => {
            broker
                .update_job_field(&job.job_type, job.id, JobField::Err(err))
                .await?;
            broker
                .finish_job(&job.job_type, job.id, JobStatus::Crashed)
                .await?;
        }
    }
    Ok(())
}

/// Run one job's logic, turning an error or a panic into a crash.
async fn run_job(
    handler: Arc<dyn JobHandler>,
    job: Job,
    job_ref: JobRef,
    done: Done,
    worker: ActorRef<WorkerMessage>,
) {
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(move || handler.handle(job, done)))
    {
        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
        Err(panic) => Err(panic),
    };

    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(panic) => panic_message(panic.as_ref()),
    };

    tracing::warn!("Job {} crashed: {}", job_ref, err);
    let _ = worker.send_message(WorkerMessage::JobFinished {
        job: job_ref,
        outcome: Outcome::Crashed(format!("Error: {err}")),
        reply: None,
    });
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "job panicked".to_string()
    }
}
