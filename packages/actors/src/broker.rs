//! Broker actor: the single owner of the job store.
//!
//! Every store operation arrives as a [`BrokerMessage`] and is answered on
//! its reply port, so workers never touch the store directly. When clean-up
//! is enabled the broker also runs the reconciliation sweep on a timer.

use queue_core::Config;
use ractor::{Actor, ActorProcessingErr, ActorRef};
use store::JobStore;

use crate::client::BrokerClient;
use crate::messages::{ActorError, BrokerMessage};

/// State for the broker actor.
pub struct BrokerState {
    /// Owned store; every operation is serialized through this actor.
    store: JobStore,
}

/// Broker actor arguments.
pub struct BrokerArgs {
    /// Store the broker takes ownership of.
    pub store: JobStore,
    /// Reaper settings.
    pub config: Config,
}

/// Broker actor that serves store operations.
pub struct Broker;

impl Actor for Broker {
    type Msg = BrokerMessage;
    type State = BrokerState;
    type Arguments = BrokerArgs;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!("Starting broker ({} store)", args.store.backend().as_str());

        if args.config.clean_up.active {
            let rate = args.config.clean_up_rate();
            let myself_clone = myself.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(rate).await;
                    if myself_clone
                        .send_message(BrokerMessage::Reap { reply: None })
                        .is_err()
                    {
                        break;
                    }
                }
            });
        }

        Ok(BrokerState { store: args.store })
    }

    async fn handle(
        &self,
        myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        let store = &mut state.store;
        match message {
            BrokerMessage::RegisterQueue {
                job_type,
                options,
                reply,
            } => {
                let result = store.register_queue(&job_type, options).await;
                if result.is_ok() {
                    tracing::debug!("Registered queue: {}", job_type);
                }
                let _ = reply.send(result);
            }

            BrokerMessage::CreateJob {
                job_type,
                data,
                reply,
            } => {
                let _ = reply.send(store.create_job(&job_type, data).await);
            }

            BrokerMessage::GetJob {
                job_type,
                id,
                reply,
            } => {
                let _ = reply.send(store.get_job(&job_type, id).await);
            }

            BrokerMessage::GetWork {
                worker_id,
                requests,
                reply,
            } => {
                let result = store.get_work(&worker_id, &requests).await;
                if let Ok(claimed) = &result
                    && !claimed.is_empty()
                {
                    tracing::debug!("Worker {} claimed {} jobs", worker_id, claimed.len());
                }
                let _ = reply.send(result);
            }

            BrokerMessage::FinishJob {
                job_type,
                id,
                status,
                reply,
            } => {
                let _ = reply.send(store.finish_job(&job_type, id, status).await);
            }

            BrokerMessage::UpdateJobField {
                job_type,
                id,
                field,
                reply,
            } => {
                let _ = reply.send(store.update_job_field(&job_type, id, &field).await);
            }

            BrokerMessage::SaveJobResult {
                job_type,
                id,
                result,
                reply,
            } => {
                let _ = reply.send(store.save_job_result(&job_type, id, result).await);
            }

            BrokerMessage::GetJobResult {
                job_type,
                id,
                reply,
            } => {
                let _ = reply.send(store.get_job_result(&job_type, id).await);
            }

            BrokerMessage::GetStats { reply } => {
                let _ = reply.send(store.get_stats().await);
            }

            BrokerMessage::CheckChildren { children, reply } => {
                let _ = reply.send(store.check_children(&children).await);
            }

            BrokerMessage::GetChildrenResults { children, reply } => {
                let _ = reply.send(store.get_children_results(&children).await);
            }

            BrokerMessage::JobCleanup { jobs, reply } => {
                let result = store.job_cleanup(&jobs).await;
                if let Ok(cleaned) = &result
                    && *cleaned > 0
                {
                    tracing::warn!("Failed {} abandoned jobs", cleaned);
                }
                let _ = reply.send(result);
            }

            BrokerMessage::RemoveJob {
                job_type,
                id,
                reply,
            } => {
                let _ = reply.send(store.remove_job(&job_type, id).await);
            }

            BrokerMessage::Clear { reply } => {
                let _ = reply.send(store.clear().await);
            }

            BrokerMessage::Reap { reply } => {
                let result = store.reap().await;
                match &result {
                    Ok(report) if !report.is_empty() => tracing::info!(
                        "Reaped {} jobs, {} results, {} stale ids; failed {} stalled jobs",
                        report.expired_jobs,
                        report.expired_results,
                        report.stale_ids,
                        report.abandoned_jobs
                    ),
                    Ok(_) => tracing::debug!("Reap found nothing to remove"),
                    Err(e) => tracing::warn!("Reap failed: {}", e),
                }
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }

            BrokerMessage::Shutdown => {
                tracing::info!("Shutting down broker");
                myself.stop(None);
            }
        }

        Ok(())
    }
}

/// Spawn a broker over `store` and return a client for it.
pub async fn start_broker(
    store: JobStore,
    config: &Config,
) -> Result<(BrokerClient, tokio::task::JoinHandle<()>), ActorError> {
    let args = BrokerArgs {
        store,
        config: config.clone(),
    };
    let (actor, handle) = Actor::spawn(None, Broker, args)
        .await
        .map_err(|e| ActorError::Spawn(e.to_string()))?;

    Ok((BrokerClient::new(actor, config.call_timeout()), handle))
}
