//! Typed handle for talking to the broker.

use std::time::Duration;

use queue_core::{
    JobField, JobId, JobRecord, JobRef, JobStatus, QueueOptions, QueueStats, WorkRequest,
};
use ractor::ActorRef;
use ractor::rpc::CallResult;
use serde_json::Value;
use store::ReapReport;

use crate::messages::{ActorError, ActorResult, BrokerMessage, StoreReply};

/// Cloneable RPC client for a running broker. Every call waits at most
/// `timeout` for the reply.
#[derive(Clone)]
pub struct BrokerClient {
    broker: ActorRef<BrokerMessage>,
    timeout: Duration,
}

impl BrokerClient {
    pub fn new(broker: ActorRef<BrokerMessage>, timeout: Duration) -> Self {
        Self { broker, timeout }
    }

    pub fn actor(&self) -> &ActorRef<BrokerMessage> {
        &self.broker
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn call<T, F>(&self, build: F) -> ActorResult<T>
    where
        T: Send + 'static,
        F: FnOnce(StoreReply<T>) -> BrokerMessage,
    {
        match ractor::rpc::call(&self.broker, build, Some(self.timeout)).await {
            Ok(CallResult::Success(result)) => Ok(result?),
            Ok(CallResult::Timeout) => Err(ActorError::Timeout),
            Ok(CallResult::SenderError) => Err(ActorError::Rpc("broker dropped the reply".into())),
            Err(e) => Err(ActorError::Rpc(e.to_string())),
        }
    }

    pub async fn register_queue(&self, job_type: &str, options: QueueOptions) -> ActorResult<()> {
        let job_type = job_type.to_string();
        self.call(|reply| BrokerMessage::RegisterQueue {
            job_type,
            options,
            reply,
        })
        .await
    }

    pub async fn create_job(&self, job_type: &str, data: Value) -> ActorResult<JobRecord> {
        let job_type = job_type.to_string();
        self.call(|reply| BrokerMessage::CreateJob {
            job_type,
            data,
            reply,
        })
        .await
    }

    pub async fn get_job(&self, job_type: &str, id: JobId) -> ActorResult<JobRecord> {
        let job_type = job_type.to_string();
        self.call(|reply| BrokerMessage::GetJob {
            job_type,
            id,
            reply,
        })
        .await
    }

    pub async fn get_work(
        &self,
        worker_id: &str,
        requests: Vec<WorkRequest>,
    ) -> ActorResult<Vec<JobRecord>> {
        let worker_id = worker_id.to_string();
        self.call(|reply| BrokerMessage::GetWork {
            worker_id,
            requests,
            reply,
        })
        .await
    }

    pub async fn finish_job(
        &self,
        job_type: &str,
        id: JobId,
        status: JobStatus,
    ) -> ActorResult<Option<JobRecord>> {
        let job_type = job_type.to_string();
        self.call(|reply| BrokerMessage::FinishJob {
            job_type,
            id,
            status,
            reply,
        })
        .await
    }

    pub async fn update_job_field(
        &self,
        job_type: &str,
        id: JobId,
        field: JobField,
    ) -> ActorResult<()> {
        let job_type = job_type.to_string();
        self.call(|reply| BrokerMessage::UpdateJobField {
            job_type,
            id,
            field,
            reply,
        })
        .await
    }

    pub async fn save_job_result(&self, job_type: &str, id: JobId, result: Value) -> ActorResult<()> {
        let job_type = job_type.to_string();
        self.call(|reply| BrokerMessage::SaveJobResult {
            job_type,
            id,
            result,
            reply,
        })
        .await
    }

    pub async fn get_job_result(&self, job_type: &str, id: JobId) -> ActorResult<Option<Value>> {
        let job_type = job_type.to_string();
        self.call(|reply| BrokerMessage::GetJobResult {
            job_type,
            id,
            reply,
        })
        .await
    }

    pub async fn get_stats(&self) -> ActorResult<Vec<QueueStats>> {
        self.call(|reply| BrokerMessage::GetStats { reply }).await
    }

    pub async fn check_children(&self, children: Vec<JobRef>) -> ActorResult<Vec<JobRef>> {
        self.call(|reply| BrokerMessage::CheckChildren { children, reply })
            .await
    }

    pub async fn get_children_results(
        &self,
        children: Vec<JobRef>,
    ) -> ActorResult<Vec<Option<Value>>> {
        self.call(|reply| BrokerMessage::GetChildrenResults { children, reply })
            .await
    }

    pub async fn job_cleanup(&self, jobs: Vec<JobRef>) -> ActorResult<usize> {
        self.call(|reply| BrokerMessage::JobCleanup { jobs, reply })
            .await
    }

    pub async fn remove_job(&self, job_type: &str, id: JobId) -> ActorResult<bool> {
        let job_type = job_type.to_string();
        self.call(|reply| BrokerMessage::RemoveJob {
            job_type,
            id,
            reply,
        })
        .await
    }

    pub async fn clear(&self) -> ActorResult<()> {
        self.call(|reply| BrokerMessage::Clear { reply }).await
    }

    /// Run a reconciliation sweep now.
    pub async fn reap(&self) -> ActorResult<ReapReport> {
        self.call(|reply| BrokerMessage::Reap { reply: Some(reply) })
            .await
    }

    /// Ask the broker to stop. Does not wait for it.
    pub fn shutdown(&self) -> ActorResult<()> {
        self.broker
            .send_message(BrokerMessage::Shutdown)
            .map_err(|e| ActorError::Rpc(e.to_string()))
    }
}
