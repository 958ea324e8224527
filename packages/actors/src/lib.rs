//! Actor system for the job queue.
//!
//! This crate provides the Ractor-based broker and workers on top of a
//! [`store::JobStore`].
//!
//! # Architecture
//!
//! - `Broker` - Owns the store and serves every store operation as a message
//! - `WorkerActor` - Claims jobs for its registered types and runs them
//! - `Worker` - Handle for registering handlers and creating jobs
//!
//! # Usage
//!
//! ```ignore
//! use actors::{Done, FnHandler, Job, Worker, start_broker};
//! use queue_core::Config;
//! use store::JobStore;
//!
//! let config = Config::default();
//! let (broker, _handle) = start_broker(JobStore::memory(config.job_ttl()), &config).await?;
//! let worker = Worker::start(broker, &config).await?;
//!
//! worker
//!     .process("email", 2, FnHandler::new(|_job: Job, done: Done| async move {
//!         done.complete(None).await.map_err(|e| e.to_string())
//!     }))
//!     .await?;
//!
//! let mut job = worker.create_job("email", serde_json::json!({ "to": "a@b.c" }));
//! job.save().await?;
//! ```

mod broker;
mod client;
mod handler;
mod job;
mod messages;
mod worker;
mod worker_actor;

pub use broker::{Broker, BrokerArgs, start_broker};
pub use client::BrokerClient;
pub use handler::{Done, FnHandler, HandlerFuture, HandlerResult, JobHandler};
pub use job::{Job, JobContext};
pub use messages::{ActorError, ActorResult, BrokerMessage, Outcome, WorkerMessage};
pub use worker::Worker;
pub use worker_actor::WorkerActor;

/// Re-export ractor types for convenience.
pub use ractor::{Actor, ActorRef, RpcReplyPort};
