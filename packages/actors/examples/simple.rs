//! Thirteen independent jobs on one worker, five at a time.
//!
//! ```sh
//! cargo run -p actors --example simple
//! STORE_BACKEND=surreal STORE_ENDPOINT=mem:// cargo run -p actors --example simple
//! ```

use std::error::Error;
use std::time::Duration;

use actors::{Done, FnHandler, Job, Worker, start_broker};
use queue_core::Config;
use serde_json::json;
use store::{JobStore, StoreConfig};

const JOBS: u64 = 13;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let config = Config::from_env()?;
    let store = JobStore::open(&StoreConfig::from_env()?, config.job_ttl()).await?;
    let (broker, _broker_handle) = start_broker(store, &config).await?;
    let worker = Worker::start(broker.clone(), &config).await?;

    worker
        .process(
            "testJob",
            5,
            FnHandler::new(|mut job: Job, done: Done| async move {
                tracing::info!(
                    "executed job {:?} with data {}",
                    job.id,
                    job.data
                );
                job.report_progress(1, 1).await.map_err(|e| e.to_string())?;
                let result = job.data["test"].clone();
                done.complete(Some(result)).await.map_err(|e| e.to_string())
            }),
        )
        .await?;

    for i in 0..JOBS {
        let mut job = worker.create_job("testJob", json!({ "test": i }));
        let job_ref = job.save().await?;
        tracing::info!("saved new job {} with data {}", job_ref, job.data);
    }

    loop {
        tokio::time::sleep(config.refresh_rate()).await;
        let stats = worker.stats().await?;
        if let Some(stats) = stats.iter().find(|s| s.job_type == "testJob") {
            tracing::info!(
                "pending {} active {} completed {}",
                stats.pending,
                stats.active,
                stats.completed
            );
            if stats.finished() >= JOBS {
                break;
            }
        }
    }

    worker.stop().await?;
    broker.shutdown()?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
