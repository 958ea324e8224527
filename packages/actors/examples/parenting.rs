//! A parent job fans out thirteen children and collects their results.
//!
//! ```sh
//! cargo run -p actors --example parenting
//! ```

use std::error::Error;

use actors::{Done, FnHandler, Job, Worker, start_broker};
use queue_core::{Config, JobStatus};
use serde_json::{Value, json};
use store::{JobStore, StoreConfig};

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
            "testJobParent",
            1,
            FnHandler::new(|mut job: Job, done: Done| async move {
                for i in 0..13 {
                    job.create_child("testJob", json!({ "test": i }))
                        .await
                        .map_err(|e| e.to_string())?;
                }
                let results = job.wait_for_children().await.map_err(|e| e.to_string())?;
                tracing::info!("parent done with results from children: {:?}", results);
                done.complete(Some(Value::Array(results)))
                    .await
                    .map_err(|e| e.to_string())
            }),
        )
        .await?;

    worker
        .process(
            "testJob",
            5,
            FnHandler::new(|mut job: Job, done: Done| async move {
                tracing::info!("executed child job {:?} with data {}", job.id, job.data);
                job.report_progress(1, 1).await.map_err(|e| e.to_string())?;
                let data = job.data.clone();
                done.complete(Some(data)).await.map_err(|e| e.to_string())
            }),
        )
        .await?;

    let mut parent = worker.create_job("testJobParent", json!({}));
    let parent_ref = parent.save().await?;
    tracing::info!("saved new parent job {}", parent_ref);

    loop {
        tokio::time::sleep(config.refresh_rate()).await;
        let record = broker.get_job(&parent_ref.job_type, parent_ref.id).await?;
        if record.status.is_terminal() {
            tracing::info!("parent finished as {}", record.status);
            if record.status == JobStatus::Completed {
                let result = broker
                    .get_job_result(&parent_ref.job_type, parent_ref.id)
                    .await?;
                tracing::info!("stored parent result: {:?}", result);
            }
            break;
        }
    }

    worker.stop().await?;
    broker.shutdown()?;
    Ok(())
}
