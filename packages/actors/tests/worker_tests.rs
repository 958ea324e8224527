#![allow(clippy::disallowed_methods)]

use std::error::Error;
use std::time::Duration;

use actors::{
    ActorError, BrokerClient, Done, FnHandler, HandlerFuture, Job, JobContext, JobHandler, Worker,
    start_broker,
};
use chrono::{TimeDelta, Utc};
use queue_core::{Config, JobId, JobRecord, JobRef, JobStatus, QueueOptions, WorkRequest};
use serde_json::{Value, json};
use store::{ABANDONED_ERR, JobStore};

fn test_config() -> Config {
    Config::default()
        .with_refresh_rate(Duration::from_millis(20))
        .without_clean_up()
}

/// Broker and worker sharing one config, store TTL included.
async fn start(config: &Config) -> Result<(BrokerClient, Worker), ActorError> {
    let store = JobStore::memory(config.job_ttl());
    let (broker, _handle) = start_broker(store, config).await?;
    let worker = Worker::start(broker.clone(), config).await?;
    Ok((broker, worker))
}

async fn wait_for(broker: &BrokerClient, job: &JobRef, status: JobStatus) -> JobRecord {
    for _ in 0..250 {
        if let Ok(record) = broker.get_job(&job.job_type, job.id).await
            && record.status == status
        {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("{job} never reached {status}");
}

#[tokio::test]
async fn test_completed_job_stores_result() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "add",
            2,
            FnHandler::new(|job: Job, done: Done| async move {
                let a = job.data["a"].as_i64().unwrap_or_default();
                let b = job.data["b"].as_i64().unwrap_or_default();
                done.complete(Some(json!(a + b)))
                    .await
                    .map_err(|e| e.to_string())
            }),
        )
        .await?;

    let mut job = worker.create_job("add", json!({ "a": 1, "b": 2 }));
    let job_ref = job.save().await?;
    assert_eq!(job.status, JobStatus::Pending);

    let record = wait_for(&broker, &job_ref, JobStatus::Completed).await;
    assert_eq!(record.progress, 100);
    assert_eq!(record.worker_id.as_deref(), Some(worker.id()));
    assert_eq!(
        broker.get_job_result("add", job_ref.id).await?,
        Some(json!(3))
    );

    let stats = worker.stats().await?;
    assert_eq!(stats.len(), 1);
    assert_eq!((stats[0].active, stats[0].completed), (0, 1));

    worker.stop().await?;
    Ok(())
}

#[tokio::test]
async fn test_empty_result_is_not_stored() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "noop",
            1,
            FnHandler::new(|_job: Job, done: Done| async move {
                done.complete(Some(json!([])))
                    .await
                    .map_err(|e| e.to_string())
            }),
        )
        .await?;

    let job_ref = worker.create_job("noop", json!(null)).save().await?;
    wait_for(&broker, &job_ref, JobStatus::Completed).await;
    assert_eq!(broker.get_job_result("noop", job_ref.id).await?, None);
    Ok(())
}

#[tokio::test]
async fn test_handler_error_crashes_job() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "explode",
            1,
            FnHandler::new(|_job: Job, _done: Done| async move { Err::<(), _>("boom".to_string()) }),
        )
        .await?;

    let job_ref = worker.create_job("explode", json!({})).save().await?;

    let record = wait_for(&broker, &job_ref, JobStatus::Crashed).await;
    assert_eq!(record.err.as_deref(), Some("Error: boom"));
    assert!(worker.active_jobs().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_panic_crashes_only_that_job() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "fragile",
            2,
            FnHandler::new(|job: Job, done: Done| async move {
                if job.data == json!("panic") {
                    panic!("boom");
                }
                done.complete(None).await.map_err(|e| e.to_string())
            }),
        )
        .await?;

    let bad = worker.create_job("fragile", json!("panic")).save().await?;
    let good = worker.create_job("fragile", json!("fine")).save().await?;

    let crashed = wait_for(&broker, &bad, JobStatus::Crashed).await;
    assert_eq!(crashed.err.as_deref(), Some("Error: boom"));
    wait_for(&broker, &good, JobStatus::Completed).await;

    // The scheduler keeps going after a crash.
    let later = worker.create_job("fragile", json!("again")).save().await?;
    wait_for(&broker, &later, JobStatus::Completed).await;
    Ok(())
}

#[tokio::test]
async fn test_failed_job_keeps_its_error() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "picky",
            1,
            FnHandler::new(|_job: Job, done: Done| async move {
                done.fail("bad input").await.map_err(|e| e.to_string())
            }),
        )
        .await?;

    let job_ref = worker.create_job("picky", json!(1)).save().await?;
    let record = wait_for(&broker, &job_ref, JobStatus::Failed).await;
    assert_eq!(record.err.as_deref(), Some("bad input"));
    Ok(())
}

#[tokio::test]
async fn test_error_after_completion_is_ignored() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "twice",
            1,
            FnHandler::new(|_job: Job, done: Done| async move {
                done.complete(None).await.map_err(|e| e.to_string())?;
                Err::<(), _>("too late".to_string())
            }),
        )
        .await?;

    let job_ref = worker.create_job("twice", json!(1)).save().await?;
    wait_for(&broker, &job_ref, JobStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let record = broker.get_job("twice", job_ref.id).await?;
    assert_eq!(record.status, JobStatus::Completed);
    assert_eq!(record.err, None);
    Ok(())
}

#[tokio::test]
async fn test_parent_joins_children() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "child",
            3,
            FnHandler::new(|job: Job, done: Done| async move {
                let n = job.data.as_u64().unwrap_or_default();
                let result = if n == 3 {
                    done.fail("three is not allowed").await
                } else {
                    done.complete(Some(json!([n]))).await
                };
                result.map_err(|e| e.to_string())
            }),
        )
        .await?;
    worker
        .process(
            "parent",
            1,
            FnHandler::new(|mut job: Job, done: Done| async move {
                for n in 1..=3 {
                    job.create_child("child", json!(n))
                        .await
                        .map_err(|e| e.to_string())?;
                }
                let results = job.wait_for_children().await.map_err(|e| e.to_string())?;
                done.complete(Some(Value::Array(results)))
                    .await
                    .map_err(|e| e.to_string())
            }),
        )
        .await?;

    let parent = worker.create_job("parent", json!({})).save().await?;
    let record = wait_for(&broker, &parent, JobStatus::Completed).await;
    assert_eq!(record.children.len(), 3);

    let result = broker
        .get_job_result("parent", parent.id)
        .await?
        .unwrap_or_default();
    let mut values: Vec<u64> = result
        .as_array()
        .map(|items| items.iter().filter_map(Value::as_u64).collect())
        .unwrap_or_default();
    values.sort_unstable();
    assert_eq!(values, vec![1, 2]);

    let failed = broker.get_job("child", JobId(3)).await?;
    assert_eq!(failed.status, JobStatus::Failed);
    Ok(())
}

#[tokio::test]
async fn test_children_join_in_finishing_order() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "step",
            2,
            FnHandler::new(|job: Job, done: Done| async move {
                let delay = job.data["delay"].as_u64().unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(delay)).await;
                done.complete(Some(json!([job.data["n"].clone()])))
                    .await
                    .map_err(|e| e.to_string())
            }),
        )
        .await?;
    worker
        .process(
            "fan",
            1,
            FnHandler::new(|mut job: Job, done: Done| async move {
                for (n, delay) in [(1, 300), (2, 0)] {
                    job.create_child("step", json!({ "n": n, "delay": delay }))
                        .await
                        .map_err(|e| e.to_string())?;
                }
                let results = job.wait_for_children().await.map_err(|e| e.to_string())?;
                done.complete(Some(Value::Array(results)))
                    .await
                    .map_err(|e| e.to_string())
            }),
        )
        .await?;

    let parent = worker.create_job("fan", json!({})).save().await?;
    wait_for(&broker, &parent, JobStatus::Completed).await;

    // The slow first child lands last.
    assert_eq!(
        broker.get_job_result("fan", parent.id).await?,
        Some(json!([2, 1]))
    );
    Ok(())
}

#[tokio::test]
async fn test_join_sees_result_stored_before_finish() -> Result<(), Box<dyn Error>> {
    let (broker, _handle) =
        start_broker(JobStore::memory(Duration::from_secs(60)), &test_config()).await?;
    let context = JobContext {
        broker: broker.clone(),
        refresh_rate: Duration::from_millis(10),
        ttl: Duration::from_secs(60),
    };
    broker.register_queue("p", QueueOptions::default()).await?;
    broker.register_queue("c", QueueOptions::default()).await?;
    broker.create_job("p", json!(null)).await?;
    let child = broker.create_job("c", json!(null)).await?;
    let claimed = broker
        .get_work("w", vec![WorkRequest::new("p", 1), WorkRequest::new("c", 1)])
        .await?;
    let parent = claimed
        .into_iter()
        .find(|record| record.job_type == "p")
        .ok_or("parent not claimed")?;

    let mut parent = Job::from_record(parent, context);
    parent.add_child(child.job_ref()).await?;
    let join = tokio::spawn(async move { parent.wait_for_children().await });

    // Same order as a completing worker: result first, then the move.
    broker.save_job_result("c", child.id, json!([42])).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!join.is_finished());
    broker.finish_job("c", child.id, JobStatus::Completed).await?;

    assert_eq!(join.await??, vec![json!(42)]);
    Ok(())
}

#[tokio::test]
async fn test_completed_child_always_has_its_result() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "answer",
            1,
            FnHandler::new(|_job: Job, done: Done| async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                done.complete(Some(json!([42])))
                    .await
                    .map_err(|e| e.to_string())
            }),
        )
        .await?;

    let job_ref = worker.create_job("answer", json!(null)).save().await?;
    for _ in 0..2000 {
        let record = broker.get_job("answer", job_ref.id).await?;
        if record.status == JobStatus::Completed {
            assert_eq!(
                broker.get_job_result("answer", job_ref.id).await?,
                Some(json!([42]))
            );
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("{job_ref} never completed");
}

/// Completes after 500 ms and reports whether the completion was rejected.
struct SlowHandler(tokio::sync::mpsc::Sender<bool>);

impl JobHandler for SlowHandler {
    fn handle(&self, _job: Job, done: Done) -> HandlerFuture {
        let tx = self.0.clone();
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            let rejected = matches!(
                done.complete(None).await,
                Err(ActorError::AlreadyFinished(_))
            );
            let _ = tx.send(rejected).await;
            Ok(())
        })
    }
}

#[tokio::test]
async fn test_expired_job_is_failed_and_late_completion_rejected() -> Result<(), Box<dyn Error>> {
    // Store, broker reaper and worker sweep all run on the same TTL.
    let config = Config::default()
        .with_refresh_rate(Duration::from_millis(20))
        .with_job_ttl(Duration::from_millis(150))
        .with_clean_up(Duration::from_millis(50));
    let (broker, worker) = start(&config).await?;

    let (tx, mut rx) = tokio::sync::mpsc::channel(1);
    worker.process("slow", 1, SlowHandler(tx)).await?;

    let job_ref = worker.create_job("slow", json!(1)).save().await?;
    let record = wait_for(&broker, &job_ref, JobStatus::Failed).await;
    assert_eq!(record.err.as_deref(), Some(ABANDONED_ERR));

    assert_eq!(rx.recv().await, Some(true));
    Ok(())
}

#[tokio::test]
async fn test_worker_sweep_fails_job_past_store_deadline() -> Result<(), Box<dyn Error>> {
    let config = Config::default()
        .with_refresh_rate(Duration::from_millis(20))
        .with_job_ttl(Duration::from_millis(150))
        .with_clean_up(Duration::from_millis(50));
    // Only the worker sweeps; the store record is already past its deadline
    // by the time the sweep sees the job as expired.
    let store = JobStore::memory(config.job_ttl());
    let (broker, _handle) = start_broker(store, &test_config()).await?;
    let worker = Worker::start(broker.clone(), &config).await?;

    let (tx, _rx) = tokio::sync::mpsc::channel(1);
    worker.process("slow", 1, SlowHandler(tx)).await?;

    let job_ref = worker.create_job("slow", json!(1)).save().await?;
    let record = wait_for(&broker, &job_ref, JobStatus::Failed).await;
    assert_eq!(record.err.as_deref(), Some(ABANDONED_ERR));

    let stats = broker.get_stats().await?;
    assert_eq!((stats[0].active, stats[0].failed), (0, 1));
    Ok(())
}

#[tokio::test]
async fn test_stopped_worker_fails_its_jobs() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "stuck",
            2,
            FnHandler::new(|_job: Job, _done: Done| async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<(), String>(())
            }),
        )
        .await?;

    let first = worker.create_job("stuck", json!(1)).save().await?;
    let second = worker.create_job("stuck", json!(2)).save().await?;
    wait_for(&broker, &second, JobStatus::Active).await;
    let worker_id = worker.id().to_string();

    worker.stop().await?;

    for job_ref in [first, second] {
        let record = broker.get_job(&job_ref.job_type, job_ref.id).await?;
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.err.as_deref(), Some(ABANDONED_ERR));
        assert_eq!(record.worker_id.as_deref(), Some(worker_id.as_str()));
    }
    Ok(())
}

#[tokio::test]
async fn test_pause_and_resume() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "later",
            1,
            FnHandler::new(|_job: Job, done: Done| async move {
                done.complete(None).await.map_err(|e| e.to_string())
            }),
        )
        .await?;

    worker.pause()?;
    // Let any fetch started before the pause return.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job_ref = worker.create_job("later", json!(1)).save().await?;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        broker.get_job("later", job_ref.id).await?.status,
        JobStatus::Pending
    );

    worker.resume()?;
    wait_for(&broker, &job_ref, JobStatus::Completed).await;
    Ok(())
}

#[tokio::test]
async fn test_concurrency_bounds_active_jobs() -> Result<(), Box<dyn Error>> {
    let (broker, worker) = start(&test_config()).await?;
    worker
        .process(
            "busy",
            2,
            FnHandler::new(|_job: Job, done: Done| async move {
                tokio::time::sleep(Duration::from_millis(300)).await;
                done.complete(None).await.map_err(|e| e.to_string())
            }),
        )
        .await?;

    for i in 0..4 {
        worker.create_job("busy", json!(i)).save().await?;
    }

    let mut active = Vec::new();
    for _ in 0..50 {
        active = worker.active_jobs().await?;
        if !active.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!active.is_empty() && active.len() <= 2);

    let stats = worker.stats().await?;
    assert!(stats[0].active <= 2);
    assert_eq!(stats[0].active + stats[0].pending + stats[0].completed, 4);

    wait_for(&broker, &JobRef::new("busy", 4), JobStatus::Completed).await;
    Ok(())
}

#[tokio::test]
async fn test_job_state_rules() -> Result<(), Box<dyn Error>> {
    let (_broker, worker) = start(&test_config()).await?;

    let zero = worker
        .process(
            "none",
            QueueOptions::with_concurrency(0),
            FnHandler::new(|_job: Job, _done: Done| async move { Ok::<(), String>(()) }),
        )
        .await;
    assert!(matches!(zero, Err(ActorError::InvalidState(_))));

    let missing = worker.create_job("unregistered", json!(1)).save().await;
    assert!(matches!(missing, Err(ActorError::Store(_))));

    worker
        .process(
            "idle",
            1,
            FnHandler::new(|_job: Job, _done: Done| async move { Ok::<(), String>(()) }),
        )
        .await?;
    worker.pause()?;

    let mut job = worker.create_job("idle", json!(1));
    assert!(matches!(
        job.report_progress(1, 2).await,
        Err(ActorError::InvalidState(_))
    ));
    job.save().await?;
    assert!(matches!(job.save().await, Err(ActorError::InvalidState(_))));

    // Only an active job may take children.
    let child = JobRef::new("idle", 99);
    assert!(matches!(
        job.add_child(child).await,
        Err(ActorError::InvalidState(_))
    ));
    Ok(())
}

#[tokio::test]
async fn test_expiry_boundary_is_inclusive() -> Result<(), Box<dyn Error>> {
    let (broker, _handle) = start_broker(JobStore::memory(Duration::from_secs(60)), &test_config()).await?;
    let context = JobContext {
        broker,
        refresh_rate: Duration::from_millis(20),
        ttl: Duration::from_secs(1),
    };

    let start = Utc::now();
    let mut record = JobRecord::pending("ttl", JobId(1), json!(null));
    record.status = JobStatus::Active;
    record.start_time = Some(start);
    let job = Job::from_record(record, context.clone());

    assert!(!job.expired_at(start + TimeDelta::milliseconds(999)));
    assert!(job.expired_at(start + TimeDelta::seconds(1)));
    assert!(job.expired_at(start + TimeDelta::seconds(5)));

    // Never claimed, never expires.
    let unsaved = Job::new("ttl", json!(null), context);
    assert!(!unsaved.expired());
    Ok(())
}
