use async_trait::async_trait;
use dispatch_core::broker::memory::{MemoryBroker, MemoryConnector};
use dispatch_core::broker::Broker;
use dispatch_core::config::Config;
use dispatch_core::metrics::ExecutionUsage;
use dispatch_core::queue::service::ServiceSettings;
use dispatch_core::task::executor::TaskHandler;
use dispatch_core::task::{Job, RunTask, TaskCategory};
use dispatch_core::{DispatchError, EnqueueOptions, JobStatus, QueueService};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Fails every run whose id ends in an odd digit
struct AlternatingHandler;

#[async_trait]
impl TaskHandler for AlternatingHandler {
    async fn handle(&self, job: &Job) -> dispatch_core::Result<ExecutionUsage> {
        let run: RunTask = job.payload()?;
        let odd = run
            .run_id
            .chars()
            .last()
            .and_then(|c| c.to_digit(10))
            .map_or(false, |d| d % 2 == 1);
        if odd {
            return Err(DispatchError::Execution("odd run".to_string()));
        }
        Ok(ExecutionUsage::default())
    }
}

fn settings() -> ServiceSettings {
    ServiceSettings {
        worker_count: 2,
        poll_interval: Duration::from_millis(5),
        job_timeout_secs: 5,
        shutdown_timeout: Duration::from_secs(5),
    }
}

#[tokio::test]
async fn test_processing_loop_keeps_bounded_history() {
    let connector = Arc::new(MemoryConnector::new().with_keep_finished(10));
    let service = QueueService::builder()
        .connector(connector)
        .settings(settings())
        .handler(TaskCategory::Run, Arc::new(AlternatingHandler))
        .build();
    service.init("memory://retention").await.unwrap();

    let channel = service.run().unwrap();
    let mut ids = Vec::new();
    for i in 0..60 {
        let handle = channel
            .add(
                RunTask::new(format!("run-{}", i), "user-1"),
                EnqueueOptions::default(),
            )
            .await
            .unwrap();
        ids.push(handle.id);
    }

    for _ in 0..100 {
        if channel.counts().await.unwrap().pending() == 0 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }

    let counts = channel.counts().await.unwrap();
    assert_eq!(counts.pending(), 0);
    assert!(counts.completed + counts.failed <= 10);

    // the earliest runs are gone, the latest is still visible
    assert_eq!(channel.get_status(&ids[0]).await.unwrap(), None);
    assert!(channel.get_status(&ids[59]).await.unwrap().is_some());

    service.shutdown().await;
}

#[tokio::test]
async fn test_unfinished_jobs_are_never_evicted() {
    let broker = MemoryBroker::with_keep_finished(1);
    for i in 0..5 {
        broker
            .submit(Job::new(
                "run",
                serde_json::json!({ "i": i }),
                EnqueueOptions::default(),
            ))
            .await
            .unwrap();
    }

    for _ in 0..3 {
        let mut job = broker.claim("run").await.unwrap().unwrap();
        job.mark_completed();
        broker.finish(&job).await.unwrap();
    }

    let counts = broker.counts("run").await.unwrap();
    assert_eq!(counts.completed, 1);
    assert_eq!(counts.waiting, 2);
}

#[tokio::test]
async fn test_removed_finished_job_frees_its_slot() {
    let broker = MemoryBroker::with_keep_finished(2);
    let mut finished = Vec::new();
    for i in 0..3 {
        broker
            .submit(Job::new(
                "run",
                serde_json::json!({ "i": i }),
                EnqueueOptions::default(),
            ))
            .await
            .unwrap();
        let mut job = broker.claim("run").await.unwrap().unwrap();
        job.mark_completed();
        broker.finish(&job).await.unwrap();
        finished.push(job.id);

        if i == 0 {
            assert!(broker.remove("run", &finished[0]).await.unwrap());
        }
    }

    // the removed job no longer counts against the bound
    assert!(broker.get("run", &finished[1]).await.unwrap().is_some());
    assert_eq!(
        broker.get("run", &finished[2]).await.unwrap().unwrap().status,
        JobStatus::Completed
    );
}

#[test]
fn test_retention_is_configurable() {
    assert_eq!(Config::default().keep_finished, 1000);
    let config = Config {
        keep_finished: 25,
        ..Config::new("memory://local")
    };
    assert!(config.validate().is_ok());
}
