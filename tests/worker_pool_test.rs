use async_trait::async_trait;
use dispatch_core::broker::memory::MemoryConnector;
use dispatch_core::metrics::{names, ExecutionUsage, MetricsConfig, ResourceMetricsCollector};
use dispatch_core::queue::service::ServiceSettings;
use dispatch_core::task::executor::TaskHandler;
use dispatch_core::task::{EmailTask, Job, TaskCategory};
use dispatch_core::{DispatchError, EnqueueOptions, JobStatus, QueueService};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

struct EmailHandler {
    delivered: AtomicUsize,
    delay: Duration,
}

#[async_trait]
impl TaskHandler for EmailHandler {
    async fn handle(&self, job: &Job) -> dispatch_core::Result<ExecutionUsage> {
        let email: EmailTask = job.payload()?;
        if email.subject == "bounce" {
            return Err(DispatchError::Execution("mailbox unavailable".to_string()));
        }
        sleep(self.delay).await;
        self.delivered.fetch_add(1, Ordering::SeqCst);
        Ok(ExecutionUsage {
            cost: Some(0.001),
            tokens: 0,
            api_calls: 1,
            ..ExecutionUsage::default()
        })
    }
}

fn settings(worker_count: usize) -> ServiceSettings {
    ServiceSettings {
        worker_count,
        poll_interval: Duration::from_millis(10),
        job_timeout_secs: 5,
        shutdown_timeout: Duration::from_secs(5),
    }
}

fn email(subject: &str) -> EmailTask {
    EmailTask::new(vec!["a@b.com".to_string()], subject, "body")
}

#[tokio::test]
async fn test_workers_drain_queue_and_record_usage() {
    let handler = Arc::new(EmailHandler {
        delivered: AtomicUsize::new(0),
        delay: Duration::from_millis(5),
    });
    let metrics = Arc::new(ResourceMetricsCollector::new(MetricsConfig::default(), None));
    let service = QueueService::builder()
        .connector(Arc::new(MemoryConnector::new()))
        .settings(settings(2))
        .handler(TaskCategory::Email, handler.clone())
        .metrics(metrics.clone())
        .build();
    service.init("memory://workers").await.unwrap();

    let channel = service.email().unwrap();
    let mut ids = Vec::new();
    for i in 0..5 {
        let handle = channel
            .add(email(&format!("hello {}", i)), EnqueueOptions::default())
            .await
            .unwrap();
        ids.push(handle.id);
    }
    let bounced = channel
        .add(email("bounce"), EnqueueOptions::default())
        .await
        .unwrap();

    sleep(Duration::from_millis(300)).await;

    assert_eq!(handler.delivered.load(Ordering::SeqCst), 5);
    for id in &ids {
        assert_eq!(
            channel.get_status(id).await.unwrap(),
            Some(JobStatus::Completed)
        );
    }
    let failed = channel.get_job(&bounced.id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert!(failed.error.unwrap().contains("mailbox unavailable"));

    let counts = channel.counts().await.unwrap();
    assert_eq!(counts.completed, 5);
    assert_eq!(counts.failed, 1);

    assert_eq!(metrics.get_metrics(names::EXECUTION_DURATION).len(), 6);
    assert!((metrics.error_rate() - 1.0 / 6.0).abs() < 1e-9);

    service.shutdown().await;
}

#[tokio::test]
async fn test_categories_without_handler_are_not_consumed() {
    let handler = Arc::new(EmailHandler {
        delivered: AtomicUsize::new(0),
        delay: Duration::ZERO,
    });
    let service = QueueService::builder()
        .connector(Arc::new(MemoryConnector::new()))
        .settings(settings(1))
        .handler(TaskCategory::Email, handler)
        .build();
    service.init("memory://workers").await.unwrap();

    let run = service
        .run()
        .unwrap()
        .add(
            dispatch_core::task::RunTask::new("run-1", "user-1"),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    sleep(Duration::from_millis(100)).await;
    assert_eq!(
        service.run().unwrap().get_status(&run.id).await.unwrap(),
        Some(JobStatus::Waiting)
    );
    service.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_lets_claimed_job_finish() {
    let handler = Arc::new(EmailHandler {
        delivered: AtomicUsize::new(0),
        delay: Duration::from_millis(200),
    });
    let service = QueueService::builder()
        .connector(Arc::new(MemoryConnector::new()))
        .settings(settings(1))
        .handler(TaskCategory::Email, handler.clone())
        .build();
    service.init("memory://workers").await.unwrap();

    service
        .email()
        .unwrap()
        .add(email("slow"), EnqueueOptions::default())
        .await
        .unwrap();

    // let the worker claim the job
    sleep(Duration::from_millis(50)).await;
    service.shutdown().await;

    assert_eq!(handler.delivered.load(Ordering::SeqCst), 1);
}
