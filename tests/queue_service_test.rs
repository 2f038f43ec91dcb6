use dispatch_core::broker::memory::MemoryConnector;
use dispatch_core::broker::Broker;
use dispatch_core::queue::service::ServiceState;
use dispatch_core::task::{EmailTask, RunTask, SwarmExecutionType, SwarmTask};
use dispatch_core::{DispatchError, EnqueueOptions, QueueService, TaskEnvelope};
use std::sync::Arc;
use tokio::time::Duration;

const URL: &str = "memory://local";

fn email() -> EmailTask {
    EmailTask::new(vec!["a@b.com".to_string()], "S", "T")
}

#[tokio::test]
async fn test_concurrent_init_opens_one_connection() {
    let connector = Arc::new(MemoryConnector::new().with_connect_delay(Duration::from_millis(50)));
    let service = Arc::new(QueueService::builder().connector(connector.clone()).build());

    let mut handles = Vec::new();
    for _ in 0..10 {
        let service = Arc::clone(&service);
        handles.push(tokio::spawn(async move { service.init(URL).await }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(connector.connection_count(), 1);
    assert_eq!(service.state(), ServiceState::Ready);

    // already ready: no new connection
    service.init(URL).await.unwrap();
    assert_eq!(connector.connection_count(), 1);
}

#[tokio::test]
async fn test_shutdown_is_idempotent() {
    let (service, connector) = QueueService::in_memory();

    // never initialized
    service.shutdown().await;
    assert_eq!(service.state(), ServiceState::Uninitialized);

    service.init(URL).await.unwrap();
    service.shutdown().await;
    service.shutdown().await;

    assert_eq!(service.state(), ServiceState::ShutDown);
    assert!(!connector.last_connection().unwrap().is_open());
    assert!(matches!(service.email(), Err(DispatchError::NotInitialized)));
}

#[tokio::test]
async fn test_reset_round_trip() {
    let (service, connector) = QueueService::in_memory();
    service.init(URL).await.unwrap();

    let handle = service
        .email()
        .unwrap()
        .add(email(), EnqueueOptions::default())
        .await
        .unwrap();

    service.reset().await.unwrap();
    assert!(service.is_ready());
    assert_eq!(connector.connection_count(), 2);

    // the store outlives the connection
    let statuses = service.get_task_statuses("user-1", &[handle.id.as_str()]).await.unwrap();
    assert_eq!(statuses[0].status.as_deref(), Some("waiting"));

    // the fresh connection accepts new work
    let after = service
        .email()
        .unwrap()
        .add(email(), EnqueueOptions::default())
        .await;
    assert!(after.is_ok());
    let after = after.unwrap();
    assert_ne!(after.id, handle.id);
    assert!(connector.last_connection().unwrap().is_open());

    let statuses = service.get_task_statuses("user-1", &[after.id.as_str()]).await.unwrap();
    assert_eq!(statuses[0].id, after.id);
    assert_eq!(statuses[0].status.as_deref(), Some("waiting"));
}

#[tokio::test]
async fn test_shutdown_then_init_reconnects() {
    let (service, connector) = QueueService::in_memory();
    service.init(URL).await.unwrap();
    service.shutdown().await;
    service.init(URL).await.unwrap();

    assert!(service.is_ready());
    assert_eq!(connector.connection_count(), 2);
}

#[tokio::test]
async fn test_refused_connection_reaches_every_caller() {
    let connector = Arc::new(MemoryConnector::new().with_connect_delay(Duration::from_millis(30)));
    connector.set_refuse_connections(true);
    let service = Arc::new(QueueService::builder().connector(connector.clone()).build());

    let first = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.init(URL).await })
    };
    let second = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.init(URL).await })
    };

    assert!(first.await.unwrap().unwrap_err().is_connection());
    assert!(second.await.unwrap().unwrap_err().is_connection());
    assert_eq!(service.state(), ServiceState::Uninitialized);

    // a later attempt can succeed
    connector.set_refuse_connections(false);
    service.init(URL).await.unwrap();
    assert!(service.is_ready());
}

#[tokio::test]
async fn test_lost_connection_fails_submission_only() {
    let (service, connector) = QueueService::in_memory();
    service.init(URL).await.unwrap();
    connector.last_connection().unwrap().disconnect();

    let err = service
        .email()
        .unwrap()
        .add(email(), EnqueueOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::Submission(_)));
    assert_eq!(service.state(), ServiceState::Ready);

    service.shutdown().await;
    assert_eq!(service.state(), ServiceState::ShutDown);
}

#[tokio::test]
async fn test_shutdown_waits_for_pending_init() {
    let connector = Arc::new(MemoryConnector::new().with_connect_delay(Duration::from_millis(50)));
    let service = Arc::new(QueueService::builder().connector(connector.clone()).build());

    let init = {
        let service = Arc::clone(&service);
        tokio::spawn(async move { service.init(URL).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(service.state(), ServiceState::Initializing);

    service.shutdown().await;
    init.await.unwrap().unwrap();

    assert_eq!(service.state(), ServiceState::ShutDown);
    assert_eq!(connector.connection_count(), 1);
    assert!(!connector.last_connection().unwrap().is_open());
}

#[tokio::test]
async fn test_email_end_to_end() {
    let (service, _) = QueueService::in_memory();
    service.init(URL).await.unwrap();

    let task = email();
    let handle = service
        .email()
        .unwrap()
        .add(task.clone(), EnqueueOptions::default())
        .await
        .unwrap();

    assert_eq!(handle.data, task);
    assert!(!handle.id.is_empty());

    let statuses = service
        .get_task_statuses("user-1", &[handle.id.clone()])
        .await
        .unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].id, handle.id);
    assert!(statuses[0].status.is_some());
}

#[tokio::test]
async fn test_unknown_ids_have_no_status() {
    let (service, _) = QueueService::in_memory();
    service.init(URL).await.unwrap();

    let statuses = service
        .get_task_statuses("user-1", &["nonexistent", "also-missing"])
        .await
        .unwrap();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.iter().all(|entry| entry.status.is_none()));
}

#[tokio::test]
async fn test_enqueue_routes_by_category() {
    let (service, _) = QueueService::in_memory();
    service.init(URL).await.unwrap();

    let run = service
        .enqueue(
            TaskEnvelope::from(RunTask::new("run-1", "user-1")),
            EnqueueOptions::default().with_priority(1),
        )
        .await
        .unwrap();
    assert_eq!(run.queue, "run");

    let mut swarm = SwarmTask::new("conv-1", "user-1", "gpt");
    swarm.execution_type = SwarmExecutionType::Step;
    let handle = service
        .enqueue(TaskEnvelope::from(swarm.clone()), EnqueueOptions::default())
        .await
        .unwrap();
    assert_eq!(handle.queue, "swarm");
    assert_eq!(handle.data, TaskEnvelope::Swarm(swarm));

    assert_eq!(service.run().unwrap().counts().await.unwrap().waiting, 1);
    assert_eq!(service.swarm().unwrap().counts().await.unwrap().waiting, 1);
    assert_eq!(service.email().unwrap().counts().await.unwrap().waiting, 0);
}

#[tokio::test]
async fn test_status_lookup_requires_connection() {
    let (service, _) = QueueService::in_memory();
    let err = service
        .get_task_statuses("user-1", &["some-id"])
        .await
        .unwrap_err();
    assert!(matches!(err, DispatchError::NotInitialized));
}
