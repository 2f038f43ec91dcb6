//! Dispatch Core binary entry point

use async_trait::async_trait;
use dispatch_core::config::Config;
use dispatch_core::events::{topics, EventBus};
use dispatch_core::metrics::{ExecutionUsage, MetricsConfig, ResourceMetricsCollector};
use dispatch_core::strategy::learning::{LearningConfig, PerformanceLearningAgent};
use dispatch_core::strategy::emitter::StrategyUsage;
use dispatch_core::strategy::{ExecutionContext, StrategyEventEmitter, StrategyMetricsStore};
use dispatch_core::task::executor::TaskHandler;
use dispatch_core::task::{Job, TaskCategory};
use dispatch_core::QueueService;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Acknowledges jobs without side effects; real deployments register their
/// own handlers through the service builder
struct LoggingHandler {
    emitter: Arc<StrategyEventEmitter>,
}

#[async_trait]
impl TaskHandler for LoggingHandler {
    async fn handle(&self, job: &Job) -> dispatch_core::Result<ExecutionUsage> {
        let execution = self.emitter.begin(
            format!("{}/log-only", job.queue),
            ExecutionContext {
                run_id: Some(job.id.clone()),
                ..ExecutionContext::default()
            },
        );
        info!(
            "Received job {} on {} (attempt {})",
            job.id, job.queue, job.attempts
        );
        execution
            .succeed(StrategyUsage {
                confidence: 1.0,
                ..StrategyUsage::default()
            })
            .await;
        Ok(ExecutionUsage::default())
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Dispatch Core");

    let config = Config::load()?;
    config.validate()?;

    info!(
        "Initialized with {} workers per queue, broker {}",
        config.worker_count, config.broker_url
    );

    let bus = Arc::new(EventBus::new());
    bus.start();

    let collector = Arc::new(ResourceMetricsCollector::new(
        MetricsConfig::from(&config),
        Some(Arc::clone(&bus)),
    ));
    collector.start();

    let store = Arc::new(StrategyMetricsStore::new());
    let emitter = Arc::new(StrategyEventEmitter::new(
        Arc::clone(&bus),
        Arc::clone(&store),
        config.strategy_thresholds,
    ));
    let agent = Arc::new(PerformanceLearningAgent::new(
        Arc::clone(&bus),
        LearningConfig::default(),
    ));
    agent.attach().await?;

    bus.subscribe_fn("alert-log", topics::PATTERN_RESOURCE_ALERT, |event| async move {
        warn!("Resource alert on {}", event.topic);
        Ok(())
    })
    .await?;

    let handler: Arc<dyn TaskHandler> = Arc::new(LoggingHandler { emitter });
    let mut builder = QueueService::builder()
        .config(&config)
        .metrics(Arc::clone(&collector));
    for category in TaskCategory::ALL {
        builder = builder.handler(category, Arc::clone(&handler));
    }
    let service = builder.build();

    service.init(&config.broker_url).await?;
    info!("Queue service {}", service.state());

    tokio::signal::ctrl_c().await?;
    info!("Interrupt received, shutting down");

    service.shutdown().await;
    collector.shutdown().await;
    bus.close().await;

    let metrics = bus.metrics();
    info!(
        "Event bus handled {} events ({} dropped, {} handler errors)",
        metrics.total_events, metrics.dropped_events, metrics.handler_errors
    );

    Ok(())
}
